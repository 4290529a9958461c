use embedded_hal::i2c::{I2c, Operation};

use crate::{
    reg::Register,
    timeout::{PollOutcome, TimeoutGuard},
    timing,
    tuning::{self, TuningStep},
    ClockSource, Error, VcselPeriodType, Vl53l0x, MIN_TIMING_BUDGET_US, RANGE_TIMEOUT,
};

// SYSRANGE_START modes
const SYSRANGE_MODE_START_STOP: u8 = 0x01;
const SYSRANGE_MODE_BACKTOBACK: u8 = 0x02;
const SYSRANGE_MODE_TIMED: u8 = 0x04;

// SYSTEM_SEQUENCE_CONFIG values
const SEQUENCE_ALL_STEPS: u8 = 0xFF;
const SEQUENCE_DEFAULT: u8 = 0xE8; // everything but MSRC and TCC
const SEQUENCE_VHV_CALIBRATION: u8 = 0x01;
const SEQUENCE_PHASE_CALIBRATION: u8 = 0x02;

const MODEL_ID: u8 = 0xEE;

#[allow(clippy::struct_excessive_bools)]
#[derive(Default, Clone, Copy)]
struct SequenceStepEnables {
    tcc: bool,
    msrc: bool,
    dss: bool,
    pre_range: bool,
    final_range: bool,
}

impl SequenceStepEnables {
    fn from_sequence_config(sequence_config: u8) -> Self {
        Self {
            tcc: ((sequence_config >> 4) & 0x1) != 0,
            dss: ((sequence_config >> 3) & 0x1) != 0,
            msrc: ((sequence_config >> 2) & 0x1) != 0,
            pre_range: ((sequence_config >> 6) & 0x1) != 0,
            final_range: ((sequence_config >> 7) & 0x1) != 0,
        }
    }
}

#[derive(Default, Clone, Copy)]
struct SequenceStepTimeouts {
    pre_range_vcsel_period_pclks: u8,
    final_range_vcsel_period_pclks: u8,
    msrc_dss_tcc_mclks: u16,
    pre_range_mclks: u16,
    final_range_mclks: u16,
    msrc_dss_tcc_us: u32,
    pre_range_us: u32,
    final_range_us: u32,
}

/// Fixed per-step costs, in microseconds, added on top of the step timeouts.
struct StepOverheads {
    start: u32,
    end: u32,
    msrc: u32,
    tcc: u32,
    dss: u32,
    pre_range: u32,
    final_range: u32,
}

// The API reads the budget back with a larger start overhead than it uses
// when distributing one. Both values are kept as the firmware expects them.
const GET_BUDGET_OVERHEADS: StepOverheads = StepOverheads {
    start: 1910,
    end: 960,
    msrc: 660,
    tcc: 590,
    dss: 690,
    pre_range: 660,
    final_range: 550,
};

const SET_BUDGET_OVERHEADS: StepOverheads = StepOverheads {
    start: 1320,
    ..GET_BUDGET_OVERHEADS
};

impl StepOverheads {
    /// Time used by every enabled step except the final range timeout itself.
    fn used_budget_us(&self, enables: SequenceStepEnables, timeouts: &SequenceStepTimeouts) -> u32 {
        // "Start and end overhead times always present"
        let mut budget_us = self.start + self.end;

        if enables.tcc {
            budget_us += timeouts.msrc_dss_tcc_us + self.tcc;
        }

        if enables.dss {
            budget_us += 2 * (timeouts.msrc_dss_tcc_us + self.dss);
        } else if enables.msrc {
            budget_us += timeouts.msrc_dss_tcc_us + self.msrc;
        }

        if enables.pre_range {
            budget_us += timeouts.pre_range_us + self.pre_range;
        }

        if enables.final_range {
            budget_us += self.final_range;
        }

        budget_us
    }
}

impl<I2C, C, E> Vl53l0x<I2C, C>
where
    I2C: I2c<Error = E>,
    C: ClockSource,
{
    // Based on VL53L0X_DataInit(), VL53L0X_StaticInit() and
    // VL53L0X_PerformRefCalibration(). Reference SPAD calibration is not
    // performed; the factory values stored in NVM are used as they are.
    pub(crate) fn init(&mut self, io_2v8: bool) -> Result<(), Error<E>> {
        // check model ID register (value specified in datasheet)
        let model_id = self.read(Register::IdentificationModelId)?;
        if model_id != MODEL_ID {
            error!("unexpected model id {}", model_id);
            return Err(Error::InvalidModelId(model_id));
        }

        // VL53L0X_DataInit() begin

        // sensor uses 1V8 mode for I/O by default; switch to 2V8 mode if necessary
        if io_2v8 {
            self.update(Register::VhvConfigPadSclSdaExtsupHv, |data| *data |= 0x01)?;
        }

        // "Set I2C standard mode"
        self.write(0x88_u8, 0x00)?;

        self.replay(tuning::BANK1_OPEN)?;
        self.stop_variable = self.read(tuning::STOP_VARIABLE)?;
        self.replay(tuning::BANK1_CLOSE)?;
        debug!("stop variable {}", self.stop_variable);

        // disable SIGNAL_RATE_MSRC (bit 1) and SIGNAL_RATE_PRE_RANGE (bit 4) limit
        // checks
        self.update(Register::MsrcConfigControl, |data| *data |= 0x12)?;

        // set final range signal rate limit to 0.25 MCPS (million counts per second)
        self.set_signal_rate_limit(0.25)?;

        self.write(Register::SystemSequenceConfig, SEQUENCE_ALL_STEPS)?;

        // VL53L0X_DataInit() end

        // VL53L0X_StaticInit() begin

        self.set_reference_spads()?;

        debug!("loading default tuning settings");
        self.replay(tuning::DEFAULT_TUNING_SETTINGS)?;

        // "Set interrupt config to new sample ready"
        // -- VL53L0X_SetGpioConfig() begin

        self.write(Register::SystemInterruptConfigGpio, 0x04)?;
        self.update(Register::GpioHvMuxActiveHigh, |data| *data &= !0x10)?; // active low
        self.write(Register::SystemInterruptClear, 0x01)?;

        // -- VL53L0X_SetGpioConfig() end

        self.measurement_timing_budget_us = self.get_measurement_timing_budget()?;

        // "Disable MSRC and TCC by default"
        self.write(Register::SystemSequenceConfig, SEQUENCE_DEFAULT)?;

        // "Recalculate timing budget"
        self.set_measurement_timing_budget(self.measurement_timing_budget_us)?;
        debug!("timing budget {} us", self.measurement_timing_budget_us);

        // VL53L0X_StaticInit() end

        // VL53L0X_PerformRefCalibration() begin

        debug!("running VHV calibration");
        self.write(Register::SystemSequenceConfig, SEQUENCE_VHV_CALIBRATION)?;
        self.perform_single_ref_calibration(0x40)?;

        debug!("running phase calibration");
        self.write(Register::SystemSequenceConfig, SEQUENCE_PHASE_CALIBRATION)?;
        self.perform_single_ref_calibration(0x00)?;

        // "restore the previous Sequence Config"
        self.write(Register::SystemSequenceConfig, SEQUENCE_DEFAULT)?;

        // VL53L0X_PerformRefCalibration() end

        Ok(())
    }

    /// Change the bus address of the sensor. Only the low 7 bits are used.
    /// The new address is lost when the sensor is power cycled.
    ///
    /// # Errors
    /// Forwards any errors from the I2C bus.
    pub fn set_address(&mut self, new_address: u8) -> Result<(), Error<E>> {
        let new_address = new_address & 0x7F;
        self.write(Register::I2cSlaveDeviceAddress, new_address)?;
        self.address = new_address;
        debug!("address changed to {}", new_address);
        Ok(())
    }

    /// Start continuous ranging measurements. If `period_ms` is 0,
    /// back-to-back mode is used (the sensor measures as often as possible);
    /// otherwise timed mode is used, with `period_ms` between the start of
    /// consecutive measurements.
    ///
    /// Read the results with [`Self::read_range_continuous_millimeters`] or
    /// [`Self::try_read_range_continuous_millimeters`].
    ///
    /// # Errors
    /// Forwards any errors from the I2C bus.
    // based on VL53L0X_StartMeasurement()
    pub fn start_continuous(&mut self, period_ms: u32) -> Result<(), Error<E>> {
        self.restore_stop_variable()?;

        if period_ms != 0 {
            // continuous timed mode

            // VL53L0X_SetInterMeasurementPeriodMilliSeconds() begin

            let osc_calibrate_val = self.read_u16(Register::OscCalibrateVal)?;

            let period = if osc_calibrate_val != 0 {
                period_ms.saturating_mul(u32::from(osc_calibrate_val))
            } else {
                period_ms
            };

            self.write_u32(Register::SystemIntermeasurementPeriod, period)?;

            // VL53L0X_SetInterMeasurementPeriodMilliSeconds() end

            self.write(Register::SysrangeStart, SYSRANGE_MODE_TIMED)?;
        } else {
            // continuous back-to-back mode
            self.write(Register::SysrangeStart, SYSRANGE_MODE_BACKTOBACK)?;
        }

        Ok(())
    }

    /// Stop continuous measurements.
    ///
    /// # Errors
    /// Forwards any errors from the I2C bus.
    // based on VL53L0X_StopMeasurement()
    pub fn stop_continuous(&mut self) -> Result<(), Error<E>> {
        self.write(Register::SysrangeStart, SYSRANGE_MODE_START_STOP)?;
        self.replay(tuning::STOP_VARIABLE_CLEAR)?;
        Ok(())
    }

    /// Perform a single-shot range measurement and return the reading in
    /// millimeters.
    ///
    /// Returns [`RANGE_TIMEOUT`] and sets the flag read by
    /// [`Self::timeout_occurred`] if the sensor does not finish within the
    /// I/O timeout.
    ///
    /// # Errors
    /// Forwards any errors from the I2C bus.
    // based on VL53L0X_PerformSingleRangingMeasurement()
    #[allow(clippy::verbose_bit_mask)]
    pub fn read_range_single_millimeters(&mut self) -> Result<u16, Error<E>> {
        self.restore_stop_variable()?;

        self.write(Register::SysrangeStart, SYSRANGE_MODE_START_STOP)?;

        // "Wait until start bit has been cleared"
        let started =
            self.poll_until(|this| Ok((this.read(Register::SysrangeStart)? & 0x01) == 0))?;
        if started == PollOutcome::TimedOut {
            return Ok(self.range_timed_out());
        }

        self.read_range_continuous_millimeters()
    }

    /// Wait for the next range reading in millimeters while continuous mode
    /// is active.
    ///
    /// Returns [`RANGE_TIMEOUT`] and sets the flag read by
    /// [`Self::timeout_occurred`] if no reading arrives within the I/O
    /// timeout.
    ///
    /// # Errors
    /// Forwards any errors from the I2C bus.
    pub fn read_range_continuous_millimeters(&mut self) -> Result<u16, Error<E>> {
        if self.poll_until(Self::interrupt_pending)? == PollOutcome::TimedOut {
            return Ok(self.range_timed_out());
        }

        self.take_range()
    }

    /// Poll the device for a new range value. Returns `None` if the device is
    /// still measuring.
    ///
    /// # Errors
    /// Forwards any errors from the I2C bus.
    pub fn try_read_range_continuous_millimeters(&mut self) -> Result<Option<u16>, Error<E>> {
        if !self.interrupt_pending()? {
            return Ok(None);
        }

        self.take_range().map(Some)
    }

    /// Set the return signal rate limit check value in units of MCPS (mega
    /// counts per second), which is the minimum amplitude of the reflected
    /// signal for a reading to be reported as valid.
    ///
    /// A lower limit increases the potential range of the sensor but also
    /// the likelihood of reporting reflections from unintended objects.
    /// Initialisation sets 0.25 MCPS.
    ///
    /// # Errors
    /// Fails with [`Error::InvalidSignalRateLimit`] outside `0.0..=511.99`
    /// and forwards any errors from the I2C bus.
    pub fn set_signal_rate_limit(&mut self, limit_mcps: f32) -> Result<(), Error<E>> {
        if !(0.0..=511.99).contains(&limit_mcps) {
            warn!("rejected signal rate limit {}", limit_mcps);
            return Err(Error::InvalidSignalRateLimit(limit_mcps));
        }

        // Q9.7 fixed point format (9 integer bits, 7 fractional bits)
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let limit = (limit_mcps * f32::from(1_u16 << 7)) as u16;

        self.write_u16(Register::FinalRangeConfigMinCountRateRtnLimit, limit)?;
        Ok(())
    }

    /// Get the return signal rate limit check value in MCPS.
    ///
    /// # Errors
    /// Forwards any errors from the I2C bus.
    pub fn get_signal_rate_limit(&mut self) -> Result<f32, Error<E>> {
        let limit = self.read_u16(Register::FinalRangeConfigMinCountRateRtnLimit)?;
        Ok(f32::from(limit) / f32::from(1_u16 << 7))
    }

    /// Set the measurement timing budget in microseconds, the time allowed
    /// for one measurement. The budget is split among the enabled steps of
    /// the ranging sequence, with whatever remains going to the final range
    /// step. A longer budget gives more accurate readings.
    ///
    /// # Errors
    /// Fails with [`Error::TimingBudgetTooShort`] below
    /// [`MIN_TIMING_BUDGET_US`], with [`Error::TimingBudgetExceeded`] when
    /// the other steps leave no time for the final range, and forwards any
    /// errors from the I2C bus.
    // based on VL53L0X_set_measurement_timing_budget_micro_seconds()
    pub fn set_measurement_timing_budget(&mut self, budget_us: u32) -> Result<(), Error<E>> {
        if budget_us < MIN_TIMING_BUDGET_US {
            warn!("rejected timing budget {} us", budget_us);
            return Err(Error::TimingBudgetTooShort(budget_us));
        }

        let enables = self.get_sequence_step_enables()?;
        let timeouts = self.get_sequence_step_timeouts(enables)?;

        let used_budget_us = SET_BUDGET_OVERHEADS.used_budget_us(enables, &timeouts);

        if enables.final_range {
            // the final range gets whatever the other steps leave over
            if used_budget_us > budget_us {
                warn!("timing budget {} us leaves no final range time", budget_us);
                return Err(Error::TimingBudgetExceeded(budget_us));
            }

            let final_range_timeout_us = budget_us - used_budget_us;

            // set_sequence_step_timeout() begin
            // (SequenceStepId == VL53L0X_SEQUENCESTEP_FINAL_RANGE)

            // the register holds pre-range + final range, in MCLKs since the
            // two steps run at different VCSEL periods
            let mut final_range_timeout_mclks = timing::us_to_mclks(
                final_range_timeout_us,
                timeouts.final_range_vcsel_period_pclks,
            );

            if enables.pre_range {
                final_range_timeout_mclks += u32::from(timeouts.pre_range_mclks);
            }

            self.write_u16(
                Register::FinalRangeConfigTimeoutMacropHi,
                encode_timeout_mclks(final_range_timeout_mclks),
            )?;

            // set_sequence_step_timeout() end

            self.measurement_timing_budget_us = budget_us; // store for internal reuse
        }

        Ok(())
    }

    /// Get the measurement timing budget in microseconds, as currently
    /// programmed into the sensor.
    ///
    /// # Errors
    /// Forwards any errors from the I2C bus.
    // based on VL53L0X_get_measurement_timing_budget_micro_seconds()
    pub fn get_measurement_timing_budget(&mut self) -> Result<u32, Error<E>> {
        let enables = self.get_sequence_step_enables()?;
        let timeouts = self.get_sequence_step_timeouts(enables)?;

        let mut budget_us = GET_BUDGET_OVERHEADS.used_budget_us(enables, &timeouts);

        if enables.final_range {
            budget_us += timeouts.final_range_us;
        }

        self.measurement_timing_budget_us = budget_us; // store for internal reuse
        Ok(budget_us)
    }

    /// Set the VCSEL (vertical cavity surface emitting laser) pulse period
    /// for the given period type, in PCLKs. Longer periods seem to increase
    /// the potential range of the sensor. Initialisation leaves 14 for the
    /// pre-range and 10 for the final range.
    ///
    /// The step timeouts are carried over to the new period, the timing
    /// budget is re-applied and the phase calibration is run again.
    ///
    /// # Errors
    /// Fails with [`Error::InvalidVcselPeriod`] for an unsupported period,
    /// with [`Error::Timeout`] if the phase calibration does not complete,
    /// and forwards any errors from the I2C bus.
    // based on VL53L0X_set_vcsel_pulse_period()
    pub fn set_vcsel_pulse_period(
        &mut self,
        period_type: VcselPeriodType,
        period_pclks: u8,
    ) -> Result<(), Error<E>> {
        let invalid = || {
            warn!("rejected VCSEL period {}", period_pclks);
            Error::InvalidVcselPeriod(period_type, period_pclks)
        };

        let vcsel_period_reg = timing::encode_vcsel_period(period_pclks);

        // "When the VCSEL period for the pre or final range is changed,
        // the corresponding timeout must be read from the device using
        // the current VCSEL period, then the new VCSEL period can be
        // applied. The timeout then must be written back to the device
        // using the new VCSEL period.
        //
        // For the MSRC timeout, the same applies - this timeout being
        // dependant on the pre-range vcsel period."

        match period_type {
            VcselPeriodType::PreRange => {
                let phase_high =
                    tuning::pre_range_valid_phase_high(period_pclks).ok_or_else(invalid)?;

                let enables = self.get_sequence_step_enables()?;
                let timeouts = self.get_sequence_step_timeouts(enables)?;

                // "Set phase check limits"
                self.write(Register::PreRangeConfigValidPhaseHigh, phase_high)?;
                self.write(Register::PreRangeConfigValidPhaseLow, 0x08)?;

                // apply new VCSEL period
                self.write(Register::PreRangeConfigVcselPeriod, vcsel_period_reg)?;

                // update timeouts

                let new_pre_range_timeout_mclks =
                    timing::us_to_mclks(timeouts.pre_range_us, period_pclks);

                self.write_u16(
                    Register::PreRangeConfigTimeoutMacropHi,
                    encode_timeout_mclks(new_pre_range_timeout_mclks),
                )?;

                let new_msrc_timeout_mclks =
                    timing::us_to_mclks(timeouts.msrc_dss_tcc_us, period_pclks);

                // MSRC timeout is stored as (mclks - 1) in a single byte
                self.write(
                    Register::MsrcConfigTimeoutMacrop,
                    u8::try_from(new_msrc_timeout_mclks.saturating_sub(1)).unwrap_or(u8::MAX),
                )?;
            }
            VcselPeriodType::FinalRange => {
                let settings =
                    tuning::final_range_vcsel_settings(period_pclks).ok_or_else(invalid)?;

                let enables = self.get_sequence_step_enables()?;
                let timeouts = self.get_sequence_step_timeouts(enables)?;

                self.replay(&settings)?;

                // apply new VCSEL period
                self.write(Register::FinalRangeConfigVcselPeriod, vcsel_period_reg)?;

                // update timeouts

                let mut new_final_range_timeout_mclks =
                    timing::us_to_mclks(timeouts.final_range_us, period_pclks);

                if enables.pre_range {
                    new_final_range_timeout_mclks += u32::from(timeouts.pre_range_mclks);
                }

                self.write_u16(
                    Register::FinalRangeConfigTimeoutMacropHi,
                    encode_timeout_mclks(new_final_range_timeout_mclks),
                )?;
            }
        }

        // "Finally, the timing budget must be re-applied"
        self.set_measurement_timing_budget(self.measurement_timing_budget_us)?;

        // "Perform the phase calibration. This is needed after changing on
        // vcsel period."
        let sequence_config = self.read(Register::SystemSequenceConfig)?;
        self.write(Register::SystemSequenceConfig, SEQUENCE_PHASE_CALIBRATION)?;
        let calibrated = self.perform_single_ref_calibration(0x00);
        self.write(Register::SystemSequenceConfig, sequence_config)?;

        calibrated
    }

    /// Get the VCSEL pulse period in PCLKs for the given period type.
    ///
    /// # Errors
    /// Forwards any errors from the I2C bus.
    pub fn get_vcsel_pulse_period(&mut self, period_type: VcselPeriodType) -> Result<u8, Error<E>> {
        let register = match period_type {
            VcselPeriodType::PreRange => Register::PreRangeConfigVcselPeriod,
            VcselPeriodType::FinalRange => Register::FinalRangeConfigVcselPeriod,
        };

        Ok(timing::decode_vcsel_period(self.read(register)?))
    }

    // Reference SPAD count and type, based on VL53L0X_get_info_from_device().
    fn get_spad_info(&mut self) -> Result<(u8, bool), Error<E>> {
        self.replay(tuning::BANK1_OPEN)?;

        self.select_bank(0x06)?;
        self.update(0x83_u8, |data| *data |= 0x04)?;
        self.select_bank(0x07)?;
        self.write(0x81_u8, 0x01)?;

        self.write(Register::PowerManagementGo1PowerForce, 0x01)?;

        self.write(0x94_u8, 0x6B)?;
        self.write(0x83_u8, 0x00)?;

        if self.poll_until(|this| Ok(this.read(0x83_u8)? != 0x00))? == PollOutcome::TimedOut {
            warn!("timed out reading SPAD info");
            return Err(Error::Timeout);
        }

        self.write(0x83_u8, 0x01)?;
        let tmp = self.read(0x92_u8)?;

        let count = tmp & 0x7f;
        let type_is_aperture = ((tmp >> 7) & 0x01) != 0;

        self.write(0x81_u8, 0x00)?;
        self.select_bank(0x06)?;
        self.update(0x83_u8, |data| *data &= !0x04)?;
        self.select_bank(0x01)?;
        self.replay(tuning::BANK1_CLOSE)?;

        Ok((count, type_is_aperture))
    }

    // VL53L0X_set_reference_spads(), assuming the NVM values are valid.
    fn set_reference_spads(&mut self) -> Result<(), Error<E>> {
        let (spad_count, spad_type_is_aperture) = self.get_spad_info()?;
        debug!("reference SPADs: {} (aperture: {})", spad_count, spad_type_is_aperture);

        // factory good-SPAD map, same content as RefGoodSpadMap in the API
        let mut ref_spad_map = [0; 6];
        self.read_many(Register::GlobalConfigSpadEnablesRef0, &mut ref_spad_map)?;

        self.select_bank(0x01)?;
        self.write(Register::DynamicSpadRefEnStartOffset, 0x00)?;
        self.write(Register::DynamicSpadNumRequestedRefSpad, 0x2C)?;
        self.select_bank(0x00)?;
        self.write(Register::GlobalConfigRefEnStartSelect, 0xB4)?;

        // aperture SPADs start at 12
        let first_spad = if spad_type_is_aperture { 12 } else { 0 };
        let mut enabled: u8 = 0;

        // keep the first `spad_count` good SPADs from `first_spad` on
        for spad in 0..48_u8 {
            let (byte, bit) = (usize::from(spad / 8), spad % 8);
            if spad < first_spad || enabled == spad_count {
                ref_spad_map[byte] &= !(1 << bit);
            } else if (ref_spad_map[byte] >> bit) & 0x1 != 0 {
                enabled += 1;
            }
        }

        self.write_many(Register::GlobalConfigSpadEnablesRef0, &ref_spad_map)?;
        Ok(())
    }

    // based on VL53L0X_GetSequenceStepEnables()
    fn get_sequence_step_enables(&mut self) -> Result<SequenceStepEnables, Error<E>> {
        let sequence_config = self.read(Register::SystemSequenceConfig)?;
        Ok(SequenceStepEnables::from_sequence_config(sequence_config))
    }

    // Based on get_sequence_step_timeout(), but gets all timeouts at once and
    // keeps the intermediate values.
    fn get_sequence_step_timeouts(
        &mut self,
        enables: SequenceStepEnables,
    ) -> Result<SequenceStepTimeouts, Error<E>> {
        let mut timeouts = SequenceStepTimeouts {
            pre_range_vcsel_period_pclks: self.get_vcsel_pulse_period(VcselPeriodType::PreRange)?,
            ..SequenceStepTimeouts::default()
        };

        timeouts.msrc_dss_tcc_mclks =
            u16::from(self.read(Register::MsrcConfigTimeoutMacrop)?) + 1;
        timeouts.msrc_dss_tcc_us = timing::mclks_to_us(
            timeouts.msrc_dss_tcc_mclks,
            timeouts.pre_range_vcsel_period_pclks,
        );

        timeouts.pre_range_mclks =
            timing::decode_timeout(self.read_u16(Register::PreRangeConfigTimeoutMacropHi)?);
        timeouts.pre_range_us = timing::mclks_to_us(
            timeouts.pre_range_mclks,
            timeouts.pre_range_vcsel_period_pclks,
        );

        timeouts.final_range_vcsel_period_pclks =
            self.get_vcsel_pulse_period(VcselPeriodType::FinalRange)?;

        timeouts.final_range_mclks =
            timing::decode_timeout(self.read_u16(Register::FinalRangeConfigTimeoutMacropHi)?);

        // the final range timeout register includes the pre-range timeout
        if enables.pre_range {
            timeouts.final_range_mclks = timeouts
                .final_range_mclks
                .wrapping_sub(timeouts.pre_range_mclks);
        }

        timeouts.final_range_us = timing::mclks_to_us(
            timeouts.final_range_mclks,
            timeouts.final_range_vcsel_period_pclks,
        );

        Ok(timeouts)
    }

    // based on VL53L0X_perform_single_ref_calibration()
    fn perform_single_ref_calibration(&mut self, vhv_init_byte: u8) -> Result<(), Error<E>> {
        self.write(
            Register::SysrangeStart,
            SYSRANGE_MODE_START_STOP | vhv_init_byte,
        )?;

        if self.poll_until(Self::interrupt_pending)? == PollOutcome::TimedOut {
            warn!("reference calibration {} timed out", vhv_init_byte);
            return Err(Error::Timeout);
        }

        self.write(Register::SystemInterruptClear, 0x01)?;
        self.write(Register::SysrangeStart, 0x00)?;

        Ok(())
    }

    // Replay the stop variable captured during init; done before every
    // measurement start.
    fn restore_stop_variable(&mut self) -> Result<(), E> {
        self.replay(tuning::BANK1_OPEN)?;
        self.write(tuning::STOP_VARIABLE, self.stop_variable)?;
        self.replay(tuning::BANK1_CLOSE)
    }

    fn interrupt_pending(&mut self) -> Result<bool, Error<E>> {
        Ok((self.read(Register::ResultInterruptStatus)? & 0x07) != 0)
    }

    fn take_range(&mut self) -> Result<u16, Error<E>> {
        // assumptions: Linearity Corrective Gain is 1000 (default);
        // fractional ranging is not enabled
        let range = self.read_u16(u8::from(Register::ResultRangeStatus) + 10)?;

        self.write(Register::SystemInterruptClear, 0x01)?;

        Ok(range)
    }

    fn range_timed_out(&mut self) -> u16 {
        warn!("range measurement timed out");
        self.did_timeout = true;
        RANGE_TIMEOUT
    }

    /// Call `ready` until it returns true or the I/O timeout elapses.
    fn poll_until(
        &mut self,
        mut ready: impl FnMut(&mut Self) -> Result<bool, Error<E>>,
    ) -> Result<PollOutcome, Error<E>> {
        let guard = TimeoutGuard::start(&self.clock, self.io_timeout_ms);

        loop {
            if ready(&mut *self)? {
                return Ok(PollOutcome::Ready);
            }

            if guard.expired(&self.clock) {
                return Ok(PollOutcome::TimedOut);
            }
        }
    }
}

impl<I2C, C, E> Vl53l0x<I2C, C>
where
    I2C: I2c<Error = E>,
{
    fn replay(&mut self, steps: &[TuningStep]) -> Result<(), E> {
        for step in steps {
            match *step {
                TuningStep::SelectBank(bank) => self.select_bank(bank)?,
                TuningStep::Write(register, data) => self.write(register, data)?,
            }
        }
        Ok(())
    }

    fn select_bank(&mut self, bank: u8) -> Result<(), E> {
        self.write(Register::BankSelect, bank)
    }

    pub(crate) fn write(&mut self, register: impl Into<u8>, data: u8) -> Result<(), E> {
        self.i2c.write(self.address, &[register.into(), data])
    }

    pub(crate) fn write_u16(&mut self, register: impl Into<u8>, data: u16) -> Result<(), E> {
        let [high, low] = data.to_be_bytes();
        self.i2c.write(self.address, &[register.into(), high, low])
    }

    pub(crate) fn write_u32(&mut self, register: impl Into<u8>, data: u32) -> Result<(), E> {
        let [b0, b1, b2, b3] = data.to_be_bytes();
        self.i2c
            .write(self.address, &[register.into(), b0, b1, b2, b3])
    }

    pub(crate) fn write_many(&mut self, register: impl Into<u8>, data: &[u8]) -> Result<(), E> {
        self.i2c.transaction(
            self.address,
            &mut [
                Operation::Write(&[register.into()]),
                Operation::Write(data),
            ],
        )
    }

    pub(crate) fn read(&mut self, register: impl Into<u8>) -> Result<u8, E> {
        let mut data = [0];
        self.i2c
            .write_read(self.address, &[register.into()], &mut data)?;
        Ok(data[0])
    }

    pub(crate) fn read_u16(&mut self, register: impl Into<u8>) -> Result<u16, E> {
        let mut data = [0; 2];
        self.i2c
            .write_read(self.address, &[register.into()], &mut data)?;
        Ok(u16::from_be_bytes(data))
    }

    pub(crate) fn read_u32(&mut self, register: impl Into<u8>) -> Result<u32, E> {
        let mut data = [0; 4];
        self.i2c
            .write_read(self.address, &[register.into()], &mut data)?;
        Ok(u32::from_be_bytes(data))
    }

    pub(crate) fn read_many(&mut self, register: impl Into<u8>, data: &mut [u8]) -> Result<(), E> {
        self.i2c.write_read(self.address, &[register.into()], data)
    }

    fn update(&mut self, register: impl Into<u8>, f: impl FnOnce(&mut u8)) -> Result<(), E> {
        let register = register.into();
        let mut data = self.read(register)?;
        f(&mut data);
        self.write(register, data)
    }
}

/// Encode an MCLK timeout, saturating values the 16-bit register format
/// cannot hold.
fn encode_timeout_mclks(timeout_mclks: u32) -> u16 {
    timing::encode_timeout(u16::try_from(timeout_mclks).unwrap_or(u16::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_ADDRESS;
    use core::cell::Cell;
    use embedded_hal::i2c::ErrorKind;
    use embedded_hal_mock::eh1::i2c::{Mock, Transaction};

    const STOP_VARIABLE: u8 = 0x3C;

    /// Advances by one millisecond every time it is read.
    struct StepClock(Cell<u32>);

    impl ClockSource for StepClock {
        fn get_ms(&self) -> u32 {
            let now = self.0.get();
            self.0.set(now + 1);
            now
        }
    }

    fn sensor(expectations: &[Transaction]) -> Vl53l0x<Mock, StepClock> {
        Vl53l0x {
            i2c: Mock::new(expectations),
            clock: StepClock(Cell::new(0)),
            address: DEFAULT_ADDRESS,
            io_timeout_ms: 5,
            did_timeout: false,

            stop_variable: STOP_VARIABLE,
            measurement_timing_budget_us: 33_000,
        }
    }

    fn write(bytes: &[u8]) -> Transaction {
        Transaction::write(DEFAULT_ADDRESS, bytes.to_vec())
    }

    fn read(register: u8, response: &[u8]) -> Transaction {
        Transaction::write_read(DEFAULT_ADDRESS, vec![register], response.to_vec())
    }

    fn restore_stop_variable() -> Vec<Transaction> {
        vec![
            write(&[0x80, 0x01]),
            write(&[0xFF, 0x01]),
            write(&[0x00, 0x00]),
            write(&[0x91, STOP_VARIABLE]),
            write(&[0x00, 0x01]),
            write(&[0xFF, 0x00]),
            write(&[0x80, 0x00]),
        ]
    }

    #[test]
    fn set_address_masks_to_seven_bits() {
        let mut sensor = sensor(&[write(&[0x8A, 0x30])]);

        sensor.set_address(0xB0).unwrap();
        assert_eq!(sensor.address(), 0x30);

        sensor.i2c.done();
    }

    #[test]
    fn start_continuous_back_to_back() {
        let mut expectations = restore_stop_variable();
        expectations.push(write(&[0x00, 0x02]));
        let mut sensor = sensor(&expectations);

        sensor.start_continuous(0).unwrap();

        sensor.i2c.done();
    }

    #[test]
    fn start_continuous_timed_scales_by_oscillator_calibration() {
        let mut expectations = restore_stop_variable();
        expectations.extend([
            read(0xF8, &[0x01, 0x00]),
            // 100 ms * 256
            write(&[0x04, 0x00, 0x00, 0x64, 0x00]),
            write(&[0x00, 0x04]),
        ]);
        let mut sensor = sensor(&expectations);

        sensor.start_continuous(100).unwrap();

        sensor.i2c.done();
    }

    #[test]
    fn start_continuous_timed_without_oscillator_calibration() {
        let mut expectations = restore_stop_variable();
        expectations.extend([
            read(0xF8, &[0x00, 0x00]),
            write(&[0x04, 0x00, 0x00, 0x00, 0x64]),
            write(&[0x00, 0x04]),
        ]);
        let mut sensor = sensor(&expectations);

        sensor.start_continuous(100).unwrap();

        sensor.i2c.done();
    }

    #[test]
    fn stop_continuous_clears_stop_variable() {
        let mut sensor = sensor(&[
            write(&[0x00, 0x01]),
            write(&[0xFF, 0x01]),
            write(&[0x00, 0x00]),
            write(&[0x91, 0x00]),
            write(&[0x00, 0x01]),
            write(&[0xFF, 0x00]),
        ]);

        sensor.stop_continuous().unwrap();

        sensor.i2c.done();
    }

    #[test]
    fn continuous_read_waits_for_interrupt_then_clears_it() {
        let mut sensor = sensor(&[
            read(0x13, &[0x00]),
            read(0x13, &[0x40]),
            read(0x13, &[0x04]),
            read(0x1E, &[0x01, 0x2C]),
            write(&[0x0B, 0x01]),
        ]);

        assert_eq!(sensor.read_range_continuous_millimeters().unwrap(), 300);
        assert!(!sensor.timeout_occurred());

        sensor.i2c.done();
    }

    #[test]
    fn try_read_does_not_block() {
        let mut sensor = sensor(&[
            read(0x13, &[0x00]),
            read(0x13, &[0x01]),
            read(0x1E, &[0x00, 0x64]),
            write(&[0x0B, 0x01]),
        ]);

        assert_eq!(sensor.try_read_range_continuous_millimeters().unwrap(), None);
        assert_eq!(
            sensor.try_read_range_continuous_millimeters().unwrap(),
            Some(100)
        );

        sensor.i2c.done();
    }

    #[test]
    fn continuous_read_times_out_with_sentinel() {
        // the clock reads 1..=6 after each poll; 6 ms exceeds the 5 ms timeout
        let expectations = vec![read(0x13, &[0x00]); 6];
        let mut sensor = sensor(&expectations);

        assert_eq!(
            sensor.read_range_continuous_millimeters().unwrap(),
            RANGE_TIMEOUT
        );
        assert!(sensor.timeout_occurred());
        assert!(!sensor.timeout_occurred());

        sensor.i2c.done();
    }

    #[test]
    fn single_read_times_out_when_start_bit_sticks() {
        let mut expectations = restore_stop_variable();
        expectations.push(write(&[0x00, 0x01]));
        expectations.extend(vec![read(0x00, &[0x01]); 6]);
        let mut sensor = sensor(&expectations);

        assert_eq!(sensor.read_range_single_millimeters().unwrap(), RANGE_TIMEOUT);
        assert!(sensor.timeout_occurred());

        sensor.i2c.done();
    }

    #[test]
    fn single_read_starts_measurement_and_reads_result() {
        let mut expectations = restore_stop_variable();
        expectations.extend([
            write(&[0x00, 0x01]),
            read(0x00, &[0x01]),
            read(0x00, &[0x00]),
            read(0x13, &[0x04]),
            read(0x1E, &[0x00, 0xFA]),
            write(&[0x0B, 0x01]),
        ]);
        let mut sensor = sensor(&expectations);

        assert_eq!(sensor.read_range_single_millimeters().unwrap(), 250);

        sensor.i2c.done();
    }

    #[test]
    fn bus_errors_propagate() {
        let mut sensor = sensor(&[
            Transaction::write_read(DEFAULT_ADDRESS, vec![0x13], vec![0x00])
                .with_error(ErrorKind::Other),
        ]);

        assert_eq!(
            sensor.read_range_continuous_millimeters(),
            Err(Error::I2C(ErrorKind::Other))
        );
        assert!(!sensor.timeout_occurred());

        sensor.i2c.done();
    }

    #[test]
    fn signal_rate_limit_is_validated_before_writing() {
        let mut sensor = sensor(&[
            write(&[0x44, 0x00, 0x20]),
            read(0x44, &[0x00, 0x20]),
        ]);

        assert_eq!(
            sensor.set_signal_rate_limit(-0.1),
            Err(Error::InvalidSignalRateLimit(-0.1))
        );
        assert!(sensor.set_signal_rate_limit(512.0).is_err());
        assert!(sensor.set_signal_rate_limit(f32::NAN).is_err());

        sensor.set_signal_rate_limit(0.25).unwrap();
        let limit = sensor.get_signal_rate_limit().unwrap();
        assert!((limit - 0.25).abs() <= 1.0 / 128.0);

        sensor.i2c.done();
    }

    #[test]
    fn short_timing_budget_is_rejected_without_bus_traffic() {
        let mut sensor = sensor(&[]);

        assert_eq!(
            sensor.set_measurement_timing_budget(19_999),
            Err(Error::TimingBudgetTooShort(19_999))
        );

        sensor.i2c.done();
    }

    #[test]
    fn invalid_vcsel_periods_are_rejected_without_bus_traffic() {
        let mut sensor = sensor(&[]);

        assert_eq!(
            sensor.set_vcsel_pulse_period(VcselPeriodType::PreRange, 13),
            Err(Error::InvalidVcselPeriod(VcselPeriodType::PreRange, 13))
        );
        assert_eq!(
            sensor.set_vcsel_pulse_period(VcselPeriodType::FinalRange, 16),
            Err(Error::InvalidVcselPeriod(VcselPeriodType::FinalRange, 16))
        );

        sensor.i2c.done();
    }

    #[test]
    fn get_vcsel_pulse_period_decodes_register() {
        let mut sensor = sensor(&[read(0x50, &[0x06]), read(0x70, &[0x04])]);

        assert_eq!(
            sensor.get_vcsel_pulse_period(VcselPeriodType::PreRange).unwrap(),
            14
        );
        assert_eq!(
            sensor.get_vcsel_pulse_period(VcselPeriodType::FinalRange).unwrap(),
            10
        );

        sensor.i2c.done();
    }

    #[test]
    fn sequence_step_enables_decode_bits() {
        let enables = SequenceStepEnables::from_sequence_config(SEQUENCE_DEFAULT);
        assert!(!enables.tcc);
        assert!(!enables.msrc);
        assert!(enables.dss);
        assert!(enables.pre_range);
        assert!(enables.final_range);

        let enables = SequenceStepEnables::from_sequence_config(0x14);
        assert!(enables.tcc && enables.msrc);
        assert!(!(enables.dss || enables.pre_range || enables.final_range));
    }

    #[test]
    fn budget_overheads_differ_only_in_start() {
        let enables = SequenceStepEnables::from_sequence_config(SEQUENCE_DEFAULT);
        let timeouts = SequenceStepTimeouts {
            msrc_dss_tcc_us: 2055,
            pre_range_us: 8087,
            ..SequenceStepTimeouts::default()
        };

        let get = GET_BUDGET_OVERHEADS.used_budget_us(enables, &timeouts);
        let set = SET_BUDGET_OVERHEADS.used_budget_us(enables, &timeouts);

        assert_eq!(set, 1320 + 960 + 2 * (2055 + 690) + 8087 + 660 + 550);
        assert_eq!(get - set, 590);
    }
}
