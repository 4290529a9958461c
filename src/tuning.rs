//! Register write sequences replayed verbatim against the sensor.
//!
//! Register numbers are only meaningful relative to the bank selected by the
//! most recent [`TuningStep::SelectBank`], so these tables must never be
//! reordered or filtered.

use crate::reg::Register;

/// One write in a replayed sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TuningStep {
    /// Write [`Register::BankSelect`].
    SelectBank(u8),
    /// Write `value` to `register` in the currently selected bank.
    Write(u8, u8),
}

use TuningStep::{SelectBank, Write};

const POWER_FORCE: u8 = Register::PowerManagementGo1PowerForce as u8;

/// `DefaultTuningSettings` from the ST API (`vl53l0x_tuning.h`).
pub(crate) const DEFAULT_TUNING_SETTINGS: &[TuningStep] = &[
    SelectBank(0x01),
    Write(0x00, 0x00),

    SelectBank(0x00),
    Write(0x09, 0x00),
    Write(0x10, 0x00),
    Write(0x11, 0x00),

    Write(0x24, 0x01),
    Write(0x25, 0xFF),
    Write(0x75, 0x00),

    SelectBank(0x01),
    Write(0x4E, 0x2C),
    Write(0x48, 0x00),
    Write(0x30, 0x20),

    SelectBank(0x00),
    Write(0x30, 0x09),
    Write(0x54, 0x00),
    Write(0x31, 0x04),
    Write(0x32, 0x03),
    Write(0x40, 0x83),
    Write(0x46, 0x25),
    Write(0x60, 0x00),
    Write(0x27, 0x00),
    Write(0x50, 0x06),
    Write(0x51, 0x00),
    Write(0x52, 0x96),
    Write(0x56, 0x08),
    Write(0x57, 0x30),
    Write(0x61, 0x00),
    Write(0x62, 0x00),
    Write(0x64, 0x00),
    Write(0x65, 0x00),
    Write(0x66, 0xA0),

    SelectBank(0x01),
    Write(0x22, 0x32),
    Write(0x47, 0x14),
    Write(0x49, 0xFF),
    Write(0x4A, 0x00),

    SelectBank(0x00),
    Write(0x7A, 0x0A),
    Write(0x7B, 0x00),
    Write(0x78, 0x21),

    SelectBank(0x01),
    Write(0x23, 0x34),
    Write(0x42, 0x00),
    Write(0x44, 0xFF),
    Write(0x45, 0x26),
    Write(0x46, 0x05),
    Write(0x40, 0x40),
    Write(0x0E, 0x06),
    Write(0x20, 0x1A),
    Write(0x43, 0x40),

    SelectBank(0x00),
    Write(0x34, 0x03),
    Write(0x35, 0x44),

    SelectBank(0x01),
    Write(0x31, 0x04),
    Write(0x4B, 0x09),
    Write(0x4C, 0x05),
    Write(0x4D, 0x04),

    SelectBank(0x00),
    Write(0x44, 0x00),
    Write(0x45, 0x20),
    Write(0x47, 0x08),
    Write(0x48, 0x28),
    Write(0x67, 0x00),
    Write(0x70, 0x04),
    Write(0x71, 0x01),
    Write(0x72, 0xFE),
    Write(0x76, 0x00),
    Write(0x77, 0x00),

    SelectBank(0x01),
    Write(0x0D, 0x01),

    SelectBank(0x00),
    Write(POWER_FORCE, 0x01),
    Write(0x01, 0xF8),

    SelectBank(0x01),
    Write(0x8E, 0x01),
    Write(0x00, 0x01),
    SelectBank(0x00),
    Write(POWER_FORCE, 0x00),
];

/// Opens the bank 1 window holding the stop variable and the SPAD info.
pub(crate) const BANK1_OPEN: &[TuningStep] = &[
    Write(POWER_FORCE, 0x01),
    SelectBank(0x01),
    Write(0x00, 0x00),
];

/// Closes the window opened by [`BANK1_OPEN`].
pub(crate) const BANK1_CLOSE: &[TuningStep] = &[
    Write(0x00, 0x01),
    SelectBank(0x00),
    Write(POWER_FORCE, 0x00),
];

/// Register holding the stop variable while the bank 1 window is open.
pub(crate) const STOP_VARIABLE: u8 = 0x91;

/// Clears the stop variable when leaving continuous mode.
pub(crate) const STOP_VARIABLE_CLEAR: &[TuningStep] = &[
    SelectBank(0x01),
    Write(0x00, 0x00),
    Write(STOP_VARIABLE, 0x00),
    Write(0x00, 0x01),
    SelectBank(0x00),
];

/// Phase check and phase calibration settings for a final range VCSEL
/// period, or `None` if the sensor does not support that period.
pub(crate) fn final_range_vcsel_settings(period_pclks: u8) -> Option<[TuningStep; 7]> {
    // (valid phase high, VCSEL width, phasecal timeout, phasecal limit)
    let (phase_high, vcsel_width, phasecal_timeout, phasecal_lim) = match period_pclks {
        8 => (0x10, 0x02, 0x0C, 0x30),
        10 => (0x28, 0x03, 0x09, 0x20),
        12 => (0x38, 0x03, 0x08, 0x20),
        14 => (0x48, 0x03, 0x07, 0x20),
        _ => return None,
    };

    Some([
        Write(Register::FinalRangeConfigValidPhaseHigh.into(), phase_high),
        Write(Register::FinalRangeConfigValidPhaseLow.into(), 0x08),
        Write(Register::GlobalConfigVcselWidth.into(), vcsel_width),
        Write(Register::AlgoPhasecalConfigTimeout.into(), phasecal_timeout),
        SelectBank(0x01),
        Write(Register::ALGO_PHASECAL_LIM, phasecal_lim),
        SelectBank(0x00),
    ])
}

/// Valid phase high limit for a pre-range VCSEL period, or `None` if the
/// sensor does not support that period.
pub(crate) fn pre_range_valid_phase_high(period_pclks: u8) -> Option<u8> {
    match period_pclks {
        12 => Some(0x18),
        14 => Some(0x30),
        16 => Some(0x40),
        18 => Some(0x50),
        _ => None,
    }
}
