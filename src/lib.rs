#![doc = include_str!("../README.md")]
#![cfg_attr(not(test), no_std)]

mod fmt; // keep first, the logging macros are textually scoped

mod imp;
mod reg;
mod timeout;
pub mod timing;
mod tuning;

/// The default I2C address for the VL53L0X.
pub const DEFAULT_ADDRESS: u8 = 0b010_1001;

/// Returned by the range reads when the sensor did not answer in time. Check
/// [`Vl53l0x::timeout_occurred`] to tell it apart from a real reading.
pub const RANGE_TIMEOUT: u16 = 65535;

/// The shortest measurement timing budget the sensor accepts, in
/// microseconds.
pub const MIN_TIMING_BUDGET_US: u32 = 20_000;

/// Possible errors returned by the driver.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    /// An error occurred on the I2C bus.
    I2C(E),

    /// The model ID read from the device was invalid.
    InvalidModelId(u8),
    /// The signal rate limit was outside `0.0..=511.99` MCPS.
    InvalidSignalRateLimit(f32),
    /// The measurement timing budget was below [`MIN_TIMING_BUDGET_US`].
    TimingBudgetTooShort(u32),
    /// The enabled sequence steps alone take longer than the requested
    /// timing budget, leaving nothing for the final range step.
    TimingBudgetExceeded(u32),
    /// The VCSEL pulse period is not supported for that period type.
    InvalidVcselPeriod(VcselPeriodType, u8),
    /// The device timed out while calibrating or reporting SPAD info.
    Timeout,
}

impl<E: core::fmt::Debug> core::fmt::Display for Error<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl<E> From<E> for Error<E> {
    fn from(error: E) -> Self {
        Error::I2C(error)
    }
}

/// A monotonic time source with millisecond precision. It may wrap around.
pub trait ClockSource {
    /// Get the current time in milliseconds.
    fn get_ms(&self) -> u32;
}

impl<T: ClockSource + ?Sized> ClockSource for &T {
    fn get_ms(&self) -> u32 {
        (**self).get_ms()
    }
}

/// Which ranging step a VCSEL (laser) pulse period applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VcselPeriodType {
    /// Pre-range step. Valid periods are 12, 14, 16 and 18 PCLKs.
    PreRange,
    /// Final range step. Valid periods are 8, 10, 12 and 14 PCLKs.
    FinalRange,
}

/// Settings applied when the driver is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// 7-bit bus address the sensor currently answers on.
    pub address: u8,
    /// Deadline for every blocking poll, in milliseconds. `0` blocks forever.
    pub io_timeout_ms: u32,
    /// Switch the sensor's I/O pads from 1V8 to 2V8 mode.
    pub io_2v8: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            io_timeout_ms: 500,
            io_2v8: true,
        }
    }
}

/// A VL53L0X driver. Use the `new` function to create and initialise an
/// instance, then call one of the range reads to measure a distance.
///
/// Every call runs to completion on the caller's thread. Bank switching
/// sequences are not atomic, so all calls against one sensor must be
/// serialised by the owner.
pub struct Vl53l0x<I2C, C> {
    i2c: I2C,
    clock: C,
    address: u8,
    io_timeout_ms: u32,
    did_timeout: bool,

    stop_variable: u8,
    measurement_timing_budget_us: u32,
}

impl<I2C, C, E> Vl53l0x<I2C, C>
where
    I2C: embedded_hal::i2c::I2c<Error = E>,
    C: ClockSource,
{
    /// Create a new instance of the VL53L0X driver and initialise the device
    /// for ranging.
    ///
    /// Initialisation loads the default tuning settings, programs the factory
    /// reference SPADs, sets the default timing budget (about 33 ms) and runs
    /// the VHV and phase reference calibrations. The device is left idle;
    /// start measuring with [`Self::read_range_single_millimeters`] or
    /// [`Self::start_continuous`].
    ///
    /// The `clock` drives the deadline of every blocking poll, see
    /// [`Config::io_timeout_ms`].
    ///
    /// # Errors
    /// Forwards any errors from the I2C bus. Fails with
    /// [`Error::InvalidModelId`] if the device is not a VL53L0X and with
    /// [`Error::Timeout`] if a calibration step does not complete. A failed
    /// initialisation leaves the device in an undefined state.
    pub fn new(i2c: I2C, clock: C, config: Config) -> Result<Self, Error<E>> {
        let mut this = Self {
            i2c,
            clock,
            address: config.address,
            io_timeout_ms: config.io_timeout_ms,
            did_timeout: false,

            stop_variable: 0,
            measurement_timing_budget_us: 0,
        };

        match this.init(config.io_2v8) {
            Ok(()) => {
                info!("vl53l0x init success");
                Ok(this)
            }
            Err(e) => {
                error!("vl53l0x init failed");
                Err(e)
            }
        }
    }

    /// Destroy the driver and hand back the bus and the clock.
    pub fn release(self) -> (I2C, C) {
        (self.i2c, self.clock)
    }

    /// The bus address the driver talks to.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// The deadline for blocking polls, in milliseconds.
    pub fn io_timeout(&self) -> u32 {
        self.io_timeout_ms
    }

    /// Set the deadline for blocking polls in milliseconds. `0` disables it,
    /// in which case a sensor that never answers blocks the caller forever.
    pub fn set_io_timeout(&mut self, timeout_ms: u32) {
        self.io_timeout_ms = timeout_ms;
    }

    /// Whether a range read has timed out since the last call. Reading the
    /// flag clears it.
    ///
    /// A timed out read returns [`RANGE_TIMEOUT`], which is also a value the
    /// sensor can report on its own. Check this flag right after the read:
    /// any other caller consuming it first will hide the timeout.
    pub fn timeout_occurred(&mut self) -> bool {
        core::mem::take(&mut self.did_timeout)
    }

    /// Read an 8-bit register in the currently selected bank.
    ///
    /// # Errors
    /// Forwards any errors from the I2C bus.
    pub fn read_register(&mut self, register: u8) -> Result<u8, Error<E>> {
        self.read(register).map_err(Error::I2C)
    }

    /// Write an 8-bit register in the currently selected bank.
    ///
    /// # Errors
    /// Forwards any errors from the I2C bus.
    pub fn write_register(&mut self, register: u8, value: u8) -> Result<(), Error<E>> {
        self.write(register, value).map_err(Error::I2C)
    }

    /// Read a big-endian 16-bit register.
    ///
    /// # Errors
    /// Forwards any errors from the I2C bus.
    pub fn read_register_u16(&mut self, register: u8) -> Result<u16, Error<E>> {
        self.read_u16(register).map_err(Error::I2C)
    }

    /// Write a big-endian 16-bit register.
    ///
    /// # Errors
    /// Forwards any errors from the I2C bus.
    pub fn write_register_u16(&mut self, register: u8, value: u16) -> Result<(), Error<E>> {
        self.write_u16(register, value).map_err(Error::I2C)
    }

    /// Read a big-endian 32-bit register.
    ///
    /// # Errors
    /// Forwards any errors from the I2C bus.
    pub fn read_register_u32(&mut self, register: u8) -> Result<u32, Error<E>> {
        self.read_u32(register).map_err(Error::I2C)
    }

    /// Write a big-endian 32-bit register.
    ///
    /// # Errors
    /// Forwards any errors from the I2C bus.
    pub fn write_register_u32(&mut self, register: u8, value: u32) -> Result<(), Error<E>> {
        self.write_u32(register, value).map_err(Error::I2C)
    }

    /// Read consecutive registers starting at `register` into `data`.
    ///
    /// # Errors
    /// Forwards any errors from the I2C bus.
    pub fn read_registers(&mut self, register: u8, data: &mut [u8]) -> Result<(), Error<E>> {
        self.read_many(register, data).map_err(Error::I2C)
    }

    /// Write `data` to consecutive registers starting at `register`.
    ///
    /// # Errors
    /// Forwards any errors from the I2C bus.
    pub fn write_registers(&mut self, register: u8, data: &[u8]) -> Result<(), Error<E>> {
        self.write_many(register, data).map_err(Error::I2C)
    }
}
