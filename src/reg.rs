/// Register map, named after the ST API register definitions. All of these
/// live in bank 0 unless noted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Register {
    SysrangeStart = 0x00,
    SystemSequenceConfig = 0x01,
    SystemIntermeasurementPeriod = 0x04,
    SystemInterruptConfigGpio = 0x0A,
    SystemInterruptClear = 0x0B,

    ResultInterruptStatus = 0x13,
    ResultRangeStatus = 0x14,

    AlgoPhasecalConfigTimeout = 0x30,
    GlobalConfigVcselWidth = 0x32,

    FinalRangeConfigMinCountRateRtnLimit = 0x44,
    MsrcConfigTimeoutMacrop = 0x46,
    FinalRangeConfigValidPhaseLow = 0x47,
    FinalRangeConfigValidPhaseHigh = 0x48,
    // bank 1
    DynamicSpadNumRequestedRefSpad = 0x4E,
    DynamicSpadRefEnStartOffset = 0x4F,

    PreRangeConfigVcselPeriod = 0x50,
    PreRangeConfigTimeoutMacropHi = 0x51,
    PreRangeConfigValidPhaseLow = 0x56,
    PreRangeConfigValidPhaseHigh = 0x57,

    MsrcConfigControl = 0x60,

    FinalRangeConfigVcselPeriod = 0x70,
    FinalRangeConfigTimeoutMacropHi = 0x71,

    PowerManagementGo1PowerForce = 0x80,
    GpioHvMuxActiveHigh = 0x84,
    VhvConfigPadSclSdaExtsupHv = 0x89,
    I2cSlaveDeviceAddress = 0x8A,

    GlobalConfigSpadEnablesRef0 = 0xB0,
    GlobalConfigRefEnStartSelect = 0xB6,

    IdentificationModelId = 0xC0,

    OscCalibrateVal = 0xF8,

    /// Writing this register switches the bank that every other register
    /// number addresses.
    BankSelect = 0xFF,
}

impl Register {
    /// Shares its number with [`Register::AlgoPhasecalConfigTimeout`], but
    /// lives in bank 1.
    pub(crate) const ALGO_PHASECAL_LIM: u8 = 0x30;
}

impl From<Register> for u8 {
    fn from(r: Register) -> Self {
        r as u8
    }
}
