/// Represents config for [`Sdcard`](crate::Sdcard).
///
/// Every polling loop of the driver is bounded by one of these constants.
/// When a bound is exhausted the operation fails with
/// [`Error::Timeout`](crate::Error::Timeout) instead of spinning forever.
pub trait SdcardConfig {
    /// Max bytes polled for `0xFF` while waiting for the card to release the bus.
    const BUSY_ATTEMPTS: usize;
    /// Max bytes polled for an R1 response after a command frame.
    const READ_R1_ATTEMPTS: usize;
    /// Max bytes polled for a data start token.
    const DATA_TOKEN_ATTEMPTS: usize;
    /// Max bytes polled while the card programs a written block.
    const PROGRAM_ATTEMPTS: usize;
    /// Max CMD55/ACMD41 rounds before the card must leave the idle state.
    const INIT_ATTEMPTS: usize;
    /// Count of dummy cycles for delay.
    const DELAY_DUMMY_CYCLES: usize;
    /// Enable CRC checking on the card (CMD59) and real CRC16 on data blocks.
    ///
    /// When disabled the data CRC is sent as `0xFF 0xFF` and never verified.
    const USE_CRC: bool;
}

/// Default implementation of [`SdcardConfig`](crate::SdcardConfig).
///
/// Sized for a 400 kHz - 25 MHz bus, where initialization may legitimately
/// take up to a second.
pub struct DefaultSdcardConfig;

impl SdcardConfig for DefaultSdcardConfig {
    const BUSY_ATTEMPTS: usize = 50_000;
    const READ_R1_ATTEMPTS: usize = 64;
    const DATA_TOKEN_ATTEMPTS: usize = 50_000;
    const PROGRAM_ATTEMPTS: usize = 250_000;
    const INIT_ATTEMPTS: usize = 2_000;
    const DELAY_DUMMY_CYCLES: usize = 32;
    const USE_CRC: bool = false;
}
