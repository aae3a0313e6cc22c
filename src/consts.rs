/// Size of a data block, in bytes.
pub const BLOCK_SIZE: usize = 512;
/// Erase block size reported to the filesystem layer, in bytes.
pub const ERASE_BLOCK_SIZE: usize = 512;

pub mod commands {
    /// CMD base value.
    pub const CMD_BASE: u8 = 0x40;
    /// GO_IDLE_STATE - init card in spi mode if CS low.
    pub const CMD0: u8 = CMD_BASE;
    /// SEND_IF_COND - verify SD Memory Card interface operating condition.
    pub const CMD8: u8 = CMD_BASE + 8;
    /// SEND_CSD - read the Card Specific Data (CSD register).
    pub const CMD9: u8 = CMD_BASE + 9;
    /// STOP_TRANSMISSION - end multiple block read sequence.
    pub const CMD12: u8 = CMD_BASE + 12;
    /// READ_SINGLE_BLOCK - read a single data block from the card.
    pub const CMD17: u8 = CMD_BASE + 17;
    /// READ_MULTIPLE_BLOCK - read a multiple data blocks from the card.
    pub const CMD18: u8 = CMD_BASE + 18;
    /// WRITE_BLOCK - write a single data block to the card.
    pub const CMD24: u8 = CMD_BASE + 24;
    /// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION.
    pub const CMD25: u8 = CMD_BASE + 25;
    /// APP_CMD - escape for application specific command.
    pub const CMD55: u8 = CMD_BASE + 55;
    /// READ_OCR - read the OCR register of a card.
    pub const CMD58: u8 = CMD_BASE + 58;
    /// CRC_ON_OFF - enable or disable CRC checking.
    pub const CMD59: u8 = CMD_BASE + 59;
    /// SD_SEND_OP_COND - sends host capacity support information and
    /// activates the card's initialization process. Must follow CMD55.
    pub const ACMD41: u8 = CMD_BASE + 41;

    /// SEND_IF_COND argument: 2.7-3.6V range and the `0xAA` check pattern.
    pub const CMD8_ARG: u32 = 0x0000_01AA;
    /// ACMD41 argument with the HCS (host capacity support) bit set.
    pub const ACMD41_HCS: u32 = 0x4000_0000;
    /// CRC_ON_OFF argument enabling CRC checking.
    pub const CMD59_CRC_ON: u32 = 0x0000_0001;
}

pub mod tokens {
    /// Idle bus / card not busy.
    pub const AVAILABLE: u8 = 0xFF;
    /// Start data token for CMD9, CMD17, CMD18 and CMD24.
    pub const DATA_START_BLOCK: u8 = 0xFE;
    /// Stop token for write multiple blocks.
    pub const STOP_TRAN: u8 = 0xFD;
    /// Start data token for write multiple blocks.
    pub const WRITE_MULTIPLE: u8 = 0xFC;
    /// Mask for data response tokens after a write block operation.
    pub const DATA_RES_MASK: u8 = 0x1F;
    /// Write data accepted token.
    pub const DATA_RES_ACCEPTED: u8 = 0x05;
    /// CRC bytes sent when CRC checking is off.
    pub const DUMMY_CRC: [u8; 2] = [0xFF, 0xFF];
}
