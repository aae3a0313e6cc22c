use crate::consts::BLOCK_SIZE;

use bitfield::bitfield;
use size::{consts::KiB, Size};

/// Card Specific Data block.
pub type CsdData = [u8; 16];

bitfield! {
    /// Card Specific Data with `CSD_STRUCTURE = 1`, the layout used by
    /// high-capacity (SDHC/SDXC) cards.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
    pub struct CsdV2(u128);
    impl Debug;
    pub u8, csd_structure, _: 127, 126;
    pub u8, data_read_access_time1, _: 119, 112;
    pub u8, data_read_access_time2, _: 111, 104;
    pub u8, max_data_transfer_rate, _: 103, 96;
    pub u16, card_command_classes, _: 95, 84;
    pub u8, read_block_length, _: 83, 80;
    pub u32, c_size, _: 69, 48;
    pub erase_single_block_enabled, _: 46;
    pub u8, erase_sector_size, _: 45, 39;
    pub u8, write_speed_factor, _: 28, 26;
    pub u8, max_write_data_length, _: 25, 22;
    pub permanent_write_protection, _: 13;
    pub temporary_write_protection, _: 12;
    pub u8, crc, _: 7, 1;
}

impl From<CsdData> for CsdV2 {
    fn from(csd_data: CsdData) -> Self {
        CsdV2(u128::from_be_bytes(csd_data))
    }
}

impl CsdV2 {
    /// Value of the `CSD_STRUCTURE` field for high-capacity cards.
    pub const STRUCTURE_HIGH_CAPACITY: u8 = 1;

    /// Whether the register uses the high-capacity layout this type decodes.
    pub fn is_high_capacity(&self) -> bool {
        self.csd_structure() == Self::STRUCTURE_HIGH_CAPACITY
    }

    /// Returns the card capacity in 512-byte blocks: `(C_SIZE + 1) << 10`.
    pub fn card_capacity_blocks(&self) -> u64 {
        (u64::from(self.c_size()) + 1) * (KiB as u64)
    }

    /// Returns the card capacity in bytes, `(C_SIZE + 1) * 512 KiB`.
    pub fn card_capacity(&self) -> Size {
        Size::from_bytes(self.card_capacity_blocks() * BLOCK_SIZE as u64)
    }
}
