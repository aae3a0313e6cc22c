use bitfield::bitfield;

bitfield! {
    /// R1 response bitset.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
    pub struct R1Response(u8);
    impl Debug;
    pub in_idle_state, _: 0;
    pub erase_reset, _: 1;
    pub illegal_command, _: 2;
    pub command_crc_error, _: 3;
    pub erase_sequence_error, _: 4;
    pub address_error, _: 5;
    pub parameter_error, _: 6;
    pub start_bit, _: 7;
}

impl R1Response {
    /// Card left the idle state, no error flags.
    pub const READY_STATE: Self = R1Response(0x00);
    /// Card is in the idle state, no error flags.
    pub const IN_IDLE_STATE: Self = R1Response(0x01);

    /// Raw response byte.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// An R1 always has its most significant bit cleared; `0xFF` means no
    /// response yet.
    pub fn is_valid(&self) -> bool {
        !self.start_bit()
    }
}

impl From<u8> for R1Response {
    fn from(value: u8) -> Self {
        R1Response(value)
    }
}

/// Trailing 4 bytes of an R7 (SEND_IF_COND) response.
pub type R7Payload = [u8; 4];

bitfield! {
    /// R7 response payload.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
    pub struct IfCond(u32);
    impl Debug;
    pub u8, command_version, _: 31, 28;
    pub supports_2v7_3v6, _: 8;
    pub u8, check_pattern, _: 7, 0;
}

impl From<R7Payload> for IfCond {
    fn from(payload: R7Payload) -> Self {
        IfCond(u32::from_be_bytes(payload))
    }
}

impl IfCond {
    /// Check pattern echoed back by a card that accepted SEND_IF_COND.
    pub const CHECK_PATTERN: u8 = 0xAA;

    /// The card echoed the check pattern and accepts the host voltage.
    pub fn is_accepted(&self) -> bool {
        self.supports_2v7_3v6() && self.check_pattern() == Self::CHECK_PATTERN
    }
}

/// R3 OCR payload.
pub type R3OcrPayload = [u8; 4];

bitfield! {
    /// Operation Conditions Register.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
    pub struct Ocr(u32);
    impl Debug;
    pub power_up_done, _: 31;
    pub card_capacity_status, _: 30;
    pub u16, voltage_window, _: 23, 15;
}

impl From<R3OcrPayload> for Ocr {
    fn from(payload: R3OcrPayload) -> Self {
        Ocr(u32::from_be_bytes(payload))
    }
}
