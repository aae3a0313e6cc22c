//! Useful library code for tests: a simulated SD card that speaks the SPI
//! protocol one byte at a time.

#![allow(dead_code)]

use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    rc::Rc,
};

use embedded_hal::blocking::spi::Transfer;
use hex_literal::hex;
use sdcard_spi::{Block, Sdcard, SdcardConfig, BLOCK_SIZE};
use switch_hal::OutputSwitch;

/// CSD of a 3.9 GB SDHC card, C_SIZE = 0x1D69.
pub const CSD_SDHC: [u8; 16] = hex!("40 0E 00 32 5B 59 00 00 1D 69 7F 80 0A 40 00 8B");

/// Tight bounds so that timeouts trigger quickly.
pub struct TestConfig;

impl SdcardConfig for TestConfig {
    const BUSY_ATTEMPTS: usize = 64;
    const READ_R1_ATTEMPTS: usize = 16;
    const DATA_TOKEN_ATTEMPTS: usize = 64;
    const PROGRAM_ATTEMPTS: usize = 128;
    const INIT_ATTEMPTS: usize = 32;
    const DELAY_DUMMY_CYCLES: usize = 0;
    const USE_CRC: bool = false;
}

/// Same bounds as [`TestConfig`], with CRC checking on.
pub struct CrcConfig;

impl SdcardConfig for CrcConfig {
    const BUSY_ATTEMPTS: usize = 64;
    const READ_R1_ATTEMPTS: usize = 16;
    const DATA_TOKEN_ATTEMPTS: usize = 64;
    const PROGRAM_ATTEMPTS: usize = 128;
    const INIT_ATTEMPTS: usize = 32;
    const DELAY_DUMMY_CYCLES: usize = 0;
    const USE_CRC: bool = true;
}

/// Failure of the simulated bus or select line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusFault;

/// A command frame as seen by the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub index: u8,
    pub arg: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Filler,
    Response,
    Token,
    Payload,
}

#[derive(Debug)]
enum Mode {
    Command,
    AwaitToken { block: u32, multi: bool },
    Receive { block: u32, multi: bool, data: Vec<u8> },
}

/// Card state and fault injection knobs.
#[derive(Debug)]
pub struct CardModel {
    /// R1 answered to CMD0.
    pub cmd0_response: u8,
    /// R1 answered to CMD8; anything but `0x01` comes without an R7.
    pub cmd8_response: u8,
    /// R7 payload answered to CMD8.
    pub if_cond: [u8; 4],
    /// OCR answered to CMD58.
    pub ocr: [u8; 4],
    /// ACMD41 rounds answered with "idle" before the card becomes ready.
    pub idle_rounds: usize,
    /// Overrides the ACMD41 response.
    pub acmd41_response: Option<u8>,
    /// CSD register.
    pub csd: [u8; 16],
    /// `0xFF` bytes before a read data token.
    pub read_latency: usize,
    /// Token sent in front of read data.
    pub read_token: u8,
    /// Never send read data.
    pub withhold_data: bool,
    /// Data response to written blocks.
    pub data_response: u8,
    /// Busy bytes after an accepted block or a stop token.
    pub program_busy: usize,
    /// Hold the bus low forever once a block has been written.
    pub hang_after_write: bool,
    /// Hold the bus low forever.
    pub stuck_busy: bool,
    /// Flip a bit in the CRC of read data.
    pub corrupt_read_crc: bool,
    /// Fail every transfer.
    pub fail_transport: bool,
    /// Fail every chip select change.
    pub fail_select: bool,

    pub selected: bool,
    pub select_count: usize,
    pub deselect_count: usize,
    pub deselected_clocks: usize,
    pub crc_enabled: bool,
    pub idle: bool,
    /// Next block of an open CMD18 stream.
    pub streaming: Option<u32>,
    pub stop_tran_count: usize,
    pub tokens_clocked: usize,
    pub payload_bytes_clocked: usize,
    pub commands: Vec<Command>,
    pub blocks: BTreeMap<u32, Block>,

    pub(crate) out: VecDeque<(u8, Tag)>,
    pub(crate) frame: Vec<u8>,
    pub(crate) mode: Mode,
    pub(crate) app_cmd: bool,
    pub(crate) acmd41_rounds: usize,
}

impl Default for CardModel {
    fn default() -> Self {
        CardModel {
            cmd0_response: 0x01,
            cmd8_response: 0x01,
            if_cond: [0x00, 0x00, 0x01, 0xAA],
            ocr: [0xC0, 0xFF, 0x80, 0x00],
            idle_rounds: 3,
            acmd41_response: None,
            csd: CSD_SDHC,
            read_latency: 2,
            read_token: 0xFE,
            withhold_data: false,
            data_response: 0xE5,
            program_busy: 3,
            hang_after_write: false,
            stuck_busy: false,
            corrupt_read_crc: false,
            fail_transport: false,
            fail_select: false,
            selected: false,
            select_count: 0,
            deselect_count: 0,
            deselected_clocks: 0,
            crc_enabled: false,
            idle: true,
            streaming: None,
            stop_tran_count: 0,
            tokens_clocked: 0,
            payload_bytes_clocked: 0,
            commands: Vec::new(),
            blocks: BTreeMap::new(),
            out: VecDeque::new(),
            frame: Vec::new(),
            mode: Mode::Command,
            app_cmd: false,
            acmd41_rounds: 0,
        }
    }
}

/// Content of a block that was never written.
pub fn pattern(block: u32) -> Block {
    let mut data = [0; BLOCK_SIZE];
    let seed = block.to_le_bytes();
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = seed[i % 4].wrapping_add(i as u8);
    }
    data
}

/// Block filled with a single value.
pub fn filled(value: u8) -> Block {
    [value; BLOCK_SIZE]
}

pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        for bit in (0..8).rev() {
            let feedback = ((byte >> bit) ^ (crc >> 6)) & 0x01;
            crc = (crc << 1) & 0x7F;
            if feedback != 0 {
                crc ^= 0x09;
            }
        }
    }
    crc
}

pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

impl CardModel {
    /// Indices of the commands received so far.
    pub fn command_indices(&self) -> Vec<u8> {
        self.commands.iter().map(|c| c.index).collect()
    }

    pub fn clear_log(&mut self) {
        self.commands.clear();
        self.tokens_clocked = 0;
        self.payload_bytes_clocked = 0;
    }

    /// Whether a CMD18 stream is still running.
    pub fn mid_stream(&self) -> bool {
        self.streaming.is_some()
    }

    fn block(&self, block: u32) -> Block {
        self.blocks.get(&block).copied().unwrap_or_else(|| pattern(block))
    }

    fn exchange(&mut self, tx: u8) -> u8 {
        if !self.selected {
            self.deselected_clocks += 1;
            return 0xFF;
        }

        if tx == 0xFF && self.out.is_empty() && self.frame.is_empty() {
            if let Some(block) = self.streaming {
                let data = self.block(block);
                self.queue_data(&data);
                self.streaming = Some(block.wrapping_add(1));
            }
        }

        let rx = match self.out.pop_front() {
            Some((byte, tag)) => {
                match tag {
                    Tag::Token => self.tokens_clocked += 1,
                    Tag::Payload => self.payload_bytes_clocked += 1,
                    Tag::Filler | Tag::Response => {}
                }
                byte
            }
            None if self.stuck_busy => 0x00,
            None => 0xFF,
        };

        self.consume(tx);
        rx
    }

    fn consume(&mut self, tx: u8) {
        match std::mem::replace(&mut self.mode, Mode::Command) {
            Mode::Command => self.consume_command_byte(tx),
            Mode::AwaitToken { block, multi } => self.await_token(tx, block, multi),
            Mode::Receive {
                block,
                multi,
                mut data,
            } => {
                data.push(tx);
                if data.len() == BLOCK_SIZE + 2 {
                    self.finish_write(block, multi, &data);
                } else {
                    self.mode = Mode::Receive { block, multi, data };
                }
            }
        }
    }

    fn consume_command_byte(&mut self, tx: u8) {
        if self.frame.is_empty() && tx & 0xC0 != 0x40 {
            return;
        }

        self.frame.push(tx);

        if self.frame.len() == 6 {
            let frame = std::mem::take(&mut self.frame);
            self.handle_command(&frame);
        }
    }

    fn r1(&self) -> u8 {
        u8::from(self.idle)
    }

    fn respond(&mut self, bytes: &[u8]) {
        self.out.push_back((0xFF, Tag::Filler));
        for &byte in bytes {
            self.out.push_back((byte, Tag::Response));
        }
    }

    fn queue_data(&mut self, data: &[u8]) {
        for _ in 0..self.read_latency {
            self.out.push_back((0xFF, Tag::Filler));
        }

        if self.withhold_data {
            return;
        }

        self.out.push_back((self.read_token, Tag::Token));
        for &byte in data {
            self.out.push_back((byte, Tag::Payload));
        }

        let mut crc = crc16(data);
        if self.corrupt_read_crc {
            crc ^= 0x0001;
        }
        for byte in crc.to_be_bytes() {
            self.out.push_back((byte, Tag::Payload));
        }
    }

    fn queue_busy(&mut self) {
        for _ in 0..self.program_busy {
            self.out.push_back((0x00, Tag::Filler));
        }
    }

    fn handle_command(&mut self, frame: &[u8]) {
        let index = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        self.commands.push(Command { index, arg });

        let crc_ok = (crc7(&frame[..5]) << 1) | 1 == frame[5];
        if !crc_ok && (self.crc_enabled || index == 0 || index == 8) {
            self.app_cmd = false;
            self.respond(&[self.r1() | 0x08]);
            return;
        }

        let app_cmd = std::mem::take(&mut self.app_cmd);
        let data_command = matches!(index, 9 | 17 | 18 | 24 | 25);

        if data_command && self.idle {
            self.respond(&[self.r1() | 0x04]);
            return;
        }

        match (app_cmd, index) {
            (_, 0) => {
                self.idle = true;
                self.streaming = None;
                self.acmd41_rounds = 0;
                self.crc_enabled = false;
                self.respond(&[self.cmd0_response]);
            }
            (_, 8) => {
                if self.cmd8_response == 0x01 {
                    let mut r7 = vec![0x01];
                    r7.extend_from_slice(&self.if_cond);
                    self.respond(&r7);
                } else {
                    self.respond(&[self.cmd8_response]);
                }
            }
            (_, 55) => {
                self.app_cmd = true;
                self.respond(&[self.r1()]);
            }
            (true, 41) => {
                let r1 = match self.acmd41_response {
                    Some(r1) => r1,
                    None if self.acmd41_rounds >= self.idle_rounds => 0x00,
                    None => {
                        self.acmd41_rounds += 1;
                        0x01
                    }
                };
                if r1 == 0x00 {
                    self.idle = false;
                }
                self.respond(&[r1]);
            }
            (_, 58) => {
                let mut r3 = vec![self.r1()];
                r3.extend_from_slice(&self.ocr);
                self.respond(&r3);
            }
            (_, 59) => {
                self.crc_enabled = arg & 0x01 != 0;
                self.respond(&[self.r1()]);
            }
            (_, 9) => {
                self.respond(&[0x00]);
                let csd = self.csd;
                self.queue_data(&csd);
            }
            (_, 12) => {
                self.streaming = None;
                self.out.clear();
                self.out.push_back((0x3F, Tag::Filler));
                self.out.push_back((0x00, Tag::Response));
            }
            (_, 17) => {
                self.respond(&[0x00]);
                let data = self.block(arg);
                self.queue_data(&data);
            }
            (_, 18) => {
                self.respond(&[0x00]);
                self.streaming = Some(arg);
            }
            (_, 24) => {
                self.respond(&[0x00]);
                self.mode = Mode::AwaitToken {
                    block: arg,
                    multi: false,
                };
            }
            (_, 25) => {
                self.respond(&[0x00]);
                self.mode = Mode::AwaitToken {
                    block: arg,
                    multi: true,
                };
            }
            _ => self.respond(&[self.r1() | 0x04]),
        }
    }

    fn await_token(&mut self, tx: u8, block: u32, multi: bool) {
        self.mode = match (tx, multi) {
            (0xFE, false) | (0xFC, true) => {
                self.tokens_clocked += 1;
                Mode::Receive {
                    block,
                    multi,
                    data: Vec::with_capacity(BLOCK_SIZE + 2),
                }
            }
            (0xFD, true) => {
                self.stop_tran_count += 1;
                self.out.push_back((0x00, Tag::Filler));
                self.queue_busy();
                Mode::Command
            }
            _ => Mode::AwaitToken { block, multi },
        };
    }

    fn finish_write(&mut self, block: u32, multi: bool, data: &[u8]) {
        let (payload, crc) = data.split_at(BLOCK_SIZE);
        self.payload_bytes_clocked += data.len();

        let crc_ok = !self.crc_enabled || u16::from_be_bytes([crc[0], crc[1]]) == crc16(payload);
        let response = if crc_ok { self.data_response } else { 0xEB };
        let accepted = response & 0x1F == 0x05;

        self.out.push_back((response, Tag::Response));

        if accepted {
            let mut stored = [0; BLOCK_SIZE];
            stored.copy_from_slice(payload);
            self.blocks.insert(block, stored);
            self.queue_busy();
            if self.hang_after_write {
                self.stuck_busy = true;
            }
        }

        self.mode = if multi {
            Mode::AwaitToken {
                block: block.wrapping_add(1),
                multi,
            }
        } else {
            Mode::Command
        };
    }
}

pub type SharedCard = Rc<RefCell<CardModel>>;

/// SPI side of the simulated card.
pub struct SimSpi(pub SharedCard);

impl Transfer<u8> for SimSpi {
    type Error = BusFault;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        let mut card = self.0.borrow_mut();

        if card.fail_transport {
            return Err(BusFault);
        }

        for word in words.iter_mut() {
            *word = card.exchange(*word);
        }

        Ok(words)
    }
}

/// Chip select of the simulated card, `on` selects it.
pub struct SimCs(pub SharedCard);

impl OutputSwitch for SimCs {
    type Error = BusFault;

    fn on(&mut self) -> Result<(), Self::Error> {
        let mut card = self.0.borrow_mut();

        if card.fail_select {
            return Err(BusFault);
        }

        card.selected = true;
        card.select_count += 1;
        Ok(())
    }

    fn off(&mut self) -> Result<(), Self::Error> {
        let mut card = self.0.borrow_mut();

        if card.fail_select {
            return Err(BusFault);
        }

        card.selected = false;
        card.deselect_count += 1;
        Ok(())
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn make_card(model: CardModel) -> SharedCard {
    init_logging();
    Rc::new(RefCell::new(model))
}

pub fn make_driver<Config: SdcardConfig>(card: &SharedCard) -> Sdcard<SimSpi, SimCs, Config> {
    Sdcard::new_with_config(SimSpi(card.clone()), SimCs(card.clone()))
}

/// A fresh card and an initialized driver using [`TestConfig`].
pub fn ready_card() -> (SharedCard, Sdcard<SimSpi, SimCs, TestConfig>) {
    let card = make_card(CardModel::default());
    let sd = make_driver::<TestConfig>(&card);
    sd.init().expect("init");
    card.borrow_mut().clear_log();
    (card, sd)
}
