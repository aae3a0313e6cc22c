//! SDHC/SDXC card driver for the SPI bus, written in Embedded Rust.
//!
//! The crate talks the SD SPI-mode command protocol using nothing but a
//! byte-exchange primitive ([`Transfer<u8>`]) and a chip-select switch
//! ([`OutputSwitch`]). It offers:
//!
//! * [`Sdcard`] - the protocol driver: initialization, capacity query,
//!   single-block transfers and multi-block streaming through
//!   [`ReadSession`]/[`WriteSession`].
//! * [`SdDisk`] - sector-oriented glue for a FAT filesystem layer,
//!   implementing [`DiskioDevice`].
//!
//! Only high-capacity cards (SDHC/SDXC, block addressed) are supported;
//! standard-capacity cards are rejected during [`Sdcard::init`].
//!
//! ```no_run
//! use sdcard_spi::{Block, Sdcard};
//!
//! fn copy_first_block<Spi, Cs>(spi: Spi, cs: Cs)
//! where
//!     Spi: embedded_hal::blocking::spi::Transfer<u8>,
//!     Cs: switch_hal::OutputSwitch,
//!     Spi::Error: core::fmt::Debug,
//!     Cs::Error: core::fmt::Debug,
//! {
//!     let mut card = Sdcard::new(spi, cs);
//!     card.init().unwrap();
//!     println!("{} blocks", card.get_blocks_number().unwrap());
//!
//!     let mut block: Block = [0; 512];
//!     card.read_single_block(0, &mut block).unwrap();
//!     card.write_single_block(1, &block).unwrap();
//!
//!     let mut stream = card.read_begin(0).unwrap();
//!     stream.read_data(&mut block).unwrap();
//!     stream.read_end().unwrap();
//! }
//! ```
//!
//! ## Features
//!
//! * `log`: Enabled by default. Generates log messages using the `log` crate.
//! * `defmt-log`: By turning off the default features and enabling the
//!   `defmt-log` feature you can configure this crate to log messages over
//!   defmt instead.
//!
//! You cannot enable both the `log` feature and the `defmt-log` feature.

#![cfg_attr(not(test), no_std)]

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("Cannot enable both log and defmt-log");

#[cfg(feature = "log")]
use log::{debug, error, info, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, error, info, trace, warn};

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::debug! but does nothing at all
macro_rules! debug {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::trace! but does nothing at all
macro_rules! trace {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::info! but does nothing at all
macro_rules! info {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::warn! but does nothing at all
macro_rules! warn {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::error! but does nothing at all
macro_rules! error {
    ($($arg:tt)+) => {};
}

mod config;
mod consts;
mod crc;
mod csd;
mod disk;
mod response;
mod stream;

pub use crate::config::{DefaultSdcardConfig, SdcardConfig};
pub use crate::consts::{BLOCK_SIZE, ERASE_BLOCK_SIZE};
pub use crate::csd::{CsdData, CsdV2};
pub use crate::disk::{DiskFault, SdDisk};
pub use crate::response::{IfCond, Ocr, R1Response};
pub use crate::stream::{ReadSession, WriteSession};
pub use diskio::{
    BlockSize, DiskioDevice, Error as DiskioError, IoctlCmd, Lba, Status, StatusFlag,
};
pub use size::Size;

use crate::{
    consts::{commands, tokens},
    crc::{crc16, crc7},
    response::{R3OcrPayload, R7Payload},
};

use core::{cell::RefCell, marker::PhantomData};
use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

/// One data block.
pub type Block = [u8; BLOCK_SIZE];

/// Protocol step at which an operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum Step {
    /// GO_IDLE_STATE.
    Cmd0,
    /// SEND_IF_COND, R1 part.
    Cmd8,
    /// SEND_IF_COND, R7 check pattern and voltage range.
    IfCond,
    /// CRC_ON_OFF.
    Cmd59,
    /// APP_CMD preceding ACMD41.
    Cmd55,
    /// SD_SEND_OP_COND.
    Acmd41,
    /// READ_OCR, R1 part.
    Cmd58,
    /// OCR power-up and capacity bits.
    Ocr,
    /// SEND_CSD.
    Cmd9,
    /// Data token in front of the CSD.
    CsdToken,
    /// CSD structure version.
    CsdVersion,
    /// READ_SINGLE_BLOCK.
    Cmd17,
    /// Data token in front of a single block.
    BlockToken,
    /// WRITE_BLOCK.
    Cmd24,
    /// Data response to a single block write.
    WriteResponse,
    /// Card programming a single block.
    Program,
    /// READ_MULTIPLE_BLOCK.
    Cmd18,
    /// Data token in front of a streamed block.
    StreamToken,
    /// STOP_TRANSMISSION.
    Cmd12,
    /// WRITE_MULTIPLE_BLOCK.
    Cmd25,
    /// Data response to a streamed block write.
    StreamResponse,
    /// Card programming a streamed block.
    StreamProgram,
    /// Card programming after the stop transfer token.
    StopTran,
    /// Waiting for pending writes to finish.
    Sync,
}

/// [`Sdcard`] result error.
///
/// `T` - transport error type.
/// `S` - select switch type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum Error<T, S> {
    /// Error from the SPI peripheral.
    Transport(T),
    /// Couldn't set a select.
    Select(S),
    /// The card answered with an unexpected R1 or register value.
    Protocol(Step),
    /// The card is not a high-capacity card this driver can handle.
    UnsupportedCard(Step),
    /// Missing or wrong data token, or a rejected data block.
    Framing(Step),
    /// CRC mismatch (card, host).
    CrcMismatch(u16, u16),
    /// The card did not become ready within the configured bound.
    Timeout(Step),
}

impl<T, S> Error<T, S> {
    /// Protocol step that failed, if the error came from the card.
    pub fn step(&self) -> Option<Step> {
        match self {
            Error::Protocol(step)
            | Error::UnsupportedCard(step)
            | Error::Framing(step)
            | Error::Timeout(step) => Some(*step),
            Error::Transport(_) | Error::Select(_) | Error::CrcMismatch(..) => None,
        }
    }
}

/// Driver error for a given SPI bus and chip select.
pub type ErrorFor<Spi, Cs> =
    Error<<Spi as Transfer<u8>>::Error, <Cs as OutputSwitch>::Error>;

/// Builds a command frame: start bits and index, big-endian argument, CRC7
/// and end bit.
pub(crate) fn command_frame(cmd: u8, arg: u32) -> [u8; 6] {
    let mut buf = [cmd, 0, 0, 0, 0, 0];
    buf[1..5].copy_from_slice(&arg.to_be_bytes());
    let crc_index = buf.len() - 1;

    buf[crc_index] = (crc7(&buf[..crc_index]) << 1) | 0x01;
    buf
}

/// SD Card SPI driver.
///
/// `Spi` - SPI.
/// `Cs` - Chip select output switch, `on` asserts the card's select line.
/// `Config` - Config implementation of driver config trait.
///
/// Every operation selects the card, runs its exchange and deselects the
/// card again, on error paths too. The driver assumes exclusive use of the
/// bus for the duration of a call.
pub struct Sdcard<Spi, Cs, Config = DefaultSdcardConfig>
where
    Spi: Transfer<u8>,
    Cs: OutputSwitch,
    Config: SdcardConfig,
{
    spi: RefCell<Spi>,
    cs: RefCell<Cs>,
    config: PhantomData<Config>,
}

impl<Spi, Cs> Sdcard<Spi, Cs, DefaultSdcardConfig>
where
    Spi: Transfer<u8>,
    Cs: OutputSwitch,
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    /// Creates a new [`Sdcard`] with [`DefaultSdcardConfig`].
    ///
    /// `spi` - SPI instance.
    /// `cs` - chip select output switch.
    pub fn new(spi: Spi, cs: Cs) -> Self {
        Self::new_with_config(spi, cs)
    }
}

impl<Spi, Cs, Config> Sdcard<Spi, Cs, Config>
where
    Spi: Transfer<u8>,
    Cs: OutputSwitch,
    Config: SdcardConfig,
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    /// Init sequence value.
    const INIT_SET_VALUE: u8 = 0xFF;
    /// Init sequence size, 80 clocks.
    const INIT_SET_SIZE: usize = 10;
    /// Receive transfer token.
    const RECEIVE_TRANSFER_TOKEN: u8 = 0xFF;

    /// Creates a new [`Sdcard`] using the config given as type parameter.
    pub fn new_with_config(spi: Spi, cs: Cs) -> Self {
        Sdcard {
            spi: RefCell::new(spi),
            cs: RefCell::new(cs),
            config: PhantomData::<Config>,
        }
    }

    /// Releases the SPI instance and the chip select.
    pub fn free(self) -> (Spi, Cs) {
        (self.spi.into_inner(), self.cs.into_inner())
    }

    /// Delay.
    fn delay() {
        for _ in 0..Config::DELAY_DUMMY_CYCLES {
            core::hint::spin_loop();
        }
    }

    /// Activate chip select.
    fn select(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.cs.borrow_mut().on().map_err(Error::Select)
    }

    /// Deactivate chip select.
    ///
    /// Must be called before initializing any other device sharing the bus.
    /// Calling it repeatedly is harmless.
    pub fn unselect(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.cs.borrow_mut().off().map_err(Error::Select)
    }

    /// CS scope. The card is deselected whatever `f` returns; an error from
    /// `f` takes precedence over a failure to deselect.
    pub(crate) fn cs_scope<R, F>(&self, f: F) -> Result<R, ErrorFor<Spi, Cs>>
    where
        F: FnOnce(&Self) -> Result<R, ErrorFor<Spi, Cs>>,
    {
        self.select()?;
        let result = f(self);
        let unselected = self.unselect();

        let value = result?;
        unselected?;
        Ok(value)
    }

    /// Send one byte and receive one byte.
    fn transfer(&self, data: u8) -> Result<u8, ErrorFor<Spi, Cs>> {
        self.spi
            .borrow_mut()
            .transfer(&mut [data])
            .map(|b| b[0])
            .map_err(Error::Transport)
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    fn receive(&self) -> Result<u8, ErrorFor<Spi, Cs>> {
        self.transfer(Self::RECEIVE_TRANSFER_TOKEN)
    }

    /// Send a byte to the SD card.
    pub(crate) fn send(&self, data: u8) -> Result<(), ErrorFor<Spi, Cs>> {
        self.transfer(data).map(|_| ())
    }

    /// Receive a slice from the SD card.
    fn receive_slice(&self, data: &mut [u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        for byte in data.iter_mut() {
            *byte = self.receive()?;
        }

        Ok(())
    }

    /// Send a slice to the SD card.
    fn send_slice(&self, data: &[u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        for byte in data.iter() {
            self.send(*byte)?;
        }

        Ok(())
    }

    /// Skip byte.
    pub(crate) fn skip_byte(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.receive().map(|_| ())
    }

    /// Poll the card until `accept` holds, at most `attempts` bytes.
    fn wait_for_token<F: Fn(u8) -> bool>(
        &self,
        attempts: usize,
        accept: F,
        step: Step,
    ) -> Result<u8, ErrorFor<Spi, Cs>> {
        for _ in 0..attempts {
            let token = self.receive()?;

            if accept(token) {
                return Ok(token);
            }

            Self::delay();
        }

        Err(Error::Timeout(step))
    }

    /// Wait until the card releases the bus (reads `0xFF`).
    pub(crate) fn wait_not_busy(
        &self,
        attempts: usize,
        step: Step,
    ) -> Result<(), ErrorFor<Spi, Cs>> {
        self.wait_for_token(attempts, |token| token == tokens::AVAILABLE, step)
            .map(|_| ())
    }

    /// Read the R1 that follows a command frame.
    fn read_r1(&self, step: Step) -> Result<R1Response, ErrorFor<Spi, Cs>> {
        for _ in 0..Config::READ_R1_ATTEMPTS {
            let r1 = R1Response::from(self.receive()?);

            if r1.is_valid() {
                return Ok(r1);
            }
        }

        Err(Error::Timeout(step))
    }

    /// Send command, return its R1.
    ///
    /// CMD12 is sent without waiting for the bus, as the card is still
    /// streaming, and the stuff byte that follows it is discarded.
    fn send_command(&self, cmd: u8, arg: u32, step: Step) -> Result<R1Response, ErrorFor<Spi, Cs>> {
        if cmd != commands::CMD12 {
            self.wait_not_busy(Config::BUSY_ATTEMPTS, step)?;
        }

        self.send_slice(&command_frame(cmd, arg))?;

        if cmd == commands::CMD12 {
            self.skip_byte()?;
        }

        self.read_r1(step)
    }

    /// Send command and require a specific R1.
    pub(crate) fn command_expect(
        &self,
        cmd: u8,
        arg: u32,
        expected: R1Response,
        step: Step,
    ) -> Result<(), ErrorFor<Spi, Cs>> {
        let r1 = self.send_command(cmd, arg, step)?;

        if r1 != expected {
            warn!(
                "Wrong response from CMD{}: {:?}",
                cmd - commands::CMD_BASE,
                r1
            );
            return Err(Error::Protocol(step));
        }

        Ok(())
    }

    /// Read a data block: start token, payload and CRC.
    pub(crate) fn read_block(&self, data: &mut [u8], step: Step) -> Result<(), ErrorFor<Spi, Cs>> {
        let token = self.wait_for_token(
            Config::DATA_TOKEN_ATTEMPTS,
            |token| token != tokens::AVAILABLE,
            step,
        )?;

        if token != tokens::DATA_START_BLOCK {
            warn!("Unexpected data token: {:#x}", token);
            return Err(Error::Framing(step));
        }

        self.receive_slice(data)?;

        // The CRC is always clocked out, it is junk unless CRC is enabled.
        let mut crc = [0; 2];
        self.receive_slice(&mut crc)?;

        if Config::USE_CRC {
            let card_crc = u16::from_be_bytes(crc);
            let host_crc = crc16(data);

            if card_crc != host_crc {
                return Err(Error::CrcMismatch(card_crc, host_crc));
            }
        }

        Ok(())
    }

    /// Write a data block: start token, payload and CRC, then check the data
    /// response.
    pub(crate) fn write_block(
        &self,
        token: u8,
        data: &[u8],
        step: Step,
    ) -> Result<(), ErrorFor<Spi, Cs>> {
        let crc = if Config::USE_CRC {
            crc16(data).to_be_bytes()
        } else {
            tokens::DUMMY_CRC
        };

        self.send(token)?;
        self.send_slice(data)?;
        self.send_slice(&crc)?;

        let response = self.receive()?;

        if (response & tokens::DATA_RES_MASK) != tokens::DATA_RES_ACCEPTED {
            warn!("Data rejected, response: {:#x}", response);
            Err(Error::Framing(step))
        } else {
            Ok(())
        }
    }

    /// Reset the card into the idle state.
    fn go_idle_state(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        info!("Entering SPI mode");

        self.command_expect(
            commands::CMD0,
            0x0000_0000,
            R1Response::IN_IDLE_STATE,
            Step::Cmd0,
        )
    }

    /// Verify SD Memory Card interface operating condition.
    fn send_if_cond(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        info!("Verifying SD Memory Card interface operating condition");

        let r1 = self.send_command(commands::CMD8, commands::CMD8_ARG, Step::Cmd8)?;

        if r1 != R1Response::IN_IDLE_STATE {
            warn!("CMD8 rejected with {:?}, not an SDHC/SDXC card", r1);
            return Err(Error::UnsupportedCard(Step::Cmd8));
        }

        let mut payload: R7Payload = Default::default();
        self.receive_slice(&mut payload)?;

        let if_cond = IfCond::from(payload);

        if !if_cond.is_accepted() {
            warn!("Interface condition not accepted: {:?}", if_cond);
            return Err(Error::UnsupportedCard(Step::IfCond));
        }

        Ok(())
    }

    /// Enable CRC.
    fn enable_crc(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        info!("Enabling CRC for SD");

        self.command_expect(
            commands::CMD59,
            commands::CMD59_CRC_ON,
            R1Response::IN_IDLE_STATE,
            Step::Cmd59,
        )
    }

    /// Sends host capacity support information and activates the card's
    /// initialization, until the card leaves the idle state.
    fn send_op_cond(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        info!("Sending host capacity support information and activates");

        for _ in 0..Config::INIT_ATTEMPTS {
            self.command_expect(
                commands::CMD55,
                0x0000_0000,
                R1Response::IN_IDLE_STATE,
                Step::Cmd55,
            )?;

            let r1 = self.send_command(commands::ACMD41, commands::ACMD41_HCS, Step::Acmd41)?;

            if r1 == R1Response::READY_STATE {
                return Ok(());
            }

            if r1 != R1Response::IN_IDLE_STATE {
                warn!("Wrong response from ACMD41: {:?}", r1);
                return Err(Error::Protocol(Step::Acmd41));
            }

            Self::delay();
        }

        Err(Error::Timeout(Step::Acmd41))
    }

    /// Read OCR and make sure the card is powered up and high-capacity.
    fn check_capacity_status(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        info!("Checking card capacity status");

        self.command_expect(
            commands::CMD58,
            0x0000_0000,
            R1Response::READY_STATE,
            Step::Cmd58,
        )?;

        let mut payload: R3OcrPayload = Default::default();
        self.receive_slice(&mut payload)?;

        let ocr = Ocr::from(payload);

        if !ocr.power_up_done() {
            warn!("Card power up not complete: {:?}", ocr);
            return Err(Error::Protocol(Step::Ocr));
        }

        if !ocr.card_capacity_status() {
            warn!("Standard capacity card is not supported: {:?}", ocr);
            return Err(Error::UnsupportedCard(Step::Ocr));
        }

        Ok(())
    }

    /// Initialize SD.
    ///
    /// Leaves the card deselected, whether it succeeds or not. May be called
    /// again to retry the whole sequence.
    pub fn init(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        info!("SD initialize started");

        self.unselect()?;

        for _ in 0..Self::INIT_SET_SIZE {
            self.send(Self::INIT_SET_VALUE)?;
        }

        let result = self.cs_scope(|s| {
            s.go_idle_state()?;
            s.send_if_cond()?;

            if Config::USE_CRC {
                s.enable_crc()?;
            }

            s.send_op_cond()?;
            s.check_capacity_status()
        });

        if let Err(err) = &result {
            error!("Failed to initialize SD, step: {:?}", err.step());
        } else {
            info!("SD successfully initialized");
        }

        result
    }

    /// Read the Card Specific Data register.
    pub fn read_csd(&self) -> Result<CsdV2, ErrorFor<Spi, Cs>> {
        let mut csd_data: CsdData = Default::default();

        self.cs_scope(|s| {
            s.command_expect(
                commands::CMD9,
                0x0000_0000,
                R1Response::READY_STATE,
                Step::Cmd9,
            )?;
            s.read_block(&mut csd_data, Step::CsdToken)
        })?;

        let csd = CsdV2::from(csd_data);

        if !csd.is_high_capacity() {
            warn!("Unsupported CSD structure: {}", csd.csd_structure());
            return Err(Error::UnsupportedCard(Step::CsdVersion));
        }

        debug!("CSD: {:?}", csd);
        Ok(csd)
    }

    /// Number of 512-byte blocks on the card.
    pub fn get_blocks_number(&self) -> Result<u64, ErrorFor<Spi, Cs>> {
        self.read_csd().map(|csd| csd.card_capacity_blocks())
    }

    /// Card capacity.
    pub fn capacity(&self) -> Result<Size, ErrorFor<Spi, Cs>> {
        self.read_csd().map(|csd| csd.card_capacity())
    }

    /// Read one block. The buffer content is unspecified on error.
    pub fn read_single_block(&self, block: u32, buf: &mut Block) -> Result<(), ErrorFor<Spi, Cs>> {
        trace!("Read block {}", block);

        self.cs_scope(|s| {
            s.command_expect(commands::CMD17, block, R1Response::READY_STATE, Step::Cmd17)?;
            s.read_block(buf, Step::BlockToken)
        })
    }

    /// Write one block and wait until the card has programmed it.
    pub fn write_single_block(&self, block: u32, buf: &Block) -> Result<(), ErrorFor<Spi, Cs>> {
        trace!("Write block {}", block);

        self.cs_scope(|s| {
            s.command_expect(commands::CMD24, block, R1Response::READY_STATE, Step::Cmd24)?;
            s.write_block(tokens::DATA_START_BLOCK, buf, Step::WriteResponse)?;
            s.wait_not_busy(Config::PROGRAM_ATTEMPTS, Step::Program)
        })
    }

    /// Start a multi-block read at `block`.
    ///
    /// The returned session borrows the driver until it is closed with
    /// [`ReadSession::read_end`].
    pub fn read_begin(
        &mut self,
        block: u32,
    ) -> Result<ReadSession<'_, Spi, Cs, Config>, ErrorFor<Spi, Cs>> {
        debug!("Read stream begin at block {}", block);

        self.cs_scope(|s| {
            s.command_expect(commands::CMD18, block, R1Response::READY_STATE, Step::Cmd18)
        })?;

        Ok(ReadSession::new(self))
    }

    /// Start a multi-block write at `block`.
    ///
    /// The returned session borrows the driver until it is closed with
    /// [`WriteSession::write_end`].
    pub fn write_begin(
        &mut self,
        block: u32,
    ) -> Result<WriteSession<'_, Spi, Cs, Config>, ErrorFor<Spi, Cs>> {
        debug!("Write stream begin at block {}", block);

        self.cs_scope(|s| {
            s.command_expect(commands::CMD25, block, R1Response::READY_STATE, Step::Cmd25)
        })?;

        Ok(WriteSession::new(self))
    }

    /// Wait until the card has finished any pending write.
    pub fn sync(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.cs_scope(|s| s.wait_not_busy(Config::PROGRAM_ATTEMPTS, Step::Sync))
    }
}
