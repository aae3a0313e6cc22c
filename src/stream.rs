use crate::{
    config::SdcardConfig,
    consts::{commands, tokens},
    debug, Block, ErrorFor, R1Response, Sdcard, Step,
};

use core::fmt::Debug;
use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

/// Open multi-block read, started with [`Sdcard::read_begin`].
///
/// Blocks are delivered in address order. The card keeps streaming until
/// [`ReadSession::read_end`] is called; dropping the session without it
/// leaves the card mid-transfer.
#[must_use = "a read stream must be closed with `read_end`"]
pub struct ReadSession<'a, Spi, Cs, Config>
where
    Spi: Transfer<u8>,
    Cs: OutputSwitch,
    Config: SdcardConfig,
{
    card: &'a mut Sdcard<Spi, Cs, Config>,
}

impl<'a, Spi, Cs, Config> ReadSession<'a, Spi, Cs, Config>
where
    Spi: Transfer<u8>,
    Cs: OutputSwitch,
    Config: SdcardConfig,
    Spi::Error: Debug,
    Cs::Error: Debug,
{
    pub(crate) fn new(card: &'a mut Sdcard<Spi, Cs, Config>) -> Self {
        ReadSession { card }
    }

    /// Read the next block of the stream.
    pub fn read_data(&mut self, buf: &mut Block) -> Result<(), ErrorFor<Spi, Cs>> {
        self.card.cs_scope(|s| s.read_block(buf, Step::StreamToken))
    }

    /// Stop the stream with STOP_TRANSMISSION.
    pub fn read_end(self) -> Result<(), ErrorFor<Spi, Cs>> {
        debug!("Read stream end");

        self.card.cs_scope(|s| {
            s.command_expect(commands::CMD12, 0x0000_0000, R1Response::READY_STATE, Step::Cmd12)
        })
    }
}

/// Open multi-block write, started with [`Sdcard::write_begin`].
///
/// Each [`WriteSession::write_data`] lands on the next block address.
/// [`WriteSession::write_end`] must be called to finish programming.
#[must_use = "a write stream must be closed with `write_end`"]
pub struct WriteSession<'a, Spi, Cs, Config>
where
    Spi: Transfer<u8>,
    Cs: OutputSwitch,
    Config: SdcardConfig,
{
    card: &'a mut Sdcard<Spi, Cs, Config>,
}

impl<'a, Spi, Cs, Config> WriteSession<'a, Spi, Cs, Config>
where
    Spi: Transfer<u8>,
    Cs: OutputSwitch,
    Config: SdcardConfig,
    Spi::Error: Debug,
    Cs::Error: Debug,
{
    pub(crate) fn new(card: &'a mut Sdcard<Spi, Cs, Config>) -> Self {
        WriteSession { card }
    }

    /// Write the next block of the stream and wait until it is programmed.
    pub fn write_data(&mut self, buf: &Block) -> Result<(), ErrorFor<Spi, Cs>> {
        self.card.cs_scope(|s| {
            s.write_block(tokens::WRITE_MULTIPLE, buf, Step::StreamResponse)?;
            s.wait_not_busy(Config::PROGRAM_ATTEMPTS, Step::StreamProgram)
        })
    }

    /// Send the stop transfer token and wait for the card to finish.
    pub fn write_end(self) -> Result<(), ErrorFor<Spi, Cs>> {
        debug!("Write stream end");

        self.card.cs_scope(|s| {
            s.send(tokens::STOP_TRAN)?;
            s.skip_byte()?;
            s.wait_not_busy(Config::PROGRAM_ATTEMPTS, Step::StopTran)
        })
    }
}
