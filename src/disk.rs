use crate::{
    config::{DefaultSdcardConfig, SdcardConfig},
    consts::{BLOCK_SIZE, ERASE_BLOCK_SIZE},
    error, info, trace, warn, Block, ErrorFor, Sdcard,
};

use core::{cell::Cell, fmt::Debug};
use diskio::{DiskioDevice, Error as DiskioError, IoctlCmd, Lba, Status, StatusFlag};
use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

/// Generic I/O failure reported to the filesystem layer. The detailed
/// driver error is logged before it is collapsed into this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct DiskFault;

/// Sector-oriented view of an [`Sdcard`] for a FAT filesystem layer.
///
/// Sectors are transferred one at a time with the single-block commands.
pub struct SdDisk<Spi, Cs, Config = DefaultSdcardConfig>
where
    Spi: Transfer<u8>,
    Cs: OutputSwitch,
    Config: SdcardConfig,
{
    card: Sdcard<Spi, Cs, Config>,
    status: Cell<Status>,
}

impl<Spi, Cs, Config> SdDisk<Spi, Cs, Config>
where
    Spi: Transfer<u8>,
    Cs: OutputSwitch,
    Config: SdcardConfig,
    Spi::Error: Debug,
    Cs::Error: Debug,
{
    /// Wraps a card. The disk starts uninitialized.
    pub fn new(card: Sdcard<Spi, Cs, Config>) -> Self {
        SdDisk {
            card,
            status: Cell::new(StatusFlag::NotInitialized.into()),
        }
    }

    /// Underlying driver.
    pub fn card(&self) -> &Sdcard<Spi, Cs, Config> {
        &self.card
    }

    /// Releases the driver.
    pub fn into_inner(self) -> Sdcard<Spi, Cs, Config> {
        self.card
    }

    /// Validate buffer for read/write, returns the count of blocks in it.
    fn validate_buffer_len(buf_len: usize) -> Result<usize, DiskioError<DiskFault>> {
        if buf_len == 0 || buf_len % BLOCK_SIZE != 0 {
            error!(
                "SD invalid buffer, length: {}, block size: {}",
                buf_len, BLOCK_SIZE
            );
            Err(DiskioError::InvalidArgument)
        } else {
            Ok(buf_len / BLOCK_SIZE)
        }
    }

    /// Validate initialized.
    fn validate_initialized(&self) -> Result<(), DiskioError<DiskFault>> {
        if self.status.get().contains(StatusFlag::NotInitialized) {
            Err(DiskioError::NotInitialized)
        } else {
            Ok(())
        }
    }

    /// Block address of the `index`-th sector after `lba`.
    fn block_address(lba: Lba, index: usize) -> Result<u32, DiskioError<DiskFault>> {
        let first = u32::try_from(lba).map_err(|_| DiskioError::InvalidArgument)?;
        let offset = u32::try_from(index).map_err(|_| DiskioError::InvalidArgument)?;

        first.checked_add(offset).ok_or_else(|| {
            error!("SD block address out of range, first: {}, offset: {}", first, offset);
            DiskioError::InvalidArgument
        })
    }

    /// Log a driver error, flag the disk and collapse the error.
    fn fault(&self, err: ErrorFor<Spi, Cs>) -> DiskioError<DiskFault> {
        if let Some(step) = err.step() {
            error!("SD transfer failed at {:?}", step);
        } else {
            error!("SD bus failure");
        }

        self.status.set(StatusFlag::ErrorOccured.into());
        DiskioError::Hardware(DiskFault)
    }
}

impl<Spi, Cs, Config> DiskioDevice for SdDisk<Spi, Cs, Config>
where
    Spi: Transfer<u8>,
    Cs: OutputSwitch,
    Config: SdcardConfig,
    Spi::Error: Debug,
    Cs::Error: Debug,
{
    type HardwareError = DiskFault;

    fn status(&self) -> Status {
        self.status.get()
    }

    fn reset(&mut self) {
        info!("SD reset invoked");
        self.status.set(StatusFlag::NotInitialized.into());
    }

    fn initialize(&mut self) -> Result<(), DiskioError<Self::HardwareError>> {
        if !self.status.get().contains(StatusFlag::NotInitialized) {
            warn!("SD already is initialized");
            return Err(DiskioError::AlreadyInitialized);
        }

        match self.card.init() {
            Ok(()) => {
                self.status.set(Status::default());
                Ok(())
            }
            Err(err) => {
                self.fault(err);
                self.status
                    .set(StatusFlag::ErrorOccured | StatusFlag::NotInitialized);
                Err(DiskioError::Hardware(DiskFault))
            }
        }
    }

    fn read(&self, buf: &mut [u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        let block_count = Self::validate_buffer_len(buf.len())?;
        self.validate_initialized()?;
        Self::block_address(lba, block_count - 1)?;

        for (index, chunk) in buf.chunks_exact_mut(BLOCK_SIZE).enumerate() {
            let block = Self::block_address(lba, index)?;
            let chunk: &mut Block = chunk
                .try_into()
                .map_err(|_| DiskioError::InvalidArgument)?;

            trace!("SD read sector {}", block);
            self.card
                .read_single_block(block, chunk)
                .map_err(|err| self.fault(err))?;
        }

        Ok(())
    }

    fn write(&self, buf: &[u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        let block_count = Self::validate_buffer_len(buf.len())?;
        self.validate_initialized()?;
        Self::block_address(lba, block_count - 1)?;

        for (index, chunk) in buf.chunks_exact(BLOCK_SIZE).enumerate() {
            let block = Self::block_address(lba, index)?;
            let chunk: &Block = chunk
                .try_into()
                .map_err(|_| DiskioError::InvalidArgument)?;

            trace!("SD write sector {}", block);
            self.card
                .write_single_block(block, chunk)
                .map_err(|err| self.fault(err))?;
        }

        Ok(())
    }

    fn ioctl(&self, cmd: IoctlCmd) -> Result<(), DiskioError<Self::HardwareError>> {
        match cmd {
            IoctlCmd::CtrlSync => {
                self.validate_initialized()?;
                self.card.sync().map_err(|err| self.fault(err))
            }
            IoctlCmd::GetSectorCount(count) => {
                self.validate_initialized()?;
                let blocks = self
                    .card
                    .get_blocks_number()
                    .map_err(|err| self.fault(err))?;
                *count = blocks
                    .try_into()
                    .map_err(|_| DiskioError::InvalidArgument)?;
                Ok(())
            }
            IoctlCmd::GetSectorSize(size) => {
                *size = BLOCK_SIZE
                    .try_into()
                    .map_err(|_| DiskioError::InvalidArgument)?;
                Ok(())
            }
            IoctlCmd::GetBlockSize(block_size) => {
                *block_size = ERASE_BLOCK_SIZE;
                Ok(())
            }
            _ => Err(DiskioError::NotSupported),
        }
    }
}
