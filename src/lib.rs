//! SD/SDHC/SDXC block device driver written in Embedded Rust, that inspired by [embedded-sdmmc](https://crates.io/crates/embedded-sdmmc).
//!
//! This crate is intended to allow you to init/read/write SD cards by SPI bus
//! and to hand them to a filesystem as a device of fixed-size 512-byte blocks.
//!
//! ## Features
//!
//! * `log` (default): log through the [`log`](https://crates.io/crates/log) facade.
//! * `defmt-log`: turn off the default features and enable this one to log
//!   over defmt instead.
//!
//! With neither feature the driver is silent.

#![cfg_attr(not(test), no_std)]

mod bus;
mod command;
mod config;
mod consts;
mod crc;
mod csd;
mod init;
mod response;
mod transfer;

#[cfg(test)]
mod sim;

pub use crate::{
    bus::{BusClock, ErrorFor},
    command::CommandFrame,
    config::{DefaultSdCardConfig, SdCardConfig},
    consts::BLOCK_SIZE,
    csd::{CapacityProvider, Csd, CsdData, CsdV1, CsdV2},
    response::R1Response,
};
pub use diskio::{
    BlockSize, DiskioDevice, Error as DiskioError, IoctlCmd, Lba, Status, StatusFlag,
};
pub use size::Size;

use crate::{
    bus::Bus,
    consts::BLOCK_SIZE_U64,
    init::Session,
};

#[cfg(all(feature = "log", feature = "defmt-log"))]
compile_error!("Features `log` and `defmt-log` are mutually exclusive");

#[allow(unused_imports)]
#[cfg(feature = "defmt-log")]
use defmt::{debug, error, info, trace, warn};
#[allow(unused_imports)]
#[cfg(feature = "log")]
use log::{debug, error, info, trace, warn};

#[cfg(not(any(feature = "log", feature = "defmt-log")))]
mod silent {
    macro_rules! silent {
        ($fmt:expr $(, $arg:expr)* $(,)?) => {{
            $(let _ = &$arg;)*
        }};
    }

    pub(crate) use silent as debug;
    pub(crate) use silent as error;
    pub(crate) use silent as info;
    pub(crate) use silent as trace;
    pub(crate) use silent as warn;
}
#[allow(unused_imports)]
#[cfg(not(any(feature = "log", feature = "defmt-log")))]
use silent::{debug, error, info, trace, warn};

use embedded_hal::blocking::delay::DelayMs;
use switch_hal::OutputSwitch;

/// [`SdCard`] result error.
///
/// `T` - transport error type.
/// `S` - select switch type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error<T, S> {
    /// Error from the SPI peripheral.
    Transport(T),
    /// Couldn't set a select.
    SelectError(S),
    /// The card never answered GO_IDLE_STATE with the idle flag alone.
    NoCard,
    /// Unrecognized SEND_IF_COND status, the card is neither version 1 nor 2.
    UnsupportedCard(u8),
    /// Unrecognized `CSD_STRUCTURE` value.
    UnsupportedCsd(u8),
    /// The card didn't leave the idle state during ACMD41 negotiation.
    InitTimeout(CardVersion),
    /// SET_BLOCKLEN was rejected, with the status byte.
    BlockLengthError(u8),
    /// SEND_CSD was rejected, with the status byte.
    RegisterReadError(u8),
    /// No response when executing this command.
    TimeoutCommand(u8),
    /// Command error: command index and status byte.
    ErrorCommand(u8, u8),
    /// No data start token when reading data from the card.
    TimeoutReadBuffer,
    /// The card stayed busy after a write.
    TimeoutWaitAvailable,
    /// Data error token instead of a data start token.
    ReadError(u8),
    /// Data response other than "accepted" after a written block.
    WriteError(u8),
    /// Buffer length is not a positive multiple of the block size, or the
    /// blocks lie outside the card.
    InvalidArgument,
    /// The card was reset and has to be initialized again.
    BadState,
}

/// Card generation, resolved once by SEND_IF_COND.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum CardVersion {
    /// Standard capacity card, addressed in bytes.
    V1,
    /// High or extended capacity card, addressed in blocks.
    V2,
}

impl CardVersion {
    /// Multiplier from a block index to a command address.
    pub const fn address_multiplier(self) -> u32 {
        match self {
            CardVersion::V1 => BLOCK_SIZE as u32,
            CardVersion::V2 => 1,
        }
    }

    /// Command address of `block`, `None` if it can't be addressed.
    pub fn block_address(self, block: u32) -> Option<u32> {
        block.checked_mul(self.address_multiplier())
    }
}

/// Operations of [`SdCard::control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum ControlOp {
    /// Number of blocks on the card.
    SectorCount,
    /// Size of one block in bytes.
    BlockSize,
    /// Wait until the card finished programming.
    Sync,
}

/// SD Card SPI driver.
///
/// `Spi` - SPI.
/// `Cs` - Chip select output switch.
/// `Delay` - Millisecond delay used during initialization.
/// `Config` - Config implementation of driver config trait.
///
/// The driver owns the bus. Every method runs to completion on the calling
/// thread and the type is not `Sync`, so one card is never driven from two
/// places at once.
pub struct SdCard<Spi, Cs, Delay, Config = DefaultSdCardConfig> {
    bus: Bus<Spi, Cs, Config>,
    delay: Delay,
    session: Session,
    status: Status,
}

impl<Spi, Cs, Delay> SdCard<Spi, Cs, Delay, DefaultSdCardConfig>
where
    Spi: BusClock,
    Cs: OutputSwitch,
    Delay: DelayMs<u32>,
{
    /// Creates a new [`SdCard`] and initializes the card.
    ///
    /// `spi` - SPI instance.
    /// `cs` - chip select output switch.
    /// `delay` - delay provider.
    pub fn new(spi: Spi, cs: Cs, delay: Delay) -> Result<Self, ErrorFor<Spi, Cs>> {
        Self::new_with_config(spi, cs, delay)
    }
}

impl<Spi, Cs, Delay, Config> SdCard<Spi, Cs, Delay, Config>
where
    Spi: BusClock,
    Cs: OutputSwitch,
    Delay: DelayMs<u32>,
    Config: SdCardConfig,
{
    /// Same as [`SdCard::new`] with a custom config.
    pub fn new_with_config(spi: Spi, cs: Cs, mut delay: Delay) -> Result<Self, ErrorFor<Spi, Cs>> {
        let bus = Bus::new(spi, cs);
        let session = bus.initialize(&mut delay)?;

        Ok(SdCard {
            bus,
            delay,
            session,
            status: Status::default(),
        })
    }

    /// Gives back the SPI, chip select and delay.
    pub fn release(self) -> (Spi, Cs, Delay) {
        let (spi, cs) = self.bus.into_inner();
        (spi, cs, self.delay)
    }

    /// Number of blocks on the card.
    pub fn block_count(&self) -> u64 {
        self.session.sectors
    }

    /// Size of one block in bytes, always [`BLOCK_SIZE`].
    pub fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    /// Card generation found by the initialization.
    pub fn version(&self) -> CardVersion {
        self.session.version
    }

    /// Card capacity in bytes.
    pub fn capacity(&self) -> Size {
        Size::from_bytes(self.session.sectors * BLOCK_SIZE_U64)
    }

    /// Current bus clock in Hz.
    pub fn clock_rate(&self) -> u32 {
        self.bus.clock_rate()
    }

    /// Validate initialized.
    fn validate_initialized(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        if self.status.contains(StatusFlag::NotInitialized) {
            Err(Error::BadState)
        } else {
            Ok(())
        }
    }

    /// Validate buffer for read/write and return the command address.
    fn address_for(&self, start_block: u64, buf_len: usize) -> Result<u32, ErrorFor<Spi, Cs>> {
        self.validate_initialized()?;

        if buf_len == 0 || buf_len % BLOCK_SIZE != 0 {
            error!(
                "SD invalid buffer, length: {}, block size: {}",
                buf_len, BLOCK_SIZE
            );
            return Err(Error::InvalidArgument);
        }

        let block_count = (buf_len / BLOCK_SIZE) as u64;
        let in_range = start_block
            .checked_add(block_count)
            .map_or(false, |end| end <= self.session.sectors);
        if !in_range {
            error!(
                "SD blocks out of range, start: {}, count: {}, card blocks: {}",
                start_block, block_count, self.session.sectors
            );
            return Err(Error::InvalidArgument);
        }

        u32::try_from(start_block)
            .ok()
            .and_then(|block| self.session.version.block_address(block))
            .ok_or(Error::InvalidArgument)
    }

    /// Reads `buf.len() / 512` blocks starting at `start_block`.
    pub fn read_blocks(&self, start_block: u64, buf: &mut [u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        let address = self.address_for(start_block, buf.len())?;
        self.bus.read_blocks(address, buf)
    }

    /// Writes `buf.len() / 512` blocks starting at `start_block`.
    pub fn write_blocks(&self, start_block: u64, buf: &[u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        let address = self.address_for(start_block, buf.len())?;
        self.bus.write_blocks(address, buf)
    }

    /// Device control for the filesystem layer.
    pub fn control(&self, op: ControlOp) -> Result<Option<u64>, ErrorFor<Spi, Cs>> {
        match op {
            ControlOp::SectorCount => Ok(Some(self.block_count())),
            ControlOp::BlockSize => Ok(Some(BLOCK_SIZE_U64)),
            ControlOp::Sync => {
                self.validate_initialized()?;
                self.bus.cs_scope(|bus| bus.wait_not_busy()).map(|_| None)
            }
        }
    }

    /// Runs the initialization again, e.g. after the card was swapped.
    pub fn reinitialize(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        match self.bus.initialize(&mut self.delay) {
            Ok(session) => {
                self.session = session;
                self.status = Status::default();
                Ok(())
            }
            Err(err) => {
                self.status = StatusFlag::ErrorOccured | StatusFlag::NotInitialized;
                Err(err)
            }
        }
    }
}

/// Diskio error for a driver error.
fn diskio_error<T, S>(err: Error<T, S>) -> DiskioError<Error<T, S>> {
    match err {
        Error::InvalidArgument => DiskioError::InvalidArgument,
        Error::BadState => DiskioError::NotInitialized,
        err => DiskioError::Hardware(err),
    }
}

impl<Spi, Cs, Delay, Config> DiskioDevice for SdCard<Spi, Cs, Delay, Config>
where
    Spi: BusClock,
    Cs: OutputSwitch,
    Delay: DelayMs<u32>,
    Config: SdCardConfig,
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    type HardwareError = ErrorFor<Spi, Cs>;

    fn status(&self) -> Status {
        self.status
    }

    fn reset(&mut self) {
        info!("SD reset invoked");
        self.status = StatusFlag::NotInitialized.into();
    }

    fn initialize(&mut self) -> Result<(), DiskioError<Self::HardwareError>> {
        if !self.status.contains(StatusFlag::NotInitialized) {
            warn!("SD already is initialized");
            return Err(DiskioError::AlreadyInitialized);
        }

        self.reinitialize().map_err(diskio_error)
    }

    fn read(&self, buf: &mut [u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        self.read_blocks(lba, buf).map_err(diskio_error)
    }

    fn write(&self, buf: &[u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        self.write_blocks(lba, buf).map_err(diskio_error)
    }

    fn ioctl(&self, cmd: IoctlCmd) -> Result<(), DiskioError<Self::HardwareError>> {
        match cmd {
            IoctlCmd::CtrlSync => self
                .control(ControlOp::Sync)
                .map(|_| ())
                .map_err(diskio_error),
            IoctlCmd::GetSectorCount(count) => {
                self.validate_initialized().map_err(diskio_error)?;
                *count = self.block_count();
                Ok(())
            }
            IoctlCmd::GetSectorSize(size) => {
                *size = BLOCK_SIZE;
                Ok(())
            }
            IoctlCmd::GetBlockSize(block_size) => {
                *block_size = BLOCK_SIZE;
                Ok(())
            }
            _ => Err(DiskioError::NotSupported),
        }
    }
}
