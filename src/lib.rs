//! # embedded-sdfat
//!
//! > A byte-level SD/MMC driver and a streaming FAT32 layer for Embedded Rust
//!
//! This crate reads and creates files on a FAT32 formatted SD card from a
//! microcontroller with only a few KB of RAM to spare. It is `#![no_std]`,
//! never allocates, and keeps all state that survives between calls in
//! values owned by the caller.
//!
//! ## Using the crate
//!
//! You will need something that implements the `BlockDevice` trait, which can
//! read and write the 512-byte blocks (or sectors) of your card. We supply
//! [`SdMmcSpi`], which talks to legacy (non-SDHC) SD and MMC cards over SPI,
//! and [`MemoryBlockDevice`], which serves a disk image held in a byte slice.
//!
//! ```rust,ignore
//! let spi_dev = embedded_sdfat::SdMmcSpi::new(sdmmc_spi, sdmmc_cs);
//! let mut card = match spi_dev.acquire() {
//!     Ok(card) => card,
//!     Err((e, _spi_dev)) => return status_line(e.message()),
//! };
//! let volume = embedded_sdfat::fat::Volume::mount(&mut card)?;
//! let file = volume.open_file(&mut card, "RAINBOW.ANI")?;
//!
//! let mut buffer = [0u8; 2048];
//! let mut cursor = None;
//! loop {
//!     let (outcome, next) = volume.read_stream(&mut card, &file, cursor, &mut buffer)?;
//!     match outcome {
//!         StreamOutcome::BufferFull => {
//!             renderer.feed(&buffer);
//!             cursor = Some(next);
//!         }
//!         StreamOutcome::Complete { filled } => {
//!             renderer.feed(&buffer[..filled]);
//!             break;
//!         }
//!     }
//! }
//! ```
//!
//! ## Features
//!
//! * `log` (default): log through the `log` facade.
//! * `defmt-log`: by turning off the default features and enabling the
//! `defmt-log` feature you can configure this crate to log messages over
//! defmt instead.
//!
//! With neither feature enabled the logging macros compile to nothing.

#![cfg_attr(not(test), no_std)]
// #![deny(missing_docs)]

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

#[cfg(all(feature = "log", feature = "defmt-log"))]
compile_error!("The `log` and `defmt-log` features are mutually exclusive");

#[cfg(feature = "log")]
pub(crate) use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
pub(crate) use defmt::{debug, trace, warn};

#[cfg(not(any(feature = "log", feature = "defmt-log")))]
macro_rules! debug {
    ($($arg:expr),+ $(,)?) => {{
        $(let _ = &$arg;)+
    }};
}
#[cfg(not(any(feature = "log", feature = "defmt-log")))]
macro_rules! trace {
    ($($arg:expr),+ $(,)?) => {{
        $(let _ = &$arg;)+
    }};
}
#[cfg(not(any(feature = "log", feature = "defmt-log")))]
macro_rules! warn {
    ($($arg:expr),+ $(,)?) => {{
        $(let _ = &$arg;)+
    }};
}
#[cfg(not(any(feature = "log", feature = "defmt-log")))]
pub(crate) use debug;
#[cfg(not(any(feature = "log", feature = "defmt-log")))]
pub(crate) use trace;
#[cfg(not(any(feature = "log", feature = "defmt-log")))]
pub(crate) use warn;

#[macro_use]
mod structure;

pub mod block_device;
pub mod bus;
pub mod fat;
pub mod sdmmc;

pub use crate::block_device::{Block, BlockCount, BlockDevice, BlockIdx, MemoryBlockDevice};
pub use crate::bus::{BusGuard, BusLock, NoBusLock};
pub use crate::sdmmc::SdMmcSpi;

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// Everything that can go wrong, from the SPI wire up to the directory.
///
/// Filesystem operations hand device errors through untouched. The menu
/// layer shows [`Error::message`] for whatever stopped the operation.
/// Nothing in this crate retries.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// The SPI peripheral reported an error
    Transport,
    /// Couldn't drive the chip select pin
    Gpio,
    /// The card stayed busy for the whole polling budget
    BusyTimeout,
    /// The card didn't answer GO_IDLE_STATE with the idle state
    ResetFailed,
    /// The card never left the idle state during SEND_OP_COND
    InitTimeout,
    /// The card rejected a read or write command
    CommandRejected,
    /// The data start token never arrived
    ReadTokenMissing,
    /// The card's data response didn't accept the block we wrote
    WriteRejected,
    /// The card rejected ERASE_WR_BLK_START_ADDR
    EraseStartRejected,
    /// The card rejected ERASE_WR_BLK_END_ADDR
    EraseEndRejected,
    /// The card rejected ERASE
    EraseRejected,
    /// The card rejected SEND_CSD
    CsdReadFailed,
    /// The caller's buffer can't hold the requested sectors
    BufferTooSmall,
    /// The block lies beyond the device
    OutOfRange,
    /// Sector 0 doesn't carry the "FAT32" marker
    NotFat32,
    /// Sector 0 doesn't end in the 0xAA55 boot signature
    BadSignature,
    /// The BPB describes a geometry we can't address
    InvalidBpb,
    /// The name has no 8.3 form
    InvalidFileName,
    /// No directory entry carries that name
    FileNotFound,
    /// A directory entry with that name already exists
    FileExists,
    /// Not enough free clusters
    CardFull,
    /// A cluster chain links outside the data region or loops
    CorruptChain,
}

impl Error {
    /// A short status line for the menu display.
    pub fn message(&self) -> &'static str {
        match self {
            Error::Transport => "SPI error",
            Error::Gpio => "CS pin error",
            Error::BusyTimeout => "Card busy",
            Error::ResetFailed => "No card",
            Error::InitTimeout => "Card init fail",
            Error::CommandRejected => "Cmd rejected",
            Error::ReadTokenMissing => "Read failed",
            Error::WriteRejected => "Write failed",
            Error::EraseStartRejected => "Erase start fail",
            Error::EraseEndRejected => "Erase end fail",
            Error::EraseRejected => "Erase failed",
            Error::CsdReadFailed => "CSD read fail",
            Error::BufferTooSmall => "Buffer too small",
            Error::OutOfRange => "Bad sector",
            Error::NotFat32 => "Not FAT32",
            Error::BadSignature => "Bad boot sector",
            Error::InvalidBpb => "Bad geometry",
            Error::InvalidFileName => "Bad file name",
            Error::FileNotFound => "File not found",
            Error::FileExists => "File exists",
            Error::CardFull => "Card full",
            Error::CorruptChain => "FAT corrupt",
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.message())
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
