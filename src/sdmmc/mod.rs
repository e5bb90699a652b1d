//! embedded-sdfat - SDMMC Protocol
//!
//! Implements the legacy SD/MMC protocol on some generic SPI interface.
//! Cards are initialized with CMD0 and CMD1 only and are addressed in bytes,
//! so high capacity (SDHC) cards are not supported.
//!
//! This is currently optimised for readability and debugability, not
//! performance.

mod busy;
pub mod proto;
#[cfg(test)]
mod test;

use busy::SdMmcSpiBusy;
use proto::*;

use crate::block_device::{Block, BlockCount, BlockDevice, BlockIdx};
use crate::bus::{BusGuard, BusLock, NoBusLock};
use crate::{debug, trace, warn, Error};

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

/// How many bytes we clock while waiting for an R1 response.
pub const RESPONSE_POLL_LIMIT: u32 = 512;
/// How many bytes we clock while the card holds the line low.
pub const BUSY_POLL_LIMIT: u32 = 32_000;
/// How many bytes we clock while waiting for a data start token.
pub const TOKEN_POLL_LIMIT: u32 = 32_000;
/// How many times SEND_OP_COND is sent before we give up on the card.
pub const INIT_ATTEMPTS: u32 = 10_000;
/// Idle bytes clocked with CS high to put the card into SPI mode. Ten bytes
/// are 80 clocks, the card needs at least 74.
pub const IDLE_CLOCK_BYTES: usize = 10;

/// Represents an SD Card interface built from an SPI peripheral, a Chip
/// Select pin and a lock on the shared bus. We need Chip Select to be
/// separate so we can clock out some bytes without Chip Select asserted
/// (which puts the card into SPI mode).
pub struct SdMmcSpi<SPI, CS, L, State>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    L: BusLock,
{
    spi: SPI,
    cs: CS,
    lock: L,
    state: State,
}

/// The state of an SdMmcSpi if it is not initialized
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug)]
pub struct NotInit;

/// The state of an SdMmcSpi if it is initialized
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug)]
pub struct Initialized;

/// A bounded number of polls. Every wait in the driver spends from one of
/// these and fails with the given error once it runs dry.
struct PollBudget(u32);

impl PollBudget {
    fn new(limit: u32) -> PollBudget {
        PollBudget(limit)
    }

    fn spend(&mut self, err: Error) -> Result<(), Error> {
        if self.0 == 0 {
            Err(err)
        } else {
            self.0 -= 1;
            Ok(())
        }
    }
}

/// Send one byte and receive one byte.
fn transfer<SPI>(spi: &mut SPI, out: u8) -> Result<u8, Error>
where
    SPI: Transfer<u8>,
{
    spi.transfer(&mut [out])
        .map(|b| b[0])
        .map_err(|_e| Error::Transport)
}

/// Legacy cards take a byte address.
fn block_address(block_idx: BlockIdx) -> Result<u32, Error> {
    block_idx
        .0
        .checked_mul(Block::LEN_U32)
        .ok_or(Error::OutOfRange)
}

impl<SPI, CS> SdMmcSpi<SPI, CS, NoBusLock, NotInit>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    /// Create a new SD/MMC controller using a raw SPI interface that nothing
    /// else uses.
    pub fn new(spi: SPI, cs: CS) -> Self {
        Self::with_bus_lock(spi, cs, NoBusLock)
    }
}

impl<SPI, CS, L, State> SdMmcSpi<SPI, CS, L, State>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    L: BusLock,
{
    /// Give back the SPI interface, the chip select pin and the lock.
    pub fn free(self) -> (SPI, CS, L) {
        (self.spi, self.cs, self.lock)
    }

    fn into_state<S>(self, state: S) -> SdMmcSpi<SPI, CS, L, S> {
        SdMmcSpi {
            spi: self.spi,
            cs: self.cs,
            lock: self.lock,
            state,
        }
    }

    /// Run `f` with the bus locked, then clock one idle byte. The idle byte
    /// is clocked even when `f` fails; the first error wins.
    fn with_bus<F, R>(&mut self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut SPI, &mut CS) -> Result<R, Error>,
    {
        let _bus = BusGuard::acquire(&mut self.lock);
        let result = f(&mut self.spi, &mut self.cs);
        let trailing = transfer(&mut self.spi, IDLE_BYTE);
        let value = result?;
        trailing?;
        Ok(value)
    }

    /// Run a command with chip select asserted.
    ///
    /// Chip select is always deasserted, even if an error occured in `f`
    fn with_chip_select<F, R>(&mut self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut SdMmcSpiBusy<SPI, CS>) -> Result<R, Error>,
    {
        self.with_bus(|spi, cs| {
            let mut card = SdMmcSpiBusy::new(spi, cs)?;
            f(&mut card)
        })
    }
}

impl<SPI, CS, L> SdMmcSpi<SPI, CS, L, NotInit>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    L: BusLock,
{
    /// Create a new SD/MMC controller on an SPI bus shared with other
    /// devices. `lock` is held for the whole of every card operation.
    pub fn with_bus_lock(spi: SPI, cs: CS, lock: L) -> Self {
        SdMmcSpi {
            spi,
            cs,
            lock,
            state: NotInit,
        }
    }

    /// Put the card into SPI mode and send it to the idle state.
    pub fn reset(&mut self) -> Result<(), Error> {
        trace!("Reset card..");
        self.with_bus(|spi, cs| {
            // Supply minimum of 74 clock cycles without CS asserted.
            cs.set_high().map_err(|_| Error::Gpio)?;
            for _ in 0..IDLE_CLOCK_BYTES {
                transfer(spi, IDLE_BYTE)?;
            }
            let mut card = SdMmcSpiBusy::new(spi, cs)?;
            card.card_command(CMD0, 0, R1_IDLE_STATE, Error::ResetFailed)
        })
    }

    /// Bring a reset card out of the idle state.
    pub fn initialize(mut self) -> Result<SdMmcSpi<SPI, CS, L, Initialized>, (Error, Self)> {
        let result = self.with_chip_select(|card| {
            let mut budget = PollBudget::new(INIT_ATTEMPTS);
            loop {
                let r1 = card.command(CMD1, 0, Error::InitTimeout)?;
                if r1 == R1_READY_STATE {
                    return Ok(());
                }
                budget.spend(Error::InitTimeout)?;
            }
        });
        match result {
            Ok(()) => {
                debug!("Card initialized");
                Ok(self.into_state(Initialized))
            }
            Err(e) => {
                warn!("Card init failed: {:?}", e);
                Err((e, self))
            }
        }
    }

    /// Initializes the card into a known state
    pub fn acquire(mut self) -> Result<SdMmcSpi<SPI, CS, L, Initialized>, (Error, Self)> {
        debug!("Acquiring card");
        if let Err(e) = self.reset() {
            warn!("Card reset failed: {:?}", e);
            return Err((e, self));
        }
        self.initialize()
    }
}

impl<SPI, CS, L> SdMmcSpi<SPI, CS, L, Initialized>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    L: BusLock,
{
    /// Mark the card as unused.
    /// This should be kept infallible, because Drop is unable to fail.
    /// See https://github.com/rust-lang/rfcs/issues/814
    pub fn deinit(self) -> SdMmcSpi<SPI, CS, L, NotInit> {
        self.into_state(NotInit)
    }

    /// Read the 'card specific data' block.
    pub fn read_csd(&mut self) -> Result<Csd, Error> {
        self.with_chip_select(|card| {
            card.wait_not_busy()?;
            card.card_command(CMD9, 0, R1_READY_STATE, Error::CsdReadFailed)?;
            let mut csd = Csd::new();
            card.read_data(&mut csd.data)?;
            Ok(csd)
        })
    }

    /// Return the usable size of this SD card in bytes.
    pub fn capacity_bytes(&mut self) -> Result<u32, Error> {
        let csd = self.read_csd()?;
        Ok(csd.card_capacity_bytes())
    }

    /// Read one sector.
    pub fn read_sector(
        &mut self,
        sector: BlockIdx,
        buffer: &mut [u8; Block::LEN],
    ) -> Result<(), Error> {
        let address = block_address(sector)?;
        self.with_chip_select(|card| {
            card.wait_not_busy()?;
            card.card_command(CMD17, address, R1_READY_STATE, Error::CommandRejected)?;
            card.read_data(buffer)
        })
    }

    /// Read `count` consecutive sectors into the front of `buffer`.
    pub fn read_sectors(
        &mut self,
        start: BlockIdx,
        buffer: &mut [u8],
        count: BlockCount,
    ) -> Result<(), Error> {
        let len = (count.0 as usize)
            .checked_mul(Block::LEN)
            .ok_or(Error::BufferTooSmall)?;
        if buffer.len() < len {
            return Err(Error::BufferTooSmall);
        }
        if count.0 == 0 {
            return Ok(());
        }
        self.read_multiple(start, buffer[..len].chunks_mut(Block::LEN))
    }

    fn read_multiple<'b, I>(&mut self, start: BlockIdx, sectors: I) -> Result<(), Error>
    where
        I: Iterator<Item = &'b mut [u8]>,
    {
        let address = block_address(start)?;
        self.with_chip_select(|card| {
            card.wait_not_busy()?;
            card.card_command(CMD18, address, R1_READY_STATE, Error::CommandRejected)?;
            for sector in sectors {
                card.read_data(sector)?;
            }
            card.stop_transmission()
        })
    }

    /// Write one sector and wait while the card programs it.
    pub fn write_sector(&mut self, sector: BlockIdx, buffer: &[u8; Block::LEN]) -> Result<(), Error> {
        let address = block_address(sector)?;
        self.with_chip_select(|card| {
            card.wait_not_busy()?;
            card.card_command(CMD24, address, R1_READY_STATE, Error::CommandRejected)?;
            card.write_data(DATA_START_BLOCK, buffer)?;
            card.wait_not_busy()
        })
    }

    /// Write `count` consecutive sectors from the front of `buffer`.
    pub fn write_sectors(
        &mut self,
        start: BlockIdx,
        buffer: &[u8],
        count: BlockCount,
    ) -> Result<(), Error> {
        let len = (count.0 as usize)
            .checked_mul(Block::LEN)
            .ok_or(Error::BufferTooSmall)?;
        if buffer.len() < len {
            return Err(Error::BufferTooSmall);
        }
        if count.0 == 0 {
            return Ok(());
        }
        self.write_multiple(start, buffer[..len].chunks(Block::LEN))
    }

    fn write_multiple<'b, I>(&mut self, start: BlockIdx, sectors: I) -> Result<(), Error>
    where
        I: Iterator<Item = &'b [u8]>,
    {
        let address = block_address(start)?;
        self.with_chip_select(|card| {
            card.wait_not_busy()?;
            card.card_command(CMD25, address, R1_READY_STATE, Error::CommandRejected)?;
            for sector in sectors {
                card.wait_not_busy()?;
                card.write_data(WRITE_MULTIPLE_TOKEN, sector)?;
            }
            // Stop the write
            card.wait_not_busy()?;
            card.send(STOP_TRAN_TOKEN)?;
            card.wait_not_busy()
        })
    }

    /// Erase `count` sectors starting at `start`.
    pub fn erase_sectors(&mut self, start: BlockIdx, count: BlockCount) -> Result<(), Error> {
        if count.0 == 0 {
            return Ok(());
        }
        let last = start
            .0
            .checked_add(count.0 - 1)
            .ok_or(Error::OutOfRange)?;
        let first_address = block_address(start)?;
        let last_address = block_address(BlockIdx(last))?;
        debug!("Erasing {} sectors from {}", count.0, start.0);
        self.with_chip_select(|card| {
            card.wait_not_busy()?;
            card.card_command(CMD32, first_address, R1_READY_STATE, Error::EraseStartRejected)?;
            card.card_command(CMD33, last_address, R1_READY_STATE, Error::EraseEndRejected)?;
            card.card_command(CMD38, 0, R1_READY_STATE, Error::EraseRejected)?;
            card.wait_not_busy()
        })
    }
}

impl<SPI, CS, L> BlockDevice for SdMmcSpi<SPI, CS, L, Initialized>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    L: BusLock,
{
    /// Read one or more blocks, starting at the given block index.
    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Error> {
        trace!(
            "Read {} block(s) @ {} for {}",
            blocks.len(),
            start_block_idx.0,
            reason
        );
        if blocks.is_empty() {
            Ok(())
        } else if blocks.len() == 1 {
            self.read_sector(start_block_idx, &mut blocks[0].contents)
        } else {
            self.read_multiple(
                start_block_idx,
                blocks.iter_mut().map(|block| &mut block.contents[..]),
            )
        }
    }

    /// Write one or more blocks, starting at the given block index.
    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Error> {
        trace!("Write {} block(s) @ {}", blocks.len(), start_block_idx.0);
        if blocks.is_empty() {
            Ok(())
        } else if blocks.len() == 1 {
            self.write_sector(start_block_idx, &blocks[0].contents)
        } else {
            self.write_multiple(
                start_block_idx,
                blocks.iter().map(|block| &block.contents[..]),
            )
        }
    }

    /// Determine how many blocks this device can hold.
    fn num_blocks(&mut self) -> Result<BlockCount, Error> {
        let num_bytes = self.capacity_bytes()?;
        Ok(BlockCount(num_bytes / Block::LEN_U32))
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
