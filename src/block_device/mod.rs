//! embedded-sdfat - Block Device support
//!
//! Generic code for handling block devices.

mod block;
pub use block::*;

use crate::Error;

/// Represents a block device - a device which can read and write blocks (or
/// sectors). Only supports devices which are <= 2 TiB in size.
pub trait BlockDevice {
    /// Read one or more blocks, starting at the given block index. `reason`
    /// only shows up in trace logs.
    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Error>;
    /// Write one or more blocks, starting at the given block index.
    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Error>;
    /// Determine how many blocks this device can hold.
    fn num_blocks(&mut self) -> Result<BlockCount, Error>;

    /// Read a single block.
    fn read_block(&mut self, block_idx: BlockIdx, reason: &str) -> Result<Block, Error> {
        let mut blocks = [Block::new()];
        self.read(&mut blocks, block_idx, reason)?;
        let [block] = blocks;
        Ok(block)
    }

    /// Write a single block.
    fn write_block(&mut self, block: &Block, block_idx: BlockIdx) -> Result<(), Error> {
        self.write(core::slice::from_ref(block), block_idx)
    }
}

impl<T> BlockDevice for &mut T
where
    T: BlockDevice,
{
    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Error> {
        (*self).read(blocks, start_block_idx, reason)
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Error> {
        (*self).write(blocks, start_block_idx)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Error> {
        (*self).num_blocks()
    }
}

/// A block device backed by a disk image in memory.
#[derive(Debug)]
pub struct MemoryBlockDevice<'a> {
    memory: &'a mut [u8],
}

impl<'a> MemoryBlockDevice<'a> {
    /// Serve `memory` as consecutive 512-byte blocks.
    pub fn new(memory: &'a mut [u8]) -> Self {
        Self { memory }
    }

    fn block_range(&self, block_idx: usize) -> Result<core::ops::Range<usize>, Error> {
        let start = block_idx * Block::LEN;
        let end = start + Block::LEN;
        if end > self.memory.len() {
            Err(Error::OutOfRange)
        } else {
            Ok(start..end)
        }
    }
}

impl<'a> BlockDevice for MemoryBlockDevice<'a> {
    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        _reason: &str,
    ) -> Result<(), Error> {
        for (idx, block) in blocks.iter_mut().enumerate() {
            let range = self.block_range(start_block_idx.0 as usize + idx)?;
            block.contents.copy_from_slice(&self.memory[range]);
        }
        Ok(())
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Error> {
        for (idx, block) in blocks.iter().enumerate() {
            let range = self.block_range(start_block_idx.0 as usize + idx)?;
            self.memory[range].copy_from_slice(&block.contents);
        }
        Ok(())
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Error> {
        Ok(BlockCount((self.memory.len() / Block::LEN) as u32))
    }
}
