//! Blocks and the numbers that address them.

use core::ops::{Add, AddAssign, Deref, DerefMut, Sub, SubAssign};

/// One 512-byte block (or sector) of storage.
#[derive(Clone, PartialEq, Eq)]
pub struct Block {
    /// The raw bytes of the block.
    pub contents: [u8; Block::LEN],
}

impl Block {
    /// Bytes in a block.
    pub const LEN: usize = 512;
    /// Bytes in a block, as a `u32`.
    pub const LEN_U32: u32 = 512;

    /// A block full of zeros.
    pub const fn new() -> Block {
        Block {
            contents: [0u8; Self::LEN],
        }
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for Block {
    type Target = [u8; Block::LEN];
    fn deref(&self) -> &[u8; Block::LEN] {
        &self.contents
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut [u8; Block::LEN] {
        &mut self.contents
    }
}

impl AsRef<[u8]> for Block {
    fn as_ref(&self) -> &[u8] {
        &self.contents
    }
}

impl AsMut<[u8]> for Block {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.contents
    }
}

impl core::fmt::Debug for Block {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::fmt::Result {
        writeln!(fmt, "Block:")?;
        for line in self.contents.chunks(32) {
            for b in line {
                write!(fmt, "{:02x}", b)?;
            }
            writeln!(fmt)?;
        }
        Ok(())
    }
}

/// The linear index of a block on a device.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockIdx(pub u32);

impl BlockIdx {
    /// Iterate over `num` consecutive blocks starting here.
    pub fn range(self, num: BlockCount) -> BlockIter {
        BlockIter::new(self, self + num)
    }
}

impl Add<BlockCount> for BlockIdx {
    type Output = BlockIdx;
    fn add(self, rhs: BlockCount) -> BlockIdx {
        BlockIdx(self.0 + rhs.0)
    }
}

impl AddAssign<BlockCount> for BlockIdx {
    fn add_assign(&mut self, rhs: BlockCount) {
        self.0 += rhs.0
    }
}

impl Sub<BlockCount> for BlockIdx {
    type Output = BlockIdx;
    fn sub(self, rhs: BlockCount) -> BlockIdx {
        BlockIdx(self.0 - rhs.0)
    }
}

/// A number of blocks.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockCount(pub u32);

impl Add<BlockCount> for BlockCount {
    type Output = BlockCount;
    fn add(self, rhs: BlockCount) -> BlockCount {
        BlockCount(self.0 + rhs.0)
    }
}

impl SubAssign<BlockCount> for BlockCount {
    fn sub_assign(&mut self, rhs: BlockCount) {
        self.0 -= rhs.0
    }
}

/// Walks a half-open range of block indices.
#[derive(Debug, Clone)]
pub struct BlockIter {
    current: BlockIdx,
    end: BlockIdx,
}

impl BlockIter {
    /// Iterate from `start` up to, but excluding, `end`.
    pub fn new(start: BlockIdx, end: BlockIdx) -> BlockIter {
        BlockIter {
            current: start,
            end,
        }
    }
}

impl Iterator for BlockIter {
    type Item = BlockIdx;
    fn next(&mut self) -> Option<BlockIdx> {
        if self.current < self.end {
            let this = self.current;
            self.current += BlockCount(1);
            Some(this)
        } else {
            None
        }
    }
}
