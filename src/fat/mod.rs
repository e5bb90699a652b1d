//! embedded-sdfat - FAT32 support
//!
//! A deliberately small FAT32 layer: a single partition starting at sector
//! zero, 8.3 names in the root directory only, and reads that stream into a
//! caller supplied buffer and can be resumed with a [`StreamCursor`].

pub mod bios_param_block;
pub mod cluster;
pub mod directory;
pub mod file;
pub mod volume;


pub use self::{
    cluster::ClusterChain,
    directory::{Attributes, DirectoryEntry, ShortName},
    file::{
        trailing_valid_bytes, OpenFile, SectorSource, SliceSource, StreamCursor, StreamOutcome,
    },
    volume::Volume,
};

/// Bytes in one directory entry.
pub const DIR_ENTRY_LEN: usize = 32;

/// FAT32 entries in one 512-byte FAT sector.
pub const FAT_ENTRIES_PER_SECTOR: u32 = 128;

/// Clusters 0 and 1 are reserved, data starts at cluster 2.
pub const FIRST_DATA_CLUSTER: u32 = 2;

/// A FAT32 table entry with the reserved top nibble dropped.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry(u32);

impl Entry {
    /// The 28 bits of an entry that carry a cluster number.
    pub const MASK: u32 = 0x0FFF_FFFF;

    pub const FREE: Self = Self(0);
    pub const BAD: Self = Self(0x0FFF_FFF7);
    pub const FINAL: Self = Self(0x0FFF_FFFF);
    const FINAL_RANGE_START: u32 = 0x0FFF_FFF8;

    pub fn from_raw(raw: u32) -> Self {
        Self(raw & Self::MASK)
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Self {
        Self::from_raw(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn is_free(self) -> bool {
        self == Self::FREE
    }

    pub fn is_final(self) -> bool {
        self.0 >= Self::FINAL_RANGE_START
    }

    /// Both a free and a final entry end a chain.
    pub fn ends_chain(self) -> bool {
        self.is_free() || self.is_final()
    }
}
