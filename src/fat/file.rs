//! Opening files, and streaming them in and out.

use crate::{debug, trace, Block, BlockDevice, BlockIdx, Error};

use super::{DirectoryEntry, Entry, ShortName, Volume};

/// A file in the root directory that is ready to be streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFile {
    name: ShortName,
    size: u32,
    start_cluster: u32,
    start_sector: BlockIdx,
    total_clusters: u32,
    total_sectors: u32,
    last_cluster: Option<u32>,
}

impl OpenFile {
    pub fn name(&self) -> &ShortName {
        &self.name
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn start_cluster(&self) -> u32 {
        self.start_cluster
    }

    pub fn start_sector(&self) -> BlockIdx {
        self.start_sector
    }

    /// Clusters holding file data.
    pub fn total_clusters(&self) -> u32 {
        self.total_clusters
    }

    /// Sectors holding file data.
    pub fn total_sectors(&self) -> u32 {
        self.total_sectors
    }

    /// The final cluster, once [`OpenFile::resolve_last_cluster`] has found it.
    pub fn last_cluster(&self) -> Option<u32> {
        self.last_cluster
    }

    /// Walk the chain once to find the final cluster, and remember it.
    pub fn resolve_last_cluster<D>(&mut self, volume: &Volume, dev: &mut D) -> Result<u32, Error>
    where
        D: BlockDevice,
    {
        if let Some(last) = self.last_cluster {
            return Ok(last);
        }
        let last = volume.last_cluster(dev, self.start_cluster)?;
        self.last_cluster = Some(last);
        Ok(last)
    }
}

/// Where a streaming read left off. Hand it back to
/// [`Volume::read_stream`] to carry on.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCursor {
    next_sector: BlockIdx,
    next_cluster: u32,
    bytes_remaining: u32,
    sectors_remaining_in_cluster: u32,
    offset_in_sector: usize,
}

impl StreamCursor {
    /// A cursor at the start of `file`.
    pub fn start(volume: &Volume, file: &OpenFile) -> StreamCursor {
        StreamCursor {
            next_sector: file.start_sector,
            next_cluster: file.start_cluster,
            bytes_remaining: file.size,
            sectors_remaining_in_cluster: volume.sectors_per_cluster(),
            offset_in_sector: 0,
        }
    }

    pub fn next_sector(&self) -> BlockIdx {
        self.next_sector
    }

    /// The cluster `next_sector` belongs to.
    pub fn next_cluster(&self) -> u32 {
        self.next_cluster
    }

    /// File bytes not yet delivered.
    pub fn bytes_remaining(&self) -> u32 {
        self.bytes_remaining
    }

    pub fn sectors_remaining_in_cluster(&self) -> u32 {
        self.sectors_remaining_in_cluster
    }

    pub fn offset_in_sector(&self) -> usize {
        self.offset_in_sector
    }

    pub fn is_done(&self) -> bool {
        self.bytes_remaining == 0
    }
}

/// How a call to [`Volume::read_stream`] ended.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The buffer is full. Use it, then call again with the cursor.
    BufferFull,
    /// The whole file has been delivered. `filled` bytes of the buffer were
    /// written by this call.
    Complete { filled: usize },
}

/// How many bytes of the last non-empty chunk belong to a file of `size`
/// bytes streamed through a buffer of `buf_len` bytes. 0 means all of them.
pub fn trailing_valid_bytes(size: u32, buf_len: usize) -> usize {
    if buf_len == 0 {
        0
    } else {
        (u64::from(size) % buf_len as u64) as usize
    }
}

/// Produces the sectors of a file being written.
pub trait SectorSource {
    /// Fill `block` with sector `index` of the file. `block` arrives zeroed.
    /// An error stops [`Volume::write_stream`] and is handed back by it.
    fn fill_sector(&mut self, index: u32, block: &mut Block) -> Result<(), Error>;
}

impl<F> SectorSource for F
where
    F: FnMut(u32, &mut Block) -> Result<(), Error>,
{
    fn fill_sector(&mut self, index: u32, block: &mut Block) -> Result<(), Error> {
        self(index, block)
    }
}

/// Writes a byte slice, zero padded to whole sectors.
#[derive(Debug, Clone, Copy)]
pub struct SliceSource<'a> {
    data: &'a [u8],
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> SectorSource for SliceSource<'a> {
    fn fill_sector(&mut self, index: u32, block: &mut Block) -> Result<(), Error> {
        let start = (index as usize).saturating_mul(Block::LEN).min(self.data.len());
        let end = start.saturating_add(Block::LEN).min(self.data.len());
        let chunk = &self.data[start..end];
        block[..chunk.len()].copy_from_slice(chunk);
        Ok(())
    }
}

impl Volume {
    /// Find `name` and get it ready for streaming.
    pub fn open_file<D>(&self, dev: &mut D, name: &str) -> Result<OpenFile, Error>
    where
        D: BlockDevice,
    {
        let entry = self.find_file(dev, name)?;
        let size = entry.size();
        let start_cluster = entry.start_cluster();
        let start_sector = if self.is_data_cluster(start_cluster) {
            self.cluster_to_sector(start_cluster)
        } else if size == 0 {
            BlockIdx(0)
        } else {
            return Err(Error::CorruptChain);
        };
        let total_sectors = sectors_for_size(size);
        let total_clusters = if total_sectors == 0 {
            0
        } else {
            (total_sectors - 1) / self.sectors_per_cluster() + 1
        };
        debug!(
            "Opened {:?}: {} bytes in {} clusters",
            entry.name(),
            size,
            total_clusters
        );
        Ok(OpenFile {
            name: *entry.name(),
            size,
            start_cluster,
            start_sector,
            total_clusters,
            total_sectors,
            last_cluster: None,
        })
    }

    /// Copy the next part of `file` into `buf`.
    ///
    /// Pass `None` to start at the beginning, then the returned cursor for
    /// each following call. The sector holding the last bytes of the file
    /// is copied as far as `buf` allows, so bytes past the end of the file
    /// may follow in the final chunk (see [`trailing_valid_bytes`]).
    pub fn read_stream<D>(
        &self,
        dev: &mut D,
        file: &OpenFile,
        cursor: Option<StreamCursor>,
        buf: &mut [u8],
    ) -> Result<(StreamOutcome, StreamCursor), Error>
    where
        D: BlockDevice,
    {
        if buf.is_empty() {
            return Err(Error::BufferTooSmall);
        }
        let mut cursor = cursor.unwrap_or_else(|| StreamCursor::start(self, file));
        let mut filled = 0;
        while filled < buf.len() && cursor.bytes_remaining > 0 {
            if cursor.sectors_remaining_in_cluster == 0 {
                let next = Entry::from_raw(self.next_cluster(dev, cursor.next_cluster)?);
                if next.ends_chain() || !self.is_data_cluster(next.value()) {
                    return Err(Error::CorruptChain);
                }
                trace!("Stream moves to cluster {}", next.value());
                cursor.next_cluster = next.value();
                cursor.next_sector = self.cluster_to_sector(next.value());
                cursor.sectors_remaining_in_cluster = self.sectors_per_cluster();
            }

            let block = dev.read_block(cursor.next_sector, "read_stream")?;
            let available = Block::LEN - cursor.offset_in_sector;
            let count = available.min(buf.len() - filled);
            buf[filled..filled + count].copy_from_slice(
                &block[cursor.offset_in_sector..cursor.offset_in_sector + count],
            );
            filled += count;
            cursor.bytes_remaining = cursor.bytes_remaining.saturating_sub(count as u32);
            cursor.offset_in_sector += count;
            if cursor.offset_in_sector == Block::LEN {
                cursor.offset_in_sector = 0;
                cursor.next_sector.0 += 1;
                cursor.sectors_remaining_in_cluster -= 1;
            }
        }

        let outcome = if filled == buf.len() {
            StreamOutcome::BufferFull
        } else {
            StreamOutcome::Complete { filled }
        };
        Ok((outcome, cursor))
    }

    /// Create `name` with room for `size` bytes and fill it from `source`.
    /// Sectors of the last cluster past the end of the file are zeroed.
    ///
    /// If `source` fails, the file keeps its entry and chain, holding
    /// whatever was written before the failure.
    pub fn write_stream<D, S>(
        &self,
        dev: &mut D,
        name: &str,
        size: u32,
        mut source: S,
    ) -> Result<DirectoryEntry, Error>
    where
        D: BlockDevice,
        S: SectorSource,
    {
        let entry = self.create_file(dev, name, size)?;
        let total_sectors = sectors_for_size(size);
        let mut index = 0;
        let mut chain = self.chain(entry.start_cluster());
        while let Some(cluster) = chain.next(self, dev)? {
            for sector in self.cluster_sectors(cluster) {
                let mut block = Block::new();
                if index < total_sectors {
                    source.fill_sector(index, &mut block)?;
                }
                dev.write_block(&block, sector)?;
                index += 1;
            }
        }
        debug!("Wrote {} sectors of {:?}", index, entry.name());
        Ok(entry)
    }
}

fn sectors_for_size(size: u32) -> u32 {
    if size == 0 {
        0
    } else {
        (size - 1) / Block::LEN_U32 + 1
    }
}
