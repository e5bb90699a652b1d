//! Following and extending cluster chains in the FAT.

use crate::{debug, trace, warn, Block, BlockDevice, BlockIdx, Error};

use super::{
    bios_param_block::FsInfo, Entry, Volume, FAT_ENTRIES_PER_SECTOR, FIRST_DATA_CLUSTER,
};

/// Walks a cluster chain one link at a time.
///
/// The walk is bounded: a chain that leaves the data region, or that is
/// longer than the FAT has entries (so must loop), fails with
/// [`Error::CorruptChain`].
#[derive(Debug, Clone)]
pub struct ClusterChain {
    current: Option<u32>,
    steps: u32,
}

impl ClusterChain {
    /// A chain starting at `start`. Cluster 0 is the empty chain.
    pub fn new(start: u32) -> Self {
        Self {
            current: if start == 0 { None } else { Some(start) },
            steps: 0,
        }
    }

    /// The next cluster of the chain, or `None` once it has ended.
    pub fn next<D>(&mut self, volume: &Volume, dev: &mut D) -> Result<Option<u32>, Error>
    where
        D: BlockDevice,
    {
        let cluster = match self.current {
            Some(cluster) => cluster,
            None => return Ok(None),
        };
        if !volume.is_data_cluster(cluster) || self.steps >= volume.total_clusters() {
            warn!("Bad link to cluster {} after {} steps", cluster, self.steps);
            self.current = None;
            return Err(Error::CorruptChain);
        }
        self.steps += 1;
        let entry = Entry::from_raw(volume.next_cluster(dev, cluster)?);
        self.current = if entry.ends_chain() {
            None
        } else {
            Some(entry.value())
        };
        Ok(Some(cluster))
    }
}

impl Volume {
    /// Where the entry for `cluster` lives in FAT number `copy`.
    fn fat_entry_location(&self, cluster: u32, copy: u32) -> (BlockIdx, usize) {
        let sector = self.fat_start_sector()
            + copy * self.sectors_per_fat()
            + cluster / FAT_ENTRIES_PER_SECTOR;
        let offset = (cluster % FAT_ENTRIES_PER_SECTOR) as usize * 4;
        (BlockIdx(sector), offset)
    }

    /// The FAT entry for `cluster`: the next cluster of its chain, or a
    /// free or end-of-chain marker.
    pub fn next_cluster<D>(&self, dev: &mut D, cluster: u32) -> Result<u32, Error>
    where
        D: BlockDevice,
    {
        if cluster >= self.total_clusters() {
            return Err(Error::OutOfRange);
        }
        let (sector, offset) = self.fat_entry_location(cluster, 0);
        let block = dev.read_block(sector, "next_cluster")?;
        Ok(Entry::from_bytes(&block[offset..offset + 4]).value())
    }

    /// The final cluster of the chain starting at `start`.
    pub fn last_cluster<D>(&self, dev: &mut D, start: u32) -> Result<u32, Error>
    where
        D: BlockDevice,
    {
        let mut chain = self.chain(start);
        let mut last = start;
        while let Some(cluster) = chain.next(self, dev)? {
            last = cluster;
        }
        Ok(last)
    }

    /// The first free cluster.
    pub fn find_free_cluster<D>(&self, dev: &mut D) -> Result<u32, Error>
    where
        D: BlockDevice,
    {
        self.find_free_cluster_from(dev, FIRST_DATA_CLUSTER)
    }

    fn find_free_cluster_from<D>(&self, dev: &mut D, start: u32) -> Result<u32, Error>
    where
        D: BlockDevice,
    {
        let limit = self.allocation_limit();
        let mut cluster = start.max(FIRST_DATA_CLUSTER);
        while cluster < limit {
            let (sector, _) = self.fat_entry_location(cluster, 0);
            let block = dev.read_block(sector, "find_free_cluster")?;
            let sector_end = (cluster / FAT_ENTRIES_PER_SECTOR + 1) * FAT_ENTRIES_PER_SECTOR;
            while cluster < limit.min(sector_end) {
                let offset = (cluster % FAT_ENTRIES_PER_SECTOR) as usize * 4;
                if Entry::from_bytes(&block[offset..offset + 4]).is_free() {
                    return Ok(cluster);
                }
                cluster += 1;
            }
        }
        warn!("No free cluster below {}", limit);
        Err(Error::CardFull)
    }

    /// Point the FAT entry for `cluster` at `value`, in every copy of the
    /// FAT. The reserved top nibble of the entry is kept.
    pub fn write_fat_entry<D>(&self, dev: &mut D, cluster: u32, value: u32) -> Result<(), Error>
    where
        D: BlockDevice,
    {
        if cluster >= self.total_clusters() {
            return Err(Error::OutOfRange);
        }
        trace!("FAT[{}] = {:x}", cluster, value);
        for copy in 0..self.fat_copies() {
            let (sector, offset) = self.fat_entry_location(cluster, copy);
            let mut block = dev.read_block(sector, "write_fat_entry")?;
            let field = &mut block[offset..offset + 4];
            let old = u32::from_le_bytes([field[0], field[1], field[2], field[3]]);
            let new = (old & !Entry::MASK) | (value & Entry::MASK);
            field.copy_from_slice(&new.to_le_bytes());
            dev.write_block(&block, sector)?;
        }
        Ok(())
    }

    /// The free cluster count cached in the FSInfo sector, if the sector is
    /// signed and the count is known. The count is a hint, the FAT is the
    /// truth.
    pub fn free_cluster_count<D>(&self, dev: &mut D) -> Result<Option<u32>, Error>
    where
        D: BlockDevice,
    {
        let block = dev.read_block(self.fs_info_sector(), "free_cluster_count")?;
        let info = FsInfo::new(&block);
        let free = info.free_count();
        if !info.is_valid() || free == FsInfo::<&Block>::UNKNOWN {
            Ok(None)
        } else {
            Ok(Some(free))
        }
    }

    /// Count free FAT entries, stopping once `wanted` have been seen.
    fn count_free_clusters<D>(&self, dev: &mut D, wanted: u32) -> Result<u32, Error>
    where
        D: BlockDevice,
    {
        let limit = self.allocation_limit();
        let mut found = 0;
        let mut cluster = FIRST_DATA_CLUSTER;
        while cluster < limit && found < wanted {
            let (sector, _) = self.fat_entry_location(cluster, 0);
            let block = dev.read_block(sector, "count_free_clusters")?;
            let sector_end = (cluster / FAT_ENTRIES_PER_SECTOR + 1) * FAT_ENTRIES_PER_SECTOR;
            while cluster < limit.min(sector_end) && found < wanted {
                let offset = (cluster % FAT_ENTRIES_PER_SECTOR) as usize * 4;
                if Entry::from_bytes(&block[offset..offset + 4]).is_free() {
                    found += 1;
                }
                cluster += 1;
            }
        }
        Ok(found)
    }

    /// Bring FSInfo up to date after `count` clusters were taken, the last
    /// of them being `last`. Left alone when the sector isn't a valid FSInfo.
    fn note_allocated<D>(&self, dev: &mut D, count: u32, last: u32) -> Result<(), Error>
    where
        D: BlockDevice,
    {
        let sector = self.fs_info_sector();
        let mut block = dev.read_block(sector, "note_allocated")?;
        let mut info = FsInfo::new(&mut block);
        if !info.is_valid() {
            return Ok(());
        }
        let free = info.free_count();
        if free != FsInfo::<&Block>::UNKNOWN {
            info.set_free_count(free.saturating_sub(count));
        }
        info.set_next_free(last);
        dev.write_block(&block, sector)
    }

    /// Take a cluster for the end of a chain whose current tail is `tail`
    /// (0 to start a new chain).
    pub(crate) fn append_cluster<D>(&self, dev: &mut D, tail: u32) -> Result<u32, Error>
    where
        D: BlockDevice,
    {
        let cluster = self.take_cluster(dev, FIRST_DATA_CLUSTER, tail)?;
        self.note_allocated(dev, 1, cluster)?;
        Ok(cluster)
    }

    /// Allocate and link a chain of `count` clusters, ending in an
    /// end-of-chain marker. Returns the first cluster, or 0 for no clusters.
    ///
    /// The FAT is checked for `count` free entries before anything is
    /// written. If a write fails part way, the clusters taken so far are
    /// released again.
    pub fn allocate_chain<D>(&self, dev: &mut D, count: u32) -> Result<u32, Error>
    where
        D: BlockDevice,
    {
        if count == 0 {
            return Ok(0);
        }
        let available = self.count_free_clusters(dev, count)?;
        if available < count {
            warn!("{} clusters wanted, {} free in the FAT", count, available);
            return Err(Error::CardFull);
        }

        let mut first = 0;
        let mut tail = 0;
        let mut search = FIRST_DATA_CLUSTER;
        for _ in 0..count {
            let cluster = match self.take_cluster(dev, search, tail) {
                Ok(cluster) => cluster,
                Err(e) => {
                    if first != 0 {
                        let _ = self.release_chain(dev, first);
                    }
                    return Err(e);
                }
            };
            if first == 0 {
                first = cluster;
            }
            tail = cluster;
            search = cluster + 1;
        }
        self.note_allocated(dev, count, tail)?;
        debug!("Allocated {} clusters, {}..={}", count, first, tail);
        Ok(first)
    }

    /// Mark the first free cluster from `search` as the end of a chain and
    /// link `tail` (if any) to it.
    fn take_cluster<D>(&self, dev: &mut D, search: u32, tail: u32) -> Result<u32, Error>
    where
        D: BlockDevice,
    {
        let cluster = self.find_free_cluster_from(dev, search)?;
        self.write_fat_entry(dev, cluster, Entry::FINAL.value())?;
        if tail != 0 {
            if let Err(e) = self.write_fat_entry(dev, tail, cluster) {
                let _ = self.write_fat_entry(dev, cluster, Entry::FREE.value());
                return Err(e);
            }
        }
        Ok(cluster)
    }

    /// Mark every cluster of the chain starting at `start` as free.
    pub fn release_chain<D>(&self, dev: &mut D, start: u32) -> Result<(), Error>
    where
        D: BlockDevice,
    {
        let mut chain = self.chain(start);
        while let Some(cluster) = chain.next(self, dev)? {
            self.write_fat_entry(dev, cluster, Entry::FREE.value())?;
        }
        Ok(())
    }
}
