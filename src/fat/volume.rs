//! The geometry of a mounted volume.

use crate::{debug, warn, BlockCount, BlockDevice, BlockIdx, Error};

use super::{
    bios_param_block::BiosParameterBlock, ClusterChain, FAT_ENTRIES_PER_SECTOR,
    FIRST_DATA_CLUSTER,
};

/// Everything we need to know to find our way around a FAT32 volume. Read
/// once from the boot sector by [`Volume::mount`] and never changed.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Volume {
    sector_size: u32,
    sectors_per_cluster: u32,
    fat_copies: u32,
    reserved_sectors: u32,
    sectors_per_fat: u32,
    fat_start_sector: u32,
    root_dir_start_sector: u32,
    root_dir_cluster: u32,
    total_sectors: u32,
    total_clusters: u32,
    partition_start_sector: u32,
}

impl Volume {
    /// The only sector size we support.
    pub const SECTOR_SIZE: u32 = 512;

    /// Read the boot sector and work out the geometry.
    pub fn mount<D>(dev: &mut D) -> Result<Volume, Error>
    where
        D: BlockDevice,
    {
        let partition_start_sector = 0;
        let block = dev.read_block(BlockIdx(partition_start_sector), "mount")?;
        let bpb = BiosParameterBlock::new(&block);

        if !bpb.is_fat32() {
            warn!("Not a FAT32 volume");
            return Err(Error::NotFat32);
        }
        if bpb.signature() != BiosParameterBlock::<&[u8]>::SIGNATURE {
            warn!("Bad boot signature {:x}", bpb.signature());
            return Err(Error::BadSignature);
        }

        let sector_size = u32::from(bpb.bytes_per_sector());
        let sectors_per_cluster = u32::from(bpb.sectors_per_cluster());
        let fat_copies = u32::from(bpb.fat_copies());
        let sectors_per_fat = bpb.sectors_per_fat();
        let root_dir_cluster = bpb.root_dir_cluster();
        if sector_size != Self::SECTOR_SIZE
            || sectors_per_cluster == 0
            || fat_copies == 0
            || sectors_per_fat == 0
            || root_dir_cluster < FIRST_DATA_CLUSTER
        {
            warn!(
                "Unusable geometry: {} bytes/sector, {} sectors/cluster, {} FATs of {} sectors",
                sector_size,
                sectors_per_cluster,
                fat_copies,
                sectors_per_fat
            );
            return Err(Error::InvalidBpb);
        }

        let reserved_sectors = u32::from(bpb.reserved_sectors());
        let fat_start_sector = reserved_sectors + partition_start_sector;
        let root_dir_start_sector = sectors_per_fat
            .checked_mul(fat_copies)
            .and_then(|fats| fats.checked_add(fat_start_sector))
            .ok_or(Error::InvalidBpb)?;
        let total_clusters = sectors_per_fat
            .checked_mul(FAT_ENTRIES_PER_SECTOR)
            .ok_or(Error::InvalidBpb)?;
        let total_sectors = dev.num_blocks()?.0;

        let volume = Volume {
            sector_size,
            sectors_per_cluster,
            fat_copies,
            reserved_sectors,
            sectors_per_fat,
            fat_start_sector,
            root_dir_start_sector,
            root_dir_cluster,
            total_sectors,
            total_clusters,
            partition_start_sector,
        };
        debug!("Mounted {:?}", volume);
        Ok(volume)
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn sectors_per_cluster(&self) -> u32 {
        self.sectors_per_cluster
    }

    /// Bytes in one cluster.
    pub fn cluster_size(&self) -> u32 {
        self.sectors_per_cluster * self.sector_size
    }

    pub fn fat_copies(&self) -> u32 {
        self.fat_copies
    }

    pub fn reserved_sectors(&self) -> u32 {
        self.reserved_sectors
    }

    pub fn sectors_per_fat(&self) -> u32 {
        self.sectors_per_fat
    }

    pub fn fat_start_sector(&self) -> u32 {
        self.fat_start_sector
    }

    /// The first sector of the data region, which holds cluster 2.
    pub fn root_dir_start_sector(&self) -> u32 {
        self.root_dir_start_sector
    }

    pub fn root_dir_cluster(&self) -> u32 {
        self.root_dir_cluster
    }

    pub fn total_sectors(&self) -> u32 {
        self.total_sectors
    }

    /// How many entries the FAT has room for.
    pub fn total_clusters(&self) -> u32 {
        self.total_clusters
    }

    pub fn partition_start_sector(&self) -> u32 {
        self.partition_start_sector
    }

    pub fn fs_info_sector(&self) -> BlockIdx {
        BlockIdx(self.partition_start_sector + 1)
    }

    /// The first sector of `cluster`, which must be a data cluster.
    pub fn cluster_to_sector(&self, cluster: u32) -> BlockIdx {
        let index = cluster.saturating_sub(FIRST_DATA_CLUSTER);
        BlockIdx(index * self.sectors_per_cluster + self.root_dir_start_sector)
    }

    /// Can `cluster` appear in a chain?
    pub fn is_data_cluster(&self, cluster: u32) -> bool {
        cluster >= FIRST_DATA_CLUSTER && cluster < self.total_clusters
    }

    /// One past the highest cluster we hand out. The FAT often has more
    /// entries than the data region has clusters.
    pub fn allocation_limit(&self) -> u32 {
        let data_sectors = self.total_sectors.saturating_sub(self.root_dir_start_sector);
        let data_clusters = data_sectors / self.sectors_per_cluster;
        self.total_clusters
            .min(data_clusters.saturating_add(FIRST_DATA_CLUSTER))
    }

    /// Clusters needed to hold `size` bytes.
    pub fn clusters_for_size(&self, size: u32) -> u32 {
        if size == 0 {
            0
        } else {
            (size - 1) / self.cluster_size() + 1
        }
    }

    /// The sectors of `cluster`.
    pub(crate) fn cluster_sectors(&self, cluster: u32) -> crate::block_device::BlockIter {
        self.cluster_to_sector(cluster)
            .range(BlockCount(self.sectors_per_cluster))
    }

    /// Walk the chain that starts at `start`.
    pub fn chain(&self, start: u32) -> ClusterChain {
        ClusterChain::new(start)
    }
}
