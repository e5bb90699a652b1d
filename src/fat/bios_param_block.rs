//! The boot sector and the FSInfo sector.

/// The BIOS Parameter Block in sector 0 of a FAT32 volume.
///
/// Only the fields the volume needs are exposed. `B` is anything that holds
/// the 512 bytes of the sector, usually a [`crate::Block`] or a slice of one.
#[derive(Debug, Clone)]
pub struct BiosParameterBlock<B> {
    block: B,
}

impl<B> BiosParameterBlock<B>
where
    B: AsRef<[u8]>,
{
    /// The boot signature at offset 510.
    pub const SIGNATURE: u16 = 0xAA55;
    /// The file system type label that marks a FAT32 volume.
    pub const FAT32_LABEL: &'static [u8; 5] = b"FAT32";
    const FS_TYPE_OFFSET: usize = 82;

    pub fn new(block: B) -> Self {
        Self { block }
    }

    pub fn into_inner(self) -> B {
        self.block
    }

    fn data(&self) -> &[u8] {
        self.block.as_ref()
    }

    define_field!(bytes_per_sector, u16, 11);
    define_field!(sectors_per_cluster, u8, 13);
    define_field!(reserved_sectors, u16, 14);
    define_field!(fat_copies, u8, 16);
    define_field!(total_sectors_32, u32, 32);
    define_field!(sectors_per_fat, u32, 36);
    define_field!(root_dir_cluster, u32, 44);
    define_field!(fs_info_sector, u16, 48);
    define_field!(signature, u16, 510);

    /// The eight byte file system type label at offset 82.
    pub fn fs_type(&self) -> &[u8] {
        &self.data()[Self::FS_TYPE_OFFSET..Self::FS_TYPE_OFFSET + 8]
    }

    pub fn is_fat32(&self) -> bool {
        &self.fs_type()[..5] == Self::FAT32_LABEL
    }
}

impl<B> BiosParameterBlock<B>
where
    B: AsRef<[u8]> + AsMut<[u8]>,
{
    fn data_mut(&mut self) -> &mut [u8] {
        self.block.as_mut()
    }

    define_setter!(set_bytes_per_sector, u16, 11);
    define_setter!(set_sectors_per_cluster, u8, 13);
    define_setter!(set_reserved_sectors, u16, 14);
    define_setter!(set_fat_copies, u8, 16);
    define_setter!(set_total_sectors_32, u32, 32);
    define_setter!(set_sectors_per_fat, u32, 36);
    define_setter!(set_root_dir_cluster, u32, 44);
    define_setter!(set_fs_info_sector, u16, 48);
    define_setter!(set_signature, u16, 510);

    /// Write the file system type label, space padded to eight bytes.
    pub fn set_fs_type(&mut self, label: &[u8]) {
        let field = &mut self.data_mut()[Self::FS_TYPE_OFFSET..Self::FS_TYPE_OFFSET + 8];
        for (i, b) in field.iter_mut().enumerate() {
            *b = label.get(i).copied().unwrap_or(b' ');
        }
    }
}

/// The FSInfo sector, which caches the free cluster count.
#[derive(Debug, Clone)]
pub struct FsInfo<B> {
    block: B,
}

impl<B> FsInfo<B>
where
    B: AsRef<[u8]>,
{
    pub const LEAD_SIGNATURE: u32 = 0x4161_5252;
    pub const STRUCT_SIGNATURE: u32 = 0x6141_7272;
    pub const TRAIL_SIGNATURE: u32 = 0xAA55_0000;
    /// Free count and next free hint both use this for "not known".
    pub const UNKNOWN: u32 = 0xFFFF_FFFF;

    pub fn new(block: B) -> Self {
        Self { block }
    }

    pub fn into_inner(self) -> B {
        self.block
    }

    fn data(&self) -> &[u8] {
        self.block.as_ref()
    }

    define_field!(lead_signature, u32, 0);
    define_field!(struct_signature, u32, 484);
    define_field!(free_count, u32, 488);
    define_field!(next_free, u32, 492);
    define_field!(trail_signature, u32, 508);

    pub fn is_valid(&self) -> bool {
        self.lead_signature() == Self::LEAD_SIGNATURE
            && self.struct_signature() == Self::STRUCT_SIGNATURE
            && self.trail_signature() == Self::TRAIL_SIGNATURE
    }
}

impl<B> FsInfo<B>
where
    B: AsRef<[u8]> + AsMut<[u8]>,
{
    fn data_mut(&mut self) -> &mut [u8] {
        self.block.as_mut()
    }

    define_setter!(set_free_count, u32, 488);
    define_setter!(set_next_free, u32, 492);

    /// Write all three signatures.
    pub fn sign(&mut self) {
        self.data_mut()[0..4].copy_from_slice(&Self::LEAD_SIGNATURE.to_le_bytes());
        self.data_mut()[484..488].copy_from_slice(&Self::STRUCT_SIGNATURE.to_le_bytes());
        self.data_mut()[508..512].copy_from_slice(&Self::TRAIL_SIGNATURE.to_le_bytes());
    }
}
