//! 8.3 names and the root directory.

use core::ops::ControlFlow;

use crate::{debug, trace, warn, Block, BlockDevice, BlockIdx, Error};

use super::{Volume, DIR_ENTRY_LEN};

bitflags::bitflags! {
    /// The attribute byte of a directory entry.
    pub struct Attributes: u8 {
        const READ_ONLY = (1 << 0);
        const HIDDEN = (1 << 1);
        const SYSTEM = (1 << 2);
        const VOLUME_ID = (1 << 3);
        const DIRECTORY = (1 << 4);
        const ARCHIVE = (1 << 5);
    }
}

impl Attributes {
    pub fn is_long_name(&self) -> bool {
        self.contains(Self::READ_ONLY | Self::HIDDEN | Self::SYSTEM | Self::VOLUME_ID)
    }

    pub fn is_volume_label(&self) -> bool {
        self.contains(Self::VOLUME_ID) && !self.is_long_name()
    }

    pub fn is_dir(&self) -> bool {
        self.contains(Self::DIRECTORY)
    }
}

/// A file name in the 11 byte, space padded, dotless form stored on disk.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ShortName {
    contents: [u8; ShortName::LEN],
}

impl ShortName {
    pub const LEN: usize = 11;
    const BASE_LEN: usize = 8;
    const EXTENSION_LEN: usize = 3;

    /// Turn `"test.txt"` into `"TEST    TXT"`. Fails for anything that has
    /// no exact 8.3 form.
    pub fn new(name: &str) -> Result<ShortName, Error> {
        let (base, extension) = match name.rfind('.') {
            Some(dot) => (&name[..dot], &name[dot + 1..]),
            None => (name, ""),
        };
        if base.is_empty() || base.len() > Self::BASE_LEN || extension.len() > Self::EXTENSION_LEN
        {
            return Err(Error::InvalidFileName);
        }
        let mut contents = [b' '; Self::LEN];
        let (base_slots, extension_slots) = contents.split_at_mut(Self::BASE_LEN);
        let fields = base
            .bytes()
            .zip(base_slots.iter_mut())
            .chain(extension.bytes().zip(extension_slots.iter_mut()));
        for (ch, slot) in fields {
            if !Self::is_valid_char(ch) {
                return Err(Error::InvalidFileName);
            }
            *slot = ch.to_ascii_uppercase();
        }
        Ok(ShortName { contents })
    }

    fn is_valid_char(ch: u8) -> bool {
        ch.is_ascii_graphic() && !b"\"*+,./:;<=>?[\\]|".contains(&ch)
    }

    /// A name exactly as stored in a directory entry.
    pub fn from_raw(contents: [u8; ShortName::LEN]) -> ShortName {
        ShortName { contents }
    }

    pub fn as_bytes(&self) -> &[u8; ShortName::LEN] {
        &self.contents
    }

    /// The base name, without padding.
    pub fn base(&self) -> &[u8] {
        trim_padding(&self.contents[..Self::BASE_LEN])
    }

    /// The extension, without padding.
    pub fn extension(&self) -> &[u8] {
        trim_padding(&self.contents[Self::BASE_LEN..])
    }
}

fn trim_padding(mut name: &[u8]) -> &[u8] {
    while let [rest @ .., b' '] = name {
        name = rest;
    }
    name
}

impl core::fmt::Display for ShortName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for &b in self.base() {
            write!(f, "{}", b as char)?;
        }
        if !self.extension().is_empty() {
            write!(f, ".")?;
            for &b in self.extension() {
                write!(f, "{}", b as char)?;
            }
        }
        Ok(())
    }
}

impl core::fmt::Debug for ShortName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ShortName(\"{}\")", self)
    }
}

/// A file found in, or written to, the root directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEntry {
    name: ShortName,
    attributes: Attributes,
    size: u32,
    start_cluster: u32,
}

impl DirectoryEntry {
    pub fn new(raw: &DirEntryRaw<&[u8]>) -> Self {
        Self {
            name: ShortName::from_raw(raw.name()),
            attributes: raw.attributes(),
            size: raw.file_size(),
            start_cluster: raw.first_cluster(),
        }
    }

    pub fn name(&self) -> &ShortName {
        &self.name
    }

    pub fn attributes(&self) -> Attributes {
        self.attributes
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn start_cluster(&self) -> u32 {
        self.start_cluster
    }
}

/// A 32 byte directory entry.
#[derive(Debug)]
pub struct DirEntryRaw<B> {
    data: B,
}

impl<B> DirEntryRaw<B>
where
    B: AsRef<[u8]>,
{
    /// Marks a deleted entry.
    pub const DELETED: u8 = 0xE5;
    /// Marks the end of the directory.
    pub const END: u8 = 0x00;

    pub fn new(data: B) -> Self {
        Self { data }
    }

    fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    pub fn name(&self) -> [u8; ShortName::LEN] {
        let mut name = [0u8; ShortName::LEN];
        name.copy_from_slice(&self.data()[0..ShortName::LEN]);
        name
    }

    define_field!(attr, u8, 11);
    define_field!(crt_time_tenth, u8, 13);
    define_field!(crt_time, u16, 14);
    define_field!(crt_date, u16, 16);
    define_field!(lst_acc_date, u16, 18);
    define_field!(fst_clus_hi, u16, 20);
    define_field!(wrt_time, u16, 22);
    define_field!(wrt_date, u16, 24);
    define_field!(fst_clus_lo, u16, 26);
    define_field!(file_size, u32, 28);

    pub fn attributes(&self) -> Attributes {
        Attributes::from_bits_truncate(self.attr())
    }

    /// The start cluster, from bytes 21, 20, 27 and 26 taken most
    /// significant first.
    pub fn first_cluster(&self) -> u32 {
        let data = self.data();
        u32::from_be_bytes([data[21], data[20], data[27], data[26]])
    }

    pub fn is_end_marker(&self) -> bool {
        self.data()[0] == Self::END
    }

    pub fn is_deleted(&self) -> bool {
        self.data()[0] == Self::DELETED
    }

    /// Can a new entry go here?
    pub fn is_free(&self) -> bool {
        self.is_end_marker() || self.is_deleted()
    }

    /// Does this entry describe a file or directory, rather than being
    /// free, a volume label or part of a long name?
    pub fn is_live(&self) -> bool {
        !self.is_free() && !self.attributes().contains(Attributes::VOLUME_ID)
    }
}

impl<B> DirEntryRaw<B>
where
    B: AsRef<[u8]> + AsMut<[u8]>,
{
    fn data_mut(&mut self) -> &mut [u8] {
        self.data.as_mut()
    }

    pub fn set_name(&mut self, name: &ShortName) {
        self.data_mut()[0..ShortName::LEN].copy_from_slice(name.as_bytes());
    }

    define_setter!(set_attr, u8, 11);
    define_setter!(set_nt_res, u8, 12);
    define_setter!(set_crt_time_tenth, u8, 13);
    define_setter!(set_crt_time, u16, 14);
    define_setter!(set_crt_date, u16, 16);
    define_setter!(set_lst_acc_date, u16, 18);
    define_setter!(set_fst_clus_hi, u16, 20);
    define_setter!(set_wrt_time, u16, 22);
    define_setter!(set_wrt_date, u16, 24);
    define_setter!(set_fst_clus_lo, u16, 26);
    define_setter!(set_file_size, u32, 28);

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.set_fst_clus_hi((cluster >> 16) as u16);
        self.set_fst_clus_lo(cluster as u16);
    }
}

/// 2010-01-01, the date stamped on every file we create.
pub const PLACEHOLDER_DATE: u16 = ((2010 - 1980) << 9) | (1 << 5) | 1;
/// Midnight.
pub const PLACEHOLDER_TIME: u16 = 0;

impl Volume {
    /// Call `f` with every 32 byte slot of the root directory, along with
    /// the sector and offset it lives at, until `f` breaks. Otherwise
    /// returns the last cluster of the directory.
    fn walk_dir<D, T, F>(&self, dev: &mut D, mut f: F) -> Result<ControlFlow<T, u32>, Error>
    where
        D: BlockDevice,
        F: FnMut(BlockIdx, usize, &DirEntryRaw<&[u8]>) -> ControlFlow<T>,
    {
        let mut chain = self.chain(self.root_dir_cluster());
        let mut last = self.root_dir_cluster();
        while let Some(cluster) = chain.next(self, dev)? {
            last = cluster;
            for sector in self.cluster_sectors(cluster) {
                let block = dev.read_block(sector, "directory")?;
                for (index, slot) in block.chunks(DIR_ENTRY_LEN).enumerate() {
                    if let ControlFlow::Break(t) =
                        f(sector, index * DIR_ENTRY_LEN, &DirEntryRaw::new(slot))
                    {
                        return Ok(ControlFlow::Break(t));
                    }
                }
            }
        }
        Ok(ControlFlow::Continue(last))
    }

    /// The live entry called `name`, file or directory.
    fn find_entry<D>(&self, dev: &mut D, name: &ShortName) -> Result<Option<DirectoryEntry>, Error>
    where
        D: BlockDevice,
    {
        let found = self.walk_dir(dev, |_, _, raw| {
            if raw.is_end_marker() {
                ControlFlow::Break(None)
            } else if raw.is_live() && raw.name() == *name.as_bytes() {
                ControlFlow::Break(Some(DirectoryEntry::new(raw)))
            } else {
                ControlFlow::Continue(())
            }
        })?;
        match found {
            ControlFlow::Break(entry) => Ok(entry),
            ControlFlow::Continue(_) => Ok(None),
        }
    }

    /// Look the file `name` up in the root directory. Directories don't
    /// count.
    pub fn find_file<D>(&self, dev: &mut D, name: &str) -> Result<DirectoryEntry, Error>
    where
        D: BlockDevice,
    {
        let name = ShortName::new(name)?;
        match self.find_entry(dev, &name)? {
            Some(entry) if !entry.attributes().is_dir() => Ok(entry),
            _ => {
                trace!("{:?} not found", name);
                Err(Error::FileNotFound)
            }
        }
    }

    /// Call `f` with every file and directory in the root directory.
    pub fn iterate_dir<D, F>(&self, dev: &mut D, mut f: F) -> Result<(), Error>
    where
        D: BlockDevice,
        F: FnMut(&DirectoryEntry),
    {
        self.walk_dir(dev, |_, _, raw| {
            if raw.is_end_marker() {
                ControlFlow::Break(())
            } else {
                if raw.is_live() {
                    f(&DirectoryEntry::new(raw));
                }
                ControlFlow::Continue(())
            }
        })?;
        Ok(())
    }

    /// Create an empty entry for `name` in the root directory and give it a
    /// chain big enough for `size` bytes.
    pub fn create_file<D>(&self, dev: &mut D, name: &str, size: u32) -> Result<DirectoryEntry, Error>
    where
        D: BlockDevice,
    {
        let short_name = ShortName::new(name)?;
        if self.find_entry(dev, &short_name)?.is_some() {
            return Err(Error::FileExists);
        }

        let clusters = self.clusters_for_size(size);
        if let Some(free) = self.free_cluster_count(dev)? {
            if clusters > free {
                warn!("{} clusters wanted, {} free", clusters, free);
                return Err(Error::CardFull);
            }
        }
        let start_cluster = self.allocate_chain(dev, clusters)?;
        let entry = DirectoryEntry {
            name: short_name,
            attributes: Attributes::ARCHIVE,
            size,
            start_cluster,
        };
        let placed = self
            .free_dir_slot(dev)
            .and_then(|(sector, offset)| self.write_dir_entry(dev, sector, offset, &entry));
        if let Err(e) = placed {
            // Nothing points at the chain yet, so hand it back.
            if start_cluster != 0 {
                let _ = self.release_chain(dev, start_cluster);
            }
            return Err(e);
        }
        debug!(
            "Created {:?}: {} bytes from cluster {}",
            entry.name, size, start_cluster
        );
        Ok(entry)
    }

    /// The first slot a new entry can go in. The directory grows by a
    /// zeroed cluster when it has none.
    fn free_dir_slot<D>(&self, dev: &mut D) -> Result<(BlockIdx, usize), Error>
    where
        D: BlockDevice,
    {
        let found = self.walk_dir(dev, |sector, offset, raw| {
            if raw.is_free() {
                ControlFlow::Break((sector, offset))
            } else {
                ControlFlow::Continue(())
            }
        })?;
        match found {
            ControlFlow::Break(slot) => Ok(slot),
            ControlFlow::Continue(last) => {
                let cluster = self.append_cluster(dev, last)?;
                debug!("Directory grows into cluster {}", cluster);
                let zeros = Block::new();
                for sector in self.cluster_sectors(cluster) {
                    dev.write_block(&zeros, sector)?;
                }
                Ok((self.cluster_to_sector(cluster), 0))
            }
        }
    }

    fn write_dir_entry<D>(
        &self,
        dev: &mut D,
        sector: BlockIdx,
        offset: usize,
        entry: &DirectoryEntry,
    ) -> Result<(), Error>
    where
        D: BlockDevice,
    {
        let mut block = dev.read_block(sector, "write_dir_entry")?;
        let mut raw = DirEntryRaw::new(&mut block[offset..offset + DIR_ENTRY_LEN]);
        raw.set_name(&entry.name);
        raw.set_attr(entry.attributes.bits());
        raw.set_nt_res(0);
        raw.set_crt_time_tenth(0);
        raw.set_crt_time(PLACEHOLDER_TIME);
        raw.set_crt_date(PLACEHOLDER_DATE);
        raw.set_lst_acc_date(PLACEHOLDER_DATE);
        raw.set_first_cluster(entry.start_cluster);
        raw.set_wrt_time(PLACEHOLDER_TIME);
        raw.set_wrt_date(PLACEHOLDER_DATE);
        raw.set_file_size(entry.size);
        dev.write_block(&block, sector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names() {
        let name = ShortName::new("test.txt").unwrap();
        assert_eq!(name.as_bytes(), b"TEST    TXT");
        assert_eq!(name.base(), b"TEST");
        assert_eq!(name.extension(), b"TXT");
        assert_eq!(format!("{}", name), "TEST.TXT");

        let name = ShortName::new("RAINBOW").unwrap();
        assert_eq!(name.as_bytes(), b"RAINBOW    ");
        assert_eq!(format!("{}", name), "RAINBOW");

        assert_eq!(
            ShortName::new("Pods-01.ani").unwrap().as_bytes(),
            b"PODS-01 ANI"
        );
    }

    #[test]
    fn names_without_short_form() {
        for bad in &[
            "",
            ".txt",
            "toolongname.txt",
            "name.text",
            "two words.txt",
            "a.b.c",
            "star*.txt",
            "caf\u{e9}.txt",
        ] {
            assert_eq!(ShortName::new(bad), Err(Error::InvalidFileName), "{}", bad);
        }
    }

    #[test]
    fn entry_fields() {
        let mut data = [0u8; DIR_ENTRY_LEN];
        let mut raw = DirEntryRaw::new(&mut data[..]);
        raw.set_name(&ShortName::new("a.bin").unwrap());
        raw.set_attr(Attributes::ARCHIVE.bits());
        raw.set_first_cluster(0x0123_4567);
        raw.set_file_size(70_000);
        raw.set_wrt_date(PLACEHOLDER_DATE);

        assert_eq!(&data[20..22], &[0x23, 0x01]);
        assert_eq!(&data[26..28], &[0x67, 0x45]);
        assert_eq!(&data[24..26], &[0x21, 0x3C]);

        let raw = DirEntryRaw::new(&data[..]);
        assert_eq!(raw.first_cluster(), 0x0123_4567);
        assert_eq!(
            u32::from(raw.fst_clus_hi()) << 16 | u32::from(raw.fst_clus_lo()),
            0x0123_4567
        );
        assert_eq!(raw.file_size(), 70_000);
        assert!(raw.is_live());
        let entry = DirectoryEntry::new(&raw);
        assert_eq!(format!("{}", entry.name()), "A.BIN");
        assert_eq!(entry.attributes(), Attributes::ARCHIVE);
    }

    #[test]
    fn entry_kinds() {
        let mut data = [0u8; DIR_ENTRY_LEN];
        assert!(DirEntryRaw::new(&data[..]).is_end_marker());
        data[0] = DirEntryRaw::<&[u8]>::DELETED;
        assert!(DirEntryRaw::new(&data[..]).is_free());
        data[0] = b'A';
        data[11] = 0x0F;
        assert!(DirEntryRaw::new(&data[..]).attributes().is_long_name());
        assert!(!DirEntryRaw::new(&data[..]).is_live());
        data[11] = Attributes::VOLUME_ID.bits();
        assert!(DirEntryRaw::new(&data[..]).attributes().is_volume_label());
        assert!(!DirEntryRaw::new(&data[..]).is_live());
    }
}
