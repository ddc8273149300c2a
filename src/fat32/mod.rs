//! FAT32 on-disk metadata: boot sector geometry, the allocation table,
//! cluster chains and directory entries, tied together by [`FatVolume`].
//!
//! The layer below is anything implementing [`BlockDevice`]; in production
//! that is the SCSI block device, in tests an in-memory image. Mutating
//! operations assume a single writer per volume; the embedding application
//! provides that exclusion.

pub mod boot_sector;
pub mod chain;
pub mod dir;
pub mod fat;
pub mod fs_info;

use tracing::{debug, info, warn};

use crate::BlockDevice;
use crate::error::{Error, Result};
use boot_sector::BootSector;
use chain::ClusterChain;
use dir::{DirEntry, ENTRY_SIZE, ShortEntry};
use fat::Fat;
use fs_info::FsInfo;

/// A mounted FAT32 volume.
#[derive(Debug)]
pub struct FatVolume<D: BlockDevice> {
    device: D,
    boot: BootSector,
    fat: Fat,
    fs_info: Option<FsInfo>,
}

impl<D: BlockDevice> FatVolume<D> {
    /// Mounts the filesystem found at block 0 of `device`.
    ///
    /// This is where validation lives: the 0x55AA trailer, geometry sanity
    /// against the device capacity, and the FSInfo signatures. A volume
    /// whose FSInfo sector is damaged still mounts; only the free-space
    /// bookkeeping degrades.
    pub async fn mount(mut device: D) -> Result<Self> {
        let device_block = device.block_size() as usize;
        let mut first = vec![0u8; device_block.max(512)];
        device.read_blocks(0, &mut first).await?;
        if first[510] != 0x55 || first[511] != 0xAA {
            return Err(Error::CorruptFilesystem("missing 0x55AA boot signature"));
        }
        let mut sector = [0u8; 512];
        sector.copy_from_slice(&first[..512]);
        let boot = BootSector::parse(&sector);
        let capacity = device.block_count() * device.block_size() as u64;
        boot.validate(capacity)?;
        if boot.bytes_per_sector as u32 % device.block_size() != 0 {
            return Err(Error::CorruptFilesystem(
                "filesystem sector size is not a multiple of the device block size",
            ));
        }
        info!(
            label = %boot.volume_label,
            clusters = boot.total_clusters(),
            cluster_bytes = boot.bytes_per_cluster(),
            "mounting fat32 volume"
        );

        let fs_info_offset = boot.fs_info_start_sector as u64 * boot.bytes_per_sector as u64;
        let fs_info =
            match FsInfo::read(&mut device, fs_info_offset, boot.bytes_per_sector as usize).await
            {
            Ok(info) => Some(info),
            Err(Error::CorruptFilesystem(detail)) => {
                warn!(detail, "fs info sector unusable, free-space tracking disabled");
                None
            }
            Err(e) => return Err(e),
        };
        let hint = fs_info
            .as_ref()
            .map(|i| i.last_allocated_cluster_hint())
            .filter(|&h| h != fs_info::INVALID_VALUE)
            .unwrap_or(2);
        let fat = Fat::new(boot.clone(), hint);

        Ok(Self {
            device,
            boot,
            fat,
            fs_info,
        })
    }

    pub fn boot_sector(&self) -> &BootSector {
        &self.boot
    }

    pub fn volume_label(&self) -> &str {
        &self.boot.volume_label
    }

    /// Cached free-cluster count, if the FSInfo sector is intact and claims
    /// to know it.
    pub fn free_cluster_count(&self) -> Option<u32> {
        self.fs_info
            .as_ref()
            .map(FsInfo::free_cluster_count)
            .filter(|&c| c != fs_info::INVALID_VALUE)
    }

    /// Resolves the cluster chain starting at `start_cluster`.
    pub async fn open_chain(&mut self, start_cluster: u32) -> Result<ClusterChain> {
        ClusterChain::open(&self.boot, &mut self.fat, &mut self.device, start_cluster).await
    }

    /// Reads bytes out of a previously opened chain.
    pub async fn read_chain(
        &mut self,
        chain: &ClusterChain,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        chain.read_at(&self.boot, &mut self.device, offset, buf).await
    }

    /// Writes bytes into a chain, growing it as needed and keeping the
    /// FSInfo free count in step with any allocation.
    pub async fn write_chain(
        &mut self,
        chain: &mut ClusterChain,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let allocated = chain
            .write_at(&self.boot, &mut self.fat, &mut self.device, offset, data)
            .await?;
        if allocated > 0
            && let Some(info) = &mut self.fs_info
        {
            info.adjust_free_cluster_count(allocated as i64);
            info.set_last_allocated_cluster_hint(self.fat.alloc_hint());
        }
        Ok(())
    }

    /// Frees a whole chain, e.g. when deleting a file, and returns the
    /// number of clusters released.
    pub async fn free_chain(&mut self, start_cluster: u32) -> Result<u32> {
        let freed = self.fat.free_chain(&mut self.device, start_cluster).await?;
        if let Some(info) = &mut self.fs_info {
            info.adjust_free_cluster_count(-(freed as i64));
        }
        Ok(freed)
    }

    /// Lists the root directory.
    pub async fn root_dir(&mut self) -> Result<Vec<DirEntry>> {
        let root = self.boot.root_dir_start_cluster;
        self.list_dir(root).await
    }

    /// Lists the directory whose chain starts at `start_cluster`. Volume
    /// label entries are bookkeeping, not children, and are filtered out.
    pub async fn list_dir(&mut self, start_cluster: u32) -> Result<Vec<DirEntry>> {
        let (_, stream) = self.read_dir_stream(start_cluster).await?;
        Ok(dir::parse_stream(&stream)
            .into_iter()
            .filter(|e| !e.short.is_volume_label())
            .collect())
    }

    /// Reads a whole file described by its directory entry.
    pub async fn read_file(&mut self, entry: &DirEntry) -> Result<Vec<u8>> {
        // Zero-length files carry no chain; their first cluster field is 0.
        if entry.file_size() == 0 || entry.first_cluster() < 2 {
            return Ok(Vec::new());
        }
        let chain = self.open_chain(entry.first_cluster()).await?;
        let size = entry.file_size() as u64;
        if size > chain.len_bytes() {
            return Err(Error::CorruptFilesystem(
                "file size exceeds its cluster chain",
            ));
        }
        let mut content = vec![0u8; size as usize];
        self.read_chain(&chain, 0, &mut content).await?;
        Ok(content)
    }

    /// Appends a directory entry (long-name run plus short entry) to the
    /// directory starting at `dir_cluster`. A long or 8.3 name already
    /// present in the directory is rejected: FAT requires both to be unique
    /// within a directory.
    pub async fn create_entry(
        &mut self,
        dir_cluster: u32,
        long_name: &str,
        short: ShortEntry,
    ) -> Result<()> {
        let (mut chain, stream) = self.read_dir_stream(dir_cluster).await?;
        if name_taken(&stream, long_name, &short.short_name()) {
            return Err(Error::InvalidArgument(
                "an entry with that name already exists",
            ));
        }
        let end_offset = stream
            .chunks_exact(ENTRY_SIZE)
            .position(|slot| slot[0] == dir::END_MARK)
            .map(|i| (i * ENTRY_SIZE) as u64)
            .unwrap_or(chain.len_bytes());

        // The new run, followed by a fresh end marker slot.
        let mut region = dir::encode_entry(long_name, &short);
        region.extend_from_slice(&[0u8; ENTRY_SIZE]);

        let allocated = chain
            .write_at(
                &self.boot,
                &mut self.fat,
                &mut self.device,
                end_offset,
                &region,
            )
            .await?;
        if allocated > 0 {
            // A freshly allocated directory cluster may hold stale bytes
            // that would parse as entries; zero everything past the marker.
            let written_end = end_offset + region.len() as u64;
            let tail = chain.len_bytes() - written_end;
            if tail > 0 {
                let zeros = vec![0u8; tail as usize];
                chain
                    .write_at(
                        &self.boot,
                        &mut self.fat,
                        &mut self.device,
                        written_end,
                        &zeros,
                    )
                    .await?;
            }
            if let Some(info) = &mut self.fs_info {
                info.adjust_free_cluster_count(allocated as i64);
                info.set_last_allocated_cluster_hint(self.fat.alloc_hint());
            }
        }
        debug!(name = long_name, dir_cluster, "directory entry created");
        Ok(())
    }

    /// Creates a regular file in the directory at `dir_cluster` with the
    /// given content. An empty file gets no cluster chain, matching how
    /// FAT32 represents zero-length files.
    pub async fn create_file(
        &mut self,
        dir_cluster: u32,
        name: &str,
        content: &[u8],
    ) -> Result<()> {
        let size = u32::try_from(content.len())
            .map_err(|_| Error::InvalidArgument("file larger than 4 GiB"))?;
        let mut short = ShortEntry::new(dir::to_short_name(name), dir::ATTR_ARCHIVE, 0, 0);
        // Check the name before any cluster is allocated.
        let (_, stream) = self.read_dir_stream(dir_cluster).await?;
        if name_taken(&stream, name, &short.short_name()) {
            return Err(Error::InvalidArgument(
                "an entry with that name already exists",
            ));
        }
        if content.is_empty() {
            return self.create_entry(dir_cluster, name, short).await;
        }

        let start = self.fat.allocate(&mut self.device, None).await?;
        if let Some(info) = &mut self.fs_info {
            info.adjust_free_cluster_count(1);
            info.set_last_allocated_cluster_hint(self.fat.alloc_hint());
        }
        let mut data_chain = self.open_chain(start).await?;
        self.write_chain(&mut data_chain, 0, content).await?;

        short.set_first_cluster(start);
        short.set_file_size(size);
        self.create_entry(dir_cluster, name, short).await
    }

    /// Deletes the named regular file: the directory entry is freed and so
    /// is its cluster chain. Returns false when nothing matches.
    pub async fn delete_file(&mut self, dir_cluster: u32, name: &str) -> Result<bool> {
        let entries = self.list_dir(dir_cluster).await?;
        let Some(entry) = entries
            .into_iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
        else {
            return Ok(false);
        };
        if entry.is_directory() {
            return Err(Error::InvalidArgument("entry is a directory, not a file"));
        }
        self.remove_entry(dir_cluster, name).await?;
        if entry.first_cluster() >= 2 {
            self.free_chain(entry.first_cluster()).await?;
        }
        Ok(true)
    }

    /// Removes the named entry from a directory by marking its slots free.
    /// Returns false when no entry matches. The entry's cluster chain is
    /// not freed here; callers decide whether the data goes too.
    pub async fn remove_entry(&mut self, dir_cluster: u32, name: &str) -> Result<bool> {
        let (mut chain, mut stream) = self.read_dir_stream(dir_cluster).await?;
        let Some((run_start, run_end)) = find_entry_slots(&stream, name) else {
            return Ok(false);
        };
        for slot in run_start..=run_end {
            stream[slot * ENTRY_SIZE] = dir::FREE_MARK;
        }
        let region_start = (run_start * ENTRY_SIZE) as u64;
        let region = &stream[run_start * ENTRY_SIZE..(run_end + 1) * ENTRY_SIZE];
        chain
            .write_at(
                &self.boot,
                &mut self.fat,
                &mut self.device,
                region_start,
                region,
            )
            .await?;
        debug!(name, dir_cluster, "directory entry removed");
        Ok(true)
    }

    /// Writes FSInfo bookkeeping back to the device.
    pub async fn flush(&mut self) -> Result<()> {
        if let Some(info) = &self.fs_info {
            info.write(&mut self.device).await?;
        }
        Ok(())
    }

    async fn read_dir_stream(&mut self, start_cluster: u32) -> Result<(ClusterChain, Vec<u8>)> {
        let chain = self.open_chain(start_cluster).await?;
        let mut stream = vec![0u8; chain.len_bytes() as usize];
        self.read_chain(&chain, 0, &mut stream).await?;
        Ok((chain, stream))
    }
}

/// True when the directory stream already holds an entry matching either
/// the long name or the generated 8.3 name, case-insensitive.
fn name_taken(stream: &[u8], long_name: &str, short_name: &str) -> bool {
    dir::parse_stream(stream).iter().any(|e| {
        e.name.eq_ignore_ascii_case(long_name)
            || e.short.short_name().eq_ignore_ascii_case(short_name)
    })
}

/// Finds the slot range (long-name run plus short entry, inclusive) of the
/// entry whose assembled name or 8.3 name matches `name`, case-insensitive.
fn find_entry_slots(stream: &[u8], name: &str) -> Option<(usize, usize)> {
    let mut run_start: Option<usize> = None;
    for (index, slot) in stream.chunks_exact(ENTRY_SIZE).enumerate() {
        match slot[0] {
            dir::END_MARK => break,
            dir::FREE_MARK => {
                run_start = None;
                continue;
            }
            _ => {}
        }
        if slot[11] & dir::ATTR_LONG_NAME == dir::ATTR_LONG_NAME {
            run_start.get_or_insert(index);
            continue;
        }
        let start = run_start.take().unwrap_or(index);
        let parsed = dir::parse_stream(&stream[start * ENTRY_SIZE..(index + 1) * ENTRY_SIZE]);
        if let Some(entry) = parsed.first()
            && (entry.name.eq_ignore_ascii_case(name)
                || entry.short.short_name().eq_ignore_ascii_case(name))
        {
            return Some((start, index));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use dir::ATTR_ARCHIVE;
    use fat::{END_OF_CHAIN, FatEntry};

    /// In-memory block device over a raw image. Transfers that are not a
    /// whole number of blocks violate the [`BlockDevice`] contract and
    /// panic, like the real SCSI device would reject them.
    #[derive(Debug)]
    struct RamDevice {
        data: Vec<u8>,
        block_size: u32,
    }

    impl RamDevice {
        fn new(data: Vec<u8>) -> Self {
            Self {
                data,
                block_size: 512,
            }
        }
    }

    impl BlockDevice for RamDevice {
        fn block_size(&self) -> u32 {
            self.block_size
        }

        fn block_count(&self) -> u64 {
            self.data.len() as u64 / self.block_size as u64
        }

        async fn read_blocks(&mut self, block_address: u64, buf: &mut [u8]) -> Result<()> {
            assert_eq!(buf.len() as u32 % self.block_size, 0, "read not whole blocks");
            let offset = block_address as usize * self.block_size as usize;
            buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
            Ok(())
        }

        async fn write_blocks(&mut self, block_address: u64, buf: &[u8]) -> Result<()> {
            assert_eq!(buf.len() as u32 % self.block_size, 0, "write not whole blocks");
            let offset = block_address as usize * self.block_size as usize;
            self.data[offset..offset + buf.len()].copy_from_slice(buf);
            Ok(())
        }
    }

    // Geometry used by every test image: 512-byte sectors, 1 sector per
    // cluster, 4 reserved sectors, 2 FATs of 2 sectors each, 64 data
    // clusters.
    const RESERVED: u16 = 4;
    const SECTORS_PER_FAT: u32 = 2;
    const DATA_CLUSTERS: u32 = 64;
    const TOTAL_SECTORS: u32 = RESERVED as u32 + 2 * SECTORS_PER_FAT + DATA_CLUSTERS;
    const FAT0: usize = RESERVED as usize * 512;
    const FAT1: usize = FAT0 + SECTORS_PER_FAT as usize * 512;
    const DATA: usize = FAT1 + SECTORS_PER_FAT as usize * 512;

    fn set_fat(image: &mut [u8], cluster: u32, value: u32) {
        for base in [FAT0, FAT1] {
            let off = base + cluster as usize * 4;
            image[off..off + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    fn cluster_slice(image: &mut [u8], cluster: u32) -> &mut [u8] {
        let off = DATA + (cluster as usize - 2) * 512;
        &mut image[off..off + 512]
    }

    fn test_image() -> Vec<u8> {
        let mut image = vec![0u8; TOTAL_SECTORS as usize * 512];
        image[11..13].copy_from_slice(&512u16.to_le_bytes());
        image[13] = 1; // sectors per cluster
        image[14..16].copy_from_slice(&RESERVED.to_le_bytes());
        image[16] = 2; // fat count
        image[32..36].copy_from_slice(&TOTAL_SECTORS.to_le_bytes());
        image[36..40].copy_from_slice(&SECTORS_PER_FAT.to_le_bytes());
        image[44..48].copy_from_slice(&2u32.to_le_bytes()); // root cluster
        image[48..50].copy_from_slice(&1u16.to_le_bytes()); // fs info sector
        image[71..82].copy_from_slice(b"DRIFTVOL   ");
        image[510] = 0x55;
        image[511] = 0xAA;

        let fs_info = fs_info::build_sector(DATA_CLUSTERS - 1, 2);
        image[512..1024].copy_from_slice(&fs_info);

        // Root directory occupies cluster 2.
        set_fat(&mut image, 2, END_OF_CHAIN);
        image
    }

    async fn mounted(image: Vec<u8>) -> FatVolume<RamDevice> {
        FatVolume::mount(RamDevice::new(image)).await.unwrap()
    }

    #[tokio::test]
    async fn mount_reads_label_and_free_count() {
        let volume = mounted(test_image()).await;
        assert_eq!(volume.volume_label(), "DRIFTVOL");
        assert_eq!(volume.free_cluster_count(), Some(DATA_CLUSTERS - 1));
    }

    #[tokio::test]
    async fn mount_rejects_missing_signature() {
        let mut image = test_image();
        image[510] = 0;
        let err = FatVolume::mount(RamDevice::new(image)).await.unwrap_err();
        assert!(matches!(err, Error::CorruptFilesystem(_)));
    }

    #[tokio::test]
    async fn mount_survives_a_damaged_fs_info_sector() {
        let mut image = test_image();
        image[512..1024].fill(0);
        let volume = mounted(image).await;
        assert_eq!(volume.free_cluster_count(), None);
    }

    #[tokio::test]
    async fn mounts_a_4096_byte_sector_volume_on_4096_byte_blocks() {
        // 4096-byte sectors on a device with matching block granularity:
        // every transfer, FSInfo included, must be whole 4096-byte blocks.
        const BPS: usize = 4096;
        let total_sectors = 68u32; // 2 reserved + 2 FATs of 1 sector + 64 data
        let mut image = vec![0u8; total_sectors as usize * BPS];
        image[11..13].copy_from_slice(&(BPS as u16).to_le_bytes());
        image[13] = 1;
        image[14..16].copy_from_slice(&2u16.to_le_bytes()); // reserved
        image[16] = 2; // fat count
        image[32..36].copy_from_slice(&total_sectors.to_le_bytes());
        image[36..40].copy_from_slice(&1u32.to_le_bytes()); // sectors per fat
        image[44..48].copy_from_slice(&2u32.to_le_bytes()); // root cluster
        image[48..50].copy_from_slice(&1u16.to_le_bytes()); // fs info sector
        image[71..82].copy_from_slice(b"BIGSECTOR  ");
        image[510] = 0x55;
        image[511] = 0xAA;
        image[BPS..BPS + 512].copy_from_slice(&fs_info::build_sector(63, 2));
        for fat in [2 * BPS, 3 * BPS] {
            image[fat + 8..fat + 12].copy_from_slice(&END_OF_CHAIN.to_le_bytes());
        }

        let device = RamDevice {
            data: image,
            block_size: BPS as u32,
        };
        let mut volume = FatVolume::mount(device).await.unwrap();
        assert_eq!(volume.volume_label(), "BIGSECTOR");
        assert_eq!(volume.free_cluster_count(), Some(63));
        assert!(volume.root_dir().await.unwrap().is_empty());
        volume.flush().await.unwrap();
    }

    #[tokio::test]
    async fn chain_walk_follows_links_to_end_of_chain() {
        let mut image = test_image();
        set_fat(&mut image, 2, 3);
        set_fat(&mut image, 3, 4);
        set_fat(&mut image, 4, 0x0FFF_FFFF);
        let mut volume = mounted(image).await;
        let chain = volume.open_chain(2).await.unwrap();
        assert_eq!(chain.clusters(), &[2, 3, 4]);
    }

    #[tokio::test]
    async fn chain_cycle_is_corruption_not_a_hang() {
        let mut image = test_image();
        set_fat(&mut image, 2, 3);
        set_fat(&mut image, 3, 2);
        let mut volume = mounted(image).await;
        let err = volume.open_chain(2).await.unwrap_err();
        assert_eq!(err, Error::CorruptFilesystem("cycle in cluster chain"));
    }

    #[tokio::test]
    async fn chain_to_out_of_range_cluster_is_corruption() {
        let mut image = test_image();
        set_fat(&mut image, 2, DATA_CLUSTERS + 10);
        let mut volume = mounted(image).await;
        assert!(matches!(
            volume.open_chain(2).await.unwrap_err(),
            Error::CorruptFilesystem(_)
        ));
    }

    #[tokio::test]
    async fn fat_entry_reserved_bits_survive_and_classify() {
        let mut image = test_image();
        // Top nibble set by some other implementation; must be preserved.
        set_fat(&mut image, 5, 0xA000_0006);
        let mut volume = mounted(image).await;
        assert_eq!(
            volume.fat.next_cluster(&mut volume.device, 5).await.unwrap(),
            FatEntry::Next(6)
        );
        volume.fat.write_entry(&mut volume.device, 5, END_OF_CHAIN).await.unwrap();
        let raw = u32::from_le_bytes(
            volume.device.data[FAT0 + 5 * 4..FAT0 + 5 * 4 + 4].try_into().unwrap(),
        );
        assert_eq!(raw, 0xAFFF_FFFF);
    }

    #[tokio::test]
    async fn allocation_is_next_fit_and_mirrored() {
        let mut image = test_image();
        // Burn clusters 3 and 4 so the scan has to skip them.
        set_fat(&mut image, 3, END_OF_CHAIN);
        set_fat(&mut image, 4, END_OF_CHAIN);
        let mut volume = mounted(image).await;
        let first = volume.fat.allocate(&mut volume.device, None).await.unwrap();
        assert_eq!(first, 5);
        let second = volume.fat.allocate(&mut volume.device, Some(first)).await.unwrap();
        assert_eq!(second, 6);
        // The tail was relinked and both FAT copies saw every write.
        for base in [FAT0, FAT1] {
            let entry5 = u32::from_le_bytes(
                volume.device.data[base + 5 * 4..base + 5 * 4 + 4].try_into().unwrap(),
            );
            let entry6 = u32::from_le_bytes(
                volume.device.data[base + 6 * 4..base + 6 * 4 + 4].try_into().unwrap(),
            );
            assert_eq!(entry5 & 0x0FFF_FFFF, 6);
            assert_eq!(entry6 & 0x0FFF_FFFF, 0x0FFF_FFFF);
        }
    }

    #[tokio::test]
    async fn non_mirrored_writes_touch_only_the_valid_fat() {
        let mut image = test_image();
        image[40..42].copy_from_slice(&0x0081u16.to_le_bytes()); // valid fat = 1
        let mut volume = mounted(image).await;
        volume.fat.write_entry(&mut volume.device, 10, END_OF_CHAIN).await.unwrap();
        let in_fat0 = u32::from_le_bytes(
            volume.device.data[FAT0 + 10 * 4..FAT0 + 10 * 4 + 4].try_into().unwrap(),
        );
        let in_fat1 = u32::from_le_bytes(
            volume.device.data[FAT1 + 10 * 4..FAT1 + 10 * 4 + 4].try_into().unwrap(),
        );
        assert_eq!(in_fat0, 0);
        assert_eq!(in_fat1, 0x0FFF_FFFF);
    }

    #[tokio::test]
    async fn root_listing_and_file_read() {
        let mut image = test_image();
        // A 600-byte file spanning clusters 3 and 4.
        set_fat(&mut image, 3, 4);
        set_fat(&mut image, 4, END_OF_CHAIN);
        let content: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        cluster_slice(&mut image, 3).copy_from_slice(&{
            let mut s = content[..512].to_vec();
            s.resize(512, 0);
            s
        });
        cluster_slice(&mut image, 4)[..88].copy_from_slice(&content[512..]);

        let short = ShortEntry::new(dir::to_short_name("notes.txt"), ATTR_ARCHIVE, 3, 600);
        let entry_bytes = dir::encode_entry("notes.txt", &short);
        cluster_slice(&mut image, 2)[..entry_bytes.len()].copy_from_slice(&entry_bytes);

        let mut volume = mounted(image).await;
        let entries = volume.root_dir().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "notes.txt");
        assert_eq!(entries[0].file_size(), 600);
        let read_back = volume.read_file(&entries[0]).await.unwrap();
        assert_eq!(read_back, content);
    }

    #[tokio::test]
    async fn create_and_remove_directory_entries() {
        let mut volume = mounted(test_image()).await;
        let short = ShortEntry::new(dir::to_short_name("report 2024.pdf"), ATTR_ARCHIVE, 0, 0);
        volume.create_entry(2, "report 2024.pdf", short).await.unwrap();

        let entries = volume.root_dir().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "report 2024.pdf");

        assert!(volume.remove_entry(2, "report 2024.pdf").await.unwrap());
        assert!(volume.root_dir().await.unwrap().is_empty());
        assert!(!volume.remove_entry(2, "report 2024.pdf").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let mut volume = mounted(test_image()).await;
        let free_before = volume.free_cluster_count().unwrap();
        volume.create_file(2, "notes.txt", b"one").await.unwrap();

        let err = volume.create_file(2, "notes.txt", b"two").await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        // Case differences do not make a new name.
        let err = volume.create_file(2, "NOTES.TXT", b"two").await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        // Distinct long names that collapse to the same generated 8.3 name.
        volume
            .create_file(2, "quarterly report a.txt", b"a")
            .await
            .unwrap();
        let err = volume
            .create_file(2, "quarterly report b.txt", b"b")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        // Rejected creates allocated nothing.
        assert_eq!(volume.root_dir().await.unwrap().len(), 2);
        assert_eq!(volume.free_cluster_count(), Some(free_before - 2));
    }

    #[tokio::test]
    async fn file_round_trip_through_the_volume_api() {
        let mut volume = mounted(test_image()).await;
        let before = volume.free_cluster_count().unwrap();
        let content: Vec<u8> = (0..700u32).map(|i| (i % 251) as u8).collect();
        volume.create_file(2, "measurements.csv", &content).await.unwrap();
        assert_eq!(volume.free_cluster_count(), Some(before - 2));

        let entries = volume.root_dir().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "measurements.csv");
        assert_eq!(volume.read_file(&entries[0]).await.unwrap(), content);

        assert!(volume.delete_file(2, "measurements.csv").await.unwrap());
        assert!(volume.root_dir().await.unwrap().is_empty());
        assert_eq!(volume.free_cluster_count(), Some(before));
    }

    #[tokio::test]
    async fn empty_file_gets_no_cluster_chain() {
        let mut volume = mounted(test_image()).await;
        let before = volume.free_cluster_count().unwrap();
        volume.create_file(2, "empty.log", &[]).await.unwrap();
        let entries = volume.root_dir().await.unwrap();
        assert_eq!(entries[0].first_cluster(), 0);
        assert_eq!(entries[0].file_size(), 0);
        assert_eq!(volume.free_cluster_count(), Some(before));
        assert_eq!(volume.read_file(&entries[0]).await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn growing_a_chain_updates_the_free_count() {
        let mut volume = mounted(test_image()).await;
        let before = volume.free_cluster_count().unwrap();
        let start = volume.fat.allocate(&mut volume.device, None).await.unwrap();
        let mut chain = volume.open_chain(start).await.unwrap();
        assert_eq!(chain.cluster_count(), 1);

        let data = vec![0xABu8; 1500]; // needs three 512-byte clusters
        volume.write_chain(&mut chain, 0, &data).await.unwrap();
        assert_eq!(chain.cluster_count(), 3);
        assert_eq!(volume.free_cluster_count(), Some(before - 2));

        let mut read_back = vec![0u8; 1500];
        volume.read_chain(&chain, 0, &mut read_back).await.unwrap();
        assert_eq!(read_back, data);

        let freed = volume.free_chain(start).await.unwrap();
        assert_eq!(freed, 3);
        assert_eq!(volume.free_cluster_count(), Some(before + 1));
    }
}
