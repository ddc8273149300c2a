//! The FAT32 boot sector, parsed once at mount time into an immutable
//! geometry snapshot.

use crate::error::{Error, Result};

const BYTES_PER_SECTOR_OFF: usize = 11;
const SECTORS_PER_CLUSTER_OFF: usize = 13;
const RESERVED_COUNT_OFF: usize = 14;
const FAT_COUNT_OFF: usize = 16;
const TOTAL_SECTORS_OFF: usize = 32;
const SECTORS_PER_FAT_OFF: usize = 36;
const FLAGS_OFF: usize = 40;
const ROOT_DIR_CLUSTER_OFF: usize = 44;
const FS_INFO_SECTOR_OFF: usize = 48;
// The canonical FAT32 extended BPB puts the volume label at offset 71.
// Offset 48 is the FSInfo sector number; older readers that take the label
// from 48 are replicating a layout bug, not the on-disk format.
const VOLUME_LABEL_OFF: usize = 71;

/// Geometry of a mounted FAT32 filesystem. All multi-byte fields on disk
/// are little endian. Cluster numbering starts at 2; clusters 0 and 1 are
/// reserved.
#[derive(Debug, Clone)]
pub struct BootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    /// Number of FAT copies, normally 2.
    pub fat_count: u8,
    pub total_sectors: u32,
    pub sectors_per_fat: u32,
    pub root_dir_start_cluster: u32,
    pub fs_info_start_sector: u16,
    /// All FAT copies hold the same data and every write goes to all of
    /// them. When clear, only [`BootSector::valid_fat`] is authoritative.
    pub fat_mirrored: bool,
    /// Index of the authoritative FAT when not mirrored.
    pub valid_fat: u8,
    pub volume_label: String,
}

impl BootSector {
    /// Reads the boot sector fields out of the first sector of the volume.
    ///
    /// Pure and total over a well-formed buffer: signature and geometry
    /// sanity checks are the mount path's job, see [`BootSector::validate`].
    pub fn parse(buffer: &[u8; 512]) -> Self {
        let le16 = |off: usize| u16::from_le_bytes([buffer[off], buffer[off + 1]]);
        let le32 = |off: usize| {
            u32::from_le_bytes([
                buffer[off],
                buffer[off + 1],
                buffer[off + 2],
                buffer[off + 3],
            ])
        };

        let flags = le16(FLAGS_OFF);
        // Low byte: bit 7 clear = mirrored, low 3 bits = valid FAT index.
        let fat_mirrored = flags & 0x80 == 0;
        let valid_fat = (flags & 0x7) as u8;

        let label_raw = &buffer[VOLUME_LABEL_OFF..VOLUME_LABEL_OFF + 11];
        let label_end = label_raw.iter().position(|&b| b == 0).unwrap_or(11);
        let volume_label = String::from_utf8_lossy(&label_raw[..label_end])
            .trim_end()
            .to_string();

        Self {
            bytes_per_sector: le16(BYTES_PER_SECTOR_OFF),
            sectors_per_cluster: buffer[SECTORS_PER_CLUSTER_OFF],
            reserved_sectors: le16(RESERVED_COUNT_OFF),
            fat_count: buffer[FAT_COUNT_OFF],
            total_sectors: le32(TOTAL_SECTORS_OFF),
            sectors_per_fat: le32(SECTORS_PER_FAT_OFF),
            root_dir_start_cluster: le32(ROOT_DIR_CLUSTER_OFF),
            fs_info_start_sector: le16(FS_INFO_SECTOR_OFF),
            fat_mirrored,
            valid_fat,
            volume_label,
        }
    }

    /// Sanity-checks the parsed geometry against a device of
    /// `device_capacity` bytes. Layered above [`BootSector::parse`] so that
    /// parsing stays total.
    pub fn validate(&self, device_capacity: u64) -> Result<()> {
        if !self.bytes_per_sector.is_power_of_two() || self.bytes_per_sector < 512 {
            return Err(Error::CorruptFilesystem(
                "bytes per sector is not a power of two >= 512",
            ));
        }
        if !self.sectors_per_cluster.is_power_of_two() {
            return Err(Error::CorruptFilesystem(
                "sectors per cluster is not a power of two",
            ));
        }
        if self.fat_count == 0 {
            return Err(Error::CorruptFilesystem("no FAT copies"));
        }
        if self.reserved_sectors == 0 {
            return Err(Error::CorruptFilesystem("no reserved sectors"));
        }
        if self.sectors_per_fat == 0 {
            return Err(Error::CorruptFilesystem("zero sectors per FAT"));
        }
        if self.root_dir_start_cluster < 2 {
            return Err(Error::CorruptFilesystem("root directory cluster below 2"));
        }
        if !self.fat_mirrored && self.valid_fat >= self.fat_count {
            return Err(Error::CorruptFilesystem("valid FAT index out of range"));
        }
        if self.total_sectors as u64 <= self.metadata_sectors() {
            return Err(Error::CorruptFilesystem(
                "total sectors smaller than the reserved and FAT areas",
            ));
        }
        if self.root_dir_start_cluster as u64 > self.total_clusters() as u64 + 1 {
            return Err(Error::CorruptFilesystem(
                "root directory cluster outside the data area",
            ));
        }
        let end_of_data =
            self.data_area_offset() + self.total_clusters() as u64 * self.bytes_per_cluster() as u64;
        if end_of_data > device_capacity {
            return Err(Error::CorruptFilesystem(
                "filesystem extends past device capacity",
            ));
        }
        Ok(())
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.sectors_per_cluster as u32 * self.bytes_per_sector as u32
    }

    /// Byte offset of FAT copy `fat_number` from the start of the volume.
    pub fn fat_offset(&self, fat_number: u32) -> u64 {
        self.bytes_per_sector as u64
            * (self.reserved_sectors as u64 + fat_number as u64 * self.sectors_per_fat as u64)
    }

    /// Byte offset of the data area, where directory and file contents live.
    pub fn data_area_offset(&self) -> u64 {
        self.fat_offset(0)
            + self.fat_count as u64 * self.sectors_per_fat as u64 * self.bytes_per_sector as u64
    }

    /// Sectors taken by the reserved area and every FAT copy.
    fn metadata_sectors(&self) -> u64 {
        self.reserved_sectors as u64 + self.fat_count as u64 * self.sectors_per_fat as u64
    }

    /// Number of data clusters. Chains may reference clusters
    /// `2..=total_clusters + 1`. Saturates to zero when the boot sector
    /// claims fewer sectors than its own metadata takes; [`validate`]
    /// rejects such geometry, but this must stay total on raw parses.
    ///
    /// [`validate`]: BootSector::validate
    pub fn total_clusters(&self) -> u32 {
        let data_sectors = (self.total_sectors as u64).saturating_sub(self.metadata_sectors());
        match self.sectors_per_cluster {
            0 => 0,
            spc => (data_sectors / spc as u64) as u32,
        }
    }

    /// Byte offset of a data cluster from the start of the volume.
    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_area_offset() + (cluster as u64 - 2) * self.bytes_per_cluster() as u64
    }
}
