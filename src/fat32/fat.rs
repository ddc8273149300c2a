//! The File Allocation Table: 32-bit successor entries, one per cluster,
//! plus free-cluster allocation.

use std::collections::HashSet;

use tracing::trace;

use super::boot_sector::BootSector;
use crate::BlockDevice;
use crate::error::{Error, Result};

/// Only the low 28 bits of a FAT32 entry address a cluster. The top 4 bits
/// are reserved and must survive a rewrite of the entry untouched.
pub const ENTRY_MASK: u32 = 0x0FFF_FFFF;

/// The end-of-chain marker this driver writes. Anything in
/// `0x0FFFFFF8..=0x0FFFFFFF` reads back as end-of-chain.
pub const END_OF_CHAIN: u32 = 0x0FFF_FFFF;

const BAD_CLUSTER: u32 = 0x0FFF_FFF7;

/// Classification of one FAT entry value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatEntry {
    Free,
    Reserved,
    /// Pointer to the next cluster of the chain.
    Next(u32),
    Bad,
    EndOfChain,
}

/// Classifies a raw 32-bit FAT slot. Applies [`ENTRY_MASK`] itself.
pub fn classify(raw: u32) -> FatEntry {
    match raw & ENTRY_MASK {
        0 => FatEntry::Free,
        1 => FatEntry::Reserved,
        BAD_CLUSTER => FatEntry::Bad,
        0x0FFF_FFF8..=0x0FFF_FFFF => FatEntry::EndOfChain,
        0x0FFF_FFF0..=0x0FFF_FFF6 => FatEntry::Reserved,
        next => FatEntry::Next(next),
    }
}

/// Reads and mutates the FAT copies of one volume.
///
/// Reads go through a one-sector cache (FAT access is extremely local:
/// walking a chain usually touches the same sector repeatedly). Writes are
/// replicated to every copy when the volume is mirrored; that replication is
/// not atomic across copies, which is a limitation FAT32 itself has.
#[derive(Debug)]
pub struct Fat {
    boot: BootSector,
    /// (absolute byte offset of the cached FAT sector, its contents)
    cache: Option<(u64, Vec<u8>)>,
    /// Where the next free-cluster scan starts: the last allocated cluster,
    /// approximating FAT's next-fit convention to reduce fragmentation.
    alloc_hint: u32,
}

impl Fat {
    pub fn new(boot: BootSector, alloc_hint: u32) -> Self {
        let alloc_hint = if (2..=boot.total_clusters() + 1).contains(&alloc_hint) {
            alloc_hint
        } else {
            2
        };
        Self {
            boot,
            cache: None,
            alloc_hint,
        }
    }

    /// The cluster most recently handed out, for FSInfo write-back.
    pub fn alloc_hint(&self) -> u32 {
        self.alloc_hint
    }

    /// Highest cluster number a chain may legally reference.
    fn max_cluster(&self) -> u32 {
        self.boot.total_clusters() + 1
    }

    /// The FAT copy reads come from: copy 0 when mirrored (they are all
    /// identical), otherwise the one the boot sector marks valid.
    fn active_fat(&self) -> u32 {
        if self.boot.fat_mirrored {
            0
        } else {
            self.boot.valid_fat as u32
        }
    }

    fn entry_offset(&self, fat_number: u32, cluster: u32) -> u64 {
        self.boot.fat_offset(fat_number) + 4 * cluster as u64
    }

    async fn read_fat_sector<D: BlockDevice>(
        &mut self,
        device: &mut D,
        sector_offset: u64,
    ) -> Result<&[u8]> {
        let hit = matches!(&self.cache, Some((off, _)) if *off == sector_offset);
        if !hit {
            let mut buf = vec![0u8; self.boot.bytes_per_sector as usize];
            device
                .read_blocks(sector_offset / device.block_size() as u64, &mut buf)
                .await?;
            self.cache = Some((sector_offset, buf));
        }
        Ok(&self.cache.as_ref().unwrap().1)
    }

    /// Raw 32-bit slot for `cluster`, unmasked.
    async fn read_raw<D: BlockDevice>(&mut self, device: &mut D, cluster: u32) -> Result<u32> {
        let offset = self.entry_offset(self.active_fat(), cluster);
        let bps = self.boot.bytes_per_sector as u64;
        let sector_offset = offset - offset % bps;
        let index = (offset % bps) as usize;
        let sector = self.read_fat_sector(device, sector_offset).await?;
        Ok(u32::from_le_bytes([
            sector[index],
            sector[index + 1],
            sector[index + 2],
            sector[index + 3],
        ]))
    }

    /// Classified successor entry of `cluster`.
    pub async fn next_cluster<D: BlockDevice>(
        &mut self,
        device: &mut D,
        cluster: u32,
    ) -> Result<FatEntry> {
        if !(2..=self.max_cluster()).contains(&cluster) {
            return Err(Error::CorruptFilesystem("cluster number out of range"));
        }
        Ok(classify(self.read_raw(device, cluster).await?))
    }

    /// Resolves the whole chain starting at `start_cluster`, in order.
    ///
    /// The chain is materialized up front rather than yielded lazily:
    /// every link is validated before any data I/O happens, and successive
    /// entries almost always share a FAT sector, so the walk costs a
    /// handful of cached sector reads.
    ///
    /// Fails with [`Error::CorruptFilesystem`] if the chain revisits a
    /// cluster before reaching an end-of-chain marker, references a cluster
    /// outside the data area, or runs into a free/bad entry.
    pub async fn chain<D: BlockDevice>(
        &mut self,
        device: &mut D,
        start_cluster: u32,
    ) -> Result<Vec<u32>> {
        let mut clusters = Vec::new();
        let mut seen = HashSet::new();
        let mut current = start_cluster;
        loop {
            if !(2..=self.max_cluster()).contains(&current) {
                return Err(Error::CorruptFilesystem("chain references cluster out of range"));
            }
            if !seen.insert(current) {
                return Err(Error::CorruptFilesystem("cycle in cluster chain"));
            }
            clusters.push(current);
            match classify(self.read_raw(device, current).await?) {
                FatEntry::Next(next) => current = next,
                FatEntry::EndOfChain => break,
                FatEntry::Free => {
                    return Err(Error::CorruptFilesystem("chain runs into a free cluster"));
                }
                FatEntry::Reserved => {
                    return Err(Error::CorruptFilesystem(
                        "chain runs into a reserved cluster",
                    ));
                }
                FatEntry::Bad => {
                    return Err(Error::CorruptFilesystem("chain runs into a bad cluster"));
                }
            }
        }
        Ok(clusters)
    }

    /// Writes `value` into the slot for `cluster`, preserving the reserved
    /// top 4 bits of the old entry. Replicated to every FAT copy when
    /// mirrored, otherwise only to the valid copy.
    pub async fn write_entry<D: BlockDevice>(
        &mut self,
        device: &mut D,
        cluster: u32,
        value: u32,
    ) -> Result<()> {
        if !(2..=self.max_cluster()).contains(&cluster) {
            return Err(Error::CorruptFilesystem("cluster number out of range"));
        }
        let copies: Vec<u32> = if self.boot.fat_mirrored {
            (0..self.boot.fat_count as u32).collect()
        } else {
            vec![self.boot.valid_fat as u32]
        };
        let bps = self.boot.bytes_per_sector as u64;
        for fat_number in copies {
            let offset = self.entry_offset(fat_number, cluster);
            let sector_offset = offset - offset % bps;
            let index = (offset % bps) as usize;

            let mut sector = vec![0u8; bps as usize];
            device
                .read_blocks(sector_offset / device.block_size() as u64, &mut sector)
                .await?;
            let old = u32::from_le_bytes([
                sector[index],
                sector[index + 1],
                sector[index + 2],
                sector[index + 3],
            ]);
            let merged = (old & !ENTRY_MASK) | (value & ENTRY_MASK);
            sector[index..index + 4].copy_from_slice(&merged.to_le_bytes());
            device
                .write_blocks(sector_offset / device.block_size() as u64, &sector)
                .await?;
            if let Some((cached_offset, cached)) = &mut self.cache
                && *cached_offset == sector_offset
            {
                cached[index..index + 4].copy_from_slice(&merged.to_le_bytes());
            }
        }
        trace!(cluster, value, "fat entry written");
        Ok(())
    }

    /// Allocates one free cluster and marks it end-of-chain. When `previous`
    /// is given the old tail is relinked to point at the new cluster,
    /// extending that chain.
    ///
    /// The scan runs in ascending cluster order starting at the last
    /// allocated cluster and wraps around once.
    pub async fn allocate<D: BlockDevice>(
        &mut self,
        device: &mut D,
        previous: Option<u32>,
    ) -> Result<u32> {
        let max = self.max_cluster();
        let start = self.alloc_hint.max(2);
        let candidates = (start..=max).chain(2..start);
        let mut found = None;
        for candidate in candidates {
            if classify(self.read_raw(device, candidate).await?) == FatEntry::Free {
                found = Some(candidate);
                break;
            }
        }
        let new_cluster = found.ok_or(Error::NoSpace)?;
        self.write_entry(device, new_cluster, END_OF_CHAIN).await?;
        if let Some(tail) = previous {
            self.write_entry(device, tail, new_cluster).await?;
        }
        self.alloc_hint = new_cluster;
        trace!(new_cluster, ?previous, "cluster allocated");
        Ok(new_cluster)
    }

    /// Frees every cluster of the chain starting at `start_cluster` and
    /// returns how many were freed.
    pub async fn free_chain<D: BlockDevice>(
        &mut self,
        device: &mut D,
        start_cluster: u32,
    ) -> Result<u32> {
        let clusters = self.chain(device, start_cluster).await?;
        for &cluster in &clusters {
            self.write_entry(device, cluster, 0).await?;
        }
        Ok(clusters.len() as u32)
    }
}
