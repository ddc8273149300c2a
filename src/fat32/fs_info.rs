//! The FSInfo sector: a cached free-cluster count and next-free hint so
//! mounts do not have to scan the whole FAT.

use tracing::debug;

use crate::BlockDevice;
use crate::error::{Error, Result};

const LEAD_SIGNATURE_OFF: usize = 0;
const STRUCT_SIGNATURE_OFF: usize = 484;
const FREE_COUNT_OFF: usize = 488;
const NEXT_FREE_OFF: usize = 492;
const TRAIL_SIGNATURE_OFF: usize = 508;

const LEAD_SIGNATURE: u32 = 0x41615252;
const STRUCT_SIGNATURE: u32 = 0x61417272;
const TRAIL_SIGNATURE: u32 = 0xAA550000;

/// Both counters may legitimately hold this, meaning "unknown".
pub const INVALID_VALUE: u32 = 0xFFFF_FFFF;

/// In-memory copy of the FSInfo sector, written back on flush.
#[derive(Debug)]
pub struct FsInfo {
    /// Absolute byte offset of the sector on the device.
    offset: u64,
    buffer: Vec<u8>,
}

impl FsInfo {
    /// Reads and validates the FSInfo sector at byte `offset`.
    ///
    /// `sector_size` is the filesystem's bytes-per-sector; the mount path
    /// guarantees it is a whole number of device blocks, so the read honors
    /// the [`BlockDevice`] block granularity on 4096-byte-sector volumes
    /// too. The FSInfo fields all live inside the first 512 bytes.
    pub async fn read<D: BlockDevice>(
        device: &mut D,
        offset: u64,
        sector_size: usize,
    ) -> Result<Self> {
        let mut buffer = vec![0u8; sector_size.max(512)];
        device
            .read_blocks(offset / device.block_size() as u64, &mut buffer)
            .await?;
        let le32 = |off: usize| {
            u32::from_le_bytes([
                buffer[off],
                buffer[off + 1],
                buffer[off + 2],
                buffer[off + 3],
            ])
        };
        if le32(LEAD_SIGNATURE_OFF) != LEAD_SIGNATURE
            || le32(STRUCT_SIGNATURE_OFF) != STRUCT_SIGNATURE
            || le32(TRAIL_SIGNATURE_OFF) != TRAIL_SIGNATURE
        {
            return Err(Error::CorruptFilesystem("invalid fs info structure"));
        }
        Ok(Self { offset, buffer })
    }

    fn get(&self, off: usize) -> u32 {
        u32::from_le_bytes([
            self.buffer[off],
            self.buffer[off + 1],
            self.buffer[off + 2],
            self.buffer[off + 3],
        ])
    }

    fn set(&mut self, off: usize, value: u32) {
        self.buffer[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn free_cluster_count(&self) -> u32 {
        self.get(FREE_COUNT_OFF)
    }

    pub fn set_free_cluster_count(&mut self, value: u32) {
        self.set(FREE_COUNT_OFF, value);
    }

    /// Subtracts from the free count, unless it is unknown. Negative
    /// `clusters` adds (deallocation).
    pub fn adjust_free_cluster_count(&mut self, clusters: i64) {
        let current = self.free_cluster_count();
        if current != INVALID_VALUE {
            self.set_free_cluster_count((current as i64 - clusters) as u32);
        }
    }

    pub fn last_allocated_cluster_hint(&self) -> u32 {
        self.get(NEXT_FREE_OFF)
    }

    pub fn set_last_allocated_cluster_hint(&mut self, value: u32) {
        self.set(NEXT_FREE_OFF, value);
    }

    /// Writes the sector back to the device.
    pub async fn write<D: BlockDevice>(&self, device: &mut D) -> Result<()> {
        debug!("writing fs info to device");
        device
            .write_blocks(self.offset / device.block_size() as u64, &self.buffer)
            .await
    }
}

#[cfg(test)]
pub(crate) fn build_sector(free_count: u32, next_free: u32) -> [u8; 512] {
    let mut sector = [0u8; 512];
    sector[LEAD_SIGNATURE_OFF..LEAD_SIGNATURE_OFF + 4]
        .copy_from_slice(&LEAD_SIGNATURE.to_le_bytes());
    sector[STRUCT_SIGNATURE_OFF..STRUCT_SIGNATURE_OFF + 4]
        .copy_from_slice(&STRUCT_SIGNATURE.to_le_bytes());
    sector[TRAIL_SIGNATURE_OFF..TRAIL_SIGNATURE_OFF + 4]
        .copy_from_slice(&TRAIL_SIGNATURE.to_le_bytes());
    sector[FREE_COUNT_OFF..FREE_COUNT_OFF + 4].copy_from_slice(&free_count.to_le_bytes());
    sector[NEXT_FREE_OFF..NEXT_FREE_OFF + 4].copy_from_slice(&next_free.to_le_bytes());
    sector
}
