//! Cluster-chain walking and the byte-level address translation built on
//! top of it: file offset -> (cluster, offset within cluster) -> absolute
//! device bytes -> block reads and writes.

use tracing::trace;

use super::boot_sector::BootSector;
use super::fat::Fat;
use crate::BlockDevice;
use crate::error::{Error, Result};

/// A resolved cluster chain for one file or directory.
///
/// The chain is resolved eagerly at open time (cycle and range checks
/// happen there, in [`Fat::chain`]) and re-used for every read and write
/// against the object until it is dropped.
#[derive(Debug)]
pub struct ClusterChain {
    clusters: Vec<u32>,
    bytes_per_cluster: u32,
}

impl ClusterChain {
    /// Resolves the chain starting at `start_cluster`.
    pub async fn open<D: BlockDevice>(
        boot: &BootSector,
        fat: &mut Fat,
        device: &mut D,
        start_cluster: u32,
    ) -> Result<Self> {
        let clusters = fat.chain(device, start_cluster).await?;
        Ok(Self {
            clusters,
            bytes_per_cluster: boot.bytes_per_cluster(),
        })
    }

    pub fn clusters(&self) -> &[u32] {
        &self.clusters
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    /// Capacity of the chain in bytes (not the logical file size, which the
    /// directory entry tracks).
    pub fn len_bytes(&self) -> u64 {
        self.clusters.len() as u64 * self.bytes_per_cluster as u64
    }

    /// Reads `buf.len()` bytes starting at byte `offset` within the chain.
    ///
    /// Reading past the end of the chain is refused: the caller sized the
    /// request wrongly, and truncating it silently would hand back garbage.
    pub async fn read_at<D: BlockDevice>(
        &self,
        boot: &BootSector,
        device: &mut D,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        if offset + buf.len() as u64 > self.len_bytes() {
            return Err(Error::InvalidArgument("read past the end of the chain"));
        }
        let bpc = self.bytes_per_cluster as u64;
        let mut position = offset;
        let mut filled = 0usize;
        while filled < buf.len() {
            let cluster = self.clusters[(position / bpc) as usize];
            let within = position % bpc;
            let chunk = ((bpc - within) as usize).min(buf.len() - filled);
            let absolute = boot.cluster_offset(cluster) + within;
            read_bytes(device, absolute, &mut buf[filled..filled + chunk]).await?;
            position += chunk as u64;
            filled += chunk;
        }
        Ok(())
    }

    /// Writes `data` at byte `offset` within the chain, extending the chain
    /// with freshly allocated clusters when the write lands past its end.
    /// Returns how many clusters were allocated, for free-count accounting.
    pub async fn write_at<D: BlockDevice>(
        &mut self,
        boot: &BootSector,
        fat: &mut Fat,
        device: &mut D,
        offset: u64,
        data: &[u8],
    ) -> Result<u32> {
        let needed = offset + data.len() as u64;
        let mut allocated = 0u32;
        while self.len_bytes() < needed {
            let tail = self.clusters.last().copied();
            let fresh = fat.allocate(device, tail).await?;
            self.clusters.push(fresh);
            allocated += 1;
            trace!(fresh, "chain extended");
        }
        let bpc = self.bytes_per_cluster as u64;
        let mut position = offset;
        let mut written = 0usize;
        while written < data.len() {
            let cluster = self.clusters[(position / bpc) as usize];
            let within = position % bpc;
            let chunk = ((bpc - within) as usize).min(data.len() - written);
            let absolute = boot.cluster_offset(cluster) + within;
            write_bytes(device, absolute, &data[written..written + chunk]).await?;
            position += chunk as u64;
            written += chunk;
        }
        Ok(allocated)
    }
}

/// Reads an arbitrary byte range, bridging the block granularity of the
/// device with a scratch read when the range is not block aligned.
pub async fn read_bytes<D: BlockDevice>(
    device: &mut D,
    offset: u64,
    buf: &mut [u8],
) -> Result<()> {
    let bs = device.block_size() as u64;
    let head = offset % bs;
    if head == 0 && buf.len() as u64 % bs == 0 {
        return device.read_blocks(offset / bs, buf).await;
    }
    let span = (head + buf.len() as u64).div_ceil(bs) * bs;
    let mut scratch = vec![0u8; span as usize];
    device.read_blocks(offset / bs, &mut scratch).await?;
    buf.copy_from_slice(&scratch[head as usize..head as usize + buf.len()]);
    Ok(())
}

/// Writes an arbitrary byte range; unaligned edges are handled with a
/// read-modify-write of the containing blocks.
pub async fn write_bytes<D: BlockDevice>(device: &mut D, offset: u64, data: &[u8]) -> Result<()> {
    let bs = device.block_size() as u64;
    let head = offset % bs;
    if head == 0 && data.len() as u64 % bs == 0 {
        return device.write_blocks(offset / bs, data).await;
    }
    let span = (head + data.len() as u64).div_ceil(bs) * bs;
    let mut scratch = vec![0u8; span as usize];
    device.read_blocks(offset / bs, &mut scratch).await?;
    scratch[head as usize..head as usize + data.len()].copy_from_slice(data);
    device.write_blocks(offset / bs, &scratch).await
}
