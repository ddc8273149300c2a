//! A USB mass storage driver: SCSI over the Bulk-Only Transport, with a
//! FAT32 filesystem layered on top of the resulting block address space.
//!
//! The stack, bottom up: a raw bulk pipe ([`usb::UsbTransport`]), the
//! three-phase CBW/CSW protocol engine ([`usb::bot`]), the SCSI command set
//! and block device ([`scsi`]), and the FAT32 metadata engine ([`fat32`]).
//! Device enumeration, endpoint claiming and raw transfer submission belong
//! to the host USB stack (nusb); partition tables and path APIs belong to
//! the embedding application.

pub mod error;
pub mod fat32;
pub mod scsi;
pub mod usb;

pub use error::{Error, Result};

/// A linear array of fixed-size blocks, the seam between the SCSI layer and
/// the filesystem.
///
/// Implementations are not expected to be thread safe; the filesystem
/// assumes single-writer access and the embedding application serializes
/// mutating operations against a volume.
#[allow(async_fn_in_trait)]
pub trait BlockDevice {
    /// Block size in bytes. Stable for the lifetime of the device.
    fn block_size(&self) -> u32;
    /// Total number of addressable blocks.
    fn block_count(&self) -> u64;
    /// Fills `buf` (a whole number of blocks) starting at `block_address`.
    async fn read_blocks(&mut self, block_address: u64, buf: &mut [u8]) -> Result<()>;
    /// Writes `buf` (a whole number of blocks) starting at `block_address`.
    async fn write_blocks(&mut self, block_address: u64, buf: &[u8]) -> Result<()>;
}
