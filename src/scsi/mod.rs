//! SCSI block device layer: turns the bulk-only transport into a readable
//! and writable array of fixed-size blocks.
//!
//! SCSI protocol and format implementation as described in:
//! - SCSI Primary Commands – 2 (SPC-2):
//!   <https://www.rockbox.org/wiki/pub/Main/DataSheets/spc2r20.pdf>
//! - SCSI Block Commands – 2 (SBC-2)
//!   <https://raw.githubusercontent.com/carmark/papers/master/storage/scsi/sbc2r16.pdf>

pub mod command;
pub mod response;

use tracing::{debug, info, warn};

use crate::BlockDevice;
use crate::error::{Error, Result};
use crate::usb::UsbTransport;
use crate::usb::bot::{BulkOnlyTransport, DataPhase};
use command::{READ_CAPACITY_LENGTH, REQUEST_SENSE_LENGTH, ScsiCommand};
use response::{Capacity, InquiryResponse, SenseData};

/// How many TEST UNIT READY / INQUIRY rounds to attempt before giving up on
/// a device that never becomes ready.
const INIT_ATTEMPTS: usize = 5;

/// One logical unit of a mass storage device, addressable by block.
///
/// Commands against this unit are strictly serialized; if an embedding
/// application talks to several LUNs it must create one of these per LUN
/// and serialize across them itself.
pub struct ScsiBlockDevice<T: UsbTransport> {
    bot: BulkOnlyTransport<T>,
    inquiry: InquiryResponse,
    capacity: Capacity,
}

impl<T: UsbTransport> ScsiBlockDevice<T> {
    /// Performs SCSI initialization on the unit and returns a device ready
    /// for block I/O.
    ///
    /// The sequence follows what desktop operating systems were observed to
    /// do on the wire: repeat TEST UNIT READY followed by INQUIRY until both
    /// succeed back to back, then READ CAPACITY. A failed command is
    /// followed by REQUEST SENSE so the device can clear its pending sense
    /// state.
    pub async fn new(transport: T, lun: u8) -> Result<Self> {
        if lun > 15 {
            return Err(Error::InvalidArgument("lun must be 0..=15"));
        }
        let mut bot = BulkOnlyTransport::new(transport, lun);

        info!(lun, "starting device configuration");
        let mut inquiry = None;
        for attempt in 1..=INIT_ATTEMPTS {
            debug!(attempt, "submitting TEST UNIT READY");
            match bot.execute(&ScsiCommand::TestUnitReady, DataPhase::None).await {
                Ok(_) => {}
                Err(Error::CommandFailed) => {
                    let sense = Self::fetch_sense(&mut bot).await?;
                    warn!(?sense, "unit not ready");
                    continue;
                }
                Err(e) => return Err(e),
            }

            debug!(attempt, "submitting INQUIRY");
            let mut buf = [0u8; 36];
            match bot
                .execute(&ScsiCommand::Inquiry, DataPhase::In(&mut buf))
                .await
            {
                Ok(_) => {
                    inquiry = Some(InquiryResponse::parse(&buf)?);
                    break;
                }
                Err(Error::CommandFailed) => {
                    let sense = Self::fetch_sense(&mut bot).await?;
                    warn!(?sense, "inquiry failed");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        let inquiry =
            inquiry.ok_or(Error::Transfer("device never became ready".into()))?;
        info!(
            vendor = %inquiry.vendor_id,
            product = %inquiry.product_id,
            "device identified"
        );

        debug!("submitting READ CAPACITY (10)");
        let mut buf = [0u8; READ_CAPACITY_LENGTH as usize];
        bot.execute(&ScsiCommand::ReadCapacity10, DataPhase::In(&mut buf))
            .await?;
        let capacity = Capacity::parse(&buf)?;
        info!(
            last_block = capacity.last_block_address,
            block_size = capacity.block_size,
            "capacity read"
        );

        Ok(Self {
            bot,
            inquiry,
            capacity,
        })
    }

    pub fn inquiry(&self) -> &InquiryResponse {
        &self.inquiry
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    /// Total usable size of the unit in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        (self.capacity.last_block_address as u64 + 1) * self.capacity.block_size as u64
    }

    /// Fetches the sense data explaining the most recent command failure.
    pub async fn request_sense(&mut self) -> Result<SenseData> {
        Self::fetch_sense(&mut self.bot).await
    }

    async fn fetch_sense(bot: &mut BulkOnlyTransport<T>) -> Result<SenseData> {
        let mut buf = [0u8; REQUEST_SENSE_LENGTH as usize];
        bot.execute(&ScsiCommand::RequestSense, DataPhase::In(&mut buf))
            .await?;
        SenseData::parse(&buf)
    }

    /// Reads whole blocks starting at `block_address`. The buffer length
    /// must be a multiple of the block size. Returns the residue the device
    /// reported; a non-zero residue on success means a short transfer, which
    /// the caller must handle rather than trust the tail of the buffer.
    pub async fn read_blocks(&mut self, block_address: u32, buf: &mut [u8]) -> Result<u32> {
        let cmd =
            ScsiCommand::read10(block_address, buf.len() as u32, self.capacity.block_size)?;
        self.bot.execute(&cmd, DataPhase::In(buf)).await
    }

    /// Writes whole blocks starting at `block_address`; same length rules as
    /// [`ScsiBlockDevice::read_blocks`]. A partially completed write must
    /// not be assumed durable; re-issue from the last confirmed block.
    pub async fn write_blocks(&mut self, block_address: u32, buf: &[u8]) -> Result<u32> {
        let cmd =
            ScsiCommand::write10(block_address, buf.len() as u32, self.capacity.block_size)?;
        self.bot.execute(&cmd, DataPhase::Out(buf)).await
    }
}

impl<T: UsbTransport> BlockDevice for ScsiBlockDevice<T> {
    fn block_size(&self) -> u32 {
        self.capacity.block_size
    }

    fn block_count(&self) -> u64 {
        self.capacity.last_block_address as u64 + 1
    }

    async fn read_blocks(&mut self, block_address: u64, buf: &mut [u8]) -> Result<()> {
        let lba = u32::try_from(block_address)
            .map_err(|_| Error::InvalidArgument("block address beyond 32 bits"))?;
        let residue = ScsiBlockDevice::read_blocks(self, lba, buf).await?;
        if residue != 0 {
            return Err(Error::Transfer(format!(
                "short read: {residue} bytes missing"
            )));
        }
        Ok(())
    }

    async fn write_blocks(&mut self, block_address: u64, buf: &[u8]) -> Result<()> {
        let lba = u32::try_from(block_address)
            .map_err(|_| Error::InvalidArgument("block address beyond 32 bits"))?;
        let residue = ScsiBlockDevice::write_blocks(self, lba, buf).await?;
        if residue != 0 {
            return Err(Error::Transfer(format!(
                "short write: {residue} bytes missing"
            )));
        }
        Ok(())
    }
}
