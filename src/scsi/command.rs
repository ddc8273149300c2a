//! The SCSI commands this driver speaks, as a closed set of variants.
//!
//! Each variant knows its opcode, command block length, data phase
//! direction and transfer size, and how to encode its command-specific
//! bytes. Fields inside the command block are big endian per the SCSI
//! standard, unlike the little-endian CBW header that carries them.
//!
//! Definitions come from SCSI Primary Commands - 2 (SPC-2) and SCSI Block
//! Commands - 2 (SBC-2).

use crate::error::{Error, Result};
use crate::usb::bot::BotCommand;
use crate::usb::cbw::{Direction, MAX_CDB_SIZE};

/// Standard INQUIRY data is at least 36 bytes (SPC-2 table 46).
pub const INQUIRY_LENGTH: u32 = 36;
/// Fixed-format sense data as requested by this driver (SPC-2 7.20).
pub const REQUEST_SENSE_LENGTH: u32 = 18;
/// READ CAPACITY (10) returns two 32-bit fields (SBC-2 5.1.10).
pub const READ_CAPACITY_LENGTH: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiCommand {
    /// SPC-2 7.25. No data phase; a CHECK CONDITION answer means the unit is
    /// not ready yet.
    TestUnitReady,
    /// SPC-2 7.3.1.
    Inquiry,
    /// SPC-2 7.20. Fetches the sense data describing why the previous
    /// command failed.
    RequestSense,
    /// SBC-2 5.1.10.
    ReadCapacity10,
    /// SBC-2 5.1.5. "10" because the block address is four bytes and the
    /// transfer length two, for a ten-byte command block.
    Read10 {
        block_address: u32,
        transfer_bytes: u32,
        transfer_blocks: u16,
    },
    /// SBC-2 5.1.26.
    Write10 {
        block_address: u32,
        transfer_bytes: u32,
        transfer_blocks: u16,
    },
}

impl ScsiCommand {
    const OPCODE_TEST_UNIT_READY: u8 = 0x00;
    const OPCODE_REQUEST_SENSE: u8 = 0x03;
    const OPCODE_INQUIRY: u8 = 0x12;
    const OPCODE_READ_CAPACITY_10: u8 = 0x25;
    const OPCODE_READ_10: u8 = 0x28;
    const OPCODE_WRITE_10: u8 = 0x2A;

    /// Builds a READ (10) covering `transfer_bytes` starting at
    /// `block_address`. The byte count must be an exact multiple of the
    /// device block size; anything else is a caller bug caught here, before
    /// serialization, never silently truncated.
    pub fn read10(block_address: u32, transfer_bytes: u32, block_size: u32) -> Result<Self> {
        let transfer_blocks = Self::block_count(transfer_bytes, block_size)?;
        Ok(Self::Read10 {
            block_address,
            transfer_bytes,
            transfer_blocks,
        })
    }

    /// Builds a WRITE (10); same validation as [`ScsiCommand::read10`].
    pub fn write10(block_address: u32, transfer_bytes: u32, block_size: u32) -> Result<Self> {
        let transfer_blocks = Self::block_count(transfer_bytes, block_size)?;
        Ok(Self::Write10 {
            block_address,
            transfer_bytes,
            transfer_blocks,
        })
    }

    fn block_count(transfer_bytes: u32, block_size: u32) -> Result<u16> {
        if block_size == 0 {
            return Err(Error::InvalidArgument("block size must be non-zero"));
        }
        if transfer_bytes % block_size != 0 {
            return Err(Error::InvalidArgument(
                "transfer bytes is not a multiple of block size",
            ));
        }
        let blocks = transfer_bytes / block_size;
        u16::try_from(blocks)
            .map_err(|_| Error::InvalidArgument("transfer exceeds 65535 blocks"))
    }
}

impl BotCommand for ScsiCommand {
    fn command_block(&self) -> ([u8; MAX_CDB_SIZE], u8) {
        let mut block = [0u8; MAX_CDB_SIZE];
        match *self {
            Self::TestUnitReady => {
                block[0] = Self::OPCODE_TEST_UNIT_READY;
                (block, 6)
            }
            Self::Inquiry => {
                block[0] = Self::OPCODE_INQUIRY;
                block[4] = INQUIRY_LENGTH as u8;
                (block, 6)
            }
            Self::RequestSense => {
                block[0] = Self::OPCODE_REQUEST_SENSE;
                block[4] = REQUEST_SENSE_LENGTH as u8;
                (block, 6)
            }
            Self::ReadCapacity10 => {
                block[0] = Self::OPCODE_READ_CAPACITY_10;
                (block, 10)
            }
            Self::Read10 {
                block_address,
                transfer_blocks,
                ..
            } => {
                block[0] = Self::OPCODE_READ_10;
                block[2..6].copy_from_slice(&block_address.to_be_bytes());
                block[7..9].copy_from_slice(&transfer_blocks.to_be_bytes());
                (block, 10)
            }
            Self::Write10 {
                block_address,
                transfer_blocks,
                ..
            } => {
                block[0] = Self::OPCODE_WRITE_10;
                block[2..6].copy_from_slice(&block_address.to_be_bytes());
                block[7..9].copy_from_slice(&transfer_blocks.to_be_bytes());
                (block, 10)
            }
        }
    }

    fn direction(&self) -> Direction {
        match self {
            Self::TestUnitReady => Direction::None,
            Self::Inquiry | Self::RequestSense | Self::ReadCapacity10 | Self::Read10 { .. } => {
                Direction::In
            }
            Self::Write10 { .. } => Direction::Out,
        }
    }

    fn transfer_length(&self) -> u32 {
        match *self {
            Self::TestUnitReady => 0,
            Self::Inquiry => INQUIRY_LENGTH,
            Self::RequestSense => REQUEST_SENSE_LENGTH,
            Self::ReadCapacity10 => READ_CAPACITY_LENGTH,
            Self::Read10 { transfer_bytes, .. } | Self::Write10 { transfer_bytes, .. } => {
                transfer_bytes
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read10_encoding_is_big_endian() {
        let cmd = ScsiCommand::read10(0x0102_0304, 2 * 512, 512).unwrap();
        let (block, len) = cmd.command_block();
        assert_eq!(len, 10);
        assert_eq!(block[0], 0x28);
        assert_eq!(block[1], 0);
        assert_eq!(&block[2..6], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(block[6], 0);
        assert_eq!(&block[7..9], &[0x00, 0x02]);
        assert!(block[9..].iter().all(|&b| b == 0));
        assert_eq!(cmd.direction(), Direction::In);
        assert_eq!(cmd.transfer_length(), 1024);
    }

    #[test]
    fn write10_encoding() {
        let cmd = ScsiCommand::write10(100, 512, 512).unwrap();
        let (block, len) = cmd.command_block();
        assert_eq!(len, 10);
        assert_eq!(block[0], 0x2A);
        assert_eq!(&block[2..6], &100u32.to_be_bytes());
        assert_eq!(&block[7..9], &1u16.to_be_bytes());
        assert_eq!(cmd.direction(), Direction::Out);
    }

    #[test]
    fn unaligned_transfer_is_rejected_before_serialization() {
        assert!(matches!(
            ScsiCommand::read10(0, 513, 512),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            ScsiCommand::write10(0, 100, 512),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn inquiry_asks_for_36_bytes() {
        let (block, len) = ScsiCommand::Inquiry.command_block();
        assert_eq!(len, 6);
        assert_eq!(block[0], 0x12);
        assert_eq!(block[4], 36);
        assert_eq!(ScsiCommand::Inquiry.transfer_length(), 36);
    }

    #[test]
    fn test_unit_ready_has_no_data_phase() {
        assert_eq!(ScsiCommand::TestUnitReady.direction(), Direction::None);
        assert_eq!(ScsiCommand::TestUnitReady.transfer_length(), 0);
    }
}
