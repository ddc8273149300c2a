//! The command and status envelopes of the Bulk-Only Transport.
//!
//! Every SCSI command travels inside a 31-byte command block wrapper (CBW)
//! and is answered by a 13-byte command status wrapper (CSW). The header
//! fields of both are little endian; the SCSI command block embedded in the
//! CBW is big endian per the SCSI standard. That mixed-endianness split is
//! deliberate and must not be "fixed".
//!
//! See USB Mass Storage Class - Bulk Only Transport, section 5.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};

/// Signature that identifies a packet as a CBW.
///
/// See USB Mass Storage Class - Bulk Only Transport, section 5.1
const CBW_SIGNATURE: u32 = 0x43425355;
/// Signature that identifies a packet as a CSW.
const CSW_SIGNATURE: u32 = 0x53425355;

/// A command block wrapper is *always* 31 bytes in size
pub const CBW_SIZE: usize = 31;
/// A command status wrapper is *always* 13 bytes in size
pub const CSW_SIZE: usize = 13;

/// The longest command block a CBW can carry.
pub const MAX_CDB_SIZE: usize = 16;

/// Direction of the data phase, encoded in bit 7 of `bmCBWFlags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Data-In: from the device to the host
    In,
    /// Data-Out: from host to the device
    Out,
    /// No data phase. The spec ignores the direction bit entirely when the
    /// data transfer length is zero, so this variant exists purely as an
    /// abstraction.
    None,
}

/// Process-wide tag counter.
///
/// `dCBWTag` correlates a CSW with the CBW that caused it. Commands are
/// issued one at a time per logical unit, so a plain wrapping counter can
/// never hand out a tag that is still outstanding.
static NEXT_TAG: AtomicU32 = AtomicU32::new(1);

/// Returns a fresh tag, different from every previously returned value until
/// the 32-bit counter wraps.
pub fn next_tag() -> u32 {
    NEXT_TAG.fetch_add(1, Ordering::Relaxed)
}

/// The CBW wraps a SCSI command block.
///
/// Always exactly 31 bytes on the wire; the command block is zero-padded to
/// 16 bytes with `bCBWCBLength` marking the valid prefix.
#[repr(C, packed)]
pub struct CommandBlockWrapper {
    /// `dCBWSignature` - always [`CBW_SIGNATURE`], little endian.
    signature: [u8; 4],
    /// `dCBWTag` - echoed by the device in the CSW.
    tag: [u8; 4],
    /// `dCBWDataTransferLength` - bytes the host expects to move in the data
    /// phase. Zero means no data phase at all.
    data_transfer_length: [u8; 4],
    /// `bmCBWFlags` - bit 7 set means Data-In (device to host).
    flags: u8,
    /// `bCBWLUN` - logical unit the command block is addressed to (0-15).
    lun: u8,
    /// `bCBWCBLength` - valid length of the command block, 1 through 16.
    cb_length: u8,
    /// `CBWCB` - the SCSI command block, zero-padded.
    command_block: [u8; MAX_CDB_SIZE],
}

impl CommandBlockWrapper {
    /// Builds a CBW around an already-encoded SCSI command block.
    ///
    /// `cb_length` must be within 1..=16 and `lun` within 0..=15; both are
    /// caller programming errors, rejected before anything is transmitted.
    /// The direction bit is derived: it is forced clear when
    /// `data_transfer_length` is zero, as required by the spec.
    pub fn new(
        tag: u32,
        data_transfer_length: u32,
        direction: Direction,
        lun: u8,
        command_block: [u8; MAX_CDB_SIZE],
        cb_length: u8,
    ) -> Result<Self> {
        if !(1..=MAX_CDB_SIZE as u8).contains(&cb_length) {
            return Err(Error::InvalidArgument("command block length must be 1..=16"));
        }
        if lun > 15 {
            return Err(Error::InvalidArgument("lun must be 0..=15"));
        }
        let flags = match direction {
            Direction::In if data_transfer_length > 0 => 0x80,
            _ => 0x00,
        };
        Ok(Self {
            signature: CBW_SIGNATURE.to_le_bytes(),
            tag: tag.to_le_bytes(),
            data_transfer_length: data_transfer_length.to_le_bytes(),
            flags,
            lun,
            cb_length,
            command_block,
        })
    }

    pub fn tag(&self) -> u32 {
        u32::from_le_bytes(self.tag)
    }

    pub fn data_transfer_length(&self) -> u32 {
        u32::from_le_bytes(self.data_transfer_length)
    }

    /// Returns a slice containing the entirety of `self` that is exactly
    /// [`CBW_SIZE`] bytes in length.
    pub fn as_bytes(&'_ self) -> &[u8] {
        const {
            assert!(
                std::mem::size_of::<CommandBlockWrapper>() == CBW_SIZE,
                "CommandBlockWrapper not 31 bytes in size"
            );
        };
        // SAFETY: the const assertion above guarantees that the size is as
        // we expected, and we know the lifetime of `self` is valid.
        let slice: &'_ [u8] = unsafe {
            let ptr = self as *const CommandBlockWrapper as *const u8;
            std::slice::from_raw_parts(ptr, CBW_SIZE)
        };
        slice
    }
}

/// `bCSWStatus` values defined by the spec. All other values are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CswStatus {
    /// Command Passed ("good status")
    Passed,
    Failed,
    PhaseError,
}

/// The parsed status/return value of a command block executed by the device.
#[derive(Debug, Clone, Copy)]
pub struct CommandStatusWrapper {
    /// `dCSWTag` - must equal the tag of the CBW this answers.
    pub tag: u32,
    /// `dCSWDataResidue` - the difference between the data transfer length
    /// the host asked for and what the device actually processed.
    pub data_residue: u32,
    /// `bCSWStatus`
    pub status: CswStatus,
}

impl CommandStatusWrapper {
    /// Parses the 13-byte status packet.
    ///
    /// A wrong signature or a reserved status byte is a protocol violation,
    /// not a command failure: no status value is ever returned from a packet
    /// that fails these checks.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() != CSW_SIZE {
            return Err(Error::Protocol {
                what: "csw length",
                expected: CSW_SIZE as u32,
                actual: buf.len() as u32,
            });
        }
        let signature = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if signature != CSW_SIGNATURE {
            return Err(Error::Protocol {
                what: "csw signature",
                expected: CSW_SIGNATURE,
                actual: signature,
            });
        }
        let status = match buf[12] {
            0 => CswStatus::Passed,
            1 => CswStatus::Failed,
            2 => CswStatus::PhaseError,
            other => {
                return Err(Error::Protocol {
                    what: "csw status",
                    expected: 2,
                    actual: other as u32,
                });
            }
        };
        Ok(Self {
            tag: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            data_residue: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            status,
        })
    }
}
