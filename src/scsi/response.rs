//! Parsers for the data-phase payloads SCSI commands return.

use crate::error::{Error, Result};

/// The interesting parts of standard INQUIRY data (SPC-2 7.3.2).
#[derive(Debug, Clone)]
pub struct InquiryResponse {
    /// PERIPHERAL QUALIFIER, bits 7:5 of byte 0. Zero means the device type
    /// below is actually connected.
    pub peripheral_qualifier: u8,
    /// PERIPHERAL DEVICE TYPE, bits 4:0 of byte 0. Zero is a direct access
    /// block device, which is what a flash drive reports.
    pub peripheral_device_type: u8,
    /// RMB bit: the medium is removable.
    pub removable_media: bool,
    pub vendor_id: String,
    pub product_id: String,
}

impl InquiryResponse {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 36 {
            return Err(Error::Transfer(format!(
                "inquiry data too short: {} bytes",
                buf.len()
            )));
        }
        Ok(Self {
            peripheral_qualifier: buf[0] >> 5,
            peripheral_device_type: buf[0] & 0x1F,
            removable_media: buf[1] & 0x80 != 0,
            vendor_id: String::from_utf8_lossy(&buf[8..16]).trim_end().to_string(),
            product_id: String::from_utf8_lossy(&buf[16..32]).trim_end().to_string(),
        })
    }
}

/// READ CAPACITY (10) response: two big-endian 32-bit fields (SBC-2 table
/// 34).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    /// Address of the last addressable block. One less than the block count.
    pub last_block_address: u32,
    /// Block size in bytes.
    pub block_size: u32,
}

impl Capacity {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(Error::Transfer(format!(
                "read capacity data too short: {} bytes",
                buf.len()
            )));
        }
        Ok(Self {
            last_block_address: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            block_size: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

/// Fixed-format sense data (SPC-2 7.20.2). Only the fields a caller needs
/// to decide on a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    /// Bits 3:0 of byte 2. 0x2 NOT READY, 0x3 MEDIUM ERROR, 0x5 ILLEGAL
    /// REQUEST, 0x6 UNIT ATTENTION are the ones seen in practice.
    pub sense_key: u8,
    /// Additional sense code.
    pub asc: u8,
    /// Additional sense code qualifier.
    pub ascq: u8,
}

impl SenseData {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 14 {
            return Err(Error::Transfer(format!(
                "sense data too short: {} bytes",
                buf.len()
            )));
        }
        let response_code = buf[0] & 0x7F;
        if response_code != 0x70 && response_code != 0x71 {
            return Err(Error::Transfer(format!(
                "unexpected sense response code 0x{response_code:02X}"
            )));
        }
        Ok(Self {
            sense_key: buf[2] & 0x0F,
            asc: buf[12],
            ascq: buf[13],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inquiry_fields() {
        let mut data = [0u8; 36];
        data[0] = 0x00; // direct access, connected
        data[1] = 0x80; // removable
        data[8..16].copy_from_slice(b"SanDisk ");
        data[16..32].copy_from_slice(b"Cruzer Blade    ");
        let r = InquiryResponse::parse(&data).unwrap();
        assert_eq!(r.peripheral_qualifier, 0);
        assert_eq!(r.peripheral_device_type, 0);
        assert!(r.removable_media);
        assert_eq!(r.vendor_id, "SanDisk");
        assert_eq!(r.product_id, "Cruzer Blade");
    }

    #[test]
    fn capacity_is_big_endian() {
        let mut data = [0u8; 8];
        data[0..4].copy_from_slice(&0x003C_0000u32.to_be_bytes());
        data[4..8].copy_from_slice(&512u32.to_be_bytes());
        let c = Capacity::parse(&data).unwrap();
        assert_eq!(c.last_block_address, 0x003C_0000);
        assert_eq!(c.block_size, 512);
    }

    #[test]
    fn sense_data_fields() {
        let mut data = [0u8; 18];
        data[0] = 0x70;
        data[2] = 0x02; // NOT READY
        data[12] = 0x3A; // MEDIUM NOT PRESENT
        data[13] = 0x00;
        let s = SenseData::parse(&data).unwrap();
        assert_eq!(s.sense_key, 0x2);
        assert_eq!(s.asc, 0x3A);
        assert_eq!(s.ascq, 0);
    }
}
