//! Interactions with USB mass storage devices.
//!
//! Flash drives use the mass storage class (0x08), SCSI transparent command
//! set subclass (0x06), and the bulk-only transport protocol (0x50). All the
//! interesting traffic runs over two bulk endpoints: OUT for the 31-byte
//! command block wrappers and any host-to-device data, IN for device-to-host
//! data and the 13-byte command status wrappers. A couple of class-specific
//! requests (read max LUN, bulk-only reset) go over the control endpoint.

pub mod bot;
pub mod cbw;

use std::time::Duration;

use nusb::io::{EndpointRead, EndpointWrite};
use nusb::transfer::{Bulk, ControlIn, ControlOut, ControlType, In, Out, Recipient};
use nusb::{Device, DeviceInfo, Interface, list_devices};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::error::{Error, Result};

/// <https://www.usb.org/defined-class-codes>
const MASS_STORAGE_USB_CLASS: u8 = 0x08;

/// Class-specific request that resets the bulk-only transport state machine
/// of the device without disturbing the medium.
const BULK_ONLY_MASS_STORAGE_RESET: u8 = 0xFF;

/// Standard CLEAR_FEATURE request, used with the ENDPOINT_HALT feature
/// selector (0) to clear a stalled bulk endpoint.
const CLEAR_FEATURE: u8 = 0x01;

/// The raw bulk pipe the transport engine drives.
///
/// [`bot::BulkOnlyTransport`] only needs this capability, not a concrete
/// device handle, which keeps the protocol state machine testable against an
/// in-memory emulation.
#[allow(async_fn_in_trait)]
pub trait UsbTransport {
    /// Writes the whole buffer to the bulk OUT endpoint.
    async fn bulk_out(&mut self, data: &[u8]) -> Result<usize>;
    /// Reads at most `buf.len()` bytes from the bulk IN endpoint. A short
    /// read is not an error; zero means the device had nothing more to send
    /// for this transfer.
    async fn bulk_in(&mut self, buf: &mut [u8]) -> Result<usize>;
    /// Clears an ENDPOINT_HALT condition on the bulk IN endpoint.
    async fn clear_halt_in(&mut self) -> Result<()>;
    /// Clears an ENDPOINT_HALT condition on the bulk OUT endpoint.
    async fn clear_halt_out(&mut self) -> Result<()>;
    /// Issues the class-specific Bulk-Only Mass Storage Reset.
    async fn mass_storage_reset(&mut self) -> Result<()>;
}

/// How bulk transfers are submitted to the host stack.
///
/// Chosen once by the embedding application when the device is opened,
/// instead of being guessed from platform version checks at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStrategy {
    /// Queue several transfers so the host controller always has work
    /// pending. Preferred on hosts where the async submission path works.
    AsyncRequest,
    /// One transfer in flight at a time, completed synchronously from the
    /// caller's point of view. The conservative fallback.
    SyncConnection,
}

impl TransferStrategy {
    fn num_transfers(self) -> usize {
        match self {
            Self::AsyncRequest => 8,
            Self::SyncConnection => 1,
        }
    }
}

/// As described by the USB Mass Storage Class - Bulk Only Transport spec,
/// section 3.2.
///
/// LUN stands for Logical Unit Number, and it's a number used as a unique
/// identifier for a storage device or logical volume.
///
/// <https://en.wikipedia.org/wiki/Logical_unit_number>
const MAX_LUN_REQUEST: ControlIn = ControlIn {
    control_type: ControlType::Class,
    recipient: Recipient::Interface,
    request: 0xfe,
    value: 0,
    index: 0,
    length: 1,
};

/// Returns a list of every USB storage device currently connected to the
/// host machine.
pub async fn enumerate_usb_storage_devices() -> Result<impl Iterator<Item = DeviceInfo>> {
    let all_usb_devices = list_devices()
        .await
        .map_err(|e| Error::Transfer(e.to_string()))?;

    // Each USB device typically exposes one or more *interfaces* as a
    // way to interact with specific functionality of the device.
    let usb_storage_devices = all_usb_devices.filter(|dev| {
        debug!("scanning usb device: {:#?}", dev);
        dev.class() == MASS_STORAGE_USB_CLASS
            || dev
                .interfaces()
                .any(|interface| interface.class() == MASS_STORAGE_USB_CLASS)
    });
    Ok(usb_storage_devices)
}

/// A claimed mass storage device with its two bulk endpoints opened.
pub struct UsbDrive {
    interface: Interface,
    bulk_write: EndpointWrite<Bulk>,
    bulk_read: EndpointRead<Bulk>,
    bulk_in_addr: u8,
    bulk_out_addr: u8,
    timeout: Duration,
}

/// Opens the provided USB mass storage device: claim the interface, find the
/// bulk endpoint pair, and ask for the max LUN.
///
/// Returns the drive plus the highest LUN the device reports (0 for the
/// common single-volume stick).
pub async fn open_usb_device(
    device_info: DeviceInfo,
    strategy: TransferStrategy,
    timeout: Duration,
) -> Result<(UsbDrive, u8)> {
    debug!("opening device");
    let device: Device = device_info
        .open()
        .await
        .map_err(|e| Error::Transfer(e.to_string()))?;
    let interface: Interface = device
        .claim_interface(0)
        .await
        .map_err(|e| Error::Transfer(e.to_string()))?;

    let (bulk_in_addr, bulk_out_addr) = bulk_endpoint_pair(&device)?;
    debug!(bulk_in_addr, bulk_out_addr, "found bulk endpoint pair");

    let max_lun_reply = interface
        .control_in(MAX_LUN_REQUEST, timeout)
        .await
        .map_err(|e| Error::Transfer(e.to_string()))?;
    let max_lun = max_lun_reply.first().copied().unwrap_or(0);

    let bulk_write = interface
        .endpoint::<Bulk, Out>(bulk_out_addr)
        .map_err(|e| Error::Transfer(e.to_string()))?
        .writer(4096)
        .with_num_transfers(strategy.num_transfers());
    let bulk_read = interface
        .endpoint::<Bulk, In>(bulk_in_addr)
        .map_err(|e| Error::Transfer(e.to_string()))?
        .reader(4096)
        .with_num_transfers(strategy.num_transfers());

    Ok((
        UsbDrive {
            interface,
            bulk_write,
            bulk_read,
            bulk_in_addr,
            bulk_out_addr,
            timeout,
        },
        max_lun,
    ))
}

/// Finds the bulk IN/OUT endpoint addresses of the mass storage interface.
fn bulk_endpoint_pair(device: &Device) -> Result<(u8, u8)> {
    let config = device
        .active_configuration()
        .map_err(|e| Error::Transfer(e.to_string()))?;
    let mut bulk_in = None;
    let mut bulk_out = None;
    for alt in config.interface_alt_settings() {
        if alt.class() != MASS_STORAGE_USB_CLASS {
            continue;
        }
        for endpoint in alt.endpoints() {
            if endpoint.transfer_type() != nusb::descriptors::TransferType::Bulk {
                continue;
            }
            // Bit 7 of the endpoint address distinguishes IN from OUT.
            if endpoint.address() & 0x80 != 0 {
                bulk_in = Some(endpoint.address());
            } else {
                bulk_out = Some(endpoint.address());
            }
        }
    }
    match (bulk_in, bulk_out) {
        (Some(i), Some(o)) => Ok((i, o)),
        _ => Err(Error::Transfer(
            "device exposes no bulk endpoint pair".into(),
        )),
    }
}

impl UsbDrive {
    async fn clear_halt(&mut self, endpoint: u8) -> Result<()> {
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Standard,
                    recipient: Recipient::Endpoint,
                    request: CLEAR_FEATURE,
                    value: 0, // ENDPOINT_HALT
                    index: endpoint as u16,
                    data: &[],
                },
                self.timeout,
            )
            .await
            .map_err(|e| Error::Transfer(e.to_string()))?;
        Ok(())
    }
}

impl UsbTransport for UsbDrive {
    async fn bulk_out(&mut self, data: &[u8]) -> Result<usize> {
        let io = async {
            self.bulk_write.write_all(data).await?;
            self.bulk_write.flush().await
        };
        match tokio::time::timeout(self.timeout, io).await {
            Ok(r) => r.map_err(Error::from)?,
            Err(_) => return Err(Error::Transfer("bulk out timed out".into())),
        }
        Ok(data.len())
    }

    async fn bulk_in(&mut self, buf: &mut [u8]) -> Result<usize> {
        match tokio::time::timeout(self.timeout, self.bulk_read.read(buf)).await {
            Ok(r) => r.map_err(Error::from),
            Err(_) => Err(Error::Transfer("bulk in timed out".into())),
        }
    }

    async fn clear_halt_in(&mut self) -> Result<()> {
        self.clear_halt(self.bulk_in_addr).await
    }

    async fn clear_halt_out(&mut self) -> Result<()> {
        self.clear_halt(self.bulk_out_addr).await
    }

    async fn mass_storage_reset(&mut self) -> Result<()> {
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: BULK_ONLY_MASS_STORAGE_RESET,
                    value: 0,
                    index: 0,
                    data: &[],
                },
                self.timeout,
            )
            .await
            .map_err(|e| Error::Transfer(e.to_string()))?;
        Ok(())
    }
}
