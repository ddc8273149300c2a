//! Demo binary: opens the first USB flash drive it finds, mounts the FAT32
//! volume on it and prints the root directory.

use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::eyre;
use tracing::info;

use driftfs::fat32::FatVolume;
use driftfs::scsi::ScsiBlockDevice;
use driftfs::usb::{TransferStrategy, enumerate_usb_storage_devices, open_usb_device};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let device_info = enumerate_usb_storage_devices()
        .await?
        .next()
        .ok_or_else(|| eyre!("no USB mass storage device connected"))?;
    info!(
        vendor = device_info.manufacturer_string().unwrap_or("?"),
        product = device_info.product_string().unwrap_or("?"),
        "found storage device"
    );

    let (drive, max_lun) = open_usb_device(
        device_info,
        TransferStrategy::AsyncRequest,
        Duration::from_secs(5),
    )
    .await?;
    info!(max_lun, "device opened, initializing lun 0");

    let scsi = ScsiBlockDevice::new(drive, 0).await?;
    info!(
        vendor = %scsi.inquiry().vendor_id,
        product = %scsi.inquiry().product_id,
        capacity_bytes = scsi.capacity_bytes(),
        block_size = scsi.capacity().block_size,
        "device ready"
    );

    let mut volume = FatVolume::mount(scsi).await?;
    println!("volume label: {}", volume.volume_label());
    if let Some(free) = volume.free_cluster_count() {
        let free_bytes = free as u64 * volume.boot_sector().bytes_per_cluster() as u64;
        println!("free space:   {free_bytes} bytes");
    }

    println!("root directory:");
    for entry in volume.root_dir().await? {
        let kind = if entry.is_directory() { "<dir> " } else { "      " };
        println!("  {kind}{:>10}  {}", entry.file_size(), entry.name);
    }

    Ok(())
}
