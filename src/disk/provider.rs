// Where the pipeline gets its target devices from.

use super::{Disk, platform};
use crate::error::{DeviceOperation, WriteError};
use crate::models::DeviceHandle;
use anyhow::Result;
use std::fs::OpenOptions;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// Unmounts and opens target devices for a write job.
pub trait DeviceProvider: Send + Sync + 'static {
    /// Unmount every volume on the device. Failures are not fatal.
    fn unmount(&self, device: &DeviceHandle) -> impl Future<Output = Result<()>> + Send;

    /// Open the device for exclusive read/write access.
    fn open(&self, device: &DeviceHandle) -> impl Future<Output = Result<Disk, WriteError>> + Send;
}

/// Block devices of the running system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDevices;

impl DeviceProvider for SystemDevices {
    async fn unmount(&self, device: &DeviceHandle) -> Result<()> {
        if !device.is_mounted() {
            debug!("{} reports no mounted volumes", device.path.display());
        }
        platform::unmount_all(&device.path).await
    }

    async fn open(&self, device: &DeviceHandle) -> Result<Disk, WriteError> {
        let file = platform::open_exclusive(&device.path).await?;
        info!("Opened {} for writing", device.path.display());

        let node = device.path.clone();
        Ok(Disk::new(
            Box::new(file),
            device.path.clone(),
            Arc::new(move || node.exists()),
        ))
    }
}

/// Regular files standing in for devices, e.g. writing an image to a file.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileDevices;

impl DeviceProvider for FileDevices {
    async fn unmount(&self, device: &DeviceHandle) -> Result<()> {
        debug!("Nothing to unmount for {}", device.path.display());
        Ok(())
    }

    async fn open(&self, device: &DeviceHandle) -> Result<Disk, WriteError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device.path)
            .map_err(|e| super::classify_io_error(&device.path, DeviceOperation::Open, 0, &e))?;

        let node = device.path.clone();
        Ok(Disk::new(
            Box::new(file),
            device.path.clone(),
            Arc::new(move || node.exists()),
        ))
    }
}
