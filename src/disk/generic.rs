// Portable fallbacks for platforms without a dedicated backend

use super::common::{OsFault, classify_io_error};
use crate::error::{DeviceOperation, WriteError};
use anyhow::Result;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use tracing::warn;

pub async fn unmount_all(device: &Path) -> Result<()> {
    warn!(
        "Unmounting is not supported on this platform; make sure {} has no mounted volumes",
        device.display()
    );
    Ok(())
}

pub async fn open_exclusive(device: &Path) -> Result<File, WriteError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(device)
        .map_err(|e| classify_io_error(device, DeviceOperation::Open, 0, &e))
}

/// Classification falls back to `io::ErrorKind`.
pub fn os_fault(_err: &io::Error) -> Option<OsFault> {
    None
}

pub fn drop_page_cache(_file: &File) -> io::Result<()> {
    Ok(())
}
