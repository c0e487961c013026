// Linux-specific disk operations

use super::common::{OsFault, classify_io_error};
use crate::error::{DeviceFault, DeviceOperation, WriteError};
use anyhow::{Context, Result, anyhow};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use tracing::{debug, info, warn};

use libc::{O_CLOEXEC, O_EXCL, O_SYNC};
use udisks2::zbus::zvariant::{ObjectPath, OwnedObjectPath};
use udisks2::{Client, zbus};

/// Unmount every filesystem on `device` through UDisks2.
pub async fn unmount_all(device: &Path) -> Result<()> {
    let client = Client::new().await.context("Failed to connect to UDisks2")?;
    let drive_path = resolve_device(&client, device).await?;
    umount_all(&client, drive_path.as_ref()).await
}

/// Open `device` for exclusive synchronous read/write access.
///
/// UDisks2 is asked first so that an unprivileged user with a polkit grant
/// can write; a direct open is the fallback.
pub async fn open_exclusive(device: &Path) -> Result<File, WriteError> {
    match open_with_udisks(device).await {
        Ok(file) => return Ok(file),
        Err(e) => warn!("UDisks2 could not open {}: {:#}; opening directly", device.display(), e),
    }

    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(O_EXCL | O_SYNC | O_CLOEXEC)
        .open(device)
        .map_err(|e| classify_io_error(device, DeviceOperation::Open, 0, &e))
}

async fn open_with_udisks(device: &Path) -> Result<File> {
    let client = Client::new().await?;
    let drive_path = resolve_device(&client, device).await?;
    let block = client.object(drive_path)?.block().await?;

    // O_EXCL for exclusive access, O_SYNC for sync I/O, O_CLOEXEC to close on exec
    let flags = O_EXCL | O_SYNC | O_CLOEXEC;
    let owned_fd = block
        .open_device(
            "rw",
            [("flags", zbus::zvariant::Value::from(flags))]
                .into_iter()
                .collect(),
        )
        .await?;

    if let zbus::zvariant::Fd::Owned(owned_fd) = owned_fd.into() {
        info!("Opened {} through UDisks2", device.display());
        Ok(File::from(owned_fd))
    } else {
        Err(anyhow!(
            "Failed to open device: UDisks2 did not provide an owned file descriptor"
        ))
    }
}

/// Resolve a device path to a UDisks2 object path
async fn resolve_device(client: &Client, path: &Path) -> Result<OwnedObjectPath> {
    debug!("Resolving Linux device path: {}", path.display());

    let mut spec = HashMap::new();
    spec.insert("path", path.to_string_lossy().into_owned().into());

    let mut obj = client
        .manager()
        .resolve_device(spec, HashMap::default())
        .await?;

    obj.pop()
        .ok_or_else(|| anyhow!("No device found for path: {}", path.display()))
}

/// Unmount all mounted filesystems on or below the given object path
async fn umount_all(client: &Client, path: ObjectPath<'_>) -> Result<()> {
    debug!("Unmounting all filesystems on Linux device: {:?}", path);

    let block_devices = client
        .manager()
        .get_block_devices(HashMap::default())
        .await?;

    for dev_path in block_devices {
        // Partitions share the drive's object path as a prefix
        if dev_path.as_str().starts_with(path.as_str()) {
            let display_path = dev_path.clone();
            if let Ok(fs) = client.object(dev_path)?.filesystem().await {
                if !fs.mount_points().await?.is_empty() {
                    info!("Unmounting filesystem on device: {:?}", display_path);
                    fs.unmount(HashMap::new()).await?;
                }
            }
        }
    }

    debug!("Successfully unmounted all filesystems");
    Ok(())
}

/// errno table for device failures.
pub fn os_fault(err: &io::Error) -> Option<OsFault> {
    let code = err.raw_os_error()?;
    let fault = match code {
        libc::EACCES | libc::EPERM => OsFault::Fault(DeviceFault::PermissionDenied),
        libc::ENOSPC | libc::EFBIG => OsFault::Fault(DeviceFault::DiskFull),
        libc::EROFS => OsFault::Fault(DeviceFault::WriteProtected),
        libc::EBADMSG | libc::EUCLEAN | libc::EMEDIUMTYPE | libc::EILSEQ => {
            OsFault::Fault(DeviceFault::MediaError)
        }
        libc::EINVAL => OsFault::Fault(DeviceFault::InvalidParameter),
        libc::EBUSY => OsFault::Fault(DeviceFault::Busy),
        libc::ENODEV | libc::ENXIO | libc::ENOMEDIUM | libc::ENOENT => OsFault::Removed,
        libc::EIO => OsFault::Fault(DeviceFault::Io),
        _ => return None,
    };
    Some(fault)
}

/// Evict the file's pages from the page cache so read-back hits the device.
pub fn drop_page_cache(file: &File) -> io::Result<()> {
    let rc = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}
