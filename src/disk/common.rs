// Common disk operation functionality shared across platforms

use crate::error::{DeviceFault, DeviceOperation, WriteError};
use crate::models::DeviceHandle;
use anyhow::{Result, anyhow};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Byte-level access to a target device.
pub trait DiskIo: Read + Write + Seek + Send + fmt::Debug {
    /// Size in bytes, found by seeking to the end.
    fn capacity(&mut self) -> io::Result<u64> {
        let current = self.stream_position()?;
        let end = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(current))?;
        Ok(end)
    }

    /// Push written data down to the device (fsync).
    fn sync(&mut self) -> io::Result<()>;

    /// A second handle on the same device.
    fn try_clone_io(&self) -> io::Result<Box<dyn DiskIo>>;

    /// Drop cached pages so that reads come from the medium.
    fn drop_cache(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DiskIo for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }

    fn try_clone_io(&self) -> io::Result<Box<dyn DiskIo>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn drop_cache(&mut self) -> io::Result<()> {
        super::platform::drop_page_cache(self)
    }
}

/// How an OS error code relates to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFault {
    Removed,
    Fault(DeviceFault),
}

/// Map an I/O error on `device` to a typed failure.
pub fn classify_io_error(
    device: &Path,
    operation: DeviceOperation,
    offset: u64,
    err: &io::Error,
) -> WriteError {
    let fault = super::platform::os_fault(err).unwrap_or_else(|| fault_from_kind(err.kind()));

    error!(
        "Device error on {} {} at offset {}: {} ({:?})",
        device.display(),
        operation,
        offset,
        err,
        fault
    );

    match fault {
        OsFault::Removed => WriteError::DeviceRemoved(device.to_path_buf()),
        OsFault::Fault(fault) => WriteError::Device {
            device: device.to_path_buf(),
            fault,
            operation,
            offset,
            cause: err.to_string(),
        },
    }
}

fn fault_from_kind(kind: io::ErrorKind) -> OsFault {
    match kind {
        io::ErrorKind::PermissionDenied => OsFault::Fault(DeviceFault::PermissionDenied),
        io::ErrorKind::StorageFull | io::ErrorKind::WriteZero => OsFault::Fault(DeviceFault::DiskFull),
        io::ErrorKind::ReadOnlyFilesystem => OsFault::Fault(DeviceFault::WriteProtected),
        io::ErrorKind::InvalidInput => OsFault::Fault(DeviceFault::InvalidParameter),
        io::ErrorKind::ResourceBusy => OsFault::Fault(DeviceFault::Busy),
        io::ErrorKind::NotFound => OsFault::Removed,
        _ => OsFault::Fault(DeviceFault::Io),
    }
}

/// Proxy for accessing a specific partition on a disk
pub struct PartitionFileProxy<T: Read + io::Write + io::Seek> {
    /// The underlying file handle for the entire disk
    pub file: T,
    /// The offset in bytes where the partition starts
    pub partition_offset: u64,
    /// The size of the partition in bytes
    pub partition_size: u64,
    /// The current position relative to the start of the partition
    pub current_position: u64,
}

impl<T: Read + Write + Seek> PartitionFileProxy<T> {
    pub fn new(file: T, partition_offset: u64, partition_size: u64) -> Self {
        Self {
            file,
            partition_offset,
            partition_size,
            current_position: 0,
        }
    }

    /// Check if position is within partition boundaries
    fn check_position(&self) -> io::Result<()> {
        // If partition_size is 0, we're not enforcing boundaries
        if self.partition_size > 0 && self.current_position > self.partition_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Position {} is beyond partition size {}",
                    self.current_position, self.partition_size
                ),
            ));
        }
        Ok(())
    }

    /// Convert a partition-relative position to an absolute disk position
    fn to_absolute_position(&self) -> u64 {
        self.partition_offset + self.current_position
    }

    /// Bytes that fit between the current position and the partition end.
    fn clamp_len(&self, len: usize) -> usize {
        if self.partition_size > 0 {
            std::cmp::min(len as u64, self.partition_size - self.current_position) as usize
        } else {
            len
        }
    }
}

impl<T: Read + Write + Seek> fmt::Debug for PartitionFileProxy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionFileProxy")
            .field("partition_offset", &self.partition_offset)
            .field("partition_size", &self.partition_size)
            .field("current_position", &self.current_position)
            .finish()
    }
}

const MB: f64 = 1f64 / 1024f64 / 1024f64;

pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 * MB
}

impl<T: Read + Write + Seek> Read for PartitionFileProxy<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_position()?;

        if self.partition_size > 0 && self.current_position == self.partition_size {
            debug!("Read operation at partition boundary - no more bytes to read");
            return Ok(0);
        }

        let max_read_size = self.clamp_len(buf.len());
        self.file.seek(SeekFrom::Start(self.to_absolute_position()))?;
        let bytes_read = self.file.read(&mut buf[..max_read_size])?;
        self.current_position += bytes_read as u64;

        Ok(bytes_read)
    }
}

impl<T: Read + Write + Seek> Write for PartitionFileProxy<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_position()?;

        if self.partition_size > 0 && self.current_position == self.partition_size {
            info!("Write operation at partition boundary - no more bytes can be written");
            return Ok(0);
        }

        let max_write_size = self.clamp_len(buf.len());
        self.file.seek(SeekFrom::Start(self.to_absolute_position()))?;
        let bytes_written = self.file.write(&buf[..max_write_size])?;
        self.current_position += bytes_written as u64;

        Ok(bytes_written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl<T: Read + Write + Seek> Seek for PartitionFileProxy<T> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_position = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(offset) => self
                .current_position
                .checked_add_signed(offset)
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "Invalid seek to a negative position")
                })?,
            SeekFrom::End(offset) => {
                if self.partition_size == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "SeekFrom::End is not supported for partition files with unknown size",
                    ));
                }
                if offset > 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "Cannot seek beyond the end of the partition",
                    ));
                }
                self.partition_size
                    .checked_sub(offset.unsigned_abs())
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "Invalid seek from end - position underflow",
                        )
                    })?
            }
        };

        if self.partition_size > 0 && new_position > self.partition_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Position {} is beyond partition size {}",
                    new_position, self.partition_size
                ),
            ));
        }

        // The real seek happens on the next read or write
        self.current_position = new_position;
        Ok(new_position)
    }
}

/// Enumerate drives attached to the system.
pub fn list_devices() -> Result<Vec<DeviceHandle>> {
    let drives = rs_drivelist::drive_list().map_err(|e| anyhow!("Failed to list drives: {}", e))?;
    debug!("Found {} drives with rs-drivelist", drives.len());

    Ok(drives
        .into_iter()
        .map(|drive| {
            let path = drive
                .devicePath
                .clone()
                .unwrap_or_else(|| drive.device.clone());
            DeviceHandle {
                path: PathBuf::from(path),
                description: drive.description.clone(),
                capacity: drive.size,
                mountpoints: drive
                    .mountpoints
                    .iter()
                    .map(|mp| PathBuf::from(&mp.path))
                    .collect(),
                read_only: drive.isReadOnly,
                removable: drive.isRemovable,
                system: drive.isSystem,
            }
        })
        .collect())
}
