// Disk operations module with platform abstraction
//
// This module provides platform-independent device access with
// platform-specific implementations where necessary. Everything in here is
// blocking and is driven from `spawn_blocking` by the pipeline.

use crate::error::{DeviceOperation, WriteError};
use crate::models::CancelToken;
use crate::utils::hashing::{Sha256Digest, StreamingHasher};
use crate::utils::tracker::ProgressBus;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
use linux as platform;

#[cfg(not(target_os = "linux"))]
mod generic;
#[cfg(not(target_os = "linux"))]
use generic as platform;

pub mod common;
pub mod customise;
pub mod extract;
pub mod partition;
pub mod provider;
pub mod secure_boot;

pub use common::{DiskIo, PartitionFileProxy, bytes_to_mb, classify_io_error, list_devices};
pub use partition::PartitionEntry;
pub use provider::{DeviceProvider, FileDevices, SystemDevices};

/// Size of the regions zeroed at the start and end of the device.
pub const CLEAR_SIZE: u64 = 1024 * 1024;

/// Bytes of the image held back and written last.
pub const FIRST_BLOCK_SIZE: usize = 4096;

/// Reports whether the device is still attached.
pub type Presence = Arc<dyn Fn() -> bool + Send + Sync>;

/// FAT filesystem on the boot partition of a device.
pub type BootFs = fatfs::FileSystem<PartitionFileProxy<Box<dyn DiskIo>>>;
pub type BootDir<'a> = fatfs::Dir<'a, PartitionFileProxy<Box<dyn DiskIo>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    pub bytes: u64,
    pub sha256: Sha256Digest,
}

/// An opened target device.
pub struct Disk {
    io: Box<dyn DiskIo>,
    device: PathBuf,
    presence: Presence,
}

impl fmt::Debug for Disk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disk")
            .field("device", &self.device)
            .field("io", &self.io)
            .finish()
    }
}

impl Disk {
    pub fn new(io: Box<dyn DiskIo>, device: impl Into<PathBuf>, presence: Presence) -> Self {
        Self {
            io,
            device: device.into(),
            presence,
        }
    }

    /// A device that is assumed to stay attached.
    pub fn from_file(file: File, device: impl Into<PathBuf>) -> Self {
        Self::new(Box::new(file), device, Arc::new(|| true))
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn is_present(&self) -> bool {
        (self.presence)()
    }

    fn ensure_present(&self) -> Result<(), WriteError> {
        if self.is_present() {
            Ok(())
        } else {
            error!("Device {} is no longer present", self.device.display());
            Err(WriteError::DeviceRemoved(self.device.clone()))
        }
    }

    /// Classify an I/O failure, checking first whether the device went away.
    pub(crate) fn fail(&self, operation: DeviceOperation, offset: u64, err: &io::Error) -> WriteError {
        if !self.is_present() {
            error!(
                "Device {} disappeared {} at offset {}: {}",
                self.device.display(),
                operation,
                offset,
                err
            );
            return WriteError::DeviceRemoved(self.device.clone());
        }
        classify_io_error(&self.device, operation, offset, err)
    }

    /// Size of the device as seen through the open handle.
    pub fn capacity(&mut self) -> Result<u64, WriteError> {
        match self.io.capacity() {
            Ok(capacity) => Ok(capacity),
            Err(e) => Err(self.fail(DeviceOperation::Open, 0, &e)),
        }
    }

    fn write_at(&mut self, offset: u64, buf: &[u8], operation: DeviceOperation) -> Result<(), WriteError> {
        if let Err(e) = self
            .io
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.io.write_all(buf))
        {
            return Err(self.fail(operation, offset, &e));
        }
        if let Err(e) = self.io.flush() {
            return Err(self.fail(DeviceOperation::Flush, offset, &e));
        }
        Ok(())
    }

    /// Flush and fsync everything written so far.
    pub fn sync(&mut self) -> Result<(), WriteError> {
        let started = Instant::now();
        if let Err(e) = self.io.flush() {
            return Err(self.fail(DeviceOperation::Flush, 0, &e));
        }
        if let Err(e) = self.io.sync() {
            return Err(self.fail(DeviceOperation::Fsync, 0, &e));
        }
        info!("fsync completed successfully in {:?}", started.elapsed());
        Ok(())
    }

    /// Zero the first and last megabyte of a device of `capacity` bytes and
    /// check that no stale partition table survived.
    pub fn clear(&mut self, capacity: u64, cancel: &CancelToken) -> Result<(), WriteError> {
        cancel.check()?;
        self.ensure_present()?;

        let zeros = vec![0u8; CLEAR_SIZE as usize];
        let head = CLEAR_SIZE.min(capacity) as usize;
        info!("Zeroing first {:.1} MB of {}", bytes_to_mb(head as u64), self.device.display());
        self.write_at(0, &zeros[..head], DeviceOperation::Clear)?;

        cancel.check()?;
        let tail_offset = capacity.saturating_sub(CLEAR_SIZE).max(head as u64);
        let tail = (capacity - tail_offset) as usize;
        if tail > 0 {
            info!("Zeroing last {:.1} MB at offset {}", bytes_to_mb(tail as u64), tail_offset);
            match self.write_at(tail_offset, &zeros[..tail], DeviceOperation::Clear) {
                Ok(()) => {}
                Err(WriteError::DeviceRemoved(device)) => return Err(WriteError::DeviceRemoved(device)),
                Err(e) => {
                    error!("Zeroing the end of {} failed: {}", self.device.display(), e);
                    return Err(WriteError::PossibleCounterfeit {
                        device: self.device.clone(),
                        offset: tail_offset,
                    });
                }
            }
        }

        self.sync()?;

        if let Err(e) = self.io.drop_cache() {
            debug!("Could not drop cached pages: {}", e);
        }
        match partition::read_partitions(&mut *self.io) {
            Ok(parts) if parts.len() > 1 => {
                error!("{} partitions still present after clearing", parts.len());
                return Err(WriteError::MultiplePartitions(self.device.clone()));
            }
            Ok(_) => {}
            Err(e) => warn!("Could not re-read partition table after clearing: {}", e),
        }

        Ok(())
    }

    /// Copy `reader` onto the device from offset 0.
    ///
    /// The first 4 KiB are written last, after everything else has been
    /// synced. Every write is flushed, and the device is fsynced at the end.
    pub fn write_stream<R: Read>(
        &mut self,
        mut reader: R,
        expected_len: Option<u64>,
        chunk_size: usize,
        cancel: &CancelToken,
        bus: &ProgressBus,
    ) -> Result<WriteSummary, WriteError> {
        let mut buffer = vec![0u8; chunk_size.max(FIRST_BLOCK_SIZE)];
        let mut first_block: Option<Vec<u8>> = None;
        let mut hasher = StreamingHasher::new();
        let mut offset = 0u64;
        let started = Instant::now();

        loop {
            cancel.check()?;
            self.ensure_present()?;

            // Never read past the declared length; anything beyond it is an
            // oversized image and must not reach the device.
            let want = match expected_len {
                Some(expected) if offset >= expected => {
                    let mut extra = [0u8; 1];
                    if read_full(&mut reader, &mut extra, cancel)? > 0 {
                        error!("Image is larger than the declared {} bytes", expected);
                        return Err(WriteError::Extract(format!(
                            "image is larger than the declared {} bytes",
                            expected
                        )));
                    }
                    break;
                }
                Some(expected) => (expected - offset).min(buffer.len() as u64) as usize,
                None => buffer.len(),
            };

            let n = read_full(&mut reader, &mut buffer[..want], cancel)?;
            if n == 0 {
                break;
            }
            let data = &buffer[..n];
            hasher.update(data);

            if offset == 0 {
                let held = n.min(FIRST_BLOCK_SIZE);
                first_block = Some(data[..held].to_vec());
                if n > held {
                    self.write_at(held as u64, &data[held..], DeviceOperation::Write)?;
                }
            } else {
                self.write_at(offset, data, DeviceOperation::Write)?;
            }

            offset += n as u64;
            debug!("Wrote {:.1} MB", bytes_to_mb(offset));
            bus.report(offset, expected_len);
        }

        if let Some(expected) = expected_len {
            if offset != expected {
                return Err(WriteError::Extract(format!(
                    "image produced {} bytes, expected {}",
                    offset, expected
                )));
            }
        }

        self.sync()?;

        if let Some(block) = first_block {
            cancel.check()?;
            self.ensure_present()?;
            debug!("Writing first block ({} bytes)", block.len());
            self.write_at(0, &block, DeviceOperation::FirstBlock)?;
        }
        self.sync()?;

        let elapsed = started.elapsed();
        info!(
            "Wrote {:.1} MB to {} in {:?}",
            bytes_to_mb(offset),
            self.device.display(),
            elapsed
        );

        Ok(WriteSummary {
            bytes: offset,
            sha256: hasher.finalize(),
        })
    }

    /// Read back the first `len` bytes and compare their digest.
    pub fn verify(
        &mut self,
        len: u64,
        expected: &Sha256Digest,
        chunk_size: usize,
        cancel: &CancelToken,
        bus: &ProgressBus,
    ) -> Result<(), WriteError> {
        if let Err(e) = self.io.drop_cache() {
            debug!("Could not drop cached pages before verify: {}", e);
        }
        if let Err(e) = self.io.seek(SeekFrom::Start(0)) {
            return Err(self.fail(DeviceOperation::Read, 0, &e));
        }

        let mut buffer = vec![0u8; chunk_size.max(512)];
        let mut hasher = StreamingHasher::new();
        let mut offset = 0u64;

        while offset < len {
            cancel.check()?;
            self.ensure_present()?;

            let want = (len - offset).min(buffer.len() as u64) as usize;
            if let Err(e) = self.io.read_exact(&mut buffer[..want]) {
                return Err(self.fail(DeviceOperation::Read, offset, &e));
            }
            hasher.update(&buffer[..want]);
            offset += want as u64;
            bus.report(offset, Some(len));
        }

        let actual = hasher.finalize();
        if actual != *expected {
            error!("Read-back of {} gave {}, expected {}", self.device.display(), actual, expected);
            return Err(WriteError::VerifyFailed {
                device: self.device.clone(),
                expected: *expected,
                actual,
            });
        }

        info!("Verified {:.1} MB on {}", bytes_to_mb(len), self.device.display());
        Ok(())
    }

    /// The first partition that may carry a FAT filesystem.
    pub fn boot_partition(&mut self) -> Result<PartitionEntry, WriteError> {
        let parts = match partition::read_partitions(&mut *self.io) {
            Ok(parts) => parts,
            Err(e) => return Err(self.fail(DeviceOperation::Read, 0, &e)),
        };
        parts
            .into_iter()
            .find(|p| p.may_hold_fat())
            .ok_or_else(|| WriteError::BootPartitionNotFound(self.device.clone()))
    }

    /// A second handle on the device bounded to `part`.
    pub fn partition_io(&mut self, part: &PartitionEntry) -> Result<PartitionFileProxy<Box<dyn DiskIo>>, WriteError> {
        match self.io.try_clone_io() {
            Ok(io) => Ok(PartitionFileProxy::new(io, part.start, part.size)),
            Err(e) => Err(self.fail(DeviceOperation::Open, part.start, &e)),
        }
    }

    /// Mount the boot partition's FAT filesystem.
    pub fn open_boot_filesystem(&mut self) -> Result<BootFs, WriteError> {
        let part = self.boot_partition()?;
        debug!(
            "Opening FAT filesystem on partition {} at offset {} ({:.1} MB)",
            part.index,
            part.start,
            bytes_to_mb(part.size)
        );
        let proxy = self.partition_io(&part)?;
        fatfs::FileSystem::new(proxy, fatfs::FsOptions::new().update_accessed_date(false))
            .map_err(|e| WriteError::MountFailed(e.to_string()))
    }

    pub(crate) fn io_mut(&mut self) -> &mut dyn DiskIo {
        &mut *self.io
    }
}

/// Create (or truncate) `name`, a `/`-separated path, creating parent
/// directories as needed.
pub(crate) fn create_file_at<'a, T: Read + Write + Seek>(
    fs: &'a fatfs::FileSystem<T>,
    name: &str,
) -> io::Result<fatfs::File<'a, T>> {
    let mut parts: Vec<&str> = name.split('/').filter(|p| !p.is_empty()).collect();
    let file_name = parts
        .pop()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty file name"))?;

    let mut dir = fs.root_dir();
    for component in parts {
        dir = dir.create_dir(component)?;
    }
    let mut file = dir.create_file(file_name)?;
    file.truncate()?;
    Ok(file)
}

/// Fill `buf` from `reader`, stopping early only at EOF.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8], cancel: &CancelToken) -> Result<usize, WriteError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => cancel.check()?,
            Err(e) => {
                error!("Error reading from source: {}", e);
                return Err(WriteError::Extract(format!("Failed to read from source: {}", e)));
            }
        }
    }
    Ok(filled)
}
