// Typed failures of a write job.
//
// Display strings are the user-facing messages; every variant carries the
// parameters (device path, digests, byte counts) needed to act on it.

use crate::utils::hashing::Sha256Digest;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification used by front-ends to pick a corrective action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorCategory {
    Precondition,
    Integrity,
    Device,
    Permission,
    Capacity,
    Cache,
    Network,
    SecureBoot,
    Cancelled,
}

/// What the storage device reported when an I/O operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceFault {
    PermissionDenied,
    DiskFull,
    WriteProtected,
    MediaError,
    InvalidParameter,
    Busy,
    Io,
}

impl DeviceFault {
    pub fn message(self) -> &'static str {
        match self {
            DeviceFault::PermissionDenied => "Access denied error while writing file to disk.",
            DeviceFault::DiskFull => "Disk is full. Please use a larger storage device.",
            DeviceFault::WriteProtected => {
                "The disk is write-protected. Please check if the disk has a physical write-protect switch or is read-only."
            }
            DeviceFault::MediaError => {
                "Media error detected. The storage device may be damaged or counterfeit. Please try a different device."
            }
            DeviceFault::InvalidParameter => {
                "Invalid disk parameter. The storage device may not be properly recognized. Please try reconnecting the device."
            }
            DeviceFault::Busy => "The storage device is in use by another process.",
            DeviceFault::Io => {
                "I/O device error. The storage device may have been disconnected or is malfunctioning."
            }
        }
    }
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// The device operation that was in flight when a fault occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceOperation {
    Open,
    Clear,
    Write,
    Flush,
    Fsync,
    FirstBlock,
    Read,
    Format,
}

impl fmt::Display for DeviceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceOperation::Open => "while opening device",
            DeviceOperation::Clear => "while zeroing out first part of card",
            DeviceOperation::Write => "while writing",
            DeviceOperation::Flush => "while flushing",
            DeviceOperation::Fsync => "while fsync",
            DeviceOperation::FirstBlock => "while writing first block (partition table)",
            DeviceOperation::Read => "while reading back",
            DeviceOperation::Format => "while creating partition table",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WriteError {
    #[error("Source file not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("Source file is not readable: {} ({cause})", .path.display())]
    SourceNotReadable { path: PathBuf, cause: String },

    #[error("Source is not a regular file: {}", .0.display())]
    SourceNotRegularFile(PathBuf),

    #[error(
        "Input file is not a valid disk image. File size {size} bytes is not a multiple of 512 bytes."
    )]
    InvalidImageSize { size: u64 },

    #[error("Error downloading: {0}")]
    Download(String),

    #[error("SHA256 hash does not match. Expected {expected}, actual {actual}")]
    IntegrityMismatch {
        expected: Sha256Digest,
        actual: Sha256Digest,
    },

    #[error("Error extracting archive: {0}")]
    Extract(String),

    #[error("Error writing temporary file: {0}")]
    Scratch(String),

    #[error("Error mounting FAT32 partition: {0}")]
    MountFailed(String),

    #[error("Operating system did not mount FAT32 partition")]
    MountNotPerformed,

    #[error(
        "Storage capacity is not large enough. Needs to be at least {required} bytes, device has {available} bytes."
    )]
    InsufficientCapacity { required: u64, available: u64 },

    #[error(
        "Write error while trying to zero out last part of card {} at offset {offset}. Card could be advertising wrong capacity (possible counterfeit).",
        .device.display()
    )]
    PossibleCounterfeit { device: PathBuf, offset: u64 },

    #[error("{fault} Error on {} {operation} at offset {offset}: {cause}", .device.display())]
    Device {
        device: PathBuf,
        fault: DeviceFault,
        operation: DeviceOperation,
        offset: u64,
        cause: String,
    },

    #[error(
        "Error: Multiple partitions found on disk {}. Please ensure the disk is completely clean.",
        .0.display()
    )]
    MultiplePartitions(PathBuf),

    #[error("{} is read-only. {}", .0.display(), DeviceFault::WriteProtected)]
    DeviceReadOnly(PathBuf),

    #[error("{} is already being written by another job", .0.display())]
    DeviceBusy(PathBuf),

    #[error("Storage device {} was removed. Please reconnect it and select it again.", .0.display())]
    DeviceRemoved(PathBuf),

    #[error(
        "Verifying write failed. Contents of {} is different from what was written to it. Expected {expected}, read back {actual}",
        .device.display()
    )]
    VerifyFailed {
        device: PathBuf,
        expected: Sha256Digest,
        actual: Sha256Digest,
    },

    #[error("No RSA key configured for secure boot. Set a signing key before writing with secure boot enabled.")]
    NoSigningKeyConfigured,

    #[error("RSA key file not found: {}", .0.display())]
    SigningKeyNotFound(PathBuf),

    #[error("RSA key {} is not usable: {reason}", .path.display())]
    InvalidSigningKey { path: PathBuf, reason: String },

    #[error("No boot files found to package")]
    NoBootFilesFound,

    #[error("No FAT boot partition found on {}", .0.display())]
    BootPartitionNotFound(PathBuf),

    #[error("{step}: {cause}")]
    SecureBoot { step: &'static str, cause: String },

    #[error("Error customising OS: {0}")]
    Customisation(String),

    #[error("Cache write error: {0}")]
    CacheWrite(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Write worker failed: {0}")]
    Worker(String),
}

impl WriteError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            WriteError::SourceNotFound(_)
            | WriteError::SourceNotReadable { .. }
            | WriteError::SourceNotRegularFile(_)
            | WriteError::InvalidImageSize { .. }
            | WriteError::MultiplePartitions(_)
            | WriteError::DeviceBusy(_)
            | WriteError::NoSigningKeyConfigured
            | WriteError::SigningKeyNotFound(_)
            | WriteError::InvalidSigningKey { .. } => ErrorCategory::Precondition,
            WriteError::IntegrityMismatch { .. }
            | WriteError::VerifyFailed { .. }
            | WriteError::Extract(_) => ErrorCategory::Integrity,
            WriteError::Device { fault, .. } => match fault {
                DeviceFault::PermissionDenied => ErrorCategory::Permission,
                DeviceFault::DiskFull => ErrorCategory::Capacity,
                _ => ErrorCategory::Device,
            },
            WriteError::InsufficientCapacity { .. } => ErrorCategory::Capacity,
            WriteError::PossibleCounterfeit { .. }
            | WriteError::DeviceReadOnly(_)
            | WriteError::DeviceRemoved(_)
            | WriteError::MountFailed(_)
            | WriteError::MountNotPerformed
            | WriteError::Customisation(_)
            | WriteError::Scratch(_)
            | WriteError::Worker(_) => ErrorCategory::Device,
            WriteError::Download(_) => ErrorCategory::Network,
            WriteError::NoBootFilesFound
            | WriteError::BootPartitionNotFound(_)
            | WriteError::SecureBoot { .. } => ErrorCategory::SecureBoot,
            WriteError::CacheWrite(_) => ErrorCategory::Cache,
            WriteError::Cancelled => ErrorCategory::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, WriteError::Cancelled)
    }

    pub(crate) fn secure_boot(step: &'static str, cause: impl fmt::Display) -> Self {
        WriteError::SecureBoot {
            step,
            cause: cause.to_string(),
        }
    }
}
