// Data model shared by the pipeline and its front-ends.

use crate::error::WriteError;
use crate::utils::hashing::Sha256Digest;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

// A simple cancel token for aborting operations
#[derive(Debug, Clone)]
pub struct CancelToken {
    // Whether the operation should be cancelled
    cancelled: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Chunk-boundary check used by every stage.
    pub fn check(&self) -> Result<(), WriteError> {
        if self.is_cancelled() {
            Err(WriteError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Xz,
    Gzip,
    Zstd,
}

/// How an image is laid onto the device, as declared by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    /// Raw block image, possibly compressed.
    Disk(Compression),
    /// Zip archive whose files are copied onto a fresh FAT partition.
    FatArchive,
}

const XZ_MAGIC: &[u8] = &[0xFD, b'7', b'z', b'X', b'Z', 0x00];
const GZIP_MAGIC: &[u8] = &[0x1F, 0x8B];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xB5, 0x2F, 0xFD];
const ZIP_MAGIC: &[u8] = &[b'P', b'K', 0x03, 0x04];

impl ImageKind {
    /// Identify a user-supplied file by its leading bytes.
    pub fn sniff(path: &Path) -> io::Result<Self> {
        let mut header = [0u8; 8];
        let mut file = File::open(path)?;
        let mut filled = 0;
        while filled < header.len() {
            match file.read(&mut header[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        Ok(Self::from_magic(&header[..filled]))
    }

    pub fn from_magic(header: &[u8]) -> Self {
        if header.starts_with(XZ_MAGIC) {
            ImageKind::Disk(Compression::Xz)
        } else if header.starts_with(GZIP_MAGIC) {
            ImageKind::Disk(Compression::Gzip)
        } else if header.starts_with(ZSTD_MAGIC) {
            ImageKind::Disk(Compression::Zstd)
        } else if header.starts_with(ZIP_MAGIC) {
            ImageKind::FatArchive
        } else {
            ImageKind::Disk(Compression::None)
        }
    }
}

/// An image published by a remote repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteImage {
    pub url: String,
    /// Bytes on the wire.
    pub download_size: Option<u64>,
    /// Size after decompression, when the catalog declares it.
    pub extract_size: Option<u64>,
    pub sha256: Option<Sha256Digest>,
}

impl RemoteImage {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            download_size: None,
            extract_size: None,
            sha256: None,
        }
    }
}

/// Where the image bytes come from. Immutable once a job starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Network(RemoteImage),
    LocalFile {
        path: PathBuf,
        sha256: Option<Sha256Digest>,
    },
    Cache {
        path: PathBuf,
        sha256: Sha256Digest,
        /// Where to re-download from if the cached copy turns out corrupt.
        origin: Option<RemoteImage>,
    },
}

impl ImageSource {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        ImageSource::LocalFile {
            path: path.into(),
            sha256: None,
        }
    }

    pub fn expected_sha256(&self) -> Option<Sha256Digest> {
        match self {
            ImageSource::Network(remote) => remote.sha256,
            ImageSource::LocalFile { sha256, .. } => *sha256,
            ImageSource::Cache { sha256, .. } => Some(*sha256),
        }
    }

    /// Declared size of the raw image, if the catalog provided one.
    pub fn declared_extract_size(&self, kind: ImageKind) -> Option<u64> {
        let remote = match self {
            ImageSource::Network(remote) => Some(remote),
            ImageSource::Cache { origin, .. } => origin.as_ref(),
            ImageSource::LocalFile { .. } => None,
        }?;
        match kind {
            ImageKind::Disk(Compression::None) => remote.extract_size.or(remote.download_size),
            ImageKind::Disk(_) => remote.extract_size,
            ImageKind::FatArchive => None,
        }
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Network(remote) => write!(f, "{}", remote.url),
            ImageSource::LocalFile { path, .. } => write!(f, "file:{}", path.display()),
            ImageSource::Cache { path, .. } => write!(f, "cache:{}", path.display()),
        }
    }
}

/// A removable block device as reported by device enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub path: PathBuf,
    pub description: String,
    /// Reported capacity in bytes. Re-validated before the first write.
    pub capacity: u64,
    pub mountpoints: Vec<PathBuf>,
    pub read_only: bool,
    pub removable: bool,
    pub system: bool,
}

impl DeviceHandle {
    pub fn new(path: impl Into<PathBuf>, capacity: u64) -> Self {
        let path = path.into();
        Self {
            description: path.display().to_string(),
            path,
            capacity,
            mountpoints: Vec::new(),
            read_only: false,
            removable: true,
            system: false,
        }
    }

    pub fn is_mounted(&self) -> bool {
        !self.mountpoints.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadFile {
    /// Path inside the boot partition, `/`-separated.
    pub name: String,
    pub contents: Vec<u8>,
}

/// Files and config fragments to drop onto the boot partition after
/// writing. Produced by the front-end; the pipeline does not interpret it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomisationPayload {
    pub files: Vec<PayloadFile>,
    pub config_txt_append: Option<String>,
    pub cmdline_append: Option<String>,
}

impl CustomisationPayload {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.config_txt_append.is_none() && self.cmdline_append.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    pub verify: bool,
    pub secure_boot: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            verify: true,
            secure_boot: false,
        }
    }
}

/// One request to move an image onto a device.
#[derive(Debug, Clone)]
pub struct WriteJob {
    pub source: ImageSource,
    pub kind: ImageKind,
    pub device: DeviceHandle,
    pub customisation: Option<CustomisationPayload>,
    pub options: WriteOptions,
    pub cancel: CancelToken,
}

impl WriteJob {
    pub fn new(source: ImageSource, kind: ImageKind, device: DeviceHandle) -> Self {
        Self {
            source,
            kind,
            device,
            customisation: None,
            options: WriteOptions::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_customisation(mut self, payload: CustomisationPayload) -> Self {
        self.customisation = Some(payload);
        self
    }

    pub fn with_options(mut self, options: WriteOptions) -> Self {
        self.options = options;
        self
    }
}

/// Pipeline stages in the order a job passes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Download,
    Unmount,
    Clear,
    Write,
    Verify,
    Customise,
    SecureBootSign,
    Finalise,
}

impl Stage {
    pub fn message(self) -> &'static str {
        match self {
            Stage::Download => "Starting download...",
            Stage::Unmount => "Unmounting volumes...",
            Stage::Clear => "Zero'ing out first and last MB of drive...",
            Stage::Write => "Writing image...",
            Stage::Verify => "Verifying write...",
            Stage::Customise => "Customising OS...",
            Stage::SecureBootSign => "Signing boot image...",
            Stage::Finalise => "Finalising...",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub stage: Stage,
    /// `None` while the stage cannot estimate its total.
    pub percent: Option<u8>,
    pub message: String,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success,
    Cancelled,
    Failed(WriteError),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success)
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Success => "success",
            JobOutcome::Cancelled => "cancelled",
            JobOutcome::Failed(_) => "failed",
        }
    }
}

impl From<Result<(), WriteError>> for JobOutcome {
    fn from(result: Result<(), WriteError>) -> Self {
        match result {
            Ok(()) => JobOutcome::Success,
            Err(WriteError::Cancelled) => JobOutcome::Cancelled,
            Err(e) => JobOutcome::Failed(e),
        }
    }
}

/// Everything a job publishes to its subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Progress(ProgressEvent),
    /// Caching failed; the write itself carries on.
    CacheWriteFailed(String),
    CacheStored(PathBuf),
    Finished(JobOutcome),
}
