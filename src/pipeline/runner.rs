// Drives one write job through its stages.

use super::JobReport;
use super::registry::DeviceLease;
use crate::config::ImagerConfig;
use crate::disk::customise::apply_customisation;
use crate::disk::extract::{self, ArchiveManifest, RawImage};
use crate::disk::secure_boot::{self, SigningKey};
use crate::disk::{DeviceProvider, Disk};
use crate::error::WriteError;
use crate::models::{
    CancelToken, Compression, CustomisationPayload, ImageKind, ImageSource, JobOutcome, RemoteImage,
    Stage, WriteJob,
};
use crate::utils::cache::ImageCache;
use crate::utils::fetch::{Fetcher, open_local};
use crate::utils::hashing::{Sha256Digest, hash_reader};
use crate::utils::tracker::ProgressBus;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{NamedTempFile, TempPath};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

fn worker_error(e: tokio::task::JoinError) -> WriteError {
    WriteError::Worker(e.to_string())
}

fn scratch_error(e: std::io::Error) -> WriteError {
    WriteError::Scratch(e.to_string())
}

/// Image bytes on local disk, ready for extraction.
struct Acquired {
    path: PathBuf,
    /// Download spool, deleted on drop.
    _spool: Option<TempPath>,
}

impl Acquired {
    fn in_place(path: PathBuf) -> Self {
        Self { path, _spool: None }
    }
}

enum Prepared {
    Raw(RawImage),
    Archive {
        path: PathBuf,
        manifest: ArchiveManifest,
    },
}

impl Prepared {
    fn required_capacity(&self) -> u64 {
        match self {
            Prepared::Raw(raw) => raw.len(),
            Prepared::Archive { manifest, .. } => manifest.required_capacity(),
        }
    }
}

/// Everything the blocking device stages need, moved onto the worker thread.
struct DeviceWork {
    disk: Disk,
    image: Prepared,
    key: Option<SigningKey>,
    customisation: Option<CustomisationPayload>,
    verify: bool,
    chunk_size: usize,
    temp_dir: PathBuf,
    cancel: CancelToken,
    bus: ProgressBus,
}

pub(crate) struct Runner<P> {
    config: Arc<ImagerConfig>,
    provider: Arc<P>,
    fetcher: Fetcher,
    cache: Option<ImageCache>,
    bus: ProgressBus,
    job: WriteJob,
    cache_tasks: Vec<JoinHandle<()>>,
}

impl<P: DeviceProvider> Runner<P> {
    pub fn new(
        config: Arc<ImagerConfig>,
        provider: Arc<P>,
        fetcher: Fetcher,
        cache: Option<ImageCache>,
        bus: ProgressBus,
        job: WriteJob,
    ) -> Self {
        Self {
            config,
            provider,
            fetcher,
            cache,
            bus,
            job,
            cache_tasks: Vec::new(),
        }
    }

    pub async fn run(mut self, lease: DeviceLease) -> JobReport {
        let result = self.execute().await;
        drop(lease);

        match &result {
            Ok(()) => info!("Write of {} to {} succeeded", self.job.source, self.job.device.path.display()),
            Err(WriteError::Cancelled) => info!("Write to {} cancelled", self.job.device.path.display()),
            Err(e) => error!(
                "Write to {} failed ({:?}): {}",
                self.job.device.path.display(),
                e.category(),
                e
            ),
        }

        let outcome = JobOutcome::from(result);
        let performance = self.bus.finish(outcome.clone());

        // Cache writers report on the same channel; let them settle so the
        // report is final when `wait` returns.
        for task in self.cache_tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Cache writer task failed: {}", e);
            }
        }

        JobReport {
            outcome,
            performance: Some(performance),
        }
    }

    async fn execute(&mut self) -> Result<(), WriteError> {
        let key = self.preflight()?;

        self.bus.enter(Stage::Download);
        let acquired = self.acquire().await?;
        let image = self.prepare(&acquired.path).await?;

        self.job.cancel.check()?;
        self.bus.enter(Stage::Unmount);
        if let Err(e) = self.provider.unmount(&self.job.device).await {
            warn!("Failed to unmount {}: {:#}", self.job.device.path.display(), e);
            self.bus.message(format!("Could not unmount all volumes ({}), continuing", e));
        }

        self.job.cancel.check()?;
        let disk = self.provider.open(&self.job.device).await?;

        let work = DeviceWork {
            disk,
            image,
            key,
            customisation: self.job.customisation.clone().filter(|p| !p.is_empty()),
            verify: self.job.options.verify,
            chunk_size: self.config.chunk_size(),
            temp_dir: self.config.effective_temp_dir(),
            cancel: self.job.cancel.clone(),
            bus: self.bus.clone(),
        };
        let result = tokio::task::spawn_blocking(move || write_device(work))
            .await
            .map_err(worker_error)?;
        drop(acquired);
        result
    }

    /// Checks that must pass before any stage is entered.
    fn preflight(&self) -> Result<Option<SigningKey>, WriteError> {
        let device = &self.job.device;
        if device.read_only {
            return Err(WriteError::DeviceReadOnly(device.path.clone()));
        }

        let key = if self.job.options.secure_boot {
            let key = SigningKey::load(self.config.signing_key.as_deref())?;
            info!("Using signing key {}", key.path().display());
            Some(key)
        } else {
            None
        };

        let mut declared = self.job.source.declared_extract_size(self.job.kind);
        match &self.job.source {
            ImageSource::LocalFile { path, .. } => {
                let (_, len) = open_local(path)?;
                if self.job.kind == ImageKind::Disk(Compression::None) {
                    declared = Some(len);
                }
            }
            ImageSource::Cache { path, origin: None, .. } => {
                open_local(path)?;
            }
            _ => {}
        }

        if let Some(size) = declared {
            extract::check_alignment(size)?;
            if size > device.capacity {
                return Err(WriteError::InsufficientCapacity {
                    required: size,
                    available: device.capacity,
                });
            }
        }

        Ok(key)
    }

    async fn acquire(&mut self) -> Result<Acquired, WriteError> {
        match self.job.source.clone() {
            ImageSource::Network(remote) => self.download(&remote).await,
            ImageSource::LocalFile { path, sha256 } => {
                if let Some(expected) = sha256 {
                    self.bus.message("Verifying image checksum...");
                    self.check_digest(&path, expected).await?;
                }
                Ok(Acquired::in_place(path))
            }
            ImageSource::Cache { path, sha256, origin } => {
                self.bus.message("Verifying cached image...");
                match self.check_digest(&path, sha256).await {
                    Ok(()) => Ok(Acquired::in_place(path)),
                    Err(e @ (WriteError::IntegrityMismatch { .. } | WriteError::SourceNotFound(_))) => {
                        warn!("Cached image {} is unusable: {}", path.display(), e);
                        ImageCache::remove_path(&path);
                        let Some(mut remote) = origin else {
                            return Err(e);
                        };
                        remote.sha256 = remote.sha256.or(Some(sha256));
                        self.bus.restart("Cached image is corrupt, downloading it again...");
                        self.download(&remote).await
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Hash a local file and compare it with `expected`.
    async fn check_digest(&self, path: &Path, expected: Sha256Digest) -> Result<(), WriteError> {
        let path = path.to_path_buf();
        let cancel = self.job.cancel.clone();
        let bus = self.bus.clone();
        let chunk_size = self.config.chunk_size();

        let actual = tokio::task::spawn_blocking(move || {
            let (file, _) = open_local(&path)?;
            let (digest, _) = hash_reader(
                file,
                chunk_size,
                &cancel,
                |bytes| bus.report(bytes, None),
                |e| WriteError::SourceNotReadable {
                    path: path.clone(),
                    cause: e.to_string(),
                },
            )?;
            Ok::<_, WriteError>(digest)
        })
        .await
        .map_err(worker_error)??;

        if actual != expected {
            error!("SHA256 mismatch: expected {}, got {}", expected, actual);
            return Err(WriteError::IntegrityMismatch { expected, actual });
        }
        debug!("SHA256 verified: {}", actual);
        Ok(())
    }

    async fn download(&mut self, remote: &RemoteImage) -> Result<Acquired, WriteError> {
        let temp_dir = self.config.effective_temp_dir();
        tokio::fs::create_dir_all(&temp_dir).await.map_err(scratch_error)?;
        let (file, spool) = NamedTempFile::new_in(&temp_dir)
            .map_err(scratch_error)?
            .into_parts();
        let mut sink = tokio::fs::File::from_std(file);

        let mut tee = None;
        if let Some(cache) = &self.cache {
            match cache.start_writer(&remote.url, self.bus.clone()) {
                Ok((writer, task)) => {
                    tee = Some(writer);
                    self.cache_tasks.push(task);
                }
                Err(e) => self
                    .bus
                    .cache_failed(format!("{}: {}", cache.dir().display(), e)),
            }
        }

        let summary = self
            .fetcher
            .download(remote, &mut sink, &mut tee, &self.bus, &self.job.cancel)
            .await?;
        drop(sink);

        match remote.sha256 {
            Some(expected) if expected != summary.sha256 => {
                error!(
                    "Downloaded image does not match: expected {}, got {}",
                    expected, summary.sha256
                );
                if let Some(cache) = &self.cache {
                    cache.remove(&remote.url);
                }
                return Err(WriteError::IntegrityMismatch {
                    expected,
                    actual: summary.sha256,
                });
            }
            Some(_) => {
                if let Some(tee) = tee {
                    tee.commit(summary.sha256, summary.bytes);
                }
            }
            None => {
                if tee.is_some() {
                    debug!("Not caching {}: no published SHA256", remote.url);
                }
            }
        }

        info!("Downloaded {} bytes to {}", summary.bytes, spool.display());
        Ok(Acquired {
            path: spool.to_path_buf(),
            _spool: Some(spool),
        })
    }

    /// Turn the acquired file into something the device stages can consume.
    async fn prepare(&self, path: &Path) -> Result<Prepared, WriteError> {
        let path = path.to_path_buf();
        let kind = self.job.kind;
        let declared = self.job.source.declared_extract_size(kind);
        let temp_dir = self.config.effective_temp_dir();
        let chunk_size = self.config.chunk_size();
        let cancel = self.job.cancel.clone();
        let bus = self.bus.clone();

        if matches!(kind, ImageKind::Disk(c) if c != Compression::None) && declared.is_none() {
            bus.restart("Decompressing image...");
        }

        tokio::task::spawn_blocking(move || match kind {
            ImageKind::Disk(compression) => RawImage::prepare(
                &path,
                compression,
                declared,
                &temp_dir,
                chunk_size,
                &cancel,
                &bus,
            )
            .map(Prepared::Raw),
            ImageKind::FatArchive => {
                let manifest = extract::inspect_archive(&path)?;
                Ok(Prepared::Archive { path, manifest })
            }
        })
        .await
        .map_err(worker_error)?
    }
}

/// Clear, write, verify, customise, sign and finalise, in that order.
fn write_device(work: DeviceWork) -> Result<(), WriteError> {
    let DeviceWork {
        mut disk,
        image,
        key,
        customisation,
        verify,
        chunk_size,
        temp_dir,
        cancel,
        bus,
    } = work;

    let capacity = disk.capacity()?;
    let required = image.required_capacity();
    if required > capacity {
        return Err(WriteError::InsufficientCapacity {
            required,
            available: capacity,
        });
    }

    bus.enter(Stage::Clear);
    disk.clear(capacity, &cancel)?;

    bus.enter(Stage::Write);
    match image {
        Prepared::Raw(raw) => {
            let reader = raw.open()?;
            let summary = disk.write_stream(reader, Some(raw.len()), chunk_size, &cancel, &bus)?;
            if verify {
                bus.enter(Stage::Verify);
                disk.verify(summary.bytes, &summary.sha256, chunk_size, &cancel, &bus)?;
            }
        }
        Prepared::Archive { path, manifest } => {
            bus.message("Writing filesystem...");
            let files = extract::write_fat_archive(
                &mut disk, &path, &manifest, capacity, chunk_size, &cancel, &bus,
            )?;
            if verify {
                bus.enter(Stage::Verify);
                extract::verify_fat_archive(&mut disk, &files, manifest.total, chunk_size, &cancel, &bus)?;
            }
        }
    }

    if let Some(payload) = customisation {
        bus.enter(Stage::Customise);
        apply_customisation(&mut disk, &payload, &cancel, &bus)?;
    }

    if let Some(key) = key {
        bus.enter(Stage::SecureBootSign);
        let digest = secure_boot::package_and_sign(&mut disk, &key, &temp_dir, &cancel, &bus)?;
        info!("Installed signed boot image {}", digest);
    }

    cancel.check()?;
    bus.enter(Stage::Finalise);
    disk.sync()?;
    Ok(())
}
