// Local image cache.
//
// Each entry is a data file `<key>.bin` plus a JSON sidecar `<key>.json`
// describing it. Downloads are teed into a `<key>.<uuid>.part` file by a
// background task and only renamed into place once the full download has
// been verified, so readers never see a partially written entry.

use crate::config::ImagerConfig;
use crate::models::{ImageSource, RemoteImage};
use crate::utils::hashing::{Sha256Digest, StreamingHasher};
use crate::utils::tracker::ProgressBus;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DATA_EXT: &str = "bin";
const SIDECAR_EXT: &str = "json";
const PART_EXT: &str = "part";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub source_key: String,
    pub path: PathBuf,
    pub sha256: Sha256Digest,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ImageCache {
    dir: PathBuf,
    queue_depth: usize,
}

impl ImageCache {
    pub fn new(dir: impl Into<PathBuf>, queue_depth: usize) -> Self {
        Self {
            dir: dir.into(),
            queue_depth: queue_depth.max(1),
        }
    }

    pub fn from_config(config: &ImagerConfig) -> Option<Self> {
        config
            .effective_cache_dir()
            .map(|dir| Self::new(dir, config.cache_queue_depth))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_for(source_key: &str) -> String {
        let digest = Sha256Digest::of(source_key.as_bytes());
        hex::encode(&digest.as_bytes()[..16])
    }

    pub fn data_path(&self, source_key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", Self::key_for(source_key), DATA_EXT))
    }

    fn sidecar_for(data_path: &Path) -> PathBuf {
        data_path.with_extension(SIDECAR_EXT)
    }

    /// Find a complete entry for `source_key`. Entries whose sidecar does not
    /// describe the data file, or whose digest differs from `expected`, are
    /// deleted.
    pub fn lookup(&self, source_key: &str, expected: Option<&Sha256Digest>) -> Option<CacheEntry> {
        let data_path = self.data_path(source_key);
        let sidecar = Self::sidecar_for(&data_path);

        let content = match fs::read_to_string(&sidecar) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read cache sidecar {}: {}", sidecar.display(), e);
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&content) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Corrupt cache sidecar {}: {}", sidecar.display(), e);
                Self::remove_path(&data_path);
                return None;
            }
        };

        let valid = entry.source_key == source_key
            && fs::metadata(&data_path).is_ok_and(|m| m.is_file() && m.len() == entry.size_bytes)
            && expected.is_none_or(|e| *e == entry.sha256);

        if !valid {
            info!("Discarding stale cache entry for {}", source_key);
            Self::remove_path(&data_path);
            return None;
        }

        debug!("Cache hit for {}: {}", source_key, data_path.display());
        Some(CacheEntry {
            path: data_path,
            ..entry
        })
    }

    /// Pick the cached copy of `remote` if there is one, otherwise the
    /// network. The cached source keeps `remote` as its origin so that a
    /// corrupt copy can be re-fetched.
    pub fn resolve_source(&self, remote: &RemoteImage) -> ImageSource {
        match self.lookup(&remote.url, remote.sha256.as_ref()) {
            Some(entry) => ImageSource::Cache {
                path: entry.path,
                sha256: entry.sha256,
                origin: Some(remote.clone()),
            },
            None => ImageSource::Network(remote.clone()),
        }
    }

    pub fn remove(&self, source_key: &str) {
        Self::remove_path(&self.data_path(source_key));
    }

    /// Delete a data file and its sidecar.
    pub fn remove_path(data_path: &Path) {
        for path in [data_path.to_path_buf(), Self::sidecar_for(data_path)] {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }

    /// Remove `.part` files left behind by interrupted cache writes.
    pub fn clean_partials(&self) -> io::Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_part = path.extension().is_some_and(|ext| ext == PART_EXT);
            if is_part && entry.file_type().is_ok_and(|t| t.is_file()) {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        info!("Removed {} partial cache files", removed);
        Ok(removed)
    }

    /// Spawn the background writer for one download.
    pub fn start_writer(
        &self,
        source_key: &str,
        bus: ProgressBus,
    ) -> io::Result<(CacheTee, JoinHandle<()>)> {
        fs::create_dir_all(&self.dir)?;

        let data_path = self.data_path(source_key);
        let part_path = data_path.with_extension(format!("{}.{}", Uuid::new_v4(), PART_EXT));
        let (chunk_tx, chunk_rx) = mpsc::channel(self.queue_depth);
        let (commit_tx, commit_rx) = oneshot::channel();

        let task = tokio::spawn(write_entry(
            chunk_rx,
            commit_rx,
            PendingEntry {
                source_key: source_key.to_string(),
                part_path,
                data_path,
            },
            bus.clone(),
        ));

        Ok((
            CacheTee {
                chunks: Some(chunk_tx),
                commit: Some(commit_tx),
                bus,
            },
            task,
        ))
    }
}

#[derive(Debug)]
struct CacheCommit {
    sha256: Sha256Digest,
    bytes: u64,
}

struct PendingEntry {
    source_key: String,
    part_path: PathBuf,
    data_path: PathBuf,
}

/// Fetcher-side handle of a cache write. Dropping it without `commit`
/// discards the partial file.
#[derive(Debug)]
pub struct CacheTee {
    chunks: Option<mpsc::Sender<Bytes>>,
    commit: Option<oneshot::Sender<CacheCommit>>,
    bus: ProgressBus,
}

impl CacheTee {
    /// Hand a chunk to the writer without waiting. Returns false once
    /// caching has been given up for this download.
    pub fn push(&mut self, chunk: &Bytes) -> bool {
        let Some(tx) = self.chunks.as_ref() else {
            return false;
        };

        match tx.try_send(chunk.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.disable();
                self.bus
                    .cache_failed("cache writer fell behind, caching disabled for this download");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.disable();
                false
            }
        }
    }

    fn disable(&mut self) {
        self.chunks = None;
        self.commit = None;
    }

    /// The download finished and matched its expected digest.
    pub fn commit(mut self, sha256: Sha256Digest, bytes: u64) {
        if let (Some(chunks), Some(commit)) = (self.chunks.take(), self.commit.take()) {
            let _ = commit.send(CacheCommit { sha256, bytes });
            drop(chunks);
        }
    }
}

async fn write_entry(
    chunks: mpsc::Receiver<Bytes>,
    commit: oneshot::Receiver<CacheCommit>,
    pending: PendingEntry,
    bus: ProgressBus,
) {
    let part_path = pending.part_path.clone();
    match persist(chunks, commit, pending).await {
        Ok(Some(entry)) => bus.cache_stored(entry.path),
        Ok(None) => {
            debug!("Cache write abandoned: {}", part_path.display());
            let _ = tokio::fs::remove_file(&part_path).await;
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&part_path).await;
            bus.cache_failed(e);
        }
    }
}

async fn persist(
    mut chunks: mpsc::Receiver<Bytes>,
    mut commit: oneshot::Receiver<CacheCommit>,
    pending: PendingEntry,
) -> Result<Option<CacheEntry>, String> {
    let mut file = tokio::fs::File::create(&pending.part_path)
        .await
        .map_err(|e| format!("{}: {}", pending.part_path.display(), e))?;
    let mut hasher = StreamingHasher::new();

    while let Some(chunk) = chunks.recv().await {
        file.write_all(&chunk)
            .await
            .map_err(|e| format!("{}: {}", pending.part_path.display(), e))?;
        hasher.update(&chunk);
    }

    // The sender publishes the commit before closing the chunk channel.
    let Ok(commit) = commit.try_recv() else {
        return Ok(None);
    };

    let written = hasher.bytes();
    let digest = hasher.finalize();
    if written != commit.bytes || digest != commit.sha256 {
        return Err(format!(
            "cached copy differs from download ({} bytes, {}; expected {} bytes, {})",
            written, digest, commit.bytes, commit.sha256
        ));
    }

    file.flush().await.map_err(|e| e.to_string())?;
    file.sync_all().await.map_err(|e| e.to_string())?;
    drop(file);

    // Last writer wins; rename is atomic within the cache directory.
    tokio::fs::rename(&pending.part_path, &pending.data_path)
        .await
        .map_err(|e| format!("{}: {}", pending.data_path.display(), e))?;

    let entry = CacheEntry {
        source_key: pending.source_key,
        path: pending.data_path.clone(),
        sha256: digest,
        size_bytes: written,
    };
    let sidecar = ImageCache::sidecar_for(&pending.data_path);
    let sidecar_tmp = sidecar.with_extension(format!("{}.{}", Uuid::new_v4(), PART_EXT));
    let json = serde_json::to_vec_pretty(&entry).map_err(|e| e.to_string())?;
    tokio::fs::write(&sidecar_tmp, json)
        .await
        .map_err(|e| format!("{}: {}", sidecar_tmp.display(), e))?;
    if let Err(e) = tokio::fs::rename(&sidecar_tmp, &sidecar).await {
        let _ = tokio::fs::remove_file(&sidecar_tmp).await;
        return Err(format!("{}: {}", sidecar.display(), e));
    }

    Ok(Some(entry))
}
