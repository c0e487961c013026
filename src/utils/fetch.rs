use crate::config::ImagerConfig;
use crate::error::WriteError;
use crate::models::{CancelToken, RemoteImage};
use crate::utils::cache::CacheTee;
use crate::utils::hashing::{Sha256Digest, StreamingHasher};
use crate::utils::tracker::ProgressBus;
use futures_util::StreamExt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchSummary {
    pub bytes: u64,
    pub sha256: Sha256Digest,
}

/// Streams remote images. Network failures are reported, never retried.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    stall_timeout: Duration,
}

impl Fetcher {
    pub fn new(config: &ImagerConfig) -> Result<Self, WriteError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent.clone());
        if !config.use_system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| WriteError::Download(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            stall_timeout: config.stall_timeout(),
        })
    }

    /// Download `remote` into `sink`, teeing chunks into the cache writer
    /// when one is attached. Returns the byte count and digest of what was
    /// received; comparing it against the expected digest is up to the caller.
    pub async fn download(
        &self,
        remote: &RemoteImage,
        sink: &mut tokio::fs::File,
        tee: &mut Option<CacheTee>,
        bus: &ProgressBus,
        cancel: &CancelToken,
    ) -> Result<FetchSummary, WriteError> {
        info!("Downloading {}", remote.url);
        cancel.check()?;

        let response = self
            .client
            .get(&remote.url)
            .send()
            .await
            .map_err(|e| WriteError::Download(format!("Failed to fetch {}: {}", remote.url, e)))?;

        if !response.status().is_success() {
            return Err(WriteError::Download(format!(
                "{} returned status {}",
                remote.url,
                response.status()
            )));
        }

        let expected_len = response.content_length().or(remote.download_size);
        let mut stream = response.bytes_stream();
        let mut hasher = StreamingHasher::new();

        loop {
            cancel.check()?;

            let next = tokio::time::timeout(self.stall_timeout, stream.next())
                .await
                .map_err(|_| {
                    WriteError::Download(format!(
                        "no data received for {} seconds",
                        self.stall_timeout.as_secs()
                    ))
                })?;

            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    error!("Download of {} failed after {} bytes: {}", remote.url, hasher.bytes(), e);
                    return Err(WriteError::Download(e.to_string()));
                }
            };

            sink.write_all(&chunk)
                .await
                .map_err(|e| WriteError::Scratch(format!("Failed to write chunk: {}", e)))?;
            hasher.update(&chunk);

            if let Some(t) = tee.as_mut() {
                if !t.push(&chunk) {
                    *tee = None;
                }
            }

            bus.report(hasher.bytes(), expected_len);
        }

        sink.flush()
            .await
            .map_err(|e| WriteError::Scratch(format!("Failed to flush download: {}", e)))?;

        let bytes = hasher.bytes();
        if let Some(expected) = expected_len {
            if bytes < expected {
                return Err(WriteError::Download(format!(
                    "connection closed after {} of {} bytes",
                    bytes, expected
                )));
            }
        }

        let sha256 = hasher.finalize();
        debug!("Downloaded {} bytes from {}: {}", bytes, remote.url, sha256);
        Ok(FetchSummary { bytes, sha256 })
    }
}

/// Open a local or cached image, checking the source preconditions before
/// any byte is read.
pub fn open_local(path: &Path) -> Result<(File, u64), WriteError> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(WriteError::SourceNotFound(path.to_path_buf()));
        }
        Err(e) => {
            return Err(WriteError::SourceNotReadable {
                path: path.to_path_buf(),
                cause: e.to_string(),
            });
        }
    };

    if !metadata.is_file() {
        return Err(WriteError::SourceNotRegularFile(path.to_path_buf()));
    }

    let file = File::open(path).map_err(|e| WriteError::SourceNotReadable {
        path: path.to_path_buf(),
        cause: e.to_string(),
    })?;
    Ok((file, metadata.len()))
}
