// Write job orchestration.
//
// `Imager::start_write` validates device ownership and spawns the job on the
// tokio runtime. Each job runs its stages sequentially; blocking device work
// is moved onto the blocking thread pool. Progress and the terminal outcome
// are published on the job's event channel.

pub mod registry;
mod runner;

use crate::config::ImagerConfig;
use crate::disk::{DeviceProvider, SystemDevices};
use crate::error::WriteError;
use crate::models::{CancelToken, JobEvent, JobOutcome, WriteJob};
use crate::utils::cache::ImageCache;
use crate::utils::fetch::Fetcher;
use crate::utils::perf::{PerfRecorder, PerformanceData};
use crate::utils::tracker::ProgressBus;
use registry::DeviceRegistry;
use runner::Runner;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::info;
use uuid::Uuid;

/// Result of a finished job.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub outcome: JobOutcome,
    /// Absent only if the job's worker itself died.
    pub performance: Option<PerformanceData>,
}

/// Caller's side of a running job.
#[derive(Debug)]
pub struct JobHandle {
    id: Uuid,
    device: PathBuf,
    cancel: CancelToken,
    events: Option<mpsc::UnboundedReceiver<JobEvent>>,
    task: JoinHandle<JobReport>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn cancel(&self) {
        info!("Cancelling job {}", self.id);
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Next event of the job, `None` once the stream is exhausted or taken.
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        match self.events.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Take the event stream, e.g. to forward it to a UI.
    pub fn events(&mut self) -> Option<UnboundedReceiverStream<JobEvent>> {
        self.events.take().map(UnboundedReceiverStream::new)
    }

    /// Wait for the job to end.
    pub async fn wait(self) -> JobReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => JobReport {
                outcome: JobOutcome::Failed(WriteError::Worker(e.to_string())),
                performance: None,
            },
        }
    }
}

/// Entry point for writing images to devices.
pub struct Imager<P: DeviceProvider = SystemDevices> {
    config: Arc<ImagerConfig>,
    provider: Arc<P>,
    registry: DeviceRegistry,
    fetcher: Fetcher,
    cache: Option<ImageCache>,
}

impl Imager<SystemDevices> {
    pub fn new(config: ImagerConfig) -> Result<Self, WriteError> {
        Self::with_provider(config, SystemDevices)
    }
}

impl<P: DeviceProvider> Imager<P> {
    pub fn with_provider(config: ImagerConfig, provider: P) -> Result<Self, WriteError> {
        let fetcher = Fetcher::new(&config)?;
        let cache = ImageCache::from_config(&config);
        Ok(Self {
            config: Arc::new(config),
            provider: Arc::new(provider),
            registry: DeviceRegistry::new(),
            fetcher,
            cache,
        })
    }

    pub fn config(&self) -> &ImagerConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&ImageCache> {
        self.cache.as_ref()
    }

    pub fn is_busy(&self, device: &Path) -> bool {
        self.registry.is_busy(device)
    }

    /// Start `job` on the current tokio runtime. A job whose device is
    /// already being written is rejected here, before anything runs.
    pub fn start_write(&self, job: WriteJob) -> Result<JobHandle, WriteError> {
        let id = Uuid::new_v4();
        let device = job.device.path.clone();
        let lease = self
            .registry
            .claim(&device, id)
            .ok_or_else(|| WriteError::DeviceBusy(device.clone()))?;

        info!("Starting job {}: {} -> {}", id, job.source, device.display());
        let (bus, events) = ProgressBus::new(PerfRecorder::new(
            id,
            job.source.to_string(),
            device.clone(),
        ));
        let cancel = job.cancel.clone();
        let runner = Runner::new(
            self.config.clone(),
            self.provider.clone(),
            self.fetcher.clone(),
            self.cache.clone(),
            bus,
            job,
        );
        let task = tokio::spawn(runner.run(lease));

        Ok(JobHandle {
            id,
            device,
            cancel,
            events: Some(events),
            task,
        })
    }

    pub fn cancel(&self, handle: &JobHandle) {
        handle.cancel();
    }
}

#[cfg(test)]
mod tests;
