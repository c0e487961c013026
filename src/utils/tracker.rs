use crate::models::{JobEvent, JobOutcome, ProgressEvent, Stage};
use crate::utils::perf::{PerfRecorder, PerformanceData};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Indeterminate stages emit at most one event per this many bytes.
const INDETERMINATE_STEP: u64 = 4 * 1024 * 1024;

#[derive(Debug)]
struct BusState {
    stage: Option<Stage>,
    message: String,
    percent: Option<u8>,
    bytes_done: u64,
    bytes_total: Option<u64>,
    last_emitted_bytes: u64,
    finished: bool,
    perf: PerfRecorder,
}

/// Per-job progress channel.
///
/// Stages may only be entered in pipeline order, each at most once, and the
/// percentage within a stage never decreases until `restart` opens a new
/// sub-step. Cache events travel on the same channel but are independent of
/// the stage axis.
#[derive(Debug, Clone)]
pub struct ProgressBus {
    state: Arc<Mutex<BusState>>,
    events: mpsc::UnboundedSender<JobEvent>,
}

impl ProgressBus {
    pub fn new(perf: PerfRecorder) -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = Self {
            state: Arc::new(Mutex::new(BusState {
                stage: None,
                message: String::new(),
                percent: None,
                bytes_done: 0,
                bytes_total: None,
                last_emitted_bytes: 0,
                finished: false,
                perf,
            })),
            events: tx,
        };
        (bus, rx)
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, state: &BusState) {
        if let Some(stage) = state.stage {
            let _ = self.events.send(JobEvent::Progress(ProgressEvent {
                stage,
                percent: state.percent,
                message: state.message.clone(),
                bytes_done: state.bytes_done,
                bytes_total: state.bytes_total,
            }));
        }
    }

    /// Move to `stage`. Returns false, and emits nothing, if the stage is not
    /// strictly after the current one.
    pub fn enter(&self, stage: Stage) -> bool {
        let mut state = self.lock();
        if state.finished {
            return false;
        }
        if let Some(current) = state.stage {
            if stage <= current {
                warn!("Ignoring out-of-order stage {} after {}", stage, current);
                return false;
            }
        }

        info!("Entering stage {}", stage);
        state.stage = Some(stage);
        state.message = stage.message().to_string();
        state.percent = None;
        state.bytes_done = 0;
        state.bytes_total = None;
        state.last_emitted_bytes = 0;
        state.perf.begin(stage);
        self.emit(&state);
        true
    }

    /// Report byte progress within the current stage.
    pub fn report(&self, bytes_done: u64, bytes_total: Option<u64>) {
        let mut state = self.lock();
        if state.finished || state.stage.is_none() {
            return;
        }

        state.perf.record_bytes(bytes_done);
        let bytes_done = bytes_done.max(state.bytes_done);
        state.bytes_done = bytes_done;
        if bytes_total.is_some() {
            state.bytes_total = bytes_total;
        }

        match state.bytes_total.filter(|total| *total > 0) {
            Some(total) => {
                let percent = (bytes_done.saturating_mul(100) / total).min(100) as u8;
                if state.percent.is_some_and(|p| percent <= p) {
                    return;
                }
                state.percent = Some(percent);
            }
            None => {
                if bytes_done < state.last_emitted_bytes + INDETERMINATE_STEP {
                    return;
                }
            }
        }

        state.last_emitted_bytes = bytes_done;
        self.emit(&state);
    }

    /// Start a new sub-step of the current stage whose byte counter begins
    /// at zero again, e.g. a re-download after hashing a corrupt cache file.
    pub fn restart(&self, message: impl Into<String>) {
        let mut state = self.lock();
        if state.finished {
            return;
        }
        state.message = message.into();
        state.percent = None;
        state.bytes_done = 0;
        state.bytes_total = None;
        state.last_emitted_bytes = 0;
        debug!("{}", state.message);
        self.emit(&state);
    }

    /// Replace the human-readable message of the current stage.
    pub fn message(&self, message: impl Into<String>) {
        let mut state = self.lock();
        if state.finished {
            return;
        }
        state.message = message.into();
        debug!("{}", state.message);
        self.emit(&state);
    }

    pub fn cache_failed(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("Cache write error: {}", message);
        let _ = self.events.send(JobEvent::CacheWriteFailed(message));
    }

    pub fn cache_stored(&self, path: PathBuf) {
        info!("Cached image at {}", path.display());
        let _ = self.events.send(JobEvent::CacheStored(path));
    }

    /// Emit the terminal event. Later progress reports are dropped.
    pub fn finish(&self, outcome: JobOutcome) -> PerformanceData {
        let mut state = self.lock();
        let perf = state.perf.finish(&outcome);
        if !state.finished {
            state.finished = true;
            let _ = self.events.send(JobEvent::Finished(outcome));
        }
        perf
    }
}
