use crate::models::{JobOutcome, Stage};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub duration_ms: u64,
    pub bytes: u64,
    /// Only present for stages that moved data.
    pub throughput_mib_s: Option<f64>,
}

/// Diagnostic record of one job, exported as JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceData {
    pub job_id: Uuid,
    pub source: String,
    pub device: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<String>,
    pub error: Option<String>,
    pub total_duration_ms: u64,
    pub stages: Vec<StageTiming>,
}

impl PerformanceData {
    pub fn stage(&self, stage: Stage) -> Option<&StageTiming> {
        self.stages.iter().find(|t| t.stage == stage)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize performance data")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to save performance data to {}", path.display()))?;
        info!("Saved performance data to {}", path.display());
        Ok(())
    }
}

/// Accumulates stage timings while a job runs.
#[derive(Debug)]
pub struct PerfRecorder {
    data: PerformanceData,
    job_start: Instant,
    current: Option<(Stage, Instant, u64)>,
}

impl PerfRecorder {
    pub fn new(job_id: Uuid, source: String, device: PathBuf) -> Self {
        Self {
            data: PerformanceData {
                job_id,
                source,
                device,
                started_at: Utc::now(),
                finished_at: None,
                outcome: None,
                error: None,
                total_duration_ms: 0,
                stages: Vec::new(),
            },
            job_start: Instant::now(),
            current: None,
        }
    }

    pub fn begin(&mut self, stage: Stage) {
        self.end_current();
        self.current = Some((stage, Instant::now(), 0));
    }

    pub fn record_bytes(&mut self, bytes: u64) {
        if let Some((_, _, recorded)) = self.current.as_mut() {
            *recorded = (*recorded).max(bytes);
        }
    }

    fn end_current(&mut self) {
        if let Some((stage, started, bytes)) = self.current.take() {
            let elapsed = started.elapsed();
            let secs = elapsed.as_secs_f64();
            let throughput_mib_s = (bytes > 0 && secs > 0.0).then(|| bytes as f64 / MIB / secs);
            self.data.stages.push(StageTiming {
                stage,
                duration_ms: elapsed.as_millis() as u64,
                bytes,
                throughput_mib_s,
            });
        }
    }

    pub fn finish(&mut self, outcome: &JobOutcome) -> PerformanceData {
        self.end_current();
        self.data.finished_at = Some(Utc::now());
        self.data.total_duration_ms = self.job_start.elapsed().as_millis() as u64;
        self.data.outcome = Some(outcome.label().to_string());
        self.data.error = match outcome {
            JobOutcome::Failed(e) => Some(e.to_string()),
            _ => None,
        };
        self.data.clone()
    }
}
