#![forbid(unsafe_code)]

//! Download job records and the process-local registry that tracks them.
//!
//! A [`Job`] owns its own state machine: every transition is a method that
//! refuses to move a job out of a terminal state. The [`JobStore`] adds the
//! second half of that guarantee by dropping any mutation aimed at a job that
//! has already finished.

use std::{collections::HashMap, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::extractor::ProgressEvent;

pub const DEFAULT_QUALITY: &str = "best";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Starting,
    Downloading,
    Processing,
    Completed,
    Error,
    Cancelled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Starting => "starting",
            Self::Downloading => "downloading",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// Cancellation is only honoured before the raw transfer has finished.
    pub fn is_cancellable(self) -> bool {
        matches!(self, Self::Queued | Self::Starting | Self::Downloading)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub target_id: String,
    pub kind: MediaKind,
    pub quality: String,
    pub state: JobState,
    pub progress_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot cancel a download that is {0}")]
pub struct CancelRejected(pub JobState);

impl Job {
    pub fn new(job_id: String, target_id: String, kind: MediaKind, quality: String) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            target_id,
            kind,
            quality,
            state: JobState::Queued,
            progress_percent: 0.0,
            speed: None,
            eta: None,
            artifact_name: None,
            title: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Worker pool admitted the job.
    pub fn mark_starting(&mut self) {
        if self.state != JobState::Queued {
            return;
        }
        self.state = JobState::Starting;
        self.progress_percent = 0.0;
        self.touch();
    }

    /// Folds one extractor event into the record. Ticks without a usable total
    /// only refresh the transient speed/eta of a job that is already
    /// downloading; the percentage never moves backwards.
    pub fn apply_progress(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Transfer {
                downloaded,
                total,
                speed,
                eta,
            } => {
                if !matches!(self.state, JobState::Starting | JobState::Downloading) {
                    return;
                }
                match total.filter(|total| *total > 0) {
                    Some(total) => {
                        let percent = percent_of(*downloaded, total);
                        self.state = JobState::Downloading;
                        if percent > self.progress_percent {
                            self.progress_percent = percent;
                        }
                    }
                    None if self.state == JobState::Downloading => {}
                    None => return,
                }
                if let Some(speed) = speed.filter(|speed| *speed > 0.0) {
                    self.speed = Some(format_speed(speed));
                }
                if let Some(eta) = eta.filter(|eta| *eta > 0) {
                    self.eta = Some(format_eta(eta));
                }
                self.touch();
            }
            ProgressEvent::TransferFinished => {
                if !matches!(self.state, JobState::Starting | JobState::Downloading) {
                    return;
                }
                self.state = JobState::Processing;
                self.progress_percent = 100.0;
                self.clear_transient();
                self.touch();
            }
        }
    }

    pub fn complete(&mut self, artifact_name: String, title: String) {
        if self.is_terminal() {
            return;
        }
        self.state = JobState::Completed;
        self.progress_percent = 100.0;
        self.artifact_name = Some(artifact_name);
        self.title = Some(title);
        self.clear_transient();
        self.finish();
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.state = JobState::Error;
        self.error_message = Some(message.into());
        self.clear_transient();
        self.finish();
    }

    pub fn cancel(&mut self) -> Result<(), CancelRejected> {
        if !self.state.is_cancellable() {
            return Err(CancelRejected(self.state));
        }
        self.state = JobState::Cancelled;
        self.clear_transient();
        self.finish();
        Ok(())
    }

    fn clear_transient(&mut self) {
        self.speed = None;
        self.eta = None;
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.updated_at = now;
        self.finished_at = Some(now);
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

fn percent_of(downloaded: u64, total: u64) -> f64 {
    let raw = downloaded as f64 / total as f64 * 100.0;
    ((raw * 10.0).round() / 10.0).clamp(0.0, 100.0)
}

fn format_speed(bytes_per_sec: f64) -> String {
    format!("{:.1} MB/s", bytes_per_sec / 1024.0 / 1024.0)
}

fn format_eta(secs: u64) -> String {
    format!("{secs}s")
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobStoreError {
    #[error("download not found: {0}")]
    NotFound(String),
    #[error("download already exists: {0}")]
    Duplicate(String),
}

/// Result of [`JobStore::update`]. `Ignored` means the job was already
/// terminal and the mutator never ran.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied(Job),
    Ignored(Job),
}

impl UpdateOutcome {
    pub fn was_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn into_job(self) -> Job {
        match self {
            Self::Applied(job) | Self::Ignored(job) => job,
        }
    }
}

pub trait JobStore: Send + Sync {
    fn create(&self, job: Job) -> Result<(), JobStoreError>;

    fn get(&self, job_id: &str) -> Result<Job, JobStoreError>;

    fn update(
        &self,
        job_id: &str,
        mutator: &mut dyn FnMut(&mut Job),
    ) -> Result<UpdateOutcome, JobStoreError>;

    /// Drops terminal jobs that finished before `cutoff`. Returns how many
    /// records were removed.
    fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> usize;

    /// Artifact names of completed jobs that are still on record. Their files
    /// stay reachable through a download reference until the job is evicted.
    fn retained_artifacts(&self) -> Vec<String>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Map of per-job mutexes. The outer lock is only held long enough to find
/// the entry, so pollers of one job never wait on writers of another.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Arc<Mutex<Job>>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, job_id: &str) -> Result<Arc<Mutex<Job>>, JobStoreError> {
        self.jobs
            .read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))
    }
}

impl JobStore for MemoryJobStore {
    fn create(&self, job: Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.job_id) {
            return Err(JobStoreError::Duplicate(job.job_id));
        }
        jobs.insert(job.job_id.clone(), Arc::new(Mutex::new(job)));
        Ok(())
    }

    fn get(&self, job_id: &str) -> Result<Job, JobStoreError> {
        Ok(self.entry(job_id)?.lock().clone())
    }

    fn update(
        &self,
        job_id: &str,
        mutator: &mut dyn FnMut(&mut Job),
    ) -> Result<UpdateOutcome, JobStoreError> {
        let entry = self.entry(job_id)?;
        let mut job = entry.lock();
        if job.is_terminal() {
            return Ok(UpdateOutcome::Ignored(job.clone()));
        }
        mutator(&mut job);
        Ok(UpdateOutcome::Applied(job.clone()))
    }

    fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, entry| {
            let job = entry.lock();
            !matches!(job.finished_at, Some(finished) if finished < cutoff)
        });
        before - jobs.len()
    }

    fn retained_artifacts(&self) -> Vec<String> {
        self.jobs
            .read()
            .values()
            .filter_map(|entry| {
                let job = entry.lock();
                match job.state {
                    JobState::Completed => job.artifact_name.clone(),
                    _ => None,
                }
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.jobs.read().len()
    }
}
