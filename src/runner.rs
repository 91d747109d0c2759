#![forbid(unsafe_code)]

//! Bounded worker pool that executes download jobs off the request path.
//!
//! Admission goes through a fair [`Semaphore`], so once every slot is busy
//! new jobs wait in FIFO order instead of being rejected. Each admitted job
//! runs the blocking extractor on the blocking pool while the async half folds
//! its progress events into the [`JobStore`] in arrival order. The runner is
//! the only writer for a job apart from [`JobRunner::cancel`], whose
//! transition is gated on the job not having reached `processing` yet.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifact::{find_artifact, purge_stale_artifacts, remove_stem_files};
use crate::extractor::{ExtractionError, Extractor, FetchOutcome, FetchRequest, ProgressEvent};
use crate::jobs::{Job, JobState, JobStore, JobStoreError, UpdateOutcome};

const PROGRESS_BUFFER: usize = 64;
pub const FILE_NOT_FOUND_MESSAGE: &str = "Download failed: file not found";
const SHUTDOWN_MESSAGE: &str = "Download aborted: server shutting down";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CancelError {
    #[error("Download not found")]
    NotFound,
    #[error("Download cannot be cancelled: already {0}")]
    Rejected(JobState),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted_jobs: usize,
    pub purged_artifacts: usize,
}

struct InFlight {
    token: CancellationToken,
    artifact_stem: String,
}

struct RunnerInner {
    store: Arc<dyn JobStore>,
    extractor: Arc<dyn Extractor>,
    download_dir: PathBuf,
    slots: Arc<Semaphore>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<RunnerInner>,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        extractor: Arc<dyn Extractor>,
        download_dir: PathBuf,
        max_concurrent: usize,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                store,
                extractor,
                download_dir,
                slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
                in_flight: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.inner.download_dir
    }

    /// Hands a freshly stored job to the pool and returns immediately.
    pub fn schedule(&self, job: &Job) {
        let artifact_stem = Uuid::new_v4().simple().to_string();
        let token = self.inner.shutdown.child_token();
        self.inner.in_flight.lock().insert(
            job.job_id.clone(),
            InFlight {
                token: token.clone(),
                artifact_stem: artifact_stem.clone(),
            },
        );

        let request = FetchRequest {
            target_id: job.target_id.clone(),
            kind: job.kind,
            quality: job.quality.clone(),
            artifact_stem,
            output_dir: self.inner.download_dir.clone(),
        };
        let inner = self.inner.clone();
        let job_id = job.job_id.clone();
        tokio::spawn(async move {
            run_job(&inner, &job_id, request, token).await;
            inner.in_flight.lock().remove(&job_id);
        });
    }

    /// Asks a job to stop. Succeeds only while the job is queued, starting or
    /// downloading; the extractor notices the signal at its next checkpoint.
    pub fn cancel(&self, job_id: &str) -> Result<Job, CancelError> {
        let mut verdict = Ok(());
        let outcome = self
            .inner
            .store
            .update(job_id, &mut |job: &mut Job| verdict = job.cancel())
            .map_err(|_| CancelError::NotFound)?;
        let job = match outcome {
            UpdateOutcome::Ignored(job) => return Err(CancelError::Rejected(job.state)),
            UpdateOutcome::Applied(job) => job,
        };
        verdict.map_err(|rejected| CancelError::Rejected(rejected.0))?;

        if let Some(in_flight) = self.inner.in_flight.lock().get(job_id) {
            in_flight.token.cancel();
        }
        info!(job_id, "download cancelled");
        Ok(job)
    }

    /// Stops admitting jobs and signals every in-flight one.
    pub fn shutdown(&self) {
        self.inner.slots.close();
        self.inner.shutdown.cancel();
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Evicts old terminal jobs and deletes unclaimed artifacts.
    pub async fn sweep(&self, job_ttl: Duration, artifact_ttl: Duration) -> SweepReport {
        let evicted_jobs = chrono::Duration::from_std(job_ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
            .map(|cutoff| self.inner.store.evict_finished_before(cutoff))
            .unwrap_or_default();

        // Running jobs and completed jobs still on record own their files no
        // matter how old the files look.
        let mut keep: HashSet<String> = self
            .inner
            .in_flight
            .lock()
            .values()
            .map(|in_flight| in_flight.artifact_stem.clone())
            .collect();
        keep.extend(
            self.inner
                .store
                .retained_artifacts()
                .iter()
                .map(|name| artifact_stem_of(name).to_string()),
        );
        let dir = self.inner.download_dir.clone();
        let purged_artifacts = tokio::task::spawn_blocking(move || {
            purge_stale_artifacts(&dir, artifact_ttl, &keep)
        })
        .await
        .unwrap_or_else(|err| {
            error!("artifact purge task failed: {err}");
            0
        });

        let report = SweepReport {
            evicted_jobs,
            purged_artifacts,
        };
        if report != SweepReport::default() {
            info!(
                evicted_jobs = report.evicted_jobs,
                purged_artifacts = report.purged_artifacts,
                "swept download state"
            );
        }
        report
    }

    /// Periodically runs [`JobRunner::sweep`] until [`JobRunner::shutdown`].
    pub fn spawn_sweeper(
        &self,
        interval: Duration,
        job_ttl: Duration,
        artifact_ttl: Duration,
    ) -> JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = runner.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        runner.sweep(job_ttl, artifact_ttl).await;
                    }
                }
            }
        })
    }
}

fn artifact_stem_of(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

async fn run_job(inner: &RunnerInner, job_id: &str, request: FetchRequest, token: CancellationToken) {
    let permit = tokio::select! {
        permit = inner.slots.clone().acquire_owned() => permit,
        _ = token.cancelled() => {
            abandon(inner, job_id, &request).await;
            return;
        }
    };
    let Ok(_permit) = permit else {
        abandon(inner, job_id, &request).await;
        return;
    };

    match inner.store.update(job_id, &mut Job::mark_starting) {
        Ok(UpdateOutcome::Applied(_)) => {}
        Ok(UpdateOutcome::Ignored(job)) => {
            debug!(job_id, state = %job.state, "job finished before admission");
            return;
        }
        Err(err) => {
            warn!(job_id, "job vanished before admission: {err}");
            return;
        }
    }
    info!(
        job_id,
        target_id = %request.target_id,
        kind = request.kind.as_str(),
        quality = %request.quality,
        "download started"
    );

    let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressEvent>(PROGRESS_BUFFER);
    let extractor = inner.extractor.clone();
    let worker_request = request.clone();
    let worker_token = token.clone();
    let worker = tokio::task::spawn_blocking(move || {
        let outcome = extractor.fetch(&worker_request, &progress_tx, &worker_token)?;
        drop(progress_tx);
        let artifact = find_artifact(&worker_request.output_dir, &outcome.artifact_stem)?;
        Ok::<(FetchOutcome, Option<String>), ExtractionError>((outcome, artifact))
    });

    while let Some(event) = progress_rx.recv().await {
        apply(inner, job_id, &mut |job: &mut Job| job.apply_progress(&event));
    }

    match worker.await {
        Ok(Ok((outcome, Some(artifact_name)))) => {
            let title = outcome.title;
            let applied = apply(inner, job_id, &mut |job: &mut Job| {
                job.complete(artifact_name.clone(), title.clone())
            });
            if applied {
                info!(job_id, artifact = %artifact_name, "download completed");
            } else {
                info!(job_id, "discarding artifact of a job that no longer wants it");
                discard_files(inner, &request).await;
            }
        }
        Ok(Ok((_, None))) => {
            error!(job_id, stem = %request.artifact_stem, "extractor finished without an artifact");
            apply(inner, job_id, &mut |job: &mut Job| job.fail(FILE_NOT_FOUND_MESSAGE));
            discard_files(inner, &request).await;
        }
        Ok(Err(ExtractionError::Cancelled)) => {
            debug!(job_id, "extractor stopped after cancellation");
            apply(inner, job_id, &mut |job: &mut Job| {
                if job.cancel().is_err() {
                    job.fail(SHUTDOWN_MESSAGE);
                }
            });
            discard_files(inner, &request).await;
        }
        Ok(Err(err)) => {
            error!(job_id, "download failed: {err}");
            let message = err.to_string();
            apply(inner, job_id, &mut |job: &mut Job| job.fail(message.clone()));
            discard_files(inner, &request).await;
        }
        Err(join_err) => {
            error!(job_id, "download worker crashed: {join_err}");
            apply(inner, job_id, &mut |job: &mut Job| {
                job.fail("Download failed: internal error")
            });
            discard_files(inner, &request).await;
        }
    }
}

/// The job never got a slot: it was cancelled while queued or the pool shut
/// down underneath it.
async fn abandon(inner: &RunnerInner, job_id: &str, request: &FetchRequest) {
    apply(inner, job_id, &mut |job: &mut Job| {
        if job.cancel().is_err() {
            job.fail(SHUTDOWN_MESSAGE);
        }
    });
    discard_files(inner, request).await;
}

/// Applies a mutation, returning whether the job accepted it. Writes aimed at
/// terminal or evicted jobs are dropped.
fn apply(inner: &RunnerInner, job_id: &str, mutator: &mut dyn FnMut(&mut Job)) -> bool {
    match inner.store.update(job_id, mutator) {
        Ok(outcome) => outcome.was_applied(),
        Err(JobStoreError::NotFound(_)) => {
            debug!(job_id, "dropping update for evicted job");
            false
        }
        Err(err) => {
            warn!(job_id, "failed to update job: {err}");
            false
        }
    }
}

async fn discard_files(inner: &RunnerInner, request: &FetchRequest) {
    let dir = inner.download_dir.clone();
    let stem = request.artifact_stem.clone();
    match tokio::task::spawn_blocking(move || remove_stem_files(&dir, &stem)).await {
        Ok(0) => {}
        Ok(removed) => debug!(stem = %request.artifact_stem, removed, "removed leftover files"),
        Err(err) => warn!("cleanup task failed: {err}"),
    }
}
