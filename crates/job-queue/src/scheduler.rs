//! Job queue, admission control and operator transitions
//!
//! One `Scheduler` owns the file list, the job queue and the global processing
//! state. Admission (`pump`) runs after every transition and every finished
//! job, launching workers until the concurrency cap is reached. Global state
//! changes go through the gate so parked workers wake up on resume and stop.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use common::MediaKind;
use credential_pool::Pool;
use enhance_client::{ImageOptions, VideoOptions};
use media_tools::MediaTools;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{EVENT_CAPACITY, JobEvent};
use crate::gate::Gate;
use crate::job::{
    FileStatus, Job, JobId, JobStatus, MediaFile, ProcessingState, now_millis, scan_dir,
};
use crate::runner;

pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 50;
pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_STATUS_CHECKS: u32 = 180;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub input_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    /// Concurrency cap, clamped to 1..=50
    pub workers: usize,
    pub poll_interval: Duration,
    pub max_status_checks: u32,
    pub video: VideoOptions,
    pub image: ImageOptions,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            input_dir: None,
            output_dir: None,
            workers: DEFAULT_WORKERS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_status_checks: DEFAULT_MAX_STATUS_CHECKS,
            video: VideoOptions::default(),
            image: ImageOptions::default(),
        }
    }
}

/// Point-in-time view for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub state: ProcessingState,
    pub workers: usize,
    pub active: usize,
    pub jobs: Vec<Job>,
    pub files: Vec<MediaFile>,
}

/// Result of a successful job.
#[derive(Debug, Clone)]
pub(crate) struct Outcome {
    pub output_path: PathBuf,
    pub credits_used: Option<f64>,
}

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    pub files: Vec<MediaFile>,
    pub jobs: Vec<Job>,
}

fn set_file_status(files: &mut [MediaFile], path: &Path, status: FileStatus) {
    if let Some(file) = files.iter_mut().find(|f| f.path == path) {
        file.status = status;
    }
}

impl QueueState {
    fn position(&self, id: JobId) -> Option<usize> {
        self.jobs.iter().position(|j| j.id == id)
    }

    /// Jobs holding a worker slot.
    pub(crate) fn active_count(&self) -> usize {
        self.jobs.iter().filter(|j| j.status.is_active()).count()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.status == FileStatus::Pending)
            .count()
    }

    fn has_waiting_work(&self) -> bool {
        self.pending_count() > 0 || self.jobs.iter().any(|j| j.status == JobStatus::Queued)
    }

    /// Index of the next queued job. When none is waiting, queues the first
    /// pending file that no entry refers to. The flag is true for a new job.
    pub(crate) fn next_queued(&mut self) -> Option<(usize, bool)> {
        if let Some(index) = self.jobs.iter().position(|j| j.status == JobStatus::Queued) {
            return Some((index, false));
        }
        let jobs = &self.jobs;
        let file = self
            .files
            .iter_mut()
            .find(|f| f.status == FileStatus::Pending && !jobs.iter().any(|j| j.file_path == f.path))?;
        file.status = FileStatus::Processing;
        let job = Job::queued(file);
        self.jobs.push(job);
        Some((self.jobs.len() - 1, true))
    }

    /// Queued jobs give their file back; in-flight jobs become error entries.
    /// Returns the changed jobs.
    pub(crate) fn stop_all(&mut self) -> Vec<Job> {
        let QueueState { files, jobs } = self;
        let mut changed = Vec::new();
        for job in jobs.iter_mut() {
            match job.status {
                JobStatus::Queued => {
                    job.status = JobStatus::Stopped;
                    job.phase = "Stopped".into();
                    set_file_status(files, &job.file_path, FileStatus::Pending);
                }
                JobStatus::Processing | JobStatus::Paused => {
                    job.status = JobStatus::Error;
                    job.phase = "Stopped".into();
                    job.error = Some(Error::StoppedByUser.to_string());
                    set_file_status(files, &job.file_path, FileStatus::Error);
                }
                _ => continue,
            }
            changed.push(job.clone());
        }
        changed
    }

    /// Add newly found files and drop pending files that disappeared.
    /// Returns the number added.
    pub(crate) fn merge_scan(&mut self, found: Vec<MediaFile>) -> usize {
        self.files
            .retain(|f| f.status != FileStatus::Pending || found.iter().any(|n| n.path == f.path));
        let mut added = 0;
        for file in found {
            if !self.files.iter().any(|f| f.path == file.path) {
                self.files.push(file);
                added += 1;
            }
        }
        added
    }
}

pub(crate) struct Inner {
    pub(crate) pool: Arc<Pool>,
    pub(crate) media: Arc<dyn MediaTools>,
    pub(crate) config: SchedulerConfig,
    workers: AtomicUsize,
    queue: Mutex<QueueState>,
    pub(crate) gate: Gate,
    events: broadcast::Sender<JobEvent>,
    tasks: Mutex<JoinSet<()>>,
}

impl Inner {
    pub(crate) fn queue(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn refresh_credits_in_background(&self) {
        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move { pool.refresh_all_credits().await });
    }
}

/// Batch scheduler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(pool: Arc<Pool>, media: Arc<dyn MediaTools>, config: SchedulerConfig) -> Self {
        let workers = config.workers.clamp(MIN_WORKERS, MAX_WORKERS);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                pool,
                media,
                config,
                workers: AtomicUsize::new(workers),
                queue: Mutex::new(QueueState::default()),
                gate: Gate::new(),
                events,
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn state(&self) -> ProcessingState {
        self.inner.gate.state()
    }

    pub fn workers(&self) -> usize {
        self.inner.workers.load(Ordering::SeqCst)
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.inner.pool
    }

    pub fn events(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let queue = self.inner.queue();
        QueueSnapshot {
            state: self.state(),
            workers: self.workers(),
            active: queue.active_count(),
            jobs: queue.jobs.clone(),
            files: queue.files.clone(),
        }
    }

    /// Wait until the processing state equals `state`.
    pub async fn wait_until(&self, state: ProcessingState) {
        let mut rx = self.inner.gate.subscribe();
        let _ = rx.wait_for(|s| *s == state).await;
    }

    /// Rescan the input folder. Returns the number of new files.
    pub async fn scan_input(&self) -> Result<usize> {
        let dir = self
            .inner
            .config
            .input_dir
            .clone()
            .ok_or_else(|| Error::Validation("input folder not set".into()))?;
        let found = scan_dir(&dir).await?;
        let total = found.len();
        let added = self.inner.queue().merge_scan(found);
        info!(dir = %dir.display(), total, added, "scanned input folder");
        self.pump();
        Ok(added)
    }

    /// stopped → running.
    pub async fn start(&self) -> Result<()> {
        let state = self.state();
        if state != ProcessingState::Stopped {
            return Err(Error::Validation(format!("cannot start while {state}")));
        }
        if self.inner.pool.is_empty().await {
            return Err(Error::Validation("no API keys configured".into()));
        }
        if self.inner.config.input_dir.is_none() {
            return Err(Error::Validation("input folder not set".into()));
        }
        if self.inner.config.output_dir.is_none() {
            return Err(Error::Validation("output folder not set".into()));
        }
        if self.inner.queue().pending_count() == 0 {
            return Err(Error::Validation("no pending files to process".into()));
        }

        self.inner.pool.refresh_all_credits().await;

        {
            let mut queue = self.inner.queue();
            let state = self.state();
            if state != ProcessingState::Stopped {
                return Err(Error::Validation(format!("cannot start while {state}")));
            }
            let purged: Vec<JobId> = queue
                .jobs
                .iter()
                .filter(|j| j.status == JobStatus::Stopped)
                .map(|j| j.id)
                .collect();
            queue.jobs.retain(|j| j.status != JobStatus::Stopped);
            for id in purged {
                self.inner.emit(JobEvent::Removed { id });
            }
            self.inner.gate.run();
            self.inner.emit(JobEvent::State {
                state: ProcessingState::Running,
            });
        }

        info!(workers = self.workers(), "processing started");
        self.pump();
        Ok(())
    }

    /// running → paused. In-flight jobs park at their next checkpoint.
    pub fn pause(&self) -> Result<()> {
        let mut queue = self.inner.queue();
        let state = self.state();
        if state != ProcessingState::Running {
            return Err(Error::Validation(format!("cannot pause while {state}")));
        }
        let mut parked = Vec::new();
        for job in queue.jobs.iter_mut().filter(|j| j.status == JobStatus::Processing) {
            job.status = JobStatus::Paused;
            job.phase = "Paused".into();
            parked.push(job.id);
            self.inner.emit(JobEvent::Updated(job.clone()));
        }
        let count = parked.len();
        self.inner.gate.pause(parked);
        self.inner.emit(JobEvent::State {
            state: ProcessingState::Paused,
        });
        drop(queue);
        info!(jobs = count, "processing paused");
        Ok(())
    }

    /// paused → running.
    pub fn resume(&self) -> Result<()> {
        {
            let mut queue = self.inner.queue();
            let state = self.state();
            if state != ProcessingState::Paused {
                return Err(Error::Validation(format!("cannot resume while {state}")));
            }
            self.inner.gate.resume();
            for job in queue.jobs.iter_mut().filter(|j| j.status == JobStatus::Paused) {
                job.status = JobStatus::Processing;
                job.phase = "Resuming".into();
                self.inner.emit(JobEvent::Updated(job.clone()));
            }
            self.inner.emit(JobEvent::State {
                state: ProcessingState::Running,
            });
        }
        info!("processing resumed");
        self.pump();
        Ok(())
    }

    /// running/paused → stopped. Remote work already submitted keeps running
    /// on the service; its workers stop at their next checkpoint.
    pub fn stop(&self) {
        let changed = {
            let mut queue = self.inner.queue();
            if self.state() == ProcessingState::Stopped {
                debug!("stop requested while already stopped");
                return;
            }
            self.inner.gate.stop();
            let changed = queue.stop_all();
            for job in &changed {
                if job.status == JobStatus::Error {
                    metrics::counter!("enhance_jobs_finished_total", "outcome" => "stopped")
                        .increment(1);
                }
                self.inner.emit(JobEvent::Updated(job.clone()));
            }
            self.inner.emit(JobEvent::State {
                state: ProcessingState::Stopped,
            });
            changed.len()
        };
        metrics::gauge!("enhance_active_jobs").set(0.0);
        info!(jobs = changed, "processing stopped");
        self.inner.refresh_credits_in_background();
    }

    /// Stop and cancel every worker task. Used at process exit.
    pub async fn shutdown(&self) {
        self.stop();
        let mut tasks = std::mem::take(&mut *self.inner.tasks());
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    /// Change the concurrency cap. Running jobs above a lowered cap finish
    /// normally.
    pub fn set_concurrency(&self, workers: usize) -> Result<()> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&workers) {
            return Err(Error::Validation(format!(
                "workers must be between {MIN_WORKERS} and {MAX_WORKERS}"
            )));
        }
        self.inner.workers.store(workers, Ordering::SeqCst);
        info!(workers, "concurrency updated");
        self.pump();
        Ok(())
    }

    /// Remove a finished entry from the queue.
    pub fn dismiss(&self, id: JobId) -> Result<()> {
        let mut queue = self.inner.queue();
        let index = queue
            .position(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if !queue.jobs[index].status.is_terminal() {
            return Err(Error::Validation("only finished jobs can be dismissed".into()));
        }
        queue.jobs.remove(index);
        self.inner.emit(JobEvent::Removed { id });
        debug!(job_id = %id, "job dismissed");
        Ok(())
    }

    /// Drop a failed entry and make its file admissible again.
    pub fn reset_to_pending(&self, id: JobId) -> Result<()> {
        {
            let mut queue = self.inner.queue();
            let index = queue
                .position(id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            if queue.jobs[index].status != JobStatus::Error {
                return Err(Error::Validation("only failed jobs can be reset".into()));
            }
            let job = queue.jobs.remove(index);
            match queue.files.iter_mut().find(|f| f.path == job.file_path) {
                Some(file) => file.status = FileStatus::Pending,
                None => {
                    if let Some(file) = MediaFile::from_path(&job.file_path, job.size) {
                        queue.files.push(file);
                    }
                }
            }
            self.inner.emit(JobEvent::Removed { id });
            info!(job_id = %id, file = %job.file_name, "job reset to pending");
        }
        self.pump();
        Ok(())
    }

    /// Admit jobs up to the concurrency cap and detect batch completion.
    fn pump(&self) {
        let inner = &self.inner;
        if inner.gate.state() != ProcessingState::Running {
            return;
        }
        let cap = self.workers();

        let mut started = Vec::new();
        {
            let mut queue = inner.queue();
            while queue.active_count() < cap {
                let Some((index, created)) = queue.next_queued() else {
                    break;
                };
                if created {
                    inner.emit(JobEvent::Updated(queue.jobs[index].clone()));
                }
                let QueueState { files, jobs } = &mut *queue;
                let job = &mut jobs[index];
                job.status = JobStatus::Processing;
                job.started_at = Some(now_millis());
                job.phase = "Starting".into();
                set_file_status(files, &job.file_path, FileStatus::Processing);
                inner.emit(JobEvent::Updated(job.clone()));
                debug!(job_id = %job.id, file = %job.file_name, "job admitted");
                started.push(job.id);
            }

            let active = queue.active_count();
            metrics::gauge!("enhance_active_jobs").set(active as f64);

            if started.is_empty() && active == 0 && !queue.has_waiting_work() {
                inner.gate.stop();
                inner.emit(JobEvent::State {
                    state: ProcessingState::Stopped,
                });
                info!("all files processed");
                inner.refresh_credits_in_background();
            }
        }

        let mut tasks = inner.tasks();
        while tasks.try_join_next().is_some() {}
        for id in started {
            let scheduler = self.clone();
            tasks.spawn(
                async move { scheduler.drive(id).await }
                    .instrument(tracing::info_span!("job", job_id = %id)),
            );
        }
    }

    async fn drive(self, id: JobId) {
        let handle = JobHandle {
            inner: Arc::clone(&self.inner),
            id,
        };
        let outcome = runner::run(&handle).await;
        handle.finish(outcome);
        self.pump();
    }
}

/// A worker's view of the job it drives.
///
/// Progress and phase writes only land while the job is `processing`, so
/// pause and stop relabelling is never overwritten. Bookkeeping (credential,
/// request id, retry count) lands on any non-terminal job.
pub(crate) struct JobHandle {
    inner: Arc<Inner>,
    pub(crate) id: JobId,
}

impl JobHandle {
    pub(crate) fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    pub(crate) fn media(&self) -> &dyn MediaTools {
        self.inner.media.as_ref()
    }

    pub(crate) fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub(crate) fn source(&self) -> Option<(PathBuf, MediaKind)> {
        let queue = self.inner.queue();
        let job = queue.jobs.iter().find(|j| j.id == self.id)?;
        Some((job.file_path.clone(), job.kind))
    }

    fn update_where(&self, applies: impl Fn(JobStatus) -> bool, apply: impl FnOnce(&mut Job)) {
        let mut queue = self.inner.queue();
        if let Some(job) = queue
            .jobs
            .iter_mut()
            .find(|j| j.id == self.id && applies(j.status))
        {
            apply(job);
            self.inner.emit(JobEvent::Updated(job.clone()));
        }
    }

    fn update(&self, apply: impl FnOnce(&mut Job)) {
        self.update_where(|status| status == JobStatus::Processing, apply);
    }

    fn record(&self, apply: impl FnOnce(&mut Job)) {
        self.update_where(|status| !status.is_terminal(), apply);
    }

    /// Raise progress to `percent` (never lowers it) and set the phase label.
    pub(crate) fn progress(&self, percent: f64, phase: &str) {
        let percent = percent.clamp(0.0, 100.0);
        self.update(|job| {
            job.progress = job.progress.max(percent);
            job.phase = phase.to_string();
        });
    }

    pub(crate) fn phase(&self, phase: &str) {
        self.update(|job| job.phase = phase.to_string());
    }

    pub(crate) fn set_credential(&self, label: &str) {
        self.record(|job| job.credential = Some(label.to_string()));
    }

    pub(crate) fn set_request_id(&self, request_id: &str) {
        self.record(|job| job.request_id = Some(request_id.to_string()));
    }

    pub(crate) fn record_retry(&self) {
        self.record(|job| job.retry_count += 1);
    }

    fn ensure_live(&self) -> Result<()> {
        let queue = self.inner.queue();
        match queue.jobs.iter().find(|j| j.id == self.id) {
            Some(job) if !job.status.is_terminal() => Ok(()),
            _ => Err(Error::StoppedByUser),
        }
    }

    /// Park while paused; fail with `StoppedByUser` once stopped.
    pub(crate) async fn checkpoint(&self) -> Result<()> {
        self.ensure_live()?;
        self.inner.gate.wait_runnable(self.id).await?;
        self.ensure_live()
    }

    pub(crate) async fn sleep(&self, duration: Duration) -> Result<()> {
        self.sleep_until(Instant::now() + duration).await
    }

    /// Sleep that ends early on stop.
    pub(crate) async fn sleep_until(&self, deadline: Instant) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => Ok(()),
            _ = self.inner.gate.stopped() => Err(Error::StoppedByUser),
        }
    }

    /// Record the terminal status. No-op if stop already finalized the job.
    pub(crate) fn finish(&self, outcome: Result<Outcome>) {
        let mut queue = self.inner.queue();
        let QueueState { files, jobs } = &mut *queue;
        let Some(job) = jobs.iter_mut().find(|j| j.id == self.id) else {
            return;
        };
        if job.status.is_terminal() {
            debug!(job_id = %self.id, status = ?job.status, "job already finalized");
            return;
        }

        let label = match outcome {
            Ok(done) => {
                job.status = JobStatus::Completed;
                job.progress = 100.0;
                job.phase = match done.credits_used {
                    Some(used) => format!("Completed ({used:.2} credits used)"),
                    None => "Completed".to_string(),
                };
                job.credits_used = done.credits_used;
                job.output_path = Some(done.output_path);
                set_file_status(files, &job.file_path, FileStatus::Completed);
                info!(
                    job_id = %job.id,
                    file = %job.file_name,
                    credits_used = ?job.credits_used,
                    retries = job.retry_count,
                    "job completed"
                );
                "completed"
            }
            Err(e) => {
                let stopped = matches!(e, Error::StoppedByUser);
                job.status = JobStatus::Error;
                job.phase = if stopped { "Stopped" } else { "Failed" }.into();
                job.error = Some(e.to_string());
                set_file_status(files, &job.file_path, FileStatus::Error);
                warn!(
                    job_id = %job.id,
                    file = %job.file_name,
                    retries = job.retry_count,
                    error = %e,
                    "job failed"
                );
                if stopped { "stopped" } else { "error" }
            }
        };
        self.inner.emit(JobEvent::Updated(job.clone()));
        metrics::counter!("enhance_jobs_finished_total", "outcome" => label).increment(1);
        if let Some(started_at) = job.started_at {
            let secs = now_millis().saturating_sub(started_at) as f64 / 1000.0;
            metrics::histogram!("enhance_job_duration_seconds", "outcome" => label).record(secs);
        }
    }
}
