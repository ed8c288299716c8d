//! Batch job queue for remote media enhancement
//!
//! Files discovered in the input folder wait as pending until the scheduler
//! admits them. Each admitted job runs on its own task, takes a credential
//! from the pool per attempt and walks its phase ladder until it completes,
//! fails, or is stopped by the operator.
//!
//! Job lifecycle:
//! 1. Scan → file pending
//! 2. Admission under the concurrency cap → job queued, then processing
//! 3. Worker drives the ladder, parking at checkpoints while paused
//! 4. Completed / error entries stay visible until dismissed
//! 5. An error entry can be reset, making its file pending again

pub mod error;
pub mod events;
mod gate;
pub mod job;
mod runner;
pub mod scheduler;
#[cfg(test)]
mod testing;

pub use error::{Error, FailureClass, Result};
pub use events::JobEvent;
pub use job::{
    FileStatus, Job, JobId, JobStatus, MediaFile, ProcessingState, image_output_path, scan_dir,
    video_output_path,
};
pub use runner::{CREDIT_RETRY_DELAY, RETRY_DELAY};
pub use scheduler::{
    DEFAULT_MAX_STATUS_CHECKS, DEFAULT_POLL_INTERVAL, DEFAULT_WORKERS, MAX_WORKERS, MIN_WORKERS,
    QueueSnapshot, Scheduler, SchedulerConfig,
};
