//! Job event stream

use serde::Serialize;

use crate::job::{Job, JobId, ProcessingState};

/// Events buffered per subscriber before the slowest one starts lagging.
pub const EVENT_CAPACITY: usize = 1024;

/// Broadcast on every job or processing-state change.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// Snapshot of a job after a status, phase or progress change.
    Updated(Job),
    /// Entry dismissed or reset by the operator.
    Removed { id: JobId },
    State { state: ProcessingState },
}
