//! Pause/stop gate shared by the scheduler and its workers
//!
//! Workers park on a watch channel instead of polling a flag: resume wakes
//! every parked worker, stop wakes them with `StoppedByUser`.

use std::collections::HashSet;
use std::sync::Mutex;

use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::job::{JobId, ProcessingState};

pub(crate) struct Gate {
    state: watch::Sender<ProcessingState>,
    /// Jobs relabelled `paused` by the last pause
    paused: Mutex<HashSet<JobId>>,
}

impl Gate {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(ProcessingState::Stopped);
        Self {
            state,
            paused: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn state(&self) -> ProcessingState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ProcessingState> {
        self.state.subscribe()
    }

    pub(crate) fn run(&self) {
        self.state.send_replace(ProcessingState::Running);
    }

    /// Park `ids` and every worker that reaches a checkpoint.
    pub(crate) fn pause(&self, ids: impl IntoIterator<Item = JobId>) {
        self.paused_set().extend(ids);
        self.state.send_replace(ProcessingState::Paused);
    }

    pub(crate) fn resume(&self) {
        self.paused_set().clear();
        self.state.send_replace(ProcessingState::Running);
    }

    pub(crate) fn stop(&self) {
        self.paused_set().clear();
        self.state.send_replace(ProcessingState::Stopped);
    }

    fn paused_set(&self) -> std::sync::MutexGuard<'_, HashSet<JobId>> {
        self.paused.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_parked(&self, id: JobId) -> bool {
        self.paused_set().contains(&id)
    }

    /// Wait until `id` may continue. Returns immediately while running.
    pub(crate) async fn wait_runnable(&self, id: JobId) -> Result<()> {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ProcessingState::Stopped => return Err(Error::StoppedByUser),
                ProcessingState::Running if !self.is_parked(id) => return Ok(()),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::StoppedByUser);
            }
        }
    }

    /// Resolves once processing is stopped.
    pub(crate) async fn stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ProcessingState::Stopped).await;
    }
}
