//! Progress tracking for translation runs, keyed by a generated progress id.
//! Clients poll with the index of the last event they saw. Records live in
//! memory only and are swept a while after the run finishes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::content::PostId;
use crate::engine::RunState;
use crate::storage::now_unix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Every unit of every language translated.
    Completed,
    /// Finished, but some units fell back to source text.
    Partial,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_finished(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEvent {
    pub seq: usize,
    pub step: String,
    pub status: StepStatus,
    pub message: String,
    pub at: i64,
}

/// What a poll returns.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub progress_id: String,
    pub post_id: PostId,
    pub status: RunStatus,
    pub events: Vec<StepEvent>,
    /// Pass this as `since` on the next poll.
    pub next: usize,
    pub finished: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeRunError {
    Unknown,
    /// The record exists but its run is still going (or being resumed).
    InFlight,
}

struct ProgressRecord {
    post_id: PostId,
    status: RunStatus,
    events: Vec<StepEvent>,
    finished_at: Option<Instant>,
    cancel: CancellationToken,
    /// Unit outcomes kept for resume; absent while a run is in flight.
    run: Option<RunState>,
}

pub struct ProgressTracker {
    records: Mutex<HashMap<String, ProgressRecord>>,
    ttl: Duration,
}

impl ProgressTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Open a record for a new run. Returns the progress id and the run's cancel token.
    pub fn start(&self, post_id: PostId) -> (String, CancellationToken) {
        let progress_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        self.records.lock().insert(
            progress_id.clone(),
            ProgressRecord {
                post_id,
                status: RunStatus::Running,
                events: Vec::new(),
                finished_at: None,
                cancel: cancel.clone(),
                run: None,
            },
        );
        debug!(progress_id = %progress_id, post_id, "progress started");
        (progress_id, cancel)
    }

    /// Put a finished record back into the running state under the same id.
    /// Returns a fresh cancel token, or None for unknown or running records.
    pub fn reopen(&self, progress_id: &str) -> Option<CancellationToken> {
        let mut records = self.records.lock();
        let record = records.get_mut(progress_id)?;
        if !record.status.is_finished() {
            return None;
        }
        record.status = RunStatus::Running;
        record.finished_at = None;
        record.cancel = CancellationToken::new();
        Some(record.cancel.clone())
    }

    pub fn emit(
        &self,
        progress_id: &str,
        step: impl Into<String>,
        status: StepStatus,
        message: impl Into<String>,
    ) {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(progress_id) {
            let event = StepEvent {
                seq: record.events.len(),
                step: step.into(),
                status,
                message: message.into(),
                at: now_unix(),
            };
            debug!(progress_id, step = %event.step, status = ?status, "progress_event");
            record.events.push(event);
        }
    }

    pub fn finish(&self, progress_id: &str, status: RunStatus) {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(progress_id) {
            record.status = status;
            record.finished_at = Some(Instant::now());
            info!(progress_id, status = ?status, events = record.events.len(), "progress finished");
        }
    }

    /// Events with `seq >= since`, plus the current status.
    pub fn poll(&self, progress_id: &str, since: usize) -> Option<ProgressSnapshot> {
        let records = self.records.lock();
        let record = records.get(progress_id)?;
        let events: Vec<StepEvent> = record.events.iter().skip(since).cloned().collect();
        Some(ProgressSnapshot {
            progress_id: progress_id.to_string(),
            post_id: record.post_id,
            status: record.status,
            next: record.events.len(),
            finished: record.status.is_finished(),
            events,
        })
    }

    pub fn status(&self, progress_id: &str) -> Option<RunStatus> {
        self.records.lock().get(progress_id).map(|r| r.status)
    }

    /// Cancel a running record. Returns false if unknown or already finished.
    pub fn cancel(&self, progress_id: &str) -> bool {
        let records = self.records.lock();
        match records.get(progress_id) {
            Some(record) if !record.status.is_finished() => {
                record.cancel.cancel();
                info!(progress_id, "run cancellation requested");
                true
            }
            _ => false,
        }
    }

    pub fn store_run(&self, progress_id: &str, run: RunState) {
        if let Some(record) = self.records.lock().get_mut(progress_id) {
            record.run = Some(run);
        }
    }

    /// Remove the run state for resuming.
    pub fn take_run(&self, progress_id: &str) -> Result<RunState, TakeRunError> {
        let mut records = self.records.lock();
        match records.get_mut(progress_id) {
            Some(record) => record.run.take().ok_or(TakeRunError::InFlight),
            None => Err(TakeRunError::Unknown),
        }
    }

    /// Drop finished records older than the TTL. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut records = self.records.lock();
        let before = records.len();
        let ttl = self.ttl;
        records.retain(|_, r| r.finished_at.map_or(true, |t| t.elapsed() < ttl));
        let removed = before - records.len();
        if removed > 0 {
            debug!(removed, "progress records swept");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub fn start_sweep_loop(tracker: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        tracker.sweep();
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }
}
