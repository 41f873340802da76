//! Typed command and event surface between the engine and its callers.
//!
//! The presentation layer (CLI, a future UI) sends `Command`s over an mpsc
//! channel and consumes `Event`s from a bounded broadcast channel. Broadcast
//! semantics are deliberately drop-oldest: a lagging consumer skips missed
//! events instead of ever blocking the scheduler or the workers.

use crate::resume::{JobId, JobPriority};
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::oneshot;

/// Commands accepted by the scheduler.
#[derive(Debug)]
pub enum Command {
    /// Add a new download. `destination` may be a directory, in which case
    /// the filename is derived from the URL/Content-Disposition.
    Enqueue {
        url: String,
        destination: PathBuf,
        priority: JobPriority,
        /// Receives the new job id once the row is durable.
        reply: oneshot::Sender<anyhow::Result<JobId>>,
    },
    /// Pause a queued or running job; durable progress is kept.
    Pause(JobId),
    /// Re-queue a paused job.
    Resume(JobId),
    /// Cancel a job at any non-terminal state, optionally deleting the
    /// partial file and resume record.
    Cancel { id: JobId, delete_file: bool },
    /// Change a job's priority; takes effect at the next admission pass.
    SetPriority(JobId, JobPriority),
    /// Snapshot of all known jobs.
    ListJobs(oneshot::Sender<Vec<crate::resume::JobSummary>>),
    /// Stop the scheduler loop. Running jobs are paused first so their
    /// progress survives.
    Shutdown,
}

/// Point-in-time progress view for one job. Computed each analytics tick,
/// never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub job_id: JobId,
    pub bytes_done: u64,
    /// Total size, when known.
    pub bytes_total: Option<u64>,
    /// Bytes per second over the last tick.
    pub speed_bps: f64,
    /// Exponentially smoothed bytes per second.
    pub avg_speed_bps: f64,
    /// Estimated seconds remaining; `None` while the smoothed speed is zero
    /// or the total size is unknown.
    pub eta_secs: Option<f64>,
}

/// Lifecycle and progress events emitted to the presentation layer.
#[derive(Debug, Clone)]
pub enum Event {
    JobStarted { id: JobId },
    JobProgress(ProgressSnapshot),
    JobPaused { id: JobId },
    JobCompleted { id: JobId },
    JobFailed { id: JobId, reason: String },
    JobCancelled { id: JobId },
}

impl Event {
    /// Job the event concerns.
    pub fn job_id(&self) -> JobId {
        match self {
            Event::JobStarted { id }
            | Event::JobPaused { id }
            | Event::JobCompleted { id }
            | Event::JobFailed { id, .. }
            | Event::JobCancelled { id } => *id,
            Event::JobProgress(s) => s.job_id,
        }
    }
}
