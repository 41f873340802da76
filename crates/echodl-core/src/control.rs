//! Cooperative stop signals for pause/cancel.
//!
//! The scheduler hands every running job a `StopToken`. Workers check it at
//! write-unit granularity (never mid-syscall), so the bytes a worker has
//! reported as written are always consistent with what the resume store
//! believes is durable. Pause and cancel are distinguished so the job runner
//! can report the right outcome: pause keeps the resume record, cancel may
//! clean it up.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const RUN: u8 = 0;
const PAUSE: u8 = 1;
const CANCEL: u8 = 2;

/// Why a job was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// External pause; durable progress is kept.
    Pause,
    /// External cancel; files and resume record may be cleaned up.
    Cancel,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Pause => write!(f, "paused"),
            StopReason::Cancel => write!(f, "cancelled"),
        }
    }
}

/// Shared stop flag for one job. Cheap to clone; all clones observe the same
/// state. Once set, the signal is never downgraded back to running, but a
/// pause can be upgraded to a cancel.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    state: Arc<AtomicU8>,
}

impl StopToken {
    pub fn new() -> Self {
        StopToken::default()
    }

    /// Request a pause. No-op if a cancel was already requested.
    pub fn request_pause(&self) {
        let _ = self
            .state
            .compare_exchange(RUN, PAUSE, Ordering::AcqRel, Ordering::Relaxed);
    }

    /// Request a cancel. Overrides a pending pause.
    pub fn request_cancel(&self) {
        self.state.store(CANCEL, Ordering::Release);
    }

    /// The pending stop request, if any. Workers poll this between writes.
    pub fn stop_requested(&self) -> Option<StopReason> {
        match self.state.load(Ordering::Acquire) {
            PAUSE => Some(StopReason::Pause),
            CANCEL => Some(StopReason::Cancel),
            _ => None,
        }
    }
}
