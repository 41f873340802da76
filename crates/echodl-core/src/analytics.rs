//! Throughput and ETA analytics.
//!
//! Workers bump a per-job atomic byte counter as they write; a sampler task
//! reads those counters on a fixed interval and derives instantaneous speed,
//! an exponential moving average, and an ETA. Sampling only loads atomics, so
//! it never stalls the data path, and workers never wait on the sampler.

use crate::events::{Event, ProgressSnapshot};
use crate::resume::JobId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// EMA smoothing factor per tick.
const EMA_ALPHA: f64 = 0.3;

struct JobCounters {
    /// Total size when known (None while streaming an unknown-size body).
    total: Option<u64>,
    /// Bytes already durable when the session started (from the resume record).
    base: u64,
    /// Bytes written by workers during this session.
    session: Arc<AtomicU64>,
}

/// Registry of per-job byte counters for all active jobs.
#[derive(Default)]
pub struct ProgressTracker {
    jobs: Mutex<HashMap<JobId, JobCounters>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job that is starting to transfer. Returns the session
    /// counter workers bump per write.
    pub fn register(&self, id: JobId, total: Option<u64>, base_bytes: u64) -> Arc<AtomicU64> {
        let session = Arc::new(AtomicU64::new(0));
        self.lock().insert(
            id,
            JobCounters {
                total,
                base: base_bytes,
                session: Arc::clone(&session),
            },
        );
        session
    }

    /// Remove a job that stopped transferring (any outcome).
    pub fn deregister(&self, id: JobId) {
        self.lock().remove(&id);
    }

    /// Snapshot of `(job, total, bytes_done)` for every active job.
    pub fn sample(&self) -> Vec<(JobId, Option<u64>, u64)> {
        self.lock()
            .iter()
            .map(|(id, c)| {
                let done = c.base + c.session.load(Ordering::Relaxed);
                (*id, c.total, done)
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, JobCounters>> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Per-job speed state kept across ticks by the sampler.
#[derive(Debug, Default, Clone)]
pub struct SpeedEstimator {
    last_bytes: Option<u64>,
    ema_bps: f64,
}

impl SpeedEstimator {
    /// Feed one sample; returns (instantaneous bps, smoothed bps).
    pub fn update(&mut self, bytes_done: u64, dt: Duration) -> (f64, f64) {
        let dt = dt.as_secs_f64();
        let inst = match self.last_bytes {
            Some(prev) if dt > 0.0 => bytes_done.saturating_sub(prev) as f64 / dt,
            _ => 0.0,
        };
        if self.last_bytes.is_some() {
            self.ema_bps = EMA_ALPHA * inst + (1.0 - EMA_ALPHA) * self.ema_bps;
        }
        self.last_bytes = Some(bytes_done);
        (inst, self.ema_bps)
    }
}

/// Builds a snapshot for one job from a sample and its speed state.
pub fn snapshot(
    id: JobId,
    total: Option<u64>,
    bytes_done: u64,
    speed_bps: f64,
    avg_speed_bps: f64,
) -> ProgressSnapshot {
    let eta_secs = match total {
        Some(total) if avg_speed_bps > 0.0 => {
            Some(total.saturating_sub(bytes_done) as f64 / avg_speed_bps)
        }
        _ => None,
    };
    ProgressSnapshot {
        job_id: id,
        bytes_done,
        bytes_total: total,
        speed_bps,
        avg_speed_bps,
        eta_secs,
    }
}

/// Sampler loop: one `JobProgress` event per active job per tick. Runs until
/// the task is aborted (the scheduler owns its lifetime). Estimator state for
/// jobs that deregistered is dropped on the next tick.
pub async fn run_sampler(
    tracker: Arc<ProgressTracker>,
    events: tokio::sync::broadcast::Sender<Event>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut estimators: HashMap<JobId, SpeedEstimator> = HashMap::new();
    let mut last_tick = tokio::time::Instant::now();

    loop {
        let now = ticker.tick().await;
        // Skipped ticks stretch the window; rates use real elapsed time.
        let dt = now.duration_since(last_tick);
        last_tick = now;
        let samples = tracker.sample();
        estimators.retain(|id, _| samples.iter().any(|(sid, _, _)| sid == id));
        for (id, total, bytes_done) in samples {
            let est = estimators.entry(id).or_default();
            let (inst, ema) = est.update(bytes_done, dt);
            // Send errors just mean nobody is listening right now.
            let _ = events.send(Event::JobProgress(snapshot(id, total, bytes_done, inst, ema)));
        }
    }
}
