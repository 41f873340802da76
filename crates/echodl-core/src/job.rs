//! Job runner: drives one download from probe to finalized file.
//!
//! The runner probes the URL, validates any prior resume record against the
//! server's validators, plans segments over the incomplete ranges, and runs
//! one async worker per allowed connection. Each worker pulls segments from a
//! shared queue and performs the blocking curl transfer via `spawn_blocking`,
//! crediting the contiguous prefix of every attempt to the resume store
//! before deciding on a retry. Failed attempts therefore only ever refetch
//! the tail they actually missed.
//!
//! Servers without range support (or without a known size) take the streaming
//! path instead: one connection, restart from zero on retry, no fine-grained
//! resume.

use crate::analytics::ProgressTracker;
use crate::control::{StopReason, StopToken};
use crate::fetch::{self, FetchError, FetchTimeouts};
use crate::filename::derive_filename;
use crate::planner::{self, Segment};
use crate::probe::{probe, ProbeResult};
use crate::ranges::ByteRange;
use crate::resume::{JobId, JobRecord, ResumeStore};
use crate::retry::{classify, FailureKind, RetryDecision, RetryPolicy};
use crate::storage::{part_path, PartFile};
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Wall-clock ceiling for the initial probe request.
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// How a finished job run ended. The scheduler turns this into state updates
/// and events; the runner only moves bytes.
#[derive(Debug)]
pub enum JobOutcome {
    /// File is fully written, synced, and renamed into place.
    Completed,
    /// Stopped on a pause request; durable progress is kept.
    Paused,
    /// Stopped on a cancel request; cleanup is the caller's call.
    Cancelled,
    /// Gave up (permanent error, storage error, or retry budget exhausted).
    Failed { reason: String },
}

/// Everything a single job run needs from the engine.
pub struct JobContext {
    pub id: JobId,
    pub store: ResumeStore,
    pub tracker: Arc<ProgressTracker>,
    pub stop: StopToken,
    /// Parallel connections this job may use (its share of the global budget).
    pub segments_allowed: usize,
    pub min_segment_bytes: u64,
    pub timeouts: FetchTimeouts,
    pub retry: RetryPolicy,
}

/// Run one job to an outcome. `Err` means the engine itself broke (store or
/// filesystem trouble outside a transfer); the scheduler reports it as a
/// failure too.
pub async fn run_job(ctx: JobContext) -> Result<JobOutcome> {
    let result = run_inner(&ctx).await;
    ctx.tracker.deregister(ctx.id);
    result
}

async fn run_inner(ctx: &JobContext) -> Result<JobOutcome> {
    let mut record = ctx
        .store
        .get_job(ctx.id)
        .await?
        .with_context(|| format!("job {} vanished from the store", ctx.id))?;

    let url = record.url.clone();
    let timeouts = ctx.timeouts;
    let probed = match tokio::task::spawn_blocking(move || {
        probe(&url, timeouts.connect, PROBE_TIMEOUT)
    })
    .await?
    {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(job = ctx.id, error = %e, "probe failed");
            return Ok(JobOutcome::Failed {
                reason: format!("probe failed: {:#}", e),
            });
        }
    };
    tracing::debug!(
        job = ctx.id,
        size = ?probed.total_size,
        ranges = probed.accept_ranges,
        "probe complete"
    );

    if let Some(reason) = ctx.stop.stop_requested() {
        return Ok(stopped_outcome(reason));
    }

    let destination = resolve_destination(ctx, &record, &probed).await?;
    let part = part_path(&destination);

    if !resume_record_valid(&record, &probed) || !stale_part_usable(&record, &part).await {
        if !record.completed.is_empty() {
            tracing::info!(job = ctx.id, "remote changed or part file lost, restarting");
        }
        ctx.store.clear_progress(ctx.id).await?;
        record.completed = Default::default();
    }
    ctx.store
        .set_metadata(
            ctx.id,
            probed.total_size,
            probed.etag.as_deref(),
            probed.last_modified.as_deref(),
        )
        .await?;

    let session = ctx
        .tracker
        .register(ctx.id, probed.total_size, record.completed.bytes_done());

    match (probed.accept_ranges, probed.total_size) {
        (true, Some(total)) => {
            run_segmented(ctx, &record, &destination, &part, total, session).await
        }
        _ => run_streaming(ctx, &record, &destination, &part, probed.total_size, session).await,
    }
}

/// Pick the concrete file path: an existing directory (or a trailing slash)
/// means "save here under a derived name".
async fn resolve_destination(
    ctx: &JobContext,
    record: &JobRecord,
    probed: &ProbeResult,
) -> Result<PathBuf> {
    let dest = &record.destination;
    let is_dir = dest.to_string_lossy().ends_with('/')
        || tokio::fs::metadata(dest).await.map(|m| m.is_dir()).unwrap_or(false);
    let resolved = if is_dir {
        let name = derive_filename(&record.url, probed.content_disposition.as_deref());
        dest.join(name)
    } else {
        dest.clone()
    };
    if let Some(parent) = resolved.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
    }
    if resolved != *dest {
        ctx.store.set_destination(ctx.id, &resolved).await?;
    }
    Ok(resolved)
}

/// A resume record only survives if the server still serves the same entity:
/// matching ETag when both sides have one, else matching Last-Modified, and
/// the size must agree.
fn resume_record_valid(record: &JobRecord, probed: &ProbeResult) -> bool {
    if record.completed.is_empty() {
        return true;
    }
    if let (Some(old), Some(new)) = (&record.etag, &probed.etag) {
        if old != new {
            return false;
        }
    } else if let (Some(old), Some(new)) = (&record.last_modified, &probed.last_modified) {
        if old != new {
            return false;
        }
    }
    match (record.total_size, probed.total_size) {
        (Some(old), Some(new)) => old == new,
        (Some(_), None) => false,
        _ => true,
    }
}

/// Recorded progress is only worth keeping if the part file it points into is
/// still on disk.
async fn stale_part_usable(record: &JobRecord, part: &Path) -> bool {
    record.completed.is_empty() || tokio::fs::try_exists(part).await.unwrap_or(false)
}

async fn run_segmented(
    ctx: &JobContext,
    record: &JobRecord,
    destination: &Path,
    part_path: &Path,
    total: u64,
    session: Arc<AtomicU64>,
) -> Result<JobOutcome> {
    if total == 0 {
        let part = PartFile::create(part_path, Some(0))?;
        part.sync()?;
        part.finalize(destination)?;
        return Ok(JobOutcome::Completed);
    }

    let resuming = !record.completed.is_empty();
    let part = if resuming {
        PartFile::open(part_path)?
    } else {
        PartFile::create(part_path, Some(total))?
    };

    if record.completed.is_complete(total) {
        part.sync()?;
        part.finalize(destination)?;
        return Ok(JobOutcome::Completed);
    }

    let segments = planner::plan(
        total,
        &record.completed,
        ctx.segments_allowed,
        ctx.min_segment_bytes,
    );
    let worker_count = segments.len().min(ctx.segments_allowed.max(1));
    tracing::info!(
        job = ctx.id,
        total,
        resumed_bytes = record.completed.bytes_done(),
        segments = segments.len(),
        workers = worker_count,
        "starting segmented transfer"
    );

    let queue: Arc<Mutex<VecDeque<Segment>>> = Arc::new(Mutex::new(segments.into()));
    let mut handles = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let queue = Arc::clone(&queue);
        let url = record.url.clone();
        let part = part.clone();
        let session = Arc::clone(&session);
        let stop = ctx.stop.clone();
        let store = ctx.store.clone();
        let retry = ctx.retry;
        let timeouts = ctx.timeouts;
        let id = ctx.id;
        handles.push(tokio::spawn(async move {
            segment_worker(id, url, queue, part, session, stop, store, retry, timeouts).await
        }));
    }

    let mut ends = Vec::with_capacity(handles.len());
    let mut retries_total = 0u32;
    for h in handles {
        let end = h.await.context("segment worker panicked")?;
        retries_total += end.retries();
        ends.push(end);
    }
    ctx.store.add_retries(ctx.id, retries_total).await?;

    match aggregate(&ends, &ctx.stop) {
        RunEnd::Done => {
            // Paranoia belongs to the store: only finalize what it recorded.
            let fresh = ctx
                .store
                .get_job(ctx.id)
                .await?
                .with_context(|| format!("job {} vanished from the store", ctx.id))?;
            if !fresh.completed.is_complete(total) {
                return Ok(JobOutcome::Failed {
                    reason: format!(
                        "transfer ended with {} of {} bytes recorded",
                        fresh.completed.bytes_done(),
                        total
                    ),
                });
            }
            part.sync()?;
            part.finalize(destination)?;
            tracing::info!(job = ctx.id, dest = %destination.display(), "download complete");
            Ok(JobOutcome::Completed)
        }
        RunEnd::Stopped(reason) => Ok(stopped_outcome(reason)),
        RunEnd::Failed(reason) => Ok(JobOutcome::Failed { reason }),
    }
}

/// How one worker's run ended.
#[derive(Debug)]
enum WorkerEnd {
    /// Drained the queue (possibly after retries).
    Done { retries: u32 },
    /// Saw a stop request and quit.
    Stopped { reason: StopReason, retries: u32 },
    /// Hit a non-retryable error (or exhausted the budget).
    Failed {
        kind: FailureKind,
        reason: String,
        retries: u32,
    },
}

impl WorkerEnd {
    fn retries(&self) -> u32 {
        match self {
            WorkerEnd::Done { retries }
            | WorkerEnd::Stopped { retries, .. }
            | WorkerEnd::Failed { retries, .. } => *retries,
        }
    }
}

/// One segment worker: pull segments, fetch with retries, credit every
/// contiguous prefix to the resume store before retrying only the tail.
#[allow(clippy::too_many_arguments)]
async fn segment_worker(
    id: JobId,
    url: String,
    queue: Arc<Mutex<VecDeque<Segment>>>,
    part: PartFile,
    session: Arc<AtomicU64>,
    stop: StopToken,
    store: ResumeStore,
    retry: RetryPolicy,
    timeouts: FetchTimeouts,
) -> WorkerEnd {
    let mut retries = 0u32;
    loop {
        if let Some(reason) = stop.stop_requested() {
            return WorkerEnd::Stopped { reason, retries };
        }
        let Some(segment) = pop_segment(&queue) else {
            return WorkerEnd::Done { retries };
        };

        let mut seg = segment;
        let mut attempt = 1u32;
        loop {
            let attempt_bytes = Arc::new(AtomicU64::new(0));
            let result = {
                let url = url.clone();
                let part = part.clone();
                let attempt_bytes = Arc::clone(&attempt_bytes);
                let session = Arc::clone(&session);
                let stop = stop.clone();
                match tokio::task::spawn_blocking(move || {
                    fetch::fetch_segment(
                        &url,
                        &seg,
                        &part,
                        &attempt_bytes,
                        &session,
                        &stop,
                        &timeouts,
                    )
                })
                .await
                {
                    Ok(r) => r,
                    Err(join_err) => {
                        return WorkerEnd::Failed {
                            kind: FailureKind::Permanent,
                            reason: format!("worker task failed: {}", join_err),
                            retries,
                        };
                    }
                }
            };

            // Whatever arrived is a contiguous prefix of the segment; make it
            // durable before deciding anything else.
            let got = attempt_bytes.load(Ordering::Relaxed);
            if got > 0 {
                let done = ByteRange::new(seg.start, (seg.start + got).min(seg.end));
                if let Err(e) = store.record_completed_range(id, done).await {
                    stop.request_pause();
                    return WorkerEnd::Failed {
                        kind: FailureKind::Storage,
                        reason: format!("resume store write failed: {:#}", e),
                        retries,
                    };
                }
            }

            match result {
                Ok(()) => break,
                Err(FetchError::Stopped(reason)) => {
                    return WorkerEnd::Stopped { reason, retries }
                }
                Err(e) => {
                    seg = Segment {
                        start: seg.start + got.min(seg.len()),
                        end: seg.end,
                    };
                    if seg.is_empty() {
                        // The error arrived after the last byte; nothing left.
                        break;
                    }
                    let kind = classify(&e);
                    match retry.decide(attempt, kind) {
                        RetryDecision::RetryAfter(delay) => {
                            tracing::warn!(
                                job = id,
                                segment = %seg.range_value(),
                                attempt,
                                error = %e,
                                delay_ms = delay.as_millis() as u64,
                                "segment attempt failed, retrying"
                            );
                            retries += 1;
                            attempt += 1;
                            tokio::time::sleep(delay).await;
                            if let Some(reason) = stop.stop_requested() {
                                return WorkerEnd::Stopped { reason, retries };
                            }
                        }
                        RetryDecision::NoRetry => {
                            tracing::error!(
                                job = id,
                                segment = %seg.range_value(),
                                attempt,
                                error = %e,
                                "segment failed permanently"
                            );
                            // Wind down the other workers; progress stays.
                            stop.request_pause();
                            return WorkerEnd::Failed {
                                kind,
                                reason: e.to_string(),
                                retries,
                            };
                        }
                    }
                }
            }
        }
    }
}

fn pop_segment(queue: &Mutex<VecDeque<Segment>>) -> Option<Segment> {
    queue.lock().unwrap_or_else(|p| p.into_inner()).pop_front()
}

/// Aggregated end of a segmented run. A failure beats a stop (the stop was
/// self-inflicted to wind down peers), cancel beats pause.
#[derive(Debug, PartialEq, Eq)]
enum RunEnd {
    Done,
    Stopped(StopReason),
    Failed(String),
}

fn aggregate(ends: &[WorkerEnd], stop: &StopToken) -> RunEnd {
    // Storage failures make the best headline when several workers failed.
    let mut failure: Option<(FailureKind, &str)> = None;
    let mut stopped: Option<StopReason> = None;
    for end in ends {
        match end {
            WorkerEnd::Done { .. } => {}
            WorkerEnd::Stopped { reason, .. } => {
                if stopped != Some(StopReason::Cancel) {
                    stopped = Some(*reason);
                }
            }
            WorkerEnd::Failed { kind, reason, .. } => {
                let replace = match failure {
                    None => true,
                    Some((prev, _)) => {
                        prev != FailureKind::Storage && *kind == FailureKind::Storage
                    }
                };
                if replace {
                    failure = Some((*kind, reason));
                }
            }
        }
    }
    if let Some((_, reason)) = failure {
        return RunEnd::Failed(reason.to_string());
    }
    // An external stop can land after the last worker checked the token.
    if let Some(reason) = stop.stop_requested() {
        return RunEnd::Stopped(reason);
    }
    match stopped {
        Some(reason) => RunEnd::Stopped(reason),
        None => RunEnd::Done,
    }
}

fn stopped_outcome(reason: StopReason) -> JobOutcome {
    match reason {
        StopReason::Pause => JobOutcome::Paused,
        StopReason::Cancel => JobOutcome::Cancelled,
    }
}

/// Single-connection streaming transfer for servers without range support or
/// a known size. Restarts from zero on retry; there is no partial resume in
/// this mode.
async fn run_streaming(
    ctx: &JobContext,
    record: &JobRecord,
    destination: &Path,
    part_path: &Path,
    total: Option<u64>,
    _session: Arc<AtomicU64>,
) -> Result<JobOutcome> {
    tracing::info!(job = ctx.id, size = ?total, "starting streaming transfer");
    let mut attempt = 1u32;
    let mut retries = 0u32;
    loop {
        // A fresh part file and a fresh session counter per attempt, so the
        // analytics view never counts restarted bytes twice.
        let part = PartFile::create(part_path, total)?;
        let session = ctx.tracker.register(ctx.id, total, 0);
        let attempt_bytes = Arc::new(AtomicU64::new(0));

        let result = {
            let url = record.url.clone();
            let part = part.clone();
            let attempt_bytes = Arc::clone(&attempt_bytes);
            let stop = ctx.stop.clone();
            let timeouts = ctx.timeouts;
            tokio::task::spawn_blocking(move || {
                fetch::fetch_stream(&url, &part, &attempt_bytes, &session, &stop, &timeouts)
            })
            .await
            .context("stream worker panicked")?
        };

        let end = match result {
            Ok(received) => match total {
                Some(expected) if received != expected => Err(FetchError::PartialTransfer {
                    expected,
                    received,
                }),
                _ => Ok(received),
            },
            Err(e) => Err(e),
        };

        match end {
            Ok(received) => {
                ctx.store.add_retries(ctx.id, retries).await?;
                ctx.store
                    .record_completed_range(ctx.id, ByteRange::new(0, received))
                    .await?;
                part.sync()?;
                part.finalize(destination)?;
                tracing::info!(
                    job = ctx.id,
                    bytes = received,
                    dest = %destination.display(),
                    "download complete"
                );
                return Ok(JobOutcome::Completed);
            }
            Err(FetchError::Stopped(reason)) => {
                ctx.store.add_retries(ctx.id, retries).await?;
                return Ok(stopped_outcome(reason));
            }
            Err(e) => {
                let kind = classify(&e);
                match ctx.retry.decide(attempt, kind) {
                    RetryDecision::RetryAfter(delay) => {
                        tracing::warn!(
                            job = ctx.id,
                            attempt,
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "stream attempt failed, retrying from scratch"
                        );
                        retries += 1;
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                        if let Some(reason) = ctx.stop.stop_requested() {
                            ctx.store.add_retries(ctx.id, retries).await?;
                            return Ok(stopped_outcome(reason));
                        }
                    }
                    RetryDecision::NoRetry => {
                        ctx.store.add_retries(ctx.id, retries).await?;
                        return Ok(JobOutcome::Failed {
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
    }
}
