//! Segment workers: ranged and streaming HTTP GET writing into a `PartFile`.
//!
//! Each worker drives one curl Easy handle on a blocking thread. Received
//! bytes are written at their final offset as they arrive; a shared atomic
//! counter is bumped per write so the analytics sampler can read progress
//! without touching the data path. The job's `StopToken` is checked in the
//! write callback, between writes, never mid-syscall.
//!
//! Because curl delivers a response body in order, the per-attempt byte count
//! is always a contiguous prefix of the segment. That is the amount the job
//! runner credits to the resume store when an attempt ends early.

use crate::control::{StopReason, StopToken};
use crate::planner::Segment;
use crate::storage::PartFile;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Error from a single fetch attempt, kept structured so the retry policy can
/// classify it before it is flattened into anyhow at the job boundary.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Curl reported an error (timeout, connection reset, DNS, ...).
    #[error(transparent)]
    Curl(#[from] curl::Error),
    /// Non-success HTTP status.
    #[error("HTTP {0}")]
    Http(u32),
    /// Ranged request answered with 200 instead of 206; the plan assumed
    /// range support the server does not actually honor.
    #[error("server ignored byte-range request")]
    RangeNotHonored,
    /// Transfer ended with fewer bytes than the segment length (server closed
    /// early). Retryable; only the received prefix is credited.
    #[error("partial transfer: expected {expected} bytes, got {received}")]
    PartialTransfer { expected: u64, received: u64 },
    /// Disk write failed (disk full, permission denied). Never retried.
    #[error("storage: {0}")]
    Storage(#[source] std::io::Error),
    /// The job's stop token was set; not a failure.
    #[error("stopped: {0}")]
    Stopped(StopReason),
}

/// Network timeouts for one fetch attempt.
#[derive(Debug, Clone, Copy)]
pub struct FetchTimeouts {
    /// TCP/TLS connect timeout.
    pub connect: Duration,
    /// Abort when throughput stays below 1 KiB/s for this long (stall
    /// detection, kinder to slow links than a hard wall clock).
    pub stall: Duration,
}

impl Default for FetchTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            stall: Duration::from_secs(60),
        }
    }
}

/// Hard ceiling so a wedged transfer eventually dies even if curl keeps the
/// connection nominally alive.
const HARD_TIMEOUT: Duration = Duration::from_secs(3600);

/// Fetch one byte-range segment and write it at its offset in `part`.
///
/// `attempt_bytes` is reset by the caller per attempt and counts the
/// contiguous prefix written so far; `session_bytes` is the job-wide
/// monotonic counter the analytics sampler reads.
pub fn fetch_segment(
    url: &str,
    segment: &Segment,
    part: &PartFile,
    attempt_bytes: &Arc<AtomicU64>,
    session_bytes: &Arc<AtomicU64>,
    stop: &StopToken,
    timeouts: &FetchTimeouts,
) -> Result<(), FetchError> {
    let mut easy = configure(url, timeouts)?;
    easy.range(&segment.range_value()).map_err(FetchError::Curl)?;

    let storage_error: Arc<Mutex<Option<std::io::Error>>> = Arc::new(Mutex::new(None));
    let seen_code: Arc<AtomicU64> = Arc::new(AtomicU64::new(0));

    {
        let part = part.clone();
        let attempt_bytes = Arc::clone(attempt_bytes);
        let session_bytes = Arc::clone(session_bytes);
        let stop_cb = stop.clone();
        let storage_error_cb = Arc::clone(&storage_error);
        let segment_start = segment.start;

        let mut transfer = easy.transfer();

        // Capture the status line so a 200 answer to the ranged request is
        // caught before its body (the whole file) is written at the segment
        // offset.
        let seen_code_cb = Arc::clone(&seen_code);
        transfer
            .header_function(move |line| {
                if let Ok(s) = std::str::from_utf8(line) {
                    if let Some(code) = parse_status_line(s) {
                        seen_code_cb.store(u64::from(code), Ordering::Relaxed);
                    }
                }
                true
            })
            .map_err(FetchError::Curl)?;

        let seen_code_wr = Arc::clone(&seen_code);
        transfer
            .write_function(move |data| {
                if stop_cb.stop_requested().is_some() {
                    return Ok(0);
                }
                if seen_code_wr.load(Ordering::Relaxed) == 200 {
                    return Ok(0);
                }
                let off = attempt_bytes.load(Ordering::Relaxed);
                match part.write_at(segment_start + off, data) {
                    Ok(()) => {
                        attempt_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                        session_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                        Ok(data.len())
                    }
                    Err(e) => {
                        let _ = storage_error_cb.lock().unwrap_or_else(|p| p.into_inner()).replace(e);
                        Ok(0)
                    }
                }
            })
            .map_err(FetchError::Curl)?;

        if let Err(e) = transfer.perform() {
            if e.is_write_error()
                && stop.stop_requested().is_none()
                && seen_code.load(Ordering::Relaxed) == 200
            {
                return Err(FetchError::RangeNotHonored);
            }
            return Err(interpret_abort(e, stop, &storage_error));
        }
    }

    let code = easy.response_code().map_err(FetchError::Curl)? as u32;
    if code == 200 {
        return Err(FetchError::RangeNotHonored);
    }
    if !(200..300).contains(&code) {
        return Err(FetchError::Http(code));
    }

    let received = attempt_bytes.load(Ordering::Relaxed);
    let expected = segment.len();
    if received != expected {
        return Err(FetchError::PartialTransfer { expected, received });
    }
    Ok(())
}

/// Fetch a whole file as one stream, writing from offset 0. Used when the
/// server does not honor ranges or the total size is unknown; there is no
/// resume finer than the whole file in this mode.
pub fn fetch_stream(
    url: &str,
    part: &PartFile,
    attempt_bytes: &Arc<AtomicU64>,
    session_bytes: &Arc<AtomicU64>,
    stop: &StopToken,
    timeouts: &FetchTimeouts,
) -> Result<u64, FetchError> {
    let mut easy = configure(url, timeouts)?;

    let storage_error: Arc<Mutex<Option<std::io::Error>>> = Arc::new(Mutex::new(None));

    {
        let part = part.clone();
        let attempt_bytes = Arc::clone(attempt_bytes);
        let session_bytes = Arc::clone(session_bytes);
        let stop_cb = stop.clone();
        let storage_error_cb = Arc::clone(&storage_error);

        let mut transfer = easy.transfer();
        transfer
            .write_function(move |data| {
                if stop_cb.stop_requested().is_some() {
                    return Ok(0);
                }
                let off = attempt_bytes.load(Ordering::Relaxed);
                match part.write_at(off, data) {
                    Ok(()) => {
                        attempt_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                        session_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                        Ok(data.len())
                    }
                    Err(e) => {
                        let _ = storage_error_cb.lock().unwrap_or_else(|p| p.into_inner()).replace(e);
                        Ok(0)
                    }
                }
            })
            .map_err(FetchError::Curl)?;

        if let Err(e) = transfer.perform() {
            return Err(interpret_abort(e, stop, &storage_error));
        }
    }

    let code = easy.response_code().map_err(FetchError::Curl)? as u32;
    if !(200..300).contains(&code) {
        return Err(FetchError::Http(code));
    }
    Ok(attempt_bytes.load(Ordering::Relaxed))
}

fn configure(url: &str, timeouts: &FetchTimeouts) -> Result<curl::easy::Easy, FetchError> {
    let mut easy = curl::easy::Easy::new();
    easy.url(url).map_err(FetchError::Curl)?;
    easy.follow_location(true).map_err(FetchError::Curl)?;
    easy.connect_timeout(timeouts.connect)
        .map_err(FetchError::Curl)?;
    easy.low_speed_limit(1024).map_err(FetchError::Curl)?;
    easy.low_speed_time(timeouts.stall).map_err(FetchError::Curl)?;
    easy.timeout(HARD_TIMEOUT).map_err(FetchError::Curl)?;
    Ok(easy)
}

/// Decide what a curl "write error" abort actually was: a stop request, a
/// storage failure captured in the callback, or a genuine curl error.
fn interpret_abort(
    e: curl::Error,
    stop: &StopToken,
    storage_error: &Mutex<Option<std::io::Error>>,
) -> FetchError {
    if e.is_write_error() {
        if let Some(reason) = stop.stop_requested() {
            return FetchError::Stopped(reason);
        }
        if let Some(io_err) = storage_error.lock().unwrap_or_else(|p| p.into_inner()).take() {
            return FetchError::Storage(io_err);
        }
    }
    FetchError::Curl(e)
}

/// Extracts the status code from an `HTTP/x.y NNN ...` status line.
fn parse_status_line(line: &str) -> Option<u32> {
    let line = line.trim();
    if !line.starts_with("HTTP/") {
        return None;
    }
    line.split_whitespace().nth(1)?.parse().ok()
}
