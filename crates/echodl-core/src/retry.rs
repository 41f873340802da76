//! Failure classification and retry/backoff policy.
//!
//! A fetch attempt ends in a `FetchError`; `classify` maps it onto the
//! engine's taxonomy and `RetryPolicy::decide` turns (attempt, kind) into a
//! retry-after delay or a stop. Retry is a pure decision over observed
//! outcomes; there is no control-flow recovery anywhere in the engine.

use crate::fetch::FetchError;
use std::time::Duration;

/// Classification of a failed fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Timeout, connection reset, DNS hiccup, 408/429/5xx, short body.
    /// Retried with backoff up to the attempt budget.
    Transient,
    /// 4xx, malformed or range-breaking response. The job fails immediately.
    Permanent,
    /// Disk full, permission denied, other local I/O. Fails immediately and
    /// is surfaced distinctly so callers can show an actionable message.
    Storage,
}

/// Classify an HTTP status code.
pub fn classify_http_status(code: u32) -> FailureKind {
    match code {
        408 | 429 => FailureKind::Transient,
        500..=599 => FailureKind::Transient,
        _ => FailureKind::Permanent,
    }
}

/// Classify a curl error.
pub fn classify_curl_error(e: &curl::Error) -> FailureKind {
    if e.is_operation_timedout()
        || e.is_couldnt_connect()
        || e.is_couldnt_resolve_host()
        || e.is_couldnt_resolve_proxy()
        || e.is_read_error()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
        || e.is_partial_file()
    {
        return FailureKind::Transient;
    }
    FailureKind::Permanent
}

/// Classify a fetch error. `Stopped` never reaches this path (the job runner
/// handles stop requests before consulting retry policy); if it does, it is
/// treated as permanent so it is never retried.
pub fn classify(e: &FetchError) -> FailureKind {
    match e {
        FetchError::Curl(ce) => classify_curl_error(ce),
        FetchError::Http(code) => classify_http_status(*code),
        FetchError::PartialTransfer { .. } => FailureKind::Transient,
        FetchError::RangeNotHonored => FailureKind::Permanent,
        FetchError::Storage(_) => FailureKind::Storage,
        FetchError::Stopped(_) => FailureKind::Permanent,
    }
}

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Do not retry this error.
    NoRetry,
    /// Retry after the given delay.
    RetryAfter(Duration),
}

/// Exponential backoff with an attempt budget and a delay cap.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts per segment (including the first).
    pub max_attempts: u32,
    /// Base delay for backoff.
    pub base_delay: Duration,
    /// Upper bound on backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Decide for a 1-based `attempt` that failed with `kind`.
    pub fn decide(&self, attempt: u32, kind: FailureKind) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::NoRetry;
        }
        match kind {
            FailureKind::Permanent | FailureKind::Storage => RetryDecision::NoRetry,
            FailureKind::Transient => {
                // base * 2^(attempt-1), capped.
                let exp = 1u32 << attempt.saturating_sub(1).min(8);
                let raw = self.base_delay.saturating_mul(exp);
                RetryDecision::RetryAfter(raw.min(self.max_delay))
            }
        }
    }
}
