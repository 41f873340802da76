//! Segment planning: split the incomplete parts of a download into
//! byte-range segments for parallel fetching.
//!
//! The planner only runs in segmented mode (server supports ranges and the
//! total size is known). No-range and unknown-size downloads bypass it and
//! run as a single streaming fetch.

use crate::ranges::{ByteRange, RangeSet};

/// A single planned segment: byte range `[start, end)` (half-open).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Start offset (inclusive).
    pub start: u64,
    /// End offset (exclusive).
    pub end: u64,
}

impl Segment {
    /// Length of this segment in bytes.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// True if the segment covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// HTTP Range header value (inclusive end): `start-(end-1)`.
    pub fn range_value(&self) -> String {
        if self.is_empty() {
            "0-0".to_string()
        } else {
            format!("{}-{}", self.start, self.end - 1)
        }
    }
}

impl From<ByteRange> for Segment {
    fn from(r: ByteRange) -> Self {
        Segment {
            start: r.start,
            end: r.end,
        }
    }
}

/// Picks a segment count for a file of `total_size` bytes, capped at
/// `max_segments`. Small files get fewer segments so we don't pay connection
/// setup for tiny ranges.
pub fn choose_segment_count(total_size: u64, max_segments: usize) -> usize {
    const MIB: u64 = 1024 * 1024;
    let suggested = if total_size < 10 * MIB {
        2
    } else if total_size < 50 * MIB {
        4
    } else {
        8
    };
    suggested.min(max_segments).max(1)
}

/// Builds a segment plan covering exactly the bytes of `[0, total_size)` that
/// `resume` does not already record as complete.
///
/// Each gap is split into roughly equal pieces, with at most `max_segments`
/// pieces across the whole plan and no piece smaller than `min_segment_bytes`
/// (unless the gap itself is smaller). Returns an empty plan when the resume
/// record already covers the file.
pub fn plan(
    total_size: u64,
    resume: &RangeSet,
    max_segments: usize,
    min_segment_bytes: u64,
) -> Vec<Segment> {
    let gaps = resume.gaps(total_size);
    if gaps.is_empty() {
        return Vec::new();
    }

    let remaining: u64 = gaps.iter().map(ByteRange::len).sum();
    let max_segments = choose_segment_count(remaining, max_segments.max(1));
    let min_segment_bytes = min_segment_bytes.max(1);

    // How many pieces the remaining bytes justify, respecting the minimum
    // segment size, then bounded by the configured cap.
    let by_size = (remaining / min_segment_bytes).max(1);
    let budget = (max_segments as u64).min(by_size) as usize;

    let mut out = Vec::with_capacity(budget);
    let mut left = budget;
    for (i, gap) in gaps.iter().enumerate() {
        // Give each gap a share of the budget proportional to its size, but
        // at least one segment; the last gap takes whatever is left.
        let gaps_after = gaps.len() - i - 1;
        let share = if gaps_after == 0 {
            left
        } else {
            let proportional =
                ((gap.len() as u128 * budget as u128) / remaining.max(1) as u128) as usize;
            proportional.max(1).min(left.saturating_sub(gaps_after))
        };
        let share = share.max(1);
        out.extend(split_range(*gap, share));
        left = left.saturating_sub(share);
    }
    out
}

/// Splits one range into `pieces` near-equal segments (earlier pieces take the
/// remainder, matching how byte budgets divide).
fn split_range(range: ByteRange, pieces: usize) -> Vec<Segment> {
    let len = range.len();
    if len == 0 || pieces == 0 {
        return Vec::new();
    }
    let pieces = (pieces as u64).min(len);
    let base = len / pieces;
    let remainder = len % pieces;

    let mut out = Vec::with_capacity(pieces as usize);
    let mut offset = range.start;
    for i in 0..pieces {
        let piece_len = base + u64::from(i < remainder);
        let end = (offset + piece_len).min(range.end);
        out.push(Segment { start: offset, end });
        offset = end;
    }
    out
}
