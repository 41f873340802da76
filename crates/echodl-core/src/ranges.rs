//! Coalesced byte-range set for resume tracking.
//!
//! A `RangeSet` records which `[start, end)` ranges of a download are already
//! complete. It is always sorted, non-overlapping, and minimal; inserting
//! adjacent or overlapping ranges merges them. Serializes to JSON for the
//! resume store column.

use serde::{Deserialize, Serialize};

/// A half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    /// Start offset (inclusive).
    pub start: u64,
    /// End offset (exclusive).
    pub end: u64,
}

impl ByteRange {
    /// New range; empty ranges (`start >= end`) are allowed but ignored on insert.
    pub fn new(start: u64, end: u64) -> Self {
        ByteRange { start, end }
    }

    /// Length in bytes.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// True if the range covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Sorted, coalesced set of completed byte ranges.
///
/// Insertion is commutative over disjoint ranges, so concurrent workers can
/// report completions in any order and the merged result is identical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl RangeSet {
    /// New empty set.
    pub fn new() -> Self {
        RangeSet::default()
    }

    /// The ranges in ascending order.
    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    /// True if no bytes are recorded as complete.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of completed bytes.
    pub fn bytes_done(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    /// Insert a completed range, merging with any adjacent or overlapping
    /// entries so the set stays minimal. Empty ranges are ignored.
    pub fn insert(&mut self, range: ByteRange) {
        if range.is_empty() {
            return;
        }

        // Find the first existing range that could touch the new one.
        let mut merged = range;
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;
        for &r in &self.ranges {
            if r.end < merged.start || (placed && r.start > merged.end) {
                out.push(r);
            } else if r.start > merged.end {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push(r);
            } else {
                // Touching or overlapping: absorb into the merged range.
                merged.start = merged.start.min(r.start);
                merged.end = merged.end.max(r.end);
            }
        }
        if !placed {
            out.push(merged);
        }
        out.sort_by_key(|r| r.start);
        self.ranges = out;
    }

    /// True if the set covers `[0, total)` exactly.
    pub fn is_complete(&self, total: u64) -> bool {
        if total == 0 {
            return true;
        }
        matches!(self.ranges.as_slice(), [r] if r.start == 0 && r.end >= total)
    }

    /// Ordered list of incomplete ranges within `[0, total)`.
    pub fn gaps(&self, total: u64) -> Vec<ByteRange> {
        let mut out = Vec::new();
        let mut cursor = 0u64;
        for r in &self.ranges {
            if r.start >= total {
                break;
            }
            if r.start > cursor {
                out.push(ByteRange::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
        }
        if cursor < total {
            out.push(ByteRange::new(cursor, total));
        }
        out
    }

    /// Serialize for the resume store column.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserialize from the resume store column. Ranges are re-inserted one by
    /// one so a record written by an older (or foreign) writer still ends up
    /// sorted and coalesced.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let raw: Vec<ByteRange> = serde_json::from_str(json)?;
        let mut set = RangeSet::new();
        for r in raw {
            set.insert(r);
        }
        Ok(set)
    }
}
