//! Segment planning: initial partition and resume replanning.

use serde::{Deserialize, Serialize};

/// A contiguous byte range of the resource assigned to one worker.
///
/// `written` counts bytes already on disk at `offset`; it never decreases
/// and never exceeds `length`. `length == 0` means the size is unknown and
/// the segment runs to end-of-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub offset: u64,
    pub length: u64,
    pub written: u64,
}

impl Segment {
    pub fn new(offset: u64, length: u64) -> Self {
        Self {
            offset,
            length,
            written: 0,
        }
    }

    /// Bytes still to transfer. Zero-length (unknown size) segments always
    /// report 0; their workers run to end-of-stream instead.
    pub fn remaining(&self) -> u64 {
        self.length.saturating_sub(self.written)
    }

    pub fn is_done(&self) -> bool {
        self.length > 0 && self.written >= self.length
    }

    /// `Range` header value for the unwritten tail: resume never re-requests
    /// bytes already on disk.
    pub fn range_header_value(&self) -> String {
        if self.length == 0 {
            format!("bytes={}-", self.offset + self.written)
        } else {
            format!(
                "bytes={}-{}",
                self.offset + self.written,
                self.offset + self.length - 1
            )
        }
    }
}

/// Partition `[0, total)` into `workers` contiguous segments, the last
/// absorbing the remainder. Worker count is clamped so no segment is empty.
pub fn plan_segments(total: u64, workers: usize) -> Vec<Segment> {
    if total == 0 {
        return vec![Segment::new(0, 0)];
    }
    let workers = (workers.max(1) as u64).min(total);
    let base = total / workers;
    let mut out = Vec::with_capacity(workers as usize);
    let mut offset = 0u64;
    for i in 0..workers {
        let length = if i == workers - 1 { total - offset } else { base };
        out.push(Segment::new(offset, length));
        offset += length;
    }
    out
}

/// Plan for a job, honoring server capability and any resume state.
///
/// - No range support or unknown size: one segment, one worker.
/// - A valid sidecar's segments are returned unchanged, even if the current
///   request asks for a different worker count. Re-partitioning across
///   restarts would invalidate the `written` offsets.
pub fn plan(
    total: u64,
    workers: usize,
    accepts_ranges: bool,
    resume: Option<Vec<Segment>>,
) -> Vec<Segment> {
    if !accepts_ranges || total == 0 {
        return vec![Segment::new(0, total)];
    }
    if let Some(segments) = resume {
        if !segments.is_empty() {
            return segments;
        }
    }
    plan_segments(total, workers)
}

/// Sanity check used on sidecar load: segments must be contiguous from 0,
/// non-overlapping, covering `[0, total)`, each with `written <= length`.
pub fn covers_exactly(segments: &[Segment], total: u64) -> bool {
    let mut expected_offset = 0u64;
    for s in segments {
        if s.offset != expected_offset || s.written > s.length {
            return false;
        }
        expected_offset = expected_offset.saturating_add(s.length);
    }
    expected_offset == total
}
