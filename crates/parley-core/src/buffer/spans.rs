//! Ordered index of response spans.
//!
//! Spans are kept sorted, non-overlapping and non-adjacent: marking a range
//! that touches an existing span merges the two, so every span endpoint is a
//! real change of "is this response text" when walking the document.

use std::ops::Range;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseSpans {
    ranges: Vec<Range<usize>>,
}

impl ResponseSpans {
    pub fn as_slice(&self) -> &[Range<usize>] {
        &self.ranges
    }

    /// Marks `range` as response text, merging with overlapping or adjacent spans.
    pub fn mark(&mut self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        let mut merged = range;
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for span in self.ranges.drain(..) {
            if span.end < merged.start || span.start > merged.end {
                kept.push(span);
            } else {
                merged = merged.start.min(span.start)..merged.end.max(span.end);
            }
        }
        let idx = kept.partition_point(|s| s.start < merged.start);
        kept.insert(idx, merged);
        self.ranges = kept;
    }

    /// Returns true if the character ending at `pos` carries the marker.
    pub fn is_marked_before(&self, pos: usize) -> bool {
        self.ranges.iter().any(|s| s.start < pos && pos <= s.end)
    }

    /// Scans backward from `pos` for the nearest marker change strictly
    /// between `floor` and `pos`. Returns `floor` when there is none.
    pub fn previous_change(&self, pos: usize, floor: usize) -> usize {
        self.ranges
            .iter()
            .flat_map(|s| [s.start, s.end])
            .filter(|&p| p > floor && p < pos)
            .max()
            .unwrap_or(floor)
    }

    /// Scans forward from `pos` for the nearest marker change strictly
    /// between `pos` and `ceiling`. Returns `ceiling` when there is none.
    pub fn next_change(&self, pos: usize, ceiling: usize) -> usize {
        self.ranges
            .iter()
            .flat_map(|s| [s.start, s.end])
            .filter(|&p| p > pos && p < ceiling)
            .min()
            .unwrap_or(ceiling)
    }

    /// Spans intersecting `range`, clipped and made relative to its start.
    pub fn relative_within(&self, range: &Range<usize>) -> Vec<Range<usize>> {
        self.ranges
            .iter()
            .filter(|s| s.start < range.end && s.end > range.start)
            .map(|s| s.start.max(range.start) - range.start..s.end.min(range.end) - range.start)
            .collect()
    }

    /// Shifts spans for `len` bytes inserted at `offset`.
    ///
    /// Text inserted strictly inside a span joins it; text inserted at either
    /// edge stays outside.
    pub fn on_insert(&mut self, offset: usize, len: usize) {
        for span in &mut self.ranges {
            if span.start >= offset {
                span.start += len;
                span.end += len;
            } else if span.end > offset {
                span.end += len;
            }
        }
    }

    /// Shrinks or drops spans for the deleted `range`.
    pub fn on_delete(&mut self, range: &Range<usize>) {
        let removed = range.end - range.start;
        let clamp = |p: usize| {
            if p >= range.end {
                p - removed
            } else if p > range.start {
                range.start
            } else {
                p
            }
        };
        let ranges = std::mem::take(&mut self.ranges);
        for span in ranges {
            let adjusted = clamp(span.start)..clamp(span.end);
            if !adjusted.is_empty() {
                self.mark(adjusted);
            }
        }
    }
}
