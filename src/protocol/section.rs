//! Byte-range sections
//!
//! A pumping's output is split into contiguous sections, each filled by one
//! concurrent stream and tracked by its own write cursor.

use serde::{Deserialize, Serialize};

/// A contiguous byte range of the output file and its write cursor
///
/// Invariant: `first <= offset <= last + 1`. A section with `last == None`
/// is open-ended and is used when the total length is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    first: u64,
    last: Option<u64>,
    offset: u64,
}

impl Section {
    /// A bounded section covering `first..=last`
    pub fn new(first: u64, last: u64) -> Self {
        debug_assert!(first <= last + 1);
        Self {
            first,
            last: Some(last),
            offset: first,
        }
    }

    /// A section starting at `first` whose end is not known yet
    pub fn open(first: u64) -> Self {
        Self {
            first,
            last: None,
            offset: first,
        }
    }

    /// Restore a section from persisted values, clamping the cursor.
    /// None when the range itself is inverted.
    pub(crate) fn restore(first: u64, last: Option<u64>, offset: u64) -> Option<Self> {
        if let Some(last) = last {
            if first > last.checked_add(1)? {
                return None;
            }
        }
        let mut section = Self {
            first,
            last,
            offset: first,
        };
        section.set_offset(offset);
        Some(section)
    }

    pub fn first(&self) -> u64 {
        self.first
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of bytes in the range, None while open-ended
    pub fn length(&self) -> Option<u64> {
        self.last.map(|last| last + 1 - self.first)
    }

    /// Bytes already written
    pub fn downloaded(&self) -> u64 {
        self.offset - self.first
    }

    /// Bytes still to write, None while open-ended
    pub fn remaining(&self) -> Option<u64> {
        self.last.map(|last| last + 1 - self.offset)
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.last, Some(last) if self.offset == last + 1)
    }

    pub fn is_open(&self) -> bool {
        self.last.is_none()
    }

    /// Advance the cursor by `n` bytes, clamped to the end of the range.
    /// Returns how many bytes were accepted.
    pub fn advance(&mut self, n: u64) -> u64 {
        let accepted = match self.remaining() {
            Some(remaining) => n.min(remaining),
            None => n,
        };
        self.offset += accepted;
        accepted
    }

    /// Move the cursor forward to `offset`; never moves it back
    pub(crate) fn set_offset(&mut self, offset: u64) {
        let upper = self.last.map_or(u64::MAX, |last| last.saturating_add(1));
        self.offset = offset.clamp(self.first, upper).max(self.offset);
    }

    /// Fix the end of an open-ended section at the current cursor.
    /// Returns false when nothing was written, leaving the section open.
    pub fn close(&mut self) -> bool {
        if self.last.is_none() && self.offset > self.first {
            self.last = Some(self.offset - 1);
        }
        self.last.is_some()
    }

    /// Rewind the cursor to the start of the range
    pub fn reset(&mut self) {
        self.offset = self.first;
    }

    /// Split `[0, total)` into `count` contiguous sections, the last one
    /// taking the remainder
    pub fn partition(total: u64, count: usize) -> Vec<Section> {
        if total == 0 {
            return Vec::new();
        }
        let count = (count.max(1) as u64).min(total);
        let size = total / count;

        (0..count)
            .map(|i| {
                let first = i * size;
                let last = if i == count - 1 {
                    total - 1
                } else {
                    first + size - 1
                };
                Section::new(first, last)
            })
            .collect()
    }

    /// How many sections to split `total` bytes into
    pub fn section_count(total: u64, max_sections: usize, min_section_size: u64) -> usize {
        let by_size = (total / min_section_size.max(1)).max(1);
        by_size.min(max_sections.max(1) as u64) as usize
    }
}
