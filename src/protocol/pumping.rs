//! The pumping: one download task tracked by the queue

use super::section::Section;
use super::types::{PumpingId, PumpingState};
use crate::error::{PumpError, PumpingFailure, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

/// Snapshot of a download task
///
/// Callers only ever see clones; the queue and the owning worker mutate
/// the registry copy through crate-private methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pumping {
    id: PumpingId,
    declared_url: Url,
    real_url: Url,
    output: PathBuf,
    length: Option<u64>,
    sections: Vec<Section>,
    state: PumpingState,
    attempts: u32,
    last_error: Option<PumpingFailure>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl Pumping {
    pub(crate) fn new(url: Url, output: PathBuf) -> Self {
        Self {
            id: PumpingId::new(),
            real_url: url.clone(),
            declared_url: url,
            output,
            length: None,
            sections: Vec::new(),
            state: PumpingState::Queued,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn id(&self) -> PumpingId {
        self.id
    }

    /// URL as submitted, never changed by redirects
    pub fn declared_url(&self) -> &Url {
        &self.declared_url
    }

    /// URL after following redirects
    pub fn real_url(&self) -> &Url {
        &self.real_url
    }

    /// Final output path
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// File written while the transfer is in progress
    pub fn part_path(&self) -> PathBuf {
        let mut name = self.output.as_os_str().to_owned();
        name.push(".part");
        PathBuf::from(name)
    }

    /// Total length, once the server has reported it
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// Total length, or -1 while unknown
    pub fn length_or_unknown(&self) -> i64 {
        self.length.map_or(-1, |len| len as i64)
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn state(&self) -> PumpingState {
        self.state
    }

    /// Failed attempts in the current run
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&PumpingFailure> {
        self.last_error.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Bytes written across all sections
    pub fn downloaded(&self) -> u64 {
        self.sections.iter().map(Section::downloaded).sum()
    }

    /// Completion percentage (0.0 - 100.0), 0 while the length is unknown
    pub fn progress(&self) -> f64 {
        match self.length {
            Some(0) if self.state == PumpingState::Finished => 100.0,
            Some(total) if total > 0 => (self.downloaded() as f64 / total as f64) * 100.0,
            _ => 0.0,
        }
    }

    pub(crate) fn set_state(&mut self, next: PumpingState) -> Result<PumpingState> {
        if !self.state.can_transition_to(next) {
            return Err(PumpError::InvalidState {
                action: "change state",
                current_state: format!("{} (requested {})", self.state, next),
            });
        }
        let old = self.state;
        self.state = next;
        if next == PumpingState::Finished {
            self.finished_at = Some(Utc::now());
        }
        Ok(old)
    }

    pub(crate) fn set_real_url(&mut self, url: Url) {
        self.real_url = url;
    }

    /// Record the reported length; a disagreement with a known length is an error
    pub(crate) fn set_length(&mut self, length: u64) -> Result<()> {
        match self.length {
            Some(known) if known != length => Err(PumpError::LengthMismatch {
                expected: known,
                actual: length,
            }),
            _ => {
                self.length = Some(length);
                Ok(())
            }
        }
    }

    pub(crate) fn set_sections(&mut self, sections: Vec<Section>) {
        self.sections = sections;
    }

    /// Copy cursors from the worker's working set; never rewinds
    pub(crate) fn sync_offsets(&mut self, sections: &[Section]) -> bool {
        let mut advanced = false;
        for (mine, theirs) in self.sections.iter_mut().zip(sections) {
            let before = mine.offset();
            mine.set_offset(theirs.offset());
            advanced |= mine.offset() != before;
        }
        advanced
    }

    pub(crate) fn record_failure(&mut self, err: &PumpError) {
        self.last_error = Some(err.to_failure());
    }

    pub(crate) fn count_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Clear the failure history for an explicit retry
    pub(crate) fn rearm(&mut self) {
        self.attempts = 0;
        self.last_error = None;
        self.finished_at = None;
    }

    /// Normalize a pumping loaded from storage. Non-terminal states go back
    /// to QUEUED; offsets, length, real URL and attempts are kept. A plan
    /// with an inverted section is dropped whole and rebuilt on the next
    /// attempt.
    pub(crate) fn recover(&mut self) -> Recovery {
        let restored: Option<Vec<Section>> = self
            .sections
            .iter()
            .map(|s| Section::restore(s.first(), s.last(), s.offset()))
            .collect();
        let plan_dropped = restored.is_none();
        self.sections = restored.unwrap_or_default();

        let requeued = self.state.is_active();
        if requeued {
            self.state = PumpingState::Queued;
        }

        Recovery {
            requeued,
            plan_dropped,
        }
    }
}

/// What `Pumping::recover` had to change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Recovery {
    /// An interrupted state was put back to QUEUED
    pub(crate) requeued: bool,
    /// The stored sections were malformed and discarded
    pub(crate) plan_dropped: bool,
}
