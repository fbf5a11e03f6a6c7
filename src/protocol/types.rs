//! Core protocol types
//!
//! Fundamental types used throughout the protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a pumping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PumpingId(Uuid);

impl PumpingId {
    /// Create a new random pumping ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse the hyphenated form produced by `Display`
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for PumpingId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PumpingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a pumping
///
/// ```text
/// QUEUED -> CONNECTING -> { WAITING -> CONNECTING }* -> DOWNLOADING -> FINISHED
///                  \________________\___________________\-> FAILED
/// ```
///
/// Any non-terminal state may move to `Cancelled`; an active one may be
/// suspended back to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpingState {
    /// Waiting for a worker
    Queued,
    /// Resolving redirects and probing the server
    Connecting,
    /// Backing off after a failed attempt
    Waiting,
    /// Sections are streaming
    Downloading,
    /// Output file complete
    Finished,
    /// Attempt budget exhausted or a non-retryable error
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

impl PumpingState {
    /// Whether no worker will ever pick this pumping up again on its own
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }

    /// Whether a worker is driving this pumping
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Waiting | Self::Downloading)
    }

    /// Check a transition against the state machine
    pub fn can_transition_to(&self, next: PumpingState) -> bool {
        use PumpingState::*;
        match (self, next) {
            (Queued, Connecting) => true,
            (Connecting, Downloading | Waiting | Failed) => true,
            (Waiting, Connecting | Failed) => true,
            (Downloading, Finished | Waiting | Failed) => true,
            (Queued | Connecting | Waiting | Downloading, Cancelled) => true,
            (Connecting | Waiting | Downloading, Queued) => true,
            (Failed | Cancelled, Queued) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Connecting => "connecting",
            Self::Waiting => "waiting",
            Self::Downloading => "downloading",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for PumpingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of pumpings in each state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub connecting: usize,
    pub waiting: usize,
    pub downloading: usize,
    pub finished: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueStats {
    pub(crate) fn count(&mut self, state: PumpingState) {
        match state {
            PumpingState::Queued => self.queued += 1,
            PumpingState::Connecting => self.connecting += 1,
            PumpingState::Waiting => self.waiting += 1,
            PumpingState::Downloading => self.downloading += 1,
            PumpingState::Finished => self.finished += 1,
            PumpingState::Failed => self.failed += 1,
            PumpingState::Cancelled => self.cancelled += 1,
        }
    }

    /// Total number of pumpings counted
    pub fn total(&self) -> usize {
        self.queued
            + self.connecting
            + self.waiting
            + self.downloading
            + self.finished
            + self.failed
            + self.cancelled
    }
}
