//! Queue events
//!
//! Events emitted by the download queue.

use super::types::{PumpingId, PumpingState};
use serde::{Deserialize, Serialize};

/// Events emitted by the download queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueEvent {
    /// Pumping was added
    Added { id: PumpingId },
    /// Pumping was removed
    Deleted { id: PumpingId },
    /// Progress, real URL or length changed
    Updated { id: PumpingId },
    /// State changed
    StateChanged {
        id: PumpingId,
        old_state: PumpingState,
        new_state: PumpingState,
    },
    /// Every pumping was deleted
    Reset,
    /// Workers started
    Invoked,
    /// Workers stopped
    Terminated,
}

impl QueueEvent {
    /// The pumping this event is about, if any
    pub fn id(&self) -> Option<PumpingId> {
        match self {
            Self::Added { id }
            | Self::Deleted { id }
            | Self::Updated { id }
            | Self::StateChanged { id, .. } => Some(*id),
            Self::Reset | Self::Invoked | Self::Terminated => None,
        }
    }
}
