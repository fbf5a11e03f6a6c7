//! Protocol types for pump-dl
//!
//! This module contains all types that cross the queue boundary:
//! - Pumping snapshots and their sections
//! - States, ids and statistics
//! - Events emitted by the queue
//!
//! These types are designed for serialization and are what the persisted
//! queue file is made of.

mod events;
mod pumping;
mod section;
mod types;

pub use events::QueueEvent;
pub use pumping::Pumping;
pub use section::Section;
pub use types::{PumpingId, PumpingState, QueueStats};
