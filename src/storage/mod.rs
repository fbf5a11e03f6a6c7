//! Storage Module
//!
//! This module handles persistent storage of the pumping queue.
//! The whole queue is written as one document so a reload always sees a
//! consistent snapshot.

pub mod file;

pub use file::FileStorage;

use crate::error::{PumpError, Result, StorageErrorKind};
use crate::protocol::Pumping;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Storage trait for persisting the queue
///
/// Implementations store and retrieve the full pumping set to allow resume
/// after crashes or restarts.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Replace the stored queue with `pumpings`, in order
    async fn save_all(&self, pumpings: &[Pumping]) -> Result<()>;

    /// Load the stored queue, empty when nothing was saved yet
    async fn load_all(&self) -> Result<Vec<Pumping>>;
}

/// In-memory storage for testing
#[derive(Debug, Default)]
pub struct MemoryStorage {
    pumpings: parking_lot::RwLock<Vec<Pumping>>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-filled with `pumpings`, as if a previous session saved them
    pub fn with_pumpings(pumpings: Vec<Pumping>) -> Self {
        Self {
            pumpings: parking_lot::RwLock::new(pumpings),
            ..Self::default()
        }
    }

    /// Number of successful saves so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make every following save fail with a storage error
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// What the last successful save wrote
    pub fn snapshot(&self) -> Vec<Pumping> {
        self.pumpings.read().clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save_all(&self, pumpings: &[Pumping]) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(PumpError::storage(
                StorageErrorKind::Io,
                "<memory>",
                "save disabled",
            ));
        }
        *self.pumpings.write() = pumpings.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Pumping>> {
        Ok(self.pumpings.read().clone())
    }
}
