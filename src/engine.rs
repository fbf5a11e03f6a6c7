//! Dispatched queue - main coordinator
//!
//! The `DispatchedQueue` is the primary entry point for the library.
//! It owns the pumping registry, persists it after every change, runs the
//! worker pool between `invoke` and `terminate`, and notifies listeners.

use crate::config::QueueConfig;
use crate::error::{PumpError, Result};
use crate::http::{self, RetryPolicy};
use crate::listener::{DownloadListener, EventChannel, ListenerId};
use crate::protocol::{Pumping, PumpingId, PumpingState, QueueEvent, QueueStats};
use crate::queue::{CancelAction, PumpingsQueue};
use crate::scheduler;
use crate::storage::{FileStorage, Storage};

use reqwest::Client;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Maximum number of events to buffer per subscriber
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Scheduler task started by `invoke`
struct Runner {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// Persistent download queue with a bounded worker pool
pub struct DispatchedQueue {
    /// Weak self-reference for spawning background tasks from `&self` methods
    self_ref: Weak<Self>,

    pub(crate) config: QueueConfig,

    /// Registry and listeners
    pub(crate) pumpings: PumpingsQueue,

    pub(crate) client: Client,

    pub(crate) policy: RetryPolicy,

    storage: Arc<dyn Storage>,

    /// Serializes writes; the snapshot is taken while holding it
    persist_lock: Mutex<()>,

    /// Poked whenever a pumping may have become claimable
    wake: Arc<Notify>,

    /// Built-in listener behind `subscribe`
    events: Arc<EventChannel>,

    runner: Mutex<Option<Runner>>,

    active: AtomicBool,
}

impl DispatchedQueue {
    /// Obtain a strong `Arc<Self>` reference for spawning background tasks.
    fn arc(&self) -> Result<Arc<Self>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| PumpError::Internal("queue is being dropped".into()))
    }

    /// Create a queue bound to the JSON file at `config.state_file`
    pub async fn new(config: QueueConfig) -> Result<Arc<Self>> {
        let storage = Arc::new(FileStorage::new(config.get_state_file()));
        Self::with_storage(config, storage).await
    }

    /// Create a queue on top of any storage backend
    pub async fn with_storage(config: QueueConfig, storage: Arc<dyn Storage>) -> Result<Arc<Self>> {
        config.validate()?;

        let client = http::build_client(&config)?;
        let policy = RetryPolicy::from_config(&config);
        let events = Arc::new(EventChannel::new(EVENT_CHANNEL_CAPACITY));
        let pumpings = PumpingsQueue::new();
        pumpings.add_listener(events.clone());

        let queue = Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            config,
            pumpings,
            client,
            policy,
            storage,
            persist_lock: Mutex::new(()),
            wake: Arc::new(Notify::new()),
            events,
            runner: Mutex::new(None),
            active: AtomicBool::new(false),
        });

        queue.load_persisted().await?;

        Ok(queue)
    }

    /// Restore the stored queue; interrupted pumpings go back to QUEUED
    async fn load_persisted(&self) -> Result<()> {
        let persisted = self.storage.load_all().await?;

        for mut pumping in persisted {
            let id = pumping.id();
            let before = pumping.state();
            let recovery = pumping.recover();
            if recovery.plan_dropped {
                tracing::warn!(
                    "Discarding malformed sections of pumping {}; it restarts from zero",
                    id
                );
            }
            if recovery.requeued {
                tracing::info!(
                    "Restored pumping {} ({}) from {} to {}",
                    id,
                    pumping.declared_url(),
                    before,
                    pumping.state()
                );
            }
            if !self.pumpings.insert(pumping, true) {
                tracing::warn!("Skipping duplicate pumping {} in stored queue", id);
            }
        }

        Ok(())
    }

    /// Queue a download. `pumpingAdd` has been delivered when this returns.
    pub async fn add(&self, url: &str, output: Option<&Path>) -> Result<Pumping> {
        let url = http::parse_url(url)?;
        let output = http::resolve_output_path(&url, output, &self.config.download_dir)?;
        let pumping = Pumping::new(url, output);
        let id = pumping.id();

        self.pumpings.insert(pumping.clone(), false);
        if let Err(e) = self.persist().await {
            self.pumpings.remove(id);
            return Err(e);
        }

        tracing::debug!("Added pumping {} -> {}", id, pumping.output().display());
        self.pumpings.emit(QueueEvent::Added { id });
        self.pumpings.announce(id);
        self.wake.notify_one();

        Ok(pumping)
    }

    /// Remove a pumping, stopping its transfer and deleting the part file.
    /// Nothing is written for it once this returns.
    pub async fn delete(&self, id: PumpingId) -> Result<()> {
        if let Some(handle) = self.pumpings.begin_delete(id)? {
            handle.cancel();
            handle.wait().await;
        }

        let pumping = self
            .pumpings
            .remove(id)
            .ok_or(PumpError::NotFound(id))?;

        let part = pumping.part_path();
        match tokio::fs::remove_file(&part).await {
            Ok(()) => tracing::debug!("Removed part file {}", part.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove part file {}: {}", part.display(), e),
        }

        self.pumpings.emit(QueueEvent::Deleted { id });
        self.persist().await
    }

    /// Delete every pumping, then announce the reset
    pub async fn reset(&self) -> Result<()> {
        let mut first_error = None;
        for id in self.pumpings.ids() {
            match self.delete(id).await {
                Ok(()) | Err(PumpError::NotFound(_)) => {}
                Err(e) => {
                    tracing::warn!("Reset: failed to delete {}: {}", id, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        self.pumpings.emit(QueueEvent::Reset);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop a pumping without removing it; it ends up CANCELLED
    pub async fn cancel(&self, id: PumpingId) -> Result<()> {
        match self.pumpings.begin_cancel(id)? {
            CancelAction::Wait(handle) => handle.wait().await,
            CancelAction::Done(old_state) => {
                self.pumpings.emit(QueueEvent::StateChanged {
                    id,
                    old_state,
                    new_state: PumpingState::Cancelled,
                });
                self.persist().await?;
            }
        }
        Ok(())
    }

    /// Put a FAILED or CANCELLED pumping back in the queue with a fresh
    /// attempt budget
    pub async fn retry(&self, id: PumpingId) -> Result<()> {
        // Hidden from the scheduler until listeners have seen the transition
        let old_state = self.pumpings.rearm(id)?;
        self.pumpings.emit(QueueEvent::StateChanged {
            id,
            old_state,
            new_state: PumpingState::Queued,
        });
        let persisted = self.persist().await;
        self.pumpings.announce(id);
        self.wake.notify_one();
        persisted
    }

    /// Start the worker pool. A no-op while already running.
    pub async fn invoke(&self) -> Result<()> {
        let mut runner = self.runner.lock().await;
        if runner.is_some() {
            return Ok(());
        }

        self.persist().await?;
        let this = self.arc()?;

        let shutdown = CancellationToken::new();
        self.active.store(true, Ordering::SeqCst);
        tracing::info!("Invoking workers");
        self.pumpings.emit(QueueEvent::Invoked);

        let task = tokio::spawn(scheduler::run(
            Arc::downgrade(&this),
            Arc::clone(&self.wake),
            shutdown.clone(),
            self.config.max_workers,
        ));
        *runner = Some(Runner { shutdown, task });

        Ok(())
    }

    /// Stop the worker pool and wait for every worker to exit. Interrupted
    /// pumpings go back to QUEUED. A no-op when not running.
    pub async fn terminate(&self) -> Result<()> {
        let mut runner = self.runner.lock().await;
        let Some(Runner { shutdown, task }) = runner.take() else {
            return Ok(());
        };

        tracing::info!("Terminating workers");
        shutdown.cancel();
        if let Err(e) = task.await {
            tracing::error!("Scheduler task failed: {}", e);
        }
        self.active.store(false, Ordering::SeqCst);

        let persisted = self.persist().await;
        self.pumpings.emit(QueueEvent::Terminated);
        persisted
    }

    /// Whether the worker pool is running
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn get_by_id(&self, id: PumpingId) -> Option<Pumping> {
        self.pumpings.get(id)
    }

    /// Snapshots of every pumping in insertion order
    pub fn to_array(&self) -> Vec<Pumping> {
        self.pumpings.to_array()
    }

    pub fn stats(&self) -> QueueStats {
        self.pumpings.stats()
    }

    pub fn add_listener(&self, listener: Arc<dyn DownloadListener>) -> ListenerId {
        self.pumpings.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.pumpings.remove_listener(id)
    }

    /// Subscribe to queue events
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Write the whole queue to storage
    pub(crate) async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.pumpings.to_array();
        self.storage.save_all(&snapshot).await
    }

    /// Persist from a background path, where there is no caller to report to
    pub(crate) async fn persist_quietly(&self) {
        if let Err(e) = self.persist().await {
            tracing::warn!("Failed to persist queue: {}", e);
        }
    }
}

impl Drop for DispatchedQueue {
    fn drop(&mut self) {
        // Stop the scheduler if the queue is dropped without terminate
        if let Some(runner) = self.runner.get_mut().take() {
            runner.shutdown.cancel();
        }
    }
}
