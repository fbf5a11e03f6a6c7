//! Pumpings registry
//!
//! `PumpingsQueue` owns every pumping, remembers insertion order and which
//! worker (if any) currently owns each one, and fans events out to the
//! registered listeners. It never awaits: every method takes the registry
//! lock briefly and listeners always run after the lock is released.

use crate::error::{PumpError, Result};
use crate::listener::{DownloadListener, ListenerId, ListenerSet};
use crate::protocol::{Pumping, PumpingId, PumpingState, QueueEvent, QueueStats};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Control side of a running worker
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    token: CancellationToken,
    cancelled: Arc<AtomicBool>,
    done: watch::Receiver<()>,
}

impl WorkerHandle {
    /// Stop the worker and have it move the pumping to CANCELLED
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    /// Wait until the worker has exited
    pub(crate) async fn wait(mut self) {
        // The worker holds the sender; changed() errors once it is dropped
        while self.done.changed().await.is_ok() {}
    }
}

/// Worker side of a claim
pub(crate) struct Claim {
    pub(crate) id: PumpingId,
    pub(crate) token: CancellationToken,
    pub(crate) cancelled: Arc<AtomicBool>,
    pub(crate) done: watch::Sender<()>,
}

/// Internal representation of a managed pumping
struct ManagedPumping {
    pumping: Pumping,
    /// Present while a worker owns the pumping
    handle: Option<WorkerHandle>,
    /// Set once `pumpingAdd` was delivered; unannounced pumpings are never claimed
    announced: bool,
    /// Set by delete; the pumping is never claimed again
    deleting: bool,
}

#[derive(Default)]
struct Registry {
    pumpings: HashMap<PumpingId, ManagedPumping>,
    order: Vec<PumpingId>,
}

impl Registry {
    fn get_mut(&mut self, id: PumpingId) -> Result<&mut ManagedPumping> {
        self.pumpings.get_mut(&id).ok_or(PumpError::NotFound(id))
    }
}

/// What `cancel` has to do for a pumping
pub(crate) enum CancelAction {
    /// A worker owns it; it was signalled and must be awaited
    Wait(WorkerHandle),
    /// It was idle and has been moved to CANCELLED already
    Done(PumpingState),
}

pub(crate) struct PumpingsQueue {
    registry: RwLock<Registry>,
    listeners: ListenerSet,
}

impl PumpingsQueue {
    pub(crate) fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            listeners: ListenerSet::new(),
        }
    }

    /// Register a pumping. Returns false if the id is already present.
    pub(crate) fn insert(&self, pumping: Pumping, announced: bool) -> bool {
        let mut registry = self.registry.write();
        let id = pumping.id();
        if registry.pumpings.contains_key(&id) {
            return false;
        }
        registry.order.push(id);
        registry.pumpings.insert(
            id,
            ManagedPumping {
                pumping,
                handle: None,
                announced,
                deleting: false,
            },
        );
        true
    }

    pub(crate) fn announce(&self, id: PumpingId) {
        if let Some(managed) = self.registry.write().pumpings.get_mut(&id) {
            managed.announced = true;
        }
    }

    pub(crate) fn remove(&self, id: PumpingId) -> Option<Pumping> {
        let mut registry = self.registry.write();
        let managed = registry.pumpings.remove(&id)?;
        registry.order.retain(|other| *other != id);
        Some(managed.pumping)
    }

    pub(crate) fn get(&self, id: PumpingId) -> Option<Pumping> {
        self.registry
            .read()
            .pumpings
            .get(&id)
            .map(|m| m.pumping.clone())
    }

    /// Snapshots in insertion order
    pub(crate) fn to_array(&self) -> Vec<Pumping> {
        let registry = self.registry.read();
        registry
            .order
            .iter()
            .filter_map(|id| registry.pumpings.get(id))
            .map(|m| m.pumping.clone())
            .collect()
    }

    pub(crate) fn ids(&self) -> Vec<PumpingId> {
        self.registry.read().order.clone()
    }

    pub(crate) fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for managed in self.registry.read().pumpings.values() {
            stats.count(managed.pumping.state());
        }
        stats
    }

    /// Apply `f` to a pumping under the registry lock
    pub(crate) fn update<T>(
        &self,
        id: PumpingId,
        f: impl FnOnce(&mut Pumping) -> Result<T>,
    ) -> Result<T> {
        let mut registry = self.registry.write();
        f(&mut registry.get_mut(id)?.pumping)
    }

    /// Apply `f` and give up worker ownership in the same critical section
    pub(crate) fn update_and_release<T>(
        &self,
        id: PumpingId,
        f: impl FnOnce(&mut Pumping) -> Result<T>,
    ) -> Result<T> {
        let mut registry = self.registry.write();
        let managed = registry.get_mut(id)?;
        managed.handle = None;
        f(&mut managed.pumping)
    }

    /// Claim the oldest announced QUEUED pumping for a new worker
    pub(crate) fn claim_next(&self, shutdown: &CancellationToken) -> Option<Claim> {
        let mut registry = self.registry.write();
        let Registry { pumpings, order } = &mut *registry;

        let next = order.iter().find_map(|id| {
            let managed = pumpings.get(id)?;
            let claimable = managed.announced
                && !managed.deleting
                && managed.handle.is_none()
                && managed.pumping.state() == PumpingState::Queued;
            claimable.then_some(*id)
        });
        let id = next?;

        let token = shutdown.child_token();
        let cancelled = Arc::new(AtomicBool::new(false));
        let (done, done_rx) = watch::channel(());

        if let Some(managed) = pumpings.get_mut(&id) {
            managed.handle = Some(WorkerHandle {
                token: token.clone(),
                cancelled: Arc::clone(&cancelled),
                done: done_rx,
            });
        }

        Some(Claim {
            id,
            token,
            cancelled,
            done,
        })
    }

    /// Mark a pumping as being deleted and hand back its worker, if any
    pub(crate) fn begin_delete(&self, id: PumpingId) -> Result<Option<WorkerHandle>> {
        let mut registry = self.registry.write();
        let managed = registry.get_mut(id)?;
        if managed.deleting {
            return Err(PumpError::NotFound(id));
        }
        managed.deleting = true;
        Ok(managed.handle.clone())
    }

    /// Signal a running worker, or cancel an idle QUEUED pumping in place
    pub(crate) fn begin_cancel(&self, id: PumpingId) -> Result<CancelAction> {
        let mut registry = self.registry.write();
        let managed = registry.get_mut(id)?;

        if managed.deleting || managed.pumping.state().is_terminal() {
            return Err(PumpError::InvalidState {
                action: "cancel",
                current_state: managed.pumping.state().to_string(),
            });
        }

        if let Some(handle) = &managed.handle {
            handle.cancel();
            return Ok(CancelAction::Wait(handle.clone()));
        }

        let old = managed.pumping.set_state(PumpingState::Cancelled)?;
        Ok(CancelAction::Done(old))
    }

    /// FAILED or CANCELLED back to QUEUED with a fresh attempt budget.
    /// The pumping stays unclaimable until `announce`.
    pub(crate) fn rearm(&self, id: PumpingId) -> Result<PumpingState> {
        let mut registry = self.registry.write();
        let managed = registry.get_mut(id)?;

        let state = managed.pumping.state();
        if managed.deleting
            || managed.handle.is_some()
            || !matches!(state, PumpingState::Failed | PumpingState::Cancelled)
        {
            return Err(PumpError::InvalidState {
                action: "retry",
                current_state: state.to_string(),
            });
        }

        let old = managed.pumping.set_state(PumpingState::Queued)?;
        managed.pumping.rearm();
        managed.announced = false;
        Ok(old)
    }

    pub(crate) fn add_listener(&self, listener: Arc<dyn DownloadListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Deliver an event. Must not be called with the registry lock held.
    pub(crate) fn emit(&self, event: QueueEvent) {
        self.listeners.emit(&event);
    }
}
