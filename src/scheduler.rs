//! Worker pool
//!
//! The scheduler task hands QUEUED pumpings to workers, at most
//! `max_workers` at a time, oldest first. It sleeps on a `Notify` that is
//! poked whenever something may have become claimable (add, retry, a worker
//! exiting) and stops once the queue's shutdown token fires, after every
//! worker it spawned has exited.

use crate::engine::DispatchedQueue;
use crate::worker::Worker;

use std::sync::{Arc, Weak};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub(crate) async fn run(
    queue: Weak<DispatchedQueue>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    max_workers: usize,
) {
    let permits = Arc::new(Semaphore::new(max_workers));
    let mut workers = JoinSet::new();

    tracing::info!(max_workers, "Scheduler started");

    'dispatch: loop {
        if shutdown.is_cancelled() {
            break;
        }

        // Claim as many pumpings as there are free workers
        while let Ok(permit) = Arc::clone(&permits).try_acquire_owned() {
            let Some(queue) = queue.upgrade() else {
                break 'dispatch;
            };
            let Some(claim) = queue.pumpings.claim_next(&shutdown) else {
                break;
            };

            tracing::debug!(id = %claim.id, "Dispatching pumping");
            let worker = Worker::new(queue, claim);
            workers.spawn(async move {
                worker.run().await;
                drop(permit);
            });
        }

        tokio::select! {
            _ = wake.notified() => {}
            Some(joined) = workers.join_next() => {
                if let Err(e) = joined {
                    tracing::error!("Worker task failed: {}", e);
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }

    // Workers observe the same shutdown token through their child tokens
    shutdown.cancel();
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            tracing::error!("Worker task failed: {}", e);
        }
    }

    tracing::info!("Scheduler stopped");
}
