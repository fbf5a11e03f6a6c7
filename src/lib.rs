//! # pump-dl
//!
//! A persistent, resumable HTTP download queue.
//!
//! ## Features
//!
//! - **Resumable transfers**: Each pumping is split into byte-range sections
//!   whose offsets survive restarts
//! - **Bounded worker pool**: At most `max_workers` pumpings transfer at once
//! - **Retry with backoff**: Failed attempts wait and reconnect until the
//!   attempt budget runs out
//! - **Listeners**: Synchronous callbacks or a broadcast channel for every
//!   lifecycle event
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pump_dl::{DispatchedQueue, QueueConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = QueueConfig::default().download_dir("/tmp/downloads");
//!     let queue = DispatchedQueue::new(config).await?;
//!
//!     let mut events = queue.subscribe();
//!     queue.add("https://example.com/file.zip", None).await?;
//!     queue.invoke().await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("Event: {:?}", event);
//!     }
//!
//!     Ok(())
//! }
//! ```

// Modules
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod listener;
pub mod protocol;
pub mod storage;

pub(crate) mod queue;
pub(crate) mod scheduler;
pub(crate) mod worker;

// Re-exports for convenience
pub use config::{HttpConfig, QueueConfig};
pub use engine::DispatchedQueue;
pub use error::{FailureKind, NetworkErrorKind, PumpError, PumpingFailure, Result, StorageErrorKind};
pub use listener::{DownloadListener, EventChannel, ListenerId};
pub use protocol::{Pumping, PumpingId, PumpingState, QueueEvent, QueueStats, Section};

// Storage exports
pub use storage::{FileStorage, MemoryStorage, Storage};
