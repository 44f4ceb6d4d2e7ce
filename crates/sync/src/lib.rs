//! `stockman-sync`
//!
//! **Responsibility:** Offline action queue and dead-letter synchronization.
//!
//! Mutations made while the device is offline are queued durably and replayed
//! against the remote API once connectivity returns:
//! - per-entity ordering (partition keys), independent entities in parallel
//! - transient failures retried with backoff, up to a bounded attempt count
//! - permanently rejected or exhausted actions moved to a dead-letter store
//!   for manual retry or dismissal
//!
//! [`OfflineSync`] is the only surface the UI layer needs.

pub mod action;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod facade;
#[cfg(feature = "http")]
pub mod http;
pub mod network;
pub mod notify;
pub mod processor;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod storage;
pub mod worker;

pub use action::{ActionRequest, FailedAction, IdRemap, InvalidActionError, PartitionKey, QueuedAction};
pub use config::SyncConfig;
pub use dead_letter::DeadLetterStore;
pub use error::{SyncError, SyncResult};
pub use facade::{OfflineSync, SubmitOutcome};
#[cfg(feature = "http")]
pub use http::HttpRemote;
pub use network::{ConnectivityProbe, ConnectivityState, ConnectivityTransition, LinkState, NetworkMonitor};
pub use notify::{SyncPhase, SyncSnapshot, Unsubscribe};
pub use processor::{DrainOutcome, DrainReport, SkipReason, SyncProcessor};
pub use queue::QueueStore;
pub use remote::{RemoteApi, RemoteError, RemoteRecord};
pub use retry::RetryPolicy;
pub use storage::{MemoryStorage, PersistenceError, RecordStorage, SqliteStorage};
pub use worker::{SyncWorker, SyncWorkerHandle};

pub use stockman_core::{ActionId, EntityType, Operation};
