//! Live sync status and permanent-failure subscriptions.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use stockman_core::ActionId;
use tokio::sync::watch;

use crate::action::FailedAction;

/// Coarse sync indicator for the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Syncing,
    Synced,
    Error,
}

/// Point-in-time view of the engine, published on every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncSnapshot {
    pub pending: usize,
    pub failed: usize,
    pub is_online: bool,
    pub phase: SyncPhase,
    pub last_synced_at: Option<DateTime<Utc>>,
}

type Listener = Arc<dyn Fn(&[FailedAction]) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Listener)>>,
}

impl Listeners {
    fn lock(&self) -> MutexGuard<'_, Vec<(u64, Listener)>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle returned by [`StatusHub::on_permanent_failure`].
///
/// Dropping the handle keeps the subscription; call
/// [`Unsubscribe::unsubscribe`] to remove it.
#[must_use = "keep the handle to be able to unsubscribe"]
pub struct Unsubscribe {
    id: u64,
    listeners: Weak<Listeners>,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

/// Fan-out point for status changes.
pub struct StatusHub {
    snapshot: watch::Sender<SyncSnapshot>,
    failed: RwLock<Vec<FailedAction>>,
    listeners: Arc<Listeners>,
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusHub {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(SyncSnapshot::default());
        Self {
            snapshot,
            failed: RwLock::new(Vec::new()),
            listeners: Arc::new(Listeners::default()),
        }
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshot.subscribe()
    }

    /// Apply `f` to the snapshot and notify watchers if it changed.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut SyncSnapshot),
    {
        self.snapshot.send_if_modified(|snapshot| {
            let before = snapshot.clone();
            f(snapshot);
            *snapshot != before
        });
    }

    pub fn set_phase(&self, phase: SyncPhase) {
        self.update(|s| s.phase = phase);
    }

    pub fn set_online(&self, is_online: bool) {
        self.update(|s| s.is_online = is_online);
    }

    pub fn set_pending(&self, pending: usize) {
        self.update(|s| s.pending = pending);
    }

    pub fn failed_actions(&self) -> Vec<FailedAction> {
        self.failed
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the cached dead-letter list. Listeners are invoked with the
    /// full list when the set of failed action ids changed.
    pub fn set_failed(&self, failed: Vec<FailedAction>) {
        let changed = {
            let mut current = self.failed.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            let before: HashSet<ActionId> = current.iter().map(FailedAction::id).collect();
            let after: HashSet<ActionId> = failed.iter().map(FailedAction::id).collect();
            *current = failed.clone();
            before != after
        };

        self.update(|s| s.failed = failed.len());

        if changed {
            let listeners: Vec<Listener> = self.listeners.lock().iter().map(|(_, l)| l.clone()).collect();
            tracing::debug!(
                failed = failed.len(),
                listeners = listeners.len(),
                "dead-letter set changed"
            );
            for listener in listeners {
                listener(&failed);
            }
        }
    }

    /// Register a callback invoked with the full failed list whenever the
    /// dead-letter set changes.
    pub fn on_permanent_failure<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&[FailedAction]) + Send + Sync + 'static,
    {
        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(callback)));
        Unsubscribe {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }
}
