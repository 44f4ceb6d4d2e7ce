//! Dead-letter store: actions that will not be retried automatically.
//!
//! Moves between the pending queue and this store are ordered so that an
//! action is always recoverable from at least one of them: the destination is
//! written first, then the source is updated, and the destination write is
//! rolled back if the second step fails.

use std::sync::Arc;

use stockman_core::ActionId;

use crate::action::{FailedAction, QueuedAction};
use crate::queue::QueueStore;
use crate::storage::{PersistenceError, RecordStorage, load_json, store_json};

/// Storage key of the dead-letter list.
pub const DEAD_LETTER_KEY: &str = "sync_dead_letter";

/// Persistent list of failed actions, oldest first.
pub struct DeadLetterStore {
    storage: Arc<dyn RecordStorage>,
    state: tokio::sync::Mutex<Option<Vec<FailedAction>>>,
}

impl DeadLetterStore {
    pub fn new(storage: Arc<dyn RecordStorage>) -> Self {
        Self {
            storage,
            state: tokio::sync::Mutex::new(None),
        }
    }

    async fn ensure_loaded<'a>(
        storage: &dyn RecordStorage,
        slot: &'a mut Option<Vec<FailedAction>>,
    ) -> Result<&'a mut Vec<FailedAction>, PersistenceError> {
        if slot.is_none() {
            let entries = load_json::<Vec<FailedAction>>(storage, DEAD_LETTER_KEY)
                .await?
                .unwrap_or_default();
            *slot = Some(entries);
        }
        Ok(slot.get_or_insert_with(Vec::new))
    }

    async fn persist(&self, entries: &[FailedAction]) -> Result<(), PersistenceError> {
        store_json(self.storage.as_ref(), DEAD_LETTER_KEY, entries).await
    }

    /// Move `action` from the pending queue into the dead-letter store.
    pub async fn promote(
        &self,
        pending: &QueueStore,
        action: QueuedAction,
        reason: impl Into<String>,
    ) -> Result<FailedAction, PersistenceError> {
        let failed = FailedAction::new(action, reason);
        let id = failed.id();

        let mut guard = self.state.lock().await;
        let entries = Self::ensure_loaded(self.storage.as_ref(), &mut guard).await?;

        let mut next = entries.clone();
        next.retain(|f| f.id() != id);
        next.push(failed.clone());
        self.persist(&next).await?;
        let previous = std::mem::replace(entries, next);

        if let Err(err) = pending.remove(id).await {
            tracing::warn!(
                action_id = %id,
                error = %err,
                "failed to remove dead-lettered action from queue; rolling back"
            );
            match self.persist(&previous).await {
                Ok(()) => *entries = previous,
                Err(rollback) => tracing::error!(
                    action_id = %id,
                    error = %rollback,
                    "dead-letter rollback failed; action is recorded in both stores"
                ),
            }
            return Err(err);
        }

        tracing::warn!(
            action_id = %id,
            entity = %failed.action.entity_type,
            operation = %failed.action.operation,
            reason = %failed.reason,
            "action moved to dead-letter store"
        );
        Ok(failed)
    }

    pub async fn list(&self) -> Result<Vec<FailedAction>, PersistenceError> {
        let mut guard = self.state.lock().await;
        let entries = Self::ensure_loaded(self.storage.as_ref(), &mut guard).await?;
        Ok(entries.clone())
    }

    pub async fn len(&self) -> Result<usize, PersistenceError> {
        let mut guard = self.state.lock().await;
        let entries = Self::ensure_loaded(self.storage.as_ref(), &mut guard).await?;
        Ok(entries.len())
    }

    pub async fn is_empty(&self) -> Result<bool, PersistenceError> {
        Ok(self.len().await? == 0)
    }

    pub async fn contains(&self, id: ActionId) -> Result<bool, PersistenceError> {
        let mut guard = self.state.lock().await;
        let entries = Self::ensure_loaded(self.storage.as_ref(), &mut guard).await?;
        Ok(entries.iter().any(|f| f.id() == id))
    }

    /// Remove an entry without retrying it.
    pub async fn remove(&self, id: ActionId) -> Result<Option<FailedAction>, PersistenceError> {
        let mut guard = self.state.lock().await;
        let entries = Self::ensure_loaded(self.storage.as_ref(), &mut guard).await?;

        let Some(index) = entries.iter().position(|f| f.id() == id) else {
            return Ok(None);
        };
        let mut next = entries.clone();
        let removed = next.remove(index);
        self.persist(&next).await?;
        *entries = next;
        Ok(Some(removed))
    }

    /// Permanently discard a failed action. Returns `false` if it was not
    /// in the store.
    pub async fn dismiss(&self, id: ActionId) -> Result<bool, PersistenceError> {
        let removed = self.remove(id).await?;
        if removed.is_some() {
            tracing::info!(action_id = %id, "dismissed failed action");
        }
        Ok(removed.is_some())
    }

    /// Move one action back to the pending queue tail.
    pub async fn restore(&self, pending: &QueueStore, id: ActionId) -> Result<bool, PersistenceError> {
        let restored = self.restore_where(pending, |f| f.id() == id).await?;
        Ok(restored == 1)
    }

    /// Move every action back to the pending queue tail, keeping their order.
    pub async fn restore_all(&self, pending: &QueueStore) -> Result<usize, PersistenceError> {
        self.restore_where(pending, |_| true).await
    }

    async fn restore_where<F>(&self, pending: &QueueStore, select: F) -> Result<usize, PersistenceError>
    where
        F: Fn(&FailedAction) -> bool + Send,
    {
        let mut guard = self.state.lock().await;
        let entries = Self::ensure_loaded(self.storage.as_ref(), &mut guard).await?;

        let (selected, remaining): (Vec<FailedAction>, Vec<FailedAction>) =
            entries.iter().cloned().partition(|f| select(f));
        if selected.is_empty() {
            return Ok(0);
        }

        let actions: Vec<QueuedAction> = selected
            .into_iter()
            .map(|failed| {
                let mut action = failed.action;
                action.attempts = 0;
                action.retry_at = None;
                action
            })
            .collect();
        let ids: Vec<ActionId> = actions.iter().map(|a| a.id).collect();

        pending.append_all(actions).await?;

        if let Err(err) = self.persist(&remaining).await {
            tracing::warn!(error = %err, "failed to clear restored dead letters; rolling back queue");
            if let Err(rollback) = pending.remove_many(&ids).await {
                tracing::error!(
                    error = %rollback,
                    count = ids.len(),
                    "queue rollback failed; restored actions are recorded in both stores"
                );
            }
            return Err(err);
        }
        *entries = remaining;

        tracing::info!(count = ids.len(), "restored failed actions to the queue");
        Ok(ids.len())
    }
}
