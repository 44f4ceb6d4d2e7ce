//! Durable queue of pending offline actions.
//!
//! The whole queue lives in a single JSON document, so every mutation is one
//! atomic storage write. A mutation is applied to a copy first and only
//! becomes visible once the write succeeded. Besides the pending actions the
//! document keeps two bounded histories: recently resolved provisional ids and
//! ids that already left the queue.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stockman_core::{ActionId, Operation};

use crate::action::{IdRemap, PartitionKey, QueuedAction, partition_heads};
use crate::storage::{PersistenceError, RecordStorage, load_json, store_json};

/// Storage key of the queue document.
pub const QUEUE_KEY: &str = "sync_queue";

/// Resolved provisional ids kept for actions enqueued after the create was
/// delivered.
const RECENT_REMAPS: usize = 32;

/// Delivered or dead-lettered ids remembered to reject a replayed enqueue.
const SETTLED_IDS: usize = 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueDocument {
    actions: Vec<QueuedAction>,
    #[serde(default)]
    id_map: VecDeque<IdRemap>,
    #[serde(default)]
    settled: VecDeque<ActionId>,
}

impl QueueDocument {
    fn position(&self, id: ActionId) -> Option<usize> {
        self.actions.iter().position(|a| a.id == id)
    }

    /// Pending, or already delivered or dead-lettered.
    fn is_known(&self, id: ActionId) -> bool {
        self.position(id).is_some() || self.settled.contains(&id)
    }

    fn settle(&mut self, id: ActionId) {
        if !self.settled.contains(&id) {
            self.settled.push_back(id);
        }
        while self.settled.len() > SETTLED_IDS {
            self.settled.pop_front();
        }
    }

    fn remember(&mut self, remap: IdRemap) {
        self.id_map
            .retain(|r| !(r.entity_type == remap.entity_type && r.provisional == remap.provisional));
        self.id_map.push_back(remap);
        while self.id_map.len() > RECENT_REMAPS {
            self.id_map.pop_front();
        }
    }

    fn canonicalize(&self, action: &mut QueuedAction) {
        for remap in &self.id_map {
            action.apply_remap(remap);
        }
    }

    /// `action` refers to an entity whose create is still pending in another
    /// partition; it has to wait for the server id.
    fn blocked(&self, action: &QueuedAction) -> bool {
        self.actions.iter().any(|other| {
            other.operation == Operation::Create
                && other.partition_key != action.partition_key
                && other
                    .target_id
                    .as_deref()
                    .is_some_and(|provisional| action.references(other.entity_type, provisional))
        })
    }

    fn is_eligible(&self, head: &QueuedAction, now: DateTime<Utc>) -> bool {
        head.is_ready(now) && !self.blocked(head)
    }
}

/// Persistent FIFO of pending actions.
///
/// Loaded lazily on first use; all writes are serialized behind one lock held
/// across the storage write.
pub struct QueueStore {
    storage: Arc<dyn RecordStorage>,
    state: tokio::sync::Mutex<Option<QueueDocument>>,
}

impl QueueStore {
    pub fn new(storage: Arc<dyn RecordStorage>) -> Self {
        Self {
            storage,
            state: tokio::sync::Mutex::new(None),
        }
    }

    async fn ensure_loaded<'a>(
        storage: &dyn RecordStorage,
        slot: &'a mut Option<QueueDocument>,
    ) -> Result<&'a mut QueueDocument, PersistenceError> {
        if slot.is_none() {
            let doc = load_json::<QueueDocument>(storage, QUEUE_KEY)
                .await?
                .unwrap_or_default();
            tracing::debug!(pending = doc.actions.len(), "loaded sync queue");
            *slot = Some(doc);
        }
        Ok(slot.get_or_insert_with(QueueDocument::default))
    }

    async fn read<R, F>(&self, f: F) -> Result<R, PersistenceError>
    where
        F: FnOnce(&QueueDocument) -> R + Send,
    {
        let mut guard = self.state.lock().await;
        let doc = Self::ensure_loaded(self.storage.as_ref(), &mut guard).await?;
        Ok(f(doc))
    }

    /// Apply `f` to a copy of the document and persist it if `f` reports a
    /// change.
    async fn mutate<R, F>(&self, f: F) -> Result<R, PersistenceError>
    where
        F: FnOnce(&mut QueueDocument) -> (R, bool) + Send,
        R: Send,
    {
        let mut guard = self.state.lock().await;
        let current = Self::ensure_loaded(self.storage.as_ref(), &mut guard).await?;

        let mut next = current.clone();
        let (result, changed) = f(&mut next);
        if changed {
            store_json(self.storage.as_ref(), QUEUE_KEY, &next).await?;
            *current = next;
        }
        Ok(result)
    }

    /// Append an action. Returns `false` if an action with the same id is
    /// queued or was recently delivered or dead-lettered (nothing is written).
    pub async fn enqueue(&self, mut action: QueuedAction) -> Result<bool, PersistenceError> {
        self.mutate(move |doc| {
            if doc.is_known(action.id) {
                return (false, false);
            }
            doc.canonicalize(&mut action);
            doc.actions.push(action);
            (true, true)
        })
        .await
    }

    /// Put previously settled actions back at the tail in one write, skipping
    /// ids already queued.
    pub async fn append_all(&self, actions: Vec<QueuedAction>) -> Result<usize, PersistenceError> {
        self.mutate(move |doc| {
            let mut added = 0;
            for mut action in actions {
                if doc.position(action.id).is_some() {
                    continue;
                }
                doc.settled.retain(|id| *id != action.id);
                doc.canonicalize(&mut action);
                doc.actions.push(action);
                added += 1;
            }
            (added, added > 0)
        })
        .await
    }

    /// Rewrite already-resolved provisional ids in `action`.
    pub async fn canonicalize(&self, mut action: QueuedAction) -> Result<QueuedAction, PersistenceError> {
        self.read(move |doc| {
            doc.canonicalize(&mut action);
            action
        })
        .await
    }

    /// Head of each eligible partition, oldest first, at most `limit`.
    ///
    /// A partition is eligible if it is in `partition_keys` (when given), its
    /// head is not backing off at `now` and does not wait for a pending create
    /// of another partition.
    pub async fn dequeue_batch(
        &self,
        partition_keys: Option<&HashSet<PartitionKey>>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueuedAction>, PersistenceError> {
        self.read(|doc| {
            partition_heads(&doc.actions)
                .into_iter()
                .filter(|head| partition_keys.is_none_or(|keys| keys.contains(&head.partition_key)))
                .filter(|head| doc.is_eligible(head, now))
                .take(limit)
                .cloned()
                .collect()
        })
        .await
    }

    /// Number of partitions whose head is still backing off at `now`.
    pub async fn backing_off(&self, now: DateTime<Utc>) -> Result<usize, PersistenceError> {
        self.read(|doc| {
            partition_heads(&doc.actions)
                .into_iter()
                .filter(|head| !head.is_ready(now))
                .count()
        })
        .await
    }

    /// Current head of one partition.
    pub async fn head_of(&self, partition_key: &PartitionKey) -> Result<Option<QueuedAction>, PersistenceError> {
        self.read(|doc| {
            doc.actions
                .iter()
                .find(|a| &a.partition_key == partition_key)
                .cloned()
        })
        .await
    }

    /// Head of one partition if it may be attempted at `now`.
    pub async fn ready_head(
        &self,
        partition_key: &PartitionKey,
        now: DateTime<Utc>,
    ) -> Result<Option<QueuedAction>, PersistenceError> {
        self.read(|doc| {
            doc.actions
                .iter()
                .find(|a| &a.partition_key == partition_key)
                .filter(|head| doc.is_eligible(head, now))
                .cloned()
        })
        .await
    }

    /// Remove an action for good; its id is not accepted again.
    pub async fn remove(&self, id: ActionId) -> Result<bool, PersistenceError> {
        self.mutate(move |doc| match doc.position(id) {
            Some(index) => {
                doc.actions.remove(index);
                doc.settle(id);
                (true, true)
            }
            None => (false, false),
        })
        .await
    }

    pub async fn remove_many(&self, ids: &[ActionId]) -> Result<usize, PersistenceError> {
        let ids: HashSet<ActionId> = ids.iter().copied().collect();
        self.mutate(move |doc| {
            let before = doc.actions.len();
            doc.actions.retain(|a| !ids.contains(&a.id));
            let removed = before - doc.actions.len();
            for id in &ids {
                doc.settle(*id);
            }
            (removed, removed > 0)
        })
        .await
    }

    /// Remove a delivered action and, for a create that got a new server id,
    /// rewrite every pending reference to its provisional id.
    pub async fn acknowledge(&self, id: ActionId, remap: Option<IdRemap>) -> Result<bool, PersistenceError> {
        self.mutate(move |doc| {
            let removed = match doc.position(id) {
                Some(index) => {
                    doc.actions.remove(index);
                    doc.settle(id);
                    true
                }
                None => false,
            };

            let mut changed = removed;
            if let Some(remap) = remap {
                for action in &mut doc.actions {
                    action.apply_remap(&remap);
                }
                doc.remember(remap);
                changed = true;
            }

            (removed, changed)
        })
        .await
    }

    /// Record a failed attempt in place (queue position is kept).
    pub async fn requeue(
        &self,
        id: ActionId,
        attempts: u32,
        last_error: Option<String>,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool, PersistenceError> {
        self.mutate(move |doc| match doc.position(id) {
            Some(index) => {
                let action = &mut doc.actions[index];
                action.attempts = attempts;
                action.last_error = last_error;
                action.retry_at = retry_at;
                (true, true)
            }
            None => (false, false),
        })
        .await
    }

    pub async fn list_pending(&self) -> Result<Vec<QueuedAction>, PersistenceError> {
        self.read(|doc| doc.actions.clone()).await
    }

    pub async fn len(&self) -> Result<usize, PersistenceError> {
        self.read(|doc| doc.actions.len()).await
    }

    pub async fn is_empty(&self) -> Result<bool, PersistenceError> {
        Ok(self.len().await? == 0)
    }

    pub async fn contains(&self, id: ActionId) -> Result<bool, PersistenceError> {
        self.read(|doc| doc.position(id).is_some()).await
    }

    pub async fn has_partition(&self, partition_key: &PartitionKey) -> Result<bool, PersistenceError> {
        self.read(|doc| doc.actions.iter().any(|a| &a.partition_key == partition_key))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionRequest;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use stockman_core::{EntityType, Operation};

    fn update(entity: EntityType, target: &str, seq: u32) -> QueuedAction {
        ActionRequest::new(entity, Operation::Update, json!({"seq": seq}))
            .with_target(target)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_by_id() {
        let queue = QueueStore::new(MemoryStorage::arc());
        let action = update(EntityType::Product, "p1", 1);

        assert!(queue.enqueue(action.clone()).await.unwrap());
        assert!(!queue.enqueue(action.clone()).await.unwrap());
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dequeue_batch_returns_one_head_per_partition() {
        let queue = QueueStore::new(MemoryStorage::arc());
        let a1 = update(EntityType::Product, "p1", 1);
        let b1 = update(EntityType::Product, "p2", 2);
        let a2 = update(EntityType::Product, "p1", 3);
        for action in [&a1, &b1, &a2] {
            queue.enqueue(action.clone()).await.unwrap();
        }

        let batch = queue.dequeue_batch(None, 10, Utc::now()).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![a1.id, b1.id]);

        let only_b: HashSet<_> = [b1.partition_key.clone()].into_iter().collect();
        let batch = queue.dequeue_batch(Some(&only_b), 10, Utc::now()).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, b1.id);

        let limited = queue.dequeue_batch(None, 1, Utc::now()).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn backing_off_head_blocks_its_partition() {
        let queue = QueueStore::new(MemoryStorage::arc());
        let a1 = update(EntityType::Customer, "c1", 1);
        let a2 = update(EntityType::Customer, "c1", 2);
        queue.enqueue(a1.clone()).await.unwrap();
        queue.enqueue(a2.clone()).await.unwrap();

        let now = Utc::now();
        let later = now + chrono::Duration::seconds(60);
        queue.requeue(a1.id, 1, Some("timeout".into()), Some(later)).await.unwrap();

        assert!(queue.dequeue_batch(None, 10, now).await.unwrap().is_empty());
        assert_eq!(queue.backing_off(now).await.unwrap(), 1);

        let ready = queue.dequeue_batch(None, 10, later).await.unwrap();
        assert_eq!(ready[0].id, a1.id);
        assert_eq!(ready[0].attempts, 1);
        assert_eq!(ready[0].last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn acknowledge_applies_remap_to_pending_and_future_actions() {
        let queue = QueueStore::new(MemoryStorage::arc());
        let create = ActionRequest::new(
            EntityType::Customer,
            Operation::Create,
            json!({"customer_id": "tmp-1", "name": "A"}),
        )
        .build()
        .unwrap();
        let follow_up = update(EntityType::Customer, "tmp-1", 2);
        queue.enqueue(create.clone()).await.unwrap();
        queue.enqueue(follow_up.clone()).await.unwrap();

        let remap = IdRemap {
            entity_type: EntityType::Customer,
            provisional: "tmp-1".into(),
            server: "c-77".into(),
        };
        assert!(queue.acknowledge(create.id, Some(remap)).await.unwrap());

        let pending = queue.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].partition_key.as_str(), "customer:c-77");

        let late = queue.canonicalize(update(EntityType::Customer, "tmp-1", 3)).await.unwrap();
        assert_eq!(late.target_id.as_deref(), Some("c-77"));
    }

    #[tokio::test]
    async fn settled_ids_are_not_accepted_again() {
        let storage = MemoryStorage::arc();
        let queue = QueueStore::new(storage.clone());
        let delivered = update(EntityType::Sale, "s1", 1);
        let dead = update(EntityType::Sale, "s2", 2);
        queue.enqueue(delivered.clone()).await.unwrap();
        queue.enqueue(dead.clone()).await.unwrap();

        queue.acknowledge(delivered.id, None).await.unwrap();
        queue.remove(dead.id).await.unwrap();

        let reopened = QueueStore::new(storage);
        assert!(!reopened.enqueue(delivered.clone()).await.unwrap());
        assert!(!reopened.enqueue(dead.clone()).await.unwrap());
        assert!(reopened.is_empty().await.unwrap());

        // Restoring from the dead letters is the one way back in.
        assert_eq!(reopened.append_all(vec![dead.clone()]).await.unwrap(), 1);
        assert!(reopened.contains(dead.id).await.unwrap());
    }

    #[tokio::test]
    async fn resolved_ids_history_is_bounded() {
        let storage = MemoryStorage::arc();
        let queue = QueueStore::new(storage.clone());

        for n in 0..(RECENT_REMAPS + 40) {
            let create = ActionRequest::new(EntityType::Product, Operation::Create, json!({"name": n}))
                .build()
                .unwrap();
            let remap = IdRemap {
                entity_type: EntityType::Product,
                provisional: create.target_id.clone().unwrap(),
                server: format!("p-{n}"),
            };
            queue.enqueue(create.clone()).await.unwrap();
            queue.acknowledge(create.id, Some(remap)).await.unwrap();
        }

        let doc: QueueDocument = load_json(&*storage, QUEUE_KEY).await.unwrap().unwrap();
        assert!(doc.actions.is_empty());
        assert_eq!(doc.id_map.len(), RECENT_REMAPS);
        assert_eq!(doc.id_map.back().map(|r| r.server.as_str()), Some("p-71"));
    }

    #[tokio::test]
    async fn head_waits_for_pending_create_it_refers_to() {
        let queue = QueueStore::new(MemoryStorage::arc());
        let customer = ActionRequest::new(
            EntityType::Customer,
            Operation::Create,
            json!({"customer_id": "tmp-1", "name": "Awa"}),
        )
        .build()
        .unwrap();
        let sale = ActionRequest::new(EntityType::Sale, Operation::Create, json!({"customer_id": "tmp-1"}))
            .build()
            .unwrap();
        queue.enqueue(customer.clone()).await.unwrap();
        queue.enqueue(sale.clone()).await.unwrap();

        let now = Utc::now();
        let heads = queue.dequeue_batch(None, 10, now).await.unwrap();
        assert_eq!(heads.iter().map(|a| a.id).collect::<Vec<_>>(), vec![customer.id]);
        assert_eq!(queue.ready_head(&sale.partition_key, now).await.unwrap(), None);

        let remap = IdRemap {
            entity_type: EntityType::Customer,
            provisional: "tmp-1".into(),
            server: "c-900".into(),
        };
        queue.acknowledge(customer.id, Some(remap)).await.unwrap();

        let ready = queue.ready_head(&sale.partition_key, now).await.unwrap().unwrap();
        assert_eq!(ready.payload["customer_id"], "c-900");
    }

    #[tokio::test]
    async fn reloads_from_storage() {
        let storage = MemoryStorage::arc();
        let action = update(EntityType::Supplier, "s1", 1);
        {
            let queue = QueueStore::new(storage.clone());
            queue.enqueue(action.clone()).await.unwrap();
        }

        let reopened = QueueStore::new(storage);
        assert!(reopened.contains(action.id).await.unwrap());
        assert_eq!(reopened.head_of(&action.partition_key).await.unwrap(), Some(action));
    }

    struct FlakyStorage {
        inner: MemoryStorage,
        fail_writes: AtomicBool,
    }

    #[async_trait]
    impl RecordStorage for FlakyStorage {
        async fn load(&self, key: &str) -> Result<Option<String>, PersistenceError> {
            self.inner.load(key).await
        }

        async fn store(&self, key: &str, value: String) -> Result<(), PersistenceError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(PersistenceError::write(key, "disk full"));
            }
            self.inner.store(key, value).await
        }
    }

    #[tokio::test]
    async fn failed_write_leaves_queue_unchanged() {
        let storage = Arc::new(FlakyStorage {
            inner: MemoryStorage::new(),
            fail_writes: AtomicBool::new(false),
        });
        let queue = QueueStore::new(storage.clone());
        let kept = update(EntityType::Product, "p1", 1);
        queue.enqueue(kept.clone()).await.unwrap();

        storage.fail_writes.store(true, Ordering::SeqCst);
        let err = queue.enqueue(update(EntityType::Product, "p2", 2)).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Write { .. }));
        assert!(queue.remove(kept.id).await.is_err());

        let pending = queue.list_pending().await.unwrap();
        assert_eq!(pending, vec![kept]);
    }
}
