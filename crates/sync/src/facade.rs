//! `OfflineSync`: the only surface the UI layer touches.

use std::sync::Arc;

use serde_json::Value;
use stockman_core::{ActionId, EntityType, Operation};
use tokio::sync::{Notify, watch};

use crate::action::{ActionRequest, FailedAction, QueuedAction};
use crate::config::SyncConfig;
use crate::dead_letter::DeadLetterStore;
use crate::error::{SyncError, SyncResult};
use crate::network::{ConnectivityProbe, ConnectivityTransition, LinkState, NetworkMonitor};
use crate::notify::{StatusHub, SyncSnapshot, Unsubscribe};
use crate::processor::{DirectDelivery, DrainOutcome, SyncProcessor};
use crate::queue::QueueStore;
use crate::remote::{RemoteApi, RemoteRecord};
use crate::storage::RecordStorage;
use crate::worker::{SyncWorker, SyncWorkerHandle};

/// Result of [`OfflineSync::submit`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The remote accepted the mutation directly.
    Delivered(RemoteRecord),
    /// The mutation was queued for later delivery.
    Queued(ActionId),
}

/// Offline sync engine handle.
///
/// Cheap to clone; all clones share the same stores and processor.
#[derive(Clone)]
pub struct OfflineSync {
    queue: Arc<QueueStore>,
    dead_letters: Arc<DeadLetterStore>,
    processor: Arc<SyncProcessor>,
    network: Arc<NetworkMonitor>,
    hub: Arc<StatusHub>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    trigger: Arc<Notify>,
    config: SyncConfig,
}

impl OfflineSync {
    /// Wire the engine over the given collaborators. Counts are empty until
    /// [`OfflineSync::refresh`] runs (see [`OfflineSync::open`]).
    pub fn new(
        storage: Arc<dyn RecordStorage>,
        remote: Arc<dyn RemoteApi>,
        network: Arc<NetworkMonitor>,
        config: SyncConfig,
    ) -> Self {
        let queue = Arc::new(QueueStore::new(storage.clone()));
        let dead_letters = Arc::new(DeadLetterStore::new(storage.clone()));
        let hub = Arc::new(StatusHub::new());
        hub.set_online(network.is_online());

        let processor = Arc::new(SyncProcessor::new(
            storage,
            queue.clone(),
            dead_letters.clone(),
            remote,
            network.clone(),
            hub.clone(),
            &config,
        ));

        Self {
            queue,
            dead_letters,
            processor,
            network,
            hub,
            probe: None,
            trigger: Arc::new(Notify::new()),
            config,
        }
    }

    /// Like [`OfflineSync::new`], then load persisted state.
    pub async fn open(
        storage: Arc<dyn RecordStorage>,
        remote: Arc<dyn RemoteApi>,
        network: Arc<NetworkMonitor>,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        let sync = Self::new(storage, remote, network, config);
        sync.refresh().await?;
        Ok(sync)
    }

    /// Build the default stack: SQLite storage, HTTP remote and HTTP health
    /// probe.
    #[cfg(feature = "http")]
    pub async fn from_config(config: SyncConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let storage = match &config.db_path {
            Some(path) => crate::storage::SqliteStorage::open(path),
            None => crate::storage::SqliteStorage::open_default()?,
        };
        let remote = Arc::new(crate::http::HttpRemote::from_config(&config)?);
        let network = Arc::new(NetworkMonitor::default());

        let sync = Self::open(Arc::new(storage), remote.clone(), network, config)
            .await
            .context("failed to load offline sync state")?;
        Ok(sync.with_probe(remote))
    }

    /// Active connectivity check used by the background worker.
    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub(crate) fn probe(&self) -> Option<&Arc<dyn ConnectivityProbe>> {
        self.probe.as_ref()
    }

    pub(crate) fn trigger(&self) -> &Arc<Notify> {
        &self.trigger
    }

    // -- live reads --

    pub fn pending_count(&self) -> usize {
        self.hub.snapshot().pending
    }

    pub fn failed_count(&self) -> usize {
        self.hub.snapshot().failed
    }

    pub fn failed_actions(&self) -> Vec<FailedAction> {
        self.hub.failed_actions()
    }

    pub fn is_online(&self) -> bool {
        self.network.is_online()
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.hub.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.hub.subscribe()
    }

    /// Pending actions in queue order.
    pub async fn pending_actions(&self) -> SyncResult<Vec<QueuedAction>> {
        Ok(self.queue.list_pending().await?)
    }

    /// Re-read counts, the dead-letter list and the last sync time from the
    /// stores.
    pub async fn refresh(&self) -> SyncResult<SyncSnapshot> {
        let pending = self.queue.len().await?;
        let failed = self.dead_letters.list().await?;
        let last_synced_at = self.processor.last_synced_at().await?;

        self.hub.set_failed(failed);
        self.hub.update(|s| {
            s.pending = pending;
            s.is_online = self.network.is_online();
            if last_synced_at.is_some() {
                s.last_synced_at = last_synced_at;
            }
        });
        Ok(self.hub.snapshot())
    }

    // -- connectivity --

    /// Feed a platform link report. Going online wakes the worker.
    pub fn update_link(&self, link: LinkState) -> Option<ConnectivityTransition> {
        let transition = self.network.update(link);
        if transition.is_some() {
            self.publish_online();
        }
        if transition == Some(ConnectivityTransition::WentOnline) {
            self.request_sync();
        }
        transition
    }

    pub(crate) fn publish_online(&self) {
        self.hub.set_online(self.network.is_online());
    }

    // -- mutations --

    pub async fn enqueue(&self, entity_type: EntityType, operation: Operation, payload: Value) -> SyncResult<ActionId> {
        self.enqueue_request(ActionRequest::new(entity_type, operation, payload))
            .await
    }

    /// Queue a mutation. Returns once the action is durably stored.
    ///
    /// Enqueueing an id that is already pending, delivered or dead-lettered
    /// does nothing.
    pub async fn enqueue_request(&self, request: ActionRequest) -> SyncResult<ActionId> {
        let action = request.build()?;
        let id = action.id;

        if self.admit(action).await? {
            self.request_sync();
        }
        Ok(id)
    }

    /// Deliver right away when possible, otherwise leave queued.
    ///
    /// The action is queued first and only sent directly if it heads its
    /// partition and nothing else is in flight for it, so ordering within the
    /// partition holds. A permanent rejection is returned to the caller and
    /// the action is dropped. A known id is not sent again.
    pub async fn submit(&self, request: ActionRequest) -> SyncResult<SubmitOutcome> {
        let action = self.queue.canonicalize(request.build()?).await?;
        let id = action.id;
        let partition = action.partition_key.clone();

        if !self.admit(action).await? || !self.network.is_online() {
            return Ok(SubmitOutcome::Queued(id));
        }

        match self.processor.deliver_direct(id, &partition).await? {
            DirectDelivery::Delivered(record) => {
                self.publish_pending().await;
                Ok(SubmitOutcome::Delivered(record))
            }
            DirectDelivery::Rejected(err) => {
                self.publish_pending().await;
                Err(SyncError::Rejected(err))
            }
            DirectDelivery::Deferred => {
                self.request_sync();
                Ok(SubmitOutcome::Queued(id))
            }
        }
    }

    /// Durably queue `action` unless its id is already known. Returns whether
    /// it was added.
    async fn admit(&self, action: QueuedAction) -> SyncResult<bool> {
        let id = action.id;
        let partition = action.partition_key.clone();

        if self.dead_letters.contains(id).await? || !self.queue.enqueue(action).await? {
            tracing::debug!(action_id = %id, "action already known; enqueue ignored");
            return Ok(false);
        }

        tracing::debug!(action_id = %id, partition = %partition, "action queued");
        self.publish_pending().await;
        Ok(true)
    }

    // -- dead letters --

    /// Move every failed action back to the queue and run a drain cycle.
    ///
    /// Returns the number of restored actions.
    pub async fn retry_all(&self) -> SyncResult<usize> {
        let restored = self.dead_letters.restore_all(&self.queue).await?;
        self.refresh().await?;
        if restored > 0 {
            self.drain_or_defer().await?;
        }
        Ok(restored)
    }

    /// Move one failed action back to the queue and run a drain cycle.
    pub async fn retry_failed(&self, id: ActionId) -> SyncResult<()> {
        if !self.dead_letters.restore(&self.queue, id).await? {
            return Err(SyncError::NotFound(id));
        }
        self.refresh().await?;
        self.drain_or_defer().await?;
        Ok(())
    }

    /// Discard a failed action permanently.
    pub async fn dismiss_failed(&self, id: ActionId) -> SyncResult<()> {
        if !self.dead_letters.dismiss(id).await? {
            return Err(SyncError::NotFound(id));
        }
        self.hub.set_failed(self.dead_letters.list().await?);
        Ok(())
    }

    /// Subscribe to dead-letter changes; `callback` gets the full list.
    pub fn on_permanent_failure<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&[FailedAction]) + Send + Sync + 'static,
    {
        self.hub.on_permanent_failure(callback)
    }

    // -- draining --

    /// Run a drain cycle now.
    pub async fn sync_now(&self) -> SyncResult<DrainOutcome> {
        self.processor.drain().await
    }

    /// Ask the background worker for a drain cycle.
    pub fn request_sync(&self) {
        self.trigger.notify_one();
    }

    /// Spawn the background worker.
    pub fn start_worker(&self) -> SyncWorkerHandle {
        SyncWorker::new(self.clone()).start()
    }

    async fn drain_or_defer(&self) -> SyncResult<()> {
        if let DrainOutcome::Skipped(reason) = self.processor.drain().await? {
            // A running cycle may not see the restored actions.
            tracing::debug!(?reason, "drain skipped; deferring to worker");
            self.request_sync();
        }
        Ok(())
    }

    async fn publish_pending(&self) {
        match self.queue.len().await {
            Ok(pending) => self.hub.set_pending(pending),
            Err(err) => tracing::error!(error = %err, "failed to count pending actions"),
        }
    }
}
