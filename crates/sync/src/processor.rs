//! Drain cycles: replay pending actions against the remote API.
//!
//! A cycle takes the head of every ready partition and runs each partition as
//! its own task. Within a partition actions are delivered strictly in order
//! and at most one call is in flight; a partition stops at its first failure.
//! Heads that wait for a pending create elsewhere are picked up in a later
//! round of the same cycle, once that create delivered and its server id was
//! written into them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use stockman_core::{ActionId, Operation};
use tokio::task::JoinSet;

use crate::action::{IdRemap, PartitionKey, QueuedAction};
use crate::config::SyncConfig;
use crate::dead_letter::DeadLetterStore;
use crate::error::SyncError;
use crate::network::NetworkMonitor;
use crate::notify::{StatusHub, SyncPhase};
use crate::queue::QueueStore;
use crate::remote::{RemoteApi, RemoteError, RemoteRecord, dispatch};
use crate::retry::RetryPolicy;
use crate::storage::{PersistenceError, RecordStorage, load_json, store_json};

/// Storage key of the last successful delivery time.
pub const LAST_SYNC_KEY: &str = "last_sync_time";

/// Why a drain request did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyRunning,
    Offline,
}

/// Counters of one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    /// Partitions skipped because their head is backing off.
    pub deferred: usize,
    /// Local persistence failures (the affected actions stay pending).
    pub errors: usize,
}

impl DrainReport {
    fn absorb(&mut self, other: DrainReport) {
        self.delivered += other.delivered;
        self.requeued += other.requeued;
        self.dead_lettered += other.dead_lettered;
        self.deferred += other.deferred;
        self.errors += other.errors;
    }

    /// Whether anything in the cycle did not go through.
    pub fn has_failures(&self) -> bool {
        self.requeued + self.dead_lettered + self.errors > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed(DrainReport),
    Skipped(SkipReason),
}

impl DrainOutcome {
    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            DrainOutcome::Completed(report) => Some(report),
            DrainOutcome::Skipped(_) => None,
        }
    }
}

/// Partitions with a remote call in flight, shared by drain cycles and
/// direct submits.
#[derive(Debug, Default)]
struct InFlight {
    partitions: Mutex<HashSet<PartitionKey>>,
}

impl InFlight {
    fn partitions(&self) -> MutexGuard<'_, HashSet<PartitionKey>> {
        self.partitions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// `None` if another call for `key` is in flight.
    fn claim(self: &Arc<Self>, key: &PartitionKey) -> Option<PartitionClaim> {
        if !self.partitions().insert(key.clone()) {
            return None;
        }
        Some(PartitionClaim {
            owner: self.clone(),
            key: key.clone(),
        })
    }
}

/// Exclusive right to call the remote for one partition; released on drop.
struct PartitionClaim {
    owner: Arc<InFlight>,
    key: PartitionKey,
}

impl Drop for PartitionClaim {
    fn drop(&mut self) {
        self.owner.partitions().remove(&self.key);
    }
}

/// Result of delivering one action.
enum Step {
    Delivered { partition: PartitionKey },
    Requeued,
    DeadLettered,
    Failed,
}

/// Result of [`SyncProcessor::deliver_direct`].
#[derive(Debug)]
pub(crate) enum DirectDelivery {
    Delivered(RemoteRecord),
    /// Permanently refused; the action was dropped from the queue.
    Rejected(RemoteError),
    /// Left in the queue for a drain cycle.
    Deferred,
}

/// What one partition task did, and where it had to stop.
struct PartitionRun {
    report: DrainReport,
    stopped: Option<PartitionKey>,
}

impl PartitionRun {
    fn stopped_at(report: DrainReport, partition: PartitionKey) -> Self {
        Self {
            report,
            stopped: Some(partition),
        }
    }
}

/// Everything a partition task needs; cheap to clone into spawned tasks.
#[derive(Clone)]
struct Delivery {
    queue: Arc<QueueStore>,
    dead_letters: Arc<DeadLetterStore>,
    remote: Arc<dyn RemoteApi>,
    in_flight: Arc<InFlight>,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl Delivery {
    /// Walk one partition from `head` until it empties or an action fails.
    ///
    /// Only actions enqueued before `cycle_started` are taken.
    async fn run_partition(self, head: QueuedAction, cycle_started: DateTime<Utc>) -> PartitionRun {
        let mut report = DrainReport::default();
        let mut next = Some(head);

        while let Some(action) = next.take() {
            let key = action.partition_key.clone();
            let Some(_claim) = self.in_flight.claim(&key) else {
                tracing::debug!(partition = %key, "partition busy; deferred");
                report.deferred += 1;
                return PartitionRun::stopped_at(report, key);
            };

            let partition = match self.deliver(action).await {
                Step::Delivered { partition } => {
                    report.delivered += 1;
                    partition
                }
                Step::Requeued => {
                    report.requeued += 1;
                    return PartitionRun::stopped_at(report, key);
                }
                Step::DeadLettered => {
                    report.dead_lettered += 1;
                    return PartitionRun::stopped_at(report, key);
                }
                Step::Failed => {
                    report.errors += 1;
                    return PartitionRun::stopped_at(report, key);
                }
            };

            match self.queue.ready_head(&partition, Utc::now()).await {
                Ok(Some(head)) if head.enqueued_at <= cycle_started => next = Some(head),
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(partition = %partition, error = %err, "failed to read next action");
                    report.errors += 1;
                    return PartitionRun::stopped_at(report, partition);
                }
            }
        }

        PartitionRun { report, stopped: None }
    }

    async fn call(&self, action: &QueuedAction) -> Result<RemoteRecord, RemoteError> {
        match tokio::time::timeout(self.request_timeout, dispatch(self.remote.as_ref(), action)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::transient(format!(
                "request timed out after {:?}",
                self.request_timeout
            ))),
        }
    }

    async fn deliver(&self, action: QueuedAction) -> Step {
        tracing::debug!(
            action_id = %action.id,
            partition = %action.partition_key,
            attempt = action.attempts + 1,
            "delivering action"
        );

        match self.call(&action).await {
            Ok(record) => self.acknowledge(action, record).await,
            Err(RemoteError::Transient(message)) => self.handle_transient(action, message).await,
            Err(RemoteError::Permanent(message)) => self.dead_letter(action, message).await,
        }
    }

    async fn acknowledge(&self, action: QueuedAction, record: RemoteRecord) -> Step {
        let remap = server_id_remap(&action, &record);
        let partition = match &remap {
            Some(remap) => PartitionKey::new(action.entity_type, Some(&remap.server)),
            None => action.partition_key.clone(),
        };

        match self.queue.acknowledge(action.id, remap).await {
            Ok(_) => {
                tracing::debug!(action_id = %action.id, partition = %partition, "action delivered");
                Step::Delivered { partition }
            }
            Err(err) => {
                // Stays pending: the server may see this action again.
                tracing::error!(
                    action_id = %action.id,
                    error = %err,
                    "action delivered but could not be removed from the queue"
                );
                Step::Failed
            }
        }
    }

    async fn handle_transient(&self, mut action: QueuedAction, message: String) -> Step {
        let attempts = action.attempts.saturating_add(1);

        if !self.retry.has_attempts_left(attempts) {
            action.attempts = attempts;
            action.last_error = Some(message.clone());
            let reason = format!("gave up after {attempts} attempts: {message}");
            return self.dead_letter(action, reason).await;
        }

        let retry_at = self.retry.retry_at(attempts, Utc::now());
        tracing::debug!(
            action_id = %action.id,
            attempts,
            retry_at = ?retry_at,
            error = %message,
            "transient failure; action requeued"
        );

        match self.queue.requeue(action.id, attempts, Some(message), retry_at).await {
            Ok(_) => Step::Requeued,
            Err(err) => {
                tracing::error!(action_id = %action.id, error = %err, "failed to record failed attempt");
                Step::Failed
            }
        }
    }

    async fn dead_letter(&self, action: QueuedAction, reason: String) -> Step {
        let id = action.id;
        match self.dead_letters.promote(&self.queue, action, reason).await {
            Ok(_) => Step::DeadLettered,
            Err(err) => {
                tracing::error!(action_id = %id, error = %err, "failed to dead-letter action; it stays pending");
                Step::Failed
            }
        }
    }
}

/// Provisional id → server id rewrite for a delivered create.
fn server_id_remap(action: &QueuedAction, record: &RemoteRecord) -> Option<IdRemap> {
    if action.operation != Operation::Create || action.entity_type.is_singleton() {
        return None;
    }
    let provisional = action.target_id.clone()?;
    let server = record.server_id(action.entity_type)?;
    if server == provisional {
        return None;
    }
    Some(IdRemap {
        entity_type: action.entity_type,
        provisional,
        server,
    })
}

/// Clears the running flag when a cycle ends, even if it is cancelled.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs drain cycles; at most one at a time.
pub struct SyncProcessor {
    delivery: Delivery,
    storage: Arc<dyn RecordStorage>,
    network: Arc<NetworkMonitor>,
    hub: Arc<StatusHub>,
    max_partitions: usize,
    running: AtomicBool,
}

impl SyncProcessor {
    pub fn new(
        storage: Arc<dyn RecordStorage>,
        queue: Arc<QueueStore>,
        dead_letters: Arc<DeadLetterStore>,
        remote: Arc<dyn RemoteApi>,
        network: Arc<NetworkMonitor>,
        hub: Arc<StatusHub>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            delivery: Delivery {
                queue,
                dead_letters,
                remote,
                in_flight: Arc::new(InFlight::default()),
                retry: config.retry.clone(),
                request_timeout: config.request_timeout,
            },
            storage,
            network,
            hub,
            max_partitions: config.max_partitions_per_cycle.max(1),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one drain cycle.
    ///
    /// Returns immediately with [`DrainOutcome::Skipped`] if a cycle is already
    /// running or the device is offline. Remote failures never surface here;
    /// only a failure to read the queue does.
    pub async fn drain(&self) -> Result<DrainOutcome, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("drain already running; trigger ignored");
            return Ok(DrainOutcome::Skipped(SkipReason::AlreadyRunning));
        }
        let _guard = RunningGuard(&self.running);

        if !self.network.is_online() {
            tracing::debug!("offline; drain skipped");
            return Ok(DrainOutcome::Skipped(SkipReason::Offline));
        }

        let cycle_started = Utc::now();
        self.hub.set_phase(SyncPhase::Syncing);

        let mut report = match self.run_cycle(cycle_started).await {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(error = %err, "failed to read sync queue");
                self.hub.set_phase(SyncPhase::Error);
                return Err(err.into());
            }
        };

        if report.delivered > 0 {
            match store_json(self.storage.as_ref(), LAST_SYNC_KEY, &cycle_started).await {
                Ok(()) => self.hub.update(|s| s.last_synced_at = Some(cycle_started)),
                Err(err) => {
                    tracing::error!(error = %err, "failed to persist last sync time");
                    report.errors += 1;
                }
            }
        }

        self.publish(&report).await;

        tracing::info!(
            delivered = report.delivered,
            requeued = report.requeued,
            dead_lettered = report.dead_lettered,
            deferred = report.deferred,
            errors = report.errors,
            "sync cycle finished"
        );
        Ok(DrainOutcome::Completed(report))
    }

    async fn run_cycle(&self, cycle_started: DateTime<Utc>) -> Result<DrainReport, PersistenceError> {
        let queue = &self.delivery.queue;
        let mut report = DrainReport {
            deferred: queue.backing_off(cycle_started).await?,
            ..DrainReport::default()
        };
        let mut stopped: HashSet<PartitionKey> = HashSet::new();

        loop {
            let heads: Vec<QueuedAction> = queue
                .dequeue_batch(None, usize::MAX, Utc::now())
                .await?
                .into_iter()
                .filter(|head| head.enqueued_at <= cycle_started && !stopped.contains(&head.partition_key))
                .take(self.max_partitions)
                .collect();
            if heads.is_empty() {
                break;
            }
            tracing::debug!(partitions = heads.len(), "starting sync round");

            let mut tasks = JoinSet::new();
            for head in heads {
                tasks.spawn(self.delivery.clone().run_partition(head, cycle_started));
            }

            let mut delivered = 0;
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(run) => {
                        delivered += run.report.delivered;
                        report.absorb(run.report);
                        stopped.extend(run.stopped);
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "partition task failed");
                        report.errors += 1;
                    }
                }
            }

            // Another round only helps if a delivery unblocked a dependent head.
            if delivered == 0 {
                break;
            }
        }

        Ok(report)
    }

    /// Deliver the queued action `id` right away if it heads `partition` and
    /// no other call for that partition is in flight.
    ///
    /// Used for direct submits: a transient failure leaves the action queued
    /// with its attempt count untouched.
    pub(crate) async fn deliver_direct(
        &self,
        id: ActionId,
        partition: &PartitionKey,
    ) -> Result<DirectDelivery, PersistenceError> {
        let delivery = &self.delivery;
        let Some(_claim) = delivery.in_flight.claim(partition) else {
            return Ok(DirectDelivery::Deferred);
        };
        let action = match delivery.queue.ready_head(partition, Utc::now()).await? {
            Some(head) if head.id == id => head,
            _ => return Ok(DirectDelivery::Deferred),
        };

        match delivery.call(&action).await {
            Ok(record) => {
                let remap = server_id_remap(&action, &record);
                if let Err(err) = delivery.queue.acknowledge(id, remap).await {
                    tracing::error!(
                        action_id = %id,
                        error = %err,
                        "action delivered but could not be removed from the queue"
                    );
                }
                Ok(DirectDelivery::Delivered(record))
            }
            Err(RemoteError::Permanent(message)) => {
                if let Err(err) = delivery.queue.remove(id).await {
                    tracing::error!(action_id = %id, error = %err, "failed to drop rejected action");
                }
                Ok(DirectDelivery::Rejected(RemoteError::Permanent(message)))
            }
            Err(RemoteError::Transient(message)) => {
                tracing::info!(action_id = %id, error = %message, "direct delivery failed; left queued");
                Ok(DirectDelivery::Deferred)
            }
        }
    }

    /// Refresh counts and the dead-letter cache after a cycle.
    async fn publish(&self, report: &DrainReport) {
        match self.delivery.queue.len().await {
            Ok(pending) => self.hub.set_pending(pending),
            Err(err) => tracing::error!(error = %err, "failed to count pending actions"),
        }
        match self.delivery.dead_letters.list().await {
            Ok(failed) => self.hub.set_failed(failed),
            Err(err) => tracing::error!(error = %err, "failed to read dead letters"),
        }

        let phase = if report.has_failures() {
            SyncPhase::Error
        } else {
            SyncPhase::Synced
        };
        self.hub.set_phase(phase);
    }

    /// Last time a cycle delivered at least one action.
    pub async fn last_synced_at(&self) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        load_json(self.storage.as_ref(), LAST_SYNC_KEY).await
    }
}
