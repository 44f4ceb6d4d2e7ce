//! Background worker that drives drain cycles.
//!
//! Wakes up on connectivity transitions, manual triggers
//! ([`OfflineSync::request_sync`]) and a periodic poll that catches anything
//! the event-driven paths missed.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::facade::OfflineSync;
use crate::network::ConnectivityState;
use crate::processor::DrainOutcome;

/// Background sync worker.
pub struct SyncWorker {
    sync: OfflineSync,
    shutdown: Arc<Notify>,
}

/// Handle to a running [`SyncWorker`].
pub struct SyncWorkerHandle {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl SyncWorkerHandle {
    /// Request graceful shutdown of the worker.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Shut down and wait for the worker to exit.
    pub async fn stop(self) {
        self.shutdown();
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "sync worker task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl SyncWorker {
    pub fn new(sync: OfflineSync) -> Self {
        Self {
            sync,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Start the background sync worker.
    ///
    /// The spawned task:
    /// - drains when connectivity is restored
    /// - drains on every manual trigger
    /// - on each poll tick, probes connectivity (if a probe is configured),
    ///   refreshes counts and drains when online
    pub fn start(self) -> SyncWorkerHandle {
        let shutdown = self.shutdown.clone();
        let sync = self.sync;
        let stop = shutdown.clone();

        let task = tokio::spawn(async move {
            tracing::info!("background sync worker started");

            let mut poll = tokio::time::interval(sync.config().poll_interval);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let mut connectivity = sync.network().subscribe();
            let trigger = sync.trigger().clone();

            loop {
                tokio::select! {
                    _ = stop.notified() => {
                        tracing::info!("background sync worker received shutdown signal");
                        break;
                    }
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *connectivity.borrow_and_update();
                        sync.publish_online();
                        if state == ConnectivityState::Online {
                            Self::drain(&sync, "connectivity restored").await;
                        }
                    }
                    _ = trigger.notified() => {
                        Self::drain(&sync, "sync requested").await;
                    }
                    _ = poll.tick() => {
                        if let Some(probe) = sync.probe() {
                            let link = probe.check().await;
                            sync.update_link(link);
                        }
                        if let Err(err) = sync.refresh().await {
                            tracing::warn!(error = %err, "failed to refresh sync status");
                        }
                        if sync.is_online() {
                            Self::drain(&sync, "poll").await;
                        }
                    }
                }
            }

            tracing::info!("background sync worker stopped");
        });

        SyncWorkerHandle { shutdown, task }
    }

    async fn drain(sync: &OfflineSync, cause: &'static str) {
        match sync.sync_now().await {
            Ok(DrainOutcome::Completed(report)) => {
                tracing::debug!(cause, delivered = report.delivered, "worker drain completed");
            }
            Ok(DrainOutcome::Skipped(reason)) => {
                tracing::debug!(cause, ?reason, "worker drain skipped");
            }
            Err(err) => {
                tracing::warn!(cause, error = %err, "worker drain failed");
            }
        }
    }
}
