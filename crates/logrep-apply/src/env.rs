//! Process-wide collaborators shared by the launcher and every worker.

use crate::catalog::Catalog;
use crate::config::ApplyConfig;
use crate::conflict::ConflictLog;
use crate::locks::LockManager;
use crate::origin::OriginRegistry;
use crate::slots::WorkerSlots;
use crate::storage::StorageEngine;
use crate::types::{Oid, ProcId};
use crate::upstream::PublisherConnector;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Notify};

/// Everything a worker needs besides its own state.
///
/// One instance exists per engine; workers hold it behind an `Arc`.
pub struct ApplyEnv {
    /// Engine configuration.
    pub config: ApplyConfig,
    /// Subscription catalog.
    pub catalog: Arc<dyn Catalog>,
    /// Local storage engine.
    pub storage: Arc<dyn StorageEngine>,
    /// Opens replication connections to publishers.
    pub connector: Arc<dyn PublisherConnector>,
    /// Relation, row and remote-transaction locks.
    pub locks: Arc<LockManager>,
    /// Replication origins.
    pub origins: Arc<OriginRegistry>,
    /// Worker slot array.
    pub slots: Arc<WorkerSlots>,
    /// Conflicts seen by any worker.
    pub conflicts: Arc<ConflictLog>,
    launcher_wakeup: Notify,
    next_proc: AtomicU32,
    last_start_times: DashMap<Oid, Instant>,
}

impl std::fmt::Debug for ApplyEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyEnv")
            .field("config", &self.config)
            .field("next_proc", &self.next_proc)
            .finish_non_exhaustive()
    }
}

impl ApplyEnv {
    /// Builds the environment; slots are sized from `config`.
    pub fn new(
        config: ApplyConfig,
        catalog: Arc<dyn Catalog>,
        storage: Arc<dyn StorageEngine>,
        connector: Arc<dyn PublisherConnector>,
    ) -> Arc<Self> {
        let slots = Arc::new(WorkerSlots::new(&config));
        Arc::new(Self {
            config,
            catalog,
            storage,
            connector,
            locks: Arc::new(LockManager::new()),
            origins: Arc::new(OriginRegistry::new()),
            slots,
            conflicts: Arc::new(ConflictLog::default()),
            launcher_wakeup: Notify::new(),
            next_proc: AtomicU32::new(1),
            last_start_times: DashMap::new(),
        })
    }

    /// A fresh worker identity.
    pub fn alloc_proc(&self) -> ProcId {
        ProcId(self.next_proc.fetch_add(1, Ordering::Relaxed))
    }

    /// Wakes the launcher so it rescans subscriptions now.
    pub fn wake_launcher(&self) {
        self.launcher_wakeup.notify_one();
    }

    /// Resolves on the next [`ApplyEnv::wake_launcher`].
    pub async fn launcher_woken(&self) {
        self.launcher_wakeup.notified().await
    }

    /// When the launcher last started a leader for `subid`.
    pub fn last_start_time(&self, subid: Oid) -> Option<Instant> {
        self.last_start_times.get(&subid).map(|t| *t)
    }

    /// Records a leader start attempt for `subid`.
    pub fn record_start_time(&self, subid: Oid, at: Instant) {
        self.last_start_times.insert(subid, at);
    }

    /// Lets the launcher restart the leader of `subid` without backoff.
    pub fn forget_worker_start_time(&self, subid: Oid) {
        self.last_start_times.remove(&subid);
    }

    /// Drops start times of subscriptions that no longer exist.
    pub fn retain_start_times(&self, live: impl Fn(Oid) -> bool) {
        self.last_start_times.retain(|subid, _| live(*subid));
    }
}

/// Resolves once the worker owning `stop` is asked to stop, or its slot is
/// gone.
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_requested_fires_on_signal_and_on_drop() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move {
            stop_requested(&mut rx).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), stop_requested(&mut rx))
            .await
            .unwrap();
    }
}
