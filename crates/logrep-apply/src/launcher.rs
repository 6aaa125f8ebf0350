//! The launcher: keeps one leader running per enabled subscription.

use crate::config::ApplyConfig;
use crate::env::{stop_requested, ApplyEnv};
use crate::leader::run_leader;
use crate::slots::{LaunchRequest, WorkerKind};
use crate::types::Subscription;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How long shutdown waits for workers to leave their slots.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Reserves a slot for the leader of `sub` and spawns it. Returns false
/// when no slot is free.
pub fn launch_leader(env: &Arc<ApplyEnv>, sub: &Subscription) -> bool {
    let req = LaunchRequest {
        kind: WorkerKind::Leader,
        subid: sub.oid,
        dbid: sub.dbid,
        userid: sub.owner,
        relid: None,
        leader: None,
    };
    let Some(claim) = env.slots.launch(req) else {
        return false;
    };
    info!(
        "starting logical replication worker for subscription \"{}\"",
        sub.name
    );
    tokio::spawn(run_leader(env.clone(), claim, sub.oid));
    true
}

/// Supervisor of the leaders.
///
/// Each cycle lists the enabled subscriptions and starts a leader for every
/// one that has none, at most once per retry interval per subscription.
pub struct Launcher {
    env: Arc<ApplyEnv>,
    shutdown: watch::Receiver<bool>,
    reload: Option<watch::Receiver<ApplyConfig>>,
    nap_time: Duration,
    retry_interval: Duration,
}

impl Launcher {
    /// A launcher that runs until `shutdown` turns true.
    pub fn new(env: Arc<ApplyEnv>, shutdown: watch::Receiver<bool>) -> Self {
        let nap_time = env.config.nap_time();
        let retry_interval = env.config.retry_interval();
        Self {
            env,
            shutdown,
            reload: None,
            nap_time,
            retry_interval,
        }
    }

    /// Takes the nap time and retry interval from reloaded configurations.
    pub fn with_reload(mut self, reload: watch::Receiver<ApplyConfig>) -> Self {
        self.reload = Some(reload);
        self
    }

    /// One pass over the catalog. Returns how long to sleep before the next.
    pub fn scan(&self) -> Duration {
        let subs = self.env.catalog.subscriptions();
        let live: HashSet<_> = subs.iter().map(|s| s.oid).collect();
        self.env.retain_start_times(|subid| live.contains(&subid));

        let mut wait = self.nap_time;
        for sub in subs.iter().filter(|s| s.enabled) {
            if self.env.slots.find(sub.oid, None, false).is_some() {
                continue;
            }
            let now = Instant::now();
            let elapsed = self
                .env
                .last_start_time(sub.oid)
                .map(|last| now.duration_since(last));
            match elapsed {
                Some(elapsed) if elapsed < self.retry_interval => {
                    wait = wait.min(self.retry_interval - elapsed);
                }
                _ => {
                    // Recorded even if the launch fails, to back off.
                    self.env.record_start_time(sub.oid, now);
                    if !launch_leader(&self.env, sub) {
                        wait = wait.min(self.retry_interval);
                    }
                }
            }
        }
        wait
    }

    fn apply_reload(&mut self) {
        let Some(reload) = self.reload.as_mut() else {
            return;
        };
        if !reload.has_changed().unwrap_or(false) {
            return;
        }
        let config = reload.borrow_and_update().clone();
        self.nap_time = config.nap_time();
        self.retry_interval = config.retry_interval();
        info!(
            nap_time_ms = self.nap_time.as_millis() as u64,
            retry_interval_ms = self.retry_interval.as_millis() as u64,
            "launcher configuration reloaded"
        );
    }

    /// Runs until shutdown, then stops every worker.
    pub async fn run(mut self) {
        info!("logical replication launcher started");
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.apply_reload();
            let wait = self.scan();
            debug!(wait_ms = wait.as_millis() as u64, "launcher sleeping");
            let env = self.env.clone();
            tokio::select! {
                biased;
                _ = stop_requested(&mut shutdown) => break,
                _ = env.launcher_woken() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        self.stop_all().await;
        info!("logical replication launcher shutting down");
    }

    /// Asks every leader and sync worker to stop and waits for their slots
    /// to empty. Leaders stop their own parallel appliers.
    async fn stop_all(&self) {
        for info in self.env.slots.snapshot() {
            if info.kind != WorkerKind::ParallelApply {
                self.env.slots.stop_slot(info.slot, info.generation);
            }
        }
        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        loop {
            let remaining = self.env.slots.snapshot().len();
            if remaining == 0 {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(remaining, "workers still running at shutdown");
                return;
            }
            self.env.slots.wait_for_change(deadline - now).await;
        }
    }
}
