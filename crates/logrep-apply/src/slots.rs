//! Worker slot registry.
//!
//! A fixed array of slots, one per running (or launching) logical
//! replication worker, shared by the launcher, the leaders, their tablesync
//! workers and their parallel appliers. A slot is reserved by whoever
//! launches a worker and claimed by the worker itself when it starts
//! (`attach`). A reserved slot without a worker is "launching"; if nobody
//! attaches within the attach timeout the slot is reclaimed. Every reuse
//! bumps the slot's generation so stale handles can be told apart.

use crate::config::ApplyConfig;
use crate::error::{ApplyError, Result};
use crate::lsn::Lsn;
use crate::types::{now_timestamp, Oid, ProcId, RelState, TimestampTz};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

/// Kind of worker occupying a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    /// Leader apply worker of a subscription.
    Leader,
    /// Initial sync of one relation.
    TableSync,
    /// Parallel applier serving a leader.
    ParallelApply,
    /// Synchronizes every pending sequence of a subscription.
    SequenceSync,
}

impl WorkerKind {
    /// Table and sequence sync workers share one per-subscription cap.
    pub fn is_sync(self) -> bool {
        matches!(self, WorkerKind::TableSync | WorkerKind::SequenceSync)
    }

    /// Kinds addressed by `(subid, relid)` in [`WorkerSlots::find`].
    fn is_addressable(self) -> bool {
        matches!(self, WorkerKind::Leader | WorkerKind::TableSync)
    }
}

/// What to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Worker kind.
    pub kind: WorkerKind,
    /// Subscription.
    pub subid: Oid,
    /// Database.
    pub dbid: Oid,
    /// Subscription owner.
    pub userid: Oid,
    /// Relation, for tablesync workers.
    pub relid: Option<Oid>,
    /// Leader, for parallel appliers.
    pub leader: Option<ProcId>,
}

/// Snapshot of one slot.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    /// Slot number.
    pub slot: usize,
    /// Reuse counter.
    pub generation: u64,
    /// Worker kind.
    pub kind: WorkerKind,
    /// Running worker; `None` while launching.
    pub proc: Option<ProcId>,
    /// Subscription.
    pub subid: Oid,
    /// Database.
    pub dbid: Oid,
    /// Subscription owner.
    pub userid: Oid,
    /// Relation, for tablesync workers.
    pub relid: Option<Oid>,
    /// Leader, for parallel appliers.
    pub leader: Option<ProcId>,
    /// When the slot was reserved.
    pub launch_time: Instant,
    /// End LSN of the last chunk received.
    pub last_lsn: Lsn,
    /// Publisher send time of that chunk.
    pub last_send_time: TimestampTz,
    /// Local receive time of that chunk.
    pub last_recv_time: TimestampTz,
    /// Last LSN reported by a publisher keepalive.
    pub reply_lsn: Lsn,
    /// Time of that keepalive.
    pub reply_time: TimestampTz,
    /// In-memory sync state (tablesync workers).
    pub relstate: RelState,
    /// LSN of `relstate`.
    pub relstate_lsn: Lsn,
    /// Fileset shared with parallel appliers (leaders).
    pub stream_fileset: Option<PathBuf>,
}

impl WorkerInfo {
    /// True once the worker has attached.
    pub fn is_running(&self) -> bool {
        self.proc.is_some()
    }
}

#[derive(Debug)]
struct Slot {
    in_use: bool,
    info: WorkerInfo,
    stop: Option<watch::Sender<bool>>,
}

/// Handed to a newly spawned worker so it can attach to its slot.
#[derive(Debug)]
pub struct WorkerClaim {
    /// Slot number.
    pub slot: usize,
    /// Generation at reservation.
    pub generation: u64,
    /// Becomes true when the worker is asked to stop.
    pub stop: watch::Receiver<bool>,
}

/// The fixed slot array.
#[derive(Debug)]
pub struct WorkerSlots {
    slots: RwLock<Vec<Slot>>,
    changed: Notify,
    max_sync_per_subscription: usize,
    max_parallel_per_subscription: usize,
    attach_timeout: Duration,
}

impl WorkerSlots {
    /// Slots sized and capped per `config`.
    pub fn new(config: &ApplyConfig) -> Self {
        let now = Instant::now();
        let slots = (0..config.max_logical_replication_workers)
            .map(|slot| Slot {
                in_use: false,
                info: WorkerInfo {
                    slot,
                    generation: 0,
                    kind: WorkerKind::Leader,
                    proc: None,
                    subid: 0,
                    dbid: 0,
                    userid: 0,
                    relid: None,
                    leader: None,
                    launch_time: now,
                    last_lsn: Lsn::INVALID,
                    last_send_time: 0,
                    last_recv_time: 0,
                    reply_lsn: Lsn::INVALID,
                    reply_time: 0,
                    relstate: RelState::Unknown,
                    relstate_lsn: Lsn::INVALID,
                    stream_fileset: None,
                },
                stop: None,
            })
            .collect();
        Self {
            slots: RwLock::new(slots),
            changed: Notify::new(),
            max_sync_per_subscription: config.max_sync_workers_per_subscription,
            max_parallel_per_subscription: config.max_parallel_apply_workers_per_subscription,
            attach_timeout: config.attach_timeout(),
        }
    }

    /// Reserves a slot. Returns `None` when no slot is free or the
    /// per-subscription cap for the worker kind is reached.
    pub fn launch(&self, req: LaunchRequest) -> Option<WorkerClaim> {
        let mut slots = self.slots.write();
        let now = Instant::now();

        // Reclaim slots whose worker never showed up.
        for slot in slots.iter_mut() {
            if slot.in_use
                && slot.info.proc.is_none()
                && now.duration_since(slot.info.launch_time) > self.attach_timeout
            {
                warn!(
                    slot = slot.info.slot,
                    subid = slot.info.subid,
                    "worker did not attach within the timeout, releasing its slot"
                );
                slot.in_use = false;
                slot.stop = None;
            }
        }

        let count = |pred: fn(WorkerKind) -> bool| {
            slots
                .iter()
                .filter(|s| s.in_use && s.info.subid == req.subid && pred(s.info.kind))
                .count()
        };
        match req.kind {
            kind if kind.is_sync() && count(WorkerKind::is_sync) >= self.max_sync_per_subscription => {
                return None
            }
            WorkerKind::ParallelApply
                if count(|k| k == WorkerKind::ParallelApply) >= self.max_parallel_per_subscription =>
            {
                return None
            }
            _ => {}
        }

        let Some(slot) = slots.iter_mut().find(|s| !s.in_use) else {
            warn!(
                subid = req.subid,
                "out of logical replication worker slots; consider increasing max_logical_replication_workers"
            );
            return None;
        };
        let (tx, rx) = watch::channel(false);
        let info = &mut slot.info;
        info.generation += 1;
        info.kind = req.kind;
        info.proc = None;
        info.subid = req.subid;
        info.dbid = req.dbid;
        info.userid = req.userid;
        info.relid = req.relid;
        info.leader = req.leader;
        info.launch_time = now;
        info.last_lsn = Lsn::INVALID;
        info.last_send_time = 0;
        info.last_recv_time = 0;
        info.reply_lsn = Lsn::INVALID;
        info.reply_time = 0;
        info.relstate = RelState::Unknown;
        info.relstate_lsn = Lsn::INVALID;
        info.stream_fileset = None;
        slot.in_use = true;
        slot.stop = Some(tx);
        debug!(slot = info.slot, generation = info.generation, kind = ?req.kind, subid = req.subid, "reserved worker slot");
        Some(WorkerClaim {
            slot: info.slot,
            generation: info.generation,
            stop: rx,
        })
    }

    /// Claims a reserved slot for `proc`. The returned guard detaches on drop.
    pub fn attach(self: &Arc<Self>, claim: &WorkerClaim, proc: ProcId) -> Result<AttachedSlot> {
        {
            let mut slots = self.slots.write();
            let slot = slots
                .get_mut(claim.slot)
                .ok_or_else(|| ApplyError::invalid_state(format!("worker slot {} does not exist", claim.slot)))?;
            if !slot.in_use || slot.info.generation != claim.generation {
                return Err(ApplyError::PrerequisiteNotMet {
                    msg: format!(
                        "logical replication worker slot {} is empty, cannot attach",
                        claim.slot
                    ),
                });
            }
            if let Some(other) = slot.info.proc {
                return Err(ApplyError::invalid_state(format!(
                    "logical replication worker slot {} is already used by {other}",
                    claim.slot
                )));
            }
            slot.info.proc = Some(proc);
            slot.info.launch_time = Instant::now();
        }
        self.changed.notify_waiters();
        Ok(AttachedSlot {
            slots: self.clone(),
            slot: claim.slot,
            generation: claim.generation,
        })
    }

    /// Frees a slot if it still holds `generation`.
    pub fn detach(&self, slot: usize, generation: u64) {
        {
            let mut slots = self.slots.write();
            if let Some(s) = slots.get_mut(slot) {
                if s.in_use && s.info.generation == generation {
                    s.in_use = false;
                    s.info.proc = None;
                    s.stop = None;
                }
            }
        }
        self.changed.notify_waiters();
    }

    /// The leader (`relid = None`) or tablesync worker of a subscription.
    pub fn find(&self, subid: Oid, relid: Option<Oid>, only_running: bool) -> Option<WorkerInfo> {
        self.slots
            .read()
            .iter()
            .find(|s| {
                s.in_use
                    && s.info.kind.is_addressable()
                    && s.info.subid == subid
                    && s.info.relid == relid
                    && (!only_running || s.info.proc.is_some())
            })
            .map(|s| s.info.clone())
    }

    /// The sequence sync worker of a subscription, launching or running.
    pub fn find_sequencesync(&self, subid: Oid) -> Option<WorkerInfo> {
        self.slots
            .read()
            .iter()
            .find(|s| s.in_use && s.info.kind == WorkerKind::SequenceSync && s.info.subid == subid)
            .map(|s| s.info.clone())
    }

    /// The slot of a running worker.
    pub fn find_by_proc(&self, proc: ProcId) -> Option<WorkerInfo> {
        self.slots
            .read()
            .iter()
            .find(|s| s.in_use && s.info.proc == Some(proc))
            .map(|s| s.info.clone())
    }

    /// Every in-use slot of a subscription.
    pub fn subscription_workers(&self, subid: Oid) -> Vec<WorkerInfo> {
        self.slots
            .read()
            .iter()
            .filter(|s| s.in_use && s.info.subid == subid)
            .map(|s| s.info.clone())
            .collect()
    }

    /// Every in-use slot.
    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        self.slots
            .read()
            .iter()
            .filter(|s| s.in_use)
            .map(|s| s.info.clone())
            .collect()
    }

    /// Table and sequence sync workers of a subscription, launching ones
    /// included.
    pub fn count_sync(&self, subid: Oid) -> usize {
        self.slots
            .read()
            .iter()
            .filter(|s| s.in_use && s.info.subid == subid && s.info.kind.is_sync())
            .count()
    }

    /// Parallel appliers of a subscription, launching ones included.
    pub fn count_parallel(&self, subid: Oid) -> usize {
        self.count_kind(subid, WorkerKind::ParallelApply)
    }

    fn count_kind(&self, subid: Oid, kind: WorkerKind) -> usize {
        self.slots
            .read()
            .iter()
            .filter(|s| s.in_use && s.info.subid == subid && s.info.kind == kind)
            .count()
    }

    /// Sets the in-memory sync state of the tablesync worker for `relid`.
    pub fn set_relstate(&self, subid: Oid, relid: Oid, state: RelState, lsn: Lsn) -> bool {
        let found = {
            let mut slots = self.slots.write();
            match slots.iter_mut().find(|s| {
                s.in_use && s.info.kind == WorkerKind::TableSync && s.info.subid == subid && s.info.relid == Some(relid)
            }) {
                Some(s) => {
                    s.info.relstate = state;
                    s.info.relstate_lsn = lsn;
                    true
                }
                None => false,
            }
        };
        if found {
            self.changed.notify_waiters();
        }
        found
    }

    /// Records the latest chunk received by the worker in `slot`.
    pub fn update_stats(&self, slot: usize, last_lsn: Lsn, send_time: TimestampTz, reply: bool) {
        let mut slots = self.slots.write();
        if let Some(s) = slots.get_mut(slot) {
            let now = now_timestamp();
            s.info.last_lsn = last_lsn;
            s.info.last_send_time = send_time;
            s.info.last_recv_time = now;
            if reply {
                s.info.reply_lsn = last_lsn;
                s.info.reply_time = send_time;
            }
        }
    }

    /// Publishes the leader's spool fileset location.
    pub fn set_stream_fileset(&self, slot: usize, dir: Option<PathBuf>) {
        if let Some(s) = self.slots.write().get_mut(slot) {
            s.info.stream_fileset = dir;
        }
    }

    /// Asks the leader or tablesync worker to stop. Returns whether one was found.
    pub fn stop(&self, subid: Oid, relid: Option<Oid>) -> bool {
        let slots = self.slots.read();
        let mut found = false;
        for s in slots.iter().filter(|s| {
            s.in_use && s.info.kind.is_addressable() && s.info.subid == subid && s.info.relid == relid
        }) {
            if let Some(tx) = &s.stop {
                let _ = tx.send(true);
                found = true;
            }
        }
        found
    }

    /// Asks every worker of a subscription to stop.
    pub fn stop_subscription(&self, subid: Oid) {
        for s in self.slots.read().iter().filter(|s| s.in_use && s.info.subid == subid) {
            if let Some(tx) = &s.stop {
                let _ = tx.send(true);
            }
        }
    }

    /// Asks the worker in `slot` to stop.
    pub fn stop_slot(&self, slot: usize, generation: u64) {
        if let Some(s) = self.slots.read().get(slot) {
            if s.in_use && s.info.generation == generation {
                if let Some(tx) = &s.stop {
                    let _ = tx.send(true);
                }
            }
        }
    }

    /// Whether `slot` is still held at `generation`.
    pub fn is_alive(&self, slot: usize, generation: u64) -> bool {
        self.slots
            .read()
            .get(slot)
            .is_some_and(|s| s.in_use && s.info.generation == generation)
    }

    /// Waits until any slot changes or `timeout` passes.
    pub async fn wait_for_change(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.changed.notified()).await;
    }

    /// Wakes everyone waiting in [`WorkerSlots::wait_for_change`].
    pub fn notify_change(&self) {
        self.changed.notify_waiters();
    }
}

/// An attached slot; detaches when dropped.
#[derive(Debug)]
pub struct AttachedSlot {
    slots: Arc<WorkerSlots>,
    slot: usize,
    generation: u64,
}

impl AttachedSlot {
    /// Slot number.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Generation at attach.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The registry.
    pub fn slots(&self) -> &Arc<WorkerSlots> {
        &self.slots
    }
}

impl Drop for AttachedSlot {
    fn drop(&mut self) {
        self.slots.detach(self.slot, self.generation);
    }
}
