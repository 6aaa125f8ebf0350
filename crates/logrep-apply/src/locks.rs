//! Session-level heavyweight lock table.
//!
//! Locks here are owned by a worker ([`ProcId`]) rather than by a local
//! transaction, so they survive commits until explicitly released or until
//! the worker exits and calls [`LockManager::release_all`]. Waiting is async.
//! Whenever a worker is about to wait, the wait-for graph is searched for a
//! cycle through it; if one exists that worker is the victim and gets
//! [`ApplyError::DeadlockDetected`].
//!
//! The apply workers use two lock categories per remote transaction (see
//! [`LockCategory`]) so that a leader waiting on a parallel applier, or an
//! applier waiting for the next stream chunk, shows up as a graph edge.

use crate::error::{ApplyError, Result};
use crate::types::{Oid, ProcId, TransactionId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Table-level lock modes with the usual conflict matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockMode {
    /// Readers.
    AccessShare = 1,
    /// SELECT FOR UPDATE.
    RowShare = 2,
    /// Writers.
    RowExclusive = 3,
    /// VACUUM-like maintenance.
    ShareUpdateExclusive = 4,
    /// CREATE INDEX.
    Share = 5,
    /// Exclusive against writers and other share-row-exclusive holders.
    ShareRowExclusive = 6,
    /// Blocks everything except readers.
    Exclusive = 7,
    /// Blocks everything.
    AccessExclusive = 8,
}

impl LockMode {
    const fn bit(self) -> u16 {
        1 << (self as u16)
    }

    fn conflict_mask(self) -> u16 {
        use LockMode::*;
        match self {
            AccessShare => AccessExclusive.bit(),
            RowShare => Exclusive.bit() | AccessExclusive.bit(),
            RowExclusive => {
                Share.bit() | ShareRowExclusive.bit() | Exclusive.bit() | AccessExclusive.bit()
            }
            ShareUpdateExclusive => {
                ShareUpdateExclusive.bit()
                    | Share.bit()
                    | ShareRowExclusive.bit()
                    | Exclusive.bit()
                    | AccessExclusive.bit()
            }
            Share => {
                RowExclusive.bit()
                    | ShareUpdateExclusive.bit()
                    | ShareRowExclusive.bit()
                    | Exclusive.bit()
                    | AccessExclusive.bit()
            }
            ShareRowExclusive => {
                RowExclusive.bit()
                    | ShareUpdateExclusive.bit()
                    | Share.bit()
                    | ShareRowExclusive.bit()
                    | Exclusive.bit()
                    | AccessExclusive.bit()
            }
            Exclusive => {
                RowShare.bit()
                    | RowExclusive.bit()
                    | ShareUpdateExclusive.bit()
                    | Share.bit()
                    | ShareRowExclusive.bit()
                    | Exclusive.bit()
                    | AccessExclusive.bit()
            }
            AccessExclusive => 0b1_1111_1110,
        }
    }

    /// True if a holder of `self` blocks a requester of `other`.
    pub fn conflicts_with(self, other: LockMode) -> bool {
        self.conflict_mask() & other.bit() != 0
    }
}

/// The two per-transaction lock categories used between a leader and its
/// parallel appliers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockCategory {
    /// Held by the leader between chunks of a streamed transaction.
    Stream = 0,
    /// Held by the parallel applier for the whole remote transaction.
    Transaction = 1,
}

/// What is being locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockTag {
    /// A local relation.
    Relation {
        /// Local relation oid.
        relid: Oid,
    },
    /// A single row.
    Tuple {
        /// Local relation oid.
        relid: Oid,
        /// Row identifier.
        tid: u64,
    },
    /// A remote transaction being applied by subscription `subid`.
    ApplyTransaction {
        /// Subscription oid.
        subid: Oid,
        /// Remote toplevel xid.
        xid: TransactionId,
        /// Stream or transaction lock.
        category: LockCategory,
    },
}

impl fmt::Display for LockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTag::Relation { relid } => write!(f, "relation {relid}"),
            LockTag::Tuple { relid, tid } => write!(f, "tuple {tid} of relation {relid}"),
            LockTag::ApplyTransaction {
                subid,
                xid,
                category,
            } => write!(
                f,
                "remote transaction {xid} of subscription {subid} ({category:?})"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    proc: ProcId,
    mode: LockMode,
    count: u32,
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    proc: ProcId,
    mode: LockMode,
}

#[derive(Debug, Default)]
struct LockTable {
    locks: HashMap<LockTag, Vec<Holder>>,
    /// Waiters per tag in arrival order.
    queues: HashMap<LockTag, VecDeque<Waiter>>,
    waiting: HashMap<ProcId, (LockTag, LockMode)>,
    /// Granted on release to a queued waiter that has not woken up yet.
    handed: HashSet<(ProcId, LockTag, LockMode)>,
}

impl LockTable {
    fn holds_any(&self, proc: ProcId, tag: &LockTag) -> bool {
        self.locks
            .get(tag)
            .is_some_and(|holders| holders.iter().any(|h| h.proc == proc))
    }

    fn conflicting_holders(&self, proc: ProcId, tag: &LockTag, mode: LockMode) -> Vec<ProcId> {
        self.locks
            .get(tag)
            .map(|holders| {
                holders
                    .iter()
                    .filter(|h| h.proc != proc && h.mode.conflicts_with(mode))
                    .map(|h| h.proc)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Queued waiters ahead of `proc` (all of them if `proc` is not queued)
    /// whose requests conflict with `mode`. A worker already holding the tag
    /// is not ordered behind anyone, or it could wait on itself.
    fn conflicting_waiters_ahead(&self, proc: ProcId, tag: &LockTag, mode: LockMode) -> Vec<ProcId> {
        if self.holds_any(proc, tag) {
            return Vec::new();
        }
        self.queues
            .get(tag)
            .map(|queue| {
                queue
                    .iter()
                    .take_while(|w| w.proc != proc)
                    .filter(|w| w.mode.conflicts_with(mode))
                    .map(|w| w.proc)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn grantable(&self, proc: ProcId, tag: &LockTag, mode: LockMode) -> bool {
        self.conflicting_holders(proc, tag, mode).is_empty()
            && self.conflicting_waiters_ahead(proc, tag, mode).is_empty()
    }

    fn grant(&mut self, proc: ProcId, tag: LockTag, mode: LockMode) {
        let holders = self.locks.entry(tag).or_default();
        match holders.iter_mut().find(|h| h.proc == proc && h.mode == mode) {
            Some(h) => h.count += 1,
            None => holders.push(Holder {
                proc,
                mode,
                count: 1,
            }),
        }
    }

    fn enqueue(&mut self, proc: ProcId, tag: LockTag, mode: LockMode) {
        self.queues.entry(tag).or_default().push_back(Waiter { proc, mode });
        self.waiting.insert(proc, (tag, mode));
    }

    fn dequeue(&mut self, proc: ProcId, tag: &LockTag) {
        self.waiting.remove(&proc);
        if let Some(queue) = self.queues.get_mut(tag) {
            queue.retain(|w| w.proc != proc);
            if queue.is_empty() {
                self.queues.remove(tag);
            }
        }
    }

    /// Drops one acquisition of `tag` in `mode` held by `proc`.
    fn release_one(&mut self, proc: ProcId, tag: &LockTag, mode: LockMode) -> Result<()> {
        let holders = self
            .locks
            .get_mut(tag)
            .ok_or_else(|| not_held(proc, tag, mode))?;
        let idx = holders
            .iter()
            .position(|h| h.proc == proc && h.mode == mode)
            .ok_or_else(|| not_held(proc, tag, mode))?;
        holders[idx].count -= 1;
        if holders[idx].count == 0 {
            holders.swap_remove(idx);
        }
        if holders.is_empty() {
            self.locks.remove(tag);
        }
        Ok(())
    }

    /// Grants queued requests on `tag` in arrival order. A waiter is granted
    /// when it conflicts neither with a holder nor with an earlier waiter that
    /// stays queued. Returns true if anyone was granted.
    fn wakeup(&mut self, tag: LockTag) -> bool {
        let Some(queue) = self.queues.remove(&tag) else {
            return false;
        };
        let mut still: VecDeque<Waiter> = VecDeque::new();
        let mut granted = false;
        for w in queue {
            let behind = !self.holds_any(w.proc, &tag)
                && still.iter().any(|e| e.mode.conflicts_with(w.mode));
            if behind || !self.conflicting_holders(w.proc, &tag, w.mode).is_empty() {
                still.push_back(w);
                continue;
            }
            self.grant(w.proc, tag, w.mode);
            self.waiting.remove(&w.proc);
            self.handed.insert((w.proc, tag, w.mode));
            granted = true;
        }
        if !still.is_empty() {
            self.queues.insert(tag, still);
        }
        granted
    }

    /// Workers that `proc` currently waits for: conflicting holders and
    /// conflicting waiters queued ahead of it.
    fn blockers(&self, proc: ProcId) -> Vec<ProcId> {
        let Some((tag, mode)) = self.waiting.get(&proc) else {
            return Vec::new();
        };
        let mut blockers = self.conflicting_holders(proc, tag, *mode);
        blockers.extend(self.conflicting_waiters_ahead(proc, tag, *mode));
        blockers
    }

    /// Returns a wait cycle starting and ending at `start`, if there is one.
    fn find_cycle(&self, start: ProcId) -> Option<Vec<ProcId>> {
        let mut visited = HashSet::new();
        let mut path = vec![start];
        if self.dfs(start, start, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs(
        &self,
        start: ProcId,
        at: ProcId,
        visited: &mut HashSet<ProcId>,
        path: &mut Vec<ProcId>,
    ) -> bool {
        for next in self.blockers(at) {
            if next == start {
                path.push(next);
                return true;
            }
            if visited.insert(next) {
                path.push(next);
                if self.dfs(start, next, visited, path) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }
}

/// Leaves the queue if a lock wait is cancelled, and gives back a lock that
/// was handed over after the waiter stopped listening.
struct WaitGuard<'a> {
    manager: &'a LockManager,
    proc: ProcId,
    tag: LockTag,
    mode: LockMode,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        let mut table = self.manager.table.lock();
        if table.handed.remove(&(self.proc, self.tag, self.mode)) {
            if let Err(err) = table.release_one(self.proc, &self.tag, self.mode) {
                warn!(proc = %self.proc, tag = %self.tag, error = %err, "could not give back lock of cancelled wait");
            }
        } else {
            table.dequeue(self.proc, &self.tag);
        }
        let woke = table.wakeup(self.tag);
        drop(table);
        if woke {
            self.manager.released.notify_waiters();
        }
    }
}

/// Process-wide lock manager shared by every worker.
///
/// Conflicting requests queue per tag in arrival order. A release hands the
/// lock to the queue head instead of letting the next caller race for it,
/// and a new request that conflicts with a queued one waits behind it.
#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Notify,
}

impl LockManager {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires `tag` in `mode` for `proc`, waiting as long as needed.
    ///
    /// Re-acquiring a held lock bumps its reference count; each acquisition
    /// needs its own [`LockManager::unlock`].
    pub async fn lock(&self, proc: ProcId, tag: LockTag, mode: LockMode) -> Result<()> {
        let mut guard: Option<WaitGuard<'_>> = None;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut table = self.table.lock();
                if guard.is_some() {
                    if table.handed.remove(&(proc, tag, mode)) {
                        drop(table);
                        if let Some(g) = guard.take() {
                            std::mem::forget(g);
                        }
                        return Ok(());
                    }
                } else if table.grantable(proc, &tag, mode) {
                    table.grant(proc, tag, mode);
                    return Ok(());
                } else {
                    table.enqueue(proc, tag, mode);
                    if let Some(cycle) = table.find_cycle(proc) {
                        table.dequeue(proc, &tag);
                        let woke = table.wakeup(tag);
                        drop(table);
                        if woke {
                            self.released.notify_waiters();
                        }
                        let path: Vec<String> = cycle.iter().map(|p| p.to_string()).collect();
                        warn!(%proc, %tag, ?mode, cycle = %path.join(" -> "), "deadlock detected");
                        return Err(ApplyError::DeadlockDetected {
                            msg: format!(
                                "{proc} waits for {mode:?} on {tag}; wait cycle {}",
                                path.join(" -> ")
                            ),
                        });
                    }
                    debug!(%proc, %tag, ?mode, "waiting for lock");
                    guard = Some(WaitGuard {
                        manager: self,
                        proc,
                        tag,
                        mode,
                    });
                }
            }
            notified.await;
        }
    }

    /// Acquires without waiting; returns false if it would block.
    pub fn try_lock(&self, proc: ProcId, tag: LockTag, mode: LockMode) -> bool {
        let mut table = self.table.lock();
        if table.grantable(proc, &tag, mode) {
            table.grant(proc, tag, mode);
            true
        } else {
            false
        }
    }

    /// Releases one acquisition of `tag` in `mode`, handing the lock to
    /// queued waiters it no longer blocks.
    pub fn unlock(&self, proc: ProcId, tag: LockTag, mode: LockMode) -> Result<()> {
        let woke = {
            let mut table = self.table.lock();
            table.release_one(proc, &tag, mode)?;
            table.wakeup(tag)
        };
        if woke {
            self.released.notify_waiters();
        }
        Ok(())
    }

    /// Releases everything `proc` holds and leaves any queue it waits in.
    /// Returns the number of locks dropped.
    pub fn release_all(&self, proc: ProcId) -> usize {
        let mut released = 0;
        let woke = {
            let mut table = self.table.lock();
            let mut touched: Vec<LockTag> = Vec::new();
            if let Some((tag, _)) = table.waiting.get(&proc).copied() {
                table.dequeue(proc, &tag);
                touched.push(tag);
            }
            table.handed.retain(|(p, _, _)| *p != proc);
            table.locks.retain(|tag, holders| {
                let before = holders.len();
                holders.retain(|h| {
                    if h.proc == proc {
                        released += h.count as usize;
                        false
                    } else {
                        true
                    }
                });
                if holders.len() != before {
                    touched.push(*tag);
                }
                !holders.is_empty()
            });
            let mut woke = false;
            for tag in touched {
                woke |= table.wakeup(tag);
            }
            woke
        };
        if released > 0 {
            debug!(%proc, released, "released all session locks");
        }
        if woke {
            self.released.notify_waiters();
        }
        released
    }

    /// True if `proc` holds `tag` in exactly `mode`.
    pub fn holds(&self, proc: ProcId, tag: &LockTag, mode: LockMode) -> bool {
        self.table.lock().locks.get(tag).map_or(false, |holders| {
            holders.iter().any(|h| h.proc == proc && h.mode == mode)
        })
    }

    /// Current holders of `tag`.
    pub fn holders(&self, tag: &LockTag) -> Vec<(ProcId, LockMode)> {
        self.table
            .lock()
            .locks
            .get(tag)
            .map(|holders| holders.iter().map(|h| (h.proc, h.mode)).collect())
            .unwrap_or_default()
    }

    /// The lock `proc` is currently waiting for, if any.
    pub fn waiting_for(&self, proc: ProcId) -> Option<LockTag> {
        self.table.lock().waiting.get(&proc).map(|(tag, _)| *tag)
    }

    /// Number of locks held by `proc`, counting re-acquisitions.
    pub fn held_count(&self, proc: ProcId) -> usize {
        self.table
            .lock()
            .locks
            .values()
            .flatten()
            .filter(|h| h.proc == proc)
            .map(|h| h.count as usize)
            .sum()
    }
}

/// Locks taken on behalf of the current local transaction (relation and
/// row locks), released together when it commits or aborts.
#[derive(Debug, Default)]
pub struct XactLocks {
    held: Vec<(LockTag, LockMode)>,
}

impl XactLocks {
    /// Acquires `tag` in `mode` until [`XactLocks::release`].
    pub async fn acquire(
        &mut self,
        locks: &LockManager,
        proc: ProcId,
        tag: LockTag,
        mode: LockMode,
    ) -> Result<()> {
        if self.held.contains(&(tag, mode)) {
            return Ok(());
        }
        locks.lock(proc, tag, mode).await?;
        self.held.push((tag, mode));
        Ok(())
    }

    /// Releases everything acquired so far.
    pub fn release(&mut self, locks: &LockManager, proc: ProcId) {
        for (tag, mode) in self.held.drain(..) {
            // Fails only if a release_all already dropped it.
            if let Err(err) = locks.unlock(proc, tag, mode) {
                warn!(%proc, %tag, ?mode, error = %err, "transaction lock already released");
            }
        }
    }

    /// Number of locks held.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// True if nothing is held.
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

fn not_held(proc: ProcId, tag: &LockTag, mode: LockMode) -> ApplyError {
    ApplyError::invalid_state(format!("{proc} does not hold {mode:?} on {tag}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    const A: ProcId = ProcId(1);
    const B: ProcId = ProcId(2);
    const C: ProcId = ProcId(3);

    fn stream(xid: TransactionId) -> LockTag {
        LockTag::ApplyTransaction {
            subid: 16394,
            xid,
            category: LockCategory::Stream,
        }
    }

    fn xact(xid: TransactionId) -> LockTag {
        LockTag::ApplyTransaction {
            subid: 16394,
            xid,
            category: LockCategory::Transaction,
        }
    }

    mod conflicts {
        use super::*;

        #[test]
        fn test_matrix_is_symmetric() {
            let all = [
                LockMode::AccessShare,
                LockMode::RowShare,
                LockMode::RowExclusive,
                LockMode::ShareUpdateExclusive,
                LockMode::Share,
                LockMode::ShareRowExclusive,
                LockMode::Exclusive,
                LockMode::AccessExclusive,
            ];
            for a in all {
                for b in all {
                    assert_eq!(a.conflicts_with(b), b.conflicts_with(a), "{a:?} vs {b:?}");
                }
            }
        }

        #[test]
        fn test_known_pairs() {
            assert!(!LockMode::AccessShare.conflicts_with(LockMode::RowExclusive));
            assert!(!LockMode::RowExclusive.conflicts_with(LockMode::RowExclusive));
            assert!(LockMode::AccessExclusive.conflicts_with(LockMode::AccessShare));
            assert!(LockMode::Share.conflicts_with(LockMode::RowExclusive));
        }
    }

    #[tokio::test]
    async fn test_refcounted_acquire_release() {
        let lm = LockManager::new();
        lm.lock(A, stream(1), LockMode::AccessExclusive).await.unwrap();
        lm.lock(A, stream(1), LockMode::AccessExclusive).await.unwrap();
        assert_eq!(lm.held_count(A), 2);
        lm.unlock(A, stream(1), LockMode::AccessExclusive).unwrap();
        assert!(lm.holds(A, &stream(1), LockMode::AccessExclusive));
        lm.unlock(A, stream(1), LockMode::AccessExclusive).unwrap();
        assert!(lm.holders(&stream(1)).is_empty());
        assert!(lm.unlock(A, stream(1), LockMode::AccessExclusive).is_err());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let lm = Arc::new(LockManager::new());
        lm.lock(A, xact(7), LockMode::AccessExclusive).await.unwrap();
        assert!(!lm.try_lock(B, xact(7), LockMode::AccessShare));

        let lm2 = lm.clone();
        let waiter = tokio::spawn(async move {
            lm2.lock(B, xact(7), LockMode::AccessShare).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(lm.waiting_for(B), Some(xact(7)));

        lm.unlock(A, xact(7), LockMode::AccessExclusive).unwrap();
        waiter.await.unwrap().unwrap();
        assert!(lm.holds(B, &xact(7), LockMode::AccessShare));
        assert_eq!(lm.waiting_for(B), None);
    }

    #[tokio::test]
    async fn test_leader_applier_cycle_is_detected() {
        // Applier A holds the transaction lock and waits for the next chunk
        // (stream lock held by leader B). The leader then waits for the
        // applier to finish: B closes the cycle and is the victim.
        let lm = Arc::new(LockManager::new());
        lm.lock(A, xact(400), LockMode::AccessExclusive).await.unwrap();
        lm.lock(B, stream(400), LockMode::AccessExclusive).await.unwrap();

        let lm2 = lm.clone();
        let applier = tokio::spawn(async move {
            lm2.lock(A, stream(400), LockMode::AccessShare).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = lm.lock(B, xact(400), LockMode::AccessShare).await.unwrap_err();
        assert!(matches!(err, ApplyError::DeadlockDetected { .. }));

        assert_eq!(lm.release_all(B), 1);
        applier.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_three_party_cycle() {
        let lm = Arc::new(LockManager::new());
        let r = |relid| LockTag::Relation { relid };
        lm.lock(A, r(1), LockMode::AccessExclusive).await.unwrap();
        lm.lock(B, r(2), LockMode::AccessExclusive).await.unwrap();
        lm.lock(C, r(3), LockMode::AccessExclusive).await.unwrap();

        let l1 = lm.clone();
        let t1 = tokio::spawn(async move { l1.lock(A, r(2), LockMode::AccessShare).await });
        let l2 = lm.clone();
        let t2 = tokio::spawn(async move { l2.lock(B, r(3), LockMode::AccessShare).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(lm.lock(C, r(1), LockMode::AccessShare).await.is_err());
        lm.release_all(C);
        t2.await.unwrap().unwrap();
        lm.release_all(B);
        t1.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_wait_leaves_no_edge() {
        let lm = LockManager::new();
        lm.lock(A, stream(1), LockMode::AccessExclusive).await.unwrap();
        let res = tokio::time::timeout(
            Duration::from_millis(20),
            lm.lock(B, stream(1), LockMode::AccessShare),
        )
        .await;
        assert!(res.is_err());
        assert_eq!(lm.waiting_for(B), None);
    }

    #[tokio::test]
    async fn test_own_locks_never_conflict() {
        let lm = LockManager::new();
        lm.lock(A, stream(5), LockMode::AccessExclusive).await.unwrap();
        lm.lock(A, stream(5), LockMode::AccessShare).await.unwrap();
        assert_eq!(lm.release_all(A), 2);
    }

    #[tokio::test]
    async fn test_xact_locks_release_together() {
        let lm = LockManager::new();
        let mut xl = XactLocks::default();
        let rel = LockTag::Relation { relid: 16400 };
        xl.acquire(&lm, A, rel, LockMode::RowExclusive).await.unwrap();
        xl.acquire(&lm, A, rel, LockMode::RowExclusive).await.unwrap();
        xl.acquire(&lm, A, LockTag::Tuple { relid: 16400, tid: 3 }, LockMode::Exclusive)
            .await
            .unwrap();
        assert_eq!(xl.len(), 2);
        lm.lock(A, stream(9), LockMode::AccessExclusive).await.unwrap();
        xl.release(&lm, A);
        assert!(xl.is_empty());
        assert_eq!(lm.held_count(A), 1);
    }

    #[tokio::test]
    async fn test_release_hands_lock_to_queued_waiter() {
        let lm = Arc::new(LockManager::new());
        lm.lock(A, stream(7), LockMode::AccessExclusive).await.unwrap();

        let lm2 = lm.clone();
        let applier = tokio::spawn(async move { lm2.lock(B, stream(7), LockMode::AccessShare).await });
        while lm.waiting_for(B).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The leader lets go between chunks and immediately asks again; the
        // queued applier must get the lock first.
        lm.unlock(A, stream(7), LockMode::AccessExclusive).unwrap();
        assert!(!lm.try_lock(A, stream(7), LockMode::AccessExclusive));
        assert!(lm.holds(B, &stream(7), LockMode::AccessShare));

        applier.await.unwrap().unwrap();
        assert_eq!(lm.waiting_for(B), None);
    }

    #[tokio::test]
    async fn test_compatible_request_queues_behind_conflicting_waiter() {
        let lm = Arc::new(LockManager::new());
        let rel = LockTag::Relation { relid: 16400 };
        lm.lock(A, rel, LockMode::AccessShare).await.unwrap();

        let lm2 = lm.clone();
        let writer = tokio::spawn(async move { lm2.lock(B, rel, LockMode::AccessExclusive).await });
        while lm.waiting_for(B).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Compatible with the holder, but would overtake the queued writer.
        assert!(!lm.try_lock(C, rel, LockMode::AccessShare));
        // A worker that already holds the tag is not ordered behind anyone.
        assert!(lm.try_lock(A, rel, LockMode::AccessShare));

        assert_eq!(lm.release_all(A), 2);
        writer.await.unwrap().unwrap();
        assert!(lm.holds(B, &rel, LockMode::AccessExclusive));
        assert!(!lm.try_lock(C, rel, LockMode::AccessShare));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_unblocks_the_queue() {
        let lm = Arc::new(LockManager::new());
        let rel = LockTag::Relation { relid: 16400 };
        lm.lock(A, rel, LockMode::AccessShare).await.unwrap();
        let res = tokio::time::timeout(
            Duration::from_millis(20),
            lm.lock(B, rel, LockMode::AccessExclusive),
        )
        .await;
        assert!(res.is_err());
        assert!(lm.try_lock(C, rel, LockMode::AccessShare));
    }

    #[tokio::test]
    async fn test_xact_locks_release_after_release_all() {
        let lm = LockManager::new();
        let mut xl = XactLocks::default();
        let rel = LockTag::Relation { relid: 16400 };
        xl.acquire(&lm, A, rel, LockMode::RowExclusive).await.unwrap();
        assert_eq!(lm.release_all(A), 1);

        // Already gone; logged and forgotten.
        xl.release(&lm, A);
        assert!(xl.is_empty());
        assert_eq!(lm.held_count(A), 0);
        assert!(lm.unlock(A, rel, LockMode::RowExclusive).is_err());
    }
}
