//! Parallel apply of large streamed transactions.
//!
//! With `streaming = parallel`, the leader hands each streamed remote
//! transaction to a parallel applier as soon as its first chunk arrives,
//! instead of spooling it until commit. Appliers come from a small pool;
//! each has a data queue fed by the leader, an error queue it reports
//! failures on, and a [`ParallelShared`] block both sides update.
//!
//! Two remote-transaction locks order the pair. The applier holds the
//! transaction lock while it applies; the leader takes it briefly at
//! commit, which both waits for the applier and lets the lock manager see
//! leader/applier deadlocks. The leader holds the stream lock between
//! chunks; an applier that has drained every chunk waits on it until the
//! next chunk (or the end of the transaction) arrives.
//!
//! If the leader cannot push a message into a busy applier's queue within
//! the send timeout, it stops using the queue for that transaction and
//! spools the rest to a file the applier replays ("partial serialize").

use crate::apply::ApplyWorker;
use crate::config::StreamingDebugMode;
use crate::env::{stop_requested, ApplyEnv};
use crate::error::{ApplyError, ErrorResponse, Result};
use crate::locks::{LockCategory, LockMode, LockTag};
use crate::lsn::Lsn;
use crate::origin::OriginId;
use crate::proto::XLOG_DATA_HEADER_SIZE;
use crate::queue::{message_queue, QueueReceiver, QueueSender, RecvResult, SendResult};
use crate::slots::{LaunchRequest, WorkerClaim, WorkerKind};
use crate::spool::{FileSet, SpoolReader};
use crate::types::{
    origin_name_for_subscription, savepoint_name, Oid, ProcId, Subscription, TransactionId, INVALID_XID,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How often waits on an applier re-check its error queue.
const ERROR_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Idle wait of an applier between messages.
const APPLIER_NAPTIME: Duration = Duration::from_millis(1000);

/// How long a stopping leader waits for each of its appliers to exit.
const APPLIER_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Progress of the remote transaction an applier is working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum XactState {
    /// Assigned, not yet started by the applier.
    Unknown,
    /// The applier holds the transaction lock.
    Started,
    /// Committed, prepared or aborted.
    Finished,
}

/// State of the spool file the leader writes after switching to partial
/// serialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FileSetState {
    /// Nothing spooled.
    Empty,
    /// The leader is still writing.
    SerializeInProgress,
    /// The leader has written the end of the transaction.
    SerializeDone,
    /// The applier has drained its queue and can replay the file.
    Ready,
}

#[derive(Debug)]
struct SharedInner {
    xid: TransactionId,
    xact_state: XactState,
    fileset_state: FileSetState,
    fileset: Option<Arc<FileSet>>,
    last_commit_end: Lsn,
}

/// State shared by a leader and one of its parallel appliers.
#[derive(Debug)]
pub struct ParallelShared {
    inner: Mutex<SharedInner>,
    pending_stream_count: AtomicU32,
}

impl Default for ParallelShared {
    fn default() -> Self {
        Self::new()
    }
}

impl ParallelShared {
    /// Idle state.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SharedInner {
                xid: INVALID_XID,
                xact_state: XactState::Unknown,
                fileset_state: FileSetState::Empty,
                fileset: None,
                last_commit_end: Lsn::INVALID,
            }),
            pending_stream_count: AtomicU32::new(0),
        }
    }

    /// Remote transaction currently assigned.
    pub fn xid(&self) -> TransactionId {
        self.inner.lock().xid
    }

    /// Assigns a new remote transaction.
    pub fn assign(&self, xid: TransactionId) {
        let mut inner = self.inner.lock();
        inner.xid = xid;
        inner.xact_state = XactState::Unknown;
    }

    /// Transaction progress.
    pub fn xact_state(&self) -> XactState {
        self.inner.lock().xact_state
    }

    /// Updates transaction progress.
    pub fn set_xact_state(&self, state: XactState) {
        self.inner.lock().xact_state = state;
    }

    /// Spool state.
    pub fn fileset_state(&self) -> FileSetState {
        self.inner.lock().fileset_state
    }

    /// Updates spool state; the fileset is published along with it.
    pub fn set_fileset_state(&self, state: FileSetState, fileset: Option<Arc<FileSet>>) {
        let mut inner = self.inner.lock();
        inner.fileset_state = state;
        if fileset.is_some() {
            inner.fileset = fileset;
        }
    }

    /// The leader's fileset, once partial serialize started.
    pub fn fileset(&self) -> Option<Arc<FileSet>> {
        self.inner.lock().fileset.clone()
    }

    /// Local end of the applier's last commit.
    pub fn last_commit_end(&self) -> Lsn {
        self.inner.lock().last_commit_end
    }

    /// Records the local end of a commit.
    pub fn set_last_commit_end(&self, lsn: Lsn) {
        self.inner.lock().last_commit_end = lsn;
    }

    /// Chunks sent but not yet fully applied.
    pub fn pending_stream_count(&self) -> u32 {
        self.pending_stream_count.load(Ordering::Acquire)
    }

    /// One more chunk sent.
    pub fn add_pending_stream(&self) -> u32 {
        self.pending_stream_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// One chunk applied; returns the remaining count.
    pub fn sub_pending_stream(&self) -> u32 {
        self.pending_stream_count.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

/// The leader's handle on one pooled applier.
#[derive(Debug)]
pub(crate) struct ApplierHandle {
    id: u64,
    pub(crate) shared: Arc<ParallelShared>,
    data: QueueSender,
    errors: Option<QueueReceiver>,
    slot: usize,
    generation: u64,
    pub(crate) in_use: bool,
    pub(crate) serialize_changes: bool,
    task: Option<JoinHandle<()>>,
}

/// The leader's pool of appliers and which remote transaction each runs.
#[derive(Debug, Default)]
pub(crate) struct ApplierPool {
    members: Vec<ApplierHandle>,
    by_xid: HashMap<TransactionId, u64>,
    next_id: u64,
}

impl ApplierPool {
    /// The applier running `xid`.
    pub(crate) fn get(&self, xid: TransactionId) -> Option<&ApplierHandle> {
        let id = self.by_xid.get(&xid)?;
        self.members.iter().find(|m| m.id == *id)
    }

    fn get_mut(&mut self, xid: TransactionId) -> Option<&mut ApplierHandle> {
        let id = *self.by_xid.get(&xid)?;
        self.members.iter_mut().find(|m| m.id == id)
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn idle_member(&self) -> Option<u64> {
        self.members.iter().find(|m| !m.in_use).map(|m| m.id)
    }

    fn bind(&mut self, xid: TransactionId, id: u64) -> Result<()> {
        if self.by_xid.contains_key(&xid) {
            return Err(ApplyError::HashCorruption {
                msg: format!("parallel apply transaction {xid} is already assigned"),
            });
        }
        self.by_xid.insert(xid, id);
        Ok(())
    }

    fn remove(&mut self, id: u64) -> Option<ApplierHandle> {
        let pos = self.members.iter().position(|m| m.id == id)?;
        Some(self.members.remove(pos))
    }
}

/// Everything a parallel applier is started with.
pub(crate) struct ApplierSetup {
    pub(crate) shared: Arc<ParallelShared>,
    pub(crate) leader: ProcId,
    pub(crate) leader_origin: OriginId,
    pub(crate) sub: Subscription,
    pub(crate) data: QueueReceiver,
    pub(crate) errors: QueueSender,
}

/// Per-applier state held by the worker itself.
#[derive(Debug)]
pub(crate) struct ApplierContext {
    pub(crate) shared: Arc<ParallelShared>,
    pub(crate) leader: ProcId,
    /// Subtransactions with a savepoint, in order.
    pub(crate) subxacts: Vec<TransactionId>,
    data: QueueReceiver,
    errors: QueueSender,
}

fn stream_lock(subid: Oid, xid: TransactionId) -> LockTag {
    LockTag::ApplyTransaction {
        subid,
        xid,
        category: LockCategory::Stream,
    }
}

fn transaction_lock(subid: Oid, xid: TransactionId) -> LockTag {
    LockTag::ApplyTransaction {
        subid,
        xid,
        category: LockCategory::Transaction,
    }
}

impl ApplyWorker {
    pub(crate) async fn pa_lock_stream(&self, xid: TransactionId, mode: LockMode) -> Result<()> {
        self.env
            .locks
            .lock(self.proc, stream_lock(self.sub.oid, xid), mode)
            .await
    }

    pub(crate) fn pa_unlock_stream(&self, xid: TransactionId, mode: LockMode) -> Result<()> {
        self.env
            .locks
            .unlock(self.proc, stream_lock(self.sub.oid, xid), mode)
    }

    pub(crate) async fn pa_lock_transaction(&self, xid: TransactionId, mode: LockMode) -> Result<()> {
        self.env
            .locks
            .lock(self.proc, transaction_lock(self.sub.oid, xid), mode)
            .await
    }

    pub(crate) fn pa_unlock_transaction(&self, xid: TransactionId, mode: LockMode) -> Result<()> {
        self.env
            .locks
            .unlock(self.proc, transaction_lock(self.sub.oid, xid), mode)
    }

    // ------------------------------------------------------------------
    // Leader side
    // ------------------------------------------------------------------

    /// Whether a new streamed transaction may go to a parallel applier.
    ///
    /// Only the leader starts appliers, only when parallel streaming was
    /// negotiated, no skip LSN is set (skipping happens in the leader) and
    /// every relation is READY (appliers cannot coordinate with tablesync).
    fn pa_can_start(&mut self) -> Result<bool> {
        if self.kind != WorkerKind::Leader {
            return Ok(false);
        }
        self.maybe_reread_subscription()?;
        if !self.parallel_apply || self.sub.skip_lsn.is_valid() {
            return Ok(false);
        }
        Ok(self.all_tablesyncs_ready())
    }

    fn pa_launch(&mut self) -> Option<u64> {
        let req = LaunchRequest {
            kind: WorkerKind::ParallelApply,
            subid: self.sub.oid,
            dbid: self.sub.dbid,
            userid: self.sub.owner,
            relid: None,
            leader: Some(self.proc),
        };
        let claim = self.env.slots.launch(req)?;
        let (data_tx, data_rx) = message_queue(self.env.config.queue_size_bytes);
        let (error_tx, error_rx) = message_queue(self.env.config.error_queue_size_bytes);
        let shared = Arc::new(ParallelShared::new());
        let setup = ApplierSetup {
            shared: shared.clone(),
            leader: self.proc,
            leader_origin: self.origin,
            sub: self.sub.clone(),
            data: data_rx,
            errors: error_tx,
        };
        let (slot, generation) = (claim.slot, claim.generation);
        let task = tokio::spawn(run_applier(self.env.clone(), claim, setup));

        let id = self.pool.next_id;
        self.pool.next_id += 1;
        self.pool.members.push(ApplierHandle {
            id,
            shared,
            data: data_tx,
            errors: Some(error_rx),
            slot,
            generation,
            in_use: false,
            serialize_changes: false,
            task: Some(task),
        });
        debug!(slot, generation, "launched parallel apply worker");
        Some(id)
    }

    /// Assigns streamed transaction `xid` to an applier, reusing an idle
    /// one or launching a new one. Without one the transaction is spooled.
    pub(crate) fn pa_allocate_worker(&mut self, xid: TransactionId) -> Result<()> {
        if !self.pa_can_start()? {
            return Ok(());
        }
        let id = match self.pool.idle_member() {
            Some(id) => id,
            None => match self.pa_launch() {
                Some(id) => id,
                None => return Ok(()),
            },
        };
        self.pool.bind(xid, id)?;
        if let Some(handle) = self.pool.members.iter_mut().find(|m| m.id == id) {
            handle.shared.assign(xid);
            handle.in_use = true;
            handle.serialize_changes = false;
        }
        Ok(())
    }

    /// Pushes one `'w'` chunk to the applier running `xid`.
    ///
    /// Returns false when the queue stayed full for the whole send timeout
    /// (or immediate mode is forced); the caller then switches to partial
    /// serialize.
    pub(crate) async fn pa_send_data(&mut self, xid: TransactionId, data: Bytes) -> Result<bool> {
        if self.env.config.debug_logical_replication_streaming == StreamingDebugMode::Immediate {
            return Ok(false);
        }
        let retry = self.env.config.send_retry_interval();
        let timeout = self.env.config.send_timeout().saturating_sub(retry);
        let mut started: Option<Instant> = None;
        loop {
            {
                let handle = self
                    .pool
                    .get(xid)
                    .ok_or_else(|| ApplyError::invalid_state(format!("no parallel apply worker for transaction {xid}")))?;
                match handle.data.try_send(data.clone()) {
                    SendResult::Success => return Ok(true),
                    SendResult::Detached => {
                        return Err(ApplyError::connection(
                            "could not send data to shared-memory queue",
                        ))
                    }
                    SendResult::WouldBlock => {}
                }
                handle.data.wait_writable(retry).await;
            }
            self.poll_parallel_errors()?;
            match started {
                None => started = Some(Instant::now()),
                Some(t) if t.elapsed() >= timeout => return Ok(false),
                Some(_) => {}
            }
        }
    }

    /// Stops sending `xid` through the queue and spools the rest instead.
    /// `stream_locked` says whether the stream lock is already held.
    pub(crate) async fn pa_switch_to_partial_serialize(
        &mut self,
        xid: TransactionId,
        stream_locked: bool,
    ) -> Result<()> {
        info!(
            subscription = %self.sub.name,
            "logical replication apply worker will serialize the remaining changes of remote transaction {xid} to a file"
        );
        let fileset = self.spool.fileset()?;
        let shared = {
            let handle = self
                .pool
                .get_mut(xid)
                .ok_or_else(|| ApplyError::invalid_state(format!("no parallel apply worker for transaction {xid}")))?;
            handle.serialize_changes = true;
            handle.shared.clone()
        };
        self.spool.open(xid, true)?;
        if !stream_locked {
            self.pa_lock_stream(xid, LockMode::AccessExclusive).await?;
        }
        self.env
            .slots
            .set_stream_fileset(self.slot.slot(), Some(fileset.dir().to_path_buf()));
        shared.set_fileset_state(FileSetState::SerializeInProgress, Some(fileset));
        Ok(())
    }

    /// Marks the partial spool of `xid` complete.
    pub(crate) fn pa_set_serialize_done(&self, xid: TransactionId) {
        if let Some(handle) = self.pool.get(xid) {
            handle
                .shared
                .set_fileset_state(FileSetState::SerializeDone, self.spool.existing_fileset());
        }
    }

    async fn pa_wait_for_xact_state(&self, shared: &ParallelShared, state: XactState) -> Result<()> {
        while shared.xact_state() < state {
            self.poll_parallel_errors()?;
            tokio::time::sleep(ERROR_POLL_INTERVAL).await;
        }
        Ok(())
    }

    /// Waits for the applier of `xid` to finish the transaction.
    async fn pa_wait_for_xact_finish(&self, xid: TransactionId, shared: &ParallelShared) -> Result<()> {
        // The applier must hold the transaction lock before we ask for it.
        self.pa_wait_for_xact_state(shared, XactState::Started).await?;

        let locks = self.env.locks.clone();
        let tag = transaction_lock(self.sub.oid, xid);
        let lock = locks.lock(self.proc, tag, LockMode::AccessShare);
        tokio::pin!(lock);
        loop {
            tokio::select! {
                r = &mut lock => {
                    r?;
                    break;
                }
                _ = tokio::time::sleep(ERROR_POLL_INTERVAL * 10) => self.poll_parallel_errors()?,
            }
        }
        self.pa_unlock_transaction(xid, LockMode::AccessShare)?;

        // The lock is also released when the applier dies.
        if shared.xact_state() != XactState::Finished {
            self.poll_parallel_errors()?;
            return Err(ApplyError::connection(
                "lost connection to the logical replication parallel apply worker",
            ));
        }
        Ok(())
    }

    /// Ends the leader's part in `xid`: releases the stream lock, waits for
    /// the applier to finish, records the flush position of `remote_lsn`
    /// (unless invalid, as for aborts) and returns the applier to the pool.
    pub(crate) async fn pa_xact_finish(&mut self, xid: TransactionId, remote_lsn: Lsn) -> Result<()> {
        let shared = self
            .pool
            .get(xid)
            .map(|h| h.shared.clone())
            .ok_or_else(|| ApplyError::invalid_state(format!("no parallel apply worker for transaction {xid}")))?;
        self.pa_unlock_stream(xid, LockMode::AccessExclusive)?;
        self.pa_wait_for_xact_finish(xid, &shared).await?;
        if remote_lsn.is_valid() {
            self.store_flush_position(remote_lsn, shared.last_commit_end());
        }
        self.pa_free_worker(xid)
    }

    /// Unbinds `xid`. The applier is stopped if it went through partial
    /// serialize (its queue may hold a half-written message) or if more
    /// than half the pool cap would stay idle; otherwise it is kept.
    fn pa_free_worker(&mut self, xid: TransactionId) -> Result<()> {
        let id = self
            .pool
            .by_xid
            .remove(&xid)
            .ok_or_else(|| ApplyError::invalid_state(format!("no parallel apply worker for transaction {xid}")))?;
        let retention = self.env.config.parallel_pool_retention();
        let pool_len = self.pool.len();
        let Some(handle) = self.pool.members.iter_mut().find(|m| m.id == id) else {
            return Ok(());
        };
        if !handle.serialize_changes && pool_len <= retention {
            handle.in_use = false;
            handle.serialize_changes = false;
            return Ok(());
        }
        let serialized = handle.serialize_changes;
        if let Some(handle) = self.pool.remove(id) {
            self.stop_applier(handle);
        }
        if serialized {
            self.spool.cleanup(xid)?;
        }
        Ok(())
    }

    fn stop_applier(&self, mut handle: ApplierHandle) -> Option<JoinHandle<()>> {
        self.env.slots.stop_slot(handle.slot, handle.generation);
        debug!(slot = handle.slot, "stopping parallel apply worker");
        handle.errors = None;
        handle.task.take()
    }

    /// Rethrows the first error any applier reported.
    pub(crate) fn poll_parallel_errors(&self) -> Result<()> {
        for member in &self.pool.members {
            let Some(errors) = &member.errors else {
                continue;
            };
            match errors.try_recv() {
                RecvResult::Message(bytes) => {
                    return Err(ErrorResponse::decode(&bytes)?.into_leader_error());
                }
                RecvResult::Detached => {
                    return Err(ApplyError::connection(
                        "lost connection to the logical replication parallel apply worker",
                    ));
                }
                RecvResult::WouldBlock => {}
            }
        }
        Ok(())
    }

    /// Stops every applier. Error queues are detached first so exiting
    /// appliers are not mistaken for failures.
    pub(crate) async fn stop_parallel_appliers(&mut self) {
        for member in &mut self.pool.members {
            member.errors = None;
        }
        self.pool.by_xid.clear();
        let members = std::mem::take(&mut self.pool.members);
        let mut tasks = Vec::with_capacity(members.len());
        for handle in members {
            if let Some(task) = self.stop_applier(handle) {
                tasks.push(task);
            }
        }
        for task in tasks {
            if tokio::time::timeout(APPLIER_EXIT_TIMEOUT, task).await.is_err() {
                warn!(subscription = %self.sub.name, "parallel apply worker did not exit in time");
            }
        }
    }

    // ------------------------------------------------------------------
    // Applier side
    // ------------------------------------------------------------------

    pub(crate) fn applier_ctx(&self) -> Result<&ApplierContext> {
        self.applier
            .as_ref()
            .ok_or_else(|| ApplyError::invalid_state("not a parallel apply worker"))
    }

    /// Defines a savepoint the first time subtransaction `subxid` shows up.
    pub(crate) fn pa_start_subtrans(&mut self, subxid: TransactionId, top_xid: TransactionId) -> Result<()> {
        let known = self
            .applier_ctx()?
            .subxacts
            .contains(&subxid);
        if subxid == top_xid || known {
            return Ok(());
        }
        let name = savepoint_name(self.sub.oid, subxid);
        debug!(savepoint = %name, "defining savepoint in logical replication parallel apply worker");
        let local = self.ensure_local_xact();
        self.env.storage.savepoint(local, &name)?;
        if let Some(ctx) = self.applier.as_mut() {
            ctx.subxacts.push(subxid);
        }
        Ok(())
    }

    /// Rolls back to the savepoint of `subxid` and forgets it and every
    /// later one. An empty subtransaction has no savepoint.
    pub(crate) fn pa_rollback_subtrans(&mut self, subxid: TransactionId) -> Result<()> {
        let pos = self
            .applier_ctx()?
            .subxacts
            .iter()
            .rposition(|x| *x == subxid);
        let Some(pos) = pos else {
            return Ok(());
        };
        let name = savepoint_name(self.sub.oid, subxid);
        debug!(savepoint = %name, "rolling back to savepoint in logical replication parallel apply worker");
        if let Some(local) = self.local_xact {
            self.env.storage.rollback_to_savepoint(local, &name)?;
        }
        if let Some(ctx) = self.applier.as_mut() {
            ctx.subxacts.truncate(pos);
        }
        Ok(())
    }

    pub(crate) fn pa_reset_subtrans(&mut self) {
        if let Some(ctx) = self.applier.as_mut() {
            ctx.subxacts.clear();
        }
    }

    /// After a chunk: if the leader has sent nothing further, wait on the
    /// stream lock until it does.
    pub(crate) async fn pa_decr_and_wait_stream_block(&mut self) -> Result<()> {
        let shared = self.applier_ctx()?.shared.clone();
        if shared.pending_stream_count() == 0 {
            // Blocks replayed from a spool file were never counted.
            if shared.fileset_state() != FileSetState::Empty {
                return Ok(());
            }
            return Err(ApplyError::invalid_state("invalid pending streaming chunk 0"));
        }
        if shared.sub_pending_stream() == 0 {
            let xid = shared.xid();
            self.pa_lock_stream(xid, LockMode::AccessShare).await?;
            self.pa_unlock_stream(xid, LockMode::AccessShare)?;
        }
        Ok(())
    }

    /// Moves the partial spool along; returns false when there is none.
    async fn pa_process_spooled_messages_if_required(&mut self) -> Result<bool> {
        let shared = self.applier_ctx()?.shared.clone();
        let mut state = shared.fileset_state();
        if state == FileSetState::Empty {
            return Ok(false);
        }
        // Wait for the leader to finish writing rather than for its next
        // STREAM STOP, which could otherwise deadlock.
        if state == FileSetState::SerializeInProgress {
            let xid = shared.xid();
            self.pa_lock_stream(xid, LockMode::AccessShare).await?;
            self.pa_unlock_stream(xid, LockMode::AccessShare)?;
            state = shared.fileset_state();
        }
        match state {
            // The queue may still hold messages sent before the switch;
            // replay on the next idle pass once it is drained.
            FileSetState::SerializeDone => {
                shared.set_fileset_state(FileSetState::Ready, None);
            }
            FileSetState::Ready => {
                let xid = shared.xid();
                self.apply_spooled_messages(xid, Lsn::INVALID).await?;
                shared.set_fileset_state(FileSetState::Empty, None);
            }
            _ => {}
        }
        Ok(true)
    }

    /// Opens the leader's spool of `xid` for replay.
    pub(crate) fn applier_spool_reader(&self, xid: TransactionId) -> Result<SpoolReader> {
        let fileset = self
            .applier_ctx()?
            .shared
            .fileset()
            .ok_or_else(|| ApplyError::invalid_state("no stream fileset to replay"))?;
        SpoolReader::open(&fileset, self.sub.oid, xid)
    }

    /// The applier's main loop.
    pub(crate) async fn applier_loop(&mut self) -> Result<()> {
        let mut stop = self.stop.clone();
        loop {
            if *stop.borrow() {
                return Ok(());
            }
            let received = self.applier_ctx()?.data.try_recv();
            let received = match received {
                RecvResult::WouldBlock => {
                    if self.pa_process_spooled_messages_if_required().await? {
                        continue;
                    }
                    let ctx = self.applier_ctx()?;
                    tokio::select! {
                        _ = stop_requested(&mut stop) => continue,
                        r = ctx.data.recv_timeout(APPLIER_NAPTIME) => r,
                    }
                }
                other => other,
            };
            match received {
                RecvResult::Message(chunk) => {
                    if chunk.first() != Some(&b'w') {
                        let c = chunk.first().map_or('?', |b| *b as char);
                        return Err(ApplyError::invalid_state(format!("unexpected message \"{c}\"")));
                    }
                    // The leader already processed the header.
                    if chunk.len() < 1 + XLOG_DATA_HEADER_SIZE {
                        return Err(ApplyError::protocol("truncated XLogData message"));
                    }
                    let data = chunk.slice(1 + XLOG_DATA_HEADER_SIZE..);
                    tokio::select! {
                        biased;
                        _ = stop_requested(&mut stop) => return Err(ApplyError::Shutdown),
                        r = self.apply_dispatch(data) => r?,
                    }
                }
                RecvResult::WouldBlock => {}
                RecvResult::Detached => {
                    if *stop.borrow() {
                        return Ok(());
                    }
                    return Err(ApplyError::connection(
                        "lost connection to the logical replication apply worker",
                    ));
                }
            }
        }
    }

    fn report_to_leader(&self, err: &ApplyError) {
        let Ok(ctx) = self.applier_ctx() else {
            return;
        };
        let response = self.error_response(err);
        match response.encode() {
            Ok(bytes) => {
                if ctx.errors.try_send(Bytes::from(bytes)) != SendResult::Success {
                    warn!("could not report error to the logical replication apply worker");
                }
            }
            Err(encode_err) => warn!(error = %encode_err, "could not encode error for the leader"),
        }
    }
}

/// Runs one parallel applier until its leader stops it or it fails.
pub(crate) async fn run_applier(env: Arc<ApplyEnv>, claim: WorkerClaim, setup: ApplierSetup) {
    let proc = env.alloc_proc();
    let slot = match env.slots.attach(&claim, proc) {
        Ok(slot) => slot,
        Err(err) => {
            warn!(error = %err, "parallel apply worker could not attach");
            return;
        }
    };
    let ApplierSetup {
        shared,
        leader,
        leader_origin,
        sub,
        data,
        errors,
    } = setup;
    let subname = sub.name.clone();
    let mut worker = ApplyWorker::new(
        env.clone(),
        proc,
        WorkerKind::ParallelApply,
        slot,
        claim.stop,
        sub,
    );
    worker.applier = Some(ApplierContext {
        shared,
        leader,
        subxacts: Vec::new(),
        data,
        errors,
    });
    worker.origin = leader_origin;
    worker.errctx.origin_name = origin_name_for_subscription(worker.sub.oid);

    let result = match env.origins.session_setup(leader_origin, proc, Some(leader)) {
        Ok(()) => {
            info!(
                "logical replication parallel apply worker for subscription \"{}\" has started",
                subname
            );
            worker.applier_loop().await
        }
        Err(err) => Err(err),
    };
    match &result {
        Ok(()) | Err(ApplyError::Shutdown) => info!(
            "logical replication parallel apply worker for subscription \"{}\" has finished",
            subname
        ),
        Err(err) => {
            error!(subscription = %subname, context = %worker.errctx, "{err}");
            worker.report_to_leader(err);
        }
    }
    worker.release_resources();
    env.origins.session_reset(leader_origin, proc);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_are_ordered() {
        assert!(XactState::Unknown < XactState::Started);
        assert!(XactState::Started < XactState::Finished);
        assert!(FileSetState::Empty < FileSetState::SerializeInProgress);
        assert!(FileSetState::SerializeDone < FileSetState::Ready);
    }

    #[test]
    fn test_shared_block() {
        let shared = ParallelShared::new();
        shared.assign(740);
        shared.set_xact_state(XactState::Started);
        assert_eq!(shared.xid(), 740);
        assert_eq!(shared.add_pending_stream(), 1);
        assert_eq!(shared.add_pending_stream(), 2);
        assert_eq!(shared.sub_pending_stream(), 1);

        shared.set_fileset_state(FileSetState::SerializeDone, None);
        assert!(shared.fileset().is_none());
        assert_eq!(shared.fileset_state(), FileSetState::SerializeDone);

        shared.assign(741);
        assert_eq!(shared.xact_state(), XactState::Unknown);
    }

    #[test]
    fn test_pool_rejects_duplicate_xid() {
        let mut pool = ApplierPool::default();
        pool.bind(740, 0).unwrap();
        assert!(matches!(pool.bind(740, 1), Err(ApplyError::HashCorruption { .. })));
        assert!(pool.get(740).is_none());
        assert!(pool.is_empty());
    }
}
