//! The apply worker.
//!
//! One [`ApplyWorker`] type serves all three roles: the leader of a
//! subscription, a tablesync worker catching one relation up, and a
//! parallel applier running a single streamed transaction for its leader.
//! This module holds the worker state, the message dispatcher, transaction
//! control (BEGIN/COMMIT, two-phase), the receive loop and error handling.
//! Row changes live in `dml`, streamed transactions in `stream`, the
//! parallel pool in `parallel` and table synchronization in `tablesync`.

use crate::env::{stop_requested, ApplyEnv};
use crate::error::{ApplyError, ErrorResponse, Result};
use crate::flush::FeedbackState;
use crate::locks::XactLocks;
use crate::lsn::Lsn;
use crate::origin::OriginId;
use crate::parallel::{ApplierContext, ApplierPool};
use crate::proto::{action, action_name, CopyData, LogicalMessage, PrepareData};
use crate::relation::{OpenContext, RelationMap};
use crate::skip::{self, SkipState};
use crate::slots::{AttachedSlot, WorkerKind};
use crate::spool::StreamSpool;
use crate::storage::LocalXid;
use crate::types::{now_timestamp, two_phase_gid, Oid, ProcId, Subscription, TransactionId, INVALID_XID};
use crate::upstream::{PublisherConnection, Received};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Idle wait of the receive loop.
const NAPTIME_PER_CYCLE: Duration = Duration::from_millis(1000);

/// Wait of the receive loop while applied commits are not yet flushed.
const WAL_WRITER_DELAY: Duration = Duration::from_millis(200);

/// How a message of a (possibly streamed) transaction is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransApplyAction {
    /// Apply directly; not inside a streamed transaction.
    LeaderApply,
    /// Append to this worker's spool file.
    LeaderSerialize,
    /// Forward to the parallel applier owning the transaction.
    LeaderSendToParallel,
    /// The applier could not keep up; append to the shared spool instead.
    LeaderPartialSerialize,
    /// This worker is a parallel applier.
    ParallelApply,
}

/// Where the worker is, reported with errors.
#[derive(Debug, Clone, Default)]
pub(crate) struct ErrorContext {
    pub(crate) origin_name: String,
    pub(crate) command: Option<u8>,
    pub(crate) relation: Option<String>,
    pub(crate) remote_xid: TransactionId,
    pub(crate) finish_lsn: Lsn,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "processing remote data for replication origin \"{}\"", self.origin_name)?;
        let Some(command) = self.command else {
            return Ok(());
        };
        write!(f, " during message type \"{}\"", action_name(command))?;
        if let Some(rel) = &self.relation {
            write!(f, " for replication target relation \"{rel}\"")?;
        }
        if self.remote_xid != INVALID_XID {
            write!(f, " in transaction {}", self.remote_xid)?;
        }
        if self.finish_lsn.is_valid() {
            write!(f, ", finished at {}", self.finish_lsn)?;
        }
        Ok(())
    }
}

/// State of one apply worker.
pub(crate) struct ApplyWorker {
    pub(crate) env: Arc<ApplyEnv>,
    pub(crate) proc: ProcId,
    pub(crate) kind: WorkerKind,
    pub(crate) slot: AttachedSlot,
    pub(crate) stop: watch::Receiver<bool>,
    pub(crate) sub: Subscription,
    catalog_generation: u64,
    /// Replication origin writes are attributed to.
    pub(crate) origin: OriginId,
    pub(crate) relmap: RelationMap,
    pub(crate) xact_locks: XactLocks,
    pub(crate) local_xact: Option<LocalXid>,
    pub(crate) last_commit_end: Lsn,
    pub(crate) skip: SkipState,
    pub(crate) feedback: FeedbackState,
    pub(crate) conn: Option<Box<dyn PublisherConnection>>,
    /// Streaming to parallel appliers was negotiated.
    pub(crate) parallel_apply: bool,
    pub(crate) remote_final_lsn: Lsn,
    pub(crate) in_remote_transaction: bool,
    pub(crate) in_streamed_transaction: bool,
    pub(crate) stream_xid: TransactionId,
    pub(crate) spool: StreamSpool,
    /// Leader only.
    pub(crate) pool: ApplierPool,
    /// Leader only: last tablesync launch per relation.
    pub(crate) sync_start_times: HashMap<Oid, Instant>,
    /// Leader only: last sequence sync launch.
    pub(crate) seqsync_start_time: Option<Instant>,
    /// Tablesync only.
    pub(crate) sync_relid: Option<Oid>,
    /// Parallel applier only.
    pub(crate) applier: Option<ApplierContext>,
    /// The `'w'` chunk the current message came in, forwarded verbatim to
    /// parallel appliers.
    pub(crate) current_chunk: Bytes,
    pub(crate) errctx: ErrorContext,
}

impl ApplyWorker {
    pub(crate) fn new(
        env: Arc<ApplyEnv>,
        proc: ProcId,
        kind: WorkerKind,
        slot: AttachedSlot,
        stop: watch::Receiver<bool>,
        sub: Subscription,
    ) -> Self {
        let spool = StreamSpool::new(
            env.config.spool_dir.clone(),
            format!("logrep-{}-{}", sub.oid, proc.0),
            sub.oid,
        );
        let catalog_generation = env.catalog.generation();
        Self {
            proc,
            kind,
            slot,
            stop,
            relmap: RelationMap::new(sub.oid),
            sub,
            catalog_generation,
            origin: OriginId::INVALID,
            xact_locks: XactLocks::default(),
            local_xact: None,
            last_commit_end: Lsn::INVALID,
            skip: SkipState::new(),
            feedback: FeedbackState::new(),
            conn: None,
            parallel_apply: false,
            remote_final_lsn: Lsn::INVALID,
            in_remote_transaction: false,
            in_streamed_transaction: false,
            stream_xid: INVALID_XID,
            spool,
            pool: ApplierPool::default(),
            sync_start_times: HashMap::new(),
            seqsync_start_time: None,
            sync_relid: None,
            applier: None,
            current_chunk: Bytes::new(),
            errctx: ErrorContext::default(),
            env,
        }
    }

    /// Lock and catalog access for opening relations.
    pub(crate) fn open_ctx(env: &ApplyEnv, proc: ProcId) -> OpenContext<'_> {
        OpenContext {
            storage: env.storage.as_ref(),
            catalog: env.catalog.as_ref(),
            locks: &env.locks,
            proc,
        }
    }

    // ------------------------------------------------------------------
    // Local transactions
    // ------------------------------------------------------------------

    /// The open local transaction, starting one if needed.
    pub(crate) fn ensure_local_xact(&mut self) -> LocalXid {
        match self.local_xact {
            Some(xid) => xid,
            None => {
                let xid = self.env.storage.begin(self.origin);
                self.local_xact = Some(xid);
                xid
            }
        }
    }

    /// Commits the local transaction and releases its locks.
    pub(crate) fn commit_local(&mut self) -> Result<Lsn> {
        let xid = self
            .local_xact
            .take()
            .ok_or_else(|| ApplyError::invalid_state("no local transaction to commit"))?;
        let result = self.env.storage.commit(xid);
        self.xact_locks.release(&self.env.locks, self.proc);
        let lsn = result?;
        self.last_commit_end = lsn;
        Ok(lsn)
    }

    /// Rolls back the local transaction, if any, and releases its locks.
    pub(crate) fn abort_local(&mut self) {
        if let Some(xid) = self.local_xact.take() {
            if let Err(err) = self.env.storage.abort(xid) {
                warn!(%xid, error = %err, "could not abort local transaction");
            }
        }
        self.xact_locks.release(&self.env.locks, self.proc);
    }

    /// Prepares the local transaction as `gid`. An empty one is started if
    /// nothing was applied, so that COMMIT PREPARED always finds it.
    fn prepare_local(&mut self, gid: &str) -> Result<Lsn> {
        let xid = self.ensure_local_xact();
        self.local_xact = None;
        let result = self.env.storage.prepare(xid, gid);
        self.xact_locks.release(&self.env.locks, self.proc);
        result
    }

    /// Queues an applied commit for flush feedback. Parallel appliers leave
    /// that to their leader.
    pub(crate) fn store_flush_position(&mut self, remote_end: Lsn, local_end: Lsn) {
        if self.kind == WorkerKind::ParallelApply {
            return;
        }
        self.feedback.store_flush_position(remote_end, local_end);
    }

    pub(crate) fn clear_skip_lsn(&mut self, finish_lsn: Lsn) -> Result<()> {
        if !self.sub.skip_lsn.is_valid() || self.kind == WorkerKind::ParallelApply {
            return Ok(());
        }
        skip::clear_skip_lsn(self.env.catalog.as_ref(), &self.sub, finish_lsn)?;
        self.sub.skip_lsn = Lsn::INVALID;
        Ok(())
    }

    pub(crate) fn set_errctx_xact(&mut self, xid: TransactionId, finish_lsn: Lsn) {
        self.errctx.remote_xid = xid;
        self.errctx.finish_lsn = finish_lsn;
    }

    pub(crate) fn reset_errctx(&mut self) {
        self.errctx.command = None;
        self.errctx.relation = None;
        self.set_errctx_xact(INVALID_XID, Lsn::INVALID);
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Which path a message of remote transaction `xid` takes.
    pub(crate) fn apply_action(&self, xid: TransactionId) -> TransApplyAction {
        if self.kind == WorkerKind::ParallelApply {
            return TransApplyAction::ParallelApply;
        }
        match self.pool.get(xid) {
            Some(winfo) if winfo.serialize_changes => TransApplyAction::LeaderPartialSerialize,
            Some(_) => TransApplyAction::LeaderSendToParallel,
            None if self.in_streamed_transaction => TransApplyAction::LeaderSerialize,
            None => TransApplyAction::LeaderApply,
        }
    }

    /// Decodes and applies one logical replication message.
    pub(crate) async fn apply_dispatch(&mut self, data: Bytes) -> Result<()> {
        let msg = LogicalMessage::decode(&data, self.in_streamed_transaction)?;
        self.apply_message(msg, data).await
    }

    /// Applies a decoded message; `raw` is its encoding, action byte first.
    ///
    /// Boxed because replaying a spool file dispatches recursively.
    pub(crate) fn apply_message<'a>(
        &'a mut self,
        msg: LogicalMessage,
        raw: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let saved = self.errctx.command.replace(msg.action());
            let result = self.apply_message_inner(msg, raw).await;
            if result.is_ok() {
                self.errctx.command = saved;
            }
            result
        })
    }

    async fn apply_message_inner(&mut self, msg: LogicalMessage, raw: Bytes) -> Result<()> {
        match msg {
            LogicalMessage::Begin { final_lsn, xid, .. } => {
                self.handle_begin(final_lsn, xid);
                Ok(())
            }
            LogicalMessage::Commit {
                commit_lsn,
                end_lsn,
                ..
            } => self.handle_commit(commit_lsn, end_lsn).await,
            LogicalMessage::Origin { .. } => self.handle_origin(),
            LogicalMessage::Relation { xid, body } => {
                if self.handle_streamed_transaction(action::RELATION, xid, &raw).await? {
                    return Ok(());
                }
                self.relmap.update(body);
                Ok(())
            }
            LogicalMessage::Type {
                xid,
                type_oid,
                namespace,
                name,
            } => {
                if self.handle_streamed_transaction(action::TYPE, xid, &raw).await? {
                    return Ok(());
                }
                debug!(type_oid, %namespace, %name, "remote type");
                Ok(())
            }
            LogicalMessage::Insert {
                xid,
                relid,
                new_tuple,
            } => self.handle_insert(xid, relid, new_tuple, &raw).await,
            LogicalMessage::Update {
                xid,
                relid,
                old_tuple,
                new_tuple,
            } => self.handle_update(xid, relid, old_tuple, new_tuple, &raw).await,
            LogicalMessage::Delete {
                xid,
                relid,
                old_tuple,
            } => self.handle_delete(xid, relid, old_tuple, &raw).await,
            LogicalMessage::Truncate {
                xid,
                relids,
                cascade,
                restart_seqs,
            } => {
                self.handle_truncate(xid, relids, cascade, restart_seqs, &raw)
                    .await
            }
            // Generic logical messages are not used by replication.
            LogicalMessage::Message { .. } => Ok(()),
            LogicalMessage::StreamStart { xid, first_segment } => {
                self.handle_stream_start(xid, first_segment, &raw).await
            }
            LogicalMessage::StreamStop => self.handle_stream_stop(&raw).await,
            LogicalMessage::StreamCommit {
                xid,
                commit_lsn,
                end_lsn,
                ..
            } => self.handle_stream_commit(xid, commit_lsn, end_lsn, &raw).await,
            LogicalMessage::StreamAbort {
                xid,
                subxid,
                abort_lsn,
                ..
            } => self.handle_stream_abort(xid, subxid, abort_lsn, &raw).await,
            LogicalMessage::StreamPrepare(data) => self.handle_stream_prepare(data, &raw).await,
            LogicalMessage::BeginPrepare { prepare_lsn, xid, .. } => {
                self.handle_begin_prepare(prepare_lsn, xid)
            }
            LogicalMessage::Prepare(data) => self.handle_prepare(data).await,
            LogicalMessage::CommitPrepared {
                end_lsn,
                xid,
                ..
            } => self.handle_commit_prepared(xid, end_lsn).await,
            LogicalMessage::RollbackPrepared {
                rollback_end_lsn,
                xid,
                ..
            } => self.handle_rollback_prepared(xid, rollback_end_lsn).await,
        }
    }

    // ------------------------------------------------------------------
    // Transaction control
    // ------------------------------------------------------------------

    fn handle_begin(&mut self, final_lsn: Lsn, xid: TransactionId) {
        self.set_errctx_xact(xid, final_lsn);
        self.remote_final_lsn = final_lsn;
        self.skip.maybe_start_skipping(&self.sub, final_lsn);
        self.in_remote_transaction = true;
    }

    async fn handle_commit(&mut self, commit_lsn: Lsn, end_lsn: Lsn) -> Result<()> {
        if commit_lsn != self.remote_final_lsn {
            return Err(ApplyError::protocol(format!(
                "incorrect commit LSN {commit_lsn} in commit message (expected {})",
                self.remote_final_lsn
            )));
        }
        self.commit_internal(commit_lsn, end_lsn)?;
        self.process_syncing_tables(end_lsn).await?;
        self.reset_errctx();
        Ok(())
    }

    /// Finishes a remote transaction: commits the local one, advances the
    /// origin and queues the flush position. A skipped transaction still
    /// commits (empty) so its skip LSN is cleared atomically.
    pub(crate) fn commit_internal(&mut self, commit_lsn: Lsn, end_lsn: Lsn) -> Result<()> {
        if self.skip.is_skipping() {
            self.skip.stop_skipping(&self.sub);
            self.ensure_local_xact();
        }
        if self.local_xact.is_some() {
            self.clear_skip_lsn(commit_lsn)?;
            let local_lsn = self.commit_local()?;
            self.env.origins.advance(self.origin, end_lsn, local_lsn, false)?;
            self.store_flush_position(end_lsn, local_lsn);
        } else {
            self.maybe_reread_subscription()?;
        }
        self.in_remote_transaction = false;
        Ok(())
    }

    fn handle_origin(&mut self) -> Result<()> {
        if !self.in_streamed_transaction
            && (!self.in_remote_transaction
                || (self.local_xact.is_some() && self.kind != WorkerKind::TableSync))
        {
            return Err(ApplyError::protocol("ORIGIN message sent out of order"));
        }
        Ok(())
    }

    fn handle_begin_prepare(&mut self, prepare_lsn: Lsn, xid: TransactionId) -> Result<()> {
        if self.kind == WorkerKind::TableSync {
            return Err(ApplyError::protocol(
                "tablesync worker received a BEGIN PREPARE message",
            ));
        }
        self.set_errctx_xact(xid, prepare_lsn);
        self.remote_final_lsn = prepare_lsn;
        self.skip.maybe_start_skipping(&self.sub, prepare_lsn);
        self.in_remote_transaction = true;
        Ok(())
    }

    /// Prepares the local transaction under the subscription's GID for
    /// `data.xid` and moves the origin to the end of the PREPARE.
    pub(crate) fn prepare_internal(&mut self, data: &PrepareData) -> Result<()> {
        let gid = two_phase_gid(self.sub.oid, data.xid);
        let local_lsn = self.prepare_local(&gid)?;
        self.last_commit_end = local_lsn;
        self.env
            .origins
            .advance(self.origin, data.end_lsn, local_lsn, false)?;
        debug!(%gid, end_lsn = %data.end_lsn, "prepared remote transaction");
        Ok(())
    }

    async fn handle_prepare(&mut self, data: PrepareData) -> Result<()> {
        if data.prepare_lsn != self.remote_final_lsn {
            return Err(ApplyError::protocol(format!(
                "incorrect prepare LSN {} in prepare message (expected {})",
                data.prepare_lsn, self.remote_final_lsn
            )));
        }
        // Prepared even when empty or skipped: COMMIT PREPARED cannot tell.
        self.prepare_internal(&data)?;
        // The prepare record is always flushed.
        self.store_flush_position(data.end_lsn, Lsn::INVALID);
        self.in_remote_transaction = false;
        self.process_syncing_tables(data.end_lsn).await?;
        self.skip.stop_skipping(&self.sub);
        self.clear_skip_lsn(data.prepare_lsn)?;
        self.reset_errctx();
        Ok(())
    }

    async fn handle_commit_prepared(&mut self, xid: TransactionId, end_lsn: Lsn) -> Result<()> {
        let gid = two_phase_gid(self.sub.oid, xid);
        self.set_errctx_xact(xid, end_lsn);
        let local_lsn = self.env.storage.commit_prepared(&gid)?;
        self.last_commit_end = local_lsn;
        self.env.origins.advance(self.origin, end_lsn, local_lsn, false)?;
        self.store_flush_position(end_lsn, local_lsn);
        self.in_remote_transaction = false;
        self.process_syncing_tables(end_lsn).await?;
        self.clear_skip_lsn(end_lsn)?;
        self.reset_errctx();
        Ok(())
    }

    async fn handle_rollback_prepared(
        &mut self,
        xid: TransactionId,
        rollback_end_lsn: Lsn,
    ) -> Result<()> {
        let gid = two_phase_gid(self.sub.oid, xid);
        self.set_errctx_xact(xid, rollback_end_lsn);
        // The PREPARE may predate the slot's consistent point, or two-phase
        // may not have been enabled yet when it was decoded.
        if self.env.storage.is_prepared(&gid) {
            let local_lsn = self.env.storage.rollback_prepared(&gid)?;
            self.env
                .origins
                .advance(self.origin, rollback_end_lsn, local_lsn, false)?;
            self.clear_skip_lsn(rollback_end_lsn)?;
        } else {
            debug!(%gid, "no prepared transaction to roll back");
        }
        self.store_flush_position(rollback_end_lsn, Lsn::INVALID);
        self.in_remote_transaction = false;
        self.process_syncing_tables(rollback_end_lsn).await?;
        self.reset_errctx();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Subscription changes
    // ------------------------------------------------------------------

    /// Rereads the subscription after catalog changes. Returns a clean-exit
    /// error when the worker has to stop or restart.
    pub(crate) fn maybe_reread_subscription(&mut self) -> Result<()> {
        let generation = self.env.catalog.generation();
        if generation == self.catalog_generation {
            return Ok(());
        }
        self.catalog_generation = generation;
        self.relmap.invalidate_states();

        let Some(newsub) = self.env.catalog.subscription(self.sub.oid) else {
            let msg = format!(
                "logical replication worker for subscription \"{}\" will stop because the subscription was removed",
                self.sub.name
            );
            info!("{msg}");
            if self.kind == WorkerKind::Leader {
                self.env.forget_worker_start_time(self.sub.oid);
            }
            return Err(ApplyError::PrerequisiteNotMet { msg });
        };

        let old = &self.sub;
        let exit = if !newsub.enabled {
            Some(format!(
                "logical replication worker for subscription \"{}\" will stop because the subscription was disabled",
                old.name
            ))
        } else if newsub.conninfo != old.conninfo
            || newsub.name != old.name
            || newsub.slot_name != old.slot_name
            || newsub.binary != old.binary
            || newsub.stream != old.stream
            || newsub.two_phase != old.two_phase
            || newsub.origin != old.origin
            || newsub.owner != old.owner
            || newsub.publications != old.publications
        {
            Some(match self.kind {
                WorkerKind::ParallelApply => format!(
                    "logical replication parallel apply worker for subscription \"{}\" will stop because of a parameter change",
                    old.name
                ),
                _ => format!(
                    "logical replication worker for subscription \"{}\" will restart because of a parameter change",
                    old.name
                ),
            })
        } else if !newsub.owner_superuser && old.owner_superuser {
            Some(format!(
                "logical replication worker for subscription \"{}\" will restart because the subscription owner's superuser privileges have been revoked",
                old.name
            ))
        } else {
            None
        };
        if let Some(msg) = exit {
            info!("{msg}");
            // A parallel applier is stopped by its leader, which sees the
            // same change.
            if self.kind != WorkerKind::ParallelApply {
                if self.kind == WorkerKind::Leader {
                    self.env.forget_worker_start_time(self.sub.oid);
                }
                return Err(ApplyError::PrerequisiteNotMet { msg });
            }
        }
        if newsub.dbid != self.sub.dbid {
            return Err(ApplyError::invalid_state(format!(
                "subscription {} changed unexpectedly",
                self.sub.oid
            )));
        }
        self.sub = newsub;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Receive loop
    // ------------------------------------------------------------------

    async fn receive(&mut self, timeout: Duration) -> Result<Received> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| ApplyError::invalid_state("no publisher connection"))?;
        conn.receive(timeout).await
    }

    /// Reports write/flush progress to the publisher.
    pub(crate) async fn send_feedback(&mut self, force: bool, reply_requested: bool) -> Result<()> {
        let interval = self.env.config.status_interval();
        if !force && interval.is_zero() {
            return Ok(());
        }
        let local_flush = self.env.storage.wal_flush_lsn();
        let Some(reply) = self.feedback.build_reply(
            local_flush,
            now_timestamp(),
            interval,
            force,
            reply_requested,
        ) else {
            return Ok(());
        };
        debug!(
            write = %reply.write_lsn,
            flush = %reply.flush_lsn,
            "sending feedback"
        );
        if let Some(conn) = self.conn.as_mut() {
            conn.send_reply(&reply).await?;
        }
        Ok(())
    }

    async fn process_chunk(&mut self, chunk: Bytes) -> Result<()> {
        match CopyData::decode(&chunk)? {
            CopyData::XLogData {
                start_lsn,
                end_lsn,
                send_time,
                data,
            } => {
                self.feedback.received(start_lsn);
                self.feedback.received(end_lsn);
                self.env.slots.update_stats(
                    self.slot.slot(),
                    self.feedback.last_received(),
                    send_time,
                    false,
                );
                self.current_chunk = chunk;
                self.apply_dispatch(data).await
            }
            CopyData::Keepalive {
                end_lsn,
                send_time,
                reply_requested,
            } => {
                self.feedback.received(end_lsn);
                self.send_feedback(reply_requested, false).await?;
                self.env.slots.update_stats(
                    self.slot.slot(),
                    self.feedback.last_received(),
                    send_time,
                    true,
                );
                Ok(())
            }
        }
    }

    /// Receives and applies until the stream ends or the worker has to
    /// stop. Used by leaders and tablesync workers.
    pub(crate) async fn apply_loop(&mut self) -> Result<()> {
        let mut stop = self.stop.clone();
        let mut last_recv = Instant::now();
        let mut ping_sent = false;
        let mut pending: Option<Received> = None;

        loop {
            if *stop.borrow() {
                return Err(ApplyError::Shutdown);
            }
            self.poll_parallel_errors()?;

            let mut received = match pending.take() {
                Some(r) => r,
                None => self.receive(Duration::ZERO).await?,
            };
            let mut end_of_stream = false;
            loop {
                match received {
                    Received::Timeout => break,
                    Received::EndOfStream => {
                        info!(subscription = %self.sub.name, "data stream from publisher has ended");
                        end_of_stream = true;
                        break;
                    }
                    Received::Data(chunk) => {
                        last_recv = Instant::now();
                        ping_sent = false;
                        tokio::select! {
                            biased;
                            _ = stop_requested(&mut stop) => return Err(ApplyError::Shutdown),
                            r = self.process_chunk(chunk) => r?,
                        }
                    }
                }
                received = self.receive(Duration::ZERO).await?;
            }

            self.send_feedback(false, false).await?;

            if !self.in_remote_transaction && !self.in_streamed_transaction {
                self.maybe_reread_subscription()?;
                let current = self.feedback.last_received();
                self.process_syncing_tables(current).await?;
            }

            if end_of_stream {
                if let Some(conn) = self.conn.as_mut() {
                    conn.end_streaming().await?;
                }
                return Ok(());
            }

            let wait = if self.feedback.ring().is_empty() {
                NAPTIME_PER_CYCLE
            } else {
                WAL_WRITER_DELAY
            };
            let slots = self.env.slots.clone();
            let conn = self
                .conn
                .as_mut()
                .ok_or_else(|| ApplyError::invalid_state("no publisher connection"))?;
            let woke = tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => return Err(ApplyError::Shutdown),
                r = conn.receive(wait) => Some(r?),
                _ = slots.wait_for_change(wait) => None,
            };
            match woke {
                Some(Received::Timeout) | None => {
                    let mut request_reply = false;
                    if let Some(timeout) = self.env.config.receiver_timeout() {
                        let idle = last_recv.elapsed();
                        if idle >= timeout {
                            return Err(ApplyError::connection(
                                "terminating logical replication worker due to timeout",
                            ));
                        }
                        if !ping_sent && idle >= timeout / 2 {
                            request_reply = true;
                            ping_sent = true;
                        }
                    }
                    self.send_feedback(request_reply, request_reply).await?;
                }
                Some(other) => pending = Some(other),
            }
        }
    }

    /// Runs the apply loop, handling its errors the way the subscription
    /// asks: either disable the subscription and exit cleanly, or report
    /// the error and fail.
    pub(crate) async fn start_apply(&mut self) -> Result<()> {
        let result = self.apply_loop().await;
        match result {
            Err(err) if !err.is_clean_exit() => self.on_apply_error(err),
            other => other,
        }
    }

    /// Error path shared by the apply loop and the initial table copy.
    pub(crate) fn on_apply_error(&mut self, err: ApplyError) -> Result<()> {
        error!(
            subscription = %self.sub.name,
            context = %self.errctx,
            "{err}"
        );
        self.abort_local();
        self.env
            .catalog
            .report_subscription_error(self.sub.oid, self.kind == WorkerKind::TableSync);
        if self.sub.disable_on_error {
            self.env.catalog.disable_subscription(self.sub.oid)?;
            if self.kind == WorkerKind::Leader {
                self.env.forget_worker_start_time(self.sub.oid);
            }
            info!(
                "subscription \"{}\" has been disabled because of an error",
                self.sub.name
            );
            return Ok(());
        }
        Err(err)
    }

    /// The error a parallel applier sends to its leader.
    pub(crate) fn error_response(&self, err: &ApplyError) -> ErrorResponse {
        let context = self.errctx.command.map(|_| self.errctx.to_string());
        ErrorResponse::from_error(err, context)
    }

    /// Releases everything the worker holds. Called once on exit.
    pub(crate) fn release_resources(&mut self) {
        self.abort_local();
        self.env.locks.release_all(self.proc);
        self.env.origins.release_all(self.proc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_context_message() {
        let mut ctx = ErrorContext {
            origin_name: "pg_16389".into(),
            ..Default::default()
        };
        assert_eq!(
            ctx.to_string(),
            "processing remote data for replication origin \"pg_16389\""
        );
        ctx.command = Some(action::INSERT);
        ctx.relation = Some("public.t".into());
        ctx.remote_xid = 740;
        ctx.finish_lsn = Lsn(0x1000);
        assert_eq!(
            ctx.to_string(),
            format!(
                "processing remote data for replication origin \"pg_16389\" during message type \"{}\" for replication target relation \"public.t\" in transaction 740, finished at {}",
                action_name(action::INSERT),
                Lsn(0x1000)
            )
        );
    }
}
