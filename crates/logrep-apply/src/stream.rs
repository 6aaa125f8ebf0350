//! Streamed (in-progress) transactions.
//!
//! Between STREAM START and STREAM STOP the publisher sends changes of a
//! transaction that has not committed yet. Depending on
//! [`TransApplyAction`] the leader spools them to its own file and replays
//! the file at STREAM COMMIT/PREPARE, forwards them to a parallel applier,
//! or spools them to the file a parallel applier replays after partial
//! serialize. A parallel applier applies them directly, defining a
//! savepoint per subtransaction so STREAM ABORT of a subtransaction can
//! roll back just that part.

use crate::apply::{ApplyWorker, TransApplyAction};
use crate::error::{ApplyError, Result};
use crate::locks::LockMode;
use crate::lsn::Lsn;
use crate::parallel::{ParallelShared, XactState};
use crate::proto::{action, LogicalMessage, PrepareData};
use crate::slots::WorkerKind;
use crate::types::{TransactionId, INVALID_XID};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tracing::debug;

impl ApplyWorker {
    fn pa_shared(&self, xid: TransactionId) -> Result<Arc<ParallelShared>> {
        self.pool
            .get(xid)
            .map(|h| h.shared.clone())
            .ok_or_else(|| ApplyError::invalid_state(format!("no parallel apply worker for transaction {xid}")))
    }

    /// Routes a change message of the open stream chunk. Returns true when
    /// the message was spooled or forwarded and must not be applied here.
    ///
    /// RELATION and TYPE are applied by the leader even after forwarding,
    /// since the publisher does not always resend them once the streamed
    /// transaction ends.
    pub(crate) async fn handle_streamed_transaction(
        &mut self,
        msg_action: u8,
        xid: Option<TransactionId>,
        raw: &Bytes,
    ) -> Result<bool> {
        let stream_xid = self.stream_xid;
        let apply_action = self.apply_action(stream_xid);
        if apply_action == TransApplyAction::LeaderApply {
            return Ok(false);
        }
        let current_xid = match xid {
            Some(xid) if xid != INVALID_XID => xid,
            _ => {
                return Err(ApplyError::protocol(
                    "invalid transaction ID in streamed replication transaction",
                ))
            }
        };
        let handled = msg_action != action::RELATION && msg_action != action::TYPE;

        match apply_action {
            TransApplyAction::LeaderSerialize => {
                self.spool.record_subxact(current_xid)?;
                self.spool.append(msg_action, &raw[1..])?;
                Ok(true)
            }
            TransApplyAction::LeaderSendToParallel => {
                let chunk = self.current_chunk.clone();
                if self.pa_send_data(stream_xid, chunk).await? {
                    return Ok(handled);
                }
                self.pa_switch_to_partial_serialize(stream_xid, false).await?;
                self.spool.append(msg_action, &raw[1..])?;
                Ok(handled)
            }
            TransApplyAction::LeaderPartialSerialize => {
                self.spool.append(msg_action, &raw[1..])?;
                Ok(handled)
            }
            TransApplyAction::ParallelApply => {
                self.pa_start_subtrans(current_xid, stream_xid)?;
                Ok(false)
            }
            TransApplyAction::LeaderApply => Ok(false),
        }
    }

    pub(crate) async fn handle_stream_start(
        &mut self,
        xid: TransactionId,
        first_segment: bool,
        raw: &Bytes,
    ) -> Result<()> {
        if self.in_streamed_transaction {
            return Err(ApplyError::protocol("duplicate STREAM START message"));
        }
        if xid == INVALID_XID {
            return Err(ApplyError::protocol(
                "invalid transaction ID in streamed replication transaction",
            ));
        }
        self.in_streamed_transaction = true;
        self.stream_xid = xid;
        self.set_errctx_xact(xid, Lsn::INVALID);

        if first_segment {
            self.pa_allocate_worker(xid)?;
        }

        match self.apply_action(xid) {
            TransApplyAction::LeaderSerialize => self.spool.open(xid, first_segment),
            TransApplyAction::LeaderSendToParallel => {
                let shared = self.pa_shared(xid)?;
                let chunk = self.current_chunk.clone();
                if self.pa_send_data(xid, chunk).await? {
                    // Let the applier go on with the new chunk.
                    if !first_segment {
                        self.pa_unlock_stream(xid, LockMode::AccessExclusive)?;
                    }
                    shared.add_pending_stream();
                    return Ok(());
                }
                // The switch opens the spool file.
                self.pa_switch_to_partial_serialize(xid, !first_segment).await?;
                self.spool.append(action::STREAM_START, &raw[1..])
            }
            TransApplyAction::LeaderPartialSerialize => {
                self.spool.open(xid, false)?;
                self.spool.append(action::STREAM_START, &raw[1..])
            }
            TransApplyAction::ParallelApply => {
                if first_segment {
                    // Held until the transaction ends.
                    let shared = self.applier_ctx()?.shared.clone();
                    self.pa_lock_transaction(xid, LockMode::AccessExclusive).await?;
                    shared.set_xact_state(XactState::Started);
                    self.env.slots.notify_change();
                }
                Ok(())
            }
            TransApplyAction::LeaderApply => Err(ApplyError::invalid_state(
                "unexpected apply action for STREAM START",
            )),
        }
    }

    pub(crate) async fn handle_stream_stop(&mut self, raw: &Bytes) -> Result<()> {
        if !self.in_streamed_transaction {
            return Err(ApplyError::protocol("STREAM STOP message without STREAM START"));
        }
        let xid = self.stream_xid;
        match self.apply_action(xid) {
            TransApplyAction::LeaderSerialize => self.spool.close()?,
            TransApplyAction::LeaderSendToParallel => {
                // Taken before sending so the applier blocks on it once it
                // has caught up.
                self.pa_lock_stream(xid, LockMode::AccessExclusive).await?;
                let chunk = self.current_chunk.clone();
                if !self.pa_send_data(xid, chunk).await? {
                    self.pa_switch_to_partial_serialize(xid, true).await?;
                    self.spool.append(action::STREAM_STOP, &raw[1..])?;
                    self.spool.close()?;
                }
            }
            TransApplyAction::LeaderPartialSerialize => {
                self.spool.append(action::STREAM_STOP, &raw[1..])?;
                self.spool.close()?;
            }
            TransApplyAction::ParallelApply => {
                debug!(xid, "applied streaming chunk");
                self.pa_decr_and_wait_stream_block().await?;
            }
            TransApplyAction::LeaderApply => {
                return Err(ApplyError::invalid_state(
                    "unexpected apply action for STREAM STOP",
                ))
            }
        }
        self.in_streamed_transaction = false;
        self.stream_xid = INVALID_XID;
        self.reset_errctx();
        Ok(())
    }

    /// Appends a terminal message to the spool of `xid`, opening and
    /// closing the file around it.
    fn stream_open_and_write_change(&mut self, xid: TransactionId, msg_action: u8, raw: &Bytes) -> Result<()> {
        if !self.spool.is_open() {
            self.spool.open(xid, false)?;
        }
        self.spool.append(msg_action, &raw[1..])?;
        self.spool.close()
    }

    /// Drops the spooled changes of `subxid`, or all of `xid` when the
    /// toplevel transaction aborted.
    fn stream_abort_internal(&mut self, xid: TransactionId, subxid: TransactionId) -> Result<()> {
        if xid == subxid {
            self.spool.cleanup(xid)
        } else {
            self.spool.truncate_after(xid, subxid)
        }
    }

    async fn pa_stream_abort(&mut self, xid: TransactionId, subxid: TransactionId) -> Result<()> {
        if xid != subxid {
            return self.pa_rollback_subtrans(subxid);
        }
        let shared = self.applier_ctx()?.shared.clone();
        shared.set_xact_state(XactState::Finished);
        // An empty transaction took no locks that the abort would release.
        self.pa_unlock_transaction(xid, LockMode::AccessExclusive)?;
        self.abort_local();
        self.pa_reset_subtrans();
        self.in_remote_transaction = false;
        Ok(())
    }

    pub(crate) async fn handle_stream_abort(
        &mut self,
        xid: TransactionId,
        subxid: TransactionId,
        abort_lsn: Lsn,
        raw: &Bytes,
    ) -> Result<()> {
        if self.in_streamed_transaction {
            return Err(ApplyError::protocol("STREAM ABORT message without STREAM STOP"));
        }
        let toplevel = xid == subxid;
        self.set_errctx_xact(subxid, abort_lsn);

        match self.apply_action(xid) {
            TransApplyAction::LeaderApply => {
                self.stream_abort_internal(xid, subxid)?;
                debug!(xid, subxid, "finished processing the STREAM ABORT command");
            }
            TransApplyAction::LeaderSendToParallel => {
                if !toplevel {
                    // The applier waits on the stream lock again after the
                    // rollback, so it must be held before sending.
                    let shared = self.pa_shared(xid)?;
                    self.pa_unlock_stream(xid, LockMode::AccessExclusive)?;
                    shared.add_pending_stream();
                    self.pa_lock_stream(xid, LockMode::AccessExclusive).await?;
                }
                let chunk = self.current_chunk.clone();
                if self.pa_send_data(xid, chunk).await? {
                    // Waited for so a wrapped-around xid cannot collide.
                    if toplevel {
                        self.pa_xact_finish(xid, Lsn::INVALID).await?;
                    }
                } else {
                    self.pa_switch_to_partial_serialize(xid, true).await?;
                    self.partial_serialize_abort(xid, toplevel, raw).await?;
                }
            }
            TransApplyAction::LeaderPartialSerialize => {
                self.partial_serialize_abort(xid, toplevel, raw).await?;
            }
            TransApplyAction::ParallelApply => {
                self.pa_stream_abort(xid, subxid).await?;
                if !toplevel {
                    self.pa_decr_and_wait_stream_block().await?;
                }
                debug!(xid, subxid, "finished processing the STREAM ABORT command");
            }
            TransApplyAction::LeaderSerialize => {
                return Err(ApplyError::invalid_state(
                    "unexpected apply action for STREAM ABORT",
                ))
            }
        }
        self.reset_errctx();
        Ok(())
    }

    /// The applier may already have applied part of the transaction, so
    /// the abort goes to the file for it to roll back.
    async fn partial_serialize_abort(&mut self, xid: TransactionId, toplevel: bool, raw: &Bytes) -> Result<()> {
        self.stream_open_and_write_change(xid, action::STREAM_ABORT, raw)?;
        if toplevel {
            self.pa_set_serialize_done(xid);
            self.pa_xact_finish(xid, Lsn::INVALID).await?;
        }
        Ok(())
    }

    /// Writes the terminal message of a partially serialized transaction
    /// and waits for its applier.
    async fn partial_serialize_finish(
        &mut self,
        xid: TransactionId,
        msg_action: u8,
        end_lsn: Lsn,
        raw: &Bytes,
    ) -> Result<()> {
        self.stream_open_and_write_change(xid, msg_action, raw)?;
        self.pa_set_serialize_done(xid);
        self.pa_xact_finish(xid, end_lsn).await
    }

    /// Publishes the end of the applier's transaction to its leader.
    fn pa_finish_applied(&mut self, xid: TransactionId) -> Result<()> {
        let shared = self.applier_ctx()?.shared.clone();
        shared.set_last_commit_end(self.last_commit_end);
        // Finished must be visible before the lock is released.
        shared.set_xact_state(XactState::Finished);
        self.pa_unlock_transaction(xid, LockMode::AccessExclusive)?;
        self.pa_reset_subtrans();
        Ok(())
    }

    pub(crate) async fn handle_stream_commit(
        &mut self,
        xid: TransactionId,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        raw: &Bytes,
    ) -> Result<()> {
        if self.in_streamed_transaction {
            return Err(ApplyError::protocol("STREAM COMMIT message without STREAM STOP"));
        }
        self.set_errctx_xact(xid, commit_lsn);

        match self.apply_action(xid) {
            TransApplyAction::LeaderApply => {
                self.apply_spooled_messages(xid, commit_lsn).await?;
                self.commit_internal(commit_lsn, end_lsn)?;
                self.spool.cleanup(xid)?;
                debug!(xid, "finished processing the STREAM COMMIT command");
            }
            TransApplyAction::LeaderSendToParallel => {
                let chunk = self.current_chunk.clone();
                if self.pa_send_data(xid, chunk).await? {
                    self.pa_xact_finish(xid, end_lsn).await?;
                } else {
                    self.pa_switch_to_partial_serialize(xid, true).await?;
                    self.partial_serialize_finish(xid, action::STREAM_COMMIT, end_lsn, raw)
                        .await?;
                }
            }
            TransApplyAction::LeaderPartialSerialize => {
                self.partial_serialize_finish(xid, action::STREAM_COMMIT, end_lsn, raw)
                    .await?;
            }
            TransApplyAction::ParallelApply => {
                self.remote_final_lsn = commit_lsn;
                self.commit_internal(commit_lsn, end_lsn)?;
                self.pa_finish_applied(xid)?;
                debug!(xid, "finished processing the STREAM COMMIT command");
            }
            TransApplyAction::LeaderSerialize => {
                return Err(ApplyError::invalid_state(
                    "unexpected apply action for STREAM COMMIT",
                ))
            }
        }
        self.process_syncing_tables(end_lsn).await?;
        self.reset_errctx();
        Ok(())
    }

    pub(crate) async fn handle_stream_prepare(&mut self, data: PrepareData, raw: &Bytes) -> Result<()> {
        if self.in_streamed_transaction {
            return Err(ApplyError::protocol("STREAM PREPARE message without STREAM STOP"));
        }
        if self.kind == WorkerKind::TableSync {
            return Err(ApplyError::protocol(
                "tablesync worker received a STREAM PREPARE message",
            ));
        }
        let xid = data.xid;
        self.set_errctx_xact(xid, data.prepare_lsn);

        match self.apply_action(xid) {
            TransApplyAction::LeaderApply => {
                self.apply_spooled_messages(xid, data.prepare_lsn).await?;
                self.prepare_internal(&data)?;
                // The prepare record is always flushed.
                self.store_flush_position(data.end_lsn, Lsn::INVALID);
                self.in_remote_transaction = false;
                self.spool.cleanup(xid)?;
                debug!(xid, "finished processing the STREAM PREPARE command");
            }
            TransApplyAction::LeaderSendToParallel => {
                let chunk = self.current_chunk.clone();
                if self.pa_send_data(xid, chunk).await? {
                    self.pa_xact_finish(xid, data.end_lsn).await?;
                } else {
                    self.pa_switch_to_partial_serialize(xid, true).await?;
                    self.partial_serialize_finish(xid, action::STREAM_PREPARE, data.end_lsn, raw)
                        .await?;
                }
            }
            TransApplyAction::LeaderPartialSerialize => {
                self.partial_serialize_finish(xid, action::STREAM_PREPARE, data.end_lsn, raw)
                    .await?;
            }
            TransApplyAction::ParallelApply => {
                self.prepare_internal(&data)?;
                self.in_remote_transaction = false;
                self.pa_finish_applied(xid)?;
                debug!(xid, "finished processing the STREAM PREPARE command");
            }
            TransApplyAction::LeaderSerialize => {
                return Err(ApplyError::invalid_state(
                    "unexpected apply action for STREAM PREPARE",
                ))
            }
        }
        self.process_syncing_tables(data.end_lsn).await?;
        self.skip.stop_skipping(&self.sub);
        self.clear_skip_lsn(data.prepare_lsn)?;
        self.reset_errctx();
        Ok(())
    }

    /// Replays the spooled changes of `xid` through the regular handlers.
    ///
    /// The leader replays its own file at STREAM COMMIT/PREPARE with `lsn`
    /// set to the finish LSN; a parallel applier replays its leader's file
    /// after partial serialize with `lsn` invalid.
    pub(crate) async fn apply_spooled_messages(&mut self, xid: TransactionId, lsn: Lsn) -> Result<()> {
        let reader = if self.kind == WorkerKind::ParallelApply {
            self.applier_spool_reader(xid)?
        } else {
            self.spool.read_all(xid)?
        };
        debug!(xid, "replaying changes from spool file");

        if lsn.is_valid() {
            self.remote_final_lsn = lsn;
            self.skip.maybe_start_skipping(&self.sub, lsn);
        }
        self.in_remote_transaction = true;

        let mut nchanges = 0u64;
        for record in reader {
            let (msg_action, body) = record?;
            let mut buf = BytesMut::with_capacity(body.len() + 1);
            buf.put_u8(msg_action);
            buf.extend_from_slice(&body);
            let raw = buf.freeze();
            // Records keep their subtransaction xid.
            let msg = LogicalMessage::decode(&raw, true)?;
            self.apply_message(msg, raw).await?;
            nchanges += 1;
            if nchanges % 1000 == 0 {
                debug!(xid, nchanges, "replayed changes from spool file");
            }
        }
        debug!(xid, nchanges, "replayed all changes from spool file");
        Ok(())
    }
}
