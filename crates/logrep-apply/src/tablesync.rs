//! Initial table synchronization.
//!
//! A relation added to a subscription is copied by a dedicated tablesync
//! worker, then handed over to the leader:
//!
//! ```text
//! INIT -> DATASYNC -> FINISHEDCOPY -> SYNCWAIT -> CATCHUP -> SYNCDONE -> READY
//! ```
//!
//! SYNCWAIT and CATCHUP live only in the worker slot. The tablesync worker
//! copies the table from a fresh slot snapshot, then waits in SYNCWAIT until
//! the leader moves it to CATCHUP with a catch-up LSN. It streams from its own
//! slot until it passes that LSN, persists SYNCDONE and exits. The leader marks
//! the relation READY once its own apply position passes the sync LSN.

use crate::apply::ApplyWorker;
use crate::dml::route_insert;
use crate::env::{stop_requested, ApplyEnv};
use crate::error::{ApplyError, Result};
use crate::locator::SearchRow;
use crate::locks::{LockMode, LockTag};
use crate::lsn::Lsn;
use crate::origin::OriginId;
use crate::proto::{TupleData, TupleValue};
use crate::relation::MappedRelation;
use crate::seqsync::launch_sequencesync;
use crate::slots::{LaunchRequest, WorkerClaim, WorkerKind};
use crate::storage::Datum;
use crate::types::{
    origin_name_for_tablesync, tablesync_slot_name, Oid, RelState, TwoPhaseState,
};
use crate::upstream::StreamOptions;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Poll interval while one side waits for the other's state change.
const STATE_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Poll interval while a tablesync origin is still in use by its worker.
const ORIGIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Spawns a tablesync worker for `(subid, relid)` in a reserved slot.
pub(crate) fn launch_tablesync(env: &Arc<ApplyEnv>, req: LaunchRequest) -> bool {
    let Some(relid) = req.relid else {
        return false;
    };
    let subid = req.subid;
    let Some(claim) = env.slots.launch(req) else {
        return false;
    };
    debug!(subid, relid, slot = claim.slot, "launching table synchronization worker");
    tokio::spawn(run_tablesync(env.clone(), claim, subid, relid));
    true
}

/// Entry point of a tablesync worker task.
pub(crate) async fn run_tablesync(env: Arc<ApplyEnv>, claim: WorkerClaim, subid: Oid, relid: Oid) {
    let proc = env.alloc_proc();
    let slot = match env.slots.attach(&claim, proc) {
        Ok(slot) => slot,
        Err(err) => {
            warn!(subid, relid, error = %err, "table synchronization worker could not attach");
            return;
        }
    };
    let Some(sub) = env.catalog.subscription(subid) else {
        info!(
            "logical replication worker for subscription {} will not start because the subscription was removed during startup",
            subid
        );
        return;
    };
    if !sub.enabled {
        info!(
            "logical replication worker for subscription \"{}\" will not start because the subscription was disabled during startup",
            sub.name
        );
        return;
    }

    let mut worker = ApplyWorker::new(env.clone(), proc, WorkerKind::TableSync, slot, claim.stop, sub);
    worker.sync_relid = Some(relid);
    worker.errctx.origin_name = origin_name_for_tablesync(subid, relid);
    let table = env
        .storage
        .relation(relid)
        .map(|desc| desc.name.clone())
        .unwrap_or_else(|| relid.to_string());
    info!(
        "logical replication table synchronization worker for subscription \"{}\", table \"{}\" has started",
        worker.sub.name, table
    );

    match worker.run_table_sync().await {
        Ok(()) => {}
        Err(err) if err.is_clean_exit() => info!("{err}"),
        Err(err) => error!(subscription = %worker.sub.name, relid, "{err}"),
    }
    worker.release_resources();
    // The leader may be waiting for this worker to change state or go away.
    env.slots.notify_change();
}

/// Converts copied text rows into `TupleData`.
fn copy_row(row: Vec<Option<String>>) -> TupleData {
    TupleData {
        columns: row
            .into_iter()
            .map(|v| match v {
                Some(text) => TupleValue::Text(text.into_bytes()),
                None => TupleValue::Null,
            })
            .collect(),
    }
}

impl ApplyWorker {
    /// True when the subscription has relations and all of them are READY.
    pub(crate) fn all_tablesyncs_ready(&self) -> bool {
        let states = self.env.catalog.relation_states(self.sub.oid, false);
        !states.is_empty() && states.iter().all(|s| s.state == RelState::Ready)
    }

    /// Drives the state machine from this worker's side after a commit, or
    /// while idle outside a transaction.
    pub(crate) async fn process_syncing_tables(&mut self, current_lsn: Lsn) -> Result<()> {
        match self.kind {
            WorkerKind::TableSync => self.process_syncing_tables_for_sync(current_lsn).await,
            WorkerKind::Leader => {
                self.process_syncing_tables_for_apply(current_lsn).await?;
                self.process_syncing_sequences();
                Ok(())
            }
            // Parallel appliers only touch READY relations, and the
            // sequence worker never runs the apply loop.
            WorkerKind::ParallelApply | WorkerKind::SequenceSync => Ok(()),
        }
    }

    fn sync_relid(&self) -> Result<Oid> {
        self.sync_relid
            .ok_or_else(|| ApplyError::invalid_state("tablesync worker without a relation"))
    }

    /// Tablesync side: once caught up to the leader, persist SYNCDONE, drop
    /// the slot and the origin, and exit.
    async fn process_syncing_tables_for_sync(&mut self, current_lsn: Lsn) -> Result<()> {
        let relid = self.sync_relid()?;
        let subid = self.sub.oid;
        let Some(me) = self.env.slots.find(subid, Some(relid), false) else {
            return Ok(());
        };
        if me.relstate != RelState::Catchup || current_lsn < me.relstate_lsn {
            return Ok(());
        }

        self.env.slots.set_relstate(subid, relid, RelState::SyncDone, current_lsn);
        self.env
            .catalog
            .set_relation_state(subid, relid, RelState::SyncDone, current_lsn)?;
        info!(subid, relid, lsn = %current_lsn, "table synchronization caught up");

        let slot_name = tablesync_slot_name(subid, relid, self.env.catalog.system_identifier());
        if let Some(conn) = self.conn.as_mut() {
            conn.end_streaming().await?;
            conn.drop_slot(&slot_name, false).await?;
        }

        // Ownership has to go before the origin can be dropped.
        let origin_name = origin_name_for_tablesync(subid, relid);
        self.env.origins.session_reset(self.origin, self.proc);
        self.origin = OriginId::INVALID;
        self.env.origins.drop_origin(&origin_name)?;

        Err(self.finish_sync_worker(relid))
    }

    /// The clean-exit error a finished tablesync worker leaves with.
    fn finish_sync_worker(&self, relid: Oid) -> ApplyError {
        let table = self
            .env
            .storage
            .relation(relid)
            .map(|desc| desc.name.clone())
            .unwrap_or_else(|| relid.to_string());
        self.env.slots.notify_change();
        ApplyError::PrerequisiteNotMet {
            msg: format!(
                "logical replication table synchronization worker for subscription \"{}\", table \"{}\" has finished",
                self.sub.name, table
            ),
        }
    }

    /// Leader side of the state machine.
    async fn process_syncing_tables_for_apply(&mut self, current_lsn: Lsn) -> Result<()> {
        let subid = self.sub.oid;
        let not_ready = self.env.catalog.relation_states(subid, true);
        if not_ready.is_empty() {
            self.sync_start_times.clear();
        }

        let mut changed = false;
        for rstate in not_ready {
            let relid = rstate.relid;
            if rstate.state == RelState::SyncDone {
                if current_lsn >= rstate.lsn {
                    // The tablesync worker may have died before dropping it.
                    self.drop_tablesync_origin(relid).await?;
                    self.env
                        .catalog
                        .set_relation_state(subid, relid, RelState::Ready, current_lsn)?;
                    info!(subid, relid, lsn = %current_lsn, "relation is ready");
                    changed = true;
                }
                continue;
            }

            match self.env.slots.find(subid, Some(relid), false) {
                Some(syncworker) => {
                    if syncworker.relstate == RelState::SyncWait {
                        let catchup = syncworker.relstate_lsn.max(current_lsn);
                        self.env
                            .slots
                            .set_relstate(subid, relid, RelState::Catchup, catchup);
                        debug!(subid, relid, lsn = %catchup, "told table synchronization worker to catch up");
                        self.wait_for_relation_state_change(relid, RelState::SyncDone)
                            .await?;
                        changed = true;
                    }
                }
                None => {
                    if self.env.slots.count_sync(subid)
                        >= self.env.config.max_sync_workers_per_subscription
                    {
                        continue;
                    }
                    let now = Instant::now();
                    let due = self
                        .sync_start_times
                        .get(&relid)
                        .map_or(true, |last| now.duration_since(*last) >= self.env.config.retry_interval());
                    if due {
                        let req = LaunchRequest {
                            kind: WorkerKind::TableSync,
                            subid,
                            dbid: self.sub.dbid,
                            userid: self.sub.owner,
                            relid: Some(relid),
                            leader: None,
                        };
                        launch_tablesync(&self.env, req);
                        self.sync_start_times.insert(relid, now);
                    }
                }
            }
        }

        if changed && self.sub.two_phase == TwoPhaseState::Pending && self.all_tablesyncs_ready() {
            self.env
                .catalog
                .set_two_phase_state(subid, TwoPhaseState::Enabled)?;
            self.env.forget_worker_start_time(subid);
            let msg = format!(
                "logical replication apply worker for subscription \"{}\" will restart so that two_phase can be enabled",
                self.sub.name
            );
            info!("{msg}");
            return Err(ApplyError::PrerequisiteNotMet { msg });
        }
        Ok(())
    }

    /// Leader: starts the sequence synchronization worker when sequences
    /// are waiting in INIT and none is running. Shares the sync worker cap
    /// and the retry interval with tablesync.
    fn process_syncing_sequences(&mut self) {
        let subid = self.sub.oid;
        if self.env.catalog.sequence_states(subid, true).is_empty() {
            self.seqsync_start_time = None;
            return;
        }
        if self.env.slots.find_sequencesync(subid).is_some()
            || self.env.slots.count_sync(subid) >= self.env.config.max_sync_workers_per_subscription
        {
            return;
        }
        let now = Instant::now();
        let due = self
            .seqsync_start_time
            .map_or(true, |last| now.duration_since(last) >= self.env.config.retry_interval());
        if !due {
            return;
        }
        let req = LaunchRequest {
            kind: WorkerKind::SequenceSync,
            subid,
            dbid: self.sub.dbid,
            userid: self.sub.owner,
            relid: None,
            leader: None,
        };
        if launch_sequencesync(&self.env, req) {
            self.seqsync_start_time = Some(now);
        }
    }

    /// Drops the origin of `relid`'s tablesync worker, waiting while that
    /// worker still owns it.
    async fn drop_tablesync_origin(&mut self, relid: Oid) -> Result<()> {
        let name = origin_name_for_tablesync(self.sub.oid, relid);
        let mut stop = self.stop.clone();
        loop {
            let Some(id) = self.env.origins.lookup(&name) else {
                return Ok(());
            };
            if self.env.origins.owner(id).is_none() {
                self.env.origins.drop_origin(&name)?;
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => return Err(ApplyError::Shutdown),
                _ = self.env.slots.wait_for_change(ORIGIN_POLL_INTERVAL) => {}
            }
        }
    }

    /// Leader: waits for the tablesync worker of `relid` to persist
    /// `expected`. Returns false if the relation or its worker went away.
    async fn wait_for_relation_state_change(&mut self, relid: Oid, expected: RelState) -> Result<bool> {
        let subid = self.sub.oid;
        let mut stop = self.stop.clone();
        loop {
            match self.env.catalog.relation_state(subid, relid) {
                None => return Ok(false),
                Some(row) if row.state == expected => return Ok(true),
                Some(_) => {}
            }
            if self.env.slots.find(subid, Some(relid), false).is_none() {
                return Ok(false);
            }
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => return Err(ApplyError::Shutdown),
                _ = self.env.slots.wait_for_change(STATE_POLL_INTERVAL) => {}
            }
        }
    }

    /// Tablesync: waits until the leader moves this worker to `expected`.
    /// Returns false if the leader is gone.
    async fn wait_for_worker_state_change(&mut self, expected: RelState) -> Result<bool> {
        let subid = self.sub.oid;
        let relid = self.sync_relid()?;
        let mut stop = self.stop.clone();
        loop {
            let mine = self.env.slots.find(subid, Some(relid), false);
            if mine.is_some_and(|w| w.relstate == expected) {
                return Ok(true);
            }
            if self.env.slots.find(subid, None, false).is_none() {
                return Ok(false);
            }
            self.env.slots.notify_change();
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => return Err(ApplyError::Shutdown),
                _ = self.env.slots.wait_for_change(STATE_POLL_INTERVAL) => {}
            }
        }
    }

    /// Runs a tablesync worker to completion.
    pub(crate) async fn run_table_sync(&mut self) -> Result<()> {
        let relid = self.sync_relid()?;
        let start = match self.sync_table_start().await {
            Ok(Some(lsn)) => lsn,
            Ok(None) => return Err(self.finish_sync_worker(relid)),
            Err(err) if err.is_clean_exit() => return Err(err),
            Err(err) => return self.on_apply_error(err),
        };

        let slot_name = tablesync_slot_name(self.sub.oid, relid, self.env.catalog.system_identifier());
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| ApplyError::invalid_state("no publisher connection"))?;
        let options = StreamOptions::negotiate(&self.sub, conn.server_version());
        self.parallel_apply = options.parallel_apply();
        conn.start_streaming(&slot_name, start, &options).await?;
        debug!(slot = %slot_name, %start, "table synchronization worker streaming");
        self.start_apply().await
    }

    /// Copies the table and waits for the leader. Returns the position to
    /// stream from, or `None` when there is nothing left to synchronize.
    async fn sync_table_start(&mut self) -> Result<Option<Lsn>> {
        let subid = self.sub.oid;
        let relid = self.sync_relid()?;
        let (relstate, relstate_lsn) = match self.env.catalog.relation_state(subid, relid) {
            Some(row) => (row.state, row.lsn),
            None => (RelState::Unknown, Lsn::INVALID),
        };
        self.env.slots.set_relstate(subid, relid, relstate, relstate_lsn);
        if matches!(relstate, RelState::SyncDone | RelState::Ready | RelState::Unknown) {
            return Ok(None);
        }

        let slot_name = tablesync_slot_name(subid, relid, self.env.catalog.system_identifier());
        let origin_name = origin_name_for_tablesync(subid, relid);
        let conn = self
            .env
            .connector
            .connect(&self.sub.conninfo, &slot_name)
            .await
            .map_err(|err| ApplyError::connection(format!("could not connect to the publisher: {err}")))?;
        self.conn = Some(conn);

        let origin_startpos = if relstate == RelState::FinishedCopy {
            // Copied before a crash; resume from the origin.
            let id = self.env.origins.lookup(&origin_name).ok_or_else(|| {
                ApplyError::invalid_state(format!(
                    "replication origin \"{origin_name}\" does not exist"
                ))
            })?;
            self.env.origins.session_setup(id, self.proc, None)?;
            self.origin = id;
            self.env
                .origins
                .progress(id)
                .map(|p| p.remote_lsn)
                .unwrap_or(Lsn::INVALID)
        } else {
            if relstate == RelState::DataSync {
                // A previous attempt failed mid-copy; start over.
                if let Some(conn) = self.conn.as_mut() {
                    conn.drop_slot(&slot_name, true).await?;
                }
                if self.env.origins.lookup(&origin_name).is_some() {
                    self.env.origins.drop_origin(&origin_name)?;
                }
            }
            self.copy_phase(relid, &slot_name, &origin_name).await?
        };

        debug!(origin = %origin_name, lsn = %origin_startpos, "initial copy done");
        self.env
            .slots
            .set_relstate(subid, relid, RelState::SyncWait, origin_startpos);
        self.wait_for_worker_state_change(RelState::Catchup).await?;
        Ok(Some(origin_startpos))
    }

    /// DATASYNC through FINISHEDCOPY. Returns the slot's consistent point.
    async fn copy_phase(&mut self, relid: Oid, slot_name: &str, origin_name: &str) -> Result<Lsn> {
        let subid = self.sub.oid;
        self.env.slots.set_relstate(subid, relid, RelState::DataSync, Lsn::INVALID);
        self.env
            .catalog
            .set_relation_state(subid, relid, RelState::DataSync, Lsn::INVALID)?;

        let env = self.env.clone();
        let local = env.storage.relation(relid).ok_or_else(|| ApplyError::SchemaMismatch {
            relation: relid.to_string(),
            kind: crate::error::SchemaMismatchKind::MissingRelation,
        })?;
        self.xact_locks
            .acquire(&env.locks, self.proc, LockTag::Relation { relid }, LockMode::RowExclusive)
            .await?;

        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| ApplyError::invalid_state("no publisher connection"))?;
        let origin_startpos = conn.create_slot(slot_name, false).await?;

        // Set up before the copy so that a failure here does not waste it.
        if env.origins.lookup(origin_name).is_some() {
            return Err(ApplyError::invalid_state(format!(
                "replication origin \"{origin_name}\" already exists"
            )));
        }
        let origin = env.origins.create(origin_name)?;
        env.origins.advance(origin, origin_startpos, Lsn::INVALID, true)?;
        env.origins.session_setup(origin, self.proc, None)?;
        self.origin = origin;

        let remote = conn
            .fetch_remote_relation(&local.namespace, &local.name, &self.sub.publications)
            .await?;
        let rows = conn.copy_table(&remote).await?;
        let xid = self.ensure_local_xact();
        let mapped = MappedRelation::build(&remote.body, local.clone(), env.storage.schema_generation())?;

        let mut copied: HashMap<Oid, Vec<Vec<Datum>>> = HashMap::new();
        for row in rows {
            let tuple = copy_row(row);
            let search: SearchRow = crate::dml::slot_store_data(&mapped, &tuple)?;
            let (target, values) = route_insert(env.storage.as_ref(), xid, &local, search)?;
            copied.entry(target).or_default().push(values);
        }
        let mut total = 0;
        for (target, rows) in copied {
            total += env.storage.copy_in(xid, target, rows)?;
        }

        env.catalog
            .set_relation_state(subid, relid, RelState::FinishedCopy, Lsn::INVALID)?;
        self.commit_local()?;
        info!(
            subid,
            relid,
            rows = total,
            lsn = %origin_startpos,
            "initial copy of {} finished",
            local.qualified_name()
        );
        Ok(origin_startpos)
    }
}
