//! The leader apply worker of a subscription.

use crate::apply::ApplyWorker;
use crate::env::ApplyEnv;
use crate::error::{ApplyError, Result};
use crate::lsn::Lsn;
use crate::slots::{WorkerClaim, WorkerKind};
use crate::types::{origin_name_for_subscription, Oid, TwoPhaseState};
use crate::upstream::StreamOptions;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Entry point of a leader task started by the launcher.
pub(crate) async fn run_leader(env: Arc<ApplyEnv>, claim: WorkerClaim, subid: Oid) {
    let proc = env.alloc_proc();
    let slot = match env.slots.attach(&claim, proc) {
        Ok(slot) => slot,
        Err(err) => {
            warn!(subid, error = %err, "apply worker could not attach");
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

    let mut worker = ApplyWorker::new(env.clone(), proc, WorkerKind::Leader, slot, claim.stop, sub);
    info!(
        "logical replication apply worker for subscription \"{}\" has started",
        worker.sub.name
    );

    let result = worker.run().await;
    match &result {
        Ok(()) => {}
        Err(err) if err.is_clean_exit() => info!("{err}"),
        Err(err) => error!(subscription = %worker.sub.name, "{err}"),
    }

    worker.stop_parallel_appliers().await;
    worker.release_resources();
    env.slots.set_stream_fileset(worker.slot.slot(), None);
    // Tablesync workers of this subscription wait on the leader.
    env.slots.notify_change();
    env.wake_launcher();
}

impl ApplyWorker {
    /// Sets up the origin and the connection, then applies until exit.
    async fn run(&mut self) -> Result<()> {
        let subid = self.sub.oid;
        let origin_name = origin_name_for_subscription(subid);
        let origin = self.env.origins.create(&origin_name)?;
        self.env.origins.session_setup(origin, self.proc, None)?;
        self.origin = origin;
        self.errctx.origin_name = origin_name;
        let origin_startpos = self
            .env
            .origins
            .progress(origin)
            .map(|p| p.remote_lsn)
            .unwrap_or(Lsn::INVALID);

        let slot_name = self.sub.slot_name.clone().ok_or_else(|| ApplyError::PrerequisiteNotMet {
            msg: format!(
                "subscription \"{}\" has no replication slot set",
                self.sub.name
            ),
        })?;

        let conn = self
            .env
            .connector
            .connect(&self.sub.conninfo, &self.sub.name)
            .await
            .map_err(|err| ApplyError::connection(format!("could not connect to the publisher: {err}")))?;
        self.conn = Some(conn);

        let server_version = self
            .conn
            .as_ref()
            .map(|c| c.server_version())
            .unwrap_or_default();
        let mut options = StreamOptions::negotiate(&self.sub, server_version);
        self.parallel_apply = options.parallel_apply();

        // Two-phase stays pending until every relation is READY; with no
        // relations at all it stays pending too.
        let enable_two_phase =
            self.sub.two_phase == TwoPhaseState::Pending && self.all_tablesyncs_ready();
        options.two_phase = enable_two_phase || self.sub.two_phase == TwoPhaseState::Enabled;

        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| ApplyError::invalid_state("no publisher connection"))?;
        conn.start_streaming(&slot_name, origin_startpos, &options).await?;
        if enable_two_phase {
            self.env
                .catalog
                .set_two_phase_state(subid, TwoPhaseState::Enabled)?;
            self.sub.two_phase = TwoPhaseState::Enabled;
        }
        debug!(
            "logical replication apply worker for subscription \"{}\" two_phase is {}",
            self.sub.name,
            self.sub.two_phase.as_char()
        );

        self.start_apply().await
    }
}
