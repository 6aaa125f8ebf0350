//! Sequence synchronization worker.
//!
//! One worker per subscription copies the current value of every sequence
//! still in INIT from the publisher and marks it READY with the publisher's
//! page LSN. Sequences have no catchup phase: the leader never applies
//! sequence changes, so a later refresh puts them back to INIT.

use crate::env::ApplyEnv;
use crate::error::{ApplyError, Result};
use crate::locks::{LockMode, LockTag, XactLocks};
use crate::lsn::Lsn;
use crate::origin::OriginId;
use crate::slots::{LaunchRequest, WorkerClaim};
use crate::storage::{LocalXid, RelKind};
use crate::types::{sequencesync_application_name, Oid, ProcId, RelState, Subscription};
use crate::upstream::{PublisherConnection, RemoteSequence};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Sequences fetched from the publisher and set locally per transaction.
pub const MAX_SEQUENCES_SYNC_PER_BATCH: usize = 100;

/// A sequence waiting for its first copy.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingSequence {
    seqid: Oid,
    namespace: String,
    name: String,
}

impl PendingSequence {
    fn qualified(&self) -> String {
        format!("\"{}.{}\"", self.namespace, self.name)
    }
}

/// What happened to the sequences of one run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct SyncOutcome {
    synced: usize,
    /// Dropped locally while the worker ran.
    skipped: usize,
    mismatched: Vec<String>,
    missing: Vec<String>,
}

/// Starts the sequence synchronization worker of `req.subid`. Returns
/// false if no slot was free.
pub(crate) fn launch_sequencesync(env: &Arc<ApplyEnv>, req: LaunchRequest) -> bool {
    let subid = req.subid;
    let Some(claim) = env.slots.launch(req) else {
        return false;
    };
    debug!(subid, slot = claim.slot, "launching sequence synchronization worker");
    tokio::spawn(run_sequencesync(env.clone(), claim, subid));
    true
}

/// Entry point of a sequence synchronization worker task.
pub(crate) async fn run_sequencesync(env: Arc<ApplyEnv>, claim: WorkerClaim, subid: Oid) {
    let proc = env.alloc_proc();
    let slot = match env.slots.attach(&claim, proc) {
        Ok(slot) => slot,
        Err(err) => {
            warn!(subid, error = %err, "sequence synchronization worker could not attach");
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
    info!(
        "logical replication sequence synchronization worker for subscription \"{}\" has started",
        sub.name
    );

    match sync_sequences(&env, &sub, proc, claim.stop).await {
        Ok(outcome) => info!(
            subscription = %sub.name,
            synced = outcome.synced,
            skipped = outcome.skipped,
            "logical replication sequence synchronization worker for subscription \"{}\" has finished",
            sub.name
        ),
        Err(err) if err.is_clean_exit() => info!("{err}"),
        Err(err) => on_sync_error(&env, &sub, &err),
    }

    env.locks.release_all(proc);
    drop(slot);
    // The leader relaunches us after the retry interval if anything is
    // still pending.
    env.slots.notify_change();
}

fn on_sync_error(env: &ApplyEnv, sub: &Subscription, err: &ApplyError) {
    error!(subscription = %sub.name, "{err}");
    env.catalog.report_subscription_error(sub.oid, true);
    if !sub.disable_on_error {
        return;
    }
    match env.catalog.disable_subscription(sub.oid) {
        Ok(()) => {
            env.forget_worker_start_time(sub.oid);
            info!(
                "subscription \"{}\" has been disabled because of an error",
                sub.name
            );
        }
        Err(err) => warn!(subscription = %sub.name, error = %err, "could not disable subscription"),
    }
}

/// Local sequences of `sub` still in INIT. Rows whose relation is gone or
/// is no longer a sequence are left for the next refresh to clean up.
fn pending_sequences(env: &ApplyEnv, sub: &Subscription) -> Vec<PendingSequence> {
    env.catalog
        .sequence_states(sub.oid, true)
        .into_iter()
        .filter_map(|row| {
            let desc = env.storage.relation(row.relid)?;
            if desc.kind != RelKind::Sequence || desc.sequence.is_none() {
                return None;
            }
            Some(PendingSequence {
                seqid: row.relid,
                namespace: desc.namespace.clone(),
                name: desc.name.clone(),
            })
        })
        .collect()
}

async fn sync_sequences(
    env: &ApplyEnv,
    sub: &Subscription,
    proc: ProcId,
    stop: watch::Receiver<bool>,
) -> Result<SyncOutcome> {
    let mut outcome = SyncOutcome::default();
    let pending = pending_sequences(env, sub);
    if pending.is_empty() {
        return Ok(outcome);
    }

    let app_name = sequencesync_application_name(sub.oid, env.catalog.system_identifier());
    let mut conn = env
        .connector
        .connect(&sub.conninfo, &app_name)
        .await
        .map_err(|err| {
            ApplyError::connection(format!(
                "sequencesync worker for subscription \"{}\" could not connect to the publisher: {err}",
                sub.name
            ))
        })?;

    for batch in pending.chunks(MAX_SEQUENCES_SYNC_PER_BATCH) {
        if *stop.borrow() {
            return Err(ApplyError::Shutdown);
        }
        let synced = sync_batch(env, sub, proc, conn.as_mut(), batch, &mut outcome).await?;
        debug!(
            subscription = %sub.name,
            batch = batch.len(),
            synced,
            "sequence synchronization batch committed"
        );
    }

    if !outcome.mismatched.is_empty() {
        warn!(
            "mismatched or renamed sequence(s) on subscriber ({})",
            outcome.mismatched.join(", ")
        );
    }
    if !outcome.missing.is_empty() {
        warn!(
            "missing sequence(s) on publisher ({})",
            outcome.missing.join(", ")
        );
    }
    if outcome.mismatched.is_empty() && outcome.missing.is_empty() {
        return Ok(outcome);
    }
    Err(ApplyError::SequenceSyncFailed {
        subscription: sub.name.clone(),
        mismatched: outcome.mismatched,
        missing: outcome.missing,
    })
}

/// Fetches one batch and sets it in a single local transaction. Catalog
/// rows go READY only after that transaction commits.
async fn sync_batch(
    env: &ApplyEnv,
    sub: &Subscription,
    proc: ProcId,
    conn: &mut dyn PublisherConnection,
    batch: &[PendingSequence],
    outcome: &mut SyncOutcome,
) -> Result<usize> {
    let names: Vec<(String, String)> = batch
        .iter()
        .map(|seq| (seq.namespace.clone(), seq.name.clone()))
        .collect();
    let remote = conn.fetch_sequences(&names).await?;
    if remote.len() != batch.len() {
        return Err(ApplyError::protocol(format!(
            "publisher returned {} sequences, expected {}",
            remote.len(),
            batch.len()
        )));
    }

    let xid = env.storage.begin(OriginId::INVALID);
    let mut locks = XactLocks::default();
    let result = set_batch(env, proc, xid, &mut locks, batch, remote, outcome).await;
    let result = match result {
        Ok(ready) => env.storage.commit(xid).map(|_| ready),
        Err(err) => {
            if let Err(abort_err) = env.storage.abort(xid) {
                warn!(error = %abort_err, "could not abort sequence synchronization transaction");
            }
            Err(err)
        }
    };
    locks.release(&env.locks, proc);

    let ready = result?;
    for (seqid, page_lsn) in &ready {
        env.catalog
            .set_sequence_state(sub.oid, *seqid, RelState::Ready, *page_lsn)?;
    }
    outcome.synced += ready.len();
    Ok(ready.len())
}

async fn set_batch(
    env: &ApplyEnv,
    proc: ProcId,
    xid: LocalXid,
    locks: &mut XactLocks,
    batch: &[PendingSequence],
    remote: Vec<Option<RemoteSequence>>,
    outcome: &mut SyncOutcome,
) -> Result<Vec<(Oid, Lsn)>> {
    let mut ready = Vec::with_capacity(batch.len());
    for (seq, remote) in batch.iter().zip(remote) {
        let Some(remote) = remote else {
            outcome.missing.push(seq.qualified());
            continue;
        };
        locks
            .acquire(&env.locks, proc, LockTag::Relation { relid: seq.seqid }, LockMode::RowExclusive)
            .await?;
        // Recheck under the lock; the sequence may have been dropped or
        // altered since the batch was collected.
        let Some(desc) = env.storage.relation(seq.seqid) else {
            outcome.skipped += 1;
            continue;
        };
        let renamed = desc.namespace != seq.namespace || desc.name != seq.name;
        if renamed || desc.sequence != Some(remote.params) {
            outcome.mismatched.push(seq.qualified());
            continue;
        }
        env.storage.set_sequence_data(xid, seq.seqid, remote.data)?;
        debug!(
            sequence = %seq.qualified(),
            last_value = remote.data.last_value,
            is_called = remote.data.is_called,
            "sequence synchronized"
        );
        ready.push((seq.seqid, remote.page_lsn));
    }
    Ok(ready)
}
