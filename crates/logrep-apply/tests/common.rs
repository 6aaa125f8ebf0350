//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use logrep_apply::config::StreamingDebugMode;
use logrep_apply::proto::{LogicalMessage, PrepareData, RelationBody, RelationColumn, ReplicaIdentity, TupleData};
use logrep_apply::storage::{type_oid, Datum, RelationDesc};
use logrep_apply::types::{Oid, StreamingMode, TransactionId};
use logrep_apply::{
    ApplyConfig, ApplyEnv, Catalog, ChannelPublisher, Launcher, Lsn, MemoryCatalog, MemoryStorage,
    RelState, Subscription,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// System identifier shared by the test catalog and publisher.
pub const SYSID: u64 = 7_000_001;

/// Local oid of the test table.
pub const LOCAL_RELID: Oid = 16400;

/// Publisher-side oid of the test table.
pub const REMOTE_RELID: Oid = 24600;

/// Subscription oid used by every scenario.
pub const SUBID: Oid = 16390;

/// How long a scenario waits for the workers to get somewhere.
pub const WAIT: Duration = Duration::from_secs(15);

/// A running engine wired to an in-process publisher.
pub struct Harness {
    pub env: Arc<ApplyEnv>,
    pub catalog: Arc<MemoryCatalog>,
    pub storage: Arc<MemoryStorage>,
    pub publisher: ChannelPublisher,
    shutdown: watch::Sender<bool>,
    launcher: Option<JoinHandle<()>>,
    spool: TempDir,
}

/// Short timeouts so scenarios finish quickly.
pub fn test_config(spool: &TempDir) -> ApplyConfig {
    ApplyConfig {
        max_logical_replication_workers: 6,
        max_sync_workers_per_subscription: 2,
        max_parallel_apply_workers_per_subscription: 2,
        wal_retrieve_retry_interval_ms: 100,
        wal_receiver_timeout_ms: 0,
        wal_receiver_status_interval_ms: 100,
        default_nap_time_ms: 200,
        debug_logical_replication_streaming: StreamingDebugMode::Buffered,
        spool_dir: spool.path().to_path_buf(),
        send_timeout_ms: 500,
        send_retry_interval_ms: 50,
        ..ApplyConfig::default()
    }
}

/// The published `public.items (id int4 key, v text)`.
pub fn items_body() -> RelationBody {
    RelationBody {
        relid: REMOTE_RELID,
        namespace: "public".into(),
        name: "items".into(),
        replident: ReplicaIdentity::Default,
        columns: vec![
            RelationColumn {
                is_key: true,
                name: "id".into(),
                type_oid: type_oid::INT4,
                type_modifier: -1,
            },
            RelationColumn {
                is_key: false,
                name: "v".into(),
                type_oid: type_oid::TEXT,
                type_modifier: -1,
            },
        ],
    }
}

/// The local counterpart of [`items_body`].
pub fn items_table() -> RelationDesc {
    RelationDesc::table(LOCAL_RELID, "public", "items")
        .column("id", type_oid::INT4)
        .column("v", type_oid::TEXT)
        .primary_key(LOCAL_RELID + 1, &[0])
}

/// A subscription to publication `pub1` with the given streaming mode.
pub fn subscription(stream: StreamingMode) -> Subscription {
    let mut sub = Subscription::new(SUBID, "sub1", "host=publisher dbname=postgres", vec!["pub1".into()]);
    sub.stream = stream;
    sub
}

impl Harness {
    /// Builds the engine; `state` is the catalog state of the test table.
    /// The launcher is not running yet.
    pub fn new(sub: Subscription, state: RelState, tweak: impl FnOnce(&mut ApplyConfig)) -> Self {
        let spool = TempDir::new().expect("spool dir");
        let mut config = test_config(&spool);
        tweak(&mut config);

        let catalog = Arc::new(MemoryCatalog::new(SYSID));
        let slot_name = sub.slot_name.clone().expect("slot name");
        catalog.upsert_subscription(sub);
        catalog
            .set_relation_state(SUBID, LOCAL_RELID, state, Lsn::INVALID)
            .expect("relation state");

        let storage = Arc::new(MemoryStorage::new());
        storage.create_table(items_table()).expect("create table");

        let publisher = ChannelPublisher::new(SYSID);
        publisher.add_slot(&slot_name);

        let env = ApplyEnv::new(
            config,
            catalog.clone(),
            storage.clone(),
            Arc::new(publisher.clone()),
        );
        let (shutdown, _) = watch::channel(false);
        Self {
            env,
            catalog,
            storage,
            publisher,
            shutdown,
            launcher: None,
            spool,
        }
    }

    /// Starts the launcher task.
    pub fn start(&mut self) {
        let launcher = Launcher::new(self.env.clone(), self.shutdown.subscribe());
        self.launcher = Some(tokio::spawn(launcher.run()));
    }

    /// Stops the launcher and every worker.
    pub async fn stop(mut self) {
        self.shutdown.send_replace(true);
        if let Some(launcher) = self.launcher.take() {
            tokio::time::timeout(WAIT, launcher)
                .await
                .expect("launcher shutdown")
                .expect("launcher task");
        }
    }

    /// Local rows of the test table, sorted by id.
    pub fn local_rows(&self) -> Vec<(i32, String)> {
        let mut rows: Vec<(i32, String)> = self
            .storage
            .rows(LOCAL_RELID)
            .into_iter()
            .filter_map(|row| match (row.first(), row.get(1)) {
                (Some(Datum::Int4(id)), Some(Datum::Text(v))) => Some((*id, v.clone())),
                _ => None,
            })
            .collect();
        rows.sort();
        rows
    }

    /// Every file left in the spool directory, at any depth.
    pub fn spool_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut dirs = vec![self.spool.path().to_path_buf()];
        while let Some(dir) = dirs.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    dirs.push(path);
                } else {
                    files.push(path);
                }
            }
        }
        files
    }

    /// Waits for the leader to open its stream.
    pub async fn wait_streaming(&self) {
        wait_for("leader stream", || self.publisher.live_streams() > 0).await;
    }

    /// Waits until the slot's confirmed flush reaches `lsn`.
    pub async fn wait_confirmed(&self, lsn: Lsn) {
        wait_for("confirmed flush", || {
            self.publisher
                .slot_confirmed_flush("sub1")
                .is_some_and(|flushed| flushed >= lsn)
        })
        .await;
    }

    /// Waits until the test table holds exactly `expected`.
    pub async fn wait_rows(&self, expected: &[(i32, &str)]) {
        let expected: Vec<(i32, String)> = expected.iter().map(|(id, v)| (*id, v.to_string())).collect();
        wait_for("local rows", || self.local_rows() == expected).await;
    }

    /// Waits until the catalog shows `state` for the test table.
    pub async fn wait_relation_state(&self, state: RelState) {
        wait_for("relation state", || {
            self.catalog
                .relation_state(SUBID, LOCAL_RELID)
                .is_some_and(|s| s.state == state)
        })
        .await;
    }
}

/// Polls `cond` until it holds, panicking after [`WAIT`].
pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A row of the published table.
pub fn row(id: i32, v: &str) -> TupleData {
    TupleData::from_text(&[&id.to_string(), v])
}

/// A non-streamed transaction inserting `rows`.
pub fn insert_xact(xid: TransactionId, commit_lsn: Lsn, end_lsn: Lsn, rows: &[(i32, &str)]) -> Vec<LogicalMessage> {
    let mut msgs = vec![
        LogicalMessage::Begin {
            final_lsn: commit_lsn,
            commit_time: 0,
            xid,
        },
        LogicalMessage::Relation {
            xid: None,
            body: items_body(),
        },
    ];
    msgs.extend(rows.iter().map(|(id, v)| LogicalMessage::Insert {
        xid: None,
        relid: REMOTE_RELID,
        new_tuple: row(*id, v),
    }));
    msgs.push(LogicalMessage::Commit {
        commit_lsn,
        end_lsn,
        commit_time: 0,
    });
    msgs
}

/// A transaction of `xid` inserting `rows` and ending with PREPARE under
/// the upstream GID `gid`.
pub fn prepare_xact(
    xid: TransactionId,
    gid: &str,
    prepare_lsn: Lsn,
    end_lsn: Lsn,
    rows: &[(i32, &str)],
) -> Vec<LogicalMessage> {
    let mut msgs = vec![
        LogicalMessage::BeginPrepare {
            prepare_lsn,
            end_lsn,
            prepare_time: 0,
            xid,
            gid: gid.to_string(),
        },
        LogicalMessage::Relation {
            xid: None,
            body: items_body(),
        },
    ];
    msgs.extend(rows.iter().map(|(id, v)| LogicalMessage::Insert {
        xid: None,
        relid: REMOTE_RELID,
        new_tuple: row(*id, v),
    }));
    msgs.push(LogicalMessage::Prepare(prepare_data(xid, gid, prepare_lsn, end_lsn)));
    msgs
}

/// Payload of a PREPARE or STREAM PREPARE.
pub fn prepare_data(xid: TransactionId, gid: &str, prepare_lsn: Lsn, end_lsn: Lsn) -> PrepareData {
    PrepareData {
        prepare_lsn,
        end_lsn,
        prepare_time: 0,
        xid,
        gid: gid.to_string(),
    }
}

/// One streamed chunk of `xid` inserting `rows`, each tagged with the
/// (sub)transaction that made it.
pub fn stream_chunk(
    xid: TransactionId,
    first_segment: bool,
    rows: &[(TransactionId, i32, &str)],
) -> Vec<LogicalMessage> {
    let mut msgs = vec![LogicalMessage::StreamStart { xid, first_segment }];
    if first_segment {
        msgs.push(LogicalMessage::Relation {
            xid: Some(xid),
            body: items_body(),
        });
    }
    msgs.extend(rows.iter().map(|(subxid, id, v)| LogicalMessage::Insert {
        xid: Some(*subxid),
        relid: REMOTE_RELID,
        new_tuple: row(*id, v),
    }));
    msgs.push(LogicalMessage::StreamStop);
    msgs
}

/// Commit of streamed transaction `xid`.
pub fn stream_commit(xid: TransactionId, commit_lsn: Lsn, end_lsn: Lsn) -> LogicalMessage {
    LogicalMessage::StreamCommit {
        xid,
        commit_lsn,
        end_lsn,
        commit_time: 0,
    }
}
