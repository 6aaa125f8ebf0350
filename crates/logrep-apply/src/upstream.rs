//! Connection to the publisher.
//!
//! Workers talk to the publisher only through [`PublisherConnector`] and
//! [`PublisherConnection`]. [`ChannelPublisher`] is the in-process
//! implementation: it keeps a log of published WAL groups, replays it into
//! per-stream tokio mpsc channels from a slot's confirmed position, tracks
//! slots and the rows of published tables, and records every status reply.

use crate::error::{ApplyError, Result};
use crate::lsn::Lsn;
use crate::proto::{
    CopyData, LogicalMessage, RelationBody, StandbyStatusUpdate, TupleData, TupleValue,
};
use crate::storage::{SequenceData, SequenceParams};
use crate::types::{now_timestamp, OriginFilter, StreamingMode, Subscription, TransactionId};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Protocol version without streaming.
pub const PROTO_VERSION: u32 = 1;
/// Protocol version with streaming of in-progress transactions.
pub const PROTO_STREAM_VERSION: u32 = 2;
/// Protocol version with two-phase commit.
pub const PROTO_TWOPHASE_VERSION: u32 = 3;
/// Protocol version with parallel streaming (abort LSN and time).
pub const PROTO_STREAM_PARALLEL_VERSION: u32 = 4;

/// Options sent with START_REPLICATION.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    /// Negotiated protocol version.
    pub proto_version: u32,
    /// Publications to decode.
    pub publications: Vec<String>,
    /// Send values in binary format.
    pub binary: bool,
    /// Streaming of in-progress transactions.
    pub streaming: StreamingMode,
    /// Decode prepared transactions at PREPARE time.
    pub two_phase: bool,
    /// Which upstream origins to send.
    pub origin: OriginFilter,
}

impl StreamOptions {
    /// Options for `sub` against a publisher of `server_version`.
    ///
    /// Parallel streaming needs a version 16 publisher, plain streaming a
    /// version 14 one; otherwise the mode degrades. Two-phase starts off and
    /// is turned on by the caller once the subscription's state allows it.
    pub fn negotiate(sub: &Subscription, server_version: u32) -> Self {
        let proto_version = match server_version {
            v if v >= 160000 => PROTO_STREAM_PARALLEL_VERSION,
            v if v >= 150000 => PROTO_TWOPHASE_VERSION,
            v if v >= 140000 => PROTO_STREAM_VERSION,
            _ => PROTO_VERSION,
        };
        let streaming = match sub.stream {
            StreamingMode::Parallel if server_version >= 160000 => StreamingMode::Parallel,
            StreamingMode::Off => StreamingMode::Off,
            _ if server_version >= 140000 => StreamingMode::On,
            _ => StreamingMode::Off,
        };
        Self {
            proto_version,
            publications: sub.publications.clone(),
            binary: sub.binary,
            streaming,
            two_phase: false,
            origin: sub.origin,
        }
    }

    /// Whether in-progress transactions may go to parallel appliers.
    pub fn parallel_apply(&self) -> bool {
        self.streaming == StreamingMode::Parallel
    }
}

/// Outcome of one [`PublisherConnection::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// One CopyData chunk (`'w'` or `'k'`).
    Data(Bytes),
    /// Nothing arrived within the timeout.
    Timeout,
    /// The publisher ended the stream.
    EndOfStream,
}

/// A relation as described by the publisher for the initial copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRelation {
    /// Published columns only: generated columns and columns outside every
    /// column list are left out.
    pub body: RelationBody,
    /// Publications of the subscription that include the relation.
    pub publications: Vec<String>,
}

/// A sequence as read from the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteSequence {
    /// Current state.
    pub data: SequenceData,
    /// LSN of the last change to the sequence on the publisher.
    pub page_lsn: Lsn,
    /// Definition on the publisher.
    pub params: SequenceParams,
}

/// Opens connections to a publisher.
#[async_trait]
pub trait PublisherConnector: Send + Sync {
    /// Connects using `conninfo`. The application name tells workers apart
    /// on the publisher.
    async fn connect(
        &self,
        conninfo: &str,
        application_name: &str,
    ) -> Result<Box<dyn PublisherConnection>>;
}

/// One replication connection.
#[async_trait]
pub trait PublisherConnection: Send + Sync {
    /// Publisher's system identifier.
    fn system_identifier(&self) -> u64;
    /// Publisher's server version, e.g. `160000`.
    fn server_version(&self) -> u32;

    /// Starts streaming changes of `slot` from `start`.
    async fn start_streaming(&mut self, slot: &str, start: Lsn, options: &StreamOptions)
        -> Result<()>;
    /// Waits up to `timeout` for the next chunk.
    async fn receive(&mut self, timeout: Duration) -> Result<Received>;
    /// Sends a standby status update.
    async fn send_reply(&mut self, reply: &StandbyStatusUpdate) -> Result<()>;
    /// Leaves streaming mode.
    async fn end_streaming(&mut self) -> Result<()>;

    /// Creates a permanent logical slot using a fresh snapshot, which later
    /// copies on this connection read from. Returns the consistent point.
    async fn create_slot(&mut self, slot: &str, two_phase: bool) -> Result<Lsn>;
    /// Drops a slot.
    async fn drop_slot(&mut self, slot: &str, missing_ok: bool) -> Result<()>;
    /// Describes a published table.
    async fn fetch_remote_relation(
        &mut self,
        namespace: &str,
        name: &str,
        publications: &[String],
    ) -> Result<RemoteRelation>;
    /// Rows of `relation` in text format, filtered by the row filters of its
    /// publications.
    async fn copy_table(&mut self, relation: &RemoteRelation) -> Result<Vec<Vec<Option<String>>>>;
    /// Current state of the named sequences, in request order; `None` for
    /// a sequence the publisher does not have.
    async fn fetch_sequences(
        &mut self,
        names: &[(String, String)],
    ) -> Result<Vec<Option<RemoteSequence>>>;
}

/// Row filter of one publication for one table.
pub type RowFilter = Arc<dyn Fn(&[TupleValue]) -> bool + Send + Sync>;

struct PublishedTable {
    body: RelationBody,
    publications: Vec<String>,
    generated: Vec<String>,
    column_lists: HashMap<String, Vec<String>>,
    row_filters: HashMap<String, RowFilter>,
    rows: Vec<Vec<TupleValue>>,
}

impl fmt::Debug for PublishedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishedTable")
            .field("relid", &self.body.relid)
            .field("publications", &self.publications)
            .field("rows", &self.rows.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
enum RowChange {
    Insert(u32, Vec<TupleValue>),
    Update(u32, Option<Vec<TupleValue>>, Vec<TupleValue>),
    Delete(u32, Vec<TupleValue>),
    Truncate(Vec<u32>),
}

#[derive(Debug, Default)]
struct SlotState {
    confirmed_flush: Lsn,
    two_phase: bool,
    options: Option<StreamOptions>,
}

#[derive(Debug)]
struct LiveStream {
    id: u64,
    slot: String,
    start: Lsn,
    tx: mpsc::UnboundedSender<Bytes>,
}

#[derive(Debug, Default)]
struct PublisherState {
    wal: Vec<(Lsn, Vec<Bytes>)>,
    wal_end: Lsn,
    slots: HashMap<String, SlotState>,
    streams: Vec<LiveStream>,
    next_stream: u64,
    tables: HashMap<u32, PublishedTable>,
    sequences: HashMap<(String, String), RemoteSequence>,
    sequence_fetches: usize,
    open_xact: Option<TransactionId>,
    pending: HashMap<TransactionId, Vec<(TransactionId, RowChange)>>,
    prepared: HashMap<String, Vec<(TransactionId, RowChange)>>,
    replies: Vec<(String, StandbyStatusUpdate)>,
    connections: Vec<String>,
    unavailable: bool,
}

#[derive(Debug)]
struct Shared {
    system_identifier: u64,
    server_version: Mutex<u32>,
    state: Mutex<PublisherState>,
}

/// In-process publisher.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    shared: Arc<Shared>,
}

impl ChannelPublisher {
    /// A version 16 publisher with an empty WAL.
    pub fn new(system_identifier: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                system_identifier,
                server_version: Mutex::new(160000),
                state: Mutex::new(PublisherState::default()),
            }),
        }
    }

    /// Pretends to be another server version.
    pub fn set_server_version(&self, version: u32) {
        *self.shared.server_version.lock() = version;
    }

    /// Makes new connections fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.state.lock().unavailable = unavailable;
    }

    /// Creates a slot confirmed up to the current end of WAL, as CREATE
    /// SUBSCRIPTION does.
    pub fn add_slot(&self, name: &str) {
        let mut state = self.shared.state.lock();
        let confirmed_flush = state.wal_end;
        state.slots.entry(name.to_string()).or_insert(SlotState {
            confirmed_flush,
            ..SlotState::default()
        });
    }

    /// Confirmed flush position of a slot.
    pub fn slot_confirmed_flush(&self, name: &str) -> Option<Lsn> {
        self.shared.state.lock().slots.get(name).map(|s| s.confirmed_flush)
    }

    /// Whether a slot exists.
    pub fn slot_exists(&self, name: &str) -> bool {
        self.shared.state.lock().slots.contains_key(name)
    }

    /// Options the latest stream of `slot` was started with.
    pub fn stream_options(&self, slot: &str) -> Option<StreamOptions> {
        self.shared
            .state
            .lock()
            .slots
            .get(slot)
            .and_then(|s| s.options.clone())
    }

    /// Publishes `body` in `publications` with initial `rows`. Later changes
    /// in published WAL are applied to the rows as their transactions finish.
    pub fn add_table(&self, body: RelationBody, publications: &[&str], rows: Vec<TupleData>) {
        let table = PublishedTable {
            publications: publications.iter().map(|p| p.to_string()).collect(),
            generated: Vec::new(),
            column_lists: HashMap::new(),
            row_filters: HashMap::new(),
            rows: rows.into_iter().map(|t| t.columns).collect(),
            body,
        };
        self.shared.state.lock().tables.insert(table.body.relid, table);
    }

    /// Creates or moves a sequence on the publisher.
    pub fn set_sequence(&self, namespace: &str, name: &str, sequence: RemoteSequence) {
        self.shared
            .state
            .lock()
            .sequences
            .insert((namespace.to_string(), name.to_string()), sequence);
    }

    /// Number of sequence fetch round trips served so far.
    pub fn sequence_fetches(&self) -> usize {
        self.shared.state.lock().sequence_fetches
    }

    /// Marks a published column as generated; the initial copy skips it.
    pub fn set_generated(&self, relid: u32, column: &str) {
        if let Some(t) = self.shared.state.lock().tables.get_mut(&relid) {
            t.generated.push(column.to_string());
        }
    }

    /// Restricts `publication` to `columns` of the table.
    pub fn set_column_list(&self, publication: &str, relid: u32, columns: &[&str]) {
        if let Some(t) = self.shared.state.lock().tables.get_mut(&relid) {
            t.column_lists.insert(
                publication.to_string(),
                columns.iter().map(|c| c.to_string()).collect(),
            );
        }
    }

    /// Sets the row filter of `publication` for the table.
    pub fn set_row_filter(&self, publication: &str, relid: u32, filter: RowFilter) {
        if let Some(t) = self.shared.state.lock().tables.get_mut(&relid) {
            t.row_filters.insert(publication.to_string(), filter);
        }
    }

    /// Current rows of a published table.
    pub fn table_rows(&self, relid: u32) -> Vec<Vec<TupleValue>> {
        self.shared
            .state
            .lock()
            .tables
            .get(&relid)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Appends a WAL group ending at `end_lsn` and sends it to every live
    /// stream positioned before it.
    pub fn publish(&self, end_lsn: Lsn, messages: Vec<LogicalMessage>) {
        let mut state = self.shared.state.lock();
        for msg in &messages {
            state.track(msg);
        }
        let encoded: Vec<Bytes> = messages.iter().map(LogicalMessage::encode).collect();
        state.wal_end = state.wal_end.max(end_lsn);
        let wal_end = state.wal_end;
        state.streams.retain(|s| {
            if end_lsn <= s.start {
                return true;
            }
            encoded
                .iter()
                .all(|m| s.tx.send(xlog_chunk(end_lsn, wal_end, m.clone())).is_ok())
        });
        state.wal.push((end_lsn, encoded));
        debug!(%end_lsn, messages = messages.len(), "published WAL group");
    }

    /// Current end of WAL.
    pub fn wal_end(&self) -> Lsn {
        self.shared.state.lock().wal_end
    }

    /// Sends a keepalive asking every live stream for a reply.
    pub fn request_reply(&self) {
        let mut state = self.shared.state.lock();
        let chunk = CopyData::Keepalive {
            end_lsn: state.wal_end,
            send_time: now_timestamp(),
            reply_requested: true,
        }
        .encode();
        state.streams.retain(|s| s.tx.send(chunk.clone()).is_ok());
    }

    /// Ends every live stream.
    pub fn disconnect_all(&self) {
        self.shared.state.lock().streams.clear();
    }

    /// Every status reply received, with the slot it was sent on.
    pub fn replies(&self) -> Vec<(String, StandbyStatusUpdate)> {
        self.shared.state.lock().replies.clone()
    }

    /// Application names of every connection made so far.
    pub fn connections(&self) -> Vec<String> {
        self.shared.state.lock().connections.clone()
    }

    /// Number of live streams.
    pub fn live_streams(&self) -> usize {
        self.shared.state.lock().streams.len()
    }
}

fn xlog_chunk(start: Lsn, end: Lsn, data: Bytes) -> Bytes {
    CopyData::XLogData {
        start_lsn: start,
        end_lsn: end,
        send_time: now_timestamp(),
        data,
    }
    .encode()
}

impl PublisherState {
    /// Follows transaction boundaries so published tables reflect every
    /// finished transaction.
    fn track(&mut self, msg: &LogicalMessage) {
        match msg {
            LogicalMessage::Begin { xid, .. } | LogicalMessage::BeginPrepare { xid, .. } => {
                self.open_xact = Some(*xid);
                self.pending.entry(*xid).or_default();
            }
            LogicalMessage::StreamStart { xid, .. } => {
                self.open_xact = Some(*xid);
                self.pending.entry(*xid).or_default();
            }
            LogicalMessage::StreamStop => self.open_xact = None,
            LogicalMessage::Commit { .. } => {
                if let Some(xid) = self.open_xact.take() {
                    let changes = self.pending.remove(&xid).unwrap_or_default();
                    self.apply_changes(changes);
                }
            }
            LogicalMessage::Prepare(data) => {
                self.open_xact = None;
                let changes = self.pending.remove(&data.xid).unwrap_or_default();
                self.prepared.insert(data.gid.clone(), changes);
            }
            LogicalMessage::StreamPrepare(data) => {
                let changes = self.pending.remove(&data.xid).unwrap_or_default();
                self.prepared.insert(data.gid.clone(), changes);
            }
            LogicalMessage::CommitPrepared { gid, .. } => {
                let changes = self.prepared.remove(gid).unwrap_or_default();
                self.apply_changes(changes);
            }
            LogicalMessage::RollbackPrepared { gid, .. } => {
                self.prepared.remove(gid);
            }
            LogicalMessage::StreamCommit { xid, .. } => {
                let changes = self.pending.remove(xid).unwrap_or_default();
                self.apply_changes(changes);
            }
            LogicalMessage::StreamAbort { xid, subxid, .. } => {
                if xid == subxid {
                    self.pending.remove(xid);
                } else if let Some(changes) = self.pending.get_mut(xid) {
                    if let Some(pos) = changes.iter().position(|(s, _)| s == subxid) {
                        changes.truncate(pos);
                    }
                }
            }
            LogicalMessage::Insert {
                xid,
                relid,
                new_tuple,
            } => self.record(*xid, RowChange::Insert(*relid, new_tuple.columns.clone())),
            LogicalMessage::Update {
                xid,
                relid,
                old_tuple,
                new_tuple,
            } => self.record(
                *xid,
                RowChange::Update(
                    *relid,
                    old_tuple.as_ref().map(|t| t.columns.clone()),
                    new_tuple.columns.clone(),
                ),
            ),
            LogicalMessage::Delete {
                xid,
                relid,
                old_tuple,
            } => self.record(*xid, RowChange::Delete(*relid, old_tuple.columns.clone())),
            LogicalMessage::Truncate { xid, relids, .. } => {
                self.record(*xid, RowChange::Truncate(relids.clone()))
            }
            _ => {}
        }
    }

    fn record(&mut self, subxid: Option<TransactionId>, change: RowChange) {
        let Some(top) = self.open_xact else {
            return;
        };
        self.pending
            .entry(top)
            .or_default()
            .push((subxid.unwrap_or(top), change));
    }

    fn apply_changes(&mut self, changes: Vec<(TransactionId, RowChange)>) {
        for (_, change) in changes {
            match change {
                RowChange::Insert(relid, row) => {
                    if let Some(t) = self.tables.get_mut(&relid) {
                        t.rows.push(row);
                    }
                }
                RowChange::Update(relid, old, new) => {
                    if let Some(t) = self.tables.get_mut(&relid) {
                        let key = old.as_ref().unwrap_or(&new);
                        if let Some(pos) = t.find_row(key) {
                            for (have, value) in t.rows[pos].iter_mut().zip(new) {
                                if value != TupleValue::Unchanged {
                                    *have = value;
                                }
                            }
                        }
                    }
                }
                RowChange::Delete(relid, old) => {
                    if let Some(t) = self.tables.get_mut(&relid) {
                        if let Some(pos) = t.find_row(&old) {
                            t.rows.remove(pos);
                        }
                    }
                }
                RowChange::Truncate(relids) => {
                    for relid in relids {
                        if let Some(t) = self.tables.get_mut(&relid) {
                            t.rows.clear();
                        }
                    }
                }
            }
        }
    }
}

impl PublishedTable {
    /// Matches on key columns, or on every sent column without a key.
    fn find_row(&self, key: &[TupleValue]) -> Option<usize> {
        let has_key = self.body.columns.iter().any(|c| c.is_key);
        self.rows.iter().position(|row| {
            self.body
                .columns
                .iter()
                .zip(row.iter().zip(key))
                .all(|(col, (have, want))| {
                    (has_key && !col.is_key) || *want == TupleValue::Unchanged || have == want
                })
        })
    }

    fn describe(&self, publications: &[String]) -> RemoteRelation {
        let pubs: Vec<String> = publications
            .iter()
            .filter(|p| self.publications.contains(p))
            .cloned()
            .collect();
        let all_columns = pubs.iter().any(|p| !self.column_lists.contains_key(p));
        let columns = self
            .body
            .columns
            .iter()
            .filter(|c| !self.generated.contains(&c.name))
            .filter(|c| {
                all_columns
                    || pubs.iter().any(|p| {
                        self.column_lists
                            .get(p)
                            .is_some_and(|list| list.contains(&c.name))
                    })
            })
            .cloned()
            .collect();
        RemoteRelation {
            body: RelationBody {
                columns,
                ..self.body.clone()
            },
            publications: pubs,
        }
    }

    fn copy_rows(&self, rows: &[Vec<TupleValue>], relation: &RemoteRelation) -> Vec<Vec<Option<String>>> {
        let filters: Vec<&RowFilter> = relation
            .publications
            .iter()
            .map(|p| self.row_filters.get(p))
            .collect::<Option<Vec<_>>>()
            .unwrap_or_default();
        let positions: Vec<usize> = relation
            .body
            .columns
            .iter()
            .filter_map(|c| self.body.columns.iter().position(|b| b.name == c.name))
            .collect();
        rows.iter()
            .filter(|row| filters.is_empty() || filters.iter().any(|f| f(row.as_slice())))
            .map(|row| {
                positions
                    .iter()
                    .map(|&i| match row.get(i) {
                        Some(TupleValue::Text(b)) | Some(TupleValue::Binary(b)) => {
                            Some(String::from_utf8_lossy(b).into_owned())
                        }
                        _ => None,
                    })
                    .collect()
            })
            .collect()
    }
}

#[async_trait]
impl PublisherConnector for ChannelPublisher {
    async fn connect(
        &self,
        conninfo: &str,
        application_name: &str,
    ) -> Result<Box<dyn PublisherConnection>> {
        {
            let mut state = self.shared.state.lock();
            if state.unavailable {
                return Err(ApplyError::connection(format!(
                    "could not connect to the publisher: {conninfo} is not accepting connections"
                )));
            }
            state.connections.push(application_name.to_string());
        }
        debug!(application_name, "connected to publisher");
        Ok(Box::new(ChannelConnection {
            shared: self.shared.clone(),
            stream: None,
            snapshot: None,
        }))
    }
}

#[derive(Debug)]
struct ActiveStream {
    id: u64,
    slot: String,
    rx: mpsc::UnboundedReceiver<Bytes>,
    keepalive_lsn: Lsn,
}

/// A connection to a [`ChannelPublisher`].
#[derive(Debug)]
pub struct ChannelConnection {
    shared: Arc<Shared>,
    stream: Option<ActiveStream>,
    snapshot: Option<HashMap<u32, Vec<Vec<TupleValue>>>>,
}

impl ChannelConnection {
    fn stop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.shared
                .state
                .lock()
                .streams
                .retain(|s| s.id != stream.id);
        }
    }
}

impl Drop for ChannelConnection {
    fn drop(&mut self) {
        self.stop_stream();
    }
}

#[async_trait]
impl PublisherConnection for ChannelConnection {
    fn system_identifier(&self) -> u64 {
        self.shared.system_identifier
    }

    fn server_version(&self) -> u32 {
        *self.shared.server_version.lock()
    }

    async fn start_streaming(
        &mut self,
        slot: &str,
        start: Lsn,
        options: &StreamOptions,
    ) -> Result<()> {
        self.stop_stream();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.shared.state.lock();
        let slot_state = state.slots.get_mut(slot).ok_or_else(|| ApplyError::PrerequisiteNotMet {
            msg: format!("replication slot \"{slot}\" does not exist"),
        })?;
        slot_state.options = Some(options.clone());
        let from = start.max(slot_state.confirmed_flush);
        let wal_end = state.wal_end;
        for (end_lsn, messages) in &state.wal {
            if *end_lsn <= from {
                continue;
            }
            for m in messages {
                // The receiver is alive: it is still in this scope.
                let _ = tx.send(xlog_chunk(*end_lsn, wal_end, m.clone()));
            }
        }
        state.next_stream += 1;
        let id = state.next_stream;
        state.streams.push(LiveStream {
            id,
            slot: slot.to_string(),
            start: from,
            tx,
        });
        drop(state);
        info!(slot, start = %from, proto_version = options.proto_version, "started logical replication stream");
        self.stream = Some(ActiveStream {
            id,
            slot: slot.to_string(),
            rx,
            keepalive_lsn: Lsn::INVALID,
        });
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Received> {
        let shared = self.shared.clone();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ApplyError::invalid_state("connection is not streaming"))?;
        match stream.rx.try_recv() {
            Ok(chunk) => return Ok(Received::Data(chunk)),
            Err(mpsc::error::TryRecvError::Disconnected) => return Ok(Received::EndOfStream),
            Err(mpsc::error::TryRecvError::Empty) => {}
        }
        // Idle: a walsender reports its WAL end so the receiver can move on.
        let wal_end = shared.state.lock().wal_end;
        if wal_end > stream.keepalive_lsn {
            stream.keepalive_lsn = wal_end;
            return Ok(Received::Data(
                CopyData::Keepalive {
                    end_lsn: wal_end,
                    send_time: now_timestamp(),
                    reply_requested: false,
                }
                .encode(),
            ));
        }
        match tokio::time::timeout(timeout, stream.rx.recv()).await {
            Ok(Some(chunk)) => Ok(Received::Data(chunk)),
            Ok(None) => Ok(Received::EndOfStream),
            Err(_) => Ok(Received::Timeout),
        }
    }

    async fn send_reply(&mut self, reply: &StandbyStatusUpdate) -> Result<()> {
        let slot = self
            .stream
            .as_ref()
            .map(|s| s.slot.clone())
            .ok_or_else(|| ApplyError::invalid_state("connection is not streaming"))?;
        // Through the wire format, as a real reply would travel.
        let reply = StandbyStatusUpdate::decode(&reply.encode())?;
        let mut state = self.shared.state.lock();
        if let Some(s) = state.slots.get_mut(&slot) {
            s.confirmed_flush = s.confirmed_flush.max(reply.flush_lsn);
        }
        state.replies.push((slot, reply));
        Ok(())
    }

    async fn end_streaming(&mut self) -> Result<()> {
        self.stop_stream();
        Ok(())
    }

    async fn create_slot(&mut self, slot: &str, two_phase: bool) -> Result<Lsn> {
        let mut state = self.shared.state.lock();
        if state.slots.contains_key(slot) {
            return Err(ApplyError::invalid_state(format!(
                "replication slot \"{slot}\" already exists"
            )));
        }
        let consistent = state.wal_end;
        state.slots.insert(
            slot.to_string(),
            SlotState {
                confirmed_flush: consistent,
                two_phase,
                options: None,
            },
        );
        self.snapshot = Some(
            state
                .tables
                .iter()
                .map(|(relid, t)| (*relid, t.rows.clone()))
                .collect(),
        );
        info!(slot, %consistent, "created replication slot");
        Ok(consistent)
    }

    async fn drop_slot(&mut self, slot: &str, missing_ok: bool) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.slots.remove(slot).is_none() && !missing_ok {
            return Err(ApplyError::PrerequisiteNotMet {
                msg: format!("replication slot \"{slot}\" does not exist"),
            });
        }
        state.streams.retain(|s| s.slot != slot);
        debug!(slot, "dropped replication slot");
        Ok(())
    }

    async fn fetch_remote_relation(
        &mut self,
        namespace: &str,
        name: &str,
        publications: &[String],
    ) -> Result<RemoteRelation> {
        let state = self.shared.state.lock();
        state
            .tables
            .values()
            .find(|t| t.body.namespace == namespace && t.body.name == name)
            .map(|t| t.describe(publications))
            .filter(|r| !r.publications.is_empty())
            .ok_or_else(|| {
                ApplyError::invalid_state(format!(
                    "table \"{namespace}.{name}\" not found on publisher"
                ))
            })
    }

    async fn copy_table(&mut self, relation: &RemoteRelation) -> Result<Vec<Vec<Option<String>>>> {
        let state = self.shared.state.lock();
        let relid = relation.body.relid;
        let table = state.tables.get(&relid).ok_or_else(|| {
            ApplyError::invalid_state(format!("table with remote id {relid} not found on publisher"))
        })?;
        let rows = match &self.snapshot {
            Some(snapshot) => snapshot.get(&relid).cloned().unwrap_or_default(),
            None => table.rows.clone(),
        };
        Ok(table.copy_rows(&rows, relation))
    }

    async fn fetch_sequences(
        &mut self,
        names: &[(String, String)],
    ) -> Result<Vec<Option<RemoteSequence>>> {
        let mut state = self.shared.state.lock();
        state.sequence_fetches += 1;
        Ok(names.iter().map(|key| state.sequences.get(key).copied()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{RelationColumn, ReplicaIdentity};
    use crate::storage::type_oid;

    fn body() -> RelationBody {
        RelationBody {
            relid: 16500,
            namespace: "public".into(),
            name: "t".into(),
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

    fn insert(xid: u32, id: &str, v: &str) -> Vec<LogicalMessage> {
        vec![
            LogicalMessage::Begin {
                final_lsn: Lsn(0),
                commit_time: 0,
                xid,
            },
            LogicalMessage::Insert {
                xid: None,
                relid: 16500,
                new_tuple: TupleData::from_text(&[id, v]),
            },
            LogicalMessage::Commit {
                commit_lsn: Lsn(0),
                end_lsn: Lsn(0),
                commit_time: 0,
            },
        ]
    }

    fn options() -> StreamOptions {
        StreamOptions::negotiate(&Subscription::new(1, "s", "c", vec!["p".into()]), 160000)
    }

    async fn next_message(conn: &mut Box<dyn PublisherConnection>) -> Option<LogicalMessage> {
        loop {
            match conn.receive(Duration::from_millis(50)).await.unwrap() {
                Received::Data(chunk) => match CopyData::decode(&chunk).unwrap() {
                    CopyData::XLogData { data, .. } => {
                        return Some(LogicalMessage::decode(&data, false).unwrap())
                    }
                    CopyData::Keepalive { .. } => continue,
                },
                _ => return None,
            }
        }
    }

    #[tokio::test]
    async fn test_stream_resumes_after_confirmed_flush() {
        let publisher = ChannelPublisher::new(7);
        publisher.add_slot("sub");
        publisher.publish(Lsn(0x100), insert(10, "1", "a"));
        publisher.publish(Lsn(0x200), insert(11, "2", "b"));

        let mut conn = publisher.connect("host=pub", "sub").await.unwrap();
        conn.start_streaming("sub", Lsn(0x100), &options()).await.unwrap();
        match next_message(&mut conn).await {
            Some(LogicalMessage::Begin { xid, .. }) => assert_eq!(xid, 11),
            other => panic!("unexpected {other:?}"),
        }
        conn.send_reply(&StandbyStatusUpdate {
            write_lsn: Lsn(0x200),
            flush_lsn: Lsn(0x200),
            apply_lsn: Lsn(0x200),
            send_time: 1,
            reply_requested: false,
        })
        .await
        .unwrap();
        assert_eq!(publisher.slot_confirmed_flush("sub"), Some(Lsn(0x200)));
        assert_eq!(publisher.replies().len(), 1);

        let mut conn = publisher.connect("host=pub", "sub").await.unwrap();
        conn.start_streaming("sub", Lsn::INVALID, &options()).await.unwrap();
        assert_eq!(next_message(&mut conn).await, None);
        publisher.publish(Lsn(0x300), insert(12, "3", "c"));
        assert!(matches!(
            next_message(&mut conn).await,
            Some(LogicalMessage::Begin { xid: 12, .. })
        ));
    }

    #[tokio::test]
    async fn test_idle_keepalive_reports_wal_end() {
        let publisher = ChannelPublisher::new(7);
        publisher.publish(Lsn(0xA0), insert(10, "1", "a"));
        publisher.add_slot("sync");
        let mut conn = publisher.connect("c", "sync").await.unwrap();
        conn.start_streaming("sync", Lsn(0xA0), &options()).await.unwrap();
        match conn.receive(Duration::from_millis(10)).await.unwrap() {
            Received::Data(chunk) => assert!(matches!(
                CopyData::decode(&chunk).unwrap(),
                CopyData::Keepalive {
                    end_lsn: Lsn(0xA0),
                    reply_requested: false,
                    ..
                }
            )),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            conn.receive(Duration::from_millis(10)).await.unwrap(),
            Received::Timeout
        );
        publisher.disconnect_all();
        assert_eq!(
            conn.receive(Duration::from_millis(10)).await.unwrap(),
            Received::EndOfStream
        );
    }

    #[tokio::test]
    async fn test_copy_uses_slot_snapshot() {
        let publisher = ChannelPublisher::new(7);
        publisher.add_table(body(), &["p"], vec![TupleData::from_text(&["1", "a"])]);
        publisher.publish(Lsn(0x90), insert(10, "2", "b"));
        assert_eq!(publisher.table_rows(16500).len(), 2);

        let mut conn = publisher.connect("c", "pg_1_sync_16500_7").await.unwrap();
        let consistent = conn.create_slot("pg_1_sync_16500_7", false).await.unwrap();
        assert_eq!(consistent, Lsn(0x90));
        publisher.publish(Lsn(0xA0), insert(11, "3", "c"));

        let rel = conn
            .fetch_remote_relation("public", "t", &["p".to_string()])
            .await
            .unwrap();
        let rows = conn.copy_table(&rel).await.unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Some("1".to_string()), Some("a".to_string())],
                vec![Some("2".to_string()), Some("b".to_string())],
            ]
        );
    }

    #[tokio::test]
    async fn test_row_filters_are_or_combined_and_column_lists_unioned() {
        let publisher = ChannelPublisher::new(7);
        publisher.add_table(
            body(),
            &["p1", "p2"],
            vec![
                TupleData::from_text(&["1", "a"]),
                TupleData::from_text(&["2", "b"]),
                TupleData::from_text(&["3", "c"]),
            ],
        );
        publisher.set_row_filter("p1", 16500, Arc::new(|row: &[TupleValue]| row[0] == TupleValue::text("1")));
        publisher.set_row_filter("p2", 16500, Arc::new(|row: &[TupleValue]| row[1] == TupleValue::text("c")));
        publisher.set_column_list("p1", 16500, &["id"]);
        publisher.set_column_list("p2", 16500, &["id"]);

        let mut conn = publisher.connect("c", "x").await.unwrap();
        let pubs = vec!["p1".to_string(), "p2".to_string()];
        let rel = conn.fetch_remote_relation("public", "t", &pubs).await.unwrap();
        assert_eq!(rel.body.columns.len(), 1);
        let rows = conn.copy_table(&rel).await.unwrap();
        assert_eq!(rows, vec![vec![Some("1".to_string())], vec![Some("3".to_string())]]);
    }

    #[tokio::test]
    async fn test_streamed_subxact_abort_is_not_published() {
        let publisher = ChannelPublisher::new(7);
        publisher.add_table(body(), &["p"], vec![]);
        publisher.publish(
            Lsn(0x150),
            vec![
                LogicalMessage::StreamStart {
                    xid: 300,
                    first_segment: true,
                },
                LogicalMessage::Insert {
                    xid: Some(300),
                    relid: 16500,
                    new_tuple: TupleData::from_text(&["10", "x"]),
                },
                LogicalMessage::Insert {
                    xid: Some(301),
                    relid: 16500,
                    new_tuple: TupleData::from_text(&["11", "y"]),
                },
                LogicalMessage::StreamStop,
                LogicalMessage::StreamAbort {
                    xid: 300,
                    subxid: 301,
                    abort_lsn: Lsn(0x160),
                    abort_time: 0,
                },
                LogicalMessage::StreamCommit {
                    xid: 300,
                    commit_lsn: Lsn(0x170),
                    end_lsn: Lsn(0x180),
                    commit_time: 0,
                },
            ],
        );
        assert_eq!(
            publisher.table_rows(16500),
            vec![vec![TupleValue::text("10"), TupleValue::text("x")]]
        );
    }

    #[tokio::test]
    async fn test_fetch_sequences_keeps_request_order() {
        let publisher = ChannelPublisher::new(7);
        let seq = RemoteSequence {
            data: SequenceData {
                last_value: 42,
                is_called: true,
            },
            page_lsn: Lsn(0x500),
            params: SequenceParams::default(),
        };
        publisher.set_sequence("public", "s1", seq);
        let mut conn = publisher.connect("c", "seqsync").await.unwrap();
        let names = vec![
            ("public".to_string(), "gone".to_string()),
            ("public".to_string(), "s1".to_string()),
        ];
        let got = conn.fetch_sequences(&names).await.unwrap();
        assert_eq!(got, vec![None, Some(seq)]);
        assert_eq!(publisher.sequence_fetches(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_and_missing_slot() {
        let publisher = ChannelPublisher::new(7);
        publisher.set_unavailable(true);
        let err = publisher.connect("c", "a").await.err().unwrap();
        assert!(matches!(err, ApplyError::ConnectionFailure { .. }));
        publisher.set_unavailable(false);
        let mut conn = publisher.connect("c", "a").await.unwrap();
        let err = conn
            .start_streaming("nope", Lsn::INVALID, &options())
            .await
            .unwrap_err();
        assert!(err.is_clean_exit());
        conn.drop_slot("nope", true).await.unwrap();
        assert!(conn.drop_slot("nope", false).await.is_err());
    }

    #[test]
    fn test_negotiate_degrades_streaming() {
        let mut sub = Subscription::new(1, "s", "c", vec![]);
        sub.stream = StreamingMode::Parallel;
        let opts = StreamOptions::negotiate(&sub, 160000);
        assert!(opts.parallel_apply());
        assert_eq!(opts.proto_version, PROTO_STREAM_PARALLEL_VERSION);
        let opts = StreamOptions::negotiate(&sub, 150000);
        assert_eq!(opts.streaming, StreamingMode::On);
        assert_eq!(opts.proto_version, PROTO_TWOPHASE_VERSION);
        let opts = StreamOptions::negotiate(&sub, 130000);
        assert_eq!(opts.streaming, StreamingMode::Off);
    }
}
