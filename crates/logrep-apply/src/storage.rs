//! Local storage engine interface and an in-memory implementation.
//!
//! The apply engine never touches table files directly. It opens relations,
//! runs local transactions with savepoints and two-phase prepare, and reads
//! and writes rows through [`StorageEngine`]. [`MemoryStorage`] keeps every
//! table in memory with an undo log per transaction; writes are applied in
//! place and row-level exclusion is left to the callers' tuple locks.

use crate::error::{ApplyError, Result};
use crate::lsn::Lsn;
use crate::origin::OriginId;
use crate::types::{now_timestamp, Oid, TimestampTz};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Well-known type oids understood by the input and receive functions.
pub mod type_oid {
    use crate::types::Oid;
    /// boolean
    pub const BOOL: Oid = 16;
    /// bytea
    pub const BYTEA: Oid = 17;
    /// bigint
    pub const INT8: Oid = 20;
    /// smallint
    pub const INT2: Oid = 21;
    /// integer
    pub const INT4: Oid = 23;
    /// text
    pub const TEXT: Oid = 25;
    /// oid
    pub const OID: Oid = 26;
    /// double precision
    pub const FLOAT8: Oid = 701;
    /// character varying
    pub const VARCHAR: Oid = 1043;
}

/// SQL name of a supported type.
pub fn type_name(oid: Oid) -> &'static str {
    match oid {
        type_oid::BOOL => "boolean",
        type_oid::BYTEA => "bytea",
        type_oid::INT8 => "bigint",
        type_oid::INT2 => "smallint",
        type_oid::INT4 => "integer",
        type_oid::TEXT => "text",
        type_oid::OID => "oid",
        type_oid::FLOAT8 => "double precision",
        type_oid::VARCHAR => "character varying",
        _ => "unknown",
    }
}

/// A column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    /// SQL NULL.
    Null,
    /// boolean
    Bool(bool),
    /// smallint
    Int2(i16),
    /// integer
    Int4(i32),
    /// bigint
    Int8(i64),
    /// double precision
    Float8(f64),
    /// text and varchar
    Text(String),
    /// bytea
    Bytea(Vec<u8>),
    /// oid
    Oid(u32),
}

impl Datum {
    /// True for SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int2(v) => Some(i64::from(*v)),
            Datum::Int4(v) => Some(i64::from(*v)),
            Datum::Int8(v) => Some(*v),
            Datum::Oid(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// The type's default equality operator. NULL equals nothing.
    pub fn equals(&self, other: &Datum) -> bool {
        match (self, other) {
            (Datum::Null, _) | (_, Datum::Null) => false,
            (Datum::Bool(a), Datum::Bool(b)) => a == b,
            (Datum::Float8(a), Datum::Float8(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Datum::Text(a), Datum::Text(b)) => a == b,
            (Datum::Bytea(a), Datum::Bytea(b)) => a == b,
            (a, b) => matches!((a.as_i64(), b.as_i64()), (Some(x), Some(y)) if x == y),
        }
    }

    /// Ordering used by range partition bounds.
    fn compare(&self, other: &Datum) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Datum::Text(a), Datum::Text(b)) => Some(a.cmp(b)),
            (Datum::Float8(a), Datum::Float8(b)) => a.partial_cmp(b),
            (a, b) => match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => Some(x.cmp(&y)),
                _ => None,
            },
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => f.write_str("NULL"),
            Datum::Bool(v) => f.write_str(if *v { "t" } else { "f" }),
            Datum::Int2(v) => write!(f, "{v}"),
            Datum::Int4(v) => write!(f, "{v}"),
            Datum::Int8(v) => write!(f, "{v}"),
            Datum::Float8(v) => write!(f, "{v}"),
            Datum::Text(v) => f.write_str(v),
            Datum::Bytea(v) => {
                f.write_str("\\x")?;
                for b in v {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            Datum::Oid(v) => write!(f, "{v}"),
        }
    }
}

fn index_key_matches(value: &Datum, key: &Datum) -> bool {
    match key {
        Datum::Null => value.is_null(),
        k => value.equals(k),
    }
}

/// Parses a value in its text format (the type input function).
pub fn input_text(type_oid: Oid, text: &str) -> Result<Datum> {
    let bad = || ApplyError::InvalidTextRepresentation {
        type_name: type_name(type_oid).to_string(),
        value: text.to_string(),
    };
    let trimmed = text.trim();
    let datum = match type_oid {
        type_oid::BOOL => match trimmed.to_ascii_lowercase().as_str() {
            "t" | "true" | "y" | "yes" | "on" | "1" => Datum::Bool(true),
            "f" | "false" | "n" | "no" | "off" | "0" => Datum::Bool(false),
            _ => return Err(bad()),
        },
        type_oid::INT2 => Datum::Int2(trimmed.parse().map_err(|_| bad())?),
        type_oid::INT4 => Datum::Int4(trimmed.parse().map_err(|_| bad())?),
        type_oid::INT8 => Datum::Int8(trimmed.parse().map_err(|_| bad())?),
        type_oid::OID => Datum::Oid(trimmed.parse().map_err(|_| bad())?),
        type_oid::FLOAT8 => Datum::Float8(match trimmed {
            "Infinity" => f64::INFINITY,
            "-Infinity" => f64::NEG_INFINITY,
            "NaN" => f64::NAN,
            other => other.parse().map_err(|_| bad())?,
        }),
        type_oid::TEXT | type_oid::VARCHAR => Datum::Text(text.to_string()),
        type_oid::BYTEA => match text.strip_prefix("\\x") {
            Some(hex) => Datum::Bytea(decode_hex(hex).ok_or_else(bad)?),
            None => Datum::Bytea(text.as_bytes().to_vec()),
        },
        _ => return Err(bad()),
    };
    Ok(datum)
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Parses a value in its binary format (the type receive function).
///
/// Returns the datum and how many bytes were consumed, or `None` if the
/// buffer is too short or malformed. Callers must reject buffers that were
/// not fully consumed.
pub fn receive_binary(type_oid: Oid, buf: &[u8]) -> Option<(Datum, usize)> {
    fn fixed<const N: usize>(buf: &[u8]) -> Option<[u8; N]> {
        buf.get(..N)?.try_into().ok()
    }
    let out = match type_oid {
        type_oid::BOOL => (Datum::Bool(*buf.first()? != 0), 1),
        type_oid::INT2 => (Datum::Int2(i16::from_be_bytes(fixed(buf)?)), 2),
        type_oid::INT4 => (Datum::Int4(i32::from_be_bytes(fixed(buf)?)), 4),
        type_oid::INT8 => (Datum::Int8(i64::from_be_bytes(fixed(buf)?)), 8),
        type_oid::OID => (Datum::Oid(u32::from_be_bytes(fixed(buf)?)), 4),
        type_oid::FLOAT8 => (Datum::Float8(f64::from_be_bytes(fixed(buf)?)), 8),
        type_oid::TEXT | type_oid::VARCHAR => {
            (Datum::Text(std::str::from_utf8(buf).ok()?.to_string()), buf.len())
        }
        type_oid::BYTEA => (Datum::Bytea(buf.to_vec()), buf.len()),
        _ => return None,
    };
    Some(out)
}

/// Kind of a local relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RelKind {
    /// Ordinary table.
    #[default]
    Table,
    /// Partitioned parent; rows live in its partitions.
    Partitioned,
    /// Sequence; holds no rows, only its [`SequenceData`].
    Sequence,
}

/// Definition of a sequence relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceParams {
    /// Value type: int2, int4 or int8.
    pub type_oid: Oid,
    /// START WITH.
    pub start: i64,
    /// INCREMENT BY.
    pub increment: i64,
    /// MINVALUE.
    pub min: i64,
    /// MAXVALUE.
    pub max: i64,
    /// CYCLE.
    pub cycle: bool,
}

impl Default for SequenceParams {
    fn default() -> Self {
        Self {
            type_oid: type_oid::INT8,
            start: 1,
            increment: 1,
            min: 1,
            max: i64::MAX,
            cycle: false,
        }
    }
}

/// Current state of a sequence, as `setval()` sets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceData {
    /// Last value handed out, or the next one if not `is_called`.
    pub last_value: i64,
    /// Whether `last_value` has been handed out.
    pub is_called: bool,
}

/// Default expression of a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnDefault {
    /// A constant.
    Value(Datum),
    /// `nextval()` of the relation's sequence.
    Sequence,
}

/// A column of a local relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalColumn {
    /// Column name.
    pub name: String,
    /// Type oid.
    pub type_oid: Oid,
    /// Stored generated column.
    #[serde(default)]
    pub generated: bool,
    /// Dropped column, kept for positional layout.
    #[serde(default)]
    pub dropped: bool,
    /// Default expression.
    #[serde(default)]
    pub default: Option<ColumnDefault>,
}

/// An index key element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKey {
    /// A plain column (0-based local position).
    Column(usize),
    /// An expression.
    Expression,
}

/// Index access methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AccessMethod {
    /// B-tree.
    #[default]
    Btree,
    /// Hash.
    Hash,
    /// GiST; no equality strategy for our types.
    Gist,
    /// BRIN; no equality strategy for our types.
    Brin,
}

impl AccessMethod {
    /// Whether the method has an equality strategy usable for lookups.
    pub fn supports_equality(self) -> bool {
        matches!(self, AccessMethod::Btree | AccessMethod::Hash)
    }
}

/// A local index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalIndex {
    /// Index oid.
    pub oid: Oid,
    /// Index name.
    pub name: String,
    /// Key elements in order.
    pub keys: Vec<IndexKey>,
    /// Unique index.
    #[serde(default)]
    pub unique: bool,
    /// Primary key.
    #[serde(default)]
    pub primary: bool,
    /// Chosen as REPLICA IDENTITY USING INDEX.
    #[serde(default)]
    pub replica_identity: bool,
    /// Has a WHERE predicate.
    #[serde(default)]
    pub partial: bool,
    /// Access method.
    #[serde(default)]
    pub access_method: AccessMethod,
}

impl LocalIndex {
    /// Local column positions of the plain key columns.
    pub fn key_columns(&self) -> Vec<usize> {
        self.keys
            .iter()
            .filter_map(|k| match k {
                IndexKey::Column(i) => Some(*i),
                IndexKey::Expression => None,
            })
            .collect()
    }
}

/// Bound of one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PartitionBound {
    /// FOR VALUES IN (...).
    List(Vec<Datum>),
    /// FOR VALUES FROM (from) TO (to), upper bound exclusive.
    Range {
        /// Inclusive lower bound.
        from: Datum,
        /// Exclusive upper bound.
        to: Datum,
    },
}

impl PartitionBound {
    fn contains(&self, value: &Datum) -> bool {
        match self {
            PartitionBound::List(values) => values.iter().any(|v| v.equals(value)),
            PartitionBound::Range { from, to } => {
                matches!(
                    value.compare(from),
                    Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
                ) && matches!(value.compare(to), Some(std::cmp::Ordering::Less))
            }
        }
    }
}

/// Partitioning of a partitioned parent. Partitions share the parent's
/// column layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionSpec {
    /// Partition key column.
    pub key_column: usize,
    /// Partitions and their bounds.
    pub partitions: Vec<(Oid, PartitionBound)>,
}

/// Definition of a local relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationDesc {
    /// Relation oid.
    pub oid: Oid,
    /// Schema name.
    pub namespace: String,
    /// Relation name.
    pub name: String,
    /// Table or partitioned parent.
    #[serde(default)]
    pub kind: RelKind,
    /// Columns in local order.
    pub columns: Vec<LocalColumn>,
    /// Indexes.
    #[serde(default)]
    pub indexes: Vec<LocalIndex>,
    /// Partitioning, for partitioned parents.
    #[serde(default)]
    pub partition: Option<PartitionSpec>,
    /// Parent, for partitions.
    #[serde(default)]
    pub parent: Option<Oid>,
    /// Tables with a foreign key referencing this one.
    #[serde(default)]
    pub referenced_by: Vec<Oid>,
    /// Definition, for sequences.
    #[serde(default)]
    pub sequence: Option<SequenceParams>,
}

impl RelationDesc {
    /// An ordinary table without columns.
    pub fn table(oid: Oid, namespace: &str, name: &str) -> Self {
        Self {
            oid,
            namespace: namespace.to_string(),
            name: name.to_string(),
            kind: RelKind::Table,
            columns: Vec::new(),
            indexes: Vec::new(),
            partition: None,
            parent: None,
            referenced_by: Vec::new(),
            sequence: None,
        }
    }

    /// A sequence relation.
    pub fn sequence(oid: Oid, namespace: &str, name: &str, params: SequenceParams) -> Self {
        let mut desc = Self::table(oid, namespace, name);
        desc.kind = RelKind::Sequence;
        desc.sequence = Some(params);
        desc
    }

    /// Adds a plain column.
    pub fn column(mut self, name: &str, type_oid: Oid) -> Self {
        self.columns.push(LocalColumn {
            name: name.to_string(),
            type_oid,
            generated: false,
            dropped: false,
            default: None,
        });
        self
    }

    /// Adds a column with a default.
    pub fn column_with_default(mut self, name: &str, type_oid: Oid, default: ColumnDefault) -> Self {
        self = self.column(name, type_oid);
        if let Some(col) = self.columns.last_mut() {
            col.default = Some(default);
        }
        self
    }

    /// Adds a stored generated column.
    pub fn generated_column(mut self, name: &str, type_oid: Oid) -> Self {
        self = self.column(name, type_oid);
        if let Some(col) = self.columns.last_mut() {
            col.generated = true;
        }
        self
    }

    /// Adds an index.
    pub fn index(mut self, index: LocalIndex) -> Self {
        self.indexes.push(index);
        self
    }

    /// Adds a btree primary key over plain columns.
    pub fn primary_key(self, index_oid: Oid, columns: &[usize]) -> Self {
        let name = format!("{}_pkey", self.name);
        self.index(LocalIndex {
            oid: index_oid,
            name,
            keys: columns.iter().map(|c| IndexKey::Column(*c)).collect(),
            unique: true,
            primary: true,
            replica_identity: false,
            partial: false,
            access_method: AccessMethod::Btree,
        })
    }

    /// Marks the table as a partitioned parent.
    pub fn partitioned_by(mut self, key_column: usize, partitions: Vec<(Oid, PartitionBound)>) -> Self {
        self.kind = RelKind::Partitioned;
        self.partition = Some(PartitionSpec {
            key_column,
            partitions,
        });
        self
    }

    /// A partition of `parent` with the same columns and no indexes.
    pub fn partition_of(parent: &RelationDesc, oid: Oid, name: &str) -> Self {
        let mut desc = RelationDesc::table(oid, &parent.namespace, name);
        desc.columns = parent.columns.clone();
        desc.parent = Some(parent.oid);
        desc
    }

    /// `namespace.name`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    /// Position of a live column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| !c.dropped && c.name == name)
    }

    /// The REPLICA IDENTITY USING INDEX index.
    pub fn replica_identity_index(&self) -> Option<&LocalIndex> {
        self.indexes.iter().find(|i| i.replica_identity)
    }

    /// The primary key index.
    pub fn primary_key_index(&self) -> Option<&LocalIndex> {
        self.indexes.iter().find(|i| i.primary)
    }

    /// Replica identity index, falling back to the primary key.
    pub fn identity_or_pk(&self) -> Option<&LocalIndex> {
        self.replica_identity_index()
            .or_else(|| self.primary_key_index())
    }
}

/// Local transaction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalXid(pub u64);

impl fmt::Display for LocalXid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Row identifier within a relation.
pub type TupleId = u64;

/// A stored row with its commit metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTuple {
    /// Row identifier.
    pub tid: TupleId,
    /// Column values in local order.
    pub values: Vec<Datum>,
    /// Transaction that last wrote the row.
    pub xmin: LocalXid,
    /// Origin of the transaction that last wrote the row.
    pub origin: OriginId,
    /// Commit time of that transaction, 0 while uncommitted.
    pub commit_ts: TimestampTz,
}

/// Scan counters, useful to verify which access path a lookup used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Sequential scans started.
    pub seq_scans: u64,
    /// Index scans started.
    pub index_scans: u64,
}

/// The storage engine collaborator.
pub trait StorageEngine: Send + Sync {
    /// Resolves a relation by schema and name.
    fn relation_by_name(&self, namespace: &str, name: &str) -> Option<Arc<RelationDesc>>;
    /// Resolves a relation by oid.
    fn relation(&self, relid: Oid) -> Option<Arc<RelationDesc>>;
    /// Changes whenever a relation definition changes.
    fn schema_generation(&self) -> u64;

    /// Starts a local transaction whose writes are attributed to `origin`.
    fn begin(&self, origin: OriginId) -> LocalXid;
    /// Defines a savepoint.
    fn savepoint(&self, xid: LocalXid, name: &str) -> Result<()>;
    /// Undoes everything after the savepoint; false if there is none by that name.
    fn rollback_to_savepoint(&self, xid: LocalXid, name: &str) -> Result<bool>;
    /// Commits; returns the local commit LSN.
    fn commit(&self, xid: LocalXid) -> Result<Lsn>;
    /// Rolls back.
    fn abort(&self, xid: LocalXid) -> Result<()>;
    /// Prepares under `gid`; the transaction handle is consumed.
    fn prepare(&self, xid: LocalXid, gid: &str) -> Result<Lsn>;
    /// Commits a prepared transaction.
    fn commit_prepared(&self, gid: &str) -> Result<Lsn>;
    /// Rolls back a prepared transaction.
    fn rollback_prepared(&self, gid: &str) -> Result<Lsn>;
    /// Whether `gid` is currently prepared.
    fn is_prepared(&self, gid: &str) -> bool;

    /// Inserts a row.
    fn insert(&self, xid: LocalXid, relid: Oid, values: Vec<Datum>) -> Result<TupleId>;
    /// Replaces a row.
    fn update(&self, xid: LocalXid, relid: Oid, tid: TupleId, values: Vec<Datum>) -> Result<()>;
    /// Deletes a row.
    fn delete(&self, xid: LocalXid, relid: Oid, tid: TupleId) -> Result<()>;
    /// Reads one row.
    fn fetch(&self, relid: Oid, tid: TupleId) -> Option<StoredTuple>;
    /// Every row, in storage order.
    fn seq_scan(&self, relid: Oid) -> Result<Vec<StoredTuple>>;
    /// Rows whose leading index key columns match `key`. A NULL key entry
    /// matches NULL (`IS NULL`).
    fn index_scan(&self, relid: Oid, index_oid: Oid, key: &[Datum]) -> Result<Vec<StoredTuple>>;
    /// Truncates `relids`; returns every relation actually truncated.
    fn truncate(
        &self,
        xid: LocalXid,
        relids: &[Oid],
        cascade: bool,
        restart_seqs: bool,
    ) -> Result<Vec<Oid>>;
    /// Bulk load used by the initial copy.
    fn copy_in(&self, xid: LocalXid, relid: Oid, rows: Vec<Vec<Datum>>) -> Result<u64>;
    /// Next value of the relation's sequence.
    fn next_sequence_value(&self, xid: LocalXid, relid: Oid) -> Result<i64>;
    /// Leaf partition of a partitioned parent for a row in parent layout.
    fn route_partition(&self, relid: Oid, values: &[Datum]) -> Result<Oid>;
    /// State of a sequence relation.
    fn sequence_data(&self, relid: Oid) -> Option<SequenceData>;
    /// Sets a sequence's state, like `setval()`; undone if `xid` aborts.
    fn set_sequence_data(&self, xid: LocalXid, relid: Oid, data: SequenceData) -> Result<()>;

    /// End of local WAL written so far.
    fn wal_insert_lsn(&self) -> Lsn;
    /// End of local WAL known durable.
    fn wal_flush_lsn(&self) -> Lsn;
    /// Flushes local WAL; returns the new flush LSN.
    fn flush_wal(&self) -> Lsn;
}

#[derive(Debug, Clone)]
enum UndoRecord {
    Insert { relid: Oid, tid: TupleId },
    Update { relid: Oid, old: StoredTuple },
    Delete { relid: Oid, old: StoredTuple },
    Truncate { relid: Oid, rows: BTreeMap<TupleId, StoredTuple> },
    Sequence { relid: Oid, old: i64 },
    SequenceData { relid: Oid, old: SequenceData },
}

#[derive(Debug, Default)]
struct XactState {
    origin: OriginId,
    undo: Vec<UndoRecord>,
    savepoints: Vec<(String, usize)>,
    touched: Vec<(Oid, TupleId)>,
}

#[derive(Debug, Default)]
struct Store {
    relations: HashMap<Oid, Arc<RelationDesc>>,
    by_name: HashMap<(String, String), Oid>,
    rows: HashMap<Oid, BTreeMap<TupleId, StoredTuple>>,
    sequences: HashMap<Oid, i64>,
    sequence_data: HashMap<Oid, SequenceData>,
    xacts: HashMap<LocalXid, XactState>,
    prepared: HashMap<String, XactState>,
    next_tid: TupleId,
    next_xid: u64,
    wal_insert: u64,
    wal_flush: u64,
}

/// Snapshot of table definitions, used to seed [`MemoryStorage`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSnapshot {
    /// Relations to create.
    #[serde(default)]
    pub tables: Vec<RelationDesc>,
}

/// In-memory [`StorageEngine`].
#[derive(Debug)]
pub struct MemoryStorage {
    store: Mutex<Store>,
    schema_generation: AtomicU64,
    synchronous_commit: std::sync::atomic::AtomicBool,
    seq_scans: AtomicU64,
    index_scans: AtomicU64,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// WAL bytes charged per commit record and per change.
const COMMIT_RECORD_SIZE: u64 = 0x30;
const CHANGE_RECORD_SIZE: u64 = 0x18;

impl MemoryStorage {
    /// Empty storage; local WAL starts at `0/1000000`.
    pub fn new() -> Self {
        let store = Store {
            next_tid: 1,
            next_xid: 1000,
            wal_insert: 0x100_0000,
            wal_flush: 0x100_0000,
            ..Store::default()
        };
        Self {
            store: Mutex::new(store),
            schema_generation: AtomicU64::new(1),
            synchronous_commit: std::sync::atomic::AtomicBool::new(true),
            seq_scans: AtomicU64::new(0),
            index_scans: AtomicU64::new(0),
        }
    }

    /// Storage seeded from a snapshot.
    pub fn from_snapshot(snapshot: StorageSnapshot) -> Result<Self> {
        let storage = Self::new();
        for table in snapshot.tables {
            storage.create_table(table)?;
        }
        Ok(storage)
    }

    /// Creates a relation.
    pub fn create_table(&self, desc: RelationDesc) -> Result<Arc<RelationDesc>> {
        let mut store = self.store.lock();
        let key = (desc.namespace.clone(), desc.name.clone());
        if store.by_name.contains_key(&key) || store.relations.contains_key(&desc.oid) {
            return Err(ApplyError::storage(format!(
                "relation \"{}\" already exists",
                desc.qualified_name()
            )));
        }
        let desc = Arc::new(desc);
        store.by_name.insert(key, desc.oid);
        store.rows.insert(desc.oid, BTreeMap::new());
        store.sequences.insert(desc.oid, 1);
        if let Some(params) = desc.sequence {
            store.sequence_data.insert(
                desc.oid,
                SequenceData {
                    last_value: params.start,
                    is_called: false,
                },
            );
        }
        store.relations.insert(desc.oid, desc.clone());
        drop(store);
        self.schema_generation.fetch_add(1, Ordering::AcqRel);
        Ok(desc)
    }

    /// Replaces a relation definition (same oid). Existing rows are kept and
    /// padded or cut to the new column count.
    pub fn alter_table(&self, desc: RelationDesc) -> Result<()> {
        let mut store = self.store.lock();
        let old = store
            .relations
            .get(&desc.oid)
            .cloned()
            .ok_or_else(|| ApplyError::storage(format!("relation {} does not exist", desc.oid)))?;
        store
            .by_name
            .remove(&(old.namespace.clone(), old.name.clone()));
        store
            .by_name
            .insert((desc.namespace.clone(), desc.name.clone()), desc.oid);
        let ncols = desc.columns.len();
        if let Some(rows) = store.rows.get_mut(&desc.oid) {
            for row in rows.values_mut() {
                row.values.resize(ncols, Datum::Null);
            }
        }
        store.relations.insert(desc.oid, Arc::new(desc));
        drop(store);
        self.schema_generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// When false, commits do not flush local WAL.
    pub fn set_synchronous_commit(&self, on: bool) {
        self.synchronous_commit.store(on, Ordering::Release);
    }

    /// Row values of `relid` in storage order.
    pub fn rows(&self, relid: Oid) -> Vec<Vec<Datum>> {
        self.store
            .lock()
            .rows
            .get(&relid)
            .map(|rows| rows.values().map(|t| t.values.clone()).collect())
            .unwrap_or_default()
    }

    /// Inserts and commits rows as a local (origin-less) transaction.
    pub fn insert_local(&self, relid: Oid, rows: Vec<Vec<Datum>>) -> Result<()> {
        let xid = self.begin(OriginId::INVALID);
        for row in rows {
            self.insert(xid, relid, row)?;
        }
        self.commit(xid)?;
        Ok(())
    }

    /// Scan counters.
    pub fn scan_stats(&self) -> ScanStats {
        ScanStats {
            seq_scans: self.seq_scans.load(Ordering::Relaxed),
            index_scans: self.index_scans.load(Ordering::Relaxed),
        }
    }

    /// Number of open local transactions.
    pub fn open_transactions(&self) -> usize {
        self.store.lock().xacts.len()
    }
}

impl Store {
    fn xact(&mut self, xid: LocalXid) -> Result<&mut XactState> {
        self.xacts
            .get_mut(&xid)
            .ok_or_else(|| ApplyError::invalid_state(format!("local transaction {xid} is not in progress")))
    }

    fn desc(&self, relid: Oid) -> Result<Arc<RelationDesc>> {
        self.relations
            .get(&relid)
            .cloned()
            .ok_or_else(|| ApplyError::storage(format!("relation {relid} does not exist")))
    }

    fn writable_desc(&self, relid: Oid) -> Result<Arc<RelationDesc>> {
        let desc = self.desc(relid)?;
        match desc.kind {
            RelKind::Table => Ok(desc),
            RelKind::Partitioned => Err(ApplyError::storage(format!(
                "cannot write directly to partitioned table \"{}\"",
                desc.qualified_name()
            ))),
            RelKind::Sequence => Err(ApplyError::storage(format!(
                "cannot change sequence \"{}\"",
                desc.qualified_name()
            ))),
        }
    }

    fn check_unique(
        &self,
        desc: &RelationDesc,
        values: &[Datum],
        skip: Option<TupleId>,
    ) -> Result<()> {
        let Some(rows) = self.rows.get(&desc.oid) else {
            return Ok(());
        };
        for index in desc.indexes.iter().filter(|i| i.unique) {
            let cols = index.key_columns();
            if cols.len() != index.keys.len() || cols.iter().any(|c| values[*c].is_null()) {
                continue;
            }
            let dup = rows.values().any(|row| {
                Some(row.tid) != skip && cols.iter().all(|c| row.values[*c].equals(&values[*c]))
            });
            if dup {
                return Err(ApplyError::storage(format!(
                    "duplicate key value violates unique constraint \"{}\"",
                    index.name
                )));
            }
        }
        Ok(())
    }

    fn apply_undo(&mut self, records: Vec<UndoRecord>) {
        for record in records.into_iter().rev() {
            match record {
                UndoRecord::Insert { relid, tid } => {
                    if let Some(rows) = self.rows.get_mut(&relid) {
                        rows.remove(&tid);
                    }
                }
                UndoRecord::Update { relid, old } | UndoRecord::Delete { relid, old } => {
                    if let Some(rows) = self.rows.get_mut(&relid) {
                        rows.insert(old.tid, old);
                    }
                }
                UndoRecord::Truncate { relid, rows } => {
                    self.rows.insert(relid, rows);
                }
                UndoRecord::Sequence { relid, old } => {
                    self.sequences.insert(relid, old);
                }
                UndoRecord::SequenceData { relid, old } => {
                    self.sequence_data.insert(relid, old);
                }
            }
        }
    }

    fn write_commit_record(&mut self, changes: usize, sync: bool) -> Lsn {
        self.wal_insert += COMMIT_RECORD_SIZE + CHANGE_RECORD_SIZE * changes as u64;
        if sync {
            self.wal_flush = self.wal_insert;
        }
        Lsn(self.wal_insert)
    }

    fn stamp(&mut self, xact: &XactState) {
        let ts = now_timestamp();
        for (relid, tid) in &xact.touched {
            if let Some(row) = self.rows.get_mut(relid).and_then(|rows| rows.get_mut(tid)) {
                row.commit_ts = ts;
            }
        }
    }
}

impl StorageEngine for MemoryStorage {
    fn relation_by_name(&self, namespace: &str, name: &str) -> Option<Arc<RelationDesc>> {
        let store = self.store.lock();
        let oid = store
            .by_name
            .get(&(namespace.to_string(), name.to_string()))?;
        store.relations.get(oid).cloned()
    }

    fn relation(&self, relid: Oid) -> Option<Arc<RelationDesc>> {
        self.store.lock().relations.get(&relid).cloned()
    }

    fn schema_generation(&self) -> u64 {
        self.schema_generation.load(Ordering::Acquire)
    }

    fn begin(&self, origin: OriginId) -> LocalXid {
        let mut store = self.store.lock();
        store.next_xid += 1;
        let xid = LocalXid(store.next_xid);
        store.xacts.insert(
            xid,
            XactState {
                origin,
                ..XactState::default()
            },
        );
        xid
    }

    fn savepoint(&self, xid: LocalXid, name: &str) -> Result<()> {
        let mut store = self.store.lock();
        let xact = store.xact(xid)?;
        let mark = xact.undo.len();
        xact.savepoints.push((name.to_string(), mark));
        Ok(())
    }

    fn rollback_to_savepoint(&self, xid: LocalXid, name: &str) -> Result<bool> {
        let mut store = self.store.lock();
        let xact = store.xact(xid)?;
        let Some(pos) = xact.savepoints.iter().rposition(|(n, _)| n == name) else {
            return Ok(false);
        };
        let mark = xact.savepoints[pos].1;
        // The savepoint itself survives a rollback to it; later ones do not.
        xact.savepoints.truncate(pos + 1);
        let undone = xact.undo.split_off(mark);
        store.apply_undo(undone);
        debug!(%xid, savepoint = name, "rolled back to savepoint");
        Ok(true)
    }

    fn commit(&self, xid: LocalXid) -> Result<Lsn> {
        let sync = self.synchronous_commit.load(Ordering::Acquire);
        let mut store = self.store.lock();
        let xact = store
            .xacts
            .remove(&xid)
            .ok_or_else(|| ApplyError::invalid_state(format!("local transaction {xid} is not in progress")))?;
        store.stamp(&xact);
        Ok(store.write_commit_record(xact.undo.len(), sync))
    }

    fn abort(&self, xid: LocalXid) -> Result<()> {
        let mut store = self.store.lock();
        if let Some(xact) = store.xacts.remove(&xid) {
            store.apply_undo(xact.undo);
        }
        Ok(())
    }

    fn prepare(&self, xid: LocalXid, gid: &str) -> Result<Lsn> {
        let sync = self.synchronous_commit.load(Ordering::Acquire);
        let mut store = self.store.lock();
        if store.prepared.contains_key(gid) {
            return Err(ApplyError::storage(format!(
                "transaction identifier \"{gid}\" is already in use"
            )));
        }
        let xact = store
            .xacts
            .remove(&xid)
            .ok_or_else(|| ApplyError::invalid_state(format!("local transaction {xid} is not in progress")))?;
        let changes = xact.undo.len();
        store.prepared.insert(gid.to_string(), xact);
        Ok(store.write_commit_record(changes, sync))
    }

    fn commit_prepared(&self, gid: &str) -> Result<Lsn> {
        let sync = self.synchronous_commit.load(Ordering::Acquire);
        let mut store = self.store.lock();
        let xact = store
            .prepared
            .remove(gid)
            .ok_or_else(|| ApplyError::storage(format!("prepared transaction with identifier \"{gid}\" does not exist")))?;
        store.stamp(&xact);
        Ok(store.write_commit_record(0, sync))
    }

    fn rollback_prepared(&self, gid: &str) -> Result<Lsn> {
        let sync = self.synchronous_commit.load(Ordering::Acquire);
        let mut store = self.store.lock();
        let xact = store
            .prepared
            .remove(gid)
            .ok_or_else(|| ApplyError::storage(format!("prepared transaction with identifier \"{gid}\" does not exist")))?;
        store.apply_undo(xact.undo);
        Ok(store.write_commit_record(0, sync))
    }

    fn is_prepared(&self, gid: &str) -> bool {
        self.store.lock().prepared.contains_key(gid)
    }

    fn insert(&self, xid: LocalXid, relid: Oid, values: Vec<Datum>) -> Result<TupleId> {
        let mut store = self.store.lock();
        let desc = store.writable_desc(relid)?;
        if values.len() != desc.columns.len() {
            return Err(ApplyError::storage(format!(
                "row for \"{}\" has {} values, expected {}",
                desc.qualified_name(),
                values.len(),
                desc.columns.len()
            )));
        }
        store.check_unique(&desc, &values, None)?;
        let origin = store.xact(xid)?.origin;
        let tid = store.next_tid;
        store.next_tid += 1;
        store.rows.entry(relid).or_default().insert(
            tid,
            StoredTuple {
                tid,
                values,
                xmin: xid,
                origin,
                commit_ts: 0,
            },
        );
        let xact = store.xact(xid)?;
        xact.undo.push(UndoRecord::Insert { relid, tid });
        xact.touched.push((relid, tid));
        Ok(tid)
    }

    fn update(&self, xid: LocalXid, relid: Oid, tid: TupleId, values: Vec<Datum>) -> Result<()> {
        let mut store = self.store.lock();
        let desc = store.writable_desc(relid)?;
        store.check_unique(&desc, &values, Some(tid))?;
        let origin = store.xact(xid)?.origin;
        let row = store
            .rows
            .get_mut(&relid)
            .and_then(|rows| rows.get_mut(&tid))
            .ok_or_else(|| ApplyError::storage(format!("tuple {tid} of relation {relid} is gone")))?;
        let old = row.clone();
        row.values = values;
        row.xmin = xid;
        row.origin = origin;
        row.commit_ts = 0;
        let xact = store.xact(xid)?;
        xact.undo.push(UndoRecord::Update { relid, old });
        xact.touched.push((relid, tid));
        Ok(())
    }

    fn delete(&self, xid: LocalXid, relid: Oid, tid: TupleId) -> Result<()> {
        let mut store = self.store.lock();
        store.xact(xid)?;
        let old = store
            .rows
            .get_mut(&relid)
            .and_then(|rows| rows.remove(&tid))
            .ok_or_else(|| ApplyError::storage(format!("tuple {tid} of relation {relid} is gone")))?;
        store.xact(xid)?.undo.push(UndoRecord::Delete { relid, old });
        Ok(())
    }

    fn fetch(&self, relid: Oid, tid: TupleId) -> Option<StoredTuple> {
        self.store.lock().rows.get(&relid)?.get(&tid).cloned()
    }

    fn seq_scan(&self, relid: Oid) -> Result<Vec<StoredTuple>> {
        self.seq_scans.fetch_add(1, Ordering::Relaxed);
        let store = self.store.lock();
        store.desc(relid)?;
        Ok(store
            .rows
            .get(&relid)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn index_scan(&self, relid: Oid, index_oid: Oid, key: &[Datum]) -> Result<Vec<StoredTuple>> {
        self.index_scans.fetch_add(1, Ordering::Relaxed);
        let store = self.store.lock();
        let desc = store.desc(relid)?;
        let index = desc
            .indexes
            .iter()
            .find(|i| i.oid == index_oid)
            .ok_or_else(|| ApplyError::storage(format!("index {index_oid} does not exist")))?;
        let cols = index.key_columns();
        if key.is_empty() || key.len() > cols.len() {
            return Err(ApplyError::storage(format!(
                "index \"{}\" has {} key columns, got {}",
                index.name,
                cols.len(),
                key.len()
            )));
        }
        Ok(store
            .rows
            .get(&relid)
            .map(|rows| {
                rows.values()
                    .filter(|row| {
                        cols.iter()
                            .zip(key)
                            .all(|(c, k)| index_key_matches(&row.values[*c], k))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn truncate(
        &self,
        xid: LocalXid,
        relids: &[Oid],
        cascade: bool,
        restart_seqs: bool,
    ) -> Result<Vec<Oid>> {
        let mut store = self.store.lock();
        store.xact(xid)?;
        let mut targets: Vec<Oid> = relids.to_vec();
        let mut i = 0;
        while i < targets.len() {
            let desc = store.desc(targets[i])?;
            for referencing in &desc.referenced_by {
                if targets.contains(referencing) {
                    continue;
                }
                if !cascade {
                    return Err(ApplyError::storage(format!(
                        "cannot truncate a table referenced in a foreign key constraint: \"{}\"",
                        desc.qualified_name()
                    )));
                }
                targets.push(*referencing);
            }
            i += 1;
        }
        for relid in &targets {
            let rows = std::mem::take(store.rows.entry(*relid).or_default());
            let mut undo = vec![UndoRecord::Truncate { relid: *relid, rows }];
            if restart_seqs {
                let old = store.sequences.insert(*relid, 1).unwrap_or(1);
                undo.push(UndoRecord::Sequence { relid: *relid, old });
            }
            store.xact(xid)?.undo.extend(undo);
        }
        Ok(targets)
    }

    fn copy_in(&self, xid: LocalXid, relid: Oid, rows: Vec<Vec<Datum>>) -> Result<u64> {
        let mut n = 0;
        for row in rows {
            self.insert(xid, relid, row)?;
            n += 1;
        }
        Ok(n)
    }

    fn next_sequence_value(&self, xid: LocalXid, relid: Oid) -> Result<i64> {
        let mut store = self.store.lock();
        let old = store.sequences.get(&relid).copied().unwrap_or(1);
        store.sequences.insert(relid, old + 1);
        store
            .xact(xid)?
            .undo
            .push(UndoRecord::Sequence { relid, old });
        Ok(old)
    }

    fn route_partition(&self, relid: Oid, values: &[Datum]) -> Result<Oid> {
        let store = self.store.lock();
        let mut desc = store.desc(relid)?;
        while let Some(spec) = desc.partition.as_ref() {
            let key = values.get(spec.key_column).unwrap_or(&Datum::Null);
            let child = spec
                .partitions
                .iter()
                .find(|(_, bound)| bound.contains(key))
                .map(|(oid, _)| *oid)
                .ok_or_else(|| {
                    ApplyError::storage(format!(
                        "no partition of relation \"{}\" found for row",
                        desc.qualified_name()
                    ))
                })?;
            desc = store.desc(child)?;
        }
        Ok(desc.oid)
    }

    fn sequence_data(&self, relid: Oid) -> Option<SequenceData> {
        self.store.lock().sequence_data.get(&relid).copied()
    }

    fn set_sequence_data(&self, xid: LocalXid, relid: Oid, data: SequenceData) -> Result<()> {
        let mut store = self.store.lock();
        let desc = store.desc(relid)?;
        let params = desc.sequence.ok_or_else(|| {
            ApplyError::storage(format!("\"{}\" is not a sequence", desc.qualified_name()))
        })?;
        if data.last_value < params.min || data.last_value > params.max {
            return Err(ApplyError::storage(format!(
                "setval: value {} is out of bounds for sequence \"{}\" ({}..{})",
                data.last_value,
                desc.name,
                params.min,
                params.max
            )));
        }
        let old = store
            .sequence_data
            .get(&relid)
            .copied()
            .unwrap_or(SequenceData {
                last_value: params.start,
                is_called: false,
            });
        store.xact(xid)?.undo.push(UndoRecord::SequenceData { relid, old });
        store.sequence_data.insert(relid, data);
        Ok(())
    }

    fn wal_insert_lsn(&self) -> Lsn {
        Lsn(self.store.lock().wal_insert)
    }

    fn wal_flush_lsn(&self) -> Lsn {
        Lsn(self.store.lock().wal_flush)
    }

    fn flush_wal(&self) -> Lsn {
        let mut store = self.store.lock();
        store.wal_flush = store.wal_insert;
        Lsn(store.wal_flush)
    }
}
