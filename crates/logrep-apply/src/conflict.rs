//! Conflict reporting.
//!
//! A conflict is a remote UPDATE/DELETE whose target row is missing, or whose
//! target row was last written by a different origin. Conflicts never stop
//! the apply; each one is logged at INFO with every detail as a structured
//! field and kept in a bounded in-memory log for inspection.

use crate::lsn::Lsn;
use crate::origin::OriginId;
use crate::storage::LocalXid;
use crate::types::{now_timestamp, Oid, TimestampTz, TransactionId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tracing::info;

/// Kinds of conflicts detected while applying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictType {
    /// The row to update does not exist locally.
    UpdateMissing,
    /// The row to update was last modified by another origin.
    UpdateOriginDiffers,
    /// The row to delete does not exist locally.
    DeleteMissing,
    /// The row to delete was last modified by another origin.
    DeleteOriginDiffers,
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConflictType::UpdateMissing => "update_missing",
            ConflictType::UpdateOriginDiffers => "update_origin_differs",
            ConflictType::DeleteMissing => "delete_missing",
            ConflictType::DeleteOriginDiffers => "delete_origin_differs",
        })
    }
}

/// One detected conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Kind of conflict.
    pub kind: ConflictType,
    /// Subscription that hit it.
    pub subid: Oid,
    /// Local relation, `namespace.name`.
    pub relation: String,
    /// Remote transaction being applied.
    pub remote_xid: TransactionId,
    /// Finish LSN of that transaction.
    pub finish_lsn: Lsn,
    /// Key or old tuple sent by the publisher.
    pub remote_tuple: Option<String>,
    /// New tuple sent by the publisher (updates only).
    pub new_tuple: Option<String>,
    /// Local transaction that last wrote the existing row.
    pub local_xmin: Option<LocalXid>,
    /// Origin of the existing row.
    pub local_origin: Option<OriginId>,
    /// Commit time of the existing row.
    pub local_commit_ts: Option<TimestampTz>,
    /// When it was recorded.
    pub recorded_at: TimestampTz,
}

impl ConflictRecord {
    /// A record for a missing row.
    pub fn missing(
        kind: ConflictType,
        subid: Oid,
        relation: String,
        remote_xid: TransactionId,
        finish_lsn: Lsn,
    ) -> Self {
        Self {
            kind,
            subid,
            relation,
            remote_xid,
            finish_lsn,
            remote_tuple: None,
            new_tuple: None,
            local_xmin: None,
            local_origin: None,
            local_commit_ts: None,
            recorded_at: now_timestamp(),
        }
    }
}

/// Bounded log of recent conflicts.
#[derive(Debug)]
pub struct ConflictLog {
    records: Mutex<VecDeque<ConflictRecord>>,
    capacity: usize,
}

impl Default for ConflictLog {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ConflictLog {
    /// Keeps at most `capacity` records; older ones are dropped.
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Logs and stores a conflict.
    pub fn report(&self, record: ConflictRecord) {
        info!(
            conflict = %record.kind,
            subid = record.subid,
            relation = %record.relation,
            xid = record.remote_xid,
            finish_lsn = %record.finish_lsn,
            remote_tuple = record.remote_tuple.as_deref().unwrap_or(""),
            new_tuple = record.new_tuple.as_deref().unwrap_or(""),
            local_xmin = ?record.local_xmin,
            local_origin = ?record.local_origin,
            local_commit_ts = ?record.local_commit_ts,
            "conflict detected on relation \"{}\": {}",
            record.relation,
            record.kind
        );
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Every stored record, oldest first.
    pub fn records(&self) -> Vec<ConflictRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Stored records of one kind.
    pub fn count(&self, kind: ConflictType) -> usize {
        self.records.lock().iter().filter(|r| r.kind == kind).count()
    }

    /// Drops every stored record.
    pub fn clear(&self) {
        self.records.lock().clear();
    }
}
