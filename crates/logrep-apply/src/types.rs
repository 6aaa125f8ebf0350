//! Shared identifiers and catalog row types for the apply engine.

use crate::lsn::Lsn;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Catalog object identifier (subscriptions, relations, databases, roles).
pub type Oid = u32;

/// The invalid object identifier.
pub const INVALID_OID: Oid = 0;

/// Remote (publisher-side) transaction identifier.
pub type TransactionId = u32;

/// The invalid transaction identifier.
pub const INVALID_XID: TransactionId = 0;

/// Microseconds since the Unix epoch.
pub type TimestampTz = i64;

/// Returns the current time as a [`TimestampTz`].
pub fn now_timestamp() -> TimestampTz {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as TimestampTz)
        .unwrap_or(0)
}

/// Identifier of a worker "process" (a task with its own lock ownership).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcId(pub u32);

impl fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc {}", self.0)
    }
}

/// How a subscription applies large streamed transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingMode {
    /// The publisher decodes whole transactions before sending.
    #[default]
    Off,
    /// Streamed chunks are spooled to disk and applied at commit.
    On,
    /// Streamed chunks are handed to parallel appliers.
    Parallel,
}

/// Two-phase commit state of a subscription. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TwoPhaseState {
    /// Prepared transactions are decoded as ordinary commits.
    #[default]
    Disabled,
    /// Requested; waiting for every relation to become READY.
    Pending,
    /// Active: PREPARE/COMMIT PREPARED are replayed.
    Enabled,
}

impl TwoPhaseState {
    /// Catalog character for this state.
    pub fn as_char(self) -> char {
        match self {
            TwoPhaseState::Disabled => 'd',
            TwoPhaseState::Pending => 'p',
            TwoPhaseState::Enabled => 'e',
        }
    }
}

/// Which upstream changes the publisher should send, by origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginFilter {
    /// Send changes regardless of their origin.
    #[default]
    Any,
    /// Send only changes without an origin.
    None,
}

/// A subscription row, as the workers see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription oid.
    pub oid: Oid,
    /// Database the subscription lives in.
    pub dbid: Oid,
    /// Subscription name.
    pub name: String,
    /// Owning role.
    pub owner: Oid,
    /// Whether the owner currently holds superuser.
    #[serde(default)]
    pub owner_superuser: bool,
    /// Whether workers should run.
    pub enabled: bool,
    /// Upstream connection descriptor.
    pub conninfo: String,
    /// Upstream replication slot name.
    #[serde(default)]
    pub slot_name: Option<String>,
    /// Publications subscribed to.
    pub publications: Vec<String>,
    /// Request binary tuple format.
    #[serde(default)]
    pub binary: bool,
    /// Streaming mode.
    #[serde(default)]
    pub stream: StreamingMode,
    /// Two-phase commit state.
    #[serde(default)]
    pub two_phase: TwoPhaseState,
    /// Finish LSN of a remote transaction to skip, or invalid.
    #[serde(default)]
    pub skip_lsn: Lsn,
    /// Apply changes as the subscription owner rather than the table owner.
    #[serde(default)]
    pub run_as_owner: bool,
    /// Disable the subscription instead of retrying after an apply error.
    #[serde(default)]
    pub disable_on_error: bool,
    /// Origin filter requested from the publisher.
    #[serde(default)]
    pub origin: OriginFilter,
}

impl Subscription {
    /// Builds an enabled subscription with default options.
    pub fn new(oid: Oid, name: &str, conninfo: &str, publications: Vec<String>) -> Self {
        Self {
            oid,
            dbid: 1,
            name: name.to_string(),
            owner: 10,
            owner_superuser: true,
            enabled: true,
            conninfo: conninfo.to_string(),
            slot_name: Some(name.to_string()),
            publications,
            binary: false,
            stream: StreamingMode::Off,
            two_phase: TwoPhaseState::Disabled,
            skip_lsn: Lsn::INVALID,
            run_as_owner: false,
            disable_on_error: false,
            origin: OriginFilter::Any,
        }
    }
}

/// Per-relation synchronization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelState {
    /// Not known to the catalog (no row, or no tablesync worker yet).
    Unknown,
    /// Waiting for a tablesync worker.
    Init,
    /// Initial copy in progress.
    DataSync,
    /// Initial copy committed.
    FinishedCopy,
    /// Tablesync waits for the leader (in memory only).
    SyncWait,
    /// Tablesync catches up to the leader (in memory only).
    Catchup,
    /// Tablesync done; the leader still has to pass the sync LSN.
    SyncDone,
    /// Handled by the leader like any other relation.
    Ready,
}

impl RelState {
    /// Catalog character, or `None` for the transient in-memory states.
    pub fn as_char(self) -> Option<char> {
        match self {
            RelState::Init => Some('i'),
            RelState::DataSync => Some('d'),
            RelState::FinishedCopy => Some('f'),
            RelState::SyncDone => Some('s'),
            RelState::Ready => Some('r'),
            RelState::Unknown | RelState::SyncWait | RelState::Catchup => None,
        }
    }

    /// Parses a catalog character.
    pub fn from_char(c: char) -> Option<RelState> {
        match c {
            'i' => Some(RelState::Init),
            'd' => Some(RelState::DataSync),
            'f' => Some(RelState::FinishedCopy),
            's' => Some(RelState::SyncDone),
            'r' => Some(RelState::Ready),
            _ => None,
        }
    }

    /// True for states that are persisted in the catalog.
    pub fn is_persistent(self) -> bool {
        self.as_char().is_some()
    }
}

/// A row of the per-relation subscription state catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRelState {
    /// Local relation.
    pub relid: Oid,
    /// Sync state.
    pub state: RelState,
    /// LSN recorded with the state (sync-LSN for SYNCDONE/READY).
    pub lsn: Lsn,
}

/// Origin name used by the leader (and its parallel appliers) of `subid`.
pub fn origin_name_for_subscription(subid: Oid) -> String {
    format!("pg_{subid}")
}

/// Origin name used by the tablesync worker of `(subid, relid)`.
pub fn origin_name_for_tablesync(subid: Oid, relid: Oid) -> String {
    format!("pg_{subid}_{relid}")
}

/// Replication slot name of the tablesync worker of `(subid, relid)`.
///
/// The system identifier keeps the name unique across subscriber clusters
/// that share a publisher.
pub fn tablesync_slot_name(subid: Oid, relid: Oid, system_identifier: u64) -> String {
    format!("pg_{subid}_sync_{relid}_{system_identifier}")
}

/// Application name of the sequence sync worker of `subid`.
pub fn sequencesync_application_name(subid: Oid, system_identifier: u64) -> String {
    format!("pg_{subid}_sequence_sync_{system_identifier}")
}

/// Global identifier of a prepared remote transaction.
pub fn two_phase_gid(subid: Oid, xid: TransactionId) -> String {
    format!("pg_sp_{subid}_{xid}")
}

/// Savepoint name used by a parallel applier for subtransaction `xid`.
pub fn savepoint_name(subid: Oid, xid: TransactionId) -> String {
    format!("pg_sp_{subid}_{xid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rel_state_chars_round_trip() {
        for state in [
            RelState::Init,
            RelState::DataSync,
            RelState::FinishedCopy,
            RelState::SyncDone,
            RelState::Ready,
        ] {
            let c = state.as_char().unwrap();
            assert_eq!(RelState::from_char(c), Some(state));
        }
        assert!(!RelState::SyncWait.is_persistent());
        assert!(!RelState::Catchup.is_persistent());
        assert_eq!(RelState::from_char('x'), None);
    }

    #[test]
    fn test_two_phase_is_monotonic_ordering() {
        assert!(TwoPhaseState::Disabled < TwoPhaseState::Pending);
        assert!(TwoPhaseState::Pending < TwoPhaseState::Enabled);
        assert_eq!(TwoPhaseState::Pending.as_char(), 'p');
    }

    #[test]
    fn test_names() {
        assert_eq!(origin_name_for_subscription(16394), "pg_16394");
        assert_eq!(origin_name_for_tablesync(16394, 16500), "pg_16394_16500");
        assert_eq!(
            tablesync_slot_name(16394, 16500, 7000000000000000001),
            "pg_16394_sync_16500_7000000000000000001"
        );
        assert_eq!(two_phase_gid(5, 100), "pg_sp_5_100");
        assert_eq!(sequencesync_application_name(5, 7), "pg_5_sequence_sync_7");
    }

    #[test]
    fn test_subscription_json_defaults() {
        let json = r#"{
            "oid": 1, "dbid": 1, "name": "sub", "owner": 10, "enabled": true,
            "conninfo": "host=pub", "publications": ["p"], "stream": "parallel"
        }"#;
        let sub: Subscription = serde_json::from_str(json).unwrap();
        assert_eq!(sub.stream, StreamingMode::Parallel);
        assert_eq!(sub.two_phase, TwoPhaseState::Disabled);
        assert!(!sub.skip_lsn.is_valid());
    }
}
