//! Error types for the apply engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for apply operations.
pub type Result<T> = std::result::Result<T, ApplyError>;

/// Why a remote relation cannot be mapped onto its local counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaMismatchKind {
    /// Remote columns with no local column of the same name.
    MissingColumns(Vec<String>),
    /// Remote columns whose local counterpart is generated.
    GeneratedColumns(Vec<String>),
    /// The local relation cannot be identified for UPDATE/DELETE.
    ReplicaIdentity(String),
    /// The local relation does not exist.
    MissingRelation,
}

impl std::fmt::Display for SchemaMismatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaMismatchKind::MissingColumns(cols) => {
                write!(f, "is missing replicated column(s): {}", cols.join(", "))
            }
            SchemaMismatchKind::GeneratedColumns(cols) => write!(
                f,
                "has incompatible generated column(s): {}",
                cols.join(", ")
            ),
            SchemaMismatchKind::ReplicaIdentity(msg) => f.write_str(msg),
            SchemaMismatchKind::MissingRelation => f.write_str("does not exist"),
        }
    }
}

/// Semantic classification of apply errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Upstream socket or parallel-applier queue lost.
    ConnectionFailure,
    /// Subscription disabled, slot gone, privileges revoked.
    PrerequisiteNotMet,
    /// Unexpected or out-of-order message.
    ProtocolViolation,
    /// Remote and local relation definitions disagree.
    SchemaMismatch,
    /// A binary value was not fully consumed by its receive function.
    InvalidBinaryRepresentation,
    /// A text value was rejected by its input function.
    InvalidTextRepresentation,
    /// The lock manager aborted this waiter.
    Deadlock,
    /// Internal hash invariant broken.
    HashCorruption,
    /// Internal state machine invariant broken.
    InvalidState,
    /// Local I/O, storage or serialization failure.
    Internal,
    /// Orderly shutdown.
    Shutdown,
}

/// Errors that can occur while applying a logical replication stream.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Upstream connection or parallel-applier queue lost.
    #[error("connection failure: {msg}")]
    ConnectionFailure {
        /// Description of what was lost.
        msg: String,
    },

    /// The worker cannot continue, but nothing is broken.
    #[error("{msg}")]
    PrerequisiteNotMet {
        /// Why the worker stops.
        msg: String,
    },

    /// The upstream sent something that violates the protocol.
    #[error("protocol violation: {msg}")]
    ProtocolViolation {
        /// Error message describing the violation.
        msg: String,
    },

    /// Remote relation cannot be applied to the local relation.
    #[error("logical replication target relation \"{relation}\" {kind}")]
    SchemaMismatch {
        /// Qualified relation name.
        relation: String,
        /// What exactly mismatched.
        kind: SchemaMismatchKind,
    },

    /// Some sequences could not be synchronized with the publisher.
    #[error("logical replication sequence synchronization failed for subscription \"{subscription}\"")]
    SequenceSyncFailed {
        /// Subscription name.
        subscription: String,
        /// Sequences whose local definition differs or that were renamed.
        mismatched: Vec<String>,
        /// Sequences the publisher does not have.
        missing: Vec<String>,
    },

    /// Binary receive function left bytes unconsumed.
    #[error("incorrect binary data format in logical replication column {column}")]
    InvalidBinaryRepresentation {
        /// 1-based remote column number.
        column: usize,
    },

    /// Text input function rejected the value.
    #[error("invalid input syntax for type {type_name}: \"{value}\"")]
    InvalidTextRepresentation {
        /// Local type name.
        type_name: String,
        /// Offending input.
        value: String,
    },

    /// The lock manager chose this waiter as the deadlock victim.
    #[error("deadlock detected: {msg}")]
    DeadlockDetected {
        /// Description of the wait cycle.
        msg: String,
    },

    /// A hash table invariant was broken.
    #[error("hash table corrupted: {msg}")]
    HashCorruption {
        /// Which table.
        msg: String,
    },

    /// An internal state machine invariant was broken.
    #[error("invalid state: {msg}")]
    InvalidState {
        /// Description.
        msg: String,
    },

    /// A spool file ended in the middle of a record.
    #[error("could not read from streaming transaction's changes file \"{path}\": unexpected end of file")]
    SpoolTruncated {
        /// File that was truncated.
        path: String,
    },

    /// Local storage engine failure.
    #[error("storage error: {msg}")]
    Storage {
        /// Description.
        msg: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {msg}")]
    InvalidConfig {
        /// Description.
        msg: String,
    },

    /// An error reported by a parallel applier over its error queue.
    #[error("logical replication parallel apply worker exited due to error: {message}")]
    ParallelApplier {
        /// Semantic kind reported by the applier.
        kind: ErrorKind,
        /// Original message.
        message: String,
        /// Context lines, the last of which names the parallel applier.
        context: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The worker was asked to shut down.
    #[error("worker shut down")]
    Shutdown,
}

impl ApplyError {
    /// Shorthand for a protocol violation.
    pub fn protocol(msg: impl Into<String>) -> Self {
        ApplyError::ProtocolViolation { msg: msg.into() }
    }

    /// Shorthand for an internal state violation.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        ApplyError::InvalidState { msg: msg.into() }
    }

    /// Shorthand for a storage failure.
    pub fn storage(msg: impl Into<String>) -> Self {
        ApplyError::Storage { msg: msg.into() }
    }

    /// Shorthand for a lost connection.
    pub fn connection(msg: impl Into<String>) -> Self {
        ApplyError::ConnectionFailure { msg: msg.into() }
    }

    /// Returns the semantic kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApplyError::ConnectionFailure { .. } => ErrorKind::ConnectionFailure,
            ApplyError::PrerequisiteNotMet { .. } => ErrorKind::PrerequisiteNotMet,
            ApplyError::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            ApplyError::SchemaMismatch { .. } | ApplyError::SequenceSyncFailed { .. } => ErrorKind::SchemaMismatch,
            ApplyError::InvalidBinaryRepresentation { .. } => ErrorKind::InvalidBinaryRepresentation,
            ApplyError::InvalidTextRepresentation { .. } => ErrorKind::InvalidTextRepresentation,
            ApplyError::DeadlockDetected { .. } => ErrorKind::Deadlock,
            ApplyError::HashCorruption { .. } => ErrorKind::HashCorruption,
            ApplyError::InvalidState { .. } => ErrorKind::InvalidState,
            ApplyError::ParallelApplier { kind, .. } => *kind,
            ApplyError::Shutdown => ErrorKind::Shutdown,
            ApplyError::SpoolTruncated { .. }
            | ApplyError::Storage { .. }
            | ApplyError::InvalidConfig { .. }
            | ApplyError::Serialization(_)
            | ApplyError::Io(_) => ErrorKind::Internal,
        }
    }

    /// True when the worker should exit with success after cleanup.
    pub fn is_clean_exit(&self) -> bool {
        matches!(self.kind(), ErrorKind::PrerequisiteNotMet | ErrorKind::Shutdown)
    }
}

/// Wire form of an error sent from a parallel applier to its leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Semantic kind.
    pub kind: ErrorKind,
    /// Primary message.
    pub message: String,
    /// Optional context (remote xid, relation being applied).
    pub context: Option<String>,
}

/// Context line appended to errors rethrown from a parallel applier.
pub const PARALLEL_APPLIER_CONTEXT: &str = "logical replication parallel apply worker";

impl ErrorResponse {
    /// Captures an error for transmission.
    pub fn from_error(err: &ApplyError, context: Option<String>) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            context,
        }
    }

    /// Encodes as an error-queue message.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes an error-queue message.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Turns the response into the error the leader rethrows.
    pub fn into_leader_error(self) -> ApplyError {
        let context = match self.context {
            Some(ctx) => format!("{ctx}\n{PARALLEL_APPLIER_CONTEXT}"),
            None => PARALLEL_APPLIER_CONTEXT.to_string(),
        };
        ApplyError::ParallelApplier {
            kind: self.kind,
            message: self.message,
            context,
        }
    }
}
