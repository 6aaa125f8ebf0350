//! Logical replication wire messages.
//!
//! Two layers are covered here. The replication envelope (`'w'` XLogData,
//! `'k'` keepalive and our `'r'` standby status reply) frames every chunk the
//! publisher sends. Inside XLogData sits one logical message (begin, insert,
//! stream-start, ...). All integers are big-endian and strings are
//! NUL-terminated.
//!
//! Change messages (`relation`, `type`, `insert`, `update`, `delete`,
//! `truncate`, `message`) carry a leading subtransaction xid only while the
//! publisher is streaming an in-progress transaction, so decoding them needs
//! to know whether a stream chunk is open.

use crate::error::{ApplyError, Result};
use crate::lsn::Lsn;
use crate::types::{Oid, TimestampTz, TransactionId};
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the (start-lsn, end-lsn, send-time) header after the `'w'` byte.
pub const XLOG_DATA_HEADER_SIZE: usize = 24;

/// Logical message action bytes.
pub mod action {
    /// Begin of a remote transaction.
    pub const BEGIN: u8 = b'B';
    /// Commit of a remote transaction.
    pub const COMMIT: u8 = b'C';
    /// Origin of the current transaction.
    pub const ORIGIN: u8 = b'O';
    /// Relation schema.
    pub const RELATION: u8 = b'R';
    /// Type description.
    pub const TYPE: u8 = b'Y';
    /// Insert.
    pub const INSERT: u8 = b'I';
    /// Update.
    pub const UPDATE: u8 = b'U';
    /// Delete.
    pub const DELETE: u8 = b'D';
    /// Truncate.
    pub const TRUNCATE: u8 = b'T';
    /// Generic logical decoding message.
    pub const MESSAGE: u8 = b'M';
    /// Begin of a stream chunk.
    pub const STREAM_START: u8 = b'S';
    /// End of a stream chunk.
    pub const STREAM_STOP: u8 = b'E';
    /// Commit of a streamed transaction.
    pub const STREAM_COMMIT: u8 = b'c';
    /// Abort of a streamed (sub)transaction.
    pub const STREAM_ABORT: u8 = b'A';
    /// Prepare of a streamed transaction.
    pub const STREAM_PREPARE: u8 = b'p';
    /// Begin of a transaction that will be prepared.
    pub const BEGIN_PREPARE: u8 = b'b';
    /// Prepare.
    pub const PREPARE: u8 = b'P';
    /// Commit of a prepared transaction.
    pub const COMMIT_PREPARED: u8 = b'K';
    /// Rollback of a prepared transaction.
    pub const ROLLBACK_PREPARED: u8 = b'r';
}

/// Human-readable name of a logical message action, for error context.
pub fn action_name(action: u8) -> &'static str {
    match action {
        action::BEGIN => "BEGIN",
        action::COMMIT => "COMMIT",
        action::ORIGIN => "ORIGIN",
        action::RELATION => "RELATION",
        action::TYPE => "TYPE",
        action::INSERT => "INSERT",
        action::UPDATE => "UPDATE",
        action::DELETE => "DELETE",
        action::TRUNCATE => "TRUNCATE",
        action::MESSAGE => "MESSAGE",
        action::STREAM_START => "STREAM START",
        action::STREAM_STOP => "STREAM STOP",
        action::STREAM_COMMIT => "STREAM COMMIT",
        action::STREAM_ABORT => "STREAM ABORT",
        action::STREAM_PREPARE => "STREAM PREPARE",
        action::BEGIN_PREPARE => "BEGIN PREPARE",
        action::PREPARE => "PREPARE",
        action::COMMIT_PREPARED => "COMMIT PREPARED",
        action::ROLLBACK_PREPARED => "ROLLBACK PREPARED",
        _ => "??? (unknown)",
    }
}

/// One column of a tuple as sent by the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleValue {
    /// Explicit SQL NULL.
    Null,
    /// Unchanged TOASTed value; the subscriber keeps its own.
    Unchanged,
    /// Value in the type's text output format.
    Text(Vec<u8>),
    /// Value in the type's binary send format.
    Binary(Vec<u8>),
}

impl TupleValue {
    /// Convenience constructor for text values.
    pub fn text(s: &str) -> Self {
        TupleValue::Text(s.as_bytes().to_vec())
    }
}

/// A full remote tuple.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TupleData {
    /// One entry per remote column.
    pub columns: Vec<TupleValue>,
}

impl TupleData {
    /// Builds a tuple of text values.
    pub fn from_text(values: &[&str]) -> Self {
        Self {
            columns: values.iter().map(|v| TupleValue::text(v)).collect(),
        }
    }
}

/// Replica identity setting of the published relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicaIdentity {
    /// Primary key.
    #[default]
    Default,
    /// No identity; UPDATE/DELETE cannot be published.
    Nothing,
    /// Every column is part of the identity.
    Full,
    /// A specific unique index.
    Index,
}

impl ReplicaIdentity {
    fn as_byte(self) -> u8 {
        match self {
            ReplicaIdentity::Default => b'd',
            ReplicaIdentity::Nothing => b'n',
            ReplicaIdentity::Full => b'f',
            ReplicaIdentity::Index => b'i',
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            b'd' => Ok(ReplicaIdentity::Default),
            b'n' => Ok(ReplicaIdentity::Nothing),
            b'f' => Ok(ReplicaIdentity::Full),
            b'i' => Ok(ReplicaIdentity::Index),
            other => Err(ApplyError::protocol(format!(
                "unrecognized replica identity {:?}",
                other as char
            ))),
        }
    }
}

/// A column of a published relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationColumn {
    /// Part of the replica identity.
    pub is_key: bool,
    /// Column name.
    pub name: String,
    /// Remote type oid.
    pub type_oid: Oid,
    /// Remote type modifier.
    pub type_modifier: i32,
}

/// Schema of a published relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationBody {
    /// Remote relation id.
    pub relid: Oid,
    /// Remote schema name.
    pub namespace: String,
    /// Remote relation name.
    pub name: String,
    /// Replica identity setting.
    pub replident: ReplicaIdentity,
    /// Published columns, in remote order.
    pub columns: Vec<RelationColumn>,
}

/// A decoded logical replication message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalMessage {
    /// Start of a remote transaction.
    Begin {
        /// LSN of the commit record.
        final_lsn: Lsn,
        /// Commit timestamp.
        commit_time: TimestampTz,
        /// Remote xid.
        xid: TransactionId,
    },
    /// End of a remote transaction.
    Commit {
        /// Commit record LSN.
        commit_lsn: Lsn,
        /// End of the commit record.
        end_lsn: Lsn,
        /// Commit timestamp.
        commit_time: TimestampTz,
    },
    /// The remote transaction itself came from another origin.
    Origin {
        /// Origin LSN on the upstream's upstream.
        origin_lsn: Lsn,
        /// Origin name.
        name: String,
    },
    /// Relation schema.
    Relation {
        /// Subtransaction xid while streaming.
        xid: Option<TransactionId>,
        /// The schema.
        body: RelationBody,
    },
    /// Type description; only used for map maintenance.
    Type {
        /// Subtransaction xid while streaming.
        xid: Option<TransactionId>,
        /// Remote type oid.
        type_oid: Oid,
        /// Schema name.
        namespace: String,
        /// Type name.
        name: String,
    },
    /// Row insert.
    Insert {
        /// Subtransaction xid while streaming.
        xid: Option<TransactionId>,
        /// Remote relation id.
        relid: Oid,
        /// New tuple.
        new_tuple: TupleData,
    },
    /// Row update.
    Update {
        /// Subtransaction xid while streaming.
        xid: Option<TransactionId>,
        /// Remote relation id.
        relid: Oid,
        /// Old key or full old tuple, when the identity changed or is FULL.
        old_tuple: Option<TupleData>,
        /// New tuple.
        new_tuple: TupleData,
    },
    /// Row delete.
    Delete {
        /// Subtransaction xid while streaming.
        xid: Option<TransactionId>,
        /// Remote relation id.
        relid: Oid,
        /// Old key or full old tuple.
        old_tuple: TupleData,
    },
    /// Truncate of one or more relations.
    Truncate {
        /// Subtransaction xid while streaming.
        xid: Option<TransactionId>,
        /// Remote relation ids.
        relids: Vec<Oid>,
        /// TRUNCATE ... CASCADE.
        cascade: bool,
        /// TRUNCATE ... RESTART IDENTITY.
        restart_seqs: bool,
    },
    /// Generic decoding message; the apply side ignores it.
    Message {
        /// Subtransaction xid while streaming.
        xid: Option<TransactionId>,
        /// Emitted transactionally.
        transactional: bool,
        /// LSN of the message.
        lsn: Lsn,
        /// Prefix.
        prefix: String,
        /// Payload.
        content: Vec<u8>,
    },
    /// Start of a chunk of an in-progress transaction.
    StreamStart {
        /// Toplevel xid.
        xid: TransactionId,
        /// First chunk of this transaction.
        first_segment: bool,
    },
    /// End of a chunk.
    StreamStop,
    /// Commit of a streamed transaction.
    StreamCommit {
        /// Toplevel xid.
        xid: TransactionId,
        /// Commit record LSN.
        commit_lsn: Lsn,
        /// End of the commit record.
        end_lsn: Lsn,
        /// Commit timestamp.
        commit_time: TimestampTz,
    },
    /// Abort of a streamed transaction or one of its subtransactions.
    StreamAbort {
        /// Toplevel xid.
        xid: TransactionId,
        /// Aborted (sub)transaction; equals `xid` for a toplevel abort.
        subxid: TransactionId,
        /// LSN of the abort record.
        abort_lsn: Lsn,
        /// Abort timestamp.
        abort_time: TimestampTz,
    },
    /// Prepare of a streamed transaction.
    StreamPrepare(PrepareData),
    /// Begin of a transaction that ends with a PREPARE.
    BeginPrepare {
        /// LSN of the prepare record.
        prepare_lsn: Lsn,
        /// End of the prepare record.
        end_lsn: Lsn,
        /// Prepare timestamp.
        prepare_time: TimestampTz,
        /// Remote xid.
        xid: TransactionId,
        /// Upstream GID.
        gid: String,
    },
    /// Prepare of a remote transaction.
    Prepare(PrepareData),
    /// Commit of a prepared transaction.
    CommitPrepared {
        /// Commit record LSN.
        commit_lsn: Lsn,
        /// End of the commit record.
        end_lsn: Lsn,
        /// Commit timestamp.
        commit_time: TimestampTz,
        /// Remote xid.
        xid: TransactionId,
        /// Upstream GID.
        gid: String,
    },
    /// Rollback of a prepared transaction.
    RollbackPrepared {
        /// End of the prepare record.
        prepare_end_lsn: Lsn,
        /// End of the rollback record.
        rollback_end_lsn: Lsn,
        /// Prepare timestamp.
        prepare_time: TimestampTz,
        /// Rollback timestamp.
        rollback_time: TimestampTz,
        /// Remote xid.
        xid: TransactionId,
        /// Upstream GID.
        gid: String,
    },
}

/// Payload shared by PREPARE and STREAM PREPARE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareData {
    /// LSN of the prepare record.
    pub prepare_lsn: Lsn,
    /// End of the prepare record.
    pub end_lsn: Lsn,
    /// Prepare timestamp.
    pub prepare_time: TimestampTz,
    /// Remote xid.
    pub xid: TransactionId,
    /// Upstream GID.
    pub gid: String,
}

impl LogicalMessage {
    /// The action byte this message is encoded with.
    pub fn action(&self) -> u8 {
        match self {
            LogicalMessage::Begin { .. } => action::BEGIN,
            LogicalMessage::Commit { .. } => action::COMMIT,
            LogicalMessage::Origin { .. } => action::ORIGIN,
            LogicalMessage::Relation { .. } => action::RELATION,
            LogicalMessage::Type { .. } => action::TYPE,
            LogicalMessage::Insert { .. } => action::INSERT,
            LogicalMessage::Update { .. } => action::UPDATE,
            LogicalMessage::Delete { .. } => action::DELETE,
            LogicalMessage::Truncate { .. } => action::TRUNCATE,
            LogicalMessage::Message { .. } => action::MESSAGE,
            LogicalMessage::StreamStart { .. } => action::STREAM_START,
            LogicalMessage::StreamStop => action::STREAM_STOP,
            LogicalMessage::StreamCommit { .. } => action::STREAM_COMMIT,
            LogicalMessage::StreamAbort { .. } => action::STREAM_ABORT,
            LogicalMessage::StreamPrepare(_) => action::STREAM_PREPARE,
            LogicalMessage::BeginPrepare { .. } => action::BEGIN_PREPARE,
            LogicalMessage::Prepare(_) => action::PREPARE,
            LogicalMessage::CommitPrepared { .. } => action::COMMIT_PREPARED,
            LogicalMessage::RollbackPrepared { .. } => action::ROLLBACK_PREPARED,
        }
    }

    /// Subtransaction xid carried by a streamed change message.
    pub fn stream_xid(&self) -> Option<TransactionId> {
        match self {
            LogicalMessage::Relation { xid, .. }
            | LogicalMessage::Type { xid, .. }
            | LogicalMessage::Insert { xid, .. }
            | LogicalMessage::Update { xid, .. }
            | LogicalMessage::Delete { xid, .. }
            | LogicalMessage::Truncate { xid, .. }
            | LogicalMessage::Message { xid, .. } => *xid,
            _ => None,
        }
    }

    /// Encodes the message, action byte first.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.action());
        match self {
            LogicalMessage::Begin {
                final_lsn,
                commit_time,
                xid,
            } => {
                buf.put_u64(final_lsn.0);
                buf.put_i64(*commit_time);
                buf.put_u32(*xid);
            }
            LogicalMessage::Commit {
                commit_lsn,
                end_lsn,
                commit_time,
            } => {
                buf.put_u8(0);
                buf.put_u64(commit_lsn.0);
                buf.put_u64(end_lsn.0);
                buf.put_i64(*commit_time);
            }
            LogicalMessage::Origin { origin_lsn, name } => {
                buf.put_u64(origin_lsn.0);
                put_cstring(&mut buf, name);
            }
            LogicalMessage::Relation { xid, body } => {
                put_stream_xid(&mut buf, *xid);
                buf.put_u32(body.relid);
                put_cstring(&mut buf, &body.namespace);
                put_cstring(&mut buf, &body.name);
                buf.put_u8(body.replident.as_byte());
                buf.put_i16(body.columns.len() as i16);
                for col in &body.columns {
                    buf.put_u8(u8::from(col.is_key));
                    put_cstring(&mut buf, &col.name);
                    buf.put_u32(col.type_oid);
                    buf.put_i32(col.type_modifier);
                }
            }
            LogicalMessage::Type {
                xid,
                type_oid,
                namespace,
                name,
            } => {
                put_stream_xid(&mut buf, *xid);
                buf.put_u32(*type_oid);
                put_cstring(&mut buf, namespace);
                put_cstring(&mut buf, name);
            }
            LogicalMessage::Insert {
                xid,
                relid,
                new_tuple,
            } => {
                put_stream_xid(&mut buf, *xid);
                buf.put_u32(*relid);
                buf.put_u8(b'N');
                put_tuple(&mut buf, new_tuple);
            }
            LogicalMessage::Update {
                xid,
                relid,
                old_tuple,
                new_tuple,
            } => {
                put_stream_xid(&mut buf, *xid);
                buf.put_u32(*relid);
                if let Some(old) = old_tuple {
                    buf.put_u8(b'O');
                    put_tuple(&mut buf, old);
                }
                buf.put_u8(b'N');
                put_tuple(&mut buf, new_tuple);
            }
            LogicalMessage::Delete {
                xid,
                relid,
                old_tuple,
            } => {
                put_stream_xid(&mut buf, *xid);
                buf.put_u32(*relid);
                buf.put_u8(b'O');
                put_tuple(&mut buf, old_tuple);
            }
            LogicalMessage::Truncate {
                xid,
                relids,
                cascade,
                restart_seqs,
            } => {
                put_stream_xid(&mut buf, *xid);
                buf.put_u32(relids.len() as u32);
                let mut flags = 0u8;
                if *cascade {
                    flags |= TRUNCATE_CASCADE;
                }
                if *restart_seqs {
                    flags |= TRUNCATE_RESTART_SEQS;
                }
                buf.put_u8(flags);
                for relid in relids {
                    buf.put_u32(*relid);
                }
            }
            LogicalMessage::Message {
                xid,
                transactional,
                lsn,
                prefix,
                content,
            } => {
                put_stream_xid(&mut buf, *xid);
                buf.put_u8(u8::from(*transactional));
                buf.put_u64(lsn.0);
                put_cstring(&mut buf, prefix);
                buf.put_u32(content.len() as u32);
                buf.put_slice(content);
            }
            LogicalMessage::StreamStart { xid, first_segment } => {
                buf.put_u32(*xid);
                buf.put_u8(u8::from(*first_segment));
            }
            LogicalMessage::StreamStop => {}
            LogicalMessage::StreamCommit {
                xid,
                commit_lsn,
                end_lsn,
                commit_time,
            } => {
                buf.put_u32(*xid);
                buf.put_u8(0);
                buf.put_u64(commit_lsn.0);
                buf.put_u64(end_lsn.0);
                buf.put_i64(*commit_time);
            }
            LogicalMessage::StreamAbort {
                xid,
                subxid,
                abort_lsn,
                abort_time,
            } => {
                buf.put_u32(*xid);
                buf.put_u32(*subxid);
                buf.put_u64(abort_lsn.0);
                buf.put_i64(*abort_time);
            }
            LogicalMessage::StreamPrepare(data) | LogicalMessage::Prepare(data) => {
                buf.put_u8(0);
                buf.put_u64(data.prepare_lsn.0);
                buf.put_u64(data.end_lsn.0);
                buf.put_i64(data.prepare_time);
                buf.put_u32(data.xid);
                put_cstring(&mut buf, &data.gid);
            }
            LogicalMessage::BeginPrepare {
                prepare_lsn,
                end_lsn,
                prepare_time,
                xid,
                gid,
            } => {
                buf.put_u64(prepare_lsn.0);
                buf.put_u64(end_lsn.0);
                buf.put_i64(*prepare_time);
                buf.put_u32(*xid);
                put_cstring(&mut buf, gid);
            }
            LogicalMessage::CommitPrepared {
                commit_lsn,
                end_lsn,
                commit_time,
                xid,
                gid,
            } => {
                buf.put_u8(0);
                buf.put_u64(commit_lsn.0);
                buf.put_u64(end_lsn.0);
                buf.put_i64(*commit_time);
                buf.put_u32(*xid);
                put_cstring(&mut buf, gid);
            }
            LogicalMessage::RollbackPrepared {
                prepare_end_lsn,
                rollback_end_lsn,
                prepare_time,
                rollback_time,
                xid,
                gid,
            } => {
                buf.put_u8(0);
                buf.put_u64(prepare_end_lsn.0);
                buf.put_u64(rollback_end_lsn.0);
                buf.put_i64(*prepare_time);
                buf.put_i64(*rollback_time);
                buf.put_u32(*xid);
                put_cstring(&mut buf, gid);
            }
        }
        buf.freeze()
    }

    /// Decodes one message. `in_stream` tells whether a stream chunk is open,
    /// in which case change messages start with a subtransaction xid.
    pub fn decode(bytes: &[u8], in_stream: bool) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let act = r.u8()?;
        let stream_xid = |r: &mut Reader<'_>| -> Result<Option<TransactionId>> {
            if in_stream {
                Ok(Some(r.u32()?))
            } else {
                Ok(None)
            }
        };

        let msg = match act {
            action::BEGIN => LogicalMessage::Begin {
                final_lsn: r.lsn()?,
                commit_time: r.i64()?,
                xid: r.u32()?,
            },
            action::COMMIT => {
                r.flags()?;
                LogicalMessage::Commit {
                    commit_lsn: r.lsn()?,
                    end_lsn: r.lsn()?,
                    commit_time: r.i64()?,
                }
            }
            action::ORIGIN => LogicalMessage::Origin {
                origin_lsn: r.lsn()?,
                name: r.cstring()?,
            },
            action::RELATION => {
                let xid = stream_xid(&mut r)?;
                let relid = r.u32()?;
                let namespace = r.cstring()?;
                let name = r.cstring()?;
                let replident = ReplicaIdentity::from_byte(r.u8()?)?;
                let natts = r.count16()?;
                let mut columns = Vec::with_capacity(natts);
                for _ in 0..natts {
                    let flags = r.u8()?;
                    columns.push(RelationColumn {
                        is_key: flags & 1 != 0,
                        name: r.cstring()?,
                        type_oid: r.u32()?,
                        type_modifier: r.i32()?,
                    });
                }
                LogicalMessage::Relation {
                    xid,
                    body: RelationBody {
                        relid,
                        namespace,
                        name,
                        replident,
                        columns,
                    },
                }
            }
            action::TYPE => LogicalMessage::Type {
                xid: stream_xid(&mut r)?,
                type_oid: r.u32()?,
                namespace: r.cstring()?,
                name: r.cstring()?,
            },
            action::INSERT => {
                let xid = stream_xid(&mut r)?;
                let relid = r.u32()?;
                r.expect_marker(b'N')?;
                LogicalMessage::Insert {
                    xid,
                    relid,
                    new_tuple: r.tuple()?,
                }
            }
            action::UPDATE => {
                let xid = stream_xid(&mut r)?;
                let relid = r.u32()?;
                let mut marker = r.u8()?;
                let mut old_tuple = None;
                if marker == b'K' || marker == b'O' {
                    old_tuple = Some(r.tuple()?);
                    marker = r.u8()?;
                }
                if marker != b'N' {
                    return Err(ApplyError::protocol(format!(
                        "expected new tuple but got {:?}",
                        marker as char
                    )));
                }
                LogicalMessage::Update {
                    xid,
                    relid,
                    old_tuple,
                    new_tuple: r.tuple()?,
                }
            }
            action::DELETE => {
                let xid = stream_xid(&mut r)?;
                let relid = r.u32()?;
                let marker = r.u8()?;
                if marker != b'K' && marker != b'O' {
                    return Err(ApplyError::protocol(format!(
                        "expected action 'O' or 'K', got {:?}",
                        marker as char
                    )));
                }
                LogicalMessage::Delete {
                    xid,
                    relid,
                    old_tuple: r.tuple()?,
                }
            }
            action::TRUNCATE => {
                let xid = stream_xid(&mut r)?;
                let nrels = r.u32()? as usize;
                let flags = r.u8()?;
                let mut relids = Vec::with_capacity(nrels.min(1024));
                for _ in 0..nrels {
                    relids.push(r.u32()?);
                }
                LogicalMessage::Truncate {
                    xid,
                    relids,
                    cascade: flags & TRUNCATE_CASCADE != 0,
                    restart_seqs: flags & TRUNCATE_RESTART_SEQS != 0,
                }
            }
            action::MESSAGE => {
                let xid = stream_xid(&mut r)?;
                let transactional = r.u8()? & 1 != 0;
                let lsn = r.lsn()?;
                let prefix = r.cstring()?;
                let len = r.u32()? as usize;
                LogicalMessage::Message {
                    xid,
                    transactional,
                    lsn,
                    prefix,
                    content: r.bytes(len)?.to_vec(),
                }
            }
            action::STREAM_START => LogicalMessage::StreamStart {
                xid: r.u32()?,
                first_segment: r.u8()? == 1,
            },
            action::STREAM_STOP => LogicalMessage::StreamStop,
            action::STREAM_COMMIT => {
                let xid = r.u32()?;
                r.flags()?;
                LogicalMessage::StreamCommit {
                    xid,
                    commit_lsn: r.lsn()?,
                    end_lsn: r.lsn()?,
                    commit_time: r.i64()?,
                }
            }
            action::STREAM_ABORT => LogicalMessage::StreamAbort {
                xid: r.u32()?,
                subxid: r.u32()?,
                abort_lsn: r.lsn()?,
                abort_time: r.i64()?,
            },
            action::STREAM_PREPARE => LogicalMessage::StreamPrepare(r.prepare()?),
            action::PREPARE => LogicalMessage::Prepare(r.prepare()?),
            action::BEGIN_PREPARE => LogicalMessage::BeginPrepare {
                prepare_lsn: r.lsn()?,
                end_lsn: r.lsn()?,
                prepare_time: r.i64()?,
                xid: r.u32()?,
                gid: r.cstring()?,
            },
            action::COMMIT_PREPARED => {
                r.flags()?;
                LogicalMessage::CommitPrepared {
                    commit_lsn: r.lsn()?,
                    end_lsn: r.lsn()?,
                    commit_time: r.i64()?,
                    xid: r.u32()?,
                    gid: r.cstring()?,
                }
            }
            action::ROLLBACK_PREPARED => {
                r.flags()?;
                LogicalMessage::RollbackPrepared {
                    prepare_end_lsn: r.lsn()?,
                    rollback_end_lsn: r.lsn()?,
                    prepare_time: r.i64()?,
                    rollback_time: r.i64()?,
                    xid: r.u32()?,
                    gid: r.cstring()?,
                }
            }
            other => {
                return Err(ApplyError::protocol(format!(
                    "invalid logical replication message type \"??? ({other})\""
                )))
            }
        };
        Ok(msg)
    }
}

const TRUNCATE_CASCADE: u8 = 1;
const TRUNCATE_RESTART_SEQS: u8 = 2;

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_stream_xid(buf: &mut BytesMut, xid: Option<TransactionId>) {
    if let Some(xid) = xid {
        buf.put_u32(xid);
    }
}

fn put_tuple(buf: &mut BytesMut, tuple: &TupleData) {
    buf.put_i16(tuple.columns.len() as i16);
    for col in &tuple.columns {
        match col {
            TupleValue::Null => buf.put_u8(b'n'),
            TupleValue::Unchanged => buf.put_u8(b'u'),
            TupleValue::Text(data) => {
                buf.put_u8(b't');
                buf.put_i32(data.len() as i32);
                buf.put_slice(data);
            }
            TupleValue::Binary(data) => {
                buf.put_u8(b'b');
                buf.put_i32(data.len() as i32);
                buf.put_slice(data);
            }
        }
    }
}

/// Bounds-checked big-endian reader; running off the end is a protocol error.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| ApplyError::protocol("insufficient data left in message"))?;
        let buf = self.buf;
        let out = &buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    fn lsn(&mut self) -> Result<Lsn> {
        Ok(Lsn(u64::from_be_bytes(self.array()?)))
    }

    fn count16(&mut self) -> Result<usize> {
        let n = i16::from_be_bytes(self.array()?);
        usize::try_from(n).map_err(|_| ApplyError::protocol(format!("invalid column count {n}")))
    }

    fn flags(&mut self) -> Result<()> {
        let flags = self.u8()?;
        if flags != 0 {
            return Err(ApplyError::protocol(format!("unrecognized flags {flags} in message")));
        }
        Ok(())
    }

    fn expect_marker(&mut self, want: u8) -> Result<()> {
        let got = self.u8()?;
        if got != want {
            return Err(ApplyError::protocol(format!(
                "expected {:?} but got {:?}",
                want as char, got as char
            )));
        }
        Ok(())
    }

    fn cstring(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| ApplyError::protocol("invalid string in message"))?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|_| ApplyError::protocol("invalid string in message"))?
            .to_string();
        self.pos += nul + 1;
        Ok(s)
    }

    fn tuple(&mut self) -> Result<TupleData> {
        let natts = self.count16()?;
        let mut columns = Vec::with_capacity(natts);
        for _ in 0..natts {
            let value = match self.u8()? {
                b'n' => TupleValue::Null,
                b'u' => TupleValue::Unchanged,
                kind @ (b't' | b'b') => {
                    let len = self.i32()?;
                    let len = usize::try_from(len)
                        .map_err(|_| ApplyError::protocol(format!("invalid value length {len}")))?;
                    let data = self.bytes(len)?.to_vec();
                    if kind == b't' {
                        TupleValue::Text(data)
                    } else {
                        TupleValue::Binary(data)
                    }
                }
                other => {
                    return Err(ApplyError::protocol(format!(
                        "unrecognized data representation type '{}'",
                        other as char
                    )))
                }
            };
            columns.push(value);
        }
        Ok(TupleData { columns })
    }

    fn prepare(&mut self) -> Result<PrepareData> {
        self.flags()?;
        Ok(PrepareData {
            prepare_lsn: self.lsn()?,
            end_lsn: self.lsn()?,
            prepare_time: self.i64()?,
            xid: self.u32()?,
            gid: self.cstring()?,
        })
    }
}

/// A chunk of the replication stream as framed by the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyData {
    /// `'w'`: one logical message.
    XLogData {
        /// WAL start of this chunk.
        start_lsn: Lsn,
        /// Current end of WAL on the publisher.
        end_lsn: Lsn,
        /// Publisher clock.
        send_time: TimestampTz,
        /// The logical message.
        data: Bytes,
    },
    /// `'k'`: primary keepalive.
    Keepalive {
        /// Current end of WAL on the publisher.
        end_lsn: Lsn,
        /// Publisher clock.
        send_time: TimestampTz,
        /// The publisher wants a status reply now.
        reply_requested: bool,
    },
}

impl CopyData {
    /// Encodes the chunk, type byte first.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            CopyData::XLogData {
                start_lsn,
                end_lsn,
                send_time,
                data,
            } => {
                buf.reserve(1 + XLOG_DATA_HEADER_SIZE + data.len());
                buf.put_u8(b'w');
                buf.put_u64(start_lsn.0);
                buf.put_u64(end_lsn.0);
                buf.put_i64(*send_time);
                buf.put_slice(data);
            }
            CopyData::Keepalive {
                end_lsn,
                send_time,
                reply_requested,
            } => {
                buf.put_u8(b'k');
                buf.put_u64(end_lsn.0);
                buf.put_i64(*send_time);
                buf.put_u8(u8::from(*reply_requested));
            }
        }
        buf.freeze()
    }

    /// Decodes a chunk.
    pub fn decode(bytes: &Bytes) -> Result<Self> {
        let mut r = Reader::new(bytes);
        match r.u8()? {
            b'w' => {
                let start_lsn = r.lsn()?;
                let end_lsn = r.lsn()?;
                let send_time = r.i64()?;
                Ok(CopyData::XLogData {
                    start_lsn,
                    end_lsn,
                    send_time,
                    data: bytes.slice(1 + XLOG_DATA_HEADER_SIZE..),
                })
            }
            b'k' => Ok(CopyData::Keepalive {
                end_lsn: r.lsn()?,
                send_time: r.i64()?,
                reply_requested: r.u8()? != 0,
            }),
            other => Err(ApplyError::protocol(format!(
                "unrecognized streaming header: \"{}\"",
                other as char
            ))),
        }
    }
}

/// `'r'`: standby status update sent back to the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyStatusUpdate {
    /// Last received remote LSN.
    pub write_lsn: Lsn,
    /// Remote LSN durably applied locally.
    pub flush_lsn: Lsn,
    /// Remote LSN applied locally.
    pub apply_lsn: Lsn,
    /// Subscriber clock.
    pub send_time: TimestampTz,
    /// Ask the publisher for an immediate keepalive.
    pub reply_requested: bool,
}

impl StandbyStatusUpdate {
    /// Encodes the reply, type byte first.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(34);
        buf.put_u8(b'r');
        buf.put_u64(self.write_lsn.0);
        buf.put_u64(self.flush_lsn.0);
        buf.put_u64(self.apply_lsn.0);
        buf.put_i64(self.send_time);
        buf.put_u8(u8::from(self.reply_requested));
        buf.freeze()
    }

    /// Decodes a reply.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        r.expect_marker(b'r')?;
        Ok(Self {
            write_lsn: r.lsn()?,
            flush_lsn: r.lsn()?,
            apply_lsn: r.lsn()?,
            send_time: r.i64()?,
            reply_requested: r.u8()? != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(xid: Option<TransactionId>) -> LogicalMessage {
        LogicalMessage::Insert {
            xid,
            relid: 16400,
            new_tuple: TupleData {
                columns: vec![
                    TupleValue::text("7"),
                    TupleValue::Null,
                    TupleValue::Unchanged,
                    TupleValue::Binary(vec![0, 0, 0, 1]),
                ],
            },
        }
    }

    #[test]
    fn test_stream_xid_prefix_depends_on_stream_flag() {
        let streamed = insert(Some(301));
        let bytes = streamed.encode();
        assert_eq!(&bytes[1..5], &301u32.to_be_bytes());
        assert_eq!(LogicalMessage::decode(&bytes, true).unwrap(), streamed);

        let plain = insert(None);
        let bytes = plain.encode();
        assert_eq!(LogicalMessage::decode(&bytes, false).unwrap(), plain);
    }

    #[test]
    fn test_relation_message() {
        let msg = LogicalMessage::Relation {
            xid: None,
            body: RelationBody {
                relid: 16400,
                namespace: "public".into(),
                name: "t".into(),
                replident: ReplicaIdentity::Default,
                columns: vec![
                    RelationColumn {
                        is_key: true,
                        name: "id".into(),
                        type_oid: 23,
                        type_modifier: -1,
                    },
                    RelationColumn {
                        is_key: false,
                        name: "v".into(),
                        type_oid: 25,
                        type_modifier: -1,
                    },
                ],
            },
        };
        assert_eq!(LogicalMessage::decode(&msg.encode(), false).unwrap(), msg);
    }

    #[test]
    fn test_update_with_and_without_old_tuple() {
        for old in [None, Some(TupleData::from_text(&["1"]))] {
            let msg = LogicalMessage::Update {
                xid: None,
                relid: 1,
                old_tuple: old,
                new_tuple: TupleData::from_text(&["1", "x"]),
            };
            assert_eq!(LogicalMessage::decode(&msg.encode(), false).unwrap(), msg);
        }
    }

    #[test]
    fn test_truncate_flags() {
        let msg = LogicalMessage::Truncate {
            xid: Some(9),
            relids: vec![1, 2, 3],
            cascade: true,
            restart_seqs: false,
        };
        let bytes = msg.encode();
        assert_eq!(LogicalMessage::decode(&bytes, true).unwrap(), msg);
    }

    #[test]
    fn test_truncated_message_is_protocol_violation() {
        let bytes = insert(None).encode();
        let err = LogicalMessage::decode(&bytes[..bytes.len() - 2], false).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ProtocolViolation);
    }

    #[test]
    fn test_unknown_action() {
        assert!(LogicalMessage::decode(b"Z", false).is_err());
        assert_eq!(action_name(b'Z'), "??? (unknown)");
        assert_eq!(action_name(action::STREAM_ABORT), "STREAM ABORT");
    }

    #[test]
    fn test_stream_control_messages() {
        let msgs = vec![
            LogicalMessage::StreamStart {
                xid: 200,
                first_segment: true,
            },
            LogicalMessage::StreamStop,
            LogicalMessage::StreamAbort {
                xid: 300,
                subxid: 301,
                abort_lsn: Lsn(0x400),
                abort_time: 0,
            },
            LogicalMessage::StreamCommit {
                xid: 200,
                commit_lsn: Lsn(0x300),
                end_lsn: Lsn(0x380),
                commit_time: 5,
            },
            LogicalMessage::StreamPrepare(PrepareData {
                prepare_lsn: Lsn(1),
                end_lsn: Lsn(2),
                prepare_time: 3,
                xid: 4,
                gid: "g".into(),
            }),
        ];
        for msg in msgs {
            assert_eq!(LogicalMessage::decode(&msg.encode(), false).unwrap(), msg);
        }
    }

    #[test]
    fn test_xlogdata_envelope() {
        let inner = LogicalMessage::StreamStop.encode();
        let chunk = CopyData::XLogData {
            start_lsn: Lsn(0x10),
            end_lsn: Lsn(0x20),
            send_time: 7,
            data: inner.clone(),
        };
        let bytes = chunk.encode();
        assert_eq!(bytes.len(), 1 + XLOG_DATA_HEADER_SIZE + inner.len());
        assert_eq!(CopyData::decode(&bytes).unwrap(), chunk);
    }

    #[test]
    fn test_keepalive_and_reply() {
        let ka = CopyData::Keepalive {
            end_lsn: Lsn(0x108),
            send_time: 1,
            reply_requested: true,
        };
        assert_eq!(CopyData::decode(&ka.encode()).unwrap(), ka);

        let reply = StandbyStatusUpdate {
            write_lsn: Lsn(3),
            flush_lsn: Lsn(2),
            apply_lsn: Lsn(2),
            send_time: 9,
            reply_requested: false,
        };
        assert_eq!(StandbyStatusUpdate::decode(&reply.encode()).unwrap(), reply);
    }
}
