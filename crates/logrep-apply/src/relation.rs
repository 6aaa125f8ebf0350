//! Remote-to-local relation mapping.
//!
//! Every apply worker keeps its own [`RelationMap`]. A RELATION message
//! replaces the cached remote schema of one remote relation id; the first
//! open afterwards resolves the local relation by name, builds the attribute
//! map (local column position to remote column index), picks the index the
//! row locator will use and decides whether UPDATE/DELETE can be applied.
//! Partitions of a partitioned local target get their own cached mapping,
//! built on first use.

use crate::catalog::Catalog;
use crate::error::{ApplyError, Result, SchemaMismatchKind};
use crate::locks::{LockManager, LockMode, LockTag, XactLocks};
use crate::lsn::Lsn;
use crate::proto::{RelationBody, ReplicaIdentity};
use crate::storage::{IndexKey, RelKind, RelationDesc, StorageEngine};
use crate::types::{Oid, ProcId, RelState};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Local column position to remote column index; `None` is unmapped.
pub type AttrMap = Vec<Option<usize>>;

/// A remote relation resolved against its local counterpart.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRelation {
    /// Local relation definition.
    pub local: Arc<RelationDesc>,
    /// Local column position to remote column index.
    pub attrmap: AttrMap,
    /// Index used to locate rows, if any.
    pub index: Option<Oid>,
    /// UPDATE and DELETE can identify local rows.
    pub updatable: bool,
    /// Storage schema generation the mapping was built against.
    pub schema_generation: u64,
}

impl MappedRelation {
    /// Builds the mapping of `remote` onto `local`.
    ///
    /// Fails if a remote column has no local counterpart or maps onto a
    /// locally generated column.
    pub fn build(remote: &RelationBody, local: Arc<RelationDesc>, schema_generation: u64) -> Result<Self> {
        let attrmap = build_attrmap(remote, &local);

        let mut covered = vec![false; remote.columns.len()];
        let mut generated = Vec::new();
        for (local_col, remote_col) in local.columns.iter().zip(&attrmap) {
            if let Some(r) = remote_col {
                covered[*r] = true;
                if local_col.generated {
                    generated.push(remote.columns[*r].name.clone());
                }
            }
        }
        let missing: Vec<String> = remote
            .columns
            .iter()
            .zip(&covered)
            .filter(|(_, c)| !**c)
            .map(|(col, _)| col.name.clone())
            .collect();
        let relation = local.qualified_name();
        if !missing.is_empty() {
            return Err(ApplyError::SchemaMismatch {
                relation,
                kind: SchemaMismatchKind::MissingColumns(missing),
            });
        }
        if !generated.is_empty() {
            return Err(ApplyError::SchemaMismatch {
                relation,
                kind: SchemaMismatchKind::GeneratedColumns(generated),
            });
        }

        let updatable = is_updatable(remote, &local, &attrmap);
        let index = choose_index(remote, &local, &attrmap);
        Ok(Self {
            local,
            attrmap,
            index,
            updatable,
            schema_generation,
        })
    }

    /// Local relation oid.
    pub fn local_oid(&self) -> Oid {
        self.local.oid
    }

    /// True when the local target is a partitioned parent.
    pub fn is_partitioned(&self) -> bool {
        self.local.kind == RelKind::Partitioned
    }

    /// Whether the chosen index is the replica identity index or primary key,
    /// in which case a key match identifies the row.
    pub fn index_is_identity(&self) -> bool {
        match (self.index, self.local.identity_or_pk()) {
            (Some(chosen), Some(ri)) => chosen == ri.oid,
            _ => false,
        }
    }

    /// Fails with a replica identity mismatch unless UPDATE/DELETE is possible.
    pub fn check_updatable(&self, remote: &RelationBody) -> Result<()> {
        if self.updatable {
            return Ok(());
        }
        let relation = self.local.qualified_name();
        let msg = if remote.replident == ReplicaIdentity::Full {
            "has REPLICA IDENTITY FULL but the remote side does not send all key columns".to_string()
        } else {
            format!(
                "has neither REPLICA IDENTITY index nor PRIMARY KEY and published relation \"{}.{}\" does not have REPLICA IDENTITY FULL",
                remote.namespace, remote.name
            )
        };
        Err(ApplyError::SchemaMismatch {
            relation,
            kind: SchemaMismatchKind::ReplicaIdentity(msg),
        })
    }
}

/// Matches live local columns to remote columns by name.
pub fn build_attrmap(remote: &RelationBody, local: &RelationDesc) -> AttrMap {
    local
        .columns
        .iter()
        .map(|col| {
            if col.dropped {
                return None;
            }
            remote.columns.iter().position(|r| r.name == col.name)
        })
        .collect()
}

fn is_updatable(remote: &RelationBody, local: &RelationDesc, attrmap: &AttrMap) -> bool {
    if local.kind == RelKind::Partitioned {
        // Each partition decides for itself once routed to.
        return true;
    }
    let Some(index) = local.identity_or_pk() else {
        return remote.replident == ReplicaIdentity::Full;
    };
    index.keys.iter().all(|key| match key {
        IndexKey::Column(c) => match attrmap.get(*c).copied().flatten() {
            Some(r) => remote.columns[r].is_key,
            None => false,
        },
        IndexKey::Expression => false,
    })
}

/// Picks the index the row locator scans.
fn choose_index(remote: &RelationBody, local: &RelationDesc, attrmap: &AttrMap) -> Option<Oid> {
    if local.kind == RelKind::Partitioned {
        return None;
    }
    if let Some(index) = local.identity_or_pk() {
        return Some(index.oid);
    }
    if remote.replident != ReplicaIdentity::Full {
        return None;
    }
    local
        .indexes
        .iter()
        .find(|index| {
            index.access_method.supports_equality()
                && !index.partial
                && match index.keys.first() {
                    Some(IndexKey::Column(c)) => attrmap.get(*c).copied().flatten().is_some(),
                    _ => false,
                }
        })
        .map(|index| index.oid)
}

/// A relation opened for applying one change.
#[derive(Debug, Clone)]
pub struct OpenRelation {
    /// Remote relation id.
    pub remote_id: Oid,
    /// Cached remote schema.
    pub remote: Arc<RelationBody>,
    /// Local mapping.
    pub mapped: Arc<MappedRelation>,
    /// Sync state of the local relation for this subscription.
    pub state: RelState,
    /// LSN recorded with `state`.
    pub state_lsn: Lsn,
}

impl OpenRelation {
    /// Local relation oid.
    pub fn local_oid(&self) -> Oid {
        self.mapped.local.oid
    }

    /// `namespace.name` of the local relation.
    pub fn qualified_name(&self) -> String {
        self.mapped.local.qualified_name()
    }
}

/// Collaborators needed to open a relation.
#[derive(Clone, Copy)]
pub struct OpenContext<'a> {
    /// Local storage.
    pub storage: &'a dyn StorageEngine,
    /// Catalog, for sync state.
    pub catalog: &'a dyn Catalog,
    /// Lock manager.
    pub locks: &'a LockManager,
    /// The opening worker.
    pub proc: ProcId,
}

#[derive(Debug)]
struct Entry {
    remote: Arc<RelationBody>,
    mapped: Option<Arc<MappedRelation>>,
    state: RelState,
    state_lsn: Lsn,
}

/// Per-worker cache of remote relations.
#[derive(Debug)]
pub struct RelationMap {
    subid: Oid,
    entries: HashMap<Oid, Entry>,
    partitions: HashMap<(Oid, Oid), Arc<MappedRelation>>,
}

impl RelationMap {
    /// Empty cache for subscription `subid`.
    pub fn new(subid: Oid) -> Self {
        Self {
            subid,
            entries: HashMap::new(),
            partitions: HashMap::new(),
        }
    }

    /// Replaces the remote schema of `body.relid` and drops derived state.
    pub fn update(&mut self, body: RelationBody) {
        let relid = body.relid;
        self.partitions.retain(|(root, _), _| *root != relid);
        let entry = Entry {
            remote: Arc::new(body),
            mapped: None,
            state: RelState::Unknown,
            state_lsn: Lsn::INVALID,
        };
        if self.entries.insert(relid, entry).is_some() {
            debug!(remote_relid = relid, "relation map entry replaced");
        }
    }

    /// Cached remote schema.
    pub fn remote(&self, remote_id: Oid) -> Option<Arc<RelationBody>> {
        self.entries.get(&remote_id).map(|e| e.remote.clone())
    }

    /// Number of cached remote relations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Opens the local relation for `remote_id`, locking it in `mode` until
    /// the end of the current local transaction.
    pub async fn open(
        &mut self,
        remote_id: Oid,
        mode: LockMode,
        ctx: OpenContext<'_>,
        xact_locks: &mut XactLocks,
    ) -> Result<OpenRelation> {
        let generation = ctx.storage.schema_generation();
        let entry = self.entries.get_mut(&remote_id).ok_or_else(|| {
            ApplyError::protocol(format!(
                "no relation map entry for remote relation ID {remote_id}"
            ))
        })?;
        if entry
            .mapped
            .as_ref()
            .is_some_and(|m| m.schema_generation != generation)
        {
            entry.mapped = None;
        }

        let local = match &entry.mapped {
            Some(mapped) => mapped.local.clone(),
            None => ctx
                .storage
                .relation_by_name(&entry.remote.namespace, &entry.remote.name)
                .ok_or_else(|| ApplyError::SchemaMismatch {
                    relation: format!("{}.{}", entry.remote.namespace, entry.remote.name),
                    kind: SchemaMismatchKind::MissingRelation,
                })?,
        };
        xact_locks
            .acquire(ctx.locks, ctx.proc, LockTag::Relation { relid: local.oid }, mode)
            .await?;

        let mapped = match &entry.mapped {
            Some(mapped) => mapped.clone(),
            None => {
                let mapped = Arc::new(MappedRelation::build(&entry.remote, local, generation)?);
                debug!(
                    remote_relid = remote_id,
                    local_relid = mapped.local.oid,
                    index = ?mapped.index,
                    updatable = mapped.updatable,
                    "relation map entry rebuilt"
                );
                entry.mapped = Some(mapped.clone());
                mapped
            }
        };

        if entry.state != RelState::Ready {
            match ctx.catalog.relation_state(self.subid, mapped.local.oid) {
                Some(row) => {
                    entry.state = row.state;
                    entry.state_lsn = row.lsn;
                }
                None => {
                    entry.state = RelState::Unknown;
                    entry.state_lsn = Lsn::INVALID;
                }
            }
        }

        Ok(OpenRelation {
            remote_id,
            remote: entry.remote.clone(),
            mapped,
            state: entry.state,
            state_lsn: entry.state_lsn,
        })
    }

    /// Mapping for a leaf partition of the partitioned target of `root`.
    pub fn partition_open(
        &mut self,
        root: &OpenRelation,
        partition: Oid,
        storage: &dyn StorageEngine,
    ) -> Result<Arc<MappedRelation>> {
        let generation = storage.schema_generation();
        let key = (root.remote_id, partition);
        if let Some(mapped) = self.partitions.get(&key) {
            if mapped.schema_generation == generation {
                return Ok(mapped.clone());
            }
        }
        let local = storage.relation(partition).ok_or_else(|| {
            ApplyError::storage(format!("partition {partition} does not exist"))
        })?;
        let mapped = Arc::new(MappedRelation::build(&root.remote, local, generation)?);
        self.partitions.insert(key, mapped.clone());
        Ok(mapped)
    }

    /// Forgets cached sync states so the next open rereads them.
    pub fn invalidate_states(&mut self) {
        for entry in self.entries.values_mut() {
            entry.state = RelState::Unknown;
        }
    }
}
