//! Finding the local row a remote UPDATE or DELETE refers to.

use crate::error::Result;
use crate::locks::{LockManager, LockMode, LockTag, XactLocks};
use crate::relation::MappedRelation;
use crate::storage::{Datum, IndexKey, StorageEngine, StoredTuple};
use crate::types::ProcId;
use tracing::debug;

/// A remote tuple translated into local column order.
///
/// `present[i]` is false for local columns the remote side did not send
/// (unmapped, or unchanged TOAST); those never take part in matching.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRow {
    /// Values in local column order.
    pub values: Vec<Datum>,
    /// Which values were actually sent.
    pub present: Vec<bool>,
}

impl SearchRow {
    /// Whether `tuple` matches on every present column. NULL matches NULL.
    pub fn matches(&self, tuple: &StoredTuple) -> bool {
        self.values
            .iter()
            .zip(&self.present)
            .zip(&tuple.values)
            .all(|((want, present), have)| {
                !*present
                    || match (want.is_null(), have.is_null()) {
                        (true, true) => true,
                        (false, false) => want.equals(have),
                        _ => false,
                    }
            })
    }
}

/// Where to look.
#[derive(Clone, Copy)]
pub struct LocatorContext<'a> {
    /// Local storage.
    pub storage: &'a dyn StorageEngine,
    /// Lock manager for row locks.
    pub locks: &'a LockManager,
    /// The searching worker.
    pub proc: ProcId,
}

/// Finds the local row matching `search` and locks it in `mode` until the
/// end of the local transaction. Returns `None` when nothing matches.
///
/// With the replica identity index or primary key a key match is enough.
/// Any other index (usable under REPLICA IDENTITY FULL) only narrows the
/// candidates, which are then compared column by column, as in a
/// sequential scan.
pub async fn find_tuple(
    ctx: LocatorContext<'_>,
    xact_locks: &mut XactLocks,
    mapped: &MappedRelation,
    search: &SearchRow,
    mode: LockMode,
) -> Result<Option<StoredTuple>> {
    let relid = mapped.local_oid();
    loop {
        let Some(candidate) = scan(ctx.storage, mapped, search)? else {
            return Ok(None);
        };
        xact_locks
            .acquire(
                ctx.locks,
                ctx.proc,
                LockTag::Tuple {
                    relid,
                    tid: candidate.tid,
                },
                mode,
            )
            .await?;
        // The row may have changed while we waited for its lock.
        match ctx.storage.fetch(relid, candidate.tid) {
            Some(current) if current == candidate || still_matches(mapped, search, &current) => {
                return Ok(Some(current))
            }
            _ => debug!(relid, tid = candidate.tid, "concurrent update, retrying"),
        }
    }
}

fn still_matches(mapped: &MappedRelation, search: &SearchRow, tuple: &StoredTuple) -> bool {
    match key_columns(mapped) {
        Some((cols, true)) => cols
            .iter()
            .all(|c| tuple.values[*c].equals(&search.values[*c])),
        _ => search.matches(tuple),
    }
}

/// Key columns of the chosen index, and whether it identifies rows.
fn key_columns(mapped: &MappedRelation) -> Option<(Vec<usize>, bool)> {
    let oid = mapped.index?;
    let index = mapped.local.indexes.iter().find(|i| i.oid == oid)?;
    let mut cols = Vec::new();
    for key in &index.keys {
        match key {
            IndexKey::Column(c) => cols.push(*c),
            IndexKey::Expression => break,
        }
    }
    Some((cols, mapped.index_is_identity()))
}

fn scan(
    storage: &dyn StorageEngine,
    mapped: &MappedRelation,
    search: &SearchRow,
) -> Result<Option<StoredTuple>> {
    let relid = mapped.local_oid();
    if let (Some(index_oid), Some((cols, identity))) = (mapped.index, key_columns(mapped)) {
        let key: Vec<Datum> = cols
            .iter()
            .take_while(|c| search.present.get(**c).copied().unwrap_or(false))
            .map(|c| search.values[*c].clone())
            .collect();
        if !key.is_empty() {
            let candidates = storage.index_scan(relid, index_oid, &key)?;
            let found = if identity && key.len() == cols.len() {
                candidates.into_iter().next()
            } else {
                candidates.into_iter().find(|t| search.matches(t))
            };
            return Ok(found);
        }
    }
    Ok(storage
        .seq_scan(relid)?
        .into_iter()
        .find(|t| search.matches(t)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{RelationBody, RelationColumn, ReplicaIdentity};
    use crate::storage::{type_oid, MemoryStorage, RelationDesc};
    use crate::origin::OriginId;
    use std::sync::Arc;

    fn body(replident: ReplicaIdentity) -> RelationBody {
        RelationBody {
            relid: 1,
            namespace: "public".into(),
            name: "t".into(),
            replident,
            columns: vec![
                RelationColumn {
                    is_key: true,
                    name: "id".into(),
                    type_oid: type_oid::INT4,
                    type_modifier: -1,
                },
                RelationColumn {
                    is_key: replident == ReplicaIdentity::Full,
                    name: "v".into(),
                    type_oid: type_oid::TEXT,
                    type_modifier: -1,
                },
            ],
        }
    }

    fn search(id: i32, v: Option<&str>) -> SearchRow {
        SearchRow {
            values: vec![
                Datum::Int4(id),
                v.map(|s| Datum::Text(s.into())).unwrap_or(Datum::Null),
            ],
            present: vec![true, v.is_some()],
        }
    }

    fn setup(desc: RelationDesc, replident: ReplicaIdentity) -> (MemoryStorage, MappedRelation) {
        let storage = MemoryStorage::new();
        let desc = storage.create_table(desc).unwrap();
        storage
            .insert_local(
                desc.oid,
                vec![
                    vec![Datum::Int4(1), Datum::Text("a".into())],
                    vec![Datum::Int4(2), Datum::Text("b".into())],
                    vec![Datum::Int4(2), Datum::Null],
                ],
            )
            .unwrap();
        let mapped = MappedRelation::build(&body(replident), desc, storage.schema_generation()).unwrap();
        (storage, mapped)
    }

    #[tokio::test]
    async fn test_primary_key_lookup_uses_index() {
        let desc = RelationDesc::table(1, "public", "t")
            .column("id", type_oid::INT4)
            .column("v", type_oid::TEXT);
        let storage = MemoryStorage::new();
        let desc = storage
            .create_table(desc.primary_key(2, &[0]))
            .unwrap();
        storage
            .insert_local(1, vec![vec![Datum::Int4(5), Datum::Text("x".into())]])
            .unwrap();
        let mapped = MappedRelation::build(&body(ReplicaIdentity::Default), desc, 0).unwrap();
        let locks = LockManager::new();
        let mut xl = XactLocks::default();
        let ctx = LocatorContext {
            storage: &storage,
            locks: &locks,
            proc: ProcId(1),
        };
        let hit = find_tuple(ctx, &mut xl, &mapped, &search(5, None), LockMode::Exclusive)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.values[1], Datum::Text("x".into()));
        assert_eq!(storage.scan_stats().index_scans, 1);
        assert_eq!(storage.scan_stats().seq_scans, 0);
        assert_eq!(xl.len(), 1);

        let miss = find_tuple(ctx, &mut xl, &mapped, &search(6, None), LockMode::Exclusive)
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn test_full_identity_seq_scan_compares_all_columns() {
        let desc = RelationDesc::table(1, "public", "t")
            .column("id", type_oid::INT4)
            .column("v", type_oid::TEXT);
        let (storage, mapped) = setup(desc, ReplicaIdentity::Full);
        assert_eq!(mapped.index, None);
        let locks = LockManager::new();
        let mut xl = XactLocks::default();
        let ctx = LocatorContext {
            storage: &storage,
            locks: &locks,
            proc: ProcId(1),
        };
        let full_null = SearchRow {
            values: vec![Datum::Int4(2), Datum::Null],
            present: vec![true, true],
        };
        let hit = find_tuple(ctx, &mut xl, &mapped, &full_null, LockMode::Exclusive)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.values[1], Datum::Null);
        let hit = find_tuple(ctx, &mut xl, &mapped, &search(2, Some("b")), LockMode::Exclusive)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.values[1], Datum::Text("b".into()));
        assert_eq!(storage.scan_stats().index_scans, 0);
    }

    #[tokio::test]
    async fn test_secondary_index_filters_candidates() {
        let desc = RelationDesc::table(1, "public", "t")
            .column("id", type_oid::INT4)
            .column("v", type_oid::TEXT)
            .index(crate::storage::LocalIndex {
                oid: 9,
                name: "t_id".into(),
                keys: vec![IndexKey::Column(0)],
                unique: false,
                primary: false,
                replica_identity: false,
                partial: false,
                access_method: crate::storage::AccessMethod::Btree,
            });
        let (storage, mapped) = setup(desc, ReplicaIdentity::Full);
        assert_eq!(mapped.index, Some(9));
        let locks = LockManager::new();
        let ctx = LocatorContext {
            storage: &storage,
            locks: &locks,
            proc: ProcId(1),
        };
        let full_null = SearchRow {
            values: vec![Datum::Int4(2), Datum::Null],
            present: vec![true, true],
        };
        let hit = find_tuple(ctx, &mut XactLocks::default(), &mapped, &full_null, LockMode::Exclusive)
            .await
            .unwrap()
            .unwrap();
        assert!(hit.values[1].is_null());
        assert_eq!(storage.scan_stats().index_scans, 1);
    }

    #[tokio::test]
    async fn test_row_lock_waits_for_other_worker() {
        let desc = RelationDesc::table(1, "public", "t")
            .column("id", type_oid::INT4)
            .column("v", type_oid::TEXT)
            .primary_key(2, &[0]);
        let storage = Arc::new(MemoryStorage::new());
        let desc = storage.create_table(desc).unwrap();
        storage
            .insert_local(1, vec![vec![Datum::Int4(5), Datum::Text("x".into())]])
            .unwrap();
        let mapped = MappedRelation::build(&body(ReplicaIdentity::Default), desc, 0).unwrap();
        let locks = Arc::new(LockManager::new());
        let tid = storage.seq_scan(1).unwrap()[0].tid;
        locks
            .lock(ProcId(9), LockTag::Tuple { relid: 1, tid }, LockMode::Exclusive)
            .await
            .unwrap();

        // Another worker deletes the row, then lets go of its lock.
        let (s2, l2) = (storage.clone(), locks.clone());
        let other = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let x = s2.begin(OriginId::INVALID);
            s2.delete(x, 1, tid).unwrap();
            s2.commit(x).unwrap();
            l2.release_all(ProcId(9));
        });
        let ctx = LocatorContext {
            storage: storage.as_ref(),
            locks: &locks,
            proc: ProcId(1),
        };
        let found = find_tuple(ctx, &mut XactLocks::default(), &mapped, &search(5, None), LockMode::Exclusive)
            .await
            .unwrap();
        assert!(found.is_none());
        other.await.unwrap();
    }
}
