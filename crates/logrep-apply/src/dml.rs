//! Row changes: INSERT, UPDATE, DELETE and TRUNCATE.

use crate::apply::ApplyWorker;
use crate::conflict::{ConflictRecord, ConflictType};
use crate::error::{ApplyError, Result};
use crate::locator::{find_tuple, LocatorContext, SearchRow};
use crate::locks::{LockMode, LockTag};
use crate::proto::{action, TupleData, TupleValue};
use crate::relation::{MappedRelation, OpenRelation};
use crate::slots::WorkerKind;
use crate::storage::{
    input_text, receive_binary, type_name, type_oid, ColumnDefault, Datum, LocalXid, RelKind,
    RelationDesc, StorageEngine, StoredTuple,
};
use crate::types::{Oid, RelState, TransactionId};
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// Converts a remote tuple into local column order.
///
/// Text values go through the local type's input function and binary values
/// through its receive function, which must consume the whole value.
/// Columns the remote side did not send, including unchanged TOAST values,
/// are left NULL and marked not present.
pub(crate) fn slot_store_data(mapped: &MappedRelation, tuple: &TupleData) -> Result<SearchRow> {
    let ncols = mapped.local.columns.len();
    let mut values = Vec::with_capacity(ncols);
    let mut present = Vec::with_capacity(ncols);
    for (col, remote) in mapped.local.columns.iter().zip(&mapped.attrmap) {
        let sent = remote.and_then(|r| tuple.columns.get(r).map(|v| (r, v)));
        let value = match sent {
            None | Some((_, TupleValue::Unchanged)) => {
                values.push(Datum::Null);
                present.push(false);
                continue;
            }
            Some((_, TupleValue::Null)) => Datum::Null,
            Some((_, TupleValue::Text(bytes))) => {
                let text = std::str::from_utf8(bytes).map_err(|_| {
                    ApplyError::InvalidTextRepresentation {
                        type_name: type_name(col.type_oid).to_string(),
                        value: String::from_utf8_lossy(bytes).into_owned(),
                    }
                })?;
                input_text(col.type_oid, text)?
            }
            Some((r, TupleValue::Binary(bytes))) => match receive_binary(col.type_oid, bytes) {
                Some((datum, used)) if used == bytes.len() => datum,
                _ => return Err(ApplyError::InvalidBinaryRepresentation { column: r + 1 }),
            },
        };
        values.push(value);
        present.push(true);
    }
    Ok(SearchRow { values, present })
}

/// Overlays the columns sent in `new` onto the local row.
pub(crate) fn slot_modify_data(local: &StoredTuple, new: &SearchRow) -> Vec<Datum> {
    local
        .values
        .iter()
        .zip(new.values.iter().zip(&new.present))
        .map(|(old, (value, present))| if *present { value.clone() } else { old.clone() })
        .collect()
}

/// Printable form of a remote tuple, for conflict reports.
pub(crate) fn tuple_text(tuple: &TupleData) -> String {
    let cols: Vec<String> = tuple
        .columns
        .iter()
        .map(|v| match v {
            TupleValue::Null => "NULL".to_string(),
            TupleValue::Unchanged => "unchanged-toast-datum".to_string(),
            TupleValue::Text(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            TupleValue::Binary(bytes) => {
                let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
                format!("\\x{hex}")
            }
        })
        .collect();
    format!("({})", cols.join(", "))
}

fn sequence_datum(column_type: Oid, value: i64) -> Result<Datum> {
    let overflow = || ApplyError::storage(format!("nextval: reached maximum value of sequence ({value})"));
    Ok(match column_type {
        type_oid::INT2 => Datum::Int2(i16::try_from(value).map_err(|_| overflow())?),
        type_oid::INT4 => Datum::Int4(i32::try_from(value).map_err(|_| overflow())?),
        _ => Datum::Int8(value),
    })
}

/// Fills local columns the remote side did not send from their defaults.
pub(crate) fn fill_defaults(
    storage: &dyn StorageEngine,
    xid: LocalXid,
    desc: &RelationDesc,
    row: SearchRow,
) -> Result<Vec<Datum>> {
    let SearchRow {
        mut values,
        present,
    } = row;
    for (i, col) in desc.columns.iter().enumerate() {
        if present[i] || col.dropped || col.generated {
            continue;
        }
        values[i] = match &col.default {
            Some(ColumnDefault::Value(datum)) => datum.clone(),
            Some(ColumnDefault::Sequence) => {
                let next = storage.next_sequence_value(xid, desc.oid)?;
                sequence_datum(col.type_oid, next)?
            }
            None => Datum::Null,
        };
    }
    Ok(values)
}

/// Moves a row from one relation's column order into another's, matching
/// columns by name. Columns `from` lacks come out NULL.
pub(crate) fn convert_layout(from: &RelationDesc, to: &RelationDesc, values: &[Datum]) -> Vec<Datum> {
    to.columns
        .iter()
        .map(|col| {
            from.column_index(&col.name)
                .and_then(|i| values.get(i).cloned())
                .unwrap_or(Datum::Null)
        })
        .collect()
}

/// Completes a new row of `root` and picks the relation it goes into.
///
/// Defaults are evaluated once, in the root's layout; for a partitioned
/// root the finished row is routed and converted to the leaf's layout.
pub(crate) fn route_insert(
    storage: &dyn StorageEngine,
    xid: LocalXid,
    root: &RelationDesc,
    row: SearchRow,
) -> Result<(Oid, Vec<Datum>)> {
    let values = fill_defaults(storage, xid, root, row)?;
    if root.kind != RelKind::Partitioned {
        return Ok((root.oid, values));
    }
    let leaf = storage.route_partition(root.oid, &values)?;
    let part = storage
        .relation(leaf)
        .ok_or_else(|| ApplyError::storage(format!("partition {leaf} does not exist")))?;
    Ok((leaf, convert_layout(root, &part, &values)))
}

/// A parallel applier only touches READY relations; any other state,
/// including one missing from the catalog, makes it stop so the leader can
/// take the transaction back.
fn check_parallel_apply_state(sub_name: &str, state: RelState) -> Result<()> {
    if state == RelState::Ready {
        return Ok(());
    }
    Err(ApplyError::PrerequisiteNotMet {
        msg: format!(
            "logical replication parallel apply worker for subscription \"{sub_name}\" will stop: cannot handle streamed replication transactions using parallel apply workers until all tables have been synchronized"
        ),
    })
}

impl ApplyWorker {
    fn is_skipping_changes(&self) -> bool {
        self.skip.is_skipping()
    }

    /// Whether changes for `rel` are applied by this worker right now.
    ///
    /// A tablesync worker applies only its own relation. The leader applies
    /// READY relations, and SYNCDONE ones once it has passed the sync LSN.
    /// A parallel applier cannot coordinate with tablesync workers, so it
    /// stops if any relation it touches is not READY.
    pub(crate) fn should_apply_changes_for_rel(&self, rel: &OpenRelation) -> Result<bool> {
        match self.kind {
            WorkerKind::TableSync => Ok(self.sync_relid == Some(rel.local_oid())),
            WorkerKind::ParallelApply => {
                check_parallel_apply_state(&self.sub.name, rel.state)?;
                Ok(true)
            }
            WorkerKind::Leader => Ok(rel.state == RelState::Ready
                || (rel.state == RelState::SyncDone && rel.state_lsn <= self.remote_final_lsn)),
            WorkerKind::SequenceSync => Ok(false),
        }
    }

    async fn lock_partition(&mut self, relid: Oid, mode: LockMode) -> Result<()> {
        let env = self.env.clone();
        self.xact_locks
            .acquire(&env.locks, self.proc, LockTag::Relation { relid }, mode)
            .await
    }

    /// The leaf partition holding `search`, or the relation itself.
    async fn target_for(
        &mut self,
        rel: &OpenRelation,
        search: &SearchRow,
    ) -> Result<(Oid, Arc<MappedRelation>)> {
        if !rel.mapped.is_partitioned() {
            return Ok((rel.local_oid(), rel.mapped.clone()));
        }
        let env = self.env.clone();
        let part = env.storage.route_partition(rel.local_oid(), &search.values)?;
        self.lock_partition(part, LockMode::RowExclusive).await?;
        let mapped = self.relmap.partition_open(rel, part, env.storage.as_ref())?;
        mapped.check_updatable(&rel.remote)?;
        Ok((part, mapped))
    }

    fn report_conflict(
        &self,
        kind: ConflictType,
        rel: &OpenRelation,
        remote: &TupleData,
        new: Option<&TupleData>,
        local: Option<&StoredTuple>,
    ) {
        let mut record = ConflictRecord::missing(
            kind,
            self.sub.oid,
            rel.qualified_name(),
            self.errctx.remote_xid,
            self.errctx.finish_lsn,
        );
        record.remote_tuple = Some(tuple_text(remote));
        record.new_tuple = new.map(tuple_text);
        if let Some(local) = local {
            record.local_xmin = Some(local.xmin);
            record.local_origin = Some(local.origin);
            record.local_commit_ts = Some(local.commit_ts);
        }
        self.env.conflicts.report(record);
    }

    pub(crate) async fn handle_insert(
        &mut self,
        xid: Option<TransactionId>,
        relid: Oid,
        new_tuple: TupleData,
        raw: &Bytes,
    ) -> Result<()> {
        if self.is_skipping_changes()
            || self.handle_streamed_transaction(action::INSERT, xid, raw).await?
        {
            return Ok(());
        }
        let local_xid = self.ensure_local_xact();
        let env = self.env.clone();
        let rel = self
            .relmap
            .open(
                relid,
                LockMode::RowExclusive,
                ApplyWorker::open_ctx(&env, self.proc),
                &mut self.xact_locks,
            )
            .await?;
        if !self.should_apply_changes_for_rel(&rel)? {
            return Ok(());
        }
        self.errctx.relation = Some(rel.qualified_name());

        let row = slot_store_data(&rel.mapped, &new_tuple)?;
        let (target, values) = route_insert(env.storage.as_ref(), local_xid, &rel.mapped.local, row)?;
        if target != rel.local_oid() {
            self.lock_partition(target, LockMode::RowExclusive).await?;
            // Fails if the partition lacks a published column.
            self.relmap.partition_open(&rel, target, env.storage.as_ref())?;
        }
        env.storage.insert(local_xid, target, values)?;
        self.errctx.relation = None;
        Ok(())
    }

    pub(crate) async fn handle_update(
        &mut self,
        xid: Option<TransactionId>,
        relid: Oid,
        old_tuple: Option<TupleData>,
        new_tuple: TupleData,
        raw: &Bytes,
    ) -> Result<()> {
        if self.is_skipping_changes()
            || self.handle_streamed_transaction(action::UPDATE, xid, raw).await?
        {
            return Ok(());
        }
        let local_xid = self.ensure_local_xact();
        let env = self.env.clone();
        let rel = self
            .relmap
            .open(
                relid,
                LockMode::RowExclusive,
                ApplyWorker::open_ctx(&env, self.proc),
                &mut self.xact_locks,
            )
            .await?;
        if !self.should_apply_changes_for_rel(&rel)? {
            return Ok(());
        }
        self.errctx.relation = Some(rel.qualified_name());
        rel.mapped.check_updatable(&rel.remote)?;

        let newrow = slot_store_data(&rel.mapped, &new_tuple)?;
        // Without an old tuple the key did not change; search by the new one.
        let search = match &old_tuple {
            Some(old) => slot_store_data(&rel.mapped, old)?,
            None => newrow.clone(),
        };
        let (target, mapped) = self.target_for(&rel, &search).await?;
        let (newrow, search) = if target == rel.local_oid() {
            (newrow, search)
        } else {
            let newrow = slot_store_data(&mapped, &new_tuple)?;
            let search = match &old_tuple {
                Some(old) => slot_store_data(&mapped, old)?,
                None => newrow.clone(),
            };
            (newrow, search)
        };

        let ctx = LocatorContext {
            storage: env.storage.as_ref(),
            locks: &env.locks,
            proc: self.proc,
        };
        let found = find_tuple(ctx, &mut self.xact_locks, &mapped, &search, LockMode::Exclusive).await?;
        let remote = old_tuple.as_ref().unwrap_or(&new_tuple);
        match found {
            Some(local) => {
                if local.origin != self.origin {
                    self.report_conflict(
                        ConflictType::UpdateOriginDiffers,
                        &rel,
                        remote,
                        Some(&new_tuple),
                        Some(&local),
                    );
                }
                let values = slot_modify_data(&local, &newrow);
                let dest = if rel.mapped.is_partitioned() {
                    let routed = convert_layout(&mapped.local, &rel.mapped.local, &values);
                    env.storage.route_partition(rel.local_oid(), &routed)?
                } else {
                    target
                };
                if dest == target {
                    env.storage.update(local_xid, target, local.tid, values)?;
                } else {
                    // The new row belongs to another partition.
                    self.lock_partition(dest, LockMode::RowExclusive).await?;
                    let dest_desc = env.storage.relation(dest).ok_or_else(|| {
                        ApplyError::storage(format!("partition {dest} does not exist"))
                    })?;
                    let moved = convert_layout(&mapped.local, &dest_desc, &values);
                    env.storage.delete(local_xid, target, local.tid)?;
                    env.storage.insert(local_xid, dest, moved)?;
                    debug!(from = target, to = dest, "moved row across partitions");
                }
            }
            None => self.report_conflict(
                ConflictType::UpdateMissing,
                &rel,
                remote,
                Some(&new_tuple),
                None,
            ),
        }
        self.errctx.relation = None;
        Ok(())
    }

    pub(crate) async fn handle_delete(
        &mut self,
        xid: Option<TransactionId>,
        relid: Oid,
        old_tuple: TupleData,
        raw: &Bytes,
    ) -> Result<()> {
        if self.is_skipping_changes()
            || self.handle_streamed_transaction(action::DELETE, xid, raw).await?
        {
            return Ok(());
        }
        let local_xid = self.ensure_local_xact();
        let env = self.env.clone();
        let rel = self
            .relmap
            .open(
                relid,
                LockMode::RowExclusive,
                ApplyWorker::open_ctx(&env, self.proc),
                &mut self.xact_locks,
            )
            .await?;
        if !self.should_apply_changes_for_rel(&rel)? {
            return Ok(());
        }
        self.errctx.relation = Some(rel.qualified_name());
        rel.mapped.check_updatable(&rel.remote)?;

        let search = slot_store_data(&rel.mapped, &old_tuple)?;
        let (target, mapped) = self.target_for(&rel, &search).await?;
        let search = if target == rel.local_oid() {
            search
        } else {
            slot_store_data(&mapped, &old_tuple)?
        };
        let ctx = LocatorContext {
            storage: env.storage.as_ref(),
            locks: &env.locks,
            proc: self.proc,
        };
        match find_tuple(ctx, &mut self.xact_locks, &mapped, &search, LockMode::Exclusive).await? {
            Some(local) => {
                if local.origin != self.origin {
                    self.report_conflict(
                        ConflictType::DeleteOriginDiffers,
                        &rel,
                        &old_tuple,
                        None,
                        Some(&local),
                    );
                }
                env.storage.delete(local_xid, target, local.tid)?;
            }
            None => self.report_conflict(ConflictType::DeleteMissing, &rel, &old_tuple, None, None),
        }
        self.errctx.relation = None;
        Ok(())
    }

    pub(crate) async fn handle_truncate(
        &mut self,
        xid: Option<TransactionId>,
        relids: Vec<Oid>,
        cascade: bool,
        restart_seqs: bool,
        raw: &Bytes,
    ) -> Result<()> {
        if self.is_skipping_changes()
            || self.handle_streamed_transaction(action::TRUNCATE, xid, raw).await?
        {
            return Ok(());
        }
        let local_xid = self.ensure_local_xact();
        let env = self.env.clone();
        let mut targets: Vec<Oid> = Vec::with_capacity(relids.len());
        for remote_id in relids {
            let rel = self
                .relmap
                .open(
                    remote_id,
                    LockMode::AccessExclusive,
                    ApplyWorker::open_ctx(&env, self.proc),
                    &mut self.xact_locks,
                )
                .await?;
            if !self.should_apply_changes_for_rel(&rel)? {
                continue;
            }
            if !targets.contains(&rel.local_oid()) {
                targets.push(rel.local_oid());
            }
            if !rel.mapped.is_partitioned() {
                continue;
            }
            // Every inheritor of a partitioned parent goes too.
            let mut pending = vec![rel.mapped.local.clone()];
            while let Some(desc) = pending.pop() {
                let Some(spec) = &desc.partition else {
                    continue;
                };
                for (part, _) in &spec.partitions {
                    if targets.contains(part) {
                        continue;
                    }
                    self.lock_partition(*part, LockMode::AccessExclusive).await?;
                    targets.push(*part);
                    if let Some(child) = env.storage.relation(*part) {
                        pending.push(child);
                    }
                }
            }
        }
        if targets.is_empty() {
            return Ok(());
        }
        let truncated = env
            .storage
            .truncate(local_xid, &targets, cascade, restart_seqs)?;
        debug!(relations = ?truncated, cascade, restart_seqs, "truncated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::OriginId;
    use crate::proto::{RelationBody, RelationColumn, ReplicaIdentity};
    use crate::storage::{MemoryStorage, PartitionBound};

    fn mapped() -> MappedRelation {
        let remote = RelationBody {
            relid: 100,
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
        };
        // Local column order differs and there is an extra local column.
        let local = RelationDesc::table(16384, "public", "t")
            .column("v", type_oid::TEXT)
            .column_with_default("n", type_oid::INT8, ColumnDefault::Value(Datum::Int8(7)))
            .column("id", type_oid::INT4)
            .primary_key(16390, &[2]);
        MappedRelation::build(&remote, Arc::new(local), 1).unwrap()
    }

    #[test]
    fn test_store_data_maps_by_name() {
        let row = slot_store_data(
            &mapped(),
            &TupleData {
                columns: vec![TupleValue::text("5"), TupleValue::Unchanged],
            },
        )
        .unwrap();
        assert_eq!(row.values, vec![Datum::Null, Datum::Null, Datum::Int4(5)]);
        assert_eq!(row.present, vec![false, false, true]);
    }

    #[test]
    fn test_binary_value_must_be_fully_consumed() {
        let tuple = TupleData {
            columns: vec![
                TupleValue::Binary(vec![0, 0, 0, 5, 0]),
                TupleValue::text("x"),
            ],
        };
        match slot_store_data(&mapped(), &tuple) {
            Err(ApplyError::InvalidBinaryRepresentation { column }) => assert_eq!(column, 1),
            other => panic!("unexpected {other:?}"),
        }
        let tuple = TupleData {
            columns: vec![TupleValue::Binary(vec![0, 0, 0, 5]), TupleValue::Null],
        };
        let row = slot_store_data(&mapped(), &tuple).unwrap();
        assert_eq!(row.values[2], Datum::Int4(5));
        assert!(row.present[0]);
    }

    #[test]
    fn test_bad_text_input() {
        let tuple = TupleData::from_text(&["five", "x"]);
        assert!(matches!(
            slot_store_data(&mapped(), &tuple),
            Err(ApplyError::InvalidTextRepresentation { .. })
        ));
    }

    #[test]
    fn test_modify_keeps_unsent_columns() {
        let local = StoredTuple {
            tid: 1,
            values: vec![Datum::Text("old".into()), Datum::Int8(3), Datum::Int4(5)],
            xmin: LocalXid(1),
            origin: OriginId::INVALID,
            commit_ts: 0,
        };
        let new = slot_store_data(
            &mapped(),
            &TupleData {
                columns: vec![TupleValue::text("5"), TupleValue::Unchanged],
            },
        )
        .unwrap();
        assert_eq!(
            slot_modify_data(&local, &new),
            vec![Datum::Text("old".into()), Datum::Int8(3), Datum::Int4(5)]
        );
    }

    #[test]
    fn test_tuple_text() {
        let tuple = TupleData {
            columns: vec![
                TupleValue::text("1"),
                TupleValue::Null,
                TupleValue::Unchanged,
                TupleValue::Binary(vec![0xab, 0x01]),
            ],
        };
        assert_eq!(tuple_text(&tuple), "(1, NULL, unchanged-toast-datum, \\xab01)");
    }

    #[test]
    fn test_sequence_datum_fits_column() {
        assert_eq!(sequence_datum(type_oid::INT4, 9).unwrap(), Datum::Int4(9));
        assert_eq!(sequence_datum(type_oid::INT8, 9).unwrap(), Datum::Int8(9));
        assert!(sequence_datum(type_oid::INT2, 70_000).is_err());
    }

    fn sequenced_partitions() -> (MemoryStorage, RelationDesc) {
        let storage = MemoryStorage::new();
        let root = RelationDesc::table(20, "public", "m")
            .column("id", type_oid::INT4)
            .column_with_default("n", type_oid::INT8, ColumnDefault::Sequence)
            .partitioned_by(0, vec![(21, PartitionBound::List(vec![Datum::Int4(7)]))]);
        // Same columns in another order, with its own sequence.
        let mut part = RelationDesc::table(21, "public", "m_p")
            .column_with_default("n", type_oid::INT8, ColumnDefault::Sequence)
            .column("id", type_oid::INT4);
        part.parent = Some(20);
        storage.create_table(root.clone()).unwrap();
        storage.create_table(part).unwrap();
        (storage, root)
    }

    #[test]
    fn test_partitioned_insert_draws_root_sequence_once() {
        let (storage, root) = sequenced_partitions();
        let xid = storage.begin(OriginId::INVALID);
        let row = SearchRow {
            values: vec![Datum::Int4(7), Datum::Null],
            present: vec![true, false],
        };
        let (target, values) = route_insert(&storage, xid, &root, row).unwrap();
        assert_eq!(target, 21);
        assert_eq!(values, vec![Datum::Int8(1), Datum::Int4(7)]);

        assert_eq!(storage.next_sequence_value(xid, 20).unwrap(), 2);
        assert_eq!(storage.next_sequence_value(xid, 21).unwrap(), 1);
    }

    #[test]
    fn test_unpartitioned_insert_keeps_layout() {
        let storage = MemoryStorage::new();
        let desc = RelationDesc::table(30, "public", "plain")
            .column("id", type_oid::INT4)
            .column_with_default("n", type_oid::INT8, ColumnDefault::Value(Datum::Int8(4)));
        storage.create_table(desc.clone()).unwrap();
        let xid = storage.begin(OriginId::INVALID);
        let row = SearchRow {
            values: vec![Datum::Int4(1), Datum::Null],
            present: vec![true, false],
        };
        assert_eq!(
            route_insert(&storage, xid, &desc, row).unwrap(),
            (30, vec![Datum::Int4(1), Datum::Int8(4)])
        );
    }

    #[test]
    fn test_convert_layout_maps_by_name() {
        let (storage, root) = sequenced_partitions();
        let part = storage.relation(21).unwrap();
        let values = vec![Datum::Int4(7), Datum::Int8(3)];
        assert_eq!(
            convert_layout(&root, &part, &values),
            vec![Datum::Int8(3), Datum::Int4(7)]
        );
        assert_eq!(convert_layout(&part, &root, &convert_layout(&root, &part, &values)), values);
    }

    #[test]
    fn test_parallel_applier_needs_ready_relations() {
        assert!(check_parallel_apply_state("sub1", RelState::Ready).is_ok());
        for state in [RelState::Unknown, RelState::Init, RelState::SyncDone] {
            match check_parallel_apply_state("sub1", state) {
                Err(ApplyError::PrerequisiteNotMet { msg }) => assert!(msg.contains("\"sub1\"")),
                other => panic!("{state:?}: unexpected {other:?}"),
            }
        }
    }
}
