//! Catalog surface consumed by the apply workers.
//!
//! The workers read subscription rows and per-relation sync state rows, and
//! write a handful of fields back (relation state, two-phase state, skip LSN,
//! enabled flag). Sequences have sync rows of their own, which only ever
//! move from INIT to READY. Every write bumps a generation counter that workers compare
//! against to notice invalidations between transactions.

use crate::error::{ApplyError, Result};
use crate::lsn::Lsn;
use crate::types::{Oid, RelState, Subscription, SubscriptionRelState, TwoPhaseState};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Catalog operations the apply engine needs.
pub trait Catalog: Send + Sync {
    /// Every subscription, enabled or not.
    fn subscriptions(&self) -> Vec<Subscription>;

    /// One subscription row.
    fn subscription(&self, subid: Oid) -> Option<Subscription>;

    /// Sets `enabled = false`.
    fn disable_subscription(&self, subid: Oid) -> Result<()>;

    /// Clears the skip LSN if it still equals `expected`. Returns whether it
    /// was cleared.
    fn clear_skip_lsn(&self, subid: Oid, expected: Lsn) -> Result<bool>;

    /// Records a new two-phase state.
    fn set_two_phase_state(&self, subid: Oid, state: TwoPhaseState) -> Result<()>;

    /// Per-relation rows; with `not_ready_only` READY rows are skipped.
    fn relation_states(&self, subid: Oid, not_ready_only: bool) -> Vec<SubscriptionRelState>;

    /// One per-relation row.
    fn relation_state(&self, subid: Oid, relid: Oid) -> Option<SubscriptionRelState>;

    /// Inserts or updates a per-relation row. Only persistent states are
    /// accepted.
    fn set_relation_state(&self, subid: Oid, relid: Oid, state: RelState, lsn: Lsn) -> Result<()>;

    /// Per-sequence rows; with `pending_only` only INIT rows.
    fn sequence_states(&self, subid: Oid, pending_only: bool) -> Vec<SubscriptionRelState>;

    /// Inserts or updates a per-sequence row. Only INIT and READY are
    /// accepted.
    fn set_sequence_state(&self, subid: Oid, seqid: Oid, state: RelState, lsn: Lsn) -> Result<()>;

    /// Counts an apply or sync failure for monitoring.
    fn report_subscription_error(&self, subid: Oid, during_sync: bool);

    /// Local system identifier.
    fn system_identifier(&self) -> u64;

    /// Invalidation counter; changes whenever anything above changes.
    fn generation(&self) -> u64;
}

/// Error counters per subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStats {
    /// Failures while applying the stream.
    pub apply_error_count: u64,
    /// Failures during initial table sync.
    pub sync_error_count: u64,
}

/// Serializable catalog contents, used to seed [`MemoryCatalog`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    /// Local system identifier.
    #[serde(default)]
    pub system_identifier: u64,
    /// Subscription rows.
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    /// Per-relation rows keyed by subscription oid.
    #[serde(default)]
    pub relations: BTreeMap<Oid, Vec<SubscriptionRelState>>,
    /// Per-sequence rows keyed by subscription oid.
    #[serde(default)]
    pub sequences: BTreeMap<Oid, Vec<SubscriptionRelState>>,
}

#[derive(Debug, Default)]
struct CatalogData {
    subscriptions: BTreeMap<Oid, Subscription>,
    relations: BTreeMap<(Oid, Oid), SubscriptionRelState>,
    sequences: BTreeMap<(Oid, Oid), SubscriptionRelState>,
    stats: HashMap<Oid, SubscriptionStats>,
}

/// In-memory catalog.
#[derive(Debug)]
pub struct MemoryCatalog {
    data: RwLock<CatalogData>,
    system_identifier: u64,
    generation: AtomicU64,
}

impl MemoryCatalog {
    /// Empty catalog.
    pub fn new(system_identifier: u64) -> Self {
        Self {
            data: RwLock::new(CatalogData::default()),
            system_identifier,
            generation: AtomicU64::new(1),
        }
    }

    /// Catalog seeded from a snapshot.
    pub fn from_snapshot(snapshot: CatalogSnapshot) -> Self {
        let catalog = Self::new(snapshot.system_identifier);
        {
            let mut data = catalog.data.write();
            for sub in snapshot.subscriptions {
                data.subscriptions.insert(sub.oid, sub);
            }
            for (subid, rows) in snapshot.relations {
                for row in rows {
                    data.relations.insert((subid, row.relid), row);
                }
            }
            for (subid, rows) in snapshot.sequences {
                for row in rows {
                    data.sequences.insert((subid, row.relid), row);
                }
            }
        }
        catalog
    }

    /// Creates or replaces a subscription row.
    pub fn upsert_subscription(&self, sub: Subscription) {
        self.data.write().subscriptions.insert(sub.oid, sub);
        self.bump();
    }

    /// Applies `f` to a subscription row in place.
    pub fn alter_subscription(&self, subid: Oid, f: impl FnOnce(&mut Subscription)) -> Result<()> {
        {
            let mut data = self.data.write();
            let sub = data
                .subscriptions
                .get_mut(&subid)
                .ok_or_else(|| missing_subscription(subid))?;
            f(sub);
        }
        self.bump();
        Ok(())
    }

    /// Puts every sequence of `subid` back to INIT so it is synchronized
    /// again, as `REFRESH SEQUENCES` does.
    pub fn refresh_sequences(&self, subid: Oid) {
        {
            let mut data = self.data.write();
            for row in data
                .sequences
                .range_mut((subid, 0)..=(subid, Oid::MAX))
                .map(|(_, row)| row)
            {
                row.state = RelState::Init;
                row.lsn = Lsn::INVALID;
            }
        }
        self.bump();
    }

    /// Removes a subscription and its relation rows.
    pub fn drop_subscription(&self, subid: Oid) {
        {
            let mut data = self.data.write();
            data.subscriptions.remove(&subid);
            data.relations.retain(|(s, _), _| *s != subid);
            data.sequences.retain(|(s, _), _| *s != subid);
        }
        self.bump();
    }

    /// Error counters for `subid`.
    pub fn stats(&self, subid: Oid) -> SubscriptionStats {
        self.data.read().stats.get(&subid).copied().unwrap_or_default()
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

fn missing_subscription(subid: Oid) -> ApplyError {
    ApplyError::PrerequisiteNotMet {
        msg: format!("subscription {subid} does not exist"),
    }
}

impl Catalog for MemoryCatalog {
    fn subscriptions(&self) -> Vec<Subscription> {
        self.data.read().subscriptions.values().cloned().collect()
    }

    fn subscription(&self, subid: Oid) -> Option<Subscription> {
        self.data.read().subscriptions.get(&subid).cloned()
    }

    fn disable_subscription(&self, subid: Oid) -> Result<()> {
        self.alter_subscription(subid, |sub| sub.enabled = false)
    }

    fn clear_skip_lsn(&self, subid: Oid, expected: Lsn) -> Result<bool> {
        let cleared = {
            let mut data = self.data.write();
            let sub = data
                .subscriptions
                .get_mut(&subid)
                .ok_or_else(|| missing_subscription(subid))?;
            if sub.skip_lsn == expected {
                sub.skip_lsn = Lsn::INVALID;
                true
            } else {
                false
            }
        };
        if cleared {
            self.bump();
        }
        Ok(cleared)
    }

    fn set_two_phase_state(&self, subid: Oid, state: TwoPhaseState) -> Result<()> {
        self.alter_subscription(subid, |sub| sub.two_phase = state)
    }

    fn relation_states(&self, subid: Oid, not_ready_only: bool) -> Vec<SubscriptionRelState> {
        self.data
            .read()
            .relations
            .range((subid, 0)..=(subid, Oid::MAX))
            .map(|(_, row)| *row)
            .filter(|row| !not_ready_only || row.state != RelState::Ready)
            .collect()
    }

    fn relation_state(&self, subid: Oid, relid: Oid) -> Option<SubscriptionRelState> {
        self.data.read().relations.get(&(subid, relid)).copied()
    }

    fn set_relation_state(&self, subid: Oid, relid: Oid, state: RelState, lsn: Lsn) -> Result<()> {
        if !state.is_persistent() {
            return Err(ApplyError::invalid_state(format!(
                "relation state {state:?} is not stored in the catalog"
            )));
        }
        self.data
            .write()
            .relations
            .insert((subid, relid), SubscriptionRelState { relid, state, lsn });
        debug!(subid, relid, ?state, %lsn, "relation state updated");
        self.bump();
        Ok(())
    }

    fn sequence_states(&self, subid: Oid, pending_only: bool) -> Vec<SubscriptionRelState> {
        self.data
            .read()
            .sequences
            .range((subid, 0)..=(subid, Oid::MAX))
            .map(|(_, row)| *row)
            .filter(|row| !pending_only || row.state == RelState::Init)
            .collect()
    }

    fn set_sequence_state(&self, subid: Oid, seqid: Oid, state: RelState, lsn: Lsn) -> Result<()> {
        if !matches!(state, RelState::Init | RelState::Ready) {
            return Err(ApplyError::invalid_state(format!(
                "sequence state {state:?} is not valid"
            )));
        }
        self.data.write().sequences.insert(
            (subid, seqid),
            SubscriptionRelState {
                relid: seqid,
                state,
                lsn,
            },
        );
        debug!(subid, seqid, ?state, %lsn, "sequence state updated");
        self.bump();
        Ok(())
    }

    fn report_subscription_error(&self, subid: Oid, during_sync: bool) {
        let mut data = self.data.write();
        let stats = data.stats.entry(subid).or_default();
        if during_sync {
            stats.sync_error_count += 1;
        } else {
            stats.apply_error_count += 1;
        }
    }

    fn system_identifier(&self) -> u64 {
        self.system_identifier
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> MemoryCatalog {
        let cat = MemoryCatalog::new(7);
        cat.upsert_subscription(Subscription::new(1, "sub", "host=pub", vec!["p".into()]));
        cat
    }

    #[test]
    fn test_relation_states_filter_ready() {
        let cat = catalog();
        cat.set_relation_state(1, 100, RelState::Ready, Lsn(1)).unwrap();
        cat.set_relation_state(1, 101, RelState::Init, Lsn::INVALID).unwrap();
        cat.set_relation_state(2, 102, RelState::Init, Lsn::INVALID).unwrap();
        assert_eq!(cat.relation_states(1, false).len(), 2);
        let not_ready = cat.relation_states(1, true);
        assert_eq!(not_ready.len(), 1);
        assert_eq!(not_ready[0].relid, 101);
    }

    #[test]
    fn test_transient_states_rejected() {
        let cat = catalog();
        assert!(cat.set_relation_state(1, 100, RelState::SyncWait, Lsn(1)).is_err());
        assert!(cat.set_relation_state(1, 100, RelState::Catchup, Lsn(1)).is_err());
    }

    #[test]
    fn test_generation_bumps_on_write() {
        let cat = catalog();
        let before = cat.generation();
        cat.disable_subscription(1).unwrap();
        assert!(cat.generation() > before);
        assert!(!cat.subscription(1).unwrap().enabled);
    }

    #[test]
    fn test_clear_skip_lsn_only_when_matching() {
        let cat = catalog();
        cat.alter_subscription(1, |s| s.skip_lsn = Lsn(0x100)).unwrap();
        assert!(!cat.clear_skip_lsn(1, Lsn(0x200)).unwrap());
        assert!(cat.clear_skip_lsn(1, Lsn(0x100)).unwrap());
        assert_eq!(cat.subscription(1).unwrap().skip_lsn, Lsn::INVALID);
    }

    #[test]
    fn test_snapshot_json() {
        let json = r#"{
            "system_identifier": 42,
            "subscriptions": [{"oid": 5, "dbid": 1, "name": "s", "owner": 10,
                "enabled": true, "conninfo": "c", "publications": ["p"]}],
            "relations": {"5": [{"relid": 16400, "state": "Ready", "lsn": "0/A0"}]}
        }"#;
        let snapshot: CatalogSnapshot = serde_json::from_str(json).unwrap();
        let cat = MemoryCatalog::from_snapshot(snapshot);
        assert_eq!(cat.system_identifier(), 42);
        assert_eq!(cat.relation_state(5, 16400).unwrap().lsn, Lsn(0xA0));
    }

    #[test]
    fn test_sequence_rows_are_separate_from_relations() {
        let cat = catalog();
        cat.set_sequence_state(1, 200, RelState::Init, Lsn::INVALID).unwrap();
        cat.set_sequence_state(1, 201, RelState::Ready, Lsn(0x40)).unwrap();
        assert!(cat.relation_states(1, false).is_empty());
        assert_eq!(cat.sequence_states(1, false).len(), 2);
        let pending = cat.sequence_states(1, true);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].relid, 200);

        assert!(cat.set_sequence_state(1, 200, RelState::DataSync, Lsn::INVALID).is_err());

        cat.refresh_sequences(1);
        assert_eq!(cat.sequence_states(1, true).len(), 2);
        cat.drop_subscription(1);
        assert!(cat.sequence_states(1, false).is_empty());
    }

    #[test]
    fn test_error_stats() {
        let cat = catalog();
        cat.report_subscription_error(1, false);
        cat.report_subscription_error(1, true);
        assert_eq!(
            cat.stats(1),
            SubscriptionStats {
                apply_error_count: 1,
                sync_error_count: 1
            }
        );
    }
}
