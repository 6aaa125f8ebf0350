//! Skipping a remote transaction on request.
//!
//! An administrator sets the subscription's skip LSN to the finish LSN of a
//! transaction that keeps failing. When that transaction begins, the worker
//! stops applying its data changes (transaction control messages are still
//! processed), and when it finishes, the skip LSN is cleared.

use crate::catalog::Catalog;
use crate::error::Result;
use crate::lsn::Lsn;
use crate::types::Subscription;
use tracing::{info, warn};

/// Per-worker skip state.
#[derive(Debug, Default)]
pub struct SkipState {
    skipping: Option<Lsn>,
}

impl SkipState {
    /// Not skipping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts skipping if `finish_lsn` is the subscription's skip LSN.
    pub fn maybe_start_skipping(&mut self, sub: &Subscription, finish_lsn: Lsn) -> bool {
        if !sub.skip_lsn.is_valid() || sub.skip_lsn != finish_lsn {
            return false;
        }
        self.skipping = Some(finish_lsn);
        info!(
            subscription = %sub.name,
            %finish_lsn,
            "logical replication starts skipping transaction"
        );
        true
    }

    /// Whether data changes are currently ignored.
    pub fn is_skipping(&self) -> bool {
        self.skipping.is_some()
    }

    /// Stops skipping.
    pub fn stop_skipping(&mut self, sub: &Subscription) {
        if let Some(lsn) = self.skipping.take() {
            info!(
                subscription = %sub.name,
                finish_lsn = %lsn,
                "logical replication completed skipping transaction"
            );
        }
    }
}

/// Clears the skip LSN at the finish of a transaction.
///
/// The catalog value is reset only if it still equals the cached one. If
/// the cached skip LSN does not match `finish_lsn`, it is cleared anyway
/// and a warning is logged.
pub fn clear_skip_lsn(catalog: &dyn Catalog, sub: &Subscription, finish_lsn: Lsn) -> Result<bool> {
    let skip_lsn = sub.skip_lsn;
    if !skip_lsn.is_valid() {
        return Ok(false);
    }
    let cleared = catalog.clear_skip_lsn(sub.oid, skip_lsn)?;
    if skip_lsn != finish_lsn {
        warn!(
            subscription = %sub.name,
            %finish_lsn,
            %skip_lsn,
            "skip-LSN of subscription cleared: remote transaction's finish WAL location did not match skip-LSN"
        );
    }
    Ok(cleared)
}
