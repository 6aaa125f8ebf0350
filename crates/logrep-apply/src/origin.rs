//! Replication origins.
//!
//! An origin records how far a subscription (or one tablesync worker) has
//! applied the remote stream: the remote end LSN of the last applied
//! transaction and the local commit LSN it became. At most one worker owns an
//! origin's session at a time; parallel appliers share their leader's origin
//! by naming the leader as the acquiring worker.

use crate::error::{ApplyError, Result};
use crate::lsn::Lsn;
use crate::types::ProcId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// Origin identifier. Zero means "no origin" (locally originated).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct OriginId(pub u16);

impl OriginId {
    /// Local changes.
    pub const INVALID: OriginId = OriginId(0);

    /// True unless [`OriginId::INVALID`].
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// Progress of one origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OriginProgress {
    /// End LSN of the last applied remote transaction.
    pub remote_lsn: Lsn,
    /// Local commit LSN of that transaction.
    pub local_lsn: Lsn,
}

#[derive(Debug)]
struct OriginState {
    id: OriginId,
    progress: OriginProgress,
    owner: Option<ProcId>,
    sharers: Vec<ProcId>,
}

#[derive(Debug, Default)]
struct Origins {
    by_name: HashMap<String, OriginState>,
    next_id: u16,
}

impl Origins {
    fn find_by_id(&mut self, id: OriginId) -> Option<(&String, &mut OriginState)> {
        self.by_name.iter_mut().find(|(_, s)| s.id == id)
    }
}

/// Registry of all replication origins.
#[derive(Debug, Default)]
pub struct OriginRegistry {
    inner: RwLock<Origins>,
}

impl OriginRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `name`, or returns the existing id.
    pub fn create(&self, name: &str) -> Result<OriginId> {
        let mut inner = self.inner.write();
        if let Some(state) = inner.by_name.get(name) {
            return Ok(state.id);
        }
        if inner.next_id == u16::MAX {
            return Err(ApplyError::storage("could not find free replication origin ID"));
        }
        inner.next_id += 1;
        let id = OriginId(inner.next_id);
        inner.by_name.insert(
            name.to_string(),
            OriginState {
                id,
                progress: OriginProgress::default(),
                owner: None,
                sharers: Vec::new(),
            },
        );
        info!(origin = name, id = id.0, "created replication origin");
        Ok(id)
    }

    /// Looks an origin up by name.
    pub fn lookup(&self, name: &str) -> Option<OriginId> {
        self.inner.read().by_name.get(name).map(|s| s.id)
    }

    /// Drops `name`. Returns false if it did not exist. Fails if a worker still
    /// has a session on it.
    pub fn drop_origin(&self, name: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        match inner.by_name.get(name) {
            None => Ok(false),
            Some(state) if state.owner.is_some() => Err(ApplyError::invalid_state(format!(
                "could not drop replication origin \"{name}\", in use by {}",
                state.owner.map(|p| p.to_string()).unwrap_or_default()
            ))),
            Some(_) => {
                inner.by_name.remove(name);
                info!(origin = name, "dropped replication origin");
                Ok(true)
            }
        }
    }

    /// Moves the origin to `(remote_lsn, local_lsn)`.
    ///
    /// Unless `go_backward` is set, an older remote LSN is ignored.
    pub fn advance(
        &self,
        id: OriginId,
        remote_lsn: Lsn,
        local_lsn: Lsn,
        go_backward: bool,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let (name, state) = inner
            .find_by_id(id)
            .ok_or_else(|| ApplyError::invalid_state(format!("replication origin {} does not exist", id.0)))?;
        if go_backward || remote_lsn > state.progress.remote_lsn {
            state.progress.remote_lsn = remote_lsn;
        }
        if local_lsn > state.progress.local_lsn {
            state.progress.local_lsn = local_lsn;
        }
        debug!(origin = %name, remote = %remote_lsn, local = %local_lsn, "advanced origin");
        Ok(())
    }

    /// Current progress.
    pub fn progress(&self, id: OriginId) -> Option<OriginProgress> {
        self.inner
            .read()
            .by_name
            .values()
            .find(|s| s.id == id)
            .map(|s| s.progress)
    }

    /// Starts a session on `id` for `proc`.
    ///
    /// `acquired_by` names the worker that already owns the origin when a
    /// parallel applier joins its leader's session.
    pub fn session_setup(
        &self,
        id: OriginId,
        proc: ProcId,
        acquired_by: Option<ProcId>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let (name, state) = inner
            .find_by_id(id)
            .ok_or_else(|| ApplyError::invalid_state(format!("replication origin {} does not exist", id.0)))?;
        match (state.owner, acquired_by) {
            (None, None) => state.owner = Some(proc),
            (Some(owner), Some(expected)) if owner == expected => state.sharers.push(proc),
            (Some(owner), _) if owner == proc => {}
            (Some(owner), _) => {
                return Err(ApplyError::invalid_state(format!(
                    "replication origin \"{name}\" is already active for {owner}"
                )))
            }
            (None, Some(expected)) => {
                return Err(ApplyError::invalid_state(format!(
                    "replication origin \"{name}\" is not active for {expected}"
                )))
            }
        }
        debug!(origin = %name, %proc, "origin session set up");
        Ok(())
    }

    /// Ends `proc`'s session on `id`. A no-op if it had none.
    pub fn session_reset(&self, id: OriginId, proc: ProcId) {
        let mut inner = self.inner.write();
        if let Some((_, state)) = inner.find_by_id(id) {
            if state.owner == Some(proc) {
                state.owner = None;
            }
            state.sharers.retain(|p| *p != proc);
        }
    }

    /// Ends every session `proc` has.
    pub fn release_all(&self, proc: ProcId) {
        let mut inner = self.inner.write();
        for state in inner.by_name.values_mut() {
            if state.owner == Some(proc) {
                state.owner = None;
            }
            state.sharers.retain(|p| *p != proc);
        }
    }

    /// The worker owning the session on `id`.
    pub fn owner(&self, id: OriginId) -> Option<ProcId> {
        self.inner
            .read()
            .by_name
            .values()
            .find(|s| s.id == id)
            .and_then(|s| s.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_is_idempotent() {
        let reg = OriginRegistry::new();
        let a = reg.create("pg_16394").unwrap();
        assert_eq!(reg.create("pg_16394").unwrap(), a);
        assert_eq!(reg.lookup("pg_16394"), Some(a));
        assert!(a.is_valid());
    }

    #[test]
    fn test_advance_does_not_go_backward() {
        let reg = OriginRegistry::new();
        let id = reg.create("pg_1").unwrap();
        reg.advance(id, Lsn(0x200), Lsn(0x10), false).unwrap();
        reg.advance(id, Lsn(0x100), Lsn(0x20), false).unwrap();
        assert_eq!(reg.progress(id).unwrap().remote_lsn, Lsn(0x200));
        reg.advance(id, Lsn(0x100), Lsn(0x20), true).unwrap();
        assert_eq!(reg.progress(id).unwrap().remote_lsn, Lsn(0x100));
    }

    #[test]
    fn test_exclusive_session_and_sharing() {
        let reg = OriginRegistry::new();
        let id = reg.create("pg_1").unwrap();
        let leader = ProcId(1);
        let applier = ProcId(2);

        reg.session_setup(id, leader, None).unwrap();
        assert!(reg.session_setup(id, ProcId(3), None).is_err());
        reg.session_setup(id, applier, Some(leader)).unwrap();
        assert_eq!(reg.owner(id), Some(leader));

        assert!(reg.drop_origin("pg_1").is_err());
        reg.release_all(leader);
        reg.session_reset(id, applier);
        assert_eq!(reg.owner(id), None);
        assert!(reg.drop_origin("pg_1").unwrap());
        assert!(!reg.drop_origin("pg_1").unwrap());
    }
}
