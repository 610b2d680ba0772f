// src/schema/mod.rs

//! The schema-upgrade barrier run at every database open.

use crate::db::Database;
use crate::error::{Error, Result};
use crate::membership::MembershipStore;
use tracing::{info, warn};

/// The outcome of a schema-gate check, never inferred from error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Every peer matches `v_local`; proceed with `ensure`.
    Apply,
    /// Some peer is behind `v_local`; this node must retry later.
    GracefulAbort,
    /// Some peer is ahead of `v_local`; this binary must be upgraded.
    FatalAbort,
}

/// Compares `v_local` against every non-pending peer's recorded schema
/// version (`spec.md` §4.4).
///
/// - If every peer matches `v_local`, the schema is in lock-step: `Apply`.
/// - If any peer is *behind* `v_local`, this node must wait: `GracefulAbort`.
/// - If any peer is *ahead* of `v_local`, this binary is stale: `FatalAbort`.
pub fn decide(v_local: u64, peers: &[u64]) -> GateDecision {
    if peers.iter().any(|&p| p > v_local) {
        return GateDecision::FatalAbort;
    }
    if peers.iter().any(|&p| p < v_local) {
        return GateDecision::GracefulAbort;
    }
    GateDecision::Apply
}

/// Runs the schema gate for a join or restart, then the caller's own
/// `ensure` transaction.
///
/// Per `spec.md` §9, this mirrors `ensure(db, gate_fn)`: the gate runs as
/// part of the same logical transaction as the caller's schema
/// application, so a `GracefulAbort` leaves nothing half-applied.
pub struct SchemaGate<'a> {
    db: &'a Database,
    members: &'a MembershipStore,
    local_address: String,
    v_local: u64,
}

impl<'a> SchemaGate<'a> {
    pub fn new(db: &'a Database, members: &'a MembershipStore, local_address: String, v_local: u64) -> Self {
        Self {
            db,
            members,
            local_address,
            v_local,
        }
    }

    /// Runs the bootstrap path: apply directly, record `v_local`.
    pub async fn bootstrap(&self) -> Result<()> {
        self.db
            .transaction(|tx| {
                tx.record_schema_version(self.v_local);
                Ok(())
            })
            .await?;
        info!(version = self.v_local, "schema applied on bootstrap");
        Ok(())
    }

    /// Runs the join/restart transactional pre-check (`spec.md` §4.4 steps
    /// 1-3) and returns the resulting decision.
    pub async fn ensure(&self) -> Result<GateDecision> {
        self.members
            .update_schema_version(&self.local_address, self.v_local)
            .await?;

        let peers = self.members.schema_versions().await?;
        let decision = decide(self.v_local, &peers);

        match decision {
            GateDecision::Apply => {
                self.db
                    .transaction(|tx| {
                        tx.record_schema_version(self.v_local);
                        Ok(())
                    })
                    .await?;
                info!(version = self.v_local, "schema gate applied");
            }
            GateDecision::GracefulAbort => {
                info!(version = self.v_local, ?peers, "schema gate waiting for peers");
            }
            GateDecision::FatalAbort => {
                warn!(version = self.v_local, ?peers, "schema gate: local binary is behind peers");
                return Err(Error::SchemaBehind(format!(
                    "local schema version {} is behind peers {peers:?}; upgrade this binary",
                    self.v_local
                )));
            }
        }

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Role;

    #[test]
    fn apply_when_all_peers_match() {
        assert_eq!(decide(2, &[2, 2, 2]), GateDecision::Apply);
    }

    #[test]
    fn graceful_abort_when_a_peer_is_behind() {
        assert_eq!(decide(2, &[2, 1]), GateDecision::GracefulAbort);
    }

    #[test]
    fn fatal_abort_when_a_peer_is_ahead() {
        assert_eq!(decide(1, &[1, 2]), GateDecision::FatalAbort);
    }

    #[test]
    fn empty_peer_set_applies() {
        assert_eq!(decide(5, &[]), GateDecision::Apply);
    }

    #[tokio::test]
    async fn ensure_applies_when_in_lock_step() {
        let db = Database::new();
        let members = MembershipStore::new(db.clone());
        members
            .insert("a".into(), "10.0.0.1:7443".into(), "cert".into(), 1, Role::Voter)
            .await
            .unwrap();

        let gate = SchemaGate::new(&db, &members, "10.0.0.1:7443".into(), 1);
        assert_eq!(gate.ensure().await.unwrap(), GateDecision::Apply);
    }

    #[tokio::test]
    async fn ensure_fatally_aborts_when_behind() {
        let db = Database::new();
        let members = MembershipStore::new(db.clone());
        members
            .insert("a".into(), "10.0.0.1:7443".into(), "cert".into(), 1, Role::Voter)
            .await
            .unwrap();
        members
            .insert("b".into(), "10.0.0.2:7443".into(), "cert".into(), 2, Role::Voter)
            .await
            .unwrap();

        let gate = SchemaGate::new(&db, &members, "10.0.0.1:7443".into(), 1);
        assert!(gate.ensure().await.is_err());
    }
}
