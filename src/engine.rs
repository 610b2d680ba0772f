// src/engine.rs

//! The boundary to the replicated-SQL engine this library clusters.
//!
//! The engine's own consensus algorithm is out of scope for this crate (see
//! `spec.md` §1); what *is* in scope is the trait the clustering core talks
//! to, and a reference in-memory implementation used by tests and by
//! single-node operation. A production embedder supplies their own
//! [`ReplicatedEngine`] backed by their actual replicated database.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// The role the replicated engine has assigned to a member.
///
/// `Pending` is not an engine-assigned role; it is the absence of one,
/// modeled explicitly so the heartbeat engine can distinguish "not yet
/// admitted" from "admitted as a non-voting member".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Pending,
    Voter,
    Standby,
    Spare,
}

impl Role {
    pub fn is_pending(&self) -> bool {
        matches!(self, Role::Pending)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Pending => "pending",
            Role::Voter => "voter",
            Role::Standby => "standby",
            Role::Spare => "spare",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Role::Pending),
            "voter" => Ok(Role::Voter),
            "standby" => Ok(Role::Standby),
            "spare" => Ok(Role::Spare),
            other => Err(Error::Validation(format!("unknown role {other:?}"))),
        }
    }
}

/// One entry in the engine's own view of cluster membership, independent of
/// the replicated `ClusterMember` SQL table (see §3 and §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineMember {
    pub address: String,
    pub role: Role,
}

/// Information about who the engine currently considers the leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderInfo {
    pub address: String,
}

/// The trait boundary to the replicated-SQL engine.
///
/// Mirrors the external operations named in `spec.md` §1:
/// `Open/Transaction/Leader/Cluster/Assign/Transfer/Remove`.
#[async_trait]
pub trait ReplicatedEngine: Send + Sync {
    /// Returns the address the engine currently considers leader, if any.
    async fn leader(&self) -> Result<Option<LeaderInfo>>;

    /// Returns true if `address` is the engine's current leader.
    async fn is_leader(&self, address: &str) -> Result<bool> {
        Ok(self.leader().await?.is_some_and(|l| l.address == address))
    }

    /// Returns the engine's current membership list.
    async fn cluster(&self) -> Result<Vec<EngineMember>>;

    /// Admits `address` into the engine's replication set with the given role.
    async fn join(&self, address: &str, role: Role, peers: &[String]) -> Result<()>;

    /// Reassigns `address` to a new role (e.g. promoting the last survivor
    /// to `voter` ahead of a two-member removal, per §4.8 step 1).
    async fn assign(&self, address: &str, role: Role) -> Result<()>;

    /// Transfers leadership to `address`.
    async fn transfer(&self, address: &str) -> Result<()>;

    /// Removes `address` from the engine's membership set.
    async fn remove(&self, address: &str) -> Result<()>;
}

/// A single-process, in-memory stand-in for a real replicated-SQL engine.
///
/// Used for unit/integration tests and for single-node operation where no
/// real clustering engine is configured. Leadership is whichever member
/// joined first unless transferred explicitly; there is no real consensus,
/// which is fine since this implementation never runs across processes.
pub struct InMemoryEngine {
    inner: Mutex<InMemoryEngineState>,
}

struct InMemoryEngineState {
    members: HashMap<String, Role>,
    leader: Option<String>,
}

impl InMemoryEngine {
    pub fn new(self_address: &str) -> Arc<Self> {
        let mut members = HashMap::new();
        members.insert(self_address.to_string(), Role::Voter);

        Arc::new(Self {
            inner: Mutex::new(InMemoryEngineState {
                members,
                leader: Some(self_address.to_string()),
            }),
        })
    }
}

#[async_trait]
impl ReplicatedEngine for InMemoryEngine {
    async fn leader(&self) -> Result<Option<LeaderInfo>> {
        let state = self.inner.lock().await;
        Ok(state.leader.clone().map(|address| LeaderInfo { address }))
    }

    async fn cluster(&self) -> Result<Vec<EngineMember>> {
        let state = self.inner.lock().await;
        Ok(state
            .members
            .iter()
            .map(|(address, role)| EngineMember {
                address: address.clone(),
                role: *role,
            })
            .collect())
    }

    async fn join(&self, address: &str, role: Role, _peers: &[String]) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.members.insert(address.to_string(), role);
        if state.leader.is_none() {
            state.leader = Some(address.to_string());
        }
        Ok(())
    }

    async fn assign(&self, address: &str, role: Role) -> Result<()> {
        let mut state = self.inner.lock().await;
        let entry = state
            .members
            .get_mut(address)
            .ok_or_else(|| Error::NotFound(format!("no engine member {address}")))?;
        *entry = role;
        Ok(())
    }

    async fn transfer(&self, address: &str) -> Result<()> {
        let mut state = self.inner.lock().await;
        if !state.members.contains_key(address) {
            return Err(Error::NotFound(format!("no engine member {address}")));
        }
        state.leader = Some(address.to_string());
        Ok(())
    }

    async fn remove(&self, address: &str) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.members.remove(address);
        if state.leader.as_deref() == Some(address) {
            state.leader = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_member_is_its_own_leader() {
        let engine = InMemoryEngine::new("a:1");
        assert!(engine.is_leader("a:1").await.unwrap());
    }

    #[tokio::test]
    async fn transfer_moves_leadership() {
        let engine = InMemoryEngine::new("a:1");
        engine.join("b:1", Role::Voter, &[]).await.unwrap();
        engine.transfer("b:1").await.unwrap();
        assert!(engine.is_leader("b:1").await.unwrap());
        assert!(!engine.is_leader("a:1").await.unwrap());
    }

    #[tokio::test]
    async fn remove_clears_leader_if_removed() {
        let engine = InMemoryEngine::new("a:1");
        engine.remove("a:1").await.unwrap();
        assert_eq!(engine.leader().await.unwrap(), None);
    }
}
