// src/membership/mod.rs

//! The replicated `ClusterMember` table, and its wire representation.

use crate::db::{ClusterMemberRow, Database};
use crate::engine::Role;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness as observed by whoever is asking, never persisted.
///
/// Defaults to `Unreachable`; a caller upgrades it to `Online` after a
/// successful `/internal/ready` probe (`spec.md` §4.5, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberStatus {
    Online,
    Unreachable,
}

impl Default for MemberStatus {
    fn default() -> Self {
        MemberStatus::Unreachable
    }
}

/// The wire shape of a cluster member, as returned from `/internal/cluster`
/// and accepted in the join request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub name: String,
    pub address: String,
    pub certificate: String,
    pub schema_version: u64,
    pub last_heartbeat: DateTime<Utc>,
    pub role: Role,
    #[serde(default)]
    pub status: MemberStatus,
}

impl ClusterMember {
    /// Converts a stored row to its wire shape. Status always starts
    /// `Unreachable`; the caller fills it in after probing.
    pub fn to_api(row: &ClusterMemberRow) -> Self {
        Self {
            name: row.name.clone(),
            address: row.address.clone(),
            certificate: row.certificate.clone(),
            schema_version: row.schema_version,
            last_heartbeat: row.last_heartbeat,
            role: row.role,
            status: MemberStatus::default(),
        }
    }
}

/// A thin, typed facade over the `cluster_members` table.
#[derive(Clone)]
pub struct MembershipStore {
    db: Database,
}

impl MembershipStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn list(&self) -> Result<Vec<ClusterMember>> {
        self.db
            .transaction(|tx| Ok(tx.cluster_members().map(ClusterMember::to_api).collect()))
            .await
    }

    pub async fn get(&self, address: &str) -> Result<Option<ClusterMember>> {
        let address = address.to_string();
        self.db
            .transaction(move |tx| Ok(tx.cluster_member(&address).map(ClusterMember::to_api)))
            .await
    }

    pub async fn insert(
        &self,
        name: String,
        address: String,
        certificate: String,
        schema_version: u64,
        role: Role,
    ) -> Result<()> {
        self.db
            .transaction(move |tx| {
                tx.insert_cluster_member(name, address, certificate, schema_version, role)
            })
            .await
    }

    pub async fn delete(&self, address: &str) -> Result<()> {
        let address = address.to_string();
        self.db
            .transaction(move |tx| tx.delete_cluster_member(&address))
            .await
    }

    /// Updates exactly one row's schema version, usable before the rest of
    /// the schema has loaded (`spec.md` §4.5).
    pub async fn update_schema_version(&self, address: &str, version: u64) -> Result<()> {
        let address = address.to_string();
        self.db
            .transaction(move |tx| tx.update_schema_version(&address, version))
            .await
    }

    /// Schema versions of every non-pending member, for the `SchemaGate`.
    pub async fn schema_versions(&self) -> Result<Vec<u64>> {
        self.db.transaction(|tx| Ok(tx.schema_versions())).await
    }

    pub async fn set_role(&self, address: &str, role: Role) -> Result<()> {
        let address = address.to_string();
        self.db
            .transaction(move |tx| {
                let mut row = tx
                    .cluster_member(&address)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(format!("no cluster member {address}")))?;
                row.role = role;
                tx.update_cluster_member(&address, row)
            })
            .await
    }

    pub async fn touch_heartbeat(&self, address: &str, role: Role, at: DateTime<Utc>) -> Result<()> {
        let address = address.to_string();
        self.db
            .transaction(move |tx| {
                let mut row = tx
                    .cluster_member(&address)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(format!("no cluster member {address}")))?;
                row.role = role;
                row.last_heartbeat = at;
                tx.update_cluster_member(&address, row)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MembershipStore {
        MembershipStore::new(Database::new())
    }

    #[tokio::test]
    async fn insert_then_list_round_trips() {
        let store = store();
        store
            .insert("a".into(), "10.0.0.1:7443".into(), "---cert---".into(), 1, Role::Voter)
            .await
            .unwrap();

        let members = store.list().await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].status, MemberStatus::Unreachable);
    }

    #[tokio::test]
    async fn insert_duplicate_address_conflicts() {
        let store = store();
        store
            .insert("a".into(), "10.0.0.1:7443".into(), "cert".into(), 1, Role::Voter)
            .await
            .unwrap();
        let dup = store
            .insert("b".into(), "10.0.0.1:7443".into(), "cert2".into(), 1, Role::Voter)
            .await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn schema_versions_excludes_pending() {
        let store = store();
        store
            .insert("a".into(), "10.0.0.1:7443".into(), "cert".into(), 3, Role::Voter)
            .await
            .unwrap();
        store
            .insert("b".into(), "10.0.0.2:7443".into(), "cert".into(), 3, Role::Pending)
            .await
            .unwrap();

        let versions = store.schema_versions().await.unwrap();
        assert_eq!(versions, vec![3]);
    }

    #[tokio::test]
    async fn set_role_updates_existing_row() {
        let store = store();
        store
            .insert("a".into(), "10.0.0.1:7443".into(), "cert".into(), 1, Role::Pending)
            .await
            .unwrap();
        store.set_role("10.0.0.1:7443", Role::Voter).await.unwrap();

        let member = store.get("10.0.0.1:7443").await.unwrap().unwrap();
        assert_eq!(member.role, Role::Voter);
    }
}
