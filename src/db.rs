// src/db.rs

//! A minimal transactional row store standing in for the replicated SQL
//! engine's database handle.
//!
//! The real replicated-SQL engine (out of scope per `spec.md` §1) would hand
//! the clustering core a connection pool and `Transaction` primitive backed
//! by its own log. This module provides the same shape -- a single
//! `transaction` entry point guaranteeing all-or-nothing visibility across
//! the `cluster_members`, `secrets`, and `schema` tables -- without
//! depending on any particular storage engine, so the clustering logic in
//! `membership`, `token`, and `schema` can be exercised without one.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::engine::Role;

#[derive(Debug, Clone)]
pub struct ClusterMemberRow {
    pub id: u64,
    pub name: String,
    pub address: String,
    pub certificate: String,
    pub schema_version: u64,
    pub last_heartbeat: DateTime<Utc>,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct SecretRow {
    pub fingerprint: String,
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct SchemaRow {
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
pub(crate) struct Tables {
    pub cluster_members: HashMap<String, ClusterMemberRow>,
    pub secrets: HashMap<String, SecretRow>,
    pub schema: Vec<SchemaRow>,
    next_id: u64,
}

impl Tables {
    pub(crate) fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// A view onto the tables available to code running inside a [`Database::transaction`].
pub struct Tx<'a> {
    pub(crate) tables: &'a mut Tables,
}

impl Tx<'_> {
    pub fn cluster_members(&self) -> impl Iterator<Item = &ClusterMemberRow> {
        self.tables.cluster_members.values()
    }

    pub fn cluster_member(&self, address: &str) -> Option<&ClusterMemberRow> {
        self.tables.cluster_members.get(address)
    }

    pub fn insert_cluster_member(
        &mut self,
        name: String,
        address: String,
        certificate: String,
        schema_version: u64,
        role: Role,
    ) -> Result<()> {
        if self.tables.cluster_members.contains_key(&address) {
            return Err(Error::Conflict(format!(
                "cluster member with address {address} already exists"
            )));
        }

        let id = self.tables.next_id();
        self.tables.cluster_members.insert(
            address.clone(),
            ClusterMemberRow {
                id,
                name,
                address,
                certificate,
                schema_version,
                last_heartbeat: Utc::now(),
                role,
            },
        );
        Ok(())
    }

    pub fn update_cluster_member(&mut self, address: &str, row: ClusterMemberRow) -> Result<()> {
        if !self.tables.cluster_members.contains_key(address) {
            return Err(Error::NotFound(format!(
                "no cluster member with address {address}"
            )));
        }
        self.tables.cluster_members.insert(address.to_string(), row);
        Ok(())
    }

    /// Updates exactly one row's `schema_version`. Usable before the rest of
    /// the schema is loaded, since the join/restart gate runs ahead of it
    /// (see `spec.md` §4.5).
    pub fn update_schema_version(&mut self, address: &str, version: u64) -> Result<()> {
        let row = self
            .tables
            .cluster_members
            .get_mut(address)
            .ok_or_else(|| Error::NotFound(format!("no cluster member with address {address}")))?;
        row.schema_version = version;
        Ok(())
    }

    /// Lists schema versions of every non-pending member, including self.
    pub fn schema_versions(&self) -> Vec<u64> {
        self.tables
            .cluster_members
            .values()
            .filter(|m| !m.role.is_pending())
            .map(|m| m.schema_version)
            .collect()
    }

    pub fn delete_cluster_member(&mut self, address: &str) -> Result<()> {
        self.tables
            .cluster_members
            .remove(address)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("no cluster member with address {address}")))
    }

    pub fn issue_secret(&mut self, fingerprint: &str, secret: &str) -> Result<()> {
        if self.tables.secrets.contains_key(fingerprint) {
            return Err(Error::Conflict(format!(
                "a token already exists for fingerprint {fingerprint}"
            )));
        }
        self.tables.secrets.insert(
            fingerprint.to_string(),
            SecretRow {
                fingerprint: fingerprint.to_string(),
                secret: secret.to_string(),
            },
        );
        Ok(())
    }

    pub fn secret(&self, fingerprint: &str) -> Option<&SecretRow> {
        self.tables.secrets.get(fingerprint)
    }

    pub fn secrets(&self) -> impl Iterator<Item = &SecretRow> {
        self.tables.secrets.values()
    }

    pub fn delete_secret(&mut self, fingerprint: &str) -> Option<SecretRow> {
        self.tables.secrets.remove(fingerprint)
    }

    pub fn record_schema_version(&mut self, version: u64) {
        self.tables.schema.push(SchemaRow {
            version,
            updated_at: Utc::now(),
        });
    }

    pub fn current_schema(&self) -> Option<&SchemaRow> {
        self.tables.schema.last()
    }
}

/// A handle to the replicated database. Cloning shares the same underlying
/// table set (it is a thin `Arc` wrapper), matching how a real connection
/// pool handle would be passed around.
#[derive(Clone)]
pub struct Database {
    tables: Arc<Mutex<Tables>>,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
        }
    }

    /// Runs `f` with exclusive access to every table, all-or-nothing.
    ///
    /// This is the primitive every multi-table invariant in this crate
    /// (atomic token consumption, schema-gate pre-check) is built on.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Tx) -> Result<T>,
    {
        let mut tables = self.tables.lock().await;
        let mut tx = Tx {
            tables: &mut tables,
        };
        f(&mut tx)
    }
}
