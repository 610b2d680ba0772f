// src/join/mod.rs

//! The bootstrap / join-with-token state machine (`spec.md` §4.6).

use crate::db::Database;
use crate::engine::{ReplicatedEngine, Role};
use crate::error::{Error, Result};
use crate::membership::{ClusterMember, MembershipStore};
use crate::schema::SchemaGate;
use crate::token::Token;
use crate::transport::ClusterClient;
use crate::trust::{Remote, TrustStore, fingerprint_pem, validate_hostname};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

/// The lifecycle phase of the local daemon, as described in `spec.md` §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonPhase {
    /// No cluster identity yet; not listening for cluster traffic.
    PreInit,
    /// Mid-bootstrap: generating keys, opening the database.
    Bootstrapping,
    /// Mid-join: waiting on the leader's response.
    Joining,
    /// Fully admitted; serving cluster traffic.
    Active,
}

/// Tracks the daemon's phase as a single atomically-updated value, so every
/// handler can consult it without a lock (`spec.md` §9: no global mutable
/// state -- this lives on `DaemonState`, not as a module-level static).
pub struct PhaseCell(AtomicU8);

impl Default for PhaseCell {
    fn default() -> Self {
        Self(AtomicU8::new(DaemonPhase::PreInit as u8))
    }
}

impl PhaseCell {
    pub fn get(&self) -> DaemonPhase {
        match self.0.load(Ordering::SeqCst) {
            0 => DaemonPhase::PreInit,
            1 => DaemonPhase::Bootstrapping,
            2 => DaemonPhase::Joining,
            _ => DaemonPhase::Active,
        }
    }

    pub fn set(&self, phase: DaemonPhase) {
        self.0.store(phase as u8, Ordering::SeqCst);
    }
}

/// Body of `POST /public/cluster`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub name: String,
    pub address: String,
    pub certificate: String,
    pub schema_version: u64,
    pub secret: String,
}

/// Response to a successful join request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub cluster_cert: String,
    pub cluster_key: String,
    pub trusted_member: Remote,
    pub cluster_members: Vec<ClusterMember>,
}

#[derive(Clone)]
pub struct JoinCoordinator {
    db: Database,
    members: MembershipStore,
    trust: Arc<TrustStore>,
    engine: Arc<dyn ReplicatedEngine>,
    state_dir: PathBuf,
    v_local: u64,
}

impl JoinCoordinator {
    pub fn new(
        db: Database,
        members: MembershipStore,
        trust: Arc<TrustStore>,
        engine: Arc<dyn ReplicatedEngine>,
        state_dir: PathBuf,
        v_local: u64,
    ) -> Self {
        Self {
            db,
            members,
            trust,
            engine,
            state_dir,
            v_local,
        }
    }

    /// Runs the bootstrap transition: the node becomes its own cluster,
    /// with itself as the sole voter.
    pub async fn bootstrap(&self, name: &str, address: &str, certificate: &str) -> Result<()> {
        validate_hostname(name)?;

        let gate = SchemaGate::new(&self.db, &self.members, address.to_string(), self.v_local);
        gate.bootstrap().await?;

        self.members
            .insert(name.to_string(), address.to_string(), certificate.to_string(), self.v_local, Role::Voter)
            .await?;

        self.trust.add(&[Remote::new(name, address, certificate)])?;
        self.engine.join(address, Role::Voter, &[]).await?;

        info!(%name, %address, "bootstrap complete");
        Ok(())
    }

    /// The leader-side handling of a `POST /public/cluster` body, called
    /// only once the caller has confirmed this node is the current leader.
    ///
    /// Atomically consumes the token and inserts the joiner's
    /// `ClusterMember` row as `role=pending`, per `spec.md` §4.6 step 4.
    pub async fn handle_join_request(&self, request: JoinRequest, cluster_cert: &str, cluster_key: &str) -> Result<JoinResponse> {
        validate_hostname(&request.name)?;

        if self.trust.remote_by_address(&request.address).is_some() {
            return Err(Error::Conflict(format!(
                "a remote at address {} already exists",
                request.address
            )));
        }

        let fingerprint = fingerprint_pem(&request.certificate);
        let name = request.name.clone();
        let address = request.address.clone();
        let certificate = request.certificate.clone();
        let schema_version = request.schema_version;
        let presented_secret = request.secret.clone();

        self.db
            .transaction(move |tx| {
                let stored = tx
                    .secret(&fingerprint)
                    .ok_or_else(|| Error::Unauthorized("invalid token".into()))?;

                let matches: bool = stored
                    .secret
                    .as_bytes()
                    .ct_eq(presented_secret.as_bytes())
                    .into();
                if !matches {
                    return Err(Error::Unauthorized("invalid token".into()));
                }
                tx.delete_secret(&fingerprint);

                tx.insert_cluster_member(name, address, certificate, schema_version, Role::Pending)
            })
            .await?;

        let trusted_member = Remote::new(&request.name, &request.address, &request.certificate);
        self.trust.add(std::slice::from_ref(&trusted_member))?;

        let cluster_members = self.members.list().await?;

        info!(name = %request.name, address = %request.address, "accepted join request");

        Ok(JoinResponse {
            cluster_cert: cluster_cert.to_string(),
            cluster_key: cluster_key.to_string(),
            trusted_member,
            cluster_members,
        })
    }

    /// The joiner side of `join-with-token`, run on a fresh, `PreInit` node.
    ///
    /// On failure after the request has been accepted by the leader (any
    /// error from here on), the caller is responsible for issuing a
    /// compensating `DELETE /internal/cluster/{name}?force=1` against the
    /// leader, per `spec.md` §4.6 step 5; this method does not retry.
    pub async fn join_with_token(
        &self,
        encoded_token: &str,
        cert_path: &Path,
        key_path: &Path,
        name: &str,
        local_address: &str,
        local_certificate: &str,
    ) -> Result<JoinResponse> {
        validate_hostname(name)?;

        let token = Token::decode(encoded_token)?;
        let tls_config = crate::transport::tls::client_config_pinned_to(cert_path, key_path, &token.cluster_cert)?;
        let client = ClusterClient::new(tls_config, name)?;

        let request = JoinRequest {
            name: name.to_string(),
            address: local_address.to_string(),
            certificate: local_certificate.to_string(),
            schema_version: self.v_local,
            secret: token.secret.clone(),
        };

        let response: JoinResponse = client
            .request(
                Method::POST,
                &[token.join_address.clone()],
                "/public/cluster",
                Some(&request),
            )
            .await?;

        tokio::fs::write(self.state_dir.join("cluster.crt"), &response.cluster_cert)
            .await
            .map_err(|e| Error::OperationalFatal(format!("unable to write cluster.crt: {e}")))?;
        tokio::fs::write(self.state_dir.join("cluster.key"), &response.cluster_key)
            .await
            .map_err(|e| Error::OperationalFatal(format!("unable to write cluster.key: {e}")))?;

        let mut remotes: Vec<Remote> = response.cluster_members.iter().map(|m| Remote::new(&m.name, &m.address, &m.certificate)).collect();
        remotes.push(Remote::new(name, local_address, local_certificate));
        self.trust.replace(remotes)?;

        let peer_addresses: Vec<String> = response
            .cluster_members
            .iter()
            .map(|m| m.address.clone())
            .collect();
        self.engine.join(local_address, Role::Pending, &peer_addresses).await?;

        info!(%name, leader = %token.join_address, "join accepted, awaiting heartbeat promotion");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InMemoryEngine;

    fn setup() -> (JoinCoordinator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new();
        let members = MembershipStore::new(db.clone());
        let trust = TrustStore::open(dir.path().join("truststore")).unwrap();
        let engine = InMemoryEngine::new("10.0.0.1:7443") as Arc<dyn ReplicatedEngine>;
        let coordinator = JoinCoordinator::new(db, members, trust, engine, dir.path().to_path_buf(), 1);
        (coordinator, dir)
    }

    #[tokio::test]
    async fn bootstrap_registers_self_as_voter() {
        let (coordinator, _dir) = setup();
        coordinator.bootstrap("node-a", "10.0.0.1:7443", "---cert---").await.unwrap();

        let members = coordinator.members.list().await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].role, Role::Voter);
        assert!(coordinator.trust.remote_by_name("node-a").is_some());
    }

    #[tokio::test]
    async fn handle_join_request_rejects_existing_address() {
        let (coordinator, _dir) = setup();
        coordinator.bootstrap("node-a", "10.0.0.1:7443", "---cert-a---").await.unwrap();

        let request = JoinRequest {
            name: "node-b".into(),
            address: "10.0.0.1:7443".into(),
            certificate: "---cert-b---".into(),
            schema_version: 1,
            secret: "whatever".into(),
        };
        let result = coordinator.handle_join_request(request, "cc", "ck").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn handle_join_request_consumes_token_and_inserts_pending_member() {
        let (coordinator, _dir) = setup();
        coordinator.bootstrap("node-a", "10.0.0.1:7443", "---cert-a---").await.unwrap();

        coordinator
            .db
            .transaction(|tx| tx.issue_secret(&fingerprint_pem("---cert-b---"), "s3cr3t"))
            .await
            .unwrap();

        let request = JoinRequest {
            name: "node-b".into(),
            address: "10.0.0.2:7443".into(),
            certificate: "---cert-b---".into(),
            schema_version: 1,
            secret: "s3cr3t".into(),
        };
        let response = coordinator.handle_join_request(request, "cc", "ck").await.unwrap();
        assert_eq!(response.cluster_members.len(), 2);

        let member = coordinator.members.get("10.0.0.2:7443").await.unwrap().unwrap();
        assert_eq!(member.role, Role::Pending);
    }

    /// `spec.md` §8 scenario 2: a second joiner presenting the same secret
    /// under a different fingerprint is rejected, and leaves no trace.
    #[tokio::test]
    async fn handle_join_request_rejects_replayed_secret_from_different_fingerprint() {
        let (coordinator, _dir) = setup();
        coordinator.bootstrap("node-a", "10.0.0.1:7443", "---cert-a---").await.unwrap();

        coordinator
            .db
            .transaction(|tx| tx.issue_secret(&fingerprint_pem("---cert-b---"), "s3cr3t"))
            .await
            .unwrap();

        let join_b = JoinRequest {
            name: "node-b".into(),
            address: "10.0.0.2:7443".into(),
            certificate: "---cert-b---".into(),
            schema_version: 1,
            secret: "s3cr3t".into(),
        };
        coordinator.handle_join_request(join_b, "cc", "ck").await.unwrap();

        let join_c = JoinRequest {
            name: "node-c".into(),
            address: "10.0.0.3:7443".into(),
            certificate: "---cert-c---".into(),
            schema_version: 1,
            secret: "s3cr3t".into(),
        };
        let result = coordinator.handle_join_request(join_c, "cc", "ck").await;
        assert!(matches!(result, Err(Error::Unauthorized(_))));

        assert!(coordinator.members.get("10.0.0.3:7443").await.unwrap().is_none());
        let members = coordinator.members.list().await.unwrap();
        assert_eq!(members.len(), 2);
    }
}
