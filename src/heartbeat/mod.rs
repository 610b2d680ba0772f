// src/heartbeat/mod.rs

//! The leader-driven heartbeat round (`spec.md` §4.7).

use crate::db::Database;
use crate::engine::{ReplicatedEngine, Role};
use crate::error::Result;
use crate::hooks::HookDispatcher;
use crate::membership::{ClusterMember, MembershipStore};
use crate::transport::ClusterClient;
use crate::trust::{Remote, TrustStore};
use chrono::Utc;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// The wire payload of a heartbeat round (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatInfo {
    pub begin_round: bool,
    pub leader_address: String,
    pub dqlite_roles: HashMap<String, Role>,
    pub cluster_members: HashMap<String, ClusterMember>,
    pub max_schema_version: u64,
}

/// Runs only where the replicated engine reports this node as leader.
pub struct HeartbeatEngine {
    db: Database,
    members: MembershipStore,
    trust: Arc<TrustStore>,
    engine: Arc<dyn ReplicatedEngine>,
    client: Arc<ClusterClient>,
    hooks: Arc<HookDispatcher>,
    local_address: String,
    period: Duration,
    /// Guards `clusterMap` during fan-out, per `spec.md` §5: "only the round
    /// owner reads/writes it". A single leader only ever runs one round at
    /// a time (the `last_heartbeat < period` drop rule), so this is never
    /// contended in practice; it exists to make that invariant structural.
    round_guard: Mutex<()>,
}

impl HeartbeatEngine {
    pub fn new(
        db: Database,
        members: MembershipStore,
        trust: Arc<TrustStore>,
        engine: Arc<dyn ReplicatedEngine>,
        client: Arc<ClusterClient>,
        hooks: Arc<HookDispatcher>,
        local_address: String,
        period: Duration,
    ) -> Self {
        Self {
            db,
            members,
            trust,
            engine,
            client,
            hooks,
            local_address,
            period,
            round_guard: Mutex::new(()),
        }
    }

    /// Runs a single leader round, per `spec.md` §4.7 steps 1-8. Returns
    /// early if this node is no longer leader, or if the last round is
    /// still within `period` (duplicate-round guard).
    pub async fn run_round(&self) -> Result<()> {
        if !self.engine.is_leader(&self.local_address).await? {
            debug!("heartbeat round skipped: not leader");
            return Ok(());
        }

        let _guard = self.round_guard.lock().await;

        let rows = self.members.list().await?;
        let engine_members = self.engine.cluster().await?;
        let engine_roles: HashMap<String, Role> = engine_members
            .into_iter()
            .map(|m| (m.address, m.role))
            .collect();

        let leader_row = rows.iter().find(|m| m.address == self.local_address);
        if let Some(leader_row) = leader_row
            && Utc::now().signed_duration_since(leader_row.last_heartbeat) < chrono::Duration::from_std(self.period).unwrap()
        {
            debug!("heartbeat round dropped: previous round still within period");
            return Ok(());
        }

        let mut cluster_map: HashMap<String, ClusterMember> = HashMap::new();
        for mut row in rows {
            match engine_roles.get(&row.address) {
                Some(role) => row.role = *role,
                None if row.role == Role::Pending => continue,
                None => {}
            }
            cluster_map.insert(row.address.clone(), row);
        }

        let remotes: Vec<Remote> = cluster_map
            .values()
            .map(|m| Remote::new(&m.name, &m.address, &m.certificate))
            .collect();
        self.trust.replace(remotes)?;

        let now = Utc::now();
        self.members
            .touch_heartbeat(&self.local_address, Role::Voter, now)
            .await?;

        let max_schema_version = cluster_map.values().map(|m| m.schema_version).max().unwrap_or(0);

        let dqlite_roles: HashMap<String, Role> = cluster_map.iter().map(|(a, m)| (a.clone(), m.role)).collect();

        let calls = cluster_map.values().filter_map(|member| {
            if member.address == self.local_address {
                return None;
            }
            if Utc::now().signed_duration_since(member.last_heartbeat) < chrono::Duration::from_std(self.period).unwrap() {
                debug!(address = %member.address, "skipping member heartbeated recently by another round");
                return None;
            }

            let payload = HeartbeatInfo {
                begin_round: false,
                leader_address: self.local_address.clone(),
                dqlite_roles: dqlite_roles.clone(),
                cluster_members: cluster_map.clone(),
                max_schema_version,
            };
            let member = member.clone();
            Some(async move {
                let result: Result<serde_json::Value> = self
                    .client
                    .request(Method::POST, &[member.address.clone()], "/internal/heartbeat", Some(&payload))
                    .await;
                (member, result)
            })
        });

        let mut reached = Vec::new();
        for (member, result) in futures::future::join_all(calls).await {
            match result {
                Ok(_) => reached.push(member),
                Err(e) => warn!(address = %member.address, error = %e, "heartbeat fan-out failed"),
            }
        }

        for member in &reached {
            let role = cluster_map
                .get(&member.address)
                .map(|m| m.role)
                .unwrap_or(Role::Pending);
            self.members.touch_heartbeat(&member.address, role, now).await?;
        }

        info!(reached = reached.len(), total = cluster_map.len(), "heartbeat round complete");

        let mut snapshot: Vec<ClusterMember> = cluster_map.into_values().collect();
        snapshot.sort_by(|a, b| a.address.cmp(&b.address));
        self.hooks.on_heartbeat(&snapshot).await;

        Ok(())
    }

    /// Receiver-side handling of an incoming `/internal/heartbeat` call:
    /// overwrite the trust store, and flag an upgrade if we're behind.
    pub async fn receive(&self, info: HeartbeatInfo) -> Result<()> {
        let remotes: Vec<Remote> = info
            .cluster_members
            .values()
            .map(|m| Remote::new(&m.name, &m.address, &m.certificate))
            .collect();
        self.trust.replace(remotes)?;

        if let Some(local) = info.cluster_members.get(&self.local_address) {
            self.members
                .touch_heartbeat(&self.local_address, local.role, Utc::now())
                .await?;
        }

        if info.max_schema_version > self.current_schema_version().await? {
            info!(
                max_schema_version = info.max_schema_version,
                "heartbeat indicates an upgrade is needed at next database open"
            );
        }

        Ok(())
    }

    async fn current_schema_version(&self) -> Result<u64> {
        self.db
            .transaction(|tx| Ok(tx.current_schema().map(|s| s.version).unwrap_or(0)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InMemoryEngine;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

    #[derive(Debug)]
    struct AcceptAllVerifier;

    impl ServerCertVerifier for AcceptAllVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    fn dummy_client() -> Arc<ClusterClient> {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAllVerifier))
            .with_no_client_auth();
        Arc::new(ClusterClient::new(Arc::new(config), "node-a").unwrap())
    }

    fn setup(self_address: &str) -> (HeartbeatEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new();
        let members = MembershipStore::new(db.clone());
        let trust = TrustStore::open(dir.path().join("truststore")).unwrap();
        let engine = InMemoryEngine::new(self_address) as Arc<dyn ReplicatedEngine>;
        let hooks = Arc::new(HookDispatcher::default());

        let heartbeat = HeartbeatEngine::new(
            db,
            members,
            trust,
            engine,
            dummy_client(),
            hooks,
            self_address.to_string(),
            Duration::from_secs(10),
        );
        (heartbeat, dir)
    }

    #[tokio::test]
    async fn run_round_skips_when_not_leader() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new();
        let members = MembershipStore::new(db.clone());
        let trust = TrustStore::open(dir.path().join("truststore")).unwrap();
        // The engine considers "10.0.0.9:7443" leader, not us.
        let engine = InMemoryEngine::new("10.0.0.9:7443") as Arc<dyn ReplicatedEngine>;
        let hooks = Arc::new(HookDispatcher::default());

        let heartbeat = HeartbeatEngine::new(
            db,
            members,
            trust,
            engine,
            dummy_client(),
            hooks,
            "10.0.0.1:7443".to_string(),
            Duration::from_secs(10),
        );

        heartbeat.run_round().await.unwrap();
        assert!(heartbeat.members.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn solo_leader_round_completes_without_dialing_anyone() {
        let (heartbeat, _dir) = setup("10.0.0.1:7443");
        heartbeat
            .members
            .insert("node-a".into(), "10.0.0.1:7443".into(), "---cert---".into(), 1, Role::Voter)
            .await
            .unwrap();

        heartbeat.run_round().await.unwrap();

        let member = heartbeat.members.get("10.0.0.1:7443").await.unwrap().unwrap();
        assert_eq!(member.role, Role::Voter);
    }

    #[tokio::test]
    async fn receive_overwrites_trust_store_from_snapshot() {
        let (heartbeat, _dir) = setup("10.0.0.2:7443");
        let mut cluster_members = HashMap::new();
        cluster_members.insert(
            "10.0.0.1:7443".to_string(),
            ClusterMember {
                name: "node-a".into(),
                address: "10.0.0.1:7443".into(),
                certificate: "---cert-a---".into(),
                schema_version: 1,
                last_heartbeat: Utc::now(),
                role: Role::Voter,
                status: Default::default(),
            },
        );

        let info = HeartbeatInfo {
            begin_round: false,
            leader_address: "10.0.0.1:7443".into(),
            dqlite_roles: HashMap::new(),
            cluster_members,
            max_schema_version: 1,
        };

        heartbeat.receive(info).await.unwrap();
        assert!(heartbeat.trust.remote_by_name("node-a").is_some());
    }

    /// `spec.md` §8 scenario 5: a round still completes when one follower
    /// can't be dialed, and that follower's `last_heartbeat` is left alone
    /// rather than bumped as if the call had succeeded.
    #[tokio::test]
    async fn run_round_completes_when_a_follower_is_unreachable() {
        let (heartbeat, _dir) = setup("10.0.0.1:7443");
        heartbeat
            .members
            .insert("node-a".into(), "10.0.0.1:7443".into(), "---cert-a---".into(), 1, Role::Voter)
            .await
            .unwrap();
        heartbeat
            .members
            .insert("node-f".into(), "10.0.0.9:7443".into(), "---cert-f---".into(), 1, Role::Voter)
            .await
            .unwrap();

        // Both rows were just inserted with a fresh `last_heartbeat`, which
        // would otherwise trip the "previous round still within period" and
        // "heartbeated recently by another round" guards before the dial to
        // node-f is even attempted.
        let stale = Utc::now() - chrono::Duration::seconds(30);
        heartbeat.members.touch_heartbeat("10.0.0.1:7443", Role::Voter, stale).await.unwrap();
        heartbeat.members.touch_heartbeat("10.0.0.9:7443", Role::Voter, stale).await.unwrap();

        heartbeat.run_round().await.unwrap();

        let after = heartbeat.members.get("10.0.0.9:7443").await.unwrap().unwrap();
        assert_eq!(after.last_heartbeat, stale);
    }
}
