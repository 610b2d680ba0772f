// src/removal/mod.rs

//! Leader-side eviction, leadership transfer, and self-removal
//! (`spec.md` §4.8).

use crate::engine::{EngineMember, ReplicatedEngine, Role};
use crate::error::{Error, Result};
use crate::hooks::{HookDispatcher, HookRemovalRequest};
use crate::membership::MembershipStore;
use crate::transport::ClusterClient;
use crate::trust::TrustStore;
use async_trait::async_trait;
use reqwest::Method;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// What `handle_removal` actually did, so the HTTP handler can decide how
/// to reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum RemovalAction {
    /// This node was the leader and evicted the target directly.
    Evicted,
    /// This node forwarded the request on to the leader.
    Forwarded,
    /// This node was asked to remove itself and has begun the
    /// transfer-then-forward sequence.
    SelfRemovalForwarded,
}

/// Stops local resources ahead of a self-reset. Implemented by the daemon
/// lifecycle, which is the only thing that knows about the running
/// database handle and listener set.
#[async_trait]
pub trait Teardown: Send + Sync {
    async fn stop_database(&self) -> Result<()>;
    async fn stop_listeners(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct RemovalCoordinator {
    members: MembershipStore,
    trust: Arc<TrustStore>,
    engine: Arc<dyn ReplicatedEngine>,
    client: Arc<ClusterClient>,
    hooks: Arc<HookDispatcher>,
    teardown: Arc<dyn Teardown>,
    local_name: String,
    local_address: String,
    state_dir: PathBuf,
    /// Prevents the leader from instructing us to re-exec before we've
    /// finished flushing our own response (`spec.md` §4.8 step 2, §9).
    cluster_disable: Arc<Mutex<()>>,
}

impl RemovalCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        members: MembershipStore,
        trust: Arc<TrustStore>,
        engine: Arc<dyn ReplicatedEngine>,
        client: Arc<ClusterClient>,
        hooks: Arc<HookDispatcher>,
        teardown: Arc<dyn Teardown>,
        local_name: String,
        local_address: String,
        state_dir: PathBuf,
        cluster_disable: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            members,
            trust,
            engine,
            client,
            hooks,
            teardown,
            local_name,
            local_address,
            state_dir,
            cluster_disable,
        }
    }

    async fn leader_address(&self) -> Result<String> {
        self.engine
            .leader()
            .await?
            .map(|l| l.address)
            .ok_or_else(|| Error::Transient("no leader currently known".into()))
    }

    /// Entry point for `DELETE /internal/cluster/{name}?force=`. Classifies
    /// the request per `spec.md` §4.8 steps 1-4 and either evicts directly,
    /// forwards to the leader, or kicks off self-removal.
    pub async fn handle_removal(&self, target_name: &str, force: bool) -> Result<RemovalAction> {
        let is_leader = self.engine.is_leader(&self.local_address).await?;
        let is_self = target_name == self.local_name;

        if !is_leader {
            if is_self {
                let _guard = self.cluster_disable.lock().await;
                let leader = self.leader_address().await?;
                self.forward_delete(&leader, target_name, force).await?;
                return Ok(RemovalAction::SelfRemovalForwarded);
            }
            let leader = self.leader_address().await?;
            self.forward_delete(&leader, target_name, force).await?;
            return Ok(RemovalAction::Forwarded);
        }

        if is_self {
            self.transfer_and_forward(force).await?;
            return Ok(RemovalAction::SelfRemovalForwarded);
        }

        self.evict(target_name, force).await?;
        Ok(RemovalAction::Evicted)
    }

    async fn forward_delete(&self, leader_address: &str, target_name: &str, force: bool) -> Result<()> {
        let path = format!("/internal/cluster/{target_name}?force={}", force as u8);
        self.client
            .request::<(), serde_json::Value>(Method::DELETE, &[leader_address.to_string()], &path, None)
            .await?;
        Ok(())
    }

    /// Leader self-removal: find another voter, transfer leadership to it,
    /// then forward the original delete so the new leader performs the
    /// actual eviction (`spec.md` §4.8 step 4).
    async fn transfer_and_forward(&self, force: bool) -> Result<()> {
        let engine_members = self.engine.cluster().await?;
        let successor = engine_members
            .iter()
            .find(|m: &&EngineMember| m.address != self.local_address && m.role == Role::Voter)
            .ok_or_else(|| Error::OperationalFatal("no other voter available to take over leadership".into()))?
            .address
            .clone();

        self.engine.transfer(&successor).await?;
        info!(successor = %successor, "transferred leadership ahead of self-removal");

        self.forward_delete(&successor, &self.local_name, force).await
    }

    /// Leader-side eviction of `target_name != self` (`spec.md` §4.8
    /// "Eviction").
    async fn evict(&self, target_name: &str, force: bool) -> Result<()> {
        let target = self
            .trust
            .remote_by_name(target_name)
            .ok_or_else(|| Error::NotFound(format!("no such cluster member {target_name}")))?;

        let members = self.members.list().await?;
        let remaining_non_pending = members
            .iter()
            .filter(|m| m.name != target_name && m.role != Role::Pending)
            .count();
        if remaining_non_pending == 0 {
            return Err(Error::Validation("cannot remove the last cluster member".into()));
        }

        let engine_members = self.engine.cluster().await?;
        if engine_members.len() < 2 {
            return Err(Error::Validation("engine reports fewer than two members".into()));
        }
        if engine_members.len() == 2 {
            let is_leader_target = self.engine.is_leader(&target.primary_address().unwrap_or_default()).await?;
            if is_leader_target
                && let Some(survivor) = engine_members.iter().find(|m| m.address != target.primary_address().unwrap_or_default())
            {
                self.engine.assign(&survivor.address, Role::Voter).await?;
            }
        }

        let member = members
            .into_iter()
            .find(|m| m.name == target_name)
            .ok_or_else(|| Error::NotFound(format!("no ClusterMember row for {target_name}")))?;

        // PreRemove runs on the target, before it's reset, not on the
        // leader that's driving the eviction (`spec.md` §4.9).
        match target.primary_address() {
            Some(address) => {
                let request = HookRemovalRequest { member: member.clone(), force };
                let pre_remove_result: Result<serde_json::Value> = self
                    .client
                    .request(Method::POST, &[address.to_string()], "/internal/hooks/PreRemove", Some(&request))
                    .await;
                if let Err(e) = pre_remove_result {
                    if force {
                        warn!(error = %e, member = %target_name, "PreRemove hook RPC failed, continuing (force)");
                    } else {
                        return Err(Error::OperationalFatal(format!("PreRemove hook failed for {target_name}: {e}")));
                    }
                }
            }
            None if !force => {
                return Err(Error::OperationalFatal(format!(
                    "no address on file for {target_name}, cannot run PreRemove hook"
                )));
            }
            None => {}
        }

        self.members.delete(&member.address).await?;

        if engine_members.iter().any(|m| m.address == member.address) {
            self.engine.remove(&member.address).await?;
        }

        self.trust.remove(target_name)?;

        if let Some(address) = target.primary_address() {
            let path = format!("/internal/cluster/{target_name}?force={}", force as u8);
            let reset_result = self
                .client
                .request::<(), serde_json::Value>(Method::PUT, &[address.to_string()], &path, None)
                .await;
            if let Err(e) = reset_result {
                if force {
                    warn!(error = %e, member = %target_name, "failed to instruct target to reset, continuing (force)");
                } else {
                    return Err(Error::OperationalFatal(format!(
                        "failed to instruct {target_name} to reset: {e}"
                    )));
                }
            }
        }

        self.hooks.post_remove(&member, force).await;

        let post_remove_request = HookRemovalRequest { member: member.clone(), force };
        let survivors = self.members.list().await?;
        for survivor in &survivors {
            let path = "/internal/hooks/PostRemove";
            let _ = self
                .client
                .request::<_, serde_json::Value>(Method::POST, &[survivor.address.clone()], path, Some(&post_remove_request))
                .await;
        }

        info!(member = %target_name, %force, "evicted cluster member");
        Ok(())
    }

    /// Runs on the node being removed: stops the database and listeners,
    /// recursively deletes the state directory, then (after the caller has
    /// observed our HTTP response) re-execs a fresh copy of this process
    /// (`spec.md` §4.8 "ResetClusterMember").
    pub async fn reset_cluster_member(&self) -> Result<()> {
        self.teardown.stop_database().await?;
        self.teardown.stop_listeners().await?;

        if self.state_dir.exists() {
            tokio::fs::remove_dir_all(&self.state_dir)
                .await
                .map_err(|e| Error::OperationalFatal(format!("unable to remove state directory: {e}")))?;
        }

        Ok(())
    }

    /// Re-execs the current process image in place. Called after the HTTP
    /// response to the reset request has been flushed. Failures are logged
    /// and the process is left running degraded, per `spec.md` §4.8.
    pub async fn reexec(&self) {
        let _guard = self.cluster_disable.lock().await;

        if let Err(e) = self.reexec_inner() {
            warn!(error = %e, "re-exec after self-removal failed; process left running degraded");
        }
    }

    fn reexec_inner(&self) -> Result<()> {
        use std::os::unix::process::CommandExt;

        let exe = std::fs::read_link("/proc/self/exe")
            .map_err(|e| Error::OperationalFatal(format!("unable to resolve own executable: {e}")))?;
        let exe_str = exe.to_string_lossy();
        let exe_path = exe_str.strip_suffix(" (deleted)").unwrap_or(&exe_str);

        let args: Vec<String> = std::env::args().skip(1).collect();
        let err = std::process::Command::new(exe_path).args(&args).exec();
        Err(Error::OperationalFatal(format!("exec failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::engine::InMemoryEngine;
    use crate::trust::Remote;

    struct NoopTeardown;

    #[async_trait]
    impl Teardown for NoopTeardown {
        async fn stop_database(&self) -> Result<()> {
            Ok(())
        }
        async fn stop_listeners(&self) -> Result<()> {
            Ok(())
        }
    }

    fn dummy_client() -> Arc<ClusterClient> {
        use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
        use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

        #[derive(Debug)]
        struct AcceptAllVerifier;
        impl ServerCertVerifier for AcceptAllVerifier {
            fn verify_server_cert(
                &self,
                _e: &CertificateDer<'_>,
                _i: &[CertificateDer<'_>],
                _s: &ServerName<'_>,
                _o: &[u8],
                _n: UnixTime,
            ) -> std::result::Result<ServerCertVerified, rustls::Error> {
                Ok(ServerCertVerified::assertion())
            }
            fn verify_tls12_signature(
                &self,
                _m: &[u8],
                _c: &CertificateDer<'_>,
                _d: &rustls::DigitallySignedStruct,
            ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
                Ok(HandshakeSignatureValid::assertion())
            }
            fn verify_tls13_signature(
                &self,
                _m: &[u8],
                _c: &CertificateDer<'_>,
                _d: &rustls::DigitallySignedStruct,
            ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
                Ok(HandshakeSignatureValid::assertion())
            }
            fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
                rustls::crypto::ring::default_provider()
                    .signature_verification_algorithms
                    .supported_schemes()
            }
        }

        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAllVerifier))
            .with_no_client_auth();
        Arc::new(ClusterClient::new(Arc::new(config), "node-a").unwrap())
    }

    fn setup(local_address: &str) -> (RemovalCoordinator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new();
        let members = MembershipStore::new(db.clone());
        let trust = TrustStore::open(dir.path().join("truststore")).unwrap();
        let engine = InMemoryEngine::new(local_address) as Arc<dyn ReplicatedEngine>;
        let hooks = Arc::new(HookDispatcher::default());

        let coordinator = RemovalCoordinator::new(
            members,
            trust,
            engine,
            dummy_client(),
            hooks,
            Arc::new(NoopTeardown),
            "node-a".into(),
            local_address.to_string(),
            dir.path().to_path_buf(),
            Arc::new(Mutex::new(())),
        );
        (coordinator, dir)
    }

    #[tokio::test]
    async fn evict_rejects_removing_last_member() {
        let (coordinator, _dir) = setup("10.0.0.1:7443");
        coordinator
            .members
            .insert("node-a".into(), "10.0.0.1:7443".into(), "---cert---".into(), 1, Role::Voter)
            .await
            .unwrap();
        coordinator.trust.add(&[Remote::new("node-a", "10.0.0.1:7443", "---cert---")]).unwrap();

        let result = coordinator.handle_removal("node-a", false).await;
        assert!(result.is_err());
    }

    /// `PreRemove` is an RPC to the target, not a local call on the leader
    /// (`spec.md` §4.9): with an unreachable target and no `force`, eviction
    /// must fail before any local membership state is touched.
    #[tokio::test]
    async fn evict_fails_without_force_when_target_pre_remove_hook_is_unreachable() {
        let (coordinator, _dir) = setup("10.0.0.1:7443");
        coordinator
            .members
            .insert("node-a".into(), "10.0.0.1:7443".into(), "---cert-a---".into(), 1, Role::Voter)
            .await
            .unwrap();
        coordinator
            .members
            .insert("node-b".into(), "10.0.0.2:7443".into(), "---cert-b---".into(), 1, Role::Voter)
            .await
            .unwrap();
        coordinator.trust.add(&[
            Remote::new("node-a", "10.0.0.1:7443", "---cert-a---"),
            Remote::new("node-b", "10.0.0.2:7443", "---cert-b---"),
        ]).unwrap();
        coordinator.engine.join("10.0.0.2:7443", Role::Voter, &[]).await.unwrap();

        let result = coordinator.handle_removal("node-b", false).await;
        assert!(result.is_err());
        assert!(coordinator.members.get("10.0.0.2:7443").await.unwrap().is_some());
        assert!(coordinator.trust.remote_by_name("node-b").is_some());
    }

    #[tokio::test]
    async fn evict_non_self_member_as_leader_succeeds() {
        let (coordinator, _dir) = setup("10.0.0.1:7443");
        coordinator
            .members
            .insert("node-a".into(), "10.0.0.1:7443".into(), "---cert-a---".into(), 1, Role::Voter)
            .await
            .unwrap();
        coordinator
            .members
            .insert("node-b".into(), "10.0.0.2:7443".into(), "---cert-b---".into(), 1, Role::Voter)
            .await
            .unwrap();
        coordinator.trust.add(&[
            Remote::new("node-a", "10.0.0.1:7443", "---cert-a---"),
            Remote::new("node-b", "10.0.0.2:7443", "---cert-b---"),
        ]).unwrap();
        coordinator.engine.join("10.0.0.2:7443", Role::Voter, &[]).await.unwrap();

        let action = coordinator.handle_removal("node-b", true).await.unwrap();
        assert_eq!(action, RemovalAction::Evicted);
        assert!(coordinator.members.get("10.0.0.2:7443").await.unwrap().is_none());
        assert!(coordinator.trust.remote_by_name("node-b").is_none());
    }
}
