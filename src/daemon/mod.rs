// src/daemon/mod.rs

//! Ties every subsystem together into a single value an embedding binary
//! constructs and runs (`spec.md` §9: no global mutable state, everything
//! carried on `Daemon`/`Arc<ApiStateInner>`).

mod lifecycle;

use crate::api::{ApiState, ApiStateInner, ClusterIdentity, control_router, internal_router, public_router};
use crate::config::DaemonConfig;
use crate::db::Database;
use crate::engine::ReplicatedEngine;
use crate::error::{Error, Result};
use crate::heartbeat::HeartbeatEngine;
use crate::hooks::HookDispatcher;
use crate::join::{DaemonPhase, JoinCoordinator, PhaseCell};
use crate::membership::MembershipStore;
use crate::removal::{RemovalCoordinator, Teardown};
use crate::server;
use crate::token::TokenRegistry;
use crate::transport::{ClusterClient, tls};
use crate::trust::TrustStore;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

pub use lifecycle::await_shutdown_signal;

/// Stops this node's locally-owned resources ahead of a self-reset
/// (`spec.md` §4.8 "ResetClusterMember"). The replicated database itself is
/// engine-owned and out of scope (§1); this only tears down what the
/// daemon owns directly: the listener accept loops.
struct DaemonTeardown {
    shutdown: Arc<Notify>,
}

#[async_trait::async_trait]
impl Teardown for DaemonTeardown {
    async fn stop_database(&self) -> Result<()> {
        info!("database teardown delegated to the embedding replicated engine");
        Ok(())
    }

    async fn stop_listeners(&self) -> Result<()> {
        self.shutdown.notify_waiters();
        Ok(())
    }
}

async fn read_or_generate_identity(cert_path: &Path, key_path: &Path, subject_name: &str) -> Result<(String, String)> {
    if cert_path.exists() && key_path.exists() {
        let cert = tokio::fs::read_to_string(cert_path).await.map_err(Error::Io)?;
        let key = tokio::fs::read_to_string(key_path).await.map_err(Error::Io)?;
        return Ok((cert, key));
    }

    let (cert, key) = tls::generate_self_signed(subject_name)?;
    tokio::fs::write(cert_path, &cert).await.map_err(Error::Io)?;
    tokio::fs::write(key_path, &key).await.map_err(Error::Io)?;
    Ok((cert, key))
}

/// The running daemon: owns the shared API state and every background
/// task's join handles.
pub struct Daemon {
    config: DaemonConfig,
    state: ApiState,
    shutdown: Arc<Notify>,
}

impl Daemon {
    /// Wires up every coordinator over a fresh or pre-existing state
    /// directory. `engine` and `hooks` are supplied by the embedding host
    /// program; this library never constructs a production engine itself
    /// (`spec.md` §1).
    pub async fn new(config: DaemonConfig, engine: Arc<dyn ReplicatedEngine>, hooks: Arc<HookDispatcher>) -> Result<Self> {
        server::initialization::prepare_state_dir(&config)?;

        let (server_cert, _server_key) =
            read_or_generate_identity(&config.server_cert_path(), &config.server_key_path(), &config.node_name).await?;

        let db = Database::new();
        let trust = TrustStore::open(config.truststore_dir())?;
        let members = MembershipStore::new(db.clone());
        let cluster_identity = Arc::new(ClusterIdentity::default());

        let client_tls = tls::client_config(&config.server_cert_path(), &config.server_key_path(), cluster_identity.clone())?;
        let client = Arc::new(ClusterClient::new(client_tls, config.advertise_address().to_string())?.with_timeout(config.request_timeout));

        let tokens = TokenRegistry::new(db.clone(), String::new(), config.advertise_address().to_string());
        let join = JoinCoordinator::new(
            db.clone(),
            members.clone(),
            trust.clone(),
            engine.clone(),
            config.state_dir.clone(),
            config.schema_version,
        );

        let shutdown = Arc::new(Notify::new());
        let start_tls = Arc::new(Notify::new());
        let cluster_disable = Arc::new(Mutex::new(()));

        let removal = RemovalCoordinator::new(
            members.clone(),
            trust.clone(),
            engine.clone(),
            client.clone(),
            hooks.clone(),
            Arc::new(DaemonTeardown { shutdown: shutdown.clone() }),
            config.node_name.clone(),
            config.advertise_address().to_string(),
            config.state_dir.clone(),
            cluster_disable,
        );

        let heartbeat = Arc::new(HeartbeatEngine::new(
            db.clone(),
            members.clone(),
            trust.clone(),
            engine.clone(),
            client.clone(),
            hooks.clone(),
            config.advertise_address().to_string(),
            config.heartbeat_interval,
        ));

        let phase = PhaseCell::default();

        let resuming = config.cluster_cert_path().exists();
        if resuming {
            let cert = tokio::fs::read_to_string(config.cluster_cert_path()).await.map_err(Error::Io)?;
            let key = tokio::fs::read_to_string(config.cluster_key_path()).await.map_err(Error::Io)?;
            cluster_identity.set(cert.clone(), key);
            tokens.set_cluster_cert(cert);
            phase.set(DaemonPhase::Active);
        }

        let inner = ApiStateInner {
            db,
            members,
            trust,
            engine,
            tokens,
            join,
            heartbeat,
            removal,
            hooks,
            phase,
            client,
            shutdown: shutdown.clone(),
            start_tls,
            local_name: config.node_name.clone(),
            local_address: config.advertise_address().to_string(),
            local_certificate: server_cert,
            cluster_identity,
            state_dir: config.state_dir.clone(),
        };

        Ok(Self {
            config,
            state: ApiState(Arc::new(inner)),
            shutdown,
        })
    }

    /// Runs until a shutdown signal arrives or `POST /control/shutdown` is
    /// called, then tears every listener down. Exit code mapping
    /// (`spec.md` §9) is the caller's responsibility: `0` on a clean
    /// return, `1` if this returns an error.
    pub async fn run(self) -> Result<()> {
        let control_state = self.state.clone();
        let control_socket = self.config.control_socket_path();
        let control_shutdown = self.shutdown.clone();
        let control_task = tokio::spawn(async move {
            server::serve_unix(&control_socket, control_router(control_state), control_shutdown).await
        });

        let tls_state = self.state.clone();
        let listen_address = self.config.listen_address.clone();
        let cluster_cert_path = self.config.cluster_cert_path();
        let cluster_key_path = self.config.cluster_key_path();
        let tls_shutdown = self.shutdown.clone();
        let start_tls = tls_state.start_tls.clone();
        let already_active = tls_state.phase.get() == DaemonPhase::Active;
        let tls_task = tokio::spawn(async move {
            if !already_active {
                start_tls.notified().await;
            }
            let acceptor = tls::server_acceptor(&cluster_cert_path, &cluster_key_path, tls_state.trust.clone())?;
            let router = internal_router(tls_state.clone()).merge(public_router(tls_state));
            server::serve_tls(&listen_address, acceptor, router, tls_shutdown).await
        });

        let heartbeat_state = self.state.clone();
        let period = self.config.heartbeat_interval;
        let heartbeat_shutdown = self.shutdown.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    biased;
                    _ = heartbeat_shutdown.notified() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = heartbeat_state.heartbeat.run_round().await {
                            warn!(error = %e, "heartbeat round failed");
                        }
                    }
                }
            }
        });

        let watch_handle = crate::trust::watch(self.state.trust.clone()).ok();
        if watch_handle.is_none() {
            warn!("trust-directory watcher failed to start; falling back to explicit refreshes only");
        }

        lifecycle::await_shutdown_signal().await;
        info!("shutdown signal received");
        self.shutdown.notify_waiters();

        let _ = control_task.await;
        let _ = tls_task.await;
        let _ = heartbeat_task.await;
        drop(watch_handle);

        Ok(())
    }

    pub fn state(&self) -> ApiState {
        self.state.clone()
    }
}
