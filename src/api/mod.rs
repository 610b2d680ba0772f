// src/api/mod.rs

//! The three endpoint groups (`control`, `internal`, `public`) described in
//! `spec.md` §6, and the shared state they dispatch against.

pub mod access;
pub mod control;
pub mod internal;
pub mod public;

use crate::db::Database;
use crate::engine::ReplicatedEngine;
use crate::error::{Error, SmartError};
use crate::heartbeat::HeartbeatEngine;
use crate::hooks::HookDispatcher;
use crate::join::{JoinCoordinator, PhaseCell};
use crate::membership::MembershipStore;
use crate::removal::RemovalCoordinator;
use crate::token::TokenRegistry;
use crate::transport::ClusterClient;
use crate::trust::TrustStore;
pub use crate::transport::tls::ClusterIdentity;
use crate::transport::tls::PeerFingerprint;
use access::{AccessPolicy, EndpointPolicy, enforce, log_forwarder};
use axum::Router;
use axum::extract::{Extension, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post, put};
use std::path::PathBuf;
use std::sync::Arc;

/// Applies the phase gate described in `spec.md` §6: every endpoint but the
/// bootstrap/join entry point on `control` requires the daemon to already
/// have a cluster identity.
async fn phase_gate(State(state): State<ApiState>, request: Request, next: Next) -> std::result::Result<Response, SmartError> {
    log_forwarder(request.headers());

    let allowed_before_init = request.uri().path() == "/control";
    let policy = EndpointPolicy::new(AccessPolicy::AllowClusterMembers, allowed_before_init);
    enforce(policy, state.phase.get()).map_err(|e: Error| SmartError(e))?;

    Ok(next.run(request).await)
}

/// Enforces `AllowClusterMembers` at the router layer: the peer's
/// certificate, pinned by [`crate::server::serve_tls`] as a request
/// extension, must already be in the trust store (`spec.md` §6). Applied
/// only to `internal`, since `public`'s one route is `AllowUntrusted` by
/// design (`spec.md` §4.6 step 3).
async fn require_cluster_cert(
    State(state): State<ApiState>,
    Extension(fingerprint): Extension<PeerFingerprint>,
    request: Request,
    next: Next,
) -> std::result::Result<Response, SmartError> {
    let trusted = fingerprint
        .0
        .as_deref()
        .is_some_and(|fp| state.trust.remotes().values().any(|r| r.fingerprint() == fp));

    if !trusted {
        return Err(SmartError(Error::Forbidden(
            "client certificate is not a recognized cluster member".into(),
        )));
    }

    Ok(next.run(request).await)
}

/// Everything a handler needs, shared across every router via
/// [`axum::extract::State`]. Owned by the daemon (`spec.md` §9: carried on
/// `Daemon`/`Arc<DaemonState>`, never as process-wide globals).
pub struct ApiStateInner {
    pub db: Database,
    pub members: MembershipStore,
    pub trust: Arc<TrustStore>,
    pub engine: Arc<dyn ReplicatedEngine>,
    pub tokens: TokenRegistry,
    pub join: JoinCoordinator,
    pub heartbeat: Arc<HeartbeatEngine>,
    pub removal: RemovalCoordinator,
    pub hooks: Arc<HookDispatcher>,
    pub phase: PhaseCell,
    pub client: Arc<ClusterClient>,
    pub shutdown: Arc<tokio::sync::Notify>,
    pub start_tls: Arc<tokio::sync::Notify>,
    pub local_name: String,
    pub local_address: String,
    pub local_certificate: String,
    pub cluster_identity: Arc<ClusterIdentity>,
    pub state_dir: PathBuf,
}

#[derive(Clone)]
pub struct ApiState(pub Arc<ApiStateInner>);

impl std::ops::Deref for ApiState {
    type Target = ApiStateInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// The `internal` router: mTLS, peers only.
pub fn internal_router(state: ApiState) -> Router {
    Router::new()
        .route("/internal/cluster", get(internal::list_cluster).put(internal::register_remote))
        .route("/internal/cluster/{name}", put(internal::reset_member).delete(internal::remove_member))
        .route("/internal/heartbeat", post(internal::heartbeat))
        .route("/internal/ready", get(internal::ready))
        .route("/internal/hooks/{kind}", post(internal::hook))
        .layer(middleware::from_fn_with_state(state.clone(), require_cluster_cert))
        .layer(middleware::from_fn_with_state(state.clone(), phase_gate))
        .with_state(state)
}

/// The `public` router: mTLS, reachable before cluster admission.
pub fn public_router(state: ApiState) -> Router {
    Router::new()
        .route("/public/cluster", post(public::join))
        .layer(middleware::from_fn_with_state(state.clone(), phase_gate))
        .with_state(state)
}

/// The `control` router: Unix-socket only, no authentication beyond
/// filesystem permissions on the socket itself.
pub fn control_router(state: ApiState) -> Router {
    Router::new()
        .route("/control", post(control::control))
        .route("/control/heartbeat", post(control::kick_heartbeat))
        .route("/control/shutdown", post(control::shutdown))
        .route("/control/ready", get(control::ready))
        .route("/control/cluster", get(control::cluster))
        .route("/control/sql", post(control::sql))
        .route("/control/secrets", post(control::issue_secret).get(control::list_secrets))
        .route("/control/secrets/{fingerprint}", delete(control::delete_secret))
        .layer(middleware::from_fn_with_state(state.clone(), phase_gate))
        .with_state(state)
}
