// src/api/control.rs

//! `control` endpoint handlers: Unix-socket only, no authentication beyond
//! filesystem permissions on the socket itself (`spec.md` §6, §9).

use super::ApiState;
use crate::error::{Error, SmartError};
use crate::join::DaemonPhase;
use crate::membership::ClusterMember;
use axum::Json;
use axum::extract::{Path, State};
use serde::{Deserialize, Serialize};

/// Body of `POST /control`: exactly one of `bootstrap` or `join_token` must
/// be set (`spec.md` §4.6). Identity (name, address, certificate) comes
/// from this node's own configuration and on-disk keypair, not the
/// request body.
#[derive(Debug, Deserialize)]
pub struct Control {
    #[serde(default)]
    pub bootstrap: bool,
    #[serde(default)]
    pub join_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub phase: &'static str,
}

fn phase_name(phase: DaemonPhase) -> &'static str {
    match phase {
        DaemonPhase::PreInit => "pre_init",
        DaemonPhase::Bootstrapping => "bootstrapping",
        DaemonPhase::Joining => "joining",
        DaemonPhase::Active => "active",
    }
}

/// `POST /control` -- bootstrap or join-with-token, dispatched by which
/// field of the body is set.
pub async fn control(State(state): State<ApiState>, Json(body): Json<Control>) -> std::result::Result<Json<ControlResponse>, SmartError> {
    if state.phase.get() != DaemonPhase::PreInit {
        return Err(SmartError(Error::Conflict(
            "this node already has a cluster identity".into(),
        )));
    }

    match (body.bootstrap, &body.join_token) {
        (true, None) => {
            state.phase.set(DaemonPhase::Bootstrapping);
            let (cluster_cert, cluster_key) =
                crate::transport::tls::generate_self_signed("cluster").map_err(SmartError)?;
            tokio::fs::write(state.state_dir.join("cluster.crt"), &cluster_cert)
                .await
                .map_err(|e| SmartError(Error::Io(e)))?;
            tokio::fs::write(state.state_dir.join("cluster.key"), &cluster_key)
                .await
                .map_err(|e| SmartError(Error::Io(e)))?;

            state
                .join
                .bootstrap(&state.local_name, &state.local_address, &state.local_certificate)
                .await
                .map_err(SmartError)?;

            state.cluster_identity.set(cluster_cert.clone(), cluster_key);
            state.tokens.set_cluster_cert(cluster_cert);
            state.phase.set(DaemonPhase::Active);
        }
        (false, Some(token)) => {
            state.phase.set(DaemonPhase::Joining);
            let cert_path = state.state_dir.join("server.crt");
            let key_path = state.state_dir.join("server.key");
            let response = state
                .join
                .join_with_token(token, &cert_path, &key_path, &state.local_name, &state.local_address, &state.local_certificate)
                .await
                .map_err(SmartError)?;

            state.cluster_identity.set(response.cluster_cert.clone(), response.cluster_key);
            state.tokens.set_cluster_cert(response.cluster_cert);
            state.phase.set(DaemonPhase::Active);
        }
        _ => {
            return Err(SmartError(Error::Validation(
                "exactly one of bootstrap or join_token must be set".into(),
            )));
        }
    }

    state.start_tls.notify_one();

    Ok(Json(ControlResponse {
        phase: phase_name(state.phase.get()),
    }))
}

/// `POST /control/heartbeat` -- kicks the leader into starting a round
/// out-of-band, ahead of its usual period (`spec.md` §4.7).
pub async fn kick_heartbeat(State(state): State<ApiState>) -> std::result::Result<Json<()>, SmartError> {
    state.heartbeat.run_round().await.map_err(SmartError)?;
    Ok(Json(()))
}

/// `POST /control/shutdown` -- requests a graceful shutdown. The actual
/// teardown runs on the daemon's signal-handling task; this just flags it.
pub async fn shutdown(State(state): State<ApiState>) -> std::result::Result<Json<()>, SmartError> {
    tracing::info!("shutdown requested over control socket");
    state.shutdown.notify_waiters();
    Ok(Json(()))
}

/// `GET /control/ready` -- local readiness, independent of peer probing.
pub async fn ready(State(state): State<ApiState>) -> std::result::Result<Json<bool>, SmartError> {
    Ok(Json(state.phase.get() == DaemonPhase::Active))
}

/// `GET /control/cluster` -- the local membership view, unprobed.
pub async fn cluster(State(state): State<ApiState>) -> std::result::Result<Json<Vec<ClusterMember>>, SmartError> {
    let members = state.members.list().await.map_err(SmartError)?;
    Ok(Json(members))
}

#[derive(Debug, Deserialize)]
pub struct SqlRequest {
    pub query: String,
}

#[derive(Debug, Serialize)]
pub struct SqlResponse {
    pub schema_version: Option<u64>,
}

/// `POST /control/sql` -- ad-hoc introspection against the replicated
/// database. Only the `.schema` meta-command is understood by the
/// reference in-memory engine; a real embedder's replicated SQL engine
/// would serve arbitrary queries here instead.
pub async fn sql(State(state): State<ApiState>, Json(body): Json<SqlRequest>) -> std::result::Result<Json<SqlResponse>, SmartError> {
    if body.query.trim() != ".schema" {
        return Err(SmartError(Error::Validation(format!(
            "unsupported query {:?}: the reference engine only understands .schema",
            body.query
        ))));
    }

    let version = state
        .db
        .transaction(|tx| Ok(tx.current_schema().map(|s| s.version)))
        .await
        .map_err(SmartError)?;

    Ok(Json(SqlResponse { schema_version: version }))
}

#[derive(Debug, Deserialize)]
pub struct IssueSecretRequest {
    pub fingerprint: String,
}

#[derive(Debug, Serialize)]
pub struct IssueSecretResponse {
    pub token: String,
}

/// `POST /control/secrets` -- issues a one-shot join token bound to a
/// joiner's certificate fingerprint.
pub async fn issue_secret(
    State(state): State<ApiState>,
    Json(body): Json<IssueSecretRequest>,
) -> std::result::Result<Json<IssueSecretResponse>, SmartError> {
    let token = state.tokens.issue(&body.fingerprint).await.map_err(SmartError)?;
    Ok(Json(IssueSecretResponse { token }))
}

/// `GET /control/secrets` -- lists fingerprints with an outstanding token.
pub async fn list_secrets(State(state): State<ApiState>) -> std::result::Result<Json<Vec<String>>, SmartError> {
    let fingerprints = state.tokens.list().await.map_err(SmartError)?;
    Ok(Json(fingerprints))
}

/// `DELETE /control/secrets/{fingerprint}` -- revokes an outstanding token.
pub async fn delete_secret(State(state): State<ApiState>, Path(fingerprint): Path<String>) -> std::result::Result<Json<()>, SmartError> {
    state.tokens.delete(&fingerprint).await.map_err(SmartError)?;
    Ok(Json(()))
}
