// src/api/internal.rs

//! `internal` endpoint handlers: mTLS, cluster peers only (`spec.md` §6).

use super::ApiState;
use crate::error::{Error, Result, SmartError};
use crate::heartbeat::HeartbeatInfo;
use crate::hooks::HookRemovalRequest;
use crate::membership::{ClusterMember, MemberStatus};
use crate::removal::RemovalAction;
use crate::transport::markers::forwarded_by;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use reqwest::Method;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
pub struct ForceQuery {
    #[serde(default)]
    pub force: u8,
}

/// `GET /internal/cluster` -- lists members, probing each for liveness.
pub async fn list_cluster(State(state): State<ApiState>) -> std::result::Result<Json<Vec<ClusterMember>>, SmartError> {
    let mut members = state.members.list().await.map_err(SmartError)?;

    for member in &mut members {
        if member.address == state.local_address {
            member.status = MemberStatus::Online;
            continue;
        }
        let probe: Result<serde_json::Value> = state
            .heartbeat_client_probe(&member.address)
            .await;
        member.status = if probe.is_ok() {
            MemberStatus::Online
        } else {
            MemberStatus::Unreachable
        };
    }

    Ok(Json(members))
}

/// `PUT /internal/cluster` -- registers a newly-joined remote locally.
/// Requires the forwarding marker: only ever called by the leader
/// disseminating a join (`spec.md` §4.6 step 6).
pub async fn register_remote(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(remote): Json<crate::trust::Remote>,
) -> std::result::Result<Json<()>, SmartError> {
    if forwarded_by(&headers).is_none() {
        return Err(SmartError(Error::Forbidden(
            "this endpoint only accepts forwarded dissemination requests".into(),
        )));
    }
    debug!(name = %remote.name, "registering disseminated remote");
    state.trust.add(std::slice::from_ref(&remote)).map_err(SmartError)?;

    if let Some(member) = state.members.get(remote.primary_address().unwrap_or_default()).await.map_err(SmartError)? {
        state.hooks.on_new_member(&member).await;
    }

    Ok(Json(()))
}

/// `PUT /internal/cluster/{name}?force=` -- instructs this node to reset
/// itself (`spec.md` §4.8 "ResetClusterMember").
pub async fn reset_member(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(query): Query<ForceQuery>,
) -> std::result::Result<Json<()>, SmartError> {
    if name != state.local_name {
        return Err(SmartError(Error::Validation(format!(
            "reset requested for {name} but this node is {}",
            state.local_name
        ))));
    }

    state.removal.reset_cluster_member().await.map_err(SmartError)?;

    let removal = state.removal.clone();
    tokio::spawn(async move {
        removal.reexec().await;
    });

    let _ = query.force;
    Ok(Json(()))
}

/// `DELETE /internal/cluster/{name}?force=` -- removes a cluster member.
pub async fn remove_member(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(query): Query<ForceQuery>,
) -> std::result::Result<Json<RemovalAction>, SmartError> {
    let action = state
        .removal
        .handle_removal(&name, query.force != 0)
        .await
        .map_err(SmartError)?;
    Ok(Json(action))
}

/// `POST /internal/heartbeat` -- receives a leader's round.
pub async fn heartbeat(
    State(state): State<ApiState>,
    Json(info): Json<HeartbeatInfo>,
) -> std::result::Result<Json<()>, SmartError> {
    state.heartbeat.receive(info).await.map_err(SmartError)?;
    Ok(Json(()))
}

/// `GET /internal/ready` -- readiness probe used by peers and by
/// `/internal/cluster`'s status tagging.
pub async fn ready(State(state): State<ApiState>) -> std::result::Result<Json<()>, SmartError> {
    if state.members.get(&state.local_address).await.map_err(SmartError)?.is_none() {
        return Err(SmartError(Error::Transient("not yet admitted".into())));
    }
    Ok(Json(()))
}

/// `POST /internal/hooks/{PreRemove|PostRemove|OnNewMember}` -- hook RPC.
/// `PreRemove` lands here on the member actually being removed (the leader
/// calls out to it before touching its own membership rows); `PostRemove`
/// lands here on every survivor the leader fans out to afterward.
pub async fn hook(
    State(state): State<ApiState>,
    Path(kind): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> std::result::Result<Json<()>, SmartError> {
    match kind.as_str() {
        "PreRemove" => {
            let request: HookRemovalRequest = serde_json::from_value(body)
                .map_err(|e| SmartError(Error::Validation(format!("invalid PreRemove body: {e}"))))?;
            state.hooks.pre_remove(&request.member, request.force).await.map_err(SmartError)?
        }
        "PostRemove" => {
            let request: HookRemovalRequest = serde_json::from_value(body)
                .map_err(|e| SmartError(Error::Validation(format!("invalid PostRemove body: {e}"))))?;
            state.hooks.post_remove(&request.member, request.force).await
        }
        "OnNewMember" => {
            let member: ClusterMember = serde_json::from_value(body)
                .map_err(|e| SmartError(Error::Validation(format!("invalid OnNewMember body: {e}"))))?;
            state.hooks.on_new_member(&member).await
        }
        other => return Err(SmartError(Error::NotFound(format!("unknown hook {other}")))),
    };
    Ok(Json(()))
}

impl ApiState {
    async fn heartbeat_client_probe(&self, address: &str) -> Result<serde_json::Value> {
        self.0
            .client
            .request(Method::GET, &[address.to_string()], "/internal/ready", None::<&()>)
            .await
    }
}
