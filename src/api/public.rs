// src/api/public.rs

//! `public` endpoint handlers: mTLS, reachable before cluster admission
//! (`spec.md` §6).

use super::ApiState;
use crate::error::{Error, SmartError};
use crate::join::{JoinRequest, JoinResponse};
use crate::transport::markers::forwarded_by;
use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use reqwest::Method;
use tracing::warn;

/// `POST /public/cluster` -- a joiner presenting a token.
///
/// If this node isn't the leader, it forwards to whoever is, setting the
/// loop-break marker, per `spec.md` §4.6 step 4.
pub async fn join(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<JoinRequest>,
) -> std::result::Result<Json<JoinResponse>, SmartError> {
    let already_forwarded = forwarded_by(&headers).is_some();

    if !already_forwarded && !state.engine.is_leader(&state.local_address).await.map_err(SmartError)? {
        let leader = state
            .engine
            .leader()
            .await
            .map_err(SmartError)?
            .ok_or_else(|| SmartError(Error::Transient("no leader currently known".into())))?;

        let response: JoinResponse = state
            .client
            .request(Method::POST, &[leader.address], "/public/cluster", Some(&request))
            .await
            .map_err(SmartError)?;
        return Ok(Json(response));
    }

    let joiner_address = request.address.clone();
    let response = state
        .join
        .handle_join_request(request, &state.cluster_identity.cert(), &state.cluster_identity.key())
        .await
        .map_err(SmartError)?;

    disseminate(&state, &response, &joiner_address).await;

    Ok(Json(response))
}

/// Fans the newly-joined remote out to every other existing member, per
/// `spec.md` §4.6 step 6. Best-effort: a member that can't be reached now
/// will pick the remote up on the next heartbeat round's trust-store
/// overwrite instead.
async fn disseminate(state: &ApiState, response: &JoinResponse, joiner_address: &str) {
    for member in &response.cluster_members {
        if member.address == state.local_address || member.address == joiner_address {
            continue;
        }
        let result: std::result::Result<serde_json::Value, _> = state
            .client
            .request(Method::PUT, &[member.address.clone()], "/internal/cluster", Some(&response.trusted_member))
            .await;
        if let Err(e) = result {
            warn!(member = %member.name, error = %e, "failed to disseminate new remote");
        }
    }
}
