// src/api/access.rs

//! Per-endpoint access policy enforcement (`spec.md` §4.3).

use crate::error::{Error, Result};
use crate::join::DaemonPhase;
use crate::transport::markers::FORWARDED_BY_HEADER;
use axum::http::HeaderMap;

/// Who may call an endpoint, checked by the router before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPolicy {
    /// No authentication at all (the join endpoint, before any trust
    /// relationship exists).
    AllowUntrusted,
    /// Any peer presenting a client certificate this node's mTLS listener
    /// already accepted (the listener itself enforces this by requiring
    /// and verifying client certs; this variant exists to be named in
    /// routing tables even though the check already happened in the TLS
    /// handshake).
    AllowAuthenticated,
    /// Only a certificate already present in the trust store under a
    /// cluster-member name.
    AllowClusterMembers,
}

/// Whether an endpoint may be called while the local daemon is still
/// `PreInit` (no cluster identity yet). Only `public`/`control` bootstrap
/// and join endpoints set this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointPolicy {
    pub access: AccessPolicy,
    pub allowed_before_init: bool,
}

impl EndpointPolicy {
    pub const fn new(access: AccessPolicy, allowed_before_init: bool) -> Self {
        Self {
            access,
            allowed_before_init,
        }
    }
}

/// Enforces `policy` against the current daemon phase. TLS-level identity
/// (which peer, if any) is established by the listener's client-cert
/// verifier before a request ever reaches a handler; this function only
/// covers the part axum can see, the phase gate.
pub fn enforce(policy: EndpointPolicy, phase: DaemonPhase) -> Result<()> {
    if phase == DaemonPhase::PreInit && !policy.allowed_before_init {
        return Err(Error::Forbidden("this endpoint requires cluster identity".into()));
    }
    Ok(())
}

/// Logs the forwarder of a request at `debug`, per `spec.md` §9.
pub fn log_forwarder(headers: &HeaderMap) {
    if let Some(name) = headers.get(FORWARDED_BY_HEADER).and_then(|v| v.to_str().ok()) {
        tracing::debug!(forwarded_by = %name, "handling a forwarded request");
    }
}
