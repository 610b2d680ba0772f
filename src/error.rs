// src/error.rs

//! The crate-wide error taxonomy and its mapping onto HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Abstract error kinds shared by every subsystem in this crate.
///
/// Subsystems that need to distinguish outcomes *structurally* (the schema
/// gate's [`crate::schema::GateDecision`], the join coordinator's state
/// machine) use their own dedicated enums instead of overloading this one --
/// this type exists to answer "what HTTP status does this become", not to
/// drive internal control flow.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad hostname, conflicting flags, duplicate address/name.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Invalid token or fingerprint mismatch.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Missing client certificate, or caller is not a trusted cluster member.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The local node is not the leader; callers should forward instead of
    /// surfacing this to the original client.
    #[error("not leader")]
    NotLeader,

    /// Deadline exceeded or the engine reported an abort; callers retry once.
    #[error("transient failure: {0}")]
    Transient(String),

    /// This node's schema is behind its peers and cannot proceed.
    #[error("local schema version is behind its peers: {0}")]
    SchemaBehind(String),

    /// DB stop failure, trust-directory I/O error, or similar: fatal unless
    /// the caller passed `force`.
    #[error("operational failure: {0}")]
    OperationalFatal(String),

    /// A `PreRemove`/`PostRemove`/`OnNewMember`/`OnHeartbeat` hook failed.
    #[error("hook failed: {0}")]
    HookFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotLeader => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::SchemaBehind(_) => StatusCode::CONFLICT,
            Error::OperationalFatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::HookFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Serialization(_) => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Adapter used by every handler: `Result<T, Error>` into an HTTP response.
///
/// This is the single place that maps an abstract error kind to a status
/// code; handlers never build a `Response` for an error case by hand.
pub struct SmartError(pub Error);

impl From<Error> for SmartError {
    fn from(err: Error) -> Self {
        SmartError(err)
    }
}

impl IntoResponse for SmartError {
    fn into_response(self) -> Response {
        let status = self.0.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::debug!(error = %self.0, "request rejected");
        }

        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
