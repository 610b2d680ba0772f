// src/transport/client.rs

//! Outbound clients: a Unix-socket client for local administration, and an
//! mTLS client that dials cluster peers.

use crate::error::{Error, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Dials the local control socket. No TLS; used only by trusted
/// administrative front-ends on the same host (`spec.md` §4.3).
pub struct UnixClient {
    socket_path: PathBuf,
}

impl UnixClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub async fn request<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Req>,
    ) -> Result<Resp> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| Error::Transient(format!("unable to dial control socket: {e}")))?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| Error::Transient(format!("control socket handshake failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "control socket connection closed");
            }
        });

        let payload = match body {
            Some(b) => serde_json::to_vec(b)?,
            None => Vec::new(),
        };

        let request = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| Error::Validation(format!("invalid control request: {e}")))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| Error::Transient(format!("control socket request failed: {e}")))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Transient(format!("failed to read control response body: {e}")))?
            .to_bytes();

        if status != StatusCode::OK {
            return Err(Error::Transient(format!(
                "control socket returned {status} for {path}"
            )));
        }

        Ok(serde_json::from_slice(&body)?)
    }
}

/// Dials cluster peers over mTLS, iterating a remote's known addresses
/// until one handshakes (`spec.md` §4.3). Marks every request with
/// `X-Forwarded-By` so the receiver can enforce the loop-break rule.
pub struct ClusterClient {
    http: reqwest::Client,
    forwarder_name: String,
    timeout: Duration,
}

impl ClusterClient {
    pub fn new(tls_config: Arc<rustls::ClientConfig>, forwarder_name: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .use_preconfigured_tls((*tls_config).clone())
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::OperationalFatal(format!("unable to build cluster HTTP client: {e}")))?;

        Ok(Self {
            http,
            forwarder_name: forwarder_name.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends `body` to the first address in `addresses` that accepts a
    /// connection, returning the deserialised response.
    pub async fn request<Req: Serialize + ?Sized, Resp: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        addresses: &[String],
        path: &str,
        body: Option<&Req>,
    ) -> Result<Resp> {
        let mut last_error = None;

        for address in addresses {
            let url = format!("https://{address}{path}");
            let mut request = self
                .http
                .request(method.clone(), &url)
                .timeout(self.timeout)
                .header(super::markers::FORWARDED_BY_HEADER, &self.forwarder_name);

            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json()
                        .await
                        .map_err(|e| Error::Transient(format!("malformed response from {address}: {e}")));
                }
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    last_error = Some(Error::Transient(format!(
                        "{address} returned {status}: {text}"
                    )));
                }
                Err(e) => {
                    last_error = Some(Error::Transient(format!("unable to dial {address}: {e}")));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Validation("no addresses to dial".into())))
    }
}

