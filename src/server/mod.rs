// src/server/mod.rs

//! Binds and serves the daemon's three listeners: the Unix control socket
//! and the mTLS `internal`/`public` HTTPS listener (`spec.md` §6, §9).

pub mod initialization;

use crate::error::{Error, Result};
use crate::transport::tls::peer_fingerprint;
use axum::Extension;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::service::TowerToHyperService;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// Serves `router` over a Unix domain socket until `shutdown` fires.
///
/// The socket file is removed first if present, matching restart-after-crash
/// behaviour (a stale socket from an unclean shutdown must not block bind).
pub async fn serve_unix(socket_path: &Path, router: Router, shutdown: Arc<Notify>) -> Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path).map_err(Error::Io)?;
    }
    let listener = UnixListener::bind(socket_path).map_err(Error::Io)?;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => {
                debug!(socket = ?socket_path, "control socket shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, _addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "failed to accept control connection");
                        continue;
                    }
                };
                let service = TowerToHyperService::new(router.clone());
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    if let Err(e) = ConnBuilder::new(TokioExecutor::new()).serve_connection(io, service).await {
                        debug!(error = %e, "control connection closed with error");
                    }
                });
            }
        }
    }
}

/// Serves `router` over a TCP listener with every connection upgraded to
/// mTLS via `acceptor`, until `shutdown` fires.
pub async fn serve_tls(listen_address: &str, acceptor: TlsAcceptor, router: Router, shutdown: Arc<Notify>) -> Result<()> {
    let listener = TcpListener::bind(listen_address)
        .await
        .map_err(Error::Io)?;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => {
                debug!(address = %listen_address, "mTLS listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "failed to accept mTLS connection");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let router = router.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            debug!(error = %e, %peer, "TLS handshake failed");
                            return;
                        }
                    };
                    let fingerprint = peer_fingerprint(tls_stream.get_ref().1);
                    let service = TowerToHyperService::new(router.layer(Extension(fingerprint)));
                    let io = TokioIo::new(tls_stream);
                    if let Err(e) = ConnBuilder::new(TokioExecutor::new()).serve_connection(io, service).await {
                        debug!(error = %e, %peer, "mTLS connection closed with error");
                    }
                });
            }
        }
    }
}
