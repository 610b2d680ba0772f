// src/daemon/lifecycle.rs

//! Process-level signal handling for the daemon's main run loop.

use tracing::info;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Waits for whichever OS signal should trigger a graceful shutdown
/// (`spec.md` §9: `SIGINT`, `SIGTERM`, `SIGQUIT`, `SIGPWR`). `SIGHUP` is
/// explicitly not registered here and so falls through to the default
/// disposition rather than tearing the daemon down.
#[cfg(unix)]
pub async fn await_shutdown_signal() {
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");

    #[cfg(target_os = "linux")]
    let mut sigpwr = signal(SignalKind::from_raw(30)).expect("failed to install SIGPWR handler");

    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown"),
        _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown"),
        _ = sigquit.recv() => info!("SIGQUIT received, initiating graceful shutdown"),
        #[cfg(target_os = "linux")]
        _ = sigpwr.recv() => info!("SIGPWR received, initiating graceful shutdown"),
    }
}

#[cfg(windows)]
pub async fn await_shutdown_signal() {
    let mut ctrl_c = tokio::signal::windows::ctrl_c().expect("failed to install Ctrl+C handler");
    ctrl_c.recv().await;
    info!("Ctrl-C received, initiating graceful shutdown");
}
