// src/trust/watcher.rs

//! Filesystem watcher wiring for the trust directory.
//!
//! A dedicated task owns the `notify` watcher and calls back into
//! [`TrustStore::refresh`] whenever a `.yaml` file under the directory
//! changes. This is the Rust-native equivalent of the original's
//! `fsnotify`-backed `sys.Watcher` (see `original_source/internal/trust/truststore.go`).

use super::store::TrustStore;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Spawns a background task watching `store`'s directory and refreshing it
/// on every relevant filesystem event. Returns a handle; dropping the
/// handle's `RecommendedWatcher` stops the watch.
pub fn watch(store: Arc<TrustStore>) -> anyhow::Result<TrustWatcher> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            let _ = tx.send(event);
        }
    })?;

    watcher.watch(store.dir(), RecursiveMode::NonRecursive)?;

    let store_for_task = store.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if !is_relevant(&event) {
                continue;
            }

            if let Err(e) = store_for_task.refresh() {
                tracing::warn!(error = %e, "failed to refresh trust store after filesystem event");
            }
        }
    });

    Ok(TrustWatcher {
        _watcher: watcher,
    })
}

fn is_relevant(event: &notify::Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event
        .paths
        .iter()
        .any(|p| p.extension().is_some_and(|ext| ext == "yaml"))
}

/// Owns the live `notify` watcher; keep it alive for as long as updates
/// should be observed.
pub struct TrustWatcher {
    _watcher: RecommendedWatcher,
}
