// src/server/initialization.rs

//! Prepares the on-disk state directory layout before any listener binds
//! (`spec.md` §9: `<state>/database/`, `<state>/truststore/`, certs, socket).

use crate::config::DaemonConfig;
use crate::error::{Error, Result};
use tracing::info;

/// Creates every directory a fresh node needs, idempotently.
pub fn prepare_state_dir(config: &DaemonConfig) -> Result<()> {
    for dir in [config.state_dir.clone(), config.truststore_dir(), config.database_dir()] {
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;
    }
    info!(state_dir = ?config.state_dir, "state directory ready");
    Ok(())
}
