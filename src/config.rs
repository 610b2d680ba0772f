// src/config.rs

//! Daemon configuration: loading, defaults, and eager validation.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for a [`crate::daemon::Daemon`].
///
/// Loaded from a TOML file via the `config` crate, with environment
/// overrides under the `FLOTILLA_` prefix (e.g. `FLOTILLA_LISTEN_ADDRESS`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// This node's cluster-unique, DNS-like hostname (`spec.md` §3).
    pub node_name: String,

    /// Root of this node's on-disk state (database, trust store, certs, socket).
    pub state_dir: PathBuf,

    /// Address the mTLS listener binds to, e.g. `0.0.0.0:7443`.
    pub listen_address: String,

    /// Address other members should dial to reach this node. Defaults to
    /// `listen_address` when unset (useful when the bind address is
    /// `0.0.0.0` but peers need a concrete routable address).
    pub advertise_address: Option<String>,

    /// Path of the local administrative Unix socket. Defaults to
    /// `<state_dir>/control.socket`.
    #[serde(default)]
    pub control_socket_path: Option<PathBuf>,

    /// Compiled-in schema version this binary implements. Overridable so
    /// test harnesses can simulate mixed-version clusters.
    #[serde(default = "default_schema_version")]
    pub schema_version: u64,

    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,

    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,

    #[serde(with = "humantime_serde", default = "default_leader_lookup_timeout")]
    pub leader_lookup_timeout: Duration,

    #[serde(with = "humantime_serde", default = "default_dial_timeout")]
    pub dial_timeout: Duration,
}

fn default_schema_version() -> u64 {
    1
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_leader_lookup_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(5)
}

impl DaemonConfig {
    /// Loads configuration from a TOML file, layering `FLOTILLA_*` environment
    /// variables on top, matching the host binary's `--config` flag.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("FLOTILLA").separator("__"))
            .build()
            .map_err(|e| Error::Validation(format!("failed to load config {path:?}: {e}")))?;

        let cfg: DaemonConfig = settings
            .try_deserialize()
            .map_err(|e| Error::Validation(format!("failed to parse config {path:?}: {e}")))?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn control_socket_path(&self) -> PathBuf {
        self.control_socket_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("control.socket"))
    }

    pub fn advertise_address(&self) -> &str {
        self.advertise_address
            .as_deref()
            .unwrap_or(&self.listen_address)
    }

    pub fn truststore_dir(&self) -> PathBuf {
        self.state_dir.join("truststore")
    }

    pub fn database_dir(&self) -> PathBuf {
        self.state_dir.join("database")
    }

    pub fn cluster_cert_path(&self) -> PathBuf {
        self.state_dir.join("cluster.crt")
    }

    pub fn cluster_key_path(&self) -> PathBuf {
        self.state_dir.join("cluster.key")
    }

    pub fn server_cert_path(&self) -> PathBuf {
        self.state_dir.join("server.crt")
    }

    pub fn server_key_path(&self) -> PathBuf {
        self.state_dir.join("server.key")
    }

    fn validate(&self) -> Result<()> {
        crate::trust::validate_hostname(&self.node_name)?;

        if !self.state_dir.is_absolute() {
            return Err(Error::Validation(format!(
                "state_dir must be an absolute path, got {:?}",
                self.state_dir
            )));
        }

        if self.listen_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(Error::Validation(format!(
                "listen_address {:?} is not a valid socket address",
                self.listen_address
            )));
        }

        if self.schema_version == 0 {
            return Err(Error::Validation(
                "schema_version must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> DaemonConfig {
        DaemonConfig {
            node_name: "node-a".into(),
            state_dir: PathBuf::from("/var/lib/flotilla"),
            listen_address: "127.0.0.1:7443".into(),
            advertise_address: None,
            control_socket_path: None,
            schema_version: 1,
            heartbeat_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            leader_lookup_timeout: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn rejects_relative_state_dir() {
        let mut cfg = base_config();
        cfg.state_dir = PathBuf::from("relative/path");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn control_socket_defaults_under_state_dir() {
        let cfg = base_config();
        assert_eq!(
            cfg.control_socket_path(),
            PathBuf::from("/var/lib/flotilla/control.socket")
        );
    }

    #[test]
    fn rejects_bad_listen_address() {
        let mut cfg = base_config();
        cfg.listen_address = "not-an-address".into();
        assert!(cfg.validate().is_err());
    }
}
