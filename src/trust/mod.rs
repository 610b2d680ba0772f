// src/trust/mod.rs

//! The trust store: a durable, inotify-watched `name -> Remote` mapping.

pub mod remote;
pub mod store;
pub mod watcher;

pub use remote::{Remote, fingerprint_pem, validate_hostname};
pub use store::TrustStore;
pub use watcher::{TrustWatcher, watch};
