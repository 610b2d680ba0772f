// src/transport/mod.rs

//! HTTPS and Unix-socket transport: mTLS configuration, outbound clients,
//! and the forwarding loop-break marker.

pub mod client;
pub mod markers;
pub mod tls;

pub use client::{ClusterClient, UnixClient};
pub use markers::{FORWARDED_BY_HEADER, forwarded_by};
