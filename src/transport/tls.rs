// src/transport/tls.rs

//! mTLS configuration: loading keypairs and pinning peer certificates by
//! fingerprint, rather than validating against a public root-of-trust.
//!
//! Every node's certificate is self-signed; trust comes entirely from
//! fingerprint pinning (`spec.md` §4.1, §4.3), not a certificate authority.
//! Two identities are pinned in two different ways: each peer's own
//! `server.crt`, checked against the trust store when *it* dials out
//! ([`AnyClientCertVerifier`] plus the router-layer check in
//! `crate::api::require_cluster_cert`), and the cluster's single shared
//! `cluster.crt`, checked against [`ClusterIdentity`]'s live copy when *we*
//! dial out ([`ClusterCertVerifier`]). This mirrors how the teacher loads
//! its listener TLS config
//! (`examples/spineldb-spineldb/src/server/initialization.rs`), generalised
//! to two independently-pinned identities instead of one.

use crate::error::{Error, Result};
use crate::trust::TrustStore;
use parking_lot::RwLock;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DistinguishedName, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// The cluster's shared TLS identity: the keypair every member's mTLS
/// listener presents (`spec.md` §4.1). Unknown at construction time (it's
/// generated on bootstrap or received from the leader on join), so it's
/// filled in once via [`ClusterIdentity::set`] rather than threaded through
/// every coordinator ahead of time.
#[derive(Default)]
pub struct ClusterIdentity {
    cert: RwLock<String>,
    key: RwLock<String>,
}

impl ClusterIdentity {
    pub fn set(&self, cert: String, key: String) {
        *self.cert.write() = cert;
        *self.key.write() = key;
    }

    pub fn cert(&self) -> String {
        self.cert.read().clone()
    }

    pub fn key(&self) -> String {
        self.key.read().clone()
    }
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::OperationalFatal(format!("unable to open {path:?}: {e}")))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::OperationalFatal(format!("unable to parse {path:?}: {e}")))?;
    if certs.is_empty() {
        return Err(Error::OperationalFatal(format!("no certificates in {path:?}")));
    }
    Ok(certs)
}

pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::OperationalFatal(format!("unable to open {path:?}: {e}")))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::OperationalFatal(format!("unable to parse {path:?}: {e}")))?
        .ok_or_else(|| Error::OperationalFatal(format!("no private key in {path:?}")))
}

fn der_fingerprint(der: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(der))
}

/// A client-cert verifier that requires a certificate but does not check it
/// against the trust store. Used by [`server_acceptor`], which serves both
/// `AllowClusterMembers` and `AllowUntrusted` endpoints on the same
/// listener; per-endpoint pinning happens afterwards, at the router layer.
#[derive(Debug)]
struct AnyClientCertVerifier {
    provider: Arc<CryptoProvider>,
    _trust: Arc<TrustStore>,
}

impl AnyClientCertVerifier {
    fn new(trust: Arc<TrustStore>) -> Self {
        Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            _trust: trust,
        }
    }
}

impl ClientCertVerifier for AnyClientCertVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// A verifier that pins against a single certificate, known up front as PEM
/// text. Used while joining, before the joiner has any trust store entries
/// to draw on (`spec.md` §4.6 step 2: "pinning `cluster_cert`").
#[derive(Debug)]
struct SingleCertVerifier {
    expected_fingerprint: String,
    provider: Arc<CryptoProvider>,
}

impl SingleCertVerifier {
    fn new(cluster_cert_pem: &str) -> Result<Self> {
        let der = CertificateDer::from_pem_slice(cluster_cert_pem.as_bytes())
            .map_err(|e| Error::Validation(format!("invalid cluster certificate: {e}")))?;
        Ok(Self {
            expected_fingerprint: der_fingerprint(&der),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        })
    }
}

impl ServerCertVerifier for SingleCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if der_fingerprint(end_entity) == self.expected_fingerprint {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "server certificate does not match the pinned join address certificate".into(),
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Builds the server-side TLS acceptor for `internal`/`public` listeners:
/// presents `server_cert`/`server_key`, requires a client certificate but
/// does not pin it at the handshake layer. A joiner's certificate is not
/// yet in the trust store when it calls `POST /public/cluster`
/// (`spec.md` §4.6 step 3: "`AllowUntrusted`"), so pinning is enforced at
/// the router layer per endpoint instead, against the fingerprint
/// recorded by [`peer_fingerprint`].
pub fn server_acceptor(cert_path: &Path, key_path: &Path, trust: Arc<TrustStore>) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let verifier = Arc::new(AnyClientCertVerifier::new(trust));
    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| Error::OperationalFatal(format!("invalid server TLS configuration: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// The fingerprint of the certificate a peer presented on an mTLS
/// connection, carried as a per-connection request extension so handlers
/// and middleware can check it against the trust store (`spec.md` §6:
/// "the router enforces before dispatching").
#[derive(Debug, Clone)]
pub struct PeerFingerprint(pub Option<String>);

/// Extracts the fingerprint of the first certificate a connected client
/// presented, if any. `server_acceptor`'s verifier makes presenting a cert
/// mandatory, so this is `None` only for non-TLS callers.
pub fn peer_fingerprint(conn: &rustls::ServerConnection) -> PeerFingerprint {
    PeerFingerprint(conn.peer_certificates().and_then(|certs| certs.first()).map(|cert| der_fingerprint(cert)))
}

/// A server-cert verifier that pins against whichever certificate the
/// cluster currently shares, read live from a [`ClusterIdentity`]. Every
/// member's mTLS listener presents the same `cluster.crt`
/// (`server_acceptor` above), so there's exactly one certificate to check
/// an outbound connection's peer against -- not the trust store, which
/// records each peer's individual client-identity certificate instead.
#[derive(Debug)]
struct ClusterCertVerifier {
    identity: Arc<ClusterIdentity>,
    provider: Arc<CryptoProvider>,
}

impl ClusterCertVerifier {
    fn new(identity: Arc<ClusterIdentity>) -> Self {
        Self {
            identity,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl ServerCertVerifier for ClusterCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let expected_pem = self.identity.cert();
        let expected = CertificateDer::from_pem_slice(expected_pem.as_bytes())
            .map_err(|e| rustls::Error::General(format!("no valid cluster certificate pinned: {e}")))?;

        if der_fingerprint(end_entity) == der_fingerprint(&expected) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "server certificate does not match the cluster's shared certificate".into(),
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Builds a client TLS config that presents our own cert and pins the peer
/// against the cluster's shared certificate, read live from `identity` so
/// this config keeps working once bootstrap/join fills it in.
pub fn client_config(cert_path: &Path, key_path: &Path, identity: Arc<ClusterIdentity>) -> Result<Arc<rustls::ClientConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let verifier = Arc::new(ClusterCertVerifier::new(identity));
    let mut config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(certs, key)
        .map_err(|e| Error::OperationalFatal(format!("invalid client TLS configuration: {e}")))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Builds a client TLS config for the join handshake, pinning the single
/// certificate handed to us inside the token (`spec.md` §4.6 step 2).
pub fn client_config_pinned_to(
    cert_path: &Path,
    key_path: &Path,
    cluster_cert_pem: &str,
) -> Result<Arc<rustls::ClientConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let verifier = Arc::new(SingleCertVerifier::new(cluster_cert_pem)?);
    let mut config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(certs, key)
        .map_err(|e| Error::OperationalFatal(format!("invalid client TLS configuration: {e}")))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Generates a fresh self-signed cluster keypair, used on bootstrap.
pub fn generate_self_signed(subject_name: &str) -> Result<(String, String)> {
    let key_pair = rcgen::KeyPair::generate()
        .map_err(|e| Error::OperationalFatal(format!("unable to generate keypair: {e}")))?;
    let params = rcgen::CertificateParams::new(vec![subject_name.to_string()])
        .map_err(|e| Error::OperationalFatal(format!("invalid certificate subject: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::OperationalFatal(format!("unable to self-sign certificate: {e}")))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}
