// src/trust/remote.rs

//! A single trusted peer: name, addresses, and pinned certificate.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A trusted peer, as persisted under the trust directory.
///
/// On disk this is one YAML file per remote, named `<name>.yaml`
/// (`spec.md` §6), containing exactly these three fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    pub name: String,
    pub addresses: Vec<String>,
    /// PEM-encoded X.509 certificate.
    pub certificate: String,
}

impl Remote {
    pub fn new(name: impl Into<String>, address: impl Into<String>, certificate: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addresses: vec![address.into()],
            certificate: certificate.into(),
        }
    }

    /// A SHA-256 fingerprint of the raw certificate bytes, hex-encoded.
    ///
    /// We fingerprint the PEM text directly rather than parsing the DER,
    /// since uniqueness (not X.509 introspection) is all that callers need.
    pub fn fingerprint(&self) -> String {
        fingerprint_pem(&self.certificate)
    }

    pub fn primary_address(&self) -> Option<&str> {
        self.addresses.first().map(String::as_str)
    }

    pub fn has_address(&self, addr: &str) -> bool {
        self.addresses.iter().any(|a| a == addr)
    }
}

pub fn fingerprint_pem(pem: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pem.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hostname validation used when a joiner proposes a `name` (§4.6 step 4).
///
/// Accepts RFC-1123-style labels separated by dots: alphanumerics and
/// hyphens, no leading/trailing hyphen per label, not empty.
pub fn validate_hostname(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 253 {
        return Err(Error::Validation(format!("invalid hostname: {name:?}")));
    }

    for label in name.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(Error::Validation(format!(
                "invalid hostname label {label:?} in {name:?}"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable() {
        let remote = Remote::new("a", "10.0.0.1:7443", "---cert---");
        assert_eq!(remote.fingerprint(), remote.fingerprint());
    }

    #[test]
    fn fingerprint_differs_for_different_certs() {
        let a = Remote::new("a", "10.0.0.1:7443", "---cert-a---");
        let b = Remote::new("a", "10.0.0.1:7443", "---cert-b---");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn accepts_simple_hostnames() {
        assert!(validate_hostname("node-1").is_ok());
        assert!(validate_hostname("node-1.cluster.internal").is_ok());
    }

    #[test]
    fn rejects_bad_hostnames() {
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname("-leading-hyphen").is_err());
        assert!(validate_hostname("has a space").is_err());
        assert!(validate_hostname("trailing-.").is_err());
    }
}
