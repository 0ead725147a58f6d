//! Server certificate checks against a per-syncer CA bundle
//!
//! libgit2 validates HTTPS certificates against the system store. Self-hosted
//! Git servers often use a private CA, so a RemoteSyncer may supply a PEM
//! bundle; a server certificate is then also accepted when it is signed by
//! (or identical to) one of the bundle's certificates and is within its
//! validity period.

use x509_parser::prelude::*;

use super::GitError;

/// Parsed trust anchors (DER)
#[derive(Clone, Debug, Default)]
pub struct CaBundle {
    certs: Vec<Vec<u8>>,
}

impl CaBundle {
    /// Parse every `CERTIFICATE` block of a PEM bundle
    pub fn from_pem(bundle: &str) -> Result<Self, GitError> {
        let blocks = ::pem::parse_many(bundle.as_bytes())
            .map_err(|e| GitError::Internal(format!("invalid CA bundle: {e}")))?;
        let certs: Vec<Vec<u8>> = blocks
            .into_iter()
            .filter(|b| b.tag() == "CERTIFICATE")
            .map(|b| b.contents().to_vec())
            .collect();
        if certs.is_empty() {
            return Err(GitError::Internal(
                "CA bundle contains no certificates".to_string(),
            ));
        }
        for der in &certs {
            X509Certificate::from_der(der)
                .map_err(|e| GitError::Internal(format!("invalid CA certificate: {e}")))?;
        }
        Ok(Self { certs })
    }

    /// Number of trust anchors
    pub fn len(&self) -> usize {
        self.certs.len()
    }

    /// True when the bundle holds no certificate
    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Whether the server certificate `leaf_der` is trusted by this bundle
    pub fn trusts(&self, leaf_der: &[u8]) -> bool {
        let Ok((_, leaf)) = X509Certificate::from_der(leaf_der) else {
            return false;
        };
        if !leaf.validity().is_valid() {
            return false;
        }
        self.certs.iter().any(|ca_der| {
            if ca_der.as_slice() == leaf_der {
                return true;
            }
            match X509Certificate::from_der(ca_der) {
                Ok((_, ca)) => leaf.verify_signature(Some(ca.public_key())).is_ok(),
                Err(_) => false,
            }
        })
    }
}
