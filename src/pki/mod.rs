//! Internal certificate authority, certificate records and the mTLS
//! listener configuration.

mod ca;
pub mod envelope;
pub mod tls;

pub use ca::{CertificateAuthority, IssuedCertificate, ServerCertificate};
pub use envelope::{Envelope, write_secret_file};

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::PkiError;

static NODE_CN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^server-([0-9]+)$").unwrap());

/// The persisted CA certificate.
#[derive(Debug, Clone, PartialEq)]
pub struct CaRecord {
    pub fingerprint: String,
    pub certificate_der: Vec<u8>,
    /// Fingerprint of the envelope recipients that sealed the private key.
    pub encryption_key_id: String,
    pub created_at: DateTime<Utc>,
}

/// A client certificate issued to a node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCertificate {
    pub server_id: i64,
    pub fingerprint: String,
    pub serial_number: String,
    pub certificate_der: Vec<u8>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl NodeCertificate {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }

    pub fn pem(&self) -> String {
        der_to_pem("CERTIFICATE", &self.certificate_der)
    }
}

/// `sha256:<hex>` over DER bytes.
pub fn fingerprint(der: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(der)))
}

/// Common name expected on a node's certificate.
pub fn node_common_name(server_id: i64) -> String {
    format!("server-{}", server_id)
}

/// Parse `server-<digits>` into a positive server id.
pub fn server_id_from_cn(cn: &str) -> Result<i64, PkiError> {
    let invalid = || PkiError::InvalidCertificate {
        reason: format!("unexpected common name {:?}", cn),
    };
    let digits = NODE_CN
        .captures(cn)
        .and_then(|c| c.get(1))
        .ok_or_else(invalid)?;
    match digits.as_str().parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(invalid()),
    }
}

/// Wrap DER bytes in a PEM block.
pub fn der_to_pem(label: &str, der: &[u8]) -> String {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(der);
    let mut out = format!("-----BEGIN {}-----\n", label);
    for chunk in encoded.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str(&format!("-----END {}-----\n", label));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_id_from_cn() {
        assert_eq!(server_id_from_cn("server-42").unwrap(), 42);
        for bad in ["server-", "server-0", "server-4a", "node-4", "server--4", " server-4", "server-99999999999999999999"] {
            assert!(server_id_from_cn(bad).is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint(b"abc");
        assert_eq!(
            fp,
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_der_to_pem_wraps_lines() {
        let pem = der_to_pem("CERTIFICATE", &[0u8; 100]);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.ends_with("-----END CERTIFICATE-----\n"));
        assert!(pem.lines().all(|l| l.len() <= 64));
    }
}
