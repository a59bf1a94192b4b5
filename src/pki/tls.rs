//! TLS listener configuration and peer identity extraction.
//!
//! The listener verifies client certificates against the internal CA but
//! also accepts clients without one: node registration happens before a
//! node holds a certificate. Handlers that need an authenticated peer read
//! the [`PeerCertificate`] request extension.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};

use crate::config::HttpConfig;
use crate::error::PkiError;
use crate::pki::{CertificateAuthority, server_id_from_cn};

/// Verified client certificate chain, leaf first.
#[derive(Debug, Clone)]
pub struct PeerCertificate(pub Vec<CertificateDer<'static>>);

impl PeerCertificate {
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.0.first()
    }
}

/// Who a verified leaf certificate says the peer is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub server_id: i64,
    /// Lowercase hex serial, as stored in `node_certificates`.
    pub serial_number: String,
}

impl PeerIdentity {
    /// Parse `server-<id>` from the leaf CN and read its serial.
    pub fn from_der(der: &[u8]) -> Result<Self, PkiError> {
        let (_, cert) =
            x509_parser::parse_x509_certificate(der).map_err(|e| PkiError::InvalidCertificate {
                reason: e.to_string(),
            })?;
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .ok_or_else(|| PkiError::InvalidCertificate {
                reason: "missing common name".to_string(),
            })?;
        Ok(Self {
            server_id: server_id_from_cn(cn)?,
            serial_number: hex::encode(cert.raw_serial()),
        })
    }
}

fn tls_err(e: impl std::fmt::Display) -> PkiError {
    PkiError::Tls {
        reason: e.to_string(),
    }
}

/// The listener's certificate chain and key.
pub struct ListenerIdentity {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl ListenerIdentity {
    /// Read PEM files.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, PkiError> {
        if !cert_path.exists() {
            return Err(tls_err(format!(
                "certificate not found: {}",
                cert_path.display()
            )));
        }
        if !key_path.exists() {
            return Err(tls_err(format!("key not found: {}", key_path.display())));
        }
        let chain = CertificateDer::pem_file_iter(cert_path)
            .map_err(tls_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(tls_err)?;
        if chain.is_empty() {
            return Err(tls_err(format!(
                "no certificates in {}",
                cert_path.display()
            )));
        }
        let key = PrivateKeyDer::from_pem_file(key_path).map_err(tls_err)?;
        Ok(Self { chain, key })
    }

    /// Use configured files, or mint a certificate from the CA for
    /// `config.hostname`.
    pub fn resolve(config: &HttpConfig, ca: &CertificateAuthority) -> Result<Self, PkiError> {
        match (&config.tls_cert_path, &config.tls_key_path) {
            (Some(cert), Some(key)) => Self::load(cert, key),
            (None, None) => {
                let server = ca.generate_server_cert(&config.hostname)?;
                tracing::info!(hostname = %config.hostname, "Issued listener certificate from internal CA");
                Ok(Self {
                    chain: vec![
                        CertificateDer::from(server.cert_der),
                        CertificateDer::from(ca.der().to_vec()),
                    ],
                    key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(server.key_der)),
                })
            }
            _ => Err(tls_err(
                "both a TLS certificate and key path must be configured",
            )),
        }
    }
}

/// Build the rustls server config: client certificates optional but, when
/// presented, verified against the CA.
pub fn server_config(
    ca: &CertificateAuthority,
    identity: ListenerIdentity,
) -> Result<Arc<ServerConfig>, PkiError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(ca.der().to_vec()))
        .map_err(tls_err)?;

    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .allow_unauthenticated()
        .build()
        .map_err(tls_err)?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(tls_err)?
        .with_client_cert_verifier(verifier)
        .with_single_cert(identity.chain, identity.key)
        .map_err(tls_err)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DnType, KeyPair};

    fn node_cert(ca: &CertificateAuthority, cn: &str) -> Vec<u8> {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        let csr = params.serialize_request(&key).unwrap().pem().unwrap();
        ca.sign_csr(&csr, cn, 30).unwrap().der
    }

    #[test]
    fn test_peer_identity_from_node_certificate() {
        let ca = CertificateAuthority::generate().unwrap();
        let der = node_cert(&ca, "server-12");
        let identity = PeerIdentity::from_der(&der).unwrap();
        assert_eq!(identity.server_id, 12);
        assert_eq!(identity.serial_number.len(), 40);
    }

    #[test]
    fn test_peer_identity_rejects_foreign_cn() {
        let ca = CertificateAuthority::generate().unwrap();
        let der = node_cert(&ca, "server-abc");
        assert!(PeerIdentity::from_der(&der).is_err());
        assert!(PeerIdentity::from_der(b"junk").is_err());
    }

    #[test]
    fn test_server_config_from_generated_identity() {
        let ca = CertificateAuthority::generate().unwrap();
        let identity = ListenerIdentity::resolve(&HttpConfig::default(), &ca).unwrap();
        assert_eq!(identity.chain.len(), 2);
        let config = server_config(&ca, identity).unwrap();
        assert!(config.alpn_protocols.contains(&b"http/1.1".to_vec()));
    }

    #[test]
    fn test_half_configured_paths_rejected() {
        let ca = CertificateAuthority::generate().unwrap();
        let config = HttpConfig {
            tls_cert_path: Some("/tmp/cert.pem".into()),
            ..HttpConfig::default()
        };
        assert!(matches!(
            ListenerIdentity::resolve(&config, &ca),
            Err(PkiError::Tls { .. })
        ));
    }

    #[test]
    fn test_load_missing_files() {
        let result = ListenerIdentity::load(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        );
        assert!(matches!(result, Err(PkiError::Tls { .. })));
    }
}
