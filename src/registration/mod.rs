//! Node bootstrap: single-use registration tokens exchanged for a client
//! certificate signed by the internal CA.
//!
//! Security properties:
//! - Tokens are 32 random bytes, base64url without padding
//! - Only `sha256(token)` is persisted
//! - A token is scoped to one server id and consumed at most once

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::db::{CertificateStore, RegistrationStore};
use crate::error::{DatabaseError, PkiError, RegistrationError};
use crate::pki::{CertificateAuthority, NodeCertificate, node_common_name};

/// Generate a registration token (32 bytes, base64url, 43 chars).
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Hex SHA-256 of the plaintext token.
pub fn hash_token(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

/// A freshly issued token. The plaintext is shown once and never stored.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Certificates returned to a node after registration.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredNode {
    pub certificate: String,
    pub ca_certificate: String,
}

/// Why a registration was refused.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("{0}")]
    BadRequest(String),

    #[error("invalid or expired token")]
    Unauthorized,

    #[error("valid certificate already exists")]
    Conflict,

    #[error("{message}")]
    Internal {
        message: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl RegisterError {
    fn internal(message: &'static str, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        RegisterError::Internal {
            message,
            source: Box::new(source),
        }
    }
}

/// Issues and consumes registration tokens and signs node certificates.
#[derive(Clone)]
pub struct RegistrationService {
    tokens: Arc<dyn RegistrationStore>,
    certificates: Arc<dyn CertificateStore>,
    ca: Arc<CertificateAuthority>,
    validity_days: u32,
}

impl RegistrationService {
    pub fn new(
        tokens: Arc<dyn RegistrationStore>,
        certificates: Arc<dyn CertificateStore>,
        ca: Arc<CertificateAuthority>,
        validity_days: u32,
    ) -> Self {
        Self {
            tokens,
            certificates,
            ca,
            validity_days,
        }
    }

    pub fn ca(&self) -> &CertificateAuthority {
        &self.ca
    }

    /// Create a token for `server_id` that expires after `ttl`.
    pub async fn issue(&self, server_id: i64, ttl: Duration) -> Result<IssuedToken, RegistrationError> {
        if server_id <= 0 {
            return Err(RegistrationError::InvalidServerId);
        }
        let ttl = chrono::Duration::from_std(ttl).map_err(|_| RegistrationError::InvalidTtl)?;
        if ttl <= chrono::Duration::zero() {
            return Err(RegistrationError::InvalidTtl);
        }

        let token = generate_token();
        let expires_at = Utc::now() + ttl;
        self.tokens
            .insert_registration_token(server_id, &hash_token(&token), expires_at)
            .await?;
        tracing::info!(server_id, %expires_at, "Issued registration token");
        Ok(IssuedToken { token, expires_at })
    }

    /// Consume a token for `server_id`. Fails unless exactly one unexpired,
    /// unconsumed token matched.
    pub async fn consume(&self, plaintext: &str, server_id: i64) -> Result<(), RegistrationError> {
        let consumed = self
            .tokens
            .consume_registration_token(&hash_token(plaintext), server_id, Utc::now())
            .await?;
        if !consumed {
            return Err(RegistrationError::TokenRejected);
        }
        Ok(())
    }

    /// Delete expired, never-consumed tokens.
    pub async fn cleanup_expired(&self) -> Result<u64, RegistrationError> {
        Ok(self
            .tokens
            .delete_expired_registration_tokens(Utc::now())
            .await?)
    }

    /// Exchange a token and CSR for a client certificate.
    ///
    /// The CSR is validated before the token is touched so a malformed
    /// request does not burn the token.
    pub async fn register_node(
        &self,
        server_id: i64,
        token: &str,
        csr_pem: &str,
    ) -> Result<RegisteredNode, RegisterError> {
        if server_id <= 0 {
            return Err(RegisterError::BadRequest("invalid server id".to_string()));
        }
        let token = token.trim();
        if token.is_empty() {
            return Err(RegisterError::BadRequest("token is required".to_string()));
        }
        let csr_pem = csr_pem.trim();
        if csr_pem.is_empty() {
            return Err(RegisterError::BadRequest("csr is required".to_string()));
        }

        // Signing also verifies the CSR; do it up front and only persist
        // after the token and conflict checks pass.
        let issued = match self
            .ca
            .sign_csr(csr_pem, &node_common_name(server_id), self.validity_days)
        {
            Ok(issued) => issued,
            Err(PkiError::CommonNameMismatch { .. }) => {
                return Err(RegisterError::BadRequest(
                    "CSR CN must match server ID".to_string(),
                ));
            }
            Err(PkiError::InvalidCsr { reason }) => {
                tracing::debug!(server_id, %reason, "Rejected CSR");
                return Err(RegisterError::BadRequest("invalid CSR".to_string()));
            }
            Err(e) => return Err(RegisterError::internal("failed to sign certificate", e)),
        };

        match self.consume(token, server_id).await {
            Ok(()) => {}
            Err(RegistrationError::TokenRejected) => {
                tracing::debug!(server_id, "Token consumption failed");
                return Err(RegisterError::Unauthorized);
            }
            Err(e) => return Err(RegisterError::internal("internal error", e)),
        }

        let now = Utc::now();
        match self.certificates.valid_certificate_for_server(server_id, now).await {
            Ok(Some(_)) => return Err(RegisterError::Conflict),
            Ok(None) => {}
            Err(e) => return Err(RegisterError::internal("internal error", e)),
        }

        let record = NodeCertificate {
            server_id,
            fingerprint: issued.fingerprint.clone(),
            serial_number: issued.serial_number.clone(),
            certificate_der: issued.der.clone(),
            issued_at: issued.not_before,
            expires_at: issued.not_after,
            revoked_at: None,
        };
        self.certificates
            .insert_node_certificate(&record)
            .await
            .map_err(|e| RegisterError::internal("failed to save certificate", e))?;

        tracing::info!(
            server_id,
            serial = %issued.serial_number,
            expires_at = %issued.not_after,
            "Registered node"
        );
        Ok(RegisteredNode {
            certificate: issued.pem,
            ca_certificate: self.ca.pem(),
        })
    }

    /// PEM of the server's current valid certificate, if any.
    pub async fn certificate_pem_for_server(
        &self,
        server_id: i64,
    ) -> Result<Option<String>, DatabaseError> {
        Ok(self
            .certificates
            .valid_certificate_for_server(server_id, Utc::now())
            .await?
            .map(|c| c.pem()))
    }

    /// Revoke by serial. Returns false if no unrevoked certificate matched.
    pub async fn revoke(&self, serial_number: &str) -> Result<bool, DatabaseError> {
        let serial = serial_number.trim().to_ascii_lowercase();
        let revoked = self
            .certificates
            .revoke_certificate(&serial, Utc::now())
            .await?;
        if revoked {
            tracing::warn!(serial = %serial, "Revoked node certificate");
        }
        Ok(revoked)
    }

    pub async fn is_revoked(&self, serial_number: &str) -> Result<bool, DatabaseError> {
        self.certificates.is_revoked(serial_number).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use rcgen::{CertificateParams, DnType, KeyPair};

    fn service() -> (Arc<MemoryStore>, RegistrationService) {
        let store = Arc::new(MemoryStore::new());
        let ca = Arc::new(CertificateAuthority::generate().unwrap());
        let service = RegistrationService::new(store.clone(), store.clone(), ca, 90);
        (store, service)
    }

    fn csr_for(cn: &str) -> String {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.serialize_request(&key).unwrap().pem().unwrap()
    }

    #[test]
    fn test_token_format() {
        let token = generate_token();
        assert_eq!(token.len(), 43);
        assert!(!token.contains('='));
        assert!(!token.contains('+') && !token.contains('/'));
        assert_ne!(token, generate_token());
        assert_eq!(hash_token(&token).len(), 64);
    }

    #[tokio::test]
    async fn test_issue_and_consume_once() {
        let (_, service) = service();
        let issued = service.issue(5, Duration::from_secs(3600)).await.unwrap();
        assert!(issued.expires_at > Utc::now());

        assert!(matches!(
            service.consume(&issued.token, 6).await,
            Err(RegistrationError::TokenRejected)
        ));
        service.consume(&issued.token, 5).await.unwrap();
        assert!(matches!(
            service.consume(&issued.token, 5).await,
            Err(RegistrationError::TokenRejected)
        ));
    }

    #[tokio::test]
    async fn test_issue_validates_input() {
        let (_, service) = service();
        assert!(matches!(
            service.issue(0, Duration::from_secs(60)).await,
            Err(RegistrationError::InvalidServerId)
        ));
        assert!(matches!(
            service.issue(1, Duration::ZERO).await,
            Err(RegistrationError::InvalidTtl)
        ));
    }

    #[tokio::test]
    async fn test_register_node_flow() {
        let (store, service) = service();
        let issued = service.issue(7, Duration::from_secs(600)).await.unwrap();

        let node = service
            .register_node(7, &issued.token, &csr_for("server-7"))
            .await
            .unwrap();
        assert!(node.certificate.starts_with("-----BEGIN CERTIFICATE-----"));
        assert_eq!(node.ca_certificate, service.ca().pem());
        assert_eq!(store.certificate_count(), 1);
        assert!(service.certificate_pem_for_server(7).await.unwrap().is_some());

        // Second token, but a valid certificate already exists.
        let again = service.issue(7, Duration::from_secs(600)).await.unwrap();
        assert!(matches!(
            service.register_node(7, &again.token, &csr_for("server-7")).await,
            Err(RegisterError::Conflict)
        ));
    }

    #[tokio::test]
    async fn test_register_node_rejections() {
        let (_, service) = service();
        let issued = service.issue(7, Duration::from_secs(600)).await.unwrap();

        assert!(matches!(
            service.register_node(7, &issued.token, &csr_for("server-8")).await,
            Err(RegisterError::BadRequest(_))
        ));
        assert!(matches!(
            service.register_node(7, &issued.token, "garbage").await,
            Err(RegisterError::BadRequest(_))
        ));
        assert!(matches!(
            service.register_node(7, "", &csr_for("server-7")).await,
            Err(RegisterError::BadRequest(_))
        ));
        assert!(matches!(
            service.register_node(7, "wrong", &csr_for("server-7")).await,
            Err(RegisterError::Unauthorized)
        ));

        // The malformed attempts above did not consume the token.
        service
            .register_node(7, &issued.token, &csr_for("server-7"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_revoke_allows_reregistration() {
        let (store, service) = service();
        let first = service.issue(3, Duration::from_secs(600)).await.unwrap();
        service
            .register_node(3, &first.token, &csr_for("server-3"))
            .await
            .unwrap();

        let serial = store
            .valid_certificate_for_server(3, Utc::now())
            .await
            .unwrap()
            .unwrap()
            .serial_number;
        assert!(service.revoke(&serial.to_uppercase()).await.unwrap());
        assert!(service.is_revoked(&serial).await.unwrap());
        assert!(!service.revoke(&serial).await.unwrap());

        let second = service.issue(3, Duration::from_secs(600)).await.unwrap();
        service
            .register_node(3, &second.token, &csr_for("server-3"))
            .await
            .unwrap();
    }
}
