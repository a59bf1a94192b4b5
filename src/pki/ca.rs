//! The internal certificate authority.

use std::net::IpAddr;
use std::path::Path;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
    SanType, SerialNumber,
};
use rustls::pki_types::CertificateDer;
use x509_parser::prelude::FromDer;

use crate::db::CertificateStore;
use crate::error::PkiError;
use crate::pki::{CaRecord, Envelope, der_to_pem, fingerprint};

const CA_COMMON_NAME: &str = "Fleetplane Internal CA";
const CA_VALIDITY_YEARS: i64 = 10;
const SERVER_CERT_VALIDITY_DAYS: i64 = 365;
const SERIAL_BYTES: usize = 20;

/// A client certificate minted from a CSR.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub der: Vec<u8>,
    pub pem: String,
    /// Lowercase hex of the DER serial number.
    pub serial_number: String,
    pub fingerprint: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// A TLS server certificate and its private key.
#[derive(Debug, Clone)]
pub struct ServerCertificate {
    pub cert_der: Vec<u8>,
    pub cert_pem: String,
    pub key_der: Vec<u8>,
}

/// Signs node client certificates and the listener's server certificate.
pub struct CertificateAuthority {
    issuer: Certificate,
    key: KeyPair,
    der: Vec<u8>,
    fingerprint: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Load the persisted CA, or create and persist a new one.
    ///
    /// The private key lives on disk at `key_path`, sealed by `envelope`;
    /// the certificate and its fingerprint live in the store.
    pub async fn load_or_create(
        store: &dyn CertificateStore,
        envelope: &Envelope,
        key_path: &Path,
    ) -> Result<Self, PkiError> {
        if let Some(record) = store.latest_ca().await? {
            let sealed = std::fs::read_to_string(key_path)?;
            let key_pem = String::from_utf8(envelope.decrypt(&sealed)?).map_err(|e| {
                PkiError::InvalidCertificate {
                    reason: format!("CA key is not valid PEM: {}", e),
                }
            })?;
            let ca = Self::from_parts(&record.certificate_der, &key_pem)?;
            tracing::info!(fingerprint = %ca.fingerprint, "Loaded certificate authority");
            return Ok(ca);
        }

        let ca = Self::generate()?;
        let sealed = envelope.encrypt(ca.key.serialize_pem().as_bytes())?;
        super::envelope::write_secret_file(key_path, sealed.as_bytes())?;
        store
            .insert_ca(&CaRecord {
                fingerprint: ca.fingerprint.clone(),
                certificate_der: ca.der.clone(),
                encryption_key_id: envelope.key_id().to_string(),
                created_at: Utc::now(),
            })
            .await?;
        tracing::info!(fingerprint = %ca.fingerprint, "Created certificate authority");
        Ok(ca)
    }

    /// Generate a fresh P-256 CA valid for ten years.
    pub fn generate() -> Result<Self, PkiError> {
        let key = KeyPair::generate()?;
        let now = Utc::now();

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.serial_number = Some(random_serial().0);
        params.not_before = to_offset(now)?;
        params.not_after = to_offset(now + Duration::days(365 * CA_VALIDITY_YEARS))?;

        let issuer = params.self_signed(&key)?;
        let der = issuer.der().to_vec();
        Ok(Self {
            fingerprint: fingerprint(&der),
            issuer,
            key,
            der,
        })
    }

    /// Rebuild from a stored certificate and its decrypted key.
    pub fn from_parts(der: &[u8], key_pem: &str) -> Result<Self, PkiError> {
        let key = KeyPair::from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_der(&CertificateDer::from(der.to_vec()))?;
        // Re-signing yields an issuer handle with the same subject and key;
        // the stored DER stays the published CA certificate.
        let issuer = params.self_signed(&key)?;
        Ok(Self {
            issuer,
            key,
            der: der.to_vec(),
            fingerprint: fingerprint(der),
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn pem(&self) -> String {
        der_to_pem("CERTIFICATE", &self.der)
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Verify a PEM CSR, require its CN to equal `expected_cn`, and sign a
    /// client-auth certificate valid for `validity_days`.
    pub fn sign_csr(
        &self,
        csr_pem: &str,
        expected_cn: &str,
        validity_days: u32,
    ) -> Result<IssuedCertificate, PkiError> {
        let common_name = verified_csr_common_name(csr_pem)?;
        if common_name != expected_cn {
            return Err(PkiError::CommonNameMismatch {
                expected: expected_cn.to_string(),
                actual: common_name,
            });
        }

        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem).map_err(|e| {
            PkiError::InvalidCsr {
                reason: e.to_string(),
            }
        })?;

        let now = Utc::now();
        let not_after = now + Duration::days(i64::from(validity_days.max(1)));
        let (serial, serial_hex) = random_serial();

        // Subject comes from the CSR; everything else is ours.
        csr.params.serial_number = Some(serial);
        csr.params.not_before = to_offset(now)?;
        csr.params.not_after = to_offset(not_after)?;
        csr.params.is_ca = IsCa::ExplicitNoCa;
        csr.params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        csr.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        csr.params.subject_alt_names.clear();
        csr.params.use_authority_key_identifier_extension = true;

        let cert = csr.signed_by(&self.issuer, &self.key)?;
        let der = cert.der().to_vec();
        Ok(IssuedCertificate {
            pem: cert.pem(),
            fingerprint: fingerprint(&der),
            serial_number: serial_hex,
            der,
            not_before: truncate_to_seconds(now),
            not_after: truncate_to_seconds(not_after),
        })
    }

    /// Issue a server-auth certificate for the HTTPS listener with SANs
    /// `[hostname, localhost]`, valid for one year.
    pub fn generate_server_cert(&self, hostname: &str) -> Result<ServerCertificate, PkiError> {
        let key = KeyPair::generate()?;
        let now = Utc::now();

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(hostname.to_string()));
        params.distinguished_name = dn;

        let mut names = vec![hostname.to_string()];
        if hostname != "localhost" {
            names.push("localhost".to_string());
        }
        params.subject_alt_names = names
            .into_iter()
            .map(|name| match name.parse::<IpAddr>() {
                Ok(ip) => Ok(SanType::IpAddress(ip)),
                Err(_) => name.try_into().map(SanType::DnsName),
            })
            .collect::<Result<Vec<_>, rcgen::Error>>()?;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(random_serial().0);
        params.not_before = to_offset(now)?;
        params.not_after = to_offset(now + Duration::days(SERVER_CERT_VALIDITY_DAYS))?;
        params.use_authority_key_identifier_extension = true;

        let cert = params.signed_by(&key, &self.issuer, &self.key)?;
        Ok(ServerCertificate {
            cert_der: cert.der().to_vec(),
            cert_pem: cert.pem(),
            key_der: key.serialize_der(),
        })
    }
}

/// 20 random bytes with the high bit cleared and a non-zero first byte, so
/// the DER integer is positive and exactly `SERIAL_BYTES` long.
fn random_serial() -> (SerialNumber, String) {
    let mut bytes = [0u8; SERIAL_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] = (bytes[0] & 0x7f).max(1);
    (SerialNumber::from(bytes.to_vec()), hex::encode(bytes))
}

/// Parse a PEM CSR, check its self-signature and return the subject CN.
fn verified_csr_common_name(csr_pem: &str) -> Result<String, PkiError> {
    let invalid = |reason: String| PkiError::InvalidCsr { reason };

    let (_, pem) = x509_parser::pem::parse_x509_pem(csr_pem.trim().as_bytes())
        .map_err(|e| invalid(format!("not PEM: {}", e)))?;
    if pem.label != "CERTIFICATE REQUEST" {
        return Err(invalid(format!("unexpected PEM block {:?}", pem.label)));
    }
    let (_, csr) =
        x509_parser::certification_request::X509CertificationRequest::from_der(&pem.contents)
            .map_err(|e| invalid(e.to_string()))?;
    csr.verify_signature()
        .map_err(|e| invalid(format!("bad signature: {}", e)))?;

    let cn = csr
        .certification_request_info
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| invalid("missing common name".to_string()))?;
    Ok(cn.to_string())
}

fn truncate_to_seconds(dt: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(dt.timestamp(), 0).single().unwrap_or(dt)
}

fn to_offset(dt: DateTime<Utc>) -> Result<time::OffsetDateTime, PkiError> {
    time::OffsetDateTime::from_unix_timestamp(dt.timestamp()).map_err(|e| {
        PkiError::InvalidCertificate {
            reason: format!("timestamp out of range: {}", e),
        }
    })
}
