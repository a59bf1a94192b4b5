//! Envelope encryption for private keys at rest.
//!
//! Secrets are sealed to the X25519 recipients derived from an identity file
//! and stored as ASCII-armored age ciphertext. The identity file itself never
//! leaves the host.

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use age::armor::{ArmoredReader, ArmoredWriter, Format};
use age::secrecy::ExposeSecret;
use age::x25519;
use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::error::EnvelopeError;

/// Loaded identities and the recipients derived from them.
pub struct Envelope {
    identities: Vec<x25519::Identity>,
    recipients: Vec<x25519::Recipient>,
    key_id: String,
    path: PathBuf,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("path", &self.path)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl Envelope {
    /// Build from in-memory identities.
    pub fn from_identities(
        identities: Vec<x25519::Identity>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, EnvelopeError> {
        let path = path.into();
        if identities.is_empty() {
            return Err(EnvelopeError::NoIdentities(path.display().to_string()));
        }
        let recipients: Vec<x25519::Recipient> =
            identities.iter().map(|i| i.to_public()).collect();
        let key_id = recipients_key_id(&recipients);
        Ok(Self {
            identities,
            recipients,
            key_id,
            path,
        })
    }

    /// Read an identity file: one `AGE-SECRET-KEY-` per line, `#` comments
    /// and blank lines ignored.
    pub fn load(path: &Path) -> Result<Self, EnvelopeError> {
        check_path(path)?;
        if !path.exists() {
            return Err(EnvelopeError::Missing(path.display().to_string()));
        }
        let contents = fs::read_to_string(path)?;
        let identities = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| {
                x25519::Identity::from_str(l).map_err(|e| EnvelopeError::InvalidIdentity {
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_identities(identities, path)
    }

    /// Load the identity file, creating one when missing and allowed.
    pub fn ensure_identity(path: &Path, allow_generate: bool) -> Result<Self, EnvelopeError> {
        check_path(path)?;
        if path.exists() || !allow_generate {
            return Self::load(path);
        }

        let identity = x25519::Identity::generate();
        let contents = format!(
            "# created: {}\n# public key: {}\n{}\n",
            Utc::now().to_rfc3339(),
            identity.to_public(),
            identity.to_string().expose_secret()
        );
        write_secret_file(path, contents.as_bytes())?;
        tracing::info!(path = %path.display(), "Generated envelope identity");
        Self::from_identities(vec![identity], path)
    }

    /// `sha256:<hex>` over the sorted recipient strings joined by commas.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Encrypt to every recipient, returning armored ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, EnvelopeError> {
        let encrypt_err = |e: &dyn std::fmt::Display| EnvelopeError::Encrypt {
            reason: e.to_string(),
        };
        let encryptor = age::Encryptor::with_recipients(
            self.recipients.iter().map(|r| r as &dyn age::Recipient),
        )
        .map_err(|e| encrypt_err(&e))?;

        let mut out = Vec::new();
        let armor =
            ArmoredWriter::wrap_output(&mut out, Format::AsciiArmor).map_err(|e| encrypt_err(&e))?;
        let mut writer = encryptor.wrap_output(armor).map_err(|e| encrypt_err(&e))?;
        writer.write_all(plaintext).map_err(|e| encrypt_err(&e))?;
        writer
            .finish()
            .and_then(|armor| armor.finish())
            .map_err(|e| encrypt_err(&e))?;

        String::from_utf8(out).map_err(|e| encrypt_err(&e))
    }

    /// Decrypt armored ciphertext produced by [`Envelope::encrypt`].
    pub fn decrypt(&self, armored: &str) -> Result<Vec<u8>, EnvelopeError> {
        let decrypt_err = |e: &dyn std::fmt::Display| EnvelopeError::Decrypt {
            reason: e.to_string(),
        };
        let decryptor = age::Decryptor::new(ArmoredReader::new(armored.as_bytes()))
            .map_err(|e| decrypt_err(&e))?;
        let mut reader = decryptor
            .decrypt(self.identities.iter().map(|i| i as &dyn age::Identity))
            .map_err(|e| decrypt_err(&e))?;
        let mut plaintext = Vec::new();
        reader
            .read_to_end(&mut plaintext)
            .map_err(|e| decrypt_err(&e))?;
        Ok(plaintext)
    }
}

fn check_path(path: &Path) -> Result<(), EnvelopeError> {
    if path.as_os_str().is_empty() {
        return Err(EnvelopeError::EmptyPath);
    }
    if path.is_dir() {
        return Err(EnvelopeError::IsDirectory(path.display().to_string()));
    }
    Ok(())
}

fn recipients_key_id(recipients: &[x25519::Recipient]) -> String {
    let mut names: Vec<String> = recipients.iter().map(|r| r.to_string()).collect();
    names.sort();
    format!(
        "sha256:{}",
        hex::encode(Sha256::digest(names.join(",").as_bytes()))
    )
}

/// Write `contents` readable only by the owner, creating the parent
/// directory with 0700.
pub fn write_secret_file(path: &Path, contents: &[u8]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(parent)?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}
