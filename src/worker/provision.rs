//! The `provision_server` step machine:
//! `validate → create_ssh_key → create_server → wait_running → finalize`.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use ed25519_dalek::SigningKey;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{DatabaseError, ProviderError};
use crate::orchestrator::Job;
use crate::provider::{CreateServerRequest, ServerProvider};
use crate::servers::{ProvisioningUpdate, Server, ServerKey, status};
use crate::worker::Executor;

pub(super) const PROVISION_STEPS: &[&str] =
    &["validate", "create_ssh_key", "create_server", "wait_running", "finalize"];

/// Provider-side name of a server's SSH key.
pub fn ssh_key_name(server_id: i64) -> String {
    format!("fleetplane-server-{}", server_id)
}

/// Generate an Ed25519 keypair. Returns the OpenSSH public key line and the
/// PKCS#8 PEM private key.
pub fn generate_ssh_keypair(comment: &str) -> Result<(String, String), String> {
    let signing = SigningKey::generate(&mut OsRng);
    let private_pem = signing
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| format!("failed to encode private key: {}", e))?;

    let public = signing.verifying_key().to_bytes();
    let mut blob = Vec::with_capacity(51);
    for part in [b"ssh-ed25519".as_slice(), public.as_slice()] {
        blob.extend_from_slice(&(part.len() as u32).to_be_bytes());
        blob.extend_from_slice(part);
    }
    let public_line = format!("ssh-ed25519 {} {}", STANDARD.encode(blob), comment);
    Ok((public_line, private_pem.to_string()))
}

/// State carried across the steps of one provisioning run.
pub(super) struct Provisioning<'a> {
    exec: &'a Executor,
    job: &'a Job,
    cancel: &'a CancellationToken,
    server: Option<Server>,
    provider: Option<Arc<dyn ServerProvider>>,
    token: Option<SecretString>,
    provider_server_id: Option<String>,
}

impl<'a> Provisioning<'a> {
    pub(super) fn new(exec: &'a Executor, job: &'a Job, cancel: &'a CancellationToken) -> Self {
        Self {
            exec,
            job,
            cancel,
            server: None,
            provider: None,
            token: None,
            provider_server_id: None,
        }
    }

    pub(super) fn server(&self) -> Option<&Server> {
        self.server.as_ref()
    }

    pub(super) fn start_message(&self, step: &str) -> &'static str {
        match step {
            "validate" => "Validating server configuration",
            "create_ssh_key" => "Preparing SSH key",
            "create_server" => "Creating server at provider",
            "wait_running" => "Waiting for server to boot",
            "finalize" => "Finalizing server setup",
            _ => "Running step",
        }
    }

    /// Run one step. `Ok` carries the completion message, `Err` the failure
    /// recorded on the job.
    pub(super) async fn step(&mut self, step: &str) -> Result<String, String> {
        match step {
            "validate" => self.validate().await,
            "create_ssh_key" => self.create_ssh_key().await,
            "create_server" => self.create_server().await,
            "wait_running" => self.wait_running().await,
            "finalize" => self.finalize().await,
            other => Err(format!("unknown provisioning step: {}", other)),
        }
    }

    fn ready(&self) -> Result<(&Server, &Arc<dyn ServerProvider>, &SecretString), String> {
        match (&self.server, &self.provider, &self.token) {
            (Some(server), Some(provider), Some(token)) => Ok((server, provider, token)),
            _ => Err("server was not validated".to_string()),
        }
    }

    async fn validate(&mut self) -> Result<String, String> {
        let server_id = self
            .job
            .server_id
            .ok_or_else(|| "server_id is required for provision_server job".to_string())?;
        let server = self
            .exec
            .servers
            .get_server(server_id)
            .await
            .map_err(|e| format!("server not found: {}", e))?;
        let record = self
            .exec
            .providers
            .get_provider(server.provider_id)
            .await
            .map_err(|e| format!("provider not found: {}", e))?;
        let provider = self
            .exec
            .registry
            .get(&record.provider_type)
            .ok_or_else(|| format!("provider {} does not support server provisioning", record.provider_type))?;
        if record.api_token.expose_secret().trim().is_empty() {
            return Err("provider token is required for provisioning".to_string());
        }

        self.server = Some(server);
        self.provider = Some(provider);
        self.token = Some(record.api_token);
        Ok("Server configuration validated".to_string())
    }

    async fn create_ssh_key(&mut self) -> Result<String, String> {
        let (server, provider, token) = self.ready()?;
        let key_name = ssh_key_name(server.id);
        let servers = &self.exec.servers;

        let public_key = match servers
            .get_server_key(server.id)
            .await
            .map_err(|e| format!("failed to read SSH key: {}", e))?
        {
            Some(stored) => stored.public_key,
            None => {
                let (public_key, private_pem) = generate_ssh_keypair(&key_name)?;
                let sealed = self
                    .exec
                    .envelope
                    .encrypt(private_pem.as_bytes())
                    .map_err(|e| format!("failed to encrypt SSH key: {}", e))?;
                let key = ServerKey {
                    server_id: server.id,
                    public_key,
                    private_key_encrypted: sealed,
                    encryption_key_id: self.exec.envelope.key_id().to_string(),
                    created_at: Utc::now(),
                };
                match servers.insert_server_key(&key).await {
                    Ok(()) => key.public_key,
                    // Lost a race with another writer: use theirs.
                    Err(DatabaseError::Constraint(_)) => servers
                        .get_server_key(server.id)
                        .await
                        .map_err(|e| format!("failed to read existing SSH key: {}", e))?
                        .map(|k| k.public_key)
                        .ok_or_else(|| "failed to store SSH key".to_string())?,
                    Err(e) => return Err(format!("failed to store SSH key: {}", e)),
                }
            }
        };

        let message = match provider.create_ssh_key(token, &key_name, &public_key).await {
            Ok(registered) => format!("SSH key registered: {}", registered.fingerprint),
            Err(ProviderError::Conflict(_)) => "SSH key already registered".to_string(),
            Err(e) => return Err(format!("failed to register SSH key: {}", e)),
        };
        tracing::debug!(server_id = server.id, key = %key_name, "SSH key ready");
        Ok(message)
    }

    async fn create_server(&mut self) -> Result<String, String> {
        let (server, provider, token) = self.ready()?;
        let mut labels = BTreeMap::new();
        labels.insert("managed-by".to_string(), "fleetplane".to_string());
        labels.insert("server-id".to_string(), server.id.to_string());
        let request = CreateServerRequest {
            name: server.name.clone(),
            location: server.location.clone(),
            server_type: server.server_type.clone(),
            image: server.image.clone(),
            ssh_keys: vec![ssh_key_name(server.id)],
            user_data: None,
            labels,
        };

        let created = provider
            .create_server(token, &request)
            .await
            .map_err(|e| format!("failed to create server: {}", e))?;

        let update = ProvisioningUpdate {
            provider_server_id: Some(created.provider_server_id.clone()),
            action_id: created.action_id.clone(),
            action_status: Some(created.status.clone()),
            status: status::PROVISIONING.to_string(),
            ipv4: None,
            ipv6: None,
        };
        if let Err(e) = self.exec.servers.update_provisioning(server.id, &update).await {
            tracing::error!(server_id = server.id, error = %e, "Failed to record provisioning state");
        }

        let message = format!("Server created: {}", created.provider_server_id);
        self.provider_server_id = Some(created.provider_server_id);
        Ok(message)
    }

    /// Poll the provider until the server reports `running`.
    async fn wait_running(&mut self) -> Result<String, String> {
        let (server, provider, token) = self.ready()?;
        let provider_server_id = self
            .provider_server_id
            .clone()
            .ok_or_else(|| "server was not created".to_string())?;
        let config = &self.exec.provision;
        let deadline = Instant::now() + config.wait_running_timeout;

        let info = loop {
            let info = provider
                .get_server(token, &provider_server_id)
                .await
                .map_err(|e| format!("failed to poll server status: {}", e))?;
            if info.is_running() {
                break info;
            }
            if Instant::now() + config.wait_running_interval > deadline {
                return Err(format!(
                    "server did not reach running within {}s (last status: {})",
                    config.wait_running_timeout.as_secs(),
                    info.status
                ));
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err("cancelled while waiting for server to boot".to_string());
                }
                _ = tokio::time::sleep(config.wait_running_interval) => {}
            }
        };

        let update = ProvisioningUpdate {
            provider_server_id: Some(provider_server_id),
            action_id: None,
            action_status: Some(info.status.clone()),
            status: status::PROVISIONING.to_string(),
            ipv4: info.ipv4.clone(),
            ipv6: info.ipv6.clone(),
        };
        if let Err(e) = self.exec.servers.update_provisioning(server.id, &update).await {
            tracing::error!(server_id = server.id, error = %e, "Failed to record server addresses");
        }
        Ok(match info.ipv4 {
            Some(ip) => format!("Server is running at {}", ip),
            None => "Server is running".to_string(),
        })
    }

    async fn finalize(&mut self) -> Result<String, String> {
        let (server, _, _) = self.ready()?;
        if let Err(e) = self.exec.servers.update_server_status(server.id, status::READY).await {
            tracing::error!(server_id = server.id, error = %e, "Failed to mark server ready");
        }
        Ok("Server provisioning complete".to_string())
    }
}
