//! Server, provider and SSH key records consumed by the executor.
//!
//! These rows are owned by the wider application; the control plane only
//! reads them and updates status and provisioning fields.

use std::fmt;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Node status values written by the control plane.
pub mod status {
    pub const PROVISIONING: &str = "provisioning";
    pub const READY: &str = "ready";
    pub const FAILED: &str = "failed";
    pub const UNHEALTHY: &str = "unhealthy";
    pub const OFFLINE: &str = "offline";
}

/// A managed server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: i64,
    pub provider_id: i64,
    pub name: String,
    pub location: String,
    pub server_type: String,
    pub image: String,
    pub status: String,
    pub provider_server_id: Option<String>,
    pub action_id: Option<String>,
    pub action_status: Option<String>,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
}

/// Provisioning fields written after a provider call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisioningUpdate {
    pub provider_server_id: Option<String>,
    pub action_id: Option<String>,
    pub action_status: Option<String>,
    pub status: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
}

/// A cloud provider account.
#[derive(Clone)]
pub struct ProviderRecord {
    pub id: i64,
    /// Registry tag, e.g. `hetzner`.
    pub provider_type: String,
    pub name: String,
    pub api_token: SecretString,
}

impl fmt::Debug for ProviderRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRecord")
            .field("id", &self.id)
            .field("provider_type", &self.provider_type)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Per-server SSH keypair; the private half is envelope-encrypted.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerKey {
    pub server_id: i64,
    pub public_key: String,
    pub private_key_encrypted: String,
    pub encryption_key_id: String,
    pub created_at: DateTime<Utc>,
}
