//! Cloud provider capability.
//!
//! The executor only talks to providers through [`ServerProvider`] and only
//! reasons about the closed [`ProviderError`] set, never transport details.
//! Implementations are looked up by type tag in a [`ProviderRegistry`] that
//! is built once at startup.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ProviderError};

/// Provider status string for a booted server.
pub const STATUS_RUNNING: &str = "running";

/// A region/location option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerLocation {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
}

/// A provisionable server size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerTypeOption {
    pub name: String,
    pub description: String,
    pub cores: u32,
    pub memory_gb: f64,
    pub disk_gb: u32,
    pub architecture: String,
    #[serde(default)]
    pub available_at: Vec<String>,
}

/// Everything needed to offer a guided create-server form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCatalog {
    pub locations: Vec<ServerLocation>,
    pub server_types: Vec<ServerTypeOption>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub location: String,
    pub server_type: String,
    pub image: String,
    /// Provider-side SSH key names to install for root.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Identifiers needed to track an asynchronous create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateServerResult {
    pub provider_server_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshKeyResult {
    pub id: i64,
    pub name: String,
    pub fingerprint: String,
}

/// Current provider-side view of a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub provider_server_id: String,
    pub status: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
}

impl ServerInfo {
    pub fn is_running(&self) -> bool {
        self.status == STATUS_RUNNING
    }
}

/// Server lifecycle operations of one cloud provider.
#[async_trait]
pub trait ServerProvider: Send + Sync {
    /// Registry tag, e.g. `hetzner`.
    fn provider_type(&self) -> &'static str;

    async fn list_server_catalog(&self, token: &SecretString) -> Result<ServerCatalog, ProviderError>;

    async fn create_server(
        &self,
        token: &SecretString,
        request: &CreateServerRequest,
    ) -> Result<CreateServerResult, ProviderError>;

    async fn create_ssh_key(
        &self,
        token: &SecretString,
        name: &str,
        public_key: &str,
    ) -> Result<SshKeyResult, ProviderError>;

    async fn get_server(
        &self,
        token: &SecretString,
        provider_server_id: &str,
    ) -> Result<ServerInfo, ProviderError>;
}

/// Write-once lookup of providers by type tag.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<&'static str, Arc<dyn ServerProvider>>,
}

impl ProviderRegistry {
    /// Build the registry. Two providers with the same tag are a
    /// configuration error.
    pub fn new(providers: Vec<Arc<dyn ServerProvider>>) -> Result<Self, ConfigError> {
        let mut map: HashMap<&'static str, Arc<dyn ServerProvider>> = HashMap::new();
        for provider in providers {
            let tag = provider.provider_type();
            if map.insert(tag, provider).is_some() {
                return Err(ConfigError::Invalid {
                    key: "providers",
                    message: format!("provider {:?} registered twice", tag),
                });
            }
            tracing::debug!(provider = tag, "Registered server provider");
        }
        Ok(Self { providers: map })
    }

    pub fn get(&self, provider_type: &str) -> Option<Arc<dyn ServerProvider>> {
        self.providers.get(provider_type).cloned()
    }

    /// Registered tags, sorted.
    pub fn types(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.providers.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Scriptable in-memory provider.
    pub(crate) struct FakeProvider {
        pub tag: &'static str,
        pub create_server_error: Mutex<Option<ProviderError>>,
        pub ssh_key_error: Mutex<Option<ProviderError>>,
        /// Statuses returned by successive `get_server` calls; the last one repeats.
        pub statuses: Mutex<VecDeque<String>>,
        pub ssh_keys: Mutex<Vec<(String, String)>>,
        pub created: Mutex<Vec<CreateServerRequest>>,
        pub polls: Mutex<usize>,
    }

    impl FakeProvider {
        pub fn new(tag: &'static str) -> Self {
            Self {
                tag,
                create_server_error: Mutex::new(None),
                ssh_key_error: Mutex::new(None),
                statuses: Mutex::new(VecDeque::from(vec![STATUS_RUNNING.to_string()])),
                ssh_keys: Mutex::new(Vec::new()),
                created: Mutex::new(Vec::new()),
                polls: Mutex::new(0),
            }
        }

        pub fn with_statuses(self, statuses: &[&str]) -> Self {
            *self.statuses.lock().unwrap() = statuses.iter().map(|s| s.to_string()).collect();
            self
        }

        pub fn failing_create(self, err: ProviderError) -> Self {
            *self.create_server_error.lock().unwrap() = Some(err);
            self
        }
    }

    #[async_trait]
    impl ServerProvider for FakeProvider {
        fn provider_type(&self) -> &'static str {
            self.tag
        }

        async fn list_server_catalog(&self, _token: &SecretString) -> Result<ServerCatalog, ProviderError> {
            Ok(ServerCatalog {
                locations: vec![ServerLocation {
                    name: "fsn1".to_string(),
                    description: "Falkenstein".to_string(),
                    country: Some("DE".to_string()),
                    city: None,
                }],
                server_types: Vec::new(),
            })
        }

        async fn create_server(
            &self,
            _token: &SecretString,
            request: &CreateServerRequest,
        ) -> Result<CreateServerResult, ProviderError> {
            if let Some(err) = self.create_server_error.lock().unwrap().clone() {
                return Err(err);
            }
            let mut created = self.created.lock().unwrap();
            created.push(request.clone());
            Ok(CreateServerResult {
                provider_server_id: format!("{}", 1000 + created.len()),
                action_id: Some("action-1".to_string()),
                status: "initializing".to_string(),
            })
        }

        async fn create_ssh_key(
            &self,
            _token: &SecretString,
            name: &str,
            public_key: &str,
        ) -> Result<SshKeyResult, ProviderError> {
            if let Some(err) = self.ssh_key_error.lock().unwrap().clone() {
                return Err(err);
            }
            let mut keys = self.ssh_keys.lock().unwrap();
            keys.push((name.to_string(), public_key.to_string()));
            Ok(SshKeyResult {
                id: keys.len() as i64,
                name: name.to_string(),
                fingerprint: "aa:bb".to_string(),
            })
        }

        async fn get_server(
            &self,
            _token: &SecretString,
            provider_server_id: &str,
        ) -> Result<ServerInfo, ProviderError> {
            *self.polls.lock().unwrap() += 1;
            let mut statuses = self.statuses.lock().unwrap();
            let status = if statuses.len() > 1 {
                statuses.pop_front().unwrap_or_default()
            } else {
                statuses.front().cloned().unwrap_or_default()
            };
            let running = status == STATUS_RUNNING;
            Ok(ServerInfo {
                provider_server_id: provider_server_id.to_string(),
                status,
                ipv4: running.then(|| "203.0.113.10".to_string()),
                ipv6: running.then(|| "2001:db8::10".to_string()),
            })
        }
    }
}
