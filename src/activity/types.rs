use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ActivityError;

pub use crate::orchestrator::EventLevel as Level;

/// Closed set of activity event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "job.created")]
    JobCreated,
    #[serde(rename = "job.started")]
    JobStarted,
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "job.failed")]
    JobFailed,
    #[serde(rename = "job.cancelled")]
    JobCancelled,
    #[serde(rename = "server.created")]
    ServerCreated,
    #[serde(rename = "server.provisioned")]
    ServerProvisioned,
    #[serde(rename = "server.deleted")]
    ServerDeleted,
    #[serde(rename = "server.status_changed")]
    ServerStatusChanged,
    #[serde(rename = "provider.added")]
    ProviderAdded,
    #[serde(rename = "provider.updated")]
    ProviderUpdated,
    #[serde(rename = "provider.removed")]
    ProviderRemoved,
    #[serde(rename = "site.created")]
    SiteCreated,
    #[serde(rename = "site.deployed")]
    SiteDeployed,
    #[serde(rename = "site.deleted")]
    SiteDeleted,
    #[serde(rename = "account.settings_changed")]
    AccountSettingsChanged,
    #[serde(rename = "security.api_key_created")]
    SecurityApiKeyCreated,
    #[serde(rename = "security.api_key_revoked")]
    SecurityApiKeyRevoked,
}

impl EventType {
    pub const ALL: &'static [EventType] = &[
        EventType::JobCreated,
        EventType::JobStarted,
        EventType::JobCompleted,
        EventType::JobFailed,
        EventType::JobCancelled,
        EventType::ServerCreated,
        EventType::ServerProvisioned,
        EventType::ServerDeleted,
        EventType::ServerStatusChanged,
        EventType::ProviderAdded,
        EventType::ProviderUpdated,
        EventType::ProviderRemoved,
        EventType::SiteCreated,
        EventType::SiteDeployed,
        EventType::SiteDeleted,
        EventType::AccountSettingsChanged,
        EventType::SecurityApiKeyCreated,
        EventType::SecurityApiKeyRevoked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::JobCreated => "job.created",
            EventType::JobStarted => "job.started",
            EventType::JobCompleted => "job.completed",
            EventType::JobFailed => "job.failed",
            EventType::JobCancelled => "job.cancelled",
            EventType::ServerCreated => "server.created",
            EventType::ServerProvisioned => "server.provisioned",
            EventType::ServerDeleted => "server.deleted",
            EventType::ServerStatusChanged => "server.status_changed",
            EventType::ProviderAdded => "provider.added",
            EventType::ProviderUpdated => "provider.updated",
            EventType::ProviderRemoved => "provider.removed",
            EventType::SiteCreated => "site.created",
            EventType::SiteDeployed => "site.deployed",
            EventType::SiteDeleted => "site.deleted",
            EventType::AccountSettingsChanged => "account.settings_changed",
            EventType::SecurityApiKeyCreated => "security.api_key_created",
            EventType::SecurityApiKeyRevoked => "security.api_key_revoked",
        }
    }

    /// Category implied by the event type prefix.
    pub fn category(&self) -> Category {
        match self.as_str().split('.').next() {
            Some("job") => Category::Job,
            Some("server") => Category::Server,
            Some("provider") => Category::Provider,
            Some("site") => Category::Site,
            Some("account") => Category::Account,
            _ => Category::Security,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ActivityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ActivityError::UnknownEventType(s.to_string()))
    }
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!(concat!("invalid ", stringify!($name), " '{}'"), other)),
                }
            }
        }
    };
}

string_enum!(
    /// Dashboard grouping of activity rows.
    Category {
        Job => "job",
        Server => "server",
        Provider => "provider",
        Site => "site",
        Account => "account",
        Security => "security",
    }
);

string_enum!(
    /// Who caused an activity.
    ActorType {
        System => "system",
        User => "user",
        Api => "api",
    }
);

string_enum!(
    /// Tag for polymorphic resource references.
    ResourceType {
        Job => "job",
        Server => "server",
        Provider => "provider",
        Site => "site",
        Account => "account",
        ApiKey => "api_key",
    }
);

/// A typed reference to any resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRef {
    pub kind: ResourceType,
    pub id: i64,
}

impl ResourceRef {
    pub fn job(id: i64) -> Self {
        Self { kind: ResourceType::Job, id }
    }

    pub fn server(id: i64) -> Self {
        Self { kind: ResourceType::Server, id }
    }
}

/// A denormalised notification row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: i64,
    pub event_type: EventType,
    pub category: Category,
    pub level: Level,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<ResourceType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_resource_type: Option<ResourceType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_resource_id: Option<i64>,
    pub actor_type: ActorType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub requires_attention: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Activity {
    /// True if the row is about `server_id` directly or as its parent.
    pub fn concerns_server(&self, server_id: i64) -> bool {
        (self.resource_type == Some(ResourceType::Server) && self.resource_id == Some(server_id))
            || (self.parent_resource_type == Some(ResourceType::Server)
                && self.parent_resource_id == Some(server_id))
    }
}

/// Input for [`ActivityStore::emit`](crate::db::ActivityStore::emit).
///
/// `event_type` stays a string until validation so that unknown types can be
/// rejected without a row ever being written.
#[derive(Debug, Clone)]
pub struct EmitInput {
    pub event_type: String,
    pub category: Category,
    pub level: Level,
    pub resource: Option<ResourceRef>,
    pub parent: Option<ResourceRef>,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub title: String,
    pub message: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub requires_attention: bool,
}

impl EmitInput {
    pub fn new(event_type: EventType, level: Level, title: impl Into<String>) -> Self {
        Self {
            event_type: event_type.as_str().to_string(),
            category: event_type.category(),
            level,
            resource: None,
            parent: None,
            actor_type: ActorType::System,
            actor_id: None,
            title: title.into(),
            message: None,
            payload: None,
            requires_attention: false,
        }
    }

    pub fn resource(mut self, resource: ResourceRef) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Set the parent reference; non-positive ids are ignored.
    pub fn parent(mut self, parent: Option<ResourceRef>) -> Self {
        self.parent = parent.filter(|r| r.id > 0);
        self
    }

    pub fn actor(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn attention(mut self) -> Self {
        self.requires_attention = true;
        self
    }

    /// Validate and resolve into the persisted shape (without id).
    pub fn validate(self) -> Result<ValidatedEmit, ActivityError> {
        let event_type: EventType = self.event_type.trim().parse()?;
        let title = self.title.trim().to_string();
        if title.is_empty() {
            return Err(ActivityError::Validation("title is required".to_string()));
        }
        let trim_opt = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        Ok(ValidatedEmit {
            event_type,
            category: self.category,
            level: self.level,
            resource: self.resource.filter(|r| r.id > 0),
            parent: self.parent.filter(|r| r.id > 0),
            actor_type: self.actor_type,
            actor_id: trim_opt(self.actor_id),
            title,
            message: trim_opt(self.message),
            payload: self.payload.filter(|p| !p.is_null()),
            requires_attention: self.requires_attention,
        })
    }
}

/// An [`EmitInput`] that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedEmit {
    pub event_type: EventType,
    pub category: Category,
    pub level: Level,
    pub resource: Option<ResourceRef>,
    pub parent: Option<ResourceRef>,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub title: String,
    pub message: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub requires_attention: bool,
}

impl ValidatedEmit {
    pub fn into_activity(self, id: i64, created_at: DateTime<Utc>) -> Activity {
        Activity {
            id,
            event_type: self.event_type,
            category: self.category,
            level: self.level,
            resource_type: self.resource.map(|r| r.kind),
            resource_id: self.resource.map(|r| r.id),
            parent_resource_type: self.parent.map(|r| r.kind),
            parent_resource_id: self.parent.map(|r| r.id),
            actor_type: self.actor_type,
            actor_id: self.actor_id,
            title: self.title,
            message: self.message,
            payload: self.payload,
            requires_attention: self.requires_attention,
            read_at: None,
            created_at,
        }
    }
}

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 200;
pub const DEFAULT_SINCE_LIMIT: usize = 100;

/// Filter for listing, counting and bulk-marking activity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListFilter {
    /// Return rows with `id < cursor`.
    pub cursor: Option<i64>,
    pub limit: usize,
    pub category: Option<Category>,
    pub resource_type: Option<ResourceType>,
    pub resource_id: Option<i64>,
    pub parent_resource_type: Option<ResourceType>,
    pub parent_resource_id: Option<i64>,
    pub requires_attention: Option<bool>,
    pub unread_only: bool,
}

impl ListFilter {
    /// Page size clamped to `1..=200`, defaulting to 50.
    pub fn effective_limit(&self) -> usize {
        match self.limit {
            0 => DEFAULT_LIST_LIMIT,
            n => n.min(MAX_LIST_LIMIT),
        }
    }

    fn matches_scope(&self, a: &Activity) -> bool {
        self.category.is_none_or(|c| a.category == c)
            && self.resource_type.is_none_or(|t| a.resource_type == Some(t))
            && self.resource_id.is_none_or(|id| a.resource_id == Some(id))
            && self
                .parent_resource_type
                .is_none_or(|t| a.parent_resource_type == Some(t))
            && self
                .parent_resource_id
                .is_none_or(|id| a.parent_resource_id == Some(id))
    }

    /// Row predicate used by list queries (cursor excluded).
    pub fn matches(&self, a: &Activity) -> bool {
        self.matches_scope(a)
            && self.requires_attention.is_none_or(|flag| a.requires_attention == flag)
            && (!self.unread_only || a.read_at.is_none())
    }

    /// Row predicate used by unread counting and bulk mark-read. Only a
    /// `requires_attention=true` filter narrows these.
    pub fn matches_unread(&self, a: &Activity) -> bool {
        a.read_at.is_none()
            && self.matches_scope(a)
            && (self.requires_attention != Some(true) || a.requires_attention)
    }
}

/// One page of activity, newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityPage {
    pub data: Vec<Activity>,
    /// Cursor for the next page; empty when this is the last page.
    #[serde(default)]
    pub next_cursor: String,
}

impl ActivityPage {
    /// Build a page from `limit + 1` fetched rows.
    pub fn from_overfetch(mut rows: Vec<Activity>, limit: usize) -> Self {
        let mut next_cursor = String::new();
        if rows.len() > limit {
            rows.truncate(limit);
            if let Some(last) = rows.last() {
                next_cursor = last.id.to_string();
            }
        }
        Self {
            data: rows,
            next_cursor,
        }
    }
}
