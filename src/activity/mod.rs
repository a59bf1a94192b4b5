//! User-visible activity feed.
//!
//! Rows are projected from system events (job lifecycle, node status changes,
//! agent log lines) and consumed by the dashboard through paginated reads and
//! a polling SSE stream. Emission from background paths is best-effort: a
//! failed write is logged and the caller carries on.

mod types;

pub use types::*;

use std::sync::Arc;

use async_trait::async_trait;

use crate::db::ActivityStore;
use crate::error::ActivityError;
use crate::orchestrator::{Job, kind_label};

/// Best-effort recorder for per-server actions.
#[async_trait]
pub trait ActivityLogger: Send + Sync {
    async fn log(&self, server_id: i64, action: &str, details: &str);
}

/// Activity emission used by background components.
#[derive(Clone)]
pub struct ActivityLog {
    store: Arc<dyn ActivityStore>,
}

impl ActivityLog {
    pub fn new(store: Arc<dyn ActivityStore>) -> Self {
        Self { store }
    }

    /// Emit and surface the error to the caller.
    pub async fn try_emit(&self, input: EmitInput) -> Result<Activity, ActivityError> {
        self.store.emit(input).await
    }

    /// Emit, logging and swallowing any failure.
    pub async fn emit(&self, input: EmitInput) -> Option<Activity> {
        let event_type = input.event_type.clone();
        match self.store.emit(input).await {
            Ok(activity) => Some(activity),
            Err(e) => {
                tracing::error!(event_type = %event_type, error = %e, "Failed to record activity");
                None
            }
        }
    }
}

/// Lifecycle row for `job`, parented to its server. Failures require
/// attention.
pub fn job_lifecycle(event_type: EventType, job: &Job) -> EmitInput {
    let (level, verb) = match event_type {
        EventType::JobCreated => (Level::Info, "job queued"),
        EventType::JobStarted => (Level::Info, "started"),
        EventType::JobCompleted => (Level::Success, "completed"),
        EventType::JobFailed => (Level::Error, "failed"),
        EventType::JobCancelled => (Level::Warning, "cancelled"),
        _ => (Level::Info, "updated"),
    };
    let input = EmitInput::new(event_type, level, format!("{} {}", kind_label(&job.kind), verb))
        .resource(ResourceRef::job(job.id))
        .parent(job.server_id.map(ResourceRef::server));
    if event_type == EventType::JobFailed {
        input.attention()
    } else {
        input
    }
}

#[async_trait]
impl ActivityLogger for ActivityLog {
    async fn log(&self, server_id: i64, action: &str, details: &str) {
        let mut input = EmitInput::new(EventType::ServerStatusChanged, Level::Info, action)
            .resource(ResourceRef::server(server_id));
        if !details.trim().is_empty() {
            input = input.message(details);
        }
        self.emit(input).await;
    }
}
