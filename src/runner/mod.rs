//! External convergence runner.
//!
//! A runner takes a playbook request, executes it through an external
//! process and reports progress as [`Event`]s to an [`EventSink`]. The only
//! backend is [`ansible::AnsibleRunner`].

pub mod ansible;
pub mod process;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::RunnerError;
use crate::orchestrator::EventLevel;

pub use ansible::AnsibleRunner;

/// One playbook execution.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Job the run belongs to, for logging. Zero for queued tasks.
    pub job_id: i64,
    pub inventory_path: PathBuf,
    pub playbook_path: PathBuf,
    /// Sorted so argument order is deterministic.
    pub extra_vars: BTreeMap<String, String>,
    pub check_only: bool,
    /// Apply even when the runner's apply switch is off. Set by queued
    /// tasks, which settle on the run's result and cannot accept a
    /// syntax-check-only pass.
    pub force_apply: bool,
    pub timeout: Option<Duration>,
}

/// Runner lifecycle event (`runner_preflight`, `runner_step`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: String,
    pub level: EventLevel,
    pub step_key: Option<String>,
    pub message: String,
    pub payload: Option<String>,
}

impl Event {
    pub fn new(event_type: &str, level: EventLevel, message: impl Into<String>) -> Self {
        Self {
            event_type: event_type.to_string(),
            level,
            step_key: None,
            message: message.into(),
            payload: None,
        }
    }

    pub fn step(mut self, step_key: &str) -> Self {
        self.step_key = Some(step_key.to_string());
        self
    }

    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// Receives runner events. Emission is best-effort.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event);
}

/// Sink that drops everything.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn emit(&self, _event: Event) {}
}

/// Executes a request with a backend-specific adapter.
#[async_trait]
pub trait Runner: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(
        &self,
        request: &Request,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<(), RunnerError>;
}
