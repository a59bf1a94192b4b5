//! `site_import` tasks: run the import playbook against the site's node,
//! then flip the environment and site to `active` (or `failed`) in the same
//! transaction that settles the task.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::db::TaskStore;
use crate::error::DatabaseError;
use crate::pki::write_secret_file;
use crate::runner::{Event, EventSink, Request, Runner};
use crate::tasks::{SiteImport, TaskFailure, TaskHandler, TaskJob};

pub const JOB_TYPE: &str = "site_import";

#[derive(Debug, Default, Deserialize)]
struct Payload {
    #[serde(default)]
    release_id: String,
    #[serde(default)]
    archive_url: String,
    #[serde(default)]
    target_url: String,
}

/// Inventory with a single `target` host that runs locally.
pub(crate) fn inventory(hostname: &str) -> String {
    let host = match hostname.trim() {
        "" => "localhost",
        host => host,
    };
    format!("[target]\n{} ansible_connection=local\n", host)
}

impl SiteImport {
    /// Resolve the import inputs from a locked task. `hostname` is left
    /// empty; it comes from the node row.
    pub fn from_task(task: &TaskJob) -> Result<Self, String> {
        let payload: Payload = serde_json::from_value(task.payload.clone())
            .map_err(|e| format!("decode site_import payload: {}", e))?;
        let required = |field: &Option<String>, name: &str| {
            field
                .clone()
                .ok_or_else(|| format!("site_import job {} has no {}", task.id, name))
        };
        Ok(Self {
            job_id: task.id.clone(),
            site_id: required(&task.site_id, "site_id")?,
            environment_id: required(&task.environment_id, "environment_id")?,
            node_id: required(&task.node_id, "node_id")?,
            release_id: payload.release_id.trim().to_string(),
            archive_url: payload.archive_url.trim().to_string(),
            target_url: payload.target_url.trim().to_string(),
            hostname: String::new(),
            attempt_count: task.attempt_count,
            max_attempts: task.max_attempts,
        })
    }

    fn extra_vars(&self) -> BTreeMap<String, String> {
        [
            ("site_id", &self.site_id),
            ("environment_id", &self.environment_id),
            ("node_id", &self.node_id),
            ("archive_url", &self.archive_url),
            ("release_id", &self.release_id),
            ("target_url", &self.target_url),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
    }
}

/// Runner events of a queued task only go to the log.
struct LogSink<'a> {
    task_id: &'a str,
}

#[async_trait]
impl EventSink for LogSink<'_> {
    async fn emit(&self, event: Event) {
        tracing::debug!(
            task_id = %self.task_id,
            event_type = %event.event_type,
            step = ?event.step_key,
            "{}",
            event.message
        );
    }
}

pub struct SiteImportHandler {
    store: Arc<dyn TaskStore>,
    runner: Arc<dyn Runner>,
    playbook: PathBuf,
    timeout: Duration,
}

impl SiteImportHandler {
    pub fn new(store: Arc<dyn TaskStore>, runner: Arc<dyn Runner>, playbook: PathBuf, timeout: Duration) -> Self {
        Self {
            store,
            runner,
            playbook,
            timeout,
        }
    }
}

#[async_trait]
impl TaskHandler for SiteImportHandler {
    fn job_type(&self) -> &'static str {
        JOB_TYPE
    }

    async fn run(&self, task: &TaskJob, cancel: &CancellationToken) -> Result<(), TaskFailure> {
        let mut import = SiteImport::from_task(task).map_err(TaskFailure::unexpected)?;
        import.hostname = self
            .store
            .node_hostname(&import.node_id)
            .await
            .map_err(|e| TaskFailure::unexpected(e.to_string()))?
            .ok_or_else(|| TaskFailure::unexpected(format!("node {} not found", import.node_id)))?;

        let workspace = tempfile::Builder::new()
            .prefix("fleetplane-inventory-")
            .tempdir()
            .map_err(|e| TaskFailure::unexpected(format!("create temp inventory: {}", e)))?;
        let inventory_path = workspace.path().join("inventory.ini");
        write_secret_file(&inventory_path, inventory(&import.hostname).as_bytes())
            .map_err(|e| TaskFailure::unexpected(format!("write inventory: {}", e)))?;

        let request = Request {
            inventory_path,
            playbook_path: self.playbook.clone(),
            extra_vars: import.extra_vars(),
            force_apply: true,
            timeout: Some(self.timeout),
            ..Request::default()
        };
        tracing::info!(
            task_id = %task.id,
            site_id = %import.site_id,
            hostname = %import.hostname,
            attempt = import.attempt_count,
            "Running site import"
        );
        let sink = LogSink { task_id: &task.id };
        self.runner.run(&request, &sink, cancel).await?;
        Ok(())
    }

    async fn on_success(
        &self,
        store: &dyn TaskStore,
        task: &TaskJob,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let worker_id = self.worker_id();
        match SiteImport::from_task(task) {
            Ok(import) => store.complete_site_import(&import, &worker_id, now).await,
            Err(_) => store.succeed_task(&task.id, &worker_id, now).await,
        }
    }

    async fn on_failure(
        &self,
        store: &dyn TaskStore,
        task: &TaskJob,
        failure: &TaskFailure,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let worker_id = self.worker_id();
        let code = failure.code.as_str();
        match SiteImport::from_task(task) {
            Ok(import) => {
                store
                    .fail_site_import(&import, &worker_id, code, &failure.message, now)
                    .await
            }
            // Without site ids there are no business rows to mark.
            Err(_) => {
                store
                    .fail_task(&task.id, &worker_id, code, &failure.message, now)
                    .await
            }
        }
    }
}
