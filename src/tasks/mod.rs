//! Queued tasks: long-running external-process work with attempt
//! accounting, retry backoff and error classification.
//!
//! Tasks live in their own text-id table (`task_jobs`), separate from the
//! orchestration jobs driven by the worker pool.

mod runner;
pub mod site_import;

pub use runner::{Outcome, TaskFailure, TaskHandler, TaskRunner};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::TaskStore;
use crate::error::{RunnerError, TaskError};

/// Default attempt budget for new tasks.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Stored error messages keep at most this many trailing bytes.
pub const MAX_ERROR_MESSAGE_BYTES: usize = 10 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// A row of the queued-task table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskJob {
    pub id: String,
    pub job_type: String,
    pub status: TaskStatus,
    pub site_id: Option<String>,
    pub environment_id: Option<String>,
    pub node_id: Option<String>,
    pub payload: serde_json::Value,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub run_after: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskJob {
    /// A freshly queued row for `task`.
    pub fn queued(task: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id: task_id(&task.job_type, now),
            job_type: task.job_type,
            status: TaskStatus::Queued,
            site_id: task.site_id,
            environment_id: task.environment_id,
            node_id: task.node_id,
            payload: task.payload,
            attempt_count: 0,
            max_attempts: task.max_attempts,
            run_after: None,
            locked_at: None,
            locked_by: None,
            started_at: None,
            finished_at: None,
            error_code: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Input for enqueueing a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub job_type: String,
    pub site_id: Option<String>,
    pub environment_id: Option<String>,
    pub node_id: Option<String>,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
}

impl NewTask {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            site_id: None,
            environment_id: None,
            node_id: None,
            payload,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn for_site(mut self, site_id: &str, environment_id: &str) -> Self {
        self.site_id = Some(site_id.to_string());
        self.environment_id = Some(environment_id.to_string());
        self
    }

    pub fn on_node(mut self, node_id: &str) -> Self {
        self.node_id = Some(node_id.to_string());
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub(crate) fn normalized(self) -> Result<Self, TaskError> {
        let job_type = self.job_type.trim().to_string();
        if job_type.is_empty() {
            return Err(TaskError::Validation("job_type is required".to_string()));
        }
        let trim_opt = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        Ok(Self {
            job_type,
            site_id: trim_opt(self.site_id),
            environment_id: trim_opt(self.environment_id),
            node_id: trim_opt(self.node_id),
            payload: if self.payload.is_null() {
                serde_json::json!({})
            } else {
                self.payload
            },
            max_attempts: if self.max_attempts <= 0 {
                DEFAULT_MAX_ATTEMPTS
            } else {
                self.max_attempts
            },
        })
    }

    /// Conflict message if `active` targets the same site or node.
    pub(crate) fn conflict_with(&self, active: &TaskJob) -> Option<String> {
        if !active.status.is_active() {
            return None;
        }
        if self.site_id.is_some() && self.site_id == active.site_id {
            return Some(format!(
                "site {} already has active job {}",
                self.site_id.as_deref().unwrap_or_default(),
                active.id
            ));
        }
        if self.node_id.is_some() && self.node_id == active.node_id {
            return Some(format!(
                "node {} already has active job {}",
                self.node_id.as_deref().unwrap_or_default(),
                active.id
            ));
        }
        None
    }
}

/// Text id of the form `job_<type>_<unix nanos>`.
pub fn task_id(job_type: &str, now: DateTime<Utc>) -> String {
    let nanos = now
        .timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1000));
    format!("job_{}_{}", job_type, nanos)
}

/// Locked site-import task with its resolved inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteImport {
    pub job_id: String,
    pub site_id: String,
    pub environment_id: String,
    pub node_id: String,
    pub release_id: String,
    pub archive_url: String,
    pub target_url: String,
    pub hostname: String,
    pub attempt_count: i32,
    pub max_attempts: i32,
}

/// A hosted site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub name: String,
    pub status: String,
    pub state_version: i64,
}

/// A deployment environment of a site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub site_id: String,
    pub status: String,
    pub current_release_id: Option<String>,
    pub state_version: i64,
}

/// A managed node that runs site workloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub hostname: String,
}

/// Classified runner failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Timeout,
    PlayError,
    HostFailed,
    HostUnreachable,
    SyntaxError,
    UnexpectedError,
    UnknownExit,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::PlayError => "PLAY_ERROR",
            ErrorCode::HostFailed => "HOST_FAILED",
            ErrorCode::HostUnreachable => "HOST_UNREACHABLE",
            ErrorCode::SyntaxError => "SYNTAX_ERROR",
            ErrorCode::UnexpectedError => "UNEXPECTED_ERROR",
            ErrorCode::UnknownExit => "UNKNOWN_EXIT",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::PlayError | ErrorCode::HostFailed | ErrorCode::HostUnreachable
        )
    }

    /// Map a process exit code.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            1 => ErrorCode::PlayError,
            2 => ErrorCode::HostFailed,
            4 => ErrorCode::HostUnreachable,
            5 => ErrorCode::SyntaxError,
            250 => ErrorCode::UnexpectedError,
            _ => ErrorCode::UnknownExit,
        }
    }

    /// Classify a runner error.
    pub fn classify(err: &RunnerError) -> Self {
        match err {
            RunnerError::Timeout(_) | RunnerError::Cancelled => ErrorCode::Timeout,
            RunnerError::Exit { code, .. } => ErrorCode::from_exit_code(*code),
            RunnerError::Signaled { .. } => ErrorCode::UnknownExit,
            _ => ErrorCode::UnexpectedError,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay before retry number `attempt_count + 1`.
pub fn retry_backoff(attempt_count: i32) -> Duration {
    match attempt_count {
        1 => Duration::from_secs(60),
        2 => Duration::from_secs(5 * 60),
        _ => Duration::from_secs(15 * 60),
    }
}

/// Prefer the process output, fall back to the error text, and keep only
/// the trailing [`MAX_ERROR_MESSAGE_BYTES`].
pub fn truncate_error_message(output: &str, fallback: &str) -> String {
    let trimmed = output.trim();
    let message = if trimmed.is_empty() { fallback.trim() } else { trimmed };
    if message.len() <= MAX_ERROR_MESSAGE_BYTES {
        return message.to_string();
    }
    let mut start = message.len() - MAX_ERROR_MESSAGE_BYTES;
    while !message.is_char_boundary(start) {
        start += 1;
    }
    message[start..].to_string()
}

/// Enqueue, inspect and cancel queued tasks.
#[derive(Clone)]
pub struct TaskService {
    store: Arc<dyn TaskStore>,
}

impl TaskService {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub async fn enqueue(&self, task: NewTask) -> Result<TaskJob, TaskError> {
        let task = task.normalized()?;
        let job = self.store.enqueue_task(task).await?;
        tracing::info!(task_id = %job.id, job_type = %job.job_type, "Task enqueued");
        Ok(job)
    }

    pub async fn get(&self, id: &str) -> Result<TaskJob, TaskError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(TaskError::Validation("task id is required".to_string()));
        }
        self.store.get_task(id).await
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<TaskJob>, TaskError> {
        let limit = if limit == 0 { 50 } else { limit.min(200) };
        self.store.list_tasks(limit).await
    }

    pub async fn cancel(&self, id: &str) -> Result<TaskJob, TaskError> {
        let job = self.store.cancel_task(id.trim(), Utc::now()).await?;
        tracing::info!(task_id = %job.id, "Task cancelled");
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;

    #[test]
    fn test_exit_code_classification() {
        let cases = [
            (1, "PLAY_ERROR", true),
            (2, "HOST_FAILED", true),
            (4, "HOST_UNREACHABLE", true),
            (5, "SYNTAX_ERROR", false),
            (250, "UNEXPECTED_ERROR", false),
            (3, "UNKNOWN_EXIT", false),
            (137, "UNKNOWN_EXIT", false),
        ];
        for (code, name, retryable) in cases {
            let classified = ErrorCode::from_exit_code(code);
            assert_eq!(classified.as_str(), name, "exit {}", code);
            assert_eq!(classified.is_retryable(), retryable, "exit {}", code);
        }
    }

    #[test]
    fn test_timeout_is_not_retryable() {
        let code = ErrorCode::classify(&RunnerError::Timeout(Duration::from_secs(1)));
        assert_eq!(code, ErrorCode::Timeout);
        assert!(!code.is_retryable());
        assert_eq!(ErrorCode::classify(&RunnerError::Cancelled), ErrorCode::Timeout);
    }

    #[test]
    fn test_backoff_staircase() {
        assert_eq!(retry_backoff(1), Duration::from_secs(60));
        assert_eq!(retry_backoff(2), Duration::from_secs(300));
        assert_eq!(retry_backoff(3), Duration::from_secs(900));
        assert_eq!(retry_backoff(9), Duration::from_secs(900));
    }

    #[test]
    fn test_truncate_keeps_tail() {
        let long = format!("{}TAIL", "x".repeat(MAX_ERROR_MESSAGE_BYTES));
        let out = truncate_error_message(&long, "unused");
        assert_eq!(out.len(), MAX_ERROR_MESSAGE_BYTES);
        assert!(out.ends_with("TAIL"));

        assert_eq!(truncate_error_message("   ", "exit status 2"), "exit status 2");
        assert_eq!(truncate_error_message(" host failed\n", "x"), "host failed");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_MESSAGE_BYTES);
        let out = truncate_error_message(&long, "");
        assert!(out.len() <= MAX_ERROR_MESSAGE_BYTES);
        assert!(out.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_task_id_format() {
        let now = Utc::now();
        let id = task_id("site_import", now);
        assert!(id.starts_with("job_site_import_"));
    }

    #[tokio::test]
    async fn test_enqueue_defaults_and_conflicts() {
        let store = Arc::new(MemoryStore::new());
        let service = TaskService::new(store);

        let first = service
            .enqueue(
                NewTask::new("site_import", serde_json::json!({}))
                    .for_site("site_1", "env_1")
                    .on_node("node_1")
                    .max_attempts(0),
            )
            .await
            .unwrap();
        assert_eq!(first.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(first.status, TaskStatus::Queued);

        let err = service
            .enqueue(NewTask::new("site_import", serde_json::json!({})).on_node("node_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Conflict(_)));

        service.cancel(&first.id).await.unwrap();
        service
            .enqueue(NewTask::new("site_import", serde_json::json!({})).on_node("node_1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_only_active() {
        let store = Arc::new(MemoryStore::new());
        let service = TaskService::new(store);
        let job = service
            .enqueue(NewTask::new("node_provision", serde_json::json!({})))
            .await
            .unwrap();

        let cancelled = service.cancel(&job.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.finished_at.is_some());

        let err = service.cancel(&job.id).await.unwrap_err();
        assert!(matches!(err, TaskError::NotCancellable { .. }));
        assert!(matches!(
            service.cancel("job_missing").await,
            Err(TaskError::NotFound(_))
        ));
    }
}
