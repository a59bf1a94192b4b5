use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::db::TaskStore;
use crate::error::{DatabaseError, RunnerError};
use crate::tasks::{ErrorCode, TaskJob, retry_backoff, truncate_error_message};

/// Why a task run failed.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl TaskFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Failure before the external process ran.
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnexpectedError, message)
    }
}

impl From<RunnerError> for TaskFailure {
    fn from(err: RunnerError) -> Self {
        let fallback = err.to_string();
        Self {
            code: ErrorCode::classify(&err),
            message: truncate_error_message(err.output(), &fallback),
        }
    }
}

/// Executes one job type of the task queue.
///
/// The default success/failure writes only touch the task row. Handlers
/// with business-level post-conditions override them. Both return false
/// when the task is no longer locked by [`TaskHandler::worker_id`].
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn job_type(&self) -> &'static str;

    /// Written to `locked_by`.
    fn worker_id(&self) -> String {
        format!("worker-{}", self.job_type().replace('_', "-"))
    }

    async fn run(&self, task: &TaskJob, cancel: &CancellationToken) -> Result<(), TaskFailure>;

    async fn on_success(
        &self,
        store: &dyn TaskStore,
        task: &TaskJob,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        store.succeed_task(&task.id, &self.worker_id(), now).await
    }

    /// Terminal failure: not retryable, or out of attempts.
    async fn on_failure(
        &self,
        store: &dyn TaskStore,
        task: &TaskJob,
        failure: &TaskFailure,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        store
            .fail_task(&task.id, &self.worker_id(), failure.code.as_str(), &failure.message, now)
            .await
    }
}

/// What one execution step did with the task it locked.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded,
    Requeued { run_after: DateTime<Utc> },
    Failed,
    /// The task was cancelled or reclaimed while it ran; the result was
    /// dropped.
    LockLost,
}

/// Polls the task table for every registered handler.
pub struct TaskRunner {
    store: Arc<dyn TaskStore>,
    handlers: Vec<Arc<dyn TaskHandler>>,
    poll_interval: Duration,
}

impl TaskRunner {
    pub fn new(store: Arc<dyn TaskStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            handlers: Vec::new(),
            poll_interval,
        }
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        tracing::info!(job_type = handler.job_type(), "Registered task handler");
        self.handlers.push(handler);
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Poll until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        if self.handlers.is_empty() {
            tracing::info!("No task handlers registered, task runner idle");
            return;
        }
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Task runner shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    for handler in &self.handlers {
                        if let Err(e) = self.execute_next(handler.as_ref(), &shutdown).await {
                            tracing::error!(job_type = handler.job_type(), error = %e, "Task execution step failed");
                        }
                    }
                }
            }
        }
    }

    /// Lock, run and settle at most one task of the handler's type.
    pub async fn execute_next(
        &self,
        handler: &dyn TaskHandler,
        cancel: &CancellationToken,
    ) -> Result<Option<(TaskJob, Outcome)>, DatabaseError> {
        self.execute_next_at(handler, Utc::now(), cancel).await
    }

    /// `now` is the lock time. Settle writes and the retry delay are taken
    /// from when the run returned.
    pub(crate) async fn execute_next_at(
        &self,
        handler: &dyn TaskHandler,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Option<(TaskJob, Outcome)>, DatabaseError> {
        let worker_id = handler.worker_id();
        let Some(task) = self
            .store
            .lock_next_task(handler.job_type(), &worker_id, now)
            .await?
        else {
            return Ok(None);
        };
        tracing::info!(
            task_id = %task.id,
            job_type = %task.job_type,
            attempt = task.attempt_count,
            max_attempts = task.max_attempts,
            "Task locked"
        );

        let started = Instant::now();
        let result = handler.run(&task, cancel).await;
        let elapsed = chrono::Duration::from_std(started.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        let settled_at = now + elapsed;

        let (settled, outcome) = match result {
            Ok(()) => (
                handler.on_success(self.store.as_ref(), &task, settled_at).await?,
                Outcome::Succeeded,
            ),
            Err(failure) if failure.code.is_retryable() && task.attempt_count < task.max_attempts => {
                let delay = retry_backoff(task.attempt_count);
                let run_after =
                    settled_at + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::minutes(15));
                let settled = self
                    .store
                    .requeue_task(
                        &task.id,
                        &worker_id,
                        run_after,
                        failure.code.as_str(),
                        &failure.message,
                        settled_at,
                    )
                    .await?;
                if settled {
                    tracing::warn!(
                        task_id = %task.id,
                        code = %failure.code,
                        attempt = task.attempt_count,
                        run_after = %run_after.to_rfc3339(),
                        "Task failed, requeued"
                    );
                }
                (settled, Outcome::Requeued { run_after })
            }
            Err(failure) => {
                let settled = handler
                    .on_failure(self.store.as_ref(), &task, &failure, settled_at)
                    .await?;
                if settled {
                    tracing::error!(
                        task_id = %task.id,
                        code = %failure.code,
                        attempt = task.attempt_count,
                        "Task failed"
                    );
                }
                (settled, Outcome::Failed)
            }
        };

        if !settled {
            tracing::warn!(
                task_id = %task.id,
                worker_id = %worker_id,
                "Task lock lost before settling, result discarded"
            );
            return Ok(Some((task, Outcome::LockLost)));
        }
        if outcome == Outcome::Succeeded {
            tracing::info!(task_id = %task.id, "Task succeeded");
        }
        Ok(Some((task, outcome)))
    }
}
