use std::sync::Arc;

use async_trait::async_trait;

use crate::activity::{ActivityLog, ActivityLogger, EventType, job_lifecycle};
use crate::agent::{AgentEvents, CommandResult, LogEntry};
use crate::db::JobStore;
use crate::error::{DispatchError, JobError};
use crate::orchestrator::{EVENT_STEP_UPDATE, EventInput, EventLevel, Job, JobStatus, TransitionInput};

/// Finishes agent jobs by command-id correlation and records agent log
/// lines as activity.
pub struct Completer {
    jobs: Arc<dyn JobStore>,
    activity: ActivityLog,
}

impl Completer {
    pub fn new(jobs: Arc<dyn JobStore>, activity: ActivityLog) -> Self {
        Self { jobs, activity }
    }

    async fn job_for(&self, server_id: i64, command_id: &str) -> Result<Job, DispatchError> {
        let job = self
            .jobs
            .get_job_by_command_id(command_id)
            .await
            .map_err(|source| DispatchError::UnknownCommand {
                command_id: command_id.to_string(),
                source,
            })?;
        // An agent may only answer for its own server.
        if job.server_id.is_some_and(|id| id != server_id) {
            return Err(DispatchError::UnknownCommand {
                command_id: command_id.to_string(),
                source: JobError::Validation(format!(
                    "command belongs to server {}, not {}",
                    job.server_id.unwrap_or_default(),
                    server_id
                )),
            });
        }
        Ok(job)
    }

    async fn timeline(&self, job_id: i64, input: EventInput) {
        if let Err(e) = self.jobs.append_event(job_id, input).await {
            tracing::error!(job_id, error = %e, "Failed to append job event");
        }
    }
}

#[async_trait]
impl AgentEvents for Completer {
    async fn handle_result(&self, server_id: i64, result: CommandResult) -> Result<(), DispatchError> {
        let job = self.job_for(server_id, &result.command_id).await?;
        let output = result
            .output
            .as_deref()
            .filter(|o| !o.trim().is_empty())
            .map(|o| serde_json::json!({ "output": o }));

        if result.success {
            self.jobs
                .transition_job(job.id, TransitionInput::to(JobStatus::Verifying).step(&job.current_step))
                .await?;
            let done = self
                .jobs
                .transition_job(job.id, TransitionInput::to(JobStatus::Succeeded).step(&job.current_step))
                .await?;
            let mut event = EventInput::new(EVENT_STEP_UPDATE, EventLevel::Success, "Agent command completed")
                .status("succeeded");
            if let Some(output) = output {
                event = event.payload(output);
            }
            self.timeline(job.id, event).await;
            self.activity.emit(job_lifecycle(EventType::JobCompleted, &done)).await;
            tracing::info!(job_id = job.id, server_id, "Agent command succeeded");
        } else {
            let message = result
                .error
                .as_deref()
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .unwrap_or("agent reported failure")
                .to_string();
            let failed = self
                .jobs
                .transition_job(job.id, TransitionInput::to(JobStatus::Failed).error(&message))
                .await?;
            let mut event = EventInput::new(EVENT_STEP_UPDATE, EventLevel::Error, &message).status("failed");
            if let Some(output) = output {
                event = event.payload(output);
            }
            self.timeline(job.id, event).await;
            self.activity
                .emit(job_lifecycle(EventType::JobFailed, &failed).message(&message))
                .await;
            tracing::warn!(job_id = job.id, server_id, error = %message, "Agent command failed");
        }
        Ok(())
    }

    async fn handle_log_entry(&self, server_id: i64, entry: LogEntry) -> Result<(), DispatchError> {
        let job = self.job_for(server_id, &entry.command_id).await?;
        let target = job.server_id.unwrap_or(server_id);
        self.activity
            .log(target, &format!("Agent log ({})", entry.level), &entry.message)
            .await;
        Ok(())
    }
}
