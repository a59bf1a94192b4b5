use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{Command, Envelope, Hub};
use crate::db::JobStore;
use crate::dispatch::JobRunner;
use crate::error::DispatchError;
use crate::orchestrator::{Job, JobStatus, TransitionInput};

pub const AGENT_NOT_CONNECTED: &str = "agent not connected";

/// Sends a job to the node agent as a `command` envelope.
///
/// The job is left `running`; the [`Completer`](super::Completer) finishes it
/// when the correlated `command_result` arrives.
pub struct AgentRunner {
    hub: Arc<Hub>,
    jobs: Arc<dyn JobStore>,
}

impl AgentRunner {
    pub fn new(hub: Arc<Hub>, jobs: Arc<dyn JobStore>) -> Self {
        Self { hub, jobs }
    }

    async fn fail(&self, job: &Job, message: String) -> Result<(), DispatchError> {
        tracing::warn!(job_id = job.id, error = %message, "Agent dispatch failed");
        self.jobs
            .transition_job(job.id, TransitionInput::to(JobStatus::Failed).error(message))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobRunner for AgentRunner {
    async fn run(&self, job: &Job, _cancel: &CancellationToken) -> Result<(), DispatchError> {
        let command_id = Uuid::new_v4().to_string();
        // Stored before sending so a fast reply can always be correlated.
        self.jobs.set_command_id(job.id, &command_id).await?;
        self.jobs
            .transition_job(job.id, TransitionInput::to(JobStatus::Running))
            .await?;

        let Some(session) = (match job.server_id {
            Some(server_id) => self.hub.get(server_id).await,
            None => None,
        }) else {
            return self.fail(job, AGENT_NOT_CONNECTED.to_string()).await;
        };

        let command = Command {
            id: command_id.clone(),
            job_id: job.id,
            command_type: job.kind.clone(),
            payload: job.payload.clone().unwrap_or_else(|| serde_json::json!({})),
        };
        let envelope = match Envelope::command(&command) {
            Ok(envelope) => envelope,
            Err(e) => return self.fail(job, format!("failed to encode command: {}", e)).await,
        };

        if let Err(e) = session.send(&envelope).await {
            return self.fail(job, format!("failed to send command: {}", e)).await;
        }

        tracing::info!(
            job_id = job.id,
            server_id = session.server_id(),
            command_id = %command_id,
            kind = %job.kind,
            "Command sent to agent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MessageType;
    use crate::agent::session::testing::{RecordingSink, session};
    use crate::db::memory::MemoryStore;
    use crate::orchestrator::NewJob;

    async fn claimed(store: &MemoryStore, server_id: i64) -> Job {
        store
            .create_job(
                NewJob::new("restart_service")
                    .with_server(server_id)
                    .with_payload(serde_json::json!({"service_name": "nginx"})),
            )
            .await
            .unwrap();
        store.claim_next_job().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_sends_command_with_stored_id() {
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(Hub::new());
        let (s, sink) = session(7);
        hub.register(s).await;
        let job = claimed(&store, 7).await;

        AgentRunner::new(hub, store.clone())
            .run(&job, &CancellationToken::new())
            .await
            .unwrap();

        let stored = store.get_job(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.current_step, "");

        let sent = sink.of_kind(MessageType::Command);
        assert_eq!(sent.len(), 1);
        let command: Command = sent[0].decode().unwrap();
        assert_eq!(Some(command.id), stored.command_id);
        assert_eq!(command.job_id, job.id);
        assert_eq!(command.command_type, "restart_service");
        assert_eq!(command.payload["service_name"], "nginx");
    }

    #[tokio::test]
    async fn test_missing_session_fails_job() {
        let store = Arc::new(MemoryStore::new());
        let job = claimed(&store, 42).await;

        AgentRunner::new(Arc::new(Hub::new()), store.clone())
            .run(&job, &CancellationToken::new())
            .await
            .unwrap();

        let stored = store.get_job(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some(AGENT_NOT_CONNECTED));
    }

    #[tokio::test]
    async fn test_send_failure_fails_job() {
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(Hub::new());
        let sink = RecordingSink::failing();
        hub.register(Arc::new(crate::agent::Session::new(3, Box::new(sink.clone()))))
            .await;
        let job = claimed(&store, 3).await;

        AgentRunner::new(hub, store.clone())
            .run(&job, &CancellationToken::new())
            .await
            .unwrap();

        let stored = store.get_job(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.last_error.unwrap().starts_with("failed to send command"));
    }
}
