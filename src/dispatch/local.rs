use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::db::JobStore;
use crate::dispatch::JobRunner;
use crate::error::DispatchError;
use crate::orchestrator::{EVENT_STEP_UPDATE, EventInput, EventLevel, Job, JobStatus, TransitionInput};
use crate::pki::write_secret_file;
use crate::runner::{Event, EventSink, Request, Runner};

/// Step recorded for runner events that carry none.
pub const DEFAULT_STEP: &str = "ansible";

const LOCAL_INVENTORY: &str = "localhost ansible_connection=local\n";

/// Maps runner events onto a job's timeline as `step_update` events.
pub struct JobEventSink {
    jobs: Arc<dyn JobStore>,
    job_id: i64,
}

impl JobEventSink {
    pub fn new(jobs: Arc<dyn JobStore>, job_id: i64) -> Self {
        Self { jobs, job_id }
    }
}

#[async_trait]
impl EventSink for JobEventSink {
    async fn emit(&self, event: Event) {
        let step = event.step_key.as_deref().unwrap_or(DEFAULT_STEP);
        let mut input = EventInput::new(EVENT_STEP_UPDATE, event.level, &event.message)
            .step(step)
            .status(&event.event_type);
        if let Some(payload) = event.payload {
            input = input.payload(serde_json::json!({ "output": payload }));
        }
        if let Err(e) = self.jobs.append_event(self.job_id, input).await {
            tracing::error!(job_id = self.job_id, error = %e, "Failed to append runner event");
        }
    }
}

/// Runs a kind's configured playbook against the control plane host.
pub struct LocalRunner {
    runner: Arc<dyn Runner>,
    jobs: Arc<dyn JobStore>,
    playbooks: HashMap<String, PathBuf>,
}

impl LocalRunner {
    pub fn new(runner: Arc<dyn Runner>, jobs: Arc<dyn JobStore>, playbooks: HashMap<String, PathBuf>) -> Self {
        Self { runner, jobs, playbooks }
    }

    pub fn kinds(&self) -> impl Iterator<Item = &String> {
        self.playbooks.keys()
    }

    async fn execute(&self, job: &Job, playbook: PathBuf, cancel: &CancellationToken) -> Result<(), String> {
        let workspace = tempfile::Builder::new()
            .prefix("fleetplane-ansible-")
            .tempdir()
            .map_err(|e| format!("failed to create ansible workspace: {}", e))?;
        let inventory_path = workspace.path().join("inventory.ini");
        write_secret_file(&inventory_path, LOCAL_INVENTORY.as_bytes())
            .map_err(|e| format!("failed to write ansible inventory: {}", e))?;

        let request = Request {
            job_id: job.id,
            inventory_path,
            playbook_path: playbook,
            extra_vars: extra_vars(job),
            ..Request::default()
        };
        let sink = JobEventSink::new(self.jobs.clone(), job.id);
        self.runner
            .run(&request, &sink, cancel)
            .await
            .map_err(|e| format!("ansible run failed: {}", e))
    }
}

#[async_trait]
impl JobRunner for LocalRunner {
    async fn run(&self, job: &Job, cancel: &CancellationToken) -> Result<(), DispatchError> {
        let Some(playbook) = self.playbooks.get(&job.kind).cloned() else {
            return Err(DispatchError::NoRunner(job.kind.clone()));
        };

        self.jobs
            .transition_job(job.id, TransitionInput::to(JobStatus::Running).step(DEFAULT_STEP))
            .await?;

        match self.execute(job, playbook, cancel).await {
            Ok(()) => {
                self.jobs
                    .transition_job(job.id, TransitionInput::to(JobStatus::Verifying).step(DEFAULT_STEP))
                    .await?;
                self.jobs
                    .transition_job(job.id, TransitionInput::to(JobStatus::Succeeded).step(DEFAULT_STEP))
                    .await?;
                self.jobs
                    .append_event(
                        job.id,
                        EventInput::new(EVENT_STEP_UPDATE, EventLevel::Success, "Job completed successfully")
                            .step(DEFAULT_STEP)
                            .status("succeeded"),
                    )
                    .await?;
                tracing::info!(job_id = job.id, kind = %job.kind, "Local playbook run succeeded");
            }
            Err(message) => {
                tracing::warn!(job_id = job.id, kind = %job.kind, error = %message, "Local playbook run failed");
                if let Err(e) = self
                    .jobs
                    .append_event(
                        job.id,
                        EventInput::new(EVENT_STEP_UPDATE, EventLevel::Error, &message)
                            .step(DEFAULT_STEP)
                            .status("failed"),
                    )
                    .await
                {
                    tracing::error!(job_id = job.id, error = %e, "Failed to append job event");
                }
                self.jobs
                    .transition_job(
                        job.id,
                        TransitionInput::to(JobStatus::Failed)
                            .step(DEFAULT_STEP)
                            .error(message),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

/// Job identity plus the payload's top-level fields. Non-string values are
/// passed as JSON.
fn extra_vars(job: &Job) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    if let Some(serde_json::Value::Object(fields)) = &job.payload {
        for (key, value) in fields {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => continue,
                other => other.to_string(),
            };
            vars.insert(key.clone(), value);
        }
    }
    vars.insert("job_id".to_string(), job.id.to_string());
    if let Some(server_id) = job.server_id {
        vars.insert("server_id".to_string(), server_id.to_string());
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::error::RunnerError;
    use crate::orchestrator::NewJob;
    use crate::runner::testing::StubRunner;

    async fn claimed(store: &MemoryStore) -> Job {
        store
            .create_job(
                NewJob::new("configure_server")
                    .with_server(5)
                    .with_payload(serde_json::json!({"profile": "web", "swap_gb": 2, "skip": null})),
            )
            .await
            .unwrap();
        store.claim_next_job().await.unwrap().unwrap()
    }

    fn local(store: &Arc<MemoryStore>, runner: Arc<StubRunner>) -> LocalRunner {
        let mut playbooks = HashMap::new();
        playbooks.insert("configure_server".to_string(), PathBuf::from("/pb/configure.yml"));
        LocalRunner::new(runner, store.clone(), playbooks)
    }

    #[tokio::test]
    async fn test_success_goes_through_verifying() {
        let store = Arc::new(MemoryStore::new());
        let job = claimed(&store).await;
        let runner = Arc::new(StubRunner::new(vec![Ok(())]));

        local(&store, runner.clone())
            .run(&job, &CancellationToken::new())
            .await
            .unwrap();

        let stored = store.get_job(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(stored.current_step, DEFAULT_STEP);

        let request = runner.requests.lock().unwrap()[0].clone();
        assert_eq!(request.playbook_path, PathBuf::from("/pb/configure.yml"));
        assert_eq!(request.extra_vars["profile"], "web");
        assert_eq!(request.extra_vars["swap_gb"], "2");
        assert_eq!(request.extra_vars["server_id"], "5");
        assert!(!request.extra_vars.contains_key("skip"));
        // The scratch inventory is gone once the run returns.
        assert!(!request.inventory_path.exists());

        let events = store.list_all_events(job.id).await.unwrap();
        assert_eq!(events[0].status.as_deref(), Some("runner_step"));
        assert_eq!(events[0].step_key.as_deref(), Some("apply"));
        assert_eq!(events.last().unwrap().status.as_deref(), Some("succeeded"));
    }

    #[tokio::test]
    async fn test_runner_error_fails_job() {
        let store = Arc::new(MemoryStore::new());
        let job = claimed(&store).await;
        let runner = Arc::new(StubRunner::new(vec![Err(RunnerError::Exit {
            code: 2,
            output: "host failed".to_string(),
        })]));

        local(&store, runner).run(&job, &CancellationToken::new()).await.unwrap();

        let stored = store.get_job(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(
            stored.last_error.as_deref(),
            Some("ansible run failed: process exited with code 2")
        );
    }

    #[tokio::test]
    async fn test_event_without_step_uses_default() {
        let store = Arc::new(MemoryStore::new());
        let job = claimed(&store).await;
        let sink = JobEventSink::new(store.clone(), job.id);
        sink.emit(Event::new("runner_preflight", EventLevel::Info, "preflight").payload("x"))
            .await;

        let events = store.list_all_events(job.id).await.unwrap();
        assert_eq!(events[0].event_type, EVENT_STEP_UPDATE);
        assert_eq!(events[0].step_key.as_deref(), Some(DEFAULT_STEP));
        assert_eq!(events[0].payload.as_ref().unwrap()["output"], "x");
    }
}
