//! Per-kind job execution.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::activity::{ActivityLog, EmitInput, EventType, Level, ResourceRef, job_lifecycle};
use crate::config::ProvisionConfig;
use crate::db::{JobStore, ProviderStore, ServerStore};
use crate::dispatch::Dispatcher;
use crate::error::{DispatchError, JobError};
use crate::orchestrator::{
    EVENT_STEP_UPDATE, EventInput, EventLevel, Job, JobStatus, KIND_PROVISION_SERVER, TransitionInput,
};
use crate::pki::Envelope;
use crate::provider::ProviderRegistry;
use crate::servers::status;
use crate::worker::provision::{PROVISION_STEPS, Provisioning};

/// Runs claimed jobs. Holds no per-job state between invocations.
pub struct Executor {
    pub(super) jobs: Arc<dyn JobStore>,
    pub(super) servers: Arc<dyn ServerStore>,
    pub(super) providers: Arc<dyn ProviderStore>,
    pub(super) registry: ProviderRegistry,
    pub(super) envelope: Arc<Envelope>,
    pub(super) activity: ActivityLog,
    pub(super) dispatcher: Arc<Dispatcher>,
    pub(super) provision: ProvisionConfig,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<dyn JobStore>,
        servers: Arc<dyn ServerStore>,
        providers: Arc<dyn ProviderStore>,
        registry: ProviderRegistry,
        envelope: Arc<Envelope>,
        activity: ActivityLog,
        dispatcher: Arc<Dispatcher>,
        provision: ProvisionConfig,
    ) -> Self {
        Self {
            jobs,
            servers,
            providers,
            registry,
            envelope,
            activity,
            dispatcher,
            provision,
        }
    }

    /// Execute a job claimed in `preparing`.
    ///
    /// Step failures are recorded on the job and return `Ok`. An `Err` means
    /// a primary state write failed.
    pub async fn execute(&self, job: Job, cancel: &CancellationToken) -> Result<(), JobError> {
        if job.kind == KIND_PROVISION_SERVER {
            return self.provision_server(job, cancel).await;
        }
        if self.dispatcher.handles(&job.kind) {
            return self.dispatched(job, cancel).await;
        }
        let message = format!("unknown job kind: {}", job.kind);
        self.fail_job(&job, "", &message).await;
        Ok(())
    }

    async fn provision_server(&self, job: Job, cancel: &CancellationToken) -> Result<(), JobError> {
        let first = PROVISION_STEPS[0];
        let job = self
            .jobs
            .transition_job(job.id, TransitionInput::to(JobStatus::Running).step(first))
            .await?;
        self.activity.emit(job_lifecycle(EventType::JobStarted, &job)).await;

        let mut run = Provisioning::new(self, &job, cancel);
        for (index, step) in PROVISION_STEPS.iter().copied().enumerate() {
            if index > 0 {
                self.update_step(job.id, step).await;
            }
            self.step_event(job.id, step, "running", run.start_message(step)).await;
            match run.step(step).await {
                Ok(done) => self.step_event(job.id, step, "completed", &done).await,
                Err(message) => {
                    self.fail_job(&job, step, &message).await;
                    return Ok(());
                }
            }
        }

        let last = PROVISION_STEPS[PROVISION_STEPS.len() - 1];
        self.jobs
            .transition_job(job.id, TransitionInput::to(JobStatus::Verifying).step(last))
            .await?;
        let done = self
            .jobs
            .transition_job(job.id, TransitionInput::to(JobStatus::Succeeded).step(last))
            .await?;
        self.event(
            job.id,
            EventInput::new(EVENT_STEP_UPDATE, EventLevel::Success, "Job completed successfully")
                .status("succeeded"),
        )
        .await;

        self.activity.emit(job_lifecycle(EventType::JobCompleted, &done)).await;
        if let Some(server) = run.server() {
            self.activity
                .emit(
                    EmitInput::new(
                        EventType::ServerProvisioned,
                        Level::Success,
                        format!("Server '{}' provisioned", server.name),
                    )
                    .resource(ResourceRef::server(server.id)),
                )
                .await;
        }
        tracing::info!(job_id = job.id, server_id = ?job.server_id, "Server provisioned");
        Ok(())
    }

    async fn dispatched(&self, job: Job, cancel: &CancellationToken) -> Result<(), JobError> {
        self.activity.emit(job_lifecycle(EventType::JobStarted, &job)).await;
        match self.dispatcher.dispatch(&job, cancel).await {
            Ok(()) => {}
            Err(DispatchError::Job(e)) => return Err(e),
            Err(e) => {
                self.fail_job(&job, &job.current_step, &e.to_string()).await;
                return Ok(());
            }
        }

        // Agent jobs stay running until their result arrives; local runs
        // are already terminal.
        let after = self.jobs.get_job(job.id).await?;
        match after.status {
            JobStatus::Succeeded => {
                self.activity.emit(job_lifecycle(EventType::JobCompleted, &after)).await;
            }
            JobStatus::Failed => {
                let mut input = job_lifecycle(EventType::JobFailed, &after);
                if let Some(error) = &after.last_error {
                    input = input.message(error);
                }
                self.activity.emit(input).await;
            }
            _ => {}
        }
        Ok(())
    }

    /// Record a step failure: node `failed`, an error event, the `failed`
    /// transition and a `job.failed` activity. All writes are best-effort.
    pub(super) async fn fail_job(&self, job: &Job, step: &str, message: &str) {
        tracing::error!(job_id = job.id, step, error = %message, "Job failed");

        if let Some(server_id) = job.server_id {
            if let Err(e) = self.servers.update_server_status(server_id, status::FAILED).await {
                tracing::error!(job_id = job.id, server_id, error = %e, "Failed to mark server failed");
            }
        }

        let mut event = EventInput::new(EVENT_STEP_UPDATE, EventLevel::Error, message).status("failed");
        if !step.is_empty() {
            event = event.step(step);
        }
        self.event(job.id, event).await;

        let failed = match self
            .jobs
            .transition_job(job.id, TransitionInput::to(JobStatus::Failed).step(step).error(message))
            .await
        {
            Ok(failed) => failed,
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "Failed to transition job to failed");
                job.clone()
            }
        };

        self.activity
            .emit(job_lifecycle(EventType::JobFailed, &failed).message(message))
            .await;
    }

    async fn update_step(&self, job_id: i64, step: &str) {
        if let Err(e) = self.jobs.advance_step(job_id, step).await {
            tracing::error!(job_id, step, error = %e, "Failed to update job step");
        }
    }

    async fn step_event(&self, job_id: i64, step: &str, status: &str, message: &str) {
        self.event(
            job_id,
            EventInput::new(EVENT_STEP_UPDATE, EventLevel::Info, message)
                .step(step)
                .status(status),
        )
        .await;
    }

    async fn event(&self, job_id: i64, input: EventInput) {
        if let Err(e) = self.jobs.append_event(job_id, input).await {
            tracing::error!(job_id, error = %e, "Failed to emit job event");
        }
    }
}

#[cfg(test)]
pub(super) mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use secrecy::SecretString;

    use super::*;
    use crate::activity::ListFilter;
    use crate::agent::Hub;
    use crate::db::ActivityStore;
    use crate::db::memory::MemoryStore;
    use crate::dispatch::{AgentRunner, LocalRunner};
    use crate::orchestrator::NewJob;
    use crate::provider::testing::FakeProvider;
    use crate::runner::testing::StubRunner;
    use crate::servers::{ProviderRecord, Server};

    pub(crate) fn server(id: i64) -> Server {
        Server {
            id,
            provider_id: 1,
            name: format!("web-{}", id),
            location: "fsn1".to_string(),
            server_type: "cx22".to_string(),
            image: "ubuntu-24.04".to_string(),
            status: status::PROVISIONING.to_string(),
            provider_server_id: None,
            action_id: None,
            action_status: None,
            ipv4: None,
            ipv6: None,
        }
    }

    pub(crate) struct Fixture {
        pub store: Arc<MemoryStore>,
        pub hub: Arc<Hub>,
        pub provider: Arc<FakeProvider>,
        pub executor: Executor,
        pub _key_dir: tempfile::TempDir,
    }

    pub(crate) fn fixture(provider: FakeProvider) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.insert_server(server(1));
        store.insert_provider(ProviderRecord {
            id: 1,
            provider_type: "hetzner".to_string(),
            name: "main".to_string(),
            api_token: SecretString::from("hz-token"),
        });

        let provider = Arc::new(provider);
        let registered: Arc<dyn crate::provider::ServerProvider> = provider.clone();
        let registry = ProviderRegistry::new(vec![registered]).unwrap();
        let key_dir = tempfile::tempdir().unwrap();
        let envelope = Arc::new(Envelope::ensure_identity(&key_dir.path().join("age.key"), true).unwrap());

        let hub = Arc::new(Hub::new());
        let mut playbooks = HashMap::new();
        playbooks.insert("configure_server".to_string(), PathBuf::from("/pb/configure.yml"));
        let local = LocalRunner::new(Arc::new(StubRunner::new(Vec::new())), store.clone(), playbooks);
        let dispatcher = Arc::new(Dispatcher::new(
            hub.clone(),
            Arc::new(AgentRunner::new(hub.clone(), store.clone())),
            Arc::new(local),
            vec!["configure_server".to_string()],
        ));

        let executor = Executor::new(
            store.clone(),
            store.clone(),
            store.clone(),
            registry,
            envelope,
            ActivityLog::new(store.clone()),
            dispatcher,
            ProvisionConfig {
                wait_running_timeout: std::time::Duration::from_secs(2),
                wait_running_interval: std::time::Duration::from_millis(5),
            },
        );
        Fixture {
            store,
            hub,
            provider,
            executor,
            _key_dir: key_dir,
        }
    }

    async fn claim(store: &MemoryStore, job: NewJob) -> Job {
        store.create_job(job).await.unwrap();
        store.claim_next_job().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_provision_runs_all_steps() {
        let f = fixture(FakeProvider::new("hetzner").with_statuses(&["initializing", "starting", "running"]));
        let job = claim(&f.store, NewJob::new(KIND_PROVISION_SERVER).with_server(1)).await;

        f.executor.execute(job.clone(), &CancellationToken::new()).await.unwrap();

        let done = f.store.get_job(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.current_step, "finalize");

        let events = f.store.list_all_events(job.id).await.unwrap();
        assert_eq!(events.len(), 11);
        let steps: Vec<_> = events[..10]
            .iter()
            .map(|e| (e.step_key.clone().unwrap(), e.status.clone().unwrap()))
            .collect();
        assert_eq!(steps[0], ("validate".to_string(), "running".to_string()));
        assert_eq!(steps[1], ("validate".to_string(), "completed".to_string()));
        assert_eq!(steps[8], ("finalize".to_string(), "running".to_string()));
        assert_eq!(events[10].status.as_deref(), Some("succeeded"));
        assert!(events.windows(2).all(|w| w[1].seq == w[0].seq + 1));

        let server = f.store.get_server(1).await.unwrap();
        assert_eq!(server.status, status::READY);
        assert_eq!(server.provider_server_id.as_deref(), Some("1001"));
        assert_eq!(server.ipv4.as_deref(), Some("203.0.113.10"));
        assert_eq!(*f.provider.polls.lock().unwrap(), 3);

        let created = f.provider.created.lock().unwrap()[0].clone();
        assert_eq!(created.ssh_keys, vec!["fleetplane-server-1".to_string()]);
        let key = f.store.get_server_key(1).await.unwrap().unwrap();
        assert!(key.public_key.starts_with("ssh-ed25519 "));
        assert!(key.private_key_encrypted.contains("BEGIN AGE ENCRYPTED FILE"));

        let page = f.store.list_activity(&ListFilter::default()).await.unwrap();
        let types: Vec<_> = page.data.iter().map(|a| a.event_type).collect();
        assert_eq!(
            types,
            vec![EventType::ServerProvisioned, EventType::JobCompleted, EventType::JobStarted]
        );
    }

    #[tokio::test]
    async fn test_provider_error_fails_job_and_server() {
        let f = fixture(
            FakeProvider::new("hetzner")
                .failing_create(crate::error::ProviderError::RateLimited("slow down".to_string())),
        );
        let job = claim(&f.store, NewJob::new(KIND_PROVISION_SERVER).with_server(1)).await;

        f.executor.execute(job.clone(), &CancellationToken::new()).await.unwrap();

        let failed = f.store.get_job(job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.current_step, "create_server");
        assert!(failed.last_error.unwrap().contains("rate limit"));
        assert_eq!(f.store.get_server(1).await.unwrap().status, status::FAILED);

        let last = f.store.list_all_events(job.id).await.unwrap().pop().unwrap();
        assert_eq!(last.level, EventLevel::Error);
        assert_eq!(last.step_key.as_deref(), Some("create_server"));

        let page = f.store.list_activity(&ListFilter::default()).await.unwrap();
        assert_eq!(page.data[0].event_type, EventType::JobFailed);
        assert!(page.data[0].requires_attention);
    }

    #[tokio::test]
    async fn test_missing_server_fails_in_validate() {
        let f = fixture(FakeProvider::new("hetzner"));
        let job = claim(&f.store, NewJob::new(KIND_PROVISION_SERVER).with_server(99)).await;

        f.executor.execute(job.clone(), &CancellationToken::new()).await.unwrap();

        let failed = f.store.get_job(job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.current_step, "validate");
        assert!(failed.last_error.unwrap().starts_with("server not found"));
    }

    #[tokio::test]
    async fn test_wait_running_times_out() {
        let f = fixture(FakeProvider::new("hetzner").with_statuses(&["initializing"]));
        let job = claim(&f.store, NewJob::new(KIND_PROVISION_SERVER).with_server(1)).await;

        f.executor.execute(job.clone(), &CancellationToken::new()).await.unwrap();

        let failed = f.store.get_job(job.id).await.unwrap();
        assert_eq!(failed.current_step, "wait_running");
        assert!(failed.last_error.unwrap().contains("did not reach running"));
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_immediately() {
        let f = fixture(FakeProvider::new("hetzner"));
        let job = claim(&f.store, NewJob::new("rotate_keys")).await;

        f.executor.execute(job.clone(), &CancellationToken::new()).await.unwrap();

        let failed = f.store.get_job(job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("unknown job kind: rotate_keys"));
    }

    #[tokio::test]
    async fn test_agent_kind_without_session_fails() {
        let f = fixture(FakeProvider::new("hetzner"));
        let job = claim(&f.store, NewJob::new("restart_service").with_server(42)).await;

        f.executor.execute(job.clone(), &CancellationToken::new()).await.unwrap();

        let failed = f.store.get_job(job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("agent not connected"));
        let page = f.store.list_activity(&ListFilter::default()).await.unwrap();
        assert_eq!(page.data[0].event_type, EventType::JobFailed);
    }

    #[tokio::test]
    async fn test_local_playbook_kind_succeeds() {
        let f = fixture(FakeProvider::new("hetzner"));
        let job = claim(&f.store, NewJob::new("configure_server").with_server(1)).await;

        f.executor.execute(job.clone(), &CancellationToken::new()).await.unwrap();

        assert_eq!(f.store.get_job(job.id).await.unwrap().status, JobStatus::Succeeded);
        assert!(f.hub.is_empty().await);
    }
}
