//! Job workers: poll the job store, claim the oldest queued job and hand
//! it to the [`Executor`].

mod executor;
mod provision;

pub use executor::Executor;
pub use provision::{generate_ssh_keypair, ssh_key_name};

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::db::JobStore;

/// One claim loop.
pub struct Worker {
    id: usize,
    jobs: Arc<dyn JobStore>,
    executor: Arc<Executor>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(id: usize, jobs: Arc<dyn JobStore>, executor: Arc<Executor>, poll_interval: Duration) -> Self {
        Self {
            id,
            jobs,
            executor,
            poll_interval: if poll_interval.is_zero() {
                WorkerConfig::default().poll_interval
            } else {
                poll_interval
            },
        }
    }

    /// Tick until `shutdown` fires. A job in flight is run to completion
    /// with `shutdown` passed down as its cancellation signal.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(worker = self.id, poll_interval = ?self.poll_interval, "Worker started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(worker = self.id, "Worker shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.poll(&shutdown).await;
                }
            }
        }
    }

    /// Claim and execute at most one job. Returns true if a job was claimed.
    pub async fn poll(&self, shutdown: &CancellationToken) -> bool {
        let job = match self.jobs.claim_next_job().await {
            Ok(Some(job)) => job,
            Ok(None) => return false,
            Err(e) => {
                tracing::error!(worker = self.id, error = %e, "Failed to claim job");
                return false;
            }
        };

        let job_id = job.id;
        tracing::info!(worker = self.id, job_id, kind = %job.kind, server_id = ?job.server_id, "Claimed job");
        match self.executor.execute(job, shutdown).await {
            Ok(()) => tracing::info!(worker = self.id, job_id, "Job finished"),
            // The executor has already recorded step failures on the job.
            Err(e) => tracing::error!(worker = self.id, job_id, error = %e, "Job execution failed"),
        }
        true
    }
}

/// Spawn `config.workers` workers sharing one executor.
pub fn spawn_workers(
    config: &WorkerConfig,
    jobs: Arc<dyn JobStore>,
    executor: Arc<Executor>,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..config.workers.max(1))
        .map(|id| {
            let worker = Worker::new(id, jobs.clone(), executor.clone(), config.poll_interval);
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use super::executor::tests::{Fixture, fixture};
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::orchestrator::{Job, JobStatus, NewJob};
    use crate::provider::testing::FakeProvider;

    fn setup() -> (Arc<MemoryStore>, Arc<Executor>, tempfile::TempDir) {
        let Fixture {
            store,
            executor,
            _key_dir,
            ..
        } = fixture(FakeProvider::new("hetzner"));
        (store, Arc::new(executor), _key_dir)
    }

    async fn wait_for_status(store: &MemoryStore, id: i64, status: JobStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.get_job(id).await.unwrap().status != status {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("job {} never reached {:?}", id, status));
    }

    #[test]
    fn test_zero_poll_interval_uses_default() {
        let (store, executor, _keys) = setup();
        let worker = Worker::new(0, store, executor, Duration::ZERO);
        assert_eq!(worker.poll_interval, WorkerConfig::default().poll_interval);
    }

    #[tokio::test]
    async fn test_poll_claims_and_finishes_one_job() {
        let (store, executor, _keys) = setup();
        let first = store.create_job(NewJob::new("configure_server").with_server(1)).await.unwrap();
        let second = store.create_job(NewJob::new("configure_server").with_server(1)).await.unwrap();
        let worker = Worker::new(0, store.clone(), executor, Duration::from_millis(10));
        let shutdown = CancellationToken::new();

        assert!(worker.poll(&shutdown).await);
        assert_eq!(store.get_job(first.id).await.unwrap().status, JobStatus::Succeeded);
        assert_eq!(store.get_job(second.id).await.unwrap().status, JobStatus::Queued);

        assert!(worker.poll(&shutdown).await);
        assert_eq!(store.get_job(second.id).await.unwrap().status, JobStatus::Succeeded);
        assert!(!worker.poll(&shutdown).await);
    }

    #[tokio::test]
    async fn test_recovered_job_is_claimed_again() {
        let (store, executor, _keys) = setup();
        let now = Utc::now();
        store.insert_job(Job {
            id: 7,
            kind: "configure_server".to_string(),
            server_id: Some(1),
            status: JobStatus::Running,
            current_step: "dispatch".to_string(),
            retry_count: 0,
            last_error: None,
            payload: None,
            command_id: None,
            created_at: now,
            updated_at: now,
        });
        let worker = Worker::new(0, store.clone(), executor, Duration::from_millis(10));
        let shutdown = CancellationToken::new();

        // A running job left behind by a crash is never claimed as-is.
        assert!(!worker.poll(&shutdown).await);
        assert_eq!(store.recover_stuck_jobs().await.unwrap(), 1);
        assert!(worker.poll(&shutdown).await);
        assert_eq!(store.get_job(7).await.unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_spawned_workers_drain_queue_and_stop() {
        let (store, executor, _keys) = setup();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(store.create_job(NewJob::new("configure_server").with_server(1)).await.unwrap().id);
        }
        let config = WorkerConfig {
            poll_interval: Duration::from_millis(10),
            workers: 3,
        };
        let shutdown = CancellationToken::new();
        let handles = spawn_workers(&config, store.clone(), executor, &shutdown);
        assert_eq!(handles.len(), 3);

        for id in &ids {
            wait_for_status(&store, *id, JobStatus::Succeeded).await;
        }

        shutdown.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("worker did not stop after shutdown")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_run_returns_promptly_on_shutdown() {
        let (store, executor, _keys) = setup();
        let worker = Worker::new(0, store, executor, Duration::from_secs(3600));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker ignored shutdown")
            .unwrap();
    }
}
