//! Persistence contracts.
//!
//! Each concern gets its own trait so components depend only on what they
//! touch. Two backends implement all of them: [`postgres::Store`] for
//! production and [`memory::MemoryStore`] for tests and local runs.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::activity::{Activity, ActivityPage, EmitInput, ListFilter};
use crate::error::{ActivityError, DatabaseError, JobError, TaskError};
use crate::orchestrator::{EventInput, Job, JobEvent, NewJob, TransitionInput};
use crate::pki::{CaRecord, NodeCertificate};
use crate::servers::{ProviderRecord, ProvisioningUpdate, Server, ServerKey};
use crate::tasks::{NewTask, SiteImport, TaskJob};

/// Default page size for [`JobStore::list_events`].
pub const DEFAULT_EVENT_LIMIT: i64 = 100;

/// Jobs and their event timelines.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job in `queued`.
    async fn create_job(&self, input: NewJob) -> Result<Job, JobError>;

    async fn get_job(&self, id: i64) -> Result<Job, JobError>;

    /// Validate against the state machine and write the new
    /// `(status, current_step, retry_count, last_error)`.
    async fn transition_job(&self, id: i64, input: TransitionInput) -> Result<Job, JobError>;

    /// Move `current_step` forward without changing status. Fails on
    /// terminal jobs.
    async fn advance_step(&self, id: i64, step: &str) -> Result<Job, JobError>;

    /// Atomically promote the oldest queued job to `preparing`.
    ///
    /// Returns `None` when nothing is queued.
    async fn claim_next_job(&self) -> Result<Option<Job>, JobError>;

    /// Append with `seq = max(seq) + 1` for the job, atomically.
    async fn append_event(&self, job_id: i64, input: EventInput) -> Result<JobEvent, JobError>;

    /// Events with `seq > after_seq`, ascending. `limit <= 0` means the default.
    async fn list_events(
        &self,
        job_id: i64,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<JobEvent>, JobError>;

    async fn list_all_events(&self, job_id: i64) -> Result<Vec<JobEvent>, JobError>;

    /// Requeue every `preparing`/`running` job. Run once at startup before
    /// any worker claims.
    async fn recover_stuck_jobs(&self) -> Result<u64, JobError>;

    async fn list_all_jobs(&self) -> Result<Vec<Job>, JobError>;

    async fn list_jobs_by_server(&self, server_id: i64) -> Result<Vec<Job>, JobError>;

    async fn get_latest_job_for_server(&self, server_id: i64) -> Result<Option<Job>, JobError>;

    async fn set_command_id(&self, id: i64, command_id: &str) -> Result<(), JobError>;

    async fn get_job_by_command_id(&self, command_id: &str) -> Result<Job, JobError>;
}

/// The dashboard activity stream.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Validate and append a row. Unknown event types write nothing.
    async fn emit(&self, input: EmitInput) -> Result<Activity, ActivityError>;

    async fn get_activity(&self, id: i64) -> Result<Activity, ActivityError>;

    /// Newest first, paginated by id cursor.
    async fn list_activity(&self, filter: &ListFilter) -> Result<ActivityPage, ActivityError>;

    /// Rows whose resource or parent is the given server.
    async fn list_activity_for_server(
        &self,
        server_id: i64,
        filter: &ListFilter,
    ) -> Result<ActivityPage, ActivityError>;

    /// Set `read_at` if unset. Not-found is an error, already-read is not.
    async fn mark_read(&self, id: i64) -> Result<(), ActivityError>;

    async fn mark_all_read(&self, filter: &ListFilter) -> Result<u64, ActivityError>;

    async fn count_unread(&self, filter: &ListFilter) -> Result<i64, ActivityError>;

    /// Highest id, or 0 when empty.
    async fn latest_activity_id(&self) -> Result<i64, ActivityError>;

    /// Rows with `id > since_id`, ascending.
    async fn list_activity_since(
        &self,
        since_id: i64,
        limit: usize,
    ) -> Result<Vec<Activity>, ActivityError>;
}

/// Single-use registration tokens, stored by hash.
#[async_trait]
pub trait RegistrationStore: Send + Sync {
    async fn insert_registration_token(
        &self,
        server_id: i64,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Conditionally mark a token consumed. True iff exactly one row matched
    /// `(hash, server_id, unconsumed, unexpired at now)`.
    async fn consume_registration_token(
        &self,
        token_hash: &str,
        server_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Delete unconsumed tokens that expired before `now`.
    async fn delete_expired_registration_tokens(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;
}

/// CA and node certificate records.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Most recently stored CA certificate.
    async fn latest_ca(&self) -> Result<Option<CaRecord>, DatabaseError>;

    async fn insert_ca(&self, record: &CaRecord) -> Result<(), DatabaseError>;

    async fn insert_node_certificate(&self, cert: &NodeCertificate) -> Result<(), DatabaseError>;

    /// Newest unrevoked certificate for the server with `expires_at > now`.
    async fn valid_certificate_for_server(
        &self,
        server_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<NodeCertificate>, DatabaseError>;

    async fn is_revoked(&self, serial_number: &str) -> Result<bool, DatabaseError>;

    /// Set `revoked_at`. Returns false when no unrevoked row has the serial.
    async fn revoke_certificate(
        &self,
        serial_number: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;
}

/// Managed server records (owned by the wider application).
#[async_trait]
pub trait ServerStore: Send + Sync {
    async fn get_server(&self, id: i64) -> Result<Server, DatabaseError>;

    async fn update_server_status(&self, id: i64, status: &str) -> Result<(), DatabaseError>;

    async fn update_provisioning(
        &self,
        id: i64,
        update: &ProvisioningUpdate,
    ) -> Result<(), DatabaseError>;

    async fn get_server_key(&self, server_id: i64) -> Result<Option<ServerKey>, DatabaseError>;

    /// Insert a key. Fails with `Constraint` if the server already has one.
    async fn insert_server_key(&self, key: &ServerKey) -> Result<(), DatabaseError>;
}

/// Cloud provider accounts.
#[async_trait]
pub trait ProviderStore: Send + Sync {
    async fn get_provider(&self, id: i64) -> Result<ProviderRecord, DatabaseError>;
}

/// The text-id queued-task table and the business rows it drives.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a queued task. Rejects with `Conflict` when an active task
    /// already targets the same site or node.
    async fn enqueue_task(&self, task: NewTask) -> Result<TaskJob, TaskError>;

    async fn get_task(&self, id: &str) -> Result<TaskJob, TaskError>;

    async fn list_tasks(&self, limit: usize) -> Result<Vec<TaskJob>, TaskError>;

    /// Move a queued or running task to `cancelled`.
    async fn cancel_task(&self, id: &str, now: DateTime<Utc>) -> Result<TaskJob, TaskError>;

    /// Lock the oldest runnable task of `job_type` in one transaction.
    async fn lock_next_task(
        &self,
        job_type: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskJob>, DatabaseError>;

    /// The settle calls below only touch a task still `running` under
    /// `worker_id`. They return false when that lock was lost (the task was
    /// cancelled or reclaimed meanwhile) and leave the row alone.
    async fn requeue_task(
        &self,
        id: &str,
        worker_id: &str,
        run_after: DateTime<Utc>,
        error_code: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn fail_task(
        &self,
        id: &str,
        worker_id: &str,
        error_code: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn succeed_task(&self, id: &str, worker_id: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    async fn node_hostname(&self, node_id: &str) -> Result<Option<String>, DatabaseError>;

    /// Environment and site active, release recorded, task succeeded.
    async fn complete_site_import(
        &self,
        import: &SiteImport,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Environment, site and task failed.
    async fn fail_site_import(
        &self,
        import: &SiteImport,
        worker_id: &str,
        error_code: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;
}

/// Everything the control plane persists.
pub trait Database:
    JobStore
    + ActivityStore
    + RegistrationStore
    + CertificateStore
    + ServerStore
    + ProviderStore
    + TaskStore
{
}

impl<T> Database for T where
    T: JobStore
        + ActivityStore
        + RegistrationStore
        + CertificateStore
        + ServerStore
        + ProviderStore
        + TaskStore
{
}
