//! In-process backend.
//!
//! Every operation takes one lock over the whole state, which makes each
//! call atomic the same way a single SQL statement or transaction is on the
//! PostgreSQL backend. Used by the test suite and for local runs without a
//! database.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use subtle::ConstantTimeEq;

use crate::activity::{Activity, ActivityPage, EmitInput, ListFilter};
use crate::db::{
    ActivityStore, CertificateStore, DEFAULT_EVENT_LIMIT, JobStore, ProviderStore,
    RegistrationStore, ServerStore, TaskStore,
};
use crate::error::{ActivityError, DatabaseError, JobError, TaskError};
use crate::orchestrator::{
    EventInput, Job, JobEvent, JobStatus, NewJob, TransitionInput, require_positive_id,
    state_machine,
};
use crate::pki::{CaRecord, NodeCertificate};
use crate::servers::{ProviderRecord, ProvisioningUpdate, Server, ServerKey};
use crate::tasks::{Environment, NewTask, Node, Site, SiteImport, TaskJob, TaskStatus};

#[derive(Debug)]
struct TokenRow {
    server_id: i64,
    token_hash: String,
    expires_at: DateTime<Utc>,
    consumed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    jobs: BTreeMap<i64, Job>,
    next_job_id: i64,
    events: HashMap<i64, Vec<JobEvent>>,
    activity: Vec<Activity>,
    next_activity_id: i64,
    tokens: Vec<TokenRow>,
    ca: Vec<CaRecord>,
    certificates: Vec<NodeCertificate>,
    servers: HashMap<i64, Server>,
    server_keys: HashMap<i64, ServerKey>,
    providers: HashMap<i64, ProviderRecord>,
    tasks: Vec<TaskJob>,
    sites: HashMap<String, Site>,
    environments: HashMap<String, Environment>,
    nodes: HashMap<String, Node>,
}

impl State {
    fn job_mut(&mut self, id: i64) -> Result<&mut Job, JobError> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    /// The task if it is still running under `worker_id`.
    fn leased_task_mut(&mut self, id: &str, worker_id: &str) -> Option<&mut TaskJob> {
        self.tasks.iter_mut().find(|t| {
            t.id == id && t.status == TaskStatus::Running && t.locked_by.as_deref() == Some(worker_id)
        })
    }
}

/// Keep `updated_at` non-decreasing even if the wall clock steps back.
fn touch(previous: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(previous)
}

/// Thread-safe in-memory implementation of every store trait.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ==================== Seeding ====================
    //
    // Rows owned by other subsystems (servers, providers, sites) are created
    // through these helpers.

    /// Insert a job row verbatim, e.g. to simulate state left by a crash.
    pub fn insert_job(&self, job: Job) {
        let mut state = self.lock();
        state.next_job_id = state.next_job_id.max(job.id);
        state.jobs.insert(job.id, job);
    }

    pub fn insert_server(&self, server: Server) {
        self.lock().servers.insert(server.id, server);
    }

    pub fn insert_provider(&self, provider: ProviderRecord) {
        self.lock().providers.insert(provider.id, provider);
    }

    pub fn insert_site(&self, site: Site) {
        self.lock().sites.insert(site.id.clone(), site);
    }

    pub fn insert_environment(&self, environment: Environment) {
        self.lock()
            .environments
            .insert(environment.id.clone(), environment);
    }

    pub fn insert_node(&self, node: Node) {
        self.lock().nodes.insert(node.id.clone(), node);
    }

    /// Insert a task row verbatim.
    pub fn insert_task(&self, task: TaskJob) {
        self.lock().tasks.push(task);
    }

    pub fn site(&self, id: &str) -> Option<Site> {
        self.lock().sites.get(id).cloned()
    }

    pub fn environment(&self, id: &str) -> Option<Environment> {
        self.lock().environments.get(id).cloned()
    }

    pub fn certificate_count(&self) -> usize {
        self.lock().certificates.len()
    }
}

// ==================== Jobs ====================

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, input: NewJob) -> Result<Job, JobError> {
        let input = input.normalized()?;
        let mut state = self.lock();
        state.next_job_id += 1;
        let now = Utc::now();
        let job = Job {
            id: state.next_job_id,
            kind: input.kind,
            server_id: input.server_id,
            status: JobStatus::Queued,
            current_step: String::new(),
            retry_count: 0,
            last_error: None,
            payload: input.payload,
            command_id: None,
            created_at: now,
            updated_at: now,
        };
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: i64) -> Result<Job, JobError> {
        require_positive_id(id)?;
        self.lock()
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    async fn transition_job(&self, id: i64, input: TransitionInput) -> Result<Job, JobError> {
        require_positive_id(id)?;
        let input = input.normalized()?;
        let mut state = self.lock();
        let job = state.job_mut(id)?;
        state_machine::validate(job.status, input.to_status)?;
        job.status = input.to_status;
        job.current_step = input.current_step;
        job.retry_count = input.retry_count;
        job.last_error = input.last_error;
        job.updated_at = touch(job.updated_at);
        Ok(job.clone())
    }

    async fn advance_step(&self, id: i64, step: &str) -> Result<Job, JobError> {
        require_positive_id(id)?;
        let mut state = self.lock();
        let job = state.job_mut(id)?;
        if job.status.is_terminal() {
            return Err(JobError::Validation(format!(
                "cannot advance step of job {} in terminal status {}",
                id, job.status
            )));
        }
        job.current_step = step.trim().to_string();
        job.updated_at = touch(job.updated_at);
        Ok(job.clone())
    }

    async fn claim_next_job(&self) -> Result<Option<Job>, JobError> {
        let mut state = self.lock();
        let next = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);
        let Some(id) = next else {
            return Ok(None);
        };
        let job = state.job_mut(id)?;
        job.status = JobStatus::Preparing;
        job.updated_at = touch(job.updated_at);
        Ok(Some(job.clone()))
    }

    async fn append_event(&self, job_id: i64, input: EventInput) -> Result<JobEvent, JobError> {
        require_positive_id(job_id)?;
        let input = input.normalized()?;
        let mut state = self.lock();
        if !state.jobs.contains_key(&job_id) {
            return Err(JobError::NotFound(job_id.to_string()));
        }
        let events = state.events.entry(job_id).or_default();
        let seq = events.last().map(|e| e.seq).unwrap_or(0) + 1;
        let event = JobEvent {
            job_id,
            seq,
            event_type: input.event_type,
            level: input.level,
            step_key: input.step_key,
            status: input.status,
            message: input.message,
            payload: input.payload,
            occurred_at: Utc::now(),
        };
        events.push(event.clone());
        Ok(event)
    }

    async fn list_events(
        &self,
        job_id: i64,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<JobEvent>, JobError> {
        require_positive_id(job_id)?;
        let limit = if limit <= 0 { DEFAULT_EVENT_LIMIT } else { limit };
        let state = self.lock();
        Ok(state
            .events
            .get(&job_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.seq > after_seq)
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_all_events(&self, job_id: i64) -> Result<Vec<JobEvent>, JobError> {
        require_positive_id(job_id)?;
        Ok(self.lock().events.get(&job_id).cloned().unwrap_or_default())
    }

    async fn recover_stuck_jobs(&self) -> Result<u64, JobError> {
        let mut state = self.lock();
        let mut count = 0;
        for job in state.jobs.values_mut() {
            if matches!(job.status, JobStatus::Preparing | JobStatus::Running) {
                job.status = JobStatus::Queued;
                job.updated_at = touch(job.updated_at);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn list_all_jobs(&self) -> Result<Vec<Job>, JobError> {
        let mut jobs: Vec<Job> = self.lock().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(jobs)
    }

    async fn list_jobs_by_server(&self, server_id: i64) -> Result<Vec<Job>, JobError> {
        let mut jobs = self.list_all_jobs().await?;
        jobs.retain(|j| j.server_id == Some(server_id));
        Ok(jobs)
    }

    async fn get_latest_job_for_server(&self, server_id: i64) -> Result<Option<Job>, JobError> {
        Ok(self.list_jobs_by_server(server_id).await?.into_iter().next())
    }

    async fn set_command_id(&self, id: i64, command_id: &str) -> Result<(), JobError> {
        require_positive_id(id)?;
        let mut state = self.lock();
        let job = state.job_mut(id)?;
        job.command_id = Some(command_id.to_string());
        job.updated_at = touch(job.updated_at);
        Ok(())
    }

    async fn get_job_by_command_id(&self, command_id: &str) -> Result<Job, JobError> {
        self.lock()
            .jobs
            .values()
            .find(|j| j.command_id.as_deref() == Some(command_id))
            .cloned()
            .ok_or_else(|| JobError::NotFound(format!("with command id {}", command_id)))
    }
}

// ==================== Activity ====================

#[async_trait]
impl ActivityStore for MemoryStore {
    async fn emit(&self, input: EmitInput) -> Result<Activity, ActivityError> {
        let validated = input.validate()?;
        let mut state = self.lock();
        state.next_activity_id += 1;
        let activity = validated.into_activity(state.next_activity_id, Utc::now());
        state.activity.push(activity.clone());
        Ok(activity)
    }

    async fn get_activity(&self, id: i64) -> Result<Activity, ActivityError> {
        self.lock()
            .activity
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or(ActivityError::NotFound(id))
    }

    async fn list_activity(&self, filter: &ListFilter) -> Result<ActivityPage, ActivityError> {
        let limit = filter.effective_limit();
        let state = self.lock();
        let rows = state
            .activity
            .iter()
            .rev()
            .filter(|a| filter.cursor.is_none_or(|c| a.id < c) && filter.matches(a))
            .take(limit + 1)
            .cloned()
            .collect();
        Ok(ActivityPage::from_overfetch(rows, limit))
    }

    async fn list_activity_for_server(
        &self,
        server_id: i64,
        filter: &ListFilter,
    ) -> Result<ActivityPage, ActivityError> {
        let limit = filter.effective_limit();
        let state = self.lock();
        let rows = state
            .activity
            .iter()
            .rev()
            .filter(|a| {
                a.concerns_server(server_id)
                    && filter.cursor.is_none_or(|c| a.id < c)
                    && filter.category.is_none_or(|c| a.category == c)
                    && filter
                        .requires_attention
                        .is_none_or(|flag| a.requires_attention == flag)
                    && (!filter.unread_only || a.read_at.is_none())
            })
            .take(limit + 1)
            .cloned()
            .collect();
        Ok(ActivityPage::from_overfetch(rows, limit))
    }

    async fn mark_read(&self, id: i64) -> Result<(), ActivityError> {
        if id <= 0 {
            return Err(ActivityError::Validation(
                "id must be greater than zero".to_string(),
            ));
        }
        let mut state = self.lock();
        let row = state
            .activity
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(ActivityError::NotFound(id))?;
        if row.read_at.is_none() {
            row.read_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_all_read(&self, filter: &ListFilter) -> Result<u64, ActivityError> {
        let mut state = self.lock();
        let now = Utc::now();
        let mut count = 0;
        for row in state.activity.iter_mut().filter(|a| filter.matches_unread(a)) {
            row.read_at = Some(now);
            count += 1;
        }
        Ok(count)
    }

    async fn count_unread(&self, filter: &ListFilter) -> Result<i64, ActivityError> {
        let state = self.lock();
        Ok(state
            .activity
            .iter()
            .filter(|a| filter.matches_unread(a))
            .count() as i64)
    }

    async fn latest_activity_id(&self) -> Result<i64, ActivityError> {
        Ok(self.lock().activity.last().map(|a| a.id).unwrap_or(0))
    }

    async fn list_activity_since(
        &self,
        since_id: i64,
        limit: usize,
    ) -> Result<Vec<Activity>, ActivityError> {
        let limit = match limit {
            0 => crate::activity::DEFAULT_SINCE_LIMIT,
            n => n.min(crate::activity::MAX_LIST_LIMIT),
        };
        let state = self.lock();
        Ok(state
            .activity
            .iter()
            .filter(|a| a.id > since_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

// ==================== Registration Tokens ====================

#[async_trait]
impl RegistrationStore for MemoryStore {
    async fn insert_registration_token(
        &self,
        server_id: i64,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let mut state = self.lock();
        if state.tokens.iter().any(|t| t.token_hash == token_hash) {
            return Err(DatabaseError::Constraint(
                "duplicate registration token".to_string(),
            ));
        }
        state.tokens.push(TokenRow {
            server_id,
            token_hash: token_hash.to_string(),
            expires_at,
            consumed_at: None,
        });
        Ok(())
    }

    async fn consume_registration_token(
        &self,
        token_hash: &str,
        server_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut state = self.lock();
        let mut matching: Vec<&mut TokenRow> = state
            .tokens
            .iter_mut()
            .filter(|t| {
                bool::from(t.token_hash.as_bytes().ct_eq(token_hash.as_bytes()))
                    && t.server_id == server_id
                    && t.consumed_at.is_none()
                    && t.expires_at > now
            })
            .collect();
        if matching.len() != 1 {
            return Ok(false);
        }
        matching[0].consumed_at = Some(now);
        Ok(true)
    }

    async fn delete_expired_registration_tokens(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let mut state = self.lock();
        let before = state.tokens.len();
        state
            .tokens
            .retain(|t| !(t.expires_at < now && t.consumed_at.is_none()));
        Ok((before - state.tokens.len()) as u64)
    }
}

// ==================== Certificates ====================

#[async_trait]
impl CertificateStore for MemoryStore {
    async fn latest_ca(&self) -> Result<Option<CaRecord>, DatabaseError> {
        Ok(self.lock().ca.last().cloned())
    }

    async fn insert_ca(&self, record: &CaRecord) -> Result<(), DatabaseError> {
        self.lock().ca.push(record.clone());
        Ok(())
    }

    async fn insert_node_certificate(&self, cert: &NodeCertificate) -> Result<(), DatabaseError> {
        let mut state = self.lock();
        if state
            .certificates
            .iter()
            .any(|c| c.serial_number == cert.serial_number)
        {
            return Err(DatabaseError::Constraint(format!(
                "duplicate certificate serial {}",
                cert.serial_number
            )));
        }
        state.certificates.push(cert.clone());
        Ok(())
    }

    async fn valid_certificate_for_server(
        &self,
        server_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<NodeCertificate>, DatabaseError> {
        Ok(self
            .lock()
            .certificates
            .iter()
            .filter(|c| c.server_id == server_id && c.is_valid_at(now))
            .max_by_key(|c| c.issued_at)
            .cloned())
    }

    async fn is_revoked(&self, serial_number: &str) -> Result<bool, DatabaseError> {
        Ok(self
            .lock()
            .certificates
            .iter()
            .any(|c| c.serial_number == serial_number && c.revoked_at.is_some()))
    }

    async fn revoke_certificate(
        &self,
        serial_number: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut state = self.lock();
        match state
            .certificates
            .iter_mut()
            .find(|c| c.serial_number == serial_number && c.revoked_at.is_none())
        {
            Some(cert) => {
                cert.revoked_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ==================== Servers & Providers ====================

#[async_trait]
impl ServerStore for MemoryStore {
    async fn get_server(&self, id: i64) -> Result<Server, DatabaseError> {
        self.lock()
            .servers
            .get(&id)
            .cloned()
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "server",
                id: id.to_string(),
            })
    }

    async fn update_server_status(&self, id: i64, status: &str) -> Result<(), DatabaseError> {
        let mut state = self.lock();
        let server = state
            .servers
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "server",
                id: id.to_string(),
            })?;
        server.status = status.to_string();
        Ok(())
    }

    async fn update_provisioning(
        &self,
        id: i64,
        update: &ProvisioningUpdate,
    ) -> Result<(), DatabaseError> {
        let mut state = self.lock();
        let server = state
            .servers
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "server",
                id: id.to_string(),
            })?;
        server.status = update.status.clone();
        if update.provider_server_id.is_some() {
            server.provider_server_id = update.provider_server_id.clone();
        }
        if update.action_id.is_some() {
            server.action_id = update.action_id.clone();
        }
        if update.action_status.is_some() {
            server.action_status = update.action_status.clone();
        }
        if update.ipv4.is_some() {
            server.ipv4 = update.ipv4.clone();
        }
        if update.ipv6.is_some() {
            server.ipv6 = update.ipv6.clone();
        }
        Ok(())
    }

    async fn get_server_key(&self, server_id: i64) -> Result<Option<ServerKey>, DatabaseError> {
        Ok(self.lock().server_keys.get(&server_id).cloned())
    }

    async fn insert_server_key(&self, key: &ServerKey) -> Result<(), DatabaseError> {
        let mut state = self.lock();
        if state.server_keys.contains_key(&key.server_id) {
            return Err(DatabaseError::Constraint(format!(
                "server {} already has a key",
                key.server_id
            )));
        }
        state.server_keys.insert(key.server_id, key.clone());
        Ok(())
    }
}

#[async_trait]
impl ProviderStore for MemoryStore {
    async fn get_provider(&self, id: i64) -> Result<ProviderRecord, DatabaseError> {
        self.lock()
            .providers
            .get(&id)
            .cloned()
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "provider",
                id: id.to_string(),
            })
    }
}

// ==================== Queued Tasks ====================

#[async_trait]
impl TaskStore for MemoryStore {
    async fn enqueue_task(&self, task: NewTask) -> Result<TaskJob, TaskError> {
        let task = task.normalized()?;
        let mut state = self.lock();
        if let Some(message) = state.tasks.iter().find_map(|t| task.conflict_with(t)) {
            return Err(TaskError::Conflict(message));
        }
        let mut job = TaskJob::queued(task, Utc::now());
        while state.tasks.iter().any(|t| t.id == job.id) {
            job.id.push('0');
        }
        state.tasks.push(job.clone());
        Ok(job)
    }

    async fn get_task(&self, id: &str) -> Result<TaskJob, TaskError> {
        self.lock()
            .tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    async fn list_tasks(&self, limit: usize) -> Result<Vec<TaskJob>, TaskError> {
        let mut tasks = self.lock().tasks.clone();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn cancel_task(&self, id: &str, now: DateTime<Utc>) -> Result<TaskJob, TaskError> {
        let mut state = self.lock();
        let task = state
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        if !task.status.is_active() {
            return Err(TaskError::NotCancellable {
                id: id.to_string(),
                status: task.status.to_string(),
            });
        }
        task.status = TaskStatus::Cancelled;
        task.finished_at = Some(now);
        task.locked_at = None;
        task.locked_by = None;
        task.updated_at = now;
        Ok(task.clone())
    }

    async fn lock_next_task(
        &self,
        job_type: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskJob>, DatabaseError> {
        let mut state = self.lock();
        let next = state
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                t.job_type == job_type
                    && t.status == TaskStatus::Queued
                    && t.run_after.is_none_or(|at| at <= now)
            })
            .min_by_key(|(idx, t)| (t.created_at, *idx))
            .map(|(idx, _)| idx);
        let Some(idx) = next else {
            return Ok(None);
        };
        let task = &mut state.tasks[idx];
        task.status = TaskStatus::Running;
        task.attempt_count += 1;
        task.locked_at = Some(now);
        task.locked_by = Some(worker_id.to_string());
        task.started_at = Some(now);
        task.updated_at = now;
        task.run_after = None;
        Ok(Some(task.clone()))
    }

    async fn requeue_task(
        &self,
        id: &str,
        worker_id: &str,
        run_after: DateTime<Utc>,
        error_code: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut state = self.lock();
        let Some(task) = state.leased_task_mut(id, worker_id) else {
            return Ok(false);
        };
        task.status = TaskStatus::Queued;
        task.run_after = Some(run_after);
        task.error_code = Some(error_code.to_string());
        task.error_message = Some(error_message.to_string());
        task.locked_at = None;
        task.locked_by = None;
        task.updated_at = now;
        Ok(true)
    }

    async fn fail_task(
        &self,
        id: &str,
        worker_id: &str,
        error_code: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut state = self.lock();
        let Some(task) = state.leased_task_mut(id, worker_id) else {
            return Ok(false);
        };
        settle_failed(task, error_code, error_message, now);
        Ok(true)
    }

    async fn succeed_task(&self, id: &str, worker_id: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let mut state = self.lock();
        let Some(task) = state.leased_task_mut(id, worker_id) else {
            return Ok(false);
        };
        settle_succeeded(task, now);
        Ok(true)
    }

    async fn node_hostname(&self, node_id: &str) -> Result<Option<String>, DatabaseError> {
        Ok(self.lock().nodes.get(node_id).map(|n| n.hostname.clone()))
    }

    async fn complete_site_import(
        &self,
        import: &SiteImport,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut state = self.lock();
        let Some(task) = state.leased_task_mut(&import.job_id, worker_id) else {
            return Ok(false);
        };
        settle_succeeded(task, now);
        if let Some(env) = state
            .environments
            .get_mut(&import.environment_id)
            .filter(|e| e.site_id == import.site_id)
        {
            env.status = "active".to_string();
            env.current_release_id = Some(import.release_id.clone());
            env.state_version += 1;
        }
        if let Some(site) = state.sites.get_mut(&import.site_id) {
            site.status = "active".to_string();
            site.state_version += 1;
        }
        Ok(true)
    }

    async fn fail_site_import(
        &self,
        import: &SiteImport,
        worker_id: &str,
        error_code: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut state = self.lock();
        let Some(task) = state.leased_task_mut(&import.job_id, worker_id) else {
            return Ok(false);
        };
        settle_failed(task, error_code, error_message, now);
        if let Some(env) = state
            .environments
            .get_mut(&import.environment_id)
            .filter(|e| e.site_id == import.site_id)
        {
            env.status = "failed".to_string();
            env.state_version += 1;
        }
        if let Some(site) = state.sites.get_mut(&import.site_id) {
            site.status = "failed".to_string();
            site.state_version += 1;
        }
        Ok(true)
    }
}

fn settle_succeeded(task: &mut TaskJob, now: DateTime<Utc>) {
    task.status = TaskStatus::Succeeded;
    task.finished_at = Some(now);
    task.error_code = None;
    task.error_message = None;
    task.locked_at = None;
    task.locked_by = None;
    task.updated_at = now;
}

fn settle_failed(task: &mut TaskJob, error_code: &str, error_message: &str, now: DateTime<Utc>) {
    task.status = TaskStatus::Failed;
    task.finished_at = Some(now);
    task.error_code = Some(error_code.to_string());
    task.error_message = Some(error_message.to_string());
    task.locked_at = None;
    task.locked_by = None;
    task.updated_at = now;
}
