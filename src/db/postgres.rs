//! PostgreSQL backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use secrecy::SecretString;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};

use crate::activity::{Activity, ActivityPage, EmitInput, ListFilter};
use crate::config::DatabaseConfig;
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
use crate::tasks::{NewTask, SiteImport, TaskJob, TaskStatus};

mod embedded {
    refinery::embed_migrations!("migrations");
}

const JOB_COLUMNS: &str = "id, kind, server_id, status, current_step, retry_count, last_error, \
     payload, command_id, created_at, updated_at";

const EVENT_COLUMNS: &str =
    "job_id, seq, event_type, level, step_key, status, message, payload, occurred_at";

const ACTIVITY_COLUMNS: &str = "id, event_type, category, level, resource_type, resource_id, \
     parent_resource_type, parent_resource_id, actor_type, actor_id, title, message, payload, \
     requires_attention, read_at, created_at";

const TASK_COLUMNS: &str = "id, job_type, status, site_id, environment_id, node_id, payload, \
     attempt_count, max_attempts, run_after, locked_at, locked_by, started_at, finished_at, \
     error_code, error_message, created_at, updated_at";

const CERT_COLUMNS: &str =
    "server_id, fingerprint, serial_number, certificate_der, issued_at, expires_at, revoked_at";

/// Database store for the control plane.
pub struct Store {
    pool: Pool,
}

impl Store {
    /// Create a new store and connect to the database.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let mut cfg = Config::new();
        cfg.url = Some(config.url().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;

        // Test connection
        let _ = pool.get().await?;

        Ok(Self { pool })
    }

    /// Apply the embedded schema migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut client = self.conn().await?;
        let report = embedded::migrations::runner()
            .run_async(&mut **client)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        tracing::info!(
            applied = report.applied_migrations().len(),
            "Database migrations complete"
        );
        Ok(())
    }

    /// Get a connection from the pool.
    pub async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }
}

// ==================== Row mapping ====================

fn parse_column<T: std::str::FromStr>(row: &Row, column: &str) -> Result<T, DatabaseError>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(column);
    raw.parse::<T>()
        .map_err(|e| DatabaseError::Serialization(format!("{}: {}", column, e)))
}

fn parse_optional<T: std::str::FromStr>(
    row: &Row,
    column: &str,
) -> Result<Option<T>, DatabaseError>
where
    T::Err: std::fmt::Display,
{
    let raw: Option<String> = row.get(column);
    raw.map(|v| {
        v.parse::<T>()
            .map_err(|e| DatabaseError::Serialization(format!("{}: {}", column, e)))
    })
    .transpose()
}

fn row_to_job(row: &Row) -> Result<Job, DatabaseError> {
    Ok(Job {
        id: row.get("id"),
        kind: row.get("kind"),
        server_id: row.get("server_id"),
        status: parse_column(row, "status")?,
        current_step: row.get("current_step"),
        retry_count: row.get("retry_count"),
        last_error: row.get("last_error"),
        payload: row.get("payload"),
        command_id: row.get("command_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_event(row: &Row) -> Result<JobEvent, DatabaseError> {
    Ok(JobEvent {
        job_id: row.get("job_id"),
        seq: row.get("seq"),
        event_type: row.get("event_type"),
        level: parse_column(row, "level")?,
        step_key: row.get("step_key"),
        status: row.get("status"),
        message: row.get("message"),
        payload: row.get("payload"),
        occurred_at: row.get("occurred_at"),
    })
}

fn row_to_activity(row: &Row) -> Result<Activity, DatabaseError> {
    Ok(Activity {
        id: row.get("id"),
        event_type: parse_column(row, "event_type")?,
        category: parse_column(row, "category")?,
        level: parse_column(row, "level")?,
        resource_type: parse_optional(row, "resource_type")?,
        resource_id: row.get("resource_id"),
        parent_resource_type: parse_optional(row, "parent_resource_type")?,
        parent_resource_id: row.get("parent_resource_id"),
        actor_type: parse_column(row, "actor_type")?,
        actor_id: row.get("actor_id"),
        title: row.get("title"),
        message: row.get("message"),
        payload: row.get("payload"),
        requires_attention: row.get("requires_attention"),
        read_at: row.get("read_at"),
        created_at: row.get("created_at"),
    })
}

fn row_to_task(row: &Row) -> Result<TaskJob, DatabaseError> {
    Ok(TaskJob {
        id: row.get("id"),
        job_type: row.get("job_type"),
        status: parse_column::<TaskStatus>(row, "status")?,
        site_id: row.get("site_id"),
        environment_id: row.get("environment_id"),
        node_id: row.get("node_id"),
        payload: row.get("payload"),
        attempt_count: row.get("attempt_count"),
        max_attempts: row.get("max_attempts"),
        run_after: row.get("run_after"),
        locked_at: row.get("locked_at"),
        locked_by: row.get("locked_by"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        error_code: row.get("error_code"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_certificate(row: &Row) -> NodeCertificate {
    NodeCertificate {
        server_id: row.get("server_id"),
        fingerprint: row.get("fingerprint"),
        serial_number: row.get("serial_number"),
        certificate_der: row.get("certificate_der"),
        issued_at: row.get("issued_at"),
        expires_at: row.get("expires_at"),
        revoked_at: row.get("revoked_at"),
    }
}

fn row_to_server(row: &Row) -> Server {
    Server {
        id: row.get("id"),
        provider_id: row.get("provider_id"),
        name: row.get("name"),
        location: row.get("location"),
        server_type: row.get("server_type"),
        image: row.get("image"),
        status: row.get("status"),
        provider_server_id: row.get("provider_server_id"),
        action_id: row.get("action_id"),
        action_status: row.get("action_status"),
        ipv4: row.get("ipv4"),
        ipv6: row.get("ipv6"),
    }
}

/// Dynamic `WHERE` clause with positional parameters.
#[derive(Default)]
struct SqlFilter {
    clauses: Vec<String>,
    params: Vec<Box<dyn ToSql + Sync + Send>>,
}

impl SqlFilter {
    /// Bind a value and return its placeholder.
    fn bind<T: ToSql + Sync + Send + 'static>(&mut self, value: T) -> String {
        self.params.push(Box::new(value));
        format!("${}", self.params.len())
    }

    fn push(&mut self, clause: String) {
        self.clauses.push(clause);
    }

    fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    fn params(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect()
    }

    /// Category, resource and parent constraints shared by all activity reads.
    fn activity_scope(&mut self, filter: &ListFilter) {
        if let Some(category) = filter.category {
            let p = self.bind(category.as_str().to_string());
            self.push(format!("category = {}", p));
        }
        if let Some(kind) = filter.resource_type {
            let p = self.bind(kind.as_str().to_string());
            self.push(format!("resource_type = {}", p));
        }
        if let Some(id) = filter.resource_id {
            let p = self.bind(id);
            self.push(format!("resource_id = {}", p));
        }
        if let Some(kind) = filter.parent_resource_type {
            let p = self.bind(kind.as_str().to_string());
            self.push(format!("parent_resource_type = {}", p));
        }
        if let Some(id) = filter.parent_resource_id {
            let p = self.bind(id);
            self.push(format!("parent_resource_id = {}", p));
        }
    }

    fn activity_cursor(&mut self, filter: &ListFilter) {
        if let Some(cursor) = filter.cursor {
            let p = self.bind(cursor);
            self.push(format!("id < {}", p));
        }
    }

    fn activity_flags(&mut self, filter: &ListFilter) {
        if let Some(flag) = filter.requires_attention {
            let p = self.bind(flag);
            self.push(format!("requires_attention = {}", p));
        }
        if filter.unread_only {
            self.push("read_at IS NULL".to_string());
        }
    }

    /// Predicate for unread counting and bulk mark-read.
    fn activity_unread(&mut self, filter: &ListFilter) {
        self.push("read_at IS NULL".to_string());
        self.activity_scope(filter);
        if filter.requires_attention == Some(true) {
            self.push("requires_attention = TRUE".to_string());
        }
    }
}

// ==================== Jobs ====================

#[async_trait]
impl JobStore for Store {
    async fn create_job(&self, input: NewJob) -> Result<Job, JobError> {
        let input = input.normalized()?;
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                &format!(
                    r#"
                    INSERT INTO jobs (kind, server_id, payload)
                    VALUES ($1, $2, $3)
                    RETURNING {}
                    "#,
                    JOB_COLUMNS
                ),
                &[&input.kind, &input.server_id, &input.payload],
            )
            .await
            .map_err(DatabaseError::from)?;
        Ok(row_to_job(&row)?)
    }

    async fn get_job(&self, id: i64) -> Result<Job, JobError> {
        require_positive_id(id)?;
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS),
                &[&id],
            )
            .await
            .map_err(DatabaseError::from)?;
        match row {
            Some(row) => Ok(row_to_job(&row)?),
            None => Err(JobError::NotFound(id.to_string())),
        }
    }

    async fn transition_job(&self, id: i64, input: TransitionInput) -> Result<Job, JobError> {
        require_positive_id(id)?;
        let input = input.normalized()?;
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await.map_err(DatabaseError::from)?;

        let current = tx
            .query_opt("SELECT status FROM jobs WHERE id = $1 FOR UPDATE", &[&id])
            .await
            .map_err(DatabaseError::from)?
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let from: JobStatus = parse_column(&current, "status")?;
        state_machine::validate(from, input.to_status)?;

        let row = tx
            .query_one(
                &format!(
                    r#"
                    UPDATE jobs
                    SET status = $2, current_step = $3, retry_count = $4, last_error = $5,
                        updated_at = GREATEST(NOW(), updated_at)
                    WHERE id = $1
                    RETURNING {}
                    "#,
                    JOB_COLUMNS
                ),
                &[
                    &id,
                    &input.to_status.as_str(),
                    &input.current_step,
                    &input.retry_count,
                    &input.last_error,
                ],
            )
            .await
            .map_err(DatabaseError::from)?;
        tx.commit().await.map_err(DatabaseError::from)?;
        Ok(row_to_job(&row)?)
    }

    async fn advance_step(&self, id: i64, step: &str) -> Result<Job, JobError> {
        require_positive_id(id)?;
        let conn = self.conn().await?;
        let terminal: Vec<&str> = JobStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| s.as_str())
            .collect();
        let row = conn
            .query_opt(
                &format!(
                    r#"
                    UPDATE jobs
                    SET current_step = $2, updated_at = GREATEST(NOW(), updated_at)
                    WHERE id = $1 AND NOT (status = ANY($3))
                    RETURNING {}
                    "#,
                    JOB_COLUMNS
                ),
                &[&id, &step.trim(), &terminal],
            )
            .await
            .map_err(DatabaseError::from)?;
        match row {
            Some(row) => Ok(row_to_job(&row)?),
            None => {
                // Distinguish a missing job from a terminal one.
                let job = self.get_job(id).await?;
                Err(JobError::Validation(format!(
                    "cannot advance step of job {} in terminal status {}",
                    id, job.status
                )))
            }
        }
    }

    async fn claim_next_job(&self) -> Result<Option<Job>, JobError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    r#"
                    UPDATE jobs
                    SET status = 'preparing', updated_at = GREATEST(NOW(), updated_at)
                    WHERE id = (
                        SELECT id FROM jobs
                        WHERE status = 'queued'
                        ORDER BY created_at, id
                        LIMIT 1
                        FOR UPDATE SKIP LOCKED
                    )
                    RETURNING {}
                    "#,
                    JOB_COLUMNS
                ),
                &[],
            )
            .await
            .map_err(DatabaseError::from)?;
        Ok(row.as_ref().map(row_to_job).transpose()?)
    }

    async fn append_event(&self, job_id: i64, input: EventInput) -> Result<JobEvent, JobError> {
        require_positive_id(job_id)?;
        let input = input.normalized()?;
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await.map_err(DatabaseError::from)?;

        // Serialise appenders on the parent row so seq stays contiguous.
        tx.query_opt("SELECT id FROM jobs WHERE id = $1 FOR UPDATE", &[&job_id])
            .await
            .map_err(DatabaseError::from)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

        let row = tx
            .query_one(
                &format!(
                    r#"
                    INSERT INTO job_events
                        (job_id, seq, event_type, level, step_key, status, message, payload)
                    SELECT $1, COALESCE(MAX(seq), 0) + 1, $2, $3, $4, $5, $6, $7
                    FROM job_events WHERE job_id = $1
                    RETURNING {}
                    "#,
                    EVENT_COLUMNS
                ),
                &[
                    &job_id,
                    &input.event_type,
                    &input.level.as_str(),
                    &input.step_key,
                    &input.status,
                    &input.message,
                    &input.payload,
                ],
            )
            .await
            .map_err(DatabaseError::from)?;
        tx.commit().await.map_err(DatabaseError::from)?;
        Ok(row_to_event(&row)?)
    }

    async fn list_events(
        &self,
        job_id: i64,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<JobEvent>, JobError> {
        require_positive_id(job_id)?;
        let limit = if limit <= 0 { DEFAULT_EVENT_LIMIT } else { limit };
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    r#"
                    SELECT {} FROM job_events
                    WHERE job_id = $1 AND seq > $2
                    ORDER BY seq ASC
                    LIMIT $3
                    "#,
                    EVENT_COLUMNS
                ),
                &[&job_id, &after_seq, &limit],
            )
            .await
            .map_err(DatabaseError::from)?;
        Ok(rows
            .iter()
            .map(row_to_event)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn list_all_events(&self, job_id: i64) -> Result<Vec<JobEvent>, JobError> {
        require_positive_id(job_id)?;
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM job_events WHERE job_id = $1 ORDER BY seq ASC",
                    EVENT_COLUMNS
                ),
                &[&job_id],
            )
            .await
            .map_err(DatabaseError::from)?;
        Ok(rows
            .iter()
            .map(row_to_event)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn recover_stuck_jobs(&self) -> Result<u64, JobError> {
        let conn = self.conn().await?;
        let count = conn
            .execute(
                r#"
                UPDATE jobs
                SET status = 'queued', updated_at = GREATEST(NOW(), updated_at)
                WHERE status IN ('preparing', 'running')
                "#,
                &[],
            )
            .await
            .map_err(DatabaseError::from)?;
        Ok(count)
    }

    async fn list_all_jobs(&self) -> Result<Vec<Job>, JobError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM jobs ORDER BY created_at DESC, id DESC",
                    JOB_COLUMNS
                ),
                &[],
            )
            .await
            .map_err(DatabaseError::from)?;
        Ok(rows.iter().map(row_to_job).collect::<Result<Vec<_>, _>>()?)
    }

    async fn list_jobs_by_server(&self, server_id: i64) -> Result<Vec<Job>, JobError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    r#"
                    SELECT {} FROM jobs
                    WHERE server_id = $1
                    ORDER BY created_at DESC, id DESC
                    "#,
                    JOB_COLUMNS
                ),
                &[&server_id],
            )
            .await
            .map_err(DatabaseError::from)?;
        Ok(rows.iter().map(row_to_job).collect::<Result<Vec<_>, _>>()?)
    }

    async fn get_latest_job_for_server(&self, server_id: i64) -> Result<Option<Job>, JobError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    r#"
                    SELECT {} FROM jobs
                    WHERE server_id = $1
                    ORDER BY created_at DESC, id DESC
                    LIMIT 1
                    "#,
                    JOB_COLUMNS
                ),
                &[&server_id],
            )
            .await
            .map_err(DatabaseError::from)?;
        Ok(row.as_ref().map(row_to_job).transpose()?)
    }

    async fn set_command_id(&self, id: i64, command_id: &str) -> Result<(), JobError> {
        require_positive_id(id)?;
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                r#"
                UPDATE jobs SET command_id = $2, updated_at = GREATEST(NOW(), updated_at)
                WHERE id = $1
                "#,
                &[&id, &command_id],
            )
            .await
            .map_err(DatabaseError::from)?;
        if updated == 0 {
            return Err(JobError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn get_job_by_command_id(&self, command_id: &str) -> Result<Job, JobError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM jobs WHERE command_id = $1", JOB_COLUMNS),
                &[&command_id],
            )
            .await
            .map_err(DatabaseError::from)?;
        match row {
            Some(row) => Ok(row_to_job(&row)?),
            None => Err(JobError::NotFound(format!("with command id {}", command_id))),
        }
    }
}

// ==================== Activity ====================

#[async_trait]
impl ActivityStore for Store {
    async fn emit(&self, input: EmitInput) -> Result<Activity, ActivityError> {
        let v = input.validate()?;
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                &format!(
                    r#"
                    INSERT INTO activity (
                        event_type, category, level, resource_type, resource_id,
                        parent_resource_type, parent_resource_id, actor_type, actor_id,
                        title, message, payload, requires_attention
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                    RETURNING {}
                    "#,
                    ACTIVITY_COLUMNS
                ),
                &[
                    &v.event_type.as_str(),
                    &v.category.as_str(),
                    &v.level.as_str(),
                    &v.resource.map(|r| r.kind.as_str()),
                    &v.resource.map(|r| r.id),
                    &v.parent.map(|r| r.kind.as_str()),
                    &v.parent.map(|r| r.id),
                    &v.actor_type.as_str(),
                    &v.actor_id,
                    &v.title,
                    &v.message,
                    &v.payload,
                    &v.requires_attention,
                ],
            )
            .await
            .map_err(DatabaseError::from)?;
        Ok(row_to_activity(&row)?)
    }

    async fn get_activity(&self, id: i64) -> Result<Activity, ActivityError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM activity WHERE id = $1", ACTIVITY_COLUMNS),
                &[&id],
            )
            .await
            .map_err(DatabaseError::from)?;
        match row {
            Some(row) => Ok(row_to_activity(&row)?),
            None => Err(ActivityError::NotFound(id)),
        }
    }

    async fn list_activity(&self, filter: &ListFilter) -> Result<ActivityPage, ActivityError> {
        let limit = filter.effective_limit();
        let mut q = SqlFilter::default();
        q.activity_cursor(filter);
        q.activity_scope(filter);
        q.activity_flags(filter);
        let fetch = q.bind((limit + 1) as i64);
        let sql = format!(
            "SELECT {} FROM activity{} ORDER BY id DESC LIMIT {}",
            ACTIVITY_COLUMNS,
            q.where_sql(),
            fetch
        );

        let conn = self.conn().await?;
        let rows = conn
            .query(&sql, &q.params())
            .await
            .map_err(DatabaseError::from)?;
        let rows = rows
            .iter()
            .map(row_to_activity)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ActivityPage::from_overfetch(rows, limit))
    }

    async fn list_activity_for_server(
        &self,
        server_id: i64,
        filter: &ListFilter,
    ) -> Result<ActivityPage, ActivityError> {
        let limit = filter.effective_limit();
        let mut q = SqlFilter::default();
        let p = q.bind(server_id);
        q.push(format!(
            "((resource_type = 'server' AND resource_id = {p}) \
             OR (parent_resource_type = 'server' AND parent_resource_id = {p}))"
        ));
        q.activity_cursor(filter);
        if let Some(category) = filter.category {
            let p = q.bind(category.as_str().to_string());
            q.push(format!("category = {}", p));
        }
        q.activity_flags(filter);
        let fetch = q.bind((limit + 1) as i64);
        let sql = format!(
            "SELECT {} FROM activity{} ORDER BY id DESC LIMIT {}",
            ACTIVITY_COLUMNS,
            q.where_sql(),
            fetch
        );

        let conn = self.conn().await?;
        let rows = conn
            .query(&sql, &q.params())
            .await
            .map_err(DatabaseError::from)?;
        let rows = rows
            .iter()
            .map(row_to_activity)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ActivityPage::from_overfetch(rows, limit))
    }

    async fn mark_read(&self, id: i64) -> Result<(), ActivityError> {
        if id <= 0 {
            return Err(ActivityError::Validation(
                "id must be greater than zero".to_string(),
            ));
        }
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                r#"
                UPDATE activity SET read_at = COALESCE(read_at, NOW())
                WHERE id = $1
                RETURNING id
                "#,
                &[&id],
            )
            .await
            .map_err(DatabaseError::from)?;
        match row {
            Some(_) => Ok(()),
            None => Err(ActivityError::NotFound(id)),
        }
    }

    async fn mark_all_read(&self, filter: &ListFilter) -> Result<u64, ActivityError> {
        let mut q = SqlFilter::default();
        q.activity_unread(filter);
        let sql = format!("UPDATE activity SET read_at = NOW(){}", q.where_sql());
        let conn = self.conn().await?;
        let count = conn
            .execute(&sql, &q.params())
            .await
            .map_err(DatabaseError::from)?;
        Ok(count)
    }

    async fn count_unread(&self, filter: &ListFilter) -> Result<i64, ActivityError> {
        let mut q = SqlFilter::default();
        q.activity_unread(filter);
        let sql = format!("SELECT COUNT(*) FROM activity{}", q.where_sql());
        let conn = self.conn().await?;
        let row = conn
            .query_one(&sql, &q.params())
            .await
            .map_err(DatabaseError::from)?;
        Ok(row.get(0))
    }

    async fn latest_activity_id(&self) -> Result<i64, ActivityError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one("SELECT COALESCE(MAX(id), 0) FROM activity", &[])
            .await
            .map_err(DatabaseError::from)?;
        Ok(row.get(0))
    }

    async fn list_activity_since(
        &self,
        since_id: i64,
        limit: usize,
    ) -> Result<Vec<Activity>, ActivityError> {
        let limit = match limit {
            0 => crate::activity::DEFAULT_SINCE_LIMIT,
            n => n.min(crate::activity::MAX_LIST_LIMIT),
        } as i64;
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM activity WHERE id > $1 ORDER BY id ASC LIMIT $2",
                    ACTIVITY_COLUMNS
                ),
                &[&since_id, &limit],
            )
            .await
            .map_err(DatabaseError::from)?;
        Ok(rows
            .iter()
            .map(row_to_activity)
            .collect::<Result<Vec<_>, _>>()?)
    }
}

// ==================== Registration Tokens ====================

#[async_trait]
impl RegistrationStore for Store {
    async fn insert_registration_token(
        &self,
        server_id: i64,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO registration_tokens (server_id, token_hash, expires_at)
            VALUES ($1, $2, $3)
            "#,
            &[&server_id, &token_hash, &expires_at],
        )
        .await?;
        Ok(())
    }

    async fn consume_registration_token(
        &self,
        token_hash: &str,
        server_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                r#"
                UPDATE registration_tokens
                SET consumed_at = $3
                WHERE token_hash = $1
                  AND server_id = $2
                  AND consumed_at IS NULL
                  AND expires_at > $3
                "#,
                &[&token_hash, &server_id, &now],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn delete_expired_registration_tokens(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let conn = self.conn().await?;
        let deleted = conn
            .execute(
                r#"
                DELETE FROM registration_tokens
                WHERE expires_at < $1 AND consumed_at IS NULL
                "#,
                &[&now],
            )
            .await?;
        Ok(deleted)
    }
}

// ==================== Certificates ====================

#[async_trait]
impl CertificateStore for Store {
    async fn latest_ca(&self) -> Result<Option<CaRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                r#"
                SELECT fingerprint, certificate_der, encryption_key_id, created_at
                FROM ca_certificates
                ORDER BY id DESC
                LIMIT 1
                "#,
                &[],
            )
            .await?;
        Ok(row.map(|row| CaRecord {
            fingerprint: row.get("fingerprint"),
            certificate_der: row.get("certificate_der"),
            encryption_key_id: row.get("encryption_key_id"),
            created_at: row.get("created_at"),
        }))
    }

    async fn insert_ca(&self, record: &CaRecord) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO ca_certificates (fingerprint, certificate_der, encryption_key_id, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
            &[
                &record.fingerprint,
                &record.certificate_der,
                &record.encryption_key_id,
                &record.created_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn insert_node_certificate(&self, cert: &NodeCertificate) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO node_certificates
                (server_id, fingerprint, serial_number, certificate_der, issued_at, expires_at, revoked_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
            &[
                &cert.server_id,
                &cert.fingerprint,
                &cert.serial_number,
                &cert.certificate_der,
                &cert.issued_at,
                &cert.expires_at,
                &cert.revoked_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn valid_certificate_for_server(
        &self,
        server_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<NodeCertificate>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    r#"
                    SELECT {} FROM node_certificates
                    WHERE server_id = $1 AND revoked_at IS NULL AND expires_at > $2
                    ORDER BY issued_at DESC
                    LIMIT 1
                    "#,
                    CERT_COLUMNS
                ),
                &[&server_id, &now],
            )
            .await?;
        Ok(row.as_ref().map(row_to_certificate))
    }

    async fn is_revoked(&self, serial_number: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                r#"
                SELECT EXISTS(
                    SELECT 1 FROM node_certificates
                    WHERE serial_number = $1 AND revoked_at IS NOT NULL
                )
                "#,
                &[&serial_number],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn revoke_certificate(
        &self,
        serial_number: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                r#"
                UPDATE node_certificates SET revoked_at = $2
                WHERE serial_number = $1 AND revoked_at IS NULL
                "#,
                &[&serial_number, &now],
            )
            .await?;
        Ok(updated > 0)
    }
}

// ==================== Servers & Providers ====================

#[async_trait]
impl ServerStore for Store {
    async fn get_server(&self, id: i64) -> Result<Server, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                r#"
                SELECT id, provider_id, name, location, server_type, image, status,
                       provider_server_id, action_id, action_status, ipv4, ipv6
                FROM servers WHERE id = $1
                "#,
                &[&id],
            )
            .await?;
        row.as_ref()
            .map(row_to_server)
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "server",
                id: id.to_string(),
            })
    }

    async fn update_server_status(&self, id: i64, status: &str) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE servers SET status = $2, updated_at = NOW() WHERE id = $1",
                &[&id, &status],
            )
            .await?;
        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "server",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_provisioning(
        &self,
        id: i64,
        update: &ProvisioningUpdate,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                r#"
                UPDATE servers SET
                    status = $2,
                    provider_server_id = COALESCE($3, provider_server_id),
                    action_id = COALESCE($4, action_id),
                    action_status = COALESCE($5, action_status),
                    ipv4 = COALESCE($6, ipv4),
                    ipv6 = COALESCE($7, ipv6),
                    updated_at = NOW()
                WHERE id = $1
                "#,
                &[
                    &id,
                    &update.status,
                    &update.provider_server_id,
                    &update.action_id,
                    &update.action_status,
                    &update.ipv4,
                    &update.ipv6,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "server",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_server_key(&self, server_id: i64) -> Result<Option<ServerKey>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                r#"
                SELECT server_id, public_key, private_key_encrypted, encryption_key_id, created_at
                FROM server_keys WHERE server_id = $1
                "#,
                &[&server_id],
            )
            .await?;
        Ok(row.map(|row| ServerKey {
            server_id: row.get("server_id"),
            public_key: row.get("public_key"),
            private_key_encrypted: row.get("private_key_encrypted"),
            encryption_key_id: row.get("encryption_key_id"),
            created_at: row.get("created_at"),
        }))
    }

    async fn insert_server_key(&self, key: &ServerKey) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO server_keys
                (server_id, public_key, private_key_encrypted, encryption_key_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
            &[
                &key.server_id,
                &key.public_key,
                &key.private_key_encrypted,
                &key.encryption_key_id,
                &key.created_at,
            ],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ProviderStore for Store {
    async fn get_provider(&self, id: i64) -> Result<ProviderRecord, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, type, name, api_token FROM providers WHERE id = $1",
                &[&id],
            )
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "provider",
                id: id.to_string(),
            })?;
        Ok(ProviderRecord {
            id: row.get("id"),
            provider_type: row.get("type"),
            name: row.get("name"),
            api_token: SecretString::from(row.get::<_, String>("api_token")),
        })
    }
}

// ==================== Queued Tasks ====================

#[async_trait]
impl TaskStore for Store {
    async fn enqueue_task(&self, task: NewTask) -> Result<TaskJob, TaskError> {
        let task = task.normalized()?;
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await.map_err(DatabaseError::from)?;

        // Serialise enqueuers so the active-job check cannot race.
        tx.batch_execute("LOCK TABLE task_jobs IN SHARE ROW EXCLUSIVE MODE")
            .await
            .map_err(DatabaseError::from)?;

        let active = tx
            .query(
                &format!(
                    r#"
                    SELECT {} FROM task_jobs
                    WHERE status IN ('queued', 'running')
                      AND (($1::TEXT IS NOT NULL AND site_id = $1)
                        OR ($2::TEXT IS NOT NULL AND node_id = $2))
                    "#,
                    TASK_COLUMNS
                ),
                &[&task.site_id, &task.node_id],
            )
            .await
            .map_err(DatabaseError::from)?;
        for row in &active {
            let existing = row_to_task(row)?;
            if let Some(message) = task.conflict_with(&existing) {
                return Err(TaskError::Conflict(message));
            }
        }

        let job = TaskJob::queued(task, Utc::now());
        tx.execute(
            r#"
            INSERT INTO task_jobs (
                id, job_type, status, site_id, environment_id, node_id, payload,
                attempt_count, max_attempts, created_at, updated_at
            )
            VALUES ($1, $2, 'queued', $3, $4, $5, $6, 0, $7, $8, $8)
            "#,
            &[
                &job.id,
                &job.job_type,
                &job.site_id,
                &job.environment_id,
                &job.node_id,
                &job.payload,
                &job.max_attempts,
                &job.created_at,
            ],
        )
        .await
        .map_err(DatabaseError::from)?;
        tx.commit().await.map_err(DatabaseError::from)?;
        Ok(job)
    }

    async fn get_task(&self, id: &str) -> Result<TaskJob, TaskError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM task_jobs WHERE id = $1", TASK_COLUMNS),
                &[&id],
            )
            .await
            .map_err(DatabaseError::from)?;
        match row {
            Some(row) => Ok(row_to_task(&row)?),
            None => Err(TaskError::NotFound(id.to_string())),
        }
    }

    async fn list_tasks(&self, limit: usize) -> Result<Vec<TaskJob>, TaskError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM task_jobs ORDER BY created_at DESC LIMIT $1",
                    TASK_COLUMNS
                ),
                &[&(limit as i64)],
            )
            .await
            .map_err(DatabaseError::from)?;
        Ok(rows.iter().map(row_to_task).collect::<Result<Vec<_>, _>>()?)
    }

    async fn cancel_task(&self, id: &str, now: DateTime<Utc>) -> Result<TaskJob, TaskError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    r#"
                    UPDATE task_jobs
                    SET status = 'cancelled', finished_at = $2, locked_at = NULL,
                        locked_by = NULL, updated_at = $2
                    WHERE id = $1 AND status IN ('queued', 'running')
                    RETURNING {}
                    "#,
                    TASK_COLUMNS
                ),
                &[&id, &now],
            )
            .await
            .map_err(DatabaseError::from)?;
        match row {
            Some(row) => Ok(row_to_task(&row)?),
            None => {
                let existing = self.get_task(id).await?;
                Err(TaskError::NotCancellable {
                    id: id.to_string(),
                    status: existing.status.to_string(),
                })
            }
        }
    }

    async fn lock_next_task(
        &self,
        job_type: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskJob>, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let candidate = tx
            .query_opt(
                r#"
                SELECT id FROM task_jobs
                WHERE job_type = $1
                  AND status = 'queued'
                  AND (run_after IS NULL OR run_after <= $2)
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
                "#,
                &[&job_type, &now],
            )
            .await?;
        let Some(candidate) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };
        let id: String = candidate.get("id");

        let row = tx
            .query_one(
                &format!(
                    r#"
                    UPDATE task_jobs
                    SET status = 'running', attempt_count = attempt_count + 1,
                        locked_at = $2, locked_by = $3, started_at = $2,
                        updated_at = $2, run_after = NULL
                    WHERE id = $1
                    RETURNING {}
                    "#,
                    TASK_COLUMNS
                ),
                &[&id, &now, &worker_id],
            )
            .await?;
        tx.commit().await?;
        Ok(Some(row_to_task(&row)?))
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
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                r#"
                UPDATE task_jobs
                SET status = 'queued', run_after = $3, error_code = $4, error_message = $5,
                    locked_at = NULL, locked_by = NULL, updated_at = $6
                WHERE id = $1 AND status = 'running' AND locked_by = $2
                "#,
                &[&id, &worker_id, &run_after, &error_code, &error_message, &now],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn fail_task(
        &self,
        id: &str,
        worker_id: &str,
        error_code: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                r#"
                UPDATE task_jobs
                SET status = 'failed', finished_at = $5, error_code = $3, error_message = $4,
                    locked_at = NULL, locked_by = NULL, updated_at = $5
                WHERE id = $1 AND status = 'running' AND locked_by = $2
                "#,
                &[&id, &worker_id, &error_code, &error_message, &now],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn succeed_task(&self, id: &str, worker_id: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                r#"
                UPDATE task_jobs
                SET status = 'succeeded', finished_at = $3, error_code = NULL,
                    error_message = NULL, locked_at = NULL, locked_by = NULL, updated_at = $3
                WHERE id = $1 AND status = 'running' AND locked_by = $2
                "#,
                &[&id, &worker_id, &now],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn node_hostname(&self, node_id: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT hostname FROM nodes WHERE id = $1", &[&node_id])
            .await?;
        Ok(row.map(|r| r.get("hostname")))
    }

    async fn complete_site_import(
        &self,
        import: &SiteImport,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        // The task row goes first: a lost lock leaves the business rows alone.
        let updated = tx
            .execute(
                r#"
                UPDATE task_jobs
                SET status = 'succeeded', finished_at = $3, error_code = NULL,
                    error_message = NULL, locked_at = NULL, locked_by = NULL, updated_at = $3
                WHERE id = $1 AND status = 'running' AND locked_by = $2
                "#,
                &[&import.job_id, &worker_id, &now],
            )
            .await?;
        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.execute(
            r#"
            UPDATE environments
            SET status = 'active', current_release_id = $3,
                state_version = state_version + 1, updated_at = $4
            WHERE id = $1 AND site_id = $2
            "#,
            &[&import.environment_id, &import.site_id, &import.release_id, &now],
        )
        .await?;
        tx.execute(
            r#"
            UPDATE sites
            SET status = 'active', state_version = state_version + 1, updated_at = $2
            WHERE id = $1
            "#,
            &[&import.site_id, &now],
        )
        .await?;
        tx.commit().await?;
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
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let updated = tx
            .execute(
                r#"
                UPDATE task_jobs
                SET status = 'failed', finished_at = $5, error_code = $3, error_message = $4,
                    locked_at = NULL, locked_by = NULL, updated_at = $5
                WHERE id = $1 AND status = 'running' AND locked_by = $2
                "#,
                &[&import.job_id, &worker_id, &error_code, &error_message, &now],
            )
            .await?;
        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.execute(
            r#"
            UPDATE environments
            SET status = 'failed', state_version = state_version + 1, updated_at = $3
            WHERE id = $1 AND site_id = $2
            "#,
            &[&import.environment_id, &import.site_id, &now],
        )
        .await?;
        tx.execute(
            r#"
            UPDATE sites
            SET status = 'failed', state_version = state_version + 1, updated_at = $2
            WHERE id = $1
            "#,
            &[&import.site_id, &now],
        )
        .await?;
        tx.commit().await?;
        Ok(true)
    }
}

