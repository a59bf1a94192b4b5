//! Error types shared across the control plane.
//!
//! Each subsystem has its own enum. Persistence failures funnel through
//! [`DatabaseError`] and are wrapped by the higher-level enums with `#[from]`.

use std::time::Duration;

use crate::orchestrator::JobStatus;

/// Errors raised by the persistence backends.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Could not obtain a connection from the pool.
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// A statement failed to execute.
    #[error("Query failed: {0}")]
    Query(String),

    /// The referenced row does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// A stored value could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A uniqueness or foreign-key constraint rejected the write.
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Schema migration failed.
    #[error("Migration failed: {0}")]
    Migration(String),
}

impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        DatabaseError::Pool(e.to_string())
    }
}

impl From<tokio_postgres::Error> for DatabaseError {
    fn from(e: tokio_postgres::Error) -> Self {
        if let Some(db) = e.as_db_error() {
            // 23xxx is the integrity-constraint class.
            if db.code().code().starts_with("23") {
                return DatabaseError::Constraint(db.message().to_string());
            }
        }
        DatabaseError::Query(e.to_string())
    }
}

impl From<serde_json::Error> for DatabaseError {
    fn from(e: serde_json::Error) -> Self {
        DatabaseError::Serialization(e.to_string())
    }
}

/// Errors from the job store and the lifecycle state machine.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Caller supplied invalid input.
    #[error("{0}")]
    Validation(String),

    /// Transition target equals the current status.
    #[error("status is already \"{0}\"")]
    AlreadyInState(JobStatus),

    /// Transition edge does not exist.
    #[error("invalid job status transition: \"{from}\" -> \"{to}\"")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("job {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl JobError {
    /// True for errors a client caused (validation and transition errors).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            JobError::Validation(_)
                | JobError::AlreadyInState(_)
                | JobError::InvalidTransition { .. }
        )
    }
}

/// Errors from the activity log.
#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    #[error("{0}")]
    Validation(String),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("activity {0} not found")]
    NotFound(i64),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Errors from registration token handling.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("server id must be greater than zero")]
    InvalidServerId,

    #[error("token ttl must be positive")]
    InvalidTtl,

    #[error("invalid, expired, or already consumed token")]
    TokenRejected,

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Errors from the envelope encryption layer.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("identity path is empty")]
    EmptyPath,

    #[error("identity file missing: {0}")]
    Missing(String),

    #[error("identity path is a directory: {0}")]
    IsDirectory(String),

    #[error("no identities found in {0}")]
    NoIdentities(String),

    #[error("invalid identity: {reason}")]
    InvalidIdentity { reason: String },

    #[error("encryption failed: {reason}")]
    Encrypt { reason: String },

    #[error("decryption failed: {reason}")]
    Decrypt { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the certificate authority and certificate records.
#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    #[error("invalid CSR: {reason}")]
    InvalidCsr { reason: String },

    #[error("CSR common name {actual:?} does not match {expected:?}")]
    CommonNameMismatch { expected: String, actual: String },

    #[error("invalid certificate: {reason}")]
    InvalidCertificate { reason: String },

    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("TLS configuration error: {reason}")]
    Tls { reason: String },

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Errors on an agent session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors from dispatch and result correlation.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("job not found for command {command_id}: {source}")]
    UnknownCommand {
        command_id: String,
        #[source]
        source: JobError,
    },

    #[error("no runner configured for job kind {0}")]
    NoRunner(String),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Activity(#[from] ActivityError),
}

/// Errors from the external process runner.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("invalid runner request: {reason}")]
    InvalidRequest { reason: String },

    #[error("playbook not allowed: {0}")]
    PlaybookNotAllowed(String),

    #[error("process exited with code {code}")]
    Exit { code: i32, output: String },

    #[error("process terminated by signal")]
    Signaled { output: String },

    #[error("process timed out after {0:?}")]
    Timeout(Duration),

    #[error("process cancelled")]
    Cancelled,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Captured process output, when the process ran far enough to produce any.
    pub fn output(&self) -> &str {
        match self {
            RunnerError::Exit { output, .. } | RunnerError::Signaled { output } => output,
            _ => "",
        }
    }
}

/// Closed set of cloud provider failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider rejected credentials: {0}")]
    Unauthorized(String),

    #[error("provider denied access: {0}")]
    Forbidden(String),

    #[error("provider rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("provider rejected input: {0}")]
    InvalidInput(String),

    #[error("provider reported a conflict: {0}")]
    Conflict(String),

    #[error("provider error: {0}")]
    Unknown(String),
}

/// Errors from the queued-task service.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("task job {0} not found")]
    NotFound(String),

    #[error("task job {id} cannot be cancelled in status {status}")]
    NotCancellable { id: String, status: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Errors while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;
