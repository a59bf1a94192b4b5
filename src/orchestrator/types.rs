use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Lifecycle status of an orchestration job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Preparing,
    Running,
    WaitingReboot,
    Resuming,
    Verifying,
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobStatus {
    pub const ALL: &'static [JobStatus] = &[
        JobStatus::Queued,
        JobStatus::Preparing,
        JobStatus::Running,
        JobStatus::WaitingReboot,
        JobStatus::Resuming,
        JobStatus::Verifying,
        JobStatus::Retrying,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::TimedOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Preparing => "preparing",
            JobStatus::Running => "running",
            JobStatus::WaitingReboot => "waiting_reboot",
            JobStatus::Resuming => "resuming",
            JobStatus::Verifying => "verifying",
            JobStatus::Retrying => "retrying",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        super::state_machine::is_terminal(*self)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status '{}'", s))
    }
}

/// Severity attached to job events and activity rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Info => "info",
            EventLevel::Success => "success",
            EventLevel::Warning => "warning",
            EventLevel::Error => "error",
        }
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(EventLevel::Info),
            "success" => Ok(EventLevel::Success),
            "warning" => Ok(EventLevel::Warning),
            "error" => Ok(EventLevel::Error),
            other => Err(format!("unknown level '{}'", other)),
        }
    }
}

/// A durable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<i64>,
    pub status: JobStatus,
    pub current_step: String,
    pub retry_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a job.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub kind: String,
    pub server_id: Option<i64>,
    pub payload: Option<serde_json::Value>,
}

impl NewJob {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn with_server(mut self, server_id: i64) -> Self {
        self.server_id = Some(server_id);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Trim the kind and drop non-positive server references.
    pub fn normalized(self) -> Result<Self, JobError> {
        let kind = self.kind.trim().to_string();
        if kind.is_empty() {
            return Err(JobError::Validation("kind is required".to_string()));
        }
        Ok(Self {
            kind,
            server_id: self.server_id.filter(|id| *id > 0),
            payload: self.payload.filter(|p| !p.is_null()),
        })
    }
}

/// Requested change of `(status, current_step, retry_count, last_error)`.
#[derive(Debug, Clone)]
pub struct TransitionInput {
    pub to_status: JobStatus,
    pub current_step: String,
    pub last_error: Option<String>,
    pub retry_count: i32,
}

impl TransitionInput {
    pub fn to(status: JobStatus) -> Self {
        Self {
            to_status: status,
            current_step: String::new(),
            last_error: None,
            retry_count: 0,
        }
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.current_step = step.into();
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.last_error = Some(message.into());
        self
    }

    pub fn retries(mut self, retry_count: i32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub(crate) fn normalized(self) -> Result<Self, JobError> {
        if self.retry_count < 0 {
            return Err(JobError::Validation(
                "retry_count must be non-negative".to_string(),
            ));
        }
        Ok(Self {
            current_step: self.current_step.trim().to_string(),
            last_error: self
                .last_error
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty()),
            ..self
        })
    }
}

/// An immutable entry in a job's timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: i64,
    pub seq: i64,
    pub event_type: String,
    pub level: EventLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub occurred_at: DateTime<Utc>,
}

/// Input for appending a job event.
#[derive(Debug, Clone)]
pub struct EventInput {
    pub event_type: String,
    pub level: EventLevel,
    pub step_key: Option<String>,
    pub status: Option<String>,
    pub message: String,
    pub payload: Option<serde_json::Value>,
}

impl EventInput {
    pub fn new(event_type: impl Into<String>, level: EventLevel, message: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            level,
            step_key: None,
            status: None,
            message: message.into(),
            payload: None,
        }
    }

    pub fn step(mut self, step_key: impl Into<String>) -> Self {
        self.step_key = Some(step_key.into());
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub(crate) fn normalized(self) -> Result<Self, JobError> {
        let event_type = self.event_type.trim().to_string();
        if event_type.is_empty() {
            return Err(JobError::Validation("event_type is required".to_string()));
        }
        let message = self.message.trim().to_string();
        if message.is_empty() {
            return Err(JobError::Validation("message is required".to_string()));
        }
        let trim_opt = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        Ok(Self {
            event_type,
            level: self.level,
            step_key: trim_opt(self.step_key),
            status: trim_opt(self.status),
            message,
            payload: self.payload.filter(|p| !p.is_null()),
        })
    }
}

pub(crate) fn require_positive_id(id: i64) -> Result<(), JobError> {
    if id <= 0 {
        return Err(JobError::Validation(
            "job id must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), *status);
            let json = serde_json::to_string(status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_new_job_requires_kind() {
        assert!(NewJob::new("   ").normalized().is_err());
        let job = NewJob::new(" provision_server ")
            .with_server(0)
            .normalized()
            .unwrap();
        assert_eq!(job.kind, "provision_server");
        assert_eq!(job.server_id, None);
    }

    #[test]
    fn test_event_input_requires_message() {
        let input = EventInput::new("step_update", EventLevel::Info, "  ");
        assert!(input.normalized().is_err());
        let input = EventInput::new("step_update", EventLevel::Info, "ok").step(" ");
        assert_eq!(input.normalized().unwrap().step_key, None);
    }
}
