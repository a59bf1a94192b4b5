//! Mapping of domain errors onto `{"error": "..."}` responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::error::{ActivityError, DatabaseError, JobError, ProviderError, TaskError};

#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    /// A 500. The cause goes to the log.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        tracing::error!(error = %err, "Request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        match err {
            e @ DatabaseError::NotFound { .. } => ApiError::not_found(e.to_string()),
            other => ApiError::internal(other),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            e @ (JobError::Validation(_)
            | JobError::AlreadyInState(_)
            | JobError::InvalidTransition { .. }) => ApiError::bad_request(e.to_string()),
            e @ JobError::NotFound(_) => ApiError::not_found(e.to_string()),
            JobError::Database(db) => db.into(),
        }
    }
}

impl From<ActivityError> for ApiError {
    fn from(err: ActivityError) -> Self {
        match err {
            e @ (ActivityError::Validation(_) | ActivityError::UnknownEventType(_)) => {
                ApiError::bad_request(e.to_string())
            }
            e @ ActivityError::NotFound(_) => ApiError::not_found(e.to_string()),
            ActivityError::Database(db) => db.into(),
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        let status = match err {
            ProviderError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ProviderError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::BAD_GATEWAY,
        };
        ApiError::new(status, err.to_string())
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        match err {
            e @ TaskError::Validation(_) => ApiError::bad_request(e.to_string()),
            e @ (TaskError::Conflict(_) | TaskError::NotCancellable { .. }) => {
                ApiError::new(StatusCode::CONFLICT, e.to_string())
            }
            e @ TaskError::NotFound(_) => ApiError::not_found(e.to_string()),
            TaskError::Database(db) => db.into(),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Parse a positive integer path segment.
pub fn parse_id(raw: &str, what: &str) -> ApiResult<i64> {
    match raw.trim().parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ApiError::bad_request(format!("{} must be a positive integer", what))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::JobStatus;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(JobError::NotFound("7".to_string())).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(JobError::AlreadyInState(JobStatus::Queued)).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(JobError::Database(DatabaseError::NotFound {
                entity: "job",
                id: "7".to_string()
            }))
            .status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(DatabaseError::Query("boom".to_string())).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(ApiError::from(ActivityError::NotFound(3)).status, StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::from(TaskError::NotCancellable {
                id: "job_x_1".to_string(),
                status: "succeeded".to_string()
            })
            .status,
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(ProviderError::RateLimited("slow down".to_string())).status,
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id("42", "job id").unwrap(), 42);
        let err = parse_id("0", "job id").unwrap_err();
        assert_eq!(err.message, "job id must be a positive integer");
        assert!(parse_id("abc", "job id").is_err());
    }
}
