//! Job submission, lookup and the per-job event stream.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::sse::Event;
use serde::Deserialize;

use crate::activity::{ActorType, EventType, job_lifecycle};
use crate::db::DEFAULT_EVENT_LIMIT;
use crate::orchestrator::{
    EVENT_JOB_CREATED, EventInput, EventLevel, Job, JobEvent, JobStatus, KIND_PROVISION_SERVER,
    KIND_RESTART_SERVICE, NewJob,
};
use crate::server::AppState;
use crate::server::error::{ApiError, ApiResult, parse_id};
use crate::server::sse;

#[derive(Debug, Default, Deserialize)]
pub struct CreateJobRequest {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub server_id: Option<i64>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl CreateJobRequest {
    /// Apply the kind default and per-kind payload rules.
    fn into_new_job(self) -> Result<NewJob, ApiError> {
        let kind = match self.kind.trim() {
            "" => KIND_PROVISION_SERVER.to_string(),
            other => other.to_string(),
        };
        let mut job = NewJob::new(kind);
        if let Some(server_id) = self.server_id {
            job = job.with_server(server_id);
        }
        if let Some(payload) = self.payload {
            job = job.with_payload(payload);
        }

        if job.kind == KIND_RESTART_SERVICE {
            if job.server_id.is_none_or(|id| id <= 0) {
                return Err(ApiError::bad_request("server_id is required"));
            }
            let service = job
                .payload
                .as_ref()
                .and_then(|p| p.get("service_name"))
                .and_then(|v| v.as_str())
                .map(str::trim)
                .unwrap_or_default();
            if service.is_empty() {
                return Err(ApiError::bad_request("payload.service_name is required"));
            }
        }
        Ok(job)
    }
}

/// `POST /api/jobs`: persist a queued job and its opening timeline entry.
pub async fn create_job(
    State(state): State<AppState>,
    body: Result<Json<CreateJobRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = body.map_err(|e| {
        tracing::debug!(error = %e, "Rejected job request body");
        ApiError::bad_request("invalid request body")
    })?;
    let job = state.jobs.create_job(req.into_new_job()?).await?;

    let created = EventInput::new(EVENT_JOB_CREATED, EventLevel::Info, "Job accepted and queued")
        .status(JobStatus::Queued.as_str());
    if let Err(e) = state.jobs.append_event(job.id, created).await {
        tracing::error!(job_id = job.id, error = %e, "Failed to append job_created event");
    }
    state
        .activity_log
        .emit(job_lifecycle(EventType::JobCreated, &job).actor(ActorType::User))
        .await;

    tracing::info!(job_id = job.id, kind = %job.kind, server_id = ?job.server_id, "Job accepted");
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// `GET /api/jobs`
pub async fn list_jobs(State(state): State<AppState>) -> ApiResult<Json<Vec<Job>>> {
    Ok(Json(state.jobs.list_all_jobs().await?))
}

/// `GET /api/jobs/{id}`
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    let id = parse_id(&id, "job id")?;
    Ok(Json(state.jobs.get_job(id).await?))
}

/// `GET /api/jobs/{id}/events/history`
pub async fn event_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<JobEvent>>> {
    let id = parse_id(&id, "job id")?;
    state.jobs.get_job(id).await?;
    Ok(Json(state.jobs.list_all_events(id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub since_seq: Option<String>,
}

fn event_frame(event: &JobEvent) -> Event {
    Event::default()
        .id(event.seq.to_string())
        .event("job_event")
        .data(serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string()))
}

/// `GET /api/jobs/{id}/events?since_seq=N`: SSE of the job timeline.
pub async fn stream_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<impl IntoResponse> {
    let job_id = parse_id(&id, "job id")?;
    let since_seq = match query.since_seq.as_deref().map(str::trim) {
        None | Some("") => 0,
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .filter(|n| *n >= 0)
            .ok_or_else(|| ApiError::bad_request("since_seq must be a non-negative integer"))?,
    };
    state.jobs.get_job(job_id).await?;

    let jobs = state.jobs.clone();
    Ok(sse::poll_stream(since_seq, state.stream_interval, move |cursor| {
        let jobs = jobs.clone();
        async move {
            match jobs.list_events(job_id, cursor, DEFAULT_EVENT_LIMIT).await {
                Ok(events) => {
                    let next = events.last().map_or(cursor, |e| e.seq);
                    Ok((events.iter().map(event_frame).collect(), next))
                }
                Err(e) => {
                    tracing::warn!(job_id, error = %e, "Job event stream read failed");
                    Err(sse::error_event("failed to read job events"))
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    use crate::activity::{Category, ListFilter};
    use crate::db::memory::MemoryStore;
    use crate::db::{ActivityStore, JobStore};
    use crate::orchestrator::{EventInput, EventLevel, NewJob};
    use crate::server::testing::*;

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn create_defaults_kind_and_records_timeline() {
        let store = Arc::new(MemoryStore::new());

        let resp = open_router(store.clone())
            .oneshot(post_json("/api/jobs", serde_json::json!({ "server_id": 4 })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let job = body_json(resp).await;
        assert_eq!(job["kind"], "provision_server");
        assert_eq!(job["status"], "queued");
        assert_eq!(job["server_id"], 4);

        let id = job["id"].as_i64().unwrap();
        let events = store.list_all_events(id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].seq, 1);
        assert_eq!(events[0].event_type, "job_created");
        assert_eq!(events[0].message, "Job accepted and queued");
        assert_eq!(events[0].status.as_deref(), Some("queued"));

        let feed = store
            .list_activity(&ListFilter {
                category: Some(Category::Job),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(feed.data.len(), 1);
        assert_eq!(feed.data[0].title, "Server provisioning job queued");
        assert_eq!(feed.data[0].actor_type.as_str(), "user");
        assert_eq!(feed.data[0].parent_resource_id, Some(4));
    }

    #[tokio::test]
    async fn create_rejects_malformed_bodies() {
        let store = Arc::new(MemoryStore::new());

        let resp = open_router(store.clone())
            .oneshot(post_json("/api/jobs", serde_json::json!({ "kind": 7 })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "invalid request body");

        let resp = open_router(store.clone())
            .oneshot(post_json(
                "/api/jobs",
                serde_json::json!({ "kind": "restart_service", "server_id": 3, "payload": {} }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "payload.service_name is required");

        let resp = open_router(store.clone())
            .oneshot(post_json(
                "/api/jobs",
                serde_json::json!({ "kind": "restart_service", "payload": { "service_name": "nginx" } }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        assert!(store.list_all_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_job_maps_missing_and_bad_ids() {
        let store = Arc::new(MemoryStore::new());
        let job = store.create_job(NewJob::new("provision_server")).await.unwrap();

        let req = Request::builder()
            .uri(format!("/api/jobs/{}", job.id))
            .body(Body::empty())
            .unwrap();
        let resp = open_router(store.clone()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["id"], job.id);

        let req = Request::builder().uri("/api/jobs/999").body(Body::empty()).unwrap();
        let resp = open_router(store.clone()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = Request::builder().uri("/api/jobs/abc").body(Body::empty()).unwrap();
        let resp = open_router(store).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn history_returns_full_timeline() {
        let store = Arc::new(MemoryStore::new());
        let job = store.create_job(NewJob::new("provision_server")).await.unwrap();
        for step in ["validate", "create_server"] {
            store
                .append_event(
                    job.id,
                    EventInput::new("step_update", EventLevel::Info, format!("{} done", step)).step(step),
                )
                .await
                .unwrap();
        }

        let req = Request::builder()
            .uri(format!("/api/jobs/{}/events/history", job.id))
            .body(Body::empty())
            .unwrap();
        let resp = open_router(store).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let events = body_json(resp).await;
        let seqs: Vec<i64> = events
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn stream_resumes_after_since_seq() {
        let store = Arc::new(MemoryStore::new());
        let job = store.create_job(NewJob::new("provision_server")).await.unwrap();
        for message in ["first", "second", "third"] {
            store
                .append_event(job.id, EventInput::new("step_update", EventLevel::Info, message))
                .await
                .unwrap();
        }

        let req = Request::builder()
            .uri(format!("/api/jobs/{}/events?since_seq=1", job.id))
            .body(Body::empty())
            .unwrap();
        let resp = open_router(store).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/event-stream"
        );

        let text = read_sse_until(resp, "id: 3").await;
        assert!(text.starts_with(": connected"), "got {:?}", text);
        assert!(text.contains("event: job_event"));
        assert!(!text.contains("id: 1\n"));
        assert!(text.contains("id: 2\n"));
        assert!(text.contains("\"message\":\"third\""));
    }

    #[tokio::test]
    async fn stream_sends_keepalive_when_idle() {
        let store = Arc::new(MemoryStore::new());
        let job = store.create_job(NewJob::new("provision_server")).await.unwrap();

        let req = Request::builder()
            .uri(format!("/api/jobs/{}/events", job.id))
            .body(Body::empty())
            .unwrap();
        let resp = open_router(store).oneshot(req).await.unwrap();
        let text = read_sse_until(resp, ": keepalive").await;
        assert!(text.contains(": keepalive"));
    }

    #[tokio::test]
    async fn stream_for_missing_job_is_404() {
        let req = Request::builder()
            .uri("/api/jobs/42/events")
            .body(Body::empty())
            .unwrap();
        let resp = open_router(Arc::new(MemoryStore::new())).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
