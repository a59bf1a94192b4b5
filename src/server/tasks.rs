//! Read and cancel access to the queued-task table.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;

use crate::server::AppState;
use crate::server::error::ApiResult;
use crate::tasks::TaskJob;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    limit: usize,
}

/// `GET /api/tasks?limit=N`, newest first.
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<TaskJob>>> {
    Ok(Json(state.tasks.list(query.limit).await?))
}

/// `GET /api/tasks/{id}`
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskJob>> {
    Ok(Json(state.tasks.get(&id).await?))
}

/// `POST /api/tasks/{id}/cancel`: only queued or running tasks.
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskJob>> {
    Ok(Json(state.tasks.cancel(&id).await?))
}
