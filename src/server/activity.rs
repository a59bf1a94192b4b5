//! Activity feed: paginated reads, read markers and the live stream.

use std::str::FromStr;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::response::sse::Event;
use serde::Deserialize;

use crate::activity::{
    Activity, ActivityPage, Category, DEFAULT_SINCE_LIMIT, ListFilter, ResourceType,
};
use crate::server::AppState;
use crate::server::error::{ApiError, ApiResult, parse_id};
use crate::server::sse;

/// Raw query string of the list, count and mark-all endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct FilterQuery {
    cursor: Option<String>,
    limit: Option<String>,
    category: Option<String>,
    resource_type: Option<String>,
    resource_id: Option<String>,
    parent_resource_type: Option<String>,
    parent_resource_id: Option<String>,
    requires_attention: Option<String>,
    unread_only: Option<String>,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn int_param(value: &Option<String>, name: &str) -> ApiResult<Option<i64>> {
    present(value)
        .map(|raw| {
            raw.parse::<i64>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ApiError::bad_request(format!("{} must be a positive integer", name)))
        })
        .transpose()
}

fn enum_param<T: FromStr>(value: &Option<String>, name: &str) -> ApiResult<Option<T>> {
    present(value)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| ApiError::bad_request(format!("invalid {}", name)))
        })
        .transpose()
}

impl FilterQuery {
    fn into_filter(self) -> ApiResult<ListFilter> {
        let limit = match int_param(&self.limit, "limit")? {
            Some(n) if n > crate::activity::MAX_LIST_LIMIT as i64 => {
                return Err(ApiError::bad_request("limit must be between 1 and 200"));
            }
            Some(n) => n as usize,
            None => 0,
        };
        let requires_attention = match present(&self.requires_attention) {
            None => None,
            Some("true" | "1") => Some(true),
            Some("false" | "0") => Some(false),
            Some(_) => return Err(ApiError::bad_request("invalid requires_attention")),
        };
        let unread_only = match present(&self.unread_only) {
            None => false,
            Some("true" | "1") => true,
            Some("false" | "0") => false,
            Some(_) => return Err(ApiError::bad_request("invalid unread_only")),
        };
        Ok(ListFilter {
            cursor: int_param(&self.cursor, "cursor")?,
            limit,
            category: enum_param::<Category>(&self.category, "category")?,
            resource_type: enum_param::<ResourceType>(&self.resource_type, "resource_type")?,
            resource_id: int_param(&self.resource_id, "resource_id")?,
            parent_resource_type: enum_param::<ResourceType>(
                &self.parent_resource_type,
                "parent_resource_type",
            )?,
            parent_resource_id: int_param(&self.parent_resource_id, "parent_resource_id")?,
            requires_attention,
            unread_only,
        })
    }
}

/// `GET /api/activity`
pub async fn list_activity(
    State(state): State<AppState>,
    Query(query): Query<FilterQuery>,
) -> ApiResult<Json<ActivityPage>> {
    let filter = query.into_filter()?;
    Ok(Json(state.activity.list_activity(&filter).await?))
}

/// `GET /api/servers/{id}/activity`
pub async fn server_activity(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<FilterQuery>,
) -> ApiResult<Json<ActivityPage>> {
    let server_id = parse_id(&id, "server id")?;
    let filter = query.into_filter()?;
    Ok(Json(
        state
            .activity
            .list_activity_for_server(server_id, &filter)
            .await?,
    ))
}

/// `GET /api/activity/{id}`
pub async fn get_activity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Activity>> {
    let id = parse_id(&id, "activity id")?;
    Ok(Json(state.activity.get_activity(id).await?))
}

/// `POST /api/activity/{id}/read`: idempotent, returns the row.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Activity>> {
    let id = parse_id(&id, "activity id")?;
    state.activity.mark_read(id).await?;
    Ok(Json(state.activity.get_activity(id).await?))
}

/// `POST /api/activity/read-all`
pub async fn mark_all_read(
    State(state): State<AppState>,
    Query(query): Query<FilterQuery>,
) -> ApiResult<impl IntoResponse> {
    let filter = query.into_filter()?;
    let updated = state.activity.mark_all_read(&filter).await?;
    tracing::debug!(updated, "Marked activity read");
    Ok(Json(serde_json::json!({ "updated": updated })))
}

/// `GET /api/activity/unread-count`: attention-only unless told otherwise.
pub async fn unread_count(
    State(state): State<AppState>,
    Query(query): Query<FilterQuery>,
) -> ApiResult<impl IntoResponse> {
    let explicit_attention = present(&query.requires_attention).is_some();
    let mut filter = query.into_filter()?;
    if !explicit_attention {
        filter.requires_attention = Some(true);
    }
    let count = state.activity.count_unread(&filter).await?;
    Ok(Json(serde_json::json!({ "count": count })))
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    since_id: Option<String>,
}

fn activity_frame(activity: &Activity) -> Event {
    Event::default()
        .id(activity.id.to_string())
        .event("activity")
        .data(serde_json::to_string(activity).unwrap_or_else(|_| "{}".to_string()))
}

/// `GET /api/activity/stream?since_id=N`
///
/// Without `since_id` the stream starts at the newest row, so a fresh
/// dashboard only sees what happens after it connects.
pub async fn stream_activity(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<impl IntoResponse> {
    let since_id = match present(&query.since_id) {
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .filter(|n| *n >= 0)
            .ok_or_else(|| ApiError::bad_request("since_id must be a non-negative integer"))?,
        None => state.activity.latest_activity_id().await?,
    };

    let store = state.activity.clone();
    Ok(sse::poll_stream(since_id, state.stream_interval, move |cursor| {
        let store = store.clone();
        async move {
            match store.list_activity_since(cursor, DEFAULT_SINCE_LIMIT).await {
                Ok(rows) => {
                    let next = rows.last().map_or(cursor, |a| a.id);
                    Ok((rows.iter().map(activity_frame).collect(), next))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Activity stream read failed");
                    Err(sse::error_event("failed to read activity"))
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

    use crate::activity::{EmitInput, EventType, Level, ResourceRef};
    use crate::db::ActivityStore;
    use crate::db::memory::MemoryStore;
    use crate::server::testing::*;

    async fn seed(store: &MemoryStore, n: usize) {
        for i in 0..n {
            let mut input = EmitInput::new(EventType::JobFailed, Level::Error, format!("job {} failed", i))
                .resource(ResourceRef::job(i as i64 + 1))
                .parent(Some(ResourceRef::server(if i % 2 == 0 { 7 } else { 8 })));
            if i % 2 == 0 {
                input = input.attention();
            }
            store.emit(input).await.unwrap();
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn pagination_visits_every_row_once() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 7).await;

        let mut seen = Vec::new();
        let mut cursor = String::new();
        loop {
            let uri = if cursor.is_empty() {
                "/api/activity?limit=3".to_string()
            } else {
                format!("/api/activity?limit=3&cursor={}", cursor)
            };
            let page = body_json(open_router(store.clone()).oneshot(get(&uri)).await.unwrap()).await;
            seen.extend(
                page["data"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|a| a["id"].as_i64().unwrap()),
            );
            cursor = page["next_cursor"].as_str().unwrap().to_string();
            if cursor.is_empty() {
                break;
            }
        }
        assert_eq!(seen, vec![7, 6, 5, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn filters_parse_and_validate() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 4).await;

        let resp = open_router(store.clone())
            .oneshot(get("/api/activity?requires_attention=1&category=job"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let page = body_json(resp).await;
        assert_eq!(page["data"].as_array().unwrap().len(), 2);

        for bad in [
            "/api/activity?limit=500",
            "/api/activity?limit=0",
            "/api/activity?category=weather",
            "/api/activity?requires_attention=maybe",
            "/api/activity?cursor=abc",
        ] {
            let resp = open_router(store.clone()).oneshot(get(bad)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{}", bad);
        }
    }

    #[tokio::test]
    async fn server_activity_includes_parented_rows() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 4).await;

        let page = body_json(
            open_router(store.clone())
                .oneshot(get("/api/servers/7/activity"))
                .await
                .unwrap(),
        )
        .await;
        let ids: Vec<i64> = page["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![3, 1]);
    }

    #[tokio::test]
    async fn read_markers_and_unread_count() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 4).await;

        let count = body_json(
            open_router(store.clone())
                .oneshot(get("/api/activity/unread-count"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(count["count"], 2);

        let resp = open_router(store.clone()).oneshot(post("/api/activity/1/read")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let row = body_json(resp).await;
        assert!(row["read_at"].is_string());

        // Marking again is a no-op success.
        let resp = open_router(store.clone()).oneshot(post("/api/activity/1/read")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let count = body_json(
            open_router(store.clone())
                .oneshot(get("/api/activity/unread-count"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(count["count"], 1);

        let resp = open_router(store.clone()).oneshot(post("/api/activity/99/read")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = open_router(store.clone())
            .oneshot(post("/api/activity/read-all"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let count = body_json(
            open_router(store.clone())
                .oneshot(get("/api/activity/unread-count?requires_attention=false"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(count["count"], 0);
    }

    #[tokio::test]
    async fn get_missing_activity_is_404() {
        let resp = open_router(Arc::new(MemoryStore::new()))
            .oneshot(get("/api/activity/5"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stream_replays_after_since_id() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 3).await;

        let resp = open_router(store.clone())
            .oneshot(get("/api/activity/stream?since_id=1"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = read_sse_until(resp, "id: 3").await;
        assert!(text.starts_with(": connected"));
        assert!(text.contains("event: activity"));
        assert!(text.contains("id: 2\n"));
        assert!(!text.contains("id: 1\n"));
    }

    #[tokio::test]
    async fn stream_defaults_to_latest_id() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 2).await;

        let resp = open_router(store.clone())
            .oneshot(get("/api/activity/stream"))
            .await
            .unwrap();

        store
            .emit(EmitInput::new(EventType::ServerProvisioned, Level::Success, "Server ready"))
            .await
            .unwrap();

        let text = read_sse_until(resp, "id: 3").await;
        assert!(text.contains("id: 3\n"));
        assert!(!text.contains("id: 2\n"));
    }
}
