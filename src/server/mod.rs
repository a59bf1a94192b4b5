//! HTTPS surface: the job and activity APIs, node registration, and the
//! agent WebSocket.
//!
//! Operator routes sit behind a bearer-token layer when an admin token is
//! configured. Node registration, the CA certificate, the agent socket and
//! `/health` never do: nodes authenticate with a one-time token or their
//! client certificate instead.

mod activity;
mod agent_ws;
pub mod auth;
pub mod error;
mod jobs;
pub mod listener;
mod nodes;
mod sse;
mod tasks;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::activity::ActivityLog;
use crate::agent::{ConnectionHandler, Hub};
use crate::db::{ActivityStore, Database, JobStore, ProviderStore};
use crate::provider::ProviderRegistry;
use crate::registration::RegistrationService;
use crate::server::auth::{AuthState, auth_middleware};
use crate::tasks::TaskService;

pub use listener::serve_tls;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobStore>,
    pub activity: Arc<dyn ActivityStore>,
    pub activity_log: ActivityLog,
    pub providers: Arc<dyn ProviderStore>,
    pub registry: ProviderRegistry,
    pub registration: RegistrationService,
    pub tasks: TaskService,
    pub hub: Arc<Hub>,
    pub agents: ConnectionHandler,
    /// Lifetime of tokens issued by the registration-token endpoint.
    pub token_ttl: Duration,
    /// Poll period of the SSE streams.
    pub stream_interval: Duration,
    /// Ends agent sessions on process shutdown.
    pub shutdown: CancellationToken,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new<D: Database + 'static>(
        db: Arc<D>,
        registry: ProviderRegistry,
        registration: RegistrationService,
        hub: Arc<Hub>,
        agents: ConnectionHandler,
        token_ttl: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let activity: Arc<dyn ActivityStore> = db.clone();
        Self {
            jobs: db.clone(),
            activity_log: ActivityLog::new(activity.clone()),
            activity,
            providers: db.clone(),
            registry,
            registration,
            tasks: TaskService::new(db),
            hub,
            agents,
            token_ttl,
            stream_interval: Duration::from_secs(1),
            shutdown,
        }
    }

    pub fn with_stream_interval(mut self, interval: Duration) -> Self {
        self.stream_interval = interval;
        self
    }
}

/// Build the application router.
pub fn router(state: AppState, admin_token: Option<SecretString>) -> Router {
    let mut operator = Router::new()
        .route("/api/jobs", get(jobs::list_jobs).post(jobs::create_job))
        .route("/api/jobs/{id}", get(jobs::get_job))
        .route("/api/jobs/{id}/events", get(jobs::stream_events))
        .route("/api/jobs/{id}/events/history", get(jobs::event_history))
        .route("/api/activity", get(activity::list_activity))
        .route("/api/activity/stream", get(activity::stream_activity))
        .route("/api/activity/unread-count", get(activity::unread_count))
        .route("/api/activity/read-all", post(activity::mark_all_read))
        .route("/api/activity/{id}", get(activity::get_activity))
        .route("/api/activity/{id}/read", post(activity::mark_read))
        .route("/api/servers/{id}/activity", get(activity::server_activity))
        .route(
            "/api/servers/{id}/registration-token",
            post(nodes::issue_registration_token),
        )
        .route("/api/certificates/{serial}/revoke", post(nodes::revoke_certificate))
        .route("/api/providers/{id}/catalog", get(nodes::provider_catalog))
        .route("/api/tasks", get(tasks::list_tasks))
        .route("/api/tasks/{id}", get(tasks::get_task))
        .route("/api/tasks/{id}/cancel", post(tasks::cancel_task));

    match admin_token {
        Some(token) => {
            operator = operator.route_layer(axum::middleware::from_fn_with_state(
                AuthState::new(token),
                auth_middleware,
            ));
        }
        None => tracing::warn!("No admin token configured, operator routes are unauthenticated"),
    }

    operator
        // Unauthenticated routes (added after the layer).
        .route("/api/nodes/{id}/register", post(nodes::register_node))
        .route("/api/pki/ca", get(nodes::ca_certificate))
        .route("/ws/agent", get(agent_ws::agent_socket))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::dispatch::Completer;
    use crate::pki::CertificateAuthority;

    pub(crate) const ADMIN_TOKEN: &str = "operator-secret";

    /// State over a fresh in-memory store with a generated CA.
    pub(crate) fn state(store: Arc<MemoryStore>) -> AppState {
        let ca = CertificateAuthority::generate().unwrap();
        let registration = RegistrationService::new(store.clone(), store.clone(), Arc::new(ca), 30);
        let hub = Arc::new(Hub::new());
        let completer = Completer::new(store.clone(), ActivityLog::new(store.clone()));
        let agents = ConnectionHandler::new(hub.clone(), Arc::new(completer));
        AppState::new(
            store,
            ProviderRegistry::default(),
            registration,
            hub,
            agents,
            Duration::from_secs(3600),
            CancellationToken::new(),
        )
        .with_stream_interval(Duration::from_millis(20))
    }

    /// Router without the admin layer.
    pub(crate) fn open_router(store: Arc<MemoryStore>) -> Router {
        router(state(store), None)
    }

    pub(crate) async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        use http_body_util::BodyExt;
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Read SSE body text until `needle` shows up or a second passes.
    pub(crate) async fn read_sse_until(resp: axum::response::Response, needle: &str) -> String {
        use http_body_util::BodyExt;
        let mut body = resp.into_body();
        let mut text = String::new();
        let _ = tokio::time::timeout(Duration::from_secs(1), async {
            while let Some(Ok(frame)) = body.frame().await {
                if let Some(data) = frame.data_ref() {
                    text.push_str(&String::from_utf8_lossy(data));
                    if text.contains(needle) {
                        break;
                    }
                }
            }
        })
        .await;
        text
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::testing::*;
    use super::*;
    use crate::db::memory::MemoryStore;

    fn guarded() -> Router {
        router(
            state(Arc::new(MemoryStore::new())),
            Some(SecretString::from(ADMIN_TOKEN)),
        )
    }

    #[tokio::test]
    async fn health_requires_no_auth() {
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();

        let resp = guarded().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn operator_route_rejects_missing_token() {
        let req = Request::builder().uri("/api/jobs").body(Body::empty()).unwrap();

        let resp = guarded().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_json(resp).await["error"],
            "invalid or missing auth token"
        );
    }

    #[tokio::test]
    async fn operator_route_rejects_wrong_token() {
        let req = Request::builder()
            .uri("/api/jobs")
            .header("Authorization", "Bearer totally-bogus")
            .body(Body::empty())
            .unwrap();

        let resp = guarded().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn operator_route_accepts_valid_token() {
        let req = Request::builder()
            .uri("/api/jobs")
            .header("Authorization", format!("Bearer {}", ADMIN_TOKEN))
            .body(Body::empty())
            .unwrap();

        let resp = guarded().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn query_token_accepted_for_event_streams() {
        let req = Request::builder()
            .uri(format!("/api/activity/unread-count?token={}", ADMIN_TOKEN))
            .body(Body::empty())
            .unwrap();

        let resp = guarded().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ca_certificate_is_public() {
        let req = Request::builder().uri("/api/pki/ca").body(Body::empty()).unwrap();

        let resp = guarded().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
