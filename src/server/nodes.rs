//! Node bootstrap and PKI endpoints, plus the provider catalog lookup.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use serde::Deserialize;

use crate::error::RegistrationError;
use crate::provider::ServerCatalog;
use crate::registration::{IssuedToken, RegisterError, RegisteredNode};
use crate::server::AppState;
use crate::server::error::{ApiError, ApiResult, parse_id};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub csr: String,
}

impl From<RegisterError> for ApiError {
    fn from(err: RegisterError) -> Self {
        match err {
            RegisterError::BadRequest(message) => ApiError::bad_request(message),
            e @ RegisterError::Unauthorized => ApiError::unauthorized(e.to_string()),
            e @ RegisterError::Conflict => ApiError::new(StatusCode::CONFLICT, e.to_string()),
            RegisterError::Internal { message, source } => {
                tracing::error!(error = %source, "{}", message);
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        }
    }
}

impl From<RegistrationError> for ApiError {
    fn from(err: RegistrationError) -> Self {
        match err {
            e @ (RegistrationError::InvalidServerId | RegistrationError::InvalidTtl) => {
                ApiError::bad_request(e.to_string())
            }
            e @ RegistrationError::TokenRejected => ApiError::unauthorized(e.to_string()),
            RegistrationError::Database(db) => db.into(),
        }
    }
}

/// `POST /api/nodes/{id}/register`: trade a one-time token and CSR for a
/// client certificate.
pub async fn register_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<Json<RegisteredNode>> {
    let server_id = id
        .trim()
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| ApiError::bad_request("invalid server id"))?;
    let Json(req) = body.map_err(|_| ApiError::bad_request("invalid request body"))?;

    let node = state
        .registration
        .register_node(server_id, &req.token, &req.csr)
        .await?;
    Ok(Json(node))
}

/// `POST /api/servers/{id}/registration-token`
pub async fn issue_registration_token(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<IssuedToken>)> {
    let server_id = parse_id(&id, "server id")?;
    let issued = state.registration.issue(server_id, state.token_ttl).await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

/// `POST /api/certificates/{serial}/revoke`
pub async fn revoke_certificate(
    State(state): State<AppState>,
    Path(serial): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let serial = serial.trim();
    if serial.is_empty() || !serial.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ApiError::bad_request("serial must be hex"));
    }
    if !state.registration.revoke(serial).await? {
        return Err(ApiError::not_found("certificate not found or already revoked"));
    }
    Ok(Json(serde_json::json!({
        "serial_number": serial.to_ascii_lowercase(),
        "revoked": true,
    })))
}

/// `GET /api/pki/ca`
pub async fn ca_certificate(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/x-pem-file")],
        state.registration.ca().pem(),
    )
}

/// `GET /api/providers/{id}/catalog`: locations and sizes offered by the
/// account's provider.
pub async fn provider_catalog(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ServerCatalog>> {
    let provider_id = parse_id(&id, "provider id")?;
    let record = state.providers.get_provider(provider_id).await?;
    let provider = state.registry.get(&record.provider_type).ok_or_else(|| {
        ApiError::bad_request(format!("unsupported provider type: {}", record.provider_type))
    })?;
    Ok(Json(provider.list_server_catalog(&record.api_token).await?))
}
