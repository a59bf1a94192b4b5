//! `/ws/agent`: the long-lived agent connection.
//!
//! The peer must present a client certificate issued by the internal CA
//! whose CN is `server-<id>`, and the certificate must not be revoked.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Extension;
use axum::extract::State;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, Stream, StreamExt, future};

use crate::agent::{MessageSink, Session};
use crate::error::SessionError;
use crate::pki::tls::{PeerCertificate, PeerIdentity};
use crate::server::AppState;
use crate::server::error::ApiError;

/// Write half of an upgraded socket.
struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl MessageSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), SessionError> {
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.0
            .close()
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }
}

/// Text frames until the peer closes. Control and binary frames are dropped.
fn text_frames(
    stream: SplitStream<WebSocket>,
) -> impl Stream<Item = Result<String, SessionError>> + Unpin + Send {
    Box::pin(
        stream
            .take_while(|frame| future::ready(!matches!(frame, Ok(Message::Close(_)))))
            .filter_map(|frame| {
                future::ready(match frame {
                    Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                    Ok(_) => None,
                    Err(e) => Some(Err(SessionError::Transport(e.to_string()))),
                })
            }),
    )
}

/// Authenticate the peer certificate, then upgrade.
pub async fn agent_socket(
    State(state): State<AppState>,
    peer: Option<Extension<PeerCertificate>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(leaf) = peer.as_ref().and_then(|Extension(peer)| peer.leaf()) else {
        return ApiError::unauthorized("valid client certificate required").into_response();
    };
    let identity = match PeerIdentity::from_der(leaf) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::debug!(error = %e, "Rejected agent certificate");
            return ApiError::unauthorized("invalid certificate CN").into_response();
        }
    };
    match state.registration.is_revoked(&identity.serial_number).await {
        Ok(false) => {}
        Ok(true) => {
            tracing::warn!(
                server_id = identity.server_id,
                serial = %identity.serial_number,
                "Revoked certificate presented by agent"
            );
            return ApiError::unauthorized("certificate revoked").into_response();
        }
        Err(e) => return ApiError::internal(e).into_response(),
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let agents = state.agents.clone();
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let session = Arc::new(Session::new(identity.server_id, Box::new(WsSink(sink))));
        tracing::info!(
            server_id = identity.server_id,
            serial = %identity.serial_number,
            "Agent connected"
        );
        agents.run(session, text_frames(stream), shutdown).await;
    })
}
