//! Per-connection read loop.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::agent::hub::Hub;
use crate::agent::protocol::{CommandResult, Envelope, Heartbeat, LogEntry, MessageType};
use crate::agent::session::Session;
use crate::error::{DispatchError, SessionError};

/// Receiver of agent replies.
#[async_trait]
pub trait AgentEvents: Send + Sync {
    async fn handle_result(&self, server_id: i64, result: CommandResult)
    -> Result<(), DispatchError>;

    async fn handle_log_entry(&self, server_id: i64, entry: LogEntry) -> Result<(), DispatchError>;
}

/// Drives one session: reads frames until the transport fails, the session
/// is closed, or shutdown is requested.
#[derive(Clone)]
pub struct ConnectionHandler {
    hub: Arc<Hub>,
    events: Arc<dyn AgentEvents>,
}

impl ConnectionHandler {
    pub fn new(hub: Arc<Hub>, events: Arc<dyn AgentEvents>) -> Self {
        Self { hub, events }
    }

    /// Register `session`, run its read loop, then unregister and close it.
    pub async fn run<S>(&self, session: Arc<Session>, mut incoming: S, shutdown: CancellationToken)
    where
        S: Stream<Item = Result<String, SessionError>> + Unpin + Send,
    {
        let server_id = session.server_id();
        self.hub.register(session.clone()).await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = session.closed() => break,
                frame = incoming.next() => match frame {
                    Some(Ok(text)) => self.handle_text(&session, &text).await,
                    Some(Err(e)) => {
                        tracing::debug!(server_id, error = %e, "Agent receive error");
                        break;
                    }
                    None => break,
                },
            }
        }

        self.hub.unregister_if_current(&session).await;
        session.close().await;
        tracing::info!(server_id, "Agent connection closed");
    }

    /// Decode one frame. Undecodable frames are skipped.
    pub async fn handle_text(&self, session: &Session, text: &str) {
        match Envelope::from_text(text) {
            Ok(envelope) => self.handle_envelope(session, envelope).await,
            Err(e) => {
                tracing::debug!(server_id = session.server_id(), error = %e, "Skipping malformed agent frame");
            }
        }
    }

    async fn handle_envelope(&self, session: &Session, envelope: Envelope) {
        let server_id = session.server_id();
        match envelope.kind {
            MessageType::Heartbeat => {
                session.touch();
                if let Err(e) = envelope.decode::<Heartbeat>() {
                    tracing::debug!(server_id, error = %e, "Malformed heartbeat");
                    return;
                }
                let ack = match Envelope::heartbeat_ack(Utc::now()) {
                    Ok(ack) => ack,
                    Err(e) => {
                        tracing::error!(server_id, error = %e, "Failed to encode heartbeat ack");
                        return;
                    }
                };
                if let Err(e) = session.send(&ack).await {
                    tracing::debug!(server_id, error = %e, "Failed to send heartbeat ack");
                }
            }
            MessageType::CommandResult => match envelope.decode::<CommandResult>() {
                Ok(result) => {
                    if let Err(e) = self.events.handle_result(server_id, result).await {
                        tracing::error!(server_id, error = %e, "Failed to handle command result");
                    }
                }
                Err(e) => tracing::debug!(server_id, error = %e, "Malformed command result"),
            },
            MessageType::LogEntry => match envelope.decode::<LogEntry>() {
                Ok(entry) => {
                    if let Err(e) = self.events.handle_log_entry(server_id, entry).await {
                        tracing::error!(server_id, error = %e, "Failed to handle log entry");
                    }
                }
                Err(e) => tracing::debug!(server_id, error = %e, "Malformed log entry"),
            },
            other => {
                tracing::debug!(server_id, kind = ?other, "Ignoring agent message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::agent::session::testing::session;

    #[derive(Default)]
    struct Recorder {
        results: Mutex<Vec<(i64, CommandResult)>>,
        logs: Mutex<Vec<(i64, LogEntry)>>,
    }

    #[async_trait]
    impl AgentEvents for Recorder {
        async fn handle_result(
            &self,
            server_id: i64,
            result: CommandResult,
        ) -> Result<(), DispatchError> {
            self.results.lock().unwrap().push((server_id, result));
            Ok(())
        }

        async fn handle_log_entry(
            &self,
            server_id: i64,
            entry: LogEntry,
        ) -> Result<(), DispatchError> {
            self.logs.lock().unwrap().push((server_id, entry));
            Ok(())
        }
    }

    fn frames(texts: &[&str]) -> impl Stream<Item = Result<String, SessionError>> + Unpin + Send {
        futures::stream::iter(
            texts
                .iter()
                .map(|t| Ok(t.to_string()))
                .collect::<Vec<Result<String, SessionError>>>(),
        )
    }

    #[tokio::test]
    async fn test_read_loop_dispatches_and_cleans_up() {
        let hub = Arc::new(Hub::new());
        let recorder = Arc::new(Recorder::default());
        let handler = ConnectionHandler::new(hub.clone(), recorder.clone());
        let (session, sink) = session(11);

        let incoming = frames(&[
            r#"{"type":"heartbeat","payload":{"timestamp":"2026-03-01T00:00:00Z","version":"1.2.0"}}"#,
            "not json",
            r#"{"type":"telemetry","payload":{}}"#,
            r#"{"type":"log_entry","payload":{"command_id":"c1","timestamp":"2026-03-01T00:00:01Z","level":"info","message":"restarting"}}"#,
            r#"{"type":"command_result","payload":{"command_id":"c1","success":true,"output":"ok"}}"#,
        ]);
        handler
            .run(session.clone(), incoming, CancellationToken::new())
            .await;

        assert_eq!(sink.of_kind(MessageType::HeartbeatAck).len(), 1);
        {
            let results = recorder.results.lock().unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].0, 11);
            assert_eq!(results[0].1.output.as_deref(), Some("ok"));
        }
        assert_eq!(recorder.logs.lock().unwrap()[0].1.message, "restarting");

        // End of stream unregisters and closes.
        assert!(hub.is_empty().await);
        assert!(session.is_closed());
        assert_eq!(sink.closes(), 1);
    }

    #[tokio::test]
    async fn test_read_error_ends_loop() {
        let hub = Arc::new(Hub::new());
        let handler = ConnectionHandler::new(hub.clone(), Arc::new(Recorder::default()));
        let (session, _) = session(2);
        let incoming = futures::stream::iter(vec![Err::<String, _>(SessionError::Transport(
            "reset".to_string(),
        ))]);
        handler.run(session.clone(), incoming, CancellationToken::new()).await;
        assert!(session.is_closed());
        assert!(!hub.is_connected(2).await);
    }

    #[tokio::test]
    async fn test_shutdown_ends_pending_loop() {
        let hub = Arc::new(Hub::new());
        let handler = ConnectionHandler::new(hub.clone(), Arc::new(Recorder::default()));
        let (session, _) = session(2);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        handler
            .run(
                session.clone(),
                futures::stream::pending::<Result<String, SessionError>>(),
                shutdown,
            )
            .await;
        assert!(session.is_closed());
    }
}
