//! Registry of live agent sessions, one per server.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::agent::protocol::Envelope;
use crate::agent::session::Session;
use crate::error::SessionError;

/// Maps `server_id` to its session. Registering a second session for the
/// same server replaces and closes the first.
#[derive(Default)]
pub struct Hub {
    sessions: RwLock<HashMap<i64, Arc<Session>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `session`, closing whatever it replaced.
    pub async fn register(&self, session: Arc<Session>) {
        let server_id = session.server_id();
        let previous = {
            let mut sessions = self.sessions.write().await;
            sessions.insert(server_id, session)
        };
        if let Some(previous) = previous {
            tracing::info!(server_id, "Replacing existing agent session");
            previous.close().await;
        } else {
            tracing::info!(server_id, "Agent session registered");
        }
    }

    pub async fn unregister(&self, server_id: i64) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(&server_id);
        if removed.is_some() {
            tracing::info!(server_id, "Agent session unregistered");
        }
        removed
    }

    /// Remove `session` only if it is still the registered one, so a
    /// replaced session's teardown does not evict its successor.
    pub async fn unregister_if_current(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&session.server_id()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.server_id());
                tracing::info!(server_id = session.server_id(), "Agent session unregistered");
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, server_id: i64) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&server_id).cloned()
    }

    pub async fn is_connected(&self, server_id: i64) -> bool {
        self.sessions.read().await.contains_key(&server_id)
    }

    /// Send to one server. A missing session is not an error.
    pub async fn send(&self, server_id: i64, envelope: &Envelope) -> Result<(), SessionError> {
        match self.get(server_id).await {
            Some(session) => session.send(envelope).await,
            None => Ok(()),
        }
    }

    /// Best-effort send to every session.
    pub async fn broadcast(&self, envelope: &Envelope) {
        for session in self.snapshot().await {
            if let Err(e) = session.send(envelope).await {
                tracing::warn!(server_id = session.server_id(), error = %e, "Broadcast send failed");
            }
        }
    }

    /// Visit each session until `f` returns false. Iterates a snapshot, so
    /// `f` may call back into the hub.
    pub async fn range<F>(&self, mut f: F)
    where
        F: FnMut(i64, &Arc<Session>) -> bool,
    {
        for session in self.snapshot().await {
            if !f(session.server_id(), &session) {
                break;
            }
        }
    }

    /// Current sessions, ordered by server id.
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> =
            self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.server_id());
        sessions
    }

    pub async fn connected_server_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.sessions.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Close and drop every session. Used at shutdown.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        let count = sessions.len();
        for session in sessions {
            session.close().await;
        }
        if count > 0 {
            tracing::info!(count, "Closed agent sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::protocol::MessageType;
    use crate::agent::session::testing::session;

    fn ack() -> Envelope {
        Envelope::heartbeat_ack(chrono::Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn test_register_replaces_and_closes_previous() {
        let hub = Hub::new();
        let (first, first_sink) = session(7);
        let (second, second_sink) = session(7);

        hub.register(first.clone()).await;
        hub.register(second.clone()).await;

        assert_eq!(hub.len().await, 1);
        assert!(first.is_closed());
        assert_eq!(first_sink.closes(), 1);
        assert!(Arc::ptr_eq(&hub.get(7).await.unwrap(), &second));

        hub.send(7, &ack()).await.unwrap();
        assert_eq!(second_sink.of_kind(MessageType::HeartbeatAck).len(), 1);
        assert!(first_sink.envelopes().is_empty());
    }

    #[tokio::test]
    async fn test_stale_teardown_keeps_successor() {
        let hub = Hub::new();
        let (first, _) = session(3);
        let (second, _) = session(3);
        hub.register(first.clone()).await;
        hub.register(second.clone()).await;

        assert!(!hub.unregister_if_current(&first).await);
        assert!(hub.is_connected(3).await);
        assert!(hub.unregister_if_current(&second).await);
        assert!(hub.is_empty().await);
    }

    #[tokio::test]
    async fn test_send_to_absent_server_is_noop() {
        let hub = Hub::new();
        hub.send(99, &ack()).await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_range_and_close_all() {
        let hub = Hub::new();
        let mut sinks = Vec::new();
        for id in [5, 1, 3] {
            let (s, sink) = session(id);
            hub.register(s).await;
            sinks.push(sink);
        }
        assert_eq!(hub.connected_server_ids().await, vec![1, 3, 5]);

        hub.broadcast(&ack()).await;
        assert!(sinks.iter().all(|s| s.envelopes().len() == 1));

        let mut seen = Vec::new();
        hub.range(|id, _| {
            seen.push(id);
            id < 3
        })
        .await;
        assert_eq!(seen, vec![1, 3]);

        hub.close_all().await;
        assert_eq!(hub.len().await, 0);
        assert!(sinks.iter().all(|s| s.closes() == 1));
    }
}
