//! A live agent connection.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::agent::protocol::Envelope;
use crate::error::SessionError;

/// Write half of an agent transport.
#[async_trait]
pub trait MessageSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), SessionError>;

    async fn close(&mut self) -> Result<(), SessionError>;
}

/// One agent session, keyed by the server id from its client certificate.
pub struct Session {
    server_id: i64,
    sink: Mutex<Box<dyn MessageSink>>,
    last_seen: StdMutex<Instant>,
    closed: AtomicBool,
    done: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("server_id", &self.server_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(server_id: i64, sink: Box<dyn MessageSink>) -> Self {
        Self {
            server_id,
            sink: Mutex::new(sink),
            last_seen: StdMutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            done: CancellationToken::new(),
        }
    }

    pub fn server_id(&self) -> i64 {
        self.server_id
    }

    /// Serialize and write one envelope. Writes are serialised per session.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let text = envelope.to_text()?;
        let mut sink = self.sink.lock().await;
        sink.send_text(text).await
    }

    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    pub fn touch_at(&self, at: Instant) {
        *self.last_seen.lock().unwrap_or_else(|p| p.into_inner()) = at;
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`Session::close`] has been called.
    pub async fn closed(&self) {
        self.done.cancelled().await
    }

    /// Close the transport. Only the first call does anything.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.done.cancel();
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            tracing::debug!(server_id = self.server_id, error = %e, "Error closing agent transport");
        }
    }
}
