//! Agent transport: the wire protocol, live sessions, the session hub, the
//! per-connection read loop and the liveness monitor.
//!
//! Agents run on managed nodes and hold one long-lived connection each,
//! authenticated by a client certificate whose CN is `server-<id>`.

pub mod handler;
pub mod hub;
pub mod monitor;
pub mod protocol;
pub mod session;

pub use handler::{AgentEvents, ConnectionHandler};
pub use hub::Hub;
pub use monitor::{LivenessMonitor, LivenessReport};
pub use protocol::{Command, CommandResult, Envelope, Heartbeat, HeartbeatAck, LogEntry, MessageType};
pub use session::{MessageSink, Session};
