//! Agent wire protocol: JSON envelopes `{type, payload}` carried as text
//! frames on the agent socket.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Envelope `type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Heartbeat,
    HeartbeatAck,
    Command,
    CommandResult,
    LogEntry,
    /// Anything this build does not understand. Logged and ignored.
    #[serde(other)]
    Unknown,
}

/// A single frame. The payload is kept as raw JSON until the receiver
/// knows which shape to decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub payload: Box<RawValue>,
}

impl Envelope {
    pub fn new<T: Serialize>(kind: MessageType, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind,
            payload: serde_json::value::to_raw_value(payload)?,
        })
    }

    pub fn command(command: &Command) -> Result<Self, serde_json::Error> {
        Self::new(MessageType::Command, command)
    }

    pub fn heartbeat_ack(now: DateTime<Utc>) -> Result<Self, serde_json::Error> {
        Self::new(MessageType::HeartbeatAck, &HeartbeatAck { timestamp: now })
    }

    /// Decode the payload as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(self.payload.get())
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Agent liveness ping, sent every 15 seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub timestamp: DateTime<Utc>,
}

/// Server to agent: run `command_type` for `job_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub job_id: i64,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Agent to server: outcome of the command with `command_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// A log line streamed while a command runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub command_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_envelope_preserves_type_and_payload_bytes() {
        let text = r#"{"type":"command_result","payload":{"command_id":"c-1","success":false,"error":"unit not found"}}"#;
        let env = Envelope::from_text(text).unwrap();
        assert_eq!(env.kind, MessageType::CommandResult);
        assert_eq!(
            env.payload.get(),
            r#"{"command_id":"c-1","success":false,"error":"unit not found"}"#
        );
        assert_eq!(env.to_text().unwrap(), text);

        let result: CommandResult = env.decode().unwrap();
        assert_eq!(result.error.as_deref(), Some("unit not found"));
        assert!(result.output.is_none());
    }

    #[test]
    fn test_command_wire_shape() {
        let cmd = Command {
            id: "abc".to_string(),
            job_id: 12,
            command_type: "restart_service".to_string(),
            payload: serde_json::json!({"service_name": "nginx"}),
        };
        let value: serde_json::Value =
            serde_json::from_str(&Envelope::command(&cmd).unwrap().to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "command");
        assert_eq!(value["payload"]["type"], "restart_service");
        assert_eq!(value["payload"]["job_id"], 12);
        assert_eq!(value["payload"]["payload"]["service_name"], "nginx");
    }

    #[test]
    fn test_unknown_type_decodes() {
        let env = Envelope::from_text(r#"{"type":"metrics","payload":{}}"#).unwrap();
        assert_eq!(env.kind, MessageType::Unknown);
    }

    #[test]
    fn test_heartbeat_without_version() {
        let env = Envelope::from_text(
            r#"{"type":"heartbeat","payload":{"timestamp":"2026-01-02T03:04:05.123456Z"}}"#,
        )
        .unwrap();
        let hb: Heartbeat = env.decode().unwrap();
        assert_eq!(hb.version, "");
    }
}
