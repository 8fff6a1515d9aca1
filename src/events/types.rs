//! Inbound event model for the live socket.
//!
//! The wire format is a flat JSON object: `event_type` discriminator,
//! ISO-8601 `timestamp`, optional `task_id`, and a free-form `data` mapping.
//! `Event::parse` maps that into a closed tagged variant so downstream code
//! never touches raw JSON.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::errors::ConnectionError;

/// Task identifiers are opaque strings minted by the backend.
pub type TaskId = String;

/// A single server-to-client event, fully parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    /// Server timestamp, or local receipt time when the frame carried none.
    pub timestamp: DateTime<Utc>,
    /// True when `timestamp` was filled in locally.
    pub server_ts_missing: bool,
    pub task_id: Option<TaskId>,
}

/// The closed set of event kinds, each carrying its typed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Backend accepted a task.
    TaskStarted,
    /// Coarse task-level progress.
    TaskProgress {
        progress: Option<u8>,
        message: Option<String>,
    },
    /// Terminal success for the task.
    TaskCompleted { summary: Option<String> },
    /// Terminal failure for the task.
    TaskFailed { error: String },
    /// A named agent began work.
    AgentStarted {
        agent_name: String,
        message: Option<String>,
    },
    /// Progress from a named agent, 0..=100.
    AgentProgress {
        agent_name: String,
        progress: u8,
        message: Option<String>,
    },
    /// A named agent finished.
    AgentCompleted {
        agent_name: String,
        result: Option<Value>,
    },
    /// A named agent failed.
    AgentError { agent_name: String, error: String },
    /// Chat-style utterance from an agent.
    AgentMessage {
        agent_name: String,
        content: String,
    },
    /// Heartbeat or informational frame; carries no task state. Frames with
    /// an unrecognized `event_type` land here with the original tag kept.
    System {
        raw_type: Option<String>,
        message: Option<String>,
    },
}

/// Shape of the raw wire frame before typing.
#[derive(Debug, Deserialize)]
struct RawFrame {
    event_type: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

impl Event {
    /// Parse a raw frame into a typed event.
    ///
    /// Unknown `event_type` values are accepted as `System` with the original
    /// tag stashed in `raw_type`. An absent or unparseable `timestamp` is
    /// replaced with local receipt time and flagged. Malformed JSON is the
    /// only hard failure.
    pub fn parse(raw: &str) -> Result<Event, ConnectionError> {
        let frame: RawFrame =
            serde_json::from_str(raw).map_err(|e| ConnectionError::Parse(e.to_string()))?;

        let (timestamp, server_ts_missing) = match frame
            .timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        {
            Some(ts) => (ts.with_timezone(&Utc), false),
            None => (Utc::now(), true),
        };

        let data = frame.data.unwrap_or(Value::Null);
        let kind = EventKind::from_wire(&frame.event_type, &data);

        Ok(Event {
            kind,
            timestamp,
            server_ts_missing,
            task_id: frame.task_id,
        })
    }

    /// The wire-level discriminator for this event.
    pub fn event_type(&self) -> &str {
        match &self.kind {
            EventKind::TaskStarted => "task_started",
            EventKind::TaskProgress { .. } => "task_progress",
            EventKind::TaskCompleted { .. } => "task_completed",
            EventKind::TaskFailed { .. } => "task_failed",
            EventKind::AgentStarted { .. } => "agent_started",
            EventKind::AgentProgress { .. } => "agent_progress",
            EventKind::AgentCompleted { .. } => "agent_completed",
            EventKind::AgentError { .. } => "agent_error",
            EventKind::AgentMessage { .. } => "agent_message",
            EventKind::System { .. } => "system",
        }
    }

    /// Agent name carried by this event, if any.
    pub fn agent_name(&self) -> Option<&str> {
        match &self.kind {
            EventKind::AgentStarted { agent_name, .. }
            | EventKind::AgentProgress { agent_name, .. }
            | EventKind::AgentCompleted { agent_name, .. }
            | EventKind::AgentError { agent_name, .. }
            | EventKind::AgentMessage { agent_name, .. } => Some(agent_name),
            _ => None,
        }
    }

    /// Human-readable message carried by this event, if any.
    pub fn message(&self) -> Option<&str> {
        match &self.kind {
            EventKind::TaskProgress { message, .. }
            | EventKind::AgentStarted { message, .. }
            | EventKind::AgentProgress { message, .. }
            | EventKind::System { message, .. } => message.as_deref(),
            EventKind::AgentMessage { content, .. } => Some(content),
            _ => None,
        }
    }

    /// True for the two task-terminal kinds.
    pub fn is_task_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::TaskCompleted { .. } | EventKind::TaskFailed { .. }
        )
    }

    /// Identity used for consecutive-duplicate detection:
    /// (event_type, agent_name, timestamp).
    pub fn dedup_identity(&self) -> (String, Option<String>, DateTime<Utc>) {
        (
            self.event_type().to_string(),
            self.agent_name().map(str::to_string),
            self.timestamp,
        )
    }

    /// Synthetic event emitted by the connection manager when the socket
    /// opens. Routed to session-wide listeners only.
    pub fn connection_open() -> Event {
        Event {
            kind: EventKind::System {
                raw_type: Some("connection_open".to_string()),
                message: None,
            },
            timestamp: Utc::now(),
            server_ts_missing: true,
            task_id: None,
        }
    }
}

impl EventKind {
    fn from_wire(event_type: &str, data: &Value) -> EventKind {
        match event_type {
            "task_started" => EventKind::TaskStarted,
            "task_progress" => EventKind::TaskProgress {
                progress: progress_field(data),
                message: string_field(data, "message"),
            },
            "task_completed" => EventKind::TaskCompleted {
                summary: string_field(data, "summary").or_else(|| string_field(data, "result")),
            },
            "task_failed" => EventKind::TaskFailed {
                error: string_field(data, "error").unwrap_or_else(|| "Task failed".to_string()),
            },
            "agent_started" => match string_field(data, "agent_name") {
                Some(agent_name) => EventKind::AgentStarted {
                    agent_name,
                    message: string_field(data, "message"),
                },
                None => EventKind::system_fallback(event_type, data),
            },
            "agent_progress" => match string_field(data, "agent_name") {
                Some(agent_name) => EventKind::AgentProgress {
                    agent_name,
                    progress: progress_field(data).unwrap_or(0),
                    message: string_field(data, "message"),
                },
                None => EventKind::system_fallback(event_type, data),
            },
            "agent_completed" => match string_field(data, "agent_name") {
                Some(agent_name) => EventKind::AgentCompleted {
                    agent_name,
                    result: data.get("result").cloned().filter(|v| !v.is_null()),
                },
                None => EventKind::system_fallback(event_type, data),
            },
            "agent_error" => match string_field(data, "agent_name") {
                Some(agent_name) => EventKind::AgentError {
                    agent_name,
                    error: string_field(data, "error")
                        .unwrap_or_else(|| "Agent error".to_string()),
                },
                None => EventKind::system_fallback(event_type, data),
            },
            "agent_message" => {
                // Utterances arrive under either `message` or `response`.
                let content =
                    string_field(data, "message").or_else(|| string_field(data, "response"));
                match (string_field(data, "agent_name"), content) {
                    (Some(agent_name), Some(content)) => EventKind::AgentMessage {
                        agent_name,
                        content,
                    },
                    _ => EventKind::system_fallback(event_type, data),
                }
            }
            "system" => EventKind::System {
                raw_type: None,
                message: string_field(data, "message"),
            },
            other => EventKind::System {
                raw_type: Some(other.to_string()),
                message: string_field(data, "message"),
            },
        }
    }

    /// Fallback for a known kind whose required payload fields are missing:
    /// keep the frame as `System` with the tag preserved rather than invent
    /// agent state.
    fn system_fallback(event_type: &str, data: &Value) -> EventKind {
        EventKind::System {
            raw_type: Some(event_type.to_string()),
            message: string_field(data, "message"),
        }
    }
}

fn string_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Read a 0..100 progress value, clamping anything out of range.
fn progress_field(data: &Value) -> Option<u8> {
    data.get("progress").and_then(Value::as_f64).map(|p| {
        if p <= 0.0 {
            0
        } else if p >= 100.0 {
            100
        } else {
            p.round() as u8
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_agent_progress() {
        let raw = r#"{
            "event_type": "agent_progress",
            "timestamp": "2025-06-01T12:00:00Z",
            "task_id": "t-1",
            "data": {"agent_name": "ResearchAgent", "progress": 40, "message": "Searching"}
        }"#;
        let event = Event::parse(raw).unwrap();
        assert_eq!(event.task_id.as_deref(), Some("t-1"));
        assert!(!event.server_ts_missing);
        match event.kind {
            EventKind::AgentProgress {
                ref agent_name,
                progress,
                ref message,
            } => {
                assert_eq!(agent_name, "ResearchAgent");
                assert_eq!(progress, 40);
                assert_eq!(message.as_deref(), Some("Searching"));
            }
            other => panic!("Expected AgentProgress, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_type_becomes_system() {
        let raw = r#"{"event_type": "telemetry_blip", "timestamp": "2025-06-01T12:00:00Z"}"#;
        let event = Event::parse(raw).unwrap();
        match event.kind {
            EventKind::System { raw_type, .. } => {
                assert_eq!(raw_type.as_deref(), Some("telemetry_blip"));
            }
            other => panic!("Expected System, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_missing_timestamp_flagged() {
        let raw = r#"{"event_type": "task_started", "task_id": "t-2"}"#;
        let event = Event::parse(raw).unwrap();
        assert!(event.server_ts_missing);
        assert!(matches!(event.kind, EventKind::TaskStarted));
    }

    #[test]
    fn test_parse_malformed_json_fails() {
        let result = Event::parse("{not json");
        assert!(matches!(result, Err(ConnectionError::Parse(_))));
    }

    #[test]
    fn test_agent_message_accepts_response_field() {
        let raw = r#"{
            "event_type": "agent_message",
            "timestamp": "2025-06-01T12:00:00Z",
            "data": {"agent_name": "CodeAgent", "response": "done"}
        }"#;
        let event = Event::parse(raw).unwrap();
        match event.kind {
            EventKind::AgentMessage { content, .. } => assert_eq!(content, "done"),
            other => panic!("Expected AgentMessage, got {:?}", other),
        }
    }

    #[test]
    fn test_agent_event_without_name_degrades_to_system() {
        let raw = r#"{
            "event_type": "agent_progress",
            "timestamp": "2025-06-01T12:00:00Z",
            "data": {"progress": 10}
        }"#;
        let event = Event::parse(raw).unwrap();
        match event.kind {
            EventKind::System { raw_type, .. } => {
                assert_eq!(raw_type.as_deref(), Some("agent_progress"));
            }
            other => panic!("Expected System, got {:?}", other),
        }
    }

    #[test]
    fn test_progress_clamped_to_range() {
        let raw = r#"{
            "event_type": "agent_progress",
            "timestamp": "2025-06-01T12:00:00Z",
            "data": {"agent_name": "A", "progress": 250}
        }"#;
        let event = Event::parse(raw).unwrap();
        match event.kind {
            EventKind::AgentProgress { progress, .. } => assert_eq!(progress, 100),
            other => panic!("Expected AgentProgress, got {:?}", other),
        }
    }

    #[test]
    fn test_task_failed_defaults_error_text() {
        let raw = r#"{"event_type": "task_failed", "timestamp": "2025-06-01T12:00:00Z"}"#;
        let event = Event::parse(raw).unwrap();
        match event.kind {
            EventKind::TaskFailed { error } => assert_eq!(error, "Task failed"),
            other => panic!("Expected TaskFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_event_type_roundtrip() {
        let raw = r#"{
            "event_type": "agent_completed",
            "timestamp": "2025-06-01T12:00:00Z",
            "data": {"agent_name": "A"}
        }"#;
        let event = Event::parse(raw).unwrap();
        assert_eq!(event.event_type(), "agent_completed");
        assert_eq!(event.agent_name(), Some("A"));
    }

    #[test]
    fn test_dedup_identity_distinguishes_agents() {
        let a = Event::parse(
            r#"{"event_type": "agent_started", "timestamp": "2025-06-01T12:00:00Z",
               "data": {"agent_name": "A"}}"#,
        )
        .unwrap();
        let b = Event::parse(
            r#"{"event_type": "agent_started", "timestamp": "2025-06-01T12:00:00Z",
               "data": {"agent_name": "B"}}"#,
        )
        .unwrap();
        assert_ne!(a.dedup_identity(), b.dedup_identity());
    }
}
