//! Client-to-server frames for the live socket.

use serde::{Deserialize, Serialize};

use crate::events::TaskId;

/// The three frames a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Heartbeat; the server answers with a `system` event or a pong.
    Ping,
    /// Declare interest in events for one task.
    Subscribe { task_id: TaskId },
    /// Withdraw interest in one task.
    Unsubscribe { task_id: TaskId },
}

impl ClientFrame {
    pub fn to_json(&self) -> String {
        // The enum serializes infallibly: tag plus an optional string field.
        serde_json::to_string(self).expect("ClientFrame serialization cannot fail")
    }
}
