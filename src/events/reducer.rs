//! Per-task state derived from the event stream.
//!
//! `TaskState::apply` is the only mutation point: a total, synchronous
//! transition from prior state plus one event to the next state. Keeping it
//! pure makes replay after reconnect and property testing trivial.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::events::types::{Event, EventKind, TaskId};

/// Lifecycle of a single agent within a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Pending,
    Starting,
    InProgress,
    Completed,
    Error,
}

impl AgentState {
    /// Terminal agent states only restart via a strictly newer
    /// `agent_started`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Completed | AgentState::Error)
    }
}

/// Latest known status of one agent working on a task.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AgentStatus {
    pub state: AgentState,
    /// 0..=100.
    pub progress: u8,
    /// Last non-empty status message.
    pub message: Option<String>,
    /// Error text, set when `state` is `Error`.
    pub error: Option<String>,
    /// Timestamp of the last event that touched this agent.
    pub updated_at: DateTime<Utc>,
}

impl AgentStatus {
    fn new(updated_at: DateTime<Utc>) -> Self {
        Self {
            state: AgentState::Pending,
            progress: 0,
            message: None,
            error: None,
            updated_at,
        }
    }
}

/// Terminal outcome of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskTerminal {
    Completed,
    Failed,
}

/// Accumulated state for one subscribed task.
#[derive(Debug, Clone)]
pub struct TaskState {
    pub task_id: TaskId,
    /// Ordered activity timeline, weakly monotonic in server timestamp.
    pub timeline: Vec<Event>,
    /// Agent name to latest status. BTreeMap keeps projection order stable.
    pub agents: BTreeMap<String, AgentStatus>,
    /// Set once by `task_completed`/`task_failed`; never cleared.
    pub terminal: Option<TaskTerminal>,
    /// Highest server timestamp observed.
    pub last_server_ts: Option<DateTime<Utc>>,
    /// Identity of the previous append, for consecutive-duplicate drops.
    last_appended: Option<(String, Option<String>, DateTime<Utc>)>,
}

impl TaskState {
    pub fn new(task_id: impl Into<TaskId>) -> Self {
        Self {
            task_id: task_id.into(),
            timeline: Vec::new(),
            agents: BTreeMap::new(),
            terminal: None,
            last_server_ts: None,
            last_appended: None,
        }
    }

    /// Apply one event. Total: never fails, never suspends.
    pub fn apply(&mut self, event: Event) {
        // Consecutive duplicate (same kind, agent, timestamp as the previous
        // append) is dropped outright.
        let identity = event.dedup_identity();
        if self.last_appended.as_ref() == Some(&identity) {
            return;
        }
        self.last_appended = Some(identity);

        if self
            .last_server_ts
            .is_none_or(|ts| event.timestamp > ts)
        {
            self.last_server_ts = Some(event.timestamp);
        }

        let was_terminal = self.terminal.is_some();
        match &event.kind {
            EventKind::TaskCompleted { .. } if !was_terminal => {
                self.terminal = Some(TaskTerminal::Completed);
            }
            EventKind::TaskFailed { .. } if !was_terminal => {
                self.terminal = Some(TaskTerminal::Failed);
            }
            // A terminal task keeps its timeline growing but its agents
            // frozen.
            _ if was_terminal => {}
            _ => self.apply_agent_transition(&event),
        }

        self.insert_into_timeline(event);
    }

    /// Binary insertion by server timestamp; ties keep arrival order, so
    /// server insertion order wins on equal timestamps.
    fn insert_into_timeline(&mut self, event: Event) {
        let at = self
            .timeline
            .partition_point(|existing| existing.timestamp <= event.timestamp);
        if at == self.timeline.len() {
            self.timeline.push(event);
        } else {
            self.timeline.insert(at, event);
        }
    }

    fn apply_agent_transition(&mut self, event: &Event) {
        let ts = event.timestamp;
        match &event.kind {
            EventKind::AgentStarted {
                agent_name,
                message,
            } => {
                let status = self
                    .agents
                    .entry(agent_name.clone())
                    .or_insert_with(|| AgentStatus::new(ts));
                if status.state.is_terminal() {
                    // Explicit restart requires a strictly newer timestamp.
                    if ts > status.updated_at {
                        status.state = AgentState::InProgress;
                        status.progress = 0;
                        status.error = None;
                        status.updated_at = ts;
                        update_message(status, message.as_deref());
                    }
                } else {
                    status.state = AgentState::Starting;
                    touch(status, ts);
                    update_message(status, message.as_deref());
                }
            }
            EventKind::AgentProgress {
                agent_name,
                progress,
                message,
            } => {
                let status = self
                    .agents
                    .entry(agent_name.clone())
                    .or_insert_with(|| AgentStatus::new(ts));
                if status.state.is_terminal() {
                    return;
                }
                status.state = AgentState::InProgress;
                // Progress never regresses unless the regression carries a
                // newer timestamp (a deliberate reset).
                if *progress >= status.progress || ts > status.updated_at {
                    status.progress = *progress;
                }
                touch(status, ts);
                update_message(status, message.as_deref());
            }
            EventKind::AgentCompleted { agent_name, .. } => {
                let status = self
                    .agents
                    .entry(agent_name.clone())
                    .or_insert_with(|| AgentStatus::new(ts));
                status.state = AgentState::Completed;
                status.progress = 100;
                touch(status, ts);
            }
            EventKind::AgentError { agent_name, error } => {
                let status = self
                    .agents
                    .entry(agent_name.clone())
                    .or_insert_with(|| AgentStatus::new(ts));
                status.state = AgentState::Error;
                status.error = Some(error.clone());
                touch(status, ts);
            }
            // Chat utterances and system frames live in the timeline only.
            _ => {}
        }
    }
}

/// Advance the last-update timestamp, never backward: a late out-of-order
/// event must not weaken the restart and progress comparisons.
fn touch(status: &mut AgentStatus, ts: DateTime<Utc>) {
    if ts > status.updated_at {
        status.updated_at = ts;
    }
}

fn update_message(status: &mut AgentStatus, message: Option<&str>) {
    if let Some(message) = message.filter(|m| !m.is_empty()) {
        status.message = Some(message.to_string());
    }
}
