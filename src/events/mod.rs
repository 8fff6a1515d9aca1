pub mod reducer;
pub mod types;

pub use reducer::{AgentState, AgentStatus, TaskState, TaskTerminal};
pub use types::{Event, EventKind, TaskId};
