//! Client core for the Nexus AI orchestration backend.
//!
//! The crate owns the live side of the product: a resilient WebSocket
//! connection with reconnect and heartbeat, per-task subscription routing, a
//! pure event reducer deriving agent status and an activity timeline, chat
//! sessions that merge HTTP replies with socket pushes, and a typed HTTP
//! client with normalized errors and a toast policy. UI collaborators
//! consume snapshots and change notifications; they never touch the wire.

pub mod api;
pub mod auth;
pub mod chat;
pub mod config;
pub mod errors;
pub mod events;
pub mod session;
pub mod tasks;
pub mod ws;

pub use api::{ApiClient, NoopToasts, Toast, ToastLevel, ToastSink};
pub use auth::AuthContext;
pub use chat::ChatSession;
pub use config::NexusConfig;
pub use errors::{ApiError, ApiErrorKind, ConnectionError};
pub use events::{AgentState, AgentStatus, Event, EventKind, TaskState, TaskTerminal};
pub use session::NexusSession;
pub use tasks::{LiveTaskStore, TaskView, TaskWatch};
pub use ws::{ConnectionManager, ConnectionState, ConnectionStatus, SubscriptionRegistry};
