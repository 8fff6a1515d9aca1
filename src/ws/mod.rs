pub mod connection;
pub mod frames;
pub mod registry;

pub use connection::{
    ConnectionManager, ConnectionState, ConnectionStatus, ListenerId, StatsSnapshot,
};
pub use frames::ClientFrame;
pub use registry::{HandleId, SubscriptionRegistry};
