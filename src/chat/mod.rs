pub mod session;

pub use session::{ChatMessage, ChatOrigin, ChatRole, ChatSession};
