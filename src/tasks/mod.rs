pub mod store;

pub use store::{LiveTaskStore, TaskView, TaskWatch};
