pub mod client;
pub mod toast;

pub use client::{
    ApiClient, ChatReply, ChatTurn, CreateProjectRequest, FeedbackRequest, ProjectCreated,
};
pub use toast::{NoopToasts, Toast, ToastLevel, ToastSink, Toaster};
