//! User-facing error surface with sticky ids and throttling.
//!
//! The core never renders toasts itself. The UI collaborator implements
//! [`ToastSink`]; the [`Toaster`] decides whether a given failure produces a
//! toast at all, under which sticky id, and how often.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::NexusConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastLevel {
    Info,
    Warning,
    Error,
}

/// One toast. Sinks showing a toast whose `id` is already on screen should
/// refresh it in place rather than stack a duplicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub id: String,
    pub level: ToastLevel,
    pub message: String,
}

pub trait ToastSink: Send + Sync {
    fn show(&self, toast: Toast);
}

/// Sink that drops everything; for headless hosts and tests.
#[derive(Debug, Default)]
pub struct NoopToasts;

impl ToastSink for NoopToasts {
    fn show(&self, _toast: Toast) {}
}

/// Documented wording per HTTP status. 401 is absent on purpose: auth expiry
/// redirects instead of toasting.
pub(crate) fn message_for_status(status: u16) -> Option<&'static str> {
    match status {
        400 => Some("Invalid request. Please check your input and try again."),
        403 => Some("You don't have permission to do that."),
        404 => Some("The requested resource was not found."),
        422 => Some("The request could not be processed. Please review your input."),
        429 => Some("Too many requests. Please slow down and try again."),
        500 => Some("Something went wrong on the server. Please try again."),
        503 => Some("The service is temporarily unavailable. Please try again shortly."),
        _ => None,
    }
}

pub struct Toaster {
    sink: Arc<dyn ToastSink>,
    throttle: Duration,
    last_shown: Mutex<HashMap<String, Instant>>,
}

impl std::fmt::Debug for Toaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toaster")
            .field("throttle", &self.throttle)
            .finish()
    }
}

impl Toaster {
    pub fn new(sink: Arc<dyn ToastSink>, config: &NexusConfig) -> Self {
        Self {
            sink,
            throttle: config.network_toast_throttle,
            last_shown: Mutex::new(HashMap::new()),
        }
    }

    /// Toast an HTTP failure by status. Statuses without documented wording
    /// (including 401) stay silent.
    pub fn http_error(&self, status: u16) {
        if let Some(message) = message_for_status(status) {
            self.show_throttled(format!("api-error-{status}"), ToastLevel::Error, message);
        }
    }

    /// Toast a network-level failure under one sticky id, at most once per
    /// throttle window.
    pub fn network_error(&self) {
        self.show_throttled(
            "network-error".to_string(),
            ToastLevel::Error,
            "Cannot reach the server. Check your connection.",
        );
    }

    fn show_throttled(&self, id: String, level: ToastLevel, message: &str) {
        let now = Instant::now();
        {
            let mut last_shown = self.last_shown.lock().unwrap();
            if let Some(last) = last_shown.get(&id) {
                if now.duration_since(*last) < self.throttle {
                    return;
                }
            }
            last_shown.insert(id.clone(), now);
        }
        self.sink.show(Toast {
            id,
            level,
            message: message.to_string(),
        });
    }
}
