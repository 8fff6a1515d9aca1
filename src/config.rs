use std::time::Duration;

/// Runtime configuration for the Nexus client core.
///
/// Every knob has a production default; `from_env` lets a host application
/// override the documented settings without rebuilding. Durations are carried
/// as `Duration` internally and configured in milliseconds.
#[derive(Debug, Clone)]
pub struct NexusConfig {
    /// HTTP base URL of the backend.
    pub api_base: String,
    /// WebSocket base URL. Derived from `api_base` when not set explicitly.
    pub ws_base: String,
    /// Interval between client ping frames.
    pub heartbeat: Duration,
    /// Close the socket when no inbound frame arrives within this window.
    pub heartbeat_timeout: Duration,
    /// Base delay for the exponential reconnect backoff.
    pub reconnect_base: Duration,
    /// Ceiling for the reconnect backoff.
    pub reconnect_cap: Duration,
    /// Attempts before the backoff stops doubling and stays at the cap.
    pub reconnect_max_attempts_before_cap: u32,
    /// An open connection must survive this long to reset the attempt counter.
    pub open_stable_window: Duration,
    /// Minimum spacing between network-error toasts.
    pub network_toast_throttle: Duration,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// Window within which task-state change notifications are coalesced.
    pub coalesce_window: Duration,
    /// Window within which a REST chat reply is deduplicated against a
    /// same-content WebSocket message.
    pub chat_dedup_window: Duration,
}

impl Default for NexusConfig {
    fn default() -> Self {
        let api_base = "http://localhost:8000".to_string();
        let ws_base = derive_ws_base(&api_base);
        Self {
            api_base,
            ws_base,
            heartbeat: Duration::from_millis(30_000),
            heartbeat_timeout: Duration::from_millis(60_000),
            reconnect_base: Duration::from_millis(500),
            reconnect_cap: Duration::from_millis(30_000),
            reconnect_max_attempts_before_cap: 8,
            open_stable_window: Duration::from_secs(5),
            network_toast_throttle: Duration::from_millis(5_000),
            request_timeout: Duration::from_secs(60),
            coalesce_window: Duration::from_millis(16),
            chat_dedup_window: Duration::from_secs(2),
        }
    }
}

impl NexusConfig {
    /// Build a config from environment variables, falling back to defaults.
    ///
    /// Recognized: `API_BASE`, `WS_BASE`, `HEARTBEAT_MS`,
    /// `HEARTBEAT_TIMEOUT_MS`, `RECONNECT_MAX_ATTEMPTS_BEFORE_CAP`,
    /// `RECONNECT_CAP_MS`, `NETWORK_TOAST_THROTTLE_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(api_base) = std::env::var("API_BASE") {
            config.api_base = api_base.trim_end_matches('/').to_string();
            config.ws_base = derive_ws_base(&config.api_base);
        }
        if let Ok(ws_base) = std::env::var("WS_BASE") {
            config.ws_base = ws_base.trim_end_matches('/').to_string();
        }
        if let Some(ms) = env_millis("HEARTBEAT_MS") {
            config.heartbeat = ms;
        }
        if let Some(ms) = env_millis("HEARTBEAT_TIMEOUT_MS") {
            config.heartbeat_timeout = ms;
        }
        if let Ok(val) = std::env::var("RECONNECT_MAX_ATTEMPTS_BEFORE_CAP") {
            if let Ok(attempts) = val.parse() {
                config.reconnect_max_attempts_before_cap = attempts;
            }
        }
        if let Some(ms) = env_millis("RECONNECT_CAP_MS") {
            config.reconnect_cap = ms;
        }
        if let Some(ms) = env_millis("NETWORK_TOAST_THROTTLE_MS") {
            config.network_toast_throttle = ms;
        }

        config
    }

    /// Full dial URL for the live socket, including the auth token.
    pub fn ws_url(&self, token: &str) -> String {
        format!("{}/ws?token={}", self.ws_base, token)
    }
}

/// Swap the URL scheme from HTTP to its WebSocket counterpart.
pub fn derive_ws_base(api_base: &str) -> String {
    let api_base = api_base.trim_end_matches('/');
    if let Some(rest) = api_base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = api_base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", api_base)
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .map(Duration::from_millis)
}
