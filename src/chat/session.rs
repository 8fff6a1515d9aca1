//! Direct chat with one named agent.
//!
//! Replies arrive over two paths: the synchronous HTTP response and
//! asynchronous `agent_message` pushes on the live socket. The session
//! merges both into one ordered log, suppressing the REST copy when the
//! socket already delivered the same content within the dedup window. The
//! session lifetime is per-open: `close` (or drop) unregisters the socket
//! handler, and a reply that lands after close is dropped silently.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::api::client::{ApiClient, ChatTurn};
use crate::config::NexusConfig;
use crate::errors::{ApiError, ApiErrorKind};
use crate::events::EventKind;
use crate::ws::registry::{HandleId, SubscriptionRegistry};

const APOLOGY: &str = "Sorry, I ran into a problem answering that. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Agent,
    System,
}

/// Which path produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatOrigin {
    Local,
    Rest,
    Ws,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub origin: ChatOrigin,
    pub dedup_key: String,
}

/// Resolution of one outstanding `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOutcome {
    Awaiting,
    ResolvedByRest,
    ResolvedByWs,
    TimedOut,
}

#[derive(Debug, Default)]
struct ChatInner {
    messages: Vec<ChatMessage>,
    /// State of the most recent send. `Awaiting` means a send is in flight.
    pending: Option<SendOutcome>,
    /// Dedup keys of recent WS-origin agent messages, pruned by timestamp.
    recent_ws_keys: VecDeque<(String, DateTime<Utc>)>,
    open: bool,
}

pub struct ChatSession {
    agent_name: String,
    api: Arc<ApiClient>,
    registry: Arc<SubscriptionRegistry>,
    inner: Arc<Mutex<ChatInner>>,
    ws_handle: Mutex<Option<HandleId>>,
    dedup_window: Duration,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("agent_name", &self.agent_name)
            .field("open", &self.inner.lock().unwrap().open)
            .finish()
    }
}

impl ChatSession {
    pub fn new(
        agent_name: impl Into<String>,
        api: Arc<ApiClient>,
        registry: Arc<SubscriptionRegistry>,
        config: &NexusConfig,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            api,
            registry,
            inner: Arc::new(Mutex::new(ChatInner::default())),
            ws_handle: Mutex::new(None),
            dedup_window: config.chat_dedup_window,
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// Open (or reopen) the session: clear history, seed the greeting, and
    /// start listening for this agent's socket messages.
    pub fn open(&self) {
        let greeting = format!("Hi! I'm {}. How can I help you today?", self.agent_name);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.messages.clear();
            inner.recent_ws_keys.clear();
            inner.pending = None;
            inner.open = true;
            let now = Utc::now();
            let key = dedup_key(&self.agent_name, &greeting, now, self.dedup_window);
            inner.messages.push(ChatMessage {
                role: ChatRole::System,
                content: greeting,
                timestamp: now,
                origin: ChatOrigin::Local,
                dedup_key: key,
            });
        }

        let mut handle = self.ws_handle.lock().unwrap();
        if handle.is_none() {
            let inner = self.inner.clone();
            let agent = self.agent_name.clone();
            let window = self.dedup_window;
            *handle = Some(self.registry.subscribe_unkeyed(move |event| {
                if let EventKind::AgentMessage {
                    agent_name,
                    content,
                } = &event.kind
                {
                    if agent_name == &agent {
                        ingest_ws_message(&inner, &agent, content, event.timestamp, window);
                    }
                }
            }));
        }
    }

    /// Close the session. Replies still in flight are dropped on arrival.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.open = false;
            inner.pending = None;
        }
        if let Some(handle) = self.ws_handle.lock().unwrap().take() {
            self.registry.unsubscribe_unkeyed(handle);
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().open
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(
            self.inner.lock().unwrap().pending,
            Some(SendOutcome::Awaiting)
        )
    }

    /// Snapshot of the ordered message log.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.inner.lock().unwrap().messages.clone()
    }

    /// Send one user message and wait for the HTTP reply. The local user
    /// message is appended before any I/O, so it always precedes the reply.
    pub async fn send(&self, text: &str) -> Result<(), ApiError> {
        let history = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.open {
                return Err(ApiError::canceled());
            }
            // History sent to the backend is everything before this turn,
            // minus system entries.
            let history: Vec<ChatTurn> = inner
                .messages
                .iter()
                .filter(|message| message.role != ChatRole::System)
                .map(|message| ChatTurn {
                    role: match message.role {
                        ChatRole::User => "user".to_string(),
                        _ => "agent".to_string(),
                    },
                    content: message.content.clone(),
                })
                .collect();

            let now = Utc::now();
            let key = dedup_key(&self.agent_name, text, now, self.dedup_window);
            inner.messages.push(ChatMessage {
                role: ChatRole::User,
                content: text.to_string(),
                timestamp: now,
                origin: ChatOrigin::Local,
                dedup_key: key,
            });
            inner.pending = Some(SendOutcome::Awaiting);
            history
        };

        match self.api.agent_chat(&self.agent_name, text, &history).await {
            Ok(reply) => {
                self.accept_rest_reply(&reply.response);
                Ok(())
            }
            Err(error) if error.kind == ApiErrorKind::Canceled => {
                self.inner.lock().unwrap().pending = None;
                Ok(())
            }
            Err(error) => {
                let mut inner = self.inner.lock().unwrap();
                let outcome = if error.kind == ApiErrorKind::Network {
                    SendOutcome::TimedOut
                } else {
                    SendOutcome::ResolvedByRest
                };
                debug!(agent = %self.agent_name, ?outcome, "chat send failed");
                if inner.open {
                    let now = Utc::now();
                    let key = dedup_key(&self.agent_name, APOLOGY, now, self.dedup_window);
                    inner.messages.push(ChatMessage {
                        role: ChatRole::Agent,
                        content: APOLOGY.to_string(),
                        timestamp: now,
                        origin: ChatOrigin::Rest,
                        dedup_key: key,
                    });
                }
                if inner.pending == Some(SendOutcome::Awaiting) {
                    inner.pending = Some(outcome);
                }
                Err(error)
            }
        }
    }

    /// Fold the HTTP reply into the log unless the socket already delivered
    /// the same content within the dedup window.
    fn accept_rest_reply(&self, content: &str) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            // The user closed the surface; nobody is reading this.
            debug!(agent = %self.agent_name, "dropping reply for closed session");
            return;
        }

        let now = Utc::now();
        prune_keys(&mut inner.recent_ws_keys, now, self.dedup_window);
        let duplicate = candidate_keys(&self.agent_name, content, now, self.dedup_window)
            .iter()
            .any(|key| inner.recent_ws_keys.iter().any(|(seen, _)| seen == key));

        if inner.pending == Some(SendOutcome::Awaiting) {
            inner.pending = Some(SendOutcome::ResolvedByRest);
        }

        if duplicate {
            debug!(agent = %self.agent_name, "suppressing duplicate REST reply");
            return;
        }
        let key = dedup_key(&self.agent_name, content, now, self.dedup_window);
        inner.messages.push(ChatMessage {
            role: ChatRole::Agent,
            content: content.to_string(),
            timestamp: now,
            origin: ChatOrigin::Rest,
            dedup_key: key,
        });
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Append a socket-delivered agent message, recording its dedup key and
/// resolving an outstanding send.
///
/// Dedup bookkeeping is keyed by local receipt time: the window is about
/// when the two copies reached this client, not the server's clock.
fn ingest_ws_message(
    inner: &Mutex<ChatInner>,
    agent: &str,
    content: &str,
    server_ts: DateTime<Utc>,
    window: Duration,
) {
    let mut inner = inner.lock().unwrap();
    if !inner.open {
        return;
    }
    let received_at = Utc::now();
    let key = dedup_key(agent, content, received_at, window);
    prune_keys(&mut inner.recent_ws_keys, received_at, window);
    inner.recent_ws_keys.push_back((key.clone(), received_at));
    inner.messages.push(ChatMessage {
        role: ChatRole::Agent,
        content: content.to_string(),
        timestamp: server_ts,
        origin: ChatOrigin::Ws,
        dedup_key: key,
    });
    if inner.pending == Some(SendOutcome::Awaiting) {
        inner.pending = Some(SendOutcome::ResolvedByWs);
    }
}

/// Content-hash key bucketed by the dedup window:
/// `sha256(agent|content|floor(ts / window))`, hex-encoded.
fn dedup_key(agent: &str, content: &str, timestamp: DateTime<Utc>, window: Duration) -> String {
    let bucket = timestamp.timestamp() / window.as_secs().max(1) as i64;
    let mut hasher = Sha256::new();
    hasher.update(agent.as_bytes());
    hasher.update(b"|");
    hasher.update(content.as_bytes());
    hasher.update(b"|");
    hasher.update(bucket.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// Keys for the current and previous bucket, so a pair straddling a bucket
/// boundary still matches.
fn candidate_keys(
    agent: &str,
    content: &str,
    timestamp: DateTime<Utc>,
    window: Duration,
) -> [String; 2] {
    let previous = timestamp
        - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
    [
        dedup_key(agent, content, timestamp, window),
        dedup_key(agent, content, previous, window),
    ]
}

fn prune_keys(
    keys: &mut VecDeque<(String, DateTime<Utc>)>,
    now: DateTime<Utc>,
    window: Duration,
) {
    let horizon =
        now - chrono::Duration::from_std(window * 4).unwrap_or_else(|_| chrono::Duration::zero());
    while keys
        .front()
        .is_some_and(|(_, timestamp)| *timestamp < horizon)
    {
        keys.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::toast::{NoopToasts, Toaster};
    use crate::auth::AuthContext;
    use crate::events::Event;
    use crate::ws::connection::ConnectionManager;

    fn session() -> ChatSession {
        let config = Arc::new(NexusConfig::default());
        let auth = Arc::new(AuthContext::new());
        let toaster = Arc::new(Toaster::new(Arc::new(NoopToasts), &config));
        let api = Arc::new(ApiClient::new(&config, auth.clone(), toaster));
        let connection = ConnectionManager::new(config.clone(), auth);
        let registry = SubscriptionRegistry::new(connection);
        ChatSession::new("ResearchAgent", api, registry, &config)
    }

    fn agent_message(agent: &str, content: &str) -> Event {
        Event {
            kind: EventKind::AgentMessage {
                agent_name: agent.to_string(),
                content: content.to_string(),
            },
            timestamp: Utc::now(),
            server_ts_missing: false,
            task_id: None,
        }
    }

    #[tokio::test]
    async fn test_open_seeds_single_greeting() {
        let session = session();
        session.open();
        let messages = session.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, ChatRole::System);
        assert!(messages[0].content.contains("ResearchAgent"));

        // Reopen clears and reseeds.
        session.open();
        assert_eq!(session.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_ws_message_for_matching_agent_is_appended() {
        let session = session();
        session.open();
        session.registry.dispatch(&agent_message("ResearchAgent", "hello"));
        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, ChatRole::Agent);
        assert_eq!(messages[1].origin, ChatOrigin::Ws);
        assert_eq!(messages[1].content, "hello");
    }

    #[tokio::test]
    async fn test_ws_message_for_other_agent_is_ignored() {
        let session = session();
        session.open();
        session.registry.dispatch(&agent_message("CodeAgent", "hello"));
        assert_eq!(session.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_rest_reply_deduplicated_against_ws() {
        let session = session();
        session.open();
        // Socket delivers the reply first; the HTTP copy must be dropped.
        session.registry.dispatch(&agent_message("ResearchAgent", "hello"));
        session.accept_rest_reply("hello");

        let agent_replies: Vec<_> = session
            .messages()
            .into_iter()
            .filter(|message| message.role == ChatRole::Agent)
            .collect();
        assert_eq!(agent_replies.len(), 1);
        assert_eq!(agent_replies[0].origin, ChatOrigin::Ws);
        assert!(!session.is_in_flight());
    }

    #[tokio::test]
    async fn test_rest_reply_with_different_content_is_kept() {
        let session = session();
        session.open();
        session.registry.dispatch(&agent_message("ResearchAgent", "hello"));
        session.accept_rest_reply("a different answer");

        let agent_replies: Vec<_> = session
            .messages()
            .into_iter()
            .filter(|message| message.role == ChatRole::Agent)
            .collect();
        assert_eq!(agent_replies.len(), 2);
    }

    #[tokio::test]
    async fn test_reply_after_close_is_dropped() {
        let session = session();
        session.open();
        session.close();
        session.accept_rest_reply("too late");
        assert!(session.messages().is_empty());
    }

    #[tokio::test]
    async fn test_closed_session_ignores_ws_messages() {
        let session = session();
        session.open();
        session.close();
        session.registry.dispatch(&agent_message("ResearchAgent", "hello"));
        assert!(session.messages().is_empty());
    }

    #[test]
    fn test_dedup_key_same_bucket_matches() {
        let window = Duration::from_secs(2);
        let ts = Utc::now();
        assert_eq!(
            dedup_key("A", "hello", ts, window),
            dedup_key("A", "hello", ts, window)
        );
        assert_ne!(
            dedup_key("A", "hello", ts, window),
            dedup_key("B", "hello", ts, window)
        );
        assert_ne!(
            dedup_key("A", "hello", ts, window),
            dedup_key("A", "goodbye", ts, window)
        );
    }

    #[test]
    fn test_candidate_keys_cover_bucket_boundary() {
        use chrono::TimeZone;
        let window = Duration::from_secs(2);
        // ws at 9.9s (bucket 4), rest at 10.1s (bucket 5): the previous
        // bucket candidate bridges the boundary.
        let ws_ts = Utc.timestamp_opt(9, 900_000_000).unwrap();
        let rest_ts = Utc.timestamp_opt(10, 100_000_000).unwrap();
        let ws_key = dedup_key("A", "hello", ws_ts, window);
        let candidates = candidate_keys("A", "hello", rest_ts, window);
        assert!(candidates.contains(&ws_key));
    }
}
