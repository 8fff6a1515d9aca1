//! Routes inbound events to per-task and session-wide listeners.
//!
//! The registry is the only component that generates subscription frames:
//! the first subscriber for a task id puts a `subscribe` frame on the wire,
//! the last one leaving sends `unsubscribe`, and the full set of live task
//! ids is replayed through the connection manager after every reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::events::{Event, TaskId};
use crate::ws::connection::ConnectionManager;
use crate::ws::frames::ClientFrame;

pub type HandleId = u64;

type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct RegistryInner {
    keyed: HashMap<TaskId, Vec<(HandleId, EventHandler)>>,
    unkeyed: Vec<(HandleId, EventHandler)>,
}

pub struct SubscriptionRegistry {
    connection: Arc<ConnectionManager>,
    inner: Mutex<RegistryInner>,
    next_handle: AtomicU64,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("SubscriptionRegistry")
            .field("tasks", &inner.keyed.len())
            .field("unkeyed", &inner.unkeyed.len())
            .finish()
    }
}

impl SubscriptionRegistry {
    /// Build the registry and wire it into the connection manager as both
    /// event listener and resubscribe provider.
    pub fn new(connection: Arc<ConnectionManager>) -> Arc<Self> {
        let registry = Arc::new(Self {
            connection: connection.clone(),
            inner: Mutex::new(RegistryInner::default()),
            next_handle: AtomicU64::new(1),
        });

        let dispatch_target: Weak<Self> = Arc::downgrade(&registry);
        connection.on_event(move |event| {
            if let Some(registry) = dispatch_target.upgrade() {
                registry.dispatch(event);
            }
        });

        let replay_target: Weak<Self> = Arc::downgrade(&registry);
        connection.set_resubscribe_provider(move || {
            replay_target
                .upgrade()
                .map(|registry| registry.subscribe_frames())
                .unwrap_or_default()
        });

        registry
    }

    /// Register a per-task handler. The first handler for a task id sends a
    /// `subscribe` frame.
    pub fn subscribe<F>(&self, task_id: impl Into<TaskId>, handler: F) -> HandleId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let task_id = task_id.into();
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let first = {
            let mut inner = self.inner.lock().unwrap();
            let handlers = inner.keyed.entry(task_id.clone()).or_default();
            handlers.push((id, Arc::new(handler)));
            handlers.len() == 1
        };
        if first {
            debug!(task_id = %task_id, "first subscriber; sending subscribe frame");
            if let Err(e) = self.connection.send(&ClientFrame::Subscribe { task_id }) {
                warn!(error = %e, "failed to send subscribe frame");
            }
        }
        id
    }

    /// Remove a per-task handler. The last handler leaving a task id sends
    /// an `unsubscribe` frame.
    pub fn unsubscribe(&self, task_id: &str, handle: HandleId) {
        let emptied = {
            let mut inner = self.inner.lock().unwrap();
            match inner.keyed.get_mut(task_id) {
                Some(handlers) => {
                    handlers.retain(|(id, _)| *id != handle);
                    if handlers.is_empty() {
                        inner.keyed.remove(task_id);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if emptied {
            debug!(task_id, "last subscriber gone; sending unsubscribe frame");
            let frame = ClientFrame::Unsubscribe {
                task_id: task_id.to_string(),
            };
            if let Err(e) = self.connection.send(&frame) {
                warn!(error = %e, "failed to send unsubscribe frame");
            }
        }
    }

    /// Register a session-wide handler that sees every event.
    pub fn subscribe_unkeyed<F>(&self, handler: F) -> HandleId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.inner
            .lock()
            .unwrap()
            .unkeyed
            .push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe_unkeyed(&self, handle: HandleId) {
        self.inner
            .lock()
            .unwrap()
            .unkeyed
            .retain(|(id, _)| *id != handle);
    }

    /// Deliver one event synchronously: keyed handlers for its task id plus
    /// every unkeyed handler; events without a task id go to unkeyed only.
    pub fn dispatch(&self, event: &Event) {
        let handlers: Vec<EventHandler> = {
            let inner = self.inner.lock().unwrap();
            let keyed = event
                .task_id
                .as_deref()
                .and_then(|task_id| inner.keyed.get(task_id))
                .into_iter()
                .flatten();
            keyed
                .chain(inner.unkeyed.iter())
                .map(|(_, handler)| handler.clone())
                .collect()
        };
        for handler in handlers {
            handler(event);
        }
    }

    /// Subscribe frames for every live task id, for replay after reconnect.
    pub fn subscribe_frames(&self) -> Vec<ClientFrame> {
        self.inner
            .lock()
            .unwrap()
            .keyed
            .keys()
            .map(|task_id| ClientFrame::Subscribe {
                task_id: task_id.clone(),
            })
            .collect()
    }

    /// Task ids with at least one live handler.
    pub fn live_task_ids(&self) -> Vec<TaskId> {
        self.inner.lock().unwrap().keyed.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthContext;
    use crate::config::NexusConfig;
    use crate::events::EventKind;
    use chrono::Utc;
    use std::sync::atomic::AtomicU32;

    fn setup() -> (Arc<ConnectionManager>, Arc<SubscriptionRegistry>) {
        let connection = ConnectionManager::new(
            Arc::new(NexusConfig::default()),
            Arc::new(AuthContext::new()),
        );
        let registry = SubscriptionRegistry::new(connection.clone());
        (connection, registry)
    }

    fn event_for(task_id: Option<&str>) -> Event {
        Event {
            kind: EventKind::TaskStarted,
            timestamp: Utc::now(),
            server_ts_missing: false,
            task_id: task_id.map(str::to_string),
        }
    }

    fn counter_handler(counter: Arc<AtomicU32>) -> impl Fn(&Event) + Send + Sync {
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_keyed_event_reaches_exactly_matching_and_unkeyed() {
        let (_connection, registry) = setup();
        let t1_count = Arc::new(AtomicU32::new(0));
        let t2_count = Arc::new(AtomicU32::new(0));
        let unkeyed_count = Arc::new(AtomicU32::new(0));

        registry.subscribe("t-1", counter_handler(t1_count.clone()));
        registry.subscribe("t-2", counter_handler(t2_count.clone()));
        registry.subscribe_unkeyed(counter_handler(unkeyed_count.clone()));

        registry.dispatch(&event_for(Some("t-1")));

        assert_eq!(t1_count.load(Ordering::SeqCst), 1);
        assert_eq!(t2_count.load(Ordering::SeqCst), 0);
        assert_eq!(unkeyed_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unkeyed_event_skips_keyed_handlers() {
        let (_connection, registry) = setup();
        let keyed_count = Arc::new(AtomicU32::new(0));
        let unkeyed_count = Arc::new(AtomicU32::new(0));

        registry.subscribe("t-1", counter_handler(keyed_count.clone()));
        registry.subscribe_unkeyed(counter_handler(unkeyed_count.clone()));

        registry.dispatch(&event_for(None));

        assert_eq!(keyed_count.load(Ordering::SeqCst), 0);
        assert_eq!(unkeyed_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_first_subscribe_last_unsubscribe_emit_frames() {
        let (connection, registry) = setup();

        let first = registry.subscribe("t-1", |_| {});
        let second = registry.subscribe("t-1", |_| {});
        // Socket is down, so frames land in the queue. Only the first
        // subscriber generates one.
        assert_eq!(
            connection.queued_frames(),
            vec![r#"{"type":"subscribe","task_id":"t-1"}"#.to_string()]
        );

        registry.unsubscribe("t-1", first);
        assert_eq!(connection.queued_frames().len(), 1);
        registry.unsubscribe("t-1", second);
        assert_eq!(
            connection.queued_frames().last().map(String::as_str),
            Some(r#"{"type":"unsubscribe","task_id":"t-1"}"#)
        );
        assert!(registry.live_task_ids().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_frames_cover_live_tasks() {
        let (_connection, registry) = setup();
        registry.subscribe("t-1", |_| {});
        registry.subscribe("t-2", |_| {});
        registry.subscribe("t-2", |_| {});

        let mut frames = registry.subscribe_frames();
        frames.sort_by_key(|frame| frame.to_json());
        assert_eq!(
            frames,
            vec![
                ClientFrame::Subscribe {
                    task_id: "t-1".to_string()
                },
                ClientFrame::Subscribe {
                    task_id: "t-2".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_unsubscribed_handler_no_longer_invoked() {
        let (_connection, registry) = setup();
        let count = Arc::new(AtomicU32::new(0));
        let handle = registry.subscribe("t-1", counter_handler(count.clone()));

        registry.dispatch(&event_for(Some("t-1")));
        registry.unsubscribe("t-1", handle);
        registry.dispatch(&event_for(Some("t-1")));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
