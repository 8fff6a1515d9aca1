//! Live per-task state surface for UI collaborators.
//!
//! The store creates a `TaskState` when the first watcher arrives for a task
//! id, feeds it from the subscription registry, and tears it down when the
//! last watcher is dropped. Change notifications are coalesced within one
//! animation frame so a burst of events produces a single repaint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::config::NexusConfig;
use crate::events::{AgentStatus, Event, TaskId, TaskState, TaskTerminal};
use crate::ws::registry::{HandleId, SubscriptionRegistry};

type WatcherFn = Arc<dyn Fn(&TaskState) + Send + Sync>;

/// Convenience projection of a task for rendering.
#[derive(Debug, Clone)]
pub struct TaskView {
    /// Agents sorted by name.
    pub agents: Vec<(String, AgentStatus)>,
    pub timeline: Vec<Event>,
    pub terminal: Option<TaskTerminal>,
}

struct TaskEntry {
    state: Mutex<TaskState>,
    watchers: Mutex<Vec<(u64, WatcherFn)>>,
    flush_scheduled: AtomicBool,
    coalesce_window: Duration,
}

/// Reduce one event into an entry's state and schedule a coalesced flush.
/// The reduce itself is synchronous; only the notification defers.
fn ingest(entry: &Arc<TaskEntry>, event: &Event) {
    entry.state.lock().unwrap().apply(event.clone());
    schedule_flush(entry);
}

fn schedule_flush(entry: &Arc<TaskEntry>) {
    if entry.flush_scheduled.swap(true, Ordering::SeqCst) {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let entry = entry.clone();
            handle.spawn(async move {
                tokio::time::sleep(entry.coalesce_window).await;
                entry.flush();
            });
        }
        // Without a runtime there is nothing to defer onto.
        Err(_) => entry.flush(),
    }
}

impl TaskEntry {
    fn flush(&self) {
        self.flush_scheduled.store(false, Ordering::SeqCst);
        let snapshot = self.state.lock().unwrap().clone();
        let watchers: Vec<WatcherFn> = self
            .watchers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, watcher)| watcher.clone())
            .collect();
        for watcher in watchers {
            watcher(&snapshot);
        }
    }
}

struct TrackedTask {
    entry: Arc<TaskEntry>,
    registry_handle: HandleId,
}

pub struct LiveTaskStore {
    registry: Arc<SubscriptionRegistry>,
    config: Arc<NexusConfig>,
    tasks: Mutex<HashMap<TaskId, TrackedTask>>,
    next_watcher_id: AtomicU64,
    /// Handed to watch guards so dropping one can unwatch.
    weak_self: Weak<LiveTaskStore>,
}

impl std::fmt::Debug for LiveTaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveTaskStore")
            .field("tasks", &self.tasks.lock().unwrap().len())
            .finish()
    }
}

impl LiveTaskStore {
    pub fn new(registry: Arc<SubscriptionRegistry>, config: Arc<NexusConfig>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            registry,
            config,
            tasks: Mutex::new(HashMap::new()),
            next_watcher_id: AtomicU64::new(1),
            weak_self: weak_self.clone(),
        })
    }

    /// Watch a task. The first watcher for an id creates its state and
    /// subscribes on the wire; dropping the returned guard reverses both
    /// when it was the last.
    pub fn watch<F>(&self, task_id: impl Into<TaskId>, on_change: F) -> TaskWatch
    where
        F: Fn(&TaskState) + Send + Sync + 'static,
    {
        let task_id = task_id.into();
        let watcher_id = self.next_watcher_id.fetch_add(1, Ordering::SeqCst);

        let mut tasks = self.tasks.lock().unwrap();
        let tracked = tasks.entry(task_id.clone()).or_insert_with(|| {
            let entry = Arc::new(TaskEntry {
                state: Mutex::new(TaskState::new(task_id.clone())),
                watchers: Mutex::new(Vec::new()),
                flush_scheduled: AtomicBool::new(false),
                coalesce_window: self.config.coalesce_window,
            });
            let sink = entry.clone();
            let registry_handle = self
                .registry
                .subscribe(task_id.clone(), move |event| ingest(&sink, event));
            TrackedTask {
                entry,
                registry_handle,
            }
        });
        tracked
            .entry
            .watchers
            .lock()
            .unwrap()
            .push((watcher_id, Arc::new(on_change)));

        TaskWatch {
            store: self.weak_self.clone(),
            task_id,
            watcher_id,
        }
    }

    /// Snapshot of the current state for a watched task.
    pub fn get(&self, task_id: &str) -> Option<TaskState> {
        self.tasks
            .lock()
            .unwrap()
            .get(task_id)
            .map(|tracked| tracked.entry.state.lock().unwrap().clone())
    }

    /// Rendering projection: agents sorted by name, full timeline, terminal.
    pub fn derive(&self, task_id: &str) -> Option<TaskView> {
        self.get(task_id).map(|state| TaskView {
            agents: state
                .agents
                .iter()
                .map(|(name, status)| (name.clone(), status.clone()))
                .collect(),
            timeline: state.timeline,
            terminal: state.terminal,
        })
    }

    fn unwatch(&self, task_id: &str, watcher_id: u64) {
        let mut tasks = self.tasks.lock().unwrap();
        let Some(tracked) = tasks.get(task_id) else {
            return;
        };
        let emptied = {
            let mut watchers = tracked.entry.watchers.lock().unwrap();
            watchers.retain(|(id, _)| *id != watcher_id);
            watchers.is_empty()
        };
        if emptied {
            if let Some(tracked) = tasks.remove(task_id) {
                self.registry.unsubscribe(task_id, tracked.registry_handle);
            }
        }
    }
}

/// Guard for one watcher; dropping it unwatches.
pub struct TaskWatch {
    store: Weak<LiveTaskStore>,
    task_id: TaskId,
    watcher_id: u64,
}

impl TaskWatch {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

impl Drop for TaskWatch {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.unwatch(&self.task_id, self.watcher_id);
        }
    }
}
