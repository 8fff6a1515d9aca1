//! Owner of the single live WebSocket.
//!
//! One `ConnectionManager` exists per session. It dials
//! `${WS_BASE}/ws?token=...`, keeps the socket alive with ping frames,
//! reconnects with exponential backoff on any non-graceful close, fans parsed
//! events out to registered listeners, and queues outbound frames while the
//! socket is down. Server close code 4401 (invalid token) is the one
//! non-reconnectable close: it surfaces `AuthExpired` through the auth
//! context and parks the connection in `Closed`.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval, sleep_until};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::auth::AuthContext;
use crate::config::NexusConfig;
use crate::errors::{ConnectionError, MAX_FRAME_BYTES};
use crate::events::Event;
use crate::ws::frames::ClientFrame;

/// Close code the server uses to reject an invalid token.
const CLOSE_AUTH_REJECTED: u16 = 4401;

/// Lifecycle of the managed socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Reconnecting,
}

/// Observable connection status, published through a watch channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Consecutive failed attempts since the last stable open.
    pub attempt: u32,
    /// When the next reconnect attempt fires, while `Reconnecting`.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl ConnectionStatus {
    fn idle() -> Self {
        Self {
            state: ConnectionState::Idle,
            attempt: 0,
            next_attempt_at: None,
        }
    }
}

/// Monotonic connection counters.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    events_received: AtomicU64,
    parse_errors: AtomicU64,
    reconnects: AtomicU64,
    listener_panics: AtomicU64,
}

/// Point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub events_received: u64,
    pub parse_errors: u64,
    pub reconnects: u64,
    pub listener_panics: u64,
}

impl ConnectionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            listener_panics: self.listener_panics.load(Ordering::Relaxed),
        }
    }
}

pub type ListenerId = u64;

type Listener = (ListenerId, Arc<dyn Fn(&Event) + Send + Sync>);
type ResubscribeProvider = Arc<dyn Fn() -> Vec<ClientFrame> + Send + Sync>;

/// How a live socket ended, from the driver's point of view.
enum SocketEnd {
    /// User-initiated close; no reconnect.
    UserClose,
    /// Server close 4401 or HTTP 401 on dial; no reconnect.
    AuthRejected,
    /// Everything else; the reconnect loop takes over.
    Lost,
}

pub struct ConnectionManager {
    config: Arc<NexusConfig>,
    auth: Arc<AuthContext>,
    status_tx: watch::Sender<ConnectionStatus>,
    listeners: Mutex<Vec<Listener>>,
    next_listener_id: AtomicU64,
    /// Frames queued while the socket is not open; flushed on open.
    pending: Mutex<VecDeque<String>>,
    stats: ConnectionStats,
    /// Supplied by the subscription registry; replayed on every open.
    resubscribe: Mutex<Option<ResubscribeProvider>>,
    /// Sender into the live socket task; present only while open.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Notify,
    user_closed: AtomicBool,
    /// Handle to ourselves for spawning the dial loop.
    weak_self: Weak<ConnectionManager>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("status", &*self.status_tx.borrow())
            .field("stats", &self.stats)
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(config: Arc<NexusConfig>, auth: Arc<AuthContext>) -> Arc<Self> {
        let (status_tx, _status_rx) = watch::channel(ConnectionStatus::idle());
        Arc::new_cyclic(|weak_self| Self {
            config,
            auth,
            status_tx,
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            pending: Mutex::new(VecDeque::new()),
            stats: ConnectionStats::default(),
            resubscribe: Mutex::new(None),
            outbound: Mutex::new(None),
            task: Mutex::new(None),
            shutdown: Notify::new(),
            user_closed: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    /// Dial the backend if not already connected or connecting. Idempotent.
    ///
    /// Fails fast with `AuthMissing` on an empty token; all later failures
    /// are absorbed by the reconnect loop (except auth rejection, which is
    /// surfaced through the auth context).
    pub fn ensure_open(&self, token: &str) -> Result<(), ConnectionError> {
        if token.is_empty() {
            return Err(ConnectionError::AuthMissing);
        }

        let mut task = self.task.lock().unwrap();
        let state = self.status_tx.borrow().state;
        let running = task.as_ref().is_some_and(|handle| !handle.is_finished());
        if running {
            match state {
                ConnectionState::Connecting
                | ConnectionState::Open
                | ConnectionState::Reconnecting => return Ok(()),
                // A user close is still unwinding; abandon it and redial.
                ConnectionState::Closing => {
                    if let Some(handle) = task.take() {
                        handle.abort();
                    }
                    *self.outbound.lock().unwrap() = None;
                }
                ConnectionState::Idle | ConnectionState::Closed => {}
            }
        }

        let Some(manager) = self.weak_self.upgrade() else {
            return Ok(());
        };
        self.user_closed.store(false, Ordering::SeqCst);
        let token = token.to_string();
        *task = Some(tokio::spawn(async move {
            manager.run(token).await;
        }));
        Ok(())
    }

    /// Queue or send one frame. Frames over 64 KiB are rejected before any
    /// I/O is attempted.
    pub fn send(&self, frame: &ClientFrame) -> Result<(), ConnectionError> {
        let json = frame.to_json();
        if json.len() > MAX_FRAME_BYTES {
            return Err(ConnectionError::FrameTooLarge {
                size: json.len(),
                limit: MAX_FRAME_BYTES,
            });
        }
        if self.user_closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }

        let delivered = {
            let outbound = self.outbound.lock().unwrap();
            match outbound.as_ref() {
                Some(tx) => tx.send(json.clone()).is_ok(),
                None => false,
            }
        };
        if !delivered {
            self.pending.lock().unwrap().push_back(json);
        }
        Ok(())
    }

    /// Graceful user shutdown: purge the queue, cancel reconnect timers,
    /// close the socket. Final until `ensure_open` is called again.
    pub fn close(&self, reason: &str) {
        info!(reason, "closing live socket");
        self.user_closed.store(true, Ordering::SeqCst);
        self.pending.lock().unwrap().clear();

        let running = self
            .task
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        if running {
            self.set_status(ConnectionState::Closing, 0, None);
            self.shutdown.notify_one();
        } else {
            self.set_status(ConnectionState::Closed, 0, None);
        }
    }

    /// Register an event listener. Listeners run synchronously on the socket
    /// task; a panicking listener is caught, logged, and counted.
    pub fn on_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().unwrap().push((id, Arc::new(listener)));
        id
    }

    pub fn off_event(&self, id: ListenerId) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|(listener_id, _)| *listener_id != id);
    }

    /// Install the provider whose frames are replayed on every open, ahead
    /// of the queued backlog.
    pub fn set_resubscribe_provider<F>(&self, provider: F)
    where
        F: Fn() -> Vec<ClientFrame> + Send + Sync + 'static,
    {
        *self.resubscribe.lock().unwrap() = Some(Arc::new(provider));
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status_tx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    // ── Internal: dial/reconnect loop ───────────────────────────────────

    async fn run(self: Arc<Self>, token: String) {
        let mut attempt: u32 = 0;

        loop {
            if self.user_closed.load(Ordering::SeqCst) {
                self.set_status(ConnectionState::Closed, attempt, None);
                return;
            }

            self.set_status(ConnectionState::Connecting, attempt, None);
            let url = self.config.ws_url(&token);

            match connect_async(url.as_str()).await {
                Ok((stream, _response)) => {
                    let opened_at = Instant::now();
                    if attempt > 0 {
                        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    }
                    info!(attempt, "live socket open");
                    self.set_status(ConnectionState::Open, attempt, None);

                    let (tx, rx) = mpsc::unbounded_channel();
                    self.replay_subscriptions(&tx);
                    self.flush_pending(&tx);
                    *self.outbound.lock().unwrap() = Some(tx);

                    self.fan_out(&Event::connection_open());

                    let end = self.drive_socket(stream, rx).await;
                    *self.outbound.lock().unwrap() = None;

                    match end {
                        SocketEnd::UserClose => {
                            info!("live socket closed by user");
                            self.set_status(ConnectionState::Closed, 0, None);
                            return;
                        }
                        SocketEnd::AuthRejected => {
                            self.set_status(ConnectionState::Closed, attempt, None);
                            self.auth.notify_expired();
                            return;
                        }
                        SocketEnd::Lost => {
                            if opened_at.elapsed() >= self.config.open_stable_window {
                                attempt = 0;
                            }
                            attempt += 1;
                        }
                    }
                }
                Err(tungstenite::Error::Http(response))
                    if response.status().as_u16() == 401 =>
                {
                    warn!("dial rejected with 401");
                    self.set_status(ConnectionState::Closed, attempt, None);
                    self.auth.notify_expired();
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    warn!(attempt, error = %e, "live socket dial failed");
                }
            }

            let delay = backoff_delay(attempt, &self.config);
            let next_attempt_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            self.set_status(ConnectionState::Reconnecting, attempt, Some(next_attempt_at));

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.notified() => {}
            }
        }
    }

    /// Pump one live socket until it ends. Any inbound frame counts as
    /// liveness for the heartbeat timeout.
    async fn drive_socket(
        &self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        mut outbound_rx: mpsc::UnboundedReceiver<String>,
    ) -> SocketEnd {
        let (mut sink, mut source) = stream.split();
        let mut ping = interval(self.config.heartbeat);
        // The first tick completes immediately; consume it so the first real
        // ping fires after one full interval.
        ping.tick().await;
        let mut idle_deadline = Instant::now() + self.config.heartbeat_timeout;

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    if sink
                        .send(Message::Text(ClientFrame::Ping.to_json()))
                        .await
                        .is_err()
                    {
                        return SocketEnd::Lost;
                    }
                }

                _ = sleep_until(idle_deadline) => {
                    warn!(
                        timeout_ms = self.config.heartbeat_timeout.as_millis() as u64,
                        "heartbeat timeout; closing socket"
                    );
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "heartbeat_timeout".into(),
                        })))
                        .await;
                    return SocketEnd::Lost;
                }

                frame = outbound_rx.recv() => {
                    match frame {
                        Some(json) => {
                            if sink.send(Message::Text(json)).await.is_err() {
                                return SocketEnd::Lost;
                            }
                        }
                        None => return SocketEnd::Lost,
                    }
                }

                msg = source.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            idle_deadline = Instant::now() + self.config.heartbeat_timeout;
                            self.handle_text(&text);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            idle_deadline = Instant::now() + self.config.heartbeat_timeout;
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            if let Some(frame) = &frame {
                                if u16::from(frame.code) == CLOSE_AUTH_REJECTED {
                                    warn!("server rejected token (4401)");
                                    return SocketEnd::AuthRejected;
                                }
                            }
                            debug!(?frame, "server closed socket");
                            return SocketEnd::Lost;
                        }
                        Some(Ok(_)) => {
                            idle_deadline = Instant::now() + self.config.heartbeat_timeout;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "socket error");
                            return SocketEnd::Lost;
                        }
                        None => return SocketEnd::Lost,
                    }
                }

                _ = self.shutdown.notified() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SocketEnd::UserClose;
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match Event::parse(text) {
            Ok(event) => {
                self.stats.events_received.fetch_add(1, Ordering::Relaxed);
                self.fan_out(&event);
            }
            Err(e) => {
                // Parse failures are counted, never fatal.
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "dropping unparseable frame");
            }
        }
    }

    fn fan_out(&self, event: &Event) {
        let listeners: Vec<Listener> = self.listeners.lock().unwrap().clone();
        for (id, listener) in listeners {
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| listener(event)));
            if outcome.is_err() {
                self.stats.listener_panics.fetch_add(1, Ordering::Relaxed);
                warn!(listener = id, "event listener panicked");
            }
        }
    }

    fn replay_subscriptions(&self, tx: &mpsc::UnboundedSender<String>) {
        let provider = self.resubscribe.lock().unwrap().clone();
        if let Some(provider) = provider {
            let pending = self.pending.lock().unwrap();
            for frame in provider() {
                let json = frame.to_json();
                // A subscribe issued before the first open is already queued;
                // replaying it too would double-subscribe.
                if pending.contains(&json) {
                    continue;
                }
                let _ = tx.send(json);
            }
        }
    }

    fn flush_pending(&self, tx: &mpsc::UnboundedSender<String>) {
        let mut pending = self.pending.lock().unwrap();
        for json in pending.drain(..) {
            let _ = tx.send(json);
        }
    }

    #[cfg(test)]
    pub(crate) fn queued_frames(&self) -> Vec<String> {
        self.pending.lock().unwrap().iter().cloned().collect()
    }

    fn set_status(
        &self,
        state: ConnectionState,
        attempt: u32,
        next_attempt_at: Option<DateTime<Utc>>,
    ) {
        self.status_tx.send_replace(ConnectionStatus {
            state,
            attempt,
            next_attempt_at,
        });
    }
}

/// Exponential backoff with ±20% jitter: `min(cap, base * 2^attempt)`,
/// capped after `reconnect_max_attempts_before_cap` attempts.
pub(crate) fn backoff_delay(attempt: u32, config: &NexusConfig) -> Duration {
    let exponent = attempt.min(config.reconnect_max_attempts_before_cap).min(31);
    let base_ms = config.reconnect_base.as_millis() as u64;
    let cap_ms = config.reconnect_cap.as_millis() as u64;
    let raw_ms = base_ms.saturating_mul(1u64 << exponent).min(cap_ms);
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((raw_ms as f64 * factor) as u64)
}
