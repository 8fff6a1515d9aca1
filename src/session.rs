//! Explicit service wiring for one client session.
//!
//! Every stateful service is constructed here and shared by `Arc`; nothing
//! in the crate lives in module-level mutable state. A host builds one
//! `NexusSession` per authenticated user session and hands the pieces to
//! its views.

use std::sync::Arc;

use crate::api::client::ApiClient;
use crate::api::toast::{ToastSink, Toaster};
use crate::auth::AuthContext;
use crate::chat::session::ChatSession;
use crate::config::NexusConfig;
use crate::errors::ConnectionError;
use crate::tasks::store::LiveTaskStore;
use crate::ws::connection::ConnectionManager;
use crate::ws::registry::SubscriptionRegistry;

pub struct NexusSession {
    pub config: Arc<NexusConfig>,
    pub auth: Arc<AuthContext>,
    pub connection: Arc<ConnectionManager>,
    pub registry: Arc<SubscriptionRegistry>,
    pub tasks: Arc<LiveTaskStore>,
    pub api: Arc<ApiClient>,
    pub toasts: Arc<Toaster>,
}

impl std::fmt::Debug for NexusSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NexusSession")
            .field("config", &self.config)
            .field("connection", &self.connection)
            .finish()
    }
}

impl NexusSession {
    pub fn new(config: NexusConfig, auth: Arc<AuthContext>, toast_sink: Arc<dyn ToastSink>) -> Self {
        let config = Arc::new(config);
        let toasts = Arc::new(Toaster::new(toast_sink, &config));
        let api = Arc::new(ApiClient::new(&config, auth.clone(), toasts.clone()));
        let connection = ConnectionManager::new(config.clone(), auth.clone());
        let registry = SubscriptionRegistry::new(connection.clone());
        let tasks = LiveTaskStore::new(registry.clone(), config.clone());

        Self {
            config,
            auth,
            connection,
            registry,
            tasks,
            api,
            toasts,
        }
    }

    /// Bring the live socket up with the current token. Idempotent.
    pub fn connect(&self) -> Result<(), ConnectionError> {
        let token = self.auth.token()?;
        self.connection.ensure_open(&token)
    }

    /// Tear the live socket down; subscriptions stay registered and replay
    /// if `connect` is called again.
    pub fn disconnect(&self) {
        self.connection.close("user");
    }

    /// Open a chat surface bound to one agent.
    pub fn chat(&self, agent_name: impl Into<String>) -> ChatSession {
        let session = ChatSession::new(
            agent_name,
            self.api.clone(),
            self.registry.clone(),
            &self.config,
        );
        session.open();
        session
    }
}
