//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::events::{self, EventSender};
use crate::permissions::PermissionBroker;
use crate::sessions::{SessionOptions, SessionRegistry};

#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Pane-keyed shell sessions.
    pub registry: SessionRegistry,
    /// Pending tool-permission requests.
    pub broker: PermissionBroker,
    /// UI event channel. Every WebSocket connection subscribes to it.
    pub events: EventSender,
}

impl AppState {
    /// Build the registry and broker around one shared event channel.
    pub fn new(config: Config) -> Self {
        let events = events::channel();
        let registry = SessionRegistry::new(SessionOptions::from(&config.sessions), events.clone());
        let broker = PermissionBroker::new(events.clone());
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            registry,
            broker,
            events,
        }
    }
}
