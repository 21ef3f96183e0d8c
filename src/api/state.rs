//! Application state for the delivery server

use crate::config::Config;
use crate::registry::ArtifactRegistry;
use crate::types::Event;
use std::sync::Arc;

/// Shared application state accessible to all route handlers
///
/// Cloned for each request (cheap Arc clones).
#[derive(Clone)]
pub struct AppState {
    /// The artifact registry downloads are served from
    pub registry: Arc<ArtifactRegistry>,

    /// Configuration (read-only at this point)
    pub config: Arc<Config>,

    /// Event channel handle; each `/events` connection subscribes here
    pub event_tx: tokio::sync::broadcast::Sender<Event>,
}

impl AppState {
    /// Create a new AppState
    pub fn new(
        registry: Arc<ArtifactRegistry>,
        config: Arc<Config>,
        event_tx: tokio::sync::broadcast::Sender<Event>,
    ) -> Self {
        Self {
            registry,
            config,
            event_tx,
        }
    }
}
