//! Application state.

use keel_config::ServerConfig;
use keel_core::BuildStore;
use keel_scheduler::Scheduler;
use std::sync::Arc;

use crate::ingest::WebhookIngestor;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: Arc<dyn BuildStore>,
    pub scheduler: Arc<Scheduler>,
    pub ingestor: Arc<WebhookIngestor>,
}

impl AppState {
    pub fn new(
        config: Arc<ServerConfig>,
        store: Arc<dyn BuildStore>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        let ingestor = Arc::new(WebhookIngestor::new(
            config.clone(),
            store.clone(),
            scheduler.clone(),
        ));
        Self {
            config,
            store,
            scheduler,
            ingestor,
        }
    }
}
