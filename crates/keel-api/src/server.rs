//! Server assembly and lifecycle.

use axum::Router;
use keel_config::ServerConfig;
use keel_core::{BuildStore, Builder, Result};
use keel_executor::{BuildSettings, GitCheckout, ShellBuilder};
use keel_notify::{Dispatcher, NotifierRegistry};
use keel_scheduler::{Scheduler, SchedulerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::AppState;
use crate::routes;

/// How long shutdown waits for pending notifications.
const DISPATCH_GRACE: Duration = Duration::from_secs(60);

/// A running Keel instance: store, scheduler workers and notification dispatcher.
pub struct Server {
    state: AppState,
    dispatcher: JoinHandle<()>,
}

impl Server {
    /// Open the configured store and start building.
    pub async fn init(config: ServerConfig) -> Result<Self> {
        let store = keel_db::open_store(&config.database).await?;

        let checkout = Arc::new(GitCheckout::new(config.directory.clone()));
        let settings = BuildSettings {
            timeout: config.timeout,
            output_limit: config.output_limit,
            keep_workdirs: config.keep_workdirs,
        };
        let builder = Arc::new(ShellBuilder::new(checkout, settings));
        let registry = NotifierRegistry::with_enabled(&config.notifiers);

        Self::assemble(config, store, builder, registry).await
    }

    /// Wire explicit collaborators together and start the workers.
    pub async fn assemble(
        config: ServerConfig,
        store: Arc<dyn BuildStore>,
        builder: Arc<dyn Builder>,
        registry: NotifierRegistry,
    ) -> Result<Self> {
        for project in &config.projects {
            store.save_project(project).await?;
        }
        info!(projects = config.projects.len(), "Registered projects");

        let scheduler_config = SchedulerConfig {
            concurrency: config.builder.concurrency(),
            backlog: config.backlog,
            ..SchedulerConfig::default()
        };
        let (scheduler, events) = Scheduler::new(scheduler_config, builder, store.clone());
        let scheduler = Arc::new(scheduler);
        scheduler.run();

        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            store.clone(),
            config.base_url.as_str(),
        ))
        .spawn(events);

        Ok(Self {
            state: AppState::new(Arc::new(config), store, scheduler),
            dispatcher,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    pub fn router(&self) -> Router {
        routes::router(self.state.clone())
    }

    /// Stop the scheduler, then let the dispatcher finish what it has.
    pub async fn shutdown(self, drain: bool) {
        self.state.scheduler.shutdown(drain).await;
        match tokio::time::timeout(DISPATCH_GRACE, self.dispatcher).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Notification dispatcher failed"),
            Err(_) => warn!("Gave up waiting for pending notifications"),
        }
        info!("Server stopped");
    }
}
