//! Runs every relay for the signed-in user

use crate::profile::Profile;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tunnelbus_bus::MessageBus;
use tunnelbus_registry::SessionRegistry;
use tunnelbus_relay::{
    HttpRelay, ProjectCatalog, Registry, RelayError, TcpConfig, TcpMultiplexer, WebSocketRelay,
};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Profile signal closed before a profile was published")]
    ProfileUnavailable,

    #[error("Failed to start relays: {0}")]
    Start(#[from] RelayError),
}

pub struct Worker {
    bus: Arc<dyn MessageBus>,
    registry: Arc<Registry>,
    tcp_config: TcpConfig,
}

impl Worker {
    pub fn new(bus: Arc<dyn MessageBus>, tcp_config: TcpConfig) -> Self {
        Self {
            bus,
            registry: Arc::new(SessionRegistry::new()),
            tcp_config,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Wait for a profile, then serve its user until `cancel` fires
    ///
    /// Returns early without error if cancelled while still waiting.
    pub async fn run(
        &self,
        mut profile: watch::Receiver<Option<Profile>>,
        cancel: CancellationToken,
    ) -> Result<(), WorkerError> {
        let profile = loop {
            if let Some(profile) = profile.borrow_and_update().clone() {
                break profile;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                changed = profile.changed() => {
                    if changed.is_err() {
                        return Err(WorkerError::ProfileUnavailable);
                    }
                }
            }
        };

        let username = profile.username.as_str();
        info!(username, projects = profile.projects.len(), "Profile ready");
        self.registry.set_projects(profile.projects.clone());

        let scope = cancel.child_token();
        let tasks = match self.start(username, &scope).await {
            Ok(tasks) => tasks,
            Err(e) => {
                scope.cancel();
                self.registry.shutdown().await;
                return Err(e.into());
            }
        };

        info!(username, tasks = tasks.len(), "Agent running");
        scope.cancelled().await;

        info!(username, "Shutting down relays");
        self.registry.shutdown().await;
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Relay task failed: {}", e);
            }
        }
        Ok(())
    }

    async fn start(
        &self,
        username: &str,
        scope: &CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>, RelayError> {
        let http = Arc::new(HttpRelay::new(self.bus.clone())?);
        let websocket = Arc::new(WebSocketRelay::new(
            self.bus.clone(),
            self.registry.clone(),
            scope.clone(),
        )?);
        let tcp = Arc::new(TcpMultiplexer::new(
            self.bus.clone(),
            self.registry.clone(),
            self.tcp_config.clone(),
            scope.clone(),
        ));
        let catalog = Arc::new(ProjectCatalog::new(
            self.bus.clone(),
            self.registry.clone(),
            tcp.clone(),
        ));

        let mut tasks = Vec::new();
        tasks.push(http.start_for_user(username, scope.clone()).await?);
        tasks.push(websocket.start_for_user(username).await?);
        tasks.extend(tcp.start_for_user(username).await?);
        tasks.push(catalog.start_for_user(username, scope.clone()).await?);

        catalog.request_projects(username).await?;
        Ok(tasks)
    }
}
