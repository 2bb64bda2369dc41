//! Exposed project catalog pushed by the remote side

use crate::error::RelayResult;
use crate::tcp::TcpMultiplexer;
use crate::Registry;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tunnelbus_bus::{spawn_serial_consumer, Delivery, MessageBus, OutboundMessage};
use tunnelbus_proto::headers::USERNAME;
use tunnelbus_proto::topology::{project_catalog_queue, GET_PROJECTS_COMMAND, SERVER_BUS};
use tunnelbus_proto::ExposedProject;

pub struct ProjectCatalog {
    bus: Arc<dyn MessageBus>,
    registry: Arc<Registry>,
    tcp: Arc<TcpMultiplexer>,
}

impl ProjectCatalog {
    pub fn new(bus: Arc<dyn MessageBus>, registry: Arc<Registry>, tcp: Arc<TcpMultiplexer>) -> Self {
        Self { bus, registry, tcp }
    }

    /// Consume catalog updates for `username`
    ///
    /// Each update replaces the cached projects and opens listeners for any
    /// new UsePort project.
    pub async fn start_for_user(
        self: &Arc<Self>,
        username: &str,
        cancel: CancellationToken,
    ) -> RelayResult<JoinHandle<()>> {
        let queue = project_catalog_queue(username);
        self.bus.declare_queue(&queue).await?;
        let deliveries = self.bus.consume(&queue).await?;

        let this = Arc::clone(self);
        let username = username.to_string();
        Ok(spawn_serial_consumer(queue, deliveries, cancel, move |delivery| {
            let this = this.clone();
            let username = username.clone();
            async move { this.apply(&username, &delivery).await }
        }))
    }

    async fn apply(&self, username: &str, delivery: &Delivery) {
        let projects: Vec<ExposedProject> = match tunnelbus_proto::decode(&delivery.body) {
            Ok(projects) => projects,
            Err(e) => {
                warn!(username, "Dropping malformed project catalog: {}", e);
                return;
            }
        };

        info!(username, count = projects.len(), "Received project catalog");
        self.registry.set_projects(projects);
        self.tcp
            .start_listeners(username, &self.registry.use_port_projects())
            .await;
    }

    /// Ask the remote side to push the catalog for `username`
    pub async fn request_projects(&self, username: &str) -> RelayResult<()> {
        self.bus.declare_topic(SERVER_BUS, SERVER_BUS, "").await?;

        let message = OutboundMessage::new(GET_PROJECTS_COMMAND.as_bytes().to_vec())
            .with_header(USERNAME, username);
        self.bus.publish(SERVER_BUS, "", message).await?;

        info!(username, "Requested project catalog");
        Ok(())
    }
}
