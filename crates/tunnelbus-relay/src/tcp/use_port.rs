use super::TcpMultiplexer;
use crate::envelope::{require, require_port};
use crate::error::{RelayError, RelayResult};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunnelbus_bus::{spawn_serial_consumer, Delivery, MessageHeaders};
use tunnelbus_proto::headers::{CONNECTION_ID, PORT, USERNAME};
use tunnelbus_proto::topology::{use_port_queue, TCP_REQUESTS};
use tunnelbus_proto::{ExposedProject, TcpPacket};
use tunnelbus_registry::{ListenerHandle, TcpSession, UsePortKey};
use uuid::Uuid;

impl TcpMultiplexer {
    /// Open a listener for every UsePort project that has none yet
    pub async fn start_listeners(self: &Arc<Self>, username: &str, projects: &[ExposedProject]) {
        for project in projects.iter().filter(|p| p.is_use_port()) {
            if let Err(e) = self.start_listener(username, project.internal_port).await {
                warn!(
                    port = project.internal_port,
                    project = %project.title,
                    "Failed to start UsePort listener: {}",
                    e
                );
            }
        }
    }

    /// Return the listener on `port`, binding it and starting its accept loop if absent
    pub async fn start_listener(
        self: &Arc<Self>,
        username: &str,
        port: u16,
    ) -> RelayResult<ListenerHandle> {
        let (handle, _) = self
            .registry
            .listeners()
            .get_or_try_create(port, || self.bind_listener(username, port))
            .await?;
        Ok(handle)
    }

    async fn bind_listener(self: &Arc<Self>, username: &str, port: u16) -> RelayResult<ListenerHandle> {
        let addr = format!("{}:{}", self.config.listen_host, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RelayError::Listen {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| RelayError::Listen {
            addr: addr.clone(),
            source,
        })?;

        let handle = ListenerHandle::new(local_addr, self.cancel.child_token());
        info!(username, port, %local_addr, "UsePort listener started");

        let this = Arc::clone(self);
        let username = username.to_string();
        let cancel = handle.cancel_token().clone();
        tokio::spawn(async move { this.accept_loop(username, port, listener, cancel).await });

        Ok(handle)
    }

    async fn accept_loop(
        self: Arc<Self>,
        username: String,
        port: u16,
        listener: TcpListener,
        cancel: CancellationToken,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(port, "Failed to accept connection: {}", e);
                    continue;
                }
            };

            let connection_id = Uuid::new_v4().to_string();
            debug!(port, %peer, connection_id = %connection_id, "Accepted UsePort connection");

            if let Err(e) = self.open_use_port_session(&username, port, &connection_id, stream) {
                warn!(port, connection_id = %connection_id, "Failed to open session: {}", e);
            }
        }

        let local_addr = listener.local_addr().ok();
        self.registry
            .listeners()
            .remove_if(&port, |handle| Some(handle.local_addr()) == local_addr);
        info!(port, "UsePort listener stopped");
    }

    fn open_use_port_session(
        self: &Arc<Self>,
        username: &str,
        port: u16,
        connection_id: &str,
        stream: TcpStream,
    ) -> RelayResult<()> {
        let session = Arc::new(TcpSession::new(stream).map_err(RelayError::Socket)?);
        let key = UsePortKey::new(port, connection_id);

        self.registry
            .use_port_sessions()
            .set(key.clone(), Arc::clone(&session));

        let headers = MessageHeaders::new()
            .with(USERNAME, username)
            .with(PORT, port.to_string())
            .with(CONNECTION_ID, connection_id);

        self.spawn_forwarder(&session, TCP_REQUESTS, headers, move |registry, session| {
            registry
                .use_port_sessions()
                .remove_if(&key, |current| Arc::ptr_eq(current, session));
            debug!(key = %key, "UsePort session ended");
        });

        Ok(())
    }

    pub(super) async fn start_use_port_consumer(
        self: &Arc<Self>,
        username: &str,
    ) -> RelayResult<JoinHandle<()>> {
        let queue = use_port_queue(username);
        self.bus.declare_queue(&queue).await?;
        let deliveries = self.bus.consume(&queue).await?;

        let this = Arc::clone(self);
        Ok(spawn_serial_consumer(
            queue,
            deliveries,
            self.cancel.clone(),
            move |delivery| {
                let this = this.clone();
                async move {
                    if let Err(e) = this.deliver_to_use_port(&delivery).await {
                        warn!("Dropping UsePort packet: {}", e);
                    }
                }
            },
        ))
    }

    /// Write a returned packet to the accepted connection it belongs to
    ///
    /// Packets for unknown or closed connections are dropped, and write
    /// failures are ignored.
    async fn deliver_to_use_port(&self, delivery: &Delivery) -> RelayResult<()> {
        let port = require_port(&delivery.headers, PORT)?;
        let connection_id = require(&delivery.headers, CONNECTION_ID)?;
        let packet: TcpPacket = tunnelbus_proto::decode(&delivery.body)?;

        let key = UsePortKey::new(port, connection_id);
        let Some(session) = self.registry.use_port_sessions().try_get(&key) else {
            debug!(key = %key, "No UsePort session, dropping packet");
            return Ok(());
        };

        if !session.is_connected() {
            debug!(key = %key, "UsePort session closed, dropping packet");
            return Ok(());
        }

        if let Err(e) = session.write(packet.data()).await {
            debug!(key = %key, "Ignoring UsePort write failure: {}", e);
        }
        Ok(())
    }
}
