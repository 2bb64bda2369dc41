use super::TcpMultiplexer;
use crate::envelope::{parse_port, require, require_port};
use crate::error::{RelayError, RelayResult};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tunnelbus_bus::{spawn_serial_consumer, Delivery, MessageHeaders};
use tunnelbus_proto::headers::{CONNECTION_ID, PORT, SHARED_PORT, USERNAME};
use tunnelbus_proto::topology::{share_port_queue, TCP_RESPONSES};
use tunnelbus_proto::TcpPacket;
use tunnelbus_registry::{SharePortKey, TcpSession};

impl TcpMultiplexer {
    pub(super) async fn start_share_port_consumer(
        self: &Arc<Self>,
        username: &str,
    ) -> RelayResult<JoinHandle<()>> {
        let queue = share_port_queue(username);
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
                    if let Err(e) = this.deliver_to_share_port(&delivery).await {
                        warn!("Dropping SharePort packet: {}", e);
                    }
                }
            },
        ))
    }

    /// Write a tunneled packet to the backing connection of its triple,
    /// connecting on the first packet
    ///
    /// Once a backing connection ends its triple is evicted. A later packet
    /// for the same triple opens a fresh backing connection and is written
    /// there; closing the remote connection is up to the remote side.
    async fn deliver_to_share_port(self: &Arc<Self>, delivery: &Delivery) -> RelayResult<()> {
        let username = require(&delivery.headers, USERNAME)?;
        let port = require_port(&delivery.headers, PORT)?;
        let connection_id = require(&delivery.headers, CONNECTION_ID)?;
        let backing_port = match delivery.headers.get(SHARED_PORT) {
            Some(value) => parse_port(SHARED_PORT, value)?,
            None => port,
        };
        let packet: TcpPacket = tunnelbus_proto::decode(&delivery.body)?;

        let key = SharePortKey::new(username, port, connection_id);
        let (session, created) = self
            .registry
            .share_port_sessions()
            .get_or_try_create(key.clone(), || self.connect_backing(backing_port))
            .await?;

        if created {
            info!(key = %key, backing_port, "Opened SharePort backing connection");
            let headers = MessageHeaders::new()
                .with(USERNAME, username)
                .with(PORT, port.to_string())
                .with(CONNECTION_ID, connection_id);
            let owned_key = key.clone();
            self.spawn_forwarder(&session, TCP_RESPONSES, headers, move |registry, session| {
                registry
                    .share_port_sessions()
                    .remove_if(&owned_key, |current| Arc::ptr_eq(current, session));
                debug!(key = %owned_key, "SharePort session ended");
            });
        }

        if !session.is_connected() {
            self.registry
                .share_port_sessions()
                .remove_if(&key, |current| Arc::ptr_eq(current, &session));
            session.abort();
            debug!(key = %key, "SharePort session closed, dropping packet");
            return Ok(());
        }

        session
            .write(packet.data())
            .await
            .map_err(RelayError::SocketWrite)
    }

    async fn connect_backing(&self, port: u16) -> RelayResult<Arc<TcpSession>> {
        let addr = format!("{}:{}", self.config.backing_host, port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| RelayError::LocalConnect {
                target: addr.clone(),
                reason: e.to_string(),
            })?;

        Ok(Arc::new(TcpSession::new(stream).map_err(RelayError::Socket)?))
    }
}
