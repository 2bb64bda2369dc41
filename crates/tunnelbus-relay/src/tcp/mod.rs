//! TCP multiplexer
//!
//! Carries TCP byte streams over the bus as discrete packets addressed by
//! (username, port, connectionId). Two roles cooperate through the remote
//! relay:
//! - UsePort accepts local connections and ships their bytes to
//!   `server_network_requests`, writing returned packets back to the socket
//! - SharePort replays those bytes on a connection to the real backing
//!   service and ships its replies to `server_network_responses`
//!
//! Each socket has one forwarder task. It reads fixed-size chunks until the
//! peer closes, then closes the session and evicts its own registry entry.

mod share_port;
mod use_port;

use crate::error::RelayResult;
use crate::Registry;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use tunnelbus_bus::{MessageBus, MessageHeaders, OutboundMessage};
use tunnelbus_proto::topology::{TCP_BINDING_KEY, TCP_REQUESTS, TCP_RESPONSES};
use tunnelbus_proto::TcpPacket;
use tunnelbus_registry::TcpSession;

/// Socket settings of the multiplexer
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Host UsePort listeners bind to
    pub listen_host: String,
    /// Host of the services SharePort connects to
    pub backing_host: String,
    /// Bytes read per forwarded packet
    pub chunk_size: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            backing_host: "127.0.0.1".to_string(),
            chunk_size: 4096,
        }
    }
}

pub struct TcpMultiplexer {
    bus: Arc<dyn MessageBus>,
    registry: Arc<Registry>,
    config: TcpConfig,
    cancel: CancellationToken,
}

impl TcpMultiplexer {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: Arc<Registry>,
        config: TcpConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bus,
            registry,
            config,
            cancel,
        }
    }

    /// Start both roles for `username`
    ///
    /// UsePort listeners are opened for the UsePort projects currently in the
    /// registry; the returned handles are the two packet consumers.
    pub async fn start_for_user(self: &Arc<Self>, username: &str) -> RelayResult<Vec<JoinHandle<()>>> {
        self.bus
            .declare_topic(TCP_REQUESTS, TCP_REQUESTS, TCP_BINDING_KEY)
            .await?;
        self.bus
            .declare_topic(TCP_RESPONSES, TCP_RESPONSES, TCP_BINDING_KEY)
            .await?;

        let projects = self.registry.use_port_projects();
        self.start_listeners(username, &projects).await;

        let use_port = self.start_use_port_consumer(username).await?;
        let share_port = self.start_share_port_consumer(username).await?;

        info!(username, listeners = projects.len(), "TCP multiplexer started");
        Ok(vec![use_port, share_port])
    }

    /// Start the forwarder of `session`, publishing its bytes to `exchange`
    ///
    /// `evict` runs once the forwarder has closed the session.
    fn spawn_forwarder<F>(
        self: &Arc<Self>,
        session: &Arc<TcpSession>,
        exchange: &'static str,
        headers: MessageHeaders,
        evict: F,
    ) where
        F: FnOnce(&Registry, &Arc<TcpSession>) + Send + 'static,
    {
        let Some(reader) = session.take_reader() else {
            warn!(peer = %session.peer_addr(), "Forwarder already started");
            return;
        };

        let this = Arc::clone(self);
        let owned = Arc::clone(session);
        let handle = tokio::spawn(async move {
            this.forward(reader, exchange, &headers).await;
            owned.close().await;
            evict(&this.registry, &owned);
        });
        session.attach_forwarder(handle);
    }

    async fn forward(&self, mut reader: OwnedReadHalf, exchange: &str, headers: &MessageHeaders) {
        let mut buffer = vec![0u8; self.config.chunk_size.max(1)];

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = reader.read(&mut buffer) => read,
            };

            let n = match read {
                Ok(0) => {
                    debug!(?headers, "Local peer closed connection");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(?headers, "Local read failed: {}", e);
                    break;
                }
            };

            if let Err(e) = self.publish_packet(exchange, headers, &buffer[..n]).await {
                warn!(exchange, "Failed to publish TCP packet: {}", e);
            }
        }
    }

    async fn publish_packet(
        &self,
        exchange: &str,
        headers: &MessageHeaders,
        data: &[u8],
    ) -> RelayResult<()> {
        let body = tunnelbus_proto::encode(&TcpPacket::new(data))
            .map_err(crate::error::RelayError::Serialization)?;
        let message = OutboundMessage::new(body).with_headers(headers.clone());

        self.bus.publish(exchange, TCP_BINDING_KEY, message).await?;
        trace!(exchange, bytes = data.len(), "Published TCP packet");
        Ok(())
    }
}
