//! WebSocket relay
//!
//! One local WebSocket per public host, opened on the first frame that
//! targets the host. Every message read from a local socket is published to
//! `websocket_bus`; a close from the local side evicts the host so the next
//! frame reconnects.

use crate::envelope::{parse_uri, require};
use crate::error::{RelayError, RelayResult};
use crate::tls::insecure_client_config;
use crate::Registry;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunnelbus_bus::{spawn_serial_consumer, Delivery, MessageBus, OutboundMessage};
use tunnelbus_proto::headers::{DESTINATION_HOST, INTERNAL_TARGET_URI};
use tunnelbus_proto::topology::{
    websocket_server_queue, WEBSOCKET_BINDING_KEY, WEBSOCKET_CLIENT_QUEUE, WEBSOCKET_EXCHANGE,
};
use tunnelbus_proto::{MessageKind, WebSocketFrame};
use url::Url;

type LocalSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Map an `http`/`https` target onto `ws`/`wss`, keeping path and query
pub fn websocket_url(internal: &Url) -> RelayResult<Url> {
    let scheme = match internal.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(RelayError::InvalidUri {
                uri: internal.to_string(),
                reason: format!("unsupported scheme '{}'", other),
            })
        }
    };

    let mut url = internal.clone();
    url.set_scheme(scheme).map_err(|_| RelayError::InvalidUri {
        uri: internal.to_string(),
        reason: format!("cannot switch scheme to '{}'", scheme),
    })?;
    Ok(url)
}

/// Outbound fragments awaiting their final frame
#[derive(Debug, Default)]
struct Fragments {
    kind: Option<MessageKind>,
    data: Vec<u8>,
}

impl Fragments {
    /// Buffer `frame`, returning the whole message once its final frame arrives
    ///
    /// The message keeps the kind of its first fragment.
    fn push(&mut self, frame: &WebSocketFrame) -> Option<(MessageKind, Vec<u8>)> {
        let kind = *self.kind.get_or_insert(frame.kind);
        if kind != frame.kind {
            debug!(
                first = ?kind,
                fragment = ?frame.kind,
                "Fragment kind differs from the message kind"
            );
        }

        self.data.extend_from_slice(frame.data());
        if !frame.end_of_message {
            return None;
        }

        self.kind = None;
        Some((kind, std::mem::take(&mut self.data)))
    }

    fn clear(&mut self) {
        self.kind = None;
        self.data.clear();
    }
}

/// A live local WebSocket for one public host
pub struct WebSocketSession {
    host: String,
    target: Url,
    sink: tokio::sync::Mutex<SplitSink<LocalSocket, Message>>,
    stream: Mutex<Option<SplitStream<LocalSocket>>>,
    pending: Mutex<Fragments>,
}

impl WebSocketSession {
    fn new(host: String, target: Url, socket: LocalSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            host,
            target,
            sink: tokio::sync::Mutex::new(sink),
            stream: Mutex::new(Some(stream)),
            pending: Mutex::new(Fragments::default()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The internal URI the socket was opened for
    pub fn target(&self) -> &Url {
        &self.target
    }

    fn take_stream(&self) -> Option<SplitStream<LocalSocket>> {
        self.stream.lock().ok().and_then(|mut stream| stream.take())
    }

    /// Send one tunneled frame to the local socket
    ///
    /// Fragments are buffered until the frame marked end-of-message arrives.
    /// A close discards any partial message.
    pub async fn send_frame(&self, frame: &WebSocketFrame) -> RelayResult<()> {
        if frame.kind == MessageKind::Close {
            self.pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
            self.sink.lock().await.send(Message::Close(None)).await?;
            return Ok(());
        }

        let complete = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(frame);
        let Some((kind, payload)) = complete else {
            return Ok(());
        };

        let message = match kind {
            MessageKind::Text => Message::Text(String::from_utf8_lossy(&payload).into_owned()),
            _ => Message::Binary(payload),
        };

        self.sink.lock().await.send(message).await?;
        Ok(())
    }
}

pub struct WebSocketRelay {
    bus: Arc<dyn MessageBus>,
    registry: Arc<Registry>,
    tls: Arc<rustls::ClientConfig>,
    cancel: CancellationToken,
}

impl WebSocketRelay {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: Arc<Registry>,
        cancel: CancellationToken,
    ) -> RelayResult<Self> {
        Ok(Self {
            bus,
            registry,
            tls: insecure_client_config()?,
            cancel,
        })
    }

    /// Declare the WebSocket topology and start consuming the user's frame queue
    pub async fn start_for_user(self: &Arc<Self>, username: &str) -> RelayResult<JoinHandle<()>> {
        self.bus
            .declare_topic(WEBSOCKET_EXCHANGE, WEBSOCKET_CLIENT_QUEUE, WEBSOCKET_BINDING_KEY)
            .await?;

        let queue = websocket_server_queue(username);
        self.bus.declare_queue(&queue).await?;
        let deliveries = self.bus.consume(&queue).await?;

        info!(username, queue = %queue, "WebSocket relay started");

        let relay = Arc::clone(self);
        Ok(spawn_serial_consumer(
            queue,
            deliveries,
            self.cancel.clone(),
            move |delivery| {
                let relay = relay.clone();
                async move { relay.handle_delivery(delivery).await }
            },
        ))
    }

    async fn handle_delivery(self: &Arc<Self>, delivery: Delivery) {
        if let Err(e) = self.relay(&delivery).await {
            warn!("Dropping WebSocket frame: {}", e);
        }
    }

    async fn relay(self: &Arc<Self>, delivery: &Delivery) -> RelayResult<()> {
        let internal = parse_uri(require(&delivery.headers, INTERNAL_TARGET_URI)?)?;
        let host = require(&delivery.headers, DESTINATION_HOST)?;
        let frame: WebSocketFrame = tunnelbus_proto::decode(&delivery.body)?;

        let session = self.initialize_websocket(host, &internal).await?;
        session.send_frame(&frame).await
    }

    /// Return the socket for `host`, connecting to `internal` if there is none
    ///
    /// Concurrent first callers share one connection. Only the connecting
    /// caller starts the receive loop.
    pub async fn initialize_websocket(
        self: &Arc<Self>,
        host: &str,
        internal: &Url,
    ) -> RelayResult<Arc<WebSocketSession>> {
        let (session, created) = self
            .registry
            .websockets()
            .get_or_try_create(host.to_string(), || self.connect(host, internal))
            .await?;

        if created {
            match session.take_stream() {
                Some(stream) => {
                    let relay = Arc::clone(self);
                    let receiver = Arc::clone(&session);
                    tokio::spawn(async move { relay.receive_loop(receiver, stream).await });
                }
                None => warn!(host, "WebSocket stream already taken"),
            }
        }

        Ok(session)
    }

    async fn connect(&self, host: &str, internal: &Url) -> RelayResult<Arc<WebSocketSession>> {
        let url = websocket_url(internal)?;

        let (socket, _response) = connect_async_tls_with_config(
            url.as_str(),
            None,
            false,
            Some(Connector::Rustls(self.tls.clone())),
        )
        .await
        .map_err(|e| RelayError::LocalConnect {
            target: url.to_string(),
            reason: e.to_string(),
        })?;

        info!(host, url = %url, "Connected local WebSocket");
        Ok(Arc::new(WebSocketSession::new(
            host.to_string(),
            internal.clone(),
            socket,
        )))
    }

    async fn receive_loop(
        self: Arc<Self>,
        session: Arc<WebSocketSession>,
        mut stream: SplitStream<LocalSocket>,
    ) {
        let host = session.host().to_string();

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = stream.next() => next,
            };

            let frame = match next {
                Some(Ok(Message::Text(text))) => {
                    WebSocketFrame::new(MessageKind::Text, text.into_bytes(), true)
                }
                Some(Ok(Message::Binary(data))) => {
                    WebSocketFrame::new(MessageKind::Binary, data, true)
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(host = %host, "Local WebSocket closed");
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!(host = %host, "Local WebSocket read failed: {}", e);
                    break;
                }
            };

            if let Err(e) = self.publish(&session, &frame).await {
                warn!(host = %host, "Failed to publish WebSocket frame: {}", e);
            }
        }

        self.registry
            .websockets()
            .remove_if(&host, |current| Arc::ptr_eq(current, &session));
        info!(host = %host, "WebSocket session ended");
    }

    async fn publish(&self, session: &WebSocketSession, frame: &WebSocketFrame) -> RelayResult<()> {
        let body = tunnelbus_proto::encode(frame).map_err(RelayError::Serialization)?;
        let message = OutboundMessage::new(body)
            .with_header(INTERNAL_TARGET_URI, session.target().as_str())
            .with_header(DESTINATION_HOST, session.host());

        self.bus
            .publish(WEBSOCKET_EXCHANGE, WEBSOCKET_BINDING_KEY, message)
            .await?;
        Ok(())
    }
}
