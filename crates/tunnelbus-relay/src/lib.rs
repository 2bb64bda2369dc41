//! Tunnel relays
//!
//! Each relay consumes one kind of tunneled traffic from the bus, drives the
//! matching local resource, and publishes the result back:
//! - [`HttpRelay`]: request/response correlation against a local HTTP server
//! - [`WebSocketRelay`]: one lazily opened local WebSocket per public host
//! - [`TcpMultiplexer`]: byte streams addressed by (username, port, connectionId)
//! - [`ProjectCatalog`]: the exposed project list pushed by the remote side
//!
//! Per-message failures are logged and the message dropped; they never stop a
//! consumer.

pub mod catalog;
pub mod envelope;
pub mod error;
pub mod http;
pub mod tcp;
mod tls;
pub mod websocket;

pub use catalog::ProjectCatalog;
pub use error::{RelayError, RelayResult};
pub use http::HttpRelay;
pub use tcp::{TcpConfig, TcpMultiplexer};
pub use websocket::{WebSocketRelay, WebSocketSession};

/// The registry as the relays use it
pub type Registry = tunnelbus_registry::SessionRegistry<std::sync::Arc<WebSocketSession>>;
