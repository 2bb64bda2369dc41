//! Relay errors

use thiserror::Error;
use tunnelbus_bus::BusError;

/// Errors raised while relaying one message
///
/// None of these are fatal; the consumer logs them and drops the message.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid header {name}: {reason}")]
    InvalidHeader { name: &'static str, reason: String },

    #[error("Malformed message body: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("Failed to encode message body: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Invalid URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Failed to connect to local target {target}: {reason}")]
    LocalConnect { target: String, reason: String },

    #[error("Failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Local request failed: {0}")]
    LocalRequest(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Socket error: {0}")]
    Socket(#[source] std::io::Error),

    #[error("Socket write failed: {0}")]
    SocketWrite(#[source] std::io::Error),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Bus(#[from] BusError),
}

pub type RelayResult<T> = Result<T, RelayError>;
