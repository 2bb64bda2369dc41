//! Wire models carried in broker message bodies
//!
//! All bodies are UTF-8 JSON with PascalCase field names so that the agent
//! interoperates with the remote relay. Byte buffers travel as base64 strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors produced while interpreting wire values
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("Unknown project kind: {0}")]
    UnknownProjectKind(u8),

    #[error("Unknown WebSocket message kind: {0}")]
    UnknownMessageKind(u8),
}

/// Which relay(s) apply to an exposed project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ProjectKind {
    /// Reached through the HTTP and WebSocket relays
    HttpOrWebSocket,
    /// Drives the TCP multiplexer with a local listener
    UsePort,
}

impl From<ProjectKind> for u8 {
    fn from(kind: ProjectKind) -> Self {
        match kind {
            ProjectKind::HttpOrWebSocket => 1,
            ProjectKind::UsePort => 2,
        }
    }
}

impl TryFrom<u8> for ProjectKind {
    type Error = ModelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ProjectKind::HttpOrWebSocket),
            2 => Ok(ProjectKind::UsePort),
            other => Err(ModelError::UnknownProjectKind(other)),
        }
    }
}

/// A project the signed-in user exposes through the tunnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExposedProject {
    pub id: i64,
    #[serde(default)]
    pub view_id: Uuid,
    #[serde(default)]
    pub customer_id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "AppProjectType")]
    pub kind: ProjectKind,
    pub internal_port: u16,
    #[serde(default)]
    pub state: i32,
    #[serde(
        rename = "DateCreated",
        default,
        with = "crate::lenient_datetime"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        rename = "DateUpdated",
        default,
        with = "crate::lenient_datetime"
    )]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ExposedProject {
    pub fn is_use_port(&self) -> bool {
        self.kind == ProjectKind::UsePort
    }
}

/// One multi-valued header, in the order it was received
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HeaderEntry {
    pub key: String,
    #[serde(default)]
    pub value: Vec<String>,
}

impl HeaderEntry {
    pub fn new(key: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            key: key.into(),
            value: values,
        }
    }

    pub fn single(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(key, vec![value.into()])
    }

    /// First value of the header, if any
    pub fn first(&self) -> Option<&str> {
        self.value.first().map(String::as_str)
    }
}

/// A tunneled HTTP request as published by the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HttpRequestModel {
    /// Absolute public URL the remote caller requested
    pub request_url: String,
    pub method: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub headers: Vec<HeaderEntry>,
    #[serde(default, with = "crate::base64_bytes::option")]
    pub bytes: Option<Vec<u8>>,
}

/// The local response returned to the relay
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HttpResponseModel {
    pub http_status_code: u16,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub headers: Vec<HeaderEntry>,
    /// Body decoded as UTF-8 with internal URLs rewritten (HTML/JavaScript only)
    #[serde(default)]
    pub string_content: Option<String>,
    #[serde(default, with = "crate::base64_bytes::option")]
    pub bytes: Option<Vec<u8>>,
    pub is_success_status_code: bool,
    #[serde(default)]
    pub is_redirected: bool,
    #[serde(default)]
    pub redirect_url: Option<String>,
}

/// Kind of a WebSocket message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageKind {
    Text,
    Binary,
    Close,
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Text => 0,
            MessageKind::Binary => 1,
            MessageKind::Close => 2,
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = ModelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageKind::Text),
            1 => Ok(MessageKind::Binary),
            2 => Ok(MessageKind::Close),
            other => Err(ModelError::UnknownMessageKind(other)),
        }
    }
}

/// One WebSocket frame relayed through the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WebSocketFrame {
    #[serde(with = "crate::base64_bytes")]
    pub payload: Vec<u8>,
    pub payload_count: usize,
    #[serde(rename = "MessageType")]
    pub kind: MessageKind,
    pub end_of_message: bool,
}

impl WebSocketFrame {
    pub fn new(kind: MessageKind, payload: Vec<u8>, end_of_message: bool) -> Self {
        Self {
            payload_count: payload.len(),
            payload,
            kind,
            end_of_message,
        }
    }

    /// The meaningful bytes of the payload
    ///
    /// Senders may ship a buffer longer than the frame; `PayloadCount` wins.
    pub fn data(&self) -> &[u8] {
        let count = self.payload_count.min(self.payload.len());
        &self.payload[..count]
    }
}

/// A chunk of a tunneled TCP byte stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "PacketModel", rename_all = "PascalCase")]
pub struct TcpPacket {
    #[serde(with = "crate::base64_bytes")]
    pub buffer: Vec<u8>,
    pub count: usize,
}

impl TcpPacket {
    pub fn new(data: &[u8]) -> Self {
        Self {
            buffer: data.to_vec(),
            count: data.len(),
        }
    }

    /// The meaningful bytes of the buffer
    pub fn data(&self) -> &[u8] {
        let count = self.count.min(self.buffer.len());
        &self.buffer[..count]
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
