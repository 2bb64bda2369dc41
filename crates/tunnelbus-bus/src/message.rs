//! Messages flowing through the bus

use crate::error::BusResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// String-keyed header table carried next to the body
///
/// Values are normalized to strings whatever their wire type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    values: BTreeMap<String, String>,
}

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MessageHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// A message about to be published
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub headers: MessageHeaders,
    pub correlation_id: Option<String>,
    pub body: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn with_headers(mut self, headers: MessageHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Manual acknowledgement of one delivery
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> BusResult<()>;
}

/// A message received from a queue
pub struct Delivery {
    pub correlation_id: Option<String>,
    pub headers: MessageHeaders,
    pub body: Bytes,
    acker: Arc<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        correlation_id: Option<String>,
        headers: MessageHeaders,
        body: Bytes,
        acker: Arc<dyn Acknowledge>,
    ) -> Self {
        Self {
            correlation_id,
            headers,
            body,
            acker,
        }
    }

    /// Acknowledge this delivery to the broker
    pub async fn ack(&self) -> BusResult<()> {
        self.acker.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("correlation_id", &self.correlation_id)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}
