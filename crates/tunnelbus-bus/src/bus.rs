//! The bus abstraction relays are written against

use crate::error::BusResult;
use crate::message::{Delivery, OutboundMessage};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Deliveries of one queue, in broker order
pub type DeliveryStream = Pin<Box<dyn Stream<Item = BusResult<Delivery>> + Send>>;

/// Broker operations used by the tunnel
///
/// Exchanges are direct, and every exchange and queue is declared non-durable,
/// non-exclusive and never auto-deleted. Declarations are idempotent.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Declare a direct exchange
    async fn declare_exchange(&self, exchange: &str) -> BusResult<()>;

    /// Declare a queue
    async fn declare_queue(&self, queue: &str) -> BusResult<()>;

    /// Bind a queue to an exchange with a routing key
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()>;

    /// Publish a message; the empty exchange routes straight to the queue named by `routing_key`
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> BusResult<()>;

    /// Start consuming a queue with manual acknowledgement, one unacked delivery at a time
    async fn consume(&self, queue: &str) -> BusResult<DeliveryStream>;

    /// Declare an exchange, a queue and the binding between them
    async fn declare_topic(&self, exchange: &str, queue: &str, routing_key: &str) -> BusResult<()> {
        self.declare_exchange(exchange).await?;
        self.declare_queue(queue).await?;
        self.bind_queue(queue, exchange, routing_key).await
    }
}
