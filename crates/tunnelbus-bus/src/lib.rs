//! Message bus gateway
//!
//! A thin abstraction over the message broker that carries every tunneled
//! byte. Relays depend only on the [`MessageBus`] trait:
//! - [`AmqpBus`] talks to a RabbitMQ broker over AMQP 0-9-1
//! - `MemoryBus` routes in-process (with the `test-support` feature)
//!
//! Consumers are driven by [`spawn_serial_consumer`], which preserves the
//! broker's per-queue FIFO order by handling one delivery at a time.

pub mod amqp;
pub mod bus;
pub mod consumer;
pub mod error;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod message;
pub mod retry;

pub use amqp::AmqpBus;
pub use bus::{DeliveryStream, MessageBus};
pub use consumer::spawn_serial_consumer;
pub use error::{BusError, BusResult};
#[cfg(any(test, feature = "test-support"))]
pub use memory::{Declaration, MemoryBus};
pub use message::{Acknowledge, Delivery, MessageHeaders, OutboundMessage};
pub use retry::{RetryManager, RetryPolicy};
