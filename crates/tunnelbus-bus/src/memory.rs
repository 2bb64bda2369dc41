//! In-process bus with direct-exchange routing, for tests

use crate::bus::{DeliveryStream, MessageBus};
use crate::error::{BusError, BusResult};
use crate::message::{Acknowledge, Delivery, OutboundMessage};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::debug;

/// A declaration recorded by [`MemoryBus`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    Exchange(String),
    Queue(String),
    Binding {
        queue: String,
        exchange: String,
        routing_key: String,
    },
}

struct QueueSlot {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Option<mpsc::UnboundedReceiver<Delivery>>,
}

#[derive(Default)]
struct State {
    /// exchange -> (routing key, queue)
    exchanges: HashMap<String, Vec<(String, String)>>,
    queues: HashMap<String, QueueSlot>,
    declarations: Vec<Declaration>,
}

struct CountingAcker(Arc<AtomicUsize>);

#[async_trait]
impl Acknowledge for CountingAcker {
    async fn ack(&self) -> BusResult<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Broker stand-in that routes like RabbitMQ direct exchanges
///
/// Publishing to the empty exchange targets the queue named by the routing
/// key. Unroutable messages are dropped. Each queue accepts one consumer.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<State>>,
    acks: Arc<AtomicUsize>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of deliveries acknowledged so far
    pub fn acked(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    /// Every declaration in the order it was made, duplicates included
    pub fn declarations(&self) -> Vec<Declaration> {
        self.lock().declarations.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-route
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deliver(&self, state: &State, queue: &str, message: &OutboundMessage) {
        match state.queues.get(queue) {
            Some(slot) => {
                let delivery = Delivery::new(
                    message.correlation_id.clone(),
                    message.headers.clone(),
                    Bytes::from(message.body.clone()),
                    Arc::new(CountingAcker(self.acks.clone())),
                );
                let _ = slot.tx.send(delivery);
            }
            None => debug!(queue, "Dropping message for undeclared queue"),
        }
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn declare_exchange(&self, exchange: &str) -> BusResult<()> {
        let mut state = self.lock();
        state.exchanges.entry(exchange.to_string()).or_default();
        state
            .declarations
            .push(Declaration::Exchange(exchange.to_string()));
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> BusResult<()> {
        let mut state = self.lock();
        state.queues.entry(queue.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            QueueSlot { tx, rx: Some(rx) }
        });
        state.declarations.push(Declaration::Queue(queue.to_string()));
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()> {
        let mut state = self.lock();
        if !state.queues.contains_key(queue) {
            return Err(BusError::UnknownQueue(queue.to_string()));
        }
        let bindings = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BusError::UnknownExchange(exchange.to_string()))?;

        let binding = (routing_key.to_string(), queue.to_string());
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        state.declarations.push(Declaration::Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> BusResult<()> {
        let state = self.lock();

        if exchange.is_empty() {
            self.deliver(&state, routing_key, &message);
            return Ok(());
        }

        let bindings = state
            .exchanges
            .get(exchange)
            .ok_or_else(|| BusError::UnknownExchange(exchange.to_string()))?;

        for (key, queue) in bindings {
            if key == routing_key {
                self.deliver(&state, queue, &message);
            }
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> BusResult<DeliveryStream> {
        let mut state = self.lock();
        let slot = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::UnknownQueue(queue.to_string()))?;
        let rx = slot
            .rx
            .take()
            .ok_or_else(|| BusError::QueueAlreadyConsumed(queue.to_string()))?;

        Ok(Box::pin(UnboundedReceiverStream::new(rx).map(Ok)))
    }
}
