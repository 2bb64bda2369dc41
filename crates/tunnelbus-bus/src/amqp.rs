//! RabbitMQ implementation of the bus over AMQP 0-9-1

use crate::bus::{DeliveryStream, MessageBus};
use crate::error::{BusError, BusResult};
use crate::message::{Acknowledge, Delivery, MessageHeaders, OutboundMessage};
use crate::retry::{RetryManager, RetryPolicy};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Bus backed by a RabbitMQ connection
///
/// Publishing and declarations share one channel. Every consumer gets its own
/// channel with a prefetch of one so that a queue is handled strictly in order.
pub struct AmqpBus {
    connection: Connection,
    channel: Channel,
}

impl AmqpBus {
    /// Connect once
    pub async fn connect(url: &str) -> BusResult<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connect(format!("Failed to open channel: {}", e)))?;

        info!("Connected to message broker");
        Ok(Self {
            connection,
            channel,
        })
    }

    /// Connect with a bounded number of attempts and a fixed delay between them
    ///
    /// Exhausting the attempts yields [`BusError::ConnectRetriesExhausted`].
    pub async fn connect_with_retry(url: &str, policy: RetryPolicy) -> BusResult<Self> {
        let mut retry = RetryManager::new(policy);

        loop {
            match Self::connect(url).await {
                Ok(bus) => return Ok(bus),
                Err(e) => {
                    warn!(
                        attempt = retry.attempt() + 1,
                        "Broker connection attempt failed: {}", e
                    );
                    if retry.wait().await.is_err() {
                        return Err(BusError::ConnectRetriesExhausted {
                            attempts: retry.attempt(),
                            last_error: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Close the connection
    pub async fn close(&self) -> BusResult<()> {
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(|e| BusError::Connect(e.to_string()))
    }
}

#[async_trait]
impl MessageBus for AmqpBus {
    async fn declare_exchange(&self, exchange: &str) -> BusResult<()> {
        let options = ExchangeDeclareOptions {
            durable: false,
            auto_delete: false,
            ..Default::default()
        };

        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                options,
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Declare {
                name: exchange.to_string(),
                reason: e.to_string(),
            })
    }

    async fn declare_queue(&self, queue: &str) -> BusResult<()> {
        let options = QueueDeclareOptions {
            durable: false,
            exclusive: false,
            auto_delete: false,
            ..Default::default()
        };

        self.channel
            .queue_declare(queue, options, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|e| BusError::Declare {
                name: queue.to_string(),
                reason: e.to_string(),
            })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Declare {
                name: format!("{} -> {}", exchange, queue),
                reason: e.to_string(),
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> BusResult<()> {
        let mut properties = BasicProperties::default().with_headers(to_field_table(&message.headers));
        if let Some(id) = message.correlation_id {
            properties = properties
                .with_correlation_id(ShortString::from(id.clone()))
                .with_message_id(ShortString::from(id));
        }

        let publish_error = |e: lapin::Error| BusError::Publish {
            exchange: exchange.to_string(),
            reason: e.to_string(),
        };

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(publish_error)?
            .await
            .map_err(publish_error)?;

        trace!(exchange, routing_key, "Published message");
        Ok(())
    }

    async fn consume(&self, queue: &str) -> BusResult<DeliveryStream> {
        let consume_error = |e: lapin::Error| BusError::Consume {
            queue: queue.to_string(),
            reason: e.to_string(),
        };

        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(consume_error)?;
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(consume_error)?;

        let consumer_tag = format!("tunnelbus-{}", uuid::Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(consume_error)?;

        debug!(queue, consumer_tag = %consumer_tag, "Registered consumer");

        let queue_name = queue.to_string();
        let stream = consumer.map(move |result| {
            // The consumer channel lives as long as the stream
            let _channel = &channel;
            result.map(from_amqp).map_err(|e| BusError::Consume {
                queue: queue_name.clone(),
                reason: e.to_string(),
            })
        });

        Ok(Box::pin(stream))
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> BusResult<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }
}

fn from_amqp(delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    let correlation_id = properties
        .correlation_id()
        .as_ref()
        .or(properties.message_id().as_ref())
        .map(|id| id.as_str().to_string());
    let headers = properties
        .headers()
        .as_ref()
        .map(from_field_table)
        .unwrap_or_default();

    Delivery::new(
        correlation_id,
        headers,
        Bytes::from(delivery.data),
        Arc::new(AmqpAcker(delivery.acker)),
    )
}

fn to_field_table(headers: &MessageHeaders) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers.iter() {
        table.insert(
            ShortString::from(key.to_string()),
            AMQPValue::LongString(LongString::from(value.to_string())),
        );
    }
    table
}

fn from_field_table(table: &FieldTable) -> MessageHeaders {
    let mut headers = MessageHeaders::new();
    for (key, value) in table.inner() {
        match header_value_to_string(value) {
            Some(text) => headers.insert(key.as_str(), text),
            None => trace!(header = key.as_str(), "Skipping non-scalar header"),
        }
    }
    headers
}

fn header_value_to_string(value: &AMQPValue) -> Option<String> {
    let text = match value {
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        AMQPValue::ShortString(s) => s.as_str().to_string(),
        AMQPValue::Boolean(b) => b.to_string(),
        AMQPValue::ShortShortInt(i) => i.to_string(),
        AMQPValue::ShortShortUInt(i) => i.to_string(),
        AMQPValue::ShortInt(i) => i.to_string(),
        AMQPValue::ShortUInt(i) => i.to_string(),
        AMQPValue::LongInt(i) => i.to_string(),
        AMQPValue::LongUInt(i) => i.to_string(),
        AMQPValue::LongLongInt(i) => i.to_string(),
        _ => return None,
    };
    Some(text)
}
