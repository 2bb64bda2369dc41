//! Bus errors

use thiserror::Error;

/// Errors raised by the message bus
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Broker connection failed: {0}")]
    Connect(String),

    #[error("Broker unreachable after {attempts} attempts: {last_error}")]
    ConnectRetriesExhausted { attempts: usize, last_error: String },

    #[error("Declaration failed for {name}: {reason}")]
    Declare { name: String, reason: String },

    #[error("Publish to exchange '{exchange}' failed: {reason}")]
    Publish { exchange: String, reason: String },

    #[error("Consume from queue '{queue}' failed: {reason}")]
    Consume { queue: String, reason: String },

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Unknown exchange: {0}")]
    UnknownExchange(String),

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Queue already has a consumer: {0}")]
    QueueAlreadyConsumed(String),
}

pub type BusResult<T> = Result<T, BusError>;
