//! Tunnel Bus Protocol Definitions
//!
//! This crate defines the wire models carried in broker message bodies, the
//! header names used for out-of-band routing metadata, and the broker topology
//! names every peer must agree on.

pub mod headers;
pub mod models;
pub mod topology;

mod base64_bytes;
mod lenient_datetime;

pub use models::*;

/// Decode a JSON message body into one of the wire models
pub fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(body)
}

/// Encode one of the wire models into a JSON message body
pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}
