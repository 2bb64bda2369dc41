//! Reading routing metadata off a delivery

use crate::error::{RelayError, RelayResult};
use tunnelbus_bus::MessageHeaders;
use url::Url;

/// Value of a header that must be present
pub fn require<'a>(headers: &'a MessageHeaders, name: &'static str) -> RelayResult<&'a str> {
    headers.get(name).ok_or(RelayError::MissingHeader(name))
}

/// A required header holding a decimal port
pub fn require_port(headers: &MessageHeaders, name: &'static str) -> RelayResult<u16> {
    parse_port(name, require(headers, name)?)
}

pub fn parse_port(name: &'static str, value: &str) -> RelayResult<u16> {
    value
        .trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| RelayError::InvalidHeader {
            name,
            reason: format!("'{}' is not a port: {}", value, e),
        })
}

/// Parse an absolute URI
pub fn parse_uri(value: &str) -> RelayResult<Url> {
    Url::parse(value).map_err(|e| RelayError::InvalidUri {
        uri: value.to_string(),
        reason: e.to_string(),
    })
}
