//! Message header names
//!
//! Routing metadata travels in the broker header table, never in the body.

/// Absolute URI of the local target (e.g. `https://localhost:9443`)
pub const INTERNAL_TARGET_URI: &str = "internal-target-uri";

/// Public hostname being tunneled
pub const DESTINATION_HOST: &str = "destination-host";

/// Username owning a tunneled TCP connection
pub const USERNAME: &str = "username";

/// Internal port of a tunneled TCP connection (decimal string)
pub const PORT: &str = "port";

/// Opaque identifier of one accepted TCP connection
pub const CONNECTION_ID: &str = "connectionId";

/// Optional backing port override for the SharePort role
pub const SHARED_PORT: &str = "shared-port";
