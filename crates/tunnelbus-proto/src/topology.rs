//! Broker topology shared by every tunnel peer
//!
//! These names must match the remote relay exactly.

/// Exchange carrying HTTP responses back to the relay
pub const RESPONSE_EXCHANGE: &str = "response";
/// Queue bound to [`RESPONSE_EXCHANGE`]
pub const RESPONSE_QUEUE: &str = "response_bus";
/// Binding key of [`RESPONSE_QUEUE`]
pub const RESPONSE_BINDING_KEY: &str = "";

/// Exchange carrying frames read from local WebSockets
pub const WEBSOCKET_EXCHANGE: &str = "websocket_bus";
/// Queue bound to [`WEBSOCKET_EXCHANGE`]
pub const WEBSOCKET_CLIENT_QUEUE: &str = "websocket_client_bus";
/// Binding key of [`WEBSOCKET_CLIENT_QUEUE`]
pub const WEBSOCKET_BINDING_KEY: &str = "websocket_client_bus";

/// Exchange and queue for TCP bytes read by the UsePort role
pub const TCP_REQUESTS: &str = "server_network_requests";
/// Exchange and queue for TCP bytes read by the SharePort role
pub const TCP_RESPONSES: &str = "server_network_responses";
/// Binding key of both TCP topics
pub const TCP_BINDING_KEY: &str = "";

/// Exchange and queue for control requests to the relay
pub const SERVER_BUS: &str = "server_bus";
/// Body asking the relay to push the project catalog
pub const GET_PROJECTS_COMMAND: &str = "GET_APPPROJECTS";

/// Per-user queue of tunneled HTTP requests
pub fn http_request_queue(username: &str) -> String {
    format!("{}_request_bus", username)
}

/// Per-user queue of WebSocket frames destined for local sockets
pub fn websocket_server_queue(username: &str) -> String {
    format!("{}_websocket_server_bus", username)
}

/// Per-user queue of TCP bytes destined for UsePort sockets
pub fn use_port_queue(username: &str) -> String {
    format!("{}_client_useport_network_packets", username)
}

/// Per-user queue of TCP bytes destined for SharePort backing connections
pub fn share_port_queue(username: &str) -> String {
    format!("{}_client_shareport_network_packets", username)
}

/// Per-user queue delivering the exposed project catalog
pub fn project_catalog_queue(username: &str) -> String {
    format!("{}_client_bus", username)
}
