//! Session registry
//!
//! The only shared mutable state of the agent. It maps typed keys to live
//! resources: WebSocket handles by host, TCP listeners by port, and accepted or
//! outbound TCP sessions by connection tuple, plus the cached project list.
//!
//! Every map is a [`SessionMap`], whose [`SessionMap::get_or_try_create`] lets
//! concurrent first users of a key agree on a single resource.

pub mod keys;
pub mod registry;
pub mod session_map;
pub mod tcp_session;

pub use keys::{SharePortKey, UsePortKey};
pub use registry::{ListenerHandle, SessionRegistry};
pub use session_map::SessionMap;
pub use tcp_session::TcpSession;
