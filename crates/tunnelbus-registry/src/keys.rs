//! Composite keys of TCP sessions

use std::fmt;

/// A local connection accepted by a UsePort listener
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsePortKey {
    pub port: u16,
    pub connection_id: String,
}

impl UsePortKey {
    pub fn new(port: u16, connection_id: impl Into<String>) -> Self {
        Self {
            port,
            connection_id: connection_id.into(),
        }
    }
}

impl fmt::Display for UsePortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.connection_id)
    }
}

/// A backing connection opened on behalf of a remote UsePort connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SharePortKey {
    pub username: String,
    pub port: u16,
    pub connection_id: String,
}

impl SharePortKey {
    pub fn new(username: impl Into<String>, port: u16, connection_id: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            port,
            connection_id: connection_id.into(),
        }
    }
}

impl fmt::Display for SharePortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.username, self.port, self.connection_id)
    }
}
