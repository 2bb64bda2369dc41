//! The registry shared by every relay

use crate::keys::{SharePortKey, UsePortKey};
use crate::session_map::SessionMap;
use crate::tcp_session::TcpSession;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tunnelbus_proto::ExposedProject;

/// A running UsePort listener
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl ListenerHandle {
    pub fn new(local_addr: SocketAddr, cancel: CancellationToken) -> Self {
        Self { local_addr, cancel }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Token the accept loop runs under
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stop accepting new connections
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Live tunnel state, generic over the WebSocket handle type
///
/// One instance is created at startup and shared by reference between the
/// relays. Each resource type has its own [`SessionMap`].
pub struct SessionRegistry<W> {
    websockets: SessionMap<String, W>,
    listeners: SessionMap<u16, ListenerHandle>,
    use_port: SessionMap<UsePortKey, Arc<TcpSession>>,
    share_port: SessionMap<SharePortKey, Arc<TcpSession>>,
    projects: RwLock<Vec<ExposedProject>>,
}

impl<W: Clone> SessionRegistry<W> {
    pub fn new() -> Self {
        Self {
            websockets: SessionMap::new(),
            listeners: SessionMap::new(),
            use_port: SessionMap::new(),
            share_port: SessionMap::new(),
            projects: RwLock::new(Vec::new()),
        }
    }

    /// WebSocket handles by destination host
    pub fn websockets(&self) -> &SessionMap<String, W> {
        &self.websockets
    }

    /// UsePort listeners by internal port
    pub fn listeners(&self) -> &SessionMap<u16, ListenerHandle> {
        &self.listeners
    }

    /// Accepted UsePort connections by (port, connectionId)
    pub fn use_port_sessions(&self) -> &SessionMap<UsePortKey, Arc<TcpSession>> {
        &self.use_port
    }

    /// SharePort backing connections by (username, port, connectionId)
    pub fn share_port_sessions(&self) -> &SessionMap<SharePortKey, Arc<TcpSession>> {
        &self.share_port
    }

    /// Replace the cached project list
    pub fn set_projects(&self, projects: Vec<ExposedProject>) {
        debug!(count = projects.len(), "Caching exposed projects");
        match self.projects.write() {
            Ok(mut cached) => *cached = projects,
            Err(poisoned) => *poisoned.into_inner() = projects,
        }
    }

    pub fn projects(&self) -> Vec<ExposedProject> {
        match self.projects.read() {
            Ok(cached) => cached.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn use_port_projects(&self) -> Vec<ExposedProject> {
        self.projects()
            .into_iter()
            .filter(ExposedProject::is_use_port)
            .collect()
    }

    /// Stop every listener and close every TCP session
    ///
    /// Both TCP maps are drained so no session outlives the relays.
    pub async fn shutdown(&self) {
        for listener in self.listeners.values() {
            listener.stop();
        }

        let sessions: Vec<_> = self
            .use_port
            .drain()
            .into_iter()
            .chain(self.share_port.drain())
            .collect();
        debug!(count = sessions.len(), "Closing TCP sessions");

        for session in sessions {
            session.close().await;
            session.abort();
        }
    }
}

impl<W: Clone> Default for SessionRegistry<W> {
    fn default() -> Self {
        Self::new()
    }
}
