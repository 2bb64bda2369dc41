//! A tunneled TCP socket and its forwarder task

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

/// One local TCP socket carried over the bus
///
/// The read half is handed to the forwarder task exactly once; the write half
/// stays here so bus consumers can write packets in arrival order.
pub struct TcpSession {
    peer_addr: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    reader: Mutex<Option<OwnedReadHalf>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    open: AtomicBool,
}

impl TcpSession {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            peer_addr,
            writer: tokio::sync::Mutex::new(writer),
            reader: Mutex::new(Some(reader)),
            forwarder: Mutex::new(None),
            open: AtomicBool::new(true),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Write a whole packet to the socket
    ///
    /// A failed write marks the session disconnected.
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        if !self.is_connected() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "session closed",
            ));
        }

        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(data).await?;
            writer.flush().await
        }
        .await;

        if result.is_err() {
            self.open.store(false, Ordering::SeqCst);
        }
        result
    }

    /// Take the read half for the forwarder; `None` after the first call
    pub fn take_reader(&self) -> Option<OwnedReadHalf> {
        self.reader.lock().ok().and_then(|mut reader| reader.take())
    }

    pub fn attach_forwarder(&self, handle: JoinHandle<()>) {
        if let Ok(mut forwarder) = self.forwarder.lock() {
            *forwarder = Some(handle);
        }
    }

    /// Mark the session closed and shut down the write side
    pub async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!(peer = %self.peer_addr, "Shutdown after close failed: {}", e);
            }
        }
    }

    /// Mark the session closed and stop its forwarder
    ///
    /// Must not be called from the forwarder itself.
    pub fn abort(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(handle) = self.forwarder.lock().ok().and_then(|mut f| f.take()) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpSession, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (TcpSession::new(client).unwrap(), server)
    }

    #[tokio::test]
    async fn test_write_reaches_peer() {
        let (session, mut peer) = connected_pair().await;

        session.write(b"PING").await.unwrap();

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");
    }

    #[tokio::test]
    async fn test_reader_taken_once() {
        let (session, _peer) = connected_pair().await;

        assert!(session.take_reader().is_some());
        assert!(session.take_reader().is_none());
    }

    #[tokio::test]
    async fn test_close_rejects_writes_and_signals_eof() {
        let (session, mut peer) = connected_pair().await;

        session.close().await;
        assert!(!session.is_connected());
        assert!(session.write(b"late").await.is_err());

        let mut buf = Vec::new();
        let n = peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_abort_stops_forwarder() {
        let (session, _peer) = connected_pair().await;
        let handle = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        });
        let watch = handle.abort_handle();

        session.attach_forwarder(handle);
        session.abort();

        tokio::task::yield_now().await;
        assert!(!session.is_connected());
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(watch.is_finished());
    }
}
