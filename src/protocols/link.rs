//! Transport plumbing shared by the TCP-based reference handlers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use super::{ConnectionDetails, HandlerError};

/// Byte counters for a live tunnel.
///
/// Shared with whatever pumps traffic through the tunnel; the handler only
/// reads it back through `data_usage`.
#[derive(Debug, Default)]
pub struct TrafficCounter {
    sent: AtomicU64,
    received: AtomicU64,
}

impl TrafficCounter {
    pub fn add_sent(&self, bytes: u64) {
        self.sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_received(&self, bytes: u64) {
        self.received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.sent.load(Ordering::Relaxed),
            self.received.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn reset(&self) {
        self.sent.store(0, Ordering::Relaxed);
        self.received.store(0, Ordering::Relaxed);
    }
}

/// A TCP connection to the relay's ingress, plus its counters.
#[derive(Default)]
pub(crate) struct TcpLink {
    stream: Option<TcpStream>,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    traffic: Arc<TrafficCounter>,
}

impl TcpLink {
    pub(crate) async fn open(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(), HandlerError> {
        let target = format!("{host}:{port}");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| HandlerError::Timeout(target.clone()))??;
        stream.set_nodelay(true)?;

        self.local = stream.local_addr().ok();
        self.peer = stream.peer_addr().ok();
        self.stream = Some(stream);
        self.traffic.reset();
        Ok(())
    }

    pub(crate) async fn close(&mut self) -> Result<(), HandlerError> {
        let mut stream = self.stream.take().ok_or(HandlerError::NotConnected)?;
        self.local = None;
        self.peer = None;
        stream.shutdown().await?;
        Ok(())
    }

    pub(crate) fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub(crate) fn traffic(&self) -> &Arc<TrafficCounter> {
        &self.traffic
    }

    /// Base metadata: endpoint addresses of the live socket.
    pub(crate) fn details(&self) -> Result<ConnectionDetails, HandlerError> {
        if !self.is_open() {
            return Err(HandlerError::NotConnected);
        }
        let mut details = ConnectionDetails::new();
        if let Some(local) = self.local {
            details.insert("local_addr".into(), local.to_string());
        }
        if let Some(peer) = self.peer {
            details.insert("peer_addr".into(), peer.to_string());
        }
        Ok(details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn open_and_close_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let mut link = TcpLink::default();
        link.open("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(link.is_open());
        let details = link.details().unwrap();
        assert_eq!(details["peer_addr"], format!("127.0.0.1:{port}"));

        link.traffic().add_sent(10);
        link.traffic().add_received(4);
        assert_eq!(link.traffic().snapshot(), (10, 4));

        link.close().await.unwrap();
        assert!(!link.is_open());
        assert!(matches!(link.details(), Err(HandlerError::NotConnected)));
        assert!(matches!(link.close().await, Err(HandlerError::NotConnected)));
    }

    #[tokio::test]
    async fn refused_connection_is_an_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut link = TcpLink::default();
        let err = link
            .open("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Io(_)));
        assert!(!link.is_open());
    }
}
