//! Reachability probes used by ping sweeps.

use std::io::ErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;

use crate::model::Server;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unreachable: {0}")]
    Unreachable(#[from] std::io::Error),
}

/// Measures round-trip latency to a server.
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    async fn probe(&self, server: &Server) -> Result<Duration, ProbeError>;
}

/// TCP connect time to `host:port`.
///
/// A refused or reset connection still proves the host answered, so it
/// counts as a measurement.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl LatencyProbe for TcpProbe {
    async fn probe(&self, server: &Server) -> Result<Duration, ProbeError> {
        let started = tokio::time::Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect(server.address())).await {
            Ok(Ok(_stream)) => Ok(started.elapsed()),
            Ok(Err(err)) if is_reachable_connect_error(&err) => Ok(started.elapsed()),
            Ok(Err(err)) => Err(ProbeError::Unreachable(err)),
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        }
    }
}

fn is_reachable_connect_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}

/// Whole milliseconds, never 0 so a measurement is distinguishable from
/// "unknown".
pub fn to_ping_ms(latency: Duration) -> u32 {
    u32::try_from(latency.as_millis()).unwrap_or(u32::MAX).max(1)
}
