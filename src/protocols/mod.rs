//! Protocol handler contract and the name → factory registry.
//!
//! Every tunneling protocol plugs in behind [`ProtocolHandler`]. The
//! orchestrator never knows which protocol it drives: it asks the
//! [`ProtocolRegistry`] for a fresh handler per connection attempt.

mod link;
pub mod shadowsocks;
pub mod trojan;
pub mod vmess;
pub mod wireguard;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use crate::model::{Protocol, Server};

pub use link::TrafficCounter;
pub use shadowsocks::ShadowsocksHandler;
pub use trojan::TrojanHandler;
pub use vmess::VMessHandler;
pub use wireguard::WireGuardHandler;

/// Default time a reference handler waits for its transport to come up.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("missing required parameter '{0}'")]
    MissingParam(&'static str),

    #[error("invalid parameter '{name}': {reason}")]
    InvalidParam { name: &'static str, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection to {0} timed out")]
    Timeout(String),

    #[error("not connected")]
    NotConnected,

    #[error("{0}")]
    Other(String),
}

/// Connection metadata reported by a live handler.
pub type ConnectionDetails = BTreeMap<String, String>;

/// Capability every protocol implementation satisfies.
///
/// `connect` validates the protocol's own parameters from the server's
/// parameter bag before any I/O and fails with a descriptive error instead
/// of attempting a partial connection. `disconnect` is only called while the
/// handler holds a tunnel. Handlers are not reused across connect cycles.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    fn protocol(&self) -> Protocol;

    async fn connect(&mut self, server: &Server) -> Result<(), HandlerError>;

    async fn disconnect(&mut self) -> Result<(), HandlerError>;

    /// `(bytes_sent, bytes_received)`, non-decreasing since the last connect.
    fn data_usage(&self) -> (u64, u64);

    /// Diagnostic metadata. Fails when not connected.
    fn connection_details(&self) -> Result<ConnectionDetails, HandlerError>;
}

/// Produces a fresh handler for one connection attempt.
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn ProtocolHandler> + Send + Sync>;

/// Options handed to the built-in handlers.
#[derive(Debug, Clone, Copy)]
pub struct HandlerOptions {
    pub connect_timeout: Duration,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Maps protocol names to handler factories.
///
/// Adding a protocol means registering a factory here; neither the
/// orchestrator nor the server registry needs to change.
#[derive(Default)]
pub struct ProtocolRegistry {
    factories: RwLock<HashMap<String, HandlerFactory>>,
}

impl ProtocolRegistry {
    /// An empty registry with no protocols.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in handlers.
    pub fn with_defaults(options: HandlerOptions) -> Self {
        let registry = Self::new();
        registry.register(
            Protocol::WireGuard,
            Arc::new(move || Box::new(WireGuardHandler::new(options)) as Box<dyn ProtocolHandler>),
        );
        registry.register(
            Protocol::VMess,
            Arc::new(move || Box::new(VMessHandler::new(options)) as Box<dyn ProtocolHandler>),
        );
        registry.register(
            Protocol::Shadowsocks,
            Arc::new(move || Box::new(ShadowsocksHandler::new(options)) as Box<dyn ProtocolHandler>),
        );
        registry.register(
            Protocol::Trojan,
            Arc::new(move || Box::new(TrojanHandler::new(options)) as Box<dyn ProtocolHandler>),
        );
        registry
    }

    /// Register (or replace) the factory for `protocol`.
    pub fn register(&self, protocol: Protocol, factory: HandlerFactory) {
        tracing::debug!(protocol = %protocol, "registering protocol handler");
        self.factories
            .write()
            .insert(protocol.as_str().to_string(), factory);
    }

    pub fn is_registered(&self, protocol: &Protocol) -> bool {
        self.factories.read().contains_key(protocol.as_str())
    }

    /// A fresh handler for `protocol`, or `None` if nothing is registered.
    pub fn create(&self, protocol: &Protocol) -> Option<Box<dyn ProtocolHandler>> {
        let factory = self.factories.read().get(protocol.as_str()).cloned()?;
        Some(factory())
    }

    /// Registered protocol names, sorted.
    pub fn protocols(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }
}

// ── Parameter helpers shared by the built-in handlers ───────────────

pub(crate) fn required_param(
    server: &Server,
    keys: &[&'static str],
) -> Result<String, HandlerError> {
    keys.iter()
        .find_map(|key| server.param_str(key))
        .ok_or(HandlerError::MissingParam(keys[0]))
}

pub(crate) fn optional_param(server: &Server, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| server.param_str(key))
}

pub(crate) fn one_of(
    name: &'static str,
    value: &str,
    allowed: &[&str],
) -> Result<(), HandlerError> {
    if allowed.iter().any(|a| a.eq_ignore_ascii_case(value)) {
        Ok(())
    } else {
        Err(HandlerError::InvalidParam {
            name,
            reason: format!("'{value}' is not one of {}", allowed.join(", ")),
        })
    }
}
