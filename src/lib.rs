//! relayctl: relay endpoint catalog, subscription importer and a
//! single-tunnel connection orchestrator.
//!
//! [`client::RelayClient`] wires the pieces together; each module can also
//! be used on its own.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod latency;
pub mod model;
pub mod orchestrator;
pub mod protocols;
pub mod registry;
pub mod store;
pub mod subscription;

pub use client::RelayClient;
pub use config::Config;
pub use error::{ErrorKind, RelayError, Result};
pub use model::{ConnectionInfo, ConnectionState, ConnectionStats, Protocol, Server, Subscription};
pub use orchestrator::ConnectionOrchestrator;
pub use registry::ServerRegistry;
