//! Canonical records: servers, subscriptions and connection state.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol-specific parameter bag. Only the matching handler interprets it.
pub type Params = BTreeMap<String, serde_json::Value>;

/// Tunnel protocol of a server.
///
/// Known protocols get their own variant; anything else is carried verbatim
/// so a handler registered later can claim it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Protocol {
    WireGuard,
    VMess,
    Shadowsocks,
    Trojan,
    Other(String),
}

impl Protocol {
    pub fn as_str(&self) -> &str {
        match self {
            Self::WireGuard => "wireguard",
            Self::VMess => "vmess",
            Self::Shadowsocks => "shadowsocks",
            Self::Trojan => "trojan",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Protocol {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "wireguard" | "wg" => Self::WireGuard,
            "vmess" => Self::VMess,
            "shadowsocks" | "ss" => Self::Shadowsocks,
            "trojan" => Self::Trojan,
            _ => Self::Other(s.trim().to_string()),
        }
    }
}

impl From<String> for Protocol {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<Protocol> for String {
    fn from(p: Protocol) -> Self {
        p.as_str().to_string()
    }
}

fn default_enabled() -> bool {
    true
}

/// A configured remote tunnel endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub params: Params,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Last measured latency in milliseconds, 0 = unknown.
    #[serde(default)]
    pub ping: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Server {
    /// A new enabled server with no id. The registry assigns one on `add`
    /// when it is left empty.
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        protocol: Protocol,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            name: name.into(),
            host: host.into(),
            port,
            protocol,
            params: Params::new(),
            enabled: true,
            ping: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// String view of a parameter. Numbers and booleans are rendered.
    pub fn param_str(&self, key: &str) -> Option<String> {
        match self.params.get(key)? {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Stable id for an endpoint imported from a feed.
    ///
    /// Derived from `protocol://host:port` so that re-parsing an unchanged
    /// feed yields the same ids and refreshes update entries in place.
    /// Entries sharing protocol, host and port (e.g. behind one CDN front)
    /// collapse into one id even when their credentials or paths differ.
    pub fn feed_id(protocol: &Protocol, host: &str, port: u16) -> String {
        let key = format!("{protocol}://{}:{port}", host.to_ascii_lowercase());
        Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A remote feed that yields a batch of servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub url: String,
    /// Servers produced by the last successful parse.
    #[serde(default)]
    pub server_count: usize,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default = "default_enabled")]
    pub auto_update: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: String::new(),
            url: url.into(),
            server_count: 0,
            last_update: None,
            auto_update: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Process-wide connection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl ConnectionState {
    /// Numeric status code reported alongside the state name.
    pub fn code(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Disconnecting => 3,
            Self::Error => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single logical "current connection".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub server_id: String,
    pub server_name: String,
    pub started_at: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl ConnectionInfo {
    pub fn for_server(server: &Server) -> Self {
        Self {
            server_id: server.id.clone(),
            server_name: server.name.clone(),
            started_at: Utc::now(),
            bytes_sent: 0,
            bytes_received: 0,
        }
    }
}

/// Snapshot answered to a stats query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub uptime_secs: u64,
    pub server_id: Option<String>,
}
