//! WireGuard reference handler.
//!
//! Only the UDP socket towards the peer endpoint is managed here; interface
//! configuration and routing belong to the platform layer.

use std::net::SocketAddr;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::net::UdpSocket;

use super::link::TrafficCounter;
use super::{
    optional_param, required_param, ConnectionDetails, HandlerError, HandlerOptions,
    ProtocolHandler,
};
use crate::model::{Protocol, Server};

const KEY_LEN: usize = 32;

fn decode_key(name: &'static str, value: &str) -> Result<[u8; KEY_LEN], HandlerError> {
    let bytes = STANDARD
        .decode(value.trim())
        .map_err(|e| HandlerError::InvalidParam {
            name,
            reason: format!("not valid base64: {e}"),
        })?;
    <[u8; KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| HandlerError::InvalidParam {
        name,
        reason: format!("expected a {KEY_LEN}-byte key, got {}", bytes.len()),
    })
}

#[derive(Debug, Clone)]
struct WireGuardParams {
    peer_public_key: String,
    endpoint: String,
    address: Option<String>,
    keepalive: Option<u16>,
    preshared: bool,
}

impl WireGuardParams {
    fn from_server(server: &Server) -> Result<Self, HandlerError> {
        decode_key("private_key", &required_param(server, &["private_key"])?)?;
        let peer_public_key = required_param(server, &["peer_public_key", "public_key"])?;
        decode_key("peer_public_key", &peer_public_key)?;

        let preshared = match optional_param(server, &["preshared_key"]) {
            Some(psk) => {
                decode_key("preshared_key", &psk)?;
                true
            }
            None => false,
        };

        let keepalive = optional_param(server, &["persistent_keepalive", "keepalive"])
            .map(|raw| {
                raw.parse::<u16>().map_err(|e| HandlerError::InvalidParam {
                    name: "persistent_keepalive",
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        Ok(Self {
            peer_public_key,
            endpoint: optional_param(server, &["endpoint"]).unwrap_or_else(|| server.address()),
            address: optional_param(server, &["address"]),
            keepalive,
            preshared,
        })
    }
}

pub struct WireGuardHandler {
    options: HandlerOptions,
    socket: Option<UdpSocket>,
    peer: Option<SocketAddr>,
    params: Option<WireGuardParams>,
    traffic: std::sync::Arc<TrafficCounter>,
}

impl WireGuardHandler {
    pub fn new(options: HandlerOptions) -> Self {
        Self {
            options,
            socket: None,
            peer: None,
            params: None,
            traffic: Default::default(),
        }
    }

    async fn resolve(&self, endpoint: &str) -> Result<SocketAddr, HandlerError> {
        let mut addrs = tokio::time::timeout(
            self.options.connect_timeout,
            tokio::net::lookup_host(endpoint),
        )
        .await
        .map_err(|_| HandlerError::Timeout(endpoint.to_string()))??;
        addrs.next().ok_or_else(|| HandlerError::InvalidParam {
            name: "endpoint",
            reason: format!("'{endpoint}' did not resolve to any address"),
        })
    }
}

#[async_trait]
impl ProtocolHandler for WireGuardHandler {
    fn protocol(&self) -> Protocol {
        Protocol::WireGuard
    }

    async fn connect(&mut self, server: &Server) -> Result<(), HandlerError> {
        let params = WireGuardParams::from_server(server)?;
        let peer = self.resolve(&params.endpoint).await?;

        let bind: SocketAddr = if peer.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(peer).await?;

        self.traffic.reset();
        self.socket = Some(socket);
        self.peer = Some(peer);
        self.params = Some(params);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), HandlerError> {
        self.socket.take().ok_or(HandlerError::NotConnected)?;
        self.peer = None;
        self.params = None;
        Ok(())
    }

    fn data_usage(&self) -> (u64, u64) {
        self.traffic.snapshot()
    }

    fn connection_details(&self) -> Result<ConnectionDetails, HandlerError> {
        let (socket, params) = self
            .socket
            .as_ref()
            .zip(self.params.as_ref())
            .ok_or(HandlerError::NotConnected)?;

        let mut details = ConnectionDetails::new();
        details.insert("protocol".into(), "wireguard".into());
        details.insert("endpoint".into(), params.endpoint.clone());
        details.insert("peer_public_key".into(), params.peer_public_key.clone());
        details.insert("preshared_key".into(), params.preshared.to_string());
        if let Some(peer) = self.peer {
            details.insert("peer_addr".into(), peer.to_string());
        }
        if let Ok(local) = socket.local_addr() {
            details.insert("local_addr".into(), local.to_string());
        }
        if let Some(address) = &params.address {
            details.insert("address".into(), address.clone());
        }
        if let Some(keepalive) = params.keepalive {
            details.insert("persistent_keepalive".into(), keepalive.to_string());
        }
        Ok(details)
    }
}
