//! Trojan reference handler.

use async_trait::async_trait;

use super::link::TcpLink;
use super::{
    optional_param, required_param, ConnectionDetails, HandlerError, HandlerOptions,
    ProtocolHandler,
};
use crate::model::{Protocol, Server};

pub struct TrojanHandler {
    options: HandlerOptions,
    link: TcpLink,
    active: Option<Active>,
}

struct Active {
    host: String,
    port: u16,
    sni: String,
    allow_insecure: bool,
}

impl TrojanHandler {
    pub fn new(options: HandlerOptions) -> Self {
        Self {
            options,
            link: TcpLink::default(),
            active: None,
        }
    }
}

#[async_trait]
impl ProtocolHandler for TrojanHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Trojan
    }

    async fn connect(&mut self, server: &Server) -> Result<(), HandlerError> {
        required_param(server, &["password"])?;
        // SNI falls back to the server host, as trojan clients do.
        let sni = optional_param(server, &["sni", "peer"]).unwrap_or_else(|| server.host.clone());
        let allow_insecure = matches!(
            optional_param(server, &["allow_insecure", "allowInsecure"]).as_deref(),
            Some("1" | "true")
        );

        self.link
            .open(&server.host, server.port, self.options.connect_timeout)
            .await?;
        if allow_insecure {
            tracing::warn!(server_id = %server.id, "trojan certificate verification disabled");
        }
        self.active = Some(Active {
            host: server.host.clone(),
            port: server.port,
            sni,
            allow_insecure,
        });
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), HandlerError> {
        self.link.close().await?;
        self.active = None;
        Ok(())
    }

    fn data_usage(&self) -> (u64, u64) {
        self.link.traffic().snapshot()
    }

    fn connection_details(&self) -> Result<ConnectionDetails, HandlerError> {
        let active = self.active.as_ref().ok_or(HandlerError::NotConnected)?;
        let mut details = self.link.details()?;
        details.insert("protocol".into(), "trojan".into());
        details.insert("host".into(), active.host.clone());
        details.insert("port".into(), active.port.to_string());
        details.insert("sni".into(), active.sni.clone());
        details.insert("allow_insecure".into(), active.allow_insecure.to_string());
        Ok(details)
    }
}
