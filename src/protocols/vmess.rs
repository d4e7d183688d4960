//! VMess reference handler.

use async_trait::async_trait;
use uuid::Uuid;

use super::link::TcpLink;
use super::{
    one_of, optional_param, required_param, ConnectionDetails, HandlerError, HandlerOptions,
    ProtocolHandler,
};
use crate::model::{Protocol, Server};

const SECURITIES: &[&str] = &["auto", "aes-128-gcm", "chacha20-poly1305", "none", "zero"];
const NETWORKS: &[&str] = &["tcp", "ws", "h2", "grpc", "kcp", "quic", "httpupgrade"];

/// Validated VMess parameters.
#[derive(Debug, Clone, PartialEq)]
struct VMessParams {
    user_id: Uuid,
    alter_id: u16,
    security: String,
    network: String,
    tls: bool,
}

impl VMessParams {
    fn from_server(server: &Server) -> Result<Self, HandlerError> {
        let raw_id = required_param(server, &["uuid", "id", "user_id"])?;
        let user_id = Uuid::parse_str(&raw_id).map_err(|e| HandlerError::InvalidParam {
            name: "uuid",
            reason: e.to_string(),
        })?;

        let alter_id = match optional_param(server, &["alter_id", "aid"]) {
            Some(raw) => raw.parse::<u16>().map_err(|e| HandlerError::InvalidParam {
                name: "alter_id",
                reason: e.to_string(),
            })?,
            None => 0,
        };

        let security = optional_param(server, &["security", "scy"])
            .unwrap_or_else(|| "auto".to_string())
            .to_ascii_lowercase();
        one_of("security", &security, SECURITIES)?;

        let network = optional_param(server, &["network", "net"])
            .unwrap_or_else(|| "tcp".to_string())
            .to_ascii_lowercase();
        one_of("network", &network, NETWORKS)?;

        let tls = matches!(
            optional_param(server, &["tls"]).as_deref(),
            Some("tls" | "true" | "1")
        );

        Ok(Self {
            user_id,
            alter_id,
            security,
            network,
            tls,
        })
    }
}

pub struct VMessHandler {
    options: HandlerOptions,
    link: TcpLink,
    active: Option<(Server, VMessParams)>,
}

impl VMessHandler {
    pub fn new(options: HandlerOptions) -> Self {
        Self {
            options,
            link: TcpLink::default(),
            active: None,
        }
    }
}

#[async_trait]
impl ProtocolHandler for VMessHandler {
    fn protocol(&self) -> Protocol {
        Protocol::VMess
    }

    async fn connect(&mut self, server: &Server) -> Result<(), HandlerError> {
        let params = VMessParams::from_server(server)?;
        self.link
            .open(&server.host, server.port, self.options.connect_timeout)
            .await?;
        tracing::debug!(
            server_id = %server.id,
            network = %params.network,
            tls = params.tls,
            "vmess transport up"
        );
        self.active = Some((server.clone(), params));
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
        let (server, params) = self.active.as_ref().ok_or(HandlerError::NotConnected)?;
        let mut details = self.link.details()?;
        details.insert("protocol".into(), "vmess".into());
        details.insert("host".into(), server.host.clone());
        details.insert("port".into(), server.port.to_string());
        details.insert("user_id".into(), params.user_id.to_string());
        details.insert("alter_id".into(), params.alter_id.to_string());
        details.insert("security".into(), params.security.clone());
        details.insert("network".into(), params.network.clone());
        details.insert("tls".into(), params.tls.to_string());
        Ok(details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    fn server() -> Server {
        Server::new("vm", "127.0.0.1", 1, Protocol::VMess).with_id("vm-1")
    }

    #[test]
    fn params_accept_share_link_field_names() {
        let s = server()
            .with_param("id", ID)
            .with_param("aid", "4")
            .with_param("net", "WS")
            .with_param("tls", "tls");
        let p = VMessParams::from_server(&s).unwrap();
        assert_eq!(p.user_id.to_string(), ID);
        assert_eq!(p.alter_id, 4);
        assert_eq!(p.network, "ws");
        assert_eq!(p.security, "auto");
        assert!(p.tls);
    }

    #[tokio::test]
    async fn missing_uuid_fails_before_io() {
        let mut handler = VMessHandler::new(HandlerOptions::default());
        let err = handler.connect(&server()).await.unwrap_err();
        assert!(matches!(err, HandlerError::MissingParam("uuid")));
        assert!(matches!(
            handler.connection_details(),
            Err(HandlerError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn malformed_uuid_is_invalid() {
        let mut handler = VMessHandler::new(HandlerOptions::default());
        let err = handler
            .connect(&server().with_param("uuid", "not-a-uuid"))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidParam { name: "uuid", .. }));
    }

    #[test]
    fn unknown_network_is_rejected() {
        let s = server().with_param("uuid", ID).with_param("network", "carrier-pigeon");
        assert!(matches!(
            VMessParams::from_server(&s),
            Err(HandlerError::InvalidParam { name: "network", .. })
        ));
    }
}
