//! Shadowsocks reference handler.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::link::TcpLink;
use super::{
    one_of, optional_param, required_param, ConnectionDetails, HandlerError, HandlerOptions,
    ProtocolHandler,
};
use crate::model::{Protocol, Server};

/// AEAD ciphers and SIP022 (2022 edition) methods.
pub const METHODS: &[&str] = &[
    "aes-128-gcm",
    "aes-256-gcm",
    "chacha20-ietf-poly1305",
    "xchacha20-ietf-poly1305",
    "2022-blake3-aes-128-gcm",
    "2022-blake3-aes-256-gcm",
    "2022-blake3-chacha20-poly1305",
];

/// SIP022 methods take a base64 PSK of a fixed length instead of a password.
fn psk_len(method: &str) -> Option<usize> {
    match method {
        "2022-blake3-aes-128-gcm" => Some(16),
        "2022-blake3-aes-256-gcm" | "2022-blake3-chacha20-poly1305" => Some(32),
        _ => None,
    }
}

fn validate(server: &Server) -> Result<(String, Option<String>), HandlerError> {
    let method = required_param(server, &["method", "cipher"])?.to_ascii_lowercase();
    one_of("method", &method, METHODS)?;
    let password = required_param(server, &["password"])?;

    if let Some(expected) = psk_len(&method) {
        // A multi-user server key is `iPSK:uPSK`; each part must decode.
        for key in password.split(':') {
            let decoded = STANDARD
                .decode(key)
                .map_err(|e| HandlerError::InvalidParam {
                    name: "password",
                    reason: format!("{method} expects a base64 key: {e}"),
                })?;
            if decoded.len() != expected {
                return Err(HandlerError::InvalidParam {
                    name: "password",
                    reason: format!(
                        "{method} expects a {expected}-byte key, got {}",
                        decoded.len()
                    ),
                });
            }
        }
    }

    Ok((method, optional_param(server, &["plugin"])))
}

pub struct ShadowsocksHandler {
    options: HandlerOptions,
    link: TcpLink,
    active: Option<Active>,
}

struct Active {
    host: String,
    port: u16,
    method: String,
    plugin: Option<String>,
}

impl ShadowsocksHandler {
    pub fn new(options: HandlerOptions) -> Self {
        Self {
            options,
            link: TcpLink::default(),
            active: None,
        }
    }
}

#[async_trait]
impl ProtocolHandler for ShadowsocksHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Shadowsocks
    }

    async fn connect(&mut self, server: &Server) -> Result<(), HandlerError> {
        let (method, plugin) = validate(server)?;
        self.link
            .open(&server.host, server.port, self.options.connect_timeout)
            .await?;
        self.active = Some(Active {
            host: server.host.clone(),
            port: server.port,
            method,
            plugin,
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
        details.insert("protocol".into(), "shadowsocks".into());
        details.insert("host".into(), active.host.clone());
        details.insert("port".into(), active.port.to_string());
        details.insert("method".into(), active.method.clone());
        if let Some(plugin) = &active.plugin {
            details.insert("plugin".into(), plugin.clone());
        }
        Ok(details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn server(port: u16) -> Server {
        Server::new("ss", "127.0.0.1", port, Protocol::Shadowsocks).with_id("ss-1")
    }

    #[test]
    fn aead_method_needs_only_a_password() {
        let s = server(1)
            .with_param("method", "AES-256-GCM")
            .with_param("password", "pw");
        assert_eq!(validate(&s).unwrap().0, "aes-256-gcm");
    }

    #[test]
    fn unsupported_method_is_rejected() {
        let s = server(1).with_param("method", "rc4-md5").with_param("password", "pw");
        assert!(matches!(
            validate(&s),
            Err(HandlerError::InvalidParam { name: "method", .. })
        ));
    }

    #[test]
    fn sip022_key_length_is_checked() {
        let short = STANDARD.encode([7u8; 16]);
        let s = server(1)
            .with_param("method", "2022-blake3-aes-256-gcm")
            .with_param("password", short.as_str());
        assert!(matches!(
            validate(&s),
            Err(HandlerError::InvalidParam { name: "password", .. })
        ));

        let ok = STANDARD.encode([7u8; 32]);
        let s = server(1)
            .with_param("method", "2022-blake3-aes-256-gcm")
            .with_param("password", ok.as_str());
        assert!(validate(&s).is_ok());
    }

    #[tokio::test]
    async fn missing_password_fails_before_io() {
        let mut handler = ShadowsocksHandler::new(HandlerOptions::default());
        let err = handler
            .connect(&server(1).with_param("method", "aes-128-gcm"))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::MissingParam("password")));
    }

    #[tokio::test]
    async fn connects_and_reports_details() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _conn = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut handler = ShadowsocksHandler::new(HandlerOptions::default());
        handler
            .connect(
                &server(port)
                    .with_param("method", "chacha20-ietf-poly1305")
                    .with_param("password", "pw"),
            )
            .await
            .unwrap();

        let details = handler.connection_details().unwrap();
        assert_eq!(details["method"], "chacha20-ietf-poly1305");
        assert_eq!(details["port"], port.to_string());
        assert_eq!(handler.data_usage(), (0, 0));

        handler.disconnect().await.unwrap();
        assert!(handler.connection_details().is_err());
    }
}
