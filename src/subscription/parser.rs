//! Share-link and feed decoding.
//!
//! Supported inputs: `vmess://`, `ss://`, `trojan://`, `http(s)://` feeds
//! (plain or base64-wrapped bodies) and bare base64 blobs of newline
//! separated links.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{RelayError, Result};
use crate::model::{Protocol, Server};

/// HTTP fetch timeout for subscription URLs.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect timeout for subscription fetch.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_USER_AGENT: &str = concat!("relayctl/", env!("CARGO_PKG_VERSION"));

/// Base64 layers decoded below the top-level input.
const MAX_NESTING: usize = 2;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: FETCH_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

fn parse_error(msg: impl Into<String>) -> RelayError {
    RelayError::Parse(msg.into())
}

/// Turns links and feeds into [`Server`] records.
///
/// Parsed servers carry a deterministic id derived from protocol, host and
/// port, so parsing an unchanged feed twice yields the same ids.
pub struct LinkParser {
    client: reqwest::Client,
}

impl LinkParser {
    /// Uses a direct (no-proxy) HTTP client: feeds must stay reachable while
    /// no tunnel is up.
    pub fn new(options: &FetchOptions) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(options.timeout)
            .connect_timeout(options.connect_timeout)
            .user_agent(options.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }

    /// Parse a single link, a feed URL or a base64 blob.
    ///
    /// Bad lines inside a batch are skipped; a top-level input that yields
    /// no server at all is an error.
    pub async fn parse(&self, input: &str) -> Result<Vec<Server>> {
        let input = input.trim();
        if input.is_empty() {
            return Err(parse_error("empty subscription input"));
        }

        let servers = if is_feed_url(input) {
            let body = self.fetch(input).await?;
            parse_batch(&unwrap_feed_body(&body), 0)
        } else if has_link_scheme(input) {
            vec![parse_link(input)?]
        } else {
            let decoded = decode_base64_text(input)
                .ok_or_else(|| parse_error("input is neither a known link nor base64 content"))?;
            parse_batch(&decoded, 1)
        };

        if servers.is_empty() {
            return Err(parse_error("no valid server links"));
        }
        Ok(servers)
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                parse_error(format!("subscription fetch timed out: {url}"))
            } else if e.is_connect() {
                parse_error(format!("failed to connect to subscription URL: {url}: {e}"))
            } else {
                parse_error(format!("subscription fetch failed: {url}: {e}"))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(parse_error(format!(
                "subscription returned HTTP {status}: {url}"
            )));
        }

        resp.text()
            .await
            .map_err(|e| parse_error(format!("failed to read subscription response body: {e}")))
    }
}

fn is_feed_url(s: &str) -> bool {
    let lower = s.get(..8).unwrap_or(s).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn has_link_scheme(s: &str) -> bool {
    s.starts_with("vmess://") || s.starts_with("ss://") || s.starts_with("trojan://")
}

/// Feeds are commonly one base64 block (possibly line-wrapped) around the
/// actual link list.
fn unwrap_feed_body(body: &str) -> String {
    match decode_base64_text(body) {
        Some(decoded) if decoded.contains("://") => decoded,
        _ => body.to_string(),
    }
}

fn parse_batch(text: &str, depth: usize) -> Vec<Server> {
    let mut servers = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if has_link_scheme(line) {
            match parse_link(line) {
                Ok(server) => servers.push(server),
                Err(e) => tracing::debug!("skipping unparseable link: {e}"),
            }
        } else if is_feed_url(line) {
            tracing::debug!("skipping nested feed URL {line}");
        } else if depth < MAX_NESTING {
            match decode_base64_text(line) {
                Some(decoded) => servers.extend(parse_batch(&decoded, depth + 1)),
                None => tracing::debug!("skipping unrecognised line"),
            }
        }
    }
    servers
}

/// Parse one `vmess://`, `ss://` or `trojan://` link.
pub fn parse_link(link: &str) -> Result<Server> {
    let link = link.trim();
    if let Some(rest) = link.strip_prefix("vmess://") {
        parse_vmess(rest)
    } else if let Some(rest) = link.strip_prefix("ss://") {
        parse_shadowsocks(rest)
    } else if let Some(rest) = link.strip_prefix("trojan://") {
        parse_trojan(rest)
    } else {
        Err(parse_error(format!(
            "unsupported link scheme: {}",
            link.split("://").next().unwrap_or(link)
        )))
    }
}

// ── VMess ───────────────────────────────────────────────────────────

/// The `vmess://` JSON payload (v2rayN share format). Unknown fields are
/// ignored.
#[derive(Debug, Deserialize)]
struct VMessShare {
    #[serde(default)]
    ps: String,
    #[serde(default)]
    add: String,
    #[serde(default)]
    port: Value,
    #[serde(default)]
    id: String,
    #[serde(default)]
    aid: Value,
    #[serde(default)]
    scy: String,
    #[serde(default)]
    net: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    tls: String,
    #[serde(default)]
    sni: String,
}

fn parse_vmess(payload: &str) -> Result<Server> {
    let json = decode_base64_text(payload)
        .ok_or_else(|| parse_error("failed to decode VMess link: invalid base64"))?;
    let share: VMessShare = serde_json::from_str(&json)
        .map_err(|e| parse_error(format!("failed to parse VMess JSON: {e}")))?;

    let port = value_to_port(&share.port)
        .ok_or_else(|| parse_error(format!("invalid VMess port: {}", share.port)))?;
    let host = non_empty(share.add, "VMess host")?;
    let name = if share.ps.trim().is_empty() {
        format!("VMess {host}:{port}")
    } else {
        share.ps.trim().to_string()
    };

    let mut params = BTreeMap::new();
    put(&mut params, "uuid", share.id);
    if let Some(aid) = value_to_u64(&share.aid) {
        params.insert("alter_id".to_string(), Value::from(aid));
    }
    put(&mut params, "security", or_default(share.scy, "auto"));
    put(&mut params, "network", or_default(share.net, "tcp"));
    params.insert("tls".to_string(), Value::Bool(share.tls == "tls"));
    put(&mut params, "sni", share.sni);
    put(&mut params, "ws_host", share.host);
    put(&mut params, "path", share.path);

    Ok(build(Protocol::VMess, name, host, port, params))
}

// ── Shadowsocks ─────────────────────────────────────────────────────

fn parse_shadowsocks(rest: &str) -> Result<Server> {
    let (body, name) = split_fragment(rest);
    let (body, query) = match body.split_once('?') {
        Some((b, q)) => (b, Some(q)),
        None => (body, None),
    };

    let (userinfo, host_port) = match body.rsplit_once('@') {
        // SIP002: base64 (or percent-encoded) userinfo, clear host:port.
        Some((userinfo, host_port)) => (
            decode_userinfo(userinfo),
            host_port.trim_end_matches('/').to_string(),
        ),
        // Legacy: the whole body is base64("method:password@host:port").
        None => {
            let decoded = decode_base64_text(body.trim_end_matches('/'))
                .ok_or_else(|| parse_error("invalid Shadowsocks link: undecodable body"))?;
            let (userinfo, host_port) = decoded
                .rsplit_once('@')
                .ok_or_else(|| parse_error("invalid Shadowsocks link format"))?;
            (userinfo.to_string(), host_port.to_string())
        }
    };

    let (method, password) = userinfo
        .split_once(':')
        .ok_or_else(|| parse_error("invalid Shadowsocks authentication format"))?;
    let (host, port) = split_host_port(&host_port)?
        .ok_or_else(|| parse_error("invalid Shadowsocks host:port format"))?;
    let name = name.unwrap_or_else(|| format!("Shadowsocks {host}:{port}"));

    let mut params = BTreeMap::new();
    put(&mut params, "method", method.to_string());
    put(&mut params, "password", password.to_string());
    if let Some(plugin) = query.and_then(|q| query_params(q).remove("plugin")) {
        put(&mut params, "plugin", plugin);
    }

    Ok(build(Protocol::Shadowsocks, name, host, port, params))
}

fn decode_userinfo(userinfo: &str) -> String {
    match decode_base64_text(userinfo) {
        Some(decoded) if decoded.contains(':') => decoded,
        _ => percent_decode(userinfo),
    }
}

// ── Trojan ──────────────────────────────────────────────────────────

fn parse_trojan(rest: &str) -> Result<Server> {
    let (body, name) = split_fragment(rest);
    let (password, remainder) = body
        .split_once('@')
        .ok_or_else(|| parse_error("invalid Trojan link: missing '@'"))?;
    let password = percent_decode(password);
    if password.is_empty() {
        return Err(parse_error("invalid Trojan link: empty password"));
    }

    // Authority ends at the first path or query delimiter.
    let end = remainder.find(['/', '?']).unwrap_or(remainder.len());
    let (authority, tail) = remainder.split_at(end);
    let query = tail.split_once('?').map(|(_, q)| q);
    let (host, port) = match split_host_last_port(authority)? {
        Some(pair) => pair,
        None => (non_empty(strip_brackets(authority).to_string(), "Trojan host")?, 443),
    };
    let name = name.unwrap_or_else(|| format!("Trojan {host}:{port}"));

    let mut params = BTreeMap::new();
    put(&mut params, "password", password);
    if let Some(query) = query {
        for (key, value) in query_params(query) {
            let key = match key.as_str() {
                "allowInsecure" => "allow_insecure".to_string(),
                _ => key,
            };
            put(&mut params, &key, value);
        }
    }

    Ok(build(Protocol::Trojan, name, host, port, params))
}

// ── Helpers ─────────────────────────────────────────────────────────

fn build(
    protocol: Protocol,
    name: String,
    host: String,
    port: u16,
    params: BTreeMap<String, Value>,
) -> Server {
    let id = Server::feed_id(&protocol, &host, port);
    let mut server = Server::new(name, host, port, protocol).with_id(id);
    server.params = params;
    server
}

/// Decode base64 in any of the common alphabets, ignoring whitespace.
fn decode_base64_text(input: &str) -> Option<String> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }
    [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(&compact).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

fn percent_decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

/// Split off `#name`, percent-decoding a non-empty name.
fn split_fragment(s: &str) -> (&str, Option<String>) {
    match s.split_once('#') {
        Some((body, frag)) => {
            let name = percent_decode(frag).trim().to_string();
            (body, (!name.is_empty()).then_some(name))
        }
        None => (s, None),
    }
}

fn strip_brackets(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}

/// `host:port` or `[v6]:port`. `Ok(None)` when there is no port at all.
fn split_host_port(s: &str) -> Result<Option<(String, u16)>> {
    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| parse_error(format!("invalid address '{s}'")))?;
        match after.strip_prefix(':') {
            Some(port) => (host, port),
            None if after.is_empty() => return Ok(None),
            None => return Err(parse_error(format!("invalid address '{s}'"))),
        }
    } else {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [_] => return Ok(None),
            [host, port] => (*host, *port),
            _ => return Err(parse_error(format!("invalid host:port '{s}'"))),
        }
    };

    checked_host_port(s, host, port).map(Some)
}

/// Like [`split_host_port`], but the port follows the last `:`, so a bare
/// IPv6 host is accepted.
fn split_host_last_port(s: &str) -> Result<Option<(String, u16)>> {
    if s.starts_with('[') {
        return split_host_port(s);
    }
    match s.rsplit_once(':') {
        Some((host, port)) => checked_host_port(s, host, port).map(Some),
        None => Ok(None),
    }
}

fn checked_host_port(s: &str, host: &str, port: &str) -> Result<(String, u16)> {
    if host.is_empty() {
        return Err(parse_error(format!("missing host in '{s}'")));
    }
    let port = port
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| parse_error(format!("invalid port '{port}'")))?;
    Ok((host.to_string(), port))
}

fn query_params(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), percent_decode(v)))
        .collect()
}

fn value_to_port(v: &Value) -> Option<u16> {
    value_to_u64(v)
        .and_then(|n| u16::try_from(n).ok())
        .filter(|p| *p != 0)
}

fn value_to_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn non_empty(s: String, what: &str) -> Result<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        Err(parse_error(format!("missing {what}")))
    } else {
        Ok(trimmed.to_string())
    }
}

fn or_default(s: String, default: &str) -> String {
    if s.trim().is_empty() {
        default.to_string()
    } else {
        s
    }
}

fn put(params: &mut BTreeMap<String, Value>, key: &str, value: String) {
    if !value.is_empty() {
        params.insert(key.to_string(), Value::String(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vmess_link(json: &str) -> String {
        format!("vmess://{}", STANDARD.encode(json))
    }

    #[test]
    fn vmess_share_link() {
        let link = vmess_link(
            r#"{"v":"2","ps":"X","add":"h","port":"443","id":"b831381d-6324-4d53-ad4f-8cda48b30811","aid":"0","net":"ws","path":"/ray","tls":"tls","extra":1}"#,
        );
        let s = parse_link(&link).unwrap();
        assert_eq!(s.name, "X");
        assert_eq!(s.host, "h");
        assert_eq!(s.port, 443);
        assert_eq!(s.protocol, Protocol::VMess);
        assert!(s.enabled);
        assert_eq!(
            s.param_str("uuid").as_deref(),
            Some("b831381d-6324-4d53-ad4f-8cda48b30811")
        );
        assert_eq!(s.param_str("network").as_deref(), Some("ws"));
        assert_eq!(s.param_str("tls").as_deref(), Some("true"));
        assert_eq!(s.id, Server::feed_id(&Protocol::VMess, "h", 443));
    }

    #[test]
    fn vmess_numeric_port_and_default_name() {
        let s = parse_link(&vmess_link(r#"{"add":"edge.example","port":8443,"id":"x"}"#)).unwrap();
        assert_eq!(s.port, 8443);
        assert_eq!(s.name, "VMess edge.example:8443");
        assert_eq!(s.param_str("security").as_deref(), Some("auto"));
    }

    #[test]
    fn vmess_rejects_garbage() {
        assert!(parse_link("vmess://%%%").is_err());
        assert!(parse_link(&vmess_link(r#"{"add":"h","port":"zero"}"#)).is_err());
        assert!(parse_link(&vmess_link(r#"{"add":"","port":1}"#)).is_err());
    }

    #[test]
    fn shadowsocks_legacy_base64() {
        let link = format!("ss://{}#Name", STANDARD.encode("aes-256-gcm:pw@h:8388"));
        let s = parse_link(&link).unwrap();
        assert_eq!(s.protocol, Protocol::Shadowsocks);
        assert_eq!(s.param_str("method").as_deref(), Some("aes-256-gcm"));
        assert_eq!(s.param_str("password").as_deref(), Some("pw"));
        assert_eq!(s.host, "h");
        assert_eq!(s.port, 8388);
        assert_eq!(s.name, "Name");
    }

    #[test]
    fn shadowsocks_sip002_with_plugin_and_encoded_name() {
        let userinfo = URL_SAFE_NO_PAD.encode("chacha20-ietf-poly1305:p@ss");
        let link = format!(
            "ss://{userinfo}@198.51.100.7:8389/?plugin=obfs-local%3Bobfs%3Dhttp#My%20Node"
        );
        let s = parse_link(&link).unwrap();
        assert_eq!(s.host, "198.51.100.7");
        assert_eq!(s.port, 8389);
        assert_eq!(s.name, "My Node");
        assert_eq!(s.param_str("password").as_deref(), Some("p@ss"));
        assert_eq!(
            s.param_str("plugin").as_deref(),
            Some("obfs-local;obfs=http")
        );
    }

    #[test]
    fn shadowsocks_default_name_and_bad_addresses() {
        let s = parse_link(&format!("ss://{}", STANDARD.encode("aes-128-gcm:pw@h:1"))).unwrap();
        assert_eq!(s.name, "Shadowsocks h:1");

        let bad_split = format!("ss://{}", STANDARD.encode("aes-128-gcm:pw@h:1:2"));
        assert!(parse_link(&bad_split).is_err());
        let bad_port = format!("ss://{}", STANDARD.encode("aes-128-gcm:pw@h:port"));
        assert!(parse_link(&bad_port).is_err());
        let no_port = format!("ss://{}", STANDARD.encode("aes-128-gcm:pw@h"));
        assert!(parse_link(&no_port).is_err());
    }

    #[test]
    fn trojan_link_with_query_and_fragment() {
        let s = parse_link("trojan://s3cr%40t@t.example.com:8443?sni=cdn.example&allowInsecure=1#T%201")
            .unwrap();
        assert_eq!(s.protocol, Protocol::Trojan);
        assert_eq!(s.param_str("password").as_deref(), Some("s3cr@t"));
        assert_eq!(s.host, "t.example.com");
        assert_eq!(s.port, 8443);
        assert_eq!(s.name, "T 1");
        assert_eq!(s.param_str("sni").as_deref(), Some("cdn.example"));
        assert_eq!(s.param_str("allow_insecure").as_deref(), Some("1"));
    }

    #[test]
    fn trojan_defaults_port_and_handles_ipv6() {
        let s = parse_link("trojan://pw@t.example.com").unwrap();
        assert_eq!(s.port, 443);
        assert_eq!(s.name, "Trojan t.example.com:443");

        let v6 = parse_link("trojan://pw@[2001:db8::1]:443").unwrap();
        assert_eq!(v6.host, "2001:db8::1");

        assert!(parse_link("trojan://@h:443").is_err());
        assert!(parse_link("trojan://no-at-sign").is_err());
    }

    #[test]
    fn entries_behind_one_front_share_an_id() {
        let a = parse_link("trojan://first@cdn.example.com:443?sni=a.example#A").unwrap();
        let b = parse_link("trojan://second@cdn.example.com:443?sni=b.example#B").unwrap();
        assert_eq!(a.id, b.id);
        assert_ne!(a.param_str("password"), b.param_str("password"));
    }

    #[test]
    fn trojan_path_after_port_and_bare_ipv6() {
        let ws = parse_link("trojan://pw@t.example.com:443/ws?type=ws#N").unwrap();
        assert_eq!(ws.host, "t.example.com");
        assert_eq!(ws.port, 443);
        assert_eq!(ws.name, "N");
        assert_eq!(ws.param_str("type").as_deref(), Some("ws"));

        let bare = parse_link("trojan://pw@2001:db8::1:443#N").unwrap();
        assert_eq!(bare.host, "2001:db8::1");
        assert_eq!(bare.port, 443);

        let slash = parse_link("trojan://pw@t.example.com:8443/").unwrap();
        assert_eq!(slash.port, 8443);
        assert!(parse_link("trojan://pw@t.example.com:ws/x").is_err());
    }

    #[test]
    fn batch_skips_bad_and_nested_feed_lines() {
        let body = [
            format!("ss://{}#A", STANDARD.encode("aes-128-gcm:pw@a.example:1")),
            "ss://not-valid".to_string(),
            "https://example.com/nested".to_string(),
            String::new(),
            "trojan://pw@b.example:2#B".to_string(),
        ]
        .join("\n");
        let servers = parse_batch(&body, 0);
        let names: Vec<_> = servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn nested_base64_is_bounded() {
        let deep = STANDARD.encode("trojan://pw@deep.example:1#deep");
        let text = format!("{deep}\ntrojan://pw@mid.example:1#mid");
        let names: Vec<_> = parse_batch(&text, 1).into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["deep", "mid"]);

        let deeper = STANDARD.encode(&deep);
        let text = format!("{deeper}\ntrojan://pw@mid.example:1#mid");
        let names: Vec<_> = parse_batch(&text, 1).into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["mid"]);
    }

    #[tokio::test]
    async fn top_level_base64_without_links_is_an_error() {
        let parser = LinkParser::new(&FetchOptions::default()).unwrap();
        let blob = STANDARD.encode("nothing useful here\nstill nothing");
        assert!(matches!(parser.parse(&blob).await, Err(RelayError::Parse(_))));
        assert!(matches!(parser.parse("   ").await, Err(RelayError::Parse(_))));

        let blob = STANDARD.encode("trojan://pw@a.example:1\nbogus");
        assert_eq!(parser.parse(&blob).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn single_link_errors_surface_their_cause() {
        let parser = LinkParser::new(&FetchOptions::default()).unwrap();
        let err = parser.parse("trojan://@h:1").await.unwrap_err();
        assert!(err.to_string().contains("empty password"));
    }

    #[test]
    fn reparsing_yields_stable_ids() {
        let link = "trojan://pw@stable.example:443#S";
        assert_eq!(parse_link(link).unwrap().id, parse_link(link).unwrap().id);
    }
}
