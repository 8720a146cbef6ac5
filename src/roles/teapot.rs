//! The teapot handshake: a text exchange shaped like an HTTP request, negotiating protocol
//!  version, connection features, identity and per-connection settings before the binary
//!  protocol starts.
//!
//! ```ascii
//! CONNECT /teapot HTTP/1.1
//! CelesteNet-TeapotVersion: 1
//! CelesteNet-ConnectionFeatures: extendedHandshake,someOtherFeature
//! CelesteNet-PlayerNameKey: Madeline
//! ```
//!
//! The server answers with `418` on success, or with an error status and a plain text reason.

use std::net::IpAddr;
use std::time::SystemTime;

use anyhow::{anyhow, bail};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::RelayConfig;
use crate::connection::dual::ConnectionSettings;
use crate::identity::{origin_uid, sanitize_name, IdentityStore, NAME_KEY_MARKER};


pub const TEAPOT_PATH: &str = "/teapot";
pub const HEADER_VERSION: &str = "CelesteNet-TeapotVersion";
pub const HEADER_FEATURES: &str = "CelesteNet-ConnectionFeatures";
pub const HEADER_NAME_KEY: &str = "CelesteNet-PlayerNameKey";
pub const HEADER_MAX_DATAGRAM_SIZE: &str = "CelesteNet-MaxDatagramSize";
pub const HEADER_TOKEN: &str = "CelesteNet-ConnectionToken";
pub const HEADER_SETTINGS: &str = "CelesteNet-ConnectionSettings";

/// upper bound for the request head, terminator included
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

/// clients cannot negotiate datagrams smaller than this
pub const MIN_DATAGRAM_SIZE: usize = 64;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";


#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum TeapotStatus {
    BadRequest = 400,
    Forbidden = 403,
    Conflict = 409,
    ImATeapot = 418,
    InternalServerError = 500,
}

impl TeapotStatus {
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            TeapotStatus::BadRequest => "Bad Request",
            TeapotStatus::Forbidden => "Forbidden",
            TeapotStatus::Conflict => "Conflict",
            TeapotStatus::ImATeapot => "I'm a teapot",
            TeapotStatus::InternalServerError => "Internal Server Error",
        }
    }
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeapotRequest {
    /// `None` if the header is missing or not a number
    pub version: Option<u32>,
    pub features: Vec<String>,
    pub name_key: String,
    pub max_datagram_size: Option<usize>,
}

impl TeapotRequest {
    pub fn parse(head: &str) -> anyhow::Result<TeapotRequest> {
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split(' ');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("CONNECT"), Some(TEAPOT_PATH), Some(http), None) if http.starts_with("HTTP/1.") => {}
            _ => bail!("not a teapot request: {:?}", request_line),
        }

        let headers = parse_headers(lines)?;
        let max_datagram_size = match header(&headers, HEADER_MAX_DATAGRAM_SIZE) {
            None => None,
            Some(value) => Some(value.parse::<usize>()
                .map_err(|_| anyhow!("invalid {} header: {:?}", HEADER_MAX_DATAGRAM_SIZE, value))?),
        };

        Ok(TeapotRequest {
            version: header(&headers, HEADER_VERSION).and_then(|v| v.parse().ok()),
            features: header(&headers, HEADER_FEATURES)
                .map(|v| v.split(',')
                    .map(|f| f.trim())
                    .filter(|f| !f.is_empty())
                    .map(|f| f.to_string())
                    .collect())
                .unwrap_or_default(),
            name_key: header(&headers, HEADER_NAME_KEY).unwrap_or_default().to_string(),
            max_datagram_size,
        })
    }

    /// the request as a client sends it
    pub fn format(&self) -> String {
        let mut result = format!("CONNECT {} HTTP/1.1\r\n", TEAPOT_PATH);
        if let Some(version) = self.version {
            result.push_str(&format!("{}: {}\r\n", HEADER_VERSION, version));
        }
        result.push_str(&format!("{}: {}\r\n", HEADER_FEATURES, self.features.join(",")));
        result.push_str(&format!("{}: {}\r\n", HEADER_NAME_KEY, self.name_key));
        if let Some(size) = self.max_datagram_size {
            result.push_str(&format!("{}: {}\r\n", HEADER_MAX_DATAGRAM_SIZE, size));
        }
        result.push_str("\r\n");
        result
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> anyhow::Result<Vec<(&'a str, &'a str)>> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            bail!("malformed header line: {:?}", line);
        };
        headers.push((name.trim(), value.trim()));
    }
    Ok(headers)
}

fn header<'a>(headers: &[(&'a str, &'a str)], name: &str) -> Option<&'a str> {
    headers.iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| *v)
}


/// a client that passed screening; the connection token is assigned afterwards
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedClient {
    pub uid: String,
    pub name: String,
    pub features: Vec<String>,
    pub settings: ConnectionSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TeapotOutcome {
    Accepted(AcceptedClient),
    Rejected {
        status: TeapotStatus,
        reason: String,
    },
}

impl TeapotOutcome {
    fn rejected(status: TeapotStatus, reason: impl Into<String>) -> TeapotOutcome {
        TeapotOutcome::Rejected {
            status,
            reason: reason.into(),
        }
    }
}

/// Checks version, identity and bans, and negotiates features and settings
pub fn screen(request: &TeapotRequest, peer_ip: IpAddr, config: &RelayConfig, identities: &dyn IdentityStore, now: SystemTime) -> TeapotOutcome {
    if request.version != Some(config.teapot_version) {
        return TeapotOutcome::rejected(TeapotStatus::Conflict, format!(
            "Teapot version mismatch: the server uses version {}, the client sent {}",
            config.teapot_version,
            request.version.map(|v| v.to_string()).unwrap_or_else(|| "none".to_string())));
    }

    let features: Vec<String> = config.connection_features.iter()
        .filter(|f| request.features.contains(f))
        .cloned()
        .collect();

    let origin = origin_uid(peer_ip);
    let (uid, name) = if let Some(key) = request.name_key.strip_prefix(NAME_KEY_MARKER) {
        match identities.resolve_key(key) {
            Ok(Some(identity)) => (identity.uid, identity.name),
            Ok(None) => return TeapotOutcome::rejected(TeapotStatus::Forbidden, "Invalid name key"),
            Err(e) => return TeapotOutcome::rejected(TeapotStatus::InternalServerError, format!("Identity lookup failed: {}", e)),
        }
    }
    else if config.authenticated_only {
        return TeapotOutcome::rejected(TeapotStatus::Forbidden, "This server only accepts players with a name key");
    }
    else {
        (origin.clone(), request.name_key.clone())
    };

    for ban_uid in [&uid, &origin] {
        match identities.ban(ban_uid) {
            Ok(Some(ban)) if ban.is_active_at(now) => {
                return TeapotOutcome::rejected(TeapotStatus::Forbidden, config.ban_message.replace("{reason}", &ban.reason));
            }
            Ok(_) => {}
            Err(e) => return TeapotOutcome::rejected(TeapotStatus::InternalServerError, format!("Ban lookup failed: {}", e)),
        }
    }

    let max_datagram_size = match request.max_datagram_size {
        Some(client) if client < MIN_DATAGRAM_SIZE => {
            return TeapotOutcome::rejected(TeapotStatus::BadRequest, format!("Maximum datagram size {} is below the minimum of {}", client, MIN_DATAGRAM_SIZE));
        }
        Some(client) => client.min(config.max_datagram_size),
        None => config.max_datagram_size,
    };

    TeapotOutcome::Accepted(AcceptedClient {
        uid,
        name: sanitize_name(&name, config.max_name_length),
        features,
        settings: ConnectionSettings {
            max_datagram_size,
            udp_rate_cap: config.udp_rate_cap,
        },
    })
}


pub fn format_settings(settings: &ConnectionSettings) -> String {
    format!("MaxDatagramSize={};UdpRateCap={};", settings.max_datagram_size, settings.udp_rate_cap)
}

pub fn parse_settings(value: &str) -> anyhow::Result<ConnectionSettings> {
    let mut max_datagram_size = None;
    let mut udp_rate_cap = None;
    for pair in value.split(';').map(|p| p.trim()).filter(|p| !p.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("malformed connection setting: {:?}", pair);
        };
        match key.trim() {
            "MaxDatagramSize" => max_datagram_size = Some(value.trim().parse()?),
            "UdpRateCap" => udp_rate_cap = Some(value.trim().parse()?),
            _ => {}
        }
    }
    Ok(ConnectionSettings {
        max_datagram_size: max_datagram_size.ok_or_else(|| anyhow!("MaxDatagramSize is missing"))?,
        udp_rate_cap: udp_rate_cap.ok_or_else(|| anyhow!("UdpRateCap is missing"))?,
    })
}

pub fn format_token(token: u32) -> String {
    format!("{:08x}", token)
}

pub fn success_response(teapot_version: u32, features: &[String], token: u32, settings: &ConnectionSettings) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n{}: {}\r\n{}: {}\r\n{}: {}\r\n{}: {}\r\n\r\n",
        u16::from(TeapotStatus::ImATeapot), TeapotStatus::ImATeapot.reason_phrase(),
        HEADER_VERSION, teapot_version,
        HEADER_FEATURES, features.join(","),
        HEADER_TOKEN, format_token(token),
        HEADER_SETTINGS, format_settings(settings),
    )
}

pub fn rejection_response(status: TeapotStatus, reason: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
        u16::from(status), status.reason_phrase(),
        reason.len(),
        reason,
    )
}


/// A parsed server response, as a client sees it
#[derive(Debug, Clone, PartialEq)]
pub struct TeapotResponse {
    pub status: TeapotStatus,
    pub features: Vec<String>,
    pub token: Option<u32>,
    pub settings: Option<ConnectionSettings>,
}

impl TeapotResponse {
    pub fn parse(head: &str) -> anyhow::Result<TeapotResponse> {
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let status = status_line.split(' ').nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| anyhow!("malformed status line: {:?}", status_line))?;
        let status = TeapotStatus::try_from(status)
            .map_err(|_| anyhow!("unexpected status {}", status))?;

        let headers = parse_headers(lines)?;
        let token = match header(&headers, HEADER_TOKEN) {
            None => None,
            Some(t) => Some(u32::from_str_radix(t, 16)?),
        };
        let settings = match header(&headers, HEADER_SETTINGS) {
            None => None,
            Some(s) => Some(parse_settings(s)?),
        };
        Ok(TeapotResponse {
            status,
            features: header(&headers, HEADER_FEATURES)
                .map(|v| v.split(',').filter(|f| !f.is_empty()).map(|f| f.to_string()).collect())
                .unwrap_or_default(),
            token,
            settings,
        })
    }
}


/// Reads up to and including the blank line ending the request head. Returns the head and any
///  bytes that were read past it.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> anyhow::Result<(String, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            bail!("stream closed during the handshake");
        }
        let search_from = buf.len().saturating_sub(HEAD_TERMINATOR.len() - 1);
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = buf[search_from..].windows(HEAD_TERMINATOR.len()).position(|w| w == HEAD_TERMINATOR) {
            let end = search_from + pos;
            let leftover = buf[end + HEAD_TERMINATOR.len()..].to_vec();
            buf.truncate(end);
            let head = String::from_utf8(buf).map_err(|_| anyhow!("handshake is not valid UTF-8"))?;
            return Ok((head, leftover));
        }
        if buf.len() > MAX_HEAD_SIZE {
            bail!("handshake head exceeds {} bytes", MAX_HEAD_SIZE);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use crate::identity::{BanRecord, Identity, MockIdentityStore};
    use super::*;

    fn request(name_key: &str) -> TeapotRequest {
        TeapotRequest {
            version: Some(1),
            features: vec!["extendedHandshake".to_string(), "unknownFeature".to_string()],
            name_key: name_key.to_string(),
            max_datagram_size: None,
        }
    }

    fn ip() -> IpAddr {
        "192.168.1.10".parse().unwrap()
    }

    fn no_bans() -> MockIdentityStore {
        let mut store = MockIdentityStore::new();
        store.expect_ban().returning(|_| Ok(None));
        store
    }

    fn rejected_status(outcome: &TeapotOutcome) -> Option<TeapotStatus> {
        match outcome {
            TeapotOutcome::Rejected { status, .. } => Some(*status),
            TeapotOutcome::Accepted(_) => None,
        }
    }

    #[test]
    fn test_parse_request() {
        let parsed = TeapotRequest::parse(&request("Madeline").format().trim_end_matches("\r\n")).unwrap();
        assert_eq!(parsed, request("Madeline"));

        let lowercase = "CONNECT /teapot HTTP/1.0\r\ncelestenet-teapotversion: 1\r\ncelestenet-playernamekey:  Theo ";
        let parsed = TeapotRequest::parse(lowercase).unwrap();
        assert_eq!(parsed.version, Some(1));
        assert_eq!(parsed.name_key, "Theo");
        assert!(parsed.features.is_empty());
    }

    #[rstest]
    #[case::wrong_method("GET /teapot HTTP/1.1\r\n")]
    #[case::wrong_path("CONNECT /coffee HTTP/1.1\r\n")]
    #[case::not_http("CONNECT /teapot SPDY\r\n")]
    #[case::header_without_colon("CONNECT /teapot HTTP/1.1\r\nCelesteNet-TeapotVersion 1")]
    #[case::bad_datagram_size("CONNECT /teapot HTTP/1.1\r\nCelesteNet-MaxDatagramSize: lots")]
    fn test_parse_request_malformed(#[case] head: &str) {
        assert!(TeapotRequest::parse(head).is_err());
    }

    #[test]
    fn test_screen_anonymous() {
        let config = RelayConfig::default();
        let outcome = screen(&request("  Made#line  "), ip(), &config, &no_bans(), SystemTime::now());
        let TeapotOutcome::Accepted(client) = outcome else {
            panic!("expected acceptance, got {:?}", outcome);
        };
        assert_eq!(client.uid, origin_uid(ip()));
        assert_eq!(client.name, "Madeline");
        assert_eq!(client.features, vec!["extendedHandshake".to_string()]);
        assert_eq!(client.settings.max_datagram_size, config.max_datagram_size);
    }

    #[test]
    fn test_screen_name_key() {
        let mut store = no_bans();
        store.expect_resolve_key()
            .returning(|key| Ok((key == "secret").then(|| Identity { uid: "madeline".to_string(), name: "Madeline".to_string() })));

        let config = RelayConfig { authenticated_only: true, ..RelayConfig::default() };
        let TeapotOutcome::Accepted(client) = screen(&request("#secret"), ip(), &config, &store, SystemTime::now()) else {
            panic!("expected acceptance");
        };
        assert_eq!(client.uid, "madeline");

        assert_eq!(rejected_status(&screen(&request("#wrong"), ip(), &config, &store, SystemTime::now())), Some(TeapotStatus::Forbidden));
        assert_eq!(rejected_status(&screen(&request("Anonymous"), ip(), &config, &store, SystemTime::now())), Some(TeapotStatus::Forbidden));
    }

    #[rstest]
    #[case::mismatch(Some(2), TeapotStatus::Conflict)]
    #[case::missing(None, TeapotStatus::Conflict)]
    fn test_screen_version(#[case] version: Option<u32>, #[case] expected: TeapotStatus) {
        let req = TeapotRequest { version, ..request("Madeline") };
        let outcome = screen(&req, ip(), &RelayConfig::default(), &no_bans(), SystemTime::now());
        assert_eq!(rejected_status(&outcome), Some(expected));
    }

    #[rstest]
    #[case::identity_banned(true, false, true)]
    #[case::origin_banned(false, true, true)]
    #[case::not_banned(false, false, false)]
    fn test_screen_bans(#[case] ban_identity: bool, #[case] ban_origin: bool, #[case] expect_rejection: bool) {
        let mut store = MockIdentityStore::new();
        store.expect_resolve_key()
            .returning(|_| Ok(Some(Identity { uid: "theo".to_string(), name: "Theo".to_string() })));
        let origin = origin_uid(ip());
        store.expect_ban().returning(move |uid| {
            let banned = (uid == "theo" && ban_identity) || (uid == origin && ban_origin);
            Ok(banned.then(|| BanRecord { reason: "selfies".to_string(), start: None, end: None }))
        });

        let outcome = screen(&request("#key"), ip(), &RelayConfig::default(), &store, SystemTime::now());
        if expect_rejection {
            assert_eq!(outcome, TeapotOutcome::Rejected {
                status: TeapotStatus::Forbidden,
                reason: "You're banned: selfies".to_string(),
            });
        }
        else {
            assert!(matches!(outcome, TeapotOutcome::Accepted(_)));
        }
    }

    #[test]
    fn test_screen_expired_ban() {
        let mut store = MockIdentityStore::new();
        let now = SystemTime::now();
        store.expect_ban().returning(move |_| Ok(Some(BanRecord {
            reason: "old".to_string(),
            start: None,
            end: Some(now - Duration::from_secs(60)),
        })));
        let outcome = screen(&request("Madeline"), ip(), &RelayConfig::default(), &store, now);
        assert!(matches!(outcome, TeapotOutcome::Accepted(_)));
    }

    #[test]
    fn test_screen_store_failure() {
        let mut store = MockIdentityStore::new();
        store.expect_ban().returning(|_| Err(anyhow!("database is down")));
        let outcome = screen(&request("Madeline"), ip(), &RelayConfig::default(), &store, SystemTime::now());
        assert_eq!(rejected_status(&outcome), Some(TeapotStatus::InternalServerError));
    }

    #[rstest]
    #[case::smaller(Some(600), Ok(600))]
    #[case::larger(Some(9000), Ok(1200))]
    #[case::too_small(Some(10), Err(TeapotStatus::BadRequest))]
    #[case::absent(None, Ok(1200))]
    fn test_screen_datagram_size(#[case] client: Option<usize>, #[case] expected: Result<usize, TeapotStatus>) {
        let req = TeapotRequest { max_datagram_size: client, ..request("Madeline") };
        let outcome = screen(&req, ip(), &RelayConfig::default(), &no_bans(), SystemTime::now());
        match (outcome, expected) {
            (TeapotOutcome::Accepted(c), Ok(size)) => assert_eq!(c.settings.max_datagram_size, size),
            (TeapotOutcome::Rejected { status, .. }, Err(expected)) => assert_eq!(status, expected),
            (outcome, expected) => panic!("{:?} vs {:?}", outcome, expected),
        }
    }

    #[test]
    fn test_success_response_parses() {
        let settings = ConnectionSettings { max_datagram_size: 1000, udp_rate_cap: 2048.0 };
        let response = success_response(1, &["extendedHandshake".to_string()], 0x00ab_cdef, &settings);
        assert!(response.starts_with("HTTP/1.1 418 I'm a teapot\r\n"));
        assert!(response.contains("CelesteNet-ConnectionToken: 00abcdef\r\n"));

        let parsed = TeapotResponse::parse(response.trim_end_matches("\r\n")).unwrap();
        assert_eq!(parsed.status, TeapotStatus::ImATeapot);
        assert_eq!(parsed.features, vec!["extendedHandshake".to_string()]);
        assert_eq!(parsed.token, Some(0x00ab_cdef));
        assert_eq!(parsed.settings, Some(settings));
    }

    #[test]
    fn test_rejection_response() {
        let response = rejection_response(TeapotStatus::Conflict, "version mismatch");
        assert!(response.starts_with("HTTP/1.1 409 Conflict\r\n"));
        assert!(response.ends_with("\r\n\r\nversion mismatch"));
        assert!(response.contains("Content-Length: 16\r\n"));
    }

    #[tokio::test]
    async fn test_read_head_keeps_leftover() {
        let data = b"CONNECT /teapot HTTP/1.1\r\nA: b\r\n\r\n\x05\x00rest".to_vec();
        let mut reader = &data[..];
        let (head, leftover) = read_head(&mut reader).await.unwrap();
        assert_eq!(head, "CONNECT /teapot HTTP/1.1\r\nA: b");
        assert_eq!(leftover, b"\x05\x00rest");
    }

    #[tokio::test]
    async fn test_read_head_limits() {
        let data = vec![b'a'; MAX_HEAD_SIZE + 2048];
        assert!(read_head(&mut &data[..]).await.is_err());

        let truncated = b"CONNECT /teapot HTTP/1.1\r\n".to_vec();
        assert!(read_head(&mut &truncated[..]).await.is_err());
    }
}
