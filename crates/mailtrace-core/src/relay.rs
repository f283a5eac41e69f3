use std::sync::OnceLock;

use regex::Regex;

use crate::model::RelayResult;

const SMTP_OK: u16 = 250;

/// Host, ip and port from `relay=<host>[<ip>]:<port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub host: String,
    pub ip: String,
    pub port: u16
}

/// Returns the hand-off described by `text`, or `None` unless the text holds
/// a 250 reply, a `queued as` id and a complete relay endpoint.
pub fn extract_relay(text: &str) -> Option<RelayResult> {
    let smtp_code = find_smtp_code(text)?;
    if smtp_code != SMTP_OK {
        return None;
    }
    let mail_id = find_queued_as(text)?;
    let endpoint = find_relay_endpoint(text)?;

    Some(RelayResult {
        mail_id,
        relay_host: endpoint.host,
        relay_ip: endpoint.ip,
        relay_port: endpoint.port,
        smtp_code,
    })
}

/// First standalone three-digit number followed by whitespace.
pub fn find_smtp_code(text: &str) -> Option<u16> {
    smtp_code_re()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|code| code.as_str().parse().ok())
}

pub fn find_queued_as(text: &str) -> Option<String> {
    queued_as_re()
        .captures(text)
        .and_then(|caps| caps.name("id"))
        .map(|id| id.as_str().to_string())
}

pub fn find_relay_endpoint(text: &str) -> Option<RelayEndpoint> {
    let caps = relay_re().captures(text)?;
    let port = caps.name("port")?.as_str().parse().ok()?;

    Some(RelayEndpoint {
        host: caps.name("host")?.as_str().to_string(),
        ip: caps.name("ip")?.as_str().to_string(),
        port,
    })
}

fn smtp_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([0-9]{3})\s").expect("smtp code regex"))
}

fn queued_as_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"250.*queued as (?P<id>[0-9A-Z]+)").expect("queued as regex")
    })
}

fn relay_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"relay=(?P<host>[^\s]+)\[(?P<ip>[^\]]+)\]:(?P<port>[0-9]+)")
            .expect("relay regex")
    })
}
