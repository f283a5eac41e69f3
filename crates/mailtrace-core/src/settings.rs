use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::FixedOffset;
use mailtrace_helpers::de::deserialize_duration;
use serde::Deserialize;

use crate::error::TraceError;
use crate::parser::LineFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    #[default]
    Ssh,
    Opensearch
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::Opensearch => "opensearch"
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub method: Method,
    #[serde(default)]
    pub auto_continue: bool,
    /// Logical name to physical hosts.
    #[serde(default)]
    pub clusters: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub opensearch: SearchSettings,
    #[serde(default)]
    pub tracing: TracingSettings
}

impl Settings {
    pub fn normalize(&mut self) {
        self.clusters = std::mem::take(&mut self.clusters)
            .into_iter()
            .map(|(name, hosts)| {
                let hosts = hosts
                    .into_iter()
                    .map(|host| host.trim().to_string())
                    .filter(|host| !host.is_empty())
                    .collect();
                (name.trim().to_string(), hosts)
            })
            .collect();

        self.ssh.username = self.ssh.username.trim().to_string();
        self.ssh.password = normalize_opt(self.ssh.password.take());
        self.ssh.sudo_pass = normalize_opt(self.ssh.sudo_pass.take());
        self.ssh.port = if self.ssh.port == 0 { default_ssh_port() } else { self.ssh.port };

        let search = &mut self.opensearch;
        search.host = search.host.trim().to_string();
        search.index = search.index.trim().to_string();
        search.username = normalize_opt(search.username.take());
        search.password = normalize_opt(search.password.take());
        search.max_hits = search.max_hits.clamp(1, 10_000);

        self.tracing.hold_rounds = self.tracing.hold_rounds.max(1);
        self.tracing.max_pending_rounds =
            self.tracing.max_pending_rounds.max(self.tracing.hold_rounds);
    }

    pub fn validate(&self) -> Result<(), TraceError> {
        match self.method {
            Method::Ssh => self.ssh.validate()?,
            Method::Opensearch => self.opensearch.validate()?
        }
        if self.tracing.poll_interval.is_zero() {
            return Err(TraceError::config(
                "tracing.poll_interval must be greater than zero",
                "set tracing.poll_interval, e.g. 60s",
            ));
        }
        Ok(())
    }

    pub fn cluster_to_hosts(
        &self,
        name: &str
    ) -> Option<&[String]> {
        self.clusters
            .get(name)
            .map(Vec::as_slice)
            .filter(|hosts| !hosts.is_empty())
    }

    /// Physical hosts behind `name`, or `name` itself.
    pub fn expand_hosts(
        &self,
        name: &str
    ) -> Vec<String> {
        self.cluster_to_hosts(name)
            .map(<[String]>::to_vec)
            .unwrap_or_else(|| vec![name.to_string()])
    }

    /// Every host known to the configuration, for index-less polling.
    pub fn all_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.ssh.hosts.keys().cloned().collect();
        for members in self.clusters.values() {
            for host in members {
                if !hosts.contains(host) {
                    hosts.push(host.clone());
                }
            }
        }
        hosts
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshSettings {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub sudo: bool,
    #[serde(default)]
    pub sudo_pass: Option<String>,
    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub connect_timeout: Duration,
    #[serde(default)]
    pub host_config: HostSettings,
    #[serde(default)]
    pub hosts: BTreeMap<String, HostOverride>
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: None,
            private_key: None,
            port: default_ssh_port(),
            sudo: true,
            sudo_pass: None,
            connect_timeout: default_connect_timeout(),
            host_config: HostSettings::default(),
            hosts: BTreeMap::new(),
        }
    }
}

impl SshSettings {
    /// Host settings with per-host overrides applied over `host_config`.
    pub fn host(
        &self,
        name: &str
    ) -> HostSettings {
        let base = &self.host_config;
        let Some(custom) = self.hosts.get(name) else {
            return base.clone();
        };

        HostSettings {
            log_files: custom
                .log_files
                .clone()
                .filter(|files| !files.is_empty())
                .unwrap_or_else(|| base.log_files.clone()),
            log_parser: custom.log_parser.unwrap_or(base.log_parser),
            time_format: custom
                .time_format
                .clone()
                .unwrap_or_else(|| base.time_format.clone()),
            time_zone: custom
                .time_zone
                .clone()
                .unwrap_or_else(|| base.time_zone.clone()),
        }
    }

    fn validate(&self) -> Result<(), TraceError> {
        if self.username.is_empty() {
            return Err(TraceError::config(
                "ssh.username is not set",
                "set ssh.username in the config file",
            ));
        }
        if self.password.is_none() && self.private_key.is_none() {
            return Err(TraceError::config(
                "neither ssh.password nor ssh.private_key is set",
                "configure a private key or export MAILTRACE_SSH_PASSWORD",
            ));
        }
        parse_utc_offset(&self.host_config.time_zone)?;
        for (host, custom) in &self.hosts {
            if let Some(zone) = custom.time_zone.as_deref() {
                parse_utc_offset(zone).map_err(|err| {
                    TraceError::config(
                        format!("ssh.hosts.{host}: {}", err.message()),
                        err.suggestion(),
                    )
                })?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostSettings {
    #[serde(default = "default_log_files")]
    pub log_files: Vec<String>,
    #[serde(default)]
    pub log_parser: LineFormat,
    /// strftime layout of the leading timestamp; must be fixed width so the
    /// remote window filter can compare it lexically. Empty means the
    /// layout of `log_parser`.
    #[serde(default)]
    pub time_format: String,
    #[serde(default = "default_time_zone")]
    pub time_zone: String
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            log_files: default_log_files(),
            log_parser: LineFormat::default(),
            time_format: String::new(),
            time_zone: default_time_zone(),
        }
    }
}

impl HostSettings {
    /// Layout used to render window bounds for the remote filter.
    pub fn window_time_format(&self) -> &str {
        match self.time_format.trim() {
            "" => self.log_parser.time_format(),
            custom => custom
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostOverride {
    #[serde(default)]
    pub log_files: Option<Vec<String>>,
    #[serde(default)]
    pub log_parser: Option<LineFormat>,
    #[serde(default)]
    pub time_format: Option<String>,
    #[serde(default)]
    pub time_zone: Option<String>
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchSettings {
    #[serde(default = "default_search_host")]
    pub host: String,
    #[serde(default = "default_search_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default = "default_true")]
    pub verify_certs: bool,
    #[serde(default)]
    pub index: String,
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
    #[serde(
        default = "default_search_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub timeout: Duration,
    #[serde(default = "default_max_hits")]
    pub max_hits: usize,
    #[serde(default)]
    pub mapping: FieldMapping
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            host: default_search_host(),
            port: default_search_port(),
            username: None,
            password: None,
            use_ssl: false,
            verify_certs: true,
            index: String::new(),
            time_zone: default_time_zone(),
            timeout: default_search_timeout(),
            max_hits: default_max_hits(),
            mapping: FieldMapping::default(),
        }
    }
}

impl SearchSettings {
    pub fn base_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<(), TraceError> {
        if self.host.is_empty() {
            return Err(TraceError::config(
                "opensearch.host is not set",
                "set opensearch.host in the config file",
            ));
        }
        if self.index.is_empty() {
            return Err(TraceError::config(
                "opensearch.index is not set",
                "set opensearch.index, e.g. logs-*",
            ));
        }
        parse_utc_offset(&self.time_zone)?;

        let report = check_mapping(&self.mapping);
        if let Some(issue) = report.errors.first() {
            return Err(TraceError::config(
                issue.message.clone(),
                "run `mailtrace doctor` and fill in opensearch.mapping",
            ));
        }
        Ok(())
    }
}

/// Dotted paths of each entry field inside a search hit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldMapping {
    #[serde(default = "default_timestamp_path")]
    pub timestamp: String,
    #[serde(default = "default_message_path")]
    pub message: String,
    #[serde(default = "default_hostname_path")]
    pub hostname: String,
    #[serde(default)]
    pub facility: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub queueid: Option<String>,
    #[serde(default)]
    pub queued_as: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub relay_host: Option<String>,
    #[serde(default)]
    pub relay_ip: Option<String>,
    #[serde(default)]
    pub relay_port: Option<String>,
    #[serde(default)]
    pub smtp_code: Option<String>
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            timestamp: default_timestamp_path(),
            message: default_message_path(),
            hostname: default_hostname_path(),
            facility: None,
            service: None,
            queueid: None,
            queued_as: None,
            message_id: None,
            relay_host: None,
            relay_ip: None,
            relay_port: None,
            smtp_code: None,
        }
    }
}

impl FieldMapping {
    fn fields(&self) -> [(&'static str, Option<&str>); 12] {
        [
            ("timestamp", Some(self.timestamp.as_str())),
            ("message", Some(self.message.as_str())),
            ("hostname", Some(self.hostname.as_str())),
            ("facility", self.facility.as_deref()),
            ("service", self.service.as_deref()),
            ("queueid", self.queueid.as_deref()),
            ("queued_as", self.queued_as.as_deref()),
            ("message_id", self.message_id.as_deref()),
            ("relay_host", self.relay_host.as_deref()),
            ("relay_ip", self.relay_ip.as_deref()),
            ("relay_port", self.relay_port.as_deref()),
            ("smtp_code", self.smtp_code.as_deref()),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtelProtocol {
    #[default]
    Grpc,
    Http
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TracingSettings {
    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,
    #[serde(default)]
    pub otel_protocol: OtelProtocol,
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub poll_interval: Duration,
    /// How far each poll reaches back before the previous poll's end.
    #[serde(
        default = "default_lookback",
        deserialize_with = "deserialize_duration"
    )]
    pub lookback: Duration,
    /// Quiet rounds before a message is exported.
    #[serde(default = "default_hold_rounds")]
    pub hold_rounds: u32,
    /// Rounds an uncorrelated entry may wait for its message-id.
    #[serde(default = "default_max_pending_rounds")]
    pub max_pending_rounds: u32
}

impl Default for TracingSettings {
    fn default() -> Self {
        Self {
            otel_endpoint: default_otel_endpoint(),
            otel_protocol: OtelProtocol::default(),
            poll_interval: default_poll_interval(),
            lookback: default_lookback(),
            hold_rounds: default_hold_rounds(),
            max_pending_rounds: default_max_pending_rounds(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingIssue {
    pub field: &'static str,
    pub message: String
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingReport {
    pub errors: Vec<MappingIssue>,
    pub warnings: Vec<MappingIssue>,
    pub configured: Vec<&'static str>,
    pub unconfigured: Vec<&'static str>
}

impl MappingReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Reports which search-hit fields are mapped and what is lost without the
/// optional ones.
pub fn check_mapping(mapping: &FieldMapping) -> MappingReport {
    let mut report = MappingReport::default();

    for (field, path) in mapping.fields() {
        if path.is_some_and(|path| !path.trim().is_empty()) {
            report.configured.push(field);
            continue;
        }
        report.unconfigured.push(field);

        let consequence = match field {
            "timestamp" | "message" | "hostname" => {
                report.errors.push(MappingIssue {
                    field,
                    message: format!("required field `{field}` is not configured"),
                });
                continue;
            }
            "facility" => "facility filtering won't be applied",
            "service" => "service name won't appear in parsed output",
            "queueid" => "queue id lookups fall back to message text search",
            "message_id" => "message-id lookups fall back to message text search",
            _ => continue
        };
        report.warnings.push(MappingIssue {
            field,
            message: consequence.to_string(),
        });
    }

    report
}

/// Parses `+HH:MM`, `-HHMM`, `+HH`, `Z` or `UTC`.
pub fn parse_utc_offset(value: &str) -> Result<FixedOffset, TraceError> {
    let invalid = || {
        TraceError::config(
            format!("invalid time zone offset: {value}"),
            "use a fixed offset such as +03:00 or -05:00",
        )
    };

    let value = value.trim();
    if value.eq_ignore_ascii_case("z") || value.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }

    let (sign, rest) = match value.chars().next() {
        Some('+') => (1, &value[1..]),
        Some('-') => (-1, &value[1..]),
        _ => return Err(invalid())
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let (hours, minutes) = match digits.len() {
        2 => (&digits[..2], "0"),
        4 => (&digits[..2], &digits[2..]),
        _ => return Err(invalid())
    };
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(invalid)
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn default_true() -> bool {
    true
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_log_files() -> Vec<String> {
    vec!["/var/log/mail.log".to_string()]
}

fn default_time_zone() -> String {
    "+00:00".to_string()
}

fn default_search_host() -> String {
    "localhost".to_string()
}

fn default_search_port() -> u16 {
    9200
}

fn default_search_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_hits() -> usize {
    1000
}

fn default_timestamp_path() -> String {
    "@timestamp".to_string()
}

fn default_message_path() -> String {
    "message".to_string()
}

fn default_hostname_path() -> String {
    "host.name".to_string()
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_lookback() -> Duration {
    Duration::from_secs(30)
}

fn default_hold_rounds() -> u32 {
    2
}

fn default_max_pending_rounds() -> u32 {
    30
}
