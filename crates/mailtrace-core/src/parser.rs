use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDateTime, TimeZone, Utc
};
use serde::Deserialize;
use serde_json::Value;

use crate::error::TraceError;
use crate::model::LogEntry;
use crate::relay::{find_queued_as, find_relay_endpoint, find_smtp_code};
use crate::settings::FieldMapping;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y %b %d %H:%M:%S%.f",
];

/// Layout of the timestamp at the start of a text log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineFormat {
    /// One token, e.g. `2025-02-01T10:00:00.123456+03:00`.
    #[default]
    #[serde(alias = "NoSpaceInDatetimeParser")]
    Compact,
    /// Three tokens, e.g. `Feb  1 10:00:00`.
    #[serde(alias = "DayOfWeekParser")]
    DayOfWeek
}

impl LineFormat {
    fn timestamp_fields(self) -> usize {
        match self {
            Self::Compact => 1,
            Self::DayOfWeek => 3
        }
    }

    /// strftime layout matching the leading timestamp of this format.
    pub fn time_format(self) -> &'static str {
        match self {
            Self::Compact => "%Y-%m-%dT%H:%M:%S",
            Self::DayOfWeek => "%b %e %H:%M:%S"
        }
    }
}

/// Queue identifiers are uppercase alphanumerics; anything else is not one.
pub fn is_queue_id(value: &str) -> bool {
    !value.is_empty()
        && value.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
}

/// Parses raw maillog lines for one host.
#[derive(Debug, Clone)]
pub struct LineParser {
    format: LineFormat,
    offset: FixedOffset,
    year: i32
}

impl LineParser {
    pub fn new(
        format: LineFormat,
        offset: FixedOffset
    ) -> Self {
        let year = Utc::now().with_timezone(&offset).year();
        Self { format, offset, year }
    }

    /// Year assumed for timestamps that do not carry one.
    pub fn with_year(
        mut self,
        year: i32
    ) -> Self {
        self.year = year;
        self
    }

    pub fn format(&self) -> LineFormat {
        self.format
    }

    /// Splits `raw` into timestamp, host, service, identifier candidate and
    /// message.
    ///
    /// The candidate token is removed from the message whether or not it is
    /// a valid queue identifier, so `mail_id` is `None` for lines like
    /// `connect from ...` and the message starts after the first word.
    pub fn parse(
        &self,
        raw: &str
    ) -> Result<LogEntry, TraceError> {
        let ts_fields = self.format.timestamp_fields();
        let fields = split_fields(raw.trim(), ts_fields + 4);
        if fields.len() < ts_fields + 4 {
            return Err(TraceError::parse(
                format!(
                    "expected {} fields, found {}: {}",
                    ts_fields + 4,
                    fields.len(),
                    raw.trim()
                ),
                "check the log_parser setting for this host",
            ));
        }

        let datetime = fields[..ts_fields].join(" ");
        let hostname = fields[ts_fields].to_string();
        let service = service_name(fields[ts_fields + 1]);
        let candidate = fields[ts_fields + 2].trim_end_matches(':');
        let mail_id =
            if is_queue_id(candidate) { Some(candidate.to_string()) } else { None };

        let mut entry = LogEntry {
            timestamp: resolve_timestamp(&datetime, self.offset, self.year),
            datetime,
            hostname,
            service,
            mail_id,
            message: fields[ts_fields + 3].to_string(),
            ..LogEntry::default()
        };
        enrich_from_text(&mut entry);
        Ok(entry)
    }
}

/// Parses search hits through a configurable field mapping.
#[derive(Debug, Clone)]
pub struct RecordParser {
    mapping: FieldMapping,
    offset: FixedOffset,
    year: i32
}

impl RecordParser {
    pub fn new(
        mapping: FieldMapping,
        offset: FixedOffset
    ) -> Self {
        let year = Utc::now().with_timezone(&offset).year();
        Self { mapping, offset, year }
    }

    pub fn parse(
        &self,
        hit: &Value
    ) -> Result<LogEntry, TraceError> {
        let mapping = &self.mapping;
        let datetime = self.required(hit, &mapping.timestamp, "timestamp")?;
        let message = self.required(hit, &mapping.message, "message")?;
        let hostname = self.required(hit, &mapping.hostname, "hostname")?;

        let mut entry = LogEntry {
            timestamp: resolve_timestamp(&datetime, self.offset, self.year),
            datetime,
            hostname,
            service: self.optional(hit, mapping.service.as_deref()).unwrap_or_default(),
            message,
            message_id: self
                .optional(hit, mapping.message_id.as_deref())
                .map(|id| id.trim_matches(|c| c == '<' || c == '>').to_string()),
            queued_as: self.optional(hit, mapping.queued_as.as_deref()),
            relay_host: self.optional(hit, mapping.relay_host.as_deref()),
            relay_ip: self.optional(hit, mapping.relay_ip.as_deref()),
            relay_port: self
                .optional(hit, mapping.relay_port.as_deref())
                .and_then(|port| port.parse().ok()),
            smtp_code: self
                .optional(hit, mapping.smtp_code.as_deref())
                .and_then(|code| code.parse().ok()),
            ..LogEntry::default()
        };

        match mapping.queueid.as_deref() {
            Some(path) => {
                entry.mail_id = self
                    .optional(hit, Some(path))
                    .filter(|candidate| is_queue_id(candidate));
            }
            None => split_leading_queue_id(&mut entry)
        }

        enrich_from_text(&mut entry);
        Ok(entry)
    }

    fn required(
        &self,
        hit: &Value,
        path: &str,
        field: &str
    ) -> Result<String, TraceError> {
        lookup_string(hit, path).ok_or_else(|| {
            TraceError::parse(
                format!("search hit has no `{path}` ({field}) field"),
                format!("check opensearch.mapping.{field}"),
            )
        })
    }

    fn optional(
        &self,
        hit: &Value,
        path: Option<&str>
    ) -> Option<String> {
        path.and_then(|path| lookup_string(hit, path))
            .filter(|value| !value.is_empty())
    }
}

/// Finds `path` inside `_source` first, then at the hit root. A literal
/// dotted key wins over nested objects at each level.
pub fn lookup<'a>(
    hit: &'a Value,
    path: &str
) -> Option<&'a Value> {
    let source = hit.get("_source").filter(|value| value.is_object());
    source
        .and_then(|source| lookup_in(source, path))
        .or_else(|| lookup_in(hit, path))
}

fn lookup_in<'a>(
    value: &'a Value,
    path: &str
) -> Option<&'a Value> {
    if let Some(found) = value.get(path) {
        return Some(found);
    }
    path.split('.').try_fold(value, |current, segment| current.get(segment))
}

fn lookup_string(
    hit: &Value,
    path: &str
) -> Option<String> {
    match lookup(hit, path)? {
        Value::String(text) => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Array(items) => items.first().and_then(|first| match first {
            Value::String(text) => Some(text.trim().to_string()),
            Value::Number(number) => Some(number.to_string()),
            _ => None
        }),
        _ => None
    }
}

/// Takes `ABC123:` off the front of the message when it is a queue id.
fn split_leading_queue_id(entry: &mut LogEntry) {
    let Some((candidate, rest)) = entry.message.split_once(':') else {
        return;
    };
    let candidate = candidate.trim();
    if is_queue_id(candidate) {
        entry.mail_id = Some(candidate.to_string());
        entry.message = rest.trim_start().to_string();
    }
}

/// Fills relay details the source did not provide from the message text.
pub fn enrich_from_text(entry: &mut LogEntry) {
    if entry.relay_host.is_none()
        && let Some(endpoint) = find_relay_endpoint(&entry.message)
    {
        entry.relay_host = Some(endpoint.host);
        entry.relay_ip = entry.relay_ip.take().or(Some(endpoint.ip));
        entry.relay_port = entry.relay_port.or(Some(endpoint.port));
    }
    if entry.smtp_code.is_none() {
        entry.smtp_code = find_smtp_code(&entry.message);
    }
    if entry.queued_as.is_none() {
        entry.queued_as = find_queued_as(&entry.message);
    }
}

/// Resolves a raw timestamp to an instant. Values without an offset are read
/// in `offset`; values without a year get `year`.
pub fn resolve_timestamp(
    raw: &str,
    offset: FixedOffset,
    year: i32
) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Some(instant);
    }
    if let Ok(instant) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z")
    {
        return Some(instant);
    }

    let with_year = format!("{year} {raw}");
    NAIVE_FORMATS.iter().find_map(|format| {
        NaiveDateTime::parse_from_str(raw, format)
            .or_else(|_| NaiveDateTime::parse_from_str(&with_year, format))
            .ok()
            .and_then(|naive| offset.from_local_datetime(&naive).single())
    })
}

fn service_name(field: &str) -> String {
    match field.split_once('[') {
        Some((name, _)) => name.to_string(),
        None => field.trim_end_matches(':').to_string()
    }
}

/// Splits on whitespace runs into at most `limit` fields; the last field keeps
/// the rest of the line untouched.
fn split_fields(
    line: &str,
    limit: usize
) -> Vec<&str> {
    let mut fields = Vec::with_capacity(limit);
    let mut rest = line.trim_start();

    while !rest.is_empty() {
        if fields.len() + 1 == limit {
            fields.push(rest);
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                fields.push(&rest[..end]);
                rest = rest[end..].trim_start();
            }
            None => {
                fields.push(rest);
                break;
            }
        }
    }

    fields
}
