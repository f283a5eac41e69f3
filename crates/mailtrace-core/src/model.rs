use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::error::TraceError;

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One parsed log line or search hit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    /// Timestamp exactly as it appeared in the source.
    pub datetime: String,
    /// Absolute instant, when the raw timestamp could be resolved.
    pub timestamp: Option<DateTime<FixedOffset>>,
    pub hostname: String,
    pub service: String,
    /// Per-host queue identifier, `^[0-9A-Z]+$` or absent.
    pub mail_id: Option<String>,
    pub message: String,
    pub message_id: Option<String>,
    /// Queue identifier assigned by the next hop.
    pub queued_as: Option<String>,
    pub relay_host: Option<String>,
    pub relay_ip: Option<String>,
    pub relay_port: Option<u16>,
    pub smtp_code: Option<u16>
}

impl fmt::Display for LogEntry {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>
    ) -> fmt::Result {
        write!(
            f,
            "{} {} {}: {}: {}",
            self.datetime,
            self.hostname,
            self.service,
            self.mail_id.as_deref().unwrap_or("-"),
            self.message
        )
    }
}

/// A successful hand-off to the next hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayResult {
    /// Queue identifier at the next hop.
    pub mail_id: String,
    pub relay_host: String,
    pub relay_ip: String,
    pub relay_port: u16,
    pub smtp_code: u16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeWindow {
    /// `time ± range` on the log source's own wall clock.
    Around { time: NaiveDateTime, range: TimeDelta },
    /// Half-open absolute interval used by continuous polling.
    Between { start: DateTime<Utc>, end: DateTime<Utc> }
}

impl TimeWindow {
    /// Lower and upper bound as wall-clock time at `offset`.
    pub fn local_bounds(
        &self,
        offset: FixedOffset
    ) -> (NaiveDateTime, NaiveDateTime) {
        match *self {
            Self::Around { time, range } => (
                time.checked_sub_signed(range).unwrap_or(NaiveDateTime::MIN),
                time.checked_add_signed(range).unwrap_or(NaiveDateTime::MAX),
            ),
            Self::Between { start, end } => (
                start.with_timezone(&offset).naive_local(),
                end.with_timezone(&offset).naive_local(),
            ),
        }
    }

    pub fn end_inclusive(&self) -> bool {
        matches!(self, Self::Around { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogQuery {
    pub keywords: Vec<String>,
    pub mail_id: Option<String>,
    pub mail_ids: Vec<String>,
    pub message_id: Option<String>,
    pub window: Option<TimeWindow>
}

impl LogQuery {
    pub fn for_mail_id(mail_id: impl Into<String>) -> Self {
        Self { mail_id: Some(mail_id.into()), ..Self::default() }
    }

    pub fn for_keywords(
        keywords: Vec<String>,
        window: Option<TimeWindow>
    ) -> Self {
        Self { keywords, window, ..Self::default() }
    }

    pub fn between(
        start: DateTime<Utc>,
        end: DateTime<Utc>
    ) -> Self {
        Self {
            window: Some(TimeWindow::Between { start, end }),
            ..Self::default()
        }
    }

    /// All identifiers the caller asked for, single form first.
    pub fn requested_ids(&self) -> Vec<&str> {
        self.mail_id
            .iter()
            .chain(self.mail_ids.iter())
            .map(String::as_str)
            .collect()
    }
}

/// Validates the user-facing `time` / `time_range` pair.
///
/// Both must be given together. `time` is `YYYY-MM-DD HH:MM:SS`, the range
/// is a count followed by `d`, `h` or `m`.
pub fn parse_time_args(
    time: Option<&str>,
    time_range: Option<&str>
) -> Result<Option<TimeWindow>, TraceError> {
    let time = time.map(str::trim).filter(|value| !value.is_empty());
    let time_range = time_range.map(str::trim).filter(|value| !value.is_empty());

    match (time, time_range) {
        (None, None) => Ok(None),
        (Some(_), None) | (None, Some(_)) => Err(TraceError::validation(
            "time and time range must be given together",
            "provide both --time and --time-range, or neither",
        )),
        (Some(time), Some(range)) => {
            let time = NaiveDateTime::parse_from_str(time, TIME_FORMAT)
                .map_err(|_| {
                    TraceError::validation(
                        format!("invalid time: {time}"),
                        "use the format YYYY-MM-DD HH:MM:SS",
                    )
                })?;
            let range = parse_time_range(range)?;
            if time.checked_sub_signed(range).is_none()
                || time.checked_add_signed(range).is_none()
            {
                return Err(TraceError::validation(
                    format!("time range {range} around {time} is out of bounds"),
                    "use a smaller --time-range",
                ));
            }
            Ok(Some(TimeWindow::Around { time, range }))
        }
    }
}

pub fn parse_time_range(value: &str) -> Result<TimeDelta, TraceError> {
    let invalid = || {
        TraceError::validation(
            format!("invalid time range: {value}"),
            "use a number followed by d, h or m, e.g. 10m",
        )
    };

    let (split, unit) = value.char_indices().last().ok_or_else(invalid)?;
    let digits = &value[..split];
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let amount: i64 = digits.parse().map_err(|_| invalid())?;

    let delta = match unit {
        'd' => TimeDelta::try_days(amount),
        'h' => TimeDelta::try_hours(amount),
        'm' => TimeDelta::try_minutes(amount),
        _ => None
    };
    delta.ok_or_else(invalid)
}
