use std::time::SystemTime;

use chrono::{DateTime, FixedOffset, TimeDelta};
use opentelemetry::{Array, KeyValue, StringValue, Value};
use tracing::debug;

use crate::correlate::EmailTrace;
use crate::delay::{DelayInfo, MtaFamily, Stage, detect_family};
use crate::model::LogEntry;

/// Smallest stage duration, in seconds, used when a log reports zero or less.
pub const STAGE_EPSILON_SECS: f64 = 1e-6;

/// Smallest span duration accepted by the exporter, in microseconds.
pub const MIN_SPAN_MICROS: i64 = 1;

pub const ROOT_SPAN_NAME: &str = "email.delivery";

/// One stage on one host, anchored to real log time.
#[derive(Debug, Clone, PartialEq)]
pub struct Delay {
    pub host: String,
    pub family: MtaFamily,
    pub stage: Stage,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>
}

/// Chains each host's stages from that host's first timestamp.
///
/// Entries without an instant are skipped. Hosts keep the order of their
/// first entry and are not chained to each other.
pub fn build_delays(
    message_id: &str,
    entries: &[LogEntry]
) -> Vec<Delay> {
    let mut timed: Vec<(&LogEntry, DateTime<FixedOffset>)> = entries
        .iter()
        .filter_map(|entry| entry.timestamp.map(|at| (entry, at)))
        .collect();
    if timed.len() < entries.len() {
        debug!(
            "entries without timestamp skipped: message_id={message_id}, skipped={}",
            entries.len() - timed.len()
        );
    }
    timed.sort_by_key(|(_, at)| *at);

    let mut delays = Vec::new();
    for (host, host_entries) in group_by_host(timed) {
        let family = detect_family(host_entries.iter().map(|(entry, _)| *entry));
        let parsed: Vec<DelayInfo> = host_entries
            .iter()
            .map(|(entry, _)| DelayInfo::parse(family, &entry.message))
            .collect();

        let mut cursor = host_entries[0].1;
        for stage in family.stages() {
            let Some(secs) = parsed.iter().find_map(|info| info.get(*stage)) else {
                continue;
            };
            let end = cursor + seconds(secs.max(STAGE_EPSILON_SECS));
            delays.push(Delay { host: host.to_string(), family, stage: *stage, start: cursor, end });
            cursor = end;
        }
    }

    debug!("delays built: message_id={message_id}, delays={}", delays.len());
    delays
}

/// Groups entries by hostname in order of first appearance.
fn group_by_host<T>(entries: Vec<(&LogEntry, T)>) -> Vec<(&str, Vec<(&LogEntry, T)>)> {
    let mut groups: Vec<(&str, Vec<(&LogEntry, T)>)> = Vec::new();
    for (entry, extra) in entries {
        match groups.iter_mut().find(|(host, _)| *host == entry.hostname) {
            Some((_, group)) => group.push((entry, extra)),
            None => groups.push((entry.hostname.as_str(), vec![(entry, extra)]))
        }
    }
    groups
}

fn seconds(secs: f64) -> TimeDelta {
    TimeDelta::nanoseconds((secs * 1e9).round() as i64)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedSpan {
    pub name: String,
    pub start: SystemTime,
    pub end: SystemTime,
    pub attributes: Vec<KeyValue>
}

impl PlannedSpan {
    fn new(
        name: impl Into<String>,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
        attributes: Vec<KeyValue>
    ) -> Self {
        let end = if end <= start { start + TimeDelta::microseconds(MIN_SPAN_MICROS) } else { end };
        Self { name: name.into(), start: start.into(), end: end.into(), attributes }
    }

    pub fn attribute(
        &self,
        key: &str
    ) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostPlan {
    pub host: String,
    pub span: PlannedSpan,
    pub stages: Vec<PlannedSpan>
}

/// Root, host and stage spans for one email, ready to export.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanPlan {
    pub message_id: String,
    pub root: PlannedSpan,
    pub hosts: Vec<HostPlan>
}

/// Lays out the span tree for `trace`; `None` when there are no delays.
pub fn plan_trace(
    trace: &EmailTrace,
    delays: &[Delay]
) -> Option<SpanPlan> {
    let first = delays.first()?;

    let mut by_host: Vec<(&str, Vec<&Delay>)> = Vec::new();
    for delay in delays {
        match by_host.iter_mut().find(|(host, _)| *host == delay.host) {
            Some((_, group)) => group.push(delay),
            None => by_host.push((delay.host.as_str(), vec![delay]))
        }
    }

    let mut root_start = first.start;
    let mut root_end = first.end;
    let mut hosts = Vec::with_capacity(by_host.len());
    for (host, host_delays) in &by_host {
        let source = representative_entry(&trace.entries, host);
        let stages = host_delays
            .iter()
            .map(|delay| {
                PlannedSpan::new(
                    format!("{host}/{}", delay.stage),
                    delay.start,
                    delay.end,
                    stage_attributes(delay, source)
                )
            })
            .collect();

        let start = host_delays.iter().map(|d| d.start).min().unwrap_or(first.start);
        let end = host_delays.iter().map(|d| d.end).max().unwrap_or(start);
        root_start = root_start.min(start);
        root_end = root_end.max(end);

        let family = host_delays[0].family;
        let attributes = vec![
            KeyValue::new("host.name", host.to_string()),
            KeyValue::new("mail.mta", family_name(family)),
        ];
        hosts.push(HostPlan {
            host: host.to_string(),
            span: PlannedSpan::new(host.to_string(), start, end, attributes),
            stages
        });
    }

    let mut host_names: Vec<&str> = by_host.iter().map(|(host, _)| *host).collect();
    host_names.sort_unstable();
    let root = PlannedSpan::new(
        ROOT_SPAN_NAME,
        root_start,
        root_end,
        root_attributes(trace, delays.len(), &host_names)
    );

    Some(SpanPlan { message_id: trace.message_id.clone(), root, hosts })
}

fn root_attributes(
    trace: &EmailTrace,
    delays_count: usize,
    hosts: &[&str]
) -> Vec<KeyValue> {
    let queue_ids: Vec<StringValue> =
        trace.queue_ids.iter().map(|id| StringValue::from(id.clone())).collect();

    let mut attributes = vec![
        KeyValue::new("mail.message_id", trace.message_id.clone()),
        KeyValue::new("mail.queue_ids", Value::Array(Array::String(queue_ids))),
        KeyValue::new("mail.delays_count", delays_count as i64),
        KeyValue::new("mail.hosts_count", hosts.len() as i64),
        KeyValue::new("mail.hosts", hosts.join(",")),
    ];
    if let Some(sender) = &trace.sender {
        attributes.push(KeyValue::new("mail.from", sender.clone()));
    }
    if let Some(recipient) = &trace.recipient {
        attributes.push(KeyValue::new("mail.to", recipient.clone()));
    }
    if let Some(duration) = trace.duration_seconds() {
        attributes.push(KeyValue::new("mail.duration_seconds", duration));
    }
    attributes
}

/// The host's relay line when there is one, its first entry otherwise.
fn representative_entry<'a>(
    entries: &'a [LogEntry],
    host: &str
) -> Option<&'a LogEntry> {
    let mut on_host = entries.iter().filter(|entry| entry.hostname == host);
    let first = on_host.clone().next();
    on_host.find(|entry| entry.relay_host.is_some()).or(first)
}

fn stage_attributes(
    delay: &Delay,
    source: Option<&LogEntry>
) -> Vec<KeyValue> {
    let mut attributes = vec![
        KeyValue::new("host.name", delay.host.clone()),
        KeyValue::new("mail.hostname", delay.host.clone()),
        KeyValue::new("mail.delay_name", delay.stage.as_str()),
    ];
    let Some(entry) = source else {
        return attributes;
    };

    if let Some(queue_id) = &entry.mail_id {
        attributes.push(KeyValue::new("mail.queue_id", queue_id.clone()));
    }
    if let Some(relay_host) = &entry.relay_host {
        attributes.push(KeyValue::new("mail.relay_host", relay_host.clone()));
    }
    if let Some(relay_ip) = &entry.relay_ip {
        attributes.push(KeyValue::new("mail.relay_ip", relay_ip.clone()));
    }
    if let Some(port) = entry.relay_port {
        attributes.push(KeyValue::new("mail.relay_port", i64::from(port)));
    }
    if let Some(code) = entry.smtp_code {
        attributes.push(KeyValue::new("mail.smtp_code", i64::from(code)));
    }
    if let Some(queued_as) = &entry.queued_as {
        attributes.push(KeyValue::new("mail.queued_as", queued_as.clone()));
    }

    let info = DelayInfo::parse(delay.family, &entry.message);
    if let Some(total) = info.reported_total {
        attributes.push(KeyValue::new("mail.delay", total));
    }
    for stage in delay.family.stages() {
        if let Some(secs) = info.get(*stage) {
            attributes.push(KeyValue::new(format!("mail.delay_{stage}"), secs));
        }
    }
    attributes
}

fn family_name(family: MtaFamily) -> &'static str {
    match family {
        MtaFamily::Postfix => "postfix",
        MtaFamily::Exim => "exim"
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn at(
        minute: u32,
        second: u32
    ) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .expect("utc offset")
            .with_ymd_and_hms(2025, 1, 2, 10, minute, second)
            .single()
            .expect("valid instant")
    }

    fn entry(
        host: &str,
        service: &str,
        when: Option<DateTime<FixedOffset>>,
        message: &str
    ) -> LogEntry {
        let mut entry = LogEntry {
            hostname: host.to_string(),
            service: service.to_string(),
            mail_id: Some("AAA111".to_string()),
            message: message.to_string(),
            timestamp: when,
            ..LogEntry::default()
        };
        crate::parser::enrich_from_text(&mut entry);
        entry
    }

    fn relay_entry(when: DateTime<FixedOffset>) -> LogEntry {
        entry(
            "mx1",
            "postfix/smtp",
            Some(when),
            "to=<bob@example.org>, relay=mx2[10.0.0.2]:25, delay=18, \
             delays=1.2/3.4/5.6/7.8, dsn=2.0.0, status=sent (250 2.0.0 Ok: queued as BBB222)",
        )
    }

    #[test]
    fn chains_postfix_stages_from_first_entry() {
        let entries = vec![
            relay_entry(at(0, 30)),
            entry("mx1", "postfix/qmgr", Some(at(0, 10)), "from=<a@example.com>, size=10"),
        ];

        let delays = build_delays("msg-1", &entries);
        let stages: Vec<Stage> = delays.iter().map(|d| d.stage).collect();
        assert_eq!(
            stages,
            vec![Stage::BeforeQmgr, Stage::InQmgr, Stage::ConnSetup, Stage::Transmission]
        );
        assert_eq!(delays[0].start, at(0, 10));
        assert_eq!(delays[0].end, at(0, 10) + TimeDelta::milliseconds(1200));
        for pair in delays.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(delays[3].end, at(0, 28));
    }

    #[test]
    fn hosts_restart_from_their_own_first_timestamp() {
        let entries = vec![
            relay_entry(at(0, 30)),
            entry("ex1", "exim", Some(at(0, 5)), "Completed QT=10s RT=2s DT=3s"),
            entry("mx1", "postfix/qmgr", Some(at(0, 10)), "removed"),
        ];

        let delays = build_delays("msg-1", &entries);
        assert_eq!(delays[0].host, "ex1");
        assert_eq!(delays[0].start, at(0, 5));
        assert_eq!(delays[0].family, MtaFamily::Exim);

        let mx1 = delays.iter().find(|d| d.host == "mx1").expect("mx1 delays");
        assert_eq!(mx1.start, at(0, 10));
    }

    #[test]
    fn zero_durations_get_epsilon_and_untimed_entries_are_skipped() {
        let entries = vec![
            entry("mx1", "postfix/smtp", None, "delays=9/9/9/9"),
            entry("mx1", "postfix/smtp", Some(at(1, 0)), "delays=0/0/0/0"),
        ];

        let delays = build_delays("msg-1", &entries);
        assert_eq!(delays.len(), 4);
        for delay in &delays {
            assert!(delay.end > delay.start);
        }
        assert_eq!(delays[3].end, at(1, 0) + TimeDelta::nanoseconds(4_000));
    }

    #[test]
    fn plans_three_levels_with_attributes() {
        let mut trace = EmailTrace::new("msg-1");
        trace.add_entry(entry("mx1", "postfix/cleanup", Some(at(0, 10)), "message-id=<msg-1>"));
        trace.add_entry(relay_entry(at(0, 30)));
        trace.add_entry(entry("ex1", "exim", Some(at(0, 31)), "Completed QT=4s RT=1s DT=1s"));

        let delays = build_delays(&trace.message_id, &trace.entries);
        let plan = plan_trace(&trace, &delays).expect("plan");

        assert_eq!(plan.root.name, "email.delivery");
        assert_eq!(plan.hosts.len(), 2);
        assert_eq!(plan.hosts[0].span.name, "mx1");
        assert_eq!(plan.hosts[0].stages[0].name, "mx1/before_qmgr");
        assert_eq!(plan.hosts[1].stages.len(), 3);

        assert_eq!(plan.root.start, SystemTime::from(at(0, 10)));
        assert_eq!(plan.root.end, SystemTime::from(at(0, 35)));
        assert_eq!(plan.root.attribute("mail.hosts"), Some(&Value::from("ex1,mx1")));
        assert_eq!(plan.root.attribute("mail.hosts_count"), Some(&Value::I64(2)));
        assert_eq!(plan.root.attribute("mail.delays_count"), Some(&Value::I64(7)));
        assert_eq!(plan.root.attribute("mail.to"), Some(&Value::from("bob@example.org")));

        let stage = &plan.hosts[0].stages[2];
        assert_eq!(stage.attribute("mail.relay_host"), Some(&Value::from("mx2")));
        assert_eq!(stage.attribute("mail.relay_port"), Some(&Value::I64(25)));
        assert_eq!(stage.attribute("mail.smtp_code"), Some(&Value::I64(250)));
        assert_eq!(stage.attribute("mail.queued_as"), Some(&Value::from("BBB222")));
        assert_eq!(stage.attribute("mail.delay_conn_setup"), Some(&Value::F64(5.6)));
    }

    #[test]
    fn zero_width_spans_are_floored() {
        let span = PlannedSpan::new("mx1", at(0, 0), at(0, 0), Vec::new());
        assert_eq!(
            span.end.duration_since(span.start).expect("end after start"),
            std::time::Duration::from_micros(1)
        );
    }

    #[test]
    fn no_delays_no_plan() {
        assert_eq!(plan_trace(&EmailTrace::new("msg-1"), &[]), None);
    }
}
