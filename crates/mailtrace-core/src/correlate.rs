use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::OnceLock;

use chrono::{DateTime, FixedOffset};
use regex::Regex;
use tracing::debug;

use crate::model::LogEntry;

/// Every log entry of one email across all of its hops.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailTrace {
    pub message_id: String,
    pub queue_ids: BTreeSet<String>,
    /// Arrival order, not re-sorted.
    pub entries: Vec<LogEntry>,
    pub start: Option<DateTime<FixedOffset>>,
    pub end: Option<DateTime<FixedOffset>>,
    pub sender: Option<String>,
    pub recipient: Option<String>
}

impl EmailTrace {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            queue_ids: BTreeSet::new(),
            entries: Vec::new(),
            start: None,
            end: None,
            sender: None,
            recipient: None
        }
    }

    /// Appends `entry`, widening the time bounds and filling sender and
    /// recipient the first time they show up.
    pub fn add_entry(
        &mut self,
        entry: LogEntry
    ) {
        if let Some(id) = &entry.mail_id {
            self.queue_ids.insert(id.clone());
        }
        if let Some(at) = entry.timestamp {
            if self.start.is_none_or(|start| at < start) {
                self.start = Some(at);
            }
            if self.end.is_none_or(|end| at > end) {
                self.end = Some(at);
            }
        }
        if self.sender.is_none() {
            self.sender = capture(sender_re(), &entry.message);
        }
        if self.recipient.is_none() {
            self.recipient = capture(recipient_re(), &entry.message);
        }
        self.entries.push(entry);
    }

    /// Seconds between the earliest and latest entry.
    pub fn duration_seconds(&self) -> Option<f64> {
        let (start, end) = (self.start?, self.end?);
        Some((end - start).num_microseconds()? as f64 / 1_000_000.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Correlation {
    pub traces: BTreeMap<String, EmailTrace>,
    /// Indices of entries that carried a queue id but no resolvable message-id.
    pub dropped: Vec<usize>
}

impl Correlation {
    pub fn dropped_count(&self) -> usize {
        self.dropped.len()
    }
}

/// Message-id from the mapped field, then `message-id=<...>`, then a bare
/// `id=user@domain`.
pub fn extract_message_id(entry: &LogEntry) -> Option<String> {
    if let Some(id) = entry.message_id.as_deref().filter(|id| !id.is_empty()) {
        return Some(id.to_string());
    }
    capture(message_id_re(), &entry.message).or_else(|| capture(loose_id_re(), &entry.message))
}

/// Groups `entries` by the email they belong to, following queue-id
/// hand-offs between hosts.
pub fn correlate(entries: &[LogEntry]) -> Correlation {
    let explicit: Vec<Option<String>> = entries.iter().map(extract_message_id).collect();

    let mut by_host: HashMap<(&str, &str), String> = HashMap::new();
    for (entry, message_id) in entries.iter().zip(&explicit) {
        if let (Some(queue_id), Some(message_id)) = (entry.mail_id.as_deref(), message_id) {
            by_host
                .entry((entry.hostname.as_str(), queue_id))
                .or_insert_with(|| message_id.clone());
        }
    }

    // Queue ids are only unique per host, but the receiving host of a
    // hand-off is not known here, so `queued as` ids bind on any host.
    let mut handed_off: HashMap<&str, String> = HashMap::new();
    loop {
        let mut changed = false;
        for entry in entries {
            let (Some(queue_id), Some(queued_as)) =
                (entry.mail_id.as_deref(), entry.queued_as.as_deref())
            else {
                continue;
            };
            if handed_off.contains_key(queued_as) {
                continue;
            }
            let known = by_host
                .get(&(entry.hostname.as_str(), queue_id))
                .or_else(|| handed_off.get(queue_id))
                .cloned();
            if let Some(message_id) = known {
                handed_off.insert(queued_as, message_id);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut correlation = Correlation::default();
    for (idx, (entry, message_id)) in entries.iter().zip(explicit).enumerate() {
        let resolved = match entry.mail_id.as_deref() {
            Some(queue_id) => by_host
                .get(&(entry.hostname.as_str(), queue_id))
                .or_else(|| handed_off.get(queue_id))
                .cloned()
                .or(message_id),
            None => message_id
        };

        match resolved {
            Some(message_id) => correlation
                .traces
                .entry(message_id.clone())
                .or_insert_with(|| EmailTrace::new(message_id))
                .add_entry(entry.clone()),
            None if entry.mail_id.is_some() => correlation.dropped.push(idx),
            None => {}
        }
    }

    if !correlation.dropped.is_empty() {
        debug!(
            "uncorrelated entries: dropped={}, traces={}",
            correlation.dropped.len(),
            correlation.traces.len()
        );
    }
    correlation
}

fn capture(
    re: &Regex,
    text: &str
) -> Option<String> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|value| value.as_str().to_string())
}

fn message_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"message-id=<([^>]+)>").expect("message-id regex"))
}

fn loose_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bid=([\w.@-]+@[\w.-]+)").expect("id regex"))
}

fn sender_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"from=<([^>]*)>").expect("sender regex"))
}

fn recipient_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"to=<([^>]*)>").expect("recipient regex"))
}
