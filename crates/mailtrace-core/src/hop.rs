use std::collections::HashSet;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::TraceError;
use crate::model::{LogEntry, LogQuery, RelayResult, TimeWindow};
use crate::relay::extract_relay;
use crate::source::{LogSource, SourceConnector};

/// First successful hand-off among `entries`, in arrival order.
pub fn first_relay(entries: &[LogEntry]) -> Option<RelayResult> {
    entries.iter().find_map(|entry| extract_relay(&entry.message))
}

/// Looks up `mail_id` on the source's host and returns where it went next.
///
/// `Ok(None)` means delivery ended on this host.
pub async fn trace_next_hop(
    source: &dyn LogSource,
    mail_id: &str
) -> Result<Option<RelayResult>, TraceError> {
    let entries = source.query(&LogQuery::for_mail_id(mail_id)).await?;
    Ok(first_relay(&entries))
}

/// Queries `mail_id` and, when no relay turns up, retries once without the
/// host-name restriction.
pub async fn query_with_fallback(
    source: &dyn LogSource,
    mail_id: &str
) -> Result<(Vec<LogEntry>, Option<RelayResult>), TraceError> {
    let query = LogQuery::for_mail_id(mail_id);
    let entries = source.query(&query).await?;
    if let Some(relay) = first_relay(&entries) {
        return Ok((entries, Some(relay)));
    }

    let Some(relaxed) = source.without_host_filter() else {
        return Ok((entries, None));
    };
    info!(
        "no relay found, retrying without host filter: host={}, mail_id={mail_id}",
        source.host().unwrap_or("*")
    );
    let retried = relaxed.query(&query).await?;
    let relay = first_relay(&retried);
    if retried.is_empty() { Ok((entries, relay)) } else { Ok((retried, relay)) }
}

/// What to do after a hop was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HopDecision {
    /// Follow the relay to the host it names.
    Continue,
    /// Keep tracing the new id on the current host.
    StayLocal,
    /// Trace the new id on a host the user typed.
    JumpTo(String),
    Stop
}

impl HopDecision {
    /// Reads a `Y/n/local/<host>` answer; empty means yes.
    pub fn parse(answer: &str) -> Self {
        let answer = answer.trim();
        match answer.to_ascii_lowercase().as_str() {
            "" | "y" | "yes" => Self::Continue,
            "n" | "no" => Self::Stop,
            "local" => Self::StayLocal,
            _ => Self::JumpTo(answer.to_string())
        }
    }
}

#[async_trait]
pub trait HopPrompt: Send {
    /// Called with every host's entries for the traced id.
    fn show(
        &mut self,
        _host: &str,
        _mail_id: &str,
        _entries: &[LogEntry]
    ) {
    }

    /// Called when a hand-off was found, before any decision.
    fn relayed(
        &mut self,
        _host: &str,
        _relay: &RelayResult
    ) {
    }

    async fn decide(
        &mut self,
        host: &str,
        relay: &RelayResult
    ) -> HopDecision;
}

/// Prompt that always follows the relay.
#[derive(Debug, Default)]
pub struct AutoContinue;

#[async_trait]
impl HopPrompt for AutoContinue {
    async fn decide(
        &mut self,
        _host: &str,
        _relay: &RelayResult
    ) -> HopDecision {
        HopDecision::Continue
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopStep {
    pub from_host: String,
    /// Queue id on `from_host`.
    pub mail_id: String,
    pub relay: RelayResult
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceOutcome {
    Stopped,
    NoMoreHops,
    /// The walk came back to a host and id it had already traced.
    CycleDetected { host: String, mail_id: String },
    Failed { host: String, error: TraceError }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceReport {
    pub steps: Vec<HopStep>,
    pub outcome: TraceOutcome
}

/// Walks hops starting at `host`, asking `prompt` before each one unless
/// `auto_continue` is set.
pub async fn trace_hops(
    connector: &dyn SourceConnector,
    prompt: &mut dyn HopPrompt,
    host: &str,
    mail_id: &str,
    auto_continue: bool
) -> TraceReport {
    let mut steps = Vec::new();
    let mut visited = HashSet::new();
    let mut host = host.to_string();
    let mut mail_id = mail_id.to_string();
    let mut source: Option<Box<dyn LogSource>> = None;

    let outcome = loop {
        if !visited.insert((host.clone(), mail_id.clone())) {
            warn!("hop cycle detected: host={host}, mail_id={mail_id}");
            break TraceOutcome::CycleDetected { host, mail_id };
        }

        let current = match source.take() {
            Some(current) => current,
            None => match connector.connect(&host).await {
                Ok(current) => current,
                Err(error) => break TraceOutcome::Failed { host, error },
            },
        };

        let (entries, relay) =
            match query_with_fallback(current.as_ref(), &mail_id).await {
                Ok(found) => found,
                Err(error) => break TraceOutcome::Failed { host, error },
            };
        prompt.show(&host, &mail_id, &entries);

        let Some(relay) = relay else {
            info!("no more hops: host={host}, mail_id={mail_id}");
            break TraceOutcome::NoMoreHops;
        };

        prompt.relayed(&host, &relay);
        let decision = if auto_continue {
            HopDecision::Continue
        } else {
            prompt.decide(&host, &relay).await
        };
        let next_host = match decision {
            HopDecision::Continue => relay.relay_host.clone(),
            HopDecision::StayLocal => host.clone(),
            HopDecision::JumpTo(target) => target,
            HopDecision::Stop => break TraceOutcome::Stopped
        };

        info!(
            "hop: from={host}, to={}, mail_id={mail_id}, next_mail_id={}, smtp_code={}",
            relay.relay_host, relay.mail_id, relay.smtp_code
        );
        if next_host == host {
            source = Some(current);
        }
        let next_mail_id = relay.mail_id.clone();
        steps.push(HopStep { from_host: host, mail_id, relay });
        host = next_host;
        mail_id = next_mail_id;
    };

    TraceReport { steps, outcome }
}

/// Follows every hop without asking.
pub async fn trace_automatic(
    connector: &dyn SourceConnector,
    host: &str,
    mail_id: &str
) -> TraceReport {
    trace_hops(connector, &mut AutoContinue, host, mail_id, true).await
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredMail {
    pub mail_id: String,
    /// Host named by the first entry, which may differ from the queried one.
    pub host: String,
    pub entries: Vec<LogEntry>
}

/// Finds the queue ids matching `keywords` on each host and loads their
/// full history.
///
/// A host that fails is logged and skipped; the error is returned only when
/// every host failed.
pub async fn find_mail_ids(
    connector: &dyn SourceConnector,
    hosts: &[String],
    keywords: &[String],
    window: Option<TimeWindow>
) -> Result<Vec<DiscoveredMail>, TraceError> {
    let mut found: Vec<DiscoveredMail> = Vec::new();
    let mut last_error = None;
    let mut failures = 0usize;

    for host in hosts {
        match discover_on_host(connector, host, keywords, window).await {
            Ok(mails) => {
                for mail in mails {
                    if found.iter().any(|known| known.mail_id == mail.mail_id) {
                        debug!("duplicate mail id skipped: host={host}, mail_id={}", mail.mail_id);
                        continue;
                    }
                    found.push(mail);
                }
            }
            Err(err) => {
                warn!(
                    "keyword search failed: host={host}, code={}, error={err}, hint={}",
                    err.code(),
                    err.suggestion()
                );
                failures += 1;
                last_error = Some(err);
            }
        }
    }

    match last_error {
        Some(err) if failures == hosts.len() => Err(err),
        _ => Ok(found)
    }
}

async fn discover_on_host(
    connector: &dyn SourceConnector,
    host: &str,
    keywords: &[String],
    window: Option<TimeWindow>
) -> Result<Vec<DiscoveredMail>, TraceError> {
    let source = connector.connect(host).await?;
    let matches = source
        .query(&LogQuery::for_keywords(keywords.to_vec(), window))
        .await?;

    let mut ids: Vec<String> = Vec::new();
    for id in matches.iter().filter_map(|entry| entry.mail_id.as_ref()) {
        if !ids.contains(id) {
            ids.push(id.clone());
        }
    }

    let mut mails = Vec::with_capacity(ids.len());
    for mail_id in ids {
        let entries = source.query(&LogQuery::for_mail_id(&mail_id)).await?;
        let actual_host = entries
            .first()
            .map(|entry| entry.hostname.clone())
            .unwrap_or_else(|| host.to_string());
        mails.push(DiscoveredMail { mail_id, host: actual_host, entries });
    }
    info!("keyword search done: host={host}, mail_ids={}", mails.len());
    Ok(mails)
}
