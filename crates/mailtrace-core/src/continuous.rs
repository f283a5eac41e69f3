use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::correlate::{EmailTrace, correlate};
use crate::error::TraceError;
use crate::model::{LogEntry, LogQuery};
use crate::settings::TracingSettings;
use crate::source::LogSource;
use crate::telemetry::{TraceEmitter, emit_all};

/// Content identity of a log line, stable across overlapping queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    timestamp: String,
    hostname: String,
    service: String,
    message: String
}

impl EntryKey {
    pub fn of(entry: &LogEntry) -> Self {
        let timestamp = match entry.timestamp {
            Some(at) => at.to_rfc3339(),
            None => entry.datetime.clone()
        };
        Self {
            timestamp,
            hostname: entry.hostname.clone(),
            service: entry.service.clone(),
            message: entry.message.clone()
        }
    }
}

#[derive(Debug, Clone)]
struct Buffered {
    key: EntryKey,
    entry: LogEntry,
    since_round: u64
}

#[derive(Debug, Clone, Copy)]
struct Growth {
    entries: usize,
    grew_at: u64
}

/// Entries waiting for the rest of their email across polling rounds.
///
/// An email is handed out once its entry count stayed the same for
/// `hold_rounds` rounds. Keys of handed-out entries are kept for
/// `remember_rounds` so re-polled lines are not buffered twice.
#[derive(Debug)]
pub struct CorrelationBuffer {
    round: u64,
    hold_rounds: u64,
    max_pending_rounds: u64,
    remember_rounds: u64,
    entries: Vec<Buffered>,
    buffered_keys: HashSet<EntryKey>,
    emitted_keys: HashMap<EntryKey, u64>,
    growth: HashMap<String, Growth>
}

impl CorrelationBuffer {
    pub fn new(
        hold_rounds: u32,
        max_pending_rounds: u32,
        remember_rounds: u32
    ) -> Self {
        Self {
            round: 0,
            hold_rounds: u64::from(hold_rounds),
            max_pending_rounds: u64::from(max_pending_rounds.max(1)),
            remember_rounds: u64::from(remember_rounds.max(1)),
            entries: Vec::new(),
            buffered_keys: HashSet::new(),
            emitted_keys: HashMap::new(),
            growth: HashMap::new()
        }
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn pending_entries(&self) -> usize {
        self.entries.len()
    }

    /// Adds entries not seen before; returns how many were new.
    pub fn ingest(
        &mut self,
        entries: Vec<LogEntry>
    ) -> usize {
        let mut fresh = 0;
        for entry in entries {
            let key = EntryKey::of(&entry);
            if self.buffered_keys.contains(&key) || self.emitted_keys.contains_key(&key) {
                continue;
            }
            self.buffered_keys.insert(key.clone());
            self.entries.push(Buffered { key, entry, since_round: self.round });
            fresh += 1;
        }
        fresh
    }

    /// Closes a round and returns the emails that stopped growing.
    pub fn collect_ready(&mut self) -> Vec<EmailTrace> {
        self.round += 1;
        let round = self.round;

        let snapshot: Vec<LogEntry> = self.entries.iter().map(|b| b.entry.clone()).collect();
        let correlation = correlate(&snapshot);

        let mut ready = Vec::new();
        let mut correlated: HashSet<EntryKey> = HashSet::new();
        for (message_id, trace) in correlation.traces {
            let count = trace.entries.len();
            let growth = self
                .growth
                .entry(message_id.clone())
                .or_insert(Growth { entries: count, grew_at: round });
            if count != growth.entries {
                *growth = Growth { entries: count, grew_at: round };
            }

            if round - growth.grew_at >= self.hold_rounds {
                self.growth.remove(&message_id);
                for entry in &trace.entries {
                    let key = EntryKey::of(entry);
                    self.buffered_keys.remove(&key);
                    self.emitted_keys.insert(key, round);
                }
                ready.push(trace);
            } else {
                correlated.extend(trace.entries.iter().map(EntryKey::of));
            }
        }

        let max_pending = self.max_pending_rounds;
        let emitted = &self.emitted_keys;
        let buffered_keys = &mut self.buffered_keys;
        let mut expired = 0usize;
        self.entries.retain(|buffered| {
            if emitted.get(&buffered.key) == Some(&round) {
                return false;
            }
            if correlated.contains(&buffered.key) || round - buffered.since_round < max_pending {
                return true;
            }
            buffered_keys.remove(&buffered.key);
            expired += 1;
            false
        });
        if expired > 0 {
            debug!("uncorrelated entries expired: expired={expired}, round={round}");
        }

        let horizon = self.remember_rounds;
        self.emitted_keys.retain(|_, emitted_at| round - *emitted_at < horizon);

        ready
    }

    /// Hands out everything still buffered, ready or not.
    pub fn drain(&mut self) -> Vec<EmailTrace> {
        let snapshot: Vec<LogEntry> = self.entries.drain(..).map(|b| b.entry).collect();
        self.buffered_keys.clear();
        self.growth.clear();
        correlate(&snapshot).traces.into_values().collect()
    }
}

/// Polls every source on an interval and exports finished emails.
pub struct ContinuousTracer<E: TraceEmitter> {
    sources: Vec<Box<dyn LogSource>>,
    emitter: E,
    buffer: CorrelationBuffer,
    poll_interval: Duration,
    lookback: Duration
}

impl<E: TraceEmitter> ContinuousTracer<E> {
    pub fn new(
        sources: Vec<Box<dyn LogSource>>,
        emitter: E,
        settings: &TracingSettings
    ) -> Self {
        let poll = settings.poll_interval.max(Duration::from_secs(1));
        // Keys must outlive every later window that still overlaps them.
        let remember = settings.lookback.as_secs().div_ceil(poll.as_secs()) as u32 + 1;
        Self {
            sources,
            emitter,
            buffer: CorrelationBuffer::new(settings.hold_rounds, settings.max_pending_rounds, remember),
            poll_interval: poll,
            lookback: settings.lookback
        }
    }

    pub fn buffer(&self) -> &CorrelationBuffer {
        &self.buffer
    }

    /// Queries `[start, end)` on every source and exports the emails that
    /// became ready; returns how many were exported.
    ///
    /// Fails only when every source failed.
    pub async fn run_cycle(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>
    ) -> Result<usize, TraceError> {
        let query = LogQuery::between(start, end);
        let mut fetched = Vec::new();
        let mut last_error = None;
        let mut failures = 0usize;

        for source in &self.sources {
            match source.query(&query).await {
                Ok(entries) => fetched.extend(entries),
                Err(err) => {
                    warn!(
                        "poll failed: host={}, code={}, error={err}, hint={}",
                        source.host().unwrap_or("*"),
                        err.code(),
                        err.suggestion()
                    );
                    failures += 1;
                    last_error = Some(err);
                }
            }
        }
        if let Some(err) = last_error
            && failures == self.sources.len()
        {
            return Err(err);
        }

        let fetched_count = fetched.len();
        let fresh = self.buffer.ingest(fetched);
        let ready = self.buffer.collect_ready();
        let emitted = emit_all(&mut self.emitter, &ready);

        info!(
            "poll round done: round={}, fetched={fetched_count}, new={fresh}, ready={}, emitted={emitted}, pending={}",
            self.buffer.round(),
            ready.len(),
            self.buffer.pending_entries()
        );
        Ok(emitted)
    }

    /// Polls until `shutdown` fires, then exports what is still buffered and
    /// shuts the emitter down. Returns the number of exported emails.
    pub async fn run(
        mut self,
        shutdown: CancellationToken
    ) -> Result<usize, TraceError> {
        info!(
            "continuous tracing started: sources={}, poll_interval={}s, lookback={}s",
            self.sources.len(),
            self.poll_interval.as_secs(),
            self.lookback.as_secs()
        );

        let lookback = TimeDelta::from_std(self.lookback).unwrap_or(TimeDelta::zero());
        let mut total = 0usize;
        let mut last_end = Utc::now();

        loop {
            let end = Utc::now();
            match self.run_cycle(last_end - lookback, end).await {
                Ok(emitted) => total += emitted,
                Err(err) => warn!(
                    "poll round failed: code={}, error={err}, hint={}",
                    err.code(),
                    err.suggestion()
                )
            }
            last_end = end;

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("continuous tracing stopping");
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        let remaining = self.buffer.drain();
        if !remaining.is_empty() {
            info!("exporting buffered traces: count={}", remaining.len());
        }
        total += emit_all(&mut self.emitter, &remaining);
        self.emitter.flush()?;
        self.emitter.shutdown()?;
        info!("continuous tracing stopped: emitted={total}");
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::{FixedOffset, TimeZone};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::span::Delay;

    fn entry(
        host: &str,
        queue_id: &str,
        second: u32,
        message: &str
    ) -> LogEntry {
        let mut entry = LogEntry {
            hostname: host.to_string(),
            service: "postfix/smtp".to_string(),
            mail_id: Some(queue_id.to_string()),
            message: message.to_string(),
            timestamp: FixedOffset::east_opt(0)
                .expect("utc offset")
                .with_ymd_and_hms(2025, 1, 2, 10, 0, second)
                .single(),
            ..LogEntry::default()
        };
        crate::parser::enrich_from_text(&mut entry);
        entry
    }

    fn first_hop() -> Vec<LogEntry> {
        vec![
            entry("mx1", "AAA111", 0, "message-id=<msg-1>"),
            entry(
                "mx1",
                "AAA111",
                1,
                "to=<bob@example.org>, relay=mx2[10.0.0.2]:25, delays=0.1/0.1/0.1/0.1, \
                 status=sent (250 2.0.0 Ok: queued as BBB222)",
            ),
        ]
    }

    fn second_hop() -> Vec<LogEntry> {
        vec![entry("mx2", "BBB222", 3, "to=<bob@example.org>, delays=0.2/0.2/0.2/0.2, status=sent (delivered)")]
    }

    #[test]
    fn holds_until_quiet_then_releases_once() {
        let mut buffer = CorrelationBuffer::new(2, 30, 3);

        assert_eq!(buffer.ingest(first_hop()), 2);
        assert!(buffer.collect_ready().is_empty());

        assert_eq!(buffer.ingest(second_hop()), 1);
        assert!(buffer.collect_ready().is_empty());
        assert!(buffer.collect_ready().is_empty());

        let ready = buffer.collect_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].message_id, "msg-1");
        assert_eq!(ready[0].entries.len(), 3);
        assert_eq!(buffer.pending_entries(), 0);

        // Overlapping re-poll of already exported lines.
        let mut again = first_hop();
        again.extend(second_hop());
        assert_eq!(buffer.ingest(again), 0);
        assert!(buffer.collect_ready().is_empty());
    }

    #[test]
    fn duplicate_lines_are_buffered_once() {
        let mut buffer = CorrelationBuffer::new(1, 30, 3);
        let mut lines = first_hop();
        lines.extend(first_hop());

        assert_eq!(buffer.ingest(lines), 2);
        assert_eq!(buffer.pending_entries(), 2);
    }

    #[test]
    fn uncorrelated_entries_expire() {
        let mut buffer = CorrelationBuffer::new(1, 2, 3);
        buffer.ingest(vec![entry("mx9", "ZZZ999", 0, "from=<x@example.net>")]);

        assert!(buffer.collect_ready().is_empty());
        assert_eq!(buffer.pending_entries(), 1);
        assert!(buffer.collect_ready().is_empty());
        assert_eq!(buffer.pending_entries(), 0);
    }

    #[test]
    fn late_message_id_claims_waiting_entries() {
        let mut buffer = CorrelationBuffer::new(0, 5, 3);
        buffer.ingest(second_hop());
        assert!(buffer.collect_ready().is_empty());

        buffer.ingest(first_hop());
        let ready = buffer.collect_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].entries.len(), 3);
    }

    #[test]
    fn drain_returns_everything() {
        let mut buffer = CorrelationBuffer::new(5, 30, 3);
        buffer.ingest(first_hop());
        assert!(buffer.collect_ready().is_empty());

        let drained = buffer.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(buffer.pending_entries(), 0);
    }

    struct ScriptedSource {
        polls: Mutex<Vec<Result<Vec<LogEntry>, TraceError>>>,
        windows: Arc<Mutex<Vec<LogQuery>>>
    }

    #[async_trait]
    impl LogSource for ScriptedSource {
        fn host(&self) -> Option<&str> {
            None
        }

        async fn query(
            &self,
            query: &LogQuery
        ) -> Result<Vec<LogEntry>, TraceError> {
            self.windows.lock().expect("windows lock").push(query.clone());
            let mut polls = self.polls.lock().expect("polls lock");
            if polls.is_empty() { Ok(Vec::new()) } else { polls.remove(0) }
        }
    }

    #[derive(Default, Clone)]
    struct Recording {
        emitted: Arc<Mutex<Vec<String>>>,
        shut_down: Arc<Mutex<bool>>
    }

    impl TraceEmitter for Recording {
        fn emit(
            &mut self,
            trace: &EmailTrace,
            delays: &[Delay]
        ) -> Result<bool, TraceError> {
            if delays.is_empty() {
                return Ok(false);
            }
            self.emitted.lock().expect("emitted lock").push(trace.message_id.clone());
            Ok(true)
        }

        fn flush(&mut self) -> Result<(), TraceError> {
            Ok(())
        }

        fn shutdown(&mut self) -> Result<(), TraceError> {
            *self.shut_down.lock().expect("shutdown lock") = true;
            Ok(())
        }
    }

    fn settings(hold_rounds: u32) -> TracingSettings {
        TracingSettings { hold_rounds, ..TracingSettings::default() }
    }

    #[tokio::test]
    async fn cycle_exports_ready_traces() {
        let windows = Arc::new(Mutex::new(Vec::new()));
        let source = ScriptedSource {
            polls: Mutex::new(vec![Ok(first_hop()), Ok(second_hop())]),
            windows: windows.clone(),
        };
        let recording = Recording::default();
        let mut tracer = ContinuousTracer::new(vec![Box::new(source)], recording.clone(), &settings(1));

        let start = Utc::now();
        let end = start + TimeDelta::seconds(60);
        assert_eq!(tracer.run_cycle(start, end).await.expect("first cycle"), 0);
        assert_eq!(tracer.run_cycle(start, end).await.expect("second cycle"), 0);
        assert_eq!(tracer.run_cycle(start, end).await.expect("third cycle"), 1);

        assert_eq!(recording.emitted.lock().expect("emitted lock").clone(), vec!["msg-1"]);
        assert_eq!(windows.lock().expect("windows lock")[0], LogQuery::between(start, end));
    }

    #[tokio::test]
    async fn cycle_fails_only_when_every_source_fails() {
        let failing = || ScriptedSource {
            polls: Mutex::new(vec![Err(TraceError::network("down", "check network"))]),
            windows: Arc::new(Mutex::new(Vec::new())),
        };
        let now = Utc::now();

        let mut all_down = ContinuousTracer::new(vec![Box::new(failing())], Recording::default(), &settings(1));
        let err = all_down.run_cycle(now, now).await.expect_err("only source failed");
        assert_eq!(err.code(), "CONNECTION_NETWORK");

        let healthy = ScriptedSource {
            polls: Mutex::new(vec![Ok(first_hop())]),
            windows: Arc::new(Mutex::new(Vec::new())),
        };
        let mut partial = ContinuousTracer::new(
            vec![Box::new(failing()), Box::new(healthy)],
            Recording::default(),
            &settings(1)
        );
        partial.run_cycle(now, now).await.expect("one source answered");
        assert_eq!(partial.buffer().pending_entries(), 2);
    }

    #[tokio::test]
    async fn run_drains_and_shuts_down_on_cancel() {
        let source = ScriptedSource {
            polls: Mutex::new(vec![Ok(first_hop())]),
            windows: Arc::new(Mutex::new(Vec::new())),
        };
        let recording = Recording::default();
        let tracer = ContinuousTracer::new(vec![Box::new(source)], recording.clone(), &settings(10));

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let emitted = tracer.run(shutdown).await.expect("run");

        assert_eq!(emitted, 1);
        assert!(*recording.shut_down.lock().expect("shutdown lock"));
    }
}
