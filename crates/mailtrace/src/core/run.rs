use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use mailtrace_core::hop::{HopDecision, HopPrompt, TraceOutcome, trace_hops};
use mailtrace_core::settings::Settings;
use mailtrace_core::source::ConfiguredConnector;
use mailtrace_core::{LogEntry, RelayResult};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::warn;

use super::discover;
use crate::args::SearchArgs;

/// Interactive trace: discovery, id selection, then the hop loop.
pub async fn run(
    settings: Settings,
    search: &SearchArgs
) -> Result<()> {
    let auto_continue = settings.auto_continue;
    let connector = ConfiguredConnector::new(Arc::new(settings));

    let mails = discover(connector.settings(), &connector, search).await?;
    if mails.is_empty() {
        warn!("no logs found: start_host={}", search.start_host);
        println!("No logs found.");
        return Ok(());
    }

    let mut out = io::stdout().lock();
    for mail in &mails {
        writeln!(out, "== {} ({}) ==", mail.mail_id, mail.host)?;
        for entry in &mail.entries {
            writeln!(out, "{entry}")?;
        }
        writeln!(out)?;
    }
    drop(out);

    let mut prompt = LinePrompt::stdin();
    let Some(answer) = prompt.ask("Enter trace ID: ").await? else {
        bail!("no trace id given, stdin was closed");
    };
    let Some(mail) = mails.iter().find(|mail| mail.mail_id == answer) else {
        bail!("trace id {answer} was not found in the results");
    };

    let report =
        trace_hops(&connector, &mut prompt, &mail.host, &mail.mail_id, auto_continue)
            .await;
    match report.outcome {
        TraceOutcome::Stopped | TraceOutcome::NoMoreHops => {
            println!("Trace finished after {} hop(s).", report.steps.len());
        }
        TraceOutcome::CycleDetected { host, mail_id } => {
            println!("Stopped: {mail_id} on {host} was already traced.");
        }
        TraceOutcome::Failed { host, error } => {
            return Err(error).with_context(|| format!("tracing stopped at {host}"));
        }
    }
    Ok(())
}

/// Reads hop decisions line by line, normally from the terminal.
struct LinePrompt<R> {
    lines: Lines<R>
}

impl LinePrompt<BufReader<Stdin>> {
    fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R: AsyncBufRead + Unpin + Send> LinePrompt<R> {
    fn new(reader: R) -> Self {
        Self { lines: reader.lines() }
    }

    /// `None` once the input is closed.
    async fn ask(
        &mut self,
        question: &str
    ) -> Result<Option<String>> {
        print!("{question}");
        io::stdout().flush()?;
        let line = self
            .lines
            .next_line()
            .await
            .context("failed to read from stdin")?;
        Ok(line.map(|line| line.trim().to_string()))
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> HopPrompt for LinePrompt<R> {
    fn show(
        &mut self,
        host: &str,
        mail_id: &str,
        entries: &[LogEntry]
    ) {
        println!("== {mail_id} on {host} ==");
        for entry in entries {
            println!("{entry}");
        }
    }

    fn relayed(
        &mut self,
        _host: &str,
        relay: &RelayResult
    ) {
        println!("{}", describe_relay(relay));
    }

    async fn decide(
        &mut self,
        _host: &str,
        relay: &RelayResult
    ) -> HopDecision {
        let question = format!(
            "Trace next hop: {}? (Y/n/local/<next hop>): ",
            relay.relay_host
        );
        match self.ask(&question).await {
            Ok(Some(answer)) => HopDecision::parse(&answer),
            Ok(None) => {
                println!();
                HopDecision::Stop
            }
            Err(err) => {
                warn!("prompt failed, stopping: error={err:#}");
                HopDecision::Stop
            }
        }
    }
}

fn describe_relay(relay: &RelayResult) -> String {
    format!(
        "Relayed to {} ({}:{}) with new ID {} (SMTP {})",
        relay.relay_host, relay.relay_ip, relay.relay_port, relay.mail_id, relay.smtp_code
    )
}
