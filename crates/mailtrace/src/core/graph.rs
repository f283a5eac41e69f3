use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use mailtrace_core::graph::MailGraph;
use mailtrace_core::hop::{TraceOutcome, trace_automatic};
use mailtrace_core::settings::Settings;
use mailtrace_core::source::ConfiguredConnector;
use tracing::{info, warn};

use super::discover;
use crate::args::SearchArgs;

/// Follows every discovered mail and writes the hop graph as dot.
pub async fn graph(
    settings: Settings,
    search: &SearchArgs,
    output: Option<&str>
) -> Result<()> {
    let connector = ConfiguredConnector::new(Arc::new(settings));
    let mails = discover(connector.settings(), &connector, search).await?;
    if mails.is_empty() {
        warn!("no logs found: start_host={}", search.start_host);
    }

    let mut graph = MailGraph::new();
    for mail in &mails {
        let report = trace_automatic(&connector, &mail.host, &mail.mail_id).await;
        if let TraceOutcome::Failed { host, error } = &report.outcome {
            warn!(
                "graph walk cut short: mail_id={}, host={host}, code={}, error={error}",
                mail.mail_id,
                error.code()
            );
        }
        graph.add_steps(&report.steps);
    }

    info!(
        "graph built: mails={}, hosts={}, edges={}",
        mails.len(),
        graph.hosts().len(),
        graph.edges().len()
    );
    write_graph(&graph, output)
}

fn write_graph(
    graph: &MailGraph,
    output: Option<&str>
) -> Result<()> {
    match output.map(str::trim).filter(|path| !path.is_empty() && *path != "-") {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create {path}"))?;
            let mut writer = BufWriter::new(file);
            graph.to_dot(&mut writer)?;
            writer.flush().with_context(|| format!("failed to write {path}"))?;
            info!("graph written: path={path}");
        }
        None => {
            let mut stdout = io::stdout().lock();
            graph.to_dot(&mut stdout)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn writes_dot_to_a_file() {
        let path = std::env::temp_dir()
            .join(format!("mailtrace-graph-{}.dot", std::process::id()));
        let mut graph = MailGraph::new();
        graph.add_hop("mx1", "mx2", "AAA111");

        write_graph(&graph, path.to_str()).expect("graph written");
        let dot = std::fs::read_to_string(&path).expect("read back");
        std::fs::remove_file(&path).ok();

        assert!(dot.starts_with("digraph mailtrace {"));
        assert_eq!(dot.matches("->").count(), 1);
    }
}
