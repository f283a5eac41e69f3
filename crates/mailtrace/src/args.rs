use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use mailtrace_helpers::de::parse_duration_arg;

/// Trace email hops across MTA hosts.
#[derive(Debug, Parser)]
#[command(name = "mailtrace", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "MAILTRACE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Search by keyword, then follow one mail hop by hop
    Run(SearchArgs),
    /// Follow every matching mail and write the hop graph in dot format
    Graph {
        #[command(flatten)]
        search: SearchArgs,

        /// Output file, `-` for stdout
        #[arg(short, long)]
        output: Option<String>
    },
    /// Poll logs continuously and export OpenTelemetry traces
    Tracing(TracingArgs),
    /// Check the OpenSearch field mapping
    Doctor
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    /// Starting host or cluster name
    #[arg(short = 'H', long)]
    pub start_host: String,

    /// Keyword to look for, e.g. an address or a domain
    #[arg(short, long = "key", required = true)]
    pub keys: Vec<String>,

    /// Centre of the search window, `YYYY-MM-DD HH:MM:SS`
    #[arg(long, requires = "time_range")]
    pub time: Option<String>,

    /// Half-width of the search window, e.g. `10m`, `2h`, `1d`
    #[arg(long, requires = "time")]
    pub time_range: Option<String>,

    #[command(flatten)]
    pub secrets: SecretArgs
}

#[derive(Debug, Args)]
pub struct TracingArgs {
    /// OTLP endpoint, overrides `tracing.otel_endpoint`
    #[arg(long)]
    pub otel_endpoint: Option<String>,

    /// Poll interval, overrides `tracing.poll_interval`
    #[arg(long, value_parser = parse_duration_arg)]
    pub interval: Option<Duration>,

    #[command(flatten)]
    pub secrets: SecretArgs
}

#[derive(Debug, Clone, Default, Args)]
pub struct SecretArgs {
    /// SSH login password
    #[arg(long, env = "MAILTRACE_SSH_PASSWORD", hide_env_values = true)]
    pub login_pass: Option<String>,

    /// sudo password on the remote hosts
    #[arg(long, env = "MAILTRACE_SUDO_PASSWORD", hide_env_values = true)]
    pub sudo_pass: Option<String>,

    /// OpenSearch password
    #[arg(long, env = "MAILTRACE_OPENSEARCH_PASSWORD", hide_env_values = true)]
    pub opensearch_pass: Option<String>
}

impl Command {
    pub fn secrets(&self) -> SecretArgs {
        match self {
            Self::Run(search) | Self::Graph { search, .. } => search.secrets.clone(),
            Self::Tracing(tracing) => tracing.secrets.clone(),
            Self::Doctor => SecretArgs::default()
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::Graph { .. } => "graph",
            Self::Tracing(_) => "tracing",
            Self::Doctor => "doctor"
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_graph_search() {
        let cli = Cli::try_parse_from([
            "mailtrace",
            "-c",
            "/etc/mailtrace.yaml",
            "graph",
            "-H",
            "edge",
            "-k",
            "alice@example.com",
            "--key",
            "example.org",
            "--time",
            "2025-01-02 10:00:00",
            "--time-range",
            "10m",
            "-o",
            "-",
        ])
        .expect("valid command line");

        assert_eq!(cli.config, Some(PathBuf::from("/etc/mailtrace.yaml")));
        match cli.command {
            Command::Graph { search, output } => {
                assert_eq!(search.start_host, "edge");
                assert_eq!(search.keys, vec!["alice@example.com", "example.org"]);
                assert_eq!(search.time_range.as_deref(), Some("10m"));
                assert_eq!(output.as_deref(), Some("-"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn time_needs_its_range() {
        let err = Cli::try_parse_from([
            "mailtrace",
            "run",
            "-H",
            "mx1",
            "-k",
            "bob",
            "--time",
            "2025-01-02 10:00:00",
        ])
        .expect_err("time without range");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn tracing_interval_accepts_seconds() {
        let cli = Cli::try_parse_from(["mailtrace", "tracing", "--interval", "30"])
            .expect("valid command line");
        match cli.command {
            Command::Tracing(args) => assert_eq!(args.interval, Some(Duration::from_secs(30))),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
