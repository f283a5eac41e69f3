mod args;
mod config;
mod core;

use std::process::ExitCode;

use anyhow::Result;
use args::{Cli, Command};
use clap::Parser;
use mailtrace_core::TraceError;
use mailtrace_helpers::logging;
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    logging::init_logging(
        "mailtrace=info,mailtrace_core=info",
        "MAILTRACE_LOG",
        "mailtrace",
    );

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let secrets = cli.command.secrets();
    info!("mailtrace starting: command={}", cli.command.name());

    if let Command::Doctor = cli.command {
        let (path, settings) =
            config::load_unchecked(cli.config.as_deref(), &secrets)?;
        return core::doctor(&path, &settings);
    }

    let settings = config::load(cli.config.as_deref(), &secrets)?;
    match cli.command {
        Command::Run(search) => core::run(settings, &search).await,
        Command::Graph { search, output } => {
            core::graph(settings, &search, output.as_deref()).await
        }
        Command::Tracing(tracing) => core::continuous(settings, &tracing).await,
        Command::Doctor => Ok(())
    }
}

/// Core failures print their message and hint on separate lines.
fn report(err: &anyhow::Error) {
    match err.chain().find_map(|cause| cause.downcast_ref::<TraceError>()) {
        Some(trace_err) => {
            eprintln!("error: {}", trace_err.message());
            let context = err.to_string();
            if context != trace_err.message() {
                eprintln!("  while: {context}");
            }
            eprintln!("hint: {}", trace_err.suggestion());
        }
        None => eprintln!("error: {err:#}")
    }
}
