mod continuous;
mod doctor;
mod graph;
mod run;

use anyhow::{Result, bail};
use mailtrace_core::hop::{DiscoveredMail, find_mail_ids};
use mailtrace_core::model::parse_time_args;
use mailtrace_core::settings::Settings;
use mailtrace_core::source::SourceConnector;
use tracing::info;

use crate::args::SearchArgs;

pub use continuous::continuous;
pub use doctor::doctor;
pub use graph::graph;
pub use run::run;

/// Keyword discovery over every host behind `--start-host`.
async fn discover(
    settings: &Settings,
    connector: &dyn SourceConnector,
    search: &SearchArgs
) -> Result<Vec<DiscoveredMail>> {
    let window =
        parse_time_args(search.time.as_deref(), search.time_range.as_deref())?;
    let keys: Vec<String> = search
        .keys
        .iter()
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .collect();
    if keys.is_empty() {
        bail!("at least one non-empty --key is required");
    }

    let hosts = settings.expand_hosts(search.start_host.trim());
    info!(
        "keyword search: start_host={}, hosts={}, keys={}",
        search.start_host,
        hosts.len(),
        keys.join(",")
    );
    Ok(find_mail_ids(connector, &hosts, &keys, window).await?)
}
