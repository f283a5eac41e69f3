pub mod search;
pub mod shell;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::TraceError;
use crate::model::{LogEntry, LogQuery};
use crate::settings::{Method, Settings};

pub use search::SearchSource;
pub use shell::{OpenSshTransport, RemoteShell, ShellSource};

/// Where log entries come from: one host's files or a search index.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Host this source is bound to, `None` for index-wide sources.
    fn host(&self) -> Option<&str>;

    async fn query(
        &self,
        query: &LogQuery
    ) -> Result<Vec<LogEntry>, TraceError>;

    /// Same source without the host-name restriction, when that makes sense.
    fn without_host_filter(&self) -> Option<Box<dyn LogSource>> {
        None
    }
}

/// Opens a [`LogSource`] for a host discovered at runtime.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(
        &self,
        host: &str
    ) -> Result<Box<dyn LogSource>, TraceError>;
}

/// Connector selected by the configured `method`.
#[derive(Debug, Clone)]
pub struct ConfiguredConnector {
    settings: Arc<Settings>
}

impl ConfiguredConnector {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

#[async_trait]
impl SourceConnector for ConfiguredConnector {
    async fn connect(
        &self,
        host: &str
    ) -> Result<Box<dyn LogSource>, TraceError> {
        connect(self.settings.method, host, &self.settings).await
    }
}

pub async fn connect(
    method: Method,
    host: &str,
    settings: &Settings
) -> Result<Box<dyn LogSource>, TraceError> {
    info!("connecting log source: method={}, host={host}", method.as_str());
    match method {
        Method::Ssh => {
            let source = ShellSource::connect(host, &settings.ssh).await?;
            Ok(Box::new(source))
        }
        Method::Opensearch => {
            let source =
                SearchSource::connect(Some(host), &settings.opensearch).await?;
            Ok(Box::new(source))
        }
    }
}

/// Sources covering every configured log location, for continuous polling.
pub async fn connect_all(
    settings: &Settings
) -> Result<Vec<Box<dyn LogSource>>, TraceError> {
    match settings.method {
        Method::Opensearch => {
            let source =
                SearchSource::connect(None, &settings.opensearch).await?;
            Ok(vec![Box::new(source)])
        }
        Method::Ssh => {
            let hosts = settings.all_hosts();
            let connector = ConfiguredConnector::new(Arc::new(settings.clone()));
            connect_hosts(&connector, &hosts).await
        }
    }
}

/// Connects every host in turn; unreachable hosts are logged and skipped.
///
/// Fails only when no host could be connected.
pub async fn connect_hosts(
    connector: &dyn SourceConnector,
    hosts: &[String]
) -> Result<Vec<Box<dyn LogSource>>, TraceError> {
    if hosts.is_empty() {
        return Err(TraceError::config(
            "no hosts configured for continuous tracing",
            "list hosts under ssh.hosts or clusters",
        ));
    }

    let mut sources: Vec<Box<dyn LogSource>> = Vec::with_capacity(hosts.len());
    let mut last_error = None;
    for host in hosts {
        match connector.connect(host).await {
            Ok(source) => sources.push(source),
            Err(err) => {
                warn!(
                    "host skipped: host={host}, code={}, error={err}, hint={}",
                    err.code(),
                    err.suggestion()
                );
                last_error = Some(err);
            }
        }
    }

    match last_error {
        Some(err) if sources.is_empty() => Err(err),
        _ => {
            info!("log sources connected: connected={}, configured={}", sources.len(), hosts.len());
            Ok(sources)
        }
    }
}
