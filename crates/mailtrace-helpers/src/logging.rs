#[cfg(target_os = "linux")]
use std::env;
use std::io;

use tracing_subscriber::EnvFilter;
#[cfg(target_os = "linux")]
use tracing_subscriber::layer::SubscriberExt;
#[cfg(target_os = "linux")]
use tracing_subscriber::util::SubscriberInitExt;

/// Installs the global subscriber.
///
/// Filter precedence is `env_key`, then `RUST_LOG`, then `default_filter`.
/// Under systemd the journald layer is used; everywhere else events go to
/// stderr so that command output on stdout (dot graphs, traces) stays clean.
pub fn init_logging(
    default_filter: &str,
    env_key: &str,
    service_name: &str
) {
    #[cfg(not(target_os = "linux"))]
    let _ = service_name;

    let env_filter = build_env_filter(default_filter, env_key);

    #[cfg(target_os = "linux")]
    {
        if is_running_under_systemd() {
            match tracing_journald::layer() {
                Ok(layer) => {
                    let layer = layer.with_syslog_identifier(
                        service_name.to_string(),
                    );
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(layer)
                        .init();
                    return;
                }
                Err(err) => {
                    eprintln!(
                        "{service_name}: journald unavailable, logging to stderr: {err}"
                    );
                }
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn build_env_filter(
    default_filter: &str,
    env_key: &str
) -> EnvFilter {
    EnvFilter::try_from_env(env_key)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_filter))
}

#[cfg(target_os = "linux")]
#[inline]
fn is_running_under_systemd() -> bool {
    env::var_os("JOURNAL_STREAM").is_some()
        || env::var_os("INVOCATION_ID").is_some()
}
