use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mailtrace_core::settings::{Method, Settings};
use tracing::{info, warn};

use crate::args::SecretArgs;

const CONFIG_NAMES: [&str; 2] = ["mailtrace.yaml", "mailtrace.yml"];

/// Loads, normalizes and validates the settings file.
pub fn load(
    explicit: Option<&Path>,
    secrets: &SecretArgs
) -> Result<Settings> {
    let (path, settings) = load_unchecked(explicit, secrets)?;
    settings
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;

    info!(
        "config loaded: path={}, method={}, clusters={}",
        path.display(),
        settings.method.as_str(),
        settings.clusters.len()
    );
    Ok(settings)
}

/// Loads and normalizes without validating, for `doctor`.
pub fn load_unchecked(
    explicit: Option<&Path>,
    secrets: &SecretArgs
) -> Result<(PathBuf, Settings)> {
    let path = explicit
        .map(Path::to_path_buf)
        .or_else(resolve_config_path)
        .context(
            "mailtrace config not found (-c, MAILTRACE_CONFIG, ~/mailtrace.yaml or ./mailtrace.yaml)",
        )?;

    let mut settings = load_settings_yaml(&path)?;
    apply_secrets(&mut settings, secrets);
    settings.normalize();
    Ok((path, settings))
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Some(home) = non_empty_env("HOME").map(PathBuf::from) {
        for name in CONFIG_NAMES {
            let candidate = home.join(name);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    CONFIG_NAMES
        .iter()
        .chain(["config.yaml"].iter())
        .map(|name| cwd.join(name))
        .find(|candidate| candidate.exists())
}

fn load_settings_yaml(path: &Path) -> Result<Settings> {
    let raw = std::fs::read(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_slice(&raw)
        .with_context(|| format!("failed to parse yaml {}", path.display()))
}

/// Command-line and environment secrets win over the file.
fn apply_secrets(
    settings: &mut Settings,
    secrets: &SecretArgs
) {
    match settings.method {
        Method::Ssh => {
            if let Some(password) = non_empty(secrets.login_pass.as_deref()) {
                settings.ssh.password = Some(password);
            }
            if let Some(password) = non_empty(secrets.sudo_pass.as_deref()) {
                settings.ssh.sudo_pass = Some(password);
            }
            if settings.ssh.password.is_none() && settings.ssh.private_key.is_none() {
                warn!("no ssh password or private key configured, relying on the ssh agent");
            }
        }
        Method::Opensearch => {
            if let Some(password) = non_empty(secrets.opensearch_pass.as_deref()) {
                settings.opensearch.password = Some(password);
            }
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    non_empty(env::var(key).ok().as_deref())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}
