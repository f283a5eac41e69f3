use anyhow::{Context, Result};
use mailtrace_core::continuous::ContinuousTracer;
use mailtrace_core::settings::{Settings, TracingSettings};
use mailtrace_core::source::connect_all;
use mailtrace_core::telemetry::OtelEmitter;
use mailtrace_helpers::shutdown;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::args::TracingArgs;

/// Polls until SIGINT or SIGTERM and exports every finished email.
pub async fn continuous(
    mut settings: Settings,
    args: &TracingArgs
) -> Result<()> {
    apply_overrides(&mut settings.tracing, args);
    let tracing = &settings.tracing;
    info!(
        "tracing mode: method={}, endpoint={}, interval={}s",
        settings.method.as_str(),
        tracing.otel_endpoint,
        tracing.poll_interval.as_secs()
    );

    let sources = connect_all(&settings).await?;
    let emitter = OtelEmitter::otlp(&tracing.otel_endpoint, tracing.otel_protocol)
        .context("failed to set up the otlp exporter")?;

    let token = CancellationToken::new();
    tokio::spawn(shutdown::listen_shutdown(token.clone()));

    let emitted = ContinuousTracer::new(sources, emitter, tracing)
        .run(token.clone())
        .await?;
    token.cancel();
    info!("tracing mode finished: emitted={emitted}");
    Ok(())
}

fn apply_overrides(
    tracing: &mut TracingSettings,
    args: &TracingArgs
) {
    if let Some(endpoint) = args.otel_endpoint.as_deref().map(str::trim)
        && !endpoint.is_empty()
    {
        tracing.otel_endpoint = endpoint.to_string();
    }
    if let Some(interval) = args.interval
        && !interval.is_zero()
    {
        tracing.poll_interval = interval;
    }
}
