use std::collections::HashMap;

use opentelemetry::Context;
use opentelemetry::trace::{Span as _, SpanBuilder, TraceContextExt, TraceId, Tracer, TracerProvider as _};
use opentelemetry_otlp::{Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{BatchSpanProcessor, SdkTracer, SdkTracerProvider};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::correlate::EmailTrace;
use crate::error::TraceError;
use crate::settings::OtelProtocol;
use crate::span::{Delay, PlannedSpan, build_delays, plan_trace};

pub const ROOT_SERVICE_NAME: &str = "mailtrace";
const SCOPE: &str = "mailtrace";

/// Sink for finished email traces.
pub trait TraceEmitter: Send {
    /// Exports one email; `Ok(false)` when it had nothing to export.
    fn emit(
        &mut self,
        trace: &EmailTrace,
        delays: &[Delay]
    ) -> Result<bool, TraceError>;

    fn flush(&mut self) -> Result<(), TraceError>;

    fn shutdown(&mut self) -> Result<(), TraceError>;
}

/// Builds delays and emits each trace; a failing trace is logged and skipped.
pub fn emit_all<'a>(
    emitter: &mut dyn TraceEmitter,
    traces: impl IntoIterator<Item = &'a EmailTrace>
) -> usize {
    let mut emitted = 0;
    for trace in traces {
        let delays = build_delays(&trace.message_id, &trace.entries);
        match emitter.emit(trace, &delays) {
            Ok(true) => emitted += 1,
            Ok(false) => debug!("nothing to emit: message_id={}", trace.message_id),
            Err(err) => error!(
                "trace emit failed: message_id={}, code={}, error={err}",
                trace.message_id,
                err.code()
            )
        }
    }
    emitted
}

/// Trace id shared by every span of one email.
pub fn trace_id_for(message_id: &str) -> TraceId {
    let digest = Sha256::digest(message_id.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    TraceId::from_bytes(bytes)
}

type ProviderFactory = Box<dyn Fn(&str) -> Result<SdkTracerProvider, TraceError> + Send + Sync>;

/// Emits through one tracer provider per host so each host shows up as its
/// own service.
pub struct OtelEmitter {
    root: SdkTracerProvider,
    hosts: HashMap<String, SdkTracerProvider>,
    factory: ProviderFactory
}

impl OtelEmitter {
    /// Emitter exporting over OTLP to `endpoint`.
    pub fn otlp(
        endpoint: &str,
        protocol: OtelProtocol
    ) -> Result<Self, TraceError> {
        info!("otlp exporter: endpoint={endpoint}, protocol={protocol:?}");
        let endpoint = endpoint.to_string();
        Self::with_factory(move |service| otlp_provider(&endpoint, protocol, service))
    }

    /// Emitter whose providers, keyed by service name, come from `factory`.
    pub fn with_factory<F>(factory: F) -> Result<Self, TraceError>
    where
        F: Fn(&str) -> Result<SdkTracerProvider, TraceError> + Send + Sync + 'static,
    {
        let root = factory(ROOT_SERVICE_NAME)?;
        Ok(Self { root, hosts: HashMap::new(), factory: Box::new(factory) })
    }

    fn host_tracer(
        &mut self,
        host: &str
    ) -> Result<SdkTracer, TraceError> {
        if !self.hosts.contains_key(host) {
            let provider = (self.factory)(host)?;
            debug!("tracer provider created: host={host}");
            self.hosts.insert(host.to_string(), provider);
        }
        self.hosts
            .get(host)
            .map(|provider| provider.tracer(SCOPE))
            .ok_or_else(|| TraceError::config(format!("no tracer for host {host}"), "check tracing settings"))
    }

    fn providers(&self) -> impl Iterator<Item = (&str, &SdkTracerProvider)> {
        std::iter::once((ROOT_SERVICE_NAME, &self.root))
            .chain(self.hosts.iter().map(|(host, provider)| (host.as_str(), provider)))
    }
}

impl TraceEmitter for OtelEmitter {
    fn emit(
        &mut self,
        trace: &EmailTrace,
        delays: &[Delay]
    ) -> Result<bool, TraceError> {
        let Some(plan) = plan_trace(trace, delays) else {
            return Ok(false);
        };

        // Resolve every tracer first so a failure never leaves spans open.
        let mut host_tracers = Vec::with_capacity(plan.hosts.len());
        for host in &plan.hosts {
            host_tracers.push(self.host_tracer(&host.host)?);
        }

        let trace_id = trace_id_for(&plan.message_id);
        let root_tracer = self.root.tracer(SCOPE);
        let root = root_tracer.build_with_context(
            span_builder(&plan.root).with_trace_id(trace_id),
            &Context::new()
        );
        let root_cx = Context::new().with_span(root);

        for (host, tracer) in plan.hosts.iter().zip(&host_tracers) {
            let host_span = tracer.build_with_context(span_builder(&host.span), &root_cx);
            let host_cx = root_cx.with_span(host_span);
            for stage in &host.stages {
                let mut span = tracer.build_with_context(span_builder(stage), &host_cx);
                span.end_with_timestamp(stage.end);
            }
            host_cx.span().end_with_timestamp(host.span.end);
        }
        root_cx.span().end_with_timestamp(plan.root.end);

        debug!(
            "trace emitted: message_id={}, trace_id={trace_id}, hosts={}",
            plan.message_id,
            plan.hosts.len()
        );
        Ok(true)
    }

    fn flush(&mut self) -> Result<(), TraceError> {
        for (service, provider) in self.providers() {
            if let Err(err) = provider.force_flush() {
                warn!("tracer flush failed: service={service}, error={err}");
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), TraceError> {
        let mut failed = Vec::new();
        for (service, provider) in self.providers() {
            if let Err(err) = provider.shutdown() {
                warn!("tracer shutdown failed: service={service}, error={err}");
                failed.push(service.to_string());
            }
        }
        if failed.is_empty() {
            info!("tracer providers shut down: count={}", self.hosts.len() + 1);
            Ok(())
        } else {
            Err(TraceError::config(
                format!("tracer shutdown failed for {}", failed.join(", ")),
                "check that the otlp collector is reachable"
            ))
        }
    }
}

fn span_builder(span: &PlannedSpan) -> SpanBuilder {
    SpanBuilder::from_name(span.name.clone())
        .with_start_time(span.start)
        .with_attributes(span.attributes.clone())
}

fn otlp_provider(
    endpoint: &str,
    protocol: OtelProtocol,
    service_name: &str
) -> Result<SdkTracerProvider, TraceError> {
    let exporter = match protocol {
        OtelProtocol::Grpc => SpanExporter::builder().with_tonic().with_endpoint(endpoint).build(),
        OtelProtocol::Http => SpanExporter::builder()
            .with_http()
            .with_endpoint(http_traces_endpoint(endpoint))
            .with_protocol(Protocol::HttpBinary)
            .build(),
    }
    .map_err(|err| {
        TraceError::config(
            format!("cannot build otlp exporter for {endpoint}: {err}"),
            "check tracing.otel_endpoint and tracing.otel_protocol"
        )
    })?;

    let processor = BatchSpanProcessor::builder(exporter).build();
    Ok(SdkTracerProvider::builder()
        .with_resource(Resource::builder().with_service_name(service_name.to_string()).build())
        .with_span_processor(processor)
        .build())
}

/// OTLP/HTTP wants the full signal path.
fn http_traces_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.ends_with("/v1/traces") {
        endpoint.to_string()
    } else {
        format!("{endpoint}/v1/traces")
    }
}
