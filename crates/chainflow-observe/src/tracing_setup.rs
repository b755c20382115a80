//! Global tracing subscriber installation for engine binaries and tools.
//!
//! Always installs a structured fmt layer that emits span-close timings, so
//! the `execute_chain` / `dispatch_step` spans from the engine carry their
//! duration in the logs. Trace export is opt-in via [`TraceExport`].
//!
//! ```no_run
//! use chainflow_observe::tracing_setup::{init_tracing, TraceExport};
//!
//! init_tracing(TraceExport::None).unwrap();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Filter applied when `RUST_LOG` is not set.
const DEFAULT_DIRECTIVE: &str = "info";

/// Kept so [`shutdown_tracing`] can flush the exporter before exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Where OpenTelemetry spans go, if anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceExport {
    /// Structured fmt logging only; no OTel bridge.
    #[default]
    None,
    /// Bridge spans to OpenTelemetry with a stdout exporter. Intended for
    /// local development; production deployments swap in OTLP.
    Stdout,
}

/// Install the global tracing subscriber.
///
/// Honors `RUST_LOG`, falling back to `info`. Fails if a subscriber has
/// already been installed for this process.
pub fn init_tracing(export: TraceExport) -> Result<(), TryInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);
    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);

    match export {
        TraceExport::None => registry.try_init(),
        TraceExport::Stdout => {
            let provider = SdkTracerProvider::builder()
                .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
                .build();
            let otel_layer =
                tracing_opentelemetry::layer().with_tracer(provider.tracer("chainflow"));

            let _ = TRACER_PROVIDER.set(provider.clone());
            opentelemetry::global::set_tracer_provider(provider);

            registry.with(otel_layer).try_init()
        }
    }
}

/// Flush buffered spans and shut the tracer provider down.
///
/// No-op when tracing was initialized without export.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("tracer provider shutdown failed: {e}");
        }
    }
}
