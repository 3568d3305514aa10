//! # Telemetry Features
//!
//! Console logging through `tracing-subscriber` is always installed. Optional
//! OpenTelemetry export is layered on top of it.
//!
//! ## Feature matrix
//!
//! - `tracing` (default): log events from the server and the `keypool` library.
//! - `otel`: export spans through OpenTelemetry.
//! - `metrics`: export counters and gauges through OpenTelemetry.
//! - `otlp`: OTLP/gRPC exporter, configured from `OTLP_ENDPOINT`,
//!   `OTLP_HEADERS` (`key=value,key=value`) and `OTLP_COMPRESSION`.
//! - `stdout`: stdout exporter.
//!
//! ## Feature constraints
//!
//! - Exporters require at least one of `otel` or `metrics`.
//! - `otlp` and `stdout` can be enabled at the same time.
//!
//! ## Metrics behavior
//!
//! - Metric helpers below compile to no-ops without `metrics`.
//! - Each exporter gets its own reader.
//!
//! ## Example usage
//!
//! ```bash
//! cargo run --features otel,metrics,otlp -- sidecar
//! cargo run --features metrics,stdout -- generate
//! ```

#[cfg(all(feature = "otlp", not(any(feature = "otel", feature = "metrics"))))]
compile_error!("The 'otlp' feature requires at least one of 'otel' or 'metrics' to be enabled.");

#[cfg(all(feature = "stdout", not(any(feature = "otel", feature = "metrics"))))]
compile_error!("The 'stdout' feature requires at least one of 'otel' or 'metrics' to be enabled.");

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "otel")))]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};
#[cfg(all(feature = "otlp", feature = "metrics"))]
use opentelemetry_sdk::metrics::Temporality;
#[cfg(feature = "otlp")]
use tonic::metadata::MetadataMap;
#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "otel")))]
use tonic::transport::ClientTlsConfig;

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Gauge, Meter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otel")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "otel")]
use opentelemetry_sdk::trace as sdktrace;

pub struct TelemetryProviders {
    #[cfg(feature = "otel")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down every exporter. Errors go to stderr because the
    /// log pipeline may already be gone.
    pub fn shutdown(self) {
        #[cfg(feature = "otel")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "otel")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "otel")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics()?;

    #[cfg(any(feature = "metrics", feature = "otel"))]
    let scope = InstrumentationScope::builder("keypool")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    // Console output, independent of any OpenTelemetry exporter.
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true),
        );

    #[cfg(feature = "otel")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(feature = "otel")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(feature = "otlp")]
fn get_metadata() -> anyhow::Result<MetadataMap> {
    use anyhow::Context;
    use tonic::metadata::MetadataKey;

    let mut map = MetadataMap::new();
    let Ok(raw) = std::env::var("OTLP_HEADERS") else {
        return Ok(map);
    };
    for pair in raw.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("OTLP_HEADERS entry `{pair}` must be key=value"))?;
        let key = MetadataKey::from_bytes(key.trim().to_ascii_lowercase().as_bytes())
            .with_context(|| format!("invalid OTLP header name `{key}`"))?;
        map.insert(key, value.trim().parse().context("invalid OTLP header value")?);
    }
    Ok(map)
}

#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "otel")))]
fn otlp_settings() -> anyhow::Result<(String, Compression)> {
    use anyhow::Context;
    use std::str::FromStr;

    let endpoint = std::env::var("OTLP_ENDPOINT").context("missing `OTLP_ENDPOINT`")?;
    let raw = std::env::var("OTLP_COMPRESSION")
        .unwrap_or_else(|_| "gzip".to_owned())
        .to_ascii_lowercase();
    let compression = Compression::from_str(&raw)?;
    Ok((endpoint, compression))
}

#[cfg(any(feature = "metrics", feature = "otel"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name("keypool")
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let (endpoint, compression) = otlp_settings()?;
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(get_metadata()?)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(compression)
            .with_endpoint(endpoint)
            .with_protocol(Protocol::Grpc)
            .with_temporality(Temporality::Delta)
            .build()
            .context("failed to build metrics exporter")?;

        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "otel")]
fn batched<E>(exporter: E) -> sdktrace::BatchSpanProcessor
where
    E: sdktrace::SpanExporter + 'static,
{
    sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            sdktrace::BatchConfigBuilder::default()
                .with_scheduled_delay(std::time::Duration::from_secs(5))
                .with_max_queue_size(2048)
                .build(),
        )
        .build()
}

#[cfg(feature = "otel")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::SpanExporter;
        builder.with_span_processor(batched(SpanExporter::default()))
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let (endpoint, compression) = otlp_settings()?;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(get_metadata()?)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(compression)
            .with_endpoint(endpoint)
            .with_protocol(Protocol::Grpc)
            .build()
            .context("failed to build tracer exporter")?;

        builder.with_span_processor(batched(exporter))
    };

    Ok(builder.build())
}

// Set once by `init_metric_handles`. Unset handles make the helpers no-ops.
#[cfg(feature = "metrics")]
static KEYS_SERVED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static ACQUIRE_EXHAUSTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static KEYS_TRANSFERRED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static STARVED_TICKS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static STORE_FAILURES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static CACHED_KEYS: OnceLock<Gauge<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static CANDIDATES_GENERATED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static CANDIDATES_ACCEPTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static YIELD_ESTIMATE: OnceLock<Gauge<f64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static LEDGER_PURGED: OnceLock<Counter<u64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = KEYS_SERVED.set(
        meter
            .u64_counter("keys_served")
            .with_description("Keys handed out by the sidecar")
            .build(),
    );

    let _ = ACQUIRE_EXHAUSTED.set(
        meter
            .u64_counter("acquire_exhausted")
            .with_description("Requests answered with an empty local cache")
            .build(),
    );

    let _ = KEYS_TRANSFERRED.set(
        meter
            .u64_counter("keys_transferred")
            .with_description("Keys moved from the shared pool into the local cache")
            .build(),
    );

    let _ = STARVED_TICKS.set(
        meter
            .u64_counter("pool_starved")
            .with_description("Replenishment ticks that found the shared pool empty")
            .build(),
    );

    let _ = STORE_FAILURES.set(
        meter
            .u64_counter("store_failures")
            .with_description("Pool store round trips that failed or timed out")
            .build(),
    );

    let _ = CACHED_KEYS.set(
        meter
            .u64_gauge("cached_keys")
            .with_description("Keys held in the local cache after the last tick")
            .build(),
    );

    let _ = CANDIDATES_GENERATED.set(
        meter
            .u64_counter("candidates_generated")
            .with_description("Candidates minted by the generator")
            .build(),
    );

    let _ = CANDIDATES_ACCEPTED.set(
        meter
            .u64_counter("candidates_accepted")
            .with_description("Candidates verified and added to the pool")
            .build(),
    );

    let _ = YIELD_ESTIMATE.set(
        meter
            .f64_gauge("unique_yield")
            .with_description("Smoothed fraction of candidates that survive verification")
            .build(),
    );

    let _ = LEDGER_PURGED.set(
        meter
            .u64_counter("ledger_purged")
            .with_description("Expired issued-ledger entries removed by cleanup")
            .build(),
    );
}

#[cfg(feature = "metrics")]
pub fn increment_keys_served() {
    if let Some(counter) = KEYS_SERVED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_keys_served() {}

#[cfg(feature = "metrics")]
pub fn increment_acquire_exhausted() {
    if let Some(counter) = ACQUIRE_EXHAUSTED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_acquire_exhausted() {}

#[cfg(feature = "metrics")]
pub fn increment_keys_transferred(count: u64) {
    if let Some(counter) = KEYS_TRANSFERRED.get() {
        counter.add(count, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_keys_transferred(_count: u64) {}

#[cfg(feature = "metrics")]
pub fn increment_starved_ticks() {
    if let Some(counter) = STARVED_TICKS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_starved_ticks() {}

#[cfg(feature = "metrics")]
pub fn increment_store_failures() {
    if let Some(counter) = STORE_FAILURES.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_store_failures() {}

#[cfg(feature = "metrics")]
pub fn record_cached_keys(count: u64) {
    if let Some(gauge) = CACHED_KEYS.get() {
        gauge.record(count, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_cached_keys(_count: u64) {}

#[cfg(feature = "metrics")]
pub fn increment_candidates_generated(count: u64) {
    if let Some(counter) = CANDIDATES_GENERATED.get() {
        counter.add(count, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_candidates_generated(_count: u64) {}

#[cfg(feature = "metrics")]
pub fn increment_candidates_accepted(count: u64) {
    if let Some(counter) = CANDIDATES_ACCEPTED.get() {
        counter.add(count, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_candidates_accepted(_count: u64) {}

#[cfg(feature = "metrics")]
pub fn record_yield_estimate(value: f64) {
    if let Some(gauge) = YIELD_ESTIMATE.get() {
        gauge.record(value, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_yield_estimate(_value: f64) {}

#[cfg(feature = "metrics")]
pub fn increment_ledger_purged(count: u64) {
    if let Some(counter) = LEDGER_PURGED.get() {
        counter.add(count, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_ledger_purged(_count: u64) {}
