//! Logging setup and OpenTelemetry spans for composite jobs.

use crate::job::{CompositeJob, JobStatus};
use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const TRACER_NAME: &str = "pdf-compositor";

/// Composites slower than this are logged as warnings.
const SLOW_COMPOSITE_MS: i64 = 30_000;

/// Installs the global tracing subscriber.
///
/// Logs go to stderr so the CLI can keep stdout for its JSON result.
/// `RUST_LOG` controls filtering (default: info).
pub fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Records telemetry for a finished composite job.
///
/// Emits a structured log line and an OpenTelemetry span carrying the
/// winning strategy, the number of strategies tried, duration and error.
pub fn record_job_telemetry(job: &CompositeJob) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("composite_job");

    span.set_attribute(KeyValue::new("job_id", job.job_id.clone()));
    span.set_attribute(KeyValue::new("status", job.status.to_string()));
    span.set_attribute(KeyValue::new("layer_name", job.layer_name.clone()));
    span.set_attribute(KeyValue::new("dpi", i64::from(job.dpi)));
    span.set_attribute(KeyValue::new("attempt_count", job.attempts.len() as i64));
    span.set_attribute(KeyValue::new("template_bytes", job.template.size_bytes as i64));
    span.set_attribute(KeyValue::new("artwork_bytes", job.artwork.size_bytes as i64));

    if let Some(strategy) = job.strategy {
        span.set_attribute(KeyValue::new("strategy", strategy.as_str()));
    }

    if let Some(duration_ms) = job.processing_duration_ms() {
        span.set_attribute(KeyValue::new("duration_ms", duration_ms));

        info!(
            job_id = %job.job_id,
            status = %job.status,
            strategy = job.strategy.map(|s| s.as_str()).unwrap_or("none"),
            attempts = job.attempts.len(),
            duration_ms = duration_ms,
            "Composite job finished"
        );

        if duration_ms > SLOW_COMPOSITE_MS {
            warn!(
                job_id = %job.job_id,
                duration_ms = duration_ms,
                "Composite exceeded performance threshold (30000ms)"
            );
        }
    }

    if job.status == JobStatus::Failed {
        if let Some(ref error) = job.error {
            span.set_attribute(KeyValue::new("error", error.clone()));
            warn!(
                job_id = %job.job_id,
                error = %error,
                attempts = job.attempts.len(),
                "Composite job failed"
            );
        }
    }

    span.end();
}

/// Initializes OpenTelemetry with the OTLP exporter.
///
/// Does nothing unless `OTEL_EXPORTER_OTLP_ENDPOINT` is set. Reads:
/// - `OTEL_EXPORTER_OTLP_ENDPOINT` - Collector endpoint
/// - `OTEL_SERVICE_NAME` - Service name (default: pdf-compositor)
///
/// Must be called from within a Tokio runtime. Returns whether an
/// exporter was installed.
pub fn init_telemetry() -> Result<bool, Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") else {
        return Ok(false);
    };

    let service_name = std::env::var("OTEL_SERVICE_NAME")
        .unwrap_or_else(|_| TRACER_NAME.to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    if let Some(provider) = tracer.provider() {
        global::set_tracer_provider(provider);
    }

    info!("Telemetry initialized: endpoint={}", endpoint);
    Ok(true)
}

/// Flushes pending spans before exit.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::UploadInfo;

    fn job() -> CompositeJob {
        let upload = |name: &str| UploadInfo {
            file_name: name.to_string(),
            content_type: "application/pdf".to_string(),
            size_bytes: 4096,
        };
        CompositeJob::new("ARTWORK HERE".to_string(), 300, None, upload("t.pdf"), upload("a.png"))
    }

    #[test]
    fn test_record_failed_job() {
        let mut job = job();
        job.start_processing();
        job.mark_failed("Test error".to_string(), Vec::new());

        // No provider installed: spans go to the no-op tracer.
        record_job_telemetry(&job);
    }

    #[test]
    fn test_record_unfinished_job() {
        let job = job();
        record_job_telemetry(&job);
    }
}
