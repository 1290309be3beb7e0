use std::env;

use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    resource::Resource,
    runtime::Tokio,
    trace::{self, Sampler},
};
use tracing::{info, warn};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type Registry = tracing_subscriber::registry::Registry;

const ENDPOINT_VAR: &str = "SQLGATE_OTLP_ENDPOINT";
const SAMPLING_VAR: &str = "SQLGATE_OTEL_SAMPLING_RATE";

#[derive(Debug)]
pub struct TelemetryGuard {
    tracer_installed: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.tracer_installed {
            global::shutdown_tracer_provider();
        }
    }
}

/// Installs the fmt subscriber, plus an OTLP exporter when an endpoint is
/// configured. Exporter failures fall back to console logging.
pub fn init(service_name: &str) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (sampling_rate, sampling_warning) =
        parse_sampling_rate(env::var(SAMPLING_VAR).ok().as_deref());
    let endpoint = env::var(ENDPOINT_VAR).ok().filter(|value| !value.trim().is_empty());

    let (otel_layer, otel_error) = match build_otel_layer(service_name, endpoint.as_deref(), sampling_rate) {
        Ok(layer) => (layer, None),
        Err(error) => (None, Some(error)),
    };
    let guard = TelemetryGuard {
        tracer_installed: otel_layer.is_some(),
    };

    tracing_subscriber::registry()
        .with(otel_layer)
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(message) = sampling_warning {
        warn!("{message}");
    }

    if let Some(error) = otel_error {
        warn!(%error, "failed to initialize OTEL exporter; continuing with console logs only");
    }

    info!(sampling_rate, otlp = guard.tracer_installed, "telemetry configured");

    Ok(guard)
}

fn build_otel_layer(
    service_name: &str,
    endpoint: Option<&str>,
    sampling_rate: f64,
) -> Result<Option<OpenTelemetryLayer<Registry, trace::Tracer>>> {
    let Some(endpoint) = endpoint else {
        return Ok(None);
    };
    if sampling_rate <= 0.0 {
        return Ok(None);
    }

    global::set_text_map_propagator(TraceContextPropagator::new());

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint.to_string());
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            trace::Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(sampling_rate))
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .with_exporter(exporter)
        .install_batch(Tokio)?;

    Ok(Some(tracing_opentelemetry::layer().with_tracer(tracer)))
}

pub fn parse_sampling_rate(raw: Option<&str>) -> (f64, Option<String>) {
    match raw {
        None => (1.0, None),
        Some(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return (1.0, Some(format!("{SAMPLING_VAR} is empty; defaulting to 1.0")));
            }

            match trimmed.parse::<f64>() {
                Ok(parsed) if (0.0..=1.0).contains(&parsed) => (parsed, None),
                Ok(parsed) => {
                    let clamped = parsed.clamp(0.0, 1.0);
                    (
                        clamped,
                        Some(format!(
                            "{SAMPLING_VAR}={trimmed} outside 0.0..=1.0; clamped to {clamped}"
                        )),
                    )
                }
                Err(_) => (
                    1.0,
                    Some(format!(
                        "{SAMPLING_VAR}='{trimmed}' is not a valid float; defaulting to 1.0"
                    )),
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_sampling_rate;

    #[test]
    fn parse_valid_sampling_rate() {
        assert_eq!(parse_sampling_rate(None), (1.0, None));
        assert_eq!(parse_sampling_rate(Some("0.25")), (0.25, None));
        assert_eq!(parse_sampling_rate(Some("1")), (1.0, None));
    }

    #[test]
    fn parse_out_of_bounds_sampling_rate() {
        let (rate, warning) = parse_sampling_rate(Some("-0.3"));
        assert_eq!(rate, 0.0);
        assert!(warning
            .unwrap()
            .contains("SQLGATE_OTEL_SAMPLING_RATE=-0.3 outside 0.0..=1.0"));
    }

    #[test]
    fn parse_invalid_sampling_rate() {
        let (rate, warning) = parse_sampling_rate(Some("abc"));
        assert_eq!(rate, 1.0);
        assert!(warning
            .unwrap()
            .contains("SQLGATE_OTEL_SAMPLING_RATE='abc' is not a valid float"));
    }

    #[test]
    fn parse_empty_sampling_rate() {
        let (_, warning) = parse_sampling_rate(Some("   "));
        assert!(warning.unwrap().contains("is empty; defaulting to 1.0"));
    }
}
