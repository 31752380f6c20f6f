//! Tracing and metrics setup
//!
//! Logs go to stderr so JSON command output on stdout stays machine-readable.
//! `RUST_LOG` overrides the configured level.

use crate::utils::config::{LogFormat, LoggingConfig, MetricsConfig};
use crate::utils::errors::{GovernorError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| GovernorError::ConfigError(format!("Invalid log level '{}': {}", config.level, e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };

    installed.map_err(|e| GovernorError::RuntimeError(format!("Failed to install tracing subscriber: {}", e)))
}

/// Install the Prometheus exporter if a listener is configured
///
/// Must run inside a Tokio runtime.
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    describe_metrics();

    let Some(listen) = &config.prometheus_listen else {
        return Ok(());
    };

    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| GovernorError::ConfigError(format!("Invalid metrics address '{}': {}", listen, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| GovernorError::RuntimeError(format!("Failed to install metrics exporter: {}", e)))?;

    info!("Prometheus metrics listening on {}", addr);
    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!("procgov_reservations_total", "Slots reserved, by process kind");
    metrics::describe_counter!("procgov_admission_denials_total", "Reservations rejected by a limit");
    metrics::describe_counter!("procgov_registrations_total", "Processes registered against a reservation");
    metrics::describe_counter!("procgov_emergency_shutdowns_total", "Emergency shutdowns performed");
    metrics::describe_counter!("procgov_violations_total", "Resource limit violations observed");
    metrics::describe_counter!("procgov_terminations_total", "Processes terminated by the enforcer");
    metrics::describe_counter!("procgov_retries_total", "Retries scheduled, by failure category");
    metrics::describe_counter!("procgov_circuit_transitions_total", "Circuit breaker state changes");
    metrics::describe_gauge!("procgov_active_processes", "Currently registered processes");
    metrics::describe_gauge!("procgov_monitored_processes", "Processes under resource polling");
}
