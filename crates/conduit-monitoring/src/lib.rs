//! Monitoring for the Conduit data layer.
//!
//! Structured logging setup plus the request/cache/breaker metrics
//! collector whose snapshot the orchestrator reports.

use anyhow::Context;
use tracing::info;

pub mod logging;
pub mod metrics;

/// Configuration for initializing the monitoring system
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Service name used in log output
    pub service_name: String,
    /// Install the Prometheus recorder behind the `metrics` facade
    pub enable_metrics: bool,
    /// Log level filter (e.g., "info,conduit_orchestrator=debug")
    pub log_filter: String,
    /// Emit JSON instead of human-readable logs
    pub enable_json_logging: bool,
    /// Also write JSON logs to this file, rotated daily
    pub log_file: Option<String>,
    /// Environment (dev, staging, prod)
    pub environment: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "conduit".to_string(),
            enable_metrics: true,
            log_filter: "info".to_string(),
            enable_json_logging: false,
            log_file: None,
            environment: "dev".to_string(),
        }
    }
}

#[cfg(feature = "prometheus")]
static PROMETHEUS: once_cell::sync::OnceCell<metrics_exporter_prometheus::PrometheusHandle> =
    once_cell::sync::OnceCell::new();

/// Initialize logging and, if enabled, the metrics recorder
pub fn init(config: &MonitoringConfig) -> anyhow::Result<()> {
    logging::init_logging(config).context("Failed to initialize logging")?;

    if config.enable_metrics {
        install_recorder()?;
    }

    info!(
        service_name = %config.service_name,
        environment = %config.environment,
        metrics = config.enable_metrics,
        "Monitoring initialized"
    );
    Ok(())
}

#[cfg(feature = "prometheus")]
fn install_recorder() -> anyhow::Result<()> {
    if PROMETHEUS.get().is_some() {
        return Ok(());
    }
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;
    let _ = PROMETHEUS.set(handle);
    Ok(())
}

#[cfg(not(feature = "prometheus"))]
fn install_recorder() -> anyhow::Result<()> {
    info!("Built without the prometheus feature; metrics stay in-process");
    Ok(())
}

/// Prometheus exposition text, if the recorder is installed
pub fn render_prometheus() -> Option<String> {
    #[cfg(feature = "prometheus")]
    {
        PROMETHEUS.get().map(|handle| handle.render())
    }
    #[cfg(not(feature = "prometheus"))]
    {
        None
    }
}

/// Shutdown the monitoring system
pub fn shutdown() {
    info!("Shutting down monitoring system");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = MonitoringConfig::default();
        assert_eq!(config.service_name, "conduit");
        assert!(config.enable_metrics);
        assert!(!config.enable_json_logging);
        assert!(config.log_file.is_none());
    }
}

// Exported types
pub use crate::metrics::*;
