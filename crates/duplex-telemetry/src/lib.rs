mod metrics;

pub use metrics::{CounterValue, GaugeValue, HistogramSummary, HistogramValue, MetricsRecorder, MetricsSnapshot};

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Output format for the stdout log layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "duplex_server" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            format: LogFormat::Pretty,
        }
    }
}

impl TelemetryConfig {
    /// Filter directive string built from the level and module overrides.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Handle to the telemetry state created at startup.
pub struct TelemetryGuard {
    metrics: Arc<MetricsRecorder>,
}

impl TelemetryGuard {
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.metrics)
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
///
/// A second call keeps the first subscriber and only hands back a fresh
/// metrics recorder.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().with_target(true).boxed(),
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
    {
        eprintln!("duplex-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard {
        metrics: Arc::new(MetricsRecorder::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_directives_include_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![
                ("duplex_server".into(), Level::DEBUG),
                ("tower_http".into(), Level::TRACE),
            ],
            format: LogFormat::Json,
        };
        assert_eq!(
            config.filter_directives(),
            "warn,duplex_server=debug,tower_http=trace"
        );
    }

    #[test]
    fn default_config_is_info_pretty() {
        let config = TelemetryConfig::default();
        assert_eq!(config.filter_directives(), "info");
        assert_eq!(config.format, LogFormat::Pretty);
    }

    #[test]
    fn log_format_parses() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn init_twice_does_not_panic() {
        let first = init_telemetry(TelemetryConfig::default());
        let second = init_telemetry(TelemetryConfig::default());
        first.metrics().increment_counter("a", &[], 1);
        assert_eq!(second.metrics().counter("a", &[]), 0);
    }
}
