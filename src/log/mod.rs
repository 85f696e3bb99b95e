//! Run-scoped structured logging.
//!
//! Besides installing the subscriber, this module owns the span vocabulary
//! of a pipeline run: [`run_span`] wraps one end-to-end execution and
//! [`step_span`] wraps one step, so every warning a connector, the
//! resilience wrapper, or the engine emits mid-step already carries the
//! `{run_id, step_id, step_type}` context the failure envelope reports.
//! Nothing in the executor logs outside one of these spans.

use tracing::Span;
use tracing_error::ErrorLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines with file and line locations.
    #[default]
    Human,
    /// One JSON object per line, for log shippers.
    Json,
}

/// Logging configuration. `SQLFLOW_LOG_LEVEL` picks the level (falling back
/// to `RUST_LOG`, then "info"); `SQLFLOW_LOG_FORMAT=json` switches to JSON
/// lines.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    level: Option<String>,
    format: LogFormat,
}

impl LogOptions {
    pub fn from_env() -> Self {
        let format = match std::env::var("SQLFLOW_LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Human,
        };
        Self {
            level: std::env::var("SQLFLOW_LOG_LEVEL").ok(),
            format,
        }
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = Some(level.to_string());
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Install the global subscriber. A second call (tests, embedding hosts
    /// with their own subscriber) keeps the first configuration.
    pub fn init(self) {
        let filter = match self.level {
            Some(level) => EnvFilter::new(level),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        };
        let format: Box<dyn Layer<Registry> + Send + Sync> = match self.format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_target(false)
                .with_file(false)
                .with_line_number(false)
                .boxed(),
            LogFormat::Human => fmt::layer()
                .with_target(false)
                .with_file(true)
                .with_line_number(true)
                .boxed(),
        };
        let subscriber = Registry::default()
            .with(format)
            .with(filter)
            .with(ErrorLayer::default());
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

/// Initialize logging from the environment.
pub fn init_tracing() {
    LogOptions::from_env().init();
}

/// Span wrapping one pipeline run; everything logged inside carries the
/// pipeline name and run id.
pub fn run_span(pipeline: &str, run_id: &str) -> Span {
    tracing::info_span!("pipeline_run", pipeline, run_id)
}

/// Span wrapping one step's execution, so retry backoff warnings, circuit
/// transitions, and engine errors attribute to the step that triggered
/// them.
pub fn step_span(step_id: &str, step_type: &str) -> Span {
    tracing::info_span!("step", step_id, step_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let opts = LogOptions::default()
            .with_level("debug")
            .with_format(LogFormat::Json);
        assert_eq!(opts.level.as_deref(), Some("debug"));
        assert_eq!(opts.format, LogFormat::Json);
    }

    #[test]
    fn test_spans_are_named_for_their_scope() {
        // Spans are disabled (and carry no metadata) without a subscriber.
        LogOptions::default().with_level("trace").init();
        let run = run_span("daily", "r-1");
        let step = step_span("load_orders", "load");
        assert_eq!(run.metadata().map(|m| m.name()), Some("pipeline_run"));
        assert_eq!(step.metadata().map(|m| m.name()), Some("step"));
    }
}
