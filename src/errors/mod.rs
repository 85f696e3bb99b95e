use thiserror::Error;
use tracing_subscriber::filter::FromEnvError;

/// Execution phase in which a step failed. Carried in the error envelope the
/// executor attaches before halting a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Configure,
    Connect,
    Read,
    Write,
    Execute,
    Commit,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Configure => "configure",
            Phase::Connect => "connect",
            Phase::Read => "read",
            Phase::Write => "write",
            Phase::Execute => "execute",
            Phase::Commit => "commit",
        };
        f.write_str(s)
    }
}

/// Main error type for sqlflow operations
#[derive(Error, Debug)]
pub enum SqlFlowError {
    #[error("DataFusion error: {0}")]
    Datafusion(#[from] datafusion::error::DataFusionError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] datafusion::arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] datafusion::parquet::errors::ParquetError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("Serde Arrow error: {0}")]
    SerdeArrow(#[from] serde_arrow::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Directory walk error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Tracing filter error: {0}")]
    FromEnv(#[from] FromEnvError),

    #[error("parse error at line {line}, column {column}: expected {expected}, found {found}\n  --> {snippet}")]
    Parse {
        line: usize,
        column: usize,
        expected: String,
        found: String,
        snippet: String,
    },

    #[error("unresolved variable(s) {missing:?} at {locations:?}")]
    UnresolvedVariable {
        missing: Vec<String>,
        locations: Vec<String>,
    },

    #[error("condition evaluation failed: {0}")]
    Evaluation(String),

    #[error("dependency cycle detected: {}", cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    #[error("step '{step_id}' references unknown table '{unknown_table}'")]
    UnresolvedReference {
        step_id: String,
        unknown_table: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("connector type '{0}' is not registered")]
    ConnectorTypeNotFound(String),

    #[error("unknown parameter '{name}' for connector '{connector}'; accepted: {accepted:?}")]
    UnknownParameter {
        connector: String,
        name: String,
        accepted: Vec<String>,
    },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("circuit open for endpoint '{endpoint}'; retry in {retry_in_ms} ms")]
    CircuitOpen { endpoint: String, retry_in_ms: u64 },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("deadline of {0} ms exceeded")]
    DeadlineExceeded(u64),

    #[error("source '{0}' does not support incremental reads")]
    IncrementalNotSupported(String),

    #[error("source '{0}' has sync_mode incremental but no cursor_field")]
    MissingCursorField(String),

    #[error("source '{0}' has sync_mode incremental but no primary_key")]
    MissingPrimaryKey(String),

    #[error("cursor type error on column '{column}': {detail}")]
    CursorType { column: String, detail: String },

    #[error("watermark regression for {key}: stored {stored} is greater than {attempted}")]
    WatermarkRegression {
        key: String,
        stored: String,
        attempted: String,
    },

    #[error("schema mismatch loading into '{target}': missing columns {missing_columns:?}, type conflicts {type_conflicts:?}")]
    SchemaMismatch {
        target: String,
        missing_columns: Vec<String>,
        type_conflicts: Vec<String>,
    },

    #[error("merge key error on '{target}': missing in source {missing_in_source:?}, missing in target {missing_in_target:?}, type mismatches {type_mismatches:?}")]
    MergeKey {
        target: String,
        missing_in_source: Vec<String>,
        missing_in_target: Vec<String>,
        type_mismatches: Vec<String>,
    },

    #[error("failed to register UDF '{udf_name}': {reason}")]
    UdfRegistration { udf_name: String, reason: String },

    #[error("UDF '{udf_name}' failed: {original}")]
    UdfRuntime { udf_name: String, original: String },

    #[error("SQL execution failed: {0}")]
    SqlExecution(String),

    #[error("step '{step_id}' ({step_type}) failed during {phase}: {source}")]
    Step {
        step_id: String,
        step_type: String,
        phase: Phase,
        #[source]
        source: Box<SqlFlowError>,
    },

    #[error("run cancelled")]
    Cancelled,
}

impl SqlFlowError {
    /// Whether a failure is worth retrying: network-shaped errors, timeouts,
    /// rate-limit responses. Auth, schema, and validation failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            SqlFlowError::DeadlineExceeded(_) => true,
            SqlFlowError::Connection(_) => true,
            SqlFlowError::RateLimit(_) => true,
            SqlFlowError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            SqlFlowError::Reqwest(e) => {
                if e.is_timeout() || e.is_connect() {
                    return true;
                }
                match e.status() {
                    Some(status) => status.is_server_error() || status.as_u16() == 429,
                    None => false,
                }
            }
            SqlFlowError::Step { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Wrap this error in the executor's step envelope.
    pub fn in_step(self, step_id: &str, step_type: &str, phase: Phase) -> SqlFlowError {
        SqlFlowError::Step {
            step_id: step_id.to_string(),
            step_type: step_type.to_string(),
            phase,
            source: Box::new(self),
        }
    }
}

/// Convenience Result type that uses SqlFlowError
pub type Result<T> = std::result::Result<T, SqlFlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SqlFlowError::Configuration("missing url".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing url");
    }

    #[test]
    fn test_step_envelope_display() {
        let err = SqlFlowError::Connection("refused".into()).in_step(
            "load_orders",
            "load",
            Phase::Write,
        );
        let text = err.to_string();
        assert!(text.contains("load_orders"));
        assert!(text.contains("write"));
        assert!(text.contains("refused"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(SqlFlowError::DeadlineExceeded(60_000).is_transient());
        assert!(SqlFlowError::Connection("reset".into()).is_transient());
        assert!(!SqlFlowError::Auth("bad token".into()).is_transient());
        assert!(!SqlFlowError::Schema("drift".into()).is_transient());
    }
}
