//! Connector framework: uniform source/destination contracts and the typed
//! registry that owns them.
//!
//! Sources read [`DataBatch`] streams out of external systems; destinations
//! write them back. Both are configured from a JSON parameter object that is
//! validated against a per-connector schema accepting industry-standard
//! parameter names (see [`params`]).

pub mod csv;
pub mod memory;
pub mod params;
pub mod parquet;
pub mod postgres;
pub mod rest;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use indexmap::IndexMap;
use serde_json::Value;

use crate::batch::{ColumnSpec, DataBatch};
use crate::errors::{Result, SqlFlowError};
use crate::parser::ast::LoadMode;
use crate::watermark::CursorValue;

/// Stream of batches flowing out of a source read.
pub type BatchStream = BoxStream<'static, Result<DataBatch>>;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionTest {
    pub ok: bool,
    pub message: String,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct HealthMetrics {
    pub reads: u64,
    pub rows: u64,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Health {
    pub state: HealthState,
    pub metrics: HealthMetrics,
}

impl Default for Health {
    fn default() -> Self {
        Health {
            state: HealthState::Healthy,
            metrics: HealthMetrics::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct WriteResult {
    pub rows_written: u64,
}

/// Contract for connectors that read data out of external systems.
///
/// `configure` runs once before any other method; implementations validate
/// their parameter object there and keep the resolved settings.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn connector_type(&self) -> &'static str;

    fn configure(&mut self, params: &Value) -> Result<()>;

    async fn test_connection(&self) -> Result<ConnectionTest>;

    /// Names of the objects (files, tables, endpoints) this source exposes.
    async fn discover(&self) -> Result<Vec<String>>;

    async fn get_schema(&self, object: &str) -> Result<Vec<ColumnSpec>>;

    async fn read(
        &self,
        object: &str,
        columns: Option<&[String]>,
        filters: Option<&Value>,
    ) -> Result<BatchStream>;

    fn supports_incremental(&self) -> bool {
        false
    }

    /// Read rows whose cursor column is strictly greater than `cursor`.
    /// `None` means first run: read the full history.
    async fn read_incremental(
        &self,
        _object: &str,
        _cursor_field: &str,
        _cursor: Option<&CursorValue>,
        _columns: Option<&[String]>,
    ) -> Result<BatchStream> {
        Err(SqlFlowError::IncrementalNotSupported(
            self.connector_type().to_string(),
        ))
    }

    /// The maximum cursor value observed in a batch.
    fn get_cursor_value(&self, batch: &DataBatch, field: &str) -> Result<Option<CursorValue>> {
        crate::watermark::max_cursor(batch, field)
    }

    fn health(&self) -> Health {
        Health::default()
    }
}

/// Contract for connectors that write batches to external systems.
///
/// Destinations accept `REPLACE` and `APPEND`; keyed merges happen on the
/// embedded engine before anything reaches a destination, so `MERGE` here
/// is a configuration error.
#[async_trait]
pub trait DestinationConnector: Send + Sync {
    fn connector_type(&self) -> &'static str;

    fn configure(&mut self, params: &Value) -> Result<()>;

    async fn test_connection(&self) -> Result<ConnectionTest>;

    async fn write(&self, object: &str, batch: &DataBatch, mode: LoadMode)
        -> Result<WriteResult>;
}

pub type SourceFactory = Arc<dyn Fn() -> Box<dyn SourceConnector> + Send + Sync>;
pub type DestinationFactory = Arc<dyn Fn() -> Box<dyn DestinationConnector> + Send + Sync>;

/// Two disjoint registries keyed by uppercase connector-type string.
/// Registration happens once at startup; lookups create fresh connector
/// instances so concurrent steps never share connection state.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    sources: IndexMap<String, SourceFactory>,
    destinations: IndexMap<String, DestinationFactory>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in connectors.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_source("CSV", Arc::new(|| Box::new(csv::CsvSource::new())));
        registry.register_source("IN_MEMORY", Arc::new(|| Box::new(memory::MemorySource::new())));
        registry.register_source("REST", Arc::new(|| Box::new(rest::RestSource::new())));
        registry.register_source("PARQUET", Arc::new(|| Box::new(parquet::ParquetSource::new())));
        registry.register_destination("CSV", Arc::new(|| Box::new(csv::CsvDestination::new())));
        registry.register_destination(
            "IN_MEMORY",
            Arc::new(|| Box::new(memory::MemoryDestination::new())),
        );
        registry.register_destination(
            "PARQUET",
            Arc::new(|| Box::new(parquet::ParquetDestination::new())),
        );
        registry.register_destination(
            "POSTGRES",
            Arc::new(|| Box::new(postgres::PostgresDestination::new())),
        );
        registry
    }

    /// Re-registering a type replaces the factory, so startup registration
    /// is idempotent.
    pub fn register_source(&mut self, connector_type: &str, factory: SourceFactory) {
        self.sources.insert(connector_type.to_uppercase(), factory);
    }

    pub fn register_destination(&mut self, connector_type: &str, factory: DestinationFactory) {
        self.destinations
            .insert(connector_type.to_uppercase(), factory);
    }

    pub fn create_source(&self, connector_type: &str) -> Result<Box<dyn SourceConnector>> {
        self.sources
            .get(&connector_type.to_uppercase())
            .map(|f| f())
            .ok_or_else(|| SqlFlowError::ConnectorTypeNotFound(connector_type.to_uppercase()))
    }

    pub fn create_destination(
        &self,
        connector_type: &str,
    ) -> Result<Box<dyn DestinationConnector>> {
        self.destinations
            .get(&connector_type.to_uppercase())
            .map(|f| f())
            .ok_or_else(|| SqlFlowError::ConnectorTypeNotFound(connector_type.to_uppercase()))
    }

    pub fn source_types(&self) -> Vec<&str> {
        self.sources.keys().map(String::as_str).collect()
    }

    pub fn destination_types(&self) -> Vec<&str> {
        self.destinations.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = ConnectorRegistry::with_builtins();
        assert!(registry.create_source("csv").is_ok());
        assert!(registry.create_source("Csv").is_ok());
    }

    #[test]
    fn test_unknown_type_is_reported() {
        let registry = ConnectorRegistry::with_builtins();
        let err = match registry.create_source("MONGO") {
            Err(e) => e,
            Ok(_) => panic!("called unwrap_err() on an Ok value"),
        };
        assert!(matches!(err, SqlFlowError::ConnectorTypeNotFound(t) if t == "MONGO"));
    }

    #[test]
    fn test_source_and_destination_registries_are_disjoint() {
        let registry = ConnectorRegistry::with_builtins();
        // REST reads only; POSTGRES writes only.
        assert!(registry.create_source("REST").is_ok());
        assert!(registry.create_destination("REST").is_err());
        assert!(registry.create_destination("POSTGRES").is_ok());
        assert!(registry.create_source("POSTGRES").is_err());
    }
}
