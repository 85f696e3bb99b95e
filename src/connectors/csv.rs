//! CSV source and destination over the Arrow CSV readers and writers.

use std::fs::File;
use std::io::Seek;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use datafusion::arrow::csv::reader::Format;
use datafusion::arrow::csv::{ReaderBuilder, WriterBuilder};
use datafusion::arrow::datatypes::SchemaRef;
use serde_json::Value;
use tracing::debug;

use crate::batch::{ColumnSpec, DataBatch};
use crate::connectors::params::{ParamKind, ParamMap, ParamSchema, ParamSpec};
use crate::connectors::{
    BatchStream, ConnectionTest, DestinationConnector, Health, HealthMetrics, HealthState,
    SourceConnector, WriteResult,
};
use crate::errors::{Result, SqlFlowError};
use crate::parser::ast::LoadMode;
use crate::watermark::{filter_after_cursor, CursorValue};

const DEFAULT_BATCH_SIZE: usize = 1024;
const SCHEMA_SAMPLE_ROWS: usize = 1000;

fn source_schema() -> ParamSchema {
    ParamSchema::for_source(
        "CSV",
        vec![
            ParamSpec::required("path", ParamKind::Str),
            ParamSpec::optional("has_header", ParamKind::Bool),
            ParamSpec::optional("delimiter", ParamKind::Str),
            ParamSpec::optional("batch_size", ParamKind::Int),
        ],
    )
}

fn destination_schema() -> ParamSchema {
    ParamSchema::new(
        "CSV",
        vec![
            ParamSpec::optional("header", ParamKind::Bool),
            ParamSpec::optional("delimiter", ParamKind::Str),
        ],
    )
}

#[derive(Debug)]
pub struct CsvSource {
    path: PathBuf,
    has_header: bool,
    delimiter: u8,
    batch_size: usize,
    reads: AtomicU64,
    rows: AtomicU64,
    consecutive_failures: AtomicU32,
}

impl CsvSource {
    pub fn new() -> Self {
        Self {
            path: PathBuf::new(),
            has_header: true,
            delimiter: b',',
            batch_size: DEFAULT_BATCH_SIZE,
            reads: AtomicU64::new(0),
            rows: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    fn format(&self) -> Format {
        Format::default()
            .with_header(self.has_header)
            .with_delimiter(self.delimiter)
    }

    fn infer_schema(&self) -> Result<SchemaRef> {
        let mut file = File::open(&self.path)?;
        let (schema, _) = self
            .format()
            .infer_schema(&mut file, Some(SCHEMA_SAMPLE_ROWS))?;
        Ok(Arc::new(schema))
    }

    /// All batches of the file, optionally projected and cursor-filtered.
    fn read_batches(
        &self,
        columns: Option<&[String]>,
        cursor: Option<(&str, Option<&CursorValue>)>,
    ) -> Result<Vec<DataBatch>> {
        let schema = self.infer_schema()?;
        let projection: Option<Vec<usize>> = match columns {
            None => None,
            Some(names) => Some(
                names
                    .iter()
                    .map(|name| {
                        schema.index_of(name).map_err(|_| {
                            SqlFlowError::Schema(format!(
                                "column '{name}' not found in {}",
                                self.path.display()
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
        };

        let mut file = File::open(&self.path)?;
        file.rewind()?;
        let mut builder = ReaderBuilder::new(schema)
            .with_format(self.format())
            .with_batch_size(self.batch_size);
        if let Some(projection) = projection {
            builder = builder.with_projection(projection);
        }
        let reader = builder.build(file)?;

        let mut batches = Vec::new();
        let mut rows = 0u64;
        for batch in reader {
            let batch = match batch {
                Ok(batch) => DataBatch::new(batch),
                Err(e) => {
                    self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(e.into());
                }
            };
            let batch = match cursor {
                Some((field, watermark)) => filter_after_cursor(&batch, field, watermark)?,
                None => batch,
            };
            rows += batch.row_count() as u64;
            batches.push(batch);
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.rows.fetch_add(rows, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        debug!(path = %self.path.display(), batches = batches.len(), "csv read complete");
        Ok(batches)
    }
}

#[async_trait]
impl SourceConnector for CsvSource {
    fn connector_type(&self) -> &'static str {
        "CSV"
    }

    fn configure(&mut self, params: &Value) -> Result<()> {
        let validated = source_schema().validate(params)?;
        let path = validated
            .str_param("path")
            .expect("path is required by the schema");
        self.path = PathBuf::from(path);
        self.has_header = validated.bool_param("has_header", true);
        if let Some(delim) = validated.str_param("delimiter") {
            let bytes = delim.as_bytes();
            if bytes.len() != 1 {
                return Err(SqlFlowError::Configuration(format!(
                    "CSV delimiter must be a single character, got '{delim}'"
                )));
            }
            self.delimiter = bytes[0];
        }
        if let Some(size) = validated.int_param("batch_size") {
            self.batch_size = size.max(1) as usize;
        }
        Ok(())
    }

    async fn test_connection(&self) -> Result<ConnectionTest> {
        let started = Instant::now();
        let ok = self.path.is_file();
        Ok(ConnectionTest {
            ok,
            message: if ok {
                format!("{} is readable", self.path.display())
            } else {
                format!("{} does not exist", self.path.display())
            },
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn discover(&self) -> Result<Vec<String>> {
        Ok(vec![self.path.display().to_string()])
    }

    async fn get_schema(&self, _object: &str) -> Result<Vec<ColumnSpec>> {
        let schema = self.infer_schema()?;
        DataBatch::empty(schema).column_specs()
    }

    async fn read(
        &self,
        _object: &str,
        columns: Option<&[String]>,
        _filters: Option<&Value>,
    ) -> Result<BatchStream> {
        let batches = self.read_batches(columns, None)?;
        Ok(Box::pin(tokio_stream::iter(batches.into_iter().map(Ok))))
    }

    fn supports_incremental(&self) -> bool {
        true
    }

    async fn read_incremental(
        &self,
        _object: &str,
        cursor_field: &str,
        cursor: Option<&CursorValue>,
        columns: Option<&[String]>,
    ) -> Result<BatchStream> {
        let batches = self.read_batches(columns, Some((cursor_field, cursor)))?;
        Ok(Box::pin(tokio_stream::iter(batches.into_iter().map(Ok))))
    }

    fn health(&self) -> Health {
        let consecutive_failures = self.consecutive_failures.load(Ordering::Relaxed);
        let state = match consecutive_failures {
            0 => HealthState::Healthy,
            1..=2 => HealthState::Degraded,
            _ => HealthState::Unhealthy,
        };
        Health {
            state,
            metrics: HealthMetrics {
                reads: self.reads.load(Ordering::Relaxed),
                rows: self.rows.load(Ordering::Relaxed),
                consecutive_failures,
            },
        }
    }
}

#[derive(Debug)]
pub struct CsvDestination {
    header: bool,
    delimiter: u8,
}

impl CsvDestination {
    pub fn new() -> Self {
        Self {
            header: true,
            delimiter: b',',
        }
    }
}

#[async_trait]
impl DestinationConnector for CsvDestination {
    fn connector_type(&self) -> &'static str {
        "CSV"
    }

    fn configure(&mut self, params: &Value) -> Result<()> {
        let validated = destination_schema().validate(params)?;
        self.header = validated.bool_param("header", true);
        if let Some(delim) = validated.str_param("delimiter") {
            let bytes = delim.as_bytes();
            if bytes.len() != 1 {
                return Err(SqlFlowError::Configuration(format!(
                    "CSV delimiter must be a single character, got '{delim}'"
                )));
            }
            self.delimiter = bytes[0];
        }
        Ok(())
    }

    async fn test_connection(&self) -> Result<ConnectionTest> {
        Ok(ConnectionTest {
            ok: true,
            message: "local filesystem".to_string(),
            latency_ms: 0,
        })
    }

    async fn write(
        &self,
        object: &str,
        batch: &DataBatch,
        mode: LoadMode,
    ) -> Result<WriteResult> {
        let path = Path::new(object);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let appending = mode == LoadMode::Append && path.is_file();
        let file = match mode {
            LoadMode::Replace => File::create(path)?,
            LoadMode::Append => File::options().create(true).append(true).open(path)?,
            LoadMode::Merge => {
                return Err(SqlFlowError::Configuration(
                    "CSV destination supports REPLACE and APPEND only".to_string(),
                ))
            }
        };

        // Never repeat the header when appending to an existing file.
        let mut writer = WriterBuilder::new()
            .with_header(self.header && !appending)
            .with_delimiter(self.delimiter)
            .build(file);
        writer.write(batch.record_batch())?;
        Ok(WriteResult {
            rows_written: batch.row_count() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tokio_stream::StreamExt;

    async fn read_all(source: &CsvSource) -> Vec<DataBatch> {
        let mut stream = source.read("orders", None, None).await.unwrap();
        let mut out = Vec::new();
        while let Some(batch) = stream.next().await {
            out.push(batch.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_read_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.csv");
        std::fs::write(&path, "customer_id,amount\n1,10\n1,5\n2,7\n").unwrap();

        let mut source = CsvSource::new();
        source
            .configure(&json!({"path": path.to_str().unwrap(), "has_header": true}))
            .unwrap();
        let batches = read_all(&source).await;
        assert_eq!(batches.iter().map(|b| b.row_count()).sum::<usize>(), 3);
    }

    #[tokio::test]
    async fn test_incremental_filters_past_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.csv");
        std::fs::write(
            &path,
            "event_ts,v\n2024-01-01,1\n2024-01-02,2\n2024-01-03,3\n",
        )
        .unwrap();

        let mut source = CsvSource::new();
        source
            .configure(&json!({
                "path": path.to_str().unwrap(),
                "sync_mode": "incremental",
                "cursor_field": "event_ts",
                "primary_key": "event_ts"
            }))
            .unwrap();
        assert!(source.supports_incremental());

        // Arrow's CSV inference reads YYYY-MM-DD as Date32, so the cursor
        // arrives as a timestamp.
        let cursor = CursorValue::Timestamp(
            chrono::Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        );
        let mut stream = source
            .read_incremental("events", "event_ts", Some(&cursor), None)
            .await
            .unwrap();
        let mut rows = 0;
        while let Some(batch) = stream.next().await {
            rows += batch.unwrap().row_count();
        }
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/totals.csv");
        let batch = DataBatch::from_json_rows(&[
            json!({"customer_id": 1, "total": 15}),
            json!({"customer_id": 2, "total": 7}),
        ])
        .unwrap();

        let mut dest = CsvDestination::new();
        dest.configure(&json!({"header": true})).unwrap();
        let result = dest
            .write(path.to_str().unwrap(), &batch, LoadMode::Replace)
            .await
            .unwrap();
        assert_eq!(result.rows_written, 2);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("customer_id,total"));
        assert!(text.contains("1,15"));
    }

    #[tokio::test]
    async fn test_unknown_param_rejected() {
        let mut source = CsvSource::new();
        let err = source
            .configure(&json!({"path": "x.csv", "separator": ";"}))
            .unwrap_err();
        assert!(matches!(err, SqlFlowError::UnknownParameter { .. }));
    }
}
