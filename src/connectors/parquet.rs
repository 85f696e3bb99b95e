//! Parquet source and destination over the Arrow parquet readers/writers.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use datafusion::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use datafusion::parquet::arrow::ArrowWriter;
use serde_json::Value;

use crate::batch::{ColumnSpec, DataBatch};
use crate::connectors::params::{ParamKind, ParamMap, ParamSchema, ParamSpec};
use crate::connectors::{
    BatchStream, ConnectionTest, DestinationConnector, SourceConnector, WriteResult,
};
use crate::errors::{Result, SqlFlowError};
use crate::parser::ast::LoadMode;
use crate::watermark::{filter_after_cursor, CursorValue};

const DEFAULT_BATCH_SIZE: usize = 1024;

fn source_schema() -> ParamSchema {
    ParamSchema::for_source(
        "PARQUET",
        vec![
            ParamSpec::required("path", ParamKind::Str),
            ParamSpec::optional("batch_size", ParamKind::Int),
        ],
    )
}

pub struct ParquetSource {
    path: PathBuf,
    batch_size: usize,
}

impl ParquetSource {
    pub fn new() -> Self {
        Self {
            path: PathBuf::new(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    fn read_batches(
        &self,
        cursor: Option<(&str, Option<&CursorValue>)>,
    ) -> Result<Vec<DataBatch>> {
        let file = File::open(&self.path)?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?
            .with_batch_size(self.batch_size)
            .build()?;
        let mut batches = Vec::new();
        for batch in reader {
            let batch = DataBatch::new(batch?);
            let batch = match cursor {
                Some((field, watermark)) => filter_after_cursor(&batch, field, watermark)?,
                None => batch,
            };
            batches.push(batch);
        }
        Ok(batches)
    }
}

#[async_trait]
impl SourceConnector for ParquetSource {
    fn connector_type(&self) -> &'static str {
        "PARQUET"
    }

    fn configure(&mut self, params: &Value) -> Result<()> {
        let validated = source_schema().validate(params)?;
        self.path = PathBuf::from(
            validated
                .str_param("path")
                .expect("path is required by the schema"),
        );
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
        let file = File::open(&self.path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        DataBatch::empty(builder.schema().clone()).column_specs()
    }

    async fn read(
        &self,
        _object: &str,
        _columns: Option<&[String]>,
        _filters: Option<&Value>,
    ) -> Result<BatchStream> {
        let batches = self.read_batches(None)?;
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
        _columns: Option<&[String]>,
    ) -> Result<BatchStream> {
        let batches = self.read_batches(Some((cursor_field, cursor)))?;
        Ok(Box::pin(tokio_stream::iter(batches.into_iter().map(Ok))))
    }
}

pub struct ParquetDestination;

impl ParquetDestination {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DestinationConnector for ParquetDestination {
    fn connector_type(&self) -> &'static str {
        "PARQUET"
    }

    fn configure(&mut self, params: &Value) -> Result<()> {
        ParamSchema::new("PARQUET", Vec::new()).validate(params)?;
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
        if mode != LoadMode::Replace {
            return Err(SqlFlowError::Configuration(
                "PARQUET destination supports REPLACE only".to_string(),
            ));
        }
        let path = Path::new(object);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
        writer.write(batch.record_batch())?;
        writer.close()?;
        Ok(WriteResult {
            rows_written: batch.row_count() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.parquet");
        let batch = DataBatch::from_json_rows(&[
            json!({"id": 1, "v": "a"}),
            json!({"id": 2, "v": "b"}),
        ])
        .unwrap();

        let dest = ParquetDestination::new();
        dest.write(path.to_str().unwrap(), &batch, LoadMode::Replace)
            .await
            .unwrap();

        let mut source = ParquetSource::new();
        source
            .configure(&json!({"path": path.to_str().unwrap()}))
            .unwrap();
        let mut stream = source.read("events", None, None).await.unwrap();
        let read = stream.next().await.unwrap().unwrap();
        assert_eq!(read.row_count(), 2);
    }

    #[tokio::test]
    async fn test_append_rejected() {
        let dest = ParquetDestination::new();
        let batch = DataBatch::from_json_rows(&[json!({"id": 1})]).unwrap();
        let err = dest
            .write("x.parquet", &batch, LoadMode::Append)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("REPLACE only"));
    }
}
