//! Columnar data interchange.
//!
//! A [`DataBatch`] is the currency passed from sources through the SQL
//! engine to destinations: an immutable Arrow `RecordBatch` plus a logical
//! schema view. The columnar view is the zero-copy path into the engine;
//! a row-oriented JSON view is derived lazily and cached for connectors
//! that emit records.

use std::sync::{Arc, OnceLock};

use datafusion::arrow::array::{ArrayRef, RecordBatch};
use datafusion::arrow::compute::concat_batches;
use datafusion::arrow::datatypes::{DataType, Field, FieldRef, Schema, SchemaRef, TimeUnit};
use serde_arrow::schema::{SchemaLike, TracingOptions};
use serde_json::Value;

use crate::errors::{Result, SqlFlowError};

/// Logical column types carried by batch schemas. The Arrow physical type
/// is an implementation detail; compatibility checks happen at this level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalType {
    String,
    Int64,
    Float64,
    Bool,
    TimestampUtc,
    Decimal { precision: u8, scale: i8 },
    Bytes,
}

impl LogicalType {
    pub fn from_arrow(dt: &DataType) -> Result<LogicalType> {
        match dt {
            DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => Ok(LogicalType::String),
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64 => Ok(LogicalType::Int64),
            DataType::Float16 | DataType::Float32 | DataType::Float64 => Ok(LogicalType::Float64),
            DataType::Boolean => Ok(LogicalType::Bool),
            DataType::Timestamp(_, _) | DataType::Date32 | DataType::Date64 => {
                Ok(LogicalType::TimestampUtc)
            }
            DataType::Decimal128(p, s) => Ok(LogicalType::Decimal {
                precision: *p,
                scale: *s,
            }),
            DataType::Binary | DataType::LargeBinary | DataType::BinaryView => {
                Ok(LogicalType::Bytes)
            }
            other => Err(SqlFlowError::Schema(format!(
                "unsupported column type {other}"
            ))),
        }
    }

    pub fn to_arrow(&self) -> DataType {
        match self {
            LogicalType::String => DataType::Utf8,
            LogicalType::Int64 => DataType::Int64,
            LogicalType::Float64 => DataType::Float64,
            LogicalType::Bool => DataType::Boolean,
            LogicalType::TimestampUtc => {
                DataType::Timestamp(TimeUnit::Microsecond, Some(Arc::from("UTC")))
            }
            LogicalType::Decimal { precision, scale } => {
                DataType::Decimal128(*precision, *scale)
            }
            LogicalType::Bytes => DataType::Binary,
        }
    }
}

impl std::fmt::Display for LogicalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogicalType::String => f.write_str("string"),
            LogicalType::Int64 => f.write_str("int64"),
            LogicalType::Float64 => f.write_str("float64"),
            LogicalType::Bool => f.write_str("bool"),
            LogicalType::TimestampUtc => f.write_str("timestamp-utc"),
            LogicalType::Decimal { precision, scale } => {
                write!(f, "decimal({precision},{scale})")
            }
            LogicalType::Bytes => f.write_str("bytes"),
        }
    }
}

/// One column of a batch schema: `(name, logical_type, nullable)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub logical_type: LogicalType,
    pub nullable: bool,
}

/// Immutable columnar batch. Cloning shares the underlying Arrow buffers.
#[derive(Debug, Clone)]
pub struct DataBatch {
    inner: RecordBatch,
    rows: Arc<OnceLock<Vec<Value>>>,
}

impl DataBatch {
    pub fn new(batch: RecordBatch) -> Self {
        Self {
            inner: batch,
            rows: Arc::new(OnceLock::new()),
        }
    }

    /// An empty batch that still carries its schema.
    pub fn empty(schema: SchemaRef) -> Self {
        Self::new(RecordBatch::new_empty(schema))
    }

    /// Build a batch from JSON object rows, inferring the schema from the
    /// samples. Used by connectors whose native format is records.
    pub fn from_json_rows(rows: &[Value]) -> Result<Self> {
        let options = TracingOptions::default()
            .allow_null_fields(true)
            .coerce_numbers(true);
        let fields = Vec::<FieldRef>::from_samples(&rows, options)?;
        let batch = serde_arrow::to_record_batch(&fields, &rows)?;
        Ok(Self::new(batch))
    }

    pub fn schema(&self) -> SchemaRef {
        self.inner.schema()
    }

    /// Zero-copy columnar view.
    pub fn columns(&self) -> &[ArrayRef] {
        self.inner.columns()
    }

    pub fn column_by_name(&self, name: &str) -> Option<&ArrayRef> {
        self.inner.column_by_name(name)
    }

    pub fn row_count(&self) -> usize {
        self.inner.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.num_rows() == 0
    }

    /// The logical schema contract.
    pub fn column_specs(&self) -> Result<Vec<ColumnSpec>> {
        self.inner
            .schema()
            .fields()
            .iter()
            .map(|f| {
                Ok(ColumnSpec {
                    name: f.name().clone(),
                    logical_type: LogicalType::from_arrow(f.data_type())?,
                    nullable: f.is_nullable(),
                })
            })
            .collect()
    }

    /// Row-oriented view as JSON objects. Derived on first use and cached;
    /// later calls are free.
    pub fn rows(&self) -> Result<&[Value]> {
        if let Some(rows) = self.rows.get() {
            return Ok(rows);
        }
        let rows: Vec<Value> = serde_arrow::from_record_batch(&self.inner)?;
        Ok(self.rows.get_or_init(|| rows))
    }

    pub fn record_batch(&self) -> &RecordBatch {
        &self.inner
    }

    pub fn into_record_batch(self) -> RecordBatch {
        self.inner
    }

    /// Concatenate batches sharing one schema into a single batch.
    pub fn concat(batches: &[DataBatch]) -> Result<DataBatch> {
        let Some(first) = batches.first() else {
            return Err(SqlFlowError::Schema(
                "cannot concatenate zero batches".to_string(),
            ));
        };
        let schema = first.schema();
        let inner: Vec<&RecordBatch> = batches.iter().map(|b| &b.inner).collect();
        Ok(DataBatch::new(concat_batches(&schema, inner)?))
    }
}

impl From<RecordBatch> for DataBatch {
    fn from(batch: RecordBatch) -> Self {
        DataBatch::new(batch)
    }
}

/// Build an Arrow schema from column specs.
pub fn schema_from_specs(specs: &[ColumnSpec]) -> SchemaRef {
    let fields: Vec<Field> = specs
        .iter()
        .map(|c| Field::new(&c.name, c.logical_type.to_arrow(), c.nullable))
        .collect();
    Arc::new(Schema::new(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_rows_infers_schema() {
        let batch = DataBatch::from_json_rows(&[
            json!({"customer_id": 1, "amount": 10.5}),
            json!({"customer_id": 2, "amount": 7.0}),
        ])
        .unwrap();
        assert_eq!(batch.row_count(), 2);
        let specs = batch.column_specs().unwrap();
        let amount = specs.iter().find(|c| c.name == "amount").unwrap();
        assert_eq!(amount.logical_type, LogicalType::Float64);
    }

    #[test]
    fn test_rows_view_round_trips() {
        let rows = vec![
            json!({"id": 1, "name": "a"}),
            json!({"id": 2, "name": "b"}),
        ];
        let batch = DataBatch::from_json_rows(&rows).unwrap();
        let view = batch.rows().unwrap();
        assert_eq!(view.len(), 2);
        assert_eq!(view[0]["name"], "a");
        // Second call returns the cached slice.
        let again = batch.rows().unwrap();
        assert_eq!(view.as_ptr(), again.as_ptr());
    }

    #[test]
    fn test_empty_batch_keeps_schema() {
        let schema = schema_from_specs(&[ColumnSpec {
            name: "id".into(),
            logical_type: LogicalType::Int64,
            nullable: false,
        }]);
        let batch = DataBatch::empty(schema);
        assert_eq!(batch.row_count(), 0);
        assert_eq!(batch.column_specs().unwrap().len(), 1);
    }

    #[test]
    fn test_concat_batches() {
        let a = DataBatch::from_json_rows(&[json!({"id": 1})]).unwrap();
        let b = DataBatch::from_json_rows(&[json!({"id": 2}), json!({"id": 3})]).unwrap();
        let merged = DataBatch::concat(&[a, b]).unwrap();
        assert_eq!(merged.row_count(), 3);
    }
}
