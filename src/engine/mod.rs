//! Embedded SQL engine adapter.
//!
//! Wraps a DataFusion `SessionContext` behind the small surface the rest of
//! the crate needs: register batches under a table name (appending), run a
//! SELECT to a materialized [`DataBatch`], materialize a table atomically,
//! and bridge row-wise scalar UDFs onto DataFusion's columnar interface.
//! Callers use unquoted lowercase identifiers; quoting is handled here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use datafusion::arrow::array::{ArrayRef, RecordBatch};
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::datasource::MemTable;
use datafusion::logical_expr::{create_udf, ColumnarValue, Volatility};
use datafusion::prelude::SessionContext;
use datafusion::scalar::ScalarValue;
use tracing::debug;

use crate::batch::DataBatch;
use crate::errors::{Result, SqlFlowError};
use crate::udf::{ScalarFn, UdfDescriptor};

/// Normalize an identifier the way callers are expected to write it.
pub fn normalize_ident(name: &str) -> String {
    name.to_lowercase()
}

/// Quote an identifier for embedding in generated SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", normalize_ident(name).replace('"', "\"\""))
}

/// Process-wide singleton owned by the executor. Internally synchronized;
/// the table map guards registration while queries run on the shared
/// `SessionContext`.
pub struct SqlEngine {
    ctx: SessionContext,
    tables: Mutex<HashMap<String, Vec<RecordBatch>>>,
}

impl SqlEngine {
    pub fn new() -> Self {
        Self {
            ctx: SessionContext::new(),
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Make a batch queryable under `table_name`, appending when the name
    /// already exists.
    pub fn register_batch(&self, table_name: &str, batch: DataBatch) -> Result<()> {
        let name = normalize_ident(table_name);
        let mut tables = self.tables.lock().expect("engine table lock");
        let batches = tables.entry(name.clone()).or_default();
        if let Some(first) = batches.first() {
            if first.schema() != batch.schema() {
                return Err(SqlFlowError::Schema(format!(
                    "batch schema does not match earlier batches registered for '{name}'"
                )));
            }
        }
        batches.push(batch.into_record_batch());
        self.swap_provider(&name, batches)
    }

    /// Atomically replace (or create) a whole table.
    pub fn replace_table(&self, table_name: &str, batch: DataBatch) -> Result<()> {
        let name = normalize_ident(table_name);
        let mut tables = self.tables.lock().expect("engine table lock");
        let batches = vec![batch.into_record_batch()];
        self.swap_provider(&name, &batches)?;
        tables.insert(name, batches);
        Ok(())
    }

    fn swap_provider(&self, name: &str, batches: &[RecordBatch]) -> Result<()> {
        let schema = batches
            .first()
            .map(|b| b.schema())
            .ok_or_else(|| SqlFlowError::Schema(format!("no batches for table '{name}'")))?;
        let provider = MemTable::try_new(schema, vec![batches.to_vec()])?;
        if self.ctx.table_exist(name)? {
            self.ctx.deregister_table(name)?;
        }
        self.ctx.register_table(name, Arc::new(provider))?;
        debug!(table = name, batches = batches.len(), "table registered");
        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> bool {
        self.tables
            .lock()
            .expect("engine table lock")
            .contains_key(&normalize_ident(table_name))
    }

    /// All batches registered under a name, concatenated.
    pub fn table_batch(&self, table_name: &str) -> Result<DataBatch> {
        let name = normalize_ident(table_name);
        let tables = self.tables.lock().expect("engine table lock");
        let batches = tables.get(&name).ok_or_else(|| {
            SqlFlowError::Schema(format!("table '{name}' is not registered"))
        })?;
        let schema = batches
            .first()
            .map(|b| b.schema())
            .ok_or_else(|| SqlFlowError::Schema(format!("table '{name}' has no batches")))?;
        let merged = datafusion::arrow::compute::concat_batches(&schema, batches.iter())?;
        Ok(DataBatch::new(merged))
    }

    pub fn table_schema(&self, table_name: &str) -> Result<SchemaRef> {
        let name = normalize_ident(table_name);
        let tables = self.tables.lock().expect("engine table lock");
        tables
            .get(&name)
            .and_then(|batches| batches.first().map(|b| b.schema()))
            .ok_or_else(|| SqlFlowError::Schema(format!("table '{name}' is not registered")))
    }

    /// Run a SELECT and materialize the result.
    pub async fn execute(&self, sql: &str) -> Result<DataBatch> {
        let df = self
            .ctx
            .sql(sql)
            .await
            .map_err(|e| SqlFlowError::SqlExecution(e.to_string()))?;
        let schema: SchemaRef = Arc::new(df.schema().as_arrow().clone());
        let batches = df
            .collect()
            .await
            .map_err(|e| SqlFlowError::SqlExecution(e.to_string()))?;
        if batches.is_empty() {
            return Ok(DataBatch::empty(schema));
        }
        let merged = datafusion::arrow::compute::concat_batches(&schema, batches.iter())?;
        Ok(DataBatch::new(merged))
    }

    /// `CREATE TABLE <name> AS <sql>`: the table appears only once the
    /// query has fully materialized.
    pub async fn materialize(&self, table_name: &str, sql: &str) -> Result<u64> {
        let batch = self.execute(sql).await?;
        let rows = batch.row_count() as u64;
        self.replace_table(table_name, batch)?;
        Ok(rows)
    }

    /// Bridge a row-at-a-time scalar function onto DataFusion's columnar
    /// UDF interface.
    pub fn register_scalar_udf(&self, descriptor: &UdfDescriptor, f: ScalarFn) -> Result<()> {
        let arg_types: Vec<_> = descriptor.arg_types.iter().map(|t| t.to_arrow()).collect();
        let return_type = descriptor
            .return_type
            .ok_or_else(|| SqlFlowError::UdfRegistration {
                udf_name: descriptor.qualified_name.clone(),
                reason: "scalar UDFs must declare a return type".to_string(),
            })?
            .to_arrow();

        let name = descriptor.qualified_name.clone();
        let udf_name = name.clone();
        let fun = Arc::new(move |args: &[ColumnarValue]| {
            let num_rows = args
                .iter()
                .find_map(|cv| match cv {
                    ColumnarValue::Array(a) => Some(a.len()),
                    ColumnarValue::Scalar(_) => None,
                })
                .unwrap_or(1);
            let arrays: Vec<ArrayRef> = args
                .iter()
                .map(|cv| cv.clone().into_array(num_rows))
                .collect::<datafusion::error::Result<_>>()?;

            let mut outputs = Vec::with_capacity(num_rows);
            for row in 0..num_rows {
                let inputs: Vec<ScalarValue> = arrays
                    .iter()
                    .map(|a| ScalarValue::try_from_array(a, row))
                    .collect::<datafusion::error::Result<_>>()?;
                let out = f(&inputs).map_err(|e| {
                    datafusion::error::DataFusionError::Execution(format!(
                        "UDF '{udf_name}' failed: {e}"
                    ))
                })?;
                outputs.push(out);
            }
            let array = ScalarValue::iter_to_array(outputs)?;
            Ok(ColumnarValue::Array(array))
        });

        let udf = create_udf(&name, arg_types, return_type, Volatility::Volatile, fun);
        self.ctx.register_udf(udf);
        Ok(())
    }
}

impl Default for SqlEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::LogicalType;
    use crate::udf::UdfKind;
    use serde_json::json;

    fn orders() -> DataBatch {
        DataBatch::from_json_rows(&[
            json!({"customer_id": 1, "amount": 10.0}),
            json!({"customer_id": 1, "amount": 5.0}),
            json!({"customer_id": 2, "amount": 7.0}),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_and_query() {
        let engine = SqlEngine::new();
        engine.register_batch("orders_raw", orders()).unwrap();
        let result = engine
            .execute(
                "SELECT customer_id, SUM(amount) AS total FROM orders_raw \
                 GROUP BY customer_id ORDER BY customer_id",
            )
            .await
            .unwrap();
        assert_eq!(result.row_count(), 2);
        let rows = result.rows().unwrap();
        assert_eq!(rows[0]["total"], 15.0);
        assert_eq!(rows[1]["total"], 7.0);
    }

    #[tokio::test]
    async fn test_register_appends_to_logical_table() {
        let engine = SqlEngine::new();
        engine
            .register_batch("t", DataBatch::from_json_rows(&[json!({"v": 1})]).unwrap())
            .unwrap();
        engine
            .register_batch("t", DataBatch::from_json_rows(&[json!({"v": 2})]).unwrap())
            .unwrap();
        let result = engine.execute("SELECT COUNT(*) AS n FROM t").await.unwrap();
        assert_eq!(result.rows().unwrap()[0]["n"], 2);
    }

    #[tokio::test]
    async fn test_materialize_creates_queryable_table() {
        let engine = SqlEngine::new();
        engine.register_batch("orders_raw", orders()).unwrap();
        let rows = engine
            .materialize(
                "totals",
                "SELECT customer_id, SUM(amount) AS total FROM orders_raw GROUP BY customer_id",
            )
            .await
            .unwrap();
        assert_eq!(rows, 2);
        let result = engine.execute("SELECT * FROM totals").await.unwrap();
        assert_eq!(result.row_count(), 2);
    }

    #[tokio::test]
    async fn test_identifiers_normalized_to_lowercase() {
        let engine = SqlEngine::new();
        engine.register_batch("Orders_Raw", orders()).unwrap();
        assert!(engine.table_exists("orders_raw"));
        let result = engine
            .execute("SELECT COUNT(*) AS n FROM orders_raw")
            .await
            .unwrap();
        assert_eq!(result.rows().unwrap()[0]["n"], 3);
    }

    #[tokio::test]
    async fn test_scalar_udf_row_bridge() {
        let engine = SqlEngine::new();
        engine.register_batch("orders_raw", orders()).unwrap();
        let descriptor = UdfDescriptor {
            qualified_name: "twice".to_string(),
            kind: UdfKind::Scalar,
            arg_types: vec![LogicalType::Float64],
            return_type: Some(LogicalType::Float64),
            doc: String::new(),
            origin: None,
        };
        let f: ScalarFn = Arc::new(|args| match &args[0] {
            ScalarValue::Float64(Some(v)) => Ok(ScalarValue::Float64(Some(v * 2.0))),
            other => Ok(other.clone()),
        });
        engine.register_scalar_udf(&descriptor, f).unwrap();
        let result = engine
            .execute("SELECT twice(amount) AS a FROM orders_raw ORDER BY a")
            .await
            .unwrap();
        assert_eq!(result.rows().unwrap()[2]["a"], 20.0);
    }

    #[tokio::test]
    async fn test_sql_error_is_structured() {
        let engine = SqlEngine::new();
        let err = engine.execute("SELECT * FROM missing").await.unwrap_err();
        assert!(matches!(err, SqlFlowError::SqlExecution(_)));
    }
}
