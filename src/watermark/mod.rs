//! Watermark persistence for incremental loads.
//!
//! A watermark is the highest cursor value committed for a
//! `(pipeline, source, target, cursor_column)` key. The store is
//! transactional: `set` either lands completely or leaves the prior value
//! intact, and strictly-decreasing writes are rejected so the stored
//! sequence is non-decreasing across runs.

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datafusion::arrow::array::{
    Array, ArrayRef, Date32Array, Float32Array, Float64Array, Int16Array, Int32Array, Int64Array,
    LargeStringArray, StringArray, StringViewArray, TimestampMicrosecondArray,
    TimestampMillisecondArray, TimestampNanosecondArray, TimestampSecondArray, UInt32Array,
    UInt64Array,
};
use datafusion::arrow::datatypes::{DataType, TimeUnit};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::batch::DataBatch;
use crate::errors::{Result, SqlFlowError};

/// A comparable cursor scalar. Values only order against the same variant
/// (with int/float interchange for numeric columns); anything else is a
/// cursor type error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CursorValue {
    Int(i64),
    Float(f64),
    Str(String),
    Timestamp(DateTime<Utc>),
}

impl CursorValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            CursorValue::Int(_) => "int",
            CursorValue::Float(_) => "float",
            CursorValue::Str(_) => "string",
            CursorValue::Timestamp(_) => "timestamp",
        }
    }

    pub fn compare(&self, other: &CursorValue, column: &str) -> Result<Ordering> {
        match (self, other) {
            (CursorValue::Int(a), CursorValue::Int(b)) => Ok(a.cmp(b)),
            (CursorValue::Float(a), CursorValue::Float(b)) => {
                a.partial_cmp(b).ok_or_else(|| SqlFlowError::CursorType {
                    column: column.to_string(),
                    detail: "NaN cursor values are not comparable".to_string(),
                })
            }
            (CursorValue::Int(a), CursorValue::Float(b)) => (*a as f64)
                .partial_cmp(b)
                .ok_or_else(|| SqlFlowError::CursorType {
                    column: column.to_string(),
                    detail: "NaN cursor values are not comparable".to_string(),
                }),
            (CursorValue::Float(a), CursorValue::Int(b)) => a
                .partial_cmp(&(*b as f64))
                .ok_or_else(|| SqlFlowError::CursorType {
                    column: column.to_string(),
                    detail: "NaN cursor values are not comparable".to_string(),
                }),
            (CursorValue::Str(a), CursorValue::Str(b)) => Ok(a.cmp(b)),
            (CursorValue::Timestamp(a), CursorValue::Timestamp(b)) => Ok(a.cmp(b)),
            (a, b) => Err(SqlFlowError::CursorType {
                column: column.to_string(),
                detail: format!("cannot compare {} with {}", a.type_name(), b.type_name()),
            }),
        }
    }

    /// Storage encoding: a type tag plus text.
    pub fn to_stored(&self) -> (&'static str, String) {
        match self {
            CursorValue::Int(v) => ("int", v.to_string()),
            CursorValue::Float(v) => ("float", v.to_string()),
            CursorValue::Str(v) => ("string", v.clone()),
            CursorValue::Timestamp(v) => ("timestamp", v.to_rfc3339()),
        }
    }

    pub fn from_stored(value_type: &str, text: &str) -> Result<CursorValue> {
        match value_type {
            "int" => text
                .parse()
                .map(CursorValue::Int)
                .map_err(|e| SqlFlowError::Configuration(format!("corrupt int watermark: {e}"))),
            "float" => text
                .parse()
                .map(CursorValue::Float)
                .map_err(|e| SqlFlowError::Configuration(format!("corrupt float watermark: {e}"))),
            "string" => Ok(CursorValue::Str(text.to_string())),
            "timestamp" => DateTime::parse_from_rfc3339(text)
                .map(|dt| CursorValue::Timestamp(dt.with_timezone(&Utc)))
                .map_err(|e| {
                    SqlFlowError::Configuration(format!("corrupt timestamp watermark: {e}"))
                }),
            other => Err(SqlFlowError::Configuration(format!(
                "unknown watermark value type '{other}'"
            ))),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Option<CursorValue> {
        match value {
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(CursorValue::Int(i))
                } else {
                    n.as_f64().map(CursorValue::Float)
                }
            }
            serde_json::Value::String(s) => Some(CursorValue::Str(s.clone())),
            _ => None,
        }
    }
}

impl std::fmt::Display for CursorValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CursorValue::Int(v) => write!(f, "{v}"),
            CursorValue::Float(v) => write!(f, "{v}"),
            CursorValue::Str(v) => write!(f, "{v}"),
            CursorValue::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

/// Extract the cursor value at one row of an Arrow column.
pub fn cursor_from_array(array: &ArrayRef, idx: usize) -> Result<Option<CursorValue>> {
    if array.is_null(idx) {
        return Ok(None);
    }
    let value = match array.data_type() {
        DataType::Int16 => {
            CursorValue::Int(array.as_any().downcast_ref::<Int16Array>().unwrap().value(idx) as i64)
        }
        DataType::Int32 => {
            CursorValue::Int(array.as_any().downcast_ref::<Int32Array>().unwrap().value(idx) as i64)
        }
        DataType::Int64 => {
            CursorValue::Int(array.as_any().downcast_ref::<Int64Array>().unwrap().value(idx))
        }
        DataType::UInt32 => CursorValue::Int(
            array.as_any().downcast_ref::<UInt32Array>().unwrap().value(idx) as i64,
        ),
        DataType::UInt64 => CursorValue::Int(
            array.as_any().downcast_ref::<UInt64Array>().unwrap().value(idx) as i64,
        ),
        DataType::Float32 => CursorValue::Float(
            array.as_any().downcast_ref::<Float32Array>().unwrap().value(idx) as f64,
        ),
        DataType::Float64 => CursorValue::Float(
            array.as_any().downcast_ref::<Float64Array>().unwrap().value(idx),
        ),
        DataType::Utf8 => CursorValue::Str(
            array.as_any().downcast_ref::<StringArray>().unwrap().value(idx).to_string(),
        ),
        DataType::LargeUtf8 => CursorValue::Str(
            array
                .as_any()
                .downcast_ref::<LargeStringArray>()
                .unwrap()
                .value(idx)
                .to_string(),
        ),
        DataType::Utf8View => CursorValue::Str(
            array
                .as_any()
                .downcast_ref::<StringViewArray>()
                .unwrap()
                .value(idx)
                .to_string(),
        ),
        DataType::Timestamp(unit, _) => {
            let micros = match unit {
                TimeUnit::Second => {
                    array
                        .as_any()
                        .downcast_ref::<TimestampSecondArray>()
                        .unwrap()
                        .value(idx)
                        * 1_000_000
                }
                TimeUnit::Millisecond => {
                    array
                        .as_any()
                        .downcast_ref::<TimestampMillisecondArray>()
                        .unwrap()
                        .value(idx)
                        * 1_000
                }
                TimeUnit::Microsecond => array
                    .as_any()
                    .downcast_ref::<TimestampMicrosecondArray>()
                    .unwrap()
                    .value(idx),
                TimeUnit::Nanosecond => {
                    array
                        .as_any()
                        .downcast_ref::<TimestampNanosecondArray>()
                        .unwrap()
                        .value(idx)
                        / 1_000
                }
            };
            let dt = DateTime::<Utc>::from_timestamp_micros(micros).ok_or_else(|| {
                SqlFlowError::CursorType {
                    column: String::new(),
                    detail: format!("timestamp {micros} out of range"),
                }
            })?;
            CursorValue::Timestamp(dt)
        }
        DataType::Date32 => {
            let days = array.as_any().downcast_ref::<Date32Array>().unwrap().value(idx);
            let dt = DateTime::<Utc>::from_timestamp(i64::from(days) * 86_400, 0).ok_or_else(
                || SqlFlowError::CursorType {
                    column: String::new(),
                    detail: format!("date {days} out of range"),
                },
            )?;
            CursorValue::Timestamp(dt)
        }
        other => {
            return Err(SqlFlowError::CursorType {
                column: String::new(),
                detail: format!("column type {other} is not a comparable cursor type"),
            })
        }
    };
    Ok(Some(value))
}

/// The maximum cursor value observed in a batch, `None` when the batch is
/// empty or the column is entirely null.
pub fn max_cursor(batch: &DataBatch, field: &str) -> Result<Option<CursorValue>> {
    let column = batch
        .column_by_name(field)
        .ok_or_else(|| SqlFlowError::CursorType {
            column: field.to_string(),
            detail: "cursor column not present in batch".to_string(),
        })?;
    let mut max: Option<CursorValue> = None;
    for idx in 0..column.len() {
        let Some(value) = cursor_from_array(column, idx)? else {
            continue;
        };
        max = match max {
            None => Some(value),
            Some(current) => {
                if value.compare(&current, field)? == Ordering::Greater {
                    Some(value)
                } else {
                    Some(current)
                }
            }
        };
    }
    Ok(max)
}

/// Keep only rows whose cursor column is strictly greater than `cursor`.
/// Null cursor cells never pass the predicate. `None` keeps every row
/// (first run reads the full history).
pub fn filter_after_cursor(
    batch: &DataBatch,
    field: &str,
    cursor: Option<&CursorValue>,
) -> Result<DataBatch> {
    let Some(cursor) = cursor else {
        return Ok(batch.clone());
    };
    let column = batch
        .column_by_name(field)
        .ok_or_else(|| SqlFlowError::CursorType {
            column: field.to_string(),
            detail: "cursor column not present in batch".to_string(),
        })?;
    let mut mask = datafusion::arrow::array::BooleanBuilder::with_capacity(column.len());
    for idx in 0..column.len() {
        let keep = match cursor_from_array(column, idx)? {
            Some(value) => value.compare(cursor, field)? == Ordering::Greater,
            None => false,
        };
        mask.append_value(keep);
    }
    let filtered =
        datafusion::arrow::compute::filter_record_batch(batch.record_batch(), &mask.finish())?;
    Ok(DataBatch::new(filtered))
}

/// Identifies one watermark: `(pipeline, source, target, cursor_column)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WatermarkKey {
    pub pipeline: String,
    pub source: String,
    pub target: String,
    pub cursor_column: String,
}

impl WatermarkKey {
    pub fn new(pipeline: &str, source: &str, target: &str, cursor_column: &str) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            cursor_column: cursor_column.to_string(),
        }
    }
}

impl std::fmt::Display for WatermarkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.pipeline, self.source, self.target, self.cursor_column
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WatermarkEntry {
    pub value: CursorValue,
    pub updated_at: DateTime<Utc>,
    pub run_id: String,
}

/// Atomic persistent cursor storage. The backend is exchangeable; the
/// atomicity and monotonicity contract is not.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get(&self, key: &WatermarkKey) -> Result<Option<CursorValue>>;

    /// Persist a new watermark. Rejects strictly-decreasing values with
    /// [`SqlFlowError::WatermarkRegression`]; rewriting the current value is
    /// a no-op. On failure the prior value is left intact.
    async fn set(&self, key: &WatermarkKey, value: &CursorValue, run_id: &str) -> Result<()>;

    /// Most recent entries first.
    async fn history(&self, key: &WatermarkKey, limit: u32) -> Result<Vec<WatermarkEntry>>;

    async fn clear(&self, key: &WatermarkKey) -> Result<()>;
}

/// Embedded transactional store on SQLite. State lives next to the
/// computation and survives process restarts.
pub struct SqliteWatermarkStore {
    pool: SqlitePool,
}

impl SqliteWatermarkStore {
    pub async fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store, used by tests and dry runs.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS watermarks (
                pipeline TEXT NOT NULL,
                source TEXT NOT NULL,
                target TEXT NOT NULL,
                cursor_column TEXT NOT NULL,
                value_type TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                run_id TEXT NOT NULL,
                PRIMARY KEY (pipeline, source, target, cursor_column)
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS watermark_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pipeline TEXT NOT NULL,
                source TEXT NOT NULL,
                target TEXT NOT NULL,
                cursor_column TEXT NOT NULL,
                value_type TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                run_id TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl WatermarkStore for SqliteWatermarkStore {
    async fn get(&self, key: &WatermarkKey) -> Result<Option<CursorValue>> {
        let row = sqlx::query(
            "SELECT value_type, value FROM watermarks
             WHERE pipeline = ? AND source = ? AND target = ? AND cursor_column = ?",
        )
        .bind(&key.pipeline)
        .bind(&key.source)
        .bind(&key.target)
        .bind(&key.cursor_column)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let value_type: String = row.get("value_type");
                let value: String = row.get("value");
                Ok(Some(CursorValue::from_stored(&value_type, &value)?))
            }
        }
    }

    async fn set(&self, key: &WatermarkKey, value: &CursorValue, run_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT value_type, value FROM watermarks
             WHERE pipeline = ? AND source = ? AND target = ? AND cursor_column = ?",
        )
        .bind(&key.pipeline)
        .bind(&key.source)
        .bind(&key.target)
        .bind(&key.cursor_column)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            let value_type: String = row.get("value_type");
            let stored_text: String = row.get("value");
            let stored = CursorValue::from_stored(&value_type, &stored_text)?;
            match value.compare(&stored, &key.cursor_column)? {
                Ordering::Less => {
                    return Err(SqlFlowError::WatermarkRegression {
                        key: key.to_string(),
                        stored: stored.to_string(),
                        attempted: value.to_string(),
                    });
                }
                Ordering::Equal => {
                    // Idempotent rewrite of the same value.
                    return Ok(());
                }
                Ordering::Greater => {}
            }
        }

        let (value_type, text) = value.to_stored();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO watermarks
                 (pipeline, source, target, cursor_column, value_type, value, updated_at, run_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (pipeline, source, target, cursor_column)
             DO UPDATE SET value_type = excluded.value_type,
                           value = excluded.value,
                           updated_at = excluded.updated_at,
                           run_id = excluded.run_id",
        )
        .bind(&key.pipeline)
        .bind(&key.source)
        .bind(&key.target)
        .bind(&key.cursor_column)
        .bind(value_type)
        .bind(&text)
        .bind(&now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO watermark_history
                 (pipeline, source, target, cursor_column, value_type, value, updated_at, run_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&key.pipeline)
        .bind(&key.source)
        .bind(&key.target)
        .bind(&key.cursor_column)
        .bind(value_type)
        .bind(&text)
        .bind(&now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn history(&self, key: &WatermarkKey, limit: u32) -> Result<Vec<WatermarkEntry>> {
        let rows = sqlx::query(
            "SELECT value_type, value, updated_at, run_id FROM watermark_history
             WHERE pipeline = ? AND source = ? AND target = ? AND cursor_column = ?
             ORDER BY id DESC LIMIT ?",
        )
        .bind(&key.pipeline)
        .bind(&key.source)
        .bind(&key.target)
        .bind(&key.cursor_column)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let value_type: String = row.get("value_type");
                let value: String = row.get("value");
                let updated_at: String = row.get("updated_at");
                let updated_at = DateTime::parse_from_rfc3339(&updated_at)
                    .map_err(|e| {
                        SqlFlowError::Configuration(format!("corrupt watermark timestamp: {e}"))
                    })?
                    .with_timezone(&Utc);
                Ok(WatermarkEntry {
                    value: CursorValue::from_stored(&value_type, &value)?,
                    updated_at,
                    run_id: row.get("run_id"),
                })
            })
            .collect()
    }

    async fn clear(&self, key: &WatermarkKey) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["watermarks", "watermark_history"] {
            sqlx::query(&format!(
                "DELETE FROM {table}
                 WHERE pipeline = ? AND source = ? AND target = ? AND cursor_column = ?"
            ))
            .bind(&key.pipeline)
            .bind(&key.source)
            .bind(&key.target)
            .bind(&key.cursor_column)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> WatermarkKey {
        WatermarkKey::new("etl", "events", "events_raw", "event_ts")
    }

    #[tokio::test]
    async fn test_get_unset_returns_none() {
        let store = SqliteWatermarkStore::in_memory().await.unwrap();
        assert_eq!(store.get(&key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let store = SqliteWatermarkStore::in_memory().await.unwrap();
        let value = CursorValue::Str("2024-01-03".into());
        store.set(&key(), &value, "run-1").await.unwrap();
        assert_eq!(store.get(&key()).await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn test_regression_rejected_equal_accepted() {
        let store = SqliteWatermarkStore::in_memory().await.unwrap();
        store
            .set(&key(), &CursorValue::Int(10), "run-1")
            .await
            .unwrap();
        // Idempotent rewrite.
        store
            .set(&key(), &CursorValue::Int(10), "run-2")
            .await
            .unwrap();
        let err = store
            .set(&key(), &CursorValue::Int(9), "run-3")
            .await
            .unwrap_err();
        assert!(matches!(err, SqlFlowError::WatermarkRegression { .. }));
        assert_eq!(store.get(&key()).await.unwrap(), Some(CursorValue::Int(10)));
    }

    #[tokio::test]
    async fn test_cross_type_set_is_cursor_type_error() {
        let store = SqliteWatermarkStore::in_memory().await.unwrap();
        store
            .set(&key(), &CursorValue::Int(10), "run-1")
            .await
            .unwrap();
        let err = store
            .set(&key(), &CursorValue::Str("11".into()), "run-2")
            .await
            .unwrap_err();
        assert!(matches!(err, SqlFlowError::CursorType { .. }));
    }

    #[tokio::test]
    async fn test_history_most_recent_first() {
        let store = SqliteWatermarkStore::in_memory().await.unwrap();
        for (i, run) in ["run-1", "run-2", "run-3"].iter().enumerate() {
            store
                .set(&key(), &CursorValue::Int(i as i64), run)
                .await
                .unwrap();
        }
        let history = store.history(&key(), 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].run_id, "run-3");
        assert_eq!(history[0].value, CursorValue::Int(2));
    }

    #[tokio::test]
    async fn test_clear_resets_key() {
        let store = SqliteWatermarkStore::in_memory().await.unwrap();
        store
            .set(&key(), &CursorValue::Int(5), "run-1")
            .await
            .unwrap();
        store.clear(&key()).await.unwrap();
        assert_eq!(store.get(&key()).await.unwrap(), None);
        // After a reset, lower values are acceptable again.
        store
            .set(&key(), &CursorValue::Int(1), "run-2")
            .await
            .unwrap();
    }

    #[test]
    fn test_max_cursor_over_batch() {
        let batch = DataBatch::from_json_rows(&[
            serde_json::json!({"event_ts": "2024-01-02", "v": 1}),
            serde_json::json!({"event_ts": "2024-01-03", "v": 2}),
            serde_json::json!({"event_ts": "2024-01-01", "v": 3}),
        ])
        .unwrap();
        let max = max_cursor(&batch, "event_ts").unwrap();
        assert_eq!(max, Some(CursorValue::Str("2024-01-03".into())));
    }

    #[test]
    fn test_stored_round_trip() {
        for value in [
            CursorValue::Int(42),
            CursorValue::Float(4.5),
            CursorValue::Str("2024-06-01".into()),
            CursorValue::Timestamp(Utc::now()),
        ] {
            let (t, text) = value.to_stored();
            let back = CursorValue::from_stored(t, &text).unwrap();
            match (&value, &back) {
                (CursorValue::Timestamp(a), CursorValue::Timestamp(b)) => {
                    assert_eq!(a.timestamp_micros(), b.timestamp_micros())
                }
                _ => assert_eq!(value, back),
            }
        }
    }
}
