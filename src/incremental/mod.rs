//! Source execution with watermark-driven incremental reads.
//!
//! A source-definition step opens its connector, reads full-refresh or
//! incrementally past the stored watermark, and registers every batch with
//! the SQL engine under the source name. The new watermark is NOT written
//! here: the runner returns a [`PendingWatermark`] that the executor commits
//! together with the paired load step, so a failure anywhere before that
//! point leaves the stored cursor untouched and the next run reprocesses.

use std::cmp::Ordering;
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::batch::DataBatch;
use crate::connectors::params::SyncMode;
use crate::connectors::ConnectorRegistry;
use crate::engine::SqlEngine;
use crate::errors::{Result, SqlFlowError};
use crate::planner::SourceStep;
use crate::resilience::{Resilience, ResilienceConfig};
use crate::watermark::{CursorValue, WatermarkKey, WatermarkStore};

/// Watermark value observed during a source read, to be committed once the
/// paired load completes.
#[derive(Debug, Clone)]
pub struct PendingWatermark {
    pub key: WatermarkKey,
    pub value: CursorValue,
}

#[derive(Debug, Default)]
pub struct SourceRunResult {
    pub rows_read: u64,
    pub batches: u64,
    pub pending: Option<PendingWatermark>,
}

pub struct SourceRunner<'a> {
    pub registry: &'a ConnectorRegistry,
    pub watermarks: &'a dyn WatermarkStore,
    pub engine: &'a SqlEngine,
    pub pipeline: &'a str,
    pub resilience: ResilienceConfig,
    pub cancel: CancellationToken,
}

impl<'a> SourceRunner<'a> {
    /// Execute one source-definition step. `target_table` is the paired
    /// load's target (the watermark key includes it); a source without a
    /// load keys the watermark on its own name.
    pub async fn run(&self, step: &SourceStep, target_table: &str) -> Result<SourceRunResult> {
        let mut connector = self.registry.create_source(&step.connector_type)?;
        connector.configure(&step.params)?;
        let connector: Arc<dyn crate::connectors::SourceConnector> = Arc::from(connector);

        let endpoint = format!("{}:{}", step.connector_type, step.name);
        let wrapper = Resilience::new(&endpoint, self.resilience.clone(), self.cancel.clone());

        let (mut stream, cursor_field, since) = match step.sync_mode {
            SyncMode::FullRefresh => {
                let connector = Arc::clone(&connector);
                let name = step.name.clone();
                let stream = wrapper
                    .call(|| {
                        let connector = Arc::clone(&connector);
                        let name = name.clone();
                        async move { connector.read(&name, None, None).await }
                    })
                    .await?;
                (stream, None, None)
            }
            SyncMode::Incremental => {
                let cursor_field = step
                    .cursor_field
                    .clone()
                    .ok_or_else(|| SqlFlowError::MissingCursorField(step.name.clone()))?;
                if !connector.supports_incremental() {
                    return Err(SqlFlowError::IncrementalNotSupported(step.name.clone()));
                }
                let key =
                    WatermarkKey::new(self.pipeline, &step.name, target_table, &cursor_field);
                let since = self.watermarks.get(&key).await?;
                debug!(key = %key, watermark = ?since, "incremental read starting");

                let connector = Arc::clone(&connector);
                let name = step.name.clone();
                let field = cursor_field.clone();
                let watermark = since.clone();
                let stream = wrapper
                    .call(move || {
                        let connector = Arc::clone(&connector);
                        let name = name.clone();
                        let field = field.clone();
                        let watermark = watermark.clone();
                        async move {
                            connector
                                .read_incremental(&name, &field, watermark.as_ref(), None)
                                .await
                        }
                    })
                    .await?;
                (stream, Some((key, cursor_field)), since)
            }
        };

        let mut result = SourceRunResult::default();
        let mut max_cursor: Option<CursorValue> = since;
        while let Some(batch) = next_batch(&mut stream, &self.cancel).await? {
            if let Some((_, field)) = &cursor_field {
                if let Some(observed) = connector.get_cursor_value(&batch, field)? {
                    max_cursor = match max_cursor {
                        None => Some(observed),
                        Some(current) => {
                            if observed.compare(&current, field)? == Ordering::Greater {
                                Some(observed)
                            } else {
                                Some(current)
                            }
                        }
                    };
                }
            }
            result.rows_read += batch.row_count() as u64;
            result.batches += 1;
            self.engine.register_batch(&step.name, batch)?;
        }

        // A source that produced nothing still registers an empty table so
        // the paired load succeeds with zero rows.
        if result.batches == 0 {
            let specs = connector.get_schema(&step.name).await?;
            let schema = crate::batch::schema_from_specs(&specs);
            self.engine
                .register_batch(&step.name, DataBatch::empty(schema))?;
        }

        if let Some((key, _)) = cursor_field {
            // Only a strictly advanced cursor is worth committing; an
            // unchanged value is already stored.
            let advanced = match (&max_cursor, self.watermarks.get(&key).await?) {
                (Some(observed), Some(stored)) => {
                    observed.compare(&stored, &key.cursor_column)? == Ordering::Greater
                }
                (Some(_), None) => true,
                (None, _) => false,
            };
            if advanced {
                result.pending = Some(PendingWatermark {
                    key,
                    value: max_cursor.expect("advanced implies a cursor value"),
                });
            }
        }

        info!(
            source = %step.name,
            rows = result.rows_read,
            batches = result.batches,
            "source read complete"
        );
        Ok(result)
    }
}

async fn next_batch(
    stream: &mut crate::connectors::BatchStream,
    cancel: &CancellationToken,
) -> Result<Option<DataBatch>> {
    tokio::select! {
        _ = cancel.cancelled() => Err(SqlFlowError::Cancelled),
        item = stream.next() => item.transpose(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::memory;
    use crate::planner::SourceStep;
    use crate::watermark::SqliteWatermarkStore;
    use serde_json::json;

    fn step(name: &str, sync_mode: SyncMode, cursor_field: Option<&str>) -> SourceStep {
        SourceStep {
            name: name.to_string(),
            connector_type: "IN_MEMORY".to_string(),
            params: json!({}),
            sync_mode,
            cursor_field: cursor_field.map(str::to_string),
            primary_key: vec![],
        }
    }

    #[tokio::test]
    async fn test_full_refresh_registers_table() {
        let registry = ConnectorRegistry::with_builtins();
        let store = SqliteWatermarkStore::in_memory().await.unwrap();
        let engine = SqlEngine::new();
        memory::seed_table(
            "fr_orders",
            vec![DataBatch::from_json_rows(&[json!({"id": 1}), json!({"id": 2})]).unwrap()],
        );

        let runner = SourceRunner {
            registry: &registry,
            watermarks: &store,
            engine: &engine,
            pipeline: "p",
            resilience: ResilienceConfig::default(),
            cancel: CancellationToken::new(),
        };
        let result = runner
            .run(&step("fr_orders", SyncMode::FullRefresh, None), "orders_raw")
            .await
            .unwrap();
        assert_eq!(result.rows_read, 2);
        assert!(result.pending.is_none());
        assert!(engine.table_exists("fr_orders"));
    }

    #[tokio::test]
    async fn test_incremental_filters_and_reports_pending() {
        let registry = ConnectorRegistry::with_builtins();
        let store = SqliteWatermarkStore::in_memory().await.unwrap();
        let engine = SqlEngine::new();
        memory::seed_table(
            "inc_events",
            vec![DataBatch::from_json_rows(&[
                json!({"event_ts": "2024-01-01", "v": 1}),
                json!({"event_ts": "2024-01-02", "v": 2}),
                json!({"event_ts": "2024-01-03", "v": 3}),
            ])
            .unwrap()],
        );
        let key = WatermarkKey::new("p", "inc_events", "events_raw", "event_ts");
        store
            .set(&key, &CursorValue::Str("2024-01-02".into()), "run-0")
            .await
            .unwrap();

        let runner = SourceRunner {
            registry: &registry,
            watermarks: &store,
            engine: &engine,
            pipeline: "p",
            resilience: ResilienceConfig::default(),
            cancel: CancellationToken::new(),
        };
        let result = runner
            .run(
                &step("inc_events", SyncMode::Incremental, Some("event_ts")),
                "events_raw",
            )
            .await
            .unwrap();
        assert_eq!(result.rows_read, 1);
        let pending = result.pending.unwrap();
        assert_eq!(pending.value, CursorValue::Str("2024-01-03".into()));
        assert_eq!(pending.key, key);
    }

    #[tokio::test]
    async fn test_empty_incremental_read_leaves_no_pending() {
        let registry = ConnectorRegistry::with_builtins();
        let store = SqliteWatermarkStore::in_memory().await.unwrap();
        let engine = SqlEngine::new();
        memory::seed_table(
            "inc_empty",
            vec![DataBatch::from_json_rows(&[json!({"event_ts": "2024-01-01"})]).unwrap()],
        );
        let key = WatermarkKey::new("p", "inc_empty", "t", "event_ts");
        store
            .set(&key, &CursorValue::Str("2024-01-01".into()), "run-0")
            .await
            .unwrap();

        let runner = SourceRunner {
            registry: &registry,
            watermarks: &store,
            engine: &engine,
            pipeline: "p",
            resilience: ResilienceConfig::default(),
            cancel: CancellationToken::new(),
        };
        let result = runner
            .run(&step("inc_empty", SyncMode::Incremental, Some("event_ts")), "t")
            .await
            .unwrap();
        assert_eq!(result.rows_read, 0);
        assert!(result.pending.is_none());
        // The empty table is still queryable downstream.
        assert!(engine.table_exists("inc_empty"));
    }
}
