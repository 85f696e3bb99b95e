//! In-memory source and destination.
//!
//! Backed by a process-wide table map so a pipeline can write through the
//! destination and a later source (or a test assertion) can read the same
//! rows back. The map is the only state; batches themselves stay immutable.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;

use crate::batch::{ColumnSpec, DataBatch};
use crate::connectors::params::{ParamKind, ParamMap, ParamSchema, ParamSpec};
use crate::connectors::{
    BatchStream, ConnectionTest, DestinationConnector, SourceConnector, WriteResult,
};
use crate::errors::{Result, SqlFlowError};
use crate::parser::ast::LoadMode;
use crate::watermark::{filter_after_cursor, CursorValue};

pub type TableMap = Arc<RwLock<HashMap<String, Vec<DataBatch>>>>;

/// The process-wide table map shared by every IN_MEMORY connector.
pub fn global_store() -> TableMap {
    static STORE: OnceLock<TableMap> = OnceLock::new();
    STORE
        .get_or_init(|| Arc::new(RwLock::new(HashMap::new())))
        .clone()
}

/// Drop every stored table. Test helper.
pub fn clear_global_store() {
    global_store().write().expect("table map lock").clear();
}

/// Seed a table directly, bypassing the destination contract. Test helper.
pub fn seed_table(name: &str, batches: Vec<DataBatch>) {
    global_store()
        .write()
        .expect("table map lock")
        .insert(name.to_string(), batches);
}

/// Read a table back out of the store. Test helper.
pub fn read_table(name: &str) -> Option<Vec<DataBatch>> {
    global_store()
        .read()
        .expect("table map lock")
        .get(name)
        .cloned()
}

fn source_schema() -> ParamSchema {
    ParamSchema::for_source(
        "IN_MEMORY",
        vec![ParamSpec::optional("table", ParamKind::Str)],
    )
}

fn destination_schema() -> ParamSchema {
    ParamSchema::new(
        "IN_MEMORY",
        vec![ParamSpec::optional("table", ParamKind::Str)],
    )
}

pub struct MemorySource {
    store: TableMap,
    table: Option<String>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            store: global_store(),
            table: None,
        }
    }

    pub fn with_store(store: TableMap) -> Self {
        Self { store, table: None }
    }

    fn object_name<'a>(&'a self, object: &'a str) -> &'a str {
        self.table.as_deref().unwrap_or(object)
    }

    fn batches_for(&self, object: &str) -> Result<Vec<DataBatch>> {
        let name = self.object_name(object);
        self.store
            .read()
            .expect("table map lock")
            .get(name)
            .cloned()
            .ok_or_else(|| {
                SqlFlowError::Configuration(format!("in-memory table '{name}' does not exist"))
            })
    }
}

#[async_trait]
impl SourceConnector for MemorySource {
    fn connector_type(&self) -> &'static str {
        "IN_MEMORY"
    }

    fn configure(&mut self, params: &Value) -> Result<()> {
        let validated = source_schema().validate(params)?;
        self.table = validated.str_param("table").map(str::to_string);
        Ok(())
    }

    async fn test_connection(&self) -> Result<ConnectionTest> {
        let started = Instant::now();
        Ok(ConnectionTest {
            ok: true,
            message: "in-memory store".to_string(),
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn discover(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .store
            .read()
            .expect("table map lock")
            .keys()
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn get_schema(&self, object: &str) -> Result<Vec<ColumnSpec>> {
        let batches = self.batches_for(object)?;
        match batches.first() {
            Some(batch) => batch.column_specs(),
            None => Ok(Vec::new()),
        }
    }

    async fn read(
        &self,
        object: &str,
        _columns: Option<&[String]>,
        _filters: Option<&Value>,
    ) -> Result<BatchStream> {
        let batches = self.batches_for(object)?;
        Ok(Box::pin(tokio_stream::iter(batches.into_iter().map(Ok))))
    }

    fn supports_incremental(&self) -> bool {
        true
    }

    async fn read_incremental(
        &self,
        object: &str,
        cursor_field: &str,
        cursor: Option<&CursorValue>,
        _columns: Option<&[String]>,
    ) -> Result<BatchStream> {
        let batches = self
            .batches_for(object)?
            .iter()
            .map(|batch| filter_after_cursor(batch, cursor_field, cursor))
            .collect::<Result<Vec<_>>>()?;
        Ok(Box::pin(tokio_stream::iter(batches.into_iter().map(Ok))))
    }
}

pub struct MemoryDestination {
    store: TableMap,
    table: Option<String>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self {
            store: global_store(),
            table: None,
        }
    }

    pub fn with_store(store: TableMap) -> Self {
        Self { store, table: None }
    }
}

#[async_trait]
impl DestinationConnector for MemoryDestination {
    fn connector_type(&self) -> &'static str {
        "IN_MEMORY"
    }

    fn configure(&mut self, params: &Value) -> Result<()> {
        let validated = destination_schema().validate(params)?;
        self.table = validated.str_param("table").map(str::to_string);
        Ok(())
    }

    async fn test_connection(&self) -> Result<ConnectionTest> {
        Ok(ConnectionTest {
            ok: true,
            message: "in-memory store".to_string(),
            latency_ms: 0,
        })
    }

    async fn write(
        &self,
        object: &str,
        batch: &DataBatch,
        mode: LoadMode,
    ) -> Result<WriteResult> {
        let name = self.table.as_deref().unwrap_or(object).to_string();
        let mut store = self.store.write().expect("table map lock");
        match mode {
            LoadMode::Replace => {
                store.insert(name, vec![batch.clone()]);
            }
            LoadMode::Append => {
                store.entry(name).or_default().push(batch.clone());
            }
            LoadMode::Merge => {
                return Err(SqlFlowError::Configuration(
                    "IN_MEMORY destination supports REPLACE and APPEND only".to_string(),
                ))
            }
        }
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

    fn fresh_store() -> TableMap {
        Arc::new(RwLock::new(HashMap::new()))
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let store = fresh_store();
        let dest = MemoryDestination::with_store(store.clone());
        let batch = DataBatch::from_json_rows(&[json!({"id": 1})]).unwrap();
        dest.write("t", &batch, LoadMode::Replace).await.unwrap();

        let source = MemorySource::with_store(store);
        let mut stream = source.read("t", None, None).await.unwrap();
        let read = stream.next().await.unwrap().unwrap();
        assert_eq!(read.row_count(), 1);
    }

    #[tokio::test]
    async fn test_append_accumulates_batches() {
        let store = fresh_store();
        let dest = MemoryDestination::with_store(store.clone());
        let batch = DataBatch::from_json_rows(&[json!({"id": 1})]).unwrap();
        dest.write("t", &batch, LoadMode::Append).await.unwrap();
        dest.write("t", &batch, LoadMode::Append).await.unwrap();
        assert_eq!(store.read().unwrap().get("t").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_merge_mode_rejected() {
        let dest = MemoryDestination::with_store(fresh_store());
        let batch = DataBatch::from_json_rows(&[json!({"id": 1})]).unwrap();
        let err = dest.write("t", &batch, LoadMode::Merge).await.unwrap_err();
        assert!(err.to_string().contains("REPLACE and APPEND only"));
    }

    #[tokio::test]
    async fn test_missing_table_is_reported() {
        let source = MemorySource::with_store(fresh_store());
        let err = match source.read("ghost", None, None).await {
            Err(e) => e,
            Ok(_) => panic!("called unwrap_err() on an Ok value"),
        };
        assert!(err.to_string().contains("ghost"));
    }
}
