//! # SQLFlow
//!
//! SQL-native data pipeline engine powered by Apache DataFusion & Rust.
//!
//! ## Overview
//!
//! SQLFlow pipelines are written in an extended SQL dialect:
//!
//! ```sql
//! SOURCE orders TYPE CSV PARAMS {"path": "data/orders.csv", "has_header": true};
//! LOAD orders_raw FROM orders;
//! CREATE TABLE totals AS
//!     SELECT customer_id, SUM(amount) AS total FROM orders_raw GROUP BY customer_id;
//! EXPORT SELECT * FROM totals TO 'out/totals.csv' TYPE CSV OPTIONS {"header": true};
//! ```
//!
//! The engine compiles a pipeline into a dependency DAG, resolves variables
//! and conditionals at plan time, reads through pluggable source connectors,
//! transforms with an embedded columnar SQL engine (DataFusion) and
//! registered UDFs, and writes through destination connectors — with atomic,
//! watermark-based incremental loading in between.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sqlflow::connectors::ConnectorRegistry;
//! use sqlflow::engine::SqlEngine;
//! use sqlflow::executor::{ExecutionContext, PipelineExecutor};
//! use sqlflow::udf::UdfManager;
//! use sqlflow::vars::VariableManager;
//! use sqlflow::watermark::SqliteWatermarkStore;
//!
//! #[tokio::main]
//! async fn main() -> sqlflow::Result<()> {
//!     sqlflow::log::init_tracing();
//!
//!     let mut vars = VariableManager::with_environment();
//!     let pipeline = sqlflow::parser::parse_file("pipelines/daily.sf")?;
//!     let plan = sqlflow::planner::Planner::new(&mut vars).plan(&pipeline)?;
//!
//!     let ctx = ExecutionContext {
//!         registry: Arc::new(ConnectorRegistry::with_builtins()),
//!         variables: vars,
//!         watermarks: Arc::new(SqliteWatermarkStore::open(".sqlflow/watermarks.db").await?),
//!         engine: Arc::new(SqlEngine::new()),
//!         udfs: Arc::new(UdfManager::with_builtins()),
//!     };
//!     let report = PipelineExecutor::new(ctx).run(&plan).await?;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Pipeline DSL**: `SOURCE`, `LOAD`, `CREATE TABLE AS`, `EXPORT`, `SET`,
//!   `IF/ELSEIF/ELSE/ENDIF`, `INCLUDE`, with `${var|default}` substitution
//! - **Plan-time conditionals**: branches resolve before execution, so the
//!   emitted plan is exactly what runs
//! - **Connector framework**: typed registry, industry-standard parameter
//!   aliases, retry with backoff, circuit breaker, rate limiting
//! - **Incremental loading**: persistent watermarks with a strict
//!   greater-than cursor predicate and commit-on-load atomicity
//! - **SQL Transformations**: DataFusion with scalar and table UDFs
//! - **Structured failures**: every failed run yields a step-level error
//!   envelope and a JSON run report
//!
//! ## Architecture
//!
//! ```text
//! .sf text → parser → planner → DAG → executor
//!                                  ├─ sources → resilience → engine tables
//!                                  ├─ loads (REPLACE/APPEND/MERGE) + watermark commit
//!                                  ├─ transforms (DataFusion + UDFs)
//!                                  └─ exports → resilience → destinations
//! ```

// Public API exports
pub use errors::{Result, SqlFlowError};

// Public modules
pub mod batch;
pub mod condition;
pub mod config;
pub mod connectors;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod incremental;
pub mod load;
pub mod log;
pub mod parser;
pub mod planner;
pub mod resilience;
pub mod udf;
pub mod vars;
pub mod watermark;

use parser::ast::Pipeline;
use planner::{ExecutionPlan, Planner};
use vars::VariableManager;

/// Compile pipeline text straight to an execution plan. Convenience for the
/// compile-only path; `SET` statements land in `vars`.
pub fn compile(src: &str, name: &str, vars: &mut VariableManager) -> Result<ExecutionPlan> {
    let pipeline: Pipeline = parser::parse(src, name)?;
    Planner::new(vars).plan(&pipeline)
}
