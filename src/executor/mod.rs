//! Pipeline execution.
//!
//! Walks an [`ExecutionPlan`] in topological order, dispatching each step to
//! the right subsystem through an explicit [`ExecutionContext`] (no
//! globals). The first failed step halts the run: remaining steps are
//! marked skipped, the failure is wrapped in a `{step_id, step_type, phase}`
//! envelope, and a structured [`RunReport`] is produced either way. A load
//! step's watermark commit happens with the load's completion; anything
//! failing before that leaves the stored cursor untouched.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nanoid::nanoid;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

use crate::connectors::{ConnectorRegistry, DestinationConnector};
use crate::engine::SqlEngine;
use crate::errors::{Phase, Result, SqlFlowError};
use crate::incremental::{PendingWatermark, SourceRunner};
use crate::load::LoadRunner;
use crate::log;
use crate::parser::ast::LoadMode;
use crate::planner::{ExecutionPlan, ExecutionStep, StepPayload};
use crate::resilience::{Resilience, ResilienceConfig};
use crate::udf::UdfManager;
use crate::vars::VariableManager;
use crate::watermark::WatermarkStore;

/// The services a run needs, assembled once at the entry point.
pub struct ExecutionContext {
    pub registry: Arc<ConnectorRegistry>,
    pub variables: VariableManager,
    pub watermarks: Arc<dyn WatermarkStore>,
    pub engine: Arc<SqlEngine>,
    pub udfs: Arc<UdfManager>,
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub resilience: ResilienceConfig,
    /// Where run reports (and failure envelopes) are written.
    pub artifact_dir: Option<PathBuf>,
    /// Project UDF directory to reconcile at startup.
    pub udf_dir: Option<PathBuf>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            resilience: ResilienceConfig::default(),
            artifact_dir: None,
            udf_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub id: String,
    pub step_type: String,
    pub status: StepStatus,
    pub rows: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub step_id: String,
    pub step_type: String,
    pub phase: Phase,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub pipeline: String,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepReport>,
    pub error: Option<ErrorEnvelope>,
}

impl RunReport {
    /// The one-line outcome a human reads first.
    pub fn summary(&self) -> String {
        match &self.error {
            None => format!(
                "run {} of '{}' succeeded ({} steps)",
                self.run_id,
                self.pipeline,
                self.steps.len()
            ),
            Some(envelope) => format!(
                "run {} of '{}' failed at step '{}' during {}: {}",
                self.run_id, self.pipeline, envelope.step_id, envelope.phase, envelope.message
            ),
        }
    }
}

pub struct PipelineExecutor {
    ctx: ExecutionContext,
    options: ExecutorOptions,
    cancel: CancellationToken,
}

impl PipelineExecutor {
    pub fn new(ctx: ExecutionContext) -> Self {
        Self {
            ctx,
            options: ExecutorOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    /// Token callers can use to cancel the run from another task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self, plan: &ExecutionPlan) -> Result<RunReport> {
        let run_id = nanoid!(10);
        let span = log::run_span(&plan.pipeline, &run_id);
        self.run_inner(plan, run_id).instrument(span).await
    }

    async fn run_inner(&self, plan: &ExecutionPlan, run_id: String) -> Result<RunReport> {
        let started_at = Utc::now();
        info!(steps = plan.steps.len(), "pipeline run starting");

        // UDFs register with the engine once per run.
        for (descriptor, f) in self.ctx.udfs.scalars() {
            self.ctx.engine.register_scalar_udf(descriptor, f)?;
        }
        if let Some(dir) = &self.options.udf_dir {
            self.ctx.udfs.discover(dir)?;
        }

        // Pair each source with its consuming load so the watermark key
        // carries the load target and commits ride on load completion.
        let mut load_for_source: HashMap<String, (String, String)> = HashMap::new();
        for step in &plan.steps {
            if let StepPayload::Load(load) = &step.payload {
                load_for_source
                    .entry(load.source_name.clone())
                    .or_insert_with(|| (step.id.clone(), load.target_table.clone()));
            }
        }

        let mut pending: HashMap<String, PendingWatermark> = HashMap::new();
        let mut reports: Vec<StepReport> = Vec::with_capacity(plan.steps.len());
        let mut failure: Option<ErrorEnvelope> = None;

        for step in &plan.steps {
            if failure.is_some() {
                reports.push(skipped(step));
                continue;
            }
            if self.cancel.is_cancelled() {
                failure = Some(envelope_for(step, &SqlFlowError::Cancelled));
                reports.push(skipped(step));
                continue;
            }
            let step_type = step.step_type.to_string();
            match self
                .execute_step(plan, step, &run_id, &load_for_source, &mut pending)
                .instrument(log::step_span(&step.id, &step_type))
                .await
            {
                Ok(rows) => reports.push(StepReport {
                    id: step.id.clone(),
                    step_type,
                    status: StepStatus::Succeeded,
                    rows,
                    error: None,
                }),
                Err(e) => {
                    let envelope = envelope_for(step, &e);
                    error!(
                        step = %step.id,
                        phase = %envelope.phase,
                        error = %e,
                        "step failed; halting run"
                    );
                    reports.push(StepReport {
                        id: step.id.clone(),
                        step_type,
                        status: StepStatus::Failed,
                        rows: 0,
                        error: Some(e.to_string()),
                    });
                    failure = Some(envelope);
                }
            }
        }

        let report = RunReport {
            run_id,
            pipeline: plan.pipeline.clone(),
            success: failure.is_none(),
            started_at,
            finished_at: Utc::now(),
            steps: reports,
            error: failure,
        };

        if let Some(dir) = &self.options.artifact_dir {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(format!("{}_{}.json", report.pipeline, report.run_id));
            std::fs::write(&path, serde_json::to_string_pretty(&report)?)?;
        }
        if report.success {
            info!("{}", report.summary());
        } else {
            error!("{}", report.summary());
        }
        Ok(report)
    }

    async fn execute_step(
        &self,
        plan: &ExecutionPlan,
        step: &ExecutionStep,
        run_id: &str,
        load_for_source: &HashMap<String, (String, String)>,
        pending: &mut HashMap<String, PendingWatermark>,
    ) -> Result<u64> {
        let step_type = step.step_type.to_string();
        match &step.payload {
            StepPayload::Source(source) => {
                let (load_id, target) = load_for_source
                    .get(&source.name)
                    .cloned()
                    .unwrap_or_else(|| (step.id.clone(), source.name.clone()));
                let runner = SourceRunner {
                    registry: self.ctx.registry.as_ref(),
                    watermarks: self.ctx.watermarks.as_ref(),
                    engine: self.ctx.engine.as_ref(),
                    pipeline: &plan.pipeline,
                    resilience: self.options.resilience.clone(),
                    cancel: self.cancel.clone(),
                };
                let result = runner
                    .run(source, &target)
                    .await
                    .map_err(|e| wrap(e, &step.id, &step_type, Phase::Read))?;
                if let Some(p) = result.pending {
                    pending.insert(load_id, p);
                }
                Ok(result.rows_read)
            }
            StepPayload::Load(load) => {
                let runner = LoadRunner {
                    engine: self.ctx.engine.as_ref(),
                };
                let rows = runner
                    .run(load)
                    .await
                    .map_err(|e| wrap(e, &step.id, &step_type, Phase::Write))?;
                // The watermark advances in the same unit of work that marks
                // the load complete.
                if let Some(p) = pending.remove(&step.id) {
                    self.ctx
                        .watermarks
                        .set(&p.key, &p.value, run_id)
                        .await
                        .map_err(|e| wrap(e, &step.id, &step_type, Phase::Commit))?;
                    info!(key = %p.key, value = %p.value, "watermark committed");
                }
                Ok(rows)
            }
            StepPayload::Transform(transform) => {
                for name in self.ctx.udfs.extract_references(&transform.sql) {
                    if !self.ctx.udfs.contains(&name) {
                        return Err(wrap(
                            SqlFlowError::UdfRegistration {
                                udf_name: name,
                                reason: "referenced in SQL but not registered".to_string(),
                            },
                            &step.id,
                            &step_type,
                            Phase::Execute,
                        ));
                    }
                }
                if let Some((name, input, options)) =
                    self.ctx.udfs.parse_table_udf_call(&transform.sql)
                {
                    let batch = self
                        .ctx
                        .engine
                        .table_batch(&input)
                        .map_err(|e| wrap(e, &step.id, &step_type, Phase::Read))?;
                    let result = self
                        .ctx
                        .udfs
                        .apply_table_udf(&name, &batch, &options)
                        .map_err(|e| wrap(e, &step.id, &step_type, Phase::Execute))?;
                    let rows = result.row_count() as u64;
                    self.ctx
                        .engine
                        .replace_table(&transform.table, result)
                        .map_err(|e| wrap(e, &step.id, &step_type, Phase::Write))?;
                    Ok(rows)
                } else {
                    self.ctx
                        .engine
                        .materialize(&transform.table, &transform.sql)
                        .await
                        .map_err(|e| wrap(e, &step.id, &step_type, Phase::Execute))
                }
            }
            StepPayload::Export(export) => {
                let batch = self
                    .ctx
                    .engine
                    .execute(&export.sql)
                    .await
                    .map_err(|e| wrap(e, &step.id, &step_type, Phase::Execute))?;

                // OPTIONS may carry a write mode; the rest configures the
                // destination connector.
                let mut options = export.options.clone();
                let mode = match options
                    .as_object_mut()
                    .and_then(|map| map.remove("mode"))
                    .as_ref()
                    .and_then(serde_json::Value::as_str)
                {
                    None => LoadMode::Replace,
                    Some("replace") | Some("REPLACE") => LoadMode::Replace,
                    Some("append") | Some("APPEND") => LoadMode::Append,
                    Some(other) => {
                        return Err(wrap(
                            SqlFlowError::Configuration(format!(
                                "unknown export mode '{other}' (accepted: replace, append)"
                            )),
                            &step.id,
                            &step_type,
                            Phase::Configure,
                        ))
                    }
                };

                let mut destination = self
                    .ctx
                    .registry
                    .create_destination(&export.connector_type)
                    .map_err(|e| wrap(e, &step.id, &step_type, Phase::Configure))?;
                destination
                    .configure(&options)
                    .map_err(|e| wrap(e, &step.id, &step_type, Phase::Configure))?;
                let destination: Arc<dyn DestinationConnector> = Arc::from(destination);

                let endpoint = format!("{}:{}", export.connector_type, export.target);
                let wrapper =
                    Resilience::new(&endpoint, self.options.resilience.clone(), self.cancel.clone());
                let target = export.target.clone();
                let result = wrapper
                    .call(|| {
                        let destination = Arc::clone(&destination);
                        let batch = batch.clone();
                        let target = target.clone();
                        async move { destination.write(&target, &batch, mode).await }
                    })
                    .await
                    .map_err(|e| wrap(e, &step.id, &step_type, Phase::Write))?;
                Ok(result.rows_written)
            }
        }
    }
}

fn skipped(step: &ExecutionStep) -> StepReport {
    StepReport {
        id: step.id.clone(),
        step_type: step.step_type.to_string(),
        status: StepStatus::Skipped,
        rows: 0,
        error: None,
    }
}

fn envelope_for(step: &ExecutionStep, error: &SqlFlowError) -> ErrorEnvelope {
    match error {
        SqlFlowError::Step {
            step_id,
            step_type,
            phase,
            source,
        } => ErrorEnvelope {
            step_id: step_id.clone(),
            step_type: step_type.clone(),
            phase: *phase,
            message: source.to_string(),
        },
        other => ErrorEnvelope {
            step_id: step.id.clone(),
            step_type: step.step_type.to_string(),
            phase: phase_for(other),
            message: other.to_string(),
        },
    }
}

/// Keep an existing envelope; wrap anything else with the given phase,
/// refining to `configure` for configuration-shaped failures.
fn wrap(error: SqlFlowError, step_id: &str, step_type: &str, default_phase: Phase) -> SqlFlowError {
    if matches!(error, SqlFlowError::Step { .. }) {
        return error;
    }
    let phase = match &error {
        SqlFlowError::Configuration(_)
        | SqlFlowError::UnknownParameter { .. }
        | SqlFlowError::ConnectorTypeNotFound(_)
        | SqlFlowError::MissingCursorField(_) => Phase::Configure,
        SqlFlowError::Connection(_) => Phase::Connect,
        _ => default_phase,
    };
    error.in_step(step_id, step_type, phase)
}

fn phase_for(error: &SqlFlowError) -> Phase {
    match error {
        SqlFlowError::Configuration(_)
        | SqlFlowError::UnknownParameter { .. }
        | SqlFlowError::ConnectorTypeNotFound(_) => Phase::Configure,
        SqlFlowError::Connection(_) => Phase::Connect,
        SqlFlowError::WatermarkRegression { .. } => Phase::Commit,
        _ => Phase::Execute,
    }
}
