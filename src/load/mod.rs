//! Load execution: move a registered source table into its target table.
//!
//! `REPLACE` swaps the target wholesale, `APPEND` inserts after a schema
//! compatibility check, `MERGE` upserts by key. Merge runs as SQL on the
//! embedded engine (source rows unioned with the anti-joined remainder of
//! the target) and the result replaces the target in one swap, so a step
//! either lands completely or not at all.

use std::sync::Arc;

use datafusion::arrow::array::{new_null_array, ArrayRef, RecordBatch};
use datafusion::arrow::compute::cast;
use tracing::info;

use crate::batch::{ColumnSpec, DataBatch};
use crate::engine::{quote_ident, SqlEngine};
use crate::errors::{Result, SqlFlowError};
use crate::parser::ast::LoadMode;
use crate::planner::LoadStep;

pub struct LoadRunner<'a> {
    pub engine: &'a SqlEngine,
}

impl<'a> LoadRunner<'a> {
    pub async fn run(&self, step: &LoadStep) -> Result<u64> {
        let source = self.engine.table_batch(&step.source_name)?;
        let rows = source.row_count() as u64;
        match step.mode {
            LoadMode::Replace => {
                self.engine.replace_table(&step.target_table, source)?;
            }
            LoadMode::Append => {
                self.append(step, source)?;
            }
            LoadMode::Merge => {
                self.merge(step, source).await?;
            }
        }
        info!(
            target = %step.target_table,
            source = %step.source_name,
            mode = %step.mode,
            rows,
            "load complete"
        );
        Ok(rows)
    }

    /// `APPEND`: every source column must exist in the target with the same
    /// logical type; extra target columns must be nullable and are filled
    /// with nulls.
    fn append(&self, step: &LoadStep, source: DataBatch) -> Result<()> {
        if !self.engine.table_exists(&step.target_table) {
            self.engine.replace_table(&step.target_table, source)?;
            return Ok(());
        }

        let target = self.engine.table_batch(&step.target_table)?;
        let target_specs = target.column_specs()?;
        let source_specs = source.column_specs()?;

        let mut missing_columns = Vec::new();
        let mut type_conflicts = Vec::new();
        for spec in &source_specs {
            match target_specs.iter().find(|t| t.name == spec.name) {
                None => missing_columns.push(spec.name.clone()),
                Some(t) if t.logical_type != spec.logical_type => {
                    type_conflicts.push(format!(
                        "{}: source {} vs target {}",
                        spec.name, spec.logical_type, t.logical_type
                    ));
                }
                Some(_) => {}
            }
        }
        for spec in &target_specs {
            let in_source = source_specs.iter().any(|s| s.name == spec.name);
            if !in_source && !spec.nullable {
                missing_columns.push(format!("{} (required by target)", spec.name));
            }
        }
        if !missing_columns.is_empty() || !type_conflicts.is_empty() {
            return Err(SqlFlowError::SchemaMismatch {
                target: step.target_table.clone(),
                missing_columns,
                type_conflicts,
            });
        }

        let aligned = align_to_schema(&source, &target)?;
        self.engine.register_batch(&step.target_table, aligned)
    }

    /// `MERGE`: keys must exist on both sides with identical types, and the
    /// column sets must match. Source rows win on key collision.
    async fn merge(&self, step: &LoadStep, source: DataBatch) -> Result<()> {
        if step.merge_keys.is_empty() {
            return Err(SqlFlowError::MergeKey {
                target: step.target_table.clone(),
                missing_in_source: Vec::new(),
                missing_in_target: Vec::new(),
                type_mismatches: vec!["MERGE requires at least one key".to_string()],
            });
        }

        if !self.engine.table_exists(&step.target_table) {
            // Nothing to merge into; the source becomes the target.
            self.engine.replace_table(&step.target_table, source)?;
            return Ok(());
        }

        let target = self.engine.table_batch(&step.target_table)?;
        let target_specs = target.column_specs()?;
        let source_specs = source.column_specs()?;
        validate_merge_keys(step, &source_specs, &target_specs)?;

        let columns: Vec<String> = target_specs
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect();
        let missing_from_source: Vec<String> = target_specs
            .iter()
            .filter(|t| !source_specs.iter().any(|s| s.name == t.name))
            .map(|t| t.name.clone())
            .collect();
        if !missing_from_source.is_empty() {
            return Err(SqlFlowError::SchemaMismatch {
                target: step.target_table.clone(),
                missing_columns: missing_from_source,
                type_conflicts: Vec::new(),
            });
        }

        let join: Vec<String> = step
            .merge_keys
            .iter()
            .map(|k| {
                let key = quote_ident(k);
                format!("t.{key} IS NOT DISTINCT FROM s.{key}")
            })
            .collect();
        let source_cols: Vec<String> = columns.iter().map(|c| format!("s.{c}")).collect();
        let target_cols: Vec<String> = columns.iter().map(|c| format!("t.{c}")).collect();
        let sql = format!(
            "SELECT {source_cols} FROM {source} s \
             UNION ALL \
             SELECT {target_cols} FROM {target} t LEFT ANTI JOIN {source} s ON {join}",
            source_cols = source_cols.join(", "),
            target_cols = target_cols.join(", "),
            source = quote_ident(&step.source_name),
            target = quote_ident(&step.target_table),
            join = join.join(" AND "),
        );

        let merged = self.engine.execute(&sql).await?;
        self.engine.replace_table(&step.target_table, merged)
    }
}

fn validate_merge_keys(
    step: &LoadStep,
    source_specs: &[ColumnSpec],
    target_specs: &[ColumnSpec],
) -> Result<()> {
    let mut missing_in_source = Vec::new();
    let mut missing_in_target = Vec::new();
    let mut type_mismatches = Vec::new();
    for key in &step.merge_keys {
        let source = source_specs.iter().find(|c| &c.name == key);
        let target = target_specs.iter().find(|c| &c.name == key);
        match (source, target) {
            (None, _) => missing_in_source.push(key.clone()),
            (_, None) => missing_in_target.push(key.clone()),
            (Some(s), Some(t)) if s.logical_type != t.logical_type => {
                type_mismatches.push(format!(
                    "{key}: source {} vs target {}",
                    s.logical_type, t.logical_type
                ));
            }
            _ => {}
        }
    }
    if missing_in_source.is_empty() && missing_in_target.is_empty() && type_mismatches.is_empty() {
        Ok(())
    } else {
        Err(SqlFlowError::MergeKey {
            target: step.target_table.clone(),
            missing_in_source,
            missing_in_target,
            type_mismatches,
        })
    }
}

/// Reorder and pad a source batch to the target's schema: shared columns are
/// cast to the target's physical type, extra target columns become nulls.
fn align_to_schema(source: &DataBatch, target: &DataBatch) -> Result<DataBatch> {
    let target_schema = target.schema();
    let rows = source.row_count();
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(target_schema.fields().len());
    for field in target_schema.fields() {
        match source.column_by_name(field.name()) {
            Some(column) => arrays.push(cast(column, field.data_type())?),
            None => arrays.push(new_null_array(field.data_type(), rows)),
        }
    }
    Ok(DataBatch::new(RecordBatch::try_new(
        Arc::clone(&target_schema),
        arrays,
    )?))
}
