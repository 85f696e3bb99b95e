//! Turns a parsed pipeline into a topologically ordered execution plan.
//!
//! Conditionals are resolved here, at plan time: `SET` statements feed the
//! variable manager in source order, each branch condition is substituted
//! and evaluated, and exactly one branch (or the else branch, or none)
//! contributes steps. The surviving statements get their variables expanded
//! and become [`ExecutionStep`]s wired by table-level dependencies.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::condition;
use crate::connectors::params::SyncMode;
use crate::errors::{Result, SqlFlowError};
use crate::parser::ast::{LoadMode, Pipeline, Statement};
use crate::parser::parse_file;
use crate::vars::{VarOrigin, VariableManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    SourceDefinition,
    Load,
    Transform,
    Export,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepType::SourceDefinition => "source_definition",
            StepType::Load => "load",
            StepType::Transform => "transform",
            StepType::Export => "export",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStep {
    pub name: String,
    pub connector_type: String,
    pub params: Value,
    pub sync_mode: SyncMode,
    pub cursor_field: Option<String>,
    pub primary_key: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadStep {
    pub target_table: String,
    pub source_name: String,
    pub mode: LoadMode,
    pub merge_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformStep {
    pub table: String,
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportStep {
    pub sql: String,
    pub target: String,
    pub connector_type: String,
    pub options: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StepPayload {
    Source(SourceStep),
    Load(LoadStep),
    Transform(TransformStep),
    Export(ExportStep),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionStep {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub depends_on: BTreeSet<String>,
    pub payload: StepPayload,
    #[serde(skip)]
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPlan {
    pub pipeline: String,
    pub steps: Vec<ExecutionStep>,
}

impl ExecutionPlan {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the compile-only artifact.
    pub fn write_artifact(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn step(&self, id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

pub struct Planner<'a> {
    vars: &'a mut VariableManager,
    base_dir: PathBuf,
    include_stack: Vec<PathBuf>,
}

impl<'a> Planner<'a> {
    pub fn new(vars: &'a mut VariableManager) -> Self {
        Self {
            vars,
            base_dir: PathBuf::from("."),
            include_stack: Vec::new(),
        }
    }

    /// Directory against which `INCLUDE` paths resolve.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    pub fn plan(mut self, pipeline: &Pipeline) -> Result<ExecutionPlan> {
        let mut flat = Vec::new();
        self.flatten(&pipeline.name, &pipeline.statements, &mut flat)?;

        let steps = self.build_steps(&pipeline.name, &flat)?;
        let ordered = toposort(steps)?;
        Ok(ExecutionPlan {
            pipeline: pipeline.name.clone(),
            steps: ordered,
        })
    }

    /// Resolve conditionals and includes, applying `SET` in source order.
    fn flatten(
        &mut self,
        pipeline_name: &str,
        statements: &[Statement],
        out: &mut Vec<Statement>,
    ) -> Result<()> {
        for stmt in statements {
            match stmt {
                Statement::Set(set) => {
                    let location = format!("{}:{}", pipeline_name, set.line);
                    let value = self.vars.substitute_at(&set.value, &location)?;
                    self.vars.set(&set.name, value, VarOrigin::Set);
                }
                Statement::Include(include) => {
                    let location = format!("{}:{}", pipeline_name, include.line);
                    let path = self.vars.substitute_at(&include.path, &location)?;
                    self.expand_include(pipeline_name, &path, include.alias.as_deref(), out)?;
                }
                Statement::Conditional(block) => {
                    let mut taken = false;
                    for branch in &block.branches {
                        let location = format!("{}:{}", pipeline_name, branch.line);
                        let outcome = self
                            .vars
                            .substitute_at(&branch.condition, &location)
                            .and_then(|text| condition::evaluate(&text, self.vars));
                        match outcome {
                            Ok(true) => {
                                self.flatten(pipeline_name, &branch.steps, out)?;
                                taken = true;
                                break;
                            }
                            Ok(false) => {}
                            Err(e) => {
                                warn!(
                                    condition = %branch.condition,
                                    location = %location,
                                    error = %e,
                                    "condition evaluation failed; falling through to next branch"
                                );
                            }
                        }
                    }
                    if !taken {
                        self.flatten(pipeline_name, &block.else_steps, out)?;
                    }
                }
                other => out.push(other.clone()),
            }
        }
        Ok(())
    }

    fn expand_include(
        &mut self,
        pipeline_name: &str,
        path: &str,
        alias: Option<&str>,
        out: &mut Vec<Statement>,
    ) -> Result<()> {
        let full = self.base_dir.join(path);
        let canonical = full.canonicalize().map_err(|e| {
            SqlFlowError::Configuration(format!("cannot include '{}': {e}", full.display()))
        })?;
        if self.include_stack.contains(&canonical) {
            return Err(SqlFlowError::Configuration(format!(
                "include cycle detected at '{}'",
                canonical.display()
            )));
        }
        debug!(path = %canonical.display(), alias, "expanding include");
        let included = parse_file(&canonical)?;
        self.include_stack.push(canonical);
        let result = self.flatten(pipeline_name, &included.statements, out);
        self.include_stack.pop();
        result
    }

    fn build_steps(
        &mut self,
        pipeline_name: &str,
        statements: &[Statement],
    ) -> Result<Vec<ExecutionStep>> {
        let mut steps: Vec<ExecutionStep> = Vec::new();
        let mut used_ids: HashSet<String> = HashSet::new();

        // First pass: resolve variables and emit steps with ids.
        for stmt in statements {
            let location = format!("{}:{}", pipeline_name, stmt.line());
            match stmt {
                Statement::Source(src) => {
                    let params = self.vars.substitute_json(&src.params, &location)?;
                    let sync_mode = SyncMode::from_params(&params)?;
                    let cursor_field = params
                        .get("cursor_field")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    let primary_key = match params.get("primary_key") {
                        Some(Value::String(s)) => vec![s.clone()],
                        Some(Value::Array(items)) => items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect(),
                        _ => Vec::new(),
                    };
                    if sync_mode == SyncMode::Incremental {
                        if cursor_field.is_none() {
                            return Err(SqlFlowError::MissingCursorField(src.name.clone()));
                        }
                        if primary_key.is_empty() {
                            return Err(SqlFlowError::MissingPrimaryKey(src.name.clone()));
                        }
                    }
                    let id = unique_id(&format!("source_{}", src.name.to_lowercase()), &mut used_ids);
                    steps.push(ExecutionStep {
                        id,
                        step_type: StepType::SourceDefinition,
                        depends_on: BTreeSet::new(),
                        payload: StepPayload::Source(SourceStep {
                            name: src.name.to_lowercase(),
                            connector_type: src.connector_type.to_uppercase(),
                            params,
                            sync_mode,
                            cursor_field,
                            primary_key,
                        }),
                        line: src.line,
                    });
                }
                Statement::Load(load) => {
                    let id = unique_id(
                        &format!("load_{}", load.target_table.to_lowercase()),
                        &mut used_ids,
                    );
                    steps.push(ExecutionStep {
                        id,
                        step_type: StepType::Load,
                        depends_on: BTreeSet::new(),
                        payload: StepPayload::Load(LoadStep {
                            target_table: load.target_table.to_lowercase(),
                            source_name: load.source_name.to_lowercase(),
                            mode: load.mode,
                            merge_keys: load.merge_keys.clone(),
                        }),
                        line: load.line,
                    });
                }
                Statement::CreateTableAs(create) => {
                    let sql = self.vars.substitute_at(&create.sql, &location)?;
                    let id = unique_id(
                        &format!("transform_{}", create.table.to_lowercase()),
                        &mut used_ids,
                    );
                    steps.push(ExecutionStep {
                        id,
                        step_type: StepType::Transform,
                        depends_on: BTreeSet::new(),
                        payload: StepPayload::Transform(TransformStep {
                            table: create.table.to_lowercase(),
                            sql,
                        }),
                        line: create.line,
                    });
                }
                Statement::Export(export) => {
                    let sql = self.vars.substitute_at(&export.sql, &location)?;
                    let target = self.vars.substitute_at(&export.target, &location)?;
                    let options = self.vars.substitute_json(&export.options, &location)?;
                    let id = unique_id(&export_id_base(&target, &export.connector_type), &mut used_ids);
                    steps.push(ExecutionStep {
                        id,
                        step_type: StepType::Export,
                        depends_on: BTreeSet::new(),
                        payload: StepPayload::Export(ExportStep {
                            sql,
                            target,
                            connector_type: export.connector_type.to_uppercase(),
                            options,
                        }),
                        line: export.line,
                    });
                }
                Statement::Set(_) | Statement::Include(_) | Statement::Conditional(_) => {
                    // Consumed during flattening.
                }
            }
        }

        // Second pass: every table or source name maps to its producing step.
        let mut producers: HashMap<String, String> = HashMap::new();
        for step in &steps {
            match &step.payload {
                StepPayload::Source(s) => {
                    producers.insert(s.name.clone(), step.id.clone());
                }
                StepPayload::Load(l) => {
                    producers.insert(l.target_table.clone(), step.id.clone());
                }
                StepPayload::Transform(t) => {
                    producers.insert(t.table.clone(), step.id.clone());
                }
                StepPayload::Export(_) => {}
            }
        }

        // Third pass: dependency edges.
        let ids: HashSet<String> = steps.iter().map(|s| s.id.clone()).collect();
        for step in &mut steps {
            match &step.payload {
                StepPayload::Load(l) => {
                    let source_step = producers.get(&l.source_name).cloned().ok_or_else(|| {
                        SqlFlowError::UnresolvedReference {
                            step_id: step.id.clone(),
                            unknown_table: l.source_name.clone(),
                        }
                    })?;
                    step.depends_on.insert(source_step);
                }
                StepPayload::Transform(t) => {
                    let table = t.table.clone();
                    let refs = extract_table_refs(&t.sql);
                    for table_ref in refs {
                        if table_ref == table {
                            continue;
                        }
                        let producer = producers.get(&table_ref).cloned().ok_or_else(|| {
                            SqlFlowError::UnresolvedReference {
                                step_id: step.id.clone(),
                                unknown_table: table_ref.clone(),
                            }
                        })?;
                        if producer != step.id {
                            step.depends_on.insert(producer);
                        }
                    }
                }
                StepPayload::Export(e) => {
                    for table_ref in extract_table_refs(&e.sql) {
                        let producer = producers.get(&table_ref).cloned().ok_or_else(|| {
                            SqlFlowError::UnresolvedReference {
                                step_id: step.id.clone(),
                                unknown_table: table_ref.clone(),
                            }
                        })?;
                        step.depends_on.insert(producer);
                    }
                }
                StepPayload::Source(_) => {}
            }
            debug_assert!(step.depends_on.iter().all(|d| ids.contains(d)));
        }

        Ok(steps)
    }
}

fn unique_id(base: &str, used: &mut HashSet<String>) -> String {
    if used.insert(base.to_string()) {
        return base.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}_{n}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

fn export_id_base(target: &str, connector_type: &str) -> String {
    let stem = Path::new(target)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("");
    let sanitized: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.trim_matches('_').is_empty() {
        format!("export_{}", connector_type.to_lowercase())
    } else {
        format!("export_{sanitized}")
    }
}

fn table_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:FROM|JOIN)\s+([A-Za-z_][A-Za-z0-9_.]*)")
            .expect("table reference regex is valid")
    })
}

fn cte_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:WITH|,)\s*([A-Za-z_][A-Za-z0-9_]*)\s+AS\s*\(")
            .expect("CTE regex is valid")
    })
}

/// Table names read by a SELECT: identifiers after FROM/JOIN, minus CTE
/// names defined in the same statement and function-style table sources.
pub fn extract_table_refs(sql: &str) -> Vec<String> {
    let ctes: HashSet<String> = cte_re()
        .captures_iter(sql)
        .map(|cap| cap[1].to_lowercase())
        .collect();
    let mut refs = Vec::new();
    for cap in table_ref_re().captures_iter(sql) {
        let whole = cap.get(1).expect("capture group 1 always present");
        // A '(' directly after the identifier means a table function call.
        let rest = sql[whole.end()..].trim_start();
        if rest.starts_with('(') {
            continue;
        }
        let name = whole.as_str().to_lowercase();
        if ctes.contains(&name) || refs.contains(&name) {
            continue;
        }
        refs.push(name);
    }
    refs
}

/// Kahn's algorithm with the original emission order as tie-breaker.
fn toposort(steps: Vec<ExecutionStep>) -> Result<Vec<ExecutionStep>> {
    let index_of: HashMap<String, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.clone(), i))
        .collect();

    let mut indegree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            let j = index_of[dep];
            indegree[i] += 1;
            dependents[j].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(&i) = ready.iter().next() {
        ready.remove(&i);
        order.push(i);
        for &dependent in &dependents[i] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() != steps.len() {
        let remaining: HashSet<usize> = (0..steps.len()).filter(|i| !order.contains(i)).collect();
        return Err(SqlFlowError::Cycle {
            cycle: find_cycle(&steps, &index_of, &remaining),
        });
    }

    let mut by_index: Vec<Option<ExecutionStep>> = steps.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .map(|i| by_index[i].take().expect("each index visited once"))
        .collect())
}

fn find_cycle(
    steps: &[ExecutionStep],
    index_of: &HashMap<String, usize>,
    remaining: &HashSet<usize>,
) -> Vec<String> {
    let start = *remaining.iter().min().expect("cycle implies remaining nodes");
    let mut path = Vec::new();
    let mut seen = HashMap::new();
    let mut cur = start;
    loop {
        if let Some(&at) = seen.get(&cur) {
            let mut cycle: Vec<String> = path[at..]
                .iter()
                .map(|&i: &usize| steps[i].id.clone())
                .collect();
            cycle.push(steps[cur].id.clone());
            return cycle;
        }
        seen.insert(cur, path.len());
        path.push(cur);
        let next = steps[cur]
            .depends_on
            .iter()
            .map(|d| index_of[d])
            .find(|i| remaining.contains(i));
        match next {
            Some(i) => cur = i,
            // Every remaining node keeps an unresolved dependency, so this
            // walk always loops before running out of edges.
            None => return path.iter().map(|&i| steps[i].id.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn plan_src(src: &str) -> Result<ExecutionPlan> {
        let pipeline = parse(src, "test").unwrap();
        let mut vars = VariableManager::new();
        Planner::new(&mut vars).plan(&pipeline)
    }

    #[test]
    fn test_extract_table_refs_from_and_join() {
        let refs = extract_table_refs(
            "SELECT * FROM orders o JOIN customers c ON o.cid = c.id JOIN regions USING (rid)",
        );
        assert_eq!(refs, vec!["orders", "customers", "regions"]);
    }

    #[test]
    fn test_extract_table_refs_skips_ctes_and_functions() {
        let refs = extract_table_refs(
            "WITH recent AS (SELECT * FROM events), agg AS (SELECT * FROM recent) \
             SELECT * FROM agg JOIN generate_series(1, 10) ON true",
        );
        assert_eq!(refs, vec!["events"]);
    }

    #[test]
    fn test_load_depends_on_source() {
        let plan = plan_src(
            r#"SOURCE orders TYPE CSV PARAMS {"path": "x.csv"};
LOAD orders_raw FROM orders;"#,
        )
        .unwrap();
        let load = plan.step("load_orders_raw").unwrap();
        assert!(load.depends_on.contains("source_orders"));
    }

    #[test]
    fn test_topological_order_and_ids() {
        let plan = plan_src(
            r#"SOURCE orders TYPE CSV PARAMS {"path": "x.csv"};
LOAD orders_raw FROM orders;
CREATE TABLE totals AS SELECT customer_id, SUM(amount) AS total FROM orders_raw GROUP BY customer_id;
EXPORT SELECT * FROM totals TO 'out/totals.csv' TYPE CSV OPTIONS {"header": true};"#,
        )
        .unwrap();
        let ids: Vec<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "source_orders",
                "load_orders_raw",
                "transform_totals",
                "export_totals"
            ]
        );
        for (i, step) in plan.steps.iter().enumerate() {
            for dep in &step.depends_on {
                let j = plan.steps.iter().position(|s| &s.id == dep).unwrap();
                assert!(j < i, "dependency {dep} must come before {}", step.id);
            }
        }
    }

    #[test]
    fn test_cycle_detection() {
        let err = plan_src(
            "CREATE TABLE a AS SELECT * FROM b;\nCREATE TABLE b AS SELECT * FROM a;",
        )
        .unwrap_err();
        match err {
            SqlFlowError::Cycle { cycle } => {
                assert!(cycle.iter().any(|id| id == "transform_a"));
                assert!(cycle.iter().any(|id| id == "transform_b"));
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_table_reference() {
        let err = plan_src("CREATE TABLE a AS SELECT * FROM ghost;").unwrap_err();
        match err {
            SqlFlowError::UnresolvedReference { unknown_table, .. } => {
                assert_eq!(unknown_table, "ghost");
            }
            other => panic!("expected unresolved reference, got {other:?}"),
        }
    }

    #[test]
    fn test_conditional_branch_selection() {
        let src = r#"
SET env = 'prod';
IF env == 'prod' THEN
SOURCE s TYPE POSTGRES PARAMS {"host": "db"};
ELSE
SOURCE s TYPE CSV PARAMS {"path": "s.csv"};
ENDIF;
"#;
        let plan = plan_src(src).unwrap();
        assert_eq!(plan.steps.len(), 1);
        match &plan.steps[0].payload {
            StepPayload::Source(s) => assert_eq!(s.connector_type, "POSTGRES"),
            other => panic!("expected source payload, got {other:?}"),
        }
    }

    #[test]
    fn test_all_branches_false_without_else_emits_nothing() {
        let plan = plan_src("IF 1 == 2 THEN SET x = 'a'; ENDIF;").unwrap();
        assert!(plan.steps.is_empty());
    }

    #[test]
    fn test_failed_condition_falls_through_to_next_branch() {
        // First branch compares string to number; the evaluator rejects it
        // and the planner moves on.
        let src = r#"
SET env = 'prod';
IF env == 1 THEN
SOURCE a TYPE CSV PARAMS {"path": "a.csv"};
ELSEIF env == 'prod' THEN
SOURCE b TYPE CSV PARAMS {"path": "b.csv"};
ENDIF;
"#;
        let plan = plan_src(src).unwrap();
        assert_eq!(plan.steps.len(), 1);
        match &plan.steps[0].payload {
            StepPayload::Source(s) => assert_eq!(s.name, "b"),
            other => panic!("expected source payload, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_pipeline_plans_empty() {
        let plan = plan_src("").unwrap();
        assert!(plan.steps.is_empty());
    }

    #[test]
    fn test_incremental_requires_cursor_field() {
        let err = plan_src(
            r#"SOURCE e TYPE CSV PARAMS {"path": "e.csv", "sync_mode": "incremental"};"#,
        )
        .unwrap_err();
        assert!(matches!(err, SqlFlowError::MissingCursorField(_)));
    }

    #[test]
    fn test_incremental_requires_primary_key() {
        let err = plan_src(
            r#"SOURCE e TYPE CSV PARAMS {"path": "e.csv", "sync_mode": "incremental", "cursor_field": "ts"};"#,
        )
        .unwrap_err();
        assert!(matches!(err, SqlFlowError::MissingPrimaryKey(_)));
    }

    #[test]
    fn test_incremental_with_cursor_and_primary_key_plans() {
        let plan = plan_src(
            r#"SOURCE e TYPE CSV PARAMS {"path": "e.csv", "sync_mode": "incremental", "cursor_field": "ts", "primary_key": "id"};"#,
        )
        .unwrap();
        match &plan.steps[0].payload {
            StepPayload::Source(s) => {
                assert_eq!(s.sync_mode, SyncMode::Incremental);
                assert_eq!(s.primary_key, vec!["id"]);
            }
            other => panic!("expected source payload, got {other:?}"),
        }
    }

    #[test]
    fn test_plan_artifact_shape() {
        let plan = plan_src(
            r#"SOURCE orders TYPE CSV PARAMS {"path": "x.csv"};
LOAD orders_raw FROM orders;"#,
        )
        .unwrap();
        let json: Value = serde_json::from_str(&plan.to_json().unwrap()).unwrap();
        assert_eq!(json["pipeline"], "test");
        assert_eq!(json["steps"][1]["type"], "load");
        assert_eq!(json["steps"][1]["depends_on"][0], "source_orders");
        assert_eq!(json["steps"][1]["payload"]["target_table"], "orders_raw");
    }
}
