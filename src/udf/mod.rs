//! User-defined function management.
//!
//! UDFs register through a typed startup API: scalar functions map N scalar
//! inputs to one scalar output row by row, table functions take a whole
//! [`DataBatch`] plus named scalar options and return a new batch. The
//! manager owns the descriptors, validates contracts at registration and at
//! every invocation, walks the project UDF directory to reconcile origins,
//! and extracts referenced UDF names out of SQL text.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use chrono::{Duration, Utc};
use datafusion::scalar::ScalarValue;
use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value;
use tracing::debug;
use walkdir::WalkDir;

use crate::batch::{DataBatch, LogicalType};
use crate::errors::{Result, SqlFlowError};

pub type ScalarFn = Arc<dyn Fn(&[ScalarValue]) -> Result<ScalarValue> + Send + Sync>;
pub type TableFn =
    Arc<dyn Fn(&DataBatch, &HashMap<String, Value>) -> Result<DataBatch> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UdfKind {
    Scalar,
    Table,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct UdfDescriptor {
    /// `module_path.function_name`, or a bare name for builtins.
    pub qualified_name: String,
    pub kind: UdfKind,
    pub arg_types: Vec<LogicalType>,
    pub return_type: Option<LogicalType>,
    pub doc: String,
    /// File the function came from, relative to the UDF directory.
    pub origin: Option<PathBuf>,
}

enum Registered {
    Scalar(UdfDescriptor, ScalarFn),
    Table(UdfDescriptor, TableFn),
}

impl Registered {
    fn descriptor(&self) -> &UdfDescriptor {
        match self {
            Registered::Scalar(d, _) | Registered::Table(d, _) => d,
        }
    }
}

#[derive(Default)]
pub struct UdfManager {
    udfs: IndexMap<String, Registered>,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

impl UdfManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A manager pre-loaded with the built-in scalar functions.
    pub fn with_builtins() -> Self {
        let mut mgr = Self::new();
        builtins::register(&mut mgr).expect("builtin UDFs register cleanly");
        mgr
    }

    pub fn register_scalar(&mut self, descriptor: UdfDescriptor, f: ScalarFn) -> Result<()> {
        self.validate_registration(&descriptor, UdfKind::Scalar)?;
        if descriptor.return_type.is_none() {
            return Err(SqlFlowError::UdfRegistration {
                udf_name: descriptor.qualified_name,
                reason: "scalar UDFs must declare a return type".to_string(),
            });
        }
        self.udfs.insert(
            descriptor.qualified_name.clone(),
            Registered::Scalar(descriptor, f),
        );
        Ok(())
    }

    pub fn register_table(&mut self, descriptor: UdfDescriptor, f: TableFn) -> Result<()> {
        self.validate_registration(&descriptor, UdfKind::Table)?;
        self.udfs.insert(
            descriptor.qualified_name.clone(),
            Registered::Table(descriptor, f),
        );
        Ok(())
    }

    fn validate_registration(&self, descriptor: &UdfDescriptor, kind: UdfKind) -> Result<()> {
        if descriptor.kind != kind {
            return Err(SqlFlowError::UdfRegistration {
                udf_name: descriptor.qualified_name.clone(),
                reason: format!("descriptor kind {:?} does not match registration", descriptor.kind),
            });
        }
        if !valid_name(&descriptor.qualified_name) {
            return Err(SqlFlowError::UdfRegistration {
                udf_name: descriptor.qualified_name.clone(),
                reason: "name must be dot-separated identifiers".to_string(),
            });
        }
        if self.udfs.contains_key(&descriptor.qualified_name) {
            return Err(SqlFlowError::UdfRegistration {
                udf_name: descriptor.qualified_name.clone(),
                reason: "a UDF with this name is already registered".to_string(),
            });
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.udfs.contains_key(name)
    }

    pub fn descriptors(&self) -> Vec<&UdfDescriptor> {
        self.udfs.values().map(Registered::descriptor).collect()
    }

    /// Every registered scalar UDF, for engine registration at run start.
    pub fn scalars(&self) -> Vec<(&UdfDescriptor, ScalarFn)> {
        self.udfs
            .values()
            .filter_map(|r| match r {
                Registered::Scalar(d, f) => Some((d, f.clone())),
                Registered::Table(..) => None,
            })
            .collect()
    }

    pub fn scalar(&self, name: &str) -> Option<(&UdfDescriptor, ScalarFn)> {
        match self.udfs.get(name) {
            Some(Registered::Scalar(d, f)) => Some((d, f.clone())),
            _ => None,
        }
    }

    pub fn is_table_udf(&self, name: &str) -> bool {
        matches!(self.udfs.get(name), Some(Registered::Table(..)))
    }

    /// Invoke a table UDF and validate its contract.
    pub fn apply_table_udf(
        &self,
        name: &str,
        input: &DataBatch,
        options: &HashMap<String, Value>,
    ) -> Result<DataBatch> {
        let Some(Registered::Table(_, f)) = self.udfs.get(name) else {
            return Err(SqlFlowError::UdfRegistration {
                udf_name: name.to_string(),
                reason: "no table UDF registered under this name".to_string(),
            });
        };
        let result = f(input, options).map_err(|e| SqlFlowError::UdfRuntime {
            udf_name: name.to_string(),
            original: e.to_string(),
        })?;
        if result.schema().fields().is_empty() {
            return Err(SqlFlowError::UdfRuntime {
                udf_name: name.to_string(),
                original: "table UDF returned a batch with no columns".to_string(),
            });
        }
        Ok(result)
    }

    /// Walk the project UDF directory and reconcile registered origins.
    /// A registered UDF whose origin file is gone is an error; files with
    /// no registered functions are reported for visibility.
    pub fn discover(&self, dir: impl AsRef<Path>) -> Result<Vec<&UdfDescriptor>> {
        let dir = dir.as_ref();
        let mut present = Vec::new();
        if dir.is_dir() {
            for entry in WalkDir::new(dir) {
                let entry = entry?;
                if entry.file_type().is_file() {
                    let relative = entry
                        .path()
                        .strip_prefix(dir)
                        .unwrap_or(entry.path())
                        .to_path_buf();
                    present.push(relative);
                }
            }
        }
        debug!(dir = %dir.display(), files = present.len(), "udf directory scanned");

        for descriptor in self.descriptors() {
            if let Some(origin) = &descriptor.origin {
                if !present.iter().any(|p| p == origin) {
                    return Err(SqlFlowError::UdfRegistration {
                        udf_name: descriptor.qualified_name.clone(),
                        reason: format!(
                            "origin file '{}' not found under '{}'",
                            origin.display(),
                            dir.display()
                        ),
                    });
                }
            }
        }
        Ok(self.descriptors())
    }

    /// Extract referenced UDF names from SQL: registered names at call
    /// position plus explicit `PYTHON_FUNC("module.fn", ...)` references.
    pub fn extract_references(&self, sql: &str) -> Vec<String> {
        let mut refs = Vec::new();
        for cap in python_func_re().captures_iter(sql) {
            let name = cap[1].to_string();
            if !refs.contains(&name) {
                refs.push(name);
            }
        }
        for cap in call_re().captures_iter(sql) {
            let name = cap[1].to_string();
            if self.contains(&name) && !refs.contains(&name) {
                refs.push(name);
            }
        }
        refs
    }

    /// When a transform's SQL is one top-level table-UDF call, return its
    /// name, input table, and options.
    pub fn parse_table_udf_call(
        &self,
        sql: &str,
    ) -> Option<(String, String, HashMap<String, Value>)> {
        let cap = table_call_re().captures(sql.trim())?;
        // Groups 1/2 are the PYTHON_FUNC form, 3/4 the plain call form.
        let (name, args) = match (cap.get(1), cap.get(2), cap.get(3), cap.get(4)) {
            (Some(name), Some(args), _, _) => (name.as_str().to_string(), args.as_str()),
            (_, _, Some(name), Some(args)) => (name.as_str().to_string(), args.as_str()),
            _ => return None,
        };
        if !self.is_table_udf(&name) {
            return None;
        }
        let mut parts = split_top_level(args);
        if parts.is_empty() {
            return None;
        }
        let input = unquote(parts.remove(0));
        let mut options = HashMap::new();
        for part in parts {
            let (key, value) = part.split_once('=')?;
            options.insert(
                key.trim().to_string(),
                literal_to_json(value.trim()),
            );
        }
        Some((name, input, options))
    }
}

fn python_func_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\bPYTHON_FUNC\(\s*["']([A-Za-z_][A-Za-z0-9_.]*)["']"#)
            .expect("python_func regex is valid")
    })
}

fn call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"([A-Za-z_][A-Za-z0-9_.]*)\s*\(").expect("call regex is valid")
    })
}

fn table_call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?is)^(?:PYTHON_FUNC\(\s*["']([A-Za-z_][A-Za-z0-9_.]*)["']\s*,(.*)\)|([A-Za-z_][A-Za-z0-9_.]*)\s*\((.*)\))\s*;?$"#,
        )
        .expect("table call regex is valid")
    })
}

fn split_top_level(args: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut in_string: Option<char> = None;
    for (i, c) in args.char_indices() {
        match in_string {
            Some(q) => {
                if c == q {
                    in_string = None;
                }
            }
            None => match c {
                '\'' | '"' => in_string = Some(c),
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => {
                    parts.push(args[start..i].trim());
                    start = i + 1;
                }
                _ => {}
            },
        }
    }
    let last = args[start..].trim();
    if !last.is_empty() {
        parts.push(last);
    }
    parts
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
        || (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

fn literal_to_json(s: &str) -> Value {
    let trimmed = s.trim();
    if trimmed.starts_with('\'') || trimmed.starts_with('"') {
        return Value::String(unquote(trimmed));
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return Value::from(f);
    }
    match trimmed {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        other => Value::String(other.to_string()),
    }
}

/// Built-in scalar functions shipped with the engine.
pub mod builtins {
    use super::*;

    pub fn register(mgr: &mut UdfManager) -> Result<()> {
        mgr.register_scalar(
            UdfDescriptor {
                qualified_name: "current_date".to_string(),
                kind: UdfKind::Scalar,
                arg_types: vec![],
                return_type: Some(LogicalType::String),
                doc: "Today's date as YYYY-MM-DD".to_string(),
                origin: None,
            },
            Arc::new(|_args| {
                Ok(ScalarValue::Utf8(Some(
                    Utc::now().format("%Y-%m-%d").to_string(),
                )))
            }),
        )?;

        mgr.register_scalar(
            UdfDescriptor {
                qualified_name: "days_ago".to_string(),
                kind: UdfKind::Scalar,
                arg_types: vec![LogicalType::Int64],
                return_type: Some(LogicalType::String),
                doc: "The date N days back as YYYY-MM-DD".to_string(),
                origin: None,
            },
            Arc::new(|args| {
                let days = match args.first() {
                    Some(ScalarValue::Int64(Some(n))) => *n,
                    Some(ScalarValue::Int32(Some(n))) => i64::from(*n),
                    other => {
                        return Err(SqlFlowError::UdfRuntime {
                            udf_name: "days_ago".to_string(),
                            original: format!("expected an integer argument, got {other:?}"),
                        })
                    }
                };
                if days < 0 {
                    return Err(SqlFlowError::UdfRuntime {
                        udf_name: "days_ago".to_string(),
                        original: "days must be non-negative".to_string(),
                    });
                }
                let target = Utc::now()
                    .date_naive()
                    .checked_sub_signed(Duration::days(days))
                    .ok_or_else(|| SqlFlowError::UdfRuntime {
                        udf_name: "days_ago".to_string(),
                        original: "date out of range".to_string(),
                    })?;
                Ok(ScalarValue::Utf8(Some(target.format("%Y-%m-%d").to_string())))
            }),
        )?;

        mgr.register_scalar(
            UdfDescriptor {
                qualified_name: "clean_text".to_string(),
                kind: UdfKind::Scalar,
                arg_types: vec![LogicalType::String],
                return_type: Some(LogicalType::String),
                doc: "Trim and collapse internal whitespace".to_string(),
                origin: None,
            },
            Arc::new(|args| match args.first() {
                Some(ScalarValue::Utf8(Some(s))) => Ok(ScalarValue::Utf8(Some(
                    s.split_whitespace().collect::<Vec<_>>().join(" "),
                ))),
                Some(ScalarValue::Utf8(None)) | None => Ok(ScalarValue::Utf8(None)),
                other => Err(SqlFlowError::UdfRuntime {
                    udf_name: "clean_text".to_string(),
                    original: format!("expected a string argument, got {other:?}"),
                }),
            }),
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table_udf(name: &str) -> (UdfDescriptor, TableFn) {
        (
            UdfDescriptor {
                qualified_name: name.to_string(),
                kind: UdfKind::Table,
                arg_types: vec![],
                return_type: None,
                doc: String::new(),
                origin: None,
            },
            Arc::new(|batch: &DataBatch, _opts: &HashMap<String, Value>| Ok(batch.clone())),
        )
    }

    #[test]
    fn test_builtins_register() {
        let mgr = UdfManager::with_builtins();
        assert!(mgr.contains("current_date"));
        assert!(mgr.contains("days_ago"));
        assert!(mgr.contains("clean_text"));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut mgr = UdfManager::with_builtins();
        let (d, f) = table_udf("current_date");
        let err = mgr.register_table(d, f).unwrap_err();
        assert!(matches!(err, SqlFlowError::UdfRegistration { .. }));
    }

    #[test]
    fn test_extract_references_ignores_sql_functions() {
        let mgr = UdfManager::with_builtins();
        let refs = mgr.extract_references(
            "SELECT clean_text(name), SUM(amount) FROM t WHERE d > days_ago(7)",
        );
        assert_eq!(refs, vec!["clean_text", "days_ago"]);
    }

    #[test]
    fn test_extract_python_func_form() {
        let mgr = UdfManager::with_builtins();
        let refs =
            mgr.extract_references(r#"SELECT PYTHON_FUNC("transforms.enrich", col) FROM t"#);
        assert_eq!(refs, vec!["transforms.enrich"]);
    }

    #[test]
    fn test_parse_table_udf_call_with_options() {
        let mut mgr = UdfManager::new();
        let (d, f) = table_udf("dedupe");
        mgr.register_table(d, f).unwrap();
        let (name, input, options) = mgr
            .parse_table_udf_call("dedupe(orders_raw, keep = 'last', limit = 10)")
            .unwrap();
        assert_eq!(name, "dedupe");
        assert_eq!(input, "orders_raw");
        assert_eq!(options["keep"], json!("last"));
        assert_eq!(options["limit"], json!(10));
    }

    #[test]
    fn test_plain_select_is_not_a_table_udf_call() {
        let mgr = UdfManager::with_builtins();
        assert!(mgr
            .parse_table_udf_call("SELECT clean_text(name) FROM t")
            .is_none());
    }

    #[test]
    fn test_table_udf_contract_validated_at_invocation() {
        let mut mgr = UdfManager::new();
        let descriptor = UdfDescriptor {
            qualified_name: "broken".to_string(),
            kind: UdfKind::Table,
            arg_types: vec![],
            return_type: None,
            doc: String::new(),
            origin: None,
        };
        let f: TableFn = Arc::new(|_b, _o| {
            Ok(DataBatch::empty(std::sync::Arc::new(
                datafusion::arrow::datatypes::Schema::empty(),
            )))
        });
        mgr.register_table(descriptor, f).unwrap();
        let input = DataBatch::from_json_rows(&[json!({"id": 1})]).unwrap();
        let err = mgr
            .apply_table_udf("broken", &input, &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, SqlFlowError::UdfRuntime { .. }));
    }

    #[test]
    fn test_discover_errors_on_missing_origin() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = UdfManager::new();
        let (mut d, f) = table_udf("transforms.enrich");
        d.origin = Some(PathBuf::from("transforms.rs"));
        mgr.register_table(d, f).unwrap();
        assert!(mgr.discover(dir.path()).is_err());

        std::fs::write(dir.path().join("transforms.rs"), "// enrich").unwrap();
        assert!(mgr.discover(dir.path()).is_ok());
    }
}
