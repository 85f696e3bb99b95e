//! Connector parameter validation.
//!
//! Every connector declares a [`ParamSchema`]; the validator maps the raw
//! JSON parameter object onto canonical names, accepting industry-standard
//! aliases (`database`/`dbname`, `username`/`user`, ...). Unknown keys are
//! rejected with the accepted set, and the canonical name wins when both it
//! and an alias are present.

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use crate::errors::{Result, SqlFlowError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Str,
    Int,
    Number,
    Bool,
    /// A string or an array of strings (e.g. `primary_key`, `partition_keys`).
    StrList,
    /// Any JSON value, passed through untouched.
    Any,
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub kind: ParamKind,
    pub required: bool,
}

impl ParamSpec {
    pub const fn required(name: &'static str, kind: ParamKind) -> Self {
        ParamSpec {
            name,
            aliases: &[],
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: ParamKind) -> Self {
        ParamSpec {
            name,
            aliases: &[],
            kind,
            required: false,
        }
    }

    pub const fn with_aliases(mut self, aliases: &'static [&'static str]) -> Self {
        self.aliases = aliases;
        self
    }
}

/// The sync parameters every source accepts. `cursor_field` and
/// `primary_key` become mandatory when `sync_mode` is incremental; the
/// planner enforces that, since it depends on another parameter's value.
pub const SYNC_PARAMS: &[ParamSpec] = &[
    ParamSpec::optional("sync_mode", ParamKind::Str),
    ParamSpec::optional("cursor_field", ParamKind::Str),
    ParamSpec::optional("primary_key", ParamKind::StrList),
];

#[derive(Debug, Clone)]
pub struct ParamSchema {
    pub connector: &'static str,
    specs: Vec<ParamSpec>,
}

impl ParamSchema {
    pub fn new(connector: &'static str, specs: Vec<ParamSpec>) -> Self {
        Self { connector, specs }
    }

    /// A source schema: the given specs plus the standard sync parameters.
    pub fn for_source(connector: &'static str, mut specs: Vec<ParamSpec>) -> Self {
        specs.extend(SYNC_PARAMS.iter().cloned());
        Self { connector, specs }
    }

    fn accepted_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for spec in &self.specs {
            names.push(spec.name.to_string());
            names.extend(spec.aliases.iter().map(|a| a.to_string()));
        }
        names
    }

    /// Validate a raw JSON object and return a map keyed by canonical names.
    pub fn validate(&self, params: &Value) -> Result<IndexMap<String, Value>> {
        let Some(object) = params.as_object() else {
            return Err(SqlFlowError::Configuration(format!(
                "{} parameters must be a JSON object",
                self.connector
            )));
        };

        for key in object.keys() {
            let known = self
                .specs
                .iter()
                .any(|s| s.name == key || s.aliases.contains(&key.as_str()));
            if !known {
                return Err(SqlFlowError::UnknownParameter {
                    connector: self.connector.to_string(),
                    name: key.clone(),
                    accepted: self.accepted_names(),
                });
            }
        }

        let mut out = IndexMap::new();
        for spec in &self.specs {
            // Canonical name takes precedence over aliases.
            let value = object.get(spec.name).or_else(|| {
                spec.aliases.iter().find_map(|alias| object.get(*alias))
            });
            match value {
                Some(v) => {
                    check_kind(self.connector, spec, v)?;
                    out.insert(spec.name.to_string(), v.clone());
                }
                None if spec.required => {
                    let mut accepted = vec![spec.name.to_string()];
                    accepted.extend(spec.aliases.iter().map(|a| a.to_string()));
                    return Err(SqlFlowError::Configuration(format!(
                        "{}: missing required parameter '{}' (accepted names: {})",
                        self.connector,
                        spec.name,
                        accepted.join(", ")
                    )));
                }
                None => {}
            }
        }
        Ok(out)
    }
}

fn check_kind(connector: &str, spec: &ParamSpec, value: &Value) -> Result<()> {
    let ok = match spec.kind {
        ParamKind::Str => value.is_string(),
        ParamKind::Int => value.is_i64() || value.is_u64(),
        ParamKind::Number => value.is_number(),
        ParamKind::Bool => value.is_boolean(),
        ParamKind::StrList => {
            value.is_string()
                || value
                    .as_array()
                    .map(|a| a.iter().all(Value::is_string))
                    .unwrap_or(false)
        }
        ParamKind::Any => true,
    };
    if ok {
        Ok(())
    } else {
        Err(SqlFlowError::Configuration(format!(
            "{connector}: parameter '{}' has the wrong type (got {value})",
            spec.name
        )))
    }
}

/// How a source reads on each run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    FullRefresh,
    Incremental,
}

impl SyncMode {
    /// Extract `sync_mode` from a parameter object; absent means full
    /// refresh. `cdc` is a reserved identifier and is rejected.
    pub fn from_params(params: &Value) -> Result<SyncMode> {
        match params.get("sync_mode") {
            None => Ok(SyncMode::FullRefresh),
            Some(Value::String(s)) => s.parse(),
            Some(other) => Err(SqlFlowError::Configuration(format!(
                "sync_mode must be a string, got {other}"
            ))),
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = SqlFlowError;

    fn from_str(s: &str) -> Result<SyncMode> {
        match s {
            "full_refresh" => Ok(SyncMode::FullRefresh),
            "incremental" => Ok(SyncMode::Incremental),
            "cdc" => Err(SqlFlowError::Configuration(
                "sync_mode 'cdc' is reserved for change data capture and not yet implemented"
                    .to_string(),
            )),
            other => Err(SqlFlowError::Configuration(format!(
                "unknown sync_mode '{other}' (accepted: full_refresh, incremental)"
            ))),
        }
    }
}

/// Convenience accessors over the validated parameter map.
pub trait ParamMap {
    fn str_param(&self, name: &str) -> Option<&str>;
    fn bool_param(&self, name: &str, default: bool) -> bool;
    fn int_param(&self, name: &str) -> Option<i64>;
    fn str_list_param(&self, name: &str) -> Vec<String>;
}

impl ParamMap for IndexMap<String, Value> {
    fn str_param(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    fn bool_param(&self, name: &str, default: bool) -> bool {
        self.get(name).and_then(Value::as_bool).unwrap_or(default)
    }

    fn int_param(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    fn str_list_param(&self, name: &str) -> Vec<String> {
        match self.get(name) {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db_schema() -> ParamSchema {
        ParamSchema::new(
            "POSTGRES",
            vec![
                ParamSpec::required("host", ParamKind::Str),
                ParamSpec::optional("port", ParamKind::Int),
                ParamSpec::required("database", ParamKind::Str).with_aliases(&["dbname"]),
                ParamSpec::required("username", ParamKind::Str).with_aliases(&["user"]),
            ],
        )
    }

    #[test]
    fn test_aliases_accepted() {
        let params = json!({"host": "db", "dbname": "analytics", "user": "etl"});
        let validated = db_schema().validate(&params).unwrap();
        assert_eq!(validated.str_param("database"), Some("analytics"));
        assert_eq!(validated.str_param("username"), Some("etl"));
    }

    #[test]
    fn test_canonical_name_wins_over_alias() {
        let params = json!({"host": "db", "database": "new", "dbname": "old", "user": "etl"});
        let validated = db_schema().validate(&params).unwrap();
        assert_eq!(validated.str_param("database"), Some("new"));
    }

    #[test]
    fn test_unknown_parameter_lists_accepted_set() {
        let params = json!({"host": "db", "database": "a", "user": "u", "passwort": "x"});
        let err = db_schema().validate(&params).unwrap_err();
        match err {
            SqlFlowError::UnknownParameter { name, accepted, .. } => {
                assert_eq!(name, "passwort");
                assert!(accepted.contains(&"dbname".to_string()));
            }
            other => panic!("expected unknown parameter error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_required_reports_aliases() {
        let params = json!({"host": "db", "username": "etl"});
        let err = db_schema().validate(&params).unwrap_err();
        assert!(err.to_string().contains("database"));
        assert!(err.to_string().contains("dbname"));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let params = json!({"host": 5, "database": "a", "username": "u"});
        assert!(db_schema().validate(&params).is_err());
    }

    #[test]
    fn test_sync_mode_cdc_reserved() {
        let err = SyncMode::from_params(&json!({"sync_mode": "cdc"})).unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn test_sync_mode_default_full_refresh() {
        assert_eq!(
            SyncMode::from_params(&json!({})).unwrap(),
            SyncMode::FullRefresh
        );
    }
}
