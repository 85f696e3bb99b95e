//! Variable resolution and `${...}` substitution.
//!
//! Variables arrive from four origins with a fixed priority: CLI overrides
//! beat profile values, which beat `SET` statements, which beat the process
//! environment. Within one origin, last write wins. Substitution is a single
//! pass: the output of one substitution is never scanned again.

use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value;

use crate::errors::{Result, SqlFlowError};

/// Where a variable came from. Ordering is priority, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VarOrigin {
    Environment,
    Set,
    Profile,
    Cli,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VarValue {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl VarValue {
    /// Natural text form: numbers without quotes, integral numbers without a
    /// trailing `.0`, booleans as `true`/`false`.
    pub fn render(&self) -> String {
        match self {
            VarValue::Str(s) => s.clone(),
            VarValue::Num(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            VarValue::Bool(b) => b.to_string(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            VarValue::Str(s) => Value::String(s.clone()),
            VarValue::Num(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(n.to_string())),
            VarValue::Bool(b) => Value::Bool(*b),
        }
    }

    /// Scalar JSON values convert; arrays and objects do not.
    pub fn from_json(value: &Value) -> Option<VarValue> {
        match value {
            Value::String(s) => Some(VarValue::Str(s.clone())),
            Value::Number(n) => n.as_f64().map(VarValue::Num),
            Value::Bool(b) => Some(VarValue::Bool(*b)),
            _ => None,
        }
    }
}

impl From<&str> for VarValue {
    fn from(s: &str) -> Self {
        VarValue::Str(s.to_string())
    }
}

impl From<String> for VarValue {
    fn from(s: String) -> Self {
        VarValue::Str(s)
    }
}

impl From<f64> for VarValue {
    fn from(n: f64) -> Self {
        VarValue::Num(n)
    }
}

impl From<bool> for VarValue {
    fn from(b: bool) -> Self {
        VarValue::Bool(b)
    }
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?:\|([^}]*))?\}")
            .expect("placeholder regex is valid")
    })
}

/// Holds one resolved value per variable name.
#[derive(Debug, Default, Clone)]
pub struct VariableManager {
    values: IndexMap<String, (VarValue, VarOrigin)>,
}

impl VariableManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A manager pre-seeded with the process environment (lowest priority).
    /// `.env` files are honored when present.
    pub fn with_environment() -> Self {
        let _ = dotenvy::dotenv();
        let mut mgr = Self::new();
        for (name, value) in std::env::vars() {
            mgr.set(&name, value, VarOrigin::Environment);
        }
        mgr
    }

    /// Record a value. A write only lands when its origin has priority
    /// greater than or equal to the current holder, so within one origin
    /// last write wins and higher-priority origins shadow lower ones.
    pub fn set(&mut self, name: &str, value: impl Into<VarValue>, origin: VarOrigin) {
        let value = value.into();
        match self.values.get(name) {
            Some((_, existing)) if *existing > origin => {}
            _ => {
                self.values.insert(name.to_string(), (value, origin));
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&VarValue> {
        self.values.get(name).map(|(v, _)| v)
    }

    pub fn origin(&self, name: &str) -> Option<VarOrigin> {
        self.values.get(name).map(|(_, o)| *o)
    }

    /// The resolved name → value mapping, in insertion order.
    pub fn resolved(&self) -> IndexMap<String, VarValue> {
        self.values
            .iter()
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect()
    }

    /// Ordered unique references in `text` that have neither a value nor a
    /// default.
    pub fn unresolved_refs(&self, text: &str) -> Vec<String> {
        let mut missing = Vec::new();
        for cap in placeholder_re().captures_iter(text) {
            let name = &cap[1];
            if cap.get(2).is_none() && self.get(name).is_none() && !missing.iter().any(|m| m == name)
            {
                missing.push(name.to_string());
            }
        }
        missing
    }

    /// Substitute every `${name}` / `${name|default}` in `text`. Not
    /// recursive: replacement text is never rescanned.
    pub fn substitute(&self, text: &str) -> Result<String> {
        self.substitute_at(text, "<inline>")
    }

    /// Substitute with a location (`file:line`) for the error report.
    pub fn substitute_at(&self, text: &str, location: &str) -> Result<String> {
        let missing = self.unresolved_refs(text);
        if !missing.is_empty() {
            return Err(SqlFlowError::UnresolvedVariable {
                missing,
                locations: vec![location.to_string()],
            });
        }

        let re = placeholder_re();
        let mut out = String::with_capacity(text.len());
        let mut last_match = 0;
        for cap in re.captures_iter(text) {
            let full = cap.get(0).expect("capture group 0 always present");
            out.push_str(&text[last_match..full.start()]);
            let name = &cap[1];
            match self.get(name) {
                Some(value) => out.push_str(&value.render()),
                None => out.push_str(cap.get(2).map(|m| m.as_str()).unwrap_or_default()),
            }
            last_match = full.end();
        }
        out.push_str(&text[last_match..]);
        Ok(out)
    }

    /// Substitute placeholders in every string leaf of a JSON value. When a
    /// leaf is exactly one placeholder, the replacement keeps its natural
    /// JSON type (numbers stay numbers, booleans stay booleans).
    pub fn substitute_json(&self, value: &Value, location: &str) -> Result<Value> {
        match value {
            Value::String(s) => {
                let re = placeholder_re();
                if let Some(cap) = re.captures(s) {
                    let full = cap.get(0).expect("capture group 0 always present");
                    if full.start() == 0 && full.end() == s.len() {
                        let name = &cap[1];
                        if let Some(v) = self.get(name) {
                            return Ok(v.to_json());
                        }
                        if let Some(default) = cap.get(2) {
                            // A default that parses as a JSON scalar keeps its type.
                            return Ok(match serde_json::from_str::<Value>(default.as_str()) {
                                Ok(v @ (Value::Number(_) | Value::Bool(_))) => v,
                                _ => Value::String(default.as_str().to_string()),
                            });
                        }
                        return Err(SqlFlowError::UnresolvedVariable {
                            missing: vec![name.to_string()],
                            locations: vec![location.to_string()],
                        });
                    }
                }
                Ok(Value::String(self.substitute_at(s, location)?))
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.substitute_json(item, location)?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.substitute_json(v, location)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_cli_beats_profile_beats_set_beats_env() {
        let mut vars = VariableManager::new();
        vars.set("env", "from_env", VarOrigin::Environment);
        vars.set("env", "from_set", VarOrigin::Set);
        assert_eq!(vars.get("env"), Some(&VarValue::Str("from_set".into())));
        vars.set("env", "from_profile", VarOrigin::Profile);
        vars.set("env", "from_env_again", VarOrigin::Environment);
        assert_eq!(vars.get("env"), Some(&VarValue::Str("from_profile".into())));
        vars.set("env", "from_cli", VarOrigin::Cli);
        vars.set("env", "from_profile_again", VarOrigin::Profile);
        assert_eq!(vars.get("env"), Some(&VarValue::Str("from_cli".into())));
    }

    #[test]
    fn test_last_write_wins_within_origin() {
        let mut vars = VariableManager::new();
        vars.set("x", "first", VarOrigin::Set);
        vars.set("x", "second", VarOrigin::Set);
        assert_eq!(vars.get("x"), Some(&VarValue::Str("second".into())));
    }

    #[test]
    fn test_substitute_with_default() {
        let vars = VariableManager::new();
        assert_eq!(
            vars.substitute("region=${region|us-east-1}").unwrap(),
            "region=us-east-1"
        );
    }

    #[test]
    fn test_substitution_is_not_recursive() {
        let mut vars = VariableManager::new();
        vars.set("a", "${b}", VarOrigin::Set);
        vars.set("b", "nope", VarOrigin::Set);
        assert_eq!(vars.substitute("${a}").unwrap(), "${b}");
    }

    #[test]
    fn test_substitute_twice_equals_once_for_plain_values() {
        let mut vars = VariableManager::new();
        vars.set("env", "prod", VarOrigin::Set);
        let once = vars.substitute("env is ${env}").unwrap();
        let twice = vars.substitute(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_unresolved_refs_ordered_unique() {
        let vars = VariableManager::new();
        let missing = vars.unresolved_refs("${b} ${a} ${b} ${c|dflt}");
        assert_eq!(missing, vec!["b", "a"]);
    }

    #[test]
    fn test_numbers_render_without_quotes_in_json() {
        let mut vars = VariableManager::new();
        vars.set("port", 5432.0, VarOrigin::Profile);
        let input: Value = serde_json::json!({"port": "${port}", "host": "db-${port}"});
        let out = vars.substitute_json(&input, "t:1").unwrap();
        assert_eq!(out["port"], serde_json::json!(5432.0));
        assert_eq!(out["host"], "db-5432");
    }

    #[test]
    fn test_unresolved_error_lists_location() {
        let vars = VariableManager::new();
        let err = vars.substitute_at("${missing}", "etl.sf:12").unwrap_err();
        match err {
            SqlFlowError::UnresolvedVariable { missing, locations } => {
                assert_eq!(missing, vec!["missing"]);
                assert_eq!(locations, vec!["etl.sf:12"]);
            }
            other => panic!("expected unresolved variable error, got {other:?}"),
        }
    }
}
