//! Profile loading.
//!
//! A profile is a YAML document carrying environment-specific variables and
//! named connector configurations. Parsing happens here; the core only ever
//! sees the resolved structure.

use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

use crate::errors::Result;
use crate::vars::{VarOrigin, VarValue, VariableManager};

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorProfile {
    #[serde(rename = "type")]
    pub connector_type: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub variables: IndexMap<String, Value>,
    #[serde(default)]
    pub connectors: IndexMap<String, ConnectorProfile>,
}

impl Profile {
    pub fn from_yaml(text: &str) -> Result<Profile> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Profile> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    /// Feed profile variables into a manager at profile priority. Values
    /// that are not scalars are skipped; connectors carry structured data,
    /// variables do not.
    pub fn apply_variables(&self, vars: &mut VariableManager) {
        for (name, value) in &self.variables {
            if let Some(v) = VarValue::from_json(value) {
                vars.set(name, v, VarOrigin::Profile);
            }
        }
    }

    pub fn connector(&self, name: &str) -> Option<&ConnectorProfile> {
        self.connectors.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r#"
variables:
  env: prod
  workers: 8
connectors:
  warehouse:
    type: POSTGRES
    params:
      host: db.internal
      dbname: analytics
      user: etl
"#;

    #[test]
    fn test_profile_parses_variables_and_connectors() {
        let profile = Profile::from_yaml(PROFILE).unwrap();
        assert_eq!(profile.variables["env"], "prod");
        let warehouse = profile.connector("warehouse").unwrap();
        assert_eq!(warehouse.connector_type, "POSTGRES");
        assert_eq!(warehouse.params["dbname"], "analytics");
    }

    #[test]
    fn test_profile_variables_take_profile_priority() {
        let profile = Profile::from_yaml(PROFILE).unwrap();
        let mut vars = VariableManager::new();
        vars.set("env", "from_set", VarOrigin::Set);
        profile.apply_variables(&mut vars);
        assert_eq!(vars.get("env"), Some(&VarValue::Str("prod".into())));
        assert_eq!(vars.get("workers"), Some(&VarValue::Num(8.0)));
    }
}
