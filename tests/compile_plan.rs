//! Compile-only path: includes, plan artifacts, and determinism laws.

use sqlflow::parser;
use sqlflow::planner::Planner;
use sqlflow::vars::{VarOrigin, VariableManager};

#[test]
fn include_expands_statements_in_place() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("common.sf"),
        r#"SOURCE orders TYPE CSV PARAMS {"path": "orders.csv"};"#,
    )
    .unwrap();

    let src = r#"
INCLUDE 'common.sf';
LOAD orders_raw FROM orders;
"#;
    let pipeline = parser::parse(src, "main").unwrap();
    let mut vars = VariableManager::new();
    let plan = Planner::new(&mut vars)
        .with_base_dir(dir.path())
        .plan(&pipeline)
        .unwrap();
    let ids: Vec<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["source_orders", "load_orders_raw"]);
}

#[test]
fn include_cycle_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.sf"), "INCLUDE 'b.sf';").unwrap();
    std::fs::write(dir.path().join("b.sf"), "INCLUDE 'a.sf';").unwrap();

    let pipeline = parser::parse("INCLUDE 'a.sf';", "main").unwrap();
    let mut vars = VariableManager::new();
    let err = Planner::new(&mut vars)
        .with_base_dir(dir.path())
        .plan(&pipeline)
        .unwrap_err();
    assert!(err.to_string().contains("include cycle"));
}

#[test]
fn plan_artifact_round_trips_through_json() {
    let src = r#"
SOURCE orders TYPE CSV PARAMS {"path": "orders.csv"};
LOAD orders_raw FROM orders;
CREATE TABLE totals AS SELECT customer_id, SUM(amount) AS total FROM orders_raw GROUP BY customer_id;
"#;
    let mut vars = VariableManager::new();
    let plan = sqlflow::compile(src, "daily", &mut vars).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plan.json");
    plan.write_artifact(&path).unwrap();

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(json["pipeline"], "daily");
    let steps = json["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 3);
    assert_eq!(steps[2]["type"], "transform");
    assert_eq!(steps[2]["depends_on"][0], "load_orders_raw");
    assert!(steps[2]["payload"]["sql"]
        .as_str()
        .unwrap()
        .starts_with("SELECT"));
}

#[test]
fn identical_inputs_compile_to_identical_plans() {
    let src = r#"
SET region = 'eu';
SOURCE orders TYPE CSV PARAMS {"path": "data/${region}/orders.csv"};
LOAD orders_raw FROM orders;
"#;
    let compile = || {
        let mut vars = VariableManager::new();
        vars.set("region", "us", VarOrigin::Cli);
        sqlflow::compile(src, "daily", &mut vars).unwrap()
    };
    let first = compile();
    let second = compile();
    assert_eq!(first, second);
    // The CLI override beat the SET statement inside the params payload.
    assert!(first.to_json().unwrap().contains("data/us/orders.csv"));
}

#[test]
fn unresolved_variable_reports_location() {
    let src = "SOURCE s TYPE CSV PARAMS {\"path\": \"${missing_dir}/s.csv\"};";
    let mut vars = VariableManager::new();
    let err = sqlflow::compile(src, "daily", &mut vars).unwrap_err();
    match err {
        sqlflow::SqlFlowError::UnresolvedVariable { missing, locations } => {
            assert_eq!(missing, vec!["missing_dir"]);
            assert_eq!(locations, vec!["daily:1"]);
        }
        other => panic!("expected unresolved variable error, got {other:?}"),
    }
}
