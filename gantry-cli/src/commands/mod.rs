pub mod plan;
pub mod run;
pub mod validate;

use crate::output;

use std::collections::HashMap;
use std::path::Path;

use gantry_engine::{
    DefinitionParser, EngineError, EngineResult, ExecutionPlan, PipelineDefinition, PlanBuilder, Value,
};

/// Exit status for definition, plan and config errors
pub const CONFIGURATION_EXIT: i32 = 2;

/// Parse `--var name=value` flags.
///
/// `true`/`false` and numbers keep their type so `if: variables.x` and
/// comparisons behave as they would for values written in the file.
pub fn parse_variables(raw: &[String]) -> EngineResult<HashMap<String, Value>> {
    let mut variables = HashMap::new();
    for entry in raw {
        let Some((name, value)) = entry.split_once('=') else {
            return Err(EngineError::Config(format!(
                "invalid variable '{}', expected name=value",
                entry
            )));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::Config(format!("variable '{}' has no name", entry)));
        }
        variables.insert(name.to_string(), parse_value(value));
    }
    Ok(variables)
}

fn parse_value(raw: &str) -> Value {
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => match raw.parse::<f64>() {
            Ok(n) if n.is_finite() => Value::Number(n),
            _ => Value::String(raw.to_string()),
        },
    }
}

/// Load a definition and build its plan with CLI variable overrides
pub fn load_plan(path: &Path, variables: &[String]) -> EngineResult<(PipelineDefinition, ExecutionPlan)> {
    if !path.exists() {
        return Err(EngineError::Config(format!(
            "pipeline file not found: {}",
            path.display()
        )));
    }
    let overrides = parse_variables(variables)?;
    let definition = DefinitionParser::from_file(path)?;
    let plan = PlanBuilder::new(&definition).with_variables(overrides).build()?;
    Ok((definition, plan))
}

/// Report an engine error and pick the exit status for it
pub fn report_error(error: &EngineError) -> i32 {
    output::error(&error.to_string());
    if error.is_configuration() {
        CONFIGURATION_EXIT
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_variables_keeps_scalar_types() {
        let vars = parse_variables(&[
            "publish=false".to_string(),
            "shards=4".to_string(),
            "branch=release/1.0".to_string(),
            "query=a=b".to_string(),
        ])
        .unwrap();
        assert_eq!(vars["publish"], Value::Bool(false));
        assert_eq!(vars["shards"], Value::Number(4.0));
        assert_eq!(vars["branch"], Value::String("release/1.0".into()));
        assert_eq!(vars["query"], Value::String("a=b".into()));
    }

    #[test]
    fn test_parse_variables_rejects_missing_equals() {
        let err = parse_variables(&["branch".to_string()]).unwrap_err();
        assert!(err.is_configuration());
        assert!(parse_variables(&["=x".to_string()]).is_err());
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = load_plan(Path::new("/definitely/not/here.yml"), &[]).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_load_plan_applies_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ci.yml");
        std::fs::write(
            &path,
            "variables:\n  deploy: true\njobs:\n  ship:\n    when: variables.deploy\n    steps:\n      - run: ./ship\n",
        )
        .unwrap();

        let (_, plan) = load_plan(&path, &[]).unwrap();
        assert_eq!(plan.len(), 1);
        let (_, plan) = load_plan(&path, &["deploy=false".to_string()]).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.gated(), ["ship".to_string()]);
    }
}
