// Definition Parser
// Loads pipeline definitions from YAML and checks their shape

use crate::config::minutes_to_duration;
use crate::definition::models::PipelineDefinition;
use crate::error::{DefinitionError, EngineError, PlanError};

use std::collections::HashSet;
use std::path::Path;

pub struct DefinitionParser;

impl DefinitionParser {
    /// Read, parse and validate a definition file
    pub fn from_file(path: impl AsRef<Path>) -> Result<PipelineDefinition, EngineError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| DefinitionError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut definition = Self::parse(&content)?;
        if definition.name.is_none() {
            definition.name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string);
        }
        Ok(definition)
    }

    /// Parse and validate definition YAML
    pub fn parse(content: &str) -> Result<PipelineDefinition, EngineError> {
        let mut definition: PipelineDefinition =
            serde_yaml::from_str(content).map_err(DefinitionError::from)?;
        definition.assign_names();
        Self::validate(&definition)?;
        Ok(definition)
    }

    /// Structural checks that do not need the dependency graph
    pub fn validate(definition: &PipelineDefinition) -> Result<(), PlanError> {
        if definition.jobs.is_empty() {
            return Err(PlanError::invalid_definition("pipeline declares no jobs"));
        }

        if definition.concurrency == Some(0) {
            return Err(PlanError::invalid_definition("concurrency must be at least 1"));
        }

        for scope in definition.resources.values() {
            if scope.capacity == 0 {
                return Err(PlanError::invalid_definition(format!(
                    "resource scope '{}' must have a capacity of at least 1",
                    scope.name
                )));
            }
        }

        for job in definition.jobs.values() {
            if job.steps.is_empty() {
                return Err(PlanError::invalid_definition(format!(
                    "job '{}' has no steps",
                    job.name
                )));
            }
            if job.max_parallel == Some(0) {
                return Err(PlanError::invalid_definition(format!(
                    "job '{}' max-parallel must be at least 1",
                    job.name
                )));
            }

            let mut seen = HashSet::new();
            for (index, step) in job.steps.iter().enumerate() {
                let key = step.key(index);
                if !seen.insert(key.clone()) {
                    return Err(PlanError::invalid_definition(format!(
                        "job '{}' declares step id '{}' more than once",
                        job.name, key
                    )));
                }
                match (&step.run, &step.uses) {
                    (Some(_), None) | (None, Some(_)) => {}
                    (Some(_), Some(_)) => {
                        return Err(PlanError::invalid_definition(format!(
                            "step '{}' in job '{}' sets both 'run' and 'uses'",
                            key, job.name
                        )))
                    }
                    (None, None) => {
                        return Err(PlanError::invalid_definition(format!(
                            "step '{}' in job '{}' needs either 'run' or 'uses'",
                            key, job.name
                        )))
                    }
                }
                if let Some(minutes) = step.timeout_minutes {
                    if minutes <= 0.0 || !minutes.is_finite() {
                        return Err(PlanError::invalid_definition(format!(
                            "step '{}' in job '{}' has a non-positive timeout",
                            key, job.name
                        )));
                    }
                    if minutes_to_duration(minutes).is_none() {
                        return Err(PlanError::invalid_definition(format!(
                            "step '{}' in job '{}' has an out-of-range timeout of {} minutes",
                            key, job.name, minutes
                        )));
                    }
                }
            }

            if let Some(cache) = &job.cache {
                if cache.key.trim().is_empty() {
                    return Err(PlanError::invalid_definition(format!(
                        "job '{}' declares a cache without a key",
                        job.name
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlanErrorKind;

    const SAMPLE: &str = r#"
name: ci
variables:
  branch: main
resources:
  farm:
    labels: [linux]
    acquire: ./up.sh
    release: ./down.sh
jobs:
  lint:
    steps:
      - run: cargo clippy
  build:
    needs: lint
    requires: [linux]
    matrix:
      os: [linux, macos]
    cache:
      key: "cargo-${{ matrix.os }}"
      restore-keys: ["cargo-"]
      paths: [target]
    steps:
      - id: compile
        run: cargo build
        timeout-minutes: 30
      - uses: upload
        with:
          name: bin
"#;

    #[test]
    fn test_parse_sample() {
        let def = DefinitionParser::parse(SAMPLE).unwrap();
        assert_eq!(def.name.as_deref(), Some("ci"));
        assert_eq!(def.jobs.keys().collect::<Vec<_>>(), vec!["lint", "build"]);

        let build = def.job("build").unwrap();
        assert_eq!(build.name, "build");
        assert_eq!(build.needs.names(), vec!["lint"]);
        assert_eq!(build.steps[0].key(0), "compile");
        assert_eq!(build.steps[1].key(1), "step-2");
        assert_eq!(build.steps[0].timeout_minutes, Some(30.0));
        assert_eq!(build.cache.as_ref().unwrap().restore_keys, vec!["cargo-"]);

        let farm = def.resource("farm").unwrap();
        assert_eq!(farm.name, "farm");
        assert_eq!(farm.capacity, 1);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = "jobs:\n  a:\n    stepz: []\n";
        let err = DefinitionParser::parse(yaml).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_step_needs_one_action() {
        let yaml = "jobs:\n  a:\n    steps:\n      - name: nothing\n";
        match DefinitionParser::parse(yaml) {
            Err(EngineError::Plan(err)) => assert_eq!(err.kind, PlanErrorKind::InvalidDefinition),
            other => panic!("expected plan error, got {:?}", other),
        }
    }

    #[test]
    fn test_out_of_range_timeout_rejected() {
        for minutes in ["1e300", ".inf", "0"] {
            let yaml = format!("jobs:\n  a:\n    steps:\n      - run: x\n        timeout-minutes: {}\n", minutes);
            match DefinitionParser::parse(&yaml) {
                Err(EngineError::Plan(err)) => assert_eq!(err.kind, PlanErrorKind::InvalidDefinition),
                other => panic!("expected plan error for {}, got {:?}", minutes, other),
            }
        }
    }

    #[test]
    fn test_duplicate_step_ids_rejected() {
        let yaml = r#"
jobs:
  a:
    steps:
      - id: x
        run: echo 1
      - id: x
        run: echo 2
"#;
        assert!(DefinitionParser::parse(yaml).is_err());
    }

    #[test]
    fn test_from_file_defaults_name_to_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nightly.yml");
        std::fs::write(&path, "jobs:\n  a:\n    steps:\n      - run: echo hi\n").unwrap();

        let def = DefinitionParser::from_file(&path).unwrap();
        assert_eq!(def.name.as_deref(), Some("nightly"));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = DefinitionParser::from_file("/nonexistent/gantry.yml").unwrap_err();
        assert!(matches!(
            err,
            EngineError::Definition(DefinitionError::Read { .. })
        ));
    }
}
