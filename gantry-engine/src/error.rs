// Engine Errors
// Configuration-time and load-time error types shared across the engine

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Error raised while turning a definition into an execution plan.
///
/// Every plan error is fatal: the run aborts before any job starts.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanError {
    pub message: String,
    pub kind: PlanErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanErrorKind {
    CyclicDependency,
    UnknownDependency,
    InvalidMatrix,
    InvalidCondition,
    UnknownResource,
    UnsatisfiedRequirement,
    InvalidDefinition,
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for PlanError {}

impl PlanError {
    pub fn cyclic(path: &[String]) -> Self {
        Self {
            message: format!("circular dependency detected: {}", path.join(" -> ")),
            kind: PlanErrorKind::CyclicDependency,
        }
    }

    pub fn unknown_dependency(job: &str, dependency: &str) -> Self {
        Self {
            message: format!("job '{}' needs unknown job '{}'", job, dependency),
            kind: PlanErrorKind::UnknownDependency,
        }
    }

    pub fn invalid_matrix(job: &str, message: impl fmt::Display) -> Self {
        Self {
            message: format!("job '{}' has an invalid matrix: {}", job, message),
            kind: PlanErrorKind::InvalidMatrix,
        }
    }

    pub fn invalid_condition(location: &str, message: impl fmt::Display) -> Self {
        Self {
            message: format!("{}: {}", location, message),
            kind: PlanErrorKind::InvalidCondition,
        }
    }

    pub fn unknown_resource(job: &str, scope: &str) -> Self {
        Self {
            message: format!("job '{}' leases unknown resource scope '{}'", job, scope),
            kind: PlanErrorKind::UnknownResource,
        }
    }

    pub fn unsatisfied_requirement(job: &str, tags: &[String]) -> Self {
        Self {
            message: format!(
                "job '{}' requires [{}] but no resource scope carries all of those labels",
                job,
                tags.join(", ")
            ),
            kind: PlanErrorKind::UnsatisfiedRequirement,
        }
    }

    pub fn invalid_definition(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: PlanErrorKind::InvalidDefinition,
        }
    }
}

/// Error raised while loading a pipeline definition or an engine config file.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("{0}")]
    Plan(#[from] PlanError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this error belongs to the configuration class (exit status 2).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EngineError::Definition(_) | EngineError::Plan(_) | EngineError::Config(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
