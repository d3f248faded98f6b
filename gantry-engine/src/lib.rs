// Gantry Engine Library
// Orchestration engine for declarative job graphs

pub mod cache;
pub mod condition;
pub mod config;
pub mod definition;
pub mod error;
pub mod execution;
pub mod lease;
pub mod runners;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::{CacheBackendKind, EngineConfig};
pub use error::{DefinitionError, EngineError, EngineResult, PlanError, PlanErrorKind};

// Re-export definition types
pub use definition::{DefinitionParser, JobTemplate, PipelineDefinition, ResourceScopeSpec, Value};

// Re-export condition types
pub use condition::{Condition, EvalError, StatusSnapshot};

// Re-export cache types
pub use cache::{CacheBackend, CacheError, CacheResolver, FileSystemCache, JsonArchiver, MemoryCache};

// Re-export lease types
pub use lease::{CommandProvider, LeaseError, LeaseHandle, LeaseState, ResourceProvider};

// Re-export execution types
pub use execution::{
    progress_channel, CancellationSignal, ExecutionEvent, ExecutionPlan, FailureCause, InstanceId,
    JobRecord, JobStatus, JsonLinesSink, MatrixExpander, Orchestrator, PlanBuilder, ProgressReceiver,
    ProgressSender, RecordSink, RunOutcome, RunReport, RunWarning,
};

// Re-export runner types
pub use runners::{ActionRegistry, ActionResult, ShellAction, StepAction, StepContext};
