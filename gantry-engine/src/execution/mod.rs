// Execution Engine Module
// Matrix expansion, planning, job execution and scheduling

pub mod cancel;
pub mod events;
pub mod executor;
pub mod graph;
pub mod instance;
pub mod matrix;
pub mod orchestrator;
pub mod report;

pub use cancel::CancellationSignal;
pub use events::{progress_channel, EventSender, ExecutionEvent, ProgressReceiver, ProgressSender};
pub use executor::{JobExecutor, JobRun, JobSpec};
pub use graph::{ExecutionPlan, PlanBuilder, PlannedTemplate};
pub use instance::{FailureCause, InstanceId, JobInstance, JobStatus, StepOutcome, StepStatus};
pub use matrix::{MatrixExpander, MatrixInstance};
pub use orchestrator::Orchestrator;
pub use report::{
    FailureSummary, JobRecord, JsonLinesSink, MemorySink, RecordSink, RunOutcome, RunReport, RunWarning,
};
