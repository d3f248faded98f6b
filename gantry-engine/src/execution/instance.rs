// Job Instances
// Arena entries for concrete jobs and their status model

use crate::definition::Value;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Handle of a job instance in the plan arena
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct InstanceId(pub usize);

impl InstanceId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Pending,
    Blocked,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped | JobStatus::Cancelled
        )
    }

    /// Terminal states that let dependents proceed under `success()`
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Skipped)
    }

    /// Value of `needs.<job>.result`
    pub fn result_name(self) -> &'static str {
        match self {
            JobStatus::Succeeded => "success",
            JobStatus::Failed => "failure",
            JobStatus::Skipped => "skipped",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Pending | JobStatus::Blocked | JobStatus::Ready | JobStatus::Running => {
                "pending"
            }
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    /// Value of `steps.<id>.outcome`
    pub fn outcome_name(self) -> &'static str {
        match self {
            StepStatus::Succeeded => "success",
            StepStatus::Failed => "failure",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        }
    }
}

/// Recorded result of one step
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub step_id: String,
    pub name: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub continue_on_error: bool,
    pub duration_ms: u64,
}

/// Why an instance ended in a state other than Succeeded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FailureCause {
    StepFailure { step: String, reason: String },
    ResourceUnavailable { scope: String, reason: String },
    UpstreamFailed { upstream: String },
    ConditionFalse,
    ConditionError { reason: String },
    Aborted,
    Internal { reason: String },
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::StepFailure { step, reason } => {
                write!(f, "step '{}' failed: {}", step, reason)
            }
            FailureCause::ResourceUnavailable { scope, reason } => {
                write!(f, "resource scope '{}' unavailable: {}", scope, reason)
            }
            FailureCause::UpstreamFailed { upstream } => {
                write!(f, "upstream job {} did not succeed", upstream)
            }
            FailureCause::ConditionFalse => f.write_str("condition evaluated to false"),
            FailureCause::ConditionError { reason } => {
                write!(f, "condition could not be evaluated: {}", reason)
            }
            FailureCause::Aborted => f.write_str("run aborted"),
            FailureCause::Internal { reason } => write!(f, "internal error: {}", reason),
        }
    }
}

/// A concrete job: one template at one matrix point
#[derive(Debug, Clone)]
pub struct JobInstance {
    pub id: InstanceId,
    /// Index of the template in the plan
    pub template: usize,
    pub template_name: String,
    pub label: String,
    pub bindings: Vec<(String, Value)>,
    /// Upstream instances, deduplicated, in arena order
    pub needs: Vec<InstanceId>,
    pub dependents: Vec<InstanceId>,
    /// Lease scope index in the plan, if the job is bound to one
    pub scope: Option<usize>,
    pub status: JobStatus,
    pub cause: Option<FailureCause>,
    pub steps: Vec<StepOutcome>,
    pub outputs: HashMap<String, String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobInstance {
    pub fn display_name(&self) -> String {
        if self.label.is_empty() {
            self.template_name.clone()
        } else {
            format!("{} ({})", self.template_name, self.label)
        }
    }

    pub fn matrix(&self) -> HashMap<String, Value> {
        self.bindings.iter().cloned().collect()
    }

    pub fn binding(&self, axis: &str) -> Option<&Value> {
        self.bindings
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, v)| v)
    }
}
