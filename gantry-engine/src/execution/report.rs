// Run Report
// Per-instance records, run warnings and the aggregate outcome

use crate::execution::instance::{FailureCause, InstanceId, JobInstance, JobStatus, StepOutcome};
use crate::lease::LeaseState;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Structured record emitted once per instance when it reaches a terminal state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub instance_id: InstanceId,
    pub template: String,
    pub label: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
    pub step_outcomes: Vec<StepOutcome>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn from_instance(instance: &JobInstance) -> Self {
        Self {
            instance_id: instance.id,
            template: instance.template_name.clone(),
            label: instance.label.clone(),
            status: instance.status,
            cause: instance.cause.clone(),
            step_outcomes: instance.steps.clone(),
            start_time: instance.started_at,
            end_time: instance.finished_at,
        }
    }
}

/// Destination for job records
pub trait RecordSink: Send + Sync {
    fn record(&self, record: &JobRecord) -> std::io::Result<()>;
}

/// Writes one JSON object per line
pub struct JsonLinesSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    /// Append to `path`, creating it if needed
    pub fn append(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file: File = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl RecordSink for JsonLinesSink {
    fn record(&self, record: &JobRecord) -> std::io::Result<()> {
        let line = serde_json::to_string(record)?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", line)?;
        writer.flush()
    }
}

/// Keeps records in memory
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<JobRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<JobRecord> {
        self.records.lock().clone()
    }
}

impl RecordSink for MemorySink {
    fn record(&self, record: &JobRecord) -> std::io::Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Aborted,
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Succeeded => 0,
            RunOutcome::Failed => 1,
            RunOutcome::Aborted => 130,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Non-fatal problem reported alongside the outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RunWarning {
    CleanupFailure { scope: String, reason: String },
    CacheFailure { instance: String, reason: String },
    RecordFailure { reason: String },
}

impl fmt::Display for RunWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunWarning::CleanupFailure { scope, reason } => {
                write!(f, "failed to release lease for scope '{}': {}", scope, reason)
            }
            RunWarning::CacheFailure { instance, reason } => {
                write!(f, "cache problem in {}: {}", instance, reason)
            }
            RunWarning::RecordFailure { reason } => {
                write!(f, "failed to write job record: {}", reason)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureSummary {
    pub instance_id: InstanceId,
    pub name: String,
    pub status: JobStatus,
    pub cause: Option<FailureCause>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub pipeline: String,
    pub outcome: RunOutcome,
    pub records: Vec<JobRecord>,
    /// Every instance that did not end Succeeded, in arena order
    pub failures: Vec<FailureSummary>,
    pub warnings: Vec<RunWarning>,
    pub leases: Vec<(String, LeaseState)>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    pub fn record(&self, id: InstanceId) -> Option<&JobRecord> {
        self.records.iter().find(|r| r.instance_id == id)
    }

    /// Records for all instances of one template
    pub fn records_for<'a>(&'a self, template: &'a str) -> impl Iterator<Item = &'a JobRecord> + 'a {
        self.records.iter().filter(move |r| r.template == template)
    }
}
