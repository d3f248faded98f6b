// Execution Events
// Progress events streamed to front-ends while a run executes

use crate::execution::instance::{InstanceId, JobStatus, StepStatus};
use crate::execution::report::RunOutcome;
use crate::lease::LeaseState;

use std::time::Duration;
use tokio::sync::mpsc;

pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    RunStarted {
        pipeline: String,
        total_jobs: usize,
    },

    RunCompleted {
        pipeline: String,
        outcome: RunOutcome,
        duration: Duration,
    },

    JobStarted {
        instance: InstanceId,
        name: String,
        total_steps: usize,
    },

    JobCompleted {
        instance: InstanceId,
        name: String,
        status: JobStatus,
        duration: Duration,
    },

    /// A job reached a terminal state without running
    JobSettled {
        instance: InstanceId,
        name: String,
        status: JobStatus,
        reason: String,
    },

    StepStarted {
        instance: InstanceId,
        step_id: String,
        name: String,
        step_index: usize,
    },

    StepOutput {
        instance: InstanceId,
        step_id: String,
        line: String,
        is_error: bool,
    },

    StepCompleted {
        instance: InstanceId,
        step_id: String,
        step_index: usize,
        status: StepStatus,
        duration: Duration,
        error: Option<String>,
    },

    StepSkipped {
        instance: InstanceId,
        step_id: String,
        step_index: usize,
    },

    CacheRestored {
        instance: InstanceId,
        key: String,
        exact: bool,
    },

    CacheMissed {
        instance: InstanceId,
        key: String,
    },

    CacheSaved {
        instance: InstanceId,
        key: String,
    },

    LeaseChanged {
        scope: String,
        state: LeaseState,
    },

    Warning {
        message: String,
    },
}

impl ExecutionEvent {
    pub fn run_started(pipeline: impl Into<String>, total_jobs: usize) -> Self {
        Self::RunStarted {
            pipeline: pipeline.into(),
            total_jobs,
        }
    }

    pub fn run_completed(pipeline: impl Into<String>, outcome: RunOutcome, duration: Duration) -> Self {
        Self::RunCompleted {
            pipeline: pipeline.into(),
            outcome,
            duration,
        }
    }

    pub fn job_started(instance: InstanceId, name: impl Into<String>, total_steps: usize) -> Self {
        Self::JobStarted {
            instance,
            name: name.into(),
            total_steps,
        }
    }

    pub fn job_completed(
        instance: InstanceId,
        name: impl Into<String>,
        status: JobStatus,
        duration: Duration,
    ) -> Self {
        Self::JobCompleted {
            instance,
            name: name.into(),
            status,
            duration,
        }
    }

    pub fn job_settled(
        instance: InstanceId,
        name: impl Into<String>,
        status: JobStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self::JobSettled {
            instance,
            name: name.into(),
            status,
            reason: reason.into(),
        }
    }

    pub fn step_output(
        instance: InstanceId,
        step_id: impl Into<String>,
        line: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::StepOutput {
            instance,
            step_id: step_id.into(),
            line: line.into(),
            is_error,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::Warning {
            message: message.into(),
        }
    }
}

/// Fire-and-forget sending; a dropped receiver is not an error
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
