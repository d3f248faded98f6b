// Output formatting helpers for CLI commands

use gantry_engine::execution::{ExecutionEvent, JobStatus, ProgressReceiver, StepStatus};
use gantry_engine::{LeaseState, RunOutcome, RunReport};

/// Print a status message: "  Status message"
pub fn status(action: &str, message: &str) {
    eprintln!("\x1b[1;36m{:>12}\x1b[0m {}", action, message);
}

/// Print a success message with checkmark
pub fn success(message: &str) {
    eprintln!("\x1b[1;32m  \u{2713}\x1b[0m {}", message);
}

/// Print a failure message with X
pub fn failure(message: &str) {
    eprintln!("\x1b[1;31m  \u{2717}\x1b[0m {}", message);
}

/// Print a check/pass item
pub fn check(message: &str) {
    eprintln!("\x1b[32m  \u{2713}\x1b[0m {}", message);
}

pub fn warning(message: &str) {
    eprintln!("\x1b[33m  !\x1b[0m {}", message);
}

pub fn error(message: &str) {
    eprintln!("\x1b[1;31merror:\x1b[0m {}", message);
}

pub fn info(message: &str) {
    eprintln!("\x1b[36m  i\x1b[0m {}", message);
}

pub fn dim(message: &str) {
    eprintln!("\x1b[2m{}\x1b[0m", message);
}

pub fn dim_success(message: &str) {
    eprintln!("\x1b[32m{}\x1b[0m", message);
}

pub fn dim_failure(message: &str) {
    eprintln!("\x1b[31m{}\x1b[0m", message);
}

/// Print step output (indented)
pub fn step_output(line: &str) {
    println!("        | {}", line);
}

/// Print step error output (indented, red)
pub fn step_error(line: &str) {
    eprintln!("\x1b[31m        | {}\x1b[0m", line);
}

pub fn header(message: &str) {
    eprintln!("\x1b[1m==> {}\x1b[0m", message);
}

fn job_symbol(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Succeeded => "OK",
        JobStatus::Failed => "FAIL",
        JobStatus::Skipped => "SKIP",
        JobStatus::Cancelled => "CANCELLED",
        _ => "DONE",
    }
}

fn step_symbol(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Succeeded => "OK",
        StepStatus::Failed => "FAIL",
        StepStatus::Skipped => "SKIP",
        StepStatus::Cancelled => "CANCELLED",
    }
}

/// Print events until every sender is gone
pub async fn render_events(mut rx: ProgressReceiver) {
    while let Some(event) = rx.recv().await {
        render_event(&event);
    }
}

pub fn render_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::RunStarted { pipeline, total_jobs } => {
            println!();
            header(&format!("Pipeline '{}' ({} jobs)", pipeline, total_jobs));
        }

        ExecutionEvent::RunCompleted {
            outcome, duration, ..
        } => {
            println!();
            let message = format!("Run {} after {:.2}s", outcome, duration.as_secs_f64());
            match outcome {
                RunOutcome::Succeeded => success(&message),
                RunOutcome::Failed => failure(&message),
                RunOutcome::Aborted => warning(&message),
            }
        }

        ExecutionEvent::JobStarted {
            instance,
            name,
            total_steps,
        } => {
            println!("    Job {} '{}' ({} steps)", instance, name, total_steps);
        }

        ExecutionEvent::JobCompleted {
            name,
            status,
            duration,
            ..
        } => {
            let line = format!(
                "    Job '{}' {} ({:.2}s)",
                name,
                job_symbol(*status),
                duration.as_secs_f64()
            );
            if *status == JobStatus::Succeeded {
                dim_success(&line);
            } else {
                dim_failure(&line);
            }
        }

        ExecutionEvent::JobSettled {
            name, status, reason, ..
        } => {
            let line = format!("    Job '{}' {}: {}", name, job_symbol(*status), reason);
            match status {
                JobStatus::Skipped => dim(&line),
                JobStatus::Failed => dim_failure(&line),
                _ => warning(line.trim_start()),
            }
        }

        ExecutionEvent::StepStarted {
            name, step_index, ..
        } => {
            println!("      [Step {}] {}", step_index + 1, name);
        }

        ExecutionEvent::StepOutput { line, is_error, .. } => {
            for line in line.lines() {
                if *is_error {
                    step_error(line);
                } else {
                    step_output(line);
                }
            }
        }

        ExecutionEvent::StepCompleted {
            status,
            duration,
            error,
            ..
        } => {
            let detail = match error {
                Some(reason) => format!(": {}", reason),
                None => String::new(),
            };
            let line = format!(
                "        {} ({:.2}s){}",
                step_symbol(*status),
                duration.as_secs_f64(),
                detail
            );
            match status {
                StepStatus::Succeeded => dim_success(&line),
                StepStatus::Failed => dim_failure(&line),
                _ => println!("{}", line),
            }
        }

        ExecutionEvent::StepSkipped {
            step_id, step_index, ..
        } => {
            dim(&format!("      [Step {}] {} skipped", step_index + 1, step_id));
        }

        ExecutionEvent::CacheRestored { key, exact, .. } => {
            let kind = if *exact { "exact" } else { "fallback" };
            dim(&format!("      [cache] restored {} ({})", key, kind));
        }

        ExecutionEvent::CacheMissed { key, .. } => {
            dim(&format!("      [cache] miss for {}", key));
        }

        ExecutionEvent::CacheSaved { key, .. } => {
            dim(&format!("      [cache] saved {}", key));
        }

        ExecutionEvent::LeaseChanged { scope, state } => match state {
            LeaseState::AcquireFailed | LeaseState::ReleaseFailed => {
                warning(&format!("Lease '{}' {}", scope, state));
            }
            _ => dim(&format!("  [lease] {} {}", scope, state)),
        },

        ExecutionEvent::Warning { message } => warning(message),
    }
}

/// Final summary: every instance that did not succeed, then warnings
pub fn report(report: &RunReport) {
    println!();
    status(
        "Summary",
        &format!(
            "{} succeeded, {} failed, {} cancelled, {} skipped",
            report.count(JobStatus::Succeeded),
            report.count(JobStatus::Failed),
            report.count(JobStatus::Cancelled),
            report.count(JobStatus::Skipped),
        ),
    );

    for summary in &report.failures {
        let cause = summary
            .cause
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "no cause recorded".to_string());
        let line = format!("{} {} {}: {}", summary.instance_id, summary.name, summary.status, cause);
        if summary.status == JobStatus::Skipped {
            dim(&format!("  {}", line));
        } else {
            failure(&line);
        }
    }

    for warning_item in &report.warnings {
        warning(&warning_item.to_string());
    }

    match report.outcome {
        RunOutcome::Succeeded => success("Run succeeded"),
        RunOutcome::Failed => failure("Run failed"),
        RunOutcome::Aborted => warning("Run aborted"),
    }
}
