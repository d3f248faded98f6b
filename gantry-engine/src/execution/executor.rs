// Job Executor
// Runs the ordered steps of one job instance

use crate::cache::{CacheKeyRenderer, CacheResolver, SaveOutcome};
use crate::condition::{NeedView, StatusSnapshot, StepView};
use crate::config::minutes_to_duration;
use crate::definition::{StepDefinition, Value};
use crate::execution::cancel::CancellationSignal;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::graph::PlannedTemplate;
use crate::execution::instance::{FailureCause, InstanceId, JobStatus, StepOutcome, StepStatus};
use crate::execution::report::RunWarning;
use crate::runners::{ActionRegistry, ActionResult, ActionStatus, StepContext};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pseudo step id under which cache restore results are visible
pub const CACHE_STEP_ID: &str = "cache";

/// Input for one job run
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub instance: InstanceId,
    pub template: Arc<PlannedTemplate>,
    pub label: String,
    pub matrix: HashMap<String, Value>,
    pub variables: HashMap<String, Value>,
    pub needs: HashMap<String, NeedView>,
    pub secrets: HashMap<String, String>,
}

impl JobSpec {
    fn display_name(&self) -> String {
        if self.label.is_empty() {
            self.template.name().to_string()
        } else {
            format!("{} ({})", self.template.name(), self.label)
        }
    }
}

/// Result of one job run
#[derive(Debug, Clone)]
pub struct JobRun {
    pub instance: InstanceId,
    pub status: JobStatus,
    pub cause: Option<FailureCause>,
    pub steps: Vec<StepOutcome>,
    pub outputs: HashMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub warnings: Vec<RunWarning>,
}

enum StepEnd {
    Finished(ActionResult),
    Cancelled,
}

/// Restore state carried to the save phase
struct CacheState {
    primary: String,
    exact: bool,
}

#[derive(Clone)]
pub struct JobExecutor {
    actions: Arc<ActionRegistry>,
    cache: Option<Arc<CacheResolver>>,
    working_dir: PathBuf,
    default_timeout: Option<Duration>,
    cancel_grace: Duration,
    events: Option<ProgressSender>,
}

impl JobExecutor {
    pub fn new(actions: Arc<ActionRegistry>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            actions,
            cache: None,
            working_dir: working_dir.into(),
            default_timeout: None,
            cancel_grace: Duration::from_secs(10),
            events: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<CacheResolver>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_progress(mut self, tx: Option<ProgressSender>) -> Self {
        self.events = tx;
        self
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub async fn run(&self, spec: JobSpec, cancel: CancellationSignal) -> JobRun {
        let started_at = Utc::now();
        let clock = Instant::now();
        let name = spec.display_name();
        let definition = &spec.template.definition;
        let job_env = definition.env.clone();
        let mut warnings = Vec::new();

        tracing::info!(instance = %spec.instance, job = %name, "job started");
        self.events
            .send_event(ExecutionEvent::job_started(spec.instance, name.as_str(), definition.steps.len()));

        let mut views: HashMap<String, StepView> = HashMap::new();
        let mut job_outputs: HashMap<String, String> = HashMap::new();
        let cache_state = self.restore_cache(&spec, &job_env, &name, &mut views, &mut warnings).await;
        if let Some(view) = views.get(CACHE_STEP_ID) {
            job_outputs.extend(view.outputs.clone());
        }

        let mut outcomes = Vec::with_capacity(definition.steps.len());
        let mut failure: Option<FailureCause> = None;
        let mut cancelled = false;

        for (index, step) in definition.steps.iter().enumerate() {
            let key = step.key(index);
            cancelled = cancelled || cancel.is_cancelled();

            let snapshot = StatusSnapshot {
                failed: failure.is_some(),
                cancelled,
                matrix: spec.matrix.clone(),
                variables: spec.variables.clone(),
                env: merged_env(&job_env, step),
                steps: views.clone(),
                needs: spec.needs.clone(),
            };

            let outcome = match spec.template.step_conditions[index].should_run(&snapshot) {
                Ok(false) => {
                    tracing::debug!(instance = %spec.instance, step = %key, "step skipped");
                    self.events.send_event(ExecutionEvent::StepSkipped {
                        instance: spec.instance,
                        step_id: key.clone(),
                        step_index: index,
                    });
                    StepOutcome {
                        step_id: key.clone(),
                        name: step.display_name(index),
                        status: StepStatus::Skipped,
                        outputs: HashMap::new(),
                        error: None,
                        continue_on_error: step.continue_on_error,
                        duration_ms: 0,
                    }
                }
                Ok(true) => {
                    let (outcome, was_cancelled) = self
                        .run_step(&spec, index, step, snapshot, &cancel, cancelled)
                        .await;
                    cancelled = cancelled || was_cancelled;
                    outcome
                }
                Err(e) => {
                    tracing::warn!(instance = %spec.instance, step = %key, error = %e, "step condition failed");
                    if failure.is_none() && !step.continue_on_error {
                        failure = Some(FailureCause::ConditionError {
                            reason: format!("step '{}': {}", key, e),
                        });
                    }
                    StepOutcome {
                        step_id: key.clone(),
                        name: step.display_name(index),
                        status: StepStatus::Failed,
                        outputs: HashMap::new(),
                        error: Some(format!("condition error: {}", e)),
                        continue_on_error: step.continue_on_error,
                        duration_ms: 0,
                    }
                }
            };

            if outcome.status == StepStatus::Failed && !outcome.continue_on_error && failure.is_none() {
                failure = Some(FailureCause::StepFailure {
                    step: key.clone(),
                    reason: outcome.error.clone().unwrap_or_else(|| "failed".to_string()),
                });
            }
            job_outputs.extend(outcome.outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
            views.insert(
                key,
                StepView {
                    outcome: outcome.status.outcome_name().to_string(),
                    outputs: outcome.outputs.clone(),
                },
            );
            outcomes.push(outcome);
        }

        let (status, cause) = match failure {
            Some(cause) => (JobStatus::Failed, Some(cause)),
            None if cancelled => (JobStatus::Cancelled, Some(FailureCause::Aborted)),
            None => (JobStatus::Succeeded, None),
        };

        if status == JobStatus::Succeeded {
            if let Some(state) = cache_state {
                self.save_cache(&spec, &name, state, &mut warnings).await;
            }
        }

        let duration = clock.elapsed();
        tracing::info!(instance = %spec.instance, job = %name, status = %status, "job finished");
        self.events
            .send_event(ExecutionEvent::job_completed(spec.instance, name, status, duration));

        JobRun {
            instance: spec.instance,
            status,
            cause,
            steps: outcomes,
            outputs: job_outputs,
            started_at,
            finished_at: Utc::now(),
            warnings,
        }
    }

    /// Run one step whose condition held; the flag reports a cancellation
    async fn run_step(
        &self,
        spec: &JobSpec,
        index: usize,
        step: &StepDefinition,
        snapshot: StatusSnapshot,
        cancel: &CancellationSignal,
        already_cancelled: bool,
    ) -> (StepOutcome, bool) {
        let key = step.key(index);
        let display = step.display_name(index);
        let clock = Instant::now();

        self.events.send_event(ExecutionEvent::StepStarted {
            instance: spec.instance,
            step_id: key.clone(),
            name: display.clone(),
            step_index: index,
        });

        let end = match self.actions.resolve(step) {
            Err(reason) => StepEnd::Finished(ActionResult::failure(reason)),
            Ok(action) => {
                let ctx = self.step_context(spec, &key, &display, step, snapshot);
                let timeout = step
                    .timeout_minutes
                    .and_then(minutes_to_duration)
                    .or(self.default_timeout);
                let guarded = async move {
                    match timeout {
                        Some(limit) => tokio::time::timeout(limit, action.execute(ctx))
                            .await
                            .unwrap_or_else(|_| ActionResult::failure(format!("timed out after {:?}", limit))),
                        None => action.execute(ctx).await,
                    }
                };
                tokio::pin!(guarded);

                if already_cancelled {
                    StepEnd::Finished(guarded.await)
                } else {
                    tokio::select! {
                        result = &mut guarded => StepEnd::Finished(result),
                        _ = cancel.cancelled() => {
                            tracing::info!(instance = %spec.instance, step = %key, grace = ?self.cancel_grace, "run aborted, waiting for step");
                            match tokio::time::timeout(self.cancel_grace, &mut guarded).await {
                                Ok(result) => StepEnd::Finished(result),
                                Err(_) => StepEnd::Cancelled,
                            }
                        }
                    }
                }
            }
        };

        let duration = clock.elapsed();
        let (status, outputs, error, was_cancelled) = match end {
            StepEnd::Finished(ActionResult {
                status: ActionStatus::Success,
                outputs,
            }) => (StepStatus::Succeeded, outputs, None, false),
            StepEnd::Finished(ActionResult {
                status: ActionStatus::Failure(reason),
                outputs,
            }) => (StepStatus::Failed, outputs, Some(reason), false),
            StepEnd::Cancelled => (
                StepStatus::Cancelled,
                HashMap::new(),
                Some("cancelled after grace period".to_string()),
                true,
            ),
        };

        match status {
            StepStatus::Failed if step.continue_on_error => {
                tracing::warn!(instance = %spec.instance, step = %key, error = ?error, "step failed, continuing")
            }
            StepStatus::Failed => tracing::warn!(instance = %spec.instance, step = %key, error = ?error, "step failed"),
            _ => tracing::debug!(instance = %spec.instance, step = %key, status = ?status, "step finished"),
        }
        self.events.send_event(ExecutionEvent::StepCompleted {
            instance: spec.instance,
            step_id: key.clone(),
            step_index: index,
            status,
            duration,
            error: error.clone(),
        });

        let outcome = StepOutcome {
            step_id: key,
            name: display,
            status,
            outputs,
            error,
            continue_on_error: step.continue_on_error,
            duration_ms: duration.as_millis() as u64,
        };
        (outcome, was_cancelled)
    }

    fn step_context(
        &self,
        spec: &JobSpec,
        key: &str,
        display: &str,
        step: &StepDefinition,
        snapshot: StatusSnapshot,
    ) -> StepContext {
        let working_dir = match &step.working_directory {
            Some(dir) => self.working_dir.join(dir),
            None => self.working_dir.clone(),
        };
        StepContext {
            instance: spec.instance,
            template: spec.template.name().to_string(),
            label: spec.label.clone(),
            step_id: key.to_string(),
            step_name: display.to_string(),
            run: step.run.clone(),
            shell: step.shell.clone(),
            inputs: step.with.clone(),
            matrix: snapshot.matrix,
            variables: snapshot.variables,
            env: snapshot.env,
            working_dir,
            step_outputs: snapshot
                .steps
                .into_iter()
                .map(|(id, view)| (id, view.outputs))
                .collect(),
            needs_outputs: snapshot
                .needs
                .into_iter()
                .map(|(job, view)| (job, view.outputs))
                .collect(),
            secrets: spec.secrets.clone(),
            events: self.events.clone(),
        }
    }

    /// Restore before the first step; any problem is a miss
    async fn restore_cache(
        &self,
        spec: &JobSpec,
        job_env: &HashMap<String, String>,
        name: &str,
        views: &mut HashMap<String, StepView>,
        warnings: &mut Vec<RunWarning>,
    ) -> Option<CacheState> {
        let cache_spec = spec.template.definition.cache.as_ref()?;
        let resolver = self.cache.as_ref()?;

        let snapshot = StatusSnapshot {
            matrix: spec.matrix.clone(),
            variables: spec.variables.clone(),
            env: job_env.clone(),
            ..StatusSnapshot::default()
        };
        let renderer = CacheKeyRenderer::new(&snapshot, &self.working_dir);
        let keys = renderer
            .render(&cache_spec.key)
            .and_then(|primary| Ok((primary, renderer.render_all(&cache_spec.restore_keys)?)));
        let (primary, fallbacks) = match keys {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(instance = %spec.instance, error = %e, "cache key could not be rendered");
                warnings.push(RunWarning::CacheFailure {
                    instance: name.to_string(),
                    reason: e.to_string(),
                });
                return None;
            }
        };

        let mut outputs = HashMap::new();
        let exact = match resolver.restore(&primary, &fallbacks, &self.working_dir).await {
            Ok(Some(hit)) => {
                self.events.send_event(ExecutionEvent::CacheRestored {
                    instance: spec.instance,
                    key: hit.entry.key.clone(),
                    exact: hit.exact,
                });
                outputs.insert("cache-matched-key".to_string(), hit.entry.key);
                hit.exact
            }
            Ok(None) => {
                tracing::debug!(instance = %spec.instance, key = %primary, "cache miss");
                self.events.send_event(ExecutionEvent::CacheMissed {
                    instance: spec.instance,
                    key: primary.clone(),
                });
                false
            }
            Err(e) => {
                tracing::warn!(instance = %spec.instance, key = %primary, error = %e, "cache restore failed, treating as miss");
                warnings.push(RunWarning::CacheFailure {
                    instance: name.to_string(),
                    reason: format!("restore '{}': {}", primary, e),
                });
                false
            }
        };
        outputs.insert("cache-hit".to_string(), exact.to_string());
        views.insert(
            CACHE_STEP_ID.to_string(),
            StepView {
                outcome: "success".to_string(),
                outputs,
            },
        );
        Some(CacheState { primary, exact })
    }

    async fn save_cache(&self, spec: &JobSpec, name: &str, state: CacheState, warnings: &mut Vec<RunWarning>) {
        if state.exact {
            return;
        }
        let (Some(resolver), Some(cache_spec)) = (self.cache.as_ref(), spec.template.definition.cache.as_ref()) else {
            return;
        };
        match resolver.save(&state.primary, &cache_spec.paths, &self.working_dir).await {
            Ok(SaveOutcome::Stored) => {
                self.events.send_event(ExecutionEvent::CacheSaved {
                    instance: spec.instance,
                    key: state.primary,
                });
            }
            Ok(SaveOutcome::AlreadyPresent) => {
                tracing::debug!(instance = %spec.instance, key = %state.primary, "cache entry already present");
            }
            Err(e) => {
                tracing::warn!(instance = %spec.instance, key = %state.primary, error = %e, "cache save failed");
                warnings.push(RunWarning::CacheFailure {
                    instance: name.to_string(),
                    reason: format!("save '{}': {}", state.primary, e),
                });
            }
        }
    }
}

fn merged_env(job_env: &HashMap<String, String>, step: &StepDefinition) -> HashMap<String, String> {
    let mut env = job_env.clone();
    env.extend(step.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{JsonArchiver, MemoryCache};
    use crate::definition::DefinitionParser;
    use crate::execution::graph::PlanBuilder;
    use crate::test_support::ScriptedAction;

    fn spec_for(yaml: &str, job: &str) -> JobSpec {
        let definition = DefinitionParser::parse(yaml).unwrap();
        let plan = PlanBuilder::new(&definition).build().unwrap();
        let template = plan.template_by_name(job).unwrap().clone();
        let instance = plan.instance(template.instances[0]);
        JobSpec {
            instance: instance.id,
            template,
            label: instance.label.clone(),
            matrix: instance.matrix(),
            variables: plan.variables.clone(),
            needs: HashMap::new(),
            secrets: HashMap::new(),
        }
    }

    fn executor(action: Arc<ScriptedAction>, dir: &Path) -> JobExecutor {
        JobExecutor::new(Arc::new(ActionRegistry::with_run_action(action)), dir)
            .with_cancel_grace(Duration::from_millis(50))
    }

    const FAILING_MIDDLE: &str = r#"
jobs:
  build:
    steps:
      - id: one
        run: a
      - id: two
        run: b
      - id: three
        run: c
      - id: report
        if: failure()
        run: d
      - id: cleanup
        if: always()
        run: e
"#;

    #[tokio::test]
    async fn test_failure_skips_default_steps_but_runs_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let action = Arc::new(ScriptedAction::new().fail("build", "two", "compile error"));
        let run = executor(action.clone(), dir.path())
            .run(spec_for(FAILING_MIDDLE, "build"), CancellationSignal::new())
            .await;

        assert_eq!(run.status, JobStatus::Failed);
        assert_eq!(
            run.cause,
            Some(FailureCause::StepFailure {
                step: "two".into(),
                reason: "compile error".into()
            })
        );
        let statuses: Vec<_> = run.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![
                StepStatus::Succeeded,
                StepStatus::Failed,
                StepStatus::Skipped,
                StepStatus::Succeeded,
                StepStatus::Succeeded
            ]
        );
        assert_eq!(action.calls_for("build"), vec!["one", "two", "report", "cleanup"]);
    }

    #[tokio::test]
    async fn test_failure_only_steps_skip_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let action = Arc::new(ScriptedAction::new());
        let run = executor(action, dir.path())
            .run(spec_for(FAILING_MIDDLE, "build"), CancellationSignal::new())
            .await;
        assert_eq!(run.status, JobStatus::Succeeded);
        assert_eq!(run.steps[3].status, StepStatus::Skipped);
        assert_eq!(run.steps[4].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_plain_predicate_after_failure_is_skipped() {
        let yaml = r#"
jobs:
  build:
    steps:
      - id: one
        run: a
      - id: two
        if: "'x' == 'x'"
        run: b
      - id: notify
        if: failure() && 'x' == 'x'
        run: c
"#;
        let dir = tempfile::tempdir().unwrap();
        let action = Arc::new(ScriptedAction::new().fail("build", "one", "boom"));
        let run = executor(action.clone(), dir.path())
            .run(spec_for(yaml, "build"), CancellationSignal::new())
            .await;

        assert_eq!(run.status, JobStatus::Failed);
        assert_eq!(run.steps[1].status, StepStatus::Skipped);
        assert_eq!(run.steps[2].status, StepStatus::Succeeded);
        assert_eq!(action.calls_for("build"), vec!["one", "notify"]);
    }

    #[tokio::test]
    async fn test_continue_on_error_keeps_job_green() {
        let yaml = r#"
jobs:
  lint:
    steps:
      - id: clippy
        run: x
        continue-on-error: true
      - id: fmt
        run: y
"#;
        let dir = tempfile::tempdir().unwrap();
        let action = Arc::new(ScriptedAction::new().fail("lint", "clippy", "warnings"));
        let run = executor(action, dir.path())
            .run(spec_for(yaml, "lint"), CancellationSignal::new())
            .await;
        assert_eq!(run.status, JobStatus::Succeeded);
        assert_eq!(run.steps[0].status, StepStatus::Failed);
        assert_eq!(run.steps[1].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_outputs_flow_to_later_conditions() {
        let yaml = r#"
jobs:
  release:
    steps:
      - id: version
        run: x
      - id: publish
        if: steps.version.outputs.channel == 'stable'
        run: y
      - id: preview
        if: steps.version.outputs.channel == 'beta'
        run: z
"#;
        let dir = tempfile::tempdir().unwrap();
        let action = Arc::new(ScriptedAction::new().output("release", "version", "channel", "stable"));
        let run = executor(action, dir.path())
            .run(spec_for(yaml, "release"), CancellationSignal::new())
            .await;
        assert_eq!(run.steps[1].status, StepStatus::Succeeded);
        assert_eq!(run.steps[2].status, StepStatus::Skipped);
        assert_eq!(run.outputs["channel"], "stable");
    }

    #[tokio::test]
    async fn test_step_timeout_is_failure() {
        let yaml = r#"
jobs:
  slow:
    steps:
      - id: wait
        run: x
        timeout-minutes: 0.001
"#;
        let dir = tempfile::tempdir().unwrap();
        let action = Arc::new(ScriptedAction::new().delay(Duration::from_secs(5)));
        let run = executor(action, dir.path())
            .run(spec_for(yaml, "slow"), CancellationSignal::new())
            .await;
        assert_eq!(run.status, JobStatus::Failed);
        assert!(run.steps[0].error.as_deref().unwrap().starts_with("timed out"));
    }

    #[tokio::test]
    async fn test_cancellation_drops_step_after_grace_and_runs_always() {
        let yaml = r#"
jobs:
  deploy:
    steps:
      - id: push
        run: x
      - id: verify
        run: y
      - id: teardown
        if: always()
        run: z
"#;
        let dir = tempfile::tempdir().unwrap();
        let action = Arc::new(ScriptedAction::new().delay_step("deploy", "push", Duration::from_secs(30)));
        let cancel = CancellationSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let run = executor(action.clone(), dir.path())
            .run(spec_for(yaml, "deploy"), cancel)
            .await;
        assert_eq!(run.status, JobStatus::Cancelled);
        assert_eq!(run.cause, Some(FailureCause::Aborted));
        assert_eq!(run.steps[0].status, StepStatus::Cancelled);
        assert_eq!(run.steps[1].status, StepStatus::Skipped);
        assert_eq!(run.steps[2].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_unknown_action_fails_step() {
        let yaml = r#"
jobs:
  notify:
    steps:
      - uses: slack
"#;
        let dir = tempfile::tempdir().unwrap();
        let run = executor(Arc::new(ScriptedAction::new()), dir.path())
            .run(spec_for(yaml, "notify"), CancellationSignal::new())
            .await;
        assert_eq!(run.status, JobStatus::Failed);
        assert!(run.steps[0].error.as_deref().unwrap().contains("unknown action 'slack'"));
    }

    #[tokio::test]
    async fn test_cache_restore_then_save_on_miss() {
        let yaml = r#"
jobs:
  build:
    cache:
      key: deps-${{ hashFiles('lock.txt') }}
      restore-keys: [deps-]
      paths: [vendor]
    steps:
      - id: check
        if: steps.cache.outputs.cache-hit != 'true'
        run: install
"#;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lock.txt"), "v1").unwrap();
        std::fs::create_dir_all(dir.path().join("vendor")).unwrap();
        std::fs::write(dir.path().join("vendor/lib.txt"), "payload").unwrap();

        let backend = Arc::new(MemoryCache::new());
        let resolver = Arc::new(CacheResolver::new(backend.clone(), Arc::new(JsonArchiver::new())));
        let action = Arc::new(ScriptedAction::new());
        let exec = executor(action.clone(), dir.path()).with_cache(resolver);

        let first = exec.run(spec_for(yaml, "build"), CancellationSignal::new()).await;
        assert_eq!(first.status, JobStatus::Succeeded);
        assert_eq!(first.outputs["cache-hit"], "false");
        assert_eq!(backend.keys().len(), 1);
        assert_eq!(action.calls_for("build"), vec!["check"]);

        let second = exec.run(spec_for(yaml, "build"), CancellationSignal::new()).await;
        assert_eq!(second.outputs["cache-hit"], "true");
        assert_eq!(second.steps[0].status, StepStatus::Skipped);
        assert_eq!(backend.keys().len(), 1);
    }
}
