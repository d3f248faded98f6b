// Orchestrator
// Schedules ready job instances, drives leases and aggregates the outcome

use crate::cache::CacheResolver;
use crate::condition::{NeedView, StatusSnapshot};
use crate::config::EngineConfig;
use crate::execution::cancel::CancellationSignal;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::executor::{JobExecutor, JobRun, JobSpec};
use crate::execution::graph::ExecutionPlan;
use crate::execution::instance::{FailureCause, InstanceId, JobStatus};
use crate::execution::report::{FailureSummary, JobRecord, RecordSink, RunOutcome, RunReport, RunWarning};
use crate::lease::{LeaseEvent, LeaseManager, LeaseState, ResourceProvider};
use crate::runners::ActionRegistry;

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::{JoinError, JoinSet};

/// Completion delivered to the scheduling loop
enum WorkerEvent {
    Job(Box<JobRun>),
    JobPanicked { instance: InstanceId, reason: String },
    Lease(LeaseEvent),
}

/// Runs an [`ExecutionPlan`] to completion.
///
/// Leases are released on every exit path: once their last bound job is
/// terminal, and again by a cleanup pass after the scheduling loop.
pub struct Orchestrator {
    plan: ExecutionPlan,
    actions: Arc<ActionRegistry>,
    provider: Arc<dyn ResourceProvider>,
    cache: Option<Arc<CacheResolver>>,
    config: EngineConfig,
    working_dir: PathBuf,
    max_parallel: Option<usize>,
    events: Option<ProgressSender>,
    sink: Option<Arc<dyn RecordSink>>,
    cancel: CancellationSignal,
}

impl Orchestrator {
    pub fn new(plan: ExecutionPlan, actions: Arc<ActionRegistry>, provider: Arc<dyn ResourceProvider>) -> Self {
        Self {
            plan,
            actions,
            provider,
            cache: None,
            config: EngineConfig::default(),
            working_dir: PathBuf::from("."),
            max_parallel: None,
            events: None,
            sink: None,
            cancel: CancellationSignal::new(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<CacheResolver>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Explicit bound; takes precedence over the pipeline's `concurrency`
    pub fn with_max_parallel(mut self, limit: usize) -> Self {
        self.max_parallel = Some(limit);
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Effective global bound on running jobs
    pub fn concurrency_limit(&self) -> usize {
        self.max_parallel
            .or(self.plan.concurrency)
            .unwrap_or(self.config.max_parallel)
            .max(1)
    }

    pub async fn run(self) -> RunReport {
        let limit = self.concurrency_limit();
        let executor = JobExecutor::new(Arc::clone(&self.actions), self.working_dir.clone())
            .with_default_timeout(self.config.default_step_timeout())
            .with_cancel_grace(self.config.cancel_grace())
            .with_progress(self.events.clone());
        let executor = match &self.cache {
            Some(cache) => executor.with_cache(Arc::clone(cache)),
            None => executor,
        };

        let mut leases = LeaseManager::new(Arc::clone(&self.provider), self.plan.scopes(), self.config.provider_retries);
        for instance in self.plan.instances() {
            if let Some(scope) = instance.scope {
                leases.bind(scope, instance.id);
            }
        }

        let template_count = self.plan.templates().len();
        let scheduler = Scheduler {
            checked: vec![false; self.plan.len()],
            plan: self.plan,
            leases,
            executor,
            tasks: JoinSet::new(),
            running: 0,
            running_per_template: vec![0; template_count],
            limit,
            aborted: false,
            warnings: Vec::new(),
            events: self.events,
            sink: self.sink,
            cancel: self.cancel,
        };
        scheduler.execute().await
    }
}

struct Scheduler {
    plan: ExecutionPlan,
    leases: LeaseManager,
    executor: JobExecutor,
    tasks: JoinSet<WorkerEvent>,
    /// Whether the job predicate has been evaluated and held
    checked: Vec<bool>,
    running: usize,
    running_per_template: Vec<usize>,
    limit: usize,
    aborted: bool,
    warnings: Vec<RunWarning>,
    events: Option<ProgressSender>,
    sink: Option<Arc<dyn RecordSink>>,
    cancel: CancellationSignal,
}

impl Scheduler {
    async fn execute(mut self) -> RunReport {
        let clock = Instant::now();
        let pipeline = self.plan.name.clone();
        tracing::info!(pipeline = %pipeline, jobs = self.plan.len(), limit = self.limit, "run started");
        self.events
            .send_event(ExecutionEvent::run_started(pipeline.as_str(), self.plan.len()));

        let initial: Vec<InstanceId> = self
            .plan
            .instances()
            .iter()
            .filter(|i| i.status == JobStatus::Ready)
            .map(|i| i.id)
            .collect();
        for id in initial {
            self.promote(id);
        }

        let cancel = self.cancel.clone();
        loop {
            if !self.aborted && cancel.is_cancelled() {
                self.abort();
            }
            if !self.aborted {
                self.request_leases();
                self.dispatch();
            }
            if self.tasks.is_empty() {
                break;
            }

            tokio::select! {
                joined = self.tasks.join_next() => match joined {
                    Some(Ok(event)) => self.handle(event),
                    Some(Err(e)) => tracing::error!(error = %e, "scheduler task failed"),
                    None => {}
                },
                _ = cancel.cancelled(), if !self.aborted => {}
            }
        }

        self.cleanup().await;
        debug_assert!(!self.leases.has_live_leases(), "lease still held after cleanup");
        self.fail_leftovers();

        let outcome = if self.plan.instances().iter().any(|i| i.status == JobStatus::Failed) {
            RunOutcome::Failed
        } else if self.aborted {
            RunOutcome::Aborted
        } else {
            RunOutcome::Succeeded
        };
        let duration = clock.elapsed();
        tracing::info!(pipeline = %pipeline, outcome = %outcome, "run finished");
        self.events
            .send_event(ExecutionEvent::run_completed(pipeline.as_str(), outcome, duration));

        RunReport {
            pipeline,
            outcome,
            records: self.plan.instances().iter().map(JobRecord::from_instance).collect(),
            failures: self
                .plan
                .instances()
                .iter()
                .filter(|i| i.status != JobStatus::Succeeded)
                .map(|i| FailureSummary {
                    instance_id: i.id,
                    name: i.display_name(),
                    status: i.status,
                    cause: i.cause.clone(),
                })
                .collect(),
            warnings: self.warnings,
            leases: self.leases.states(),
            duration_ms: duration.as_millis() as u64,
        }
    }

    fn handle(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Job(run) => self.finish_job(*run),
            WorkerEvent::JobPanicked { instance, reason } => {
                tracing::error!(instance = %instance, %reason, "job task panicked");
                self.release_slots(instance);
                self.settle(instance, JobStatus::Failed, FailureCause::Internal { reason });
            }
            WorkerEvent::Lease(event) => self.lease_completed(event),
        }
        self.release_idle_leases();
    }

    /// Status snapshot for a job predicate: upstream results and outputs
    fn need_views(&self, id: InstanceId) -> (HashMap<String, NeedView>, Option<InstanceId>) {
        let instance = self.plan.instance(id);
        let mut views: HashMap<String, NeedView> = HashMap::new();
        let mut grouped: HashMap<String, Vec<JobStatus>> = HashMap::new();
        let mut first_failed = None;

        for need in &instance.needs {
            let upstream = self.plan.instance(*need);
            if first_failed.is_none() && matches!(upstream.status, JobStatus::Failed | JobStatus::Cancelled) {
                first_failed = Some(*need);
            }
            grouped
                .entry(upstream.template_name.clone())
                .or_default()
                .push(upstream.status);
            views
                .entry(upstream.template_name.clone())
                .or_default()
                .outputs
                .extend(upstream.outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        for (name, statuses) in grouped {
            let result = if statuses.contains(&JobStatus::Failed) {
                "failure"
            } else if statuses.contains(&JobStatus::Cancelled) {
                "cancelled"
            } else if statuses.iter().all(|s| *s == JobStatus::Skipped) {
                "skipped"
            } else {
                "success"
            };
            if let Some(view) = views.get_mut(&name) {
                view.result = result.to_string();
            }
        }
        (views, first_failed)
    }

    /// Evaluate the job predicate of an instance whose upstreams are all terminal
    fn promote(&mut self, id: InstanceId) {
        let instance = self.plan.instance(id);
        if instance.status.is_terminal() || self.checked[id.index()] {
            return;
        }
        let template = Arc::clone(self.plan.template(instance.template));
        let (needs, first_failed) = self.need_views(id);
        let snapshot = StatusSnapshot {
            failed: first_failed.is_some(),
            cancelled: self.cancel.is_cancelled(),
            matrix: instance.matrix(),
            variables: self.plan.variables.clone(),
            env: template.definition.env.clone(),
            steps: HashMap::new(),
            needs,
        };

        match template.condition.should_run(&snapshot) {
            Ok(true) => {
                tracing::debug!(instance = %id, "job ready");
                self.checked[id.index()] = true;
                self.plan.instance_mut(id).status = JobStatus::Ready;
            }
            Ok(false) => match first_failed {
                Some(upstream) => {
                    let upstream = self.plan.instance(upstream).display_name();
                    self.settle(id, JobStatus::Cancelled, FailureCause::UpstreamFailed { upstream });
                }
                None => self.settle(id, JobStatus::Skipped, FailureCause::ConditionFalse),
            },
            Err(e) => self.settle(
                id,
                JobStatus::Failed,
                FailureCause::ConditionError { reason: e.to_string() },
            ),
        }
    }

    /// Re-examine dependents of a newly terminal instance
    fn cascade(&mut self, id: InstanceId) {
        let dependents = self.plan.instance(id).dependents.clone();
        for dependent in dependents {
            let ready = self
                .plan
                .instance(dependent)
                .needs
                .iter()
                .all(|n| self.plan.instance(*n).status.is_terminal());
            if ready {
                self.promote(dependent);
            }
        }
    }

    /// Terminal transition for an instance that does not (or no longer) run
    fn settle(&mut self, id: InstanceId, status: JobStatus, cause: FailureCause) {
        if self.mark(id, status, cause) {
            self.cascade(id);
        }
    }

    /// Record a terminal state without re-examining dependents
    fn mark(&mut self, id: InstanceId, status: JobStatus, cause: FailureCause) -> bool {
        let instance = self.plan.instance_mut(id);
        if instance.status.is_terminal() {
            return false;
        }
        let now = Utc::now();
        instance.status = status;
        instance.finished_at = Some(now);
        instance.started_at.get_or_insert(now);
        instance.cause = Some(cause.clone());
        let name = instance.display_name();

        tracing::info!(instance = %id, job = %name, status = %status, cause = %cause, "job settled");
        self.events
            .send_event(ExecutionEvent::job_settled(id, name, status, cause.to_string()));
        self.emit_record(id);
        true
    }

    fn emit_record(&mut self, id: InstanceId) {
        let Some(sink) = &self.sink else {
            return;
        };
        let record = JobRecord::from_instance(self.plan.instance(id));
        if let Err(e) = sink.record(&record) {
            tracing::warn!(instance = %id, error = %e, "failed to write job record");
            self.warnings.push(RunWarning::RecordFailure { reason: e.to_string() });
        }
    }

    fn ready_instances(&self) -> Vec<InstanceId> {
        self.plan
            .instances()
            .iter()
            .filter(|i| i.status == JobStatus::Ready && self.checked[i.id.index()])
            .map(|i| i.id)
            .collect()
    }

    /// Start acquiring scopes of ready jobs
    fn request_leases(&mut self) {
        for id in self.ready_instances() {
            let Some(scope) = self.plan.instance(id).scope else {
                continue;
            };
            if let Some(call) = self.leases.begin_acquire(scope) {
                self.lease_changed(scope);
                self.tasks.spawn(async move { WorkerEvent::Lease(call.run().await) });
            }
        }
    }

    /// Start ready jobs in arena order within the concurrency limits
    fn dispatch(&mut self) {
        for id in self.ready_instances() {
            if self.running >= self.limit {
                break;
            }
            let instance = self.plan.instance(id);
            let template = instance.template;
            if let Some(max) = self.plan.template(template).definition.max_parallel {
                if self.running_per_template[template] >= max {
                    continue;
                }
            }
            let mut secrets = HashMap::new();
            if let Some(scope) = instance.scope {
                if !self.leases.try_reserve(scope) {
                    continue;
                }
                if let Some(handle) = self.leases.handle(scope) {
                    secrets.insert("GANTRY_LEASE_SCOPE".to_string(), handle.scope.clone());
                    secrets.insert("GANTRY_LEASE_ID".to_string(), handle.id.clone());
                }
            }
            self.start(id, secrets);
        }
    }

    fn start(&mut self, id: InstanceId, secrets: HashMap<String, String>) {
        let (needs, _) = self.need_views(id);
        let instance = self.plan.instance_mut(id);
        instance.status = JobStatus::Running;
        instance.started_at = Some(Utc::now());
        let spec = JobSpec {
            instance: id,
            template: Arc::clone(self.plan.template(self.plan.instance(id).template)),
            label: self.plan.instance(id).label.clone(),
            matrix: self.plan.instance(id).matrix(),
            variables: self.plan.variables.clone(),
            needs,
            secrets,
        };
        self.running += 1;
        self.running_per_template[spec.template.index] += 1;
        tracing::debug!(instance = %id, running = self.running, "dispatching job");

        let executor = self.executor.clone();
        let cancel = self.cancel.clone();
        let job = tokio::spawn(async move { executor.run(spec, cancel).await });
        self.tasks.spawn(async move {
            match job.await {
                Ok(run) => WorkerEvent::Job(Box::new(run)),
                Err(e) => WorkerEvent::JobPanicked {
                    instance: id,
                    reason: panic_reason(e),
                },
            }
        });
    }

    fn release_slots(&mut self, id: InstanceId) {
        let instance = self.plan.instance(id);
        let (template, scope) = (instance.template, instance.scope);
        self.running = self.running.saturating_sub(1);
        self.running_per_template[template] = self.running_per_template[template].saturating_sub(1);
        if let Some(scope) = scope {
            self.leases.free_slot(scope);
        }
    }

    fn finish_job(&mut self, run: JobRun) {
        let id = run.instance;
        self.release_slots(id);
        self.warnings.extend(run.warnings);

        let instance = self.plan.instance_mut(id);
        instance.status = run.status;
        instance.cause = run.cause;
        instance.steps = run.steps;
        instance.outputs = run.outputs;
        instance.started_at = Some(run.started_at);
        instance.finished_at = Some(run.finished_at);

        self.emit_record(id);
        self.cascade(id);
    }

    fn lease_completed(&mut self, event: LeaseEvent) {
        let transition = self.leases.complete(event);
        self.lease_changed(transition.scope);
        let scope_name = self.leases.name(transition.scope).to_string();
        match transition.state {
            LeaseState::AcquireFailed => {
                let reason = transition.error.unwrap_or_else(|| "acquisition failed".to_string());
                let bound = self.leases.bound(transition.scope).to_vec();
                for id in &bound {
                    self.mark(
                        *id,
                        JobStatus::Failed,
                        FailureCause::ResourceUnavailable {
                            scope: scope_name.clone(),
                            reason: reason.clone(),
                        },
                    );
                }
                for id in bound {
                    self.cascade(id);
                }
            }
            LeaseState::ReleaseFailed => {
                self.warnings.push(RunWarning::CleanupFailure {
                    scope: scope_name,
                    reason: transition.error.unwrap_or_default(),
                });
            }
            _ => {}
        }
    }

    fn lease_changed(&self, scope: usize) {
        self.events.send_event(ExecutionEvent::LeaseChanged {
            scope: self.leases.name(scope).to_string(),
            state: self.leases.state(scope),
        });
    }

    /// Release active scopes whose bound jobs are all terminal
    fn release_idle_leases(&mut self) {
        for scope in 0..self.leases.len() {
            if self.leases.state(scope) != LeaseState::Active {
                continue;
            }
            let idle = self
                .leases
                .bound(scope)
                .iter()
                .all(|id| self.plan.instance(*id).status.is_terminal());
            if idle {
                if let Some(call) = self.leases.begin_release(scope) {
                    self.lease_changed(scope);
                    self.tasks.spawn(async move { WorkerEvent::Lease(call.run().await) });
                }
            }
        }
    }

    /// Stop dispatching; everything not yet running is cancelled
    fn abort(&mut self) {
        tracing::warn!(pipeline = %self.plan.name, "run aborted");
        self.aborted = true;
        let waiting: Vec<InstanceId> = self
            .plan
            .instances()
            .iter()
            .filter(|i| matches!(i.status, JobStatus::Pending | JobStatus::Blocked | JobStatus::Ready))
            .map(|i| i.id)
            .collect();
        for id in waiting {
            self.mark(id, JobStatus::Cancelled, FailureCause::Aborted);
        }
        self.release_idle_leases();
    }

    /// Release every lease still held; runs after the scheduling loop on all paths
    async fn cleanup(&mut self) {
        let calls = self.leases.cleanup_all();
        if calls.is_empty() {
            return;
        }
        tracing::info!(leases = calls.len(), "releasing remaining leases");
        let mut releases = JoinSet::new();
        for call in calls {
            self.lease_changed(call.scope());
            releases.spawn(call.run());
        }
        while let Some(joined) = releases.join_next().await {
            match joined {
                Ok(event) => self.lease_completed(event),
                Err(e) => tracing::error!(error = %e, "lease release task failed"),
            }
        }
    }

    fn fail_leftovers(&mut self) {
        let leftovers: Vec<InstanceId> = self
            .plan
            .instances()
            .iter()
            .filter(|i| !i.status.is_terminal())
            .map(|i| i.id)
            .collect();
        for id in leftovers {
            tracing::error!(instance = %id, "job never reached a terminal state");
            self.settle(
                id,
                JobStatus::Failed,
                FailureCause::Internal {
                    reason: "job was never scheduled".to_string(),
                },
            );
        }
    }
}

fn panic_reason(err: JoinError) -> String {
    if !err.is_panic() {
        return "job task was cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("job panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("job panicked: {}", message)
    } else {
        "job panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::DefinitionParser;
    use crate::execution::graph::PlanBuilder;
    use crate::execution::report::MemorySink;
    use crate::test_support::{FakeProvider, ScriptedAction};
    use std::time::Duration;

    fn plan(yaml: &str) -> ExecutionPlan {
        let definition = DefinitionParser::parse(yaml).unwrap();
        PlanBuilder::new(&definition).build().unwrap()
    }

    fn orchestrator(yaml: &str, action: Arc<ScriptedAction>, provider: Arc<FakeProvider>) -> Orchestrator {
        let dir = std::env::temp_dir();
        Orchestrator::new(plan(yaml), Arc::new(ActionRegistry::with_run_action(action)), provider)
            .with_working_dir(dir)
            .with_config(EngineConfig {
                cancel_grace_secs: 0,
                ..EngineConfig::default()
            })
    }

    fn status_of(report: &RunReport, template: &str) -> Vec<JobStatus> {
        report.records_for(template).map(|r| r.status).collect()
    }

    const FAN_OUT: &str = r#"
jobs:
  a:
    steps:
      - id: build
        run: make
  b:
    needs: a
    steps:
      - run: test
  c:
    needs: [a]
    steps:
      - run: lint
"#;

    #[tokio::test]
    async fn test_failed_upstream_cancels_dependents() {
        let action = Arc::new(ScriptedAction::new().fail("a", "build", "boom"));
        let sink = Arc::new(MemorySink::new());
        let report = orchestrator(FAN_OUT, action.clone(), Arc::new(FakeProvider::new()))
            .with_sink(sink.clone())
            .run()
            .await;

        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_ne!(report.exit_code(), 0);
        assert_eq!(status_of(&report, "a"), vec![JobStatus::Failed]);
        assert_eq!(status_of(&report, "b"), vec![JobStatus::Cancelled]);
        assert_eq!(status_of(&report, "c"), vec![JobStatus::Cancelled]);

        let step_failures: Vec<_> = report
            .records
            .iter()
            .filter(|r| matches!(r.cause, Some(FailureCause::StepFailure { .. })))
            .collect();
        assert_eq!(step_failures.len(), 1);
        assert_eq!(step_failures[0].template, "a");
        for template in ["b", "c"] {
            let record = report.records_for(template).next().unwrap();
            assert_eq!(
                record.cause,
                Some(FailureCause::UpstreamFailed { upstream: "a".into() })
            );
        }
        assert!(action.calls_for("b").is_empty());
        assert_eq!(sink.records().len(), 3);
        assert_eq!(report.failures.len(), 3);
    }

    #[tokio::test]
    async fn test_always_dependent_runs_after_failure() {
        let yaml = r#"
jobs:
  build:
    steps:
      - id: compile
        run: make
  notify:
    needs: build
    if: always()
    steps:
      - id: send
        run: notify
  deploy:
    needs: build
    steps:
      - run: ship
"#;
        let action = Arc::new(ScriptedAction::new().fail("build", "compile", "error"));
        let report = orchestrator(yaml, action.clone(), Arc::new(FakeProvider::new()))
            .run()
            .await;
        assert_eq!(status_of(&report, "notify"), vec![JobStatus::Succeeded]);
        assert_eq!(status_of(&report, "deploy"), vec![JobStatus::Cancelled]);
        assert_eq!(action.calls_for("notify"), vec!["send"]);
        assert_eq!(report.outcome, RunOutcome::Failed);
    }

    #[tokio::test]
    async fn test_false_predicate_skips_and_skipped_satisfies() {
        let yaml = r#"
variables:
  publish: false
jobs:
  release:
    if: variables.publish
    steps:
      - run: push
  after:
    needs: release
    steps:
      - run: done
"#;
        let action = Arc::new(ScriptedAction::new());
        let report = orchestrator(yaml, action.clone(), Arc::new(FakeProvider::new()))
            .run()
            .await;
        assert_eq!(status_of(&report, "release"), vec![JobStatus::Skipped]);
        assert_eq!(status_of(&report, "after"), vec![JobStatus::Succeeded]);
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_matrix_runs_every_point() {
        let yaml = r#"
jobs:
  test:
    matrix:
      os: [linux, macos]
      toolchain: [stable, beta, nightly]
    steps:
      - id: run
        run: cargo test
"#;
        let action = Arc::new(ScriptedAction::new());
        let report = orchestrator(yaml, action.clone(), Arc::new(FakeProvider::new()))
            .run()
            .await;
        assert_eq!(report.count(JobStatus::Succeeded), 6);
        assert_eq!(action.calls_for("test").len(), 6);
        let labels: std::collections::HashSet<_> = report.records_for("test").map(|r| r.label.clone()).collect();
        assert_eq!(labels.len(), 6);
    }

    #[tokio::test]
    async fn test_concurrency_bound_is_respected() {
        let yaml = r#"
concurrency: 2
jobs:
  shard:
    matrix:
      n: [1, 2, 3, 4, 5, 6]
    steps:
      - run: work
"#;
        let action = Arc::new(ScriptedAction::new().delay(Duration::from_millis(20)));
        let report = orchestrator(yaml, action.clone(), Arc::new(FakeProvider::new()))
            .run()
            .await;
        assert_eq!(report.count(JobStatus::Succeeded), 6);
        assert!(action.max_in_flight() <= 2, "saw {}", action.max_in_flight());
        assert!(action.max_in_flight() >= 1);
    }

    #[tokio::test]
    async fn test_template_max_parallel() {
        let yaml = r#"
jobs:
  shard:
    max-parallel: 1
    matrix:
      n: [1, 2, 3]
    steps:
      - run: work
"#;
        let action = Arc::new(ScriptedAction::new().delay(Duration::from_millis(10)));
        let report = orchestrator(yaml, action.clone(), Arc::new(FakeProvider::new()))
            .with_max_parallel(8)
            .run()
            .await;
        assert_eq!(report.count(JobStatus::Succeeded), 3);
        assert_eq!(action.max_in_flight(), 1);
    }

    const LEASED: &str = r#"
resources:
  gpu-farm:
    labels: [gpu]
jobs:
  train:
    requires: [gpu]
    steps:
      - id: fit
        run: train
  eval:
    needs: train
    lease: gpu-farm
    steps:
      - id: score
        run: eval
  report:
    needs: eval
    steps:
      - run: publish
"#;

    #[tokio::test]
    async fn test_lease_acquired_once_and_released() {
        let provider = Arc::new(FakeProvider::new());
        let action = Arc::new(ScriptedAction::new());
        let report = orchestrator(LEASED, action.clone(), provider.clone()).run().await;

        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(provider.calls(), vec!["acquire gpu-farm", "release gpu-farm"]);
        assert_eq!(report.leases, vec![("gpu-farm".to_string(), LeaseState::Released)]);
        assert!(provider.live().is_empty());
        assert_eq!(action.secret_for("train", "GANTRY_LEASE_ID").as_deref(), Some("lease-gpu-farm"));
    }

    #[tokio::test]
    async fn test_acquisition_failure_fails_bound_jobs_without_running() {
        let provider = Arc::new(FakeProvider::new().fail_acquire("gpu-farm"));
        let action = Arc::new(ScriptedAction::new());
        let report = orchestrator(LEASED, action.clone(), provider.clone()).run().await;

        assert_eq!(report.outcome, RunOutcome::Failed);
        for template in ["train", "eval"] {
            let record = report.records_for(template).next().unwrap();
            assert_eq!(record.status, JobStatus::Failed);
            assert!(matches!(
                record.cause,
                Some(FailureCause::ResourceUnavailable { ref scope, .. }) if scope == "gpu-farm"
            ));
        }
        assert_eq!(status_of(&report, "report"), vec![JobStatus::Cancelled]);
        assert!(action.calls().is_empty());
        // one attempt plus one retry
        assert_eq!(provider.calls(), vec!["acquire gpu-farm", "acquire gpu-farm"]);
        assert_eq!(report.leases[0].1, LeaseState::AcquireFailed);
    }

    #[tokio::test]
    async fn test_release_failure_is_a_warning() {
        let provider = Arc::new(FakeProvider::new().fail_release("gpu-farm"));
        let report = orchestrator(LEASED, Arc::new(ScriptedAction::new()), provider).run().await;
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.leases[0].1, LeaseState::ReleaseFailed);
        assert!(report
            .warnings
            .iter()
            .any(|w| matches!(w, RunWarning::CleanupFailure { scope, .. } if scope == "gpu-farm")));
    }

    #[tokio::test]
    async fn test_abort_cancels_waiting_jobs_and_releases_leases() {
        let provider = Arc::new(FakeProvider::new());
        let action = Arc::new(ScriptedAction::new().delay_step("train", "fit", Duration::from_secs(30)));
        let cancel = CancellationSignal::new();
        let trigger = cancel.clone();
        let watcher = provider.clone();
        tokio::spawn(async move {
            while watcher.live().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let report = tokio::time::timeout(
            Duration::from_secs(10),
            orchestrator(LEASED, action, provider.clone())
                .with_cancellation(cancel)
                .run(),
        )
        .await
        .unwrap();

        assert_eq!(report.outcome, RunOutcome::Aborted);
        assert_eq!(report.exit_code(), 130);
        assert_eq!(status_of(&report, "train"), vec![JobStatus::Cancelled]);
        for template in ["eval", "report"] {
            let record = report.records_for(template).next().unwrap();
            assert_eq!(record.cause, Some(FailureCause::Aborted));
        }
        assert!(provider.live().is_empty());
        assert_eq!(report.leases[0].1, LeaseState::Released);
    }

    #[tokio::test]
    async fn test_abort_during_acquisition_still_releases_lease() {
        let provider = Arc::new(FakeProvider::new().delay_acquire(Duration::from_millis(200)));
        let action = Arc::new(ScriptedAction::new());
        let cancel = CancellationSignal::new();
        let trigger = cancel.clone();
        let watcher = provider.clone();
        tokio::spawn(async move {
            while watcher.calls().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            trigger.cancel();
        });

        let report = tokio::time::timeout(
            Duration::from_secs(10),
            orchestrator(LEASED, action.clone(), provider.clone())
                .with_cancellation(cancel)
                .run(),
        )
        .await
        .unwrap();

        assert_eq!(report.outcome, RunOutcome::Aborted);
        assert!(action.calls().is_empty());
        for template in ["train", "eval", "report"] {
            let record = report.records_for(template).next().unwrap();
            assert_eq!(record.status, JobStatus::Cancelled);
        }
        assert_eq!(provider.calls(), vec!["acquire gpu-farm", "release gpu-farm"]);
        assert!(provider.live().is_empty());
        assert_eq!(report.leases, vec![("gpu-farm".to_string(), LeaseState::Released)]);
    }

    #[tokio::test]
    async fn test_plain_predicate_does_not_run_after_failed_upstream() {
        let yaml = r#"
variables:
  branch: main
jobs:
  a:
    steps:
      - id: build
        run: make
  b:
    needs: a
    if: eq(variables.branch, 'main')
    steps:
      - id: deploy
        run: ship
  c:
    needs: a
    if: failure() && eq(variables.branch, 'main')
    steps:
      - id: page
        run: alert
"#;
        let action = Arc::new(ScriptedAction::new().fail("a", "build", "boom"));
        let report = orchestrator(yaml, action.clone(), Arc::new(FakeProvider::new()))
            .run()
            .await;

        let deploy = report.records_for("b").next().unwrap();
        assert_eq!(deploy.status, JobStatus::Cancelled);
        assert_eq!(deploy.cause, Some(FailureCause::UpstreamFailed { upstream: "a".into() }));
        assert!(action.calls_for("b").is_empty());
        assert_eq!(status_of(&report, "c"), vec![JobStatus::Succeeded]);
        assert_eq!(action.calls_for("c"), vec!["page"]);
    }

    #[tokio::test]
    async fn test_panicking_job_is_internal_failure() {
        let action = Arc::new(ScriptedAction::new().panic_on("a", "build"));
        let report = orchestrator(FAN_OUT, action, Arc::new(FakeProvider::new())).run().await;
        let record = report.records_for("a").next().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(matches!(record.cause, Some(FailureCause::Internal { .. })));
        assert_eq!(status_of(&report, "b"), vec![JobStatus::Cancelled]);
    }

    #[tokio::test]
    async fn test_explicit_bound_overrides_pipeline_concurrency() {
        let yaml = "concurrency: 3\njobs:\n  a:\n    steps:\n      - run: x\n";
        let pipeline_bound = orchestrator(yaml, Arc::new(ScriptedAction::new()), Arc::new(FakeProvider::new()));
        assert_eq!(pipeline_bound.concurrency_limit(), 3);
        assert_eq!(pipeline_bound.with_max_parallel(5).concurrency_limit(), 5);
    }
}
