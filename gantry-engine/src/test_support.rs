// Test Support
// Scripted step actions and an in-memory resource provider

use crate::definition::ResourceScopeSpec;
use crate::lease::{LeaseError, LeaseHandle, ResourceProvider};
use crate::runners::{ActionResult, StepAction, StepContext};

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type StepKey = (String, String);

fn step_key(template: &str, step: &str) -> StepKey {
    (template.to_string(), step.to_string())
}

/// Step action whose results are configured per (template, step id).
/// Unconfigured steps succeed.
#[derive(Default)]
pub struct ScriptedAction {
    failures: HashMap<StepKey, String>,
    outputs: HashMap<StepKey, HashMap<String, String>>,
    delays: HashMap<StepKey, Duration>,
    panics: HashSet<StepKey>,
    delay: Option<Duration>,
    calls: Mutex<Vec<StepKey>>,
    secrets: Mutex<HashMap<String, HashMap<String, String>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedAction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(mut self, template: &str, step: &str, reason: &str) -> Self {
        self.failures.insert(step_key(template, step), reason.to_string());
        self
    }

    pub fn output(mut self, template: &str, step: &str, name: &str, value: &str) -> Self {
        self.outputs
            .entry(step_key(template, step))
            .or_default()
            .insert(name.to_string(), value.to_string());
        self
    }

    /// Delay applied to every step
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn delay_step(mut self, template: &str, step: &str, delay: Duration) -> Self {
        self.delays.insert(step_key(template, step), delay);
        self
    }

    pub fn panic_on(mut self, template: &str, step: &str) -> Self {
        self.panics.insert(step_key(template, step));
        self
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    /// Step ids executed for `template`, in call order
    pub fn calls_for(&self, template: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|(t, _)| t == template)
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn secret_for(&self, template: &str, name: &str) -> Option<String> {
        self.secrets.lock().get(template).and_then(|s| s.get(name).cloned())
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl StepAction for ScriptedAction {
    async fn execute(&self, ctx: StepContext) -> ActionResult {
        let key = step_key(&ctx.template, &ctx.step_id);
        self.calls.lock().push(key.clone());
        self.secrets
            .lock()
            .entry(ctx.template.clone())
            .or_default()
            .extend(ctx.secrets.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delays.get(&key).copied().or(self.delay) {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.panics.contains(&key) {
            panic!("scripted panic in {}/{}", key.0, key.1);
        }
        let mut result = match self.failures.get(&key) {
            Some(reason) => ActionResult::failure(reason.clone()),
            None => ActionResult::success(),
        };
        if let Some(outputs) = self.outputs.get(&key) {
            result.outputs.extend(outputs.clone());
        }
        result
    }
}

/// Provider that hands out `lease-<scope>` handles and tracks what is live
#[derive(Default)]
pub struct FakeProvider {
    fail_acquire: HashSet<String>,
    fail_release: HashSet<String>,
    acquire_delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
    live: Mutex<HashSet<String>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_acquire(mut self, scope: &str) -> Self {
        self.fail_acquire.insert(scope.to_string());
        self
    }

    pub fn fail_release(mut self, scope: &str) -> Self {
        self.fail_release.insert(scope.to_string());
        self
    }

    /// Hold every acquisition open for `delay` before it succeeds
    pub fn delay_acquire(mut self, delay: Duration) -> Self {
        self.acquire_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Scopes acquired and not yet released
    pub fn live(&self) -> Vec<String> {
        let mut live: Vec<_> = self.live.lock().iter().cloned().collect();
        live.sort();
        live
    }
}

#[async_trait::async_trait]
impl ResourceProvider for FakeProvider {
    async fn acquire(&self, scope: &ResourceScopeSpec) -> Result<LeaseHandle, LeaseError> {
        self.calls.lock().push(format!("acquire {}", scope.name));
        if let Some(delay) = self.acquire_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_acquire.contains(&scope.name) {
            return Err(LeaseError::Provider("no capacity".to_string()));
        }
        self.live.lock().insert(scope.name.clone());
        Ok(LeaseHandle {
            scope: scope.name.clone(),
            id: format!("lease-{}", scope.name),
        })
    }

    async fn release(&self, handle: &LeaseHandle) -> Result<(), LeaseError> {
        self.calls.lock().push(format!("release {}", handle.scope));
        if self.fail_release.contains(&handle.scope) {
            return Err(LeaseError::Provider("teardown refused".to_string()));
        }
        self.live.lock().remove(&handle.scope);
        Ok(())
    }
}
