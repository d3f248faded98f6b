// Lease Manager
// Per-scope lease state machine with slot accounting

use crate::definition::ResourceScopeSpec;
use crate::execution::instance::InstanceId;
use crate::lease::{LeaseHandle, LeaseState, ResourceProvider};

use std::sync::Arc;

struct ScopeLease {
    spec: ResourceScopeSpec,
    state: LeaseState,
    handle: Option<LeaseHandle>,
    bound: Vec<InstanceId>,
    in_use: usize,
}

/// Completion of a provider call
#[derive(Debug)]
pub enum LeaseEvent {
    Acquired {
        scope: usize,
        result: Result<LeaseHandle, String>,
    },
    Released {
        scope: usize,
        result: Result<(), String>,
    },
}

/// State change applied by [`LeaseManager::complete`]
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseTransition {
    pub scope: usize,
    pub state: LeaseState,
    pub error: Option<String>,
}

enum CallKind {
    Acquire(ResourceScopeSpec),
    Release(LeaseHandle),
}

/// A pending provider call, detached from the manager so it can run as a task
pub struct LeaseCall {
    scope: usize,
    kind: CallKind,
    provider: Arc<dyn ResourceProvider>,
    retries: u32,
}

impl LeaseCall {
    pub fn scope(&self) -> usize {
        self.scope
    }

    pub async fn run(self) -> LeaseEvent {
        let mut attempt = 0;
        match &self.kind {
            CallKind::Acquire(spec) => loop {
                match self.provider.acquire(spec).await {
                    Ok(handle) => {
                        return LeaseEvent::Acquired {
                            scope: self.scope,
                            result: Ok(handle),
                        }
                    }
                    Err(err) if attempt < self.retries => {
                        attempt += 1;
                        tracing::warn!(scope = %spec.name, error = %err, "lease acquisition failed, retrying");
                    }
                    Err(err) => {
                        return LeaseEvent::Acquired {
                            scope: self.scope,
                            result: Err(err.to_string()),
                        }
                    }
                }
            },
            CallKind::Release(handle) => loop {
                match self.provider.release(handle).await {
                    Ok(()) => {
                        return LeaseEvent::Released {
                            scope: self.scope,
                            result: Ok(()),
                        }
                    }
                    Err(err) if attempt < self.retries => {
                        attempt += 1;
                        tracing::warn!(scope = %handle.scope, error = %err, "lease release failed, retrying");
                    }
                    Err(err) => {
                        return LeaseEvent::Released {
                            scope: self.scope,
                            result: Err(err.to_string()),
                        }
                    }
                }
            },
        }
    }
}

pub struct LeaseManager {
    provider: Arc<dyn ResourceProvider>,
    retries: u32,
    leases: Vec<ScopeLease>,
}

impl LeaseManager {
    /// `retries` is clamped to one extra attempt per call
    pub fn new(provider: Arc<dyn ResourceProvider>, scopes: &[ResourceScopeSpec], retries: u32) -> Self {
        Self {
            provider,
            retries: retries.min(1),
            leases: scopes
                .iter()
                .map(|spec| ScopeLease {
                    spec: spec.clone(),
                    state: LeaseState::Unacquired,
                    handle: None,
                    bound: Vec::new(),
                    in_use: 0,
                })
                .collect(),
        }
    }

    pub fn bind(&mut self, scope: usize, instance: InstanceId) {
        self.leases[scope].bound.push(instance);
    }

    pub fn bound(&self, scope: usize) -> &[InstanceId] {
        &self.leases[scope].bound
    }

    pub fn state(&self, scope: usize) -> LeaseState {
        self.leases[scope].state
    }

    pub fn name(&self, scope: usize) -> &str {
        &self.leases[scope].spec.name
    }

    pub fn handle(&self, scope: usize) -> Option<&LeaseHandle> {
        self.leases[scope].handle.as_ref()
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Unacquired -> Acquiring
    pub fn begin_acquire(&mut self, scope: usize) -> Option<LeaseCall> {
        let lease = &mut self.leases[scope];
        if lease.state != LeaseState::Unacquired {
            return None;
        }
        lease.state = LeaseState::Acquiring;
        tracing::info!(scope = %lease.spec.name, "acquiring lease");
        Some(LeaseCall {
            scope,
            kind: CallKind::Acquire(lease.spec.clone()),
            provider: Arc::clone(&self.provider),
            retries: self.retries,
        })
    }

    /// Active -> Releasing
    pub fn begin_release(&mut self, scope: usize) -> Option<LeaseCall> {
        let lease = &mut self.leases[scope];
        if lease.state != LeaseState::Active {
            return None;
        }
        let handle = lease.handle.clone()?;
        lease.state = LeaseState::Releasing;
        tracing::info!(scope = %lease.spec.name, lease = %handle.id, "releasing lease");
        Some(LeaseCall {
            scope,
            kind: CallKind::Release(handle),
            provider: Arc::clone(&self.provider),
            retries: self.retries,
        })
    }

    /// Apply the outcome of a provider call
    pub fn complete(&mut self, event: LeaseEvent) -> LeaseTransition {
        match event {
            LeaseEvent::Acquired { scope, result } => {
                let lease = &mut self.leases[scope];
                match result {
                    Ok(handle) => {
                        tracing::info!(scope = %lease.spec.name, lease = %handle.id, "lease active");
                        lease.handle = Some(handle);
                        lease.state = LeaseState::Active;
                        LeaseTransition {
                            scope,
                            state: lease.state,
                            error: None,
                        }
                    }
                    Err(error) => {
                        tracing::warn!(scope = %lease.spec.name, %error, "lease acquisition failed");
                        lease.state = LeaseState::AcquireFailed;
                        LeaseTransition {
                            scope,
                            state: lease.state,
                            error: Some(error),
                        }
                    }
                }
            }
            LeaseEvent::Released { scope, result } => {
                let lease = &mut self.leases[scope];
                lease.in_use = 0;
                match result {
                    Ok(()) => {
                        tracing::info!(scope = %lease.spec.name, "lease released");
                        lease.state = LeaseState::Released;
                        LeaseTransition {
                            scope,
                            state: lease.state,
                            error: None,
                        }
                    }
                    Err(error) => {
                        tracing::warn!(scope = %lease.spec.name, %error, "lease release failed");
                        lease.state = LeaseState::ReleaseFailed;
                        LeaseTransition {
                            scope,
                            state: lease.state,
                            error: Some(error),
                        }
                    }
                }
            }
        }
    }

    /// Take one job slot on an active lease
    pub fn try_reserve(&mut self, scope: usize) -> bool {
        let lease = &mut self.leases[scope];
        if lease.state == LeaseState::Active && lease.in_use < lease.spec.capacity {
            lease.in_use += 1;
            true
        } else {
            false
        }
    }

    pub fn free_slot(&mut self, scope: usize) {
        let lease = &mut self.leases[scope];
        lease.in_use = lease.in_use.saturating_sub(1);
    }

    /// Release calls for every active lease; run on every exit path
    pub fn cleanup_all(&mut self) -> Vec<LeaseCall> {
        (0..self.leases.len())
            .filter_map(|scope| self.begin_release(scope))
            .collect()
    }

    /// Whether any scope is still held or being acquired
    pub fn has_live_leases(&self) -> bool {
        self.leases
            .iter()
            .any(|l| matches!(l.state, LeaseState::Acquiring | LeaseState::Active | LeaseState::Releasing))
    }

    pub fn states(&self) -> Vec<(String, LeaseState)> {
        self.leases
            .iter()
            .map(|l| (l.spec.name.clone(), l.state))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeaseError;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FlakyProvider {
        acquire_failures: AtomicUsize,
        release_failures: AtomicUsize,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ResourceProvider for FlakyProvider {
        async fn acquire(&self, scope: &ResourceScopeSpec) -> Result<LeaseHandle, LeaseError> {
            self.calls.lock().push(format!("acquire {}", scope.name));
            if self.acquire_failures.load(Ordering::SeqCst) > 0 {
                self.acquire_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(LeaseError::Provider("no capacity".into()));
            }
            Ok(LeaseHandle {
                scope: scope.name.clone(),
                id: format!("{}-1", scope.name),
            })
        }

        async fn release(&self, handle: &LeaseHandle) -> Result<(), LeaseError> {
            self.calls.lock().push(format!("release {}", handle.id));
            if self.release_failures.load(Ordering::SeqCst) > 0 {
                self.release_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(LeaseError::Provider("api down".into()));
            }
            Ok(())
        }
    }

    fn manager(provider: Arc<FlakyProvider>, capacity: usize) -> LeaseManager {
        let mut spec = ResourceScopeSpec::new("farm");
        spec.capacity = capacity;
        LeaseManager::new(provider, &[spec], 5)
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let provider = Arc::new(FlakyProvider::default());
        let mut leases = manager(provider.clone(), 1);
        assert_eq!(leases.state(0), LeaseState::Unacquired);

        let call = leases.begin_acquire(0).unwrap();
        assert!(leases.begin_acquire(0).is_none());
        assert_eq!(leases.state(0), LeaseState::Acquiring);

        let transition = leases.complete(call.run().await);
        assert_eq!(transition.state, LeaseState::Active);

        assert!(leases.try_reserve(0));
        assert!(!leases.try_reserve(0), "capacity 1 admits one job");
        leases.free_slot(0);
        assert!(leases.try_reserve(0));

        let release = leases.begin_release(0).unwrap();
        assert_eq!(leases.state(0), LeaseState::Releasing);
        assert!(leases.begin_release(0).is_none(), "release happens once");
        let transition = leases.complete(release.run().await);
        assert_eq!(transition.state, LeaseState::Released);
        assert!(!leases.has_live_leases());

        assert_eq!(*provider.calls.lock(), vec!["acquire farm", "release farm-1"]);
    }

    #[tokio::test]
    async fn test_retries_at_most_once() {
        let provider = Arc::new(FlakyProvider::default());
        provider.acquire_failures.store(1, Ordering::SeqCst);
        let mut leases = manager(provider.clone(), 1);
        let event = leases.begin_acquire(0).unwrap().run().await;
        assert_eq!(leases.complete(event).state, LeaseState::Active);

        let provider = Arc::new(FlakyProvider::default());
        provider.acquire_failures.store(2, Ordering::SeqCst);
        let mut leases = manager(provider.clone(), 1);
        let event = leases.begin_acquire(0).unwrap().run().await;
        let transition = leases.complete(event);
        assert_eq!(transition.state, LeaseState::AcquireFailed);
        assert!(transition.error.unwrap().contains("no capacity"));
        assert_eq!(provider.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_release_failure_is_terminal() {
        let provider = Arc::new(FlakyProvider::default());
        provider.release_failures.store(5, Ordering::SeqCst);
        let mut leases = manager(provider.clone(), 2);
        let event = leases.begin_acquire(0).unwrap().run().await;
        leases.complete(event);

        let calls = leases.cleanup_all();
        assert_eq!(calls.len(), 1);
        for call in calls {
            let transition = leases.complete(call.run().await);
            assert_eq!(transition.state, LeaseState::ReleaseFailed);
        }
        assert!(leases.cleanup_all().is_empty());
        assert!(!leases.try_reserve(0));
    }

    #[test]
    fn test_cleanup_skips_unacquired_scopes() {
        let provider = Arc::new(FlakyProvider::default());
        let mut leases = manager(provider, 1);
        assert!(leases.cleanup_all().is_empty());
        assert_eq!(leases.states(), vec![("farm".to_string(), LeaseState::Unacquired)]);
    }
}
