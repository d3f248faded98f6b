//! Ephemeral resource leases.
//!
//! A lease scope is acquired when its first bound job becomes ready and is
//! released once every bound job is terminal. The scheduler drives the
//! [`LeaseManager`] state machine; provider calls run as tasks.

pub mod command;
pub mod manager;

pub use command::CommandProvider;
pub use manager::{LeaseCall, LeaseEvent, LeaseManager};

use crate::definition::ResourceScopeSpec;

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Opaque handle returned by a provider for one acquired resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseHandle {
    pub scope: String,
    pub id: String,
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("{0}")]
    Provider(String),

    #[error("provider command failed to start: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("shell '{0}' not found on PATH")]
    ShellNotFound(String),
}

/// External collaborator that provisions and decommissions resources.
///
/// Both calls may be retried once by the caller.
#[async_trait::async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn acquire(&self, scope: &ResourceScopeSpec) -> Result<LeaseHandle, LeaseError>;

    async fn release(&self, handle: &LeaseHandle) -> Result<(), LeaseError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LeaseState {
    Unacquired,
    Acquiring,
    Active,
    Releasing,
    Released,
    AcquireFailed,
    ReleaseFailed,
}

impl LeaseState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LeaseState::Released | LeaseState::AcquireFailed | LeaseState::ReleaseFailed
        )
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
