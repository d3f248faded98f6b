// Runners Module
// Step actions and the registry that maps steps to them

pub mod shell;

pub use shell::ShellAction;

use crate::definition::{StepDefinition, Value};
use crate::execution::events::ProgressSender;
use crate::execution::instance::InstanceId;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a step action can see
#[derive(Debug, Clone, Default)]
pub struct StepContext {
    pub instance: InstanceId,
    pub template: String,
    pub label: String,
    pub step_id: String,
    pub step_name: String,
    /// Script for `run:` steps
    pub run: Option<String>,
    pub shell: Option<String>,
    /// `with:` inputs for `uses:` steps
    pub inputs: HashMap<String, Value>,
    pub matrix: HashMap<String, Value>,
    pub variables: HashMap<String, Value>,
    /// Job env overlaid with step env
    pub env: HashMap<String, String>,
    pub working_dir: PathBuf,
    /// Outputs of earlier steps in the job, by step id
    pub step_outputs: HashMap<String, HashMap<String, String>>,
    /// Outputs of upstream jobs, by template name
    pub needs_outputs: HashMap<String, HashMap<String, String>>,
    /// Credentials scoped to the job, such as a lease id
    pub secrets: HashMap<String, String>,
    pub events: Option<ProgressSender>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionStatus {
    Success,
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResult {
    pub status: ActionStatus,
    pub outputs: HashMap<String, String>,
}

impl ActionResult {
    pub fn success() -> Self {
        Self {
            status: ActionStatus::Success,
            outputs: HashMap::new(),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Failure(reason.into()),
            outputs: HashMap::new(),
        }
    }

    pub fn with_output(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(name.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }
}

/// Executes one step. Implementations report failure through the result,
/// never by panicking.
#[async_trait::async_trait]
pub trait StepAction: Send + Sync {
    async fn execute(&self, ctx: StepContext) -> ActionResult;
}

/// Resolves steps to actions: `run:` steps go to the script action, `uses:`
/// steps to an action registered under that name
pub struct ActionRegistry {
    run: Arc<dyn StepAction>,
    named: HashMap<String, Arc<dyn StepAction>>,
}

impl ActionRegistry {
    /// Registry running scripts with `ShellAction`
    pub fn new(default_shell: impl Into<String>) -> Self {
        Self::with_run_action(Arc::new(ShellAction::new(default_shell)))
    }

    pub fn with_run_action(run: Arc<dyn StepAction>) -> Self {
        Self {
            run,
            named: HashMap::new(),
        }
    }

    pub fn register(mut self, name: impl Into<String>, action: Arc<dyn StepAction>) -> Self {
        self.named.insert(name.into(), action);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.named.keys().map(String::as_str)
    }

    /// The action for `step`, or the reason there is none
    pub fn resolve(&self, step: &StepDefinition) -> Result<Arc<dyn StepAction>, String> {
        match (&step.run, &step.uses) {
            (Some(_), _) => Ok(self.run.clone()),
            (None, Some(name)) => self
                .named
                .get(name)
                .cloned()
                .ok_or_else(|| format!("unknown action '{}'", name)),
            (None, None) => Err("step has neither 'run' nor 'uses'".to_string()),
        }
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait::async_trait]
    impl StepAction for Fixed {
        async fn execute(&self, _ctx: StepContext) -> ActionResult {
            ActionResult::success().with_output("from", self.0)
        }
    }

    fn step(run: Option<&str>, uses: Option<&str>) -> StepDefinition {
        StepDefinition {
            run: run.map(str::to_string),
            uses: uses.map(str::to_string),
            ..StepDefinition::default()
        }
    }

    #[tokio::test]
    async fn test_resolve_routes_by_kind() {
        let registry = ActionRegistry::with_run_action(Arc::new(Fixed("run")))
            .register("notify", Arc::new(Fixed("notify")));

        let run = registry.resolve(&step(Some("make"), None)).unwrap();
        assert_eq!(run.execute(StepContext::default()).await.outputs["from"], "run");

        let named = registry.resolve(&step(None, Some("notify"))).unwrap();
        assert_eq!(named.execute(StepContext::default()).await.outputs["from"], "notify");
    }

    #[test]
    fn test_unknown_action_is_reported() {
        let registry = ActionRegistry::default();
        let err = registry.resolve(&step(None, Some("deploy"))).err().unwrap();
        assert!(err.contains("deploy"));
        assert!(registry.resolve(&step(None, None)).is_err());
    }

    #[test]
    fn test_action_result_helpers() {
        assert!(ActionResult::success().is_success());
        let failed = ActionResult::failure("boom");
        assert_eq!(failed.status, ActionStatus::Failure("boom".into()));
    }
}
