// Command Provider
// Provisions lease scopes by running their acquire/release shell commands

use crate::definition::ResourceScopeSpec;
use crate::lease::{LeaseError, LeaseHandle, ResourceProvider};

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Runs `acquire` with the scope's spec in `GANTRY_SPEC_*` variables; the last
/// non-empty stdout line becomes the lease id. `release` receives it as
/// `GANTRY_LEASE_ID`. Scopes without commands get a local handle.
pub struct CommandProvider {
    shell: String,
    working_dir: PathBuf,
    release_commands: HashMap<String, String>,
}

impl CommandProvider {
    pub fn new(shell: impl Into<String>, working_dir: impl Into<PathBuf>, scopes: &[ResourceScopeSpec]) -> Self {
        Self {
            shell: shell.into(),
            working_dir: working_dir.into(),
            release_commands: scopes
                .iter()
                .filter_map(|s| s.release.clone().map(|cmd| (s.name.clone(), cmd)))
                .collect(),
        }
    }

    async fn run(&self, script: &str, env: HashMap<String, String>) -> Result<String, LeaseError> {
        let shell = which::which(&self.shell).map_err(|_| LeaseError::ShellNotFound(self.shell.clone()))?;
        let output = Command::new(shell)
            .arg("-c")
            .arg(script)
            .current_dir(&self.working_dir)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.trim();
            return Err(LeaseError::Provider(match output.status.code() {
                Some(code) if detail.is_empty() => format!("command exited with code {}", code),
                Some(code) => format!("command exited with code {}: {}", code, detail),
                None => "command terminated by signal".to_string(),
            }));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait::async_trait]
impl ResourceProvider for CommandProvider {
    async fn acquire(&self, scope: &ResourceScopeSpec) -> Result<LeaseHandle, LeaseError> {
        let Some(script) = &scope.acquire else {
            return Ok(LeaseHandle {
                scope: scope.name.clone(),
                id: format!("local-{}", scope.name),
            });
        };

        let mut env = HashMap::new();
        env.insert("GANTRY_SCOPE".to_string(), scope.name.clone());
        for (key, value) in &scope.spec {
            env.insert(spec_var(key), value.as_string());
        }

        let stdout = self.run(script, env).await?;
        let id = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or(scope.name.as_str())
            .to_string();
        Ok(LeaseHandle {
            scope: scope.name.clone(),
            id,
        })
    }

    async fn release(&self, handle: &LeaseHandle) -> Result<(), LeaseError> {
        let Some(script) = self.release_commands.get(&handle.scope) else {
            return Ok(());
        };
        let env = HashMap::from([
            ("GANTRY_SCOPE".to_string(), handle.scope.clone()),
            ("GANTRY_LEASE_ID".to_string(), handle.id.clone()),
        ]);
        self.run(script, env).await.map(|_| ())
    }
}

fn spec_var(key: &str) -> String {
    let normalized: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("GANTRY_SPEC_{}", normalized)
}
