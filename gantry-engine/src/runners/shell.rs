// Shell Action
// Runs `run:` scripts through a shell and captures step outputs

use crate::execution::events::{EventSender, ExecutionEvent};
use crate::runners::{ActionResult, ActionStatus, StepAction, StepContext};

use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

const SET_OUTPUT: &str = "::set-output name=";

/// Executable and leading arguments for a shell name
fn shell_command(shell: &str) -> (&str, &'static [&'static str]) {
    match shell {
        "pwsh" => ("pwsh", &["-NoLogo", "-NoProfile", "-Command"]),
        "powershell" => {
            if cfg!(target_os = "windows") {
                ("powershell.exe", &["-NoLogo", "-NoProfile", "-Command"])
            } else {
                ("pwsh", &["-NoLogo", "-NoProfile", "-Command"])
            }
        }
        "cmd" => ("cmd", &["/C"]),
        "bash" => ("bash", &["-e", "-c"]),
        other => (other, &["-c"]),
    }
}

/// Parse `::set-output name=<key>::<value>`
fn parse_set_output(line: &str) -> Option<(String, String)> {
    let rest = line.trim_start().strip_prefix(SET_OUTPUT)?;
    let (name, value) = rest.split_once("::")?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.to_string()))
}

/// Feed each line of `stream` to `on_line` until EOF. Invalid UTF-8 is
/// replaced so the pipe keeps draining.
async fn drain_lines<R, F>(stream: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                on_line(line.trim_end_matches(|c| c == '\n' || c == '\r').to_string());
            }
            Err(e) => {
                tracing::debug!(error = %e, "script output stream closed");
                break;
            }
        }
    }
}

fn env_suffix(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

/// Script runner for `run:` steps.
///
/// Besides the step env the script sees `GANTRY_JOB`, `GANTRY_STEP`,
/// `GANTRY_MATRIX_<AXIS>`, `GANTRY_VAR_<NAME>` and the job's secrets.
/// Output lines are streamed as events while the script runs.
pub struct ShellAction {
    default_shell: String,
}

impl ShellAction {
    pub fn new(default_shell: impl Into<String>) -> Self {
        Self {
            default_shell: default_shell.into(),
        }
    }

    fn environment(ctx: &StepContext) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("GANTRY_JOB".to_string(), ctx.template.clone());
        env.insert("GANTRY_STEP".to_string(), ctx.step_id.clone());
        for (axis, value) in &ctx.matrix {
            env.insert(format!("GANTRY_MATRIX_{}", env_suffix(axis)), value.as_string());
        }
        for (name, value) in &ctx.variables {
            env.insert(format!("GANTRY_VAR_{}", env_suffix(name)), value.as_string());
        }
        env.extend(ctx.secrets.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.extend(ctx.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

impl Default for ShellAction {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait::async_trait]
impl StepAction for ShellAction {
    async fn execute(&self, ctx: StepContext) -> ActionResult {
        let Some(script) = ctx.run.as_deref() else {
            return ActionResult::failure("no script to run");
        };
        let shell_name = ctx.shell.as_deref().unwrap_or(&self.default_shell);
        let (program, args) = shell_command(shell_name);
        let Ok(program) = which::which(program) else {
            return ActionResult::failure(format!("shell '{}' not found", shell_name));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(script)
            .current_dir(&ctx.working_dir)
            .envs(Self::environment(&ctx))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return ActionResult::failure(format!("failed to spawn '{}': {}", shell_name, e)),
        };
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return ActionResult::failure("script output was not captured");
        };

        let instance = ctx.instance;
        let events = ctx.events.clone();
        let step_id = ctx.step_id.clone();
        let stdout_task = tokio::spawn(async move {
            let mut outputs = HashMap::new();
            drain_lines(stdout, |line| {
                if let Some((name, value)) = parse_set_output(&line) {
                    outputs.insert(name, value);
                } else {
                    events.send_event(ExecutionEvent::step_output(instance, step_id.as_str(), line, false));
                }
            })
            .await;
            outputs
        });

        let events = ctx.events.clone();
        let step_id = ctx.step_id.clone();
        let stderr_task = tokio::spawn(async move {
            let mut last = None;
            drain_lines(stderr, |line| {
                if !line.trim().is_empty() {
                    last = Some(line.clone());
                }
                events.send_event(ExecutionEvent::step_output(instance, step_id.as_str(), line, true));
            })
            .await;
            last
        });

        let status = child.wait().await;
        let outputs = stdout_task.await.unwrap_or_default();
        let last_error = stderr_task.await.ok().flatten();

        let failure = match status {
            Ok(status) if status.success() => None,
            Ok(status) => Some(match status.code() {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            }),
            Err(e) => Some(format!("failed to wait for script: {}", e)),
        };

        match failure {
            None => ActionResult {
                status: ActionStatus::Success,
                outputs,
            },
            Some(reason) => {
                let reason = match last_error {
                    Some(line) => format!("{}: {}", reason, line.trim()),
                    None => reason,
                };
                ActionResult {
                    status: ActionStatus::Failure(reason),
                    outputs,
                }
            }
        }
    }
}
