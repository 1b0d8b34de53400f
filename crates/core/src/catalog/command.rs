use crate::error::ActionError;
use crate::step::{Action, ActionOutput, Check, CheckOutcome, ExecContext};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn exit_description(&self) -> String {
        match self.code {
            Some(code) => format!("status {}", code),
            None => "a signal".to_string(),
        }
    }

    fn stderr_or_stdout(&self) -> Option<String> {
        [&self.stderr, &self.stdout]
            .into_iter()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .map(last_lines)
    }
}

/// A bash script plus the environment it runs with
///
/// The child is spawned with `kill_on_drop`, so the step timeout and
/// cancellation (which drop the running future) also kill the process.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    script: String,
    env: Vec<(String, String)>,
}

impl ShellCommand {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// First line of the script, for error messages
    pub fn summary(&self) -> String {
        let first = self
            .script
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or_default();
        if self.script.trim().lines().count() > 1 {
            format!("{} ...", first)
        } else {
            first.to_string()
        }
    }

    pub async fn output(&self) -> Result<CommandOutput, ActionError> {
        let mut cmd = Command::new("bash");
        cmd.arg("-euo")
            .arg("pipefail")
            .arg("-c")
            .arg(&self.script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let output = cmd.output().await.map_err(|e| ActionError::Launch {
            cmd: self.summary(),
            reason: e.to_string(),
        })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Runs a shell script; any non-zero exit is a failure
pub struct ShellAction {
    description: String,
    command: ShellCommand,
}

impl ShellAction {
    pub fn new(description: impl Into<String>, command: ShellCommand) -> Self {
        Self {
            description: description.into(),
            command,
        }
    }
}

#[async_trait]
impl Action for ShellAction {
    fn describe(&self) -> String {
        self.description.clone()
    }

    async fn run(&self, ctx: &ExecContext) -> Result<ActionOutput, ActionError> {
        tracing::debug!("Step {} running: {}", ctx.step_id, self.command.summary());
        let output = self.command.output().await?;
        if !output.success() {
            return Err(ActionError::CommandFailed {
                cmd: self.command.summary(),
                code: output.exit_description(),
                stderr: output.stderr_or_stdout(),
            });
        }

        let stdout = output.stdout.trim();
        Ok(if stdout.is_empty() {
            ActionOutput::default()
        } else {
            ActionOutput::with_detail(last_lines(stdout))
        })
    }
}

/// Satisfied when the script exits 0
pub struct CommandCheck {
    description: String,
    command: ShellCommand,
}

impl CommandCheck {
    pub fn new(description: impl Into<String>, command: ShellCommand) -> Self {
        Self {
            description: description.into(),
            command,
        }
    }
}

#[async_trait]
impl Check for CommandCheck {
    fn describe(&self) -> String {
        self.description.clone()
    }

    async fn evaluate(&self, _ctx: &ExecContext) -> Result<CheckOutcome, ActionError> {
        let output = self.command.output().await?;
        if output.success() {
            return Ok(CheckOutcome::satisfied());
        }

        let detail = match output.stderr_or_stdout() {
            Some(text) => format!("{} ({})", self.description, text),
            None => format!("{}: exited with {}", self.description, output.exit_description()),
        };
        Ok(CheckOutcome::unsatisfied(detail))
    }
}

/// Single-quote a value for interpolation into a bash script
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn last_lines(text: &str) -> String {
    const KEEP: usize = 5;
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(KEEP);
    lines[start..].join("\n")
}
