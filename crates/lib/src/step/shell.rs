//! Shell command step.
//!
//! Commands run through a shell inside the rule's output scope with an
//! isolated environment:
//! - all inherited environment variables are cleared
//! - `HOME` is set to `/homeless-shelter`
//! - `TMPDIR`/`TMP`/`TEMP` point at `tmp/` inside the scope
//! - `out` is set to the scope directory
//! - `LANG`/`LC_ALL` are `C` and `SOURCE_DATE_EPOCH` is fixed
//! - the engine's configured environment, then the step's own, is merged on top

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{ExecutionContext, Step, StepExecutionResult};
use crate::consts::SOURCE_DATE_EPOCH;

/// Longest stderr tail carried in a failure message.
const MAX_STDERR_IN_MESSAGE: usize = 4096;

#[derive(Debug, Clone)]
pub struct ShellStep {
  cmd: String,
  env: BTreeMap<String, String>,
  cwd: Option<PathBuf>,
}

impl ShellStep {
  pub fn new(cmd: impl Into<String>) -> Self {
    Self {
      cmd: cmd.into(),
      env: BTreeMap::new(),
      cwd: None,
    }
  }

  pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
    self.env = env;
    self
  }

  /// Run in a scope-relative subdirectory instead of the scope itself.
  pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
    self.cwd = Some(cwd.into());
    self
  }

  pub fn cmd(&self) -> &str {
    &self.cmd
  }
}

#[async_trait]
impl Step for ShellStep {
  fn short_name(&self) -> &str {
    "shell"
  }

  fn description(&self, ctx: &ExecutionContext) -> String {
    let (shell, args) = get_shell(ctx.shell());
    format!("{} {} {}", shell, args.join(" "), self.cmd)
  }

  async fn execute(&self, ctx: &ExecutionContext) -> StepExecutionResult {
    info!(cmd = %self.cmd, "executing command");

    let working_dir = match &self.cwd {
      Some(cwd) => match ctx.scoped(cwd) {
        Ok(p) => p,
        Err(e) => return e.into(),
      },
      None => ctx.scope_dir().to_path_buf(),
    };

    let tmp_dir = ctx.scope_dir().join("tmp");
    for dir in [&working_dir, &tmp_dir] {
      if let Err(e) = tokio::fs::create_dir_all(dir).await {
        return StepExecutionResult::failure(format!("failed to create {}: {}", dir.display(), e));
      }
    }

    let (shell, shell_args) = get_shell(ctx.shell());

    let mut command = Command::new(&shell);
    command
      .args(&shell_args)
      .arg(&self.cmd)
      .current_dir(&working_dir)
      .env_clear()
      .env("HOME", "/homeless-shelter")
      .env("TMPDIR", &tmp_dir)
      .env("TMP", &tmp_dir)
      .env("TEMP", &tmp_dir)
      .env("out", ctx.scope_dir())
      .env("LANG", "C")
      .env("LC_ALL", "C")
      .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH)
      .envs(ctx.env())
      .envs(&self.env);

    debug!(shell = %shell, working_dir = ?working_dir, "spawning process");

    let output = match command.output().await {
      Ok(output) => output,
      Err(e) => return StepExecutionResult::failure(format!("failed to spawn {}: {}", shell, e)),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
      debug!(stdout = %stdout.trim(), "command output");
    }

    if output.status.success() {
      return StepExecutionResult::Success;
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    let tail_start = stderr
      .char_indices()
      .rev()
      .nth(MAX_STDERR_IN_MESSAGE)
      .map(|(i, _)| i)
      .unwrap_or(0);

    let code = output.status.code();
    let mut message = match code {
      Some(code) => format!("command exited with code {}", code),
      None => "command terminated by signal".to_string(),
    };
    if !stderr.is_empty() {
      message.push_str(": ");
      message.push_str(&stderr[tail_start..]);
    }

    StepExecutionResult::Failure {
      exit_code: code,
      message,
    }
  }
}

/// Shell binary and the flag(s) that precede the command string.
///
/// Defaults to `/bin/sh -c` (Unix) or `cmd.exe /C` (Windows) rather than the
/// user's login shell, whose profile could leak into the environment.
fn get_shell(override_shell: Option<&str>) -> (String, Vec<String>) {
  if let Some(shell) = override_shell {
    let args = if shell.contains("powershell") || shell.contains("pwsh") {
      vec!["-NoProfile".to_string(), "-Command".to_string()]
    } else if shell.contains("cmd") {
      vec!["/C".to_string()]
    } else {
      vec!["-c".to_string()]
    };
    return (shell.to_string(), args);
  }

  #[cfg(windows)]
  {
    ("cmd.exe".to_string(), vec!["/C".to_string()])
  }

  #[cfg(not(windows))]
  {
    ("/bin/sh".to_string(), vec!["-c".to_string()])
  }
}
