//! Operator-supplied scripts.
//!
//! Scripts are opaque programs described by a path, an argument string and a
//! working directory, any of which may contain the environment marker. A
//! [`ScriptRef`] is resolved against the selected environment into a
//! [`ScriptInvocation`] right before each run, so switching environments
//! takes effect on the next invocation.
//!
//! Success means exit code 0 and nothing on stderr.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::environment::{CurrentEnvironment, EnvironmentMapping};
use crate::error::ScriptError;

/// Boxed future returned by [`ScriptRunner`] methods.
pub type ScriptFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ScriptError>> + Send + 'a>>;

/// A configured script before environment substitution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptRef {
    pub path: String,
    /// Whitespace separated, double quotes group.
    pub args: String,
    pub working_dir: String,
}

impl ScriptRef {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = args.into();
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.path.trim().is_empty()
    }

    /// Strip surrounding quotes and expand `$cwd` to `base_dir`.
    #[must_use]
    pub fn normalized(&self, base_dir: &Path) -> Self {
        let base = base_dir.display().to_string();
        let clean = |s: &str| s.trim().trim_matches('"').replace("$cwd", &base);
        Self {
            path: clean(&self.path),
            args: self.args.trim().to_string(),
            working_dir: clean(&self.working_dir),
        }
    }

    /// Whether the path exists under at least one environment.
    #[must_use]
    pub fn exists_in_any(&self, mapping: &EnvironmentMapping) -> bool {
        mapping
            .all_candidates(&self.path)
            .iter()
            .any(|candidate| Path::new(candidate).is_file())
    }

    /// Substitute the selected environment and check the program exists.
    ///
    /// A working directory that does not exist resolves to `None` and the
    /// script inherits the supervisor's directory.
    pub fn resolve(&self, env: &CurrentEnvironment) -> Result<ScriptInvocation, ScriptError> {
        let program = PathBuf::from(env.resolve(&self.path));
        if !program.is_file() {
            return Err(ScriptError::NotFound {
                configured: self.path.clone(),
                resolved: program.display().to_string(),
            });
        }

        let working_dir = Some(env.resolve(&self.working_dir))
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .filter(|dir| dir.is_dir());

        Ok(ScriptInvocation {
            program,
            args: split_arguments(&env.resolve(&self.args)),
            working_dir,
        })
    }
}

/// Split on whitespace, keeping double-quoted spans together.
#[must_use]
pub fn split_arguments(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quoted = false;

    for ch in input.trim().chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                quoted = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() || quoted {
                    parts.push(std::mem::take(&mut current));
                }
                quoted = false;
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() || quoted {
        parts.push(current);
    }
    parts
}

/// A fully resolved script ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl ScriptInvocation {
    /// Append one argv element, e.g. a target's full command line.
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// File name of the program, for messages.
    #[must_use]
    pub fn name(&self) -> String {
        self.program.file_name().map_or_else(
            || self.program.display().to_string(),
            |n| n.to_string_lossy().into_owned(),
        )
    }

    fn is_powershell(&self) -> bool {
        self.program
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("ps1"))
    }

    fn command(&self) -> Command {
        let mut command = if self.is_powershell() {
            let mut c = Command::new("powershell");
            c.args(["-NoProfile", "-ExecutionPolicy", "Bypass", "-File"])
                .arg(&self.program);
            c
        } else {
            Command::new(&self.program)
        };
        command.args(&self.args);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

/// Captured result of a finished script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutput {
    pub program: String,
    /// `None` when the script was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl ScriptOutput {
    /// Stderr output is reported before a bad exit code.
    pub fn check(&self) -> Result<(), ScriptError> {
        if !self.stderr.is_empty() {
            return Err(ScriptError::Stderr {
                program: self.program.clone(),
                lines: self.stderr.clone(),
            });
        }
        match self.exit_code {
            Some(0) => Ok(()),
            Some(code) => Err(ScriptError::ExitCode {
                program: self.program.clone(),
                code,
            }),
            None => Err(ScriptError::Terminated {
                program: self.program.clone(),
            }),
        }
    }
}

/// Non-blank lines, trimmed.
fn output_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Runs scripts on behalf of the supervisor.
pub trait ScriptRunner: Send + Sync {
    /// Run to completion, capturing stdout and stderr.
    fn run<'a>(&'a self, invocation: &'a ScriptInvocation) -> ScriptFuture<'a, ScriptOutput>;

    /// Start without waiting or capturing output.
    fn spawn_detached(&self, invocation: &ScriptInvocation) -> Result<(), ScriptError>;
}

pub type ScriptRunnerHandle = Arc<dyn ScriptRunner>;

/// [`ScriptRunner`] on `tokio::process`. Zero timeout means none.
#[derive(Debug, Clone)]
pub struct CommandScriptRunner {
    timeout: Duration,
}

impl CommandScriptRunner {
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run_inner(&self, invocation: &ScriptInvocation) -> Result<ScriptOutput, ScriptError> {
        let program = invocation.name();
        let child = invocation
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ScriptError::Spawn {
                program: program.clone(),
                source,
            })?;

        let waited = if self.timeout.is_zero() {
            child.wait_with_output().await
        } else {
            tokio::time::timeout(self.timeout, child.wait_with_output())
                .await
                .map_err(|_| ScriptError::Timeout {
                    program: program.clone(),
                    timeout: self.timeout,
                })?
        };
        let output = waited.map_err(|source| ScriptError::Spawn {
            program: program.clone(),
            source,
        })?;

        tracing::trace!(
            program = %program,
            exit_code = ?output.status.code(),
            "script finished"
        );
        Ok(ScriptOutput {
            program,
            exit_code: output.status.code(),
            stdout: output_lines(&output.stdout),
            stderr: output_lines(&output.stderr),
        })
    }
}

impl Default for CommandScriptRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl ScriptRunner for CommandScriptRunner {
    fn run<'a>(&'a self, invocation: &'a ScriptInvocation) -> ScriptFuture<'a, ScriptOutput> {
        Box::pin(async move { self.run_inner(invocation).await })
    }

    fn spawn_detached(&self, invocation: &ScriptInvocation) -> Result<(), ScriptError> {
        let child = invocation
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ScriptError::Spawn {
                program: invocation.name(),
                source,
            })?;
        tracing::info!(program = %invocation.name(), pid = ?child.id(), "started detached script");
        Ok(())
    }
}
