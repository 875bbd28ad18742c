//! External command execution.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

/// Upper bound on the error text stored in `last_error`.
pub const MAX_ERROR_LEN: usize = 4096;

/// Captured outcome of one command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Exit status zero.
    pub success: bool,
    /// `None` when the process was killed by a signal or timed out.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl ExecutionResult {
    /// Human-readable failure detail, bounded by [`MAX_ERROR_LEN`].
    ///
    /// `exit code N: <tail of stderr, or stdout if stderr is empty>`.
    pub fn failure_text(&self) -> String {
        let head = if self.timed_out {
            format!("timed out after {}ms", self.duration.as_millis())
        } else {
            match self.exit_code {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            }
        };

        let output = match self.stderr.trim() {
            "" => self.stdout.trim(),
            err => err,
        };
        if output.is_empty() {
            return head;
        }

        let budget = MAX_ERROR_LEN.saturating_sub(head.len() + 2);
        format!("{head}: {}", tail(output, budget))
    }
}

/// Last `max` bytes of `s`, cut on a char boundary.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// Command execution error: the process could not be run at all.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to spawn command: {0}")]
    Spawn(String),
}

/// Executes a job's command payload.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> Result<ExecutionResult, RunnerError>;
}

/// Runs commands through the platform shell (`sh -c`, or `cmd /C` on Windows).
///
/// The child is killed if the returned future is dropped or the timeout
/// elapses.
#[derive(Debug, Clone, Default)]
pub struct ShellCommandRunner {
    timeout: Option<Duration>,
}

impl ShellCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` or a zero duration means no limit.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    fn command(command: &str) -> Command {
        #[cfg(windows)]
        let mut cmd = {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(command);
            c
        };
        #[cfg(not(windows))]
        let mut cmd = {
            let mut c = Command::new("sh");
            c.arg("-c").arg(command);
            c
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(&self, command: &str) -> Result<ExecutionResult, RunnerError> {
        let start = Instant::now();
        let mut child = Self::command(command);
        let output = child.output();

        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, output).await {
                Ok(result) => result,
                Err(_) => {
                    return Ok(ExecutionResult {
                        success: false,
                        exit_code: None,
                        stdout: String::new(),
                        stderr: String::new(),
                        duration: start.elapsed(),
                        timed_out: true,
                    });
                }
            },
            None => output.await,
        }
        .map_err(|e| RunnerError::Spawn(e.to_string()))?;

        Ok(ExecutionResult {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: start.elapsed(),
            timed_out: false,
        })
    }
}
