//! Remote shell primitive

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::ControlError;

/// Default per-command deadline
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for long transfers such as release archive downloads
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Per-command cap on captured output
pub const MAX_CAPTURED_OUTPUT: usize = 16 * 1024 * 1024;

/// Appended to a stream that hit the capture cap
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// One command invocation. Callers quote their own arguments; the command
/// runs under the default remote shell.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub command: String,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
}

impl RunRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stdin: None,
            timeout: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Captured result of a remote command. A non-zero exit code is not an
/// error at this layer; callers decide what it means.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Tail of stderr preserved verbatim for operator inspection
    pub fn stderr_tail(&self, max_lines: usize) -> String {
        let lines: Vec<&str> = self.stderr.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

/// A shell-command channel to one remote host
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn run(&self, req: RunRequest) -> Result<CommandOutput, ControlError>;

    /// Run a plain command with the default timeout
    async fn run_cmd(&self, command: &str) -> Result<CommandOutput, ControlError> {
        self.run(RunRequest::new(command)).await
    }
}

#[async_trait]
impl<T: CommandChannel + ?Sized> CommandChannel for std::sync::Arc<T> {
    async fn run(&self, req: RunRequest) -> Result<CommandOutput, ControlError> {
        (**self).run(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_tail() {
        let output = CommandOutput {
            stderr: "a\nb\nc\nd".to_string(),
            ..Default::default()
        };
        assert_eq!(output.stderr_tail(2), "c\nd");
        assert_eq!(output.stderr_tail(10), "a\nb\nc\nd");
    }

    #[test]
    fn test_success_is_exit_zero() {
        assert!(CommandOutput::default().success());
        let failed = CommandOutput {
            exit_code: 2,
            ..Default::default()
        };
        assert!(!failed.success());
    }
}
