//! Test doubles for remote execution

use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::ControlError;
use crate::ssh::shell::{CommandChannel, CommandOutput, RunRequest};

type Responder = Box<dyn Fn(&RunRequest) -> Option<CommandOutput> + Send + Sync>;

/// A scripted remote host. Responders are consulted in registration
/// order; the first one that matches answers. Anything unmatched succeeds
/// with empty output.
#[derive(Default)]
pub struct ScriptedShell {
    responders: Vec<Responder>,
    history: Mutex<Vec<RunRequest>>,
}

pub fn output(exit_code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        exit_code,
        elapsed: Default::default(),
    }
}

impl ScriptedShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `pattern` with a computed output
    pub fn on(
        mut self,
        pattern: &str,
        f: impl Fn(&RunRequest) -> CommandOutput + Send + Sync + 'static,
    ) -> Self {
        let pattern = pattern.to_string();
        self.responders.push(Box::new(move |req| {
            req.command.contains(&pattern).then(|| f(req))
        }));
        self
    }

    /// Answer commands containing `pattern` with exit 0 and fixed stdout
    pub fn ok(self, pattern: &str, stdout: &str) -> Self {
        let stdout = stdout.to_string();
        self.on(pattern, move |_| output(0, &stdout, ""))
    }

    /// Answer commands containing `pattern` with a failure
    pub fn fail(self, pattern: &str, exit_code: i32, stderr: &str) -> Self {
        let stderr = stderr.to_string();
        self.on(pattern, move |_| output(exit_code, "", &stderr))
    }

    /// Every command run so far
    pub fn commands(&self) -> Vec<String> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.command.clone())
            .collect()
    }

    /// Whether any executed command contained `needle`
    pub fn ran(&self, needle: &str) -> bool {
        self.commands().iter().any(|c| c.contains(needle))
    }

    /// Stdin sent with the first command containing `needle`
    pub fn stdin_for(&self, needle: &str) -> Option<String> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.command.contains(needle))
            .and_then(|r| r.stdin.clone())
    }
}

#[async_trait]
impl CommandChannel for ScriptedShell {
    async fn run(&self, req: RunRequest) -> Result<CommandOutput, ControlError> {
        let response = self
            .responders
            .iter()
            .find_map(|responder| responder(&req))
            .unwrap_or_else(|| output(0, "", ""));
        self.history.lock().unwrap().push(req);
        Ok(response)
    }
}
