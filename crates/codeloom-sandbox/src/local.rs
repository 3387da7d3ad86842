use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::{RawExecution, SandboxBackend, SandboxFailure, SandboxRequest};

/// Runs programs with a local interpreter. Development only: there is no
/// isolation beyond a scrubbed environment and the timeout.
pub struct LocalProcessBackend {
    python: String,
}

impl LocalProcessBackend {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
        }
    }
}

impl Default for LocalProcessBackend {
    fn default() -> Self {
        Self::new("python3")
    }
}

#[async_trait]
impl SandboxBackend for LocalProcessBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn run(&self, request: &SandboxRequest) -> Result<RawExecution, SandboxFailure> {
        let mut command = Command::new(&self.python);
        command
            .arg("-")
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|err| SandboxFailure::Transport(format!("failed to start {}: {err}", self.python)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxFailure::Transport("stdin unavailable".to_string()))?;
        stdin
            .write_all(request.code.as_bytes())
            .await
            .map_err(|err| SandboxFailure::Transport(err.to_string()))?;
        drop(stdin);

        let budget = Duration::from_secs(request.timeout);
        let output = tokio::time::timeout(budget, child.wait_with_output())
            .await
            .map_err(|_| SandboxFailure::Timeout(budget))?
            .map_err(|err| SandboxFailure::Transport(err.to_string()))?;

        Ok(RawExecution {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
            declared_output: None,
        })
    }
}
