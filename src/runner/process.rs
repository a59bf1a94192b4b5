//! Child process execution with timeout and cancellation.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::RunnerError;

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

/// Captured output of a successful run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    /// Stdout and stderr joined, either omitted when empty.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (_, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) => format!("{}\n\n--- stderr ---\n{}", stdout, stderr),
        }
    }
}

/// Run to completion. A non-zero exit becomes [`RunnerError::Exit`] with the
/// combined output attached. The child is killed if the timeout elapses or
/// `cancel` fires.
pub async fn run(spec: &ProcessSpec, cancel: &CancellationToken) -> Result<ProcessOutput, RunnerError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if !spec.cwd.as_os_str().is_empty() {
        command.current_dir(&spec.cwd);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    let child = command.spawn().map_err(|source| RunnerError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    // Dropping this future drops the child, which kills it.
    let wait = async {
        match spec.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| RunnerError::Timeout(limit))?
                .map_err(RunnerError::Io),
            None => child.wait_with_output().await.map_err(RunnerError::Io),
        }
    };

    let output = tokio::select! {
        _ = cancel.cancelled() => return Err(RunnerError::Cancelled),
        result = wait => result?,
    };

    let captured = ProcessOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    if output.status.success() {
        return Ok(captured);
    }
    match output.status.code() {
        Some(code) => Err(RunnerError::Exit {
            code,
            output: captured.combined(),
        }),
        None => Err(RunnerError::Signaled {
            output: captured.combined(),
        }),
    }
}
