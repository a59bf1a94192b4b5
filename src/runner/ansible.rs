//! `ansible-playbook` adapter with command guardrails.
//!
//! - Only allow-listed playbooks (compared after lexical cleaning) run
//! - A `--syntax-check` pass always runs first
//! - Secret-looking extra vars are redacted before being reported

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::orchestrator::EventLevel;
use crate::runner::process::{self, ProcessSpec};
use crate::runner::{Event, EventSink, Request, Runner};

const SECRET_MARKERS: &[&str] = &["token", "password", "secret"];

pub struct AnsibleRunner {
    binary: String,
    workdir: PathBuf,
    allowed_playbooks: HashSet<PathBuf>,
    apply_enabled: bool,
}

impl AnsibleRunner {
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            binary: config.binary.trim().to_string(),
            workdir: config.workdir.clone(),
            allowed_playbooks: config
                .allowed_playbooks
                .iter()
                .map(|p| clean_path(p))
                .collect(),
            apply_enabled: config.apply_enabled,
        }
    }

    fn validate(&self, request: &Request) -> Result<PathBuf, RunnerError> {
        let invalid = |reason: &str| RunnerError::InvalidRequest {
            reason: reason.to_string(),
        };
        if self.binary.is_empty() {
            return Err(invalid("ansible binary path is required"));
        }
        if self.workdir.as_os_str().is_empty() {
            return Err(invalid("ansible working directory is required"));
        }
        if request.inventory_path.as_os_str().is_empty() {
            return Err(invalid("inventory path is required"));
        }
        if request.playbook_path.as_os_str().is_empty() {
            return Err(invalid("playbook path is required"));
        }
        let playbook = clean_path(&request.playbook_path);
        if !self.allowed_playbooks.contains(&playbook) {
            return Err(RunnerError::PlaybookNotAllowed(
                request.playbook_path.display().to_string(),
            ));
        }
        Ok(playbook)
    }

    fn args(&self, request: &Request, playbook: &Path, syntax_check: bool) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            request.inventory_path.display().to_string(),
            playbook.display().to_string(),
        ];
        if syntax_check {
            args.push("--syntax-check".to_string());
        }
        for (key, value) in &request.extra_vars {
            args.push("--extra-vars".to_string());
            args.push(format!("{}={}", key, value));
        }
        args
    }

    fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![("ANSIBLE_STDOUT_CALLBACK".to_string(), "json".to_string())];
        // A binary inside a virtualenv needs its bin dir on PATH.
        if let Some(bin_dir) = Path::new(&self.binary)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            let mut paths = vec![bin_dir.to_path_buf()];
            if let Some(current) = std::env::var_os("PATH") {
                paths.extend(std::env::split_paths(&current));
            }
            if let Ok(joined) = std::env::join_paths(paths) {
                env.push(("PATH".to_string(), joined.to_string_lossy().into_owned()));
            }
        }
        env
    }

    async fn run_step(
        &self,
        request: &Request,
        args: Vec<String>,
        step_key: &str,
        description: &str,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<(), RunnerError> {
        sink.emit(Event::new("runner_step", EventLevel::Info, description).step(step_key))
            .await;
        sink.emit(
            Event::new("runner_args", EventLevel::Info, "ansible args")
                .step(step_key)
                .payload(redact_args(&args).join(" ")),
        )
        .await;

        let spec = ProcessSpec {
            program: self.binary.clone(),
            args,
            cwd: self.workdir.clone(),
            env: self.env(),
            timeout: request.timeout,
        };

        tracing::debug!(job_id = request.job_id, step = step_key, "Running ansible");
        match process::run(&spec, cancel).await {
            Ok(output) => {
                let stdout = output.stdout.trim();
                if !stdout.is_empty() {
                    sink.emit(
                        Event::new("runner_output", EventLevel::Info, "stdout")
                            .step(step_key)
                            .payload(stdout),
                    )
                    .await;
                }
                let stderr = output.stderr.trim();
                if !stderr.is_empty() {
                    sink.emit(
                        Event::new("runner_output", EventLevel::Warning, "stderr")
                            .step(step_key)
                            .payload(stderr),
                    )
                    .await;
                }
                Ok(())
            }
            Err(e) => {
                let output = e.output().trim();
                if !output.is_empty() {
                    sink.emit(
                        Event::new("runner_output", EventLevel::Error, "output")
                            .step(step_key)
                            .payload(output),
                    )
                    .await;
                }
                tracing::warn!(job_id = request.job_id, step = step_key, error = %e, "{} failed", description);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Runner for AnsibleRunner {
    fn name(&self) -> &'static str {
        "ansible"
    }

    async fn run(
        &self,
        request: &Request,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<(), RunnerError> {
        let playbook = self.validate(request)?;

        sink.emit(Event::new(
            "runner_preflight",
            EventLevel::Info,
            "running ansible syntax check",
        ))
        .await;
        let args = self.args(request, &playbook, true);
        self.run_step(request, args, "syntax_check", "ansible syntax check", sink, cancel)
            .await?;

        if request.check_only {
            sink.emit(Event::new(
                "runner_complete",
                EventLevel::Info,
                "check-only run complete",
            ))
            .await;
            return Ok(());
        }

        if !self.apply_enabled && !request.force_apply {
            sink.emit(Event::new(
                "runner_pending",
                EventLevel::Warning,
                "playbook apply is not enabled; syntax check passed",
            ))
            .await;
            return Ok(());
        }

        sink.emit(Event::new("runner_apply", EventLevel::Info, "running ansible playbook"))
            .await;
        let args = self.args(request, &playbook, false);
        self.run_step(request, args, "apply", "ansible playbook run", sink, cancel)
            .await?;
        sink.emit(Event::new("runner_complete", EventLevel::Info, "ansible run complete"))
            .await;
        Ok(())
    }
}

/// Lexically normalise a path: drop `.`, resolve `..` against preceding
/// components. Does not touch the filesystem.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(out.components().next_back(), Some(Component::Normal(_)))
                    && out.pop();
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

/// Replace values of secret-looking `--extra-vars k=v` pairs with `***`.
pub fn redact_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut after_flag = false;
    for arg in args {
        if after_flag {
            out.push(redact_pair(arg));
            after_flag = false;
            continue;
        }
        after_flag = arg == "--extra-vars";
        out.push(arg.clone());
    }
    out
}

fn redact_pair(pair: &str) -> String {
    match pair.split_once('=') {
        Some((key, _)) => {
            let lower = key.to_ascii_lowercase();
            if SECRET_MARKERS.iter().any(|m| lower.contains(m)) {
                format!("{}=***", key)
            } else {
                pair.to_string()
            }
        }
        None => pair.to_string(),
    }
}
