//! Runs one agent CLI invocation to completion under a hard timeout.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use duet_types::config::PromptVia;

use crate::backend::Backend;
use crate::tee::{self, Echo, Tee};

/// Output cap per stream (1 MB of characters).
const MAX_CAPTURE: usize = 1_048_576;

const READER_GRACE: Duration = Duration::from_secs(2);

/// Captured result of one CLI run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CliOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// stdout followed by stderr, for signature scanning.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
            (false, true) => self.stdout.clone(),
            _ => self.stderr.clone(),
        }
    }
}

/// Seam between callers and real subprocesses.
#[async_trait]
pub trait CliRunner: Send + Sync {
    async fn run(
        &self,
        backend: &Backend,
        model: Option<&str>,
        prompt: &str,
        timeout: Duration,
    ) -> Result<CliOutput>;

    fn is_available(&self, backend: &Backend) -> bool {
        backend.is_installed()
    }
}

/// Spawns the backend CLI as a child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    workdir: Option<PathBuf>,
}

impl ProcessRunner {
    pub fn new(workdir: Option<PathBuf>) -> Self {
        Self { workdir }
    }
}

#[async_trait]
impl CliRunner for ProcessRunner {
    async fn run(
        &self,
        backend: &Backend,
        model: Option<&str>,
        prompt: &str,
        timeout: Duration,
    ) -> Result<CliOutput> {
        let mut cmd = backend.command(prompt, model);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        let via_stdin = backend.prompt_via() == PromptVia::Stdin;
        cmd.stdin(if via_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn backend {}", backend.name()))?;
        info!(
            "Backend {} started (pid: {:?}, model: {})",
            backend.name(),
            child.id(),
            model.unwrap_or("default")
        );

        let stdout_buf = tee::shared_buffer(MAX_CAPTURE);
        let stderr_buf = tee::shared_buffer(MAX_CAPTURE);
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(
                Tee::new(format!("{}:stdout", backend.name()))
                    .echo(Echo::Debug)
                    .buffer(stdout_buf.clone())
                    .spawn(out),
            );
        }
        if let Some(err) = child.stderr.take() {
            readers.push(
                Tee::new(format!("{}:stderr", backend.name()))
                    .echo(Echo::Debug)
                    .buffer(stderr_buf.clone())
                    .spawn(err),
            );
        }

        // Written from a task so a CLI that never drains stdin still hits the
        // timeout. Dropping stdin closes it so the CLI sees EOF.
        let writer = match child.stdin.take() {
            Some(mut stdin) if via_stdin => {
                let prompt = prompt.to_string();
                let name = backend.name().to_string();
                Some(tokio::spawn(async move {
                    if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                        debug!("Backend {name} did not take the whole prompt: {e}");
                    }
                }))
            }
            _ => None,
        };

        let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => (status.code(), false),
            Ok(Err(e)) => {
                warn!("Failed to wait for backend {}: {e}", backend.name());
                (None, false)
            }
            Err(_) => {
                warn!(
                    "Backend {} timed out after {}s, killing",
                    backend.name(),
                    timeout.as_secs()
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill backend {}: {e}", backend.name());
                }
                (None, true)
            }
        };
        if let Some(writer) = writer {
            writer.abort();
        }
        // Grandchildren may keep the pipes open after the CLI itself exits.
        for mut reader in readers {
            if tokio::time::timeout(READER_GRACE, &mut reader).await.is_err() {
                reader.abort();
            }
        }

        let output = CliOutput {
            stdout: tee::snapshot(&stdout_buf),
            stderr: tee::snapshot(&stderr_buf),
            exit_code,
            timed_out,
            elapsed: started.elapsed(),
        };
        debug!(
            "Backend {} finished: exit={:?}, stdout={} chars, stderr={} chars, {:.1}s",
            backend.name(),
            output.exit_code,
            output.stdout.len(),
            output.stderr.len(),
            output.elapsed.as_secs_f64()
        );
        Ok(output)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use duet_types::config::BackendConfig;

    fn sh_backend(script: &str, via: PromptVia) -> Backend {
        Backend::new(BackendConfig {
            name: "sh".into(),
            command: "sh".into(),
            args: vec!["-c".into(), script.into(), "sh".into()],
            prompt_via: via,
            model_flag: None,
            fast_model: None,
            deep_model: None,
            login_command: None,
            login_args: vec![],
            auth_patterns: vec![],
        })
        .unwrap()
    }

    #[tokio::test]
    async fn captures_stdout_stderr_and_exit_code() {
        let backend = sh_backend(r#"echo "got: $1"; echo oops >&2; exit 3"#, PromptVia::Arg);
        let out = ProcessRunner::default()
            .run(&backend, None, "hi", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "got: hi");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
    }

    #[tokio::test]
    async fn pipes_prompt_through_stdin() {
        let backend = sh_backend("cat", PromptVia::Stdin);
        let out = ProcessRunner::default()
            .run(&backend, None, "from stdin", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.stdout, "from stdin");
        assert!(out.success());
    }

    #[tokio::test]
    async fn kills_on_timeout() {
        let backend = sh_backend("exec sleep 30", PromptVia::Arg);
        let out = ProcessRunner::default()
            .run(&backend, None, "x", Duration::from_millis(200))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(out.elapsed < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn timeout_holds_when_stdin_is_never_read() {
        let backend = sh_backend("exec sleep 30", PromptVia::Stdin);
        let prompt = "x".repeat(1 << 20);
        let out = tokio::time::timeout(
            Duration::from_secs(10),
            ProcessRunner::default().run(&backend, None, &prompt, Duration::from_millis(300)),
        )
        .await
        .expect("run returned")
        .unwrap();
        assert!(out.timed_out);
    }
}
