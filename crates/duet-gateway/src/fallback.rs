//! Direct backend invocation from the gateway, used when the worker path is
//! unusable and by Auto-Repair.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use duet_backend::backend::in_order;
use duet_backend::classify::{is_disguised_failure, looks_like_cli_error, render_output};
use duet_backend::{Backend, CliRunner};
use duet_types::message::{Message, Response};

use crate::auth::OutputObserver;

/// Result of trying each backend in turn.
#[derive(Debug, Clone, PartialEq)]
pub enum CascadeOutcome {
    /// A backend exited 0 with a plausible answer.
    Answer { backend: String, text: String },
    /// Best low-confidence output: produced text but exited non-zero.
    Partial { backend: String, text: String },
    /// Every available backend failed; carries the last rendered failure.
    Failed { last_error: String },
    /// No backend is installed.
    NoBackends,
}

/// Try `backends` in order and take the first clean answer. Output that
/// arrived with a non-zero exit is kept as a fallback candidate unless it
/// looks like a CLI error message.
pub async fn run_cascade(
    runner: &dyn CliRunner,
    backends: &[&Backend],
    prompt: &str,
    timeout: Duration,
    observer: Option<&dyn OutputObserver>,
    conversation_id: Option<&str>,
) -> CascadeOutcome {
    let mut partial: Option<(String, String)> = None;
    let mut last_error: Option<String> = None;

    for backend in backends {
        if !runner.is_available(backend) {
            debug!("Skipping {}: not installed", backend.name());
            continue;
        }
        let model = backend.model_for(false);
        let output = match runner.run(backend, model, prompt, timeout).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Fallback backend {} failed to run: {e:#}", backend.name());
                last_error = Some(format!("{} could not start: {e}", backend.name()));
                continue;
            }
        };
        if let Some(observer) = observer {
            observer.observe(&output.combined(), Some(backend.name()), conversation_id);
        }

        let stdout = output.stdout.trim();
        if output.success() && !stdout.is_empty() && !is_disguised_failure(backend, stdout) {
            info!("Fallback answered by {}", backend.name());
            return CascadeOutcome::Answer {
                backend: backend.name().to_string(),
                text: stdout.to_string(),
            };
        }
        if partial.is_none()
            && !output.timed_out
            && !stdout.is_empty()
            && !looks_like_cli_error(stdout)
            && !is_disguised_failure(backend, stdout)
        {
            debug!("Keeping partial output from {} (exit {:?})", backend.name(), output.exit_code);
            partial = Some((backend.name().to_string(), stdout.to_string()));
        }
        warn!(
            "Fallback backend {} failed (exit {:?}, timed out: {})",
            backend.name(),
            output.exit_code,
            output.timed_out
        );
        last_error = Some(render_output(backend, &output));
    }

    match (partial, last_error) {
        (Some((backend, text)), _) => CascadeOutcome::Partial { backend, text },
        (None, Some(last_error)) => CascadeOutcome::Failed { last_error },
        (None, None) => CascadeOutcome::NoBackends,
    }
}

/// Why the worker path was skipped; injected into the fallback prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    WorkerDown,
    WorkerStartTimeout,
    WorkerFailed(String),
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WorkerDown => write!(f, "the worker process is down"),
            Self::WorkerStartTimeout => write!(f, "the worker did not finish starting in time"),
            Self::WorkerFailed(e) => write!(f, "the worker failed to answer ({e})"),
        }
    }
}

#[async_trait]
pub trait Fallback: Send + Sync {
    async fn invoke(&self, message: &Message, reason: FallbackReason) -> Response;
}

pub struct FallbackInvoker {
    runner: Arc<dyn CliRunner>,
    backends: Vec<Backend>,
    order: Vec<String>,
    timeout: Duration,
    observer: Option<Arc<dyn OutputObserver>>,
    /// Tokio's mutex is fair, so waiters are served in arrival order.
    line: Mutex<()>,
}

impl FallbackInvoker {
    pub fn new(
        runner: Arc<dyn CliRunner>,
        backends: Vec<Backend>,
        order: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            backends,
            order,
            timeout,
            observer: None,
            line: Mutex::new(()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn OutputObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run `prompt` through the cascade, one caller at a time.
    pub async fn run(&self, prompt: &str, conversation_id: Option<&str>) -> CascadeOutcome {
        let _turn = self.line.lock().await;
        let backends = in_order(&self.backends, &self.order);
        run_cascade(
            self.runner.as_ref(),
            &backends,
            prompt,
            self.timeout,
            self.observer.as_deref(),
            conversation_id,
        )
        .await
    }
}

fn fallback_prompt(message: &Message, reason: &FallbackReason) -> String {
    format!(
        "[Context: you are answering directly in fallback mode because {reason}. \
         Answer the user's message as best you can; background tasks and \
         scheduled reminders are not available right now.]\n\n{}",
        message.describe()
    )
}

#[async_trait]
impl Fallback for FallbackInvoker {
    async fn invoke(&self, message: &Message, reason: FallbackReason) -> Response {
        info!("Fallback for {}: {reason}", message.conversation_id);
        let prompt = fallback_prompt(message, &reason);
        let text = match self.run(&prompt, Some(&message.conversation_id)).await {
            CascadeOutcome::Answer { text, .. } => text,
            CascadeOutcome::Partial { backend, text } => {
                format!("{text}\n\n(⚠️ {backend} exited with an error; this answer may be incomplete.)")
            }
            CascadeOutcome::Failed { last_error } => {
                format!("⚠️ Fallback mode unavailable: every backend failed.\n{last_error}")
            }
            CascadeOutcome::NoBackends => {
                "⚠️ Fallback mode unavailable: no agent CLI is installed on the gateway host.".to_string()
            }
        };
        Response::text(text)
    }
}
