//! Auto-Repair: hand the worker's captured error output to an agent CLI and
//! let it patch the project, at most `max_attempts` times per cooldown window.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use duet_backend::backend::in_order;
use duet_backend::{Backend, CliRunner};
use duet_types::config::RepairConfig;
use duet_types::paths::extract_project_paths;
use duet_types::text::truncate_chars;

use crate::fallback::{run_cascade, CascadeOutcome};

#[derive(Debug, Clone, PartialEq)]
pub enum RepairOutcome {
    /// A backend exited 0 with output; the worker should be restarted.
    Fixed { backend: String, summary: String },
    Failed { reason: String },
    /// Attempt budget for the current window is spent.
    Refused { retry_in: Duration },
    Disabled,
}

#[async_trait]
pub trait Repairer: Send + Sync {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn repair(&self, error_text: &str) -> RepairOutcome;
}

#[derive(Debug, Default)]
struct Window {
    started: Option<Instant>,
    attempts: u32,
}

pub struct AutoRepair {
    runner: Arc<dyn CliRunner>,
    backends: Vec<Backend>,
    config: RepairConfig,
    window: Mutex<Window>,
}

impl AutoRepair {
    pub fn new(runner: Arc<dyn CliRunner>, backends: Vec<Backend>, config: RepairConfig) -> Self {
        Self {
            runner,
            backends,
            config,
            window: Mutex::new(Window::default()),
        }
    }

    /// Reserve an attempt, or say how long until the window resets.
    fn reserve(&self) -> Result<u32, Duration> {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        let cooldown = self.config.cooldown();
        match window.started {
            Some(started) if started.elapsed() < cooldown => {}
            _ => {
                window.started = Some(Instant::now());
                window.attempts = 0;
            }
        }
        if window.attempts >= self.config.max_attempts {
            let elapsed = window.started.map(|s| s.elapsed()).unwrap_or_default();
            return Err(cooldown.saturating_sub(elapsed));
        }
        window.attempts += 1;
        Ok(window.attempts)
    }
}

pub fn repair_prompt(error_text: &str, project_root: Option<&Path>) -> String {
    let mut prompt = String::from(
        "The duet worker process keeps crashing. Diagnose the error below and fix the code \
         so the worker starts cleanly. Make the smallest change that fixes it and reply with \
         a one-paragraph summary of what you changed.\n",
    );
    if let Some(root) = project_root {
        prompt.push_str(&format!("\nProject root: {}\n", root.display()));
        let hints = extract_project_paths(error_text, root);
        if !hints.is_empty() {
            prompt.push_str("\nFiles referenced in the error:\n");
            for path in hints {
                prompt.push_str(&format!("- {}\n", path.display()));
            }
        }
    }
    prompt.push_str("\nError output:\n```\n");
    prompt.push_str(error_text.trim());
    prompt.push_str("\n```\n");
    prompt
}

#[async_trait]
impl Repairer for AutoRepair {
    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    async fn repair(&self, error_text: &str) -> RepairOutcome {
        if !self.config.enabled {
            return RepairOutcome::Disabled;
        }
        let attempt = match self.reserve() {
            Ok(n) => n,
            Err(retry_in) => {
                warn!(
                    "Auto-repair refused: {} attempts already made, retry in {}s",
                    self.config.max_attempts,
                    retry_in.as_secs()
                );
                return RepairOutcome::Refused { retry_in };
            }
        };
        info!("Auto-repair attempt {attempt}/{}", self.config.max_attempts);

        let prompt = repair_prompt(error_text, self.config.project_root.as_deref());
        let backends = in_order(&self.backends, &self.config.backends);
        match run_cascade(
            self.runner.as_ref(),
            &backends,
            &prompt,
            self.config.timeout(),
            None,
            None,
        )
        .await
        {
            CascadeOutcome::Answer { backend, text } => {
                info!("Auto-repair by {backend}: {}", truncate_chars(&text, 200));
                RepairOutcome::Fixed {
                    backend,
                    summary: truncate_chars(&text, 600),
                }
            }
            CascadeOutcome::Partial { backend, .. } => RepairOutcome::Failed {
                reason: format!("{backend} exited with an error"),
            },
            CascadeOutcome::Failed { last_error } => RepairOutcome::Failed {
                reason: truncate_chars(&last_error, 300),
            },
            CascadeOutcome::NoBackends => RepairOutcome::Failed {
                reason: "no agent CLI is installed".to_string(),
            },
        }
    }
}
