use anyhow::{Context, Result};
use regex::Regex;
use tokio::process::Command;

use duet_types::config::{BackendConfig, PromptVia};

/// A configured agent CLI with its auth-failure signatures compiled.
#[derive(Debug, Clone)]
pub struct Backend {
    config: BackendConfig,
    auth_patterns: Vec<Regex>,
}

impl Backend {
    pub fn new(config: BackendConfig) -> Result<Self> {
        let auth_patterns = config
            .auth_patterns
            .iter()
            .map(|p| {
                Regex::new(p)
                    .with_context(|| format!("Invalid auth pattern for backend {}: {p}", config.name))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            auth_patterns,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn prompt_via(&self) -> PromptVia {
        self.config.prompt_via
    }

    /// Whether the executable resolves on `$PATH` (or is an existing path).
    pub fn is_installed(&self) -> bool {
        which::which(&self.config.command).is_ok()
    }

    pub fn model_for(&self, deep: bool) -> Option<&str> {
        if deep {
            self.config.deep_model.as_deref().or(self.config.fast_model.as_deref())
        } else {
            self.config.fast_model.as_deref()
        }
    }

    /// Build the invocation. With [`PromptVia::Stdin`] the caller must pipe
    /// `prompt` into the child's stdin.
    pub fn command(&self, prompt: &str, model: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);
        if let (Some(flag), Some(model)) = (self.config.model_flag.as_deref(), model) {
            cmd.arg(flag).arg(model);
        }
        if self.config.prompt_via == PromptVia::Arg {
            cmd.arg(prompt);
        }
        cmd
    }

    pub fn login_command(&self) -> Option<Command> {
        let program = self.config.login_command.as_deref()?;
        let mut cmd = Command::new(program);
        cmd.args(&self.config.login_args);
        Some(cmd)
    }

    /// The first output line matching one of this backend's auth signatures.
    pub fn auth_failure_line<'a>(&self, text: &'a str) -> Option<&'a str> {
        text.lines()
            .find(|line| self.auth_patterns.iter().any(|re| re.is_match(line)))
            .map(str::trim)
    }
}

pub fn build_backends(configs: &[BackendConfig]) -> Result<Vec<Backend>> {
    configs.iter().cloned().map(Backend::new).collect()
}

/// Backends named in `order`, in that order, skipping unknown names.
/// An empty `order` yields every backend in configuration order.
pub fn in_order<'a>(backends: &'a [Backend], order: &[String]) -> Vec<&'a Backend> {
    if order.is_empty() {
        return backends.iter().collect();
    }
    order
        .iter()
        .filter_map(|name| backends.iter().find(|b| b.name() == name))
        .collect()
}
