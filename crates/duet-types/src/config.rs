use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DuetConfig {
    pub gateway: GatewayConfig,
    pub worker: WorkerConfig,
    pub supervisor: SupervisorConfig,
    pub repair: RepairConfig,
    pub bridge: BridgeConfig,
    pub fallback: FallbackConfig,
    pub auth: AuthConfig,
    pub queue: QueueConfig,
    pub selection: SelectionConfig,
    pub telegram: TelegramConfig,
    pub media: MediaConfig,
    pub backends: Vec<BackendConfig>,
}

impl Default for DuetConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            worker: WorkerConfig::default(),
            supervisor: SupervisorConfig::default(),
            repair: RepairConfig::default(),
            bridge: BridgeConfig::default(),
            fallback: FallbackConfig::default(),
            auth: AuthConfig::default(),
            queue: QueueConfig::default(),
            selection: SelectionConfig::default(),
            telegram: TelegramConfig::default(),
            media: MediaConfig::default(),
            backends: default_backends(),
        }
    }
}

impl DuetConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let mut config: DuetConfig = toml::from_str(contents).context("Failed to parse config")?;
        if config.backends.is_empty() {
            config.backends = default_backends();
        }
        // The worker must give up on a CLI run before the gateway gives up on the worker.
        let floor = config.queue.timeout_secs + REQUEST_TIMEOUT_MARGIN_SECS;
        config.bridge.request_timeout_secs = config.bridge.request_timeout_secs.max(floor);
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub log_level: String,
    /// Socket the worker pushes scheduled notifications to.
    pub send_socket: Option<PathBuf>,
    /// Channel message size limit used when chunking replies.
    pub max_message_chars: usize,
    /// How many recently active conversations receive worker status notices.
    pub notify_recent: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            send_socket: None,
            max_message_chars: 4096,
            notify_recent: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker executable. Defaults to `duet-worker` next to the gateway binary.
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub socket: Option<PathBuf>,
    /// Restart the worker when anything under `watch_paths` changes.
    pub live_reload: bool,
    pub watch_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub restart_delay_ms: u64,
    pub crash_window_secs: u64,
    pub crash_threshold: u32,
    pub health_poll_ms: u64,
    pub error_debounce_ms: u64,
    pub error_capture_chars: usize,
    pub kill_grace_ms: u64,
    pub reload_debounce_ms: u64,
    pub pid_file: Option<PathBuf>,
    /// Regexes over worker stderr that signal a fatal startup error.
    pub error_patterns: Vec<String>,
}

impl SupervisorConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
    pub fn crash_window(&self) -> Duration {
        Duration::from_secs(self.crash_window_secs)
    }
    pub fn health_poll(&self) -> Duration {
        Duration::from_millis(self.health_poll_ms)
    }
    pub fn error_debounce(&self) -> Duration {
        Duration::from_millis(self.error_debounce_ms)
    }
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
    pub fn reload_debounce(&self) -> Duration {
        Duration::from_millis(self.reload_debounce_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: 2_000,
            crash_window_secs: 10,
            crash_threshold: 2,
            health_poll_ms: 1_000,
            error_debounce_ms: 3_000,
            error_capture_chars: 2_000,
            kill_grace_ms: 3_000,
            reload_debounce_ms: 500,
            pid_file: None,
            error_patterns: vec![
                r"SyntaxError".to_string(),
                r"ReferenceError".to_string(),
                r"TypeError: .* is not a function".to_string(),
                r"ENOENT".to_string(),
                r"Cannot find module".to_string(),
                r"panicked at".to_string(),
                r"(?i)\berror:".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    pub enabled: bool,
    pub cooldown_secs: u64,
    pub max_attempts: u32,
    /// Root that error-text paths must live under to be offered as hints.
    pub project_root: Option<PathBuf>,
    pub timeout_secs: u64,
    /// Backend order for repair attempts; empty means the fallback order.
    pub backends: Vec<String>,
}

impl RepairConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_secs: 120,
            max_attempts: 3,
            project_root: None,
            timeout_secs: 300,
            backends: vec![],
        }
    }
}

/// How much longer than `queue.timeout_secs` a worker request may take.
pub const REQUEST_TIMEOUT_MARGIN_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub startup_wait_secs: u64,
    pub startup_poll_ms: u64,
    pub retry_delay_ms: u64,
    /// Raised on load to at least `queue.timeout_secs` plus
    /// [`REQUEST_TIMEOUT_MARGIN_SECS`].
    pub request_timeout_secs: u64,
}

impl BridgeConfig {
    pub fn startup_wait(&self) -> Duration {
        Duration::from_secs(self.startup_wait_secs)
    }
    pub fn startup_poll(&self) -> Duration {
        Duration::from_millis(self.startup_poll_ms)
    }
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            startup_wait_secs: 15,
            startup_poll_ms: 500,
            retry_delay_ms: 2_000,
            request_timeout_secs: 630,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Backends tried in order when the worker path is unavailable.
    pub order: Vec<String>,
    pub timeout_secs: u64,
}

impl FallbackConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            order: vec!["claude".to_string(), "codex".to_string(), "gemini".to_string()],
            timeout_secs: 180,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub cooldown_secs: u64,
    pub login_timeout_secs: u64,
    pub max_code_len: usize,
}

impl AuthConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 300,
            login_timeout_secs: 600,
            max_code_len: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub timeout_secs: u64,
}

impl QueueConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { timeout_secs: 600 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub default_backend: String,
    /// Prompts at least this long use the backend's deep model.
    pub complex_threshold: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            default_backend: "claude".to_string(),
            complex_threshold: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    /// User IDs allowed to interact with the bot. Empty allows everyone.
    pub allow_from: Vec<i64>,
    /// Where downloaded voice notes, photos and documents are stored.
    pub media_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// OpenAI key for Whisper; env `OPENAI_API_KEY` takes priority.
    pub whisper_api_key: Option<String>,
    pub whisper_model: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            whisper_api_key: None,
            whisper_model: "whisper-1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PromptVia {
    /// Prompt is the last command-line argument.
    #[default]
    Arg,
    /// Prompt is written to the CLI's stdin.
    Stdin,
}

/// One agent CLI the system can delegate a prompt to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub prompt_via: PromptVia,
    #[serde(default)]
    pub model_flag: Option<String>,
    #[serde(default)]
    pub fast_model: Option<String>,
    #[serde(default)]
    pub deep_model: Option<String>,
    /// Interactive re-authentication command, e.g. `codex login`.
    #[serde(default)]
    pub login_command: Option<String>,
    #[serde(default)]
    pub login_args: Vec<String>,
    /// Regexes whose match in CLI output means this backend needs re-auth.
    #[serde(default)]
    pub auth_patterns: Vec<String>,
}

pub fn default_backends() -> Vec<BackendConfig> {
    vec![
        BackendConfig {
            name: "claude".to_string(),
            command: "claude".to_string(),
            args: vec!["-p".to_string()],
            prompt_via: PromptVia::Arg,
            model_flag: Some("--model".to_string()),
            fast_model: Some("sonnet".to_string()),
            deep_model: Some("opus".to_string()),
            login_command: Some("claude".to_string()),
            login_args: vec!["setup-token".to_string()],
            auth_patterns: vec![
                r"(?i)not logged in".to_string(),
                r"(?i)invalid api key".to_string(),
                r"(?i)please run /login".to_string(),
                r"(?i)oauth token has expired".to_string(),
            ],
        },
        BackendConfig {
            name: "codex".to_string(),
            command: "codex".to_string(),
            args: vec!["exec".to_string(), "--skip-git-repo-check".to_string()],
            prompt_via: PromptVia::Arg,
            model_flag: Some("--model".to_string()),
            fast_model: None,
            deep_model: None,
            login_command: Some("codex".to_string()),
            login_args: vec!["login".to_string()],
            auth_patterns: vec![
                r"(?i)missing bearer( or basic)? authentication".to_string(),
                r"(?i)not logged in".to_string(),
                r"(?i)401 unauthorized".to_string(),
            ],
        },
        BackendConfig {
            name: "gemini".to_string(),
            command: "gemini".to_string(),
            args: vec!["-p".to_string()],
            prompt_via: PromptVia::Arg,
            model_flag: Some("--model".to_string()),
            fast_model: Some("gemini-2.5-flash".to_string()),
            deep_model: Some("gemini-2.5-pro".to_string()),
            login_command: None,
            login_args: vec![],
            auth_patterns: vec![r"(?i)gemini_api_key.*(not set|missing)".to_string()],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrips() {
        let config = DuetConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        let parsed = DuetConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed.supervisor.crash_threshold, 2);
        assert_eq!(parsed.backends.len(), 3);
        assert_eq!(parsed.backend("codex").unwrap().login_args, vec!["login"]);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let parsed = DuetConfig::from_toml_str(
            r#"
            [supervisor]
            crash_threshold = 5

            [[backends]]
            name = "echo"
            command = "echo"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.supervisor.crash_threshold, 5);
        assert_eq!(parsed.supervisor.crash_window_secs, 10);
        assert_eq!(parsed.repair.max_attempts, 3);
        assert_eq!(parsed.bridge.startup_wait(), Duration::from_secs(15));
        assert_eq!(parsed.backends.len(), 1);
        assert_eq!(parsed.backends[0].prompt_via, PromptVia::Arg);
    }

    #[test]
    fn worker_requests_outlast_the_cli_timeout() {
        let defaults = DuetConfig::default();
        assert!(defaults.bridge.request_timeout() > defaults.queue.timeout());

        let parsed = DuetConfig::from_toml_str(
            r#"
            [queue]
            timeout_secs = 900

            [bridge]
            request_timeout_secs = 600
            "#,
        )
        .unwrap();
        assert_eq!(parsed.bridge.request_timeout(), Duration::from_secs(930));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[auth]\ncooldown_secs = 60\n").unwrap();
        let config = DuetConfig::load(&path).unwrap();
        assert_eq!(config.auth.cooldown(), Duration::from_secs(60));
        assert!(!config.backends.is_empty());
    }
}
