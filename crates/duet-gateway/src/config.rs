use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use duet_types::config::DuetConfig;

/// Returns the duet home directory (~/.duet/)
pub fn duet_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".duet")
}

/// Returns the path to the config file (~/.duet/config.toml)
pub fn config_path() -> PathBuf {
    duet_home().join("config.toml")
}

/// Concrete filesystem locations, with config overrides applied.
#[derive(Debug, Clone)]
pub struct Paths {
    pub config: PathBuf,
    pub worker_socket: PathBuf,
    pub send_socket: PathBuf,
    pub pid_file: PathBuf,
    pub media_dir: PathBuf,
}

impl Paths {
    pub fn resolve(config: &DuetConfig, home: &Path) -> Self {
        Self {
            config: home.join("config.toml"),
            worker_socket: config
                .worker
                .socket
                .clone()
                .unwrap_or_else(|| home.join("worker.sock")),
            send_socket: config
                .gateway
                .send_socket
                .clone()
                .unwrap_or_else(|| home.join("gateway.sock")),
            pid_file: config
                .supervisor
                .pid_file
                .clone()
                .unwrap_or_else(|| home.join("worker.pid")),
            media_dir: config
                .telegram
                .media_dir
                .clone()
                .unwrap_or_else(|| home.join("media")),
        }
    }
}

/// Load config from disk, creating default if it doesn't exist.
pub fn load_config() -> Result<DuetConfig> {
    load_config_at(&config_path())
}

pub fn load_config_at(path: &Path) -> Result<DuetConfig> {
    if !path.exists() {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let default = DuetConfig::default();
        save_config_at(&default, path)?;
        return Ok(default);
    }
    DuetConfig::load(path)
}

/// Save config to disk, overwriting the existing file.
pub fn save_config_at(config: &DuetConfig, path: &Path) -> Result<()> {
    let toml_str = config.to_toml_string().context("Failed to serialize config")?;
    std::fs::write(path, toml_str)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;
    Ok(())
}
