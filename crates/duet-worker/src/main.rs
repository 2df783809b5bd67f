use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use duet_types::config::DuetConfig;
use duet_worker::WorkerOptions;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,hyper_util=warn,hyper=warn,reqwest=warn,h2=warn,rustls=warn")
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        // stderr is reserved for crashes, which the gateway treats as fatal.
        .with_writer(std::io::stdout)
        .with_ansi(false)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let socket = find_arg(&args, "--socket")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow::anyhow!("--socket <path> argument required"))?;
    let gateway_socket = find_arg(&args, "--gateway-socket")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow::anyhow!("--gateway-socket <path> argument required"))?;
    let config = match find_arg(&args, "--config") {
        Some(path) => DuetConfig::load(&PathBuf::from(&path))
            .with_context(|| format!("Failed to load config from {path}"))?,
        None => DuetConfig::default(),
    };

    tracing::info!("duet-worker starting (pid {})", std::process::id());
    tokio::select! {
        res = duet_worker::run(WorkerOptions { socket, gateway_socket, config }) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            Ok(())
        }
    }
}

fn find_arg(args: &[String], flag: &str) -> Option<String> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].clone())
}
