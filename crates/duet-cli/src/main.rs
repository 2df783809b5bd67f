use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use duet_backend::backend::build_backends;
use duet_gateway::channels::TelegramChannel;
use duet_gateway::config::{self, Paths};
use duet_gateway::ipc::{UnixWorkerClient, WorkerClient};
use duet_gateway::pidfile::{is_process_alive, PidFile};
use duet_gateway::Gateway;
use duet_types::config::DuetConfig;

#[derive(Parser)]
#[command(name = "duet", version, about = "duet: keeps a chat channel answered while its agent worker crashes, restarts or re-authenticates")]
struct Cli {
    /// Config file (default: ~/.duet/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway and its supervised worker (default)
    Run,
    /// Show worker process and health status
    Status,
    /// List configured backends and whether they are installed
    Backends,
}

fn load(cli: &Cli) -> Result<(DuetConfig, Paths)> {
    let path = cli.config.clone().unwrap_or_else(config::config_path);
    let cfg = config::load_config_at(&path)?;
    let mut paths = Paths::resolve(&cfg, &config::duet_home());
    paths.config = path;
    Ok((cfg, paths))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (cfg, paths) = load(&cli)?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.gateway.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let channel = Arc::new(TelegramChannel::new(&cfg.telegram, paths.media_dir.clone())?);
            let shutdown = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            Gateway::new(cfg, paths, channel).run(shutdown).await
        }
        Commands::Status => {
            println!("duet v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", paths.config.display());
            match PidFile::new(&paths.pid_file).read() {
                Some(pid) if is_process_alive(pid) => println!("Worker process: running (pid {pid})"),
                Some(pid) => println!("Worker process: not running (stale pid {pid})"),
                None => println!("Worker process: not running"),
            }
            let client = UnixWorkerClient::new(&paths.worker_socket);
            match client.health().await {
                Ok(true) => println!("Worker health: up"),
                Ok(false) => println!("Worker health: starting"),
                Err(e) => println!("Worker health: down ({e})"),
            }
            println!("Worker socket: {}", paths.worker_socket.display());
            println!("Send socket: {}", paths.send_socket.display());
            Ok(())
        }
        Commands::Backends => {
            for backend in build_backends(&cfg.backends)? {
                let installed = if backend.is_installed() { "installed" } else { "not found" };
                println!(
                    "{:<10} {:<10} {}",
                    backend.name(),
                    installed,
                    backend.config().command
                );
            }
            if !cfg.selection.default_backend.is_empty() {
                println!("\nDefault: {}", cfg.selection.default_backend);
            }
            Ok(())
        }
    }
}
