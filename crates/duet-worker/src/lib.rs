//! The volatile half of duet: turns normalized messages into responses by
//! driving agent CLIs through a single-flight queue.

pub mod gateway_bridge;
pub mod handler;
pub mod media;
pub mod queue;
pub mod select;
pub mod server;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use duet_backend::backend::build_backends;
use duet_backend::{CliRunner, ProcessRunner};
use duet_types::config::DuetConfig;

use crate::gateway_bridge::GatewayClient;
use crate::handler::Handler;
use crate::queue::InvocationQueue;
use crate::server::WorkerServer;

pub struct WorkerOptions {
    pub socket: PathBuf,
    pub gateway_socket: PathBuf,
    pub config: DuetConfig,
}

/// Bind the worker socket, finish startup, then serve until the listener fails.
pub async fn run(options: WorkerOptions) -> Result<()> {
    let WorkerOptions {
        socket,
        gateway_socket,
        config,
    } = options;

    let backends = build_backends(&config.backends)?;
    let runner: Arc<dyn CliRunner> = Arc::new(ProcessRunner::new(config.repair.project_root.clone()));
    let queue = InvocationQueue::new(runner.clone(), config.queue.timeout());
    let media = media::from_config(&config.media);
    let handler = Arc::new(Handler::new(
        backends.clone(),
        config.selection.clone(),
        queue,
        Arc::from(media),
        Arc::new(GatewayClient::new(gateway_socket)),
    ));

    let server = WorkerServer::bind(&socket, handler)?;
    let ready = server.ready_flag();

    let installed: Vec<&str> = backends
        .iter()
        .filter(|b| runner.is_available(b))
        .map(|b| b.name())
        .collect();
    if installed.is_empty() {
        warn!("No backend CLI is installed; every request will fail until one is");
    } else {
        info!("Backends available: {}", installed.join(", "));
    }
    ready.store(true, Ordering::SeqCst);
    info!("Worker ready");

    server.serve().await
}
