//! Worker socket server: one NDJSON request and one reply per connection.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use duet_types::ipc::{GatewayToWorker, WorkerToGateway};

use crate::handler::Handler;

pub struct WorkerServer {
    listener: UnixListener,
    path: PathBuf,
    handler: Arc<Handler>,
    ready: Arc<AtomicBool>,
}

impl WorkerServer {
    /// Bind `path`, replacing a stale socket file left by a previous worker.
    pub fn bind(path: &Path, handler: Arc<Handler>) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create socket directory {}", dir.display()))?;
        }
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind worker socket {}", path.display()))?;
        info!("Worker listening on {}", path.display());
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            handler,
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag flipped once startup has finished. Health checks report
    /// `not_ready` until then.
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    pub async fn serve(self) -> Result<()> {
        loop {
            let (stream, _) = self
                .listener
                .accept()
                .await
                .context("Failed to accept gateway connection")?;
            let handler = self.handler.clone();
            let ready = self.ready.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, handler, ready).await {
                    warn!("Gateway connection failed: {e:#}");
                }
            });
        }
    }
}

impl Drop for WorkerServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn serve_connection(stream: UnixStream, handler: Arc<Handler>, ready: Arc<AtomicBool>) -> Result<()> {
    let (r, mut w) = stream.into_split();
    let mut reader = BufReader::new(r);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }

    let reply = match serde_json::from_str::<GatewayToWorker>(line.trim()) {
        Ok(GatewayToWorker::Health) => {
            if ready.load(Ordering::SeqCst) {
                WorkerToGateway::Healthy { timestamp: Utc::now() }
            } else {
                WorkerToGateway::NotReady
            }
        }
        Ok(GatewayToWorker::Message { request_id, message }) => {
            if !ready.load(Ordering::SeqCst) {
                WorkerToGateway::Error {
                    message: "worker is still starting".to_string(),
                }
            } else {
                debug!("Request {request_id} for conversation {}", message.conversation_id);
                tokio::select! {
                    response = handler.handle(message) => response.into(),
                    _ = hung_up(&mut reader) => {
                        info!("Gateway gave up on request {request_id}; dropping it");
                        return Ok(());
                    }
                }
            }
        }
        Err(e) => WorkerToGateway::Error {
            message: format!("malformed request: {e}"),
        },
    };

    let mut json = serde_json::to_string(&reply).context("Failed to serialize worker reply")?;
    json.push('\n');
    w.write_all(json.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Resolves once the gateway closes its end. Nothing is sent after the
/// request line, so any read result other than data means it is gone.
async fn hung_up(reader: &mut (impl AsyncReadExt + Unpin)) {
    let mut buf = [0u8; 64];
    while let Ok(n) = reader.read(&mut buf).await {
        if n == 0 {
            return;
        }
    }
}
