//! Local RPC between the gateway and the worker: Unix domain sockets with
//! NDJSON framing, one request line and one reply line per connection.
//!
//! - Gateway → Worker on the worker socket: `message` and `health`.
//! - Worker → Gateway on the send socket: background `/send` pushes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};
use uuid::Uuid;

use duet_types::config::DuetConfig;
use duet_types::ipc::{GatewayToWorker, SendReply, SendRequest, WorkerToGateway};
use duet_types::message::{Message, Response};

use crate::config::Paths;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot reach worker: {0}")]
    Connect(#[source] std::io::Error),
    #[error("worker request timed out")]
    Timeout,
    #[error("worker connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed worker reply: {0}")]
    Protocol(String),
    #[error("worker reported an error: {0}")]
    Remote(String),
}

#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// `POST /message`
    async fn send_message(&self, message: &Message) -> Result<Response, TransportError>;
    /// `GET /health`: `Ok(true)` once the worker finished initialising.
    async fn health(&self) -> Result<bool, TransportError>;
}

// ─── NDJSON framing ──────────────────────────────────────────────────────────

async fn write_line<T: Serialize>(w: &mut (impl AsyncWriteExt + Unpin), msg: &T) -> std::io::Result<()> {
    let json = serde_json::to_string(msg).map_err(std::io::Error::other)?;
    w.write_all(json.as_bytes()).await?;
    w.write_all(b"\n").await?;
    w.flush().await
}

/// Read one line and parse it. `Ok(None)` if the peer closed first.
async fn read_line<T: DeserializeOwned>(
    r: &mut (impl AsyncBufReadExt + Unpin),
) -> Result<Option<T>, TransportError> {
    let mut line = String::new();
    if r.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let trimmed = line.trim();
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|e| TransportError::Protocol(format!("{e}: {trimmed}")))
}

// ─── Worker client ───────────────────────────────────────────────────────────

pub struct UnixWorkerClient {
    socket: PathBuf,
}

impl UnixWorkerClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    async fn call(&self, request: &GatewayToWorker) -> Result<WorkerToGateway, TransportError> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(TransportError::Connect)?;
        let (r, mut w) = stream.into_split();
        write_line(&mut w, request).await?;
        let mut reader = BufReader::new(r);
        read_line(&mut reader)
            .await?
            .ok_or_else(|| TransportError::Protocol("worker closed the connection without replying".into()))
    }
}

#[async_trait]
impl WorkerClient for UnixWorkerClient {
    async fn send_message(&self, message: &Message) -> Result<Response, TransportError> {
        let request_id = Uuid::new_v4().to_string();
        debug!("Worker request {request_id} for {}", message.conversation_id);
        let request = GatewayToWorker::Message {
            request_id,
            message: message.clone(),
        };
        match self.call(&request).await? {
            WorkerToGateway::Response { text, files, audio } => Ok(Response {
                text,
                files,
                audio_path: audio,
            }),
            WorkerToGateway::Error { message } => Err(TransportError::Remote(message)),
            other => Err(TransportError::Protocol(format!("unexpected reply: {other:?}"))),
        }
    }

    async fn health(&self) -> Result<bool, TransportError> {
        match self.call(&GatewayToWorker::Health).await? {
            WorkerToGateway::Healthy { .. } => Ok(true),
            WorkerToGateway::NotReady => Ok(false),
            WorkerToGateway::Error { message } => Err(TransportError::Remote(message)),
            other => Err(TransportError::Protocol(format!("unexpected reply: {other:?}"))),
        }
    }
}

// ─── Send server ─────────────────────────────────────────────────────────────

/// Where `/send` pushes end up.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, conversation_id: &str, response: Response) -> Result<()>;
}

pub struct SendServer {
    listener: UnixListener,
    path: PathBuf,
}

impl SendServer {
    /// Bind `path`, replacing a stale socket file.
    pub fn bind(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind send socket {}", path.display()))?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub async fn serve(self, delivery: Arc<dyn Delivery>) -> Result<()> {
        loop {
            let (stream, _) = self
                .listener
                .accept()
                .await
                .context("Failed to accept send connection")?;
            let delivery = delivery.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_send(stream, delivery).await {
                    warn!("Send connection failed: {e}");
                }
            });
        }
    }
}

impl Drop for SendServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_send(stream: UnixStream, delivery: Arc<dyn Delivery>) -> Result<(), TransportError> {
    let (r, mut w) = stream.into_split();
    let mut reader = BufReader::new(r);
    let reply = match read_line::<SendRequest>(&mut reader).await {
        Ok(None) => return Ok(()),
        Err(e) => SendReply::failed(400, e.to_string()),
        Ok(Some(request)) => match request.validation_error() {
            Some((status, error)) => SendReply::failed(status, error),
            None => {
                let response = Response {
                    text: request.text,
                    files: request.files,
                    audio_path: None,
                };
                match delivery.deliver(&request.conversation_id, response).await {
                    Ok(()) => SendReply::ok(),
                    Err(e) => {
                        warn!("Delivery to {} failed: {e:#}", request.conversation_id);
                        SendReply::failed(502, format!("delivery failed: {e}"))
                    }
                }
            }
        },
    };
    write_line(&mut w, &reply).await?;
    Ok(())
}

// ─── Worker process ──────────────────────────────────────────────────────────

/// Build the worker command line. The socket path is passed as an argument
/// so predecessors can be found by scanning the process table for it.
pub fn worker_command(config: &DuetConfig, paths: &Paths) -> Result<tokio::process::Command> {
    let program = match &config.worker.program {
        Some(program) => program.clone(),
        None => find_worker_binary()?,
    };
    let mut cmd = tokio::process::Command::new(&program);
    cmd.args(&config.worker.args)
        .arg("--socket")
        .arg(&paths.worker_socket)
        .arg("--gateway-socket")
        .arg(&paths.send_socket)
        .arg("--config")
        .arg(&paths.config);
    Ok(cmd)
}

/// Find the duet-worker binary next to the current executable, then on `$PATH`.
pub fn find_worker_binary() -> Result<PathBuf> {
    let name = if cfg!(windows) { "duet-worker.exe" } else { "duet-worker" };
    let exe = std::env::current_exe().context("Cannot determine current exe path")?;
    if let Some(dir) = exe.parent() {
        let candidate = dir.join(name);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    if let Some(found) = std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    }) {
        return Ok(found);
    }
    anyhow::bail!(
        "{name} binary not found next to {} or on PATH. \
         Build the workspace first with `cargo build`, or set worker.program.",
        exe.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Collect(Mutex<Vec<(String, String)>>, bool);

    #[async_trait]
    impl Delivery for Collect {
        async fn deliver(&self, conversation_id: &str, response: Response) -> Result<()> {
            if !self.1 {
                anyhow::bail!("channel offline");
            }
            self.0
                .lock()
                .unwrap()
                .push((conversation_id.to_string(), response.text));
            Ok(())
        }
    }

    async fn push(path: &Path, line: &str) -> SendReply {
        let stream = UnixStream::connect(path).await.unwrap();
        let (r, mut w) = stream.into_split();
        w.write_all(line.as_bytes()).await.unwrap();
        w.write_all(b"\n").await.unwrap();
        read_line(&mut BufReader::new(r)).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn send_socket_validates_and_delivers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.sock");
        let sink = Arc::new(Collect(Mutex::new(Vec::new()), true));
        tokio::spawn(SendServer::bind(&path).unwrap().serve(sink.clone()));

        let ok = push(&path, r#"{"conversation_id":"42","text":"reminder"}"#).await;
        assert_eq!(ok, SendReply::ok());
        assert_eq!(sink.0.lock().unwrap()[0], ("42".to_string(), "reminder".to_string()));

        let missing = push(&path, r#"{"conversation_id":"","text":"x"}"#).await;
        assert_eq!(missing.status, 400);
        let garbage = push(&path, "not json").await;
        assert_eq!(garbage.status, 400);
    }

    #[tokio::test]
    async fn delivery_failure_is_502() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.sock");
        tokio::spawn(
            SendServer::bind(&path)
                .unwrap()
                .serve(Arc::new(Collect(Mutex::new(Vec::new()), false))),
        );
        let reply = push(&path, r#"{"conversation_id":"42","text":"x"}"#).await;
        assert!(!reply.ok);
        assert_eq!(reply.status, 502);
    }

    #[tokio::test]
    async fn client_reports_unreachable_worker() {
        let dir = tempfile::tempdir().unwrap();
        let client = UnixWorkerClient::new(dir.path().join("nobody.sock"));
        assert!(matches!(client.health().await, Err(TransportError::Connect(_))));
        let err = client.send_message(&Message::text("1", "u", "hi")).await.unwrap_err();
        assert!(err.to_string().starts_with("cannot reach worker"));
    }

    #[tokio::test]
    async fn client_speaks_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            for _ in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                let (r, mut w) = stream.into_split();
                let req: GatewayToWorker = read_line(&mut BufReader::new(r)).await.unwrap().unwrap();
                let reply = match req {
                    GatewayToWorker::Health => WorkerToGateway::NotReady,
                    GatewayToWorker::Message { message, .. } => WorkerToGateway::Response {
                        text: format!("echo {}", message.text.unwrap_or_default()),
                        files: vec![],
                        audio: None,
                    },
                };
                write_line(&mut w, &reply).await.unwrap();
            }
        });

        let client = UnixWorkerClient::new(&path);
        assert!(!client.health().await.unwrap());
        let resp = client.send_message(&Message::text("1", "u", "hi")).await.unwrap();
        assert_eq!(resp.text, "echo hi");
    }
}
