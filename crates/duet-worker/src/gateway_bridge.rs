//! Client for the gateway's `/send` socket, used to push background results
//! back to a conversation outside the request/response cycle.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use duet_types::ipc::{SendReply, SendRequest};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, request: SendRequest) -> Result<()>;
}

pub struct GatewayClient {
    socket: PathBuf,
}

impl GatewayClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }
}

#[async_trait]
impl Notifier for GatewayClient {
    async fn send(&self, request: SendRequest) -> Result<()> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .with_context(|| format!("Failed to connect to gateway at {}", self.socket.display()))?;
        let (r, mut w) = stream.into_split();

        let mut json = serde_json::to_string(&request)?;
        json.push('\n');
        w.write_all(json.as_bytes()).await?;
        w.flush().await?;

        let mut line = String::new();
        BufReader::new(r).read_line(&mut line).await?;
        let reply: SendReply = serde_json::from_str(line.trim())
            .with_context(|| format!("Failed to parse gateway reply: {}", line.trim()))?;
        if !reply.ok {
            anyhow::bail!(
                "Gateway rejected send ({}): {}",
                reply.status,
                reply.error.unwrap_or_default()
            );
        }
        Ok(())
    }
}
