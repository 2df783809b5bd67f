use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use duet_types::message::{Message, Response};
use duet_types::text::chunk_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendMode {
    #[default]
    Markdown,
    Plain,
}

/// A messaging platform the gateway talks to.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Verify credentials / reachability before listening.
    async fn connect(&self) -> Result<()>;

    /// Long-running: push every inbound message into `tx`.
    async fn listen(&self, tx: mpsc::Sender<Message>) -> Result<()>;

    /// Returns the platform's id for the sent message, if it has one.
    async fn send(&self, conversation_id: &str, text: &str, mode: SendMode) -> Result<Option<String>>;

    async fn send_file(&self, conversation_id: &str, path: &Path) -> Result<()>;

    async fn send_audio(&self, conversation_id: &str, path: &Path) -> Result<()> {
        self.send_file(conversation_id, path).await
    }

    async fn send_typing(&self, conversation_id: &str) -> Result<()>;
}

/// Send every part of `response`, chunked to `max_chars`, then its files and
/// audio. Stops at the first text failure; a failed attachment is reported in
/// the chat instead.
pub async fn deliver_response(
    channel: &dyn Channel,
    conversation_id: &str,
    response: &Response,
    max_chars: usize,
) -> Result<()> {
    for part in response.parts() {
        for chunk in chunk_text(part, max_chars) {
            let chunk = chunk.trim_end();
            if !chunk.is_empty() {
                channel.send(conversation_id, chunk, SendMode::Markdown).await?;
            }
        }
    }
    for file in &response.files {
        if let Err(e) = channel.send_file(conversation_id, file).await {
            warn!("Failed to send {} to {conversation_id}: {e:#}", file.display());
            channel
                .send(
                    conversation_id,
                    &format!("⚠️ Could not send file {}", file.display()),
                    SendMode::Plain,
                )
                .await?;
        }
    }
    if let Some(audio) = &response.audio_path {
        if let Err(e) = channel.send_audio(conversation_id, audio).await {
            warn!("Failed to send audio {} to {conversation_id}: {e:#}", audio.display());
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Records everything sent; `send_file` fails for paths containing "missing".
    #[derive(Default)]
    pub(crate) struct RecordingChannel {
        pub sent: Mutex<Vec<(String, String)>>,
        pub typing: Mutex<Vec<String>>,
    }

    impl RecordingChannel {
        pub(crate) fn texts(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn listen(&self, _tx: mpsc::Sender<Message>) -> Result<()> {
            Ok(())
        }

        async fn send(&self, conversation_id: &str, text: &str, _mode: SendMode) -> Result<Option<String>> {
            self.sent
                .lock()
                .unwrap()
                .push((conversation_id.to_string(), text.to_string()));
            Ok(None)
        }

        async fn send_file(&self, conversation_id: &str, path: &Path) -> Result<()> {
            if path.to_string_lossy().contains("missing") {
                anyhow::bail!("no such file");
            }
            self.sent
                .lock()
                .unwrap()
                .push((conversation_id.to_string(), format!("file:{}", path.display())));
            Ok(())
        }

        async fn send_typing(&self, conversation_id: &str) -> Result<()> {
            self.typing.lock().unwrap().push(conversation_id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn parts_chunks_then_attachments() {
        let channel = RecordingChannel::default();
        let response = Response {
            text: "first\n---PART---\nsecond line one\nsecond line two".to_string(),
            files: vec![PathBuf::from("/tmp/report.pdf"), PathBuf::from("/tmp/missing.png")],
            audio_path: Some(PathBuf::from("/tmp/reply.ogg")),
        };
        deliver_response(&channel, "7", &response, 16).await.unwrap();
        assert_eq!(
            channel.texts(),
            vec![
                "first",
                "second line one",
                "second line two",
                "file:/tmp/report.pdf",
                "⚠️ Could not send file /tmp/missing.png",
                "file:/tmp/reply.ogg",
            ]
        );
    }
}
