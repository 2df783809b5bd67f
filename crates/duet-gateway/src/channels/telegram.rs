//! Telegram Bot API channel: long polling in, `sendMessage` / `sendDocument`
//! / `sendVoice` out. Voice notes, photos and documents are downloaded to the
//! media directory before the message is handed on.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use duet_types::config::TelegramConfig;
use duet_types::message::{Attachment, Message};
use duet_types::text::truncate_chars;

use crate::channel::{Channel, SendMode};

const API_BASE: &str = "https://api.telegram.org";
const POLL_TIMEOUT_SECS: u64 = 30;
const REPLY_CONTEXT_CHARS: usize = 300;

// ── Telegram API types ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TgResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgUpdate {
    update_id: i64,
    message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    #[serde(default)]
    date: i64,
    from: Option<TgUser>,
    chat: TgChat,
    text: Option<String>,
    caption: Option<String>,
    voice: Option<TgFileRef>,
    audio: Option<TgFileRef>,
    #[serde(default)]
    photo: Vec<TgFileRef>,
    document: Option<TgFileRef>,
    reply_to_message: Option<Box<TgMessage>>,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    first_name: Option<String>,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct TgFileRef {
    file_id: String,
    file_name: Option<String>,
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgFile {
    file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgSent {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct TgBot {
    username: Option<String>,
}

// ── Inbound conversion ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Audio,
    Image,
    Document,
}

/// A media payload still on Telegram's servers.
#[derive(Debug, Clone, PartialEq)]
struct PendingMedia {
    kind: MediaKind,
    file_id: String,
    file_name: Option<String>,
    mime_type: Option<String>,
    caption: Option<String>,
}

fn is_allowed(allow_from: &[i64], user_id: i64) -> bool {
    allow_from.is_empty() || allow_from.contains(&user_id)
}

fn reply_context(msg: &TgMessage) -> Option<String> {
    let parent = msg.reply_to_message.as_ref()?;
    let text = parent.text.as_deref().or(parent.caption.as_deref())?;
    Some(truncate_chars(text.trim(), REPLY_CONTEXT_CHARS))
}

fn pending_media(msg: &TgMessage) -> Option<PendingMedia> {
    let (kind, file) = if let Some(voice) = msg.voice.as_ref().or(msg.audio.as_ref()) {
        (MediaKind::Audio, voice.clone())
    } else if let Some(largest) = msg.photo.last() {
        (MediaKind::Image, largest.clone())
    } else if let Some(document) = &msg.document {
        (MediaKind::Document, document.clone())
    } else {
        return None;
    };
    Some(PendingMedia {
        kind,
        file_id: file.file_id,
        file_name: file.file_name,
        mime_type: file.mime_type,
        caption: msg.caption.clone(),
    })
}

/// Normalize a Telegram message. Media is returned separately so the caller
/// can download it and attach the local path.
fn build_message(msg: &TgMessage) -> Option<(Message, Option<PendingMedia>)> {
    let media = pending_media(msg);
    let text = match (&msg.text, &media) {
        (Some(text), _) => text.clone(),
        (None, Some(_)) => String::new(),
        (None, None) => return None,
    };

    let from = msg.from.as_ref();
    let mut message = Message::text(
        msg.chat.id.to_string(),
        from.map(|u| u.id.to_string()).unwrap_or_default(),
        text,
    );
    if let Some(name) = from.and_then(|u| u.first_name.clone().or_else(|| u.username.clone())) {
        message.sender_display_name = name;
    }
    if media.is_some() {
        message.text = None;
    }
    message.message_id = Some(msg.message_id.to_string());
    if let Some(ts) = Utc.timestamp_opt(msg.date, 0).single().filter(|_| msg.date > 0) {
        message.timestamp = ts;
    }
    message.reply_to_context = reply_context(msg);
    Some((message, media))
}

fn attach(message: &mut Message, kind: MediaKind, attachment: Attachment) {
    match kind {
        MediaKind::Audio => message.audio = Some(attachment),
        MediaKind::Image => message.image = Some(attachment),
        MediaKind::Document => message.document = Some(attachment),
    }
}

/// Local file name for a download: `<message id>_<name>`.
fn local_name(message_id: &str, media: &PendingMedia, remote_path: &str) -> String {
    let name = media
        .file_name
        .clone()
        .or_else(|| {
            Path::new(remote_path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| media.file_id.clone());
    let name: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("{message_id}_{name}")
}

// ── Channel ─────────────────────────────────────────────────────────────

pub struct TelegramChannel {
    token: String,
    allow_from: Vec<i64>,
    media_dir: PathBuf,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(config: &TelegramConfig, media_dir: PathBuf) -> Result<Self> {
        let token = config
            .bot_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .context("telegram.bot_token is not set")?;
        Ok(Self {
            token,
            allow_from: config.allow_from.clone(),
            media_dir,
            client: reqwest::Client::new(),
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{API_BASE}/bot{}/{method}", self.token)
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<TgUpdate>> {
        let resp: TgResponse<Vec<TgUpdate>> = self
            .client
            .get(self.url("getUpdates"))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", POLL_TIMEOUT_SECS.to_string()),
                ("allowed_updates", r#"["message"]"#.to_string()),
            ])
            .timeout(std::time::Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .send()
            .await?
            .json()
            .await?;
        if !resp.ok {
            anyhow::bail!("Telegram API error: {}", resp.description.unwrap_or_default());
        }
        Ok(resp.result.unwrap_or_default())
    }

    async fn download(&self, message_id: &str, media: &PendingMedia) -> Result<PathBuf> {
        let resp: TgResponse<TgFile> = self
            .client
            .get(self.url("getFile"))
            .query(&[("file_id", media.file_id.as_str())])
            .send()
            .await?
            .json()
            .await?;
        let remote = resp
            .result
            .and_then(|f| f.file_path)
            .context("getFile returned no file_path")?;
        let bytes = self
            .client
            .get(format!("{API_BASE}/file/bot{}/{remote}", self.token))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        tokio::fs::create_dir_all(&self.media_dir).await?;
        let path = self.media_dir.join(local_name(message_id, media, &remote));
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        debug!("Downloaded {} bytes to {}", bytes.len(), path.display());
        Ok(path)
    }

    /// Convert and download; `None` for updates we do not relay.
    async fn inbound(&self, msg: TgMessage) -> Option<Message> {
        let user_id = msg.from.as_ref().map(|u| u.id).unwrap_or(0);
        if !is_allowed(&self.allow_from, user_id) {
            debug!("Telegram: ignoring message from unauthorized user {user_id}");
            return None;
        }
        let (mut message, media) = build_message(&msg)?;
        if let Some(media) = media {
            let message_id = message.message_id.clone().unwrap_or_default();
            match self.download(&message_id, &media).await {
                Ok(path) => attach(
                    &mut message,
                    media.kind,
                    Attachment {
                        path,
                        mime_type: media.mime_type,
                        caption: media.caption,
                    },
                ),
                Err(e) => {
                    warn!("Telegram media download failed: {e:#}");
                    message.text = Some(match media.caption {
                        Some(caption) => format!("[attachment could not be downloaded]\n{caption}"),
                        None => "[attachment could not be downloaded]".to_string(),
                    });
                }
            }
        }
        Some(message)
    }

    async fn post_json(&self, method: &str, params: &serde_json::Value) -> Result<TgResponse<serde_json::Value>> {
        Ok(self
            .client
            .post(self.url(method))
            .json(params)
            .send()
            .await?
            .json()
            .await?)
    }

    async fn post_file(&self, method: &str, field: &str, chat_id: &str, path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part(field.to_string(), reqwest::multipart::Part::bytes(bytes).file_name(name));
        let resp: TgResponse<serde_json::Value> = self
            .client
            .post(self.url(method))
            .multipart(form)
            .send()
            .await?
            .json()
            .await?;
        if !resp.ok {
            anyhow::bail!("{method} failed: {}", resp.description.unwrap_or_default());
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn connect(&self) -> Result<()> {
        let resp: TgResponse<TgBot> = self
            .client
            .get(self.url("getMe"))
            .send()
            .await
            .context("Telegram is unreachable")?
            .json()
            .await?;
        if !resp.ok {
            anyhow::bail!("Telegram rejected the bot token: {}", resp.description.unwrap_or_default());
        }
        let username = resp.result.and_then(|b| b.username).unwrap_or_default();
        info!("Connected to Telegram as @{username}");
        Ok(())
    }

    async fn listen(&self, tx: mpsc::Sender<Message>) -> Result<()> {
        let mut offset: i64 = 0;
        info!("Telegram long polling started");
        loop {
            let updates = match self.get_updates(offset).await {
                Ok(updates) => updates,
                Err(e) => {
                    warn!("Telegram polling error: {e:#}");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            };
            for update in updates {
                offset = update.update_id + 1;
                let Some(msg) = update.message else { continue };
                let Some(message) = self.inbound(msg).await else { continue };
                if tx.send(message).await.is_err() {
                    info!("Inbound queue closed; Telegram polling stopped");
                    return Ok(());
                }
            }
        }
    }

    async fn send(&self, conversation_id: &str, text: &str, mode: SendMode) -> Result<Option<String>> {
        let mut params = serde_json::json!({
            "chat_id": conversation_id,
            "text": text,
        });
        if mode == SendMode::Markdown {
            params["parse_mode"] = serde_json::json!("Markdown");
        }
        let mut resp = self.post_json("sendMessage", &params).await?;
        if !resp.ok && mode == SendMode::Markdown {
            // Unbalanced markup is rejected; resend as plain text.
            debug!("Markdown rejected: {}", resp.description.as_deref().unwrap_or(""));
            if let Some(obj) = params.as_object_mut() {
                obj.remove("parse_mode");
            }
            resp = self.post_json("sendMessage", &params).await?;
        }
        if !resp.ok {
            anyhow::bail!("sendMessage failed: {}", resp.description.unwrap_or_default());
        }
        Ok(resp
            .result
            .and_then(|v| serde_json::from_value::<TgSent>(v).ok())
            .map(|sent| sent.message_id.to_string()))
    }

    async fn send_file(&self, conversation_id: &str, path: &Path) -> Result<()> {
        self.post_file("sendDocument", "document", conversation_id, path)
            .await
    }

    async fn send_audio(&self, conversation_id: &str, path: &Path) -> Result<()> {
        let is_voice = path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("ogg") || e.eq_ignore_ascii_case("oga"));
        if is_voice {
            self.post_file("sendVoice", "voice", conversation_id, path).await
        } else {
            self.post_file("sendAudio", "audio", conversation_id, path).await
        }
    }

    async fn send_typing(&self, conversation_id: &str) -> Result<()> {
        let params = serde_json::json!({
            "chat_id": conversation_id,
            "action": "typing",
        });
        let resp = self.post_json("sendChatAction", &params).await?;
        if !resp.ok {
            anyhow::bail!("sendChatAction failed: {}", resp.description.unwrap_or_default());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> TgMessage {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn text_with_command_and_reply_context() {
        let msg = parse(
            r#"{
                "message_id": 11, "date": 1700000000,
                "from": {"id": 5, "first_name": "Ada"},
                "chat": {"id": -100},
                "text": "/backend@duet_bot codex",
                "reply_to_message": {"message_id": 10, "chat": {"id": -100}, "text": "earlier answer"}
            }"#,
        );
        let (message, media) = build_message(&msg).unwrap();
        assert!(media.is_none());
        assert_eq!(message.conversation_id, "-100");
        assert_eq!(message.sender_id, "5");
        assert_eq!(message.sender_display_name, "Ada");
        assert_eq!(message.message_id.as_deref(), Some("11"));
        assert_eq!(message.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(message.reply_to_context.as_deref(), Some("earlier answer"));
        let command = message.command.unwrap();
        assert_eq!((command.name.as_str(), command.args.as_str()), ("backend", "codex"));
    }

    #[test]
    fn voice_becomes_pending_audio() {
        let msg = parse(
            r#"{
                "message_id": 12, "chat": {"id": 1}, "from": {"id": 1, "username": "bob"},
                "voice": {"file_id": "AwAD", "mime_type": "audio/ogg"}
            }"#,
        );
        let (mut message, media) = build_message(&msg).unwrap();
        let media = media.unwrap();
        assert_eq!(media.kind, MediaKind::Audio);
        assert_eq!(message.text, None);
        assert_eq!(message.sender_display_name, "bob");
        assert_eq!(local_name("12", &media, "voice/file_3.oga"), "12_file_3.oga");

        attach(
            &mut message,
            media.kind,
            Attachment {
                path: PathBuf::from("/tmp/12_file_3.oga"),
                mime_type: media.mime_type,
                caption: None,
            },
        );
        assert!(message.validate().is_ok());
    }

    #[test]
    fn largest_photo_is_used() {
        let msg = parse(
            r#"{
                "message_id": 13, "chat": {"id": 1},
                "caption": "what is this?",
                "photo": [{"file_id": "small"}, {"file_id": "large"}]
            }"#,
        );
        let (_, media) = build_message(&msg).unwrap();
        let media = media.unwrap();
        assert_eq!(media.kind, MediaKind::Image);
        assert_eq!(media.file_id, "large");
        assert_eq!(media.caption.as_deref(), Some("what is this?"));
    }

    #[test]
    fn stickers_and_service_messages_are_skipped() {
        let msg = parse(r#"{"message_id": 14, "chat": {"id": 1}}"#);
        assert!(build_message(&msg).is_none());
    }

    #[test]
    fn allow_list() {
        assert!(is_allowed(&[], 99));
        assert!(is_allowed(&[1, 2], 2));
        assert!(!is_allowed(&[1, 2], 3));
    }

    #[test]
    fn requires_a_token() {
        let err = TelegramChannel::new(&TelegramConfig::default(), PathBuf::from("/tmp"));
        assert!(err.is_err());
    }
}
