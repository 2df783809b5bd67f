use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separator line between independently deliverable parts of a [`Response`].
pub const PART_SEPARATOR: &str = "---PART---";

/// A normalized inbound chat message, as produced by a channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub conversation_id: String,
    pub sender_display_name: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_context: Option<String>,
}

/// A media file the channel adapter already downloaded to local disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

/// A slash command, e.g. `/backend codex` → `{ name: "backend", args: "codex" }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    #[serde(default)]
    pub args: String,
}

impl Command {
    /// Parse `/name rest of line`. Returns `None` when `text` is not a command.
    pub fn parse(text: &str) -> Option<Self> {
        let rest = text.trim().strip_prefix('/')?;
        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };
        // Telegram appends "@botname" to commands in groups.
        let name = name.split('@').next().unwrap_or(name);
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return None;
        }
        Some(Self {
            name: name.to_ascii_lowercase(),
            args: args.to_string(),
        })
    }
}

/// Borrowed view of a message's primary payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload<'a> {
    Text(&'a str),
    Audio(&'a Attachment),
    Image(&'a Attachment),
    Document(&'a Attachment),
    None,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("message carries {0} primary payloads, expected at most one")]
    MultiplePayloads(usize),
    #[error("message has neither a payload nor a command")]
    Empty,
    #[error("message has no conversation id")]
    MissingConversation,
}

impl Message {
    /// A plain text message stamped with the current time.
    pub fn text(
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let text = text.into();
        let sender_id = sender_id.into();
        Self {
            conversation_id: conversation_id.into(),
            sender_display_name: sender_id.clone(),
            sender_id,
            command: Command::parse(&text),
            text: Some(text),
            audio: None,
            image: None,
            document: None,
            message_id: None,
            timestamp: Utc::now(),
            reply_to_context: None,
        }
    }

    pub fn payload(&self) -> Payload<'_> {
        if let Some(text) = &self.text {
            Payload::Text(text)
        } else if let Some(audio) = &self.audio {
            Payload::Audio(audio)
        } else if let Some(image) = &self.image {
            Payload::Image(image)
        } else if let Some(document) = &self.document {
            Payload::Document(document)
        } else {
            Payload::None
        }
    }

    pub fn validate(&self) -> Result<(), MessageError> {
        if self.conversation_id.trim().is_empty() {
            return Err(MessageError::MissingConversation);
        }
        let count = [
            self.text.is_some(),
            self.audio.is_some(),
            self.image.is_some(),
            self.document.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count();
        match count {
            0 if self.command.is_none() => Err(MessageError::Empty),
            0 | 1 => Ok(()),
            n => Err(MessageError::MultiplePayloads(n)),
        }
    }

    /// The text payload, if any, trimmed.
    pub fn text_content(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    /// Render the message into a single prompt-ready block of text.
    /// Attachments are referenced by path; the caller decides whether to
    /// transcribe or describe them first.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        if let Some(ctx) = &self.reply_to_context {
            out.push_str(&format!("[In reply to: {}]\n", ctx.trim()));
        }
        match self.payload() {
            Payload::Text(text) => out.push_str(text.trim()),
            Payload::Audio(a) => out.push_str(&attachment_line("voice message", a)),
            Payload::Image(a) => out.push_str(&attachment_line("image", a)),
            Payload::Document(a) => out.push_str(&attachment_line("document", a)),
            Payload::None => {
                if let Some(cmd) = &self.command {
                    out.push_str(&format!("/{} {}", cmd.name, cmd.args).trim_end().to_string());
                }
            }
        }
        out
    }
}

fn attachment_line(kind: &str, attachment: &Attachment) -> String {
    let mut line = format!("[{kind} attached: {}]", attachment.path.display());
    if let Some(caption) = attachment.caption.as_deref().filter(|c| !c.trim().is_empty()) {
        line.push('\n');
        line.push_str(caption.trim());
    }
    line
}

/// A complete logical reply to one [`Message`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<PathBuf>,
}

impl Response {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Split the text on [`PART_SEPARATOR`] lines, dropping empty parts.
    pub fn parts(&self) -> Vec<&str> {
        let mut parts = Vec::new();
        let mut start = 0;
        let mut offset = 0;
        for line in self.text.split_inclusive('\n') {
            if line.trim() == PART_SEPARATOR {
                parts.push(&self.text[start..offset]);
                start = offset + line.len();
            }
            offset += line.len();
        }
        parts.push(&self.text[start..]);
        parts
            .into_iter()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.files.is_empty() && self.audio_path.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(path: &str) -> Attachment {
        Attachment {
            path: PathBuf::from(path),
            mime_type: None,
            caption: None,
        }
    }

    #[test]
    fn parses_commands() {
        let cmd = Command::parse("/backend codex").unwrap();
        assert_eq!(cmd.name, "backend");
        assert_eq!(cmd.args, "codex");

        let cmd = Command::parse("/Cancel@duet_bot").unwrap();
        assert_eq!(cmd.name, "cancel");
        assert_eq!(cmd.args, "");

        assert!(Command::parse("hello /there").is_none());
        assert!(Command::parse("/").is_none());
        assert!(Command::parse("/path/to/file").is_none());
    }

    #[test]
    fn text_message_detects_command() {
        let msg = Message::text("42", "u1", "/status");
        assert_eq!(msg.command.as_ref().map(|c| c.name.as_str()), Some("status"));
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn rejects_multiple_payloads() {
        let mut msg = Message::text("42", "u1", "hi");
        msg.image = Some(attachment("/tmp/a.png"));
        assert_eq!(msg.validate(), Err(MessageError::MultiplePayloads(2)));
    }

    #[test]
    fn command_only_message_is_valid() {
        let mut msg = Message::text("42", "u1", "/cancel");
        msg.text = None;
        assert!(msg.validate().is_ok());
        msg.command = None;
        assert_eq!(msg.validate(), Err(MessageError::Empty));
    }

    #[test]
    fn describe_mentions_attachment_and_caption() {
        let mut msg = Message::text("42", "u1", "x");
        msg.text = None;
        msg.command = None;
        msg.image = Some(Attachment {
            caption: Some("what is this?".into()),
            ..attachment("/tmp/cat.jpg")
        });
        msg.reply_to_context = Some("earlier answer".into());
        let text = msg.describe();
        assert!(text.starts_with("[In reply to: earlier answer]"));
        assert!(text.contains("[image attached: /tmp/cat.jpg]"));
        assert!(text.ends_with("what is this?"));
    }

    #[test]
    fn response_parts_split_on_separator() {
        let resp = Response::text("first\n---PART---\nsecond\n\n---PART---\n\n");
        assert_eq!(resp.parts(), vec!["first", "second"]);
        assert_eq!(Response::text("only").parts(), vec!["only"]);
    }

    #[test]
    fn response_serializes_without_empty_fields() {
        let json = serde_json::to_string(&Response::text("hello")).unwrap();
        assert_eq!(json, r#"{"text":"hello"}"#);
    }
}
