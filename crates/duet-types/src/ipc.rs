//! NDJSON envelopes exchanged between the gateway and the worker.
//!
//! One request line, one reply line per connection.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{Message, Response};

/// Gateway → Worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayToWorker {
    /// Process one inbound message (`POST /message`).
    Message {
        request_id: String,
        message: Message,
    },
    /// Readiness check (`GET /health`).
    Health,
}

/// Worker → Gateway, replying to [`GatewayToWorker`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerToGateway {
    Response {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        files: Vec<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio: Option<PathBuf>,
    },
    /// Initialization (auth gate, scheduler, attachments) has completed.
    Healthy {
        timestamp: DateTime<Utc>,
    },
    NotReady,
    Error {
        message: String,
    },
}

impl From<Response> for WorkerToGateway {
    fn from(resp: Response) -> Self {
        Self::Response {
            text: resp.text,
            files: resp.files,
            audio: resp.audio_path,
        }
    }
}

/// Worker → Gateway push for scheduled or background notifications (`POST /send`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendRequest {
    pub conversation_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<PathBuf>,
}

impl SendRequest {
    /// HTTP-style status for a malformed request, `None` when it is acceptable.
    pub fn validation_error(&self) -> Option<(u16, &'static str)> {
        if self.conversation_id.trim().is_empty() {
            return Some((400, "conversation_id is required"));
        }
        if self.text.trim().is_empty() && self.files.is_empty() {
            return Some((400, "text or files is required"));
        }
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendReply {
    pub ok: bool,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendReply {
    pub fn ok() -> Self {
        Self {
            ok: true,
            status: 200,
            error: None,
        }
    }

    pub fn failed(status: u16, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            status,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_use_snake_case_tags() {
        let json = serde_json::to_string(&GatewayToWorker::Health).unwrap();
        assert_eq!(json, r#"{"type":"health"}"#);

        let reply: WorkerToGateway = serde_json::from_str(r#"{"type":"not_ready"}"#).unwrap();
        assert!(matches!(reply, WorkerToGateway::NotReady));

        let reply: WorkerToGateway =
            serde_json::from_str(r#"{"type":"response","text":"hello"}"#).unwrap();
        match reply {
            WorkerToGateway::Response { text, files, audio } => {
                assert_eq!(text, "hello");
                assert!(files.is_empty());
                assert!(audio.is_none());
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn send_request_validation() {
        let mut req = SendRequest {
            conversation_id: "42".into(),
            text: "reminder".into(),
            files: vec![],
        };
        assert_eq!(req.validation_error(), None);

        req.text = "  ".into();
        assert_eq!(req.validation_error().map(|e| e.0), Some(400));

        req.files.push(PathBuf::from("/tmp/report.pdf"));
        assert_eq!(req.validation_error(), None);

        req.conversation_id.clear();
        assert_eq!(req.validation_error().map(|e| e.0), Some(400));
    }
}
