//! Voice-message transcription.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use duet_types::config::MediaConfig;
use duet_types::text::truncate_chars;

const WHISPER_URL: &str = "https://api.openai.com/v1/audio/transcriptions";

/// Turns a downloaded media file into prompt text.
#[async_trait]
pub trait MediaDescriber: Send + Sync {
    fn is_configured(&self) -> bool;
    async fn describe(&self, path: &Path) -> Result<String>;
}

/// Used when no API key is set; the handler then references the file path.
pub struct Unconfigured;

#[async_trait]
impl MediaDescriber for Unconfigured {
    fn is_configured(&self) -> bool {
        false
    }

    async fn describe(&self, path: &Path) -> Result<String> {
        anyhow::bail!("No transcription backend configured for {}", path.display())
    }
}

/// OpenAI Whisper over HTTP.
pub struct WhisperTranscriber {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl WhisperTranscriber {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

/// Whisper when an API key is configured (or `OPENAI_API_KEY` is set).
pub fn from_config(config: &MediaConfig) -> Box<dyn MediaDescriber> {
    let key = config
        .whisper_api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .or_else(|| std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty()));
    match key {
        Some(key) => Box::new(WhisperTranscriber::new(key, config.whisper_model.clone())),
        None => Box::new(Unconfigured),
    }
}

fn audio_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("wav") => "audio/wav",
        Some("webm") => "audio/webm",
        _ => "audio/ogg",
    }
}

#[async_trait]
impl MediaDescriber for WhisperTranscriber {
    fn is_configured(&self) -> bool {
        true
    }

    async fn describe(&self, path: &Path) -> Result<String> {
        let audio = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read audio file {}", path.display()))?;
        info!("Whisper transcribing {} bytes from {}", audio.len(), path.display());

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.ogg".to_string());
        let part = reqwest::multipart::Part::bytes(audio)
            .file_name(file_name)
            .mime_str(audio_mime(path))?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "text")
            .part("file", part);

        let resp = self
            .client
            .post(WHISPER_URL)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .context("Failed to call Whisper API")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Whisper API error ({status}): {}", truncate_chars(&body, 300));
        }

        let text = resp.text().await?.trim().to_string();
        info!("Whisper transcribed: \"{}\"", truncate_chars(&text, 80));
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_from_extension() {
        assert_eq!(audio_mime(Path::new("/tmp/voice.OGG")), "audio/ogg");
        assert_eq!(audio_mime(Path::new("/tmp/memo.m4a")), "audio/mp4");
        assert_eq!(audio_mime(Path::new("/tmp/noext")), "audio/ogg");
    }

    #[tokio::test]
    async fn unconfigured_refuses() {
        let media = Unconfigured;
        assert!(!media.is_configured());
        assert!(media.describe(Path::new("/tmp/x.ogg")).await.is_err());
    }
}
