//! Turns one inbound [`Message`] into one [`Response`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::{info, warn};

use duet_backend::Backend;
use duet_types::config::SelectionConfig;
use duet_types::ipc::SendRequest;
use duet_types::message::{Command, Message, Payload, Response};
use duet_types::paths::detect_output_files;

use crate::gateway_bridge::Notifier;
use crate::media::MediaDescriber;
use crate::queue::{Invocation, InvocationQueue, Priority};
use crate::select::select_backend;

/// Longest `/later` delay accepted (one week).
const MAX_LATER_SECS: u64 = 7 * 24 * 3600;

pub struct Handler {
    backends: Vec<Backend>,
    selection: SelectionConfig,
    queue: InvocationQueue,
    media: Arc<dyn MediaDescriber>,
    notifier: Arc<dyn Notifier>,
    /// Per-conversation `/backend` choice. In memory only.
    overrides: Mutex<HashMap<String, String>>,
    /// `/later` timers that have not fired yet.
    timers: Mutex<HashMap<String, Vec<AbortHandle>>>,
}

impl Handler {
    pub fn new(
        backends: Vec<Backend>,
        selection: SelectionConfig,
        queue: InvocationQueue,
        media: Arc<dyn MediaDescriber>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            backends,
            selection,
            queue,
            media,
            notifier,
            overrides: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn handle(&self, message: Message) -> Response {
        if let Err(e) = message.validate() {
            warn!("Rejecting malformed message: {e}");
            return Response::text(format!("⚠️ Could not process that message: {e}"));
        }
        if let Some(cmd) = &message.command {
            if let Some(reply) = self.command(&message.conversation_id, cmd) {
                return Response::text(reply);
            }
        }

        let prompt = self.prompt_for(&message).await;
        let conversation = message.conversation_id.as_str();
        let override_name = self.override_for(conversation);
        let Some(sel) = select_backend(&prompt, override_name.as_deref(), &self.backends, &self.selection)
        else {
            return Response::text("⚠️ No backends are configured.");
        };
        info!(
            "Routing message for {} to {} (model: {}, deep: {})",
            conversation,
            sel.backend.name(),
            sel.model.as_deref().unwrap_or("default"),
            sel.deep
        );
        let invocation = Invocation {
            backend: sel.backend.clone(),
            model: sel.model,
            prompt: sel.prompt,
        };
        let text = self.queue.submit(invocation, conversation, Priority::User).await;
        let files = detect_output_files(&text, |p| p.is_file());
        Response {
            text,
            files,
            audio_path: None,
        }
    }

    /// Worker-local commands. `None` means "not ours, treat as a prompt".
    fn command(&self, conversation: &str, cmd: &Command) -> Option<String> {
        let reply = match cmd.name.as_str() {
            "cancel" => {
                let timers = self.cancel_timers(conversation);
                let flushed = self.queue.flush(conversation);
                format!("🛑 Cancelled {timers} scheduled task(s), dropped {flushed} queued run(s).")
            }
            "backend" => self.backend_command(conversation, cmd.args.trim()),
            "status" => self.status(conversation),
            "later" => self.schedule(conversation, &cmd.args),
            _ => return None,
        };
        Some(reply)
    }

    fn override_for(&self, conversation: &str) -> Option<String> {
        self.overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(conversation)
            .cloned()
    }

    fn backend_command(&self, conversation: &str, arg: &str) -> String {
        let names: Vec<&str> = self.backends.iter().map(|b| b.name()).collect();
        if arg.is_empty() {
            let current = self
                .override_for(conversation)
                .unwrap_or_else(|| self.selection.default_backend.clone());
            return format!("Current backend: {current}\nAvailable: {}", names.join(", "));
        }
        let Some(backend) = self.backends.iter().find(|b| b.name().eq_ignore_ascii_case(arg)) else {
            return format!("Unknown backend '{arg}'. Available: {}", names.join(", "));
        };
        self.overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(conversation.to_string(), backend.name().to_string());
        info!("Conversation {conversation} switched to {}", backend.name());
        format!("✅ Switched to {}.", backend.name())
    }

    fn status(&self, conversation: &str) -> String {
        let status = self.queue.status();
        let pending_timers = self
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(conversation)
            .map_or(0, |t| t.iter().filter(|h| !h.is_finished()).count());
        let running = match &status.in_flight {
            Some(f) => format!(
                "{} for {} ({}s)",
                f.backend,
                f.conversation_id,
                f.started.elapsed().as_secs()
            ),
            None => "idle".to_string(),
        };
        format!(
            "Running: {running}\nQueued: {} user, {} background\nScheduled here: {pending_timers}",
            status.user_queued, status.background_queued
        )
    }

    /// `/later <seconds> <prompt>`: run `prompt` as a background ticket after
    /// the delay and push the result through the gateway.
    fn schedule(&self, conversation: &str, args: &str) -> String {
        let usage = "Usage: /later <seconds> <prompt>";
        let Some((secs, prompt)) = args.trim().split_once(char::is_whitespace) else {
            return usage.to_string();
        };
        let Ok(secs) = secs.parse::<u64>() else {
            return usage.to_string();
        };
        if secs > MAX_LATER_SECS {
            return format!("⚠️ Delay too long (max {MAX_LATER_SECS}s).");
        }
        let prompt = prompt.trim().to_string();
        let override_name = self.override_for(conversation);
        let Some(sel) = select_backend(&prompt, override_name.as_deref(), &self.backends, &self.selection)
        else {
            return "⚠️ No backends are configured.".to_string();
        };
        let invocation = Invocation {
            backend: sel.backend.clone(),
            model: sel.model,
            prompt: sel.prompt,
        };

        let queue = self.queue.clone();
        let notifier = self.notifier.clone();
        let conv = conversation.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            let text = queue.submit(invocation, &conv, Priority::Background).await;
            if text.trim().is_empty() {
                // Flushed by /cancel while queued.
                return;
            }
            let request = SendRequest {
                files: detect_output_files(&text, |p| p.is_file()),
                conversation_id: conv.clone(),
                text,
            };
            if let Err(e) = notifier.send(request).await {
                warn!("Failed to deliver scheduled result to {conv}: {e:#}");
            }
        });

        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        let list = timers.entry(conversation.to_string()).or_default();
        list.retain(|h| !h.is_finished());
        list.push(task.abort_handle());
        info!("Scheduled background prompt for {conversation} in {secs}s");
        format!("⏰ Scheduled in {secs}s.")
    }

    /// Abort timers that have not fired yet. Returns how many were pending.
    fn cancel_timers(&self, conversation: &str) -> usize {
        let handles = self
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(conversation)
            .unwrap_or_default();
        let mut cancelled = 0;
        for handle in handles {
            if !handle.is_finished() {
                handle.abort();
                cancelled += 1;
            }
        }
        cancelled
    }

    async fn prompt_for(&self, message: &Message) -> String {
        let Payload::Audio(audio) = message.payload() else {
            return message.describe();
        };
        if !self.media.is_configured() {
            return message.describe();
        }
        match self.media.describe(&audio.path).await {
            Ok(transcript) if !transcript.is_empty() => {
                let mut prompt = String::new();
                if let Some(ctx) = &message.reply_to_context {
                    prompt.push_str(&format!("[In reply to: {}]\n", ctx.trim()));
                }
                prompt.push_str(&format!("[Voice message transcript]\n{transcript}"));
                prompt
            }
            Ok(_) => message.describe(),
            Err(e) => {
                warn!("Transcription failed for {}: {e:#}", audio.path.display());
                message.describe()
            }
        }
    }
}
