//! Auth Recovery: notice that a backend wants re-authentication and drive its
//! login flow, relaying the login URL to the user and piping their code back.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tracing::{debug, info, warn};

use duet_backend::tee::{Echo, Tee};
use duet_backend::Backend;
use duet_types::config::AuthConfig;

use crate::events::EventBus;

/// Anything that wants to see raw worker or CLI output. `backend` names the
/// CLI that produced `text` when it is known.
pub trait OutputObserver: Send + Sync {
    fn observe(&self, text: &str, backend: Option<&str>, conversation_id: Option<&str>);
}

const URL_SETTLE: Duration = Duration::from_millis(300);

/// A URL followed by whitespace, so one split across reads is not sent
/// truncated.
fn login_url() -> &'static Regex {
    static URL: OnceLock<Regex> = OnceLock::new();
    URL.get_or_init(|| Regex::new(r"https?://[^\s\x1b]+\s").unwrap())
}

/// A URL at the very end of the output so far.
fn trailing_url() -> &'static Regex {
    static URL: OnceLock<Regex> = OnceLock::new();
    URL.get_or_init(|| Regex::new(r"https?://[^\s\x1b]+$").unwrap())
}

/// Watches a login process's output and relays the first URL to the waiting
/// conversations.
struct UrlRelay {
    inner: Arc<Inner>,
    name: String,
    sent: AtomicBool,
    seen: Mutex<String>,
}

impl UrlRelay {
    fn seen(&self) -> MutexGuard<'_, String> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn feed(self: &Arc<Self>, chunk: &str) {
        if self.sent.load(Ordering::SeqCst) {
            return;
        }
        let mut seen = self.seen();
        seen.push_str(chunk);
        if let Some(m) = login_url().find(&seen) {
            let url = m.as_str().trim().to_string();
            drop(seen);
            self.send(&url);
        } else if let Some(m) = trailing_url().find(&seen) {
            // Output stopped right after a URL, typically because the CLI now
            // waits on stdin. Send it if nothing else arrives.
            let url = m.as_str().to_string();
            let len = seen.len();
            let relay = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(URL_SETTLE).await;
                if relay.seen().len() == len {
                    relay.send(&url);
                }
            });
        }
    }

    fn send(&self, url: &str) {
        if self.sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let name = &self.name;
        let pending = self
            .inner
            .sessions()
            .get(name)
            .map(|s| s.pending.clone())
            .unwrap_or_default();
        self.inner.tell(
            &pending,
            &format!("🔑 {name} needs you to sign in:\n{url}\nIf a code is shown afterwards, send it here."),
        );
    }
}

#[derive(Default)]
struct Session {
    in_progress: bool,
    last_attempt: Option<Instant>,
    last_failure: Option<Instant>,
    pending: HashSet<String>,
    stdin: Option<Arc<tokio::sync::Mutex<ChildStdin>>>,
}

struct Inner {
    backends: Vec<Backend>,
    config: AuthConfig,
    bus: EventBus,
    sessions: Mutex<HashMap<String, Session>>,
}

impl Inner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tell(&self, conversations: &HashSet<String>, text: &str) {
        if conversations.is_empty() {
            self.bus.broadcast(text);
        }
        for conv in conversations {
            self.bus.notify(conv, text);
        }
    }
}

#[derive(Clone)]
pub struct AuthRecovery {
    inner: Arc<Inner>,
}

impl AuthRecovery {
    pub fn new(backends: Vec<Backend>, config: AuthConfig, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                backends,
                config,
                bus,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn is_recovering(&self, backend: &str) -> bool {
        self.inner
            .sessions()
            .get(backend)
            .is_some_and(|s| s.in_progress)
    }

    /// Start recovery for `backend` on behalf of `conversation_id`.
    /// Idempotent while a recovery is running; refused during cooldown.
    pub fn trigger(&self, backend: &Backend, conversation_id: Option<&str>) -> bool {
        let name = backend.name().to_string();
        {
            let mut sessions = self.inner.sessions();
            let session = sessions.entry(name.clone()).or_default();
            if session.in_progress {
                if let Some(conv) = conversation_id {
                    session.pending.insert(conv.to_string());
                }
                debug!("Auth recovery for {name} already running");
                return false;
            }
            let cooling = session
                .last_failure
                .or(session.last_attempt.filter(|_| backend.config().login_command.is_none()))
                .is_some_and(|t| t.elapsed() < self.inner.config.cooldown());
            if cooling {
                debug!("Auth recovery for {name} is cooling down");
                return false;
            }
            session.last_attempt = Some(Instant::now());
            session.pending = conversation_id.map(|c| c.to_string()).into_iter().collect();
            if backend.config().login_command.is_some() {
                session.in_progress = true;
            }
        }

        let Some(cmd) = backend.login_command() else {
            let pending: HashSet<String> = conversation_id.map(|c| c.to_string()).into_iter().collect();
            self.inner.tell(
                &pending,
                &format!("🔑 {name} needs to sign in again. Run its login command on the host, then retry."),
            );
            return false;
        };

        info!("Auth failure detected for {name}; starting login flow");
        let inner = self.inner.clone();
        tokio::spawn(run_login(inner, name, cmd));
        true
    }

    /// Hand a short code typed by the user to a waiting login process.
    /// Returns `true` when the text was consumed.
    pub async fn feed_code(&self, conversation_id: &str, text: &str) -> bool {
        let code = text.trim();
        let looks_like_code = !code.is_empty()
            && !code.starts_with('/')
            && !code.chars().any(char::is_whitespace)
            && code.chars().count() <= self.inner.config.max_code_len;
        if !looks_like_code {
            return false;
        }

        let target = {
            let sessions = self.inner.sessions();
            sessions.iter().find_map(|(name, s)| {
                (s.in_progress && s.pending.contains(conversation_id))
                    .then(|| s.stdin.clone().map(|stdin| (name.clone(), stdin)))
                    .flatten()
            })
        };
        let Some((name, stdin)) = target else {
            return false;
        };

        let mut stdin = stdin.lock().await;
        let write = async {
            stdin.write_all(code.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        match write.await {
            Ok(()) => {
                info!("Forwarded login code to {name}");
                self.inner
                    .bus
                    .notify(conversation_id, format!("🔑 Code sent to {name}, finishing sign-in…"));
                true
            }
            Err(e) => {
                warn!("Failed to write login code to {name}: {e}");
                false
            }
        }
    }
}

impl OutputObserver for AuthRecovery {
    fn observe(&self, text: &str, backend: Option<&str>, conversation_id: Option<&str>) {
        // Unattributed output (worker replies and logs) blames the first
        // backend whose signature matches.
        let hit = self
            .inner
            .backends
            .iter()
            .filter(|b| backend.is_none_or(|name| b.name() == name))
            .find(|b| b.auth_failure_line(text).is_some())
            .cloned();
        if let Some(backend) = hit {
            self.trigger(&backend, conversation_id);
        }
    }
}

async fn run_login(inner: Arc<Inner>, name: String, mut cmd: tokio::process::Command) {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!("Failed to start login for {name}: {e}");
            finish(&inner, &name, false, &format!("could not start the login command ({e})"));
            return;
        }
    };

    if let Some(stdin) = child.stdin.take() {
        if let Some(session) = inner.sessions().get_mut(&name) {
            session.stdin = Some(Arc::new(tokio::sync::Mutex::new(stdin)));
        }
    }

    let relay = Arc::new(UrlRelay {
        inner: inner.clone(),
        name: name.clone(),
        sent: AtomicBool::new(false),
        seen: Mutex::new(String::new()),
    });
    let mut readers = Vec::new();
    for (label, stream) in [
        ("stdout", child.stdout.take().map(|s| Box::new(s) as Box<dyn tokio::io::AsyncRead + Unpin + Send>)),
        ("stderr", child.stderr.take().map(|s| Box::new(s) as Box<dyn tokio::io::AsyncRead + Unpin + Send>)),
    ] {
        let Some(stream) = stream else { continue };
        let relay = relay.clone();
        readers.push(
            Tee::new(format!("login:{name}:{label}"))
                .echo(Echo::Info)
                .on_chunk(move |chunk| relay.feed(chunk))
                .spawn(stream),
        );
    }

    let result = tokio::time::timeout(inner.config.login_timeout(), child.wait()).await;
    let (ok, detail) = match result {
        Ok(Ok(status)) if status.success() => (true, String::new()),
        Ok(Ok(status)) => (false, format!("login exited with {status}")),
        Ok(Err(e)) => (false, format!("could not wait for login ({e})")),
        Err(_) => {
            let _ = child.kill().await;
            (
                false,
                format!("login timed out after {}s", inner.config.login_timeout().as_secs()),
            )
        }
    };
    for reader in readers {
        reader.abort();
    }
    finish(&inner, &name, ok, &detail);
}

fn finish(inner: &Inner, name: &str, ok: bool, detail: &str) {
    let pending = {
        let mut sessions = inner.sessions();
        let session = sessions.entry(name.to_string()).or_default();
        session.in_progress = false;
        session.stdin = None;
        session.last_failure = if ok { None } else { Some(Instant::now()) };
        std::mem::take(&mut session.pending)
    };
    if ok {
        info!("Auth recovery for {name} succeeded");
        inner.tell(&pending, &format!("✅ {name} is signed in again. You can carry on."));
    } else {
        warn!("Auth recovery for {name} failed: {detail}");
        inner.tell(
            &pending,
            &format!("❌ {name} sign-in did not complete: {detail}. Send a message again later to retry."),
        );
    }
}
