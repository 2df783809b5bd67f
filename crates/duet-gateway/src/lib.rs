pub mod auth;
pub mod bridge;
pub mod channel;
pub mod channels;
pub mod config;
pub mod events;
pub mod fallback;
pub mod health;
pub mod ipc;
pub mod pidfile;
pub mod reload;
pub mod repair;
pub mod supervisor;

pub use events::{EventBus, GatewayEvent};

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use duet_backend::backend::build_backends;
use duet_backend::{CliRunner, ProcessRunner};
use duet_types::config::{DuetConfig, GatewayConfig};
use duet_types::message::{Message, Response};
use duet_types::text::tail_chars;

use auth::{AuthRecovery, OutputObserver};
use bridge::Bridge;
use channel::{deliver_response, Channel, SendMode};
use config::Paths;
use fallback::FallbackInvoker;
use ipc::{worker_command, Delivery, SendServer, UnixWorkerClient};
use pidfile::PidFile;
use reload::ReloadWatcher;
use repair::AutoRepair;
use supervisor::{CommandFactory, Supervisor, SupervisorHandle};

const TYPING_INTERVAL: Duration = Duration::from_secs(4);
const HEALTH_EXCERPT_CHARS: usize = 800;

/// The stable process: owns the channel, the supervised worker and the
/// fallback path.
pub struct Gateway {
    config: DuetConfig,
    paths: Paths,
    channel: Arc<dyn Channel>,
}

impl Gateway {
    pub fn new(config: DuetConfig, paths: Paths, channel: Arc<dyn Channel>) -> Self {
        Self {
            config,
            paths,
            channel,
        }
    }

    /// Run until the channel stops listening or `shutdown` resolves, then
    /// stop the worker.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let Self {
            config,
            paths,
            channel,
        } = self;
        let backends = build_backends(&config.backends)?;
        let bus = EventBus::new();
        let events = bus.subscribe();

        let auth = AuthRecovery::new(backends.clone(), config.auth.clone(), bus.clone());
        let observer: Arc<dyn OutputObserver> = Arc::new(auth.clone());

        let runner: Arc<dyn CliRunner> = Arc::new(ProcessRunner::new(None));
        let fallback = FallbackInvoker::new(
            runner,
            backends.clone(),
            config.fallback.order.clone(),
            config.fallback.timeout(),
        )
        .with_observer(observer.clone());
        let repairer = AutoRepair::new(
            Arc::new(ProcessRunner::new(config.repair.project_root.clone())),
            backends,
            config.repair.clone(),
        );

        let worker = Arc::new(UnixWorkerClient::new(&paths.worker_socket));
        let command: CommandFactory = {
            let config = config.clone();
            let paths = paths.clone();
            Arc::new(move || worker_command(&config, &paths))
        };
        let (mut supervisor, supervisor_handle) = Supervisor::new(
            config.supervisor.clone(),
            command,
            worker.clone(),
            Arc::new(repairer),
            bus.clone(),
        )?;
        supervisor = supervisor.with_observer(observer.clone()).with_pid_file(
            PidFile::new(&paths.pid_file),
            paths.worker_socket.to_string_lossy(),
        );
        if config.worker.live_reload {
            if config.worker.watch_paths.is_empty() {
                warn!("worker.live_reload is on but worker.watch_paths is empty");
            } else {
                match ReloadWatcher::start(&config.worker.watch_paths, config.supervisor.reload_debounce()) {
                    Ok(watcher) => supervisor = supervisor.with_reload(watcher),
                    Err(e) => warn!("Live reload disabled: {e:#}"),
                }
            }
        }

        let bridge = Bridge::new(
            supervisor_handle.health().clone(),
            worker,
            Arc::new(fallback),
            bus,
            config.bridge.clone(),
        )
        .with_observer(observer);

        channel
            .connect()
            .await
            .with_context(|| format!("Failed to connect {}", channel.name()))?;

        let core = Arc::new(Core::new(
            channel.clone(),
            bridge,
            auth,
            supervisor_handle.clone(),
            &config.gateway,
        ));

        let supervisor_task = tokio::spawn(supervisor.run());
        let send_server = SendServer::bind(&paths.send_socket)?;
        let send_task = tokio::spawn(send_server.serve(core.clone()));
        let events_task = tokio::spawn(deliver_events(core.clone(), events));

        let (tx, mut rx) = mpsc::channel::<Message>(64);
        let mut listen_task = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.listen(tx).await })
        };
        info!("Gateway running on {}", channel.name());

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                Some(message) = rx.recv() => {
                    let core = core.clone();
                    tokio::spawn(async move { core.handle(message).await });
                }
                result = &mut listen_task => {
                    match result {
                        Ok(Ok(())) => info!("{} stopped listening", channel.name()),
                        Ok(Err(e)) => error!("{} listener failed: {e:#}", channel.name()),
                        Err(e) => error!("{} listener panicked: {e}", channel.name()),
                    }
                    break;
                }
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    listen_task.abort();
                    break;
                }
            }
        }

        supervisor_handle.shutdown().await;
        if let Err(e) = supervisor_task.await {
            warn!("Supervisor task ended abnormally: {e}");
        }
        send_task.abort();
        events_task.abort();
        info!("Gateway stopped");
        Ok(())
    }
}

/// Shared per-message state.
struct Core {
    channel: Arc<dyn Channel>,
    bridge: Bridge,
    auth: AuthRecovery,
    supervisor: SupervisorHandle,
    max_message_chars: usize,
    notify_recent: usize,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Most recently active first.
    recent: Mutex<VecDeque<String>>,
}

/// One message's exclusive turn in its conversation. On drop, the
/// conversation's lock is forgotten unless another message holds or awaits it.
struct Turn<'a> {
    core: &'a Core,
    conversation_id: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let mut locks = self.core.locks.lock().unwrap_or_else(|e| e.into_inner());
        self.guard.take();
        if locks
            .get(&self.conversation_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.conversation_id);
        }
    }
}

/// Keeps the typing indicator alive until dropped.
struct Typing(JoinHandle<()>);

impl Drop for Typing {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Core {
    fn new(
        channel: Arc<dyn Channel>,
        bridge: Bridge,
        auth: AuthRecovery,
        supervisor: SupervisorHandle,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            channel,
            bridge,
            auth,
            supervisor,
            max_message_chars: config.max_message_chars,
            notify_recent: config.notify_recent,
            locks: Mutex::new(HashMap::new()),
            recent: Mutex::new(VecDeque::new()),
        }
    }

    async fn turn(&self, conversation_id: &str) -> Turn<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(conversation_id.to_string()).or_default().clone()
        };
        Turn {
            core: self,
            conversation_id: conversation_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    fn recent(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.recent.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self, conversation_id: &str) {
        let mut recent = self.recent();
        recent.retain(|c| c != conversation_id);
        recent.push_front(conversation_id.to_string());
        recent.truncate(self.notify_recent);
    }

    fn typing(&self, conversation_id: &str) -> Typing {
        let channel = self.channel.clone();
        let conversation_id = conversation_id.to_string();
        Typing(tokio::spawn(async move {
            loop {
                if let Err(e) = channel.send_typing(&conversation_id).await {
                    debug!("Typing indicator failed: {e:#}");
                }
                tokio::time::sleep(TYPING_INTERVAL).await;
            }
        }))
    }

    async fn reply(&self, conversation_id: &str, text: &str) {
        if let Err(e) = self.channel.send(conversation_id, text, SendMode::Plain).await {
            error!("Failed to send to {conversation_id}: {e:#}");
        }
    }

    async fn handle(&self, message: Message) {
        let conv = message.conversation_id.clone();
        self.touch(&conv);
        let _turn = self.turn(&conv).await;

        if let Err(e) = message.validate() {
            warn!("Dropping invalid message from {conv}: {e}");
            self.reply(&conv, &format!("⚠️ Could not read that message: {e}")).await;
            return;
        }
        if let Some(command) = &message.command {
            match command.name.as_str() {
                "restart" => {
                    let text = if self.supervisor.restart().await {
                        "🔄 Restarting the worker…"
                    } else {
                        "⚠️ The supervisor is not running."
                    };
                    self.reply(&conv, text).await;
                    return;
                }
                "health" => {
                    self.reply(&conv, &self.health_report()).await;
                    return;
                }
                _ => {}
            }
        }
        if let Some(text) = message.text_content() {
            if self.auth.feed_code(&conv, text).await {
                return;
            }
        }

        let response = {
            let _typing = self.typing(&conv);
            self.bridge.route(&message).await
        };
        if let Err(e) = deliver_response(self.channel.as_ref(), &conv, &response, self.max_message_chars).await {
            error!("Failed to deliver response to {conv}: {e:#}");
        }
    }

    fn health_report(&self) -> String {
        let health = self.supervisor.health();
        let stats = self.supervisor.stats();
        let mut report = format!(
            "Worker: {}\nSpawns: {}, recent crashes: {}, auto-fix runs: {}",
            health.current(),
            stats.spawns,
            stats.crash_count,
            stats.repairs
        );
        if let Some(exit) = &stats.last_exit {
            report.push_str(&format!("\nLast exit: {exit}"));
        }
        if stats.awaiting_manual {
            report.push_str("\nWaiting for /restart after a failed auto-fix.");
        }
        let output = health.last_error();
        let output = output.trim();
        if !output.is_empty() {
            report.push_str(&format!(
                "\n\nLast output:\n{}",
                tail_chars(output, HEALTH_EXCERPT_CHARS)
            ));
        }
        report
    }
}

#[async_trait]
impl Delivery for Core {
    async fn deliver(&self, conversation_id: &str, response: Response) -> Result<()> {
        self.touch(conversation_id);
        deliver_response(self.channel.as_ref(), conversation_id, &response, self.max_message_chars).await
    }
}

/// Forward bus notices to the channel until the bus closes.
async fn deliver_events(core: Arc<Core>, mut events: broadcast::Receiver<GatewayEvent>) {
    loop {
        match events.recv().await {
            Ok(GatewayEvent::Notify {
                conversation_id,
                text,
            }) => core.reply(&conversation_id, &text).await,
            Ok(GatewayEvent::Broadcast { text }) => {
                let targets: Vec<String> = core.recent().iter().cloned().collect();
                if targets.is_empty() {
                    info!("No active conversation for notice: {text}");
                }
                for conv in targets {
                    core.reply(&conv, &text).await;
                }
            }
            Ok(GatewayEvent::HealthChanged(state)) => debug!("Worker health is now {state}"),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Dropped {n} gateway notices"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
