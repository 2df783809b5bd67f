//! Worker lifecycle.
//!
//! The supervisor owns the worker child process and the only writable
//! [`HealthState`]. Each spawn is tagged with a generation; the loop below
//! reacts to whichever happens first:
//!
//! - the child exits: crash accounting, then restart or Auto-Repair
//! - a fatal pattern shows up on stderr: Auto-Repair once it has settled
//! - live reload sees source edits: restart, no crash counted
//! - `/restart` or shutdown from a [`SupervisorHandle`]

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use duet_backend::classify::ErrorPatterns;
use duet_backend::tee::{self, Echo, SharedBuffer, Tee};
use duet_types::config::SupervisorConfig;
use duet_types::health::WorkerHealth;
use duet_types::text::tail_chars;

use crate::auth::OutputObserver;
use crate::events::{EventBus, GatewayEvent};
use crate::health::{HealthHandle, HealthState};
use crate::ipc::{UnixWorkerClient, WorkerClient};
use crate::pidfile::{self, PidFile};
use crate::reload::ReloadWatcher;
use crate::repair::{RepairOutcome, Repairer};

const READY_TIMEOUT: Duration = Duration::from_secs(5);
const READER_GRACE: Duration = Duration::from_millis(500);

/// Builds the worker command for each spawn.
pub type CommandFactory = Arc<dyn Fn() -> Result<Command> + Send + Sync>;

/// Readiness check for a freshly spawned worker.
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    async fn is_ready(&self) -> bool;
}

#[async_trait]
impl ReadinessCheck for UnixWorkerClient {
    async fn is_ready(&self) -> bool {
        matches!(self.health().await, Ok(true))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Manual restart. Clears the crash counter and leaves the waiting state.
    Restart,
    Shutdown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub spawns: u64,
    /// Crashes in the current rapid-crash run.
    pub crash_count: u32,
    pub repairs: u32,
    /// Down after a failed or refused repair, until `/restart` or an edit.
    pub awaiting_manual: bool,
    pub last_exit: Option<String>,
}

#[derive(Clone)]
pub struct SupervisorHandle {
    control: mpsc::Sender<Control>,
    stats: watch::Receiver<SupervisorStats>,
    health: HealthHandle,
}

impl SupervisorHandle {
    pub async fn restart(&self) -> bool {
        self.control.send(Control::Restart).await.is_ok()
    }

    pub async fn shutdown(&self) -> bool {
        self.control.send(Control::Shutdown).await.is_ok()
    }

    pub fn health(&self) -> &HealthHandle {
        &self.health
    }

    pub fn stats(&self) -> SupervisorStats {
        self.stats.borrow().clone()
    }

    pub fn watch_stats(&self) -> watch::Receiver<SupervisorStats> {
        self.stats.clone()
    }
}

/// What to do once the current child is gone.
#[derive(Debug)]
enum Next {
    Restart(Duration),
    AwaitManual,
    Shutdown,
}

enum Event {
    Exited(Option<ExitStatus>),
    Fatal,
    Reload(Vec<PathBuf>),
    Restart,
    Shutdown,
}

enum Escalation {
    Fixed,
    Failed,
    Refused,
    Disabled,
}

struct Running {
    child: Child,
    pid: Option<u32>,
    generation: u64,
    readers: Vec<JoinHandle<()>>,
    readiness_poll: JoinHandle<()>,
    stderr_tail: SharedBuffer,
    fatal_rx: mpsc::UnboundedReceiver<String>,
    fatal_at: Option<Instant>,
    error_detected: bool,
}

pub struct Supervisor {
    config: SupervisorConfig,
    command: CommandFactory,
    health: Arc<HealthState>,
    readiness: Arc<dyn ReadinessCheck>,
    repairer: Arc<dyn Repairer>,
    bus: EventBus,
    patterns: ErrorPatterns,
    observer: Option<Arc<dyn OutputObserver>>,
    pid_file: Option<PidFile>,
    marker: String,
    reload: Option<ReloadWatcher>,
    control: mpsc::Receiver<Control>,
    stats: watch::Sender<SupervisorStats>,
    last_crash: Option<Instant>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        command: CommandFactory,
        readiness: Arc<dyn ReadinessCheck>,
        repairer: Arc<dyn Repairer>,
        bus: EventBus,
    ) -> Result<(Self, SupervisorHandle)> {
        let patterns = ErrorPatterns::compile(&config.error_patterns)?;
        let (health, health_handle) = HealthState::new(config.error_capture_chars);
        let (control_tx, control_rx) = mpsc::channel(8);
        let (stats_tx, stats_rx) = watch::channel(SupervisorStats::default());
        let supervisor = Self {
            config,
            command,
            health: Arc::new(health),
            readiness,
            repairer,
            bus,
            patterns,
            observer: None,
            pid_file: None,
            marker: String::new(),
            reload: None,
            control: control_rx,
            stats: stats_tx,
            last_crash: None,
        };
        let handle = SupervisorHandle {
            control: control_tx,
            stats: stats_rx,
            health: health_handle,
        };
        Ok((supervisor, handle))
    }

    /// Feed every chunk of worker output to `observer` (Auth Recovery).
    pub fn with_observer(mut self, observer: Arc<dyn OutputObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Record the worker PID in `pid_file`, and before each spawn kill any
    /// process that has `marker` among its arguments.
    pub fn with_pid_file(mut self, pid_file: PidFile, marker: impl Into<String>) -> Self {
        self.pid_file = Some(pid_file);
        self.marker = marker.into();
        self
    }

    pub fn with_reload(mut self, watcher: ReloadWatcher) -> Self {
        self.reload = Some(watcher);
        self
    }

    pub async fn run(mut self) {
        info!("Supervisor started");
        loop {
            let next = match self.spawn().await {
                Ok(mut running) => self.supervise(&mut running).await,
                Err(e) => {
                    error!("Worker failed to start: {e:#}");
                    let text = format!("{e:#}");
                    {
                        let buffer = self.health.error_buffer();
                        let mut buf = buffer.lock().unwrap_or_else(|e| e.into_inner());
                        buf.clear();
                        buf.push(&text);
                    }
                    self.stats
                        .send_modify(|s| s.last_exit = Some("spawn failed".to_string()));
                    self.after_crash(&text, false).await
                }
            };
            let resume = match next {
                Next::Restart(delay) => self.pause(delay).await,
                Next::AwaitManual => self.await_manual().await,
                Next::Shutdown => false,
            };
            if !resume {
                break;
            }
        }
        if let Some(pid_file) = &self.pid_file {
            pid_file.remove();
        }
        info!("Supervisor stopped");
    }

    async fn spawn(&mut self) -> Result<Running> {
        if let Some(pid_file) = &self.pid_file {
            let killed = pid_file
                .kill_predecessors(&self.marker, self.config.kill_grace())
                .await;
            if killed > 0 {
                info!("Cleared {killed} stale worker process(es)");
            }
        }

        let mut cmd = (self.command)()?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().context("Failed to spawn worker")?;
        let pid = child.id();
        if let (Some(pid_file), Some(pid)) = (&self.pid_file, pid) {
            if let Err(e) = pid_file.write(pid) {
                warn!("Could not write worker PID file: {e:#}");
            }
        }

        let generation = self.health.begin_spawn();
        self.bus.send(GatewayEvent::HealthChanged(WorkerHealth::Starting));
        self.stats.send_modify(|s| s.spawns += 1);
        info!(
            "Worker spawned (pid {}, spawn #{generation})",
            pid.map_or_else(|| "?".to_string(), |p| p.to_string())
        );

        let combined = self.health.error_buffer();
        let stderr_tail = tee::shared_buffer(self.config.error_capture_chars);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let mut readers = Vec::new();

        if let Some(stdout) = child.stdout.take() {
            let observer = self.observer.clone();
            readers.push(
                Tee::new("worker")
                    .echo(Echo::Info)
                    .buffer(combined.clone())
                    .on_chunk(move |chunk| {
                        if let Some(observer) = &observer {
                            observer.observe(chunk, None, None);
                        }
                    })
                    .spawn(stdout),
            );
        }
        if let Some(stderr) = child.stderr.take() {
            let observer = self.observer.clone();
            let patterns = self.patterns.clone();
            let reported = AtomicBool::new(false);
            readers.push(
                Tee::new("worker:stderr")
                    .echo(Echo::Info)
                    .buffer(combined)
                    .buffer(stderr_tail.clone())
                    .on_chunk(move |chunk| {
                        if let Some(observer) = &observer {
                            observer.observe(chunk, None, None);
                        }
                        if let Some(pattern) = patterns.fatal_match(chunk) {
                            if !reported.swap(true, Ordering::SeqCst) {
                                let _ = fatal_tx.send(pattern.to_string());
                            }
                        }
                    })
                    .spawn(stderr),
            );
        }

        Ok(Running {
            child,
            pid,
            generation,
            readers,
            readiness_poll: self.spawn_readiness_poll(generation),
            stderr_tail,
            fatal_rx,
            fatal_at: None,
            error_detected: false,
        })
    }

    /// Poll readiness until the spawn is up or superseded.
    fn spawn_readiness_poll(&self, generation: u64) -> JoinHandle<()> {
        let health = self.health.clone();
        let watch = health.handle();
        let check = self.readiness.clone();
        let bus = self.bus.clone();
        let interval = self.config.health_poll();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let snapshot = watch.snapshot();
                if snapshot.generation != generation || snapshot.state != WorkerHealth::Starting {
                    return;
                }
                let ready = tokio::time::timeout(READY_TIMEOUT, check.is_ready())
                    .await
                    .unwrap_or(false);
                if ready && health.mark_up(generation) {
                    info!("Worker is up (spawn #{generation})");
                    bus.send(GatewayEvent::HealthChanged(WorkerHealth::Up));
                    return;
                }
            }
        })
    }

    async fn supervise(&mut self, run: &mut Running) -> Next {
        loop {
            match self.wait_event(run).await {
                Event::Exited(status) => {
                    let exit = self.reap(run, status).await;
                    warn!("Worker exited ({exit})");
                    let stderr = tee::snapshot(&run.stderr_tail);
                    if !stderr.trim().is_empty() {
                        warn!("Worker stderr before exit:\n{}", tail_chars(stderr.trim_end(), 500));
                    }
                    let text = tee::snapshot(&self.health.error_buffer());
                    return self.after_crash(&text, run.error_detected).await;
                }
                Event::Fatal => {
                    let text = tee::snapshot(&self.health.error_buffer());
                    if let Some(next) = self.repair_while_running(run, &text).await {
                        return next;
                    }
                }
                Event::Reload(paths) => {
                    info!("{} file(s) changed; restarting worker", paths.len());
                    debug!("Changed: {paths:?}");
                    self.stop(run).await;
                    return Next::Restart(Duration::ZERO);
                }
                Event::Restart => {
                    info!("Manual worker restart");
                    self.stop(run).await;
                    self.reset_crashes();
                    return Next::Restart(Duration::ZERO);
                }
                Event::Shutdown => {
                    self.stop(run).await;
                    return Next::Shutdown;
                }
            }
        }
    }

    async fn wait_event(&mut self, run: &mut Running) -> Event {
        loop {
            let deadline = run.fatal_at;
            tokio::select! {
                status = run.child.wait() => return Event::Exited(status.ok()),
                Some(pattern) = run.fatal_rx.recv(), if deadline.is_none() => {
                    warn!("Worker stderr matched fatal pattern {pattern:?}");
                    run.error_detected = true;
                    run.fatal_at = Some(Instant::now() + self.config.error_debounce());
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    run.fatal_at = None;
                    return Event::Fatal;
                }
                paths = next_reload(&mut self.reload) => match paths {
                    Some(paths) => return Event::Reload(paths),
                    None => {
                        warn!("Live reload watcher stopped");
                        self.reload = None;
                    }
                },
                control = self.control.recv() => return match control {
                    Some(Control::Restart) => Event::Restart,
                    Some(Control::Shutdown) | None => Event::Shutdown,
                },
            }
        }
    }

    /// SIGTERM, grace period, then kill; then reap.
    async fn stop(&mut self, run: &mut Running) {
        if let Some(pid) = run.pid {
            pidfile::terminate(pid, self.config.kill_grace()).await;
        }
        let status = match tokio::time::timeout(self.config.kill_grace(), run.child.wait()).await {
            Ok(status) => status.ok(),
            Err(_) => {
                let _ = run.child.kill().await;
                run.child.wait().await.ok()
            }
        };
        let exit = self.reap(run, status).await;
        info!("Worker stopped ({exit})");
    }

    /// Bookkeeping after the child is gone. Returns a description of the exit.
    async fn reap(&mut self, run: &mut Running, status: Option<ExitStatus>) -> String {
        run.readiness_poll.abort();
        for reader in run.readers.drain(..) {
            let _ = tokio::time::timeout(READER_GRACE, reader).await;
        }
        if self.health.mark_down(run.generation) {
            self.bus.send(GatewayEvent::HealthChanged(WorkerHealth::Down));
        }
        if let Some(pid_file) = &self.pid_file {
            pid_file.remove();
        }
        let exit = describe_exit(status);
        self.stats.send_modify(|s| s.last_exit = Some(exit.clone()));
        exit
    }

    async fn after_crash(&mut self, error_text: &str, error_detected: bool) -> Next {
        let now = Instant::now();
        let rapid = self
            .last_crash
            .is_some_and(|t| now.duration_since(t) < self.config.crash_window());
        self.last_crash = Some(now);
        let mut count = 0;
        self.stats.send_modify(|s| {
            s.crash_count = if rapid { s.crash_count + 1 } else { 1 };
            count = s.crash_count;
        });

        if count < self.config.crash_threshold && !error_detected {
            info!(
                "Restarting worker in {}ms (crash {count})",
                self.config.restart_delay().as_millis()
            );
            return Next::Restart(self.config.restart_delay());
        }
        if error_detected {
            warn!("Worker died after a fatal error; escalating to auto-repair");
        } else {
            warn!(
                "Worker crashed {count} times within {}s; escalating to auto-repair",
                self.config.crash_window().as_secs()
            );
        }
        match self.escalate(error_text).await {
            Escalation::Fixed => Next::Restart(Duration::ZERO),
            Escalation::Failed | Escalation::Refused => Next::AwaitManual,
            Escalation::Disabled => Next::Restart(self.config.restart_delay()),
        }
    }

    /// Auto-Repair on a live worker. The child's exit and control messages
    /// are still handled while the repair runs. `None` leaves the worker
    /// running as it is.
    async fn repair_while_running(&mut self, run: &mut Running, error_text: &str) -> Option<Next> {
        if !self.begin_repair() {
            return None;
        }
        let repairer = self.repairer.clone();
        let repair = repairer.repair(error_text);
        tokio::pin!(repair);
        let mut exited = false;
        let outcome = loop {
            tokio::select! {
                outcome = &mut repair => break outcome,
                status = run.child.wait(), if !exited => {
                    exited = true;
                    let exit = self.reap(run, status.ok()).await;
                    warn!("Worker exited during auto-repair ({exit})");
                }
                control = self.control.recv() => {
                    info!("Auto-repair abandoned");
                    if !exited {
                        self.stop(run).await;
                    }
                    return Some(match control {
                        Some(Control::Restart) => {
                            self.reset_crashes();
                            Next::Restart(Duration::ZERO)
                        }
                        Some(Control::Shutdown) | None => Next::Shutdown,
                    });
                }
            }
        };
        let next = match self.finish_repair(outcome) {
            Escalation::Fixed => Next::Restart(Duration::ZERO),
            Escalation::Failed => Next::AwaitManual,
            Escalation::Refused if exited => Next::AwaitManual,
            Escalation::Disabled if exited => Next::Restart(self.config.restart_delay()),
            Escalation::Refused | Escalation::Disabled => return None,
        };
        if !exited {
            self.stop(run).await;
        }
        Some(next)
    }

    async fn escalate(&mut self, error_text: &str) -> Escalation {
        if !self.begin_repair() {
            return Escalation::Disabled;
        }
        let outcome = self.repairer.repair(error_text).await;
        self.finish_repair(outcome)
    }

    fn begin_repair(&self) -> bool {
        if !self.repairer.is_enabled() {
            warn!("Auto-repair is disabled");
            return false;
        }
        self.bus
            .broadcast("🛠️ Core error detected, attempting auto-fix…");
        true
    }

    fn finish_repair(&mut self, outcome: RepairOutcome) -> Escalation {
        if let Some(reload) = &mut self.reload {
            let dropped = reload.discard_pending();
            if dropped > 0 {
                debug!("Ignoring {dropped} edit(s) made during repair");
            }
        }
        match outcome {
            RepairOutcome::Fixed { backend, summary } => {
                info!("Auto-repair by {backend} succeeded");
                self.stats.send_modify(|s| s.repairs += 1);
                self.reset_crashes();
                self.bus.broadcast(format!(
                    "✅ Auto-fix applied by {backend}; restarting the worker.\n{summary}"
                ));
                Escalation::Fixed
            }
            RepairOutcome::Failed { reason } => {
                error!("Auto-repair failed: {reason}");
                self.stats.send_modify(|s| s.repairs += 1);
                self.bus.broadcast(format!(
                    "❌ Auto-fix failed: {reason}\nThe worker stays down and messages are \
                     answered in fallback mode. Send /restart once it is fixed."
                ));
                Escalation::Failed
            }
            RepairOutcome::Refused { retry_in } => {
                self.bus.broadcast(format!(
                    "⚠️ Auto-fix attempts are used up (next allowed in {}s). Send /restart \
                     once the worker is fixed.",
                    retry_in.as_secs()
                ));
                Escalation::Refused
            }
            RepairOutcome::Disabled => Escalation::Disabled,
        }
    }

    fn reset_crashes(&mut self) {
        self.last_crash = None;
        self.stats.send_modify(|s| s.crash_count = 0);
    }

    /// Sleep before a restart. A manual restart cuts the wait short.
    async fn pause(&mut self, delay: Duration) -> bool {
        if delay.is_zero() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            control = self.control.recv() => {
                let resume = control == Some(Control::Restart);
                if resume {
                    self.reset_crashes();
                }
                resume
            }
        }
    }

    /// Stay down until `/restart`, a source edit, or shutdown.
    async fn await_manual(&mut self) -> bool {
        self.stats.send_modify(|s| s.awaiting_manual = true);
        info!("Worker stays down until /restart or a source change");
        let resume = loop {
            tokio::select! {
                control = self.control.recv() => {
                    if control == Some(Control::Restart) {
                        self.reset_crashes();
                        break true;
                    }
                    break false;
                }
                paths = next_reload(&mut self.reload) => match paths {
                    Some(paths) => {
                        info!("{} file(s) changed; trying the worker again", paths.len());
                        break true;
                    }
                    None => self.reload = None,
                },
            }
        };
        self.stats.send_modify(|s| s.awaiting_manual = false);
        resume
    }
}

async fn next_reload(watcher: &mut Option<ReloadWatcher>) -> Option<Vec<PathBuf>> {
    match watcher {
        Some(watcher) => watcher.next().await,
        None => std::future::pending().await,
    }
}

fn describe_exit(status: Option<ExitStatus>) -> String {
    let Some(status) = status else {
        return "unknown status".to_string();
    };
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {signal}");
        }
    }
    "unknown status".to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use duet_types::config::RepairConfig;

    use crate::repair::tests::{auto_repair, FixedRunner};

    const WAIT: Duration = Duration::from_secs(15);

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            restart_delay_ms: 50,
            crash_window_secs: 10,
            crash_threshold: 2,
            health_poll_ms: 20,
            error_debounce_ms: 100,
            kill_grace_ms: 1_000,
            ..SupervisorConfig::default()
        }
    }

    /// `sh -c <body> sh <counter>`; bodies append a line to the counter on
    /// every spawn.
    fn script(body: &str, counter: &Path) -> CommandFactory {
        let body = body.to_string();
        let counter = counter.to_path_buf();
        Arc::new(move || {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&body).arg("sh").arg(&counter);
            Ok::<_, anyhow::Error>(cmd)
        })
    }

    fn spawn_count(counter: &Path) -> usize {
        std::fs::read_to_string(counter)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    struct Always(bool);

    #[async_trait]
    impl ReadinessCheck for Always {
        async fn is_ready(&self) -> bool {
            self.0
        }
    }

    /// Ready only from the `n`th spawn on.
    struct ReadyFrom(PathBuf, usize);

    #[async_trait]
    impl ReadinessCheck for ReadyFrom {
        async fn is_ready(&self) -> bool {
            spawn_count(&self.0) >= self.1
        }
    }

    #[tokio::test]
    async fn rapid_crashes_escalate_to_repair() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("spawns");
        let runner = FixedRunner::new("", 1);
        let repair = Arc::new(auto_repair(runner.clone(), RepairConfig::default()));
        let bus = EventBus::new();
        let mut notices = bus.subscribe();
        let (supervisor, handle) = Supervisor::new(
            config(),
            script(r#"echo x >> "$1"; echo "boom" >&2; exit 1"#, &counter),
            Arc::new(Always(false)),
            repair,
            bus,
        )
        .unwrap();
        let task = tokio::spawn(supervisor.run());

        let mut stats = handle.watch_stats();
        tokio::time::timeout(WAIT, stats.wait_for(|s| s.awaiting_manual))
            .await
            .unwrap()
            .unwrap();
        let s = handle.stats();
        assert_eq!(s.spawns, 2);
        assert_eq!(s.crash_count, 2);
        assert_eq!(s.last_exit.as_deref(), Some("exit code 1"));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert!(runner.prompts.lock().unwrap()[0].contains("boom"));
        assert_eq!(handle.health().current(), WorkerHealth::Down);

        let mut texts = Vec::new();
        while let Ok(event) = notices.try_recv() {
            if let GatewayEvent::Broadcast { text } = event {
                texts.push(text);
            }
        }
        assert!(texts[0].contains("attempting auto-fix"));
        assert!(texts[1].starts_with("❌ Auto-fix failed"));

        // No blind restarts while waiting.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(spawn_count(&counter), 2);

        assert!(handle.restart().await);
        tokio::time::timeout(WAIT, stats.wait_for(|s| s.spawns >= 3))
            .await
            .unwrap()
            .unwrap();
        handle.shutdown().await;
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn successful_repair_restarts_with_counter_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("spawns");
        let runner = FixedRunner::new("fixed the typo", 0);
        let repair = Arc::new(auto_repair(runner.clone(), RepairConfig::default()));
        let body = r#"echo x >> "$1"
n=$(wc -l < "$1" | tr -d ' ')
if [ "$n" -ge 4 ]; then exec sleep 30; fi
echo "crash $n" >&2
exit 1"#;
        let (supervisor, handle) = Supervisor::new(
            config(),
            script(body, &counter),
            Arc::new(ReadyFrom(counter.clone(), 4)),
            repair,
            EventBus::new(),
        )
        .unwrap();
        let task = tokio::spawn(supervisor.run());

        let mut health = handle.health().watch();
        tokio::time::timeout(WAIT, health.wait_for(|h| h.state == WorkerHealth::Up))
            .await
            .unwrap()
            .unwrap();

        // Crashes 1-2 trigger the repair; crash 3 starts a fresh count.
        let s = handle.stats();
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(s.repairs, 1);
        assert_eq!(s.spawns, 4);
        assert_eq!(s.crash_count, 1);

        handle.shutdown().await;
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(handle.health().current(), WorkerHealth::Down);
    }

    #[tokio::test]
    async fn fatal_pattern_triggers_repair_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("spawns");
        let runner = FixedRunner::new("added the missing bracket", 0);
        let repair = Arc::new(auto_repair(runner.clone(), RepairConfig::default()));
        let (supervisor, handle) = Supervisor::new(
            config(),
            script(FATAL_ON_FIRST_SPAWN, &counter),
            Arc::new(Always(true)),
            repair,
            EventBus::new(),
        )
        .unwrap();
        let task = tokio::spawn(supervisor.run());

        let mut health = handle.health().watch();
        tokio::time::timeout(
            WAIT,
            health.wait_for(|h| h.state == WorkerHealth::Up && h.generation == 2),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert!(runner.prompts.lock().unwrap()[0].contains("SyntaxError"));
        assert_eq!(handle.stats().crash_count, 0);

        handle.shutdown().await;
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn logged_warning_with_error_text_leaves_worker_alone() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("spawns");
        let runner = FixedRunner::new("nothing to fix", 0);
        let repair = Arc::new(auto_repair(runner.clone(), RepairConfig::default()));
        let body = r#"echo x >> "$1"
echo "2026-01-01T00:00:00.000000Z  WARN duet_worker::handler: Transcription failed: error sending request: dns error: failed to lookup address" >&2
exec sleep 30"#;
        let (supervisor, handle) = Supervisor::new(
            config(),
            script(body, &counter),
            Arc::new(Always(true)),
            repair,
            EventBus::new(),
        )
        .unwrap();
        let task = tokio::spawn(supervisor.run());

        let mut health = handle.health().watch();
        tokio::time::timeout(WAIT, health.wait_for(|h| h.state == WorkerHealth::Up))
            .await
            .unwrap()
            .unwrap();
        // Well past the debounce.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        assert_eq!(spawn_count(&counter), 1);
        assert_eq!(handle.stats().crash_count, 0);
        assert_eq!(handle.health().current(), WorkerHealth::Up);

        handle.shutdown().await;
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    }

    /// Reports a fix after `delay`.
    struct SlowRepair {
        delay: Duration,
        calls: AtomicUsize,
    }

    impl SlowRepair {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Repairer for SlowRepair {
        async fn repair(&self, _error_text: &str) -> RepairOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            RepairOutcome::Fixed {
                backend: "claude".into(),
                summary: "patched".into(),
            }
        }
    }

    const FATAL_ON_FIRST_SPAWN: &str = r#"echo x >> "$1"
if [ "$(wc -l < "$1" | tr -d ' ')" -eq 1 ]; then echo "SyntaxError: Unexpected token '}'" >&2; fi
exec sleep 30"#;

    #[tokio::test]
    async fn exit_during_repair_marks_worker_down() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("spawns");
        let repair = SlowRepair::new(Duration::from_secs(2));
        let body = r#"echo x >> "$1"
if [ "$(wc -l < "$1" | tr -d ' ')" -eq 1 ]; then
  echo "SyntaxError: Unexpected token '}'" >&2
  sleep 0.3
  exit 1
fi
exec sleep 30"#;
        let (supervisor, handle) = Supervisor::new(
            config(),
            script(body, &counter),
            Arc::new(Always(true)),
            repair.clone(),
            EventBus::new(),
        )
        .unwrap();
        let task = tokio::spawn(supervisor.run());

        let mut health = handle.health().watch();
        tokio::time::timeout(WAIT, health.wait_for(|h| h.state == WorkerHealth::Up))
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(
            Duration::from_secs(1),
            health.wait_for(|h| h.state == WorkerHealth::Down),
        )
        .await
        .expect("exit seen while the repair is still running")
        .unwrap();
        assert_eq!(repair.calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.stats().repairs, 0);

        tokio::time::timeout(
            WAIT,
            health.wait_for(|h| h.state == WorkerHealth::Up && h.generation == 2),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(handle.stats().repairs, 1);
        assert_eq!(spawn_count(&counter), 2);

        handle.shutdown().await;
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn restart_cuts_a_running_repair_short() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("spawns");
        let repair = SlowRepair::new(Duration::from_secs(30));
        let (supervisor, handle) = Supervisor::new(
            config(),
            script(FATAL_ON_FIRST_SPAWN, &counter),
            Arc::new(Always(true)),
            repair.clone(),
            EventBus::new(),
        )
        .unwrap();
        let task = tokio::spawn(supervisor.run());

        tokio::time::timeout(WAIT, async {
            while repair.calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(handle.restart().await);

        let mut health = handle.health().watch();
        tokio::time::timeout(
            WAIT,
            health.wait_for(|h| h.state == WorkerHealth::Up && h.generation == 2),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(handle.stats().repairs, 0);

        handle.shutdown().await;
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn source_edit_restarts_without_counting_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir(&src).unwrap();
        let counter = dir.path().join("spawns");
        let runner = FixedRunner::new("", 1);
        let repair = Arc::new(auto_repair(runner.clone(), RepairConfig::default()));
        let watcher = ReloadWatcher::start(&[src.clone()], Duration::from_millis(100)).unwrap();
        let (supervisor, handle) = Supervisor::new(
            config(),
            script(r#"echo x >> "$1"; exec sleep 30"#, &counter),
            Arc::new(Always(true)),
            repair,
            EventBus::new(),
        )
        .unwrap();
        let task = tokio::spawn(supervisor.with_reload(watcher).run());

        let mut health = handle.health().watch();
        tokio::time::timeout(WAIT, health.wait_for(|h| h.state == WorkerHealth::Up))
            .await
            .unwrap()
            .unwrap();
        std::fs::write(src.join("handler.js"), "module.exports = {}").unwrap();
        tokio::time::timeout(
            WAIT,
            health.wait_for(|h| h.state == WorkerHealth::Up && h.generation >= 2),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(handle.stats().crash_count, 0);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);

        handle.shutdown().await;
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn missing_binary_counts_as_a_crash() {
        let runner = FixedRunner::new("", 1);
        let repair = Arc::new(auto_repair(
            runner.clone(),
            RepairConfig {
                enabled: false,
                ..RepairConfig::default()
            },
        ));
        let command: CommandFactory =
            Arc::new(|| Ok::<_, anyhow::Error>(Command::new("/nonexistent/duet-worker-binary")));
        let (supervisor, handle) =
            Supervisor::new(config(), command, Arc::new(Always(true)), repair, EventBus::new())
                .unwrap();
        let task = tokio::spawn(supervisor.run());

        let mut stats = handle.watch_stats();
        tokio::time::timeout(WAIT, stats.wait_for(|s| s.last_exit.is_some()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.stats().spawns, 0);
        assert!(handle.health().last_error().contains("Failed to spawn worker"));
        assert_eq!(handle.health().current(), WorkerHealth::Down);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);

        handle.shutdown().await;
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[test]
    fn exit_descriptions() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(describe_exit(Some(ExitStatus::from_raw(1 << 8))), "exit code 1");
        assert_eq!(describe_exit(Some(ExitStatus::from_raw(9))), "signal 9");
        assert_eq!(describe_exit(None), "unknown status");
    }
}
