//! Single-flight invocation queue.
//!
//! At most one backend CLI runs at a time. Tickets live in two FIFO buckets;
//! the drain loop always takes the oldest `User` ticket before any
//! `Background` one.
//!
//! A ticket whose submitter stopped waiting is skipped. If a `User` ticket
//! loses its submitter while running, the CLI is stopped too; `Background`
//! runs always finish.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use duet_backend::classify::render_output;
use duet_backend::{Backend, CliRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// A human is waiting on the answer.
    User,
    /// Scheduled or deferred work.
    Background,
}

/// What to run: a prompt against one backend, optionally with a model.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub backend: Backend,
    pub model: Option<String>,
    pub prompt: String,
}

struct Ticket {
    invocation: Invocation,
    conversation_id: String,
    priority: Priority,
    resolve: oneshot::Sender<String>,
}

#[derive(Debug, Clone)]
pub struct InFlight {
    pub conversation_id: String,
    pub backend: String,
    pub started: Instant,
}

/// Point-in-time view for `/status`.
#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub user_queued: usize,
    pub background_queued: usize,
    pub in_flight: Option<InFlight>,
}

#[derive(Default)]
struct State {
    user: VecDeque<Ticket>,
    background: VecDeque<Ticket>,
    in_flight: Option<InFlight>,
    draining: bool,
}

impl State {
    fn next(&mut self) -> Option<Ticket> {
        loop {
            let ticket = self.user.pop_front().or_else(|| self.background.pop_front())?;
            if !ticket.resolve.is_closed() {
                return Some(ticket);
            }
            debug!("Dropping ticket for {}: nobody is waiting", ticket.conversation_id);
        }
    }
}

struct Inner {
    state: Mutex<State>,
    runner: Arc<dyn CliRunner>,
    timeout: Duration,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cheap to clone; every clone shares the same line.
#[derive(Clone)]
pub struct InvocationQueue {
    inner: Arc<Inner>,
}

impl InvocationQueue {
    pub fn new(runner: Arc<dyn CliRunner>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                runner,
                timeout,
            }),
        }
    }

    /// Enqueue an invocation. Never blocks; the returned future resolves with
    /// the rendered CLI output once the ticket has been serviced, or with an
    /// empty string if it was flushed.
    pub fn submit(
        &self,
        invocation: Invocation,
        conversation_id: &str,
        priority: Priority,
    ) -> impl Future<Output = String> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let ticket = Ticket {
            invocation,
            conversation_id: conversation_id.to_string(),
            priority,
            resolve: tx,
        };
        let start_drain = {
            let mut state = self.inner.state();
            match priority {
                Priority::User => state.user.push_back(ticket),
                Priority::Background => state.background.push_back(ticket),
            }
            debug!(
                "Queued {:?} ticket for {} (user: {}, background: {})",
                priority,
                conversation_id,
                state.user.len(),
                state.background.len()
            );
            !std::mem::replace(&mut state.draining, true)
        };
        if start_drain {
            tokio::spawn(drain(self.inner.clone()));
        }
        async move { rx.await.unwrap_or_default() }
    }

    /// Drop every queued `Background` ticket for `conversation_id`, resolving
    /// each with an empty string. In-flight and `User` tickets are untouched.
    pub fn flush(&self, conversation_id: &str) -> usize {
        let flushed: Vec<Ticket> = {
            let mut state = self.inner.state();
            let (drop, keep): (VecDeque<Ticket>, VecDeque<Ticket>) = state
                .background
                .drain(..)
                .partition(|t| t.conversation_id == conversation_id);
            state.background = keep;
            drop.into_iter().collect()
        };
        let count = flushed.len();
        for ticket in flushed {
            let _ = ticket.resolve.send(String::new());
        }
        if count > 0 {
            info!("Flushed {count} background ticket(s) for {conversation_id}");
        }
        count
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.inner.state();
        QueueStatus {
            user_queued: state.user.len(),
            background_queued: state.background.len(),
            in_flight: state.in_flight.clone(),
        }
    }
}

async fn drain(inner: Arc<Inner>) {
    loop {
        let ticket = {
            let mut state = inner.state();
            match state.next() {
                Some(ticket) => {
                    state.in_flight = Some(InFlight {
                        conversation_id: ticket.conversation_id.clone(),
                        backend: ticket.invocation.backend.name().to_string(),
                        started: Instant::now(),
                    });
                    ticket
                }
                None => {
                    state.in_flight = None;
                    state.draining = false;
                    return;
                }
            }
        };

        let Ticket {
            invocation,
            conversation_id,
            priority,
            mut resolve,
        } = ticket;
        let name = invocation.backend.name().to_string();
        let runner = inner.runner.clone();
        let timeout = inner.timeout;
        // Run on its own task so a panicking runner cannot wedge the line.
        let mut run = tokio::spawn(async move {
            let Invocation {
                backend,
                model,
                prompt,
            } = invocation;
            match runner.run(&backend, model.as_deref(), &prompt, timeout).await {
                Ok(output) => render_output(&backend, &output),
                Err(e) => {
                    warn!("Backend {} could not run: {e:#}", backend.name());
                    format!("❌ Could not start {}: {e}", backend.name())
                }
            }
        });
        let joined = match priority {
            Priority::User => tokio::select! {
                joined = &mut run => joined,
                _ = resolve.closed() => {
                    run.abort();
                    info!("Request for {conversation_id} was abandoned; stopped {name}");
                    inner.state().in_flight = None;
                    continue;
                }
            },
            Priority::Background => run.await,
        };
        let text = match joined {
            Ok(text) => text,
            Err(e) => {
                warn!("Invocation task for {name} failed: {e}");
                format!("❌ {name} invocation crashed.")
            }
        };
        debug!("Ticket for {conversation_id} resolved ({} chars)", text.len());
        let _ = resolve.send(text);
        inner.state().in_flight = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use async_trait::async_trait;
    use tokio::sync::{mpsc, Semaphore};

    use duet_backend::CliOutput;
    use duet_types::config::default_backends;

    /// Records the order prompts start in, and how many run at once. Each run
    /// waits for one permit from `gate`.
    struct GatedRunner {
        gate: Arc<Semaphore>,
        started: mpsc::UnboundedSender<String>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    #[async_trait]
    impl CliRunner for GatedRunner {
        async fn run(
            &self,
            _backend: &Backend,
            _model: Option<&str>,
            prompt: &str,
            _timeout: Duration,
        ) -> Result<CliOutput> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            let _ = self.started.send(prompt.to_string());
            self.gate.acquire().await?.forget();
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(CliOutput {
                stdout: format!("done: {prompt}"),
                exit_code: Some(0),
                ..CliOutput::default()
            })
        }
    }

    fn setup() -> (InvocationQueue, Arc<GatedRunner>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let runner = Arc::new(GatedRunner {
            gate: Arc::new(Semaphore::new(0)),
            started: tx,
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        });
        let queue = InvocationQueue::new(runner.clone(), Duration::from_secs(5));
        (queue, runner, rx)
    }

    fn invocation(prompt: &str) -> Invocation {
        Invocation {
            backend: Backend::new(default_backends().remove(0)).unwrap(),
            model: None,
            prompt: prompt.to_string(),
        }
    }

    #[tokio::test]
    async fn runs_one_at_a_time_and_resolves_all() {
        let (queue, runner, mut started) = setup();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let prio = if i % 2 == 0 { Priority::User } else { Priority::Background };
                tokio::spawn(queue.submit(invocation(&format!("p{i}")), "c", prio))
            })
            .collect();
        runner.gate.add_permits(8);
        for _ in 0..8 {
            started.recv().await.unwrap();
        }
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }
        assert_eq!(runner.max_running.load(Ordering::SeqCst), 1);
        for i in 0..8 {
            assert!(results.contains(&format!("done: p{i}")));
        }
        assert!(queue.status().in_flight.is_none());
    }

    #[tokio::test]
    async fn user_tickets_jump_queued_background() {
        let (queue, runner, mut started) = setup();
        let first = tokio::spawn(queue.submit(invocation("bg1"), "a", Priority::Background));
        assert_eq!(started.recv().await.unwrap(), "bg1");

        let bg2 = tokio::spawn(queue.submit(invocation("bg2"), "a", Priority::Background));
        let bg3 = tokio::spawn(queue.submit(invocation("bg3"), "b", Priority::Background));
        let user = tokio::spawn(queue.submit(invocation("user"), "b", Priority::User));

        runner.gate.add_permits(4);
        let order = [
            started.recv().await.unwrap(),
            started.recv().await.unwrap(),
            started.recv().await.unwrap(),
        ];
        assert_eq!(order, ["user", "bg2", "bg3"]);
        for h in [first, bg2, bg3, user] {
            assert!(h.await.unwrap().starts_with("done: "));
        }
    }

    #[tokio::test]
    async fn flush_drops_only_queued_background_for_that_conversation() {
        let (queue, runner, mut started) = setup();
        let in_flight = tokio::spawn(queue.submit(invocation("running"), "42", Priority::Background));
        assert_eq!(started.recv().await.unwrap(), "running");

        let stale = tokio::spawn(queue.submit(invocation("reminder"), "42", Priority::Background));
        let user = tokio::spawn(queue.submit(invocation("question"), "42", Priority::User));
        let other = tokio::spawn(queue.submit(invocation("other"), "7", Priority::Background));
        tokio::task::yield_now().await;

        assert_eq!(queue.flush("42"), 1);
        assert_eq!(stale.await.unwrap(), "");
        let status = queue.status();
        assert_eq!(status.user_queued, 1);
        assert_eq!(status.background_queued, 1);
        assert_eq!(status.in_flight.map(|f| f.conversation_id).as_deref(), Some("42"));

        runner.gate.add_permits(3);
        assert_eq!(in_flight.await.unwrap(), "done: running");
        assert_eq!(user.await.unwrap(), "done: question");
        assert_eq!(other.await.unwrap(), "done: other");
        assert_eq!(queue.flush("42"), 0);
    }

    struct FailingRunner;

    #[async_trait]
    impl CliRunner for FailingRunner {
        async fn run(
            &self,
            _backend: &Backend,
            _model: Option<&str>,
            _prompt: &str,
            _timeout: Duration,
        ) -> Result<CliOutput> {
            anyhow::bail!("No such file or directory")
        }
    }

    #[tokio::test]
    async fn spawn_errors_resolve_with_message() {
        let queue = InvocationQueue::new(Arc::new(FailingRunner), Duration::from_secs(1));
        let text = queue.submit(invocation("x"), "c", Priority::User).await;
        assert!(text.starts_with("❌ Could not start claude"));
        // The line is still usable afterwards.
        let text = queue.submit(invocation("y"), "c", Priority::User).await;
        assert!(text.starts_with("❌"));
    }

    #[tokio::test]
    async fn abandoned_tickets_are_skipped_and_stopped() {
        let (queue, runner, mut started) = setup();
        let running = tokio::spawn(queue.submit(invocation("first"), "a", Priority::User));
        assert_eq!(started.recv().await.unwrap(), "first");
        let queued = tokio::spawn(queue.submit(invocation("queued"), "b", Priority::User));

        queued.abort();
        running.abort();
        assert!(queued.await.unwrap_err().is_cancelled());
        assert!(running.await.unwrap_err().is_cancelled());

        // The line frees up without "first" ever finishing, and "queued" never runs.
        let next = tokio::spawn(queue.submit(invocation("next"), "c", Priority::User));
        assert_eq!(started.recv().await.unwrap(), "next");
        runner.gate.add_permits(1);
        assert_eq!(next.await.unwrap(), "done: next");
        assert!(queue.status().in_flight.is_none());
    }
}
