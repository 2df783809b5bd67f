//! The process-wide [`WorkerHealth`] value.
//!
//! [`HealthState`] is the single writer and belongs to the supervisor;
//! everything else holds a [`HealthHandle`]. Every spawn gets a generation
//! number and transitions carrying a stale generation are ignored, so a late
//! check from a dead child cannot flip a newer spawn to `Up`.

use tokio::sync::watch;
use tracing::{debug, warn};

use duet_backend::tee::{self, SharedBuffer};
use duet_types::health::WorkerHealth;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub state: WorkerHealth,
    pub generation: u64,
}

pub struct HealthState {
    tx: watch::Sender<HealthSnapshot>,
    last_error: SharedBuffer,
}

#[derive(Clone)]
pub struct HealthHandle {
    rx: watch::Receiver<HealthSnapshot>,
    last_error: SharedBuffer,
}

impl HealthState {
    /// Starts `Down`, generation 0. `capture_chars` bounds the error excerpt.
    pub fn new(capture_chars: usize) -> (Self, HealthHandle) {
        let (tx, rx) = watch::channel(HealthSnapshot {
            state: WorkerHealth::Down,
            generation: 0,
        });
        let last_error = tee::shared_buffer(capture_chars);
        (
            Self {
                tx,
                last_error: last_error.clone(),
            },
            HealthHandle { rx, last_error },
        )
    }

    pub fn handle(&self) -> HealthHandle {
        HealthHandle {
            rx: self.tx.subscribe(),
            last_error: self.last_error.clone(),
        }
    }

    pub fn current(&self) -> WorkerHealth {
        self.tx.borrow().state
    }

    /// The combined stdout+stderr ring of the current spawn.
    pub fn error_buffer(&self) -> SharedBuffer {
        self.last_error.clone()
    }

    /// `Down -> Starting` for a new spawn. Returns the spawn's generation.
    pub fn begin_spawn(&self) -> u64 {
        let mut generation = 0;
        self.tx.send_modify(|s| {
            if s.state != WorkerHealth::Down {
                warn!("New spawn while worker is {}; forcing down first", s.state);
            }
            s.generation += 1;
            s.state = WorkerHealth::Starting;
            generation = s.generation;
        });
        if let Ok(mut buf) = self.last_error.lock() {
            buf.clear();
        }
        debug!("Worker health: starting (spawn #{generation})");
        generation
    }

    pub fn mark_up(&self, generation: u64) -> bool {
        self.transition(generation, WorkerHealth::Up)
    }

    pub fn mark_down(&self, generation: u64) -> bool {
        self.transition(generation, WorkerHealth::Down)
    }

    fn transition(&self, generation: u64, next: WorkerHealth) -> bool {
        self.tx.send_if_modified(|s| {
            if s.generation != generation || !s.state.can_transition_to(next) {
                return false;
            }
            debug!("Worker health: {} -> {next} (spawn #{generation})", s.state);
            s.state = next;
            true
        })
    }
}

impl HealthHandle {
    pub fn current(&self) -> WorkerHealth {
        self.rx.borrow().state
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.rx.borrow().clone()
    }

    /// Last captured output of the current (or most recent) spawn.
    pub fn last_error(&self) -> String {
        tee::snapshot(&self.last_error)
    }

    /// A receiver that sees every future change.
    pub fn watch(&self) -> watch::Receiver<HealthSnapshot> {
        self.rx.clone()
    }
}
