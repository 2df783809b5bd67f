use serde::{Deserialize, Serialize};

/// Process-wide view of the Worker, owned by the gateway's supervisor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    Starting,
    Up,
    #[default]
    Down,
}

impl WorkerHealth {
    /// Whether `self -> next` is a legal transition within one spawn lifetime.
    /// `Down -> Starting` is the only way back in; `Up` is only reached from
    /// `Starting`.
    pub fn can_transition_to(self, next: WorkerHealth) -> bool {
        matches!(
            (self, next),
            (Self::Down, Self::Starting)
                | (Self::Starting, Self::Up)
                | (Self::Starting, Self::Down)
                | (Self::Up, Self::Down)
        )
    }
}

impl std::fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

impl std::str::FromStr for WorkerHealth {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            _ => Err(anyhow::anyhow!("unknown worker health: {}", s)),
        }
    }
}
