//! PID file and "kill my predecessor" semantics for the worker.
//!
//! Before a new worker is spawned, any previous instance is terminated. A
//! previous instance is a process whose command line names the same worker
//! socket. The PID file alone is never enough to kill: the PID may have been
//! reused by an unrelated process since it was written.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, Signal, System, UpdateKind};
use tracing::{info, warn};

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, pid.to_string())
            .with_context(|| format!("Failed to write PID file {}", self.path.display()))
    }

    /// The stored PID, if the file exists and is valid.
    pub fn read(&self) -> Option<u32> {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn remove(&self) {
        let _ = fs::remove_file(&self.path);
    }

    /// Terminate every earlier worker instance. Returns how many were found.
    pub async fn kill_predecessors(&self, marker: &str, grace: Duration) -> usize {
        let own = std::process::id();
        let victims: Vec<u32> = scan_for(marker).into_iter().filter(|&p| p != own).collect();
        if let Some(pid) = self.read() {
            if pid != own && !victims.contains(&pid) && is_process_alive(pid) {
                warn!("PID file names {pid}, which is not a worker; leaving it alone");
            }
        }
        for &pid in &victims {
            info!("Terminating previous worker instance (pid {pid})");
            terminate(pid, grace).await;
        }
        self.remove();
        victims.len()
    }
}

/// Check whether a process with the given PID is alive.
pub fn is_process_alive(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    sys.process(Pid::from_u32(pid))
        .is_some_and(|p| p.status() != ProcessStatus::Zombie)
}

/// PIDs of processes with `marker` as one of their arguments.
pub fn scan_for(marker: &str) -> Vec<u32> {
    if marker.is_empty() {
        return Vec::new();
    }
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::OnlyIfNotSet),
    );
    sys.processes()
        .iter()
        .filter(|(_, p)| p.cmd().iter().skip(1).any(|arg| arg.to_string_lossy() == marker))
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

/// SIGTERM, then SIGKILL if the process outlives `grace`.
pub async fn terminate(pid: u32, grace: Duration) {
    let sysinfo_pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[sysinfo_pid]), true);
    let Some(process) = sys.process(sysinfo_pid) else {
        return;
    };
    if !process.kill_with(Signal::Term).unwrap_or(false) {
        process.kill();
        return;
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if !is_process_alive(pid) {
            return;
        }
    }
    warn!("Process {pid} ignored SIGTERM for {}ms, killing", grace.as_millis());
    sys.refresh_processes(ProcessesToUpdate::Some(&[sysinfo_pid]), true);
    if let Some(process) = sys.process(sysinfo_pid) {
        process.kill();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn pid_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let pid = PidFile::new(dir.path().join("run").join("worker.pid"));
        assert_eq!(pid.read(), None);
        pid.write(4242).unwrap();
        assert_eq!(pid.read(), Some(4242));
        pid.remove();
        assert_eq!(pid.read(), None);
    }

    #[tokio::test]
    async fn kills_recorded_and_scanned_predecessors() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("worker.sock").to_string_lossy().into_owned();

        // One also recorded in the PID file, one only found by its command line.
        let mut recorded = tokio::process::Command::new("sh")
            .args(["-c", "sleep 30; :", "duet-worker", &marker])
            .spawn()
            .unwrap();
        let mut orphan = tokio::process::Command::new("sh")
            .args(["-c", "sleep 30; :", "duet-worker", &marker])
            .spawn()
            .unwrap();
        let orphan_pid = orphan.id().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(scan_for(&marker).contains(&orphan_pid));

        let pid_file = PidFile::new(dir.path().join("worker.pid"));
        pid_file.write(recorded.id().unwrap()).unwrap();

        let found = pid_file.kill_predecessors(&marker, Duration::from_secs(2)).await;
        assert_eq!(found, 2);
        assert!(!recorded.wait().await.unwrap().success());
        assert!(!orphan.wait().await.unwrap().success());
        assert!(pid_file.read().is_none());
    }

    #[tokio::test]
    async fn recorded_pid_of_another_program_survives() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("worker.sock").to_string_lossy().into_owned();
        let mut unrelated = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = unrelated.id().unwrap();
        let pid_file = PidFile::new(dir.path().join("worker.pid"));
        pid_file.write(pid).unwrap();

        let found = pid_file.kill_predecessors(&marker, Duration::from_secs(2)).await;
        assert_eq!(found, 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(is_process_alive(pid));
        assert!(unrelated.try_wait().unwrap().is_none());

        unrelated.kill().await.unwrap();
    }
}
