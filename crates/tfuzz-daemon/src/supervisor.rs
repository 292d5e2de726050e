//! Multi-process supervisor: one `tfuzz worker` child per shard.

use crate::signals::SignalHandler;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How the workers ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    /// Workers that exited successfully.
    pub succeeded: usize,
    /// Workers that failed, were killed, or could not be waited on.
    pub failed: usize,
    /// Whether shutdown was forwarded.
    pub interrupted: bool,
}

/// Spawns and reaps worker processes.
#[derive(Debug, Clone)]
pub struct Supervisor {
    exe: PathBuf,
    config_path: PathBuf,
    log_level: String,
    workers: usize,
    grace: Duration,
}

impl Supervisor {
    /// Supervisor re-running `exe` with the effective config at `config_path`.
    pub fn new(
        exe: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
        log_level: impl Into<String>,
        workers: usize,
        grace: Duration,
    ) -> Self {
        Self {
            exe: exe.into(),
            config_path: config_path.into(),
            log_level: log_level.into(),
            workers,
            grace,
        }
    }

    /// Argument vector for worker `index`.
    pub fn worker_args(&self, index: usize) -> Vec<String> {
        vec![
            "--config".to_string(),
            self.config_path.display().to_string(),
            "--log-level".to_string(),
            self.log_level.clone(),
            "worker".to_string(),
            "--index".to_string(),
            index.to_string(),
            "--count".to_string(),
            self.workers.to_string(),
        ]
    }

    fn spawn(&self, index: usize) -> Result<Child> {
        Command::new(&self.exe)
            .args(self.worker_args(index))
            .spawn()
            .with_context(|| format!("failed to spawn worker {index} from {}", self.exe.display()))
    }

    /// Start every worker and wait for all of them.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker cannot be spawned; workers already
    /// started are terminated first.
    pub fn run(&self, signals: &SignalHandler) -> Result<SupervisorReport> {
        let mut children: Vec<(usize, Child)> = Vec::with_capacity(self.workers);
        for index in 0..self.workers {
            match self.spawn(index) {
                Ok(child) => {
                    info!(worker = index, pid = child.id(), "worker started");
                    children.push((index, child));
                }
                Err(e) => {
                    for (_, child) in &mut children {
                        terminate(child);
                    }
                    reap_all(&mut children, Instant::now() + self.grace);
                    return Err(e);
                }
            }
        }

        let mut report = SupervisorReport::default();
        let mut deadline: Option<Instant> = None;
        while !children.is_empty() {
            if deadline.is_none() && signals.shutdown_requested() {
                info!(workers = children.len(), grace = ?self.grace, "forwarding shutdown to workers");
                for (_, child) in &mut children {
                    terminate(child);
                }
                deadline = Some(Instant::now() + self.grace);
                report.interrupted = true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(workers = children.len(), "grace period elapsed; killing workers");
                for (index, child) in &mut children {
                    if let Err(e) = child.kill() {
                        warn!(worker = *index, error = %e, "kill failed");
                    }
                }
                deadline = None;
            }

            children.retain_mut(|(index, child)| match child.try_wait() {
                Ok(Some(status)) => {
                    record_exit(&mut report, *index, status);
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    error!(worker = *index, error = %e, "cannot wait on worker");
                    report.failed += 1;
                    false
                }
            });
            if !children.is_empty() {
                std::thread::sleep(POLL_INTERVAL);
            }
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            "all workers finished"
        );
        Ok(report)
    }

    /// Effective config path handed to workers.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

fn record_exit(report: &mut SupervisorReport, index: usize, status: ExitStatus) {
    if status.success() {
        info!(worker = index, "worker finished");
        report.succeeded += 1;
    } else {
        error!(worker = index, %status, "worker failed");
        report.failed += 1;
    }
}

fn reap_all(children: &mut Vec<(usize, Child)>, deadline: Instant) {
    while !children.is_empty() {
        children.retain_mut(|(_, child)| matches!(child.try_wait(), Ok(None)));
        if Instant::now() >= deadline {
            for (_, child) in children.iter_mut() {
                let _ = child.kill();
                let _ = child.wait();
            }
            return;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Ask a worker to stop after its current mutant.
#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(child.id()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        // ESRCH: already gone
        if e != nix::errno::Errno::ESRCH {
            warn!(pid = raw, error = %e, "failed to forward SIGTERM");
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
}
