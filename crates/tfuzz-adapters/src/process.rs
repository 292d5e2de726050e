//! Subprocess execution under a hard deadline.
//!
//! Children are started in their own process group on Unix so that a
//! timeout kills toolchain proxies together with the compiler they spawned.
//! Because of that they never see signals aimed at the worker, so the poll
//! loop also watches the worker's shutdown flag, and on Linux each child is
//! bound to its parent with `PR_SET_PDEATHSIG`.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Shared "stop now" predicate, polled while a child runs.
pub type ShutdownCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// How a deadline-bounded subprocess ended.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// The process exited on its own.
    Exited {
        /// Exit status.
        status: ExitStatus,
        /// Captured stdout (lossy UTF-8).
        stdout: String,
        /// Captured stderr (lossy UTF-8).
        stderr: String,
        /// Wall-clock duration.
        duration: Duration,
    },
    /// The deadline passed and the process group was killed.
    TimedOut {
        /// Wall-clock duration until the kill.
        duration: Duration,
    },
}

/// Render a command line for logs and detail records.
#[must_use]
pub fn render_command(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run `command` to completion or until `timeout`, optionally feeding `stdin`.
///
/// # Errors
///
/// Returns the spawn or wait error; a timeout is not an error.
pub fn run_with_timeout(
    command: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> std::io::Result<ProcessOutcome> {
    run_until(command, stdin, timeout, None)
}

/// Like [`run_with_timeout`], but also kill the child once `shutdown` reports true.
///
/// # Errors
///
/// Returns the spawn or wait error, or [`std::io::ErrorKind::Interrupted`]
/// when shutdown was requested. Nothing is spawned if shutdown is already
/// pending.
pub fn run_until(
    mut command: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    shutdown: Option<&ShutdownCheck>,
) -> std::io::Result<ProcessOutcome> {
    let stopping = || shutdown.is_some_and(|check| check());
    if stopping() {
        return Err(interrupted());
    }
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    #[cfg(target_os = "linux")]
    die_with_parent(&mut command);

    let start = Instant::now();
    let mut child = command.spawn()?;
    let stdout_reader = drain(child.stdout.take());
    let stderr_reader = drain(child.stderr.take());
    let stdin_writer = match (stdin, child.stdin.take()) {
        (Some(bytes), Some(mut pipe)) => {
            let data = bytes.to_vec();
            // A child that exits without reading closes the pipe; that is fine.
            Some(std::thread::spawn(move || {
                let _ = pipe.write_all(&data);
            }))
        }
        _ => None,
    };

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(e) => {
                terminate(&mut child);
                return Err(e);
            }
        }
        if stopping() {
            terminate(&mut child);
            join_io(stdin_writer, stdout_reader, stderr_reader);
            tracing::debug!(pid = child.id(), "child killed on shutdown");
            return Err(interrupted());
        }
        if start.elapsed() >= timeout {
            terminate(&mut child);
            break None;
        }
        std::thread::sleep(POLL_INTERVAL);
    };
    let duration = start.elapsed();
    let (stdout, stderr) = join_io(stdin_writer, stdout_reader, stderr_reader);

    Ok(match status {
        Some(status) => ProcessOutcome::Exited {
            status,
            stdout,
            stderr,
            duration,
        },
        None => ProcessOutcome::TimedOut { duration },
    })
}

fn interrupted() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Interrupted, "shutdown requested")
}

fn join_io(
    stdin_writer: Option<JoinHandle<()>>,
    stdout_reader: Option<JoinHandle<Vec<u8>>>,
    stderr_reader: Option<JoinHandle<Vec<u8>>>,
) -> (String, String) {
    if let Some(writer) = stdin_writer {
        let _ = writer.join();
    }
    (collect(stdout_reader), collect(stderr_reader))
}

/// SIGKILL the child when the spawning thread dies.
///
/// The signal follows the thread, not the process; callers block in
/// [`run_until`] until the child is reaped, so the thread outlives it.
#[cfg(target_os = "linux")]
fn die_with_parent(command: &mut Command) {
    use std::os::unix::process::CommandExt;

    let Ok(parent) = libc::pid_t::try_from(std::process::id()) else {
        return;
    };
    // SAFETY: the hook runs between fork and exec and only calls
    // async-signal-safe functions.
    unsafe {
        command.pre_exec(move || {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            // Parent already gone before the prctl took effect.
            if libc::getppid() != parent {
                return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
            }
            Ok(())
        });
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Ok(pid) = i32::try_from(child.id()) {
            if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                tracing::debug!(pid, error = %e, "killpg failed, falling back to kill");
            }
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_captures_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
        match run_with_timeout(cmd, None, Duration::from_secs(5)).unwrap() {
            ProcessOutcome::Exited {
                status,
                stdout,
                stderr,
                ..
            } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stdout.trim(), "out");
                assert_eq!(stderr.trim(), "err");
            }
            ProcessOutcome::TimedOut { .. } => panic!("unexpected timeout"),
        }
    }

    #[test]
    fn test_timeout_kills_child() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 5"]);
        let start = Instant::now();
        let outcome = run_with_timeout(cmd, None, Duration::from_millis(100)).unwrap();
        assert!(matches!(outcome, ProcessOutcome::TimedOut { .. }));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_feeds_stdin() {
        let cmd = Command::new("cat");
        match run_with_timeout(cmd, Some(b"fn main() {}"), Duration::from_secs(5)).unwrap() {
            ProcessOutcome::Exited { stdout, .. } => assert_eq!(stdout, "fn main() {}"),
            ProcessOutcome::TimedOut { .. } => panic!("unexpected timeout"),
        }
    }

    #[test]
    fn test_spawn_failure_is_error() {
        let cmd = Command::new("/nonexistent/tfuzz-tool");
        assert!(run_with_timeout(cmd, None, Duration::from_secs(1)).is_err());
    }

    fn flag_check(flag: &Arc<std::sync::atomic::AtomicBool>) -> ShutdownCheck {
        let flag = Arc::clone(flag);
        Arc::new(move || flag.load(std::sync::atomic::Ordering::Relaxed))
    }

    #[test]
    fn test_shutdown_kills_running_child() {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        use std::sync::atomic::{AtomicBool, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("echo $$ > {}; exec sleep 30", pid_file.display()));

        let stop = Arc::new(AtomicBool::new(false));
        let check = flag_check(&stop);
        let setter = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(300));
                stop.store(true, Ordering::Relaxed);
            })
        };

        let start = Instant::now();
        let err = run_until(cmd, None, Duration::from_secs(60), Some(&check)).unwrap_err();
        setter.join().unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::Interrupted);
        assert!(start.elapsed() < Duration::from_secs(10));

        let pid: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(kill(Pid::from_raw(pid), None).is_err());
    }

    #[test]
    fn test_pending_shutdown_spawns_nothing() {
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let cmd = Command::new("/nonexistent/tfuzz-tool");
        let err = run_until(cmd, None, Duration::from_secs(1), Some(&flag_check(&stop))).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::Interrupted);
    }

    #[test]
    fn test_render_command() {
        let mut cmd = Command::new("rustc");
        cmd.args(["+nightly", "a.rs"]);
        assert_eq!(render_command(&cmd), "rustc +nightly a.rs");
    }
}
