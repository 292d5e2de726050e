//! Signal handling for graceful shutdown.
//!
//! SIGTERM and SIGINT set an atomic flag. The supervisor polls it to forward
//! termination to its workers; workers poll it between mutants.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

static SIGNALLED: AtomicBool = AtomicBool::new(false);
static SIGNAL_COUNT: AtomicU32 = AtomicU32::new(0);

/// Signal types that stop the fuzzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM, sent by the supervisor or a service manager.
    Terminate,
    /// SIGINT (Ctrl+C).
    Interrupt,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// Shutdown state shared between the handler and the polling loops.
#[derive(Debug, Default)]
pub struct SignalState {
    shutdown_requested: AtomicBool,
}

impl SignalState {
    /// Create a new signal state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether shutdown was requested by a signal or by hand.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Relaxed) || SIGNALLED.load(Ordering::Relaxed)
    }

    /// Request shutdown from any thread.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Relaxed);
    }

    /// Signals received by this process.
    pub fn signal_count(&self) -> u32 {
        SIGNAL_COUNT.load(Ordering::Relaxed)
    }
}

/// Cloneable handle checked by the campaign and the supervisor.
#[derive(Debug, Clone)]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    /// Create a handler and register SIGTERM and SIGINT on Unix.
    ///
    /// # Errors
    ///
    /// Returns the OS error if a handler cannot be installed.
    pub fn new() -> std::io::Result<Self> {
        let handler = Self {
            state: Arc::new(SignalState::new()),
        };

        #[cfg(unix)]
        register_unix_handlers()?;

        Ok(handler)
    }

    /// Whether shutdown was requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.state.shutdown_requested()
    }

    /// Manually request shutdown.
    pub fn request_shutdown(&self) {
        info!("manual shutdown requested");
        self.state.request_shutdown();
    }

    /// Shared state for inspection.
    pub fn state(&self) -> &SignalState {
        &self.state
    }
}

#[cfg(unix)]
fn register_unix_handlers() -> std::io::Result<()> {
    use std::os::raw::c_int;

    // Handlers must be async-signal-safe: atomics only.
    extern "C" fn on_terminate(_: c_int) {
        SIGNAL_COUNT.fetch_add(1, Ordering::Relaxed);
        SIGNALLED.store(true, Ordering::Relaxed);
    }

    for (signal, kind) in [
        (libc::SIGTERM, SignalKind::Terminate),
        (libc::SIGINT, SignalKind::Interrupt),
    ] {
        // SAFETY: `on_terminate` only touches atomics.
        let previous = unsafe { libc::signal(signal, on_terminate as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
        debug!(signal = %kind, "signal handler registered");
    }
    Ok(())
}
