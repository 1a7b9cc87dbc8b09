//! Shutdown signalling.
//!
//! SIGINT and SIGTERM are caught by `signal-hook`, whose low-level handler
//! only writes to a self-pipe. A dedicated thread drains that pipe and flips
//! the shared shutdown flag, then wakes the accept loop's poll through a
//! `mio::Waker`. The accept loop is the only place the flag is acted upon,
//! so a session already in progress always runs to completion.

use mio::{Registry, Token, Waker};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Cloneable trigger shared between the accept loop and whoever may stop it.
#[derive(Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Create a handle whose wakeups arrive at `registry` as `token`.
    pub fn new(registry: &Registry, token: Token) -> io::Result<Self> {
        Ok(Self {
            requested: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(Waker::new(registry, token)?),
        })
    }

    /// Request shutdown and wake the accept loop.
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        // A failed wake only delays shutdown until the next accept event.
        let _ = self.waker.wake();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Keeps the signal thread alive; dropping it unregisters and joins.
pub struct SignalGuard {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Route SIGINT/SIGTERM to `shutdown`.
pub fn install_signal_handlers(shutdown: ShutdownHandle) -> io::Result<SignalGuard> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let handle = signals.handle();

    let thread = thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                debug!(signal, "Shutdown requested");
                shutdown.trigger();
            }
        })?;

    Ok(SignalGuard {
        handle,
        thread: Some(thread),
    })
}
