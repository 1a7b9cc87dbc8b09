//! Detach from the controlling terminal.

use std::io;
use tracing::info;

/// Fork into the background, chdir to `/` and point stdio at `/dev/null`.
///
/// Must run before any helper thread is spawned: only the calling thread
/// survives the fork.
pub fn detach() -> io::Result<()> {
    info!("Detaching from terminal");
    // SAFETY: daemon(3) forks and exits the parent; no other threads exist yet.
    let rc = unsafe { libc::daemon(0, 0) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
