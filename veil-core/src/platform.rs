//! Process setup performed once before the runtime starts.

use anyhow::{Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};
use tracing::debug;

/// Ignore `SIGPIPE` so writes to a closed pipe fail with `EPIPE` instead of
/// terminating the host.
pub fn prepare_process() -> Result<()> {
    // SAFETY: SigIgn installs no handler code, and this runs before any
    // other thread is started.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to ignore SIGPIPE")?;
    debug!("SIGPIPE ignored");
    Ok(())
}
