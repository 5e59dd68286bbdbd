//! Veil Core - Script Runtime Host
//!
//! Embeds a script engine in a process whose lifetime is governed by an
//! asynchronous I/O loop, and coordinates the two so that queued script work
//! always runs before the loop blocks, and the loop never spins when there
//! is nothing to do.
//!
//! # Layers:
//! - [`engine`]: engine contract, lifecycle and the task queue bridge
//! - [`event_loop`]: phased reactor over a current-thread tokio runtime
//! - [`coordinator`]: the scheduler joining the two
//! - [`runtime`]: the composition root driven by the `veil` binary
//! - [`cli`] / [`config`]: argv to an immutable [`Configuration`]

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod event_loop;
pub mod platform;
pub mod runtime;

pub use config::Configuration;
pub use coordinator::EventLoopCoordinator;
pub use engine::{
    DrainErrorPolicy, DrainOutcome, EngineLifecycleManager, JobQueue, JobQueueEngine,
    ScriptEngine, TaskQueue, TaskQueueBridge,
};
pub use error::fail_fast;
pub use event_loop::{AsyncSignal, EventLoop, LoopConfig, RunMode};
pub use runtime::{HostError, HostSettings, HostState, RuntimeHost};

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Environment variable holding `tracing` filter directives.
pub const LOG_ENV: &str = "VEIL_LOG";

/// Install the global tracing subscriber, writing to stderr.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(anyhow::Error::msg)?;
    Ok(())
}
