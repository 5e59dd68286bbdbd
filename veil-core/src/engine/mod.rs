//! Engine Boundary - Embedded Script Engine Contract
//!
//! The host never looks inside the scripting engine. It creates one engine
//! instance and one execution context bound to it, hands the configuration
//! over once, and afterwards only asks two questions of it: is queued work
//! pending, and run the next queued unit.
//!
//! # Components:
//! - [`ScriptEngine`]: the capability contract an embedded engine satisfies
//! - [`EngineLifecycleManager`]: create/destroy ordering and queue drainage
//! - [`TaskQueueBridge`]: the engine-agnostic view handed to the event loop
//! - [`JobQueueEngine`]: an in-process engine built on a FIFO of continuations

pub mod bridge;
pub mod job_queue;
pub mod lifecycle;

pub use bridge::{TaskQueue, TaskQueueBridge};
pub use job_queue::{JobContext, JobQueue, JobQueueEngine};
pub use lifecycle::EngineLifecycleManager;

use crate::config::Configuration;
use thiserror::Error;
use tracing::warn;

/// Failure while constructing or bootstrapping an engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("failed to allocate script engine: {0}")]
    EngineAllocation(String),
    #[error("failed to allocate execution context: {0}")]
    ContextAllocation(String),
    #[error("engine bootstrap failed: {0}")]
    Bootstrap(String),
}

/// A single queued unit of script work that failed while running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("queued job failed: {message}")]
pub struct JobError {
    message: String,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Result of asking the engine to run one queued unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// The queue was empty; nothing ran.
    Idle,
    /// One unit ran to completion.
    Ran { more_remaining: bool },
}

/// Result of draining the engine's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The queue is empty. `units` ran during this drain.
    Drained { units: usize },
    /// A unit failed and draining stopped. The failed unit is included in `units`.
    Failed { units: usize, error: JobError },
    /// There is no live engine to drain.
    Unavailable,
}

impl DrainOutcome {
    /// Units executed during the drain, including a failed one.
    pub fn units(&self) -> usize {
        match self {
            Self::Drained { units } | Self::Failed { units, .. } => *units,
            Self::Unavailable => 0,
        }
    }
}

/// What happens when a queued unit fails during a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainErrorPolicy {
    /// Abort the process through [`crate::error::fail_fast`].
    Abort,
    /// Log at warn level and stop this drain; remaining work runs next iteration.
    #[default]
    Log,
    /// Hand the error back to the engine as an unhandled-error event.
    DeliverAsEvent,
}

/// Capability contract of an embedded script engine.
///
/// Dropping the engine value releases the engine instance. The host always
/// passes the context back to [`destroy_context`](Self::destroy_context)
/// before the engine is dropped.
pub trait ScriptEngine: Sized + 'static {
    /// Execution context bound to one engine instance.
    type Context: 'static;

    /// Construct the engine instance.
    fn create_engine() -> Result<Self, EngineError>;

    /// Construct the single execution context bound to this engine.
    fn create_context(&mut self) -> Result<Self::Context, EngineError>;

    /// Receive the start-up configuration, once, before any work is drained.
    fn bootstrap(
        &mut self,
        _context: &mut Self::Context,
        _config: &Configuration,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    /// Whether at least one queued unit is waiting. Must not run anything.
    fn has_pending_work(&self) -> bool;

    /// Run exactly one queued unit, if any.
    fn run_one_queued_unit(&mut self, context: &mut Self::Context)
        -> Result<UnitOutcome, JobError>;

    /// Receive a failed unit under [`DrainErrorPolicy::DeliverAsEvent`].
    fn deliver_unhandled_error(&mut self, _context: &mut Self::Context, error: &JobError) {
        warn!(%error, "unhandled job error dropped by engine");
    }

    /// Release the execution context. Called before the engine is dropped.
    fn destroy_context(&mut self, context: Self::Context);
}
