//! Job Queue Engine
//!
//! A minimal in-process [`ScriptEngine`]: its only state is a FIFO of
//! continuation closures. It is what the `veil` binary embeds, and what the
//! tests use to drive the host end to end.
//!
//! Jobs run to completion one at a time. A job receives the [`JobQueue`] so
//! it can schedule follow-up jobs, exactly like a resolved promise queueing
//! its reactions.

use super::{EngineError, JobError, ScriptEngine, UnitOutcome};
use crate::config::Configuration;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// A queued unit of work.
pub type Job = Box<dyn FnOnce(&JobQueue) -> Result<(), JobError>>;

/// Cloneable handle onto the engine's job queue.
///
/// I/O completion callbacks hold one of these to schedule script work.
#[derive(Clone, Default)]
pub struct JobQueue {
    jobs: Rc<RefCell<VecDeque<Job>>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job to the back of the queue.
    pub fn enqueue<F>(&self, job: F)
    where
        F: FnOnce(&JobQueue) -> Result<(), JobError> + 'static,
    {
        self.jobs.borrow_mut().push_back(Box::new(job));
    }

    pub fn len(&self) -> usize {
        self.jobs.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.borrow().is_empty()
    }

    fn pop(&self) -> Option<Job> {
        self.jobs.borrow_mut().pop_front()
    }
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue").field("len", &self.len()).finish()
    }
}

/// Execution context of a [`JobQueueEngine`].
#[derive(Debug, Default)]
pub struct JobContext {
    executed: u64,
}

impl JobContext {
    /// Jobs run in this context so far, failed ones included.
    pub fn executed(&self) -> u64 {
        self.executed
    }
}

/// In-process engine whose queued work is a FIFO of closures.
#[derive(Debug, Default)]
pub struct JobQueueEngine {
    queue: JobQueue,
    process: Option<Value>,
    unhandled: Vec<JobError>,
    executed: u64,
    live_contexts: usize,
}

impl JobQueueEngine {
    /// Handle for scheduling work on this engine.
    pub fn queue(&self) -> JobQueue {
        self.queue.clone()
    }

    /// Configuration snapshot exposed to scripts as the `process` record.
    pub fn process_info(&self) -> Option<&Value> {
        self.process.as_ref()
    }

    /// Errors handed back under the deliver-as-event drain policy.
    pub fn unhandled_errors(&self) -> &[JobError] {
        &self.unhandled
    }

    /// Total jobs run by this engine.
    pub fn executed(&self) -> u64 {
        self.executed
    }
}

impl ScriptEngine for JobQueueEngine {
    type Context = JobContext;

    fn create_engine() -> Result<Self, EngineError> {
        debug!("creating job queue engine");
        Ok(Self::default())
    }

    fn create_context(&mut self) -> Result<JobContext, EngineError> {
        if self.live_contexts > 0 {
            return Err(EngineError::ContextAllocation(
                "engine already has an execution context".to_string(),
            ));
        }
        self.live_contexts += 1;
        Ok(JobContext::default())
    }

    fn bootstrap(
        &mut self,
        _context: &mut JobContext,
        config: &Configuration,
    ) -> Result<(), EngineError> {
        let process =
            serde_json::to_value(config).map_err(|err| EngineError::Bootstrap(err.to_string()))?;
        self.process = Some(process);
        Ok(())
    }

    fn has_pending_work(&self) -> bool {
        !self.queue.is_empty()
    }

    fn run_one_queued_unit(&mut self, context: &mut JobContext) -> Result<UnitOutcome, JobError> {
        let Some(job) = self.queue.pop() else {
            return Ok(UnitOutcome::Idle);
        };

        context.executed += 1;
        self.executed += 1;
        job(&self.queue)?;

        let more_remaining = !self.queue.is_empty();
        trace!(more_remaining, "job completed");
        Ok(UnitOutcome::Ran { more_remaining })
    }

    fn deliver_unhandled_error(&mut self, _context: &mut JobContext, error: &JobError) {
        warn!(%error, "unhandled job error");
        self.unhandled.push(error.clone());
    }

    fn destroy_context(&mut self, context: JobContext) {
        debug!(executed = context.executed, "releasing job context");
        self.live_contexts = self.live_contexts.saturating_sub(1);
    }
}
