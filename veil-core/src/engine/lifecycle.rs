//! Engine Lifecycle Management
//!
//! Owns the single engine instance and its execution context. The context
//! lives strictly inside the engine's lifetime: it is created after the
//! engine and always released before it.

use super::{
    DrainErrorPolicy, DrainOutcome, EngineError, ScriptEngine, TaskQueueBridge, UnitOutcome,
};
use crate::config::Configuration;
use crate::error::fail_fast;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Engine instance plus the context bound to it, shared with the bridge.
pub(crate) struct EngineSlot<E: ScriptEngine> {
    pub(crate) engine: E,
    context: Option<E::Context>,
    policy: DrainErrorPolicy,
}

impl<E: ScriptEngine> EngineSlot<E> {
    pub(crate) fn has_pending_work(&self) -> bool {
        self.engine.has_pending_work()
    }

    /// Run queued units until the engine reports empty or one fails.
    ///
    /// No unit cap: each unit runs to completion and the queue must be
    /// provably empty before control returns to the loop.
    pub(crate) fn drain(&mut self) -> DrainOutcome {
        let Some(context) = self.context.as_mut() else {
            return DrainOutcome::Unavailable;
        };

        let mut units = 0;
        loop {
            match self.engine.run_one_queued_unit(context) {
                Ok(UnitOutcome::Idle) => return DrainOutcome::Drained { units },
                Ok(UnitOutcome::Ran { more_remaining }) => {
                    units += 1;
                    if !more_remaining {
                        return DrainOutcome::Drained { units };
                    }
                }
                Err(error) => {
                    units += 1;
                    match self.policy {
                        DrainErrorPolicy::Abort => fail_fast(&error),
                        DrainErrorPolicy::Log => warn!(%error, units, "drain stopped"),
                        DrainErrorPolicy::DeliverAsEvent => {
                            self.engine.deliver_unhandled_error(context, &error)
                        }
                    }
                    return DrainOutcome::Failed { units, error };
                }
            }
        }
    }
}

/// Creates, drains and destroys the embedded engine.
pub struct EngineLifecycleManager<E: ScriptEngine> {
    slot: Option<Rc<RefCell<EngineSlot<E>>>>,
    policy: DrainErrorPolicy,
}

impl<E: ScriptEngine> EngineLifecycleManager<E> {
    /// A manager with no engine yet; call [`create`](Self::create).
    pub fn new(policy: DrainErrorPolicy) -> Self {
        Self { slot: None, policy }
    }

    /// Construct the engine, then its execution context.
    ///
    /// Either allocation failing leaves the process unrecoverable and aborts.
    pub fn create(&mut self) {
        if self.slot.is_some() {
            fail_fast("script engine created twice");
        }

        let mut engine = match E::create_engine() {
            Ok(engine) => engine,
            Err(err) => fail_fast(err),
        };
        let context = match engine.create_context() {
            Ok(context) => context,
            Err(err) => fail_fast(err),
        };

        self.slot = Some(Rc::new(RefCell::new(EngineSlot {
            engine,
            context: Some(context),
            policy: self.policy,
        })));
        info!(policy = ?self.policy, "script engine created");
    }

    /// Release the context, then the engine. No-op when nothing is live.
    pub fn destroy(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };

        let mut slot = match Rc::try_unwrap(slot) {
            Ok(cell) => cell.into_inner(),
            Err(_) => fail_fast("script engine destroyed while in use"),
        };
        if let Some(context) = slot.context.take() {
            slot.engine.destroy_context(context);
        }
        drop(slot);
        info!("script engine destroyed");
    }

    /// `true` between a successful [`create`](Self::create) and [`destroy`](Self::destroy).
    pub fn is_enabled(&self) -> bool {
        self.slot.is_some()
    }

    pub fn policy(&self) -> DrainErrorPolicy {
        self.policy
    }

    /// Hand the configuration to the engine.
    pub fn bootstrap(&self, config: &Configuration) -> Result<(), EngineError> {
        let Some(slot) = &self.slot else {
            return Err(EngineError::Bootstrap("no script engine".to_string()));
        };

        let mut slot = slot.borrow_mut();
        let EngineSlot {
            engine, context, ..
        } = &mut *slot;
        let context = context
            .as_mut()
            .ok_or_else(|| EngineError::Bootstrap("no execution context".to_string()))?;
        debug!(script = %config.script.source, op = ?config.script.op, "bootstrapping engine");
        engine.bootstrap(context, config)
    }

    /// Whether queued work is waiting. `false` when no engine is live.
    pub fn has_pending_work(&self) -> bool {
        self.slot
            .as_ref()
            .is_some_and(|slot| slot.borrow().has_pending_work())
    }

    /// Drain the engine's queue completely, or until one unit fails.
    pub fn drain_pending_work(&self) -> DrainOutcome {
        match &self.slot {
            Some(slot) => slot.borrow_mut().drain(),
            None => DrainOutcome::Unavailable,
        }
    }

    /// Non-owning view of the engine for the event loop coordinator.
    pub fn bridge(&self) -> Option<TaskQueueBridge<E>> {
        self.slot.as_ref().map(TaskQueueBridge::new)
    }

    /// Borrow the live engine.
    pub fn with_engine<R>(&self, f: impl FnOnce(&E) -> R) -> Option<R> {
        self.slot.as_ref().map(|slot| f(&slot.borrow().engine))
    }

    /// Mutably borrow the live engine.
    pub fn with_engine_mut<R>(&self, f: impl FnOnce(&mut E) -> R) -> Option<R> {
        self.slot
            .as_ref()
            .map(|slot| f(&mut slot.borrow_mut().engine))
    }
}

impl<E: ScriptEngine> Drop for EngineLifecycleManager<E> {
    fn drop(&mut self) {
        self.destroy();
    }
}
