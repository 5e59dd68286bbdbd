//! Task Queue Bridge
//!
//! The event loop coordinator only needs two capabilities from the engine.
//! [`TaskQueue`] names them so the coordinator can run against any queue,
//! including a fake one in tests, without knowing the engine type.

use super::lifecycle::EngineSlot;
use super::{DrainOutcome, ScriptEngine};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Queued script work as seen from the event loop.
pub trait TaskQueue {
    /// Whether queued work is waiting. Pure query.
    fn has_pending_work(&self) -> bool;

    /// Run queued work until the queue is empty or a unit fails.
    fn drain_pending_work(&self) -> DrainOutcome;
}

/// Non-owning projection of an engine owned by an
/// [`EngineLifecycleManager`](super::EngineLifecycleManager).
///
/// Once the engine is destroyed the bridge reports no work and drains
/// return [`DrainOutcome::Unavailable`].
pub struct TaskQueueBridge<E: ScriptEngine> {
    slot: Weak<RefCell<EngineSlot<E>>>,
}

impl<E: ScriptEngine> TaskQueueBridge<E> {
    pub(crate) fn new(slot: &Rc<RefCell<EngineSlot<E>>>) -> Self {
        Self {
            slot: Rc::downgrade(slot),
        }
    }

    /// `true` while the engine behind the bridge is alive.
    pub fn is_connected(&self) -> bool {
        self.slot.strong_count() > 0
    }
}

impl<E: ScriptEngine> Clone for TaskQueueBridge<E> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<E: ScriptEngine> TaskQueue for TaskQueueBridge<E> {
    fn has_pending_work(&self) -> bool {
        self.slot
            .upgrade()
            .is_some_and(|slot| slot.borrow().has_pending_work())
    }

    fn drain_pending_work(&self) -> DrainOutcome {
        match self.slot.upgrade() {
            Some(slot) => slot.borrow_mut().drain(),
            None => DrainOutcome::Unavailable,
        }
    }
}
