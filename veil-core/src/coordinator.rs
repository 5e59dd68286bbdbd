//! Event Loop Coordinator
//!
//! Interleaves the script engine's queued work with the I/O loop so that
//! the loop never blocks while work is ready, and never spins while none is.
//!
//! # Handles:
//! - **pre-poll** (prepare, unreferenced): re-evaluates the forced wake
//! - **post-poll** (check, unreferenced): drains the queue, then re-evaluates
//! - **forced wake** (idle, referenced): armed exactly while work is pending
//! - **stop** (async, unreferenced): closes all four and ends `run()`
//!
//! Only the forced wake is referenced. When it is disarmed and no I/O is
//! outstanding the loop has nothing left to wait for, and `run()` returns.

use crate::engine::{DrainOutcome, TaskQueue};
use crate::error::{check_ok, fail_fast};
use crate::event_loop::{AsyncSignal, EventLoop, HandleId, LoopConfig, RunMode};
use std::rc::Rc;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy)]
struct CoordinatorHandles {
    prepoll: HandleId,
    postpoll: HandleId,
    forced_wake: HandleId,
    stop: HandleId,
}

impl CoordinatorHandles {
    fn all(&self) -> [HandleId; 4] {
        [self.prepoll, self.postpoll, self.forced_wake, self.stop]
    }
}

/// Drives an [`EventLoop`] and a [`TaskQueue`] as one scheduler.
pub struct EventLoopCoordinator<Q: TaskQueue + 'static> {
    event_loop: EventLoop,
    queue: Rc<Q>,
    handles: Option<CoordinatorHandles>,
    stop_signal: AsyncSignal,
    enabled: bool,
}

impl<Q: TaskQueue + 'static> EventLoopCoordinator<Q> {
    /// Create the loop and register the four coordinator handles on it.
    ///
    /// A loop primitive failing here is fatal.
    pub fn start(config: &LoopConfig, queue: Q) -> Self {
        let mut event_loop = check_ok(EventLoop::new(config));

        let prepoll = check_ok(event_loop.add_prepare());
        let postpoll = check_ok(event_loop.add_check());
        let forced_wake = check_ok(event_loop.add_idle());
        let (stop, stop_signal) = check_ok(event_loop.add_async(move |lp, stop| {
            debug!("stop signal received");
            for id in [prepoll, postpoll, forced_wake, stop] {
                if lp.is_open(id) {
                    check_ok(lp.close_handle(id));
                }
            }
            lp.stop_loop();
        }));

        check_ok(event_loop.unref_handle(prepoll));
        check_ok(event_loop.unref_handle(postpoll));
        check_ok(event_loop.unref_handle(stop));

        debug!("event loop coordinator started");
        Self {
            event_loop,
            queue: Rc::new(queue),
            handles: Some(CoordinatorHandles {
                prepoll,
                postpoll,
                forced_wake,
                stop,
            }),
            stop_signal,
            enabled: true,
        }
    }

    /// Run until no referenced work remains or the stop signal fires.
    pub fn run(&mut self) {
        if !self.enabled {
            fail_fast("event loop coordinator run after stop");
        }
        let Some(handles) = self.handles else {
            return;
        };
        if !self.event_loop.is_open(handles.prepoll) {
            debug!("coordinator handles already closed; nothing to run");
            return;
        }

        let queue = self.queue.clone();
        let forced_wake = handles.forced_wake;
        check_ok(self.event_loop.start(handles.prepoll, move |lp, _| {
            reconcile(lp, queue.as_ref(), forced_wake);
        }));

        let queue = self.queue.clone();
        check_ok(self.event_loop.start(handles.postpoll, move |lp, _| {
            match queue.drain_pending_work() {
                DrainOutcome::Drained { units } => trace!(units, "queue drained"),
                DrainOutcome::Failed { units, error } => {
                    debug!(units, %error, "drain stopped on failed unit")
                }
                DrainOutcome::Unavailable => trace!("no engine to drain"),
            }
            reconcile(lp, queue.as_ref(), forced_wake);
        }));

        reconcile(&mut self.event_loop, self.queue.as_ref(), forced_wake);
        check_ok(self.event_loop.run(RunMode::Default));
        debug!(stats = ?self.event_loop.stats(), "event loop finished");
    }

    /// Close the coordinator handles, flush them, then close the loop.
    ///
    /// Handles registered through [`event_loop_mut`](Self::event_loop_mut)
    /// must be closed beforehand. Calling this more than once is a no-op.
    pub fn stop(&mut self) {
        if !self.enabled {
            return;
        }

        if let Some(handles) = self.handles.take() {
            for id in handles.all() {
                if self.event_loop.is_open(id) {
                    check_ok(self.event_loop.close_handle(id));
                }
            }
        }
        check_ok(self.event_loop.run(RunMode::NoWait));
        check_ok(self.event_loop.close_loop());
        self.enabled = false;
        info!("event loop coordinator stopped");
    }

    /// Cross-thread trigger that makes [`run`](Self::run) return.
    pub fn stop_signal(&self) -> AsyncSignal {
        self.stop_signal.clone()
    }

    /// Trigger the stop signal on Ctrl-C. The listener never keeps the loop alive.
    pub fn stop_on_interrupt(&mut self) {
        if !self.enabled {
            return;
        }
        let signal = self.stop_signal.clone();
        check_ok(self.event_loop.spawn_io_unref(
            tokio::signal::ctrl_c,
            move |_, result| match result {
                Ok(()) => {
                    info!("interrupt received, stopping");
                    signal.send();
                }
                Err(err) => warn!(%err, "failed to listen for interrupts"),
            },
        ));
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the forced wake is currently armed.
    pub fn forced_wake_armed(&self) -> bool {
        self.handles
            .is_some_and(|handles| self.event_loop.is_active(handles.forced_wake))
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Register I/O or extra handles on the coordinated loop.
    pub fn event_loop_mut(&mut self) -> &mut EventLoop {
        &mut self.event_loop
    }
}

impl<Q: TaskQueue + 'static> Drop for EventLoopCoordinator<Q> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Arm the forced wake while work is pending, disarm it otherwise.
fn reconcile<Q: TaskQueue + ?Sized>(lp: &mut EventLoop, queue: &Q, forced_wake: HandleId) {
    if !lp.is_open(forced_wake) {
        return;
    }
    if queue.has_pending_work() {
        if !lp.is_active(forced_wake) {
            trace!("arming forced wake");
        }
        check_ok(lp.start(forced_wake, |_, _| {}));
    } else {
        check_ok(lp.stop(forced_wake));
    }
}
