//! I/O Event Loop - Phased Reactor over Tokio
//!
//! Wraps a current-thread tokio runtime (epoll/kqueue driver, timers and the
//! blocking pool) and drives it in explicit iterations so observers can hook
//! the points around the poll:
//!
//! ```text
//! idle -> prepare -> poll (I/O completions, async signals) -> check -> close
//! ```
//!
//! # Handles:
//! - **Prepare**: runs before the loop decides how long to block
//! - **Check**: runs after the iteration's I/O callbacks
//! - **Idle**: while active, the poll never blocks
//! - **Async**: a flag other threads may raise through [`AsyncSignal`]
//!
//! A handle keeps the loop alive only while it is both active and
//! referenced. In-flight I/O started with [`EventLoop::spawn_io`] keeps it
//! alive too; [`EventLoop::spawn_io_unref`] does not.
//!
//! # Threading:
//! Every callback runs on the thread calling [`EventLoop::run`]. Futures are
//! built lazily inside the loop's `LocalSet`, so they need not be `Send` and
//! may touch the runtime (timers, sockets) at construction.

use std::fmt;
use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinError, LocalSet};
use tracing::{debug, trace, warn};

/// Blocking pool size when `UV_THREADPOOL_SIZE` is unset or unparsable.
pub const DEFAULT_THREADPOOL_SIZE: usize = 4;
pub const MAX_THREADPOOL_SIZE: usize = 1024;

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

/// Runtime construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    /// Upper bound on threads serving [`EventLoop::queue_work`].
    pub threadpool_size: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            threadpool_size: DEFAULT_THREADPOOL_SIZE,
        }
    }
}

impl LoopConfig {
    /// Read `UV_THREADPOOL_SIZE` from the environment.
    pub fn from_env() -> Self {
        Self::from_threadpool_var(std::env::var("UV_THREADPOOL_SIZE").ok().as_deref())
    }

    fn from_threadpool_var(value: Option<&str>) -> Self {
        let threadpool_size = value
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .unwrap_or(DEFAULT_THREADPOOL_SIZE)
            .clamp(1, MAX_THREADPOOL_SIZE);
        Self { threadpool_size }
    }
}

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("failed to build I/O runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("event loop is closed")]
    Closed,
    #[error("handle does not exist")]
    InvalidHandle,
    #[error("handle belongs to another event loop")]
    ForeignHandle,
    #[error("expected a {expected} handle, found {found}")]
    WrongKind {
        expected: &'static str,
        found: HandleKind,
    },
    #[error("event loop still owns {open_handles} handles")]
    Busy { open_handles: usize },
    #[error("handle is already closing")]
    AlreadyClosing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Prepare,
    Check,
    Idle,
    Async,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Prepare => "prepare",
            Self::Check => "check",
            Self::Idle => "idle",
            Self::Async => "async",
        };
        f.write_str(name)
    }
}

/// Identifies a handle registered on one specific [`EventLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId {
    loop_id: u64,
    index: usize,
}

/// How long [`EventLoop::run`] keeps iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Until nothing keeps the loop alive or [`EventLoop::stop_loop`] is called.
    #[default]
    Default,
    /// One iteration, blocking in the poll if needed.
    Once,
    /// One iteration, never blocking.
    NoWait,
}

/// Iteration counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopStats {
    pub iterations: u64,
    /// Polls that waited for an event.
    pub blocking_polls: u64,
    /// Polls that only collected what was already ready.
    pub nonblocking_polls: u64,
    /// I/O completion callbacks dispatched.
    pub completions: u64,
}

pub type HandleCallback = Box<dyn FnMut(&mut EventLoop, HandleId)>;

/// Thread-safe trigger for an async handle.
///
/// Sends coalesce: several calls before the loop notices run the callback once.
#[derive(Debug, Clone)]
pub struct AsyncSignal {
    pending: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl AsyncSignal {
    pub fn send(&self) {
        self.pending.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}

struct HandleSlot {
    kind: HandleKind,
    active: bool,
    referenced: bool,
    closing: bool,
    callback: Option<HandleCallback>,
    pending: Option<Arc<AtomicBool>>,
}

impl HandleSlot {
    fn new(kind: HandleKind) -> Self {
        Self {
            kind,
            active: false,
            referenced: true,
            closing: false,
            callback: None,
            pending: None,
        }
    }

    fn keeps_alive(&self) -> bool {
        self.active && self.referenced && !self.closing
    }

    fn signal_pending(&self) -> bool {
        !self.closing
            && self
                .pending
                .as_ref()
                .is_some_and(|pending| pending.load(Ordering::Acquire))
    }
}

struct Completion {
    referenced: bool,
    callback: Box<dyn FnOnce(&mut EventLoop)>,
}

/// Sends exactly one [`Completion`] per request.
///
/// A request whose future panics or is dropped unfinished still releases
/// its in-flight count, with a callback that only logs.
struct CompletionGuard {
    sender: Option<mpsc::UnboundedSender<Completion>>,
    referenced: bool,
}

impl CompletionGuard {
    fn complete(mut self, callback: Box<dyn FnOnce(&mut EventLoop)>) {
        self.send(callback);
    }

    fn send(&mut self, callback: Box<dyn FnOnce(&mut EventLoop)>) {
        if let Some(sender) = self.sender.take() {
            // The receiver only goes away together with the LocalSet.
            let _ = sender.send(Completion {
                referenced: self.referenced,
                callback,
            });
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.send(Box::new(|_: &mut EventLoop| {
            warn!("I/O request ended without completing")
        }));
    }
}

/// A single-threaded reactor with observable iteration phases.
pub struct EventLoop {
    id: u64,
    runtime: Runtime,
    local: Option<LocalSet>,
    handles: Vec<Option<HandleSlot>>,
    closing: Vec<HandleId>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    wake: Arc<Notify>,
    in_flight: usize,
    stop_flag: bool,
    closed: bool,
    stats: LoopStats,
}

impl EventLoop {
    pub fn new(config: &LoopConfig) -> Result<Self, LoopError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .max_blocking_threads(config.threadpool_size.max(1))
            .thread_name("veil-blocking")
            .build()?;
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        debug!(loop_id = id, threadpool_size = config.threadpool_size, "event loop created");

        Ok(Self {
            id,
            runtime,
            local: Some(LocalSet::new()),
            handles: Vec::new(),
            closing: Vec::new(),
            completions_tx,
            completions_rx,
            wake: Arc::new(Notify::new()),
            in_flight: 0,
            stop_flag: false,
            closed: false,
            stats: LoopStats::default(),
        })
    }

    pub fn add_prepare(&mut self) -> Result<HandleId, LoopError> {
        self.insert(HandleSlot::new(HandleKind::Prepare))
    }

    pub fn add_check(&mut self) -> Result<HandleId, LoopError> {
        self.insert(HandleSlot::new(HandleKind::Check))
    }

    pub fn add_idle(&mut self) -> Result<HandleId, LoopError> {
        self.insert(HandleSlot::new(HandleKind::Idle))
    }

    /// Register an async handle. It is active and referenced immediately.
    pub fn add_async<F>(&mut self, callback: F) -> Result<(HandleId, AsyncSignal), LoopError>
    where
        F: FnMut(&mut EventLoop, HandleId) + 'static,
    {
        let pending = Arc::new(AtomicBool::new(false));
        let mut slot = HandleSlot::new(HandleKind::Async);
        slot.active = true;
        slot.callback = Some(Box::new(callback));
        slot.pending = Some(pending.clone());
        let id = self.insert(slot)?;

        let signal = AsyncSignal {
            pending,
            wake: self.wake.clone(),
        };
        Ok((id, signal))
    }

    /// Activate a prepare, check or idle handle. No-op when already active.
    pub fn start<F>(&mut self, id: HandleId, callback: F) -> Result<(), LoopError>
    where
        F: FnMut(&mut EventLoop, HandleId) + 'static,
    {
        let slot = self.startable(id)?;
        if slot.active {
            return Ok(());
        }
        slot.active = true;
        slot.callback = Some(Box::new(callback));
        Ok(())
    }

    pub fn stop(&mut self, id: HandleId) -> Result<(), LoopError> {
        self.startable(id)?.active = false;
        Ok(())
    }

    pub fn ref_handle(&mut self, id: HandleId) -> Result<(), LoopError> {
        self.slot_mut(id)?.referenced = true;
        Ok(())
    }

    pub fn unref_handle(&mut self, id: HandleId) -> Result<(), LoopError> {
        self.slot_mut(id)?.referenced = false;
        Ok(())
    }

    /// Deactivate the handle and release it at the end of the current or next iteration.
    pub fn close_handle(&mut self, id: HandleId) -> Result<(), LoopError> {
        let slot = self.slot_mut(id)?;
        if slot.closing {
            return Err(LoopError::AlreadyClosing);
        }
        slot.closing = true;
        slot.active = false;
        slot.callback = None;
        self.closing.push(id);
        trace!(index = id.index, "handle closing");
        Ok(())
    }

    pub fn is_active(&self, id: HandleId) -> bool {
        self.slot(id).is_some_and(|slot| slot.active && !slot.closing)
    }

    /// `true` until [`close_handle`](Self::close_handle) is called.
    pub fn is_open(&self, id: HandleId) -> bool {
        self.slot(id).is_some_and(|slot| !slot.closing)
    }

    pub fn is_closing(&self, id: HandleId) -> bool {
        self.slot(id).is_some_and(|slot| slot.closing)
    }

    /// Make the current [`run`](Self::run) return after this iteration.
    pub fn stop_loop(&mut self) {
        self.stop_flag = true;
    }

    /// Whether anything referenced would keep [`run`](Self::run) iterating.
    pub fn is_alive(&self) -> bool {
        self.in_flight > 0
            || !self.closing.is_empty()
            || self.handles.iter().flatten().any(HandleSlot::keeps_alive)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Referenced I/O requests whose completion has not been dispatched yet.
    pub fn pending_requests(&self) -> usize {
        self.in_flight
    }

    /// Run a future on the loop and deliver its output during a poll phase.
    ///
    /// `make` is called inside the runtime, so the future may register
    /// timers or sockets when it is built. The request keeps the loop alive
    /// until `on_complete` has run.
    pub fn spawn_io<M, F, C>(&mut self, make: M, on_complete: C) -> Result<(), LoopError>
    where
        M: FnOnce() -> F + 'static,
        F: Future + 'static,
        F::Output: 'static,
        C: FnOnce(&mut EventLoop, F::Output) + 'static,
    {
        self.submit(true, make, on_complete)
    }

    /// Like [`spawn_io`](Self::spawn_io), without keeping the loop alive.
    pub fn spawn_io_unref<M, F, C>(&mut self, make: M, on_complete: C) -> Result<(), LoopError>
    where
        M: FnOnce() -> F + 'static,
        F: Future + 'static,
        F::Output: 'static,
        C: FnOnce(&mut EventLoop, F::Output) + 'static,
    {
        self.submit(false, make, on_complete)
    }

    pub fn set_timeout<C>(&mut self, delay: Duration, on_timeout: C) -> Result<(), LoopError>
    where
        C: FnOnce(&mut EventLoop) + 'static,
    {
        self.spawn_io(
            move || tokio::time::sleep(delay),
            move |lp, ()| on_timeout(lp),
        )
    }

    /// Run blocking `work` on the thread pool and deliver its result on the loop.
    pub fn queue_work<W, T, C>(&mut self, work: W, on_complete: C) -> Result<(), LoopError>
    where
        W: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
        C: FnOnce(&mut EventLoop, Result<T, JoinError>) + 'static,
    {
        self.spawn_io(move || tokio::task::spawn_blocking(work), on_complete)
    }

    /// Iterate according to `mode`. Returns whether the loop is still alive.
    pub fn run(&mut self, mode: RunMode) -> Result<bool, LoopError> {
        if self.closed {
            return Err(LoopError::Closed);
        }

        let mut alive = self.is_alive();
        while alive && !self.stop_flag {
            self.stats.iterations += 1;
            trace!(iteration = self.stats.iterations, "loop iteration");

            self.run_phase(HandleKind::Idle);
            self.run_phase(HandleKind::Prepare);
            let block = mode != RunMode::NoWait && !self.must_not_block();
            self.poll_io(block);
            self.run_phase(HandleKind::Check);
            self.flush_closing();

            alive = self.is_alive();
            if mode != RunMode::Default {
                break;
            }
        }

        self.stop_flag = false;
        Ok(alive)
    }

    /// Release the runtime side of the loop. Fails while any handle exists.
    ///
    /// In-flight I/O is cancelled and its callbacks never run.
    pub fn close_loop(&mut self) -> Result<(), LoopError> {
        if self.closed {
            return Err(LoopError::Closed);
        }
        let open_handles = self.handles.iter().flatten().count();
        if open_handles > 0 {
            return Err(LoopError::Busy { open_handles });
        }

        self.cancel_in_flight();
        while self.completions_rx.try_recv().is_ok() {}
        self.in_flight = 0;
        self.closed = true;
        debug!(loop_id = self.id, stats = ?self.stats, "event loop closed");
        Ok(())
    }

    fn insert(&mut self, slot: HandleSlot) -> Result<HandleId, LoopError> {
        if self.closed {
            return Err(LoopError::Closed);
        }
        let id = HandleId {
            loop_id: self.id,
            index: self.handles.len(),
        };
        trace!(kind = %slot.kind, index = id.index, "handle registered");
        self.handles.push(Some(slot));
        Ok(id)
    }

    fn slot(&self, id: HandleId) -> Option<&HandleSlot> {
        if id.loop_id != self.id {
            return None;
        }
        self.handles.get(id.index).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, id: HandleId) -> Result<&mut HandleSlot, LoopError> {
        if self.closed {
            return Err(LoopError::Closed);
        }
        if id.loop_id != self.id {
            return Err(LoopError::ForeignHandle);
        }
        self.handles
            .get_mut(id.index)
            .and_then(Option::as_mut)
            .ok_or(LoopError::InvalidHandle)
    }

    fn startable(&mut self, id: HandleId) -> Result<&mut HandleSlot, LoopError> {
        let slot = self.slot_mut(id)?;
        if slot.kind == HandleKind::Async {
            return Err(LoopError::WrongKind {
                expected: "prepare, check or idle",
                found: slot.kind,
            });
        }
        if slot.closing {
            return Err(LoopError::AlreadyClosing);
        }
        Ok(slot)
    }

    fn must_not_block(&self) -> bool {
        self.stop_flag
            || !self.closing.is_empty()
            || !self.is_alive()
            || self.handles.iter().flatten().any(|slot| {
                (slot.kind == HandleKind::Idle && slot.active && !slot.closing)
                    || slot.signal_pending()
            })
    }

    fn run_phase(&mut self, kind: HandleKind) {
        let due: Vec<HandleId> = self
            .handles
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Some(slot) if slot.kind == kind && slot.active && !slot.closing => Some(HandleId {
                    loop_id: self.id,
                    index,
                }),
                _ => None,
            })
            .collect();

        for id in due {
            // An earlier callback in this phase may have stopped or closed it.
            if self.is_active(id) {
                self.invoke(id);
            }
        }
    }

    fn invoke(&mut self, id: HandleId) {
        let Some(mut callback) = self
            .handles
            .get_mut(id.index)
            .and_then(Option::as_mut)
            .and_then(|slot| slot.callback.take())
        else {
            return;
        };

        callback(self, id);

        if let Some(Some(slot)) = self.handles.get_mut(id.index) {
            if slot.callback.is_none() && !slot.closing {
                slot.callback = Some(callback);
            }
        }
    }

    fn poll_io(&mut self, block: bool) {
        let first = if block {
            self.stats.blocking_polls += 1;
            self.wait_for_event()
        } else {
            self.stats.nonblocking_polls += 1;
            self.turn_runtime();
            None
        };

        if let Some(completion) = first {
            self.dispatch(completion);
        }
        while let Ok(completion) = self.completions_rx.try_recv() {
            self.dispatch(completion);
        }
        self.dispatch_signals();
    }

    /// Drive the runtime until a completion or an async signal arrives.
    fn wait_for_event(&mut self) -> Option<Completion> {
        let local = self.local.as_ref()?;
        let completions = &mut self.completions_rx;
        let wake = &self.wake;
        self.runtime.block_on(local.run_until(async {
            tokio::select! {
                completion = completions.recv() => completion,
                () = wake.notified() => None,
            }
        }))
    }

    /// Let ready tasks and the I/O driver make progress without parking.
    fn turn_runtime(&mut self) {
        if let Some(local) = self.local.as_ref() {
            self.runtime
                .block_on(local.run_until(tokio::task::yield_now()));
        }
    }

    fn dispatch(&mut self, completion: Completion) {
        if completion.referenced {
            self.in_flight = self.in_flight.saturating_sub(1);
        }
        self.stats.completions += 1;
        (completion.callback)(self);
    }

    fn dispatch_signals(&mut self) {
        for index in 0..self.handles.len() {
            let fired = match &self.handles[index] {
                Some(slot) if !slot.closing => slot
                    .pending
                    .as_ref()
                    .is_some_and(|pending| pending.swap(false, Ordering::AcqRel)),
                _ => false,
            };
            if fired {
                self.invoke(HandleId {
                    loop_id: self.id,
                    index,
                });
            }
        }
    }

    fn flush_closing(&mut self) {
        for id in mem::take(&mut self.closing) {
            if let Some(slot) = self.handles.get_mut(id.index) {
                *slot = None;
            }
            trace!(index = id.index, "handle closed");
        }
    }

    fn submit<M, F, C>(
        &mut self,
        referenced: bool,
        make: M,
        on_complete: C,
    ) -> Result<(), LoopError>
    where
        M: FnOnce() -> F + 'static,
        F: Future + 'static,
        F::Output: 'static,
        C: FnOnce(&mut EventLoop, F::Output) + 'static,
    {
        let local = self.local.as_ref().ok_or(LoopError::Closed)?;
        let guard = CompletionGuard {
            sender: Some(self.completions_tx.clone()),
            referenced,
        };
        let _context = self.runtime.enter();
        local.spawn_local(async move {
            let output = make().await;
            guard.complete(Box::new(move |lp: &mut EventLoop| on_complete(lp, output)));
        });

        if referenced {
            self.in_flight += 1;
        }
        Ok(())
    }

    fn cancel_in_flight(&mut self) {
        if let Some(local) = self.local.take() {
            let _context = self.runtime.enter();
            drop(local);
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.cancel_in_flight();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::thread;

    fn new_loop() -> EventLoop {
        EventLoop::new(&LoopConfig::default()).unwrap()
    }

    #[test]
    fn test_threadpool_size_from_env_value() {
        assert_eq!(LoopConfig::from_threadpool_var(None).threadpool_size, 4);
        assert_eq!(LoopConfig::from_threadpool_var(Some("16")).threadpool_size, 16);
        assert_eq!(LoopConfig::from_threadpool_var(Some("0")).threadpool_size, 1);
        assert_eq!(LoopConfig::from_threadpool_var(Some("99999")).threadpool_size, 1024);
        assert_eq!(LoopConfig::from_threadpool_var(Some("many")).threadpool_size, 4);
    }

    #[test]
    fn test_empty_loop_returns_immediately() {
        let mut lp = new_loop();
        assert!(!lp.run(RunMode::Default).unwrap());
        assert_eq!(lp.stats().iterations, 0);
    }

    #[test]
    fn test_timeout_keeps_loop_alive_until_it_fires() {
        let mut lp = new_loop();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        lp.set_timeout(Duration::from_millis(5), move |_| flag.set(true))
            .unwrap();
        assert_eq!(lp.pending_requests(), 1);

        assert!(!lp.run(RunMode::Default).unwrap());
        assert!(fired.get());
        assert_eq!(lp.pending_requests(), 0);
        assert!(lp.stats().blocking_polls >= 1);
        assert_eq!(lp.stats().completions, 1);
    }

    #[test]
    fn test_phase_order_around_io() {
        let mut lp = new_loop();
        let log = Rc::new(RefCell::new(Vec::new()));

        let prepare = lp.add_prepare().unwrap();
        let check = lp.add_check().unwrap();
        lp.unref_handle(prepare).unwrap();
        lp.unref_handle(check).unwrap();

        let l = log.clone();
        lp.start(prepare, move |_, _| l.borrow_mut().push("prepare"))
            .unwrap();
        let l = log.clone();
        lp.start(check, move |_, _| l.borrow_mut().push("check"))
            .unwrap();
        let l = log.clone();
        lp.set_timeout(Duration::from_millis(1), move |_| l.borrow_mut().push("io"))
            .unwrap();

        lp.run(RunMode::Default).unwrap();

        let log = log.borrow();
        let io = log.iter().position(|entry| *entry == "io").unwrap();
        assert_eq!(log[io - 1], "prepare");
        assert_eq!(log[io + 1], "check");
    }

    #[test]
    fn test_unreferenced_handles_do_not_keep_loop_alive() {
        let mut lp = new_loop();
        let prepare = lp.add_prepare().unwrap();
        lp.unref_handle(prepare).unwrap();
        lp.start(prepare, |_, _| {}).unwrap();
        assert!(!lp.is_alive());
        assert!(!lp.run(RunMode::Default).unwrap());
    }

    #[test]
    fn test_active_idle_never_blocks() {
        let mut lp = new_loop();
        let idle = lp.add_idle().unwrap();
        let ticks = Rc::new(Cell::new(0));
        let t = ticks.clone();
        lp.start(idle, move |lp, id| {
            t.set(t.get() + 1);
            if t.get() == 3 {
                lp.stop(id).unwrap();
            }
        })
        .unwrap();

        assert!(!lp.run(RunMode::Default).unwrap());
        assert_eq!(ticks.get(), 3);
        assert_eq!(lp.stats().blocking_polls, 0);
        assert_eq!(lp.stats().nonblocking_polls, 3);
    }

    #[test]
    fn test_start_is_noop_when_active() {
        let mut lp = new_loop();
        let idle = lp.add_idle().unwrap();
        let first = Rc::new(Cell::new(0));
        let f = first.clone();
        lp.start(idle, move |lp, id| {
            f.set(f.get() + 1);
            lp.stop(id).unwrap();
        })
        .unwrap();
        lp.start(idle, |_, _| panic!("replaced callback ran")).unwrap();

        lp.run(RunMode::Default).unwrap();
        assert_eq!(first.get(), 1);
    }

    #[test]
    fn test_stop_loop_ends_run_and_resets() {
        let mut lp = new_loop();
        let idle = lp.add_idle().unwrap();
        lp.start(idle, |lp, _| lp.stop_loop()).unwrap();

        assert!(lp.run(RunMode::Default).unwrap());
        assert_eq!(lp.stats().iterations, 1);
        assert!(lp.run(RunMode::Once).unwrap());
        assert_eq!(lp.stats().iterations, 2);
    }

    #[test]
    fn test_async_signal_from_another_thread() {
        let mut lp = new_loop();
        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        let (_, signal) = lp
            .add_async(move |lp, id| {
                f.set(f.get() + 1);
                lp.close_handle(id).unwrap();
            })
            .unwrap();

        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signal.send();
            signal.send();
        });

        assert!(!lp.run(RunMode::Default).unwrap());
        sender.join().unwrap();
        assert_eq!(fired.get(), 1);
        assert!(lp.stats().blocking_polls >= 1);
    }

    #[test]
    fn test_async_handle_cannot_be_started() {
        let mut lp = new_loop();
        let (id, _) = lp.add_async(|_, _| {}).unwrap();
        assert!(matches!(
            lp.start(id, |_, _| {}),
            Err(LoopError::WrongKind {
                found: HandleKind::Async,
                ..
            })
        ));
    }

    #[test]
    fn test_foreign_handle_rejected() {
        let mut a = new_loop();
        let mut b = new_loop();
        let id = a.add_idle().unwrap();
        assert!(matches!(b.close_handle(id), Err(LoopError::ForeignHandle)));
        assert!(!b.is_open(id));
    }

    #[test]
    fn test_close_handle_lifecycle() {
        let mut lp = new_loop();
        let check = lp.add_check().unwrap();
        assert!(lp.is_open(check));

        lp.close_handle(check).unwrap();
        assert!(lp.is_closing(check));
        assert!(!lp.is_open(check));
        assert!(matches!(lp.close_handle(check), Err(LoopError::AlreadyClosing)));

        lp.run(RunMode::NoWait).unwrap();
        assert!(!lp.is_closing(check));
        assert!(matches!(lp.close_handle(check), Err(LoopError::InvalidHandle)));
    }

    #[test]
    fn test_close_loop_requires_no_handles() {
        let mut lp = new_loop();
        let idle = lp.add_idle().unwrap();
        assert!(matches!(
            lp.close_loop(),
            Err(LoopError::Busy { open_handles: 1 })
        ));

        lp.close_handle(idle).unwrap();
        assert!(matches!(lp.close_loop(), Err(LoopError::Busy { .. })));
        lp.run(RunMode::NoWait).unwrap();

        lp.close_loop().unwrap();
        assert!(lp.is_closed());
        assert!(matches!(lp.run(RunMode::Default), Err(LoopError::Closed)));
        assert!(matches!(lp.add_idle(), Err(LoopError::Closed)));
    }

    #[test]
    fn test_close_loop_cancels_in_flight_io() {
        let mut lp = new_loop();
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        lp.set_timeout(Duration::from_secs(60), move |_| f.set(true))
            .unwrap();

        lp.close_loop().unwrap();
        assert!(!fired.get());
        assert_eq!(lp.pending_requests(), 0);
    }

    #[test]
    fn test_panicking_io_still_releases_request() {
        let mut lp = new_loop();
        lp.spawn_io(
            || async {
                panic!("read failed");
            },
            |_, ()| panic!("completion ran for a failed request"),
        )
        .unwrap();
        assert_eq!(lp.pending_requests(), 1);

        assert!(!lp.run(RunMode::Default).unwrap());
        assert_eq!(lp.pending_requests(), 0);
        assert_eq!(lp.stats().completions, 1);
    }

    #[test]
    fn test_queue_work_delivers_on_loop_thread() {
        let mut lp = new_loop();
        let result = Rc::new(Cell::new(0));
        let r = result.clone();
        lp.queue_work(|| (1..=10).sum::<u32>(), move |_, sum| r.set(sum.unwrap()))
            .unwrap();

        lp.run(RunMode::Default).unwrap();
        assert_eq!(result.get(), 55);
    }

    #[test]
    fn test_unreferenced_io_does_not_keep_loop_alive() {
        let mut lp = new_loop();
        lp.spawn_io_unref(
            || tokio::time::sleep(Duration::from_secs(60)),
            |_, ()| panic!("unreferenced timer fired"),
        )
        .unwrap();
        assert!(!lp.is_alive());
        assert!(!lp.run(RunMode::Default).unwrap());
    }
}
