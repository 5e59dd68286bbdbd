//! Scheduling properties of the event loop coordinator, checked against a
//! fake task queue so every drain is observable.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use veil_core::engine::{DrainErrorPolicy, EngineLifecycleManager, JobError, JobQueueEngine};
use veil_core::{DrainOutcome, EventLoopCoordinator, LoopConfig, TaskQueue};

#[derive(Default)]
struct FakeState {
    pending: Cell<usize>,
    drains: RefCell<Vec<usize>>,
    log: RefCell<Vec<String>>,
}

/// Queue of anonymous units; draining just counts them.
#[derive(Clone, Default)]
struct FakeQueue {
    state: Rc<FakeState>,
}

impl FakeQueue {
    fn push(&self, units: usize) {
        self.state.pending.set(self.state.pending.get() + units);
    }

    fn drains(&self) -> Vec<usize> {
        self.state.drains.borrow().clone()
    }

    fn record(&self, entry: impl Into<String>) {
        self.state.log.borrow_mut().push(entry.into());
    }

    fn log(&self) -> Vec<String> {
        self.state.log.borrow().clone()
    }
}

impl TaskQueue for FakeQueue {
    fn has_pending_work(&self) -> bool {
        self.state.pending.get() > 0
    }

    fn drain_pending_work(&self) -> DrainOutcome {
        let units = self.state.pending.replace(0);
        self.state.drains.borrow_mut().push(units);
        self.record(format!("drain:{units}"));
        DrainOutcome::Drained { units }
    }
}

fn coordinator(queue: &FakeQueue) -> EventLoopCoordinator<FakeQueue> {
    EventLoopCoordinator::start(&LoopConfig::default(), queue.clone())
}

#[test]
fn test_queued_units_drain_in_first_iteration() {
    let queue = FakeQueue::default();
    queue.push(3);

    let mut coordinator = coordinator(&queue);
    coordinator.run();

    assert_eq!(queue.drains(), vec![3]);
    assert!(!queue.has_pending_work());
    assert!(!coordinator.forced_wake_armed());

    let stats = coordinator.event_loop().stats();
    assert_eq!(stats.iterations, 1);
    assert_eq!(stats.blocking_polls, 0);
    assert_eq!(stats.nonblocking_polls, 1);
}

#[test]
fn test_idle_loop_blocks_instead_of_spinning() {
    let queue = FakeQueue::default();
    let mut coordinator = coordinator(&queue);
    coordinator
        .event_loop_mut()
        .set_timeout(Duration::from_millis(100), |_| {})
        .unwrap();

    let started = Instant::now();
    coordinator.run();

    assert!(started.elapsed() >= Duration::from_millis(100));
    let stats = coordinator.event_loop().stats();
    assert!(stats.iterations <= 2, "loop spun {} times", stats.iterations);
    assert_eq!(stats.blocking_polls, stats.iterations);
}

#[test]
fn test_pending_work_drains_before_blocking_on_io() {
    let queue = FakeQueue::default();
    queue.push(2);

    let mut coordinator = coordinator(&queue);
    let q = queue.clone();
    coordinator
        .event_loop_mut()
        .set_timeout(Duration::from_millis(50), move |_| q.record("timer"))
        .unwrap();
    coordinator.run();

    assert_eq!(queue.log(), vec!["drain:2", "timer", "drain:0"]);
    let stats = coordinator.event_loop().stats();
    assert_eq!(stats.nonblocking_polls, 1);
    assert_eq!(stats.blocking_polls, 1);
}

#[test]
fn test_io_callback_work_drains_in_same_iteration() {
    let queue = FakeQueue::default();
    let mut coordinator = coordinator(&queue);

    let lp = coordinator.event_loop_mut();
    let prepare = lp.add_prepare().unwrap();
    lp.unref_handle(prepare).unwrap();
    let q = queue.clone();
    lp.start(prepare, move |_, _| q.record("prepare")).unwrap();
    let q = queue.clone();
    lp.set_timeout(Duration::from_millis(5), move |_| {
        q.record("io");
        q.push(1);
    })
    .unwrap();

    coordinator.run();

    assert_eq!(queue.log(), vec!["prepare", "io", "drain:1"]);
    assert_eq!(coordinator.event_loop().stats().iterations, 1);

    coordinator.event_loop_mut().close_handle(prepare).unwrap();
    coordinator.stop();
}

#[test]
fn test_work_queued_after_drain_skips_blocking_poll() {
    let queue = FakeQueue::default();
    let mut coordinator = coordinator(&queue);
    let signal = coordinator.stop_signal();

    let lp = coordinator.event_loop_mut();
    lp.set_timeout(Duration::from_millis(5), |_| {}).unwrap();
    lp.set_timeout(Duration::from_secs(30), |_| {}).unwrap();
    // Registered after the coordinator, so it runs after the post-poll drain.
    let check = lp.add_check().unwrap();
    lp.unref_handle(check).unwrap();
    let calls = Cell::new(0);
    let q = queue.clone();
    lp.start(check, move |lp, id| {
        calls.set(calls.get() + 1);
        if calls.get() == 1 {
            q.push(1);
            q.record("pushed");
        } else {
            q.record("stop");
            lp.stop(id).unwrap();
            signal.send();
        }
    })
    .unwrap();

    let started = Instant::now();
    coordinator.run();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(queue.log(), vec!["drain:0", "pushed", "drain:1", "stop"]);
    let stats = coordinator.event_loop().stats();
    assert_eq!(stats.blocking_polls, 1);
    assert_eq!(stats.nonblocking_polls, 2);

    coordinator.event_loop_mut().close_handle(check).unwrap();
    coordinator.stop();
}

#[test]
fn test_stop_is_idempotent() {
    let queue = FakeQueue::default();
    let mut coordinator = coordinator(&queue);
    coordinator.run();

    coordinator.stop();
    assert!(!coordinator.is_enabled());
    assert!(coordinator.event_loop().is_closed());

    coordinator.stop();
    assert!(!coordinator.is_enabled());
    assert!(!coordinator.forced_wake_armed());
}

#[test]
fn test_stop_without_run() {
    let queue = FakeQueue::default();
    queue.push(1);
    let mut coordinator = coordinator(&queue);
    coordinator.stop();

    assert!(coordinator.event_loop().is_closed());
    assert!(queue.drains().is_empty());
}

#[test]
fn test_stop_signal_from_another_thread_ends_run() {
    let queue = FakeQueue::default();
    let mut coordinator = coordinator(&queue);
    let fired = Rc::new(Cell::new(false));
    let f = fired.clone();
    coordinator
        .event_loop_mut()
        .set_timeout(Duration::from_secs(30), move |_| f.set(true))
        .unwrap();

    let signal = coordinator.stop_signal();
    let sender = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        signal.send();
    });

    let started = Instant::now();
    coordinator.run();
    sender.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!fired.get());
    assert!(!coordinator.forced_wake_armed());

    coordinator.stop();
    assert!(coordinator.event_loop().is_closed());
    assert!(!fired.get());
}

#[test]
fn test_failed_unit_resumes_next_iteration() {
    let mut manager = EngineLifecycleManager::<JobQueueEngine>::new(DrainErrorPolicy::Log);
    manager.create();
    let jobs = manager.with_engine(|engine| engine.queue()).unwrap();
    jobs.enqueue(|_| Ok(()));
    jobs.enqueue(|_| Err(JobError::new("rejected")));
    jobs.enqueue(|_| Ok(()));

    let mut coordinator =
        EventLoopCoordinator::start(&LoopConfig::default(), manager.bridge().unwrap());
    coordinator.run();

    assert!(!manager.has_pending_work());
    assert_eq!(manager.with_engine(|engine| engine.executed()), Some(3));
    assert_eq!(coordinator.event_loop().stats().iterations, 2);

    coordinator.stop();
    manager.destroy();
}
