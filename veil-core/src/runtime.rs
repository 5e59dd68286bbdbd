//! Runtime Host - Composition Root
//!
//! Owns the engine lifecycle manager and the event loop coordinator, and
//! sequences them:
//!
//! ```text
//! initialize: engine create -> bootstrap -> coordinator start
//! run:        coordinator run -> coordinator stop -> engine destroy
//! ```

use crate::cli::{self, ParseOutcome};
use crate::config::Configuration;
use crate::coordinator::EventLoopCoordinator;
use crate::engine::{
    DrainErrorPolicy, EngineError, EngineLifecycleManager, ScriptEngine, TaskQueueBridge,
};
use crate::error::{check_ok, fail_fast};
use crate::event_loop::{AsyncSignal, EventLoop, LoopConfig};
use std::ffi::OsString;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Uninitialized,
    Initialized,
    Running,
    ShuttingDown,
    Closed,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::ShuttingDown => "shutting down",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("cannot {operation} a runtime host that is {state}")]
    InvalidState {
        operation: &'static str,
        state: HostState,
    },
    #[error(transparent)]
    Bootstrap(#[from] EngineError),
}

/// Process-level knobs that are not part of the script [`Configuration`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HostSettings {
    pub loop_config: LoopConfig,
    pub drain_error_policy: DrainErrorPolicy,
    /// Stop the loop on Ctrl-C.
    pub handle_interrupt: bool,
}

impl HostSettings {
    /// Settings for the `veil` binary.
    pub fn from_env() -> Self {
        Self {
            loop_config: LoopConfig::from_env(),
            drain_error_policy: DrainErrorPolicy::default(),
            handle_interrupt: true,
        }
    }
}

/// One engine, one event loop, one run.
pub struct RuntimeHost<E: ScriptEngine> {
    settings: HostSettings,
    state: HostState,
    engine: EngineLifecycleManager<E>,
    coordinator: Option<EventLoopCoordinator<TaskQueueBridge<E>>>,
}

impl<E: ScriptEngine> RuntimeHost<E> {
    pub fn new(settings: HostSettings) -> Self {
        Self {
            settings,
            state: HostState::Uninitialized,
            engine: EngineLifecycleManager::new(settings.drain_error_policy),
            coordinator: None,
        }
    }

    /// Create and bootstrap the engine, then start the coordinator over it.
    ///
    /// A bootstrap failure destroys the engine and leaves the host closed.
    pub fn initialize(&mut self, config: &Configuration) -> Result<(), HostError> {
        self.expect_state("initialize", HostState::Uninitialized)?;

        self.engine.create();
        if let Err(err) = self.engine.bootstrap(config) {
            self.engine.destroy();
            self.state = HostState::Closed;
            return Err(err.into());
        }

        let Some(bridge) = self.engine.bridge() else {
            fail_fast("script engine missing after create");
        };
        let mut coordinator = EventLoopCoordinator::start(&self.settings.loop_config, bridge);
        if self.settings.handle_interrupt {
            coordinator.stop_on_interrupt();
        }
        self.coordinator = Some(coordinator);
        self.state = HostState::Initialized;

        info!(script = %config.script.source, "runtime host initialized");
        Ok(())
    }

    /// Run the loop to completion, then tear everything down. Returns the exit code.
    pub fn run(&mut self) -> Result<i32, HostError> {
        self.expect_state("run", HostState::Initialized)?;

        self.state = HostState::Running;
        if let Some(coordinator) = self.coordinator.as_mut() {
            coordinator.run();
        }

        self.state = HostState::ShuttingDown;
        self.teardown();
        Ok(0)
    }

    /// Stop the coordinator, then destroy the engine. Safe from any state.
    pub fn shutdown(&mut self) {
        if self.state == HostState::Closed {
            return;
        }
        self.state = HostState::ShuttingDown;
        self.teardown();
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    /// Cross-thread trigger that makes a running host return from [`run`](Self::run).
    pub fn stop_signal(&self) -> Option<AsyncSignal> {
        self.coordinator.as_ref().map(EventLoopCoordinator::stop_signal)
    }

    /// The coordinated loop, for registering I/O before [`run`](Self::run).
    pub fn event_loop_mut(&mut self) -> Option<&mut EventLoop> {
        self.coordinator
            .as_mut()
            .map(EventLoopCoordinator::event_loop_mut)
    }

    pub fn engine(&self) -> &EngineLifecycleManager<E> {
        &self.engine
    }

    fn expect_state(&self, operation: &'static str, expected: HostState) -> Result<(), HostError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(HostError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn teardown(&mut self) {
        if let Some(mut coordinator) = self.coordinator.take() {
            coordinator.stop();
        }
        self.engine.destroy();
        self.state = HostState::Closed;
        debug!("runtime host closed");
    }
}

impl<E: ScriptEngine> Drop for RuntimeHost<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Parse `args`, then initialize and run a host. Returns the process exit code.
///
/// Help, version and argument errors return before any engine or loop exists.
pub fn main<E, I, T>(args: I, settings: HostSettings) -> i32
where
    E: ScriptEngine,
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let config = match cli::parse_args(args) {
        ParseOutcome::Run(config) => config,
        ParseOutcome::Exit(code) => return code,
    };

    let mut host = RuntimeHost::<E>::new(settings);
    check_ok(host.initialize(&config));
    check_ok(host.run())
}
