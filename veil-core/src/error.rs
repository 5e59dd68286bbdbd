//! Fatal Error Handling
//!
//! The host distinguishes two tiers of failure. Recoverable conditions travel
//! as typed `Result`s (`EngineError`, `LoopError`, `HostError`, ...). Broken
//! embedding invariants, such as an event loop primitive refusing a handle it
//! was constructed to accept, end the process here.
//!
//! Every abort in the crate goes through [`fail_fast`] so the policy can be
//! changed in one place.

use std::fmt::Display;
use std::panic::Location;
use tracing::error;

/// Abort the process with a `file@line: message` diagnostic.
///
/// The reported location is the caller's, not this function's.
#[track_caller]
pub fn fail_fast(reason: impl Display) -> ! {
    let location = Location::caller();
    error!(
        file = location.file(),
        line = location.line(),
        "fatal: {}",
        reason
    );
    eprintln!("{}@{}: {}", location.file(), location.line(), reason);
    std::process::abort();
}

/// Unwrap a primitive's result, aborting through [`fail_fast`] on error.
#[track_caller]
pub fn check_ok<T, E: Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => fail_fast(err),
    }
}
