//! Veil - Script Runtime Host
//!
//! Parses the command line, runs the script's event loop to completion and
//! exits with the host's exit code.

use veil_core::runtime::{self, HostSettings};
use veil_core::{init_tracing, platform, JobQueueEngine};

fn main() {
    if let Err(err) = init_tracing() {
        eprintln!("veil: failed to initialize logging: {err:#}");
    }
    if let Err(err) = platform::prepare_process() {
        eprintln!("veil: {err:#}");
    }

    let code = runtime::main::<JobQueueEngine, _, _>(std::env::args_os(), HostSettings::from_env());
    std::process::exit(code);
}
