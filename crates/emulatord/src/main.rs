//! Entrypoint for the `pubsub-emulator` supervisor binary.
//!
//! Delegates to [`emulatord::run`], which loads configuration, starts the
//! emulator, prints its address, and stops it again on a termination signal.

use std::io;
use std::process::ExitCode;

fn main() -> ExitCode {
    // Unlocked handles: monitor threads log to stderr while the run blocks.
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    emulatord::run(std::env::args_os(), &mut stdout, &mut stderr)
}
