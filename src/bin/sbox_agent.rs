//! Thin re-exec entrypoint. A real host agent links the `sbox-exec` library
//! directly and drives `Executor`; this binary exists only so the crate has
//! something `current_exe()` can point at and `LaunchPlan` can re-invoke as
//! the Shim.

use sbox_exec::shim;

fn main() {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some(subcommand) if subcommand == shim::SUBCOMMAND => {
            shim::run(&args[2..]);
        }
        _ => {
            eprintln!(
                "usage: {} {} <defaults-bool> <path-spec>... -- <command> <args>...",
                args.first().map(String::as_str).unwrap_or("sbox-agent"),
                shim::SUBCOMMAND
            );
            std::process::exit(shim::EXIT_FAILURE);
        }
    }
}
