//! Command implementations.

mod crash;
mod preview;

use crate::cli::{Cli, Commands};

/// Dispatch CLI command to the appropriate handler.
pub fn run_command(cli: &Cli) -> i32 {
    match &cli.command {
        Commands::Preview {
            dir,
            snapshot,
            idle_cpu,
            no_guest,
        } => preview::cmd_preview(dir, (*snapshot).into(), *idle_cpu, *no_guest),
        Commands::Crash {
            dir,
            snapshot,
            termination,
            forced_if_loaded,
        } => crash::cmd_crash(
            dir,
            (*snapshot).into(),
            termination.policy(forced_if_loaded),
        ),
    }
}
