//! CLI command implementations

pub mod schedule;
pub mod snapshot;
pub mod stats;
pub mod system;
pub mod vm;

use colored::Colorize;
use qvm_core::VmState;

/// Print a success line for a command that only returns a message.
pub fn done(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Colour a VM state the way `ls` and `inspect` show it.
pub fn paint_state(state: VmState) -> String {
    let label = state.as_str();
    match state {
        VmState::Running => label.green().to_string(),
        VmState::Paused | VmState::PmSuspended | VmState::Blocked => label.yellow().to_string(),
        VmState::Crashed => label.red().bold().to_string(),
        VmState::Shutoff | VmState::Shutdown => label.red().to_string(),
        VmState::NoState => label.to_string(),
    }
}
