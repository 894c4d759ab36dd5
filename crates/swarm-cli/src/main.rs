//! claude-swarm - CLI for the peer-agent coordination substrate
//!
//! A thin wrapper over `claude-swarm-core`: discover peer agents, manage
//! file locks, and watch coordination traffic. All shared state lives as
//! JSON/Markdown files under the project root; this binary has no daemon
//! and no persistent process beyond `start-monitoring`'s poll loop.

use clap::Parser;

mod commands;
mod util;

use commands::Cli;

fn main() {
    claude_swarm_core::logging::init();

    let cli = Cli::parse();

    if let Err(e) = cli.execute() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
