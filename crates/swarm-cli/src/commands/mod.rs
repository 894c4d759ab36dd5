//! CLI command dispatch and execution

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod discover;
mod list_agents;
mod locks;
mod monitor;

/// claude-swarm - coordination substrate for peer Claude Code agents
#[derive(Parser, Debug)]
#[command(
    name = "claude-swarm",
    version,
    about = "Coordination substrate for peer Claude Code agents",
    long_about = "Discover peer agents, manage file locks, and watch coordination traffic \
                   over the shared state files in a project root."
)]
pub struct Cli {
    /// Project root directory (default: discovered via CLAUDESWARM_ROOT or marker search)
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover active Claude Code agents
    DiscoverAgents(discover::DiscoverAgentsArgs),

    /// List active agents from the registry
    ListAgents(list_agents::ListAgentsArgs),

    /// Acquire a lock on a file
    AcquireFileLock(locks::AcquireFileLockArgs),

    /// Release a lock on a file
    ReleaseFileLock(locks::ReleaseFileLockArgs),

    /// Check who has a lock on a file
    WhoHasLock(locks::WhoHasLockArgs),

    /// List all active locks
    ListAllLocks(locks::ListAllLocksArgs),

    /// Clean up stale locks
    CleanupStaleLocks(locks::CleanupStaleLocksArgs),

    /// Start the monitoring dashboard
    StartMonitoring(monitor::StartMonitoringArgs),
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> Result<()> {
        let root = self.project_root.as_deref();
        match self.command {
            Commands::DiscoverAgents(args) => discover::execute(args, root),
            Commands::ListAgents(args) => list_agents::execute(args, root),
            Commands::AcquireFileLock(args) => locks::acquire(args, root),
            Commands::ReleaseFileLock(args) => locks::release(args, root),
            Commands::WhoHasLock(args) => locks::who_has(args, root),
            Commands::ListAllLocks(args) => locks::list_all(args, root),
            Commands::CleanupStaleLocks(args) => locks::cleanup_stale(args, root),
            Commands::StartMonitoring(args) => monitor::execute(args, root),
        }
    }
}
