//! `list-agents` command implementation. Grounded on
//! `examples/original_source/src/claudeswarm/cli.py`'s `cmd_list_agents`,
//! which reads the registry without refreshing it.

use std::path::Path;

use anyhow::Result;
use claude_swarm_core::discovery::{self, AgentStatus};
use clap::Args;

use crate::util::project_root;

/// List active agents from the registry
#[derive(Args, Debug)]
pub struct ListAgentsArgs {
    /// Output in JSON format
    #[arg(long)]
    json: bool,
}

pub fn execute(args: ListAgentsArgs, project_root_override: Option<&Path>) -> Result<()> {
    let root = project_root(project_root_override)?;
    let registry = discovery::list(&root)?;
    let active: Vec<_> = registry
        .agents
        .into_iter()
        .filter(|a| a.status == AgentStatus::Active)
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&active)?);
        return Ok(());
    }

    if active.is_empty() {
        println!("No active agents found.");
    } else {
        println!("=== Active Agents ({}) ===", active.len());
        for agent in &active {
            println!("  {:<12} | {:<20} | PID: {}", agent.id, agent.identifier, agent.pid);
        }
    }
    Ok(())
}
