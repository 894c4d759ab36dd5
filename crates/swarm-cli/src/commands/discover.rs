//! `discover-agents` command implementation. Grounded on
//! `examples/original_source/src/claudeswarm/cli.py`'s `cmd_discover_agents`.

use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{bail, Result};
use claude_swarm_core::backend::{select_backend, Backend};
use claude_swarm_core::discovery::{self, ActiveAgentsFile, AgentStatus};
use claude_swarm_core::validate;
use clap::Args;
use serde_json::json;

use crate::util::project_root;

/// Discover active Claude Code agents
#[derive(Args, Debug)]
pub struct DiscoverAgentsArgs {
    /// Continuously monitor for agents
    #[arg(long)]
    watch: bool,

    /// Refresh interval in seconds for watch mode
    #[arg(long, default_value_t = 30)]
    interval: u64,

    /// Output in JSON format
    #[arg(long)]
    json: bool,

    /// Seconds after which an agent is considered stale
    #[arg(long = "stale-threshold", default_value_t = 60)]
    stale_threshold: u64,
}

pub fn execute(args: DiscoverAgentsArgs, project_root_override: Option<&Path>) -> Result<()> {
    let root = project_root(project_root_override)?;

    if let Err(e) = validate::validate_timeout_secs(args.stale_threshold) {
        bail!("stale_threshold: {e}");
    }
    if args.watch {
        if let Err(e) = validate::validate_timeout_secs(args.interval) {
            bail!("interval: {e}");
        }
    }

    let backend = select_backend();
    let stale_threshold = Duration::from_secs(args.stale_threshold);

    if args.watch {
        println!("Watching for agents (Ctrl+C to stop)...");
        loop {
            let registry = discover_once(&root, backend.as_ref(), stale_threshold)?;
            print_registry(&registry, args.json)?;
            sleep(Duration::from_secs(args.interval));
        }
    } else {
        let registry = discover_once(&root, backend.as_ref(), stale_threshold)?;
        print_registry(&registry, args.json)?;
        println!();
        println!("Registry saved to: ACTIVE_AGENTS.json");
    }
    Ok(())
}

/// Enumerate peers once to pick a session name (first peer's, or the prior
/// registry's, or "unknown"), then refresh the registry against it.
fn discover_once(
    root: &Path,
    backend: &dyn Backend,
    stale_threshold: Duration,
) -> Result<ActiveAgentsFile> {
    let peers = backend.enumerate_peers(Some(root))?;
    let session_name = if let Some(peer) = peers.first() {
        peer.session_name.clone()
    } else if let Ok(prior) = discovery::list(root) {
        if prior.session_name.is_empty() {
            "unknown".to_string()
        } else {
            prior.session_name
        }
    } else {
        "unknown".to_string()
    };
    Ok(discovery::refresh(root, backend, &session_name, stale_threshold)?)
}

fn status_symbol(status: AgentStatus) -> &'static str {
    match status {
        AgentStatus::Active => "[active]",
        AgentStatus::Stale => "[stale] ",
        AgentStatus::Dead => "[dead]  ",
    }
}

fn print_registry(registry: &ActiveAgentsFile, as_json: bool) -> Result<()> {
    if as_json {
        let value = json!({
            "session_name": registry.session_name,
            "updated_at": registry.updated_at,
            "agents": registry.agents,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("=== Agent Discovery [{}] ===", registry.updated_at);
    println!("Session: {}", registry.session_name);
    println!("Total agents: {}", registry.agents.len());
    println!();

    if registry.agents.is_empty() {
        println!("  No agents discovered.");
    } else {
        for agent in &registry.agents {
            println!(
                "  {} {:<12} | {:<20} | PID: {:<8} | {:?}",
                status_symbol(agent.status),
                agent.id,
                agent.identifier,
                agent.pid,
                agent.status
            );
        }
    }
    Ok(())
}
