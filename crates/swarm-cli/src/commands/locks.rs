//! File-lock commands (`acquire-file-lock`, `release-file-lock`,
//! `who-has-lock`, `list-all-locks`, `cleanup-stale-locks`). Grounded on
//! `examples/original_source/src/claudeswarm/cli.py`'s matching
//! `cmd_*_lock` handlers.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use claude_swarm_core::filelock::{self, LockRecord, DEFAULT_STALE_TIMEOUT_SECS};
use claude_swarm_core::validate;
use clap::Args;

use crate::util::project_root;

const MAX_REASON_LEN: usize = 512;

fn default_stale_timeout() -> Duration {
    Duration::from_secs(DEFAULT_STALE_TIMEOUT_SECS)
}

fn format_timestamp(unix_secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(unix_secs, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn age_secs(locked_at: i64) -> i64 {
    Utc::now().timestamp() - locked_at
}

/// Acquire a lock on a file
#[derive(Args, Debug)]
pub struct AcquireFileLockArgs {
    /// Path to the file to lock (literal path or glob pattern)
    filepath: String,

    /// Agent ID acquiring the lock
    agent_id: String,

    /// Reason for the lock
    reason: Option<String>,
}

pub fn acquire(args: AcquireFileLockArgs, project_root_override: Option<&Path>) -> Result<()> {
    let root = project_root(project_root_override)?;
    let agent_id = validate::validate_agent_id(&args.agent_id)?;
    let reason = args.reason.unwrap_or_default();
    if reason.len() > MAX_REASON_LEN {
        eprintln!("Error: Lock reason too long (max {MAX_REASON_LEN} characters)");
        std::process::exit(1);
    }

    let (ok, conflict) = filelock::acquire(&root, &args.filepath, &agent_id, &reason, default_stale_timeout())?;

    if ok {
        println!("Lock acquired on: {}", args.filepath);
        println!("  Agent: {agent_id}");
        if !reason.is_empty() {
            println!("  Reason: {reason}");
        }
        Ok(())
    } else {
        eprintln!("Lock conflict on: {}", args.filepath);
        if let Some(conflict) = conflict {
            eprintln!("  Currently held by: {}", conflict.holder);
            eprintln!("  Age: {} seconds", conflict.age_secs);
            eprintln!("  Reason: {}", conflict.reason);
        } else {
            eprintln!("Failed to acquire lock on: {}", args.filepath);
        }
        std::process::exit(1);
    }
}

/// Release a lock on a file
#[derive(Args, Debug)]
pub struct ReleaseFileLockArgs {
    /// Path to the file to unlock
    filepath: String,

    /// Agent ID releasing the lock
    agent_id: String,
}

pub fn release(args: ReleaseFileLockArgs, project_root_override: Option<&Path>) -> Result<()> {
    let root = project_root(project_root_override)?;
    let agent_id = validate::validate_agent_id(&args.agent_id)?;

    let released = filelock::release(&root, &args.filepath, &agent_id)?;
    if released {
        println!("Lock released on: {}", args.filepath);
        Ok(())
    } else {
        eprintln!("Failed to release lock on: {}", args.filepath);
        eprintln!("  (Lock may not exist or is owned by another agent)");
        std::process::exit(1);
    }
}

/// Check who has a lock on a file
#[derive(Args, Debug)]
pub struct WhoHasLockArgs {
    /// Path to the file to check
    filepath: String,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

pub fn who_has(args: WhoHasLockArgs, project_root_override: Option<&Path>) -> Result<()> {
    let root = project_root(project_root_override)?;
    let lock = filelock::who_has(&root, &args.filepath, default_stale_timeout())?;

    match lock {
        Some(record) => {
            print_lock(&record);
            if args.json {
                println!();
                println!("JSON:");
                println!("{}", serde_json::to_string_pretty(&record)?);
            }
        }
        None => println!("No active lock on: {}", args.filepath),
    }
    Ok(())
}

fn print_lock(record: &LockRecord) {
    println!("Lock on: {}", record.filepath);
    println!("  Held by: {}", record.agent_id);
    println!("  Locked at: {}", format_timestamp(record.locked_at));
    println!("  Age: {} seconds", age_secs(record.locked_at));
    if !record.reason.is_empty() {
        println!("  Reason: {}", record.reason);
    }
}

/// List all active locks
#[derive(Args, Debug)]
pub struct ListAllLocksArgs {
    /// Include stale locks
    #[arg(long)]
    include_stale: bool,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

pub fn list_all(args: ListAllLocksArgs, project_root_override: Option<&Path>) -> Result<()> {
    let root = project_root(project_root_override)?;
    let locks = filelock::list_all(&root, args.include_stale, default_stale_timeout())?;

    if locks.is_empty() {
        println!("No active locks.");
        return Ok(());
    }

    println!("Active locks ({}):", locks.len());
    println!();
    for record in &locks {
        print_lock(record);
        println!();
    }

    if args.json {
        println!("JSON:");
        println!("{}", serde_json::to_string_pretty(&locks)?);
    }
    Ok(())
}

/// Clean up stale locks
#[derive(Args, Debug)]
pub struct CleanupStaleLocksArgs {}

pub fn cleanup_stale(_args: CleanupStaleLocksArgs, project_root_override: Option<&Path>) -> Result<()> {
    let root = project_root(project_root_override)?;
    let count = filelock::cleanup_stale(&root, default_stale_timeout())?;
    println!("Cleaned up {count} stale lock(s)");
    Ok(())
}
