//! Shared CLI helpers: project-root resolution.

use std::path::{Path, PathBuf};

use anyhow::Result;
use claude_swarm_core::paths;

/// Resolve the project root for a command invocation: the `--project-root`
/// flag if given, else the core's own discovery (env var, marker search,
/// cwd fallback) rooted at the current directory.
pub fn project_root(explicit: Option<&Path>) -> Result<PathBuf> {
    let cwd = std::env::current_dir()?;
    Ok(paths::resolve_project_root(explicit, &cwd))
}
