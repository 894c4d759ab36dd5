//! Project root resolution (spec §3 "Project root", §4.A).

use std::path::{Path, PathBuf};

/// Env var that overrides automatic project-root discovery.
pub const ROOT_ENV_VAR: &str = "CLAUDESWARM_ROOT";

const MARKERS: &[&str] = &[
    ".git",
    ".claudeswarm.yaml",
    "ACTIVE_AGENTS.json",
    ".agent_locks",
    "pyproject.toml",
    "package.json",
];

/// Resolve the project root directory: explicit override, then
/// `CLAUDESWARM_ROOT`, then the nearest ancestor of `start` containing any
/// marker, then `start` itself.
pub fn resolve_project_root(explicit: Option<&Path>, start: &Path) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    if let Ok(env_root) = std::env::var(ROOT_ENV_VAR) {
        let trimmed = env_root.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    if let Some(found) = find_marker_ancestor(start) {
        return found;
    }
    start.to_path_buf()
}

fn find_marker_ancestor(start: &Path) -> Option<PathBuf> {
    let mut current = Some(start);
    while let Some(dir) = current {
        if MARKERS.iter().any(|m| dir.join(m).exists()) {
            return Some(dir.to_path_buf());
        }
        current = dir.parent();
    }
    None
}

/// `<root>/.agent_locks`
pub fn locks_dir(root: &Path) -> PathBuf {
    root.join(".agent_locks")
}

/// `<root>/.agent_memory`
pub fn memory_dir(root: &Path) -> PathBuf {
    root.join(".agent_memory")
}

pub fn active_agents_path(root: &Path) -> PathBuf {
    root.join("ACTIVE_AGENTS.json")
}

pub fn pending_acks_path(root: &Path) -> PathBuf {
    root.join("PENDING_ACKS.json")
}

pub fn message_log_path(root: &Path) -> PathBuf {
    root.join("agent_messages.log")
}

pub fn message_log_old_path(root: &Path) -> PathBuf {
    root.join("agent_messages.log.old")
}

pub fn tasks_path(root: &Path) -> PathBuf {
    root.join("TASKS.json")
}

pub fn agent_cards_path(root: &Path) -> PathBuf {
    root.join("AGENT_CARDS.json")
}

pub fn delegation_history_path(root: &Path) -> PathBuf {
    root.join("DELEGATION_HISTORY.json")
}

pub fn contexts_path(root: &Path) -> PathBuf {
    root.join("CONTEXTS.json")
}

pub fn conflict_log_path(root: &Path) -> PathBuf {
    root.join("CONFLICT_LOG.json")
}

pub fn learning_data_path(root: &Path) -> PathBuf {
    root.join("LEARNING_DATA.json")
}

pub fn coordination_path(root: &Path) -> PathBuf {
    root.join("COORDINATION.md")
}

pub fn agent_memory_path(root: &Path, agent_id: &str) -> PathBuf {
    memory_dir(root).join(format!("{agent_id}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn explicit_wins_over_everything() {
        let tmp = TempDir::new().unwrap();
        let explicit = tmp.path().join("explicit");
        let resolved = resolve_project_root(Some(&explicit), tmp.path());
        assert_eq!(resolved, explicit);
    }

    #[test]
    #[serial]
    fn env_var_wins_over_marker_search() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join(".git"), "").unwrap();
        let env_root = tmp.path().join("env-root");
        unsafe { std::env::set_var(ROOT_ENV_VAR, env_root.to_str().unwrap()) };
        let resolved = resolve_project_root(None, &tmp.path().join("sub"));
        unsafe { std::env::remove_var(ROOT_ENV_VAR) };
        assert_eq!(resolved, env_root);
    }

    #[test]
    #[serial]
    fn marker_search_walks_up() {
        let tmp = TempDir::new().unwrap();
        unsafe { std::env::remove_var(ROOT_ENV_VAR) };
        let nested = tmp.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(tmp.path().join("pyproject.toml"), "").unwrap();
        let resolved = resolve_project_root(None, &nested);
        assert_eq!(resolved, tmp.path());
    }

    #[test]
    #[serial]
    fn falls_back_to_start_when_no_marker_found() {
        let tmp = TempDir::new().unwrap();
        unsafe { std::env::remove_var(ROOT_ENV_VAR) };
        // tmp dirs have no markers and (usually) no marker ancestors either.
        let resolved = resolve_project_root(None, tmp.path());
        assert_eq!(resolved, tmp.path());
    }
}
