//! Discovery registry (spec §4.E): enumerates live peer agents on the host
//! and persists `ACTIVE_AGENTS.json`. Grounded on
//! `examples/original_source/src/claudeswarm/discovery.py`.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::error::Result;
use crate::paths;
use crate::store;

pub const DEFAULT_STALE_THRESHOLD_SECS: u64 = 60;
pub const MIN_STALE_THRESHOLD_SECS: u64 = 10;
pub const MAX_STALE_THRESHOLD_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Stale,
    Dead,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub identifier: String,
    pub pid: u32,
    pub session_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub status: AgentStatus,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ActiveAgentsFile {
    #[serde(default)]
    pub session_name: String,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub agents: Vec<Agent>,
}

/// Refresh the discovery registry against the live backend, aging out
/// peers that are no longer observed (spec §4.E steps 1-5).
pub fn refresh(
    root: &Path,
    backend: &dyn Backend,
    session_name: &str,
    stale_threshold: Duration,
) -> Result<ActiveAgentsFile> {
    let peers = backend.enumerate_peers(Some(root))?;
    let path = paths::active_agents_path(root);
    let prior: ActiveAgentsFile = store::read_locked(&path, store::DEFAULT_LOCK_TIMEOUT)?;

    let now = Utc::now();
    let mut next_id = prior
        .agents
        .iter()
        .filter_map(|a| a.id.strip_prefix("agent-").and_then(|n| n.parse::<u64>().ok()))
        .max()
        .map(|n| n + 1)
        .unwrap_or(0);

    let mut by_identifier: std::collections::HashMap<String, Agent> = prior
        .agents
        .iter()
        .cloned()
        .map(|a| (a.identifier.clone(), a))
        .collect();

    let mut seen_identifiers = std::collections::HashSet::new();
    let mut agents = Vec::new();

    for peer in &peers {
        seen_identifiers.insert(peer.identifier.clone());
        let id = by_identifier
            .get(&peer.identifier)
            .map(|a| a.id.clone())
            .unwrap_or_else(|| {
                let id = format!("agent-{next_id}");
                next_id += 1;
                id
            });
        agents.push(Agent {
            id,
            identifier: peer.identifier.clone(),
            pid: peer.pid,
            session_name: peer.session_name.clone(),
            cwd: peer.cwd.as_ref().map(|p| p.display().to_string()),
            status: AgentStatus::Active,
            last_seen: now,
        });
    }

    for (identifier, prior_agent) in by_identifier.drain() {
        if seen_identifiers.contains(&identifier) {
            continue;
        }
        let age = now.signed_duration_since(prior_agent.last_seen);
        if age.to_std().unwrap_or(Duration::MAX) < stale_threshold {
            agents.push(Agent {
                status: AgentStatus::Stale,
                ..prior_agent
            });
        }
        // else: dead, dropped.
    }

    let result = ActiveAgentsFile {
        session_name: session_name.to_string(),
        updated_at: now,
        agents,
    };

    store::write_locked(&path, store::DEFAULT_LOCK_TIMEOUT, |_: ActiveAgentsFile| {
        Ok(ActiveAgentsFile {
            session_name: result.session_name.clone(),
            updated_at: result.updated_at,
            agents: result.agents.clone(),
        })
    })?;

    Ok(result)
}

/// Load the current registry without refreshing.
pub fn list(root: &Path) -> Result<ActiveAgentsFile> {
    let path = paths::active_agents_path(root);
    store::read_locked(&path, store::DEFAULT_LOCK_TIMEOUT)
}

/// Resolve an agent id to its backend identifier, if it's currently active.
pub fn resolve_identifier(root: &Path, agent_id: &str) -> Result<Option<String>> {
    let registry = list(root)?;
    Ok(registry
        .agents
        .into_iter()
        .find(|a| a.id == agent_id && a.status != AgentStatus::Dead)
        .map(|a| a.identifier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, PeerInfo};
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct FakeBackend {
        peers: Vec<PeerInfo>,
    }

    impl Backend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }
        fn enumerate_peers(&self, _project_root: Option<&Path>) -> Result<Vec<PeerInfo>> {
            Ok(self.peers.clone())
        }
        fn push(&self, _identifier: &str, _line: &str) -> Result<bool> {
            Ok(true)
        }
        fn verify_alive(&self, _identifier: &str) -> bool {
            true
        }
        fn current_identifier(&self) -> Option<String> {
            None
        }
    }

    #[test]
    fn first_refresh_assigns_sequential_ids() {
        let tmp = TempDir::new().unwrap();
        let backend = FakeBackend {
            peers: vec![
                PeerInfo {
                    identifier: "pid:1".into(),
                    pid: 1,
                    session_name: "s".into(),
                    cwd: Some(PathBuf::from(tmp.path())),
                },
                PeerInfo {
                    identifier: "pid:2".into(),
                    pid: 2,
                    session_name: "s".into(),
                    cwd: Some(PathBuf::from(tmp.path())),
                },
            ],
        };
        let result = refresh(tmp.path(), &backend, "s", Duration::from_secs(60)).unwrap();
        assert_eq!(result.agents.len(), 2);
        assert_eq!(result.agents[0].id, "agent-0");
        assert_eq!(result.agents[1].id, "agent-1");
    }

    #[test]
    fn identifier_reuses_stable_id_across_refreshes() {
        let tmp = TempDir::new().unwrap();
        let backend = FakeBackend {
            peers: vec![PeerInfo {
                identifier: "pid:1".into(),
                pid: 1,
                session_name: "s".into(),
                cwd: Some(PathBuf::from(tmp.path())),
            }],
        };
        let first = refresh(tmp.path(), &backend, "s", Duration::from_secs(60)).unwrap();
        let second = refresh(tmp.path(), &backend, "s", Duration::from_secs(60)).unwrap();
        assert_eq!(first.agents[0].id, second.agents[0].id);
    }

    #[test]
    fn missing_peer_goes_stale_then_disappears() {
        let tmp = TempDir::new().unwrap();
        let backend_present = FakeBackend {
            peers: vec![PeerInfo {
                identifier: "pid:1".into(),
                pid: 1,
                session_name: "s".into(),
                cwd: Some(PathBuf::from(tmp.path())),
            }],
        };
        refresh(tmp.path(), &backend_present, "s", Duration::from_secs(60)).unwrap();

        let backend_empty = FakeBackend { peers: vec![] };
        let result = refresh(tmp.path(), &backend_empty, "s", Duration::from_secs(60)).unwrap();
        assert_eq!(result.agents.len(), 1);
        assert_eq!(result.agents[0].status, AgentStatus::Stale);

        // Simulate aging past the threshold by forcing a zero threshold.
        let result2 = refresh(tmp.path(), &backend_empty, "s", Duration::from_secs(0)).unwrap();
        assert!(result2.agents.is_empty());
    }
}
