//! Conflict resolver (spec §4.L): detects contested resources and applies
//! priority/seniority/yield/negotiation strategies, recording every step.
//! Grounded on
//! `examples/original_source/src/claudeswarm/conflict_resolution.py`.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::filelock::Conflict as LockConflict;
use crate::paths;
use crate::store;
use crate::tasks::{TaskPriority, TaskStatus, TaskStore};

const MAX_CONFLICT_LOG_ENTRIES: usize = 500;
pub const MAX_NEGOTIATION_ROUNDS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    FileLock,
    Resource,
    TaskClaim,
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Pending,
    Resolving,
    Resolved,
    Escalated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStrategy {
    Priority,
    Seniority,
    Merge,
    Negotiation,
    Escalate,
    Yield,
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationAction {
    Yield,
    Insist,
    Compromise,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationMessage {
    pub from_agent: String,
    pub to_agent: String,
    pub conflict_id: String,
    pub round_number: u32,
    pub action: String,
    #[serde(default)]
    pub proposal: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub conflict_id: String,
    pub strategy_used: ResolutionStrategy,
    pub winner: String,
    pub loser_action: String,
    pub resolved_at: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_id: String,
    pub conflict_type: ConflictType,
    pub agents_involved: Vec<String>,
    pub resource: String,
    pub detected_at: DateTime<Utc>,
    pub status: ConflictStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(default)]
    pub negotiations: Vec<NegotiationMessage>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConflictLogFile {
    #[serde(default = "schema_version")]
    version: String,
    #[serde(default = "Utc::now")]
    updated_at: DateTime<Utc>,
    #[serde(default)]
    conflicts: Vec<Conflict>,
}

fn schema_version() -> String {
    "1.0".to_string()
}

pub struct ConflictResolver<'a> {
    root: &'a Path,
    tasks: TaskStore<'a>,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(root: &'a Path) -> Self {
        Self {
            root,
            tasks: TaskStore::new(root),
        }
    }

    fn log_path(&self) -> std::path::PathBuf {
        paths::conflict_log_path(self.root)
    }

    fn record(&self, conflict: Conflict) -> Result<()> {
        store::write_locked(&self.log_path(), store::DEFAULT_LOCK_TIMEOUT, |mut file: ConflictLogFile| {
            if let Some(existing) = file.conflicts.iter_mut().find(|c| c.conflict_id == conflict.conflict_id) {
                *existing = conflict.clone();
            } else {
                file.conflicts.push(conflict.clone());
            }
            if file.conflicts.len() > MAX_CONFLICT_LOG_ENTRIES {
                let excess = file.conflicts.len() - MAX_CONFLICT_LOG_ENTRIES;
                file.conflicts.drain(0..excess);
            }
            file.updated_at = Utc::now();
            Ok(file)
        })?;
        Ok(())
    }

    /// Record a file-lock denial as a conflict: `agents_involved[0]` is the
    /// requester, `[1]` the current holder (spec §4.L).
    pub fn detect_file_lock_conflict(
        &self,
        filepath: &str,
        requesting_agent: &str,
        lock_conflict: &LockConflict,
    ) -> Result<Conflict> {
        let conflict = Conflict {
            conflict_id: Uuid::new_v4().to_string(),
            conflict_type: ConflictType::FileLock,
            agents_involved: vec![requesting_agent.to_string(), lock_conflict.holder.clone()],
            resource: filepath.to_string(),
            detected_at: Utc::now(),
            status: ConflictStatus::Pending,
            resolution: None,
            negotiations: vec![],
        };
        self.record(conflict.clone())?;
        Ok(conflict)
    }

    fn agent_active_task_priority(&self, agent_id: &str) -> Result<Option<TaskPriority>> {
        let tasks = self.tasks.list(&crate::tasks::TaskFilter {
            assigned_to: Some(agent_id.to_string()),
            ..Default::default()
        })?;
        Ok(tasks
            .into_iter()
            .find(|t| matches!(t.status, TaskStatus::Assigned | TaskStatus::Working | TaskStatus::Review))
            .map(|t| t.priority))
    }

    fn priority_rank(priority: TaskPriority) -> u8 {
        match priority {
            TaskPriority::Critical => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
        }
    }

    /// Compare the active tasks of requester and holder; lower rank
    /// (higher priority) wins. Returns `None` if either has no active task
    /// or they're equal (can't be resolved by priority alone).
    fn resolve_by_priority(&self, conflict: &Conflict) -> Result<Option<Resolution>> {
        let requester = &conflict.agents_involved[0];
        let Some(holder) = conflict.agents_involved.get(1) else {
            return Ok(None);
        };

        let Some(req_priority) = self.agent_active_task_priority(requester)? else {
            return Ok(None);
        };
        let Some(hold_priority) = self.agent_active_task_priority(holder)? else {
            return Ok(None);
        };

        let req_rank = Self::priority_rank(req_priority);
        let hold_rank = Self::priority_rank(hold_priority);

        let resolution = if req_rank < hold_rank {
            Resolution {
                conflict_id: conflict.conflict_id.clone(),
                strategy_used: ResolutionStrategy::Priority,
                winner: requester.clone(),
                loser_action: "yield".to_string(),
                resolved_at: Utc::now(),
                reason: format!("Task priority: {req_priority:?} > {hold_priority:?}"),
            }
        } else if hold_rank < req_rank {
            Resolution {
                conflict_id: conflict.conflict_id.clone(),
                strategy_used: ResolutionStrategy::Priority,
                winner: holder.clone(),
                loser_action: "wait".to_string(),
                resolved_at: Utc::now(),
                reason: format!("Task priority: {hold_priority:?} > {req_priority:?}"),
            }
        } else {
            return Ok(None);
        };
        Ok(Some(resolution))
    }

    /// The holder (second agent) was there first; always resolvable.
    fn resolve_by_seniority(&self, conflict: &Conflict) -> Resolution {
        let winner = conflict
            .agents_involved
            .get(1)
            .cloned()
            .unwrap_or_else(|| conflict.agents_involved[0].clone());
        Resolution {
            conflict_id: conflict.conflict_id.clone(),
            strategy_used: ResolutionStrategy::Seniority,
            winner,
            loser_action: "wait".to_string(),
            resolved_at: Utc::now(),
            reason: "Current holder has seniority (was working first)".to_string(),
        }
    }

    /// Try priority, then seniority, recording every step and the final
    /// resolution (spec §4.L strategy order).
    pub fn resolve(&self, mut conflict: Conflict) -> Result<Resolution> {
        conflict.status = ConflictStatus::Resolving;

        let resolution = match self.resolve_by_priority(&conflict)? {
            Some(r) => r,
            None => self.resolve_by_seniority(&conflict),
        };

        conflict.resolution = Some(resolution.clone());
        conflict.status = ConflictStatus::Resolved;
        self.record(conflict)?;
        Ok(resolution)
    }

    /// Entry point for handling a file-lock denial end-to-end.
    pub fn handle_lock_conflict(
        &self,
        filepath: &str,
        requesting_agent: &str,
        lock_conflict: &LockConflict,
    ) -> Result<Resolution> {
        let conflict = self.detect_file_lock_conflict(filepath, requesting_agent, lock_conflict)?;
        self.resolve(conflict)
    }

    /// Process one negotiation round. Returns `Some(resolution)` once both
    /// parties have responded in the current round and a rule applies;
    /// `None` while waiting for the other side (spec §4.L negotiation mode).
    pub fn negotiate(&self, mut conflict: Conflict, message: NegotiationMessage) -> Result<Option<Resolution>> {
        let current_round = message.round_number;
        conflict.negotiations.push(message);

        let round_messages: Vec<&NegotiationMessage> = conflict
            .negotiations
            .iter()
            .filter(|n| n.round_number == current_round)
            .collect();

        if round_messages.len() < 2 {
            self.record(conflict)?;
            return Ok(None);
        }

        let actions: Vec<(String, String)> = round_messages
            .iter()
            .map(|n| (n.from_agent.clone(), n.action.clone()))
            .collect();

        let yielders: Vec<&str> = actions
            .iter()
            .filter(|(_, a)| a == "yield")
            .map(|(agent, _)| agent.as_str())
            .collect();
        let insisters: Vec<&str> = actions
            .iter()
            .filter(|(_, a)| a == "insist")
            .map(|(agent, _)| agent.as_str())
            .collect();

        if yielders.len() == 1 {
            let loser = yielders[0].to_string();
            let winner = actions
                .iter()
                .find(|(agent, _)| agent != &loser)
                .map(|(agent, _)| agent.clone())
                .unwrap_or_else(|| loser.clone());
            let resolution = Resolution {
                conflict_id: conflict.conflict_id.clone(),
                strategy_used: ResolutionStrategy::Negotiation,
                winner,
                loser_action: "yield".to_string(),
                resolved_at: Utc::now(),
                reason: format!("{loser} yielded during negotiation"),
            };
            conflict.resolution = Some(resolution.clone());
            conflict.status = ConflictStatus::Resolved;
            self.record(conflict)?;
            return Ok(Some(resolution));
        }

        if yielders.len() == 2 {
            return self.resolve(conflict).map(Some);
        }

        if insisters.len() == 2 {
            if current_round >= MAX_NEGOTIATION_ROUNDS {
                let resolution = self.resolve_by_seniority(&conflict);
                conflict.resolution = Some(resolution.clone());
                conflict.status = ConflictStatus::Resolved;
                self.record(conflict)?;
                return Ok(Some(resolution));
            }
            self.record(conflict)?;
            return Ok(None);
        }

        // Mixed insist/compromise: the insister wins.
        let resolution = if let Some(winner) = insisters.first() {
            let winner = winner.to_string();
            let loser = actions
                .iter()
                .find(|(agent, _)| agent != &winner)
                .map(|(agent, _)| agent.clone())
                .unwrap_or_else(|| winner.clone());
            Resolution {
                conflict_id: conflict.conflict_id.clone(),
                strategy_used: ResolutionStrategy::Negotiation,
                winner: winner.clone(),
                loser_action: "wait".to_string(),
                resolved_at: Utc::now(),
                reason: format!("{winner} insisted while {loser} compromised"),
            }
        } else {
            self.resolve_by_seniority(&conflict)
        };

        conflict.resolution = Some(resolution.clone());
        conflict.status = ConflictStatus::Resolved;
        self.record(conflict)?;
        Ok(Some(resolution))
    }

    pub fn active_conflicts(&self) -> Result<Vec<Conflict>> {
        let file: ConflictLogFile = store::read_locked(&self.log_path(), store::DEFAULT_LOCK_TIMEOUT)?;
        Ok(file
            .conflicts
            .into_iter()
            .filter(|c| matches!(c.status, ConflictStatus::Pending | ConflictStatus::Resolving))
            .collect())
    }

    pub fn history(&self, agent_id: Option<&str>, resource: Option<&str>) -> Result<Vec<Conflict>> {
        let file: ConflictLogFile = store::read_locked(&self.log_path(), store::DEFAULT_LOCK_TIMEOUT)?;
        Ok(file
            .conflicts
            .into_iter()
            .filter(|c| agent_id.map(|a| c.agents_involved.iter().any(|x| x == a)).unwrap_or(true))
            .filter(|c| resource.map(|r| c.resource == r).unwrap_or(true))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskStore;

    fn sample_lock_conflict(holder: &str) -> LockConflict {
        LockConflict {
            holder: holder.to_string(),
            age_secs: 5,
            reason: "working".to_string(),
        }
    }

    #[test]
    fn priority_breaks_tie_when_requester_outranks_holder() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tasks = TaskStore::new(tmp.path());
        let requester_task = tasks
            .create("req", "agent-req", TaskPriority::Critical, None, vec![], vec![], None)
            .unwrap();
        tasks.assign(requester_task.task_id, "agent-req").unwrap();
        let holder_task = tasks
            .create("hold", "agent-hold", TaskPriority::Normal, None, vec![], vec![], None)
            .unwrap();
        tasks.assign(holder_task.task_id, "agent-hold").unwrap();

        let resolver = ConflictResolver::new(tmp.path());
        let resolution = resolver
            .handle_lock_conflict("src/a.py", "agent-req", &sample_lock_conflict("agent-hold"))
            .unwrap();

        assert_eq!(resolution.strategy_used, ResolutionStrategy::Priority);
        assert_eq!(resolution.winner, "agent-req");
    }

    #[test]
    fn seniority_wins_when_no_active_tasks() {
        let tmp = tempfile::TempDir::new().unwrap();
        let resolver = ConflictResolver::new(tmp.path());
        let resolution = resolver
            .handle_lock_conflict("src/a.py", "agent-req", &sample_lock_conflict("agent-hold"))
            .unwrap();
        assert_eq!(resolution.strategy_used, ResolutionStrategy::Seniority);
        assert_eq!(resolution.winner, "agent-hold");
    }

    #[test]
    fn negotiation_single_yield_resolves_immediately() {
        let tmp = tempfile::TempDir::new().unwrap();
        let resolver = ConflictResolver::new(tmp.path());
        let conflict = resolver
            .detect_file_lock_conflict("src/a.py", "agent-req", &sample_lock_conflict("agent-hold"))
            .unwrap();

        let first = NegotiationMessage {
            from_agent: "agent-req".into(),
            to_agent: "agent-hold".into(),
            conflict_id: conflict.conflict_id.clone(),
            round_number: 1,
            action: "yield".into(),
            proposal: String::new(),
        };
        assert!(resolver.negotiate(conflict.clone(), first).is_ok());

        // Re-fetch conflict with the first negotiation persisted.
        let log = resolver.history(None, None).unwrap();
        let stored = log.into_iter().find(|c| c.conflict_id == conflict.conflict_id).unwrap();

        let second = NegotiationMessage {
            from_agent: "agent-hold".into(),
            to_agent: "agent-req".into(),
            conflict_id: conflict.conflict_id.clone(),
            round_number: 1,
            action: "insist".into(),
            proposal: String::new(),
        };
        let resolution = resolver.negotiate(stored, second).unwrap().unwrap();
        assert_eq!(resolution.winner, "agent-hold");
        assert_eq!(resolution.loser_action, "yield");
    }

    #[test]
    fn negotiation_stalemate_falls_back_to_seniority_at_max_rounds() {
        let tmp = tempfile::TempDir::new().unwrap();
        let resolver = ConflictResolver::new(tmp.path());
        let mut conflict = resolver
            .detect_file_lock_conflict("src/a.py", "agent-req", &sample_lock_conflict("agent-hold"))
            .unwrap();
        conflict.negotiations.push(NegotiationMessage {
            from_agent: "agent-req".into(),
            to_agent: "agent-hold".into(),
            conflict_id: conflict.conflict_id.clone(),
            round_number: MAX_NEGOTIATION_ROUNDS,
            action: "insist".into(),
            proposal: String::new(),
        });

        let second = NegotiationMessage {
            from_agent: "agent-hold".into(),
            to_agent: "agent-req".into(),
            conflict_id: conflict.conflict_id.clone(),
            round_number: MAX_NEGOTIATION_ROUNDS,
            action: "insist".into(),
            proposal: String::new(),
        };
        let resolution = resolver.negotiate(conflict, second).unwrap().unwrap();
        assert_eq!(resolution.strategy_used, ResolutionStrategy::Seniority);
    }
}
