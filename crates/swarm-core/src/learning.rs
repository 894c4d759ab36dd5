//! Learning system (spec §3, §4.M): per-agent, per-skill performance
//! tracking with exponentially-weighted success rates, fed back into the
//! agent-card registry so the delegation engine benefits from outcomes it
//! never directly observed. Grounded on
//! `examples/original_source/src/claudeswarm/learning.py`.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cards::CardRegistry;
use crate::delegation::extract_skills_from_task;
use crate::error::Result;
use crate::paths;
use crate::store;
use crate::tasks::{Task, TaskStatus};

/// Weight applied to each new outcome in a skill's running success rate.
const EXPONENTIAL_DECAY_WEIGHT: f64 = 0.1;
const MAX_HISTORY_ENTRIES_PER_SKILL: usize = 100;
/// Minimum recorded outcomes before a skill is reported as a top/weak skill
/// or included in trend calculations.
const MIN_EXPERIENCE_FOR_RANKING: u32 = 3;
/// Minimum total outcomes before a trend (improving/declining) is reported.
const MIN_EXPERIENCE_FOR_TREND: u32 = 10;
/// How many of the most recent outcomes count as "recent" for trend
/// comparison against the full history.
const TREND_RECENT_WINDOW: usize = 5;
const TREND_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillMetrics {
    pub skill: String,
    #[serde(default)]
    pub total_count: u32,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub success_rate: f64,
    /// EMA (weight [`EXPONENTIAL_DECAY_WEIGHT`]) of completion time in
    /// seconds; 0.0 until the first timed outcome.
    #[serde(default)]
    pub avg_completion_time: f64,
    /// Most recent outcomes, oldest first, capped at
    /// [`MAX_HISTORY_ENTRIES_PER_SKILL`]; used for trend detection.
    #[serde(default)]
    pub history: Vec<bool>,
}

impl SkillMetrics {
    fn record_outcome(&mut self, success: bool, completion_time_secs: Option<f64>) {
        self.total_count += 1;
        if success {
            self.success_count += 1;
        }
        let observed = if success { 1.0 } else { 0.0 };
        self.success_rate = if self.total_count == 1 {
            observed
        } else {
            self.success_rate * (1.0 - EXPONENTIAL_DECAY_WEIGHT) + observed * EXPONENTIAL_DECAY_WEIGHT
        };
        if let Some(time) = completion_time_secs.filter(|t| *t > 0.0) {
            self.avg_completion_time = if self.avg_completion_time == 0.0 {
                time
            } else {
                self.avg_completion_time * (1.0 - EXPONENTIAL_DECAY_WEIGHT) + time * EXPONENTIAL_DECAY_WEIGHT
            };
        }
        self.history.push(success);
        if self.history.len() > MAX_HISTORY_ENTRIES_PER_SKILL {
            let overflow = self.history.len() - MAX_HISTORY_ENTRIES_PER_SKILL;
            self.history.drain(0..overflow);
        }
    }

    /// Compare the recent window's rate against the rate over the rest of
    /// history; `None` below [`MIN_EXPERIENCE_FOR_TREND`] total outcomes.
    fn trend(&self) -> Option<Trend> {
        if self.total_count < MIN_EXPERIENCE_FOR_TREND {
            return None;
        }
        let split = self.history.len().saturating_sub(TREND_RECENT_WINDOW);
        let (historical, recent) = self.history.split_at(split);
        if recent.is_empty() || historical.is_empty() {
            return None;
        }
        let recent_rate = recent.iter().filter(|&&s| s).count() as f64 / recent.len() as f64;
        let historical_rate = historical.iter().filter(|&&s| s).count() as f64 / historical.len() as f64;
        let delta = recent_rate - historical_rate;
        Some(if delta > TREND_THRESHOLD {
            Trend::Improving
        } else if delta < -TREND_THRESHOLD {
            Trend::Declining
        } else {
            Trend::Stable
        })
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AgentPerformance {
    pub agent_id: String,
    #[serde(default)]
    pub tasks_completed: u32,
    #[serde(default)]
    pub tasks_failed: u32,
    #[serde(default)]
    pub tasks_in_progress: u32,
    #[serde(default)]
    pub skill_metrics: HashMap<String, SkillMetrics>,
    /// EMA (weight [`EXPONENTIAL_DECAY_WEIGHT`]) of completion time in
    /// seconds across all skills; 0.0 until the first timed outcome.
    #[serde(default)]
    pub avg_completion_time: f64,
    /// `task_id -> started_at`, persisted so completion timing survives
    /// across process restarts (no in-memory singleton).
    #[serde(default)]
    pub task_start_times: HashMap<String, DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl AgentPerformance {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            updated_at: Utc::now(),
            ..Default::default()
        }
    }

    fn overall_success_rate(&self) -> f64 {
        let total: u32 = self.skill_metrics.values().map(|m| m.total_count).sum();
        if total == 0 {
            return 0.0;
        }
        let successes: u32 = self.skill_metrics.values().map(|m| m.success_count).sum();
        successes as f64 / total as f64
    }

    /// Skills with at least [`MIN_EXPERIENCE_FOR_RANKING`] outcomes, highest
    /// success rate first.
    pub fn top_skills(&self, limit: usize) -> Vec<&SkillMetrics> {
        let mut skills: Vec<&SkillMetrics> = self
            .skill_metrics
            .values()
            .filter(|m| m.total_count >= MIN_EXPERIENCE_FOR_RANKING)
            .collect();
        skills.sort_by(|a, b| b.success_rate.total_cmp(&a.success_rate));
        skills.truncate(limit);
        skills
    }

    /// Skills with at least [`MIN_EXPERIENCE_FOR_RANKING`] outcomes, lowest
    /// success rate first.
    pub fn weak_skills(&self, limit: usize) -> Vec<&SkillMetrics> {
        let mut skills: Vec<&SkillMetrics> = self
            .skill_metrics
            .values()
            .filter(|m| m.total_count >= MIN_EXPERIENCE_FOR_RANKING)
            .collect();
        skills.sort_by(|a, b| a.success_rate.total_cmp(&b.success_rate));
        skills.truncate(limit);
        skills
    }

    pub fn improving_skills(&self) -> Vec<&SkillMetrics> {
        self.skill_metrics
            .values()
            .filter(|m| m.trend() == Some(Trend::Improving))
            .collect()
    }

    pub fn declining_skills(&self) -> Vec<&SkillMetrics> {
        self.skill_metrics
            .values()
            .filter(|m| m.trend() == Some(Trend::Declining))
            .collect()
    }
}

#[derive(Debug, Serialize)]
pub struct LeaderboardEntry {
    pub agent_id: String,
    pub success_rate: f64,
    pub tasks_completed: u32,
}

#[derive(Debug, Serialize)]
pub struct SkillExpert {
    pub agent_id: String,
    pub success_rate: f64,
    pub total_count: u32,
}

#[derive(Debug, Default, Serialize)]
pub struct TeamSummary {
    pub agents_tracked: usize,
    pub total_tasks_completed: u32,
    pub total_tasks_failed: u32,
    pub average_success_rate: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LearningDataFile {
    #[serde(default = "schema_version")]
    version: String,
    #[serde(default = "Utc::now")]
    updated_at: DateTime<Utc>,
    #[serde(default)]
    agents: HashMap<String, AgentPerformance>,
}

fn schema_version() -> String {
    "1.0".to_string()
}

pub struct LearningStore<'a> {
    root: &'a Path,
    cards: CardRegistry<'a>,
}

impl<'a> LearningStore<'a> {
    pub fn new(root: &'a Path) -> Self {
        Self {
            root,
            cards: CardRegistry::new(root),
        }
    }

    fn path(&self) -> std::path::PathBuf {
        paths::learning_data_path(self.root)
    }

    pub fn get_agent_performance(&self, agent_id: &str) -> Result<AgentPerformance> {
        let file: LearningDataFile = store::read_locked(&self.path(), store::DEFAULT_LOCK_TIMEOUT)?;
        Ok(file
            .agents
            .get(agent_id)
            .cloned()
            .unwrap_or_else(|| AgentPerformance::new(agent_id)))
    }

    pub fn get_all_performance(&self) -> Result<Vec<AgentPerformance>> {
        let file: LearningDataFile = store::read_locked(&self.path(), store::DEFAULT_LOCK_TIMEOUT)?;
        Ok(file.agents.into_values().collect())
    }

    fn update(&self, agent_id: &str, mutate: impl FnOnce(&mut AgentPerformance)) -> Result<AgentPerformance> {
        let agent_id_owned = agent_id.to_string();
        let file = store::write_locked(&self.path(), store::DEFAULT_LOCK_TIMEOUT, move |mut file: LearningDataFile| {
            let perf = file
                .agents
                .entry(agent_id_owned.clone())
                .or_insert_with(|| AgentPerformance::new(&agent_id_owned));
            mutate(perf);
            perf.updated_at = Utc::now();
            file.updated_at = Utc::now();
            Ok(file)
        })?;
        Ok(file.agents.get(agent_id).cloned().unwrap_or_else(|| AgentPerformance::new(agent_id)))
    }

    /// Mark a task as started for timing purposes, bumping
    /// `tasks_in_progress`.
    pub fn record_task_started(&self, agent_id: &str, task_id: &str) -> Result<()> {
        self.update(agent_id, |perf| {
            perf.tasks_in_progress += 1;
            perf.task_start_times.insert(task_id.to_string(), Utc::now());
        })?;
        Ok(())
    }

    /// Record a completed (or failed) task's outcome against each of
    /// `skills`, update the aggregate completed/failed counters, and sync
    /// the EMA'd success rates back into the agent's card (spec §4.M
    /// "feeds the delegation engine").
    pub fn record_task_completed(&self, agent_id: &str, task_id: &str, skills: &[String], success: bool) -> Result<AgentPerformance> {
        let perf = self.update(agent_id, |perf| {
            let now = Utc::now();
            let completion_time_secs = perf
                .task_start_times
                .remove(task_id)
                .map(|start| (now - start).num_milliseconds() as f64 / 1000.0);
            perf.tasks_in_progress = perf.tasks_in_progress.saturating_sub(1);
            if success {
                perf.tasks_completed += 1;
            } else {
                perf.tasks_failed += 1;
            }
            if let Some(time) = completion_time_secs.filter(|t| *t > 0.0) {
                perf.avg_completion_time = if perf.avg_completion_time == 0.0 {
                    time
                } else {
                    perf.avg_completion_time * (1.0 - EXPONENTIAL_DECAY_WEIGHT) + time * EXPONENTIAL_DECAY_WEIGHT
                };
            }
            for skill in skills {
                perf.skill_metrics
                    .entry(skill.clone())
                    .or_insert_with(|| SkillMetrics {
                        skill: skill.clone(),
                        ..Default::default()
                    })
                    .record_outcome(success, completion_time_secs);
            }
        })?;

        let updates: HashMap<String, f64> = perf
            .skill_metrics
            .iter()
            .map(|(skill, metrics)| (skill.clone(), metrics.success_rate))
            .collect();
        if !updates.is_empty() {
            // Best-effort: a missing card (agent never registered one)
            // shouldn't fail the learning update itself.
            let _ = self.cards.update_success_rates(agent_id, &updates);
        }
        Ok(perf)
    }

    /// Derive skills and outcome from a completed or failed task's own
    /// objective/files/constraints and final status, and its start/end
    /// timestamps from its history, rather than requiring a live
    /// `record_task_started` call (useful for backfilling from `TASKS.json`).
    pub fn record_task_from_history(&self, task: &Task) -> Result<Option<AgentPerformance>> {
        let Some(agent_id) = task.assigned_to.as_deref() else {
            return Ok(None);
        };
        if !matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
            return Ok(None);
        }
        let skills: Vec<String> = extract_skills_from_task(task).into_iter().map(|r| r.skill).collect();
        let success = task.status == TaskStatus::Completed;
        Ok(Some(self.record_task_completed(
            agent_id,
            &task.task_id.to_string(),
            &skills,
            success,
        )?))
    }

    /// Agents ranked by overall success rate (or a single skill's rate when
    /// `skill` is given), highest first.
    pub fn get_leaderboard(&self, skill: Option<&str>) -> Result<Vec<LeaderboardEntry>> {
        let mut entries: Vec<LeaderboardEntry> = self
            .get_all_performance()?
            .into_iter()
            .filter_map(|perf| {
                let rate = match skill {
                    Some(skill) => perf.skill_metrics.get(skill).map(|m| m.success_rate)?,
                    None => {
                        if perf.tasks_completed + perf.tasks_failed == 0 {
                            return None;
                        }
                        perf.overall_success_rate()
                    }
                };
                Some(LeaderboardEntry {
                    agent_id: perf.agent_id,
                    success_rate: rate,
                    tasks_completed: perf.tasks_completed,
                })
            })
            .collect();
        entries.sort_by(|a, b| b.success_rate.total_cmp(&a.success_rate));
        Ok(entries)
    }

    /// Agents with at least [`MIN_EXPERIENCE_FOR_RANKING`] outcomes in
    /// `skill`, highest success rate first.
    pub fn get_skill_experts(&self, skill: &str) -> Result<Vec<SkillExpert>> {
        let mut experts: Vec<SkillExpert> = self
            .get_all_performance()?
            .into_iter()
            .filter_map(|perf| {
                let metrics = perf.skill_metrics.get(skill)?;
                if metrics.total_count < MIN_EXPERIENCE_FOR_RANKING {
                    return None;
                }
                Some(SkillExpert {
                    agent_id: perf.agent_id,
                    success_rate: metrics.success_rate,
                    total_count: metrics.total_count,
                })
            })
            .collect();
        experts.sort_by(|a, b| b.success_rate.total_cmp(&a.success_rate));
        Ok(experts)
    }

    pub fn get_team_summary(&self) -> Result<TeamSummary> {
        let all = self.get_all_performance()?;
        if all.is_empty() {
            return Ok(TeamSummary::default());
        }
        let total_completed: u32 = all.iter().map(|p| p.tasks_completed).sum();
        let total_failed: u32 = all.iter().map(|p| p.tasks_failed).sum();
        let rates: Vec<f64> = all
            .iter()
            .filter(|p| p.tasks_completed + p.tasks_failed > 0)
            .map(|p| p.overall_success_rate())
            .collect();
        let average = if rates.is_empty() {
            0.0
        } else {
            rates.iter().sum::<f64>() / rates.len() as f64
        };
        Ok(TeamSummary {
            agents_tracked: all.len(),
            total_tasks_completed: total_completed,
            total_tasks_failed: total_failed,
            average_success_rate: average,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn record_outcome_ema_matches_decay_weight() {
        let mut metrics = SkillMetrics {
            skill: "python".into(),
            ..Default::default()
        };
        metrics.record_outcome(true, None);
        assert_eq!(metrics.success_rate, 1.0);
        metrics.record_outcome(false, None);
        // 1.0*0.9 + 0.0*0.1 = 0.9
        assert!((metrics.success_rate - 0.9).abs() < 1e-9);
    }

    #[test]
    fn record_outcome_tracks_completion_time_ema() {
        let mut metrics = SkillMetrics {
            skill: "python".into(),
            ..Default::default()
        };
        metrics.record_outcome(true, Some(10.0));
        assert_eq!(metrics.avg_completion_time, 10.0);
        metrics.record_outcome(true, Some(20.0));
        // 10.0*0.9 + 20.0*0.1 = 11.0
        assert!((metrics.avg_completion_time - 11.0).abs() < 1e-9);
    }

    #[test]
    fn trend_requires_minimum_experience() {
        let mut metrics = SkillMetrics {
            skill: "python".into(),
            ..Default::default()
        };
        for _ in 0..5 {
            metrics.record_outcome(true, None);
        }
        assert_eq!(metrics.trend(), None);
    }

    #[test]
    fn record_task_completed_updates_card_and_counters() {
        let tmp = TempDir::new().unwrap();
        let cards = CardRegistry::new(tmp.path());
        let now = Utc::now();
        cards
            .register(crate::cards::AgentCard {
                agent_id: "agent-1".into(),
                name: "agent-1".into(),
                skills: vec!["python".into()],
                tools: vec![],
                availability: crate::cards::Availability::Active,
                success_rates: HashMap::new(),
                specializations: vec![],
                metadata: serde_json::Value::Null,
                created_at: now,
                updated_at: now,
            })
            .unwrap();

        let learning = LearningStore::new(tmp.path());
        learning.record_task_started("agent-1", "t1").unwrap();
        let perf = learning
            .record_task_completed("agent-1", "t1", &["python".to_string()], true)
            .unwrap();
        assert_eq!(perf.tasks_completed, 1);
        assert_eq!(perf.tasks_in_progress, 0);
        assert!(!perf.task_start_times.contains_key("t1"));

        let card = cards.get("agent-1").unwrap();
        assert_eq!(card.success_rates["python"], 1.0);
    }

    #[test]
    fn leaderboard_sorts_descending() {
        let tmp = TempDir::new().unwrap();
        let learning = LearningStore::new(tmp.path());
        learning.record_task_completed("agent-1", "t1", &["python".to_string()], true).unwrap();
        learning.record_task_completed("agent-2", "t1", &["python".to_string()], false).unwrap();

        let board = learning.get_leaderboard(None).unwrap();
        assert_eq!(board[0].agent_id, "agent-1");
        assert_eq!(board[1].agent_id, "agent-2");
    }

    #[test]
    fn skill_experts_requires_minimum_experience() {
        let tmp = TempDir::new().unwrap();
        let learning = LearningStore::new(tmp.path());
        learning.record_task_completed("agent-1", "t1", &["rust".to_string()], true).unwrap();
        assert!(learning.get_skill_experts("rust").unwrap().is_empty());

        learning.record_task_completed("agent-1", "t2", &["rust".to_string()], true).unwrap();
        learning.record_task_completed("agent-1", "t3", &["rust".to_string()], true).unwrap();
        let experts = learning.get_skill_experts("rust").unwrap();
        assert_eq!(experts.len(), 1);
        assert_eq!(experts[0].agent_id, "agent-1");
    }
}
