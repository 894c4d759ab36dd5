//! Delegation engine (spec §4.K): extracts skills from a task, scores
//! available agents, picks the best, and records the outcome. Grounded on
//! `examples/original_source/src/claudeswarm/delegation.py`.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::cards::{AgentCard, Availability, CardRegistry};
use crate::error::{Result, SwarmError};
use crate::paths;
use crate::store;
use crate::tasks::{Task, TaskPriority, TaskStore};

const MAX_DELEGATION_HISTORY: usize = 1000;
const SPECIALIZATION_BONUS_PER_SKILL: f64 = 0.05;
const MAX_SPECIALIZATION_BONUS: f64 = 0.15;
const NO_REQUIREMENTS_BASE_SCORE: f64 = 0.5;

fn file_extension_skills(ext: &str) -> Option<&'static [&'static str]> {
    Some(match ext {
        "py" => &["python", "backend"],
        "js" => &["javascript", "frontend"],
        "ts" => &["typescript", "frontend"],
        "tsx" => &["typescript", "react", "frontend"],
        "jsx" => &["javascript", "react", "frontend"],
        "go" => &["golang", "backend"],
        "rs" => &["rust", "systems"],
        "java" => &["java", "backend"],
        "kt" => &["kotlin", "android"],
        "swift" => &["swift", "ios"],
        "css" => &["css", "styling", "frontend"],
        "scss" => &["sass", "styling", "frontend"],
        "html" => &["html", "frontend"],
        "sql" => &["sql", "database"],
        "md" => &["documentation", "markdown"],
        "yaml" => &["yaml", "configuration"],
        "yml" => &["yaml", "configuration"],
        "json" => &["json", "configuration"],
        "toml" => &["toml", "configuration"],
        "sh" => &["shell", "scripting", "bash"],
        "dockerfile" => &["docker", "devops"],
        _ => return None,
    })
}

const KEYWORD_SKILLS: &[(&str, &[&str])] = &[
    ("test", &["testing"]),
    ("spec", &["testing"]),
    ("unit", &["testing", "unit-testing"]),
    ("integration", &["testing", "integration-testing"]),
    ("api", &["api", "backend"]),
    ("auth", &["authentication", "security"]),
    ("login", &["authentication"]),
    ("security", &["security"]),
    ("database", &["database"]),
    ("db", &["database"]),
    ("migration", &["database", "migration"]),
    ("docker", &["docker", "devops"]),
    ("deploy", &["deployment", "devops"]),
    ("ci", &["ci-cd", "devops"]),
    ("performance", &["performance", "optimization"]),
    ("refactor", &["refactoring", "code-quality"]),
    ("bug", &["debugging"]),
    ("fix", &["debugging"]),
    ("review", &["code-review"]),
    ("document", &["documentation"]),
    ("config", &["configuration"]),
    ("setup", &["configuration", "setup"]),
];

fn explicit_skill_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:requires?|needs?|expertise in|experience with)\s+(\w+)").unwrap()
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkillRequirement {
    pub skill: String,
    pub importance: f64,
    pub minimum_proficiency: f64,
}

/// Extract skill requirements from a task's files, objective, and
/// constraints (spec §4.J "Skill extraction"): file extensions at 0.8,
/// keyword scan at 0.7, explicit "requires/needs/expertise in/experience
/// with X" mentions at 1.0, deduplicated by maximum importance, returned
/// sorted descending.
pub fn extract_skills_from_task(task: &Task) -> Vec<SkillRequirement> {
    let mut skills: HashMap<String, f64> = HashMap::new();

    for filepath in &task.files {
        if let Some(ext) = Path::new(filepath)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
        {
            if let Some(mapped) = file_extension_skills(&ext) {
                for skill in mapped {
                    let entry = skills.entry(skill.to_string()).or_insert(0.0);
                    *entry = entry.max(0.8);
                }
            }
        }
    }

    let text = format!("{} {}", task.objective, task.constraints.join(" ")).to_lowercase();

    for (keyword, mapped) in KEYWORD_SKILLS {
        if text.contains(keyword) {
            for skill in *mapped {
                let entry = skills.entry(skill.to_string()).or_insert(0.0);
                *entry = entry.max(0.7);
            }
        }
    }

    for capture in explicit_skill_regex().captures_iter(&text) {
        if let Some(m) = capture.get(1) {
            let skill = m.as_str().to_string();
            let entry = skills.entry(skill).or_insert(0.0);
            *entry = entry.max(1.0);
        }
    }

    let mut requirements: Vec<SkillRequirement> = skills
        .into_iter()
        .map(|(skill, importance)| SkillRequirement {
            skill,
            importance,
            minimum_proficiency: 0.0,
        })
        .collect();
    requirements.sort_by(|a, b| b.importance.partial_cmp(&a.importance).unwrap());
    requirements
}

fn priority_boost(priority: TaskPriority) -> f64 {
    match priority {
        TaskPriority::Critical => 0.10,
        TaskPriority::High => 0.05,
        TaskPriority::Normal => 0.0,
        TaskPriority::Low => -0.05,
    }
}

fn skill_proficiency(agent: &AgentCard, skill: &str) -> f64 {
    agent.success_rates.get(skill).copied().unwrap_or(0.0)
}

/// Score `agent` against `requirements` (spec §4.J "Agent score"): weighted
/// mean of proficiency × importance, plus a capped specialization bonus and
/// a priority boost, clamped to `[0, 1]`. Returns `(score, per_skill_map)`.
/// Agents below an `is_available` check (handled by the caller via
/// [`Availability::Active`] filtering) are not scored here.
pub fn calculate_agent_score(
    agent: &AgentCard,
    requirements: &[SkillRequirement],
    priority_boost: f64,
) -> (f64, HashMap<String, f64>) {
    if requirements.is_empty() {
        return (
            (NO_REQUIREMENTS_BASE_SCORE + priority_boost).clamp(0.0, 1.0),
            HashMap::new(),
        );
    }

    let mut total_score = 0.0;
    let mut total_weight = 0.0;
    let mut skill_matches = HashMap::new();

    for req in requirements {
        let proficiency = skill_proficiency(agent, &req.skill);
        if proficiency < req.minimum_proficiency {
            skill_matches.insert(req.skill.clone(), 0.0);
            continue;
        }
        skill_matches.insert(req.skill.clone(), proficiency);
        total_score += proficiency * req.importance;
        total_weight += req.importance;
    }

    let base_score = if total_weight > 0.0 {
        total_score / total_weight
    } else {
        0.5
    };

    let mut specialization_bonus = 0.0;
    let specializations_lower: Vec<String> =
        agent.specializations.iter().map(|s| s.to_lowercase()).collect();
    for req in requirements {
        if specializations_lower.contains(&req.skill.to_lowercase()) {
            specialization_bonus += SPECIALIZATION_BONUS_PER_SKILL * req.importance;
        }
    }
    specialization_bonus = specialization_bonus.min(MAX_SPECIALIZATION_BONUS);

    let final_score = (base_score + specialization_bonus + priority_boost).min(1.0).max(0.0);
    (final_score, skill_matches)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationResult {
    pub success: bool,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub match_score: f64,
    #[serde(default)]
    pub skill_matches: HashMap<String, f64>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub alternatives: Vec<(String, f64)>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DelegationHistoryFile {
    #[serde(default = "schema_version")]
    version: String,
    #[serde(default = "Utc::now")]
    updated_at: DateTime<Utc>,
    #[serde(default)]
    history: Vec<DelegationResult>,
}

fn schema_version() -> String {
    "1.0".to_string()
}

pub struct DelegationEngine<'a> {
    root: &'a Path,
    cards: CardRegistry<'a>,
    tasks: TaskStore<'a>,
}

impl<'a> DelegationEngine<'a> {
    pub fn new(root: &'a Path) -> Self {
        Self {
            root,
            cards: CardRegistry::new(root),
            tasks: TaskStore::new(root),
        }
    }

    fn history_path(&self) -> std::path::PathBuf {
        paths::delegation_history_path(self.root)
    }

    fn record(&self, result: DelegationResult) -> Result<()> {
        store::write_locked(&self.history_path(), store::DEFAULT_LOCK_TIMEOUT, |mut file: DelegationHistoryFile| {
            file.history.push(result.clone());
            if file.history.len() > MAX_DELEGATION_HISTORY {
                let excess = file.history.len() - MAX_DELEGATION_HISTORY;
                file.history.drain(0..excess);
            }
            file.updated_at = Utc::now();
            Ok(file)
        })?;
        Ok(())
    }

    /// Find the best agent for `task` among active, non-excluded agents
    /// carrying every tool in `required_tools`. Returns `None` if the
    /// filtered pool is empty or every candidate scores 0.
    pub fn find_best(
        &self,
        task: &Task,
        exclude: &[String],
        required_tools: &[String],
    ) -> Result<Option<(AgentCard, f64, HashMap<String, f64>)>> {
        let mut agents = self.cards.list_active()?;
        agents.retain(|a| !exclude.contains(&a.agent_id));
        if !required_tools.is_empty() {
            agents.retain(|a| required_tools.iter().all(|t| a.tools.contains(t)));
        }
        if agents.is_empty() {
            return Ok(None);
        }

        let requirements = extract_skills_from_task(task);
        let boost = priority_boost(task.priority);

        let mut scored: Vec<(AgentCard, f64, HashMap<String, f64>)> = agents
            .into_iter()
            .map(|a| {
                let (score, matches) = calculate_agent_score(&a, &requirements, boost);
                (a, score, matches)
            })
            .filter(|(_, score, _)| *score > 0.0)
            .collect();

        if scored.is_empty() {
            return Ok(None);
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        Ok(Some(scored.remove(0)))
    }

    /// Delegate `task` to `agent_id` if given, otherwise to the result of
    /// [`find_best`]. Assigns the task via the task store and records the
    /// outcome (capped at [`MAX_DELEGATION_HISTORY`] entries).
    pub fn delegate(&self, task: &Task, agent_id: Option<&str>) -> Result<DelegationResult> {
        let requirements = extract_skills_from_task(task);
        let task_id = task.task_id.to_string();

        let (agent_id, match_score, skill_matches, alternatives) = match agent_id {
            None => {
                let Some((best, score, matches)) = self.find_best(task, &[], &[])? else {
                    let result = DelegationResult {
                        success: false,
                        task_id: task_id.clone(),
                        agent_id: None,
                        match_score: 0.0,
                        skill_matches: HashMap::new(),
                        reason: "No suitable agent found for this task".to_string(),
                        alternatives: vec![],
                        timestamp: Utc::now(),
                    };
                    self.record(result.clone())?;
                    return Err(SwarmError::NotFound(result.reason));
                };

                let mut alternatives: Vec<(String, f64)> = self
                    .cards
                    .list_active()?
                    .into_iter()
                    .filter(|a| a.agent_id != best.agent_id)
                    .filter_map(|a| {
                        let (alt_score, _) = calculate_agent_score(&a, &requirements, 0.0);
                        (alt_score > 0.0).then_some((a.agent_id, alt_score))
                    })
                    .collect();
                alternatives.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
                alternatives.truncate(3);

                (best.agent_id, score, matches, alternatives)
            }
            Some(id) => {
                let agent = match self.cards.get(id) {
                    Ok(a) => a,
                    Err(_) => {
                        let result = DelegationResult {
                            success: false,
                            task_id: task_id.clone(),
                            agent_id: Some(id.to_string()),
                            match_score: 0.0,
                            skill_matches: HashMap::new(),
                            reason: format!("Agent {id} not found"),
                            alternatives: vec![],
                            timestamp: Utc::now(),
                        };
                        self.record(result.clone())?;
                        return Err(SwarmError::NotFound(result.reason));
                    }
                };
                if agent.availability != Availability::Active {
                    let result = DelegationResult {
                        success: false,
                        task_id: task_id.clone(),
                        agent_id: Some(id.to_string()),
                        match_score: 0.0,
                        skill_matches: HashMap::new(),
                        reason: format!("Agent {id} is not available"),
                        alternatives: vec![],
                        timestamp: Utc::now(),
                    };
                    self.record(result.clone())?;
                    return Err(SwarmError::Conflict(result.reason));
                }
                let (score, matches) = calculate_agent_score(&agent, &requirements, 0.0);
                (agent.agent_id, score, matches, vec![])
            }
        };

        self.tasks.assign(task.task_id, &agent_id)?;

        let result = DelegationResult {
            success: true,
            task_id,
            agent_id: Some(agent_id.clone()),
            match_score,
            skill_matches,
            reason: format!("Task delegated to {agent_id}"),
            alternatives,
            timestamp: Utc::now(),
        };
        self.record(result.clone())?;
        Ok(result)
    }

    pub fn history(&self) -> Result<Vec<DelegationResult>> {
        let file: DelegationHistoryFile = store::read_locked(&self.history_path(), store::DEFAULT_LOCK_TIMEOUT)?;
        Ok(file.history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskStore;

    fn sample_card(agent_id: &str, skills: &[&str], specializations: &[&str], python_rate: f64) -> AgentCard {
        let now = Utc::now();
        let mut success_rates = HashMap::new();
        success_rates.insert("python".to_string(), python_rate);
        AgentCard {
            agent_id: agent_id.to_string(),
            name: agent_id.to_string(),
            skills: skills.iter().map(|s| s.to_string()).collect(),
            tools: vec![],
            availability: Availability::Active,
            success_rates,
            specializations: specializations.iter().map(|s| s.to_string()).collect(),
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn extract_skills_combines_files_keywords_and_explicit_mentions() {
        let tmp = tempfile::TempDir::new().unwrap();
        let task_store = TaskStore::new(tmp.path());
        let task = task_store
            .create(
                "Requires python expertise and add tests",
                "agent-0",
                TaskPriority::Normal,
                None,
                vec![],
                vec!["src/main.py".to_string()],
                None,
            )
            .unwrap();
        let requirements = extract_skills_from_task(&task);
        let skill_names: Vec<&str> = requirements.iter().map(|r| r.skill.as_str()).collect();
        assert!(skill_names.contains(&"python"));
        assert!(skill_names.contains(&"testing"));
        assert!(skill_names.contains(&"backend"));
    }

    #[test]
    fn delegation_scoring_matches_literal_scenario() {
        let tmp = tempfile::TempDir::new().unwrap();
        let task_store = TaskStore::new(tmp.path());
        let task = task_store
            .create(
                "Requires python expertise and add tests",
                "agent-0",
                TaskPriority::Normal,
                None,
                vec![],
                vec!["src/main.py".to_string()],
                None,
            )
            .unwrap();

        let engine = DelegationEngine::new(tmp.path());
        let python_agent = sample_card("python-agent", &["python", "backend", "testing"], &["python"], 0.9);
        let frontend_agent = sample_card("frontend-agent", &["javascript", "frontend"], &[], 0.0);
        engine.cards.register(python_agent).unwrap();
        engine.cards.register(frontend_agent).unwrap();

        let (best, best_score, _) = engine.find_best(&task, &[], &[]).unwrap().unwrap();
        assert_eq!(best.agent_id, "python-agent");

        let requirements = extract_skills_from_task(&task);
        let (frontend_score, _) = calculate_agent_score(
            &engine.cards.get("frontend-agent").unwrap(),
            &requirements,
            0.0,
        );
        assert!(best_score > frontend_score);
    }

    #[test]
    fn no_requirements_scores_baseline_plus_priority() {
        let agent = sample_card("agent-1", &[], &[], 0.0);
        let (score, matches) = calculate_agent_score(&agent, &[], priority_boost(TaskPriority::Critical));
        assert!(matches.is_empty());
        assert!((score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn specialization_bonus_is_capped() {
        let mut agent = sample_card("agent-1", &[], &["a", "b", "c", "d"], 1.0);
        agent.success_rates.insert("a".into(), 1.0);
        agent.success_rates.insert("b".into(), 1.0);
        agent.success_rates.insert("c".into(), 1.0);
        agent.success_rates.insert("d".into(), 1.0);
        let requirements: Vec<SkillRequirement> = ["a", "b", "c", "d"]
            .iter()
            .map(|s| SkillRequirement {
                skill: s.to_string(),
                importance: 1.0,
                minimum_proficiency: 0.0,
            })
            .collect();
        let (score, _) = calculate_agent_score(&agent, &requirements, 0.0);
        // base_score = 1.0 (perfect proficiency), bonus capped at 0.15, clamped to 1.0.
        assert_eq!(score, 1.0);
    }

    #[test]
    fn delegate_assigns_task_and_records_history() {
        let tmp = tempfile::TempDir::new().unwrap();
        let task_store = TaskStore::new(tmp.path());
        let task = task_store
            .create("Requires python expertise", "agent-0", TaskPriority::Normal, None, vec![], vec![], None)
            .unwrap();

        let engine = DelegationEngine::new(tmp.path());
        engine
            .cards
            .register(sample_card("python-agent", &["python"], &["python"], 0.9))
            .unwrap();

        let result = engine.delegate(&task, None).unwrap();
        assert!(result.success);
        assert_eq!(result.agent_id.as_deref(), Some("python-agent"));

        let assigned = task_store.assign(task.task_id, "python-agent");
        // Already assigned by delegate(); re-assigning from pending would be
        // invalid now since the task left `pending`.
        assert!(assigned.is_err());

        let history = engine.history().unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
    }
}
