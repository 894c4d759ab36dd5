//! Per-agent memory store (spec §4.M): task history, learned patterns,
//! peer relationships, and free-form knowledge, one JSON document per agent
//! under `.agent_memory/`. Grounded on
//! `examples/original_source/src/claudeswarm/memory.py`.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::paths;
use crate::store;

pub const MAX_TASK_HISTORY: usize = 50;
pub const MAX_PATTERNS: usize = 100;
pub const MAX_KNOWLEDGE_ITEMS: usize = 200;

/// Weight applied when reinforcing an existing pattern's confidence.
const PATTERN_REINFORCE_WEIGHT: f64 = 0.2;
/// Interaction count above which relationship blending saturates at its
/// floor weight.
const RELATIONSHIP_BLEND_FLOOR: f64 = 0.3;
const RELATIONSHIP_BLEND_NUMERATOR: f64 = 5.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMemory {
    pub task_id: String,
    pub objective: String,
    pub outcome: String,
    #[serde(default)]
    pub lessons: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub pattern_id: String,
    pub description: String,
    pub context: String,
    pub confidence: f64,
    pub times_seen: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl LearnedPattern {
    /// Blend a fresh observation's confidence into the running value with
    /// an exponential moving average, and bump the sighting count.
    fn reinforce(&mut self, observed_confidence: f64, now: DateTime<Utc>) {
        self.confidence = self.confidence * (1.0 - PATTERN_REINFORCE_WEIGHT)
            + observed_confidence * PATTERN_REINFORCE_WEIGHT;
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self.times_seen += 1;
        self.last_seen = now;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRelationship {
    pub agent_id: String,
    #[serde(default)]
    pub interactions: u32,
    #[serde(default)]
    pub positive_interactions: u32,
    #[serde(default)]
    pub negative_interactions: u32,
    #[serde(default = "default_midpoint")]
    pub trust: f64,
    #[serde(default = "default_midpoint")]
    pub reliability: f64,
    #[serde(default)]
    pub shared_tasks: u32,
    pub last_interaction: DateTime<Utc>,
}

fn default_midpoint() -> f64 {
    0.5
}

impl AgentRelationship {
    /// Blend trust and reliability toward the cumulative positive/total
    /// interaction ratio, weighted by [`RELATIONSHIP_BLEND_NUMERATOR`] /
    /// total (capped at [`RELATIONSHIP_BLEND_FLOOR`]): early interactions
    /// move the scores quickly, later ones barely nudge them.
    fn record_interaction(&mut self, positive: bool, now: DateTime<Utc>) {
        self.interactions += 1;
        if positive {
            self.positive_interactions += 1;
        } else {
            self.negative_interactions += 1;
        }
        let total = self.positive_interactions + self.negative_interactions;
        if total > 0 {
            let positive_ratio = self.positive_interactions as f64 / total as f64;
            let weight = (RELATIONSHIP_BLEND_NUMERATOR / total as f64).min(RELATIONSHIP_BLEND_FLOOR);
            self.trust = (self.trust * (1.0 - weight) + positive_ratio * weight).clamp(0.0, 1.0);
            self.reliability =
                (self.reliability * (1.0 - weight) + positive_ratio * weight).clamp(0.0, 1.0);
        }
        self.last_interaction = now;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub key: String,
    pub value: Value,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AgentMemory {
    pub agent_id: String,
    #[serde(default)]
    pub task_history: Vec<TaskMemory>,
    #[serde(default)]
    pub patterns: Vec<LearnedPattern>,
    #[serde(default)]
    pub relationships: HashMap<String, AgentRelationship>,
    #[serde(default)]
    pub knowledge: Vec<KnowledgeItem>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl AgentMemory {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            updated_at: Utc::now(),
            ..Default::default()
        }
    }
}

/// Deterministic pattern id: the original hashes the description with md5
/// and truncates to 12 hex chars; we do the same with sha2 (already a
/// dependency elsewhere in this crate) since md5 isn't in the stack.
fn pattern_id(description: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(description.as_bytes());
    let digest = hasher.finalize();
    format!("{digest:x}")[..12].to_string()
}

pub struct MemoryStore<'a> {
    root: &'a Path,
}

impl<'a> MemoryStore<'a> {
    pub fn new(root: &'a Path) -> Self {
        Self { root }
    }

    fn path(&self, agent_id: &str) -> std::path::PathBuf {
        paths::agent_memory_path(self.root, agent_id)
    }

    /// Load `agent_id`'s memory, or a fresh empty one if none exists yet.
    pub fn get_memory(&self, agent_id: &str) -> Result<AgentMemory> {
        let mut memory: AgentMemory = store::read_locked(&self.path(agent_id), store::DEFAULT_LOCK_TIMEOUT)?;
        if memory.agent_id.is_empty() {
            memory.agent_id = agent_id.to_string();
        }
        Ok(memory)
    }

    pub fn delete_memory(&self, agent_id: &str) -> Result<bool> {
        let path = self.path(agent_id);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path).map_err(|e| crate::error::SwarmError::Io {
            path: path.clone(),
            source: e,
        })?;
        Ok(true)
    }

    pub fn list_agents_with_memory(&self) -> Result<Vec<String>> {
        let dir = paths::memory_dir(self.root);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut agents: Vec<String> = std::fs::read_dir(&dir)
            .map_err(|e| crate::error::SwarmError::Io {
                path: dir.clone(),
                source: e,
            })?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    return None;
                }
                path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
            })
            .collect();
        agents.sort();
        Ok(agents)
    }

    /// Record a completed task, capping history at [`MAX_TASK_HISTORY`]
    /// (oldest dropped first).
    pub fn remember_task(
        &self,
        agent_id: &str,
        task_id: &str,
        objective: &str,
        outcome: &str,
        lessons: Vec<String>,
    ) -> Result<AgentMemory> {
        self.update(agent_id, |memory| {
            memory.task_history.insert(
                0,
                TaskMemory {
                    task_id: task_id.to_string(),
                    objective: objective.to_string(),
                    outcome: outcome.to_string(),
                    lessons,
                    completed_at: Utc::now(),
                },
            );
            memory.task_history.truncate(MAX_TASK_HISTORY);
        })
    }

    /// Record (or reinforce, if already known) a pattern. Patterns are
    /// deduplicated by a hash of their description. Capped at
    /// [`MAX_PATTERNS`]; when full, the least-confident pattern is evicted.
    pub fn learn_pattern(&self, agent_id: &str, description: &str, context: &str, confidence: f64) -> Result<AgentMemory> {
        self.update(agent_id, |memory| {
            let id = pattern_id(description);
            let now = Utc::now();
            if let Some(existing) = memory.patterns.iter_mut().find(|p| p.pattern_id == id) {
                existing.reinforce(confidence, now);
                return;
            }
            if memory.patterns.len() >= MAX_PATTERNS {
                if let Some((idx, _)) = memory
                    .patterns
                    .iter()
                    .enumerate()
                    .min_by(|a, b| a.1.confidence.total_cmp(&b.1.confidence))
                {
                    memory.patterns.remove(idx);
                }
            }
            memory.patterns.push(LearnedPattern {
                pattern_id: id,
                description: description.to_string(),
                context: context.to_string(),
                confidence: confidence.clamp(0.0, 1.0),
                times_seen: 1,
                first_seen: now,
                last_seen: now,
            });
        })
    }

    /// Patterns above `min_confidence`, most confident first.
    pub fn get_effective_patterns(&self, agent_id: &str, min_confidence: f64) -> Result<Vec<LearnedPattern>> {
        let memory = self.get_memory(agent_id)?;
        let mut patterns: Vec<LearnedPattern> = memory
            .patterns
            .into_iter()
            .filter(|p| p.confidence >= min_confidence)
            .collect();
        patterns.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(patterns)
    }

    pub fn get_relationship(&self, agent_id: &str, peer_id: &str) -> Result<Option<AgentRelationship>> {
        Ok(self.get_memory(agent_id)?.relationships.remove(peer_id))
    }

    /// Update `agent_id`'s relationship with `peer_id` from a fresh
    /// interaction outcome; creates the relationship row on first contact.
    pub fn record_interaction(
        &self,
        agent_id: &str,
        peer_id: &str,
        positive: bool,
        shared_task: bool,
    ) -> Result<AgentMemory> {
        self.update(agent_id, |memory| {
            let now = Utc::now();
            let relationship = memory
                .relationships
                .entry(peer_id.to_string())
                .or_insert_with(|| AgentRelationship {
                    agent_id: peer_id.to_string(),
                    interactions: 0,
                    positive_interactions: 0,
                    negative_interactions: 0,
                    trust: default_midpoint(),
                    reliability: default_midpoint(),
                    shared_tasks: 0,
                    last_interaction: now,
                });
            relationship.record_interaction(positive, now);
            if shared_task {
                relationship.shared_tasks += 1;
            }
        })
    }

    /// Relationships with `trust >= min_trust`, most trusted first.
    pub fn get_trusted_agents(&self, agent_id: &str, min_trust: f64) -> Result<Vec<AgentRelationship>> {
        let memory = self.get_memory(agent_id)?;
        let mut relationships: Vec<AgentRelationship> = memory
            .relationships
            .into_values()
            .filter(|r| r.trust >= min_trust)
            .collect();
        relationships.sort_by(|a, b| b.trust.total_cmp(&a.trust));
        Ok(relationships)
    }

    /// Store a free-form knowledge item under `key`, replacing any existing
    /// value for that key. Capped at [`MAX_KNOWLEDGE_ITEMS`] (oldest dropped
    /// first).
    pub fn store_knowledge(&self, agent_id: &str, key: &str, value: Value) -> Result<AgentMemory> {
        self.update(agent_id, |memory| {
            memory.knowledge.retain(|k| k.key != key);
            memory.knowledge.push(KnowledgeItem {
                key: key.to_string(),
                value: value.clone(),
                stored_at: Utc::now(),
            });
            if memory.knowledge.len() > MAX_KNOWLEDGE_ITEMS {
                let overflow = memory.knowledge.len() - MAX_KNOWLEDGE_ITEMS;
                memory.knowledge.drain(0..overflow);
            }
        })
    }

    pub fn recall_knowledge(&self, agent_id: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .get_memory(agent_id)?
            .knowledge
            .into_iter()
            .find(|k| k.key == key)
            .map(|k| k.value))
    }

    /// A short human-readable summary: task count, top patterns, trusted
    /// peer count. Used by the CLI's `memory-summary` output.
    pub fn get_memory_summary(&self, agent_id: &str) -> Result<MemorySummary> {
        let memory = self.get_memory(agent_id)?;
        let effective_patterns = memory.patterns.iter().filter(|p| p.confidence >= 0.5).count();
        let trusted_peers = memory.relationships.values().filter(|r| r.trust >= 0.5).count();
        Ok(MemorySummary {
            agent_id: agent_id.to_string(),
            tasks_remembered: memory.task_history.len(),
            patterns_learned: memory.patterns.len(),
            effective_patterns,
            known_peers: memory.relationships.len(),
            trusted_peers,
            knowledge_items: memory.knowledge.len(),
        })
    }

    fn update(&self, agent_id: &str, mutate: impl FnOnce(&mut AgentMemory)) -> Result<AgentMemory> {
        let agent_id_owned = agent_id.to_string();
        store::write_locked(&self.path(agent_id), store::DEFAULT_LOCK_TIMEOUT, move |mut memory: AgentMemory| {
            if memory.agent_id.is_empty() {
                memory = AgentMemory::new(&agent_id_owned);
            }
            mutate(&mut memory);
            memory.updated_at = Utc::now();
            Ok(memory)
        })
    }
}

#[derive(Debug, Serialize)]
pub struct MemorySummary {
    pub agent_id: String,
    pub tasks_remembered: usize,
    pub patterns_learned: usize,
    pub effective_patterns: usize,
    pub known_peers: usize,
    pub trusted_peers: usize,
    pub knowledge_items: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn remember_task_caps_history() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new(tmp.path());
        for i in 0..(MAX_TASK_HISTORY + 10) {
            store
                .remember_task("agent-1", &format!("task-{i}"), "obj", "success", vec![])
                .unwrap();
        }
        let memory = store.get_memory("agent-1").unwrap();
        assert_eq!(memory.task_history.len(), MAX_TASK_HISTORY);
        // newest-first: the most recently remembered task leads, and the
        // oldest entries beyond the cap were dropped off the tail.
        assert_eq!(memory.task_history[0].task_id, format!("task-{}", MAX_TASK_HISTORY + 9));
        assert_eq!(memory.task_history[MAX_TASK_HISTORY - 1].task_id, "task-10");
    }

    #[test]
    fn learn_pattern_dedups_by_description_and_reinforces() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new(tmp.path());
        store
            .learn_pattern("agent-1", "retry on flaky network call", "networking", 0.6)
            .unwrap();
        store
            .learn_pattern("agent-1", "retry on flaky network call", "networking", 0.9)
            .unwrap();
        let memory = store.get_memory("agent-1").unwrap();
        assert_eq!(memory.patterns.len(), 1);
        assert_eq!(memory.patterns[0].times_seen, 2);
        // EMA toward 0.9 with weight 0.2: 0.6*0.8 + 0.9*0.2 = 0.66
        assert!((memory.patterns[0].confidence - 0.66).abs() < 1e-9);
    }

    #[test]
    fn record_interaction_blend_weight_shrinks_with_count() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new(tmp.path());
        store.record_interaction("agent-1", "agent-2", true, true).unwrap();
        let after_first = store.get_relationship("agent-1", "agent-2").unwrap().unwrap();
        // weight = min(0.3, 5/1) = 0.3; ratio = 1/1 = 1.0; trust = 0.5*0.7 + 1.0*0.3 = 0.65
        assert!((after_first.trust - 0.65).abs() < 1e-9);
        assert_eq!(after_first.shared_tasks, 1);

        for _ in 0..20 {
            store.record_interaction("agent-1", "agent-2", false, false).unwrap();
        }
        let after_many = store.get_relationship("agent-1", "agent-2").unwrap().unwrap();
        assert!(after_many.trust < after_first.trust);
        assert_eq!(after_many.shared_tasks, 1);
    }

    #[test]
    fn record_interaction_blends_toward_cumulative_ratio() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new(tmp.path());
        // positive, positive, negative, positive: ratio after each call is
        // cumulative (1/1, 2/2, 2/3, 3/4), not the latest call alone.
        store.record_interaction("agent-1", "agent-2", true, false).unwrap();
        store.record_interaction("agent-1", "agent-2", true, false).unwrap();
        store.record_interaction("agent-1", "agent-2", false, false).unwrap();
        let relationship = store
            .record_interaction("agent-1", "agent-2", true, false)
            .unwrap()
            .relationships
            .remove("agent-2")
            .unwrap();
        assert_eq!(relationship.positive_interactions, 3);
        assert_eq!(relationship.negative_interactions, 1);
        // weight = min(0.3, 5/total) = 0.3 throughout this short a run.
        // 0.5 -> 0.65 -> 0.755 -> 0.7285 -> 0.73495
        assert!((relationship.trust - 0.73495).abs() < 1e-9);
        assert_eq!(relationship.trust, relationship.reliability);
    }

    #[test]
    fn knowledge_store_and_recall_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new(tmp.path());
        store
            .store_knowledge("agent-1", "preferred-style", serde_json::json!("tabs"))
            .unwrap();
        let value = store.recall_knowledge("agent-1", "preferred-style").unwrap();
        assert_eq!(value, Some(serde_json::json!("tabs")));
        assert_eq!(store.recall_knowledge("agent-1", "missing").unwrap(), None);
    }

    #[test]
    fn delete_and_list_agents_with_memory() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new(tmp.path());
        store.store_knowledge("agent-1", "k", serde_json::json!(1)).unwrap();
        store.store_knowledge("agent-2", "k", serde_json::json!(2)).unwrap();
        let agents = store.list_agents_with_memory().unwrap();
        assert_eq!(agents, vec!["agent-1".to_string(), "agent-2".to_string()]);

        assert!(store.delete_memory("agent-1").unwrap());
        assert!(!store.delete_memory("agent-1").unwrap());
        let agents = store.list_agents_with_memory().unwrap();
        assert_eq!(agents, vec!["agent-2".to_string()]);
    }
}
