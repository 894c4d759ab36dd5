//! Agent-card registry (spec §4.J): capability cards per agent with
//! success rates and availability. Grounded on
//! `examples/original_source/src/claudeswarm/agent_cards.py`.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SwarmError};
use crate::paths;
use crate::store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Active,
    Busy,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCard {
    pub agent_id: String,
    pub name: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    pub availability: Availability,
    #[serde(default)]
    pub success_rates: HashMap<String, f64>,
    #[serde(default)]
    pub specializations: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentCard {
    fn clamp_success_rates(&mut self) {
        for rate in self.success_rates.values_mut() {
            *rate = rate.clamp(0.0, 1.0);
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CardsFile {
    #[serde(default = "schema_version")]
    version: String,
    #[serde(default = "Utc::now")]
    updated_at: DateTime<Utc>,
    #[serde(default)]
    cards: Vec<AgentCard>,
}

fn schema_version() -> String {
    "1.0".to_string()
}

pub struct CardRegistry<'a> {
    root: &'a Path,
}

impl<'a> CardRegistry<'a> {
    pub fn new(root: &'a Path) -> Self {
        Self { root }
    }

    fn path(&self) -> std::path::PathBuf {
        paths::agent_cards_path(self.root)
    }

    /// Register (or overwrite) the card for `agent_id`. Success rates are
    /// clamped to `[0, 1]` (spec §3 invariant).
    pub fn register(&self, mut card: AgentCard) -> Result<AgentCard> {
        card.clamp_success_rates();
        store::write_locked(&self.path(), store::DEFAULT_LOCK_TIMEOUT, |mut file: CardsFile| {
            file.cards.retain(|c| c.agent_id != card.agent_id);
            file.cards.push(card.clone());
            file.updated_at = Utc::now();
            Ok(file)
        })?;
        Ok(card)
    }

    pub fn get(&self, agent_id: &str) -> Result<AgentCard> {
        let file: CardsFile = store::read_locked(&self.path(), store::DEFAULT_LOCK_TIMEOUT)?;
        file.cards
            .into_iter()
            .find(|c| c.agent_id == agent_id)
            .ok_or_else(|| SwarmError::NotFound(format!("agent card {agent_id}")))
    }

    pub fn list(&self) -> Result<Vec<AgentCard>> {
        let file: CardsFile = store::read_locked(&self.path(), store::DEFAULT_LOCK_TIMEOUT)?;
        Ok(file.cards)
    }

    /// Cards currently `active`, the pool the delegation engine draws from.
    pub fn list_active(&self) -> Result<Vec<AgentCard>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|c| c.availability == Availability::Active)
            .collect())
    }

    pub fn set_availability(&self, agent_id: &str, availability: Availability) -> Result<AgentCard> {
        let updated = store::write_locked(&self.path(), store::DEFAULT_LOCK_TIMEOUT, |mut file: CardsFile| {
            let card = file
                .cards
                .iter_mut()
                .find(|c| c.agent_id == agent_id)
                .ok_or_else(|| SwarmError::NotFound(format!("agent card {agent_id}")))?;
            card.availability = availability;
            card.updated_at = Utc::now();
            file.updated_at = Utc::now();
            Ok(file)
        })?;
        updated
            .cards
            .into_iter()
            .find(|c| c.agent_id == agent_id)
            .ok_or_else(|| SwarmError::NotFound(format!("agent card {agent_id}")))
    }

    /// Merge `skill -> rate` updates into an existing card, clamping to
    /// `[0, 1]`. Used by the learning store to propagate EMA'd success
    /// rates (spec §4.M).
    pub fn update_success_rates(&self, agent_id: &str, updates: &HashMap<String, f64>) -> Result<AgentCard> {
        let updates = updates.clone();
        let updated = store::write_locked(&self.path(), store::DEFAULT_LOCK_TIMEOUT, |mut file: CardsFile| {
            let card = file
                .cards
                .iter_mut()
                .find(|c| c.agent_id == agent_id)
                .ok_or_else(|| SwarmError::NotFound(format!("agent card {agent_id}")))?;
            for (skill, rate) in &updates {
                card.success_rates.insert(skill.clone(), rate.clamp(0.0, 1.0));
            }
            card.updated_at = Utc::now();
            file.updated_at = Utc::now();
            Ok(file)
        })?;
        updated
            .cards
            .into_iter()
            .find(|c| c.agent_id == agent_id)
            .ok_or_else(|| SwarmError::NotFound(format!("agent card {agent_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_card(agent_id: &str) -> AgentCard {
        let now = Utc::now();
        AgentCard {
            agent_id: agent_id.to_string(),
            name: agent_id.to_string(),
            skills: vec!["python".into()],
            tools: vec![],
            availability: Availability::Active,
            success_rates: HashMap::new(),
            specializations: vec![],
            metadata: Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn register_and_fetch_round_trips() {
        let tmp = TempDir::new().unwrap();
        let registry = CardRegistry::new(tmp.path());
        registry.register(sample_card("agent-1")).unwrap();
        let fetched = registry.get("agent-1").unwrap();
        assert_eq!(fetched.skills, vec!["python".to_string()]);
    }

    #[test]
    fn success_rates_clamped_on_register_and_update() {
        let tmp = TempDir::new().unwrap();
        let registry = CardRegistry::new(tmp.path());
        let mut card = sample_card("agent-1");
        card.success_rates.insert("python".into(), 1.5);
        registry.register(card).unwrap();
        let fetched = registry.get("agent-1").unwrap();
        assert_eq!(fetched.success_rates["python"], 1.0);

        let mut updates = HashMap::new();
        updates.insert("python".to_string(), -0.2);
        registry.update_success_rates("agent-1", &updates).unwrap();
        let fetched = registry.get("agent-1").unwrap();
        assert_eq!(fetched.success_rates["python"], 0.0);
    }

    #[test]
    fn list_active_filters_by_availability() {
        let tmp = TempDir::new().unwrap();
        let registry = CardRegistry::new(tmp.path());
        registry.register(sample_card("agent-1")).unwrap();
        let mut offline = sample_card("agent-2");
        offline.availability = Availability::Offline;
        registry.register(offline).unwrap();

        let active = registry.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].agent_id, "agent-1");
    }
}
