//! Shared work contexts (spec §3, §4): a grouping entity that ties together
//! related tasks, decisions, touched files, and messages under a single
//! named effort. Grounded on
//! `examples/original_source/src/claudeswarm/context.py`.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SwarmError};
use crate::paths;
use crate::store;

pub const MAX_DECISIONS_PER_CONTEXT: usize = 100;
pub const MAX_FILES_PER_CONTEXT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStatus {
    Active,
    Completed,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextDecision {
    pub decision: String,
    pub by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub alternatives_considered: Vec<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedContext {
    pub context_id: String,
    pub name: String,
    #[serde(default)]
    pub summary: String,
    pub status: ContextStatus,
    #[serde(default)]
    pub decisions: Vec<ContextDecision>,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub related_contexts: Vec<String>,
    #[serde(default)]
    pub agents_involved: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<String>,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl SharedContext {
    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn note_agent(&mut self, agent_id: &str) {
        if !self.agents_involved.iter().any(|a| a == agent_id) {
            self.agents_involved.push(agent_id.to_string());
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ContextsFile {
    #[serde(default = "schema_version")]
    version: String,
    #[serde(default = "Utc::now")]
    updated_at: DateTime<Utc>,
    #[serde(default)]
    contexts: Vec<SharedContext>,
}

fn schema_version() -> String {
    "1.0".to_string()
}

fn slugify(name: &str) -> String {
    let slug: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let collapsed = slug
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if collapsed.is_empty() {
        "context".to_string()
    } else {
        collapsed
    }
}

#[derive(Debug, Default, Clone)]
pub struct ContextFilter {
    pub status: Option<ContextStatus>,
    pub agent_id: Option<String>,
    pub include_archived: bool,
}

pub struct ContextStore<'a> {
    root: &'a Path,
}

impl<'a> ContextStore<'a> {
    pub fn new(root: &'a Path) -> Self {
        Self { root }
    }

    fn path(&self) -> std::path::PathBuf {
        paths::contexts_path(self.root)
    }

    /// Create a context. If `context_id` is `None`, one is derived from a
    /// slug of `name` plus an 8-char uuid suffix, matching the original's
    /// auto-id scheme.
    pub fn create_context(
        &self,
        context_id: Option<String>,
        name: &str,
        summary: &str,
        created_by: &str,
    ) -> Result<SharedContext> {
        let context_id = context_id.unwrap_or_else(|| {
            format!("{}-{}", slugify(name), &uuid::Uuid::new_v4().to_string()[..8])
        });
        let now = Utc::now();
        let context = SharedContext {
            context_id,
            name: name.to_string(),
            summary: summary.to_string(),
            status: ContextStatus::Active,
            decisions: Vec::new(),
            files_touched: Vec::new(),
            related_contexts: Vec::new(),
            agents_involved: vec![created_by.to_string()],
            tasks: Vec::new(),
            messages: Vec::new(),
            notes: Vec::new(),
            created_at: now,
            updated_at: now,
            created_by: created_by.to_string(),
            metadata: Value::Null,
        };
        store::write_locked(&self.path(), store::DEFAULT_LOCK_TIMEOUT, |mut file: ContextsFile| {
            file.contexts.push(context.clone());
            file.updated_at = Utc::now();
            Ok(file)
        })?;
        Ok(context)
    }

    pub fn get_context(&self, context_id: &str) -> Result<SharedContext> {
        let file: ContextsFile = store::read_locked(&self.path(), store::DEFAULT_LOCK_TIMEOUT)?;
        file.contexts
            .into_iter()
            .find(|c| c.context_id == context_id)
            .ok_or_else(|| SwarmError::NotFound(format!("context {context_id}")))
    }

    /// Fetch `context_id`, creating it with `name`/`summary` if absent.
    pub fn get_or_create_context(
        &self,
        context_id: &str,
        name: &str,
        summary: &str,
        created_by: &str,
    ) -> Result<SharedContext> {
        match self.get_context(context_id) {
            Ok(context) => Ok(context),
            Err(SwarmError::NotFound(_)) => {
                self.create_context(Some(context_id.to_string()), name, summary, created_by)
            }
            Err(e) => Err(e),
        }
    }

    fn update<F>(&self, context_id: &str, mutate: F) -> Result<SharedContext>
    where
        F: FnOnce(&mut SharedContext),
    {
        store::write_locked(&self.path(), store::DEFAULT_LOCK_TIMEOUT, |mut file: ContextsFile| {
            let context = file
                .contexts
                .iter_mut()
                .find(|c| c.context_id == context_id)
                .ok_or_else(|| SwarmError::NotFound(format!("context {context_id}")))?;
            mutate(context);
            context.touch();
            file.updated_at = Utc::now();
            Ok(file)
        })?
        .contexts
        .into_iter()
        .find(|c| c.context_id == context_id)
        .ok_or_else(|| SwarmError::NotFound(format!("context {context_id}")))
    }

    /// Overwrite `name`/`summary` when `Some`.
    pub fn update_context(
        &self,
        context_id: &str,
        name: Option<&str>,
        summary: Option<&str>,
    ) -> Result<SharedContext> {
        self.update(context_id, |context| {
            if let Some(name) = name {
                context.name = name.to_string();
            }
            if let Some(summary) = summary {
                context.summary = summary.to_string();
            }
        })
    }

    pub fn delete_context(&self, context_id: &str) -> Result<bool> {
        let mut found = false;
        store::write_locked(&self.path(), store::DEFAULT_LOCK_TIMEOUT, |mut file: ContextsFile| {
            let before = file.contexts.len();
            file.contexts.retain(|c| c.context_id != context_id);
            found = file.contexts.len() != before;
            file.updated_at = Utc::now();
            Ok(file)
        })?;
        Ok(found)
    }

    /// List contexts matching `filter`, sorted by `updated_at` descending
    /// (most recently touched first).
    pub fn list_contexts(&self, filter: &ContextFilter) -> Result<Vec<SharedContext>> {
        let file: ContextsFile = store::read_locked(&self.path(), store::DEFAULT_LOCK_TIMEOUT)?;
        let mut contexts: Vec<SharedContext> = file
            .contexts
            .into_iter()
            .filter(|c| filter.include_archived || c.status != ContextStatus::Archived)
            .filter(|c| filter.status.map(|s| s == c.status).unwrap_or(true))
            .filter(|c| {
                filter
                    .agent_id
                    .as_ref()
                    .map(|a| c.agents_involved.iter().any(|x| x == a))
                    .unwrap_or(true)
            })
            .collect();
        contexts.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(contexts)
    }

    pub fn get_active_contexts(&self) -> Result<Vec<SharedContext>> {
        self.list_contexts(&ContextFilter {
            status: Some(ContextStatus::Active),
            ..Default::default()
        })
    }

    /// Record a decision, capping at [`MAX_DECISIONS_PER_CONTEXT`] (oldest
    /// dropped first), and note `by` as an involved agent.
    pub fn add_decision(
        &self,
        context_id: &str,
        decision: &str,
        by: &str,
        reason: Option<&str>,
        alternatives_considered: Vec<String>,
    ) -> Result<SharedContext> {
        self.update(context_id, |context| {
            context.decisions.push(ContextDecision {
                decision: decision.to_string(),
                by: by.to_string(),
                reason: reason.map(str::to_string),
                alternatives_considered,
                metadata: Value::Null,
                timestamp: Utc::now(),
            });
            if context.decisions.len() > MAX_DECISIONS_PER_CONTEXT {
                let overflow = context.decisions.len() - MAX_DECISIONS_PER_CONTEXT;
                context.decisions.drain(0..overflow);
            }
            context.note_agent(by);
        })
    }

    /// Record that `filepath` was touched, capping at
    /// [`MAX_FILES_PER_CONTEXT`] (oldest dropped first); no-op if already
    /// present (moves it to the end as most-recent).
    pub fn touch_file(&self, context_id: &str, filepath: &str, agent_id: &str) -> Result<SharedContext> {
        self.update(context_id, |context| {
            context.files_touched.retain(|f| f != filepath);
            context.files_touched.push(filepath.to_string());
            if context.files_touched.len() > MAX_FILES_PER_CONTEXT {
                let overflow = context.files_touched.len() - MAX_FILES_PER_CONTEXT;
                context.files_touched.drain(0..overflow);
            }
            context.note_agent(agent_id);
        })
    }

    pub fn add_task(&self, context_id: &str, task_id: &str) -> Result<SharedContext> {
        self.update(context_id, |context| {
            if !context.tasks.iter().any(|t| t == task_id) {
                context.tasks.push(task_id.to_string());
            }
        })
    }

    pub fn add_message(&self, context_id: &str, msg_id: &str, agent_id: &str) -> Result<SharedContext> {
        self.update(context_id, |context| {
            context.messages.push(msg_id.to_string());
            context.note_agent(agent_id);
        })
    }

    pub fn add_note(&self, context_id: &str, note: &str) -> Result<SharedContext> {
        self.update(context_id, |context| {
            context.notes.push(note.to_string());
        })
    }

    /// Bidirectionally link two contexts.
    pub fn link_contexts(&self, a: &str, b: &str) -> Result<()> {
        self.update(a, |context| {
            if !context.related_contexts.iter().any(|c| c == b) {
                context.related_contexts.push(b.to_string());
            }
        })?;
        self.update(b, |context| {
            if !context.related_contexts.iter().any(|c| c == a) {
                context.related_contexts.push(a.to_string());
            }
        })?;
        Ok(())
    }

    pub fn complete_context(&self, context_id: &str) -> Result<SharedContext> {
        self.update(context_id, |context| {
            context.status = ContextStatus::Completed;
        })
    }

    pub fn archive_context(&self, context_id: &str) -> Result<SharedContext> {
        self.update(context_id, |context| {
            context.status = ContextStatus::Archived;
        })
    }

    /// Case-insensitive substring search over name, summary, and notes.
    pub fn search_contexts(&self, query: &str) -> Result<Vec<SharedContext>> {
        let needle = query.to_ascii_lowercase();
        let file: ContextsFile = store::read_locked(&self.path(), store::DEFAULT_LOCK_TIMEOUT)?;
        Ok(file
            .contexts
            .into_iter()
            .filter(|c| {
                c.name.to_ascii_lowercase().contains(&needle)
                    || c.summary.to_ascii_lowercase().contains(&needle)
                    || c.notes.iter().any(|n| n.to_ascii_lowercase().contains(&needle))
            })
            .collect())
    }

    pub fn get_context_summary(&self, context_id: &str) -> Result<ContextSummary> {
        let context = self.get_context(context_id)?;
        Ok(ContextSummary {
            context_id: context.context_id,
            name: context.name,
            status: context.status,
            decisions: context.decisions.len(),
            files_touched: context.files_touched.len(),
            agents_involved: context.agents_involved.len(),
            tasks: context.tasks.len(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ContextSummary {
    pub context_id: String,
    pub name: String,
    pub status: ContextStatus,
    pub decisions: usize,
    pub files_touched: usize,
    pub agents_involved: usize,
    pub tasks: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_without_id_slugifies_name() {
        let tmp = TempDir::new().unwrap();
        let store = ContextStore::new(tmp.path());
        let context = store
            .create_context(None, "Auth Rewrite!", "", "agent-0")
            .unwrap();
        assert!(context.context_id.starts_with("auth-rewrite-"));
        assert_eq!(context.agents_involved, vec!["agent-0".to_string()]);
    }

    #[test]
    fn add_decision_caps_and_tracks_agent() {
        let tmp = TempDir::new().unwrap();
        let store = ContextStore::new(tmp.path());
        let context = store
            .create_context(Some("ctx-1".into()), "auth", "", "agent-0")
            .unwrap();
        for i in 0..(MAX_DECISIONS_PER_CONTEXT + 5) {
            store
                .add_decision(&context.context_id, &format!("decision-{i}"), "agent-1", None, vec![])
                .unwrap();
        }
        let context = store.get_context(&context.context_id).unwrap();
        assert_eq!(context.decisions.len(), MAX_DECISIONS_PER_CONTEXT);
        assert_eq!(context.decisions[0].decision, "decision-5");
        assert!(context.agents_involved.contains(&"agent-1".to_string()));
    }

    #[test]
    fn link_contexts_is_bidirectional() {
        let tmp = TempDir::new().unwrap();
        let store = ContextStore::new(tmp.path());
        store.create_context(Some("a".into()), "a", "", "agent-0").unwrap();
        store.create_context(Some("b".into()), "b", "", "agent-0").unwrap();
        store.link_contexts("a", "b").unwrap();
        assert_eq!(store.get_context("a").unwrap().related_contexts, vec!["b".to_string()]);
        assert_eq!(store.get_context("b").unwrap().related_contexts, vec!["a".to_string()]);
    }

    #[test]
    fn list_contexts_excludes_archived_unless_requested() {
        let tmp = TempDir::new().unwrap();
        let store = ContextStore::new(tmp.path());
        let a = store.create_context(Some("a".into()), "a", "", "agent-0").unwrap();
        store.create_context(Some("b".into()), "b", "", "agent-0").unwrap();
        store.archive_context(&a.context_id).unwrap();

        let visible = store.list_contexts(&ContextFilter::default()).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].context_id, "b");

        let all = store
            .list_contexts(&ContextFilter {
                include_archived: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn search_matches_name_summary_and_notes() {
        let tmp = TempDir::new().unwrap();
        let store = ContextStore::new(tmp.path());
        store
            .create_context(Some("a".into()), "Login flow", "rework the auth", "agent-0")
            .unwrap();
        store.add_note("a", "watch out for session races").unwrap();

        assert_eq!(store.search_contexts("login").unwrap().len(), 1);
        assert_eq!(store.search_contexts("auth").unwrap().len(), 1);
        assert_eq!(store.search_contexts("races").unwrap().len(), 1);
        assert_eq!(store.search_contexts("nope").unwrap().len(), 0);
    }
}
