//! Coordination document (spec §6): a shared Markdown scratchpad
//! (`COORDINATION.md`) with named `## ` sections that agents read and
//! update without clobbering each other's edits. Grounded on
//! `examples/original_source/src/claudeswarm/coordination.py`.
//!
//! The original exposes this through a module-level default instance;
//! here it's an explicit handle constructed by the caller, consistent
//! with every other store in this crate.

use std::fs;
use std::time::Duration;

use crate::error::{Result, SwarmError};
use crate::paths;
use crate::store::{atomic_write, LockedFile};

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationSection {
    pub name: String,
    pub content: String,
}

fn template(project_name: &str) -> String {
    format!(
        "# {project_name} Coordination\n\n\
         ## Sprint Goals\n\n\
         _No goals set yet._\n\n\
         ## Current Work\n\n\
         | Agent | Task | Status |\n\
         |-------|------|--------|\n\n\
         ## Blocked Items\n\n\
         _Nothing blocked._\n\n\
         ## Code Review Queue\n\n\
         _Empty._\n\n\
         ## Decisions\n\n\
         _No decisions recorded._\n"
    )
}

/// Split `content` into its title line and `## `-delimited sections, in
/// document order. A document with no sections yields an empty list.
fn parse_sections(content: &str) -> Vec<CoordinationSection> {
    let mut sections = Vec::new();
    let mut current_name: Option<String> = None;
    let mut current_lines: Vec<&str> = Vec::new();

    for line in content.lines() {
        if let Some(name) = line.strip_prefix("## ") {
            if let Some(name) = current_name.take() {
                sections.push(CoordinationSection {
                    name,
                    content: current_lines.join("\n").trim_end().to_string(),
                });
            }
            current_name = Some(name.trim().to_string());
            current_lines = Vec::new();
        } else if current_name.is_some() {
            current_lines.push(line);
        }
    }
    if let Some(name) = current_name.take() {
        sections.push(CoordinationSection {
            name,
            content: current_lines.join("\n").trim_end().to_string(),
        });
    }
    sections
}

/// The document's title line (everything before the first `## ` section),
/// or a default if the document is empty or has no title line.
fn title_line(content: &str, project_name: &str) -> String {
    let before_first_section = content
        .lines()
        .take_while(|l| !l.starts_with("## "))
        .collect::<Vec<_>>()
        .join("\n");
    let trimmed = before_first_section.trim_end();
    if trimmed.is_empty() {
        format!("# {project_name} Coordination")
    } else {
        trimmed.to_string()
    }
}

fn rebuild_content(title: &str, sections: &[CoordinationSection]) -> String {
    let mut out = String::new();
    out.push_str(title.trim_end());
    out.push('\n');
    for section in sections {
        out.push('\n');
        out.push_str("## ");
        out.push_str(&section.name);
        out.push_str("\n\n");
        out.push_str(section.content.trim_end());
        out.push('\n');
    }
    out
}

pub struct CoordinationDoc<'a> {
    root: &'a std::path::Path,
}

impl<'a> CoordinationDoc<'a> {
    pub fn new(root: &'a std::path::Path) -> Self {
        Self { root }
    }

    fn path(&self) -> std::path::PathBuf {
        paths::coordination_path(self.root)
    }

    /// Write the starter template. Refuses to overwrite an existing file
    /// unless `force` is set.
    pub fn init_file(&self, project_name: &str, force: bool) -> Result<()> {
        let path = self.path();
        if path.exists() && !force {
            return Err(SwarmError::Conflict(format!(
                "{} already exists (pass force to overwrite)",
                path.display()
            )));
        }
        atomic_write(&path, template(project_name).as_bytes())
    }

    pub fn read_file(&self, project_name: &str) -> Result<String> {
        let path = self.path();
        if !path.exists() {
            return Ok(template(project_name));
        }
        fs::read_to_string(&path).map_err(|e| SwarmError::Io {
            path: path.clone(),
            source: e,
        })
    }

    pub fn get_section(&self, project_name: &str, name: &str) -> Result<Option<CoordinationSection>> {
        let content = self.read_file(project_name)?;
        Ok(parse_sections(&content).into_iter().find(|s| s.name == name))
    }

    /// Replace (or append, if absent) the named section's body, under an
    /// exclusive lock for the whole read-modify-write window so two agents
    /// updating different sections can't race each other's rewrite.
    pub fn update_section(&self, project_name: &str, name: &str, new_content: &str) -> Result<()> {
        let path = self.path();
        if !path.exists() {
            atomic_write(&path, template(project_name).as_bytes())?;
        }
        let guard = LockedFile::acquire(&path, true, LOCK_TIMEOUT)?;
        let bytes = guard.read_bytes()?;
        let content = String::from_utf8_lossy(&bytes).into_owned();
        let title = title_line(&content, project_name);
        let mut sections = parse_sections(&content);

        match sections.iter_mut().find(|s| s.name == name) {
            Some(section) => section.content = new_content.trim_end().to_string(),
            None => sections.push(CoordinationSection {
                name: name.to_string(),
                content: new_content.trim_end().to_string(),
            }),
        }

        let rebuilt = rebuild_content(&title, &sections);
        guard.write_bytes(rebuilt.as_bytes())
    }

    /// Append a single line to the named section's body (creating it if
    /// absent), under the same locked read-modify-write window.
    pub fn append_to_section(&self, project_name: &str, name: &str, line: &str) -> Result<()> {
        let path = self.path();
        if !path.exists() {
            atomic_write(&path, template(project_name).as_bytes())?;
        }
        let guard = LockedFile::acquire(&path, true, LOCK_TIMEOUT)?;
        let bytes = guard.read_bytes()?;
        let content = String::from_utf8_lossy(&bytes).into_owned();
        let title = title_line(&content, project_name);
        let mut sections = parse_sections(&content);

        match sections.iter_mut().find(|s| s.name == name) {
            Some(section) => {
                if section.content.is_empty() {
                    section.content = line.to_string();
                } else {
                    section.content.push('\n');
                    section.content.push_str(line);
                }
            }
            None => sections.push(CoordinationSection {
                name: name.to_string(),
                content: line.to_string(),
            }),
        }

        let rebuilt = rebuild_content(&title, &sections);
        guard.write_bytes(rebuilt.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn init_then_read_round_trips_template() {
        let tmp = TempDir::new().unwrap();
        let doc = CoordinationDoc::new(tmp.path());
        doc.init_file("swarm", false).unwrap();
        let content = doc.read_file("swarm").unwrap();
        assert!(content.starts_with("# swarm Coordination"));
        assert!(content.contains("## Sprint Goals"));
    }

    #[test]
    fn init_refuses_overwrite_without_force() {
        let tmp = TempDir::new().unwrap();
        let doc = CoordinationDoc::new(tmp.path());
        doc.init_file("swarm", false).unwrap();
        assert!(doc.init_file("swarm", false).is_err());
        assert!(doc.init_file("swarm", true).is_ok());
    }

    #[test]
    fn update_section_replaces_body_and_preserves_others() {
        let tmp = TempDir::new().unwrap();
        let doc = CoordinationDoc::new(tmp.path());
        doc.init_file("swarm", false).unwrap();
        doc.update_section("swarm", "Blocked Items", "- waiting on review").unwrap();

        let blocked = doc.get_section("swarm", "Blocked Items").unwrap().unwrap();
        assert_eq!(blocked.content, "- waiting on review");

        let goals = doc.get_section("swarm", "Sprint Goals").unwrap().unwrap();
        assert_eq!(goals.content, "_No goals set yet._");
    }

    #[test]
    fn update_section_creates_missing_section() {
        let tmp = TempDir::new().unwrap();
        let doc = CoordinationDoc::new(tmp.path());
        doc.init_file("swarm", false).unwrap();
        doc.update_section("swarm", "Retro Notes", "went well").unwrap();
        let retro = doc.get_section("swarm", "Retro Notes").unwrap().unwrap();
        assert_eq!(retro.content, "went well");
    }

    #[test]
    fn append_to_section_accumulates_lines() {
        let tmp = TempDir::new().unwrap();
        let doc = CoordinationDoc::new(tmp.path());
        doc.init_file("swarm", false).unwrap();
        doc.update_section("swarm", "Decisions", "").unwrap();
        doc.append_to_section("swarm", "Decisions", "- use postgres").unwrap();
        doc.append_to_section("swarm", "Decisions", "- use redis for cache").unwrap();

        let decisions = doc.get_section("swarm", "Decisions").unwrap().unwrap();
        assert_eq!(decisions.content, "- use postgres\n- use redis for cache");
    }
}
