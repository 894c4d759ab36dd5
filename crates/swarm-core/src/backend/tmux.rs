//! Pane-addressable backend: enumerates and messages tmux panes running a
//! Claude Code process. Grounded on
//! `examples/original_source/src/claudeswarm/tmux_backend.py`.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::Result;

use super::{Backend, PeerInfo};

pub struct TmuxBackend;

impl TmuxBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TmuxBackend {
    fn default() -> Self {
        Self::new()
    }
}

struct PaneRow {
    pane_id: String,
    pane_pid: u32,
    session_name: String,
    current_path: String,
    current_command: String,
}

fn list_panes() -> Vec<PaneRow> {
    let output = match Command::new("tmux")
        .args([
            "list-panes",
            "-a",
            "-F",
            "#{pane_id}\t#{pane_pid}\t#{session_name}\t#{pane_current_path}\t#{pane_current_command}",
        ])
        .output()
    {
        Ok(o) if o.status.success() => o,
        _ => return Vec::new(),
    };
    let text = String::from_utf8_lossy(&output.stdout);
    text.lines()
        .filter_map(|line| {
            let mut fields = line.splitn(5, '\t');
            let pane_id = fields.next()?.to_string();
            let pane_pid: u32 = fields.next()?.parse().ok()?;
            let session_name = fields.next()?.to_string();
            let current_path = fields.next()?.to_string();
            let current_command = fields.next().unwrap_or_default().to_string();
            Some(PaneRow {
                pane_id,
                pane_pid,
                session_name,
                current_path,
                current_command,
            })
        })
        .collect()
}

fn is_claude_code_command(command: &str) -> bool {
    let lower = command.to_ascii_lowercase();
    lower.contains("claude") || lower.contains("node")
}

impl Backend for TmuxBackend {
    fn name(&self) -> &'static str {
        "tmux"
    }

    fn enumerate_peers(&self, project_root: Option<&Path>) -> Result<Vec<PeerInfo>> {
        let peers = list_panes()
            .into_iter()
            .filter(|p| is_claude_code_command(&p.current_command))
            .filter(|p| {
                project_root
                    .map(|root| Path::new(&p.current_path).starts_with(root))
                    .unwrap_or(true)
            })
            .map(|p| PeerInfo {
                identifier: p.pane_id,
                pid: p.pane_pid,
                session_name: p.session_name,
                cwd: Some(PathBuf::from(p.current_path)),
            })
            .collect();
        Ok(peers)
    }

    fn push(&self, identifier: &str, line: &str) -> Result<bool> {
        let keys_ok = Command::new("tmux")
            .args(["send-keys", "-t", identifier, line])
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !keys_ok {
            return Ok(false);
        }
        let enter_ok = Command::new("tmux")
            .args(["send-keys", "-t", identifier, "Enter"])
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        Ok(enter_ok)
    }

    fn verify_alive(&self, identifier: &str) -> bool {
        list_panes().iter().any(|p| p.pane_id == identifier)
    }

    fn current_identifier(&self) -> Option<String> {
        std::env::var("TMUX_PANE").ok()
    }

    fn create_monitor_pane(&self) -> Option<String> {
        let output = Command::new("tmux")
            .args(["split-window", "-d", "-P", "-F", "#{pane_id}"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() { None } else { Some(id) }
    }
}
