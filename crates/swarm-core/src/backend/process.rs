//! File-drop backend: enumerates Claude Code processes via OS process
//! listing, identifies the local agent by its controlling TTY, and leaves
//! real delivery to the append-only message log. Grounded on
//! `examples/original_source/src/claudeswarm/process_backend.py`.

use std::path::Path;

#[cfg(not(unix))]
use sysinfo::Pid;
use sysinfo::System;

use crate::error::Result;

use super::{Backend, PeerInfo};

pub struct ProcessBackend;

impl ProcessBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn is_claude_code_command(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower == "claude" || lower.ends_with("/claude") || lower.contains("claude-code")
}

impl Backend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn enumerate_peers(&self, project_root: Option<&Path>) -> Result<Vec<PeerInfo>> {
        let our_pid = std::process::id();
        let mut sys = System::new();
        sys.refresh_all();

        // Parent-child traversal: skip the controller's own child
        // processes so the discovering agent never lists itself.
        let mut own_descendants = std::collections::HashSet::new();
        own_descendants.insert(our_pid);
        let mut changed = true;
        while changed {
            changed = false;
            for (pid, process) in sys.processes() {
                let pid_u32 = pid.as_u32();
                if own_descendants.contains(&pid_u32) {
                    continue;
                }
                if let Some(parent) = process.parent() {
                    if own_descendants.contains(&parent.as_u32()) {
                        own_descendants.insert(pid_u32);
                        changed = true;
                    }
                }
            }
        }

        let mut peers = Vec::new();
        for (pid, process) in sys.processes() {
            let pid_u32 = pid.as_u32();
            if pid_u32 == our_pid || own_descendants.contains(&pid_u32) {
                continue;
            }
            let name = process.name().to_string_lossy();
            if !is_claude_code_command(&name) {
                continue;
            }
            let cwd = process.cwd().map(|p| p.to_path_buf());
            if let Some(root) = project_root {
                match &cwd {
                    Some(cwd) if cwd.starts_with(root) => {}
                    _ => continue,
                }
            }
            let identifier = peer_tty(pid_u32).unwrap_or_else(|| format!("pid:{pid_u32}"));
            peers.push(PeerInfo {
                identifier,
                pid: pid_u32,
                session_name: detect_terminal_name(),
                cwd,
            });
        }
        Ok(peers)
    }

    fn push(&self, _identifier: &str, _line: &str) -> Result<bool> {
        // Real delivery happens via the message log; callers must poll it.
        Ok(false)
    }

    fn verify_alive(&self, identifier: &str) -> bool {
        if let Some(pid_str) = identifier.strip_prefix("pid:") {
            return pid_str
                .parse::<u32>()
                .map(pid_alive)
                .unwrap_or(false);
        }
        if identifier.starts_with("/dev/") {
            return Path::new(identifier).exists();
        }
        Path::new("/dev").join(identifier).exists()
    }

    fn current_identifier(&self) -> Option<String> {
        own_tty().or_else(|| Some(format!("pid:{}", std::process::id())))
    }
}

fn detect_terminal_name() -> String {
    if std::env::var("GHOSTTY_RESOURCES_DIR").is_ok() {
        return "ghostty".to_string();
    }
    std::env::var("TERM_PROGRAM")
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_all();
    sys.process(Pid::from_u32(pid)).is_some()
}

/// This process's own controlling TTY, via `ttyname(0)` (fd 0 is our
/// stdin). Only valid for the calling process — see [`peer_tty`] for other
/// processes' TTYs, which `ttyname` cannot report.
#[cfg(unix)]
fn own_tty() -> Option<String> {
    use std::ffi::CStr;
    unsafe {
        let ptr = libc::ttyname(0);
        if ptr.is_null() {
            return None;
        }
        CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
    }
}

#[cfg(not(unix))]
fn own_tty() -> Option<String> {
    None
}

/// A peer process's controlling TTY, looked up from `ps`'s `tty` column
/// (mirrors the original's single `ps -eo pid=,ppid=,tty=,command=` scan —
/// `ttyname(3)` only ever reports the calling process's own terminal, so
/// another process's TTY has to come from the process table instead).
#[cfg(unix)]
fn peer_tty(pid: u32) -> Option<String> {
    pid_tty_map().get(&pid).cloned()
}

#[cfg(not(unix))]
fn peer_tty(_pid: u32) -> Option<String> {
    None
}

#[cfg(unix)]
fn pid_tty_map() -> std::collections::HashMap<u32, String> {
    let mut map = std::collections::HashMap::new();
    let Ok(output) = std::process::Command::new("ps")
        .args(["-eo", "pid=,tty="])
        .env("LC_ALL", "C")
        .output()
    else {
        return map;
    };
    let text = String::from_utf8_lossy(&output.stdout);
    for line in text.lines() {
        let mut parts = line.trim().splitn(2, char::is_whitespace);
        let Some(pid_str) = parts.next() else { continue };
        let Some(tty) = parts.next().map(str::trim) else { continue };
        let Ok(pid) = pid_str.parse::<u32>() else { continue };
        if tty.is_empty() || tty == "?" {
            continue;
        }
        map.insert(pid, format!("/dev/{tty}"));
    }
    map
}
