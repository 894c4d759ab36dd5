//! `start-monitoring` command implementation. Grounded on
//! `examples/original_source/src/claudeswarm/monitoring.py` (`LogTailer`,
//! `MessageFilter`, `run_dashboard`) and `.../cli.py`'s
//! `cmd_start_monitoring`. Log tailing itself follows the same
//! seek-from-last-position loop as `atm tail --follow`.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use claude_swarm_core::ack::AckSystem;
use claude_swarm_core::backend::select_backend;
use claude_swarm_core::config::RateLimitConfig;
use claude_swarm_core::discovery;
use claude_swarm_core::filelock;
use claude_swarm_core::messaging::{MessageType, Messaging};
use claude_swarm_core::paths;
use clap::Args;
use serde::Deserialize;
use uuid::Uuid;

use crate::util::project_root;

const REFRESH_INTERVAL: Duration = Duration::from_millis(500);
const STATUS_EVERY_TICKS: u32 = 8;

mod color {
    pub const RED: &str = "\x1b[91m";
    pub const YELLOW: &str = "\x1b[93m";
    pub const GREEN: &str = "\x1b[92m";
    pub const CYAN: &str = "\x1b[96m";
    pub const GRAY: &str = "\x1b[90m";
    pub const RESET: &str = "\x1b[0m";
}

/// Start the monitoring dashboard
#[derive(Args, Debug)]
pub struct StartMonitoringArgs {
    /// Filter messages by type (BLOCKED, QUESTION, INFO, ...)
    #[arg(long = "filter-type")]
    filter_type: Option<String>,

    /// Filter messages by agent ID (sender or recipient)
    #[arg(long = "filter-agent")]
    filter_agent: Option<String>,

    /// Run in the current terminal instead of creating a dedicated pane
    #[arg(long = "no-tmux")]
    no_tmux: bool,
}

#[derive(Debug, Deserialize)]
struct LogLine {
    timestamp: DateTime<Utc>,
    #[serde(default)]
    msg_id: Uuid,
    sender: String,
    #[serde(default)]
    recipients: Vec<String>,
    #[serde(rename = "type")]
    msg_type: MessageType,
    content: String,
}

impl LogLine {
    fn matches(&self, msg_type: Option<MessageType>, agent: Option<&str>) -> bool {
        if let Some(t) = msg_type {
            if self.msg_type != t {
                return false;
            }
        }
        if let Some(a) = agent {
            if self.sender != a && !self.recipients.iter().any(|r| r == a) {
                return false;
            }
        }
        true
    }

    fn format_with_colors(&self) -> String {
        let color = match self.msg_type {
            MessageType::Blocked => color::RED,
            MessageType::Question | MessageType::Ack => color::YELLOW,
            MessageType::Completed => color::GREEN,
            MessageType::ReviewRequest | MessageType::Challenge => color::CYAN,
            MessageType::Info => "",
        };
        let reset = if color.is_empty() { "" } else { color::RESET };
        format!(
            "{color}[{}][{}][{}]: {}{reset}",
            self.sender,
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.msg_type.wire_tag(),
            self.content,
        )
    }
}

fn parse_message_type(raw: &str) -> Result<MessageType> {
    let upper = raw.to_ascii_uppercase();
    for candidate in [
        MessageType::Question,
        MessageType::ReviewRequest,
        MessageType::Blocked,
        MessageType::Completed,
        MessageType::Challenge,
        MessageType::Info,
        MessageType::Ack,
    ] {
        if candidate.wire_tag() == upper {
            return Ok(candidate);
        }
    }
    bail!("Invalid message type: {raw}");
}

pub fn execute(args: StartMonitoringArgs, project_root_override: Option<&Path>) -> Result<()> {
    let root = project_root(project_root_override)?;
    let msg_type_filter = args.filter_type.as_deref().map(parse_message_type).transpose()?;

    if !args.no_tmux {
        let backend = select_backend();
        if backend.name() != "tmux" {
            bail!("tmux is not available or not running");
        }
        match backend.create_monitor_pane() {
            Some(pane_id) => {
                let mut cmd = format!(
                    "cd {} && claude-swarm start-monitoring --no-tmux",
                    root.display()
                );
                if let Some(t) = &args.filter_type {
                    cmd.push_str(&format!(" --filter-type {t}"));
                }
                if let Some(a) = &args.filter_agent {
                    cmd.push_str(&format!(" --filter-agent {a}"));
                }
                let _ = backend.push(&pane_id, &cmd);
                println!("Monitoring started in pane {pane_id}");
                return Ok(());
            }
            None => {
                eprintln!("Warning: Failed to create tmux pane, running in current terminal");
            }
        }
    }

    run_dashboard(&root, msg_type_filter, args.filter_agent.as_deref())
}

fn run_dashboard(root: &Path, msg_type_filter: Option<MessageType>, agent_filter: Option<&str>) -> Result<()> {
    let log_path = paths::message_log_path(root);
    if !log_path.exists() {
        fs::write(&log_path, b"")?;
    }

    let mut file = File::open(&log_path)?;
    let mut pos = file.seek(SeekFrom::End(0))?;
    let mut tick: u32 = 0;

    loop {
        std::thread::sleep(REFRESH_INTERVAL);

        let metadata = match fs::metadata(&log_path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if metadata.len() < pos {
            file = File::open(&log_path)?;
            pos = 0;
        }

        file.seek(SeekFrom::Start(pos))?;
        let mut reader = BufReader::new(&file);
        let mut new_bytes: u64 = 0;
        let mut line = String::new();
        loop {
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                break;
            }
            new_bytes += read as u64;
            if line.ends_with('\n') {
                if let Ok(entry) = serde_json::from_str::<LogLine>(line.trim_end()) {
                    if entry.matches(msg_type_filter, agent_filter) {
                        println!("{}", entry.format_with_colors());
                    }
                }
            }
            line.clear();
        }
        pos += new_bytes;

        tick += 1;
        if tick % STATUS_EVERY_TICKS == 0 {
            print_status_line(root);
        }
    }
}

fn print_status_line(root: &Path) {
    let agents = discovery::list(root).map(|r| r.agents.len()).unwrap_or(0);
    let locks = filelock::list_all(root, false, Duration::from_secs(filelock::DEFAULT_STALE_TIMEOUT_SECS))
        .map(|l| l.len())
        .unwrap_or(0);
    let pending = pending_ack_count(root).unwrap_or(0);
    println!(
        "{}-- agents: {agents}  locks: {locks}  pending-acks: {pending} --{}",
        color::GRAY,
        color::RESET
    );
}

fn pending_ack_count(root: &Path) -> Result<usize> {
    let backend: Arc<dyn claude_swarm_core::backend::Backend> = Arc::from(select_backend());
    let messaging = Messaging::new(root.to_path_buf(), backend, RateLimitConfig::default());
    let ack = AckSystem::new(root.to_path_buf(), &messaging);
    Ok(ack.pending_count(None)?)
}
