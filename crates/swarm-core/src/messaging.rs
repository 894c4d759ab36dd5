//! Messaging core (spec §4.G): formats, rate-limits, delivers via backend
//! or file log, and persists the append-only delivery log. Grounded on
//! `examples/original_source/src/claudeswarm/messaging.py`.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::Backend;
use crate::config::RateLimitConfig;
use crate::discovery;
use crate::error::{Result, SwarmError};
use crate::paths;
use crate::validate;

const LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Question,
    ReviewRequest,
    Blocked,
    Completed,
    Challenge,
    Info,
    Ack,
}

impl MessageType {
    pub fn wire_tag(&self) -> &'static str {
        match self {
            MessageType::Question => "QUESTION",
            MessageType::ReviewRequest => "REVIEW-REQUEST",
            MessageType::Blocked => "BLOCKED",
            MessageType::Completed => "COMPLETED",
            MessageType::Challenge => "CHALLENGE",
            MessageType::Info => "INFO",
            MessageType::Ack => "ACK",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub msg_id: Uuid,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub content: String,
    pub recipients: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    timestamp: DateTime<Utc>,
    msg_id: Uuid,
    sender: String,
    recipients: Vec<String>,
    #[serde(rename = "type")]
    msg_type: MessageType,
    content: String,
    delivery_status: HashMap<String, bool>,
    success_count: usize,
    failure_count: usize,
}

fn format_line(sender: &str, msg_type: MessageType, content: &str, now: DateTime<Utc>) -> String {
    format!(
        "[{sender}][{}][{}]: {content}",
        now.format("%Y-%m-%d %H:%M:%S"),
        msg_type.wire_tag()
    )
}

/// Per-sender sliding-window rate limiter. In-memory only (spec §5: "the
/// limiter is in-memory"; cross-process rate limiting is a non-goal).
struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn prune(window: &mut VecDeque<Instant>, now: Instant, window_secs: u64) {
        let cutoff = Duration::from_secs(window_secs);
        while let Some(&front) = window.front() {
            if now.duration_since(front) > cutoff {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Non-consuming check: would a send for `sender` right now stay under
    /// the limit?
    fn check(&self, sender: &str) -> bool {
        let mut windows = self.windows.lock().unwrap();
        let now = Instant::now();
        let entry = windows.entry(sender.to_string()).or_default();
        Self::prune(entry, now, self.config.window_seconds);
        entry.len() < self.config.max_messages as usize
    }

    /// Record that a send for `sender` happened now.
    fn record(&self, sender: &str) {
        let mut windows = self.windows.lock().unwrap();
        let now = Instant::now();
        let entry = windows.entry(sender.to_string()).or_default();
        Self::prune(entry, now, self.config.window_seconds);
        entry.push_back(now);
    }
}

/// A handle bundling the project root, the active terminal backend, and the
/// in-process rate limiter — one per application context (spec §9).
pub struct Messaging {
    root: PathBuf,
    backend: Arc<dyn Backend>,
    rate_limiter: RateLimiter,
}

impl Messaging {
    pub fn new(root: PathBuf, backend: Arc<dyn Backend>, rate_limit: RateLimitConfig) -> Self {
        Self {
            root,
            backend,
            rate_limiter: RateLimiter::new(rate_limit),
        }
    }

    /// Send a single-recipient message. Returns `Ok(None)` (no side
    /// effects, not logged) if rate-limited.
    pub fn send(
        &self,
        sender: &str,
        recipient: &str,
        msg_type: MessageType,
        content: &str,
    ) -> Result<Option<Message>> {
        let sender = validate::validate_agent_id(sender)?;
        let recipient = validate::validate_agent_id(recipient)?;
        let content = validate::validate_message_content(content)?;

        if !self.rate_limiter.check(&sender) {
            return Ok(None);
        }

        let now = Utc::now();
        let msg_id = Uuid::new_v4();
        let line = format_line(&sender, msg_type, &content, now);

        let identifier = discovery::resolve_identifier(&self.root, &recipient)?;
        let delivered = match identifier {
            Some(ident) => self.backend.push(&ident, &line).unwrap_or(false),
            None => false,
        };

        let mut delivery_status = HashMap::new();
        delivery_status.insert(recipient.clone(), delivered);

        if delivered {
            self.rate_limiter.record(&sender);
            self.append_log(msg_id, &sender, &[recipient.clone()], msg_type, &content, &delivery_status)?;
        }

        Ok(Some(Message {
            msg_id,
            sender,
            timestamp: now,
            msg_type,
            content,
            recipients: vec![recipient],
        }))
    }

    /// Broadcast to every active agent (optionally excluding the sender),
    /// consuming the rate limit window exactly once.
    pub fn broadcast(
        &self,
        sender: &str,
        msg_type: MessageType,
        content: &str,
        exclude_self: bool,
    ) -> Result<HashMap<String, bool>> {
        let sender = validate::validate_agent_id(sender)?;
        let content = validate::validate_message_content(content)?;

        if !self.rate_limiter.check(&sender) {
            return Ok(HashMap::new());
        }

        let registry = discovery::list(&self.root)?;
        let now = Utc::now();
        let msg_id = Uuid::new_v4();
        let line = format_line(&sender, msg_type, &content, now);

        let mut delivery_status = HashMap::new();
        for agent in &registry.agents {
            if exclude_self && agent.id == sender {
                continue;
            }
            let delivered = self.backend.push(&agent.identifier, &line).unwrap_or(false);
            delivery_status.insert(agent.id.clone(), delivered);
        }

        if delivery_status.values().any(|&ok| ok) {
            self.rate_limiter.record(&sender);
            let recipients: Vec<String> = delivery_status.keys().cloned().collect();
            self.append_log(msg_id, &sender, &recipients, msg_type, &content, &delivery_status)?;
        }

        Ok(delivery_status)
    }

    fn append_log(
        &self,
        msg_id: Uuid,
        sender: &str,
        recipients: &[String],
        msg_type: MessageType,
        content: &str,
        delivery_status: &HashMap<String, bool>,
    ) -> Result<()> {
        let success_count = delivery_status.values().filter(|&&ok| ok).count();
        let failure_count = delivery_status.len() - success_count;
        let record = LogRecord {
            timestamp: Utc::now(),
            msg_id,
            sender: sender.to_string(),
            recipients: recipients.to_vec(),
            msg_type,
            content: content.to_string(),
            delivery_status: delivery_status.clone(),
            success_count,
            failure_count,
        };
        let line = serde_json::to_string(&record).map_err(|e| SwarmError::Json {
            path: paths::message_log_path(&self.root),
            source: e,
        })?;
        append_rotating(&self.root, &line)
    }
}

fn append_rotating(root: &Path, line: &str) -> Result<()> {
    let path = paths::message_log_path(root);
    fs::create_dir_all(root).map_err(|e| SwarmError::Io {
        path: root.to_path_buf(),
        source: e,
    })?;

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .read(true)
        .open(&path)
        .map_err(|e| SwarmError::Io {
            path: path.clone(),
            source: e,
        })?;
    file.lock_exclusive().map_err(|e| SwarmError::Io {
        path: path.clone(),
        source: e,
    })?;

    let size = file
        .metadata()
        .map_err(|e| SwarmError::Io {
            path: path.clone(),
            source: e,
        })?
        .len();

    if size > LOG_ROTATE_BYTES {
        let _ = FileExt::unlock(&file);
        drop(file);
        let old_path = paths::message_log_old_path(root);
        let _ = fs::remove_file(&old_path);
        fs::rename(&path, &old_path).map_err(|e| SwarmError::Io {
            path: path.clone(),
            source: e,
        })?;
        let mut fresh = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| SwarmError::Io {
                path: path.clone(),
                source: e,
            })?;
        fresh.lock_exclusive().map_err(|e| SwarmError::Io {
            path: path.clone(),
            source: e,
        })?;
        writeln!(fresh, "{line}").map_err(|e| SwarmError::Io {
            path: path.clone(),
            source: e,
        })?;
        let _ = FileExt::unlock(&fresh);
    } else {
        let mut f = file;
        writeln!(f, "{line}").map_err(|e| SwarmError::Io {
            path: path.clone(),
            source: e,
        })?;
        let _ = FileExt::unlock(&f);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PeerInfo;
    use tempfile::TempDir;

    struct AlwaysOkBackend;
    impl Backend for AlwaysOkBackend {
        fn name(&self) -> &'static str {
            "test"
        }
        fn enumerate_peers(&self, _: Option<&Path>) -> Result<Vec<PeerInfo>> {
            Ok(vec![])
        }
        fn push(&self, _identifier: &str, _line: &str) -> Result<bool> {
            Ok(true)
        }
        fn verify_alive(&self, _identifier: &str) -> bool {
            true
        }
        fn current_identifier(&self) -> Option<String> {
            None
        }
    }

    fn seed_registry(root: &Path, agents: &[(&str, &str)]) {
        use crate::discovery::{Agent, AgentStatus};
        let entries: Vec<Agent> = agents
            .iter()
            .map(|(id, identifier)| Agent {
                id: id.to_string(),
                identifier: identifier.to_string(),
                pid: 1,
                session_name: "s".into(),
                cwd: None,
                status: AgentStatus::Active,
                last_seen: Utc::now(),
            })
            .collect();
        let file = crate::discovery::ActiveAgentsFile {
            session_name: "s".into(),
            updated_at: Utc::now(),
            agents: entries,
        };
        crate::store::write_locked(&paths::active_agents_path(root), crate::store::DEFAULT_LOCK_TIMEOUT, |_| Ok(file)).unwrap();
    }

    #[test]
    fn broadcast_excludes_self_and_delivers() {
        let tmp = TempDir::new().unwrap();
        seed_registry(tmp.path(), &[("agent-0", "p0"), ("agent-1", "p1"), ("agent-2", "p2")]);
        let messaging = Messaging::new(
            tmp.path().to_path_buf(),
            Arc::new(AlwaysOkBackend),
            RateLimitConfig::default(),
        );
        let status = messaging
            .broadcast("agent-0", MessageType::Info, "Please implement user authentication", true)
            .unwrap();
        assert_eq!(status.len(), 2);
        assert!(status["agent-1"]);
        assert!(status["agent-2"]);
    }

    #[test]
    fn send_without_registry_entry_fails_delivery_but_returns_message() {
        let tmp = TempDir::new().unwrap();
        let messaging = Messaging::new(
            tmp.path().to_path_buf(),
            Arc::new(AlwaysOkBackend),
            RateLimitConfig::default(),
        );
        let result = messaging
            .send("agent-2", "agent-5", MessageType::Question, "hello")
            .unwrap();
        assert!(result.is_some());
        // Not delivered, so nothing should have been logged.
        assert!(!paths::message_log_path(tmp.path()).exists());
    }

    #[test]
    fn boundary_content_length() {
        let tmp = TempDir::new().unwrap();
        seed_registry(tmp.path(), &[("agent-0", "p0"), ("agent-1", "p1")]);
        let messaging = Messaging::new(
            tmp.path().to_path_buf(),
            Arc::new(AlwaysOkBackend),
            RateLimitConfig::default(),
        );
        let ok = "x".repeat(validate::MAX_MESSAGE_BYTES);
        assert!(messaging.send("agent-0", "agent-1", MessageType::Info, &ok).unwrap().is_some());
        let too_long = "x".repeat(validate::MAX_MESSAGE_BYTES + 1);
        assert!(messaging.send("agent-0", "agent-1", MessageType::Info, &too_long).is_err());
    }

    #[test]
    fn rate_limit_boundary() {
        let tmp = TempDir::new().unwrap();
        seed_registry(tmp.path(), &[("agent-0", "p0"), ("agent-1", "p1")]);
        let messaging = Messaging::new(
            tmp.path().to_path_buf(),
            Arc::new(AlwaysOkBackend),
            RateLimitConfig {
                max_messages: 10,
                window_seconds: 60,
            },
        );
        for _ in 0..10 {
            let result = messaging
                .send("agent-0", "agent-1", MessageType::Info, "hi")
                .unwrap();
            assert!(result.is_some());
        }
        let eleventh = messaging
            .send("agent-0", "agent-1", MessageType::Info, "hi")
            .unwrap();
        assert!(eleventh.is_none());
    }
}
