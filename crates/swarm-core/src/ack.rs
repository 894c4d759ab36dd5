//! Acknowledgment and retry engine (spec §4.H): wraps [`Messaging`] with a
//! `[REQUIRES-ACK]` tracking layer, periodic retry with fixed backoff, and
//! escalation-by-broadcast after exhausting retries. Grounded on
//! `examples/original_source/src/claudeswarm/ack.py`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SwarmError};
use crate::messaging::{Message, MessageType, Messaging};
use crate::paths;
use crate::store;
use crate::validate;

/// Maximum number of retries before a message is escalated.
pub const MAX_RETRIES: u32 = 3;
/// Backoff delays (seconds) applied after retry 1, 2, 3.
pub const RETRY_DELAYS: [i64; 3] = [30, 60, 120];
/// Bounded attempts at the CAS retry loop before giving up (version churn).
const MAX_CAS_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAck {
    pub msg_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub message: Message,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PendingAcksFile {
    #[serde(default)]
    version: u64,
    #[serde(default)]
    pending_acks: Vec<PendingAck>,
}

/// A handle bundling the project root and the messaging layer it rides on
/// top of — one per application context (spec §9).
pub struct AckSystem<'a> {
    root: PathBuf,
    messaging: &'a Messaging,
}

impl<'a> AckSystem<'a> {
    pub fn new(root: PathBuf, messaging: &'a Messaging) -> Self {
        Self { root, messaging }
    }

    fn path(&self) -> PathBuf {
        paths::pending_acks_path(&self.root)
    }

    /// Send a message prefixed with `[REQUIRES-ACK]`, tracking it for retry
    /// and eventual escalation. Inserts a placeholder pending-ack row before
    /// sending (so a crash between send and bookkeeping can't lose the
    /// tracking entry), then repoints it at the real message id. Returns
    /// `Ok(None)` if the send was rate-limited or not delivered.
    pub fn send_with_ack(
        &self,
        sender_id: &str,
        recipient_id: &str,
        msg_type: MessageType,
        content: &str,
        timeout_secs: i64,
    ) -> Result<Option<String>> {
        let sender_id = validate::validate_agent_id(sender_id)?;
        let recipient_id = validate::validate_agent_id(recipient_id)?;
        let content = validate::validate_message_content(content)?;

        let ack_content = format!("[REQUIRES-ACK] {content}");
        let now = Utc::now();
        let next_retry_at = now + ChronoDuration::seconds(timeout_secs);
        let temp_msg_id = format!("temp-{sender_id}-{}", now.timestamp_nanos_opt().unwrap_or(0));

        let placeholder = Message {
            msg_id: uuid::Uuid::nil(),
            sender: sender_id.clone(),
            timestamp: now,
            msg_type,
            content: ack_content.clone(),
            recipients: vec![recipient_id.clone()],
        };

        self.cas_update(|mut acks| {
            acks.push(PendingAck {
                msg_id: temp_msg_id.clone(),
                sender_id: sender_id.clone(),
                recipient_id: recipient_id.clone(),
                message: placeholder.clone(),
                sent_at: now,
                retry_count: 0,
                next_retry_at,
            });
            acks
        })?;

        let sent = self
            .messaging
            .send(&sender_id, &recipient_id, msg_type, &ack_content);

        let message = match sent {
            Ok(Some(message)) => message,
            Ok(None) => {
                self.drop_pending(&temp_msg_id)?;
                return Ok(None);
            }
            Err(e) => {
                self.drop_pending(&temp_msg_id)?;
                return Err(e);
            }
        };

        let real_msg_id = message.msg_id.to_string();
        self.cas_update(|mut acks| {
            for ack in &mut acks {
                if ack.msg_id == temp_msg_id {
                    ack.msg_id = real_msg_id.clone();
                    ack.message = message.clone();
                    break;
                }
            }
            acks
        })?;

        Ok(Some(real_msg_id))
    }

    fn drop_pending(&self, msg_id: &str) -> Result<()> {
        self.cas_update(|acks| {
            acks.into_iter().filter(|a| a.msg_id != msg_id).collect()
        })?;
        Ok(())
    }

    /// Process a received acknowledgment, removing the matching pending row.
    /// An ack from an unexpected agent is still accepted (logged as a
    /// warning). Returns `false`, idempotently, if no pending row matches.
    pub fn receive_ack(&self, msg_id: &str, agent_id: &str) -> Result<bool> {
        let mut found = false;
        self.cas_update(|acks| {
            let mut kept = Vec::with_capacity(acks.len());
            for ack in acks {
                if !found && ack.msg_id == msg_id {
                    if ack.recipient_id != agent_id {
                        tracing::warn!(
                            expected = %ack.recipient_id,
                            got = %agent_id,
                            msg_id = %msg_id,
                            "ack from unexpected agent, accepting anyway"
                        );
                    }
                    found = true;
                    continue;
                }
                kept.push(ack);
            }
            kept
        })?;
        if !found {
            tracing::warn!(msg_id = %msg_id, "no pending ack found");
        }
        Ok(found)
    }

    /// List pending acks, optionally filtered to a single sender.
    pub fn check_pending(&self, agent_id: Option<&str>) -> Result<Vec<PendingAck>> {
        let (file, _) = store::read_versioned::<PendingAcksFile>(&self.path(), store::DEFAULT_LOCK_TIMEOUT)?;
        Ok(match agent_id {
            Some(id) => file
                .pending_acks
                .into_iter()
                .filter(|a| a.sender_id == id)
                .collect(),
            None => file.pending_acks,
        })
    }

    pub fn pending_count(&self, agent_id: Option<&str>) -> Result<usize> {
        Ok(self.check_pending(agent_id)?.len())
    }

    /// Retry messages past their `next_retry_at`, escalating those that have
    /// exhausted [`MAX_RETRIES`]. Should be called periodically (spec
    /// recommends every 10 seconds). Returns the number of rows retried or
    /// escalated.
    pub fn process_retries(&self) -> Result<usize> {
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let (file, version) =
                store::read_versioned::<PendingAcksFile>(&self.path(), store::DEFAULT_LOCK_TIMEOUT)?;

            let now = Utc::now();
            let mut updated = Vec::with_capacity(file.pending_acks.len());
            let mut escalations = Vec::new();
            let mut processed = 0usize;

            for mut ack in file.pending_acks {
                if now < ack.next_retry_at {
                    updated.push(ack);
                    continue;
                }
                if ack.retry_count >= MAX_RETRIES {
                    escalations.push(ack);
                    processed += 1;
                    continue;
                }

                self.retry_message(&ack);
                ack.retry_count += 1;
                processed += 1;

                if ack.retry_count >= MAX_RETRIES {
                    escalations.push(ack);
                } else {
                    let delay = RETRY_DELAYS[ack.retry_count as usize];
                    ack.next_retry_at = now + ChronoDuration::seconds(delay);
                    updated.push(ack);
                }
            }

            let new_version = version + 1;
            let result = store::write_versioned_cas(
                &self.path(),
                store::DEFAULT_LOCK_TIMEOUT,
                version,
                &PendingAcksFile {
                    version: new_version,
                    pending_acks: updated,
                },
            );

            match result {
                Ok(()) => {
                    for ack in &escalations {
                        self.escalate_message(ack);
                    }
                    return Ok(processed);
                }
                Err(SwarmError::Conflict(_)) => {
                    tracing::info!(attempt, "process_retries: version conflict, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        tracing::error!("process_retries: failed to save after {MAX_CAS_ATTEMPTS} attempts due to version conflicts");
        Ok(0)
    }

    fn retry_message(&self, ack: &PendingAck) {
        let retry_content = format!("[RETRY-{}] {}", ack.retry_count + 1, ack.message.content);
        if let Err(e) = self
            .messaging
            .send(&ack.sender_id, &ack.recipient_id, ack.message.msg_type, &retry_content)
        {
            tracing::warn!(msg_id = %ack.msg_id, error = %e, "retry send failed");
        }
    }

    fn escalate_message(&self, ack: &PendingAck) {
        let escalation_content = format!(
            "[UNACKNOWLEDGED] Message to {} unacknowledged after {MAX_RETRIES} attempts. Original: {}",
            ack.recipient_id, ack.message.content
        );
        if let Err(e) = self
            .messaging
            .broadcast(&ack.sender_id, ack.message.msg_type, &escalation_content, false)
        {
            tracing::warn!(msg_id = %ack.msg_id, error = %e, "escalation broadcast failed");
        }
    }

    /// Drop pending acks, optionally scoped to a single sender. Returns the
    /// number removed.
    pub fn clear_pending(&self, agent_id: Option<&str>) -> Result<usize> {
        let mut removed = 0usize;
        self.cas_update(|acks| {
            let (dropped, kept): (Vec<_>, Vec<_>) = acks.into_iter().partition(|a| {
                agent_id.map(|id| a.sender_id == id).unwrap_or(true)
            });
            removed = dropped.len();
            kept
        })?;
        Ok(removed)
    }

    /// Apply `mutate` to the pending-ack list under CAS, retrying on version
    /// conflict up to [`MAX_CAS_ATTEMPTS`] times.
    fn cas_update<F>(&self, mutate: F) -> Result<()>
    where
        F: Fn(Vec<PendingAck>) -> Vec<PendingAck>,
    {
        let path = self.path();
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let (file, version) = store::read_versioned::<PendingAcksFile>(&path, store::DEFAULT_LOCK_TIMEOUT)?;
            let next = PendingAcksFile {
                version: version + 1,
                pending_acks: mutate(file.pending_acks),
            };
            match store::write_versioned_cas(&path, store::DEFAULT_LOCK_TIMEOUT, version, &next) {
                Ok(()) => return Ok(()),
                Err(SwarmError::Conflict(_)) => {
                    tracing::debug!(attempt, "ack cas_update: version conflict, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(SwarmError::Conflict(format!(
            "failed to update {} after {MAX_CAS_ATTEMPTS} attempts",
            path.display()
        )))
    }
}

/// Poll interval recommended for [`AckSystem::process_retries`] callers.
pub const RECOMMENDED_POLL_INTERVAL: Duration = Duration::from_secs(10);
