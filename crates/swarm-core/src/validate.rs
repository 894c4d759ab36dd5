//! Input validators and sanitizers enforced at every public entry point
//! (spec §4.C). Grounded on `examples/original_source/src/claudeswarm/validators.py`.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use unicode_normalization::UnicodeNormalization;

use crate::error::{Result, SwarmError};

pub const MAX_MESSAGE_BYTES: usize = 10 * 1024;
pub const MAX_AGENT_ID_LEN: usize = 64;
pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 3600;
pub const MAX_RETRY_COUNT: u32 = 5;
pub const MIN_RATE_LIMIT_MESSAGES: u32 = 1;
pub const MAX_RATE_LIMIT_MESSAGES: u32 = 1000;
pub const MIN_RATE_LIMIT_WINDOW: u64 = 1;
pub const MAX_RATE_LIMIT_WINDOW: u64 = 3600;

/// Bidirectional-override code points that can stage a Trojan-Source attack.
const BIDI_OVERRIDE_CHARS: [char; 9] = [
    '\u{202a}', '\u{202b}', '\u{202c}', '\u{202d}', '\u{202e}', '\u{2066}', '\u{2067}', '\u{2068}',
    '\u{2069}',
];

/// Zero-width code points that can hide content.
const ZERO_WIDTH_CHARS: [char; 5] = ['\u{200b}', '\u{200c}', '\u{200d}', '\u{2060}', '\u{feff}'];

fn is_dangerous_unicode(c: char) -> bool {
    BIDI_OVERRIDE_CHARS.contains(&c) || ZERO_WIDTH_CHARS.contains(&c)
}

/// `true` if `s` contains any bidi-override or zero-width code point.
pub fn contains_dangerous_unicode(s: &str) -> bool {
    s.chars().any(is_dangerous_unicode)
}

/// Validate an agent ID: non-empty, `[A-Za-z0-9_-]{1,64}`, no leading/trailing hyphen.
pub fn validate_agent_id(agent_id: &str) -> Result<String> {
    let trimmed = agent_id.trim();
    if trimmed.is_empty() {
        return Err(SwarmError::Validation("agent id cannot be empty".into()));
    }
    if trimmed.len() > MAX_AGENT_ID_LEN {
        return Err(SwarmError::Validation(format!(
            "agent id too long (max {MAX_AGENT_ID_LEN} chars, got {})",
            trimmed.len()
        )));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(SwarmError::Validation(format!(
            "agent id contains invalid characters: '{trimmed}'"
        )));
    }
    if trimmed.starts_with('-') || trimmed.ends_with('-') {
        return Err(SwarmError::Validation(format!(
            "agent id cannot start or end with a hyphen: '{trimmed}'"
        )));
    }
    Ok(trimmed.to_string())
}

/// Validate a tmux pane identifier: `^%\d+$`.
pub fn validate_pane_id(pane_id: &str) -> Result<String> {
    let ok = pane_id.starts_with('%')
        && pane_id.len() > 1
        && pane_id[1..].chars().all(|c| c.is_ascii_digit());
    if !ok {
        return Err(SwarmError::Validation(format!(
            "invalid tmux pane id: '{pane_id}'"
        )));
    }
    Ok(pane_id.to_string())
}

/// Validate and sanitize message content: non-empty after trim, <= 10 KiB
/// UTF-8 bytes after sanitization.
pub fn validate_message_content(content: &str) -> Result<String> {
    if content.trim().is_empty() {
        return Err(SwarmError::Validation(
            "message content cannot be empty".into(),
        ));
    }
    let sanitized = sanitize_message_content(content);
    if sanitized.trim().is_empty() {
        return Err(SwarmError::Validation(
            "message content cannot be empty".into(),
        ));
    }
    let len = sanitized.as_bytes().len();
    if len > MAX_MESSAGE_BYTES {
        return Err(SwarmError::Validation(format!(
            "message content too long (max {MAX_MESSAGE_BYTES} bytes, got {len} bytes)"
        )));
    }
    Ok(sanitized)
}

/// Strip null bytes, C0/C1 controls (except tab/LF/CR), bidi overrides and
/// zero-width characters; normalize CRLF/CR to LF; trim trailing whitespace
/// per line.
pub fn sanitize_message_content(content: &str) -> String {
    let normalized_newlines = content.replace("\r\n", "\n").replace('\r', "\n");
    let filtered: String = normalized_newlines
        .chars()
        .filter(|&c| {
            if c == '\u{0}' {
                return false;
            }
            if is_dangerous_unicode(c) {
                return false;
            }
            if c == '\t' || c == '\n' {
                return true;
            }
            // C0 (0x00-0x1F) and C1 (0x80-0x9F) controls, tab/newline excepted above.
            let code = c as u32;
            !((0x00..=0x1f).contains(&code) || (0x7f..=0x9f).contains(&code))
        })
        .collect();
    filtered
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Validate a file path: no null bytes, NFC-normalize, reject traversal,
/// resolve to absolute, and require containment within `project_root`
/// (checked after canonicalization so symlinked components can't escape).
pub fn validate_file_path(path: &str, project_root: &Path) -> Result<PathBuf> {
    if path.contains('\u{0}') {
        return Err(SwarmError::Validation("path contains null byte".into()));
    }
    let normalized: String = path.nfc().collect();
    let normalized = normalized.replace('\\', "/");
    if normalized.contains("../") || normalized.ends_with("..") || normalized.contains("..\\") {
        return Err(SwarmError::Validation(format!(
            "path traversal rejected: '{path}'"
        )));
    }

    let candidate = if Path::new(&normalized).is_absolute() {
        PathBuf::from(&normalized)
    } else {
        project_root.join(&normalized)
    };

    let root_canon = project_root
        .canonicalize()
        .map_err(|e| SwarmError::Io {
            path: project_root.to_path_buf(),
            source: e,
        })?;

    // Resolve as far as possible: canonicalize the deepest existing ancestor
    // and re-append the remaining (not-yet-created) components, so a lock
    // can be validated against a path that doesn't exist yet.
    let resolved = resolve_existing_prefix(&candidate)?;

    if !resolved.starts_with(&root_canon) {
        return Err(SwarmError::Validation(format!(
            "path escapes project root: '{path}'"
        )));
    }
    Ok(resolved)
}

fn resolve_existing_prefix(path: &Path) -> Result<PathBuf> {
    let mut ancestor = path;
    let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        if ancestor.exists() {
            let canon = ancestor.canonicalize().map_err(|e| SwarmError::Io {
                path: ancestor.to_path_buf(),
                source: e,
            })?;
            let mut result = canon;
            for component in tail.iter().rev() {
                result.push(component);
            }
            return Ok(result);
        }
        match (ancestor.file_name(), ancestor.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name);
                ancestor = parent;
            }
            _ => {
                // Nothing exists at all (e.g. relative path with no root);
                // best-effort: return the original candidate unresolved.
                return Ok(path.to_path_buf());
            }
        }
    }
}

pub fn validate_timeout_secs(value: u64) -> Result<u64> {
    if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&value) {
        return Err(SwarmError::Validation(format!(
            "timeout must be between {MIN_TIMEOUT_SECS} and {MAX_TIMEOUT_SECS} seconds, got {value}"
        )));
    }
    Ok(value)
}

pub fn validate_retry_count(value: u32) -> Result<u32> {
    if value > MAX_RETRY_COUNT {
        return Err(SwarmError::Validation(format!(
            "retry count must be <= {MAX_RETRY_COUNT}, got {value}"
        )));
    }
    Ok(value)
}

pub fn validate_rate_limit(max_messages: u32, window_secs: u64) -> Result<()> {
    if !(MIN_RATE_LIMIT_MESSAGES..=MAX_RATE_LIMIT_MESSAGES).contains(&max_messages) {
        return Err(SwarmError::Validation(format!(
            "rate limit max_messages must be between {MIN_RATE_LIMIT_MESSAGES} and {MAX_RATE_LIMIT_MESSAGES}"
        )));
    }
    if !(MIN_RATE_LIMIT_WINDOW..=MAX_RATE_LIMIT_WINDOW).contains(&window_secs) {
        return Err(SwarmError::Validation(format!(
            "rate limit window must be between {MIN_RATE_LIMIT_WINDOW} and {MAX_RATE_LIMIT_WINDOW} seconds"
        )));
    }
    Ok(())
}

pub fn validate_port(port: u32) -> Result<u16> {
    if port == 0 || port > 65535 {
        return Err(SwarmError::Validation(format!(
            "port must be between 1 and 65535, got {port}"
        )));
    }
    Ok(port as u16)
}

/// Validate a host: RFC-1123 hostname or parseable IP. Never fails for
/// `0.0.0.0`, `::`, or global-scope IPs, but the caller should surface the
/// returned warning.
pub fn validate_host(host: &str) -> Result<(String, Option<String>)> {
    if host.parse::<IpAddr>().is_ok() {
        let warning = match host {
            "0.0.0.0" | "::" => Some(format!("host '{host}' binds all interfaces")),
            _ => match host.parse::<IpAddr>() {
                Ok(IpAddr::V4(v4)) if !v4.is_private() && !v4.is_loopback() => {
                    Some(format!("host '{host}' is a global-scope address"))
                }
                _ => None,
            },
        };
        return Ok((host.to_string(), warning));
    }
    let valid_hostname = !host.is_empty()
        && host.len() <= 253
        && host
            .split('.')
            .all(|label| is_valid_rfc1123_label(label));
    if !valid_hostname {
        return Err(SwarmError::Validation(format!("invalid host: '{host}'")));
    }
    Ok((host.to_string(), None))
}

fn is_valid_rfc1123_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Validate a non-empty recipient list: all valid agent IDs, no duplicates.
pub fn validate_recipient_list(recipients: &[String]) -> Result<Vec<String>> {
    if recipients.is_empty() {
        return Err(SwarmError::Validation(
            "recipient list cannot be empty".into(),
        ));
    }
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(recipients.len());
    for r in recipients {
        let validated = validate_agent_id(r)?;
        if !seen.insert(validated.clone()) {
            return Err(SwarmError::Validation(format!(
                "duplicate recipient: '{validated}'"
            )));
        }
        out.push(validated);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn agent_id_accepts_valid() {
        assert_eq!(validate_agent_id("agent-1").unwrap(), "agent-1");
        assert_eq!(validate_agent_id("my_agent_123").unwrap(), "my_agent_123");
    }

    #[test]
    fn agent_id_rejects_invalid() {
        assert!(validate_agent_id("").is_err());
        assert!(validate_agent_id("-agent").is_err());
        assert!(validate_agent_id("agent-").is_err());
        assert!(validate_agent_id("a@b").is_err());
        assert!(validate_agent_id(&"a".repeat(65)).is_err());
    }

    #[test]
    fn message_content_boundary() {
        let ok = "x".repeat(MAX_MESSAGE_BYTES);
        assert!(validate_message_content(&ok).is_ok());
        let too_long = "x".repeat(MAX_MESSAGE_BYTES + 1);
        assert!(validate_message_content(&too_long).is_err());
    }

    #[test]
    fn sanitize_strips_dangerous_unicode_and_controls() {
        let s = "hello\u{202e}world\u{200b}\u{0}!";
        let sanitized = sanitize_message_content(s);
        assert!(!contains_dangerous_unicode(&sanitized));
        assert!(!sanitized.contains('\u{0}'));
        assert_eq!(sanitized, "helloworld!");
    }

    #[test]
    fn sanitize_normalizes_crlf() {
        let sanitized = sanitize_message_content("a\r\nb\rc");
        assert_eq!(sanitized, "a\nb\nc");
    }

    #[test]
    fn path_traversal_rejected_even_with_unicode_tricks() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        assert!(validate_file_path("../etc/passwd", &root).is_err());
        assert!(validate_file_path("foo/../../etc/passwd", &root).is_err());
    }

    #[test]
    fn path_within_root_accepted() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("src/auth")).unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let resolved = validate_file_path("src/auth/login.py", &root).unwrap();
        assert!(resolved.starts_with(&root));
    }

    #[test]
    fn recipient_list_rejects_empty_and_dupes() {
        assert!(validate_recipient_list(&[]).is_err());
        assert!(
            validate_recipient_list(&["a".to_string(), "a".to_string()]).is_err()
        );
        assert!(validate_recipient_list(&["a".to_string(), "b".to_string()]).is_ok());
    }

    #[test]
    fn host_warns_but_does_not_reject() {
        let (_, warning) = validate_host("0.0.0.0").unwrap();
        assert!(warning.is_some());
        let (_, warning) = validate_host("localhost").unwrap();
        assert!(warning.is_none());
    }

    #[test]
    fn port_range() {
        assert!(validate_port(0).is_err());
        assert!(validate_port(65536).is_err());
        assert!(validate_port(8080).is_ok());
    }
}
