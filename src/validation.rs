//! Agent-name and text validators/sanitizers (C1).

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::MemorySubstrateConfig;
use crate::error::{MemoryError, MemoryResult};

static AGENT_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// Closed set of patterns that mark a text field as rejected outright rather
/// than merely sanitized: script tags, protocol handlers, event-attribute
/// assignments, and code-evaluation builtins.
static MALICIOUS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)<script\b").unwrap(),
        Regex::new(r"(?i)javascript:").unwrap(),
        Regex::new(r"(?i)\bon[a-z]+\s*=").unwrap(),
        Regex::new(r"(?i)\beval\s*\(").unwrap(),
        Regex::new(r"(?i)\bFunction\s*\(").unwrap(),
    ]
});

/// Validates an agent name against `^[A-Za-z0-9_-]{1,N}$`.
pub fn validate_agent_name(name: &str, cfg: &MemorySubstrateConfig) -> MemoryResult<()> {
    if name.is_empty() {
        return Err(MemoryError::InvalidArgument("agent name must not be empty".into()));
    }
    if name.chars().count() > cfg.max_agent_name_len {
        return Err(MemoryError::InvalidArgument(format!(
            "agent name exceeds {} characters",
            cfg.max_agent_name_len
        )));
    }
    if !AGENT_NAME_RE.is_match(name) {
        return Err(MemoryError::InvalidArgument(
            "agent name must match [A-Za-z0-9_-]+".into(),
        ));
    }
    Ok(())
}

/// Validates a text field: rejects content matching the malicious-pattern set.
/// Length is not rejected here — `sanitize_text_content` truncates it instead.
pub fn validate_text_content(field: &str, text: &str) -> MemoryResult<()> {
    for pattern in MALICIOUS_PATTERNS.iter() {
        if pattern.is_match(text) {
            return Err(MemoryError::InvalidArgument(format!(
                "{field} contains disallowed content"
            )));
        }
    }
    Ok(())
}

/// Truncation marker appended to text cut down to `max_text_len`.
pub const TRUNCATION_MARKER: &str = " … [truncated]";

/// Strips C0 control characters (except `\t`/`\n`) and truncates to
/// `max_text_len`, appending [`TRUNCATION_MARKER`] when truncation occurs.
/// Idempotent: `sanitize(sanitize(x)) == sanitize(x)` (P7).
pub fn sanitize_text_content(text: &str, cfg: &MemorySubstrateConfig) -> String {
    let stripped: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == '\t' || *c == '\n')
        .collect();

    if stripped.chars().count() <= cfg.max_text_len {
        return stripped;
    }

    if stripped.ends_with(TRUNCATION_MARKER) {
        // Already sanitized to this exact budget; nothing further to cut.
        let budget = cfg.max_text_len;
        let truncated: String = stripped.chars().take(budget).collect();
        if truncated.ends_with(TRUNCATION_MARKER) {
            return truncated;
        }
    }

    let keep = cfg.max_text_len.saturating_sub(TRUNCATION_MARKER.chars().count());
    let mut out: String = stripped.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

/// Validate-then-sanitize convenience used by every write path that accepts
/// free text (C4 deltas, C3 store payloads).
pub fn validate_and_sanitize(
    field: &str,
    text: &str,
    cfg: &MemorySubstrateConfig,
) -> MemoryResult<String> {
    validate_text_content(field, text)?;
    Ok(sanitize_text_content(text, cfg))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> MemorySubstrateConfig {
        let mut c = MemorySubstrateConfig::default();
        c.max_text_len = 20;
        c
    }

    #[test]
    fn rejects_empty_and_overlong_agent_names() {
        let cfg = MemorySubstrateConfig::default();
        assert!(validate_agent_name("", &cfg).is_err());
        assert!(validate_agent_name(&"a".repeat(100), &cfg).is_err());
        assert!(validate_agent_name("dev-1_ok", &cfg).is_ok());
        assert!(validate_agent_name("bad name", &cfg).is_err());
    }

    #[test]
    fn rejects_script_tags_and_event_handlers() {
        assert!(validate_text_content("observation", "<script>alert(1)</script>").is_err());
        assert!(validate_text_content("observation", "onclick=\"doThing()\"").is_err());
        assert!(validate_text_content("observation", "javascript:doThing()").is_err());
        assert!(validate_text_content("observation", "eval(x)").is_err());
        assert!(validate_text_content("observation", "a normal sentence").is_ok());
    }

    #[test]
    fn strips_control_chars_and_truncates_with_marker() {
        let cfg = cfg();
        let text = "hello\x00\x01world this is a long observation text";
        let sanitized = sanitize_text_content(text, &cfg);
        assert!(!sanitized.contains('\u{0}'));
        assert!(sanitized.ends_with(TRUNCATION_MARKER));
        assert!(sanitized.chars().count() <= cfg.max_text_len);
    }

    #[test]
    fn sanitize_is_idempotent() {
        let cfg = cfg();
        let text = "a very long piece of text that will certainly be truncated by the budget";
        let once = sanitize_text_content(text, &cfg);
        let twice = sanitize_text_content(&once, &cfg);
        assert_eq!(once, twice);
    }
}
