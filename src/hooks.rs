//! Validation Hooks & Enforcement (C8): pluggable pre/post validators that
//! run automatically around operations, plus their audit trail.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::MemorySubstrateConfig;
use crate::error::MemoryResult;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationOutcome {
    pub fn ok() -> Self {
        Self {
            valid: true,
            ..Default::default()
        }
    }

    /// Short-circuit OR on invalidity, union on diagnostics.
    fn merge(mut self, other: ValidationOutcome) -> Self {
        self.valid = self.valid && other.valid;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self
    }
}

pub type Validator = std::sync::Arc<dyn Fn(&serde_json::Value) -> ValidationOutcome + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookPoint {
    BeforeMemorySave,
    AfterStoryLoad,
    BeforeTaskExecute,
    BeforeWorkflowStep,
}

impl HookPoint {
    fn as_str(&self) -> &'static str {
        match self {
            HookPoint::BeforeMemorySave => "beforeMemorySave",
            HookPoint::AfterStoryLoad => "afterStoryLoad",
            HookPoint::BeforeTaskExecute => "beforeTaskExecute",
            HookPoint::BeforeWorkflowStep => "beforeWorkflowStep",
        }
    }
}

#[derive(Debug, Serialize)]
struct AuditEntry<'a> {
    timestamp: chrono::DateTime<Utc>,
    hook: &'static str,
    errors: &'a [String],
    warnings: &'a [String],
}

pub struct HookRegistry {
    cfg: MemorySubstrateConfig,
    validators: DashMap<HookPoint, Vec<Validator>>,
}

impl HookRegistry {
    pub fn new(cfg: MemorySubstrateConfig) -> Self {
        Self {
            cfg,
            validators: DashMap::new(),
        }
    }

    pub fn register(&self, point: HookPoint, validator: Validator) {
        self.validators.entry(point).or_default().push(validator);
    }

    /// Runs all validators registered at `point` against `payload`, appends
    /// a failure to the audit log when invalid, and returns the aggregated
    /// outcome. The caller rejects the operation on `!valid`; retry policy
    /// is the caller's, not this registry's.
    pub async fn run(&self, point: HookPoint, payload: &serde_json::Value) -> MemoryResult<ValidationOutcome> {
        let validators = self
            .validators
            .get(&point)
            .map(|v| v.clone())
            .unwrap_or_default();

        let outcome = validators
            .iter()
            .map(|v| v(payload))
            .fold(ValidationOutcome::ok(), ValidationOutcome::merge);

        if !outcome.valid {
            warn!(hook = point.as_str(), errors = ?outcome.errors, "validation hook rejected payload");
            self.audit(point, &outcome).await;
        }

        Ok(outcome)
    }

    async fn audit(&self, point: HookPoint, outcome: &ValidationOutcome) {
        let date = Utc::now().format("%Y-%m-%d").to_string();
        let path = self.cfg.validation_log_path(&date);
        let entry = AuditEntry {
            timestamp: Utc::now(),
            hook: point.as_str(),
            errors: &outcome.errors,
            warnings: &outcome.warnings,
        };
        if let Err(e) = crate::file_store::append_jsonl(&path, &entry).await {
            warn!(error = %e, "failed to write validation audit log");
        }
    }
}

/// Rejects a `storeLongTerm` payload that is oversize or carries a malformed
/// `storyId`. Wired into `beforeMemorySave` by default in `MemorySubstrate::init`.
pub fn default_memory_save_validator(cfg: &MemorySubstrateConfig) -> Validator {
    let max_text_len = cfg.max_text_len;
    std::sync::Arc::new(move |payload: &serde_json::Value| {
        let mut outcome = ValidationOutcome::ok();
        if let Some(text) = payload.get("text").and_then(|v| v.as_str()) {
            if text.chars().count() > max_text_len * 4 {
                outcome.valid = false;
                outcome.errors.push("payload text grossly exceeds configured limit".to_string());
            }
        }
        if let Some(story_id) = payload.get("storyId").and_then(|v| v.as_str()) {
            if story_id.is_empty() || story_id.len() > 128 {
                outcome.valid = false;
                outcome.errors.push("storyId is malformed".to_string());
            }
        }
        outcome
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn invalid_payload_is_rejected_and_audited() {
        let dir = tempdir().unwrap();
        let mut cfg = MemorySubstrateConfig::default();
        cfg.base_dir = dir.path().to_path_buf();
        let registry = HookRegistry::new(cfg.clone());
        registry.register(HookPoint::BeforeMemorySave, default_memory_save_validator(&cfg));

        let payload = serde_json::json!({"text": "fine", "storyId": ""});
        let outcome = registry.run(HookPoint::BeforeMemorySave, &payload).await.unwrap();
        assert!(!outcome.valid);

        let date = Utc::now().format("%Y-%m-%d").to_string();
        let log_path = cfg.validation_log_path(&date);
        let contents = tokio::fs::read_to_string(&log_path).await.unwrap();
        assert!(contents.contains("beforeMemorySave"));
    }

    #[tokio::test]
    async fn valid_payload_passes_without_audit_entry() {
        let dir = tempdir().unwrap();
        let mut cfg = MemorySubstrateConfig::default();
        cfg.base_dir = dir.path().to_path_buf();
        let registry = HookRegistry::new(cfg.clone());
        registry.register(HookPoint::BeforeMemorySave, default_memory_save_validator(&cfg));

        let payload = serde_json::json!({"text": "fine", "storyId": "S-1"});
        let outcome = registry.run(HookPoint::BeforeMemorySave, &payload).await.unwrap();
        assert!(outcome.valid);
    }
}
