//! Shared data model (§3).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The `{storyId, epicId, taskId}` triple attached to every persisted entry.
/// Any component may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    #[serde(rename = "storyId", skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,
    #[serde(rename = "epicId", skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,
    #[serde(rename = "taskId", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl Context {
    /// Field-wise overwrite merge: fields present in `patch` replace this context's.
    pub fn merge(&mut self, patch: &Context) {
        if patch.story_id.is_some() {
            self.story_id = patch.story_id.clone();
        }
        if patch.epic_id.is_some() {
            self.epic_id = patch.epic_id.clone();
        }
        if patch.task_id.is_some() {
            self.task_id = patch.task_id.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub context: Context,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub timestamp: DateTime<Utc>,
    pub decision: String,
    pub reasoning: Option<String>,
    pub context: Context,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFact {
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub context: Context,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub importance: Option<String>,
    #[serde(default)]
    pub critical: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blocker {
    pub timestamp: DateTime<Utc>,
    pub blocker: String,
    pub context: Context,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(rename = "resolvedAt", skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedTask {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub context: Context,
}

/// One document per agent; the sole unit of C4 mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingMemory {
    #[serde(rename = "agentName")]
    pub agent_name: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub initialized: DateTime<Utc>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
    #[serde(rename = "lastCleanup", skip_serializing_if = "Option::is_none")]
    pub last_cleanup: Option<DateTime<Utc>>,
    #[serde(rename = "currentContext")]
    pub current_context: Context,
    pub observations: Vec<Observation>,
    pub decisions: Vec<Decision>,
    pub blockers: Vec<Blocker>,
    #[serde(rename = "completedTasks")]
    pub completed_tasks: Vec<CompletedTask>,
    #[serde(rename = "keyFacts")]
    pub key_facts: HashMap<String, KeyFact>,
    pub plan: Vec<String>,
    #[serde(rename = "currentStep", skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
}

impl WorkingMemory {
    pub fn new(agent_name: &str, session_id: String, ctx: Context, now: DateTime<Utc>) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            session_id,
            initialized: now,
            last_updated: now,
            last_cleanup: None,
            current_context: ctx,
            observations: Vec::new(),
            decisions: Vec::new(),
            blockers: Vec::new(),
            completed_tasks: Vec::new(),
            key_facts: HashMap::new(),
            plan: Vec::new(),
            current_step: None,
        }
    }
}

/// `type` discriminant for `LongTermRecord`. Serializes/deserializes as the
/// plain kebab-case string named in §3, including the open-ended
/// `archived-<section>` family, so a hand-written (De)Serialize is used
/// instead of a derive that can't express that shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LongTermType {
    Observation,
    Decision,
    KeyFact,
    Blocker,
    BlockerResolution,
    TaskArchive,
    SessionSummary,
    /// `archived-<section>`, e.g. `archived-observations`.
    Archived(String),
}

impl std::fmt::Display for LongTermType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LongTermType::Observation => "observation".to_string(),
            LongTermType::Decision => "decision".to_string(),
            LongTermType::KeyFact => "key-fact".to_string(),
            LongTermType::Blocker => "blocker".to_string(),
            LongTermType::BlockerResolution => "blocker-resolution".to_string(),
            LongTermType::TaskArchive => "task-archive".to_string(),
            LongTermType::SessionSummary => "session-summary".to_string(),
            LongTermType::Archived(section) => format!("archived-{section}"),
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for LongTermType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "observation" => LongTermType::Observation,
            "decision" => LongTermType::Decision,
            "key-fact" => LongTermType::KeyFact,
            "blocker" => LongTermType::Blocker,
            "blocker-resolution" => LongTermType::BlockerResolution,
            "task-archive" => LongTermType::TaskArchive,
            "session-summary" => LongTermType::SessionSummary,
            other => match other.strip_prefix("archived-") {
                Some(section) => LongTermType::Archived(section.to_string()),
                None => LongTermType::Archived(other.to_string()),
            },
        })
    }
}

impl Serialize for LongTermType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LongTermType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().unwrap())
    }
}

/// Opaque, append-only record in the long-term (vector) store.
/// Ids are always strings end-to-end (§9 open question c).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongTermRecord {
    pub id: String,
    pub agent: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub record_type: LongTermType,
    #[serde(rename = "storyId", skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,
    #[serde(rename = "epicId", skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,
    #[serde(rename = "taskId", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(rename = "embeddingMethod")]
    pub embedding_method: EmbeddingMethod,
    #[serde(default, rename = "isFallback")]
    pub is_fallback: bool,
    #[serde(default, flatten)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingMethod {
    Model,
    Hash,
}

/// Overall rollup and per-check status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEntry {
    pub component: String,
    pub status: HealthStatus,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Metadata filters applied to both tiers of retrieval (C6) and to C3 search.
#[derive(Debug, Clone, Default)]
pub struct MetadataFilters {
    pub agent: Option<String>,
    pub story_id: Option<String>,
    pub epic_id: Option<String>,
    pub task_id: Option<String>,
    pub record_type: Option<LongTermType>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_merge_is_field_wise() {
        let mut ctx = Context {
            story_id: Some("S-1".into()),
            epic_id: None,
            task_id: Some("T-1".into()),
        };
        let patch = Context {
            story_id: None,
            epic_id: Some("E-1".into()),
            task_id: None,
        };
        ctx.merge(&patch);
        assert_eq!(ctx.story_id.as_deref(), Some("S-1"));
        assert_eq!(ctx.epic_id.as_deref(), Some("E-1"));
        assert_eq!(ctx.task_id.as_deref(), Some("T-1"));
    }

    #[test]
    fn archived_type_displays_with_section() {
        let t = LongTermType::Archived("observations".to_string());
        assert_eq!(t.to_string(), "archived-observations");
    }
}
