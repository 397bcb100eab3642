//! Working Memory Manager (C4): per-agent document lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tracing::info;

use crate::config::MemorySubstrateConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::types::{
    Blocker, CompletedTask, Context, Decision, KeyFact, Observation, WorkingMemory,
};
use crate::validation::{validate_agent_name, validate_and_sanitize};

/// A mutation request. Fields map 1:1 onto the delta shape in spec §4.4.
#[derive(Debug, Clone, Default)]
pub struct WorkingMemoryDelta {
    pub observation: Option<String>,
    pub decision: Option<String>,
    pub reasoning: Option<String>,
    pub blocker: Option<String>,
    pub key_fact: Option<(String, String, Option<String>, bool)>, // (key, content, importance, critical)
    pub completed_task: Option<String>,
    pub plan: Option<Vec<String>>,
    pub current_step: Option<String>,
    pub resolve_blocker: Option<String>,
    pub resolution: Option<String>,
    pub current_context: Option<Context>,
}

/// Diagnostic surfaced alongside the updated document (§9 open question b).
#[derive(Debug, Clone, Default)]
pub struct UpdateDiagnostics {
    pub resolve_blocker_matched: bool,
}

pub struct WorkingMemoryManager {
    cfg: MemorySubstrateConfig,
    /// Per-agent single-slot hygiene flag — hygiene requests are coalesced
    /// here rather than queued (spec §9 "message passing, not unbounded
    /// background tasks"). The actual hygiene run is driven by the caller
    /// (typically `MemorySubstrate`), this only tracks in-flight state.
    hygiene_in_flight: DashMap<String, bool>,
}

impl WorkingMemoryManager {
    pub fn new(cfg: MemorySubstrateConfig) -> Self {
        Self {
            cfg,
            hygiene_in_flight: DashMap::new(),
        }
    }

    pub fn config(&self) -> &MemorySubstrateConfig {
        &self.cfg
    }

    /// Returns `true` and marks in-flight if no hygiene is currently running
    /// for `agent`; returns `false` if one already is (the caller should
    /// drop the request rather than queue it).
    pub fn try_begin_hygiene(&self, agent: &str) -> bool {
        let mut entry = self.hygiene_in_flight.entry(agent.to_string()).or_insert(false);
        if *entry {
            false
        } else {
            *entry = true;
            true
        }
    }

    pub fn end_hygiene(&self, agent: &str) {
        self.hygiene_in_flight.insert(agent.to_string(), false);
    }

    /// Idempotent: preserves existing fields, fills `currentContext` only
    /// where absent.
    pub async fn initialize(&self, agent: &str, ctx: Option<Context>) -> MemoryResult<WorkingMemory> {
        validate_agent_name(agent, &self.cfg)?;
        let path = self.cfg.working_memory_path(agent);
        let lock_timeout = Duration::from_millis(self.cfg.file_lock_timeout_ms);

        let now = Utc::now();
        let session_id = now.timestamp_nanos_opt().unwrap_or_default().to_string();
        let ctx = ctx.unwrap_or_default();

        let result = crate::file_store::update_json_file(
            &path,
            lock_timeout,
            None::<WorkingMemory>,
            move |current| match current {
                Some(mut doc) => {
                    if doc.current_context.story_id.is_none() {
                        doc.current_context.story_id = ctx.story_id.clone();
                    }
                    if doc.current_context.epic_id.is_none() {
                        doc.current_context.epic_id = ctx.epic_id.clone();
                    }
                    if doc.current_context.task_id.is_none() {
                        doc.current_context.task_id = ctx.task_id.clone();
                    }
                    Ok(Some(doc))
                }
                None => Ok(Some(WorkingMemory::new(agent, session_id.clone(), ctx.clone(), now))),
            },
        )
        .await?;

        Ok(result.expect("transform always yields Some"))
    }

    /// Never fails for absence; returns `None` when the file doesn't exist.
    pub async fn load(&self, agent: &str) -> MemoryResult<Option<WorkingMemory>> {
        validate_agent_name(agent, &self.cfg)?;
        let path = self.cfg.working_memory_path(agent);
        crate::file_store::safe_read_json(&path, None).await
    }

    /// The sole mutation path (I1-I4 are all checked here).
    pub async fn update(
        &self,
        agent: &str,
        delta: WorkingMemoryDelta,
    ) -> MemoryResult<(WorkingMemory, UpdateDiagnostics)> {
        validate_agent_name(agent, &self.cfg)?;
        let path = self.cfg.working_memory_path(agent);
        let lock_timeout = Duration::from_millis(self.cfg.file_lock_timeout_ms);
        let cfg = self.cfg.clone();

        let agent_owned = agent.to_string();

        // transform must be deterministic/side-effect-free w.r.t. storage;
        // diagnostics are captured via a shared cell since the closure can't
        // return extra data through `update_json_file`'s `T`.
        let diag_cell = std::sync::Arc::new(std::sync::Mutex::new(UpdateDiagnostics::default()));
        let diag_cell_inner = diag_cell.clone();

        let doc = crate::file_store::update_json_file(
            &path,
            lock_timeout,
            None::<WorkingMemory>,
            move |current| {
                let now = Utc::now();
                let mut doc = match current {
                    Some(doc) => doc,
                    None => WorkingMemory::new(&agent_owned, now.timestamp_nanos_opt().unwrap_or_default().to_string(), Context::default(), now),
                };

                if let Some(patch) = &delta.current_context {
                    doc.current_context.merge(patch);
                }

                if let Some(text) = &delta.observation {
                    let sanitized = validate_and_sanitize("observation", text, &cfg)?;
                    doc.observations.push(Observation {
                        timestamp: now,
                        content: sanitized,
                        context: doc.current_context.clone(),
                    });
                }

                if let Some(text) = &delta.decision {
                    let sanitized = validate_and_sanitize("decision", text, &cfg)?;
                    let reasoning = delta
                        .reasoning
                        .as_ref()
                        .map(|r| validate_and_sanitize("reasoning", r, &cfg))
                        .transpose()?;
                    doc.decisions.push(Decision {
                        timestamp: now,
                        decision: sanitized,
                        reasoning,
                        context: doc.current_context.clone(),
                    });
                }

                if let Some(text) = &delta.blocker {
                    let sanitized = validate_and_sanitize("blocker", text, &cfg)?;
                    doc.blockers.push(Blocker {
                        timestamp: now,
                        blocker: sanitized,
                        context: doc.current_context.clone(),
                        resolved: false,
                        resolution: None,
                        resolved_at: None,
                    });
                }

                if let Some((key, content, importance, critical)) = &delta.key_fact {
                    let sanitized = validate_and_sanitize("keyFact", content, &cfg)?;
                    doc.key_facts.insert(
                        key.clone(),
                        KeyFact {
                            content: sanitized,
                            timestamp: now,
                            context: doc.current_context.clone(),
                            importance: importance.clone(),
                            critical: *critical,
                        },
                    );
                }

                if let Some(task_id) = &delta.completed_task {
                    doc.completed_tasks.push(CompletedTask {
                        timestamp: now,
                        task_id: task_id.clone(),
                        context: doc.current_context.clone(),
                    });
                }

                if let Some(plan) = &delta.plan {
                    let mut sanitized_plan = Vec::with_capacity(plan.len());
                    for step in plan {
                        sanitized_plan.push(validate_and_sanitize("plan", step, &cfg)?);
                    }
                    doc.plan = sanitized_plan;
                }

                if let Some(step) = &delta.current_step {
                    doc.current_step = Some(validate_and_sanitize("currentStep", step, &cfg)?);
                }

                // I4: resolved can only ever flip false -> true, never back.
                if let Some(needle) = &delta.resolve_blocker {
                    let resolution = delta.resolution.clone().unwrap_or_default();
                    let matched = doc.blockers.iter_mut().find(|b| !b.resolved && b.blocker.contains(needle.as_str()));
                    if let Some(b) = matched {
                        b.resolved = true;
                        b.resolution = Some(resolution);
                        b.resolved_at = Some(now);
                        diag_cell_inner.lock().unwrap().resolve_blocker_matched = true;
                    }
                    // §9(b): no match is an explicit success with a diagnostic
                    // flag, never an error.
                }

                trim_sections(&mut doc, &cfg);
                doc.last_updated = now;
                Ok(Some(doc))
            },
        )
        .await?;

        let diagnostics = std::mem::take(&mut *diag_cell.lock().unwrap());
        Ok((doc.expect("transform always yields Some"), diagnostics))
    }

    /// Deletes the document, or reinitializes it preserving only `currentContext`.
    pub async fn clear(&self, agent: &str, preserve_context: bool) -> MemoryResult<()> {
        validate_agent_name(agent, &self.cfg)?;
        let path = self.cfg.working_memory_path(agent);

        if preserve_context {
            let lock_timeout = Duration::from_millis(self.cfg.file_lock_timeout_ms);
            let agent_owned = agent.to_string();
            crate::file_store::update_json_file(&path, lock_timeout, None::<WorkingMemory>, move |current| {
                let ctx = current.map(|d| d.current_context).unwrap_or_default();
                let now = Utc::now();
                Ok(Some(WorkingMemory::new(
                    &agent_owned,
                    now.timestamp_nanos_opt().unwrap_or_default().to_string(),
                    ctx,
                    now,
                )))
            })
            .await?;
        } else {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(MemoryError::IOError(e)),
            }
        }
        info!(agent, preserve_context, "working memory cleared");
        Ok(())
    }

    /// `{sufficient, missing[], available{}}` against the document.
    pub async fn check_context_sufficiency(
        &self,
        agent: &str,
        required: &[String],
    ) -> MemoryResult<ContextSufficiency> {
        let doc = self.load(agent).await?;
        let mut missing = Vec::new();
        let mut available = HashMap::new();

        for key in required {
            let value = match key.as_str() {
                "storyId" => doc.as_ref().and_then(|d| d.current_context.story_id.clone()),
                "epicId" => doc.as_ref().and_then(|d| d.current_context.epic_id.clone()),
                "taskId" => doc.as_ref().and_then(|d| d.current_context.task_id.clone()),
                "plan" => doc.as_ref().filter(|d| !d.plan.is_empty()).map(|d| d.plan.join("; ")),
                other => other.strip_prefix("keyFact:").and_then(|k| {
                    doc.as_ref().and_then(|d| d.key_facts.get(k)).map(|f| f.content.clone())
                }),
            };
            match value {
                Some(v) => {
                    available.insert(key.clone(), v);
                }
                None => missing.push(key.clone()),
            }
        }

        Ok(ContextSufficiency {
            sufficient: missing.is_empty(),
            missing,
            available,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ContextSufficiency {
    pub sufficient: bool,
    pub missing: Vec<String>,
    pub available: HashMap<String, String>,
}

/// Enforces per-section caps with newest-first recency trimming (I2, P2, P3).
fn trim_sections(doc: &mut WorkingMemory, cfg: &MemorySubstrateConfig) {
    trim_by_timestamp(&mut doc.observations, cfg.max_observations, |o| o.timestamp);
    trim_by_timestamp(&mut doc.decisions, cfg.max_decisions, |d| d.timestamp);
    trim_by_timestamp(&mut doc.blockers, cfg.max_blockers, |b| b.timestamp);
    trim_by_timestamp(&mut doc.completed_tasks, cfg.max_completed_tasks, |c| c.timestamp);

    if doc.key_facts.len() > cfg.max_key_facts {
        let mut entries: Vec<(String, KeyFact)> = doc.key_facts.drain().collect();
        // Critical/high-importance facts are always retained; among the
        // rest, drop oldest first.
        entries.sort_by(|a, b| {
            let a_protected = a.1.critical || a.1.importance.as_deref() == Some("high");
            let b_protected = b.1.critical || b.1.importance.as_deref() == Some("high");
            b_protected.cmp(&a_protected).then(b.1.timestamp.cmp(&a.1.timestamp))
        });
        entries.truncate(cfg.max_key_facts);
        doc.key_facts = entries.into_iter().collect();
    }
}

fn trim_by_timestamp<T>(items: &mut Vec<T>, max: usize, ts: impl Fn(&T) -> chrono::DateTime<Utc>) {
    if items.len() <= max {
        return;
    }
    items.sort_by_key(&ts);
    let drop = items.len() - max;
    items.drain(0..drop);
}

pub type SharedWorkingMemoryManager = Arc<WorkingMemoryManager>;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cfg(base: &std::path::Path) -> MemorySubstrateConfig {
        let mut c = MemorySubstrateConfig::default();
        c.base_dir = base.to_path_buf();
        c
    }

    #[tokio::test]
    async fn init_update_load_scenario() {
        let dir = tempdir().unwrap();
        let mgr = WorkingMemoryManager::new(cfg(dir.path()));
        mgr.initialize("dev", None).await.unwrap();

        let mut delta = WorkingMemoryDelta::default();
        delta.observation = Some("Parsed story 2.3".to_string());
        mgr.update("dev", delta).await.unwrap();

        let doc = mgr.load("dev").await.unwrap().unwrap();
        assert_eq!(doc.observations[0].content, "Parsed story 2.3");
        assert!(doc.current_context.story_id.is_none());
        assert!(!doc.session_id.is_empty());
    }

    #[tokio::test]
    async fn cap_trimming_keeps_newest_entries() {
        let dir = tempdir().unwrap();
        let mut c = cfg(dir.path());
        c.max_observations = 3;
        let mgr = WorkingMemoryManager::new(c);
        mgr.initialize("dev", None).await.unwrap();

        for letter in ["A", "B", "C", "D"] {
            let mut delta = WorkingMemoryDelta::default();
            delta.observation = Some(letter.to_string());
            mgr.update("dev", delta).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let doc = mgr.load("dev").await.unwrap().unwrap();
        let contents: Vec<&str> = doc.observations.iter().map(|o| o.content.as_str()).collect();
        assert_eq!(contents, vec!["B", "C", "D"]);
    }

    #[tokio::test]
    async fn blocker_resolution_only_touches_matching_unresolved_blocker() {
        let dir = tempdir().unwrap();
        let mgr = WorkingMemoryManager::new(cfg(dir.path()));
        mgr.initialize("dev", None).await.unwrap();

        for text in ["db down", "dns flaky"] {
            let mut delta = WorkingMemoryDelta::default();
            delta.blocker = Some(text.to_string());
            mgr.update("dev", delta).await.unwrap();
        }

        let mut delta = WorkingMemoryDelta::default();
        delta.resolve_blocker = Some("db".to_string());
        delta.resolution = Some("restarted".to_string());
        let (_, diag) = mgr.update("dev", delta).await.unwrap();
        assert!(diag.resolve_blocker_matched);

        let doc = mgr.load("dev").await.unwrap().unwrap();
        let db = doc.blockers.iter().find(|b| b.blocker == "db down").unwrap();
        assert!(db.resolved);
        assert_eq!(db.resolution.as_deref(), Some("restarted"));
        assert!(db.resolved_at.is_some());

        let dns = doc.blockers.iter().find(|b| b.blocker == "dns flaky").unwrap();
        assert!(!dns.resolved);
    }

    #[tokio::test]
    async fn resolve_blocker_no_match_is_explicit_success() {
        let dir = tempdir().unwrap();
        let mgr = WorkingMemoryManager::new(cfg(dir.path()));
        mgr.initialize("dev", None).await.unwrap();

        let mut delta = WorkingMemoryDelta::default();
        delta.resolve_blocker = Some("nonexistent".to_string());
        let result = mgr.update("dev", delta).await;
        assert!(result.is_ok());
        assert!(!result.unwrap().1.resolve_blocker_matched);
    }

    #[tokio::test]
    async fn context_sufficiency_reports_missing_keys() {
        let dir = tempdir().unwrap();
        let mgr = WorkingMemoryManager::new(cfg(dir.path()));
        mgr.initialize(
            "dev",
            Some(Context {
                story_id: Some("S-1".to_string()),
                epic_id: None,
                task_id: None,
            }),
        )
        .await
        .unwrap();

        let result = mgr
            .check_context_sufficiency("dev", &["storyId".to_string(), "taskId".to_string()])
            .await
            .unwrap();

        assert!(!result.sufficient);
        assert_eq!(result.missing, vec!["taskId".to_string()]);
        assert_eq!(result.available.get("storyId"), Some(&"S-1".to_string()));
    }
}
