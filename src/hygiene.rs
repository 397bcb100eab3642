//! Hygiene Engine (C5): usage analysis, archival-before-delete, section
//! cleanup policies.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::MemorySubstrateConfig;
use crate::error::MemoryResult;
use crate::types::{KeyFact, LongTermType, WorkingMemory};
use crate::vector_store::SharedVectorStore;
use crate::working_memory::SharedWorkingMemoryManager;

#[derive(Debug, Clone)]
pub struct HygieneTriggers {
    pub run_after_each_action: bool,
    pub run_on_memory_threshold: f64,
    pub run_on_age_threshold: bool,
}

impl Default for HygieneTriggers {
    fn default() -> Self {
        Self {
            run_after_each_action: true,
            run_on_memory_threshold: 0.8,
            run_on_age_threshold: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchivalRules {
    pub summarize_before_delete: bool,
    pub retain_critical_facts: bool,
    pub preserve_active_blockers: bool,
    pub minimum_entries_before_cleanup: usize,
}

impl Default for ArchivalRules {
    fn default() -> Self {
        Self {
            summarize_before_delete: true,
            retain_critical_facts: true,
            preserve_active_blockers: true,
            minimum_entries_before_cleanup: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HygieneConfig {
    pub enable_auto: bool,
    pub triggers: HygieneTriggers,
    pub archival_rules: ArchivalRules,
}

impl Default for HygieneConfig {
    fn default() -> Self {
        Self {
            enable_auto: true,
            triggers: HygieneTriggers::default(),
            archival_rules: ArchivalRules::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupRecommendation {
    pub section: String,
    pub action: String,
    pub count: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct HygieneAnalysis {
    pub ratios: HashMap<String, f64>,
    pub age_hours: i64,
    pub cleanup_needed: bool,
    pub recommendations: Vec<CleanupRecommendation>,
}

#[derive(Debug, Clone, Default)]
pub struct HygieneReport {
    pub success: bool,
    pub analysis: HygieneAnalysis,
    pub cleanup_actions: Vec<CleanupRecommendation>,
    pub errors: Vec<String>,
}

pub struct HygieneEngine {
    cfg: MemorySubstrateConfig,
    working_memory: SharedWorkingMemoryManager,
    vector_store: SharedVectorStore,
}

impl HygieneEngine {
    pub fn new(
        cfg: MemorySubstrateConfig,
        working_memory: SharedWorkingMemoryManager,
        vector_store: SharedVectorStore,
    ) -> Self {
        Self {
            cfg,
            working_memory,
            vector_store,
        }
    }

    /// Ratio/age analysis against thresholds (no mutation).
    pub fn analyze(&self, doc: &WorkingMemory, hygiene_cfg: &HygieneConfig) -> HygieneAnalysis {
        let threshold = hygiene_cfg.triggers.run_on_memory_threshold;
        let mut ratios = HashMap::new();
        let mut recommendations = Vec::new();

        let sections: [(&str, usize, usize); 4] = [
            ("observations", doc.observations.len(), self.cfg.max_observations),
            ("decisions", doc.decisions.len(), self.cfg.max_decisions),
            ("blockers", doc.blockers.len(), self.cfg.max_blockers),
            ("completedTasks", doc.completed_tasks.len(), self.cfg.max_completed_tasks),
        ];

        let mut cleanup_needed = false;
        for (name, current, limit) in sections {
            let ratio = if limit == 0 { 0.0 } else { current as f64 / limit as f64 };
            ratios.insert(name.to_string(), ratio);
            if ratio >= threshold && current > hygiene_cfg.archival_rules.minimum_entries_before_cleanup {
                cleanup_needed = true;
                let count = current.saturating_sub((limit as f64 * threshold).floor() as usize);
                recommendations.push(CleanupRecommendation {
                    section: name.to_string(),
                    action: "archive-and-trim".to_string(),
                    count,
                    reason: format!("{name} at {:.0}% of limit", ratio * 100.0),
                });
            }
        }

        let key_facts_ratio = if self.cfg.max_key_facts == 0 {
            0.0
        } else {
            doc.key_facts.len() as f64 / self.cfg.max_key_facts as f64
        };
        ratios.insert("keyFacts".to_string(), key_facts_ratio);
        if key_facts_ratio >= threshold
            && doc.key_facts.len() > hygiene_cfg.archival_rules.minimum_entries_before_cleanup
        {
            cleanup_needed = true;
            let count = doc
                .key_facts
                .len()
                .saturating_sub((self.cfg.max_key_facts as f64 * threshold).floor() as usize);
            recommendations.push(CleanupRecommendation {
                section: "keyFacts".to_string(),
                action: "archive-and-trim".to_string(),
                count,
                reason: "keyFacts at or above threshold".to_string(),
            });
        }

        let age_hours = (Utc::now() - doc.initialized).num_hours();
        if hygiene_cfg.triggers.run_on_age_threshold && age_hours > self.cfg.max_age_hours {
            cleanup_needed = true;
        }

        HygieneAnalysis {
            ratios,
            age_hours,
            cleanup_needed,
            recommendations,
        }
    }

    /// `performMemoryHygiene(agent, {force?})`. Section failures are
    /// isolated; overall `success = errors.is_empty()`.
    pub async fn perform_hygiene(
        &self,
        agent: &str,
        hygiene_cfg: &HygieneConfig,
        force: bool,
    ) -> MemoryResult<HygieneReport> {
        let doc = match self.working_memory.load(agent).await? {
            Some(d) => d,
            None => {
                return Ok(HygieneReport {
                    success: true,
                    ..Default::default()
                })
            }
        };

        let analysis = self.analyze(&doc, hygiene_cfg);
        if !analysis.cleanup_needed && !force {
            return Ok(HygieneReport {
                success: true,
                analysis,
                ..Default::default()
            });
        }

        let mut errors = Vec::new();
        let mut cleanup_actions = Vec::new();

        for rec in &analysis.recommendations {
            match self
                .cleanup_section(agent, &doc, rec, hygiene_cfg)
                .await
            {
                Ok(()) => cleanup_actions.push(rec.clone()),
                Err(e) => {
                    warn!(agent, section = %rec.section, error = %e, "hygiene section failed");
                    errors.push(format!("{}: {e}", rec.section));
                }
            }
        }

        let success = errors.is_empty();
        info!(agent, success, cleaned = cleanup_actions.len(), "hygiene run completed");

        Ok(HygieneReport {
            success,
            analysis,
            cleanup_actions,
            errors,
        })
    }

    async fn cleanup_section(
        &self,
        agent: &str,
        doc: &WorkingMemory,
        rec: &CleanupRecommendation,
        hygiene_cfg: &HygieneConfig,
    ) -> MemoryResult<()> {
        let (archived_text, ids, should_archive) = match rec.section.as_str() {
            "observations" => {
                let mut sorted = doc.observations.clone();
                sorted.sort_by_key(|o| o.timestamp);
                let tail: Vec<_> = sorted.into_iter().take(rec.count).collect();
                let summary = summarize_entries(agent, "observations", tail.iter().map(|o| o.content.as_str()));
                (summary, tail.len(), true)
            }
            "decisions" => {
                let mut sorted = doc.decisions.clone();
                sorted.sort_by_key(|d| d.timestamp);
                let tail: Vec<_> = sorted.into_iter().take(rec.count).collect();
                let summary = summarize_entries(agent, "decisions", tail.iter().map(|d| d.decision.as_str()));
                (summary, tail.len(), true)
            }
            "keyFacts" => {
                let mut entries: Vec<(&String, &KeyFact)> = doc.key_facts.iter().collect();
                entries.retain(|(_, f)| {
                    !(hygiene_cfg.archival_rules.retain_critical_facts
                        && (f.critical || f.importance.as_deref() == Some("high")))
                });
                entries.sort_by_key(|(_, f)| f.timestamp);
                let tail: Vec<_> = entries.into_iter().take(rec.count).collect();
                let summary = summarize_entries(agent, "keyFacts", tail.iter().map(|(_, f)| f.content.as_str()));
                (summary, tail.len(), true)
            }
            "blockers" => {
                let candidates: Vec<_> = if hygiene_cfg.archival_rules.preserve_active_blockers {
                    doc.blockers.iter().filter(|b| b.resolved).collect()
                } else {
                    let mut sorted: Vec<_> = doc.blockers.iter().collect();
                    sorted.sort_by_key(|b| b.timestamp);
                    sorted
                };
                let tail: Vec<_> = candidates.into_iter().take(rec.count).collect();
                let summary = summarize_entries(agent, "blockers", tail.iter().map(|b| b.blocker.as_str()));
                (summary, tail.len(), true)
            }
            "completedTasks" => {
                // Recency trim only, no archival (spec's completedTasks policy).
                let tail_len = rec.count.min(doc.completed_tasks.len());
                (String::new(), tail_len, false)
            }
            other => (summarize_entries(agent, other, std::iter::empty()), 0, false),
        };

        if should_archive && hygiene_cfg.archival_rules.summarize_before_delete && ids > 0 {
            let mut metadata = HashMap::new();
            metadata.insert(
                "entryCount".to_string(),
                serde_json::Value::from(ids as u64),
            );
            self.vector_store
                .store(
                    agent,
                    &archived_text,
                    LongTermType::Archived(rec.section.clone()),
                    doc.current_context.story_id.clone(),
                    doc.current_context.epic_id.clone(),
                    doc.current_context.task_id.clone(),
                    metadata,
                )
                .await?;
        }

        // The actual trim happens through the normal atomic update path so
        // it benefits from the same single-writer guarantee as any other
        // mutation; hygiene only decides *what* to archive.
        self.apply_trim(agent, &rec.section, rec.count, hygiene_cfg).await
    }

    async fn apply_trim(
        &self,
        agent: &str,
        section: &str,
        count: usize,
        hygiene_cfg: &HygieneConfig,
    ) -> MemoryResult<()> {
        let path = self.working_memory.config().working_memory_path(agent);
        let lock_timeout = std::time::Duration::from_millis(self.working_memory.config().file_lock_timeout_ms);
        let section = section.to_string();
        let retain_critical = hygiene_cfg.archival_rules.retain_critical_facts;
        let preserve_active = hygiene_cfg.archival_rules.preserve_active_blockers;

        crate::file_store::update_json_file(&path, lock_timeout, None::<WorkingMemory>, move |current| {
            let mut doc = match current {
                Some(d) => d,
                None => return Ok(None),
            };
            match section.as_str() {
                "observations" => {
                    doc.observations.sort_by_key(|o| o.timestamp);
                    let drop = count.min(doc.observations.len());
                    doc.observations.drain(0..drop);
                }
                "decisions" => {
                    doc.decisions.sort_by_key(|d| d.timestamp);
                    let drop = count.min(doc.decisions.len());
                    doc.decisions.drain(0..drop);
                }
                "completedTasks" => {
                    doc.completed_tasks.sort_by_key(|t| t.timestamp);
                    let drop = count.min(doc.completed_tasks.len());
                    doc.completed_tasks.drain(0..drop);
                }
                "keyFacts" => {
                    let entries: Vec<(String, KeyFact)> = doc.key_facts.drain().collect();
                    let (protected, mut rest): (Vec<_>, Vec<_>) = entries.into_iter().partition(|(_, f)| {
                        retain_critical && (f.critical || f.importance.as_deref() == Some("high"))
                    });
                    rest.sort_by_key(|(_, f)| f.timestamp);
                    let drop = count.min(rest.len());
                    rest.drain(0..drop);
                    let mut kept = protected;
                    kept.extend(rest);
                    doc.key_facts = kept.into_iter().collect();
                }
                "blockers" => {
                    let drop = count;
                    if preserve_active {
                        let mut resolved_idx: Vec<usize> = doc
                            .blockers
                            .iter()
                            .enumerate()
                            .filter(|(_, b)| b.resolved)
                            .map(|(i, _)| i)
                            .collect();
                        resolved_idx.sort_by_key(|&i| doc.blockers[i].timestamp);
                        let to_remove: std::collections::HashSet<usize> =
                            resolved_idx.into_iter().take(drop).collect();
                        let mut i = 0;
                        doc.blockers.retain(|_| {
                            let keep = !to_remove.contains(&i);
                            i += 1;
                            keep
                        });
                    } else {
                        doc.blockers.sort_by_key(|b| b.timestamp);
                        let actual_drop = drop.min(doc.blockers.len());
                        doc.blockers.drain(0..actual_drop);
                    }
                }
                _ => {}
            }
            doc.last_cleanup = Some(Utc::now());
            Ok(Some(doc))
        })
        .await?;
        Ok(())
    }
}

fn summarize_entries<'a>(agent: &str, section: &str, entries: impl Iterator<Item = &'a str>) -> String {
    let mut out = format!("hygiene summary for {agent} / {section} at {}\n", Utc::now().to_rfc3339());
    for entry in entries {
        out.push_str("- ");
        out.push_str(entry);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Context;
    use crate::vector_store::VectorStoreClient;
    use crate::working_memory::{WorkingMemoryDelta, WorkingMemoryManager};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn make_engine(base: &std::path::Path, max_observations: usize) -> (HygieneEngine, Arc<WorkingMemoryManager>) {
        let mut cfg = MemorySubstrateConfig::default();
        cfg.base_dir = base.to_path_buf();
        cfg.max_observations = max_observations;
        let wm = Arc::new(WorkingMemoryManager::new(cfg.clone()));
        let vs = Arc::new(VectorStoreClient::new(cfg.clone()));
        (HygieneEngine::new(cfg, wm.clone(), vs), wm)
    }

    #[tokio::test]
    async fn hygiene_archives_before_trim_and_keeps_newest() {
        let dir = tempdir().unwrap();
        let (engine, wm) = make_engine(dir.path(), 10);
        wm.initialize("dev", None).await.unwrap();

        for i in 0..10 {
            let mut delta = WorkingMemoryDelta::default();
            delta.observation = Some(format!("obs-{i}"));
            wm.update("dev", delta).await.unwrap();
        }

        let hygiene_cfg = HygieneConfig {
            enable_auto: true,
            triggers: HygieneTriggers {
                run_after_each_action: true,
                run_on_memory_threshold: 0.8,
                run_on_age_threshold: false,
            },
            archival_rules: ArchivalRules {
                summarize_before_delete: true,
                retain_critical_facts: true,
                preserve_active_blockers: true,
                minimum_entries_before_cleanup: 5,
            },
        };

        let report = engine.perform_hygiene("dev", &hygiene_cfg, true).await.unwrap();
        assert!(report.success);

        let doc = wm.load("dev").await.unwrap().unwrap();
        assert_eq!(doc.observations.len(), 8);
        assert_eq!(doc.observations.last().unwrap().content, "obs-9");
    }

    #[test]
    fn analyze_skips_sections_under_minimum_entries() {
        let dir = tempdir().unwrap();
        let (engine, _wm) = make_engine(dir.path(), 10);
        let doc = WorkingMemory::new("dev", "1".to_string(), Context::default(), Utc::now());
        let hygiene_cfg = HygieneConfig::default();
        let analysis = engine.analyze(&doc, &hygiene_cfg);
        assert!(!analysis.cleanup_needed);
    }
}
