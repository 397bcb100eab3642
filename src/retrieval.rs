//! Retrieval Pipeline (C6): two-tier fusion of short-term and long-term results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MemoryResult;
use crate::types::{Context, MetadataFilters, WorkingMemory};
use crate::vector_store::SharedVectorStore;
use crate::working_memory::SharedWorkingMemoryManager;

#[derive(Debug, Clone, Default)]
pub struct RetrievalOptions {
    pub story_id: Option<String>,
    pub epic_id: Option<String>,
    pub top_n: usize,
    pub short_term_only: bool,
    pub long_term_only: bool,
}

impl RetrievalOptions {
    pub fn with_defaults() -> Self {
        Self {
            top_n: 5,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedEntry {
    pub source: Source,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub context: Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    ShortTerm,
    LongTerm,
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub short_term: Vec<RetrievedEntry>,
    pub long_term: Vec<RetrievedEntry>,
    pub combined: Vec<RetrievedEntry>,
    pub query: String,
    pub error: Option<String>,
}

const SHORT_TERM_CAPS: (usize, usize, usize, usize) = (10, 5, 10, 5); // obs, dec, facts, blockers

pub struct RetrievalPipeline {
    working_memory: SharedWorkingMemoryManager,
    vector_store: SharedVectorStore,
}

impl RetrievalPipeline {
    pub fn new(working_memory: SharedWorkingMemoryManager, vector_store: SharedVectorStore) -> Self {
        Self {
            working_memory,
            vector_store,
        }
    }

    pub async fn retrieve(
        &self,
        agent: &str,
        query: &str,
        opts: &RetrievalOptions,
    ) -> MemoryResult<RetrievalResult> {
        let mut result = RetrievalResult {
            query: query.to_string(),
            ..Default::default()
        };

        if !opts.long_term_only {
            if let Some(doc) = self.working_memory.load(agent).await? {
                result.short_term = short_term_matches(&doc, query, opts);
            }
        }

        if !opts.short_term_only {
            match self.search_long_term(agent, query, opts).await {
                Ok(entries) => result.long_term = entries,
                Err(e) => {
                    result.error = Some(e.to_string());
                }
            }
        }

        result.combined = fuse(&result.short_term, &result.long_term);
        Ok(result)
    }

    async fn search_long_term(
        &self,
        agent: &str,
        query: &str,
        opts: &RetrievalOptions,
    ) -> MemoryResult<Vec<RetrievedEntry>> {
        if !self.vector_store.ensure_collection().await && self.vector_store.fallback_len().await == 0 {
            return Ok(Vec::new());
        }

        let mut augmented = query.to_string();
        if let Some(story_id) = &opts.story_id {
            augmented.push_str(&format!(" story:{story_id}"));
        }
        if let Some(epic_id) = &opts.epic_id {
            augmented.push_str(&format!(" epic:{epic_id}"));
        }
        augmented.push_str(&format!(" agent:{agent}"));

        let filters = MetadataFilters {
            agent: Some(agent.to_string()),
            story_id: opts.story_id.clone(),
            epic_id: opts.epic_id.clone(),
            task_id: None,
            record_type: None,
        };

        let top_n = if opts.top_n == 0 { 5 } else { opts.top_n };
        let records = self.vector_store.search(&augmented, top_n, &filters).await;

        Ok(records
            .into_iter()
            .filter(|(rec, _)| record_matches_opts(rec, opts))
            .map(|(rec, _)| RetrievedEntry {
                source: Source::LongTerm,
                entry_type: rec.record_type.to_string(),
                content: rec.text,
                timestamp: rec.timestamp,
                context: Context {
                    story_id: rec.story_id,
                    epic_id: rec.epic_id,
                    task_id: rec.task_id,
                },
            })
            .collect())
    }
}

fn record_matches_opts(rec: &crate::types::LongTermRecord, opts: &RetrievalOptions) -> bool {
    if let Some(story_id) = &opts.story_id {
        if rec.story_id.as_deref() != Some(story_id.as_str()) {
            return false;
        }
    }
    if let Some(epic_id) = &opts.epic_id {
        if rec.epic_id.as_deref() != Some(epic_id.as_str()) {
            return false;
        }
    }
    true
}

fn short_term_matches(doc: &WorkingMemory, query: &str, opts: &RetrievalOptions) -> Vec<RetrievedEntry> {
    let needle = query.to_lowercase();
    let mut out = Vec::new();
    let (obs_cap, dec_cap, fact_cap, blocker_cap) = SHORT_TERM_CAPS;

    let ctx_matches = |ctx: &Context| -> bool {
        let story_ok = opts.story_id.as_ref().map_or(true, |s| ctx.story_id.as_deref() == Some(s.as_str()));
        let epic_ok = opts.epic_id.as_ref().map_or(true, |e| ctx.epic_id.as_deref() == Some(e.as_str()));
        story_ok && epic_ok
    };

    let mut observations: Vec<_> = doc
        .observations
        .iter()
        .filter(|o| o.content.to_lowercase().contains(&needle) && ctx_matches(&o.context))
        .collect();
    observations.sort_by_key(|o| std::cmp::Reverse(o.timestamp));
    for o in observations.into_iter().take(obs_cap) {
        out.push(RetrievedEntry {
            source: Source::ShortTerm,
            entry_type: "observation".to_string(),
            content: o.content.clone(),
            timestamp: o.timestamp,
            context: o.context.clone(),
        });
    }

    let mut decisions: Vec<_> = doc
        .decisions
        .iter()
        .filter(|d| {
            (d.decision.to_lowercase().contains(&needle)
                || d.reasoning.as_deref().map(|r| r.to_lowercase().contains(&needle)).unwrap_or(false))
                && ctx_matches(&d.context)
        })
        .collect();
    decisions.sort_by_key(|d| std::cmp::Reverse(d.timestamp));
    for d in decisions.into_iter().take(dec_cap) {
        out.push(RetrievedEntry {
            source: Source::ShortTerm,
            entry_type: "decision".to_string(),
            content: d.decision.clone(),
            timestamp: d.timestamp,
            context: d.context.clone(),
        });
    }

    let mut facts: Vec<_> = doc
        .key_facts
        .values()
        .filter(|f| f.content.to_lowercase().contains(&needle) && ctx_matches(&f.context))
        .collect();
    facts.sort_by_key(|f| std::cmp::Reverse(f.timestamp));
    for f in facts.into_iter().take(fact_cap) {
        out.push(RetrievedEntry {
            source: Source::ShortTerm,
            entry_type: "key-fact".to_string(),
            content: f.content.clone(),
            timestamp: f.timestamp,
            context: f.context.clone(),
        });
    }

    let mut blockers: Vec<_> = doc
        .blockers
        .iter()
        .filter(|b| {
            (b.blocker.to_lowercase().contains(&needle)
                || b.resolution.as_deref().map(|r| r.to_lowercase().contains(&needle)).unwrap_or(false))
                && ctx_matches(&b.context)
        })
        .collect();
    blockers.sort_by_key(|b| std::cmp::Reverse(b.timestamp));
    for b in blockers.into_iter().take(blocker_cap) {
        out.push(RetrievedEntry {
            source: Source::ShortTerm,
            entry_type: "blocker".to_string(),
            content: b.blocker.clone(),
            timestamp: b.timestamp,
            context: b.context.clone(),
        });
    }

    if !doc.plan.is_empty() {
        let joined = doc.plan.join(" ");
        if joined.to_lowercase().contains(&needle) {
            out.push(RetrievedEntry {
                source: Source::ShortTerm,
                entry_type: "plan".to_string(),
                content: joined,
                timestamp: doc.last_updated,
                context: doc.current_context.clone(),
            });
        }
    }

    out.sort_by_key(|e| std::cmp::Reverse(e.timestamp));
    out
}

/// Stable sort: short-term before long-term; within each tier, timestamp desc (P8).
fn fuse(short_term: &[RetrievedEntry], long_term: &[RetrievedEntry]) -> Vec<RetrievedEntry> {
    let mut combined: Vec<RetrievedEntry> = short_term.iter().cloned().chain(long_term.iter().cloned()).collect();
    combined.sort_by(|a, b| {
        let rank = |e: &RetrievedEntry| matches!(e.source, Source::LongTerm) as u8;
        rank(a).cmp(&rank(b)).then_with(|| b.timestamp.cmp(&a.timestamp))
    });
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemorySubstrateConfig;
    use crate::vector_store::VectorStoreClient;
    use crate::working_memory::{WorkingMemoryDelta, WorkingMemoryManager};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn fusion_orders_short_term_before_long_term() {
        let dir = tempdir().unwrap();
        let mut cfg = MemorySubstrateConfig::default();
        cfg.base_dir = dir.path().to_path_buf();
        let wm = Arc::new(WorkingMemoryManager::new(cfg.clone()));
        let vs = Arc::new(VectorStoreClient::new(cfg.clone()));

        wm.initialize("dev", None).await.unwrap();
        let mut delta = WorkingMemoryDelta::default();
        delta.observation = Some("null pointer exception observed".to_string());
        wm.update("dev", delta).await.unwrap();

        vs.store(
            "dev",
            "null pointer historical fix",
            crate::types::LongTermType::Observation,
            None,
            None,
            None,
            std::collections::HashMap::new(),
        )
        .await
        .unwrap();

        let pipeline = RetrievalPipeline::new(wm, vs);
        let result = pipeline
            .retrieve("dev", "null pointer", &RetrievalOptions::with_defaults())
            .await
            .unwrap();

        assert!(!result.combined.is_empty());
        let first_long_term_idx = result.combined.iter().position(|e| e.source == Source::LongTerm);
        if let Some(idx) = first_long_term_idx {
            assert!(result.combined[..idx].iter().all(|e| e.source == Source::ShortTerm));
        }
    }

    #[tokio::test]
    async fn unknown_query_yields_empty_not_error() {
        let dir = tempdir().unwrap();
        let mut cfg = MemorySubstrateConfig::default();
        cfg.base_dir = dir.path().to_path_buf();
        let wm = Arc::new(WorkingMemoryManager::new(cfg.clone()));
        let vs = Arc::new(VectorStoreClient::new(cfg.clone()));
        wm.initialize("dev", None).await.unwrap();

        let pipeline = RetrievalPipeline::new(wm, vs);
        let result = pipeline
            .retrieve("dev", "nothing matches this", &RetrievalOptions::with_defaults())
            .await
            .unwrap();
        assert!(result.combined.is_empty());
    }
}
