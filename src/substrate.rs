//! External Surface (C9): the narrow operation set consumed by agents and
//! the workflow engine (§6).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::MemorySubstrateConfig;
use crate::error::MemoryResult;
use crate::health::{HealthCheckResult, HealthSubsystem};
use crate::hooks::{default_memory_save_validator, HookPoint, HookRegistry};
use crate::hygiene::{HygieneConfig, HygieneEngine, HygieneReport};
use crate::retrieval::{RetrievalOptions, RetrievalPipeline, RetrievalResult};
use crate::types::{Context, LongTermType, WorkingMemory};
use crate::vector_store::VectorStoreClient;
use crate::working_memory::{ContextSufficiency, UpdateDiagnostics, WorkingMemoryDelta, WorkingMemoryManager};

/// Entry point composing C1-C8 behind the operation surface described in §6.
/// Construct with [`MemorySubstrate::init`].
pub struct MemorySubstrate {
    cfg: MemorySubstrateConfig,
    working_memory: Arc<WorkingMemoryManager>,
    vector_store: Arc<VectorStoreClient>,
    hygiene: Arc<HygieneEngine>,
    retrieval: Arc<RetrievalPipeline>,
    health: Arc<HealthSubsystem>,
    hooks: Arc<HookRegistry>,
    hygiene_cfg: HygieneConfig,
}

impl MemorySubstrate {
    /// Build the substrate from the given configuration, wiring the default
    /// `beforeMemorySave` validator.
    pub fn init(cfg: MemorySubstrateConfig) -> Self {
        let working_memory = Arc::new(WorkingMemoryManager::new(cfg.clone()));
        let vector_store = Arc::new(VectorStoreClient::new(cfg.clone()));
        let hygiene = Arc::new(HygieneEngine::new(cfg.clone(), working_memory.clone(), vector_store.clone()));
        let retrieval = Arc::new(RetrievalPipeline::new(working_memory.clone(), vector_store.clone()));
        let health = Arc::new(HealthSubsystem::new(cfg.clone(), working_memory.clone(), vector_store.clone()));
        let hooks = Arc::new(HookRegistry::new(cfg.clone()));
        hooks.register(HookPoint::BeforeMemorySave, default_memory_save_validator(&cfg));

        spawn_lock_table_janitor(cfg.file_lock_timeout_ms);

        info!(base_dir = %cfg.base_dir().display(), "memory substrate initialized");

        Self {
            cfg,
            working_memory,
            vector_store,
            hygiene,
            retrieval,
            health,
            hooks,
            hygiene_cfg: HygieneConfig::default(),
        }
    }

    /// Build from the environment (§6), failing with `InvalidArgument` on
    /// malformed configuration.
    pub fn from_env() -> MemoryResult<Self> {
        Ok(Self::init(MemorySubstrateConfig::from_env()?))
    }

    pub fn config(&self) -> &MemorySubstrateConfig {
        &self.cfg
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn hygiene_config(&self) -> &HygieneConfig {
        &self.hygiene_cfg
    }

    /// Replaces the hygiene policy used by `update_working`'s automatic
    /// trigger and by `perform_hygiene`'s default (non-forced) run.
    pub fn set_hygiene_config(&mut self, hygiene_cfg: HygieneConfig) {
        self.hygiene_cfg = hygiene_cfg;
    }

    pub fn health(&self) -> &Arc<HealthSubsystem> {
        &self.health
    }

    pub async fn init_working(&self, agent: &str, ctx: Option<Context>) -> MemoryResult<WorkingMemory> {
        self.working_memory.initialize(agent, ctx).await
    }

    pub async fn load_working(&self, agent: &str) -> MemoryResult<Option<WorkingMemory>> {
        self.working_memory.load(agent).await
    }

    /// Runs `beforeMemorySave` before mutating, then applies the delta, then
    /// fires hygiene asynchronously in the agent's single-slot queue.
    pub async fn update_working(
        &self,
        agent: &str,
        delta: WorkingMemoryDelta,
    ) -> MemoryResult<(WorkingMemory, UpdateDiagnostics)> {
        let payload = serde_json::json!({
            "text": delta.observation.clone().or(delta.decision.clone()).unwrap_or_default(),
        });
        let outcome = self.hooks.run(HookPoint::BeforeMemorySave, &payload).await?;
        if !outcome.valid {
            return Err(crate::error::MemoryError::InvalidArgument(outcome.errors.join("; ")));
        }

        let result = self.working_memory.update(agent, delta).await?;
        self.spawn_hygiene_if_idle(agent);
        Ok(result)
    }

    fn spawn_hygiene_if_idle(&self, agent: &str) {
        if !self.hygiene_cfg.enable_auto || !self.hygiene_cfg.triggers.run_after_each_action {
            return;
        }
        if !self.working_memory.try_begin_hygiene(agent) {
            return; // overlapping request dropped, not queued (spec §9)
        }

        let agent = agent.to_string();
        let hygiene = self.hygiene.clone();
        let hygiene_cfg = self.hygiene_cfg.clone();
        let working_memory = self.working_memory.clone();
        tokio::spawn(async move {
            if let Err(e) = hygiene.perform_hygiene(&agent, &hygiene_cfg, false).await {
                tracing::warn!(agent = %agent, error = %e, "background hygiene run failed");
            }
            working_memory.end_hygiene(&agent);
        });
    }

    pub async fn clear_working(&self, agent: &str, preserve_context: bool) -> MemoryResult<()> {
        self.working_memory.clear(agent, preserve_context).await
    }

    /// Never returns `null`; synthetic `fallback_*` id when the vector store
    /// is degraded.
    pub async fn store_long_term(
        &self,
        agent: &str,
        text: &str,
        record_type: LongTermType,
        ctx: Context,
        extra_metadata: HashMap<String, serde_json::Value>,
    ) -> MemoryResult<String> {
        let payload = serde_json::json!({ "text": text, "storyId": ctx.story_id });
        let outcome = self.hooks.run(HookPoint::BeforeMemorySave, &payload).await?;
        if !outcome.valid {
            return Err(crate::error::MemoryError::InvalidArgument(outcome.errors.join("; ")));
        }

        let sanitized = crate::validation::validate_and_sanitize("longTermText", text, &self.cfg)?;
        self.vector_store
            .store(
                agent,
                &sanitized,
                record_type,
                ctx.story_id,
                ctx.epic_id,
                ctx.task_id,
                extra_metadata,
            )
            .await
    }

    pub async fn retrieve_memory(
        &self,
        agent: &str,
        query: &str,
        opts: RetrievalOptions,
    ) -> MemoryResult<RetrievalResult> {
        self.retrieval.retrieve(agent, query, &opts).await
    }

    /// Materializes a task-summary record from the working document without
    /// mutating it.
    pub async fn archive_task(&self, agent: &str, task_id: &str) -> MemoryResult<String> {
        let doc = self.working_memory.load(agent).await?.unwrap_or_else(|| {
            WorkingMemory::new(agent, "0".to_string(), Context::default(), chrono::Utc::now())
        });

        let relevant_decisions: Vec<&str> = doc
            .decisions
            .iter()
            .filter(|d| d.context.task_id.as_deref() == Some(task_id))
            .map(|d| d.decision.as_str())
            .collect();
        let relevant_facts: Vec<&str> = doc
            .key_facts
            .values()
            .filter(|f| f.context.task_id.as_deref() == Some(task_id))
            .map(|f| f.content.as_str())
            .collect();

        let mut summary = format!("task archive for {agent} / {task_id} at {}\n", chrono::Utc::now().to_rfc3339());
        summary.push_str("decisions:\n");
        for d in &relevant_decisions {
            summary.push_str("- ");
            summary.push_str(d);
            summary.push('\n');
        }
        summary.push_str("key facts:\n");
        for f in &relevant_facts {
            summary.push_str("- ");
            summary.push_str(f);
            summary.push('\n');
        }

        self.vector_store
            .store(
                agent,
                &summary,
                LongTermType::TaskArchive,
                doc.current_context.story_id.clone(),
                doc.current_context.epic_id.clone(),
                Some(task_id.to_string()),
                HashMap::new(),
            )
            .await
    }

    pub async fn check_context(&self, agent: &str, required: &[String]) -> MemoryResult<ContextSufficiency> {
        self.working_memory.check_context_sufficiency(agent, required).await
    }

    pub async fn perform_hygiene(&self, agent: &str, force: bool) -> MemoryResult<HygieneReport> {
        self.hygiene.perform_hygiene(agent, &self.hygiene_cfg, force).await
    }

    pub async fn health_check(&self, agent: &str, include_vector_ops: bool) -> MemoryResult<HealthCheckResult> {
        self.health.check(agent, include_vector_ops).await
    }

    pub fn aggregated_health(&self) -> HashMap<String, crate::health::AggregatedHealth> {
        self.health.aggregated()
    }
}

/// Background sweep of `LockTable::global()` for holders that exceeded
/// `5 * file_lock_timeout_ms` without releasing (spec §4.2). Each `acquire`
/// already bounds its own wait, so this only reclaims table entries, it
/// never unblocks a caller.
fn spawn_lock_table_janitor(file_lock_timeout_ms: u64) {
    let max_age = Duration::from_millis(file_lock_timeout_ms.saturating_mul(5));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            crate::file_store::LockTable::global().purge_expired(max_age);
        }
    });
}

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
    async fn degraded_retrieval_scenario() {
        let dir = tempdir().unwrap();
        let substrate = MemorySubstrate::init(cfg(dir.path()));

        let id = substrate
            .store_long_term(
                "qa",
                "review pattern: null ptr",
                LongTermType::Observation,
                Context::default(),
                HashMap::new(),
            )
            .await
            .unwrap();
        assert!(id.starts_with("fallback_"));

        let result = substrate
            .retrieve_memory("qa", "null ptr", RetrievalOptions::with_defaults())
            .await
            .unwrap();
        assert!(result.long_term.iter().any(|e| e.content.contains("null ptr")));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn update_runs_validation_hook_before_mutation() {
        let dir = tempdir().unwrap();
        let substrate = MemorySubstrate::init(cfg(dir.path()));
        substrate.init_working("dev", None).await.unwrap();

        let mut delta = WorkingMemoryDelta::default();
        delta.observation = Some("routine observation".to_string());
        let (doc, _) = substrate.update_working("dev", delta).await.unwrap();
        assert_eq!(doc.observations.len(), 1);
    }
}
