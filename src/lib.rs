//! Agent memory substrate: durable, concurrency-safe working memory for a
//! multi-agent workflow, with archival to a long-term vector-indexed store,
//! two-tier retrieval fusion, and a health/monitoring subsystem.

pub mod config;
pub mod error;
pub mod file_store;
pub mod health;
pub mod hooks;
pub mod hygiene;
pub mod retrieval;
pub mod substrate;
pub mod types;
pub mod validation;
pub mod vector_store;
pub mod working_memory;

pub use config::{EmbeddingProviderKind, MemorySubstrateConfig};
pub use error::{MemoryError, MemoryResult};
pub use health::{AggregatedHealth, HealthCheckResult, HealthSubsystem, StopHandle};
pub use hooks::{HookPoint, HookRegistry, ValidationOutcome};
pub use hygiene::{ArchivalRules, HygieneConfig, HygieneEngine, HygieneReport, HygieneTriggers};
pub use retrieval::{RetrievalOptions, RetrievalPipeline, RetrievalResult, RetrievedEntry, Source};
pub use substrate::MemorySubstrate;
pub use types::{
    Blocker, CompletedTask, Context, Decision, EmbeddingMethod, HealthEntry, HealthStatus,
    KeyFact, LongTermRecord, LongTermType, MetadataFilters, Observation, Severity, WorkingMemory,
};
pub use vector_store::VectorStoreClient;
pub use working_memory::{ContextSufficiency, UpdateDiagnostics, WorkingMemoryDelta, WorkingMemoryManager};

/// Convenience initializer for tests and example binaries. Library
/// consumers embedding this crate into a larger service are expected to
/// install their own subscriber instead.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_env("AGENT_MEMORY_LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt().with_env_filter(filter).try_init();
}
