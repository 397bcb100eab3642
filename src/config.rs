//! Central configuration: limits, paths, and environment loading (C1).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, MemoryResult};

/// Process-wide configuration, built once at startup and treated as immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySubstrateConfig {
    pub base_dir: PathBuf,

    pub max_observations: usize,
    pub max_decisions: usize,
    pub max_blockers: usize,
    pub max_key_facts: usize,
    pub max_completed_tasks: usize,
    pub max_text_len: usize,
    pub max_agent_name_len: usize,
    pub max_age_hours: i64,

    pub file_lock_timeout_ms: u64,
    pub file_access_timeout_ms: u64,

    pub vector_host: String,
    pub vector_port: u16,
    pub vector_collection: String,
    pub vector_size: usize,
    pub vector_timeout_ms: u64,
    pub vector_health_interval_ms: u64,

    pub enable_input_validation: bool,
    pub embedding_provider: EmbeddingProviderKind,
    pub embedding_model_url: Option<String>,

    pub disk_warn_mb: u64,
    pub disk_critical_mb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbeddingProviderKind {
    Hash,
    Model,
}

impl Default for MemorySubstrateConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./agent_memory_data"),
            max_observations: 50,
            max_decisions: 30,
            max_blockers: 20,
            max_key_facts: 40,
            max_completed_tasks: 100,
            max_text_len: 4000,
            max_agent_name_len: 64,
            max_age_hours: 168,
            file_lock_timeout_ms: 5000,
            file_access_timeout_ms: 5000,
            vector_host: "localhost".to_string(),
            vector_port: 6333,
            vector_collection: "agent_memory".to_string(),
            vector_size: 256,
            vector_timeout_ms: 3000,
            vector_health_interval_ms: 30_000,
            enable_input_validation: true,
            embedding_provider: EmbeddingProviderKind::Hash,
            embedding_model_url: None,
            disk_warn_mb: 2048,
            disk_critical_mb: 512,
        }
    }
}

impl MemorySubstrateConfig {
    /// Build configuration from the environment, falling back to documented defaults.
    /// Malformed values (non-numeric, out-of-range) fail with `InvalidArgument`.
    pub fn from_env() -> MemoryResult<Self> {
        let d = Self::default();

        let base_dir = std::env::var("AGENT_MEMORY_BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or(d.base_dir);

        let max_observations = parse_env_usize("AGENT_MEMORY_MAX_OBSERVATIONS", d.max_observations)?;
        let max_decisions = parse_env_usize("AGENT_MEMORY_MAX_DECISIONS", d.max_decisions)?;
        let max_blockers = parse_env_usize("AGENT_MEMORY_MAX_BLOCKERS", d.max_blockers)?;
        let max_key_facts = parse_env_usize("AGENT_MEMORY_MAX_KEY_FACTS", d.max_key_facts)?;
        let max_completed_tasks =
            parse_env_usize("AGENT_MEMORY_MAX_COMPLETED_TASKS", d.max_completed_tasks)?;
        let max_text_len = parse_env_usize("AGENT_MEMORY_MAX_TEXT_LEN", d.max_text_len)?;
        let max_agent_name_len =
            parse_env_usize("AGENT_MEMORY_MAX_AGENT_NAME_LEN", d.max_agent_name_len)?;
        let max_age_hours = parse_env_i64("AGENT_MEMORY_MAX_AGE_HOURS", d.max_age_hours)?;

        let file_lock_timeout_ms =
            parse_env_u64("AGENT_MEMORY_FILE_LOCK_TIMEOUT_MS", d.file_lock_timeout_ms)?;
        let file_access_timeout_ms = parse_env_u64(
            "AGENT_MEMORY_FILE_ACCESS_TIMEOUT_MS",
            d.file_access_timeout_ms,
        )?;

        let vector_host =
            std::env::var("AGENT_MEMORY_VECTOR_HOST").unwrap_or(d.vector_host);
        let vector_port = parse_env_u16("AGENT_MEMORY_VECTOR_PORT", d.vector_port)?;
        let vector_collection =
            std::env::var("AGENT_MEMORY_VECTOR_COLLECTION").unwrap_or(d.vector_collection);
        let vector_size = parse_env_usize("AGENT_MEMORY_VECTOR_SIZE", d.vector_size)?;
        let vector_timeout_ms =
            parse_env_u64("AGENT_MEMORY_VECTOR_TIMEOUT_MS", d.vector_timeout_ms)?;
        let vector_health_interval_ms = parse_env_u64(
            "AGENT_MEMORY_VECTOR_HEALTH_INTERVAL_MS",
            d.vector_health_interval_ms,
        )?;

        let enable_input_validation = std::env::var("AGENT_MEMORY_ENABLE_INPUT_VALIDATION")
            .ok()
            .map(|s| parse_bool(&s))
            .transpose()?
            .unwrap_or(d.enable_input_validation);

        let embedding_provider = match std::env::var("AGENT_MEMORY_EMBEDDING_PROVIDER") {
            Ok(s) if s.eq_ignore_ascii_case("model") => EmbeddingProviderKind::Model,
            Ok(s) if s.eq_ignore_ascii_case("hash") => EmbeddingProviderKind::Hash,
            Ok(other) => {
                return Err(MemoryError::InvalidArgument(format!(
                    "AGENT_MEMORY_EMBEDDING_PROVIDER must be 'hash' or 'model', got '{other}'"
                )))
            }
            Err(_) => d.embedding_provider,
        };
        let embedding_model_url = std::env::var("AGENT_MEMORY_EMBEDDING_MODEL_URL").ok();

        let disk_warn_mb = parse_env_u64("AGENT_MEMORY_DISK_WARN_MB", d.disk_warn_mb)?;
        let disk_critical_mb =
            parse_env_u64("AGENT_MEMORY_DISK_CRITICAL_MB", d.disk_critical_mb)?;

        Ok(Self {
            base_dir,
            max_observations,
            max_decisions,
            max_blockers,
            max_key_facts,
            max_completed_tasks,
            max_text_len,
            max_agent_name_len,
            max_age_hours,
            file_lock_timeout_ms,
            file_access_timeout_ms,
            vector_host,
            vector_port,
            vector_collection,
            vector_size,
            vector_timeout_ms,
            vector_health_interval_ms,
            enable_input_validation,
            embedding_provider,
            embedding_model_url,
            disk_warn_mb,
            disk_critical_mb,
        })
    }

    pub fn working_memory_path(&self, agent: &str) -> PathBuf {
        self.base_dir.join(format!("working_memory_{agent}.json"))
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.base_dir.join("archive")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.base_dir.join("backups")
    }

    pub fn validation_log_path(&self, date: &str) -> PathBuf {
        self.base_dir.join("validation-logs").join(format!("{date}.log"))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

fn parse_bool(s: &str) -> MemoryResult<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(MemoryError::InvalidArgument(format!(
            "expected boolean, got '{other}'"
        ))),
    }
}

fn parse_env_usize(key: &str, default: usize) -> MemoryResult<usize> {
    match std::env::var(key) {
        Ok(s) => s
            .parse::<usize>()
            .map_err(|_| MemoryError::InvalidArgument(format!("{key} must be a non-negative integer, got '{s}'"))),
        Err(_) => Ok(default),
    }
}

fn parse_env_u64(key: &str, default: u64) -> MemoryResult<u64> {
    match std::env::var(key) {
        Ok(s) => s
            .parse::<u64>()
            .map_err(|_| MemoryError::InvalidArgument(format!("{key} must be a non-negative integer, got '{s}'"))),
        Err(_) => Ok(default),
    }
}

fn parse_env_i64(key: &str, default: i64) -> MemoryResult<i64> {
    match std::env::var(key) {
        Ok(s) => s
            .parse::<i64>()
            .map_err(|_| MemoryError::InvalidArgument(format!("{key} must be an integer, got '{s}'"))),
        Err(_) => Ok(default),
    }
}

fn parse_env_u16(key: &str, default: u16) -> MemoryResult<u16> {
    match std::env::var(key) {
        Ok(s) => s
            .parse::<u16>()
            .map_err(|_| MemoryError::InvalidArgument(format!("{key} must be a 16-bit port number, got '{s}'"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let cfg = MemorySubstrateConfig::default();
        assert_eq!(cfg.max_observations, 50);
        assert_eq!(cfg.vector_size, 256);
        assert_eq!(cfg.embedding_provider, EmbeddingProviderKind::Hash);
    }

    #[test]
    fn working_memory_path_uses_agent_name() {
        let cfg = MemorySubstrateConfig::default();
        let p = cfg.working_memory_path("dev");
        assert_eq!(p.file_name().unwrap(), "working_memory_dev.json");
    }
}
