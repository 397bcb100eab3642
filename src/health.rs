//! Health Subsystem (C7): per-agent checks, aggregation, periodic monitor
//! with memory-safe history.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::MemorySubstrateConfig;
use crate::error::MemoryResult;
use crate::types::{HealthEntry, HealthStatus, Severity};
use crate::vector_store::SharedVectorStore;
use crate::working_memory::SharedWorkingMemoryManager;

const MAX_HISTORY_PER_AGENT: usize = 200;
const MAX_TRACKED_AGENTS: usize = 500;
const HISTORY_HORIZON_HOURS: i64 = 24;

#[derive(Debug, Clone, Default)]
pub struct AggregatedHealth {
    pub overall_status: Option<HealthStatus>,
    pub checks: HashMap<String, Vec<HealthEntry>>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HealthCheckResult {
    pub overall_status: HealthStatus,
    pub checks: HashMap<String, HealthEntry>,
    pub recommendations: Vec<String>,
}

struct HistoryBucket {
    entries: VecDeque<HealthEntry>,
    last_updated: chrono::DateTime<chrono::Utc>,
}

pub struct HealthSubsystem {
    cfg: MemorySubstrateConfig,
    working_memory: SharedWorkingMemoryManager,
    vector_store: SharedVectorStore,
    history: DashMap<String, HistoryBucket>,
    monitors: DashMap<String, JoinHandle<()>>,
}

impl HealthSubsystem {
    pub fn new(
        cfg: MemorySubstrateConfig,
        working_memory: SharedWorkingMemoryManager,
        vector_store: SharedVectorStore,
    ) -> Self {
        Self {
            cfg,
            working_memory,
            vector_store,
            history: DashMap::new(),
            monitors: DashMap::new(),
        }
    }

    /// Full check set for `agent`, including the optional I/O-heavy
    /// `vectorOperations` round trip.
    pub async fn check(&self, agent: &str, include_vector_ops: bool) -> MemoryResult<HealthCheckResult> {
        let mut checks = HashMap::new();

        checks.insert("memoryDirectory".to_string(), self.check_memory_directory().await);
        checks.insert("workingMemoryRead".to_string(), self.check_working_memory_read(agent).await);
        checks.insert("workingMemoryWrite".to_string(), self.check_working_memory_write(agent).await);
        checks.insert("vectorConnectivity".to_string(), self.check_vector_connectivity().await);
        if include_vector_ops {
            checks.insert("vectorOperations".to_string(), self.check_vector_operations(agent).await);
        }
        checks.insert("diskSpace".to_string(), self.check_disk_space().await);

        let overall_status = aggregate_status(checks.values());
        let recommendations = recommendations_for(checks.values());

        self.record_history(agent, checks.values().cloned());

        Ok(HealthCheckResult {
            overall_status,
            checks,
            recommendations,
        })
    }

    async fn check_memory_directory(&self) -> HealthEntry {
        let dir = self.cfg.base_dir();
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            return unhealthy("memoryDirectory", format!("cannot create base directory: {e}"));
        }
        let probe = dir.join(".health-probe");
        match tokio::fs::write(&probe, b"ok").await {
            Ok(()) => {
                let _ = tokio::fs::remove_file(&probe).await;
                healthy("memoryDirectory", "directory exists and is writable")
            }
            Err(e) => unhealthy("memoryDirectory", format!("directory not writable: {e}")),
        }
    }

    async fn check_working_memory_read(&self, agent: &str) -> HealthEntry {
        match self.working_memory.load(agent).await {
            Ok(_) => healthy("workingMemoryRead", "absent or valid JSON"),
            Err(e) => HealthEntry {
                component: "workingMemoryRead".to_string(),
                status: HealthStatus::Degraded,
                severity: Severity::Warning,
                message: format!("invalid JSON: {e}"),
                timestamp: chrono::Utc::now(),
                metadata: HashMap::new(),
            },
        }
    }

    async fn check_working_memory_write(&self, agent: &str) -> HealthEntry {
        let path = self.cfg.working_memory_path(agent).with_file_name(format!(".health-write-{agent}.json"));
        let marker = serde_json::json!({"marker": "health-check"});
        if let Err(e) = crate::file_store::safe_write_json(&path, &marker).await {
            return unhealthy("workingMemoryWrite", format!("write failed: {e}"));
        }
        let readback: MemoryResult<serde_json::Value> =
            crate::file_store::safe_read_json(&path, serde_json::json!(null)).await;
        let _ = tokio::fs::remove_file(&path).await;
        match readback {
            Ok(v) if v == marker => healthy("workingMemoryWrite", "write/read round trip succeeded"),
            Ok(_) => unhealthy("workingMemoryWrite", "round trip mismatch"),
            Err(e) => unhealthy("workingMemoryWrite", format!("read back failed: {e}")),
        }
    }

    async fn check_vector_connectivity(&self) -> HealthEntry {
        let timeout = Duration::from_millis(self.cfg.vector_timeout_ms);
        match tokio::time::timeout(timeout, self.vector_store.is_healthy()).await {
            Ok(true) => healthy("vectorConnectivity", "vector store reachable"),
            Ok(false) => degraded("vectorConnectivity", "vector store unreachable, using fallback"),
            Err(_) => degraded("vectorConnectivity", "vector store probe timed out"),
        }
    }

    async fn check_vector_operations(&self, agent: &str) -> HealthEntry {
        let marker_text = format!("health-marker-{agent}-{}", uuid::Uuid::new_v4());
        let store_result = self
            .vector_store
            .store(
                agent,
                &marker_text,
                crate::types::LongTermType::SessionSummary,
                None,
                None,
                None,
                HashMap::new(),
            )
            .await;

        match store_result {
            Ok(_) => {
                let filters = crate::types::MetadataFilters {
                    agent: Some(agent.to_string()),
                    ..Default::default()
                };
                let found = self.vector_store.search(&marker_text, 1, &filters).await;
                if found.iter().any(|(rec, _)| rec.text == marker_text) {
                    healthy("vectorOperations", "store/search round trip succeeded")
                } else {
                    degraded("vectorOperations", "stored marker not found on search")
                }
            }
            Err(e) => degraded("vectorOperations", format!("store failed: {e}")),
        }
    }

    async fn check_disk_space(&self) -> HealthEntry {
        let warn_mb = self.cfg.disk_warn_mb;
        let critical_mb = self.cfg.disk_critical_mb;
        let base_dir = self.cfg.base_dir();

        let disks = sysinfo::Disks::new_with_refreshed_list();
        let available_mb = disks
            .iter()
            .filter(|d| base_dir.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space() / (1024 * 1024));

        match available_mb {
            Some(mb) if mb < critical_mb => critical(
                "diskSpace",
                format!("{mb} MB free, below critical threshold {critical_mb} MB"),
            ),
            Some(mb) if mb < warn_mb => degraded(
                "diskSpace",
                format!("{mb} MB free, below warning threshold {warn_mb} MB"),
            ),
            Some(mb) => healthy("diskSpace", format!("{mb} MB free")),
            None => degraded("diskSpace", "no filesystem found for base directory mount point"),
        }
    }

    fn record_history(&self, agent: &str, entries: impl Iterator<Item = HealthEntry>) {
        let now = chrono::Utc::now();
        if self.history.len() >= MAX_TRACKED_AGENTS && !self.history.contains_key(agent) {
            if let Some(oldest_key) = self
                .history
                .iter()
                .min_by_key(|e| e.value().last_updated)
                .map(|e| e.key().clone())
            {
                self.history.remove(&oldest_key);
            }
        }

        let mut bucket = self.history.entry(agent.to_string()).or_insert_with(|| HistoryBucket {
            entries: VecDeque::new(),
            last_updated: now,
        });
        bucket.last_updated = now;
        for entry in entries {
            bucket.entries.push_back(entry);
            if bucket.entries.len() > MAX_HISTORY_PER_AGENT {
                bucket.entries.pop_front();
            }
        }
        let horizon = chrono::Duration::hours(HISTORY_HORIZON_HOURS);
        bucket.entries.retain(|e| now - e.timestamp < horizon);
    }

    /// Per-agent rollup across tracked history.
    pub fn aggregated(&self) -> HashMap<String, AggregatedHealth> {
        self.history
            .iter()
            .map(|entry| {
                let agent = entry.key().clone();
                let mut checks: HashMap<String, Vec<HealthEntry>> = HashMap::new();
                for e in entry.value().entries.iter() {
                    checks.entry(e.component.clone()).or_default().push(e.clone());
                }
                let latest: Vec<HealthEntry> = checks.values().filter_map(|v| v.last().cloned()).collect();
                let overall_status = if latest.is_empty() {
                    None
                } else {
                    Some(aggregate_status(latest.iter()))
                };
                let recommendations = recommendations_for(latest.iter());
                (
                    agent,
                    AggregatedHealth {
                        overall_status,
                        checks,
                        recommendations,
                    },
                )
            })
            .collect()
    }

    /// Starts a periodic monitor running the non-I/O-heavy subset (no
    /// `vectorOperations`). Returns a stop handle; ensures a single monitor
    /// per agent by replacing any prior one.
    pub fn start_periodic(self: &Arc<Self>, agent: &str, interval_ms: u64) -> StopHandle {
        let agent = agent.to_string();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                if let Err(e) = this.check(&agent, false).await {
                    warn!(agent = %agent, error = %e, "periodic health check failed");
                }
            }
        });

        if let Some((_, old)) = self.monitors.remove(&agent) {
            old.abort();
        }
        self.monitors.insert(agent.clone(), handle);

        StopHandle {
            subsystem: self.clone(),
            agent,
        }
    }
}

/// Returned by `start_periodic`; dropping or calling `stop` ends the monitor.
pub struct StopHandle {
    subsystem: Arc<HealthSubsystem>,
    agent: String,
}

impl StopHandle {
    pub fn stop(self) {
        if let Some((_, handle)) = self.subsystem.monitors.remove(&self.agent) {
            handle.abort();
        }
    }
}

fn aggregate_status<'a>(entries: impl Iterator<Item = &'a HealthEntry>) -> HealthStatus {
    let mut status = HealthStatus::Healthy;
    for e in entries {
        match e.status {
            HealthStatus::Unhealthy => return HealthStatus::Unhealthy,
            HealthStatus::Degraded => status = HealthStatus::Degraded,
            HealthStatus::Healthy => {}
        }
    }
    status
}

fn recommendations_for<'a>(entries: impl Iterator<Item = &'a HealthEntry>) -> Vec<String> {
    entries
        .filter(|e| e.status != HealthStatus::Healthy)
        .map(|e| {
            let base = match e.component.as_str() {
                "memoryDirectory" | "workingMemoryWrite" => "Ensure write permissions on the memory base directory".to_string(),
                "diskSpace" => "Free up disk space".to_string(),
                "vectorConnectivity" | "vectorOperations" => "Check vector store connectivity and credentials".to_string(),
                "workingMemoryRead" => "Reinitialize the corrupted working-memory document".to_string(),
                other => format!("Investigate {other}"),
            };
            if e.severity == Severity::Critical {
                format!("CRITICAL: {base}")
            } else {
                base
            }
        })
        .collect()
}

fn healthy(component: &str, message: &str) -> HealthEntry {
    HealthEntry {
        component: component.to_string(),
        status: HealthStatus::Healthy,
        severity: Severity::Info,
        message: message.to_string(),
        timestamp: chrono::Utc::now(),
        metadata: HashMap::new(),
    }
}

fn degraded(component: &str, message: impl Into<String>) -> HealthEntry {
    HealthEntry {
        component: component.to_string(),
        status: HealthStatus::Degraded,
        severity: Severity::Warning,
        message: message.into(),
        timestamp: chrono::Utc::now(),
        metadata: HashMap::new(),
    }
}

fn unhealthy(component: &str, message: impl Into<String>) -> HealthEntry {
    HealthEntry {
        component: component.to_string(),
        status: HealthStatus::Unhealthy,
        severity: Severity::Error,
        message: message.into(),
        timestamp: chrono::Utc::now(),
        metadata: HashMap::new(),
    }
}

/// Worse than `unhealthy`'s default `Error` severity; used for thresholds
/// the spec calls out as CRITICAL (e.g. disk space below the critical mark).
fn critical(component: &str, message: impl Into<String>) -> HealthEntry {
    HealthEntry {
        component: component.to_string(),
        status: HealthStatus::Unhealthy,
        severity: Severity::Critical,
        message: message.into(),
        timestamp: chrono::Utc::now(),
        metadata: HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_store::VectorStoreClient;
    use crate::working_memory::WorkingMemoryManager;
    use tempfile::tempdir;

    fn make_subsystem(base: &std::path::Path) -> Arc<HealthSubsystem> {
        let mut cfg = MemorySubstrateConfig::default();
        cfg.base_dir = base.to_path_buf();
        let wm = Arc::new(WorkingMemoryManager::new(cfg.clone()));
        let vs = Arc::new(VectorStoreClient::new(cfg.clone()));
        Arc::new(HealthSubsystem::new(cfg, wm, vs))
    }

    #[tokio::test]
    async fn healthy_directory_yields_overall_degraded_when_vector_down() {
        let dir = tempdir().unwrap();
        let subsystem = make_subsystem(dir.path());
        let result = subsystem.check("dev", false).await.unwrap();
        // No live vector backend is wired into this build, so connectivity
        // degrades; directory/read/write/disk all succeed.
        assert_eq!(result.overall_status, HealthStatus::Degraded);
        assert!(result.checks.contains_key("memoryDirectory"));
        assert!(!result.recommendations.is_empty());
    }

    #[tokio::test]
    async fn aggregated_rolls_up_latest_check_per_component() {
        let dir = tempdir().unwrap();
        let subsystem = make_subsystem(dir.path());
        subsystem.check("dev", false).await.unwrap();
        let agg = subsystem.aggregated();
        assert!(agg.contains_key("dev"));
        assert!(agg["dev"].overall_status.is_some());
    }
}
