//! Vector Store Client (C3): embedding generation, collection bootstrap,
//! upsert/search, health probe, in-process fallback map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::{EmbeddingProviderKind, MemorySubstrateConfig};
use crate::error::{MemoryError, MemoryResult};
use crate::types::{EmbeddingMethod, LongTermRecord, LongTermType, MetadataFilters};

/// Cosine similarity between two equal-length vectors, grounded on the same
/// formula the teacher's embedding-service uses.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Deterministically derive a fixed-dimensional vector from a SHA-256 hash of
/// `text`. Stable across runs/processes — the same text always yields the
/// same vector, which keeps tests reproducible without a live model.
pub fn hash_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    let mut out = Vec::with_capacity(dimension);
    for i in 0..dimension {
        let byte = digest[i % digest.len()] as u64;
        let seed = byte.wrapping_add(i as u64 * 31);
        let normalized = (seed % 1000) as f32 / 1000.0;
        out.push(normalized * 2.0 - 1.0);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HealthVerdict {
    Healthy,
    Unhealthy,
}

struct HealthCache {
    verdict: HealthVerdict,
    checked_at: Instant,
}

struct FallbackEntry {
    record: LongTermRecord,
}

/// Client over an external ANN/vector index, with a deterministic embedding
/// fallback and an in-process fallback store for when the index is down.
/// All store/search operations are non-fatal (spec §4.3).
pub struct VectorStoreClient {
    cfg: MemorySubstrateConfig,
    health: RwLock<Option<HealthCache>>,
    fallback: RwLock<HashMap<String, FallbackEntry>>,
    fallback_counter: AtomicU64,
    reachable_override: RwLock<Option<bool>>,
}

impl VectorStoreClient {
    pub fn new(cfg: MemorySubstrateConfig) -> Self {
        Self {
            cfg,
            health: RwLock::new(None),
            fallback: RwLock::new(HashMap::new()),
            fallback_counter: AtomicU64::new(0),
            reachable_override: RwLock::new(None),
        }
    }

    /// Test-only hook to force the degraded path without a real network dependency.
    #[doc(hidden)]
    pub async fn force_unreachable(&self, unreachable: bool) {
        *self.reachable_override.write().await = Some(!unreachable);
    }

    /// Generate an embedding, preferring an external model when configured
    /// and reachable, else a deterministic hash fallback.
    pub async fn generate_embedding(&self, text: &str) -> (Vec<f32>, EmbeddingMethod) {
        if self.cfg.embedding_provider == EmbeddingProviderKind::Model && self.probe_model().await {
            match self.call_model(text).await {
                Ok(vector) => return (vector, EmbeddingMethod::Model),
                Err(e) => {
                    warn!(error = %e, "embedding model call failed, falling back to hash embedding");
                }
            }
        }
        (hash_embedding(text, self.cfg.vector_size), EmbeddingMethod::Hash)
    }

    async fn probe_model(&self) -> bool {
        self.cfg.embedding_model_url.is_some() && self.is_healthy().await
    }

    #[cfg(feature = "model-embeddings")]
    async fn call_model(&self, text: &str) -> MemoryResult<Vec<f32>> {
        let url = self.cfg.embedding_model_url.as_deref().ok_or_else(|| {
            MemoryError::DegradedExternal("embedding model url not configured".into())
        })?;
        let timeout = Duration::from_millis(self.cfg.vector_timeout_ms);
        let client = reqwest::Client::new();
        let response = client
            .post(url)
            .json(&serde_json::json!({ "input": text }))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| MemoryError::DegradedExternal(format!("embedding request failed: {e}")))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| MemoryError::DegradedExternal(format!("embedding response decode failed: {e}")))?;

        let vector: Vec<f32> = body
            .get("embedding")
            .and_then(|v| v.as_array())
            .ok_or_else(|| MemoryError::DegradedExternal("embedding response missing 'embedding' array".into()))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        if vector.is_empty() {
            return Err(MemoryError::DegradedExternal("embedding response contained no values".into()));
        }
        Ok(vector)
    }

    /// Without the `model-embeddings` feature there is no HTTP client in the
    /// dependency tree; this always degrades to the hash fallback.
    #[cfg(not(feature = "model-embeddings"))]
    async fn call_model(&self, _text: &str) -> MemoryResult<Vec<f32>> {
        Err(MemoryError::DegradedExternal(
            "model-embeddings feature not enabled in this build".into(),
        ))
    }

    /// Idempotently "creates" the configured collection. There is no real
    /// external index backing this client; ensures the fallback map exists
    /// and returns the health verdict, matching the contract's `false`
    /// when unhealthy.
    pub async fn ensure_collection(&self) -> bool {
        self.is_healthy().await
    }

    /// Health probe, cached for `vector_health_interval_ms`. Attempts a
    /// lightweight TCP connect against `vector_host:vector_port` before
    /// declaring the store unreachable.
    pub async fn is_healthy(&self) -> bool {
        if let Some(forced) = *self.reachable_override.read().await {
            return forced;
        }

        {
            let cache = self.health.read().await;
            if let Some(c) = cache.as_ref() {
                if c.checked_at.elapsed() < Duration::from_millis(self.cfg.vector_health_interval_ms)
                {
                    return c.verdict == HealthVerdict::Healthy;
                }
            }
        }

        let reachable = self.probe_backend().await;
        let verdict = if reachable { HealthVerdict::Healthy } else { HealthVerdict::Unhealthy };
        *self.health.write().await = Some(HealthCache {
            verdict,
            checked_at: Instant::now(),
        });
        verdict == HealthVerdict::Healthy
    }

    /// Lightweight reachability probe: connect-and-drop against the
    /// configured vector host/port, bounded by `vector_timeout_ms`.
    async fn probe_backend(&self) -> bool {
        let addr = format!("{}:{}", self.cfg.vector_host, self.cfg.vector_port);
        let timeout = Duration::from_millis(self.cfg.vector_timeout_ms);
        match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(addr = %addr, error = %e, "vector backend connect failed");
                false
            }
            Err(_) => {
                debug!(addr = %addr, "vector backend probe timed out");
                false
            }
        }
    }

    /// Sanitizes the text (caller's responsibility via C1), embeds, and
    /// upserts. Never raises on a degraded store; returns a `fallback_<n>`
    /// id instead (I6, P9).
    pub async fn store(
        &self,
        agent: &str,
        text: &str,
        record_type: LongTermType,
        story_id: Option<String>,
        epic_id: Option<String>,
        task_id: Option<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> MemoryResult<String> {
        let (embedding, method) = self.generate_embedding(text).await;
        let healthy = self.is_healthy().await;

        let now = Utc::now();
        let id = if healthy {
            now.timestamp_nanos_opt().unwrap_or_default().to_string()
        } else {
            let n = self.fallback_counter.fetch_add(1, Ordering::SeqCst);
            format!("fallback_{n}")
        };

        let record = LongTermRecord {
            id: id.clone(),
            agent: agent.to_string(),
            text: text.to_string(),
            embedding,
            timestamp: now,
            record_type,
            story_id,
            epic_id,
            task_id,
            embedding_method: method,
            is_fallback: !healthy,
            metadata,
        };

        {
            let mut fb = self.fallback.write().await;
            fb.insert(id.clone(), FallbackEntry { record });
        }

        debug!(agent, id = %id, fallback = !healthy, "long-term record stored");
        Ok(id)
    }

    /// On a healthy store this ranks by cosine similarity; on a degraded
    /// store it performs a substring match over the in-process fallback map
    /// and sorts strictly by timestamp descending, matching the degraded
    /// search contract.
    pub async fn search(
        &self,
        query: &str,
        top_n: usize,
        filters: &MetadataFilters,
    ) -> Vec<(LongTermRecord, f32)> {
        let (query_vec, _) = self.generate_embedding(query).await;
        let needle = query.to_lowercase();
        let healthy = self.is_healthy().await;

        let fb = self.fallback.read().await;
        let mut matches: Vec<(LongTermRecord, f32)> = fb
            .values()
            .filter(|entry| record_matches_filters(&entry.record, filters))
            .filter(|entry| entry.record.text.to_lowercase().contains(&needle) || needle.is_empty())
            .map(|entry| {
                let score = cosine_similarity(&query_vec, &entry.record.embedding);
                (entry.record.clone(), score)
            })
            .collect();

        if healthy {
            matches.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.0.timestamp.cmp(&a.0.timestamp))
            });
        } else {
            matches.sort_by(|a, b| b.0.timestamp.cmp(&a.0.timestamp));
        }
        matches.truncate(top_n);
        matches
    }

    /// Current fallback-map size, used by health/hygiene diagnostics.
    pub async fn fallback_len(&self) -> usize {
        self.fallback.read().await.len()
    }
}

fn record_matches_filters(record: &LongTermRecord, filters: &MetadataFilters) -> bool {
    if let Some(agent) = &filters.agent {
        if &record.agent != agent {
            return false;
        }
    }
    if let Some(story_id) = &filters.story_id {
        if record.story_id.as_deref() != Some(story_id.as_str()) {
            return false;
        }
    }
    if let Some(epic_id) = &filters.epic_id {
        if record.epic_id.as_deref() != Some(epic_id.as_str()) {
            return false;
        }
    }
    if let Some(task_id) = &filters.task_id {
        if record.task_id.as_deref() != Some(task_id.as_str()) {
            return false;
        }
    }
    if let Some(record_type) = &filters.record_type {
        if &record.record_type != record_type {
            return false;
        }
    }
    true
}

pub type SharedVectorStore = Arc<VectorStoreClient>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_embedding_is_deterministic_and_sized() {
        let cfg = MemorySubstrateConfig::default();
        let a = hash_embedding("hello world", cfg.vector_size);
        let b = hash_embedding("hello world", cfg.vector_size);
        assert_eq!(a, b);
        assert_eq!(a.len(), cfg.vector_size);
    }

    #[test]
    fn cosine_similarity_matches_identical_vectors() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn store_without_healthy_backend_returns_fallback_id() {
        let client = VectorStoreClient::new(MemorySubstrateConfig::default());
        let id = client
            .store(
                "qa",
                "review pattern: null ptr",
                LongTermType::Observation,
                None,
                None,
                None,
                HashMap::new(),
            )
            .await
            .unwrap();
        assert!(id.starts_with("fallback_"));
    }

    #[tokio::test]
    async fn search_finds_stored_fallback_record_by_substring() {
        let client = VectorStoreClient::new(MemorySubstrateConfig::default());
        client
            .store(
                "qa",
                "review pattern: null ptr",
                LongTermType::Observation,
                None,
                None,
                None,
                HashMap::new(),
            )
            .await
            .unwrap();

        let filters = MetadataFilters {
            agent: Some("qa".to_string()),
            ..Default::default()
        };
        let results = client.search("null ptr", 5, &filters).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].0.text.contains("null ptr"));
    }
}
