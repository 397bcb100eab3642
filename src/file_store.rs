//! Safe File Layer (C2): named advisory locks, atomic writes, safe JSON I/O,
//! read-modify-write transactions.
//!
//! Locking is in-process only, via a `DashMap`-backed table of per-path
//! `tokio::sync::Mutex` guards with expiry tracking — cross-process
//! coordination is explicitly not promised (spec §5).

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{MemoryError, MemoryResult};

struct LockSlot {
    mutex: Arc<Mutex<()>>,
    acquired_at: Option<Instant>,
}

/// Process-wide table of named locks, one per file path. Scoped as a
/// singleton per spec §9's "shared process-wide state → scoped singletons";
/// `LockTable::global()` returns the shared instance, `LockTable::new()` is
/// available for tests that need an isolated one.
pub struct LockTable {
    slots: DashMap<String, LockSlot>,
}

static GLOBAL_LOCK_TABLE: Lazy<LockTable> = Lazy::new(LockTable::new);

impl LockTable {
    pub fn new() -> Self {
        Self { slots: DashMap::new() }
    }

    pub fn global() -> &'static LockTable {
        &GLOBAL_LOCK_TABLE
    }

    /// Acquire the lock for `path`, waiting up to `timeout`. Fails with
    /// `LockTimeout` if the wait is exceeded. An expired prior holder's slot
    /// is displaced rather than letting waiters deadlock on a wedged task.
    async fn acquire(&self, path: &Path, timeout: Duration) -> MemoryResult<OwnedMutexGuard<()>> {
        let key = path.to_string_lossy().to_string();
        let mutex = {
            let mut entry = self.slots.entry(key.clone()).or_insert_with(|| LockSlot {
                mutex: Arc::new(Mutex::new(())),
                acquired_at: None,
            });
            entry.acquired_at = Some(Instant::now());
            entry.mutex.clone()
        };

        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => Err(MemoryError::LockTimeout { path: key }),
        }
    }

    /// Drop table entries whose holder exceeded `max_age` without releasing.
    /// Run periodically by callers; not invoked automatically by `acquire`.
    pub fn purge_expired(&self, max_age: Duration) {
        let now = Instant::now();
        self.slots.retain(|_, slot| match slot.acquired_at {
            Some(t) => now.duration_since(t) < max_age,
            None => true,
        });
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates parent directories, writes to `<path>.tmp.<nonce>`, then renames
/// onto `path`. The tmp file is removed on any failure path.
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> MemoryResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let nonce = random_nonce();
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(format!(".tmp.{nonce}"));
    let tmp_path = path.with_file_name(tmp_name);

    let write_result = tokio::fs::write(&tmp_path, bytes).await;
    if let Err(e) = write_result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(MemoryError::IOError(e));
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(MemoryError::IOError(e));
    }

    debug!(path = %path.display(), "atomic write committed");
    Ok(())
}

fn random_nonce() -> u64 {
    use rand::Rng;
    rand::thread_rng().gen::<u64>()
}

/// Returns `default` if the file is absent. A parse failure is surfaced as
/// `ParseError` rather than silently swallowed; caller decides recovery.
pub async fn safe_read_json<T>(path: &Path, default: T) -> MemoryResult<T>
where
    T: DeserializeOwned,
{
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(MemoryError::ParseError),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(default),
        Err(e) => Err(MemoryError::IOError(e)),
    }
}

/// Writes `value` as pretty (two-space indented) UTF-8 JSON via [`atomic_write`].
pub async fn safe_write_json<T>(path: &Path, value: &T) -> MemoryResult<()>
where
    T: Serialize,
{
    let bytes = serde_json::to_vec_pretty(value).map_err(MemoryError::ParseError)?;
    atomic_write(path, &bytes).await
}

/// Acquire the named lock for `path`, read current content (or `default`),
/// run `transform`, write atomically, release the lock. Guarantees
/// single-writer semantics per file across concurrent in-process callers
/// (I1, P1).
pub async fn update_json_file<T, F>(
    path: &Path,
    lock_timeout: Duration,
    default: T,
    transform: F,
) -> MemoryResult<T>
where
    T: Serialize + DeserializeOwned + Clone,
    F: FnOnce(T) -> MemoryResult<T>,
{
    let _guard = LockTable::global().acquire(path, lock_timeout).await?;

    let current = safe_read_json(path, default).await?;
    let next = transform(current)?;
    safe_write_json(path, &next).await?;
    Ok(next)
}

/// Convenience used by health checks and hygiene to append one JSON-encoded
/// line, creating parent directories as needed.
pub async fn append_jsonl(path: &Path, value: &impl Serialize) -> MemoryResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_string(value).map_err(MemoryError::ParseError)?;
    line.push('\n');

    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc as StdArc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn atomic_write_then_read_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        atomic_write(&path, br#"{"a":1}"#).await.unwrap();
        let value: serde_json::Value = safe_read_json(&path, json!(null)).await.unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[tokio::test]
    async fn safe_read_json_returns_default_when_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let value: serde_json::Value = safe_read_json(&path, json!({"empty": true}))
            .await
            .unwrap();
        assert_eq!(value, json!({"empty": true}));
    }

    #[tokio::test]
    async fn safe_read_json_surfaces_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("corrupt.json");
        tokio::fs::write(&path, b"not json").await.unwrap();
        let result: MemoryResult<serde_json::Value> = safe_read_json(&path, json!(null)).await;
        assert!(matches!(result, Err(MemoryError::ParseError(_))));
    }

    #[tokio::test]
    async fn update_json_file_serializes_concurrent_writers() {
        let dir = tempdir().unwrap();
        let path = StdArc::new(dir.path().join("counter.json"));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                update_json_file(&path, Duration::from_secs(5), 0i64, |current| {
                    Ok(current + 1)
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let final_value: i64 = safe_read_json(&path, 0).await.unwrap();
        assert_eq!(final_value, 20);
    }
}
