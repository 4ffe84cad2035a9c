//! Persisted counter samples for rate computation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

/// One stored reading of a counter vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterSample {
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    pub values: Vec<u64>,
}

impl CounterSample {
    pub fn new(timestamp: f64, values: Vec<u64>) -> Self {
        Self { timestamp, values }
    }

    /// A sample stamped with the current wall-clock time.
    pub fn now(values: Vec<u64>) -> Self {
        let timestamp = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        Self { timestamp, values }
    }
}

/// Read-modify-write storage for counter samples.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Store `current` under `key` and return what was stored before, or
    /// `baseline` if the key is new.
    async fn roll(&self, key: &str, current: CounterSample, baseline: CounterSample) -> Result<CounterSample>;
}

/// Per-key async locks.
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    async fn get(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .clone()
    }
}

/// Counter store keeping one JSON file per key.
pub struct FileCounterStore {
    dir: PathBuf,
    locks: KeyLocks,
}

impl FileCounterStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: KeyLocks::default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file))
    }
}

#[async_trait]
impl CounterStore for FileCounterStore {
    async fn roll(&self, key: &str, current: CounterSample, baseline: CounterSample) -> Result<CounterSample> {
        let lock = self.locks.get(key).await;
        let _guard = lock.lock().await;

        let path = self.path_for(key);
        let previous = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<CounterSample>(&bytes) {
                Ok(sample) => sample,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Discarding unreadable counter sample");
                    baseline
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => baseline,
            Err(e) => return Err(e.into()),
        };

        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, serde_json::to_vec(&current)?).await?;

        debug!(key = %key, "Rolled counter sample");
        Ok(previous)
    }
}

/// In-process counter store.
#[derive(Default)]
pub struct MemoryCounterStore {
    samples: Mutex<HashMap<String, CounterSample>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn roll(&self, key: &str, current: CounterSample, baseline: CounterSample) -> Result<CounterSample> {
        let mut samples = self.samples.lock().await;
        Ok(samples.insert(key.to_string(), current).unwrap_or(baseline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_store_roll() {
        let tmp = TempDir::new().unwrap();
        let store = FileCounterStore::new(tmp.path().join("counters"));
        let baseline = CounterSample::new(0.0, vec![0; 3]);

        let first = store
            .roll("cpu-101", CounterSample::new(10.0, vec![1, 2, 3]), baseline.clone())
            .await
            .unwrap();
        assert_eq!(first, baseline);

        let second = store
            .roll("cpu-101", CounterSample::new(20.0, vec![4, 5, 6]), baseline.clone())
            .await
            .unwrap();
        assert_eq!(second, CounterSample::new(10.0, vec![1, 2, 3]));

        // Keys are independent
        let other = store
            .roll("network-101", CounterSample::new(20.0, vec![9]), baseline.clone())
            .await
            .unwrap();
        assert_eq!(other, baseline);
    }

    #[tokio::test]
    async fn test_file_store_recovers_from_corrupt_sample() {
        let tmp = TempDir::new().unwrap();
        let store = FileCounterStore::new(tmp.path());
        std::fs::write(tmp.path().join("cpu-7.json"), b"not json").unwrap();

        let baseline = CounterSample::new(0.0, vec![]);
        let previous = store
            .roll("cpu-7", CounterSample::new(1.0, vec![1]), baseline.clone())
            .await
            .unwrap();
        assert_eq!(previous, baseline);
    }

    #[tokio::test]
    async fn test_memory_store_roll() {
        let store = MemoryCounterStore::new();
        let baseline = CounterSample::new(0.0, vec![]);

        assert_eq!(
            store.roll("k", CounterSample::new(1.0, vec![1]), baseline.clone()).await.unwrap(),
            baseline
        );
        assert_eq!(
            store.roll("k", CounterSample::new(2.0, vec![2]), baseline).await.unwrap(),
            CounterSample::new(1.0, vec![1])
        );
    }
}
