use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};

type UsageMap = BTreeMap<String, u64>;

/// Cumulative request counts per credential fingerprint, kept in a small JSON
/// file shared by every worker. All access goes through one lock so that the
/// read-modify-write cycles of different workers never interleave.
#[derive(Debug, Clone)]
pub struct UsageTracker {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl UsageTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Requests recorded for `fingerprint` by earlier sessions.
    pub fn previous_requests(&self, fingerprint: &str) -> AppResult<u64> {
        let _guard = self.lock.lock();
        Ok(self.load()?.get(fingerprint).copied().unwrap_or(0))
    }

    /// Stores the cumulative total for `fingerprint`.
    pub fn record(&self, fingerprint: &str, total_requests: u64) -> AppResult<()> {
        let _guard = self.lock.lock();
        let mut usage = self.load()?;
        usage.insert(fingerprint.to_string(), total_requests);
        self.persist(&usage)?;
        debug!(
            target: "usage_tracker",
            credential = fingerprint,
            total_requests,
            "usage recorded"
        );
        Ok(())
    }

    pub fn snapshot(&self) -> AppResult<UsageMap> {
        let _guard = self.lock.lock();
        self.load()
    }

    fn load(&self) -> AppResult<UsageMap> {
        match fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(UsageMap::new()),
            Ok(contents) => match serde_json::from_str::<UsageMap>(&contents) {
                Ok(usage) => Ok(usage),
                Err(err) => {
                    warn!(
                        target: "usage_tracker",
                        path = %self.path.display(),
                        error = ?err,
                        "failed to parse usage file; starting from zero"
                    );
                    Ok(UsageMap::new())
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(UsageMap::new()),
            Err(err) => Err(AppError::Io(err)),
        }
    }

    fn persist(&self, usage: &UsageMap) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(usage)?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, serialized)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn missing_file_counts_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = UsageTracker::new(dir.path().join("tracker.json"));
        assert_eq!(tracker.previous_requests("abc").unwrap(), 0);
    }

    #[test]
    fn records_and_reloads_totals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tracker.json");
        let tracker = UsageTracker::new(&path);
        tracker.record("abc", 12).unwrap();
        tracker.record("def", 3).unwrap();
        tracker.record("abc", 20).unwrap();

        let reopened = UsageTracker::new(&path);
        assert_eq!(reopened.previous_requests("abc").unwrap(), 20);
        assert_eq!(reopened.previous_requests("def").unwrap(), 3);
    }

    #[test]
    fn corrupt_file_is_replaced_on_next_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.json");
        fs::write(&path, "{not json").unwrap();
        let tracker = UsageTracker::new(&path);
        assert_eq!(tracker.previous_requests("abc").unwrap(), 0);
        tracker.record("abc", 5).unwrap();
        assert_eq!(tracker.snapshot().unwrap().get("abc"), Some(&5));
    }

    #[test]
    fn concurrent_writers_keep_every_credential() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = UsageTracker::new(dir.path().join("tracker.json"));
        let handles = (0..8)
            .map(|worker| {
                let tracker = tracker.clone();
                thread::spawn(move || {
                    for total in 1..=10 {
                        tracker.record(&format!("key-{worker}"), total).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        let usage = tracker.snapshot().unwrap();
        assert_eq!(usage.len(), 8);
        assert!(usage.values().all(|total| *total == 10));
    }
}
