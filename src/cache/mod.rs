//! Artifact cache tiers.
//!
//! Both tiers store the output files of one build root under a string key
//! (a node uid, a content key derived from its `selfUid`, or a resource
//! identity) and restore them byte for byte into another directory.

mod dist;
mod local;

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

pub use dist::{DirRemote, DistCache, MemoryRemote, RemoteStore};
pub use local::{CompactReport, LocalCache};

use crate::error::CacheError;

/// Outcome of storing an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutStatus {
    Stored,
    Skipped(&'static str),
}

/// Common contract of the cache tiers. Every operation is idempotent and
/// safe to retry.
pub trait Store: Send + Sync {
    /// Existence check without transferring the payload.
    fn probe(&self, key: &str) -> Result<bool, CacheError>;

    /// Materialize the artifact under `into`; `false` on a miss.
    fn restore(&self, key: &str, into: &Utf8Path) -> Result<bool, CacheError>;

    /// Store `files` (relative to `root`) under `key`.
    fn put(&self, key: &str, root: &Utf8Path, files: &[Utf8PathBuf])
    -> Result<PutStatus, CacheError>;
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct OpStats {
    pub count: u64,
    pub failures: u64,
    pub bytes: u64,
    pub seconds: f64,
}

/// Counters per cache operation plus hit accounting.
#[derive(Debug, Default)]
pub struct CacheStats {
    ops: Mutex<BTreeMap<&'static str, OpStats>>,
    hits: Mutex<HitStats>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HitStats {
    pub requested: u64,
    pub found: u64,
}

impl CacheStats {
    pub fn record(&self, op: &'static str, ok: bool, bytes: u64, elapsed: Duration) {
        let mut ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());
        let entry = ops.entry(op).or_default();
        entry.count += 1;
        if !ok {
            entry.failures += 1;
        }
        entry.bytes += bytes;
        entry.seconds += elapsed.as_secs_f64();
    }

    pub fn lookup(&self, found: bool) {
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        hits.requested += 1;
        if found {
            hits.found += 1;
        }
    }

    pub fn ops(&self) -> BTreeMap<&'static str, OpStats> {
        self.ops.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn hits(&self) -> HitStats {
        *self.hits.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_accumulate() {
        let stats = CacheStats::default();
        stats.record("get", true, 10, Duration::from_millis(5));
        stats.record("get", false, 0, Duration::from_millis(5));
        stats.lookup(true);
        stats.lookup(false);

        let get = stats.ops()["get"];
        assert_eq!(get.count, 2);
        assert_eq!(get.failures, 1);
        assert_eq!(get.bytes, 10);
        assert_eq!(stats.hits().requested, 2);
        assert_eq!(stats.hits().found, 1);
    }
}
