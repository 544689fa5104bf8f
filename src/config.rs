use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Options for a single engine run.
///
/// Every field has a default, so a JSON file only needs to list the values
/// it changes:
///
/// ```json
/// { "build_threads": 8, "continue_on_fail": true,
///   "local_cache": { "max_size": 10737418240 } }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Worker threads for build actions, also the cpu capacity.
    pub build_threads: usize,
    /// Concurrent test executions; defaults to `build_threads`.
    pub test_threads: Option<usize>,
    /// Concurrent io-heavy actions (archivers, linkers).
    pub link_threads: usize,
    /// Threads reserved for network transfers.
    pub net_threads: usize,

    /// Directory that holds per-run build root sets.
    pub build_root: Utf8PathBuf,
    pub source_root: Utf8PathBuf,
    pub tool_root: Utf8PathBuf,
    /// Directory receiving copies of result outputs.
    pub output_root: Option<Utf8PathBuf>,
    /// Directory receiving symlinks to result outputs.
    pub symlink_root: Option<Utf8PathBuf>,

    pub continue_on_fail: bool,
    pub keep_temps: bool,
    pub eager_execution: bool,
    /// Ignore cached artifacts and run every node.
    pub clear_build: bool,
    /// Let every node proceed even when a dependency failed.
    pub ignore_broken_dependencies: bool,

    /// Maximum total size of a single node's outputs, in bytes.
    pub limit_output_size: Option<u64>,
    /// Maximum total size of all live build roots, in bytes.
    pub limit_build_root_size: Option<u64>,
    pub stale_build_root_ttl_secs: u64,

    /// Upper bound on how long the scheduler sleeps between checks.
    pub poll_interval_ms: u64,
    pub command_timeout_secs: Option<u64>,
    /// Extra attempts granted to failing test nodes.
    pub test_retries: u32,
    pub test_timeout_secs: Option<u64>,

    /// Secret written to a per-run token file, exposed as `$(TOKEN_PATH)`.
    pub token: Option<String>,

    pub local_cache: LocalCacheOptions,
    pub dist_cache: Option<DistCacheOptions>,
    pub results: ResultOptions,
    /// Where to write an SVG chart of the run's tasks.
    pub waterfall: Option<Utf8PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            build_threads: threads,
            test_threads: None,
            link_threads: threads,
            net_threads: 4,
            build_root: Utf8PathBuf::from(".kamado/build"),
            source_root: Utf8PathBuf::from("."),
            tool_root: Utf8PathBuf::from(".kamado/tools"),
            output_root: None,
            symlink_root: None,
            continue_on_fail: false,
            keep_temps: false,
            eager_execution: false,
            clear_build: false,
            ignore_broken_dependencies: false,
            limit_output_size: None,
            limit_build_root_size: None,
            stale_build_root_ttl_secs: 24 * 60 * 60,
            poll_interval_ms: 100,
            command_timeout_secs: None,
            test_retries: 0,
            test_timeout_secs: None,
            token: None,
            local_cache: LocalCacheOptions::default(),
            dist_cache: None,
            results: ResultOptions::default(),
            waterfall: None,
        }
    }
}

impl Options {
    pub fn from_json_file(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let data = fs::read(path.as_ref())?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, ConfigError> {
        let options: Options = serde_json::from_slice(data)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.build_threads == 0 {
            return Err(ConfigError::Invalid("build_threads must be at least 1".into()));
        }
        if self.test_threads == Some(0) {
            return Err(ConfigError::Invalid("test_threads must be at least 1".into()));
        }
        if let Some(dist) = &self.dist_cache
            && dist.exclusive
            && self.clear_build
        {
            return Err(ConfigError::Invalid(
                "an exclusive distributed cache cannot be combined with clear_build".into(),
            ));
        }
        Ok(())
    }

    pub fn test_threads(&self) -> usize {
        self.test_threads.unwrap_or(self.build_threads).max(1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }

    pub fn test_timeout(&self) -> Option<Duration> {
        self.test_timeout_secs.map(Duration::from_secs)
    }

    pub fn stale_build_root_ttl(&self) -> Duration {
        Duration::from_secs(self.stale_build_root_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalCacheOptions {
    pub enabled: bool,
    pub path: Utf8PathBuf,
    /// Size the cache is compacted down to after planning.
    pub max_size: Option<u64>,
    /// Entries not used for this long are evicted during compaction.
    pub ttl_secs: Option<u64>,
    pub codec: Codec,
    /// Remove every entry not reachable from the current graph.
    pub strip: bool,
}

impl Default for LocalCacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            path: Utf8PathBuf::from(".kamado/cache"),
            max_size: None,
            ttl_secs: None,
            codec: Codec::None,
            strip: false,
        }
    }
}

impl LocalCacheOptions {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistCacheOptions {
    pub readonly: bool,
    /// Every cacheable node must be restored remotely; a miss is fatal.
    pub exclusive: bool,
    pub codec: Codec,
    pub retries: u32,
    pub call_timeout_ms: Option<u64>,
    /// Remote restores and fresh results also populate the local cache.
    pub write_through: bool,
    /// Skip the existence probe during planning and only check when the
    /// restore task runs.
    pub late_fetch: bool,
    /// Refresh recency of entries on every hit.
    pub simulate_lru: bool,
    /// Payloads larger than this are not uploaded.
    pub max_file_size: Option<u64>,
    /// Payloads at least this large are probed before upload.
    pub probe_before_put_min_size: Option<u64>,
    /// Only upload artifacts of result nodes.
    pub result_only: bool,
    /// Time to live requested for uploaded entries.
    pub ttl_secs: Option<u64>,
    pub crit: CacheCrit,
}

impl Default for DistCacheOptions {
    fn default() -> Self {
        Self {
            readonly: true,
            exclusive: false,
            codec: Codec::Zstd(3),
            retries: 2,
            call_timeout_ms: None,
            write_through: true,
            late_fetch: false,
            simulate_lru: false,
            max_file_size: None,
            probe_before_put_min_size: None,
            result_only: false,
            ttl_secs: None,
            crit: CacheCrit::None,
        }
    }
}

impl DistCacheOptions {
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

/// Which distributed cache failures abort the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCrit {
    #[default]
    None,
    Put,
    GetAndPut,
}

impl CacheCrit {
    pub fn fatal_on_get(self) -> bool {
        self == CacheCrit::GetAndPut
    }

    pub fn fatal_on_put(self) -> bool {
        matches!(self, CacheCrit::Put | CacheCrit::GetAndPut)
    }
}

/// Transform applied to stored artifact bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    #[default]
    None,
    Zstd(i32),
}

impl Codec {
    pub fn encode(self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Codec::None => Ok(data.to_vec()),
            Codec::Zstd(level) => zstd::encode_all(data, level),
        }
    }

    pub fn decode(self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Codec::None => Ok(data.to_vec()),
            Codec::Zstd(_) => zstd::decode_all(data),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::None => "none",
            Codec::Zstd(_) => "zstd",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultOptions {
    /// Suffixes never materialized.
    pub suppress_outputs: Vec<String>,
    /// Suffixes hidden unless re-enabled through `add_result`.
    pub default_suppress_outputs: Vec<String>,
    pub add_result: Vec<String>,
    /// Stored symlink targets older than this are removed.
    pub symlinks_ttl_secs: Option<u64>,
}

impl Default for ResultOptions {
    fn default() -> Self {
        Self {
            suppress_outputs: Vec::new(),
            default_suppress_outputs: vec![".o".into(), ".obj".into(), ".mf".into()],
            add_result: Vec::new(),
            symlinks_ttl_secs: None,
        }
    }
}
