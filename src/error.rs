use std::io;
use std::time::Duration;

pub use anyhow::Error as RuntimeError;
use thiserror::Error;

/// Process exit codes produced by the engine and their merge order.
pub mod exit {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const INTERNAL_ERROR: i32 = 3;
    pub const TESTS_FAILED: i32 = 10;
    pub const CACHE_FETCH_ERROR: i32 = 12;
    pub const CONFLICT: i32 = 13;
    pub const INFRASTRUCTURE_ERROR: i32 = 15;
    pub const CANCELLED: i32 = 130;

    /// Rank of an exit code; higher wins when merging. Codes the engine does
    /// not know about sit between conflicts and plain failures.
    pub fn severity(code: i32) -> u8 {
        match code {
            SUCCESS => 0,
            TESTS_FAILED => 1,
            FAILURE => 2,
            CONFLICT => 4,
            CACHE_FETCH_ERROR => 5,
            INFRASTRUCTURE_ERROR => 6,
            INTERNAL_ERROR => 7,
            CANCELLED => 8,
            _ => 3,
        }
    }

    /// Merge per-uid exit codes into a single run-level code.
    ///
    /// The code with the highest [`severity`] wins. Ties between unknown codes
    /// are broken by the numerically largest code so the result does not
    /// depend on iteration order.
    pub fn merge_exit_codes(codes: impl IntoIterator<Item = i32>) -> i32 {
        codes
            .into_iter()
            .max_by_key(|&code| (severity(code), code))
            .unwrap_or(SUCCESS)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Error while loading the graph:\n{0}")]
    Graph(#[from] GraphError),

    #[error("Invalid configuration:\n{0}")]
    Config(#[from] ConfigError),

    #[error("Error while preparing build roots:\n{0}")]
    BuildRoot(#[from] BuildRootError),

    #[error("Error while opening the cache:\n{0}")]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Couldn't read graph file.\n{0}")]
    Io(#[from] io::Error),

    #[error("Couldn't parse graph descriptor.\n{0}")]
    Json(#[from] serde_json::Error),

    #[error("Node uid '{0}' appears more than once")]
    DuplicateUid(String),

    #[error("Node '{uid}' depends on unknown node '{dep}'")]
    MissingDependency { uid: String, dep: String },

    #[error("Result uid '{0}' is not present in the graph")]
    UnknownResult(String),

    #[error("Cycle detected in build graph at node '{0}'")]
    Cycle(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read options file.\n{0}")]
    Io(#[from] io::Error),

    #[error("Couldn't parse options.\n{0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum BuildRootError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("Output '{0}' was not created")]
    MissingOutput(String),

    #[error("Output '{path}' is a symlink to '{target}' which is absolute or escapes the build root")]
    EscapingSymlink { path: String, target: String },

    #[error("Output '{path}' is a symlink to '{target}' which is not an output")]
    DanglingSymlink { path: String, target: String },

    #[error("Output '{0}' is neither a regular file nor a symlink")]
    NotAFile(String),

    #[error("Outputs take {size} bytes which exceeds the limit of {limit} bytes; largest:\n{largest}")]
    OutputsExceedLimit {
        size: u64,
        limit: u64,
        largest: String,
    },

    #[error("Build roots take {used} bytes which exceeds the limit of {limit} bytes")]
    TotalSizeExceeded { used: u64, limit: u64 },

    #[error("Reference count of build root '{0}' went negative")]
    NegativeRefcount(String),

    #[error("Build root '{0}' was already released")]
    Released(String),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("Couldn't decode cache metadata.\n{0}")]
    Decode(#[from] ciborium::de::Error<io::Error>),

    #[error("Couldn't encode cache metadata.\n{0}")]
    Encode(#[from] ciborium::ser::Error<io::Error>),

    #[error("Cache entry '{key}' is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Distributed cache:\n{0}")]
    Remote(#[from] RemoteError),

    #[error("Distributed cache is read-only")]
    ReadOnly,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("Remote call '{op}' took {elapsed:?} which exceeds its budget")]
    Timeout { op: &'static str, elapsed: Duration },

    #[error("Remote store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("No fetcher registered for uri '{0}'")]
    NoFetcher(String),

    #[error("Couldn't fetch '{uri}'.\n{source}")]
    Failed {
        uri: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Pattern '{0}' has no resource in the global configuration")]
    UnknownPattern(String),

    #[error("Resource '{0}' is declared more than once with different contents")]
    Inconsistent(String),
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Couldn't spawn '{program}'.\n{source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Command exceeded its timeout of {0:?}")]
    Timeout(Duration),

    #[error("Command was aborted")]
    Aborted,

    #[error("Command has no arguments")]
    Empty,

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Couldn't publish result.\n{0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Conflict(#[from] ConflictError),
}

#[derive(Debug, Error)]
#[error("Output '{path}' is claimed by several nodes: {}", uids.join(", "))]
pub struct ConflictError {
    pub path: String,
    pub uids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::exit::*;

    #[test]
    fn merge_prefers_most_severe() {
        assert_eq!(merge_exit_codes([]), SUCCESS);
        assert_eq!(merge_exit_codes([0, 0]), SUCCESS);
        assert_eq!(merge_exit_codes([TESTS_FAILED, FAILURE]), FAILURE);
        assert_eq!(merge_exit_codes([FAILURE, INTERNAL_ERROR, TESTS_FAILED]), INTERNAL_ERROR);
        assert_eq!(merge_exit_codes([CACHE_FETCH_ERROR, CONFLICT]), CACHE_FETCH_ERROR);
    }

    #[test]
    fn unknown_codes_rank_above_failure() {
        assert_eq!(merge_exit_codes([FAILURE, 42]), 42);
        assert_eq!(merge_exit_codes([42, 7]), 42);
        assert_eq!(merge_exit_codes([7, 42]), 42);
        assert_eq!(merge_exit_codes([42, CONFLICT]), CONFLICT);
    }
}
