//! Executes build graphs: nodes run in isolated build roots on a worker
//! pool bounded by resource capacities, outputs are shared through a local
//! and a distributed artifact cache, and results are published into output
//! trees.
//!
//! Load a [`Graph`], configure [`Options`] and hand both to an [`Engine`]
//! together with an [`Executor`] that runs node commands.
#![forbid(unsafe_code)]

mod build_root;
mod cache;
mod config;
mod core;
mod engine;
mod env;
mod error;
mod exec;
mod graph;
mod pattern;
mod resources;
mod result;
mod stats;
mod utils;

pub use crate::build_root::{BuildRoot, BuildRootSet};
pub use crate::cache::{
    CacheStats, CompactReport, DirRemote, DistCache, HitStats, LocalCache, MemoryRemote, OpStats,
    PutStatus, RemoteStore, Store,
};
pub use crate::config::{
    CacheCrit, Codec, DistCacheOptions, LocalCacheOptions, Options, ResultOptions,
};
pub use crate::core::{ArcStr, Hash32};
pub use crate::engine::{CancelToken, Controller, Engine, RunState};
pub use crate::env::{CleanupStack, ExecEnv};
pub use crate::error::*;
pub use crate::exec::{ExecOutput, Executor, Invocation, ProcessExecutor};
pub use crate::graph::{
    CommandSpec, CpuNamed, CpuRequirement, Graph, GraphConf, GraphDescriptor, Network, Node, NodeSpec,
    PatternResource, Requirements, ResourceDescriptor,
};
pub use crate::pattern::{Fetcher, Fetchers, FileFetcher, Patterns};
pub use crate::resources::Resources;
pub use crate::result::{ResultCollector, SymlinkStore};
pub use crate::stats::{
    CriticalStep, KindStats, LogEntry, NodeStatus, RunReport, TaskRecord, Timeline,
};
pub use crate::utils::init_logging;

/// Names of the built-in path patterns.
pub mod patterns {
    pub use crate::pattern::{BUILD_ROOT, RESOURCE_ROOT, SOURCE_ROOT, TOKEN_PATH, TOOL_ROOT};
}
