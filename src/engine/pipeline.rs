use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::graph::NodeIndex;
use rayon::prelude::*;
use tracing::{Span, debug, error, info_span, trace, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use super::cancel::{CancelToken, Controller};
use super::queue::TaskId;
use super::task::TaskKind;
use crate::build_root::{BuildRoot, BuildRootSet};
use crate::cache::{DistCache, LocalCache, PutStatus, Store};
use crate::config::Options;
use crate::core::Hash32Builder;
use crate::env::ExecEnv;
use crate::error::{ExecError, FetchError, PublishError, exit};
use crate::exec::{Executor, Invocation};
use crate::graph::{Graph, Node};
use crate::pattern::{
    BUILD_ROOT, Fetchers, Patterns, RESOURCE_ROOT, SOURCE_ROOT, TOKEN_PATH, TOOL_ROOT,
};
use crate::resources::Resources;
use crate::result::ResultCollector;
use crate::stats::NodeStatus;
use crate::utils;

/// How a node is going to be satisfied, decided once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Status {
    Run,
    RestoreLocal,
    RestoreDist,
    /// Outputs collide with another result node.
    Conflict,
    /// Missing from an exclusive distributed cache.
    CacheMiss,
    /// Lookup failed and the cache is critical.
    CacheFailure(String),
}

impl Status {
    /// Only nodes that run consume the outputs of their dependencies.
    pub(crate) fn needs_deps(&self) -> bool {
        matches!(self, Status::Run)
    }

    /// Whether the node may still end up running, directly or as a
    /// fallback.
    pub(crate) fn may_run(&self) -> bool {
        matches!(self, Status::Run | Status::RestoreLocal | Status::RestoreDist)
    }
}

/// What the scheduler has to do after a task finished.
#[derive(Debug)]
pub(crate) enum Outcome {
    Ok,
    Failed,
    /// Statuses of every node reachable from the results, dependencies
    /// first.
    Planned(Vec<(NodeIndex, Status)>),
    /// The restore missed; the node has to run after all.
    Fallback(NodeIndex),
}

#[derive(Debug)]
pub(crate) struct Done {
    pub(crate) id: TaskId,
    pub(crate) kind: TaskKind,
    pub(crate) outcome: Outcome,
    pub(crate) start: f64,
    pub(crate) end: f64,
}

/// Per-node state shared between the scheduler and workers.
#[derive(Debug, Clone, Default)]
pub(crate) struct NodeSlot {
    pub(crate) status: Option<Status>,
    /// Outstanding readers of the outputs: consumers that may still run
    /// plus pending puts and publishing. The root starts with this many
    /// references and tracks the count from then on.
    pub(crate) refs: usize,
    pub(crate) root: Option<Arc<BuildRoot>>,
    pub(crate) exit_code: Option<i32>,
    /// A critical upload failed after the node itself finished.
    pub(crate) put_error: Option<i32>,
    pub(crate) node_status: NodeStatus,
    pub(crate) digest: Option<crate::core::Hash32>,
    pub(crate) content_key: Option<String>,
    pub(crate) attempts: u32,
    pub(crate) timing: Option<(f64, f64)>,
    pub(crate) resources: Resources,
}

/// Collaborators a pipeline works with for the duration of one run.
pub(crate) struct Services {
    pub(crate) local: Option<LocalCache>,
    pub(crate) dist: Option<DistCache>,
    pub(crate) roots: Arc<BuildRootSet>,
    pub(crate) env: ExecEnv,
    pub(crate) collector: ResultCollector,
}

struct Failure {
    code: i32,
    message: String,
    retriable: bool,
}

/// Executes tasks on behalf of the scheduler and keeps the per-node
/// bookkeeping they produce.
pub(crate) struct Pipeline<'a> {
    pub(crate) graph: &'a Graph,
    pub(crate) options: &'a Options,
    executor: &'a dyn Executor,
    fetchers: &'a Fetchers,
    pub(crate) local: Option<LocalCache>,
    pub(crate) dist: Option<DistCache>,
    roots: Arc<BuildRootSet>,
    env: ExecEnv,
    collector: ResultCollector,
    controller: Controller,
    pub(crate) capacity: Resources,
    resource_root: Utf8PathBuf,
    patterns: Mutex<Patterns>,
    /// Outcome of every resource and pattern fetch, keyed by canonical uri
    /// or `$(NAME)`.
    fetched: Mutex<HashMap<String, Result<Utf8PathBuf, String>>>,
    slots: Vec<Mutex<NodeSlot>>,
    results: Mutex<BTreeMap<String, Vec<Utf8PathBuf>>>,
    errors: Mutex<BTreeMap<String, Vec<String>>>,
    started: Instant,
    span: Span,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl<'a> Pipeline<'a> {
    pub(crate) fn new(
        graph: &'a Graph,
        options: &'a Options,
        executor: &'a dyn Executor,
        fetchers: &'a Fetchers,
        services: Services,
        token: CancelToken,
        span: Span,
    ) -> Self {
        let resource_root = services.roots.path().join("resources");

        let mut patterns = Patterns::new();
        patterns.insert(SOURCE_ROOT, options.source_root.as_str());
        patterns.insert(TOOL_ROOT, options.tool_root.as_str());
        patterns.insert(RESOURCE_ROOT, resource_root.as_str());
        if let Some(token) = services.env.token_path() {
            patterns.insert(TOKEN_PATH, token.as_str());
        }

        Self {
            graph,
            options,
            executor,
            fetchers,
            local: services.local,
            dist: services.dist,
            roots: services.roots,
            env: services.env,
            collector: services.collector,
            controller: Controller::new(token, options.continue_on_fail),
            capacity: Resources::capacity(options),
            resource_root,
            patterns: Mutex::new(patterns),
            fetched: Mutex::new(HashMap::new()),
            slots: (0..graph.graph.node_count())
                .map(|_| Mutex::new(NodeSlot::default()))
                .collect(),
            results: Mutex::new(BTreeMap::new()),
            errors: Mutex::new(BTreeMap::new()),
            started: Instant::now(),
            span,
        }
    }

    pub(crate) fn token(&self) -> &CancelToken {
        self.controller.token()
    }

    pub(crate) fn span(&self) -> &Span {
        &self.span
    }

    fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn slot(&self, idx: NodeIndex) -> MutexGuard<'_, NodeSlot> {
        lock(&self.slots[idx.index()])
    }

    pub(crate) fn snapshot(&self, idx: NodeIndex) -> NodeSlot {
        self.slot(idx).clone()
    }

    pub(crate) fn status(&self, idx: NodeIndex) -> Status {
        self.slot(idx).status.clone().unwrap_or(Status::Run)
    }

    pub(crate) fn set_status(&self, idx: NodeIndex, status: Status) {
        self.slot(idx).status = Some(status);
    }

    /// Registers one more consumer of the node's outputs.
    pub(crate) fn add_ref(&self, idx: NodeIndex) {
        let mut slot = self.slot(idx);
        slot.refs += 1;
        if let Some(root) = &slot.root
            && let Err(e) = root.inc()
        {
            debug!(uid = %self.graph.node(idx).uid, "late reference: {e}");
        }
    }

    /// Drops one reference, releasing the root once nothing reads it.
    pub(crate) fn release_ref(&self, idx: NodeIndex) {
        let root = {
            let mut slot = self.slot(idx);
            slot.refs = slot.refs.saturating_sub(1);
            slot.root.clone()
        };
        if let Some(root) = root
            && let Err(e) = root.dec()
        {
            warn!(uid = %self.graph.node(idx).uid, "couldn't release build root: {e}");
        }
    }

    pub(crate) fn take_results(&self) -> BTreeMap<String, Vec<Utf8PathBuf>> {
        std::mem::take(&mut *lock(&self.results))
    }

    pub(crate) fn take_errors(&self) -> BTreeMap<String, Vec<String>> {
        std::mem::take(&mut *lock(&self.errors))
    }

    /// Pattern names a node refers to that are not built in.
    pub(crate) fn unresolved_patterns(&self, node: &Node) -> Vec<String> {
        lock(&self.patterns)
            .unresolved(node_texts(node), &[BUILD_ROOT])
            .into_iter()
            .collect()
    }

    fn fail(&self, idx: NodeIndex, code: i32, message: String, fatal: bool) {
        let uid = self.graph.node(idx).uid.to_string();
        {
            let mut slot = self.slot(idx);
            slot.exit_code = Some(code);
            slot.node_status = NodeStatus::Failed;
        }
        error!(uid = %uid, code, "{message}");
        lock(&self.errors).entry(uid.clone()).or_default().push(message);
        self.controller.on_failure(&uid, fatal);
    }

    fn release_deps(&self, idx: NodeIndex) {
        for &dep in &self.graph.node(idx).deps {
            self.release_ref(dep);
        }
    }

    /// The node stays built; the run still fails.
    fn fail_put(&self, idx: NodeIndex, message: String) {
        let uid = self.graph.node(idx).uid.to_string();
        let code = exit::INFRASTRUCTURE_ERROR;
        self.slot(idx).put_error = Some(code);
        error!(uid = %uid, code, "{message}");
        lock(&self.errors).entry(uid.clone()).or_default().push(message);
        self.controller.on_failure(&uid, true);
    }

    fn discard_root(&self, idx: NodeIndex) {
        let root = self.slot(idx).root.take();
        if let Some(root) = root {
            root.discard();
        }
    }

    /// Resolves a task whose dependencies failed without running it.
    pub(crate) fn on_broken(&self, kind: &TaskKind) {
        match *kind {
            TaskKind::RestoreLocal(idx) | TaskKind::RestoreDist(idx) | TaskKind::Run(idx) => {
                let mut slot = self.slot(idx);
                if slot.exit_code.is_none() {
                    slot.exit_code = Some(exit::FAILURE);
                    slot.node_status = NodeStatus::Broken;
                }
                drop(slot);
                trace!(uid = %self.graph.node(idx).uid, "broken by a failed dependency");
                if matches!(kind, TaskKind::Run(_)) {
                    self.release_deps(idx);
                }
            }
            TaskKind::PutLocal(idx) | TaskKind::PutDist(idx) | TaskKind::Result(idx) => {
                self.release_ref(idx)
            }
            _ => {}
        }
    }

    /// Marks a node that will never finish because the run stopped.
    pub(crate) fn on_cancelled(&self, kind: &TaskKind) {
        if let TaskKind::RestoreLocal(idx) | TaskKind::RestoreDist(idx) | TaskKind::Run(idx) = *kind
        {
            let mut slot = self.slot(idx);
            if slot.exit_code.is_none() {
                slot.node_status = NodeStatus::Cancelled;
            }
        }
    }

    /// Runs one task, turning a panic into a node failure.
    pub(crate) fn execute(&self, id: TaskId, kind: TaskKind) -> Done {
        let label = kind.label(self.graph);
        let span = info_span!(parent: &self.span, "task", kind = kind.name(), label = %label);
        span.pb_set_style(&utils::task_style());
        span.pb_set_message(&label);
        let _enter = span.enter();

        let start = self.elapsed();
        let outcome = match catch_unwind(AssertUnwindSafe(|| self.handle(&kind))) {
            Ok(outcome) => outcome,
            Err(panic) => {
                let s = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                let message = format!("Task panicked: {s}");
                match kind.node() {
                    Some(idx) => self.fail(idx, exit::INTERNAL_ERROR, message, true),
                    None => {
                        error!(task = kind.name(), "{message}");
                        self.controller.token().request_stop(message);
                    }
                }
                Outcome::Failed
            }
        };
        let end = self.elapsed();

        if let TaskKind::RestoreLocal(idx) | TaskKind::RestoreDist(idx) | TaskKind::Run(idx) = kind
            && !matches!(outcome, Outcome::Fallback(_))
        {
            let mut slot = self.slot(idx);
            slot.timing = Some((start, end));
            slot.resources = kind.requirements(self.graph, &self.capacity);
        }

        Done {
            id,
            kind,
            outcome,
            start,
            end,
        }
    }

    fn handle(&self, kind: &TaskKind) -> Outcome {
        match kind {
            TaskKind::PrepareAll => self.prepare_all(),
            TaskKind::CompactCache => self.compact_cache(),
            TaskKind::CleanSymres => self.clean_symres(),
            TaskKind::Pattern(name) => self.resolve_pattern(name),
            TaskKind::Resource(desc) => {
                let result = self.fetch_resource(&desc.uri, &desc.canonical());
                let outcome = match &result {
                    Ok(_) => Outcome::Ok,
                    Err(message) => {
                        warn!(uri = %desc.uri, "couldn't fetch resource: {message}");
                        Outcome::Failed
                    }
                };
                lock(&self.fetched).insert(desc.canonical(), result);
                outcome
            }
            TaskKind::Prepare(idx) => self.prepare(*idx),
            TaskKind::RestoreLocal(idx) => self.restore_local(*idx),
            TaskKind::RestoreDist(idx) => self.restore_dist(*idx),
            TaskKind::Run(idx) => self.run(*idx),
            TaskKind::PutLocal(idx) => self.put_local(*idx),
            TaskKind::PutDist(idx) => self.put_dist(*idx),
            TaskKind::Result(idx) => self.publish(*idx),
        }
    }

    fn prepare_all(&self) -> Outcome {
        let conflicted: HashSet<&str> = self
            .graph
            .conflicts()
            .iter()
            .flat_map(|c| c.uids.iter().map(String::as_str))
            .collect();

        let statuses = self
            .graph
            .reachable_from_results()
            .into_par_iter()
            .map(|idx| (idx, self.decide(idx, &conflicted)))
            .collect::<Vec<_>>();

        debug!(nodes = statuses.len(), "planned node statuses");
        Outcome::Planned(statuses)
    }

    fn decide(&self, idx: NodeIndex, conflicted: &HashSet<&str>) -> Status {
        let node = self.graph.node(idx);
        if conflicted.contains(&*node.uid) {
            return Status::Conflict;
        }
        if self.options.clear_build || !node.cacheable {
            return Status::Run;
        }
        if self.local.as_ref().is_some_and(|local| local.has(&node.uid)) {
            return Status::RestoreLocal;
        }

        let Some(dist) = &self.dist else {
            return Status::Run;
        };
        let options = dist.options();
        if options.late_fetch {
            return Status::RestoreDist;
        }
        match dist.probe(&node.uid) {
            Ok(true) => Status::RestoreDist,
            Ok(false) if options.exclusive => Status::CacheMiss,
            Ok(false) => Status::Run,
            Err(e) if options.crit.fatal_on_get() => Status::CacheFailure(e.to_string()),
            Err(e) if options.exclusive => {
                warn!(uid = %node.uid, "distributed cache lookup failed: {e}");
                Status::CacheMiss
            }
            Err(e) => {
                warn!(uid = %node.uid, "distributed cache lookup failed, building instead: {e}");
                Status::Run
            }
        }
    }

    fn compact_cache(&self) -> Outcome {
        let Some(local) = &self.local else {
            return Outcome::Ok;
        };
        let options = &self.options.local_cache;

        let report = if options.strip {
            let mut retain: HashSet<String> =
                self.graph.uids().map(|uid| uid.to_string()).collect();
            for idx in self.graph.node_indices() {
                for desc in &self.graph.node(idx).resources {
                    retain.insert(resource_key(&desc.canonical()));
                }
            }
            for uri in self.graph.pattern_resources().values() {
                retain.insert(resource_key(uri));
            }
            local.strip(&retain)
        } else if options.ttl().is_some() || options.max_size.is_some() {
            local.compact(options.ttl(), options.max_size)
        } else {
            return Outcome::Ok;
        };

        match report {
            Ok(report) => debug!(
                removed = report.removed_entries,
                blobs = report.removed_blobs,
                size = report.size,
                "compacted local cache"
            ),
            Err(e) => warn!("couldn't compact local cache: {e}"),
        }
        Outcome::Ok
    }

    fn clean_symres(&self) -> Outcome {
        match self.collector.sieve() {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "sieved stored results"),
            Err(e) => warn!("couldn't sieve stored results: {e}"),
        }
        Outcome::Ok
    }

    fn resolve_pattern(&self, name: &str) -> Outcome {
        let key = format!("$({name})");
        let result = match self.graph.pattern_resources().get(name) {
            Some(uri) => self.fetch_resource(uri, uri),
            None => Err(FetchError::UnknownPattern(name.to_string()).to_string()),
        };

        let outcome = match &result {
            Ok(dir) => {
                lock(&self.patterns).insert(name, dir.as_str());
                Outcome::Ok
            }
            Err(message) => {
                warn!(pattern = name, "couldn't resolve pattern: {message}");
                Outcome::Failed
            }
        };
        lock(&self.fetched).insert(key, result);
        outcome
    }

    /// Places a resource under the resource root, going through the local
    /// cache when there is one.
    fn fetch_resource(&self, uri: &str, canonical: &str) -> Result<Utf8PathBuf, String> {
        let dir = self.resource_root.join(Fetchers::resource_dir(uri));
        let key = resource_key(canonical);

        if let Some(local) = &self.local
            && local.has(&key)
        {
            match local.restore(&key, &dir) {
                Ok(true) => {
                    trace!(uri, "resource restored from local cache");
                    return Ok(dir);
                }
                Ok(false) => {}
                Err(e) => warn!(uri, "couldn't restore cached resource: {e}"),
            }
        }

        self.fetchers.fetch(uri, &dir).map_err(|e| e.to_string())?;

        if let Some(local) = &self.local {
            let files = list_files(&dir);
            if let Err(e) = local.put(&key, &dir, &files) {
                warn!(uri, "couldn't cache resource: {e}");
            }
        }
        Ok(dir)
    }

    fn prepare(&self, idx: NodeIndex) -> Outcome {
        let node = self.graph.node(idx);

        match self.status(idx) {
            Status::Conflict => {
                let message = self
                    .graph
                    .conflicts()
                    .iter()
                    .find(|c| c.uids.iter().any(|u| *u == *node.uid))
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "Outputs conflict with another result".to_string());
                self.fail(idx, exit::CONFLICT, message, false);
                return Outcome::Failed;
            }
            Status::CacheMiss => {
                let message = format!("'{}' is missing from the distributed cache", node.uid);
                self.fail(idx, exit::CACHE_FETCH_ERROR, message, true);
                return Outcome::Failed;
            }
            Status::CacheFailure(message) => {
                self.fail(idx, exit::INFRASTRUCTURE_ERROR, message, true);
                return Outcome::Failed;
            }
            Status::Run | Status::RestoreLocal | Status::RestoreDist => {}
        }

        let fetched = lock(&self.fetched);
        for desc in &node.resources {
            let message = match fetched.get(&desc.canonical()) {
                Some(Ok(_)) => continue,
                Some(Err(message)) => message.clone(),
                None => format!("Resource '{}' was not fetched", desc.uri),
            };
            drop(fetched);
            self.fail(idx, exit::INFRASTRUCTURE_ERROR, message, false);
            return Outcome::Failed;
        }

        let missing = self.unresolved_patterns(node);
        if let Some(name) = missing.first() {
            let message = match fetched.get(&format!("$({name})")) {
                Some(Err(message)) => message.clone(),
                _ => FetchError::UnknownPattern(name.clone()).to_string(),
            };
            drop(fetched);
            self.fail(idx, exit::INFRASTRUCTURE_ERROR, message, false);
            return Outcome::Failed;
        }

        Outcome::Ok
    }

    fn new_root(&self, idx: NodeIndex) -> Result<Arc<BuildRoot>, String> {
        let node = self.graph.node(idx);
        let mut slot = self.slot(idx);
        let root = self
            .roots
            .new_root(&node.outputs, slot.refs, &node.dir_outputs, node.cacheable);
        root.create().map_err(|e| e.to_string())?;
        slot.root = Some(root.clone());
        Ok(root)
    }

    fn finish_restore(&self, idx: NodeIndex, root: &BuildRoot, status: NodeStatus) {
        let digest = root.digest().unwrap_or_else(|e| {
            warn!(uid = %self.graph.node(idx).uid, "couldn't hash restored outputs: {e}");
            None
        });
        let mut slot = self.slot(idx);
        slot.digest = digest;
        slot.exit_code = Some(exit::SUCCESS);
        slot.node_status = status;
    }

    fn restore_local(&self, idx: NodeIndex) -> Outcome {
        let uid = &self.graph.node(idx).uid;
        let Some(local) = &self.local else {
            return Outcome::Fallback(idx);
        };
        let root = match self.new_root(idx) {
            Ok(root) => root,
            Err(e) => {
                self.fail(idx, exit::INTERNAL_ERROR, e, false);
                return Outcome::Failed;
            }
        };

        match local.restore(uid, root.path()) {
            Ok(true) => match root.validate() {
                Ok(()) => {
                    self.finish_restore(idx, &root, NodeStatus::RestoredLocal);
                    return Outcome::Ok;
                }
                Err(e) => warn!(uid = %uid, "restored outputs are invalid: {e}"),
            },
            Ok(false) => debug!(uid = %uid, "vanished from local cache"),
            Err(e) => warn!(uid = %uid, "couldn't restore from local cache: {e}"),
        }

        self.discard_root(idx);
        Outcome::Fallback(idx)
    }

    fn restore_dist(&self, idx: NodeIndex) -> Outcome {
        let uid = &self.graph.node(idx).uid;
        let Some(dist) = &self.dist else {
            return Outcome::Fallback(idx);
        };
        let options = dist.options();
        let root = match self.new_root(idx) {
            Ok(root) => root,
            Err(e) => {
                self.fail(idx, exit::INTERNAL_ERROR, e, false);
                return Outcome::Failed;
            }
        };

        let failure = match dist.restore(uid, root.path()) {
            Ok(true) => match root.validate() {
                Ok(()) => {
                    if options.write_through
                        && let Some(local) = &self.local
                        && let Err(e) = local.put(uid, root.path(), &root.files())
                    {
                        warn!(uid = %uid, "couldn't write through to local cache: {e}");
                    }
                    self.finish_restore(idx, &root, NodeStatus::RestoredDist);
                    return Outcome::Ok;
                }
                Err(e) => (exit::CACHE_FETCH_ERROR, format!("Restored outputs are invalid: {e}")),
            },
            Ok(false) => (
                exit::CACHE_FETCH_ERROR,
                format!("'{uid}' is missing from the distributed cache"),
            ),
            Err(e) if options.crit.fatal_on_get() => (exit::INFRASTRUCTURE_ERROR, e.to_string()),
            Err(e) => (exit::CACHE_FETCH_ERROR, e.to_string()),
        };

        self.discard_root(idx);
        let (code, message) = failure;
        if options.exclusive || code == exit::INFRASTRUCTURE_ERROR {
            self.fail(idx, code, message, true);
            return Outcome::Failed;
        }
        debug!(uid = %uid, "distributed restore failed, building instead: {message}");
        Outcome::Fallback(idx)
    }

    /// Key under which outputs are stored by content: the node's self uid
    /// combined with the digests of its dependencies.
    fn content_key(&self, node: &Node) -> Option<String> {
        if self.options.clear_build || !node.cacheable {
            return None;
        }
        let self_uid = node.self_uid.as_ref()?;
        let mut builder = Hash32Builder::new().part(self_uid.as_bytes());
        for &dep in &node.deps {
            let digest = self.slot(dep).digest?;
            builder = builder.part(digest.to_hex());
        }
        Some(format!("content-{}", builder.finish().to_hex()))
    }

    /// Looks the content key up in both tiers instead of running.
    fn restore_by_content(&self, idx: NodeIndex, key: &str, root: &BuildRoot) -> bool {
        let uid = &self.graph.node(idx).uid;

        if let Some(local) = &self.local
            && local.has(key)
        {
            match local.restore(key, root.path()) {
                Ok(true) if root.validate().is_ok() => return true,
                Ok(_) => debug!(uid = %uid, "content restore from local cache missed"),
                Err(e) => debug!(uid = %uid, "content restore from local cache failed: {e}"),
            }
        }

        if let Some(dist) = &self.dist {
            match dist.restore(key, root.path()) {
                Ok(true) if root.validate().is_ok() => {
                    if dist.options().write_through
                        && let Some(local) = &self.local
                        && let Err(e) = local.put(key, root.path(), &root.files())
                    {
                        warn!(uid = %uid, "couldn't write through to local cache: {e}");
                    }
                    return true;
                }
                Ok(_) => {}
                Err(e) => debug!(uid = %uid, "content restore from distributed cache failed: {e}"),
            }
        }

        false
    }

    fn run(&self, idx: NodeIndex) -> Outcome {
        let node = self.graph.node(idx);
        if self.slot(idx).exit_code.is_some() {
            self.release_deps(idx);
            return Outcome::Failed;
        }

        let root = match self.new_root(idx) {
            Ok(root) => root,
            Err(e) => {
                self.release_deps(idx);
                self.fail(idx, exit::INTERNAL_ERROR, e, false);
                return Outcome::Failed;
            }
        };

        let content_key = self.content_key(node);
        if let Some(key) = &content_key
            && self.restore_by_content(idx, key, &root)
        {
            self.release_deps(idx);
            self.finish_restore(idx, &root, NodeStatus::DynamicallyRestored);
            self.slot(idx).content_key = content_key;
            debug!(uid = %node.uid, "restored by content");
            return Outcome::Ok;
        }

        for (i, &dep) in node.deps.iter().enumerate() {
            let (dep_root, dep_ok) = {
                let slot = self.slot(dep);
                (slot.root.clone(), slot.exit_code == Some(exit::SUCCESS))
            };
            let stolen = match dep_root {
                Some(dep_root) if dep_ok => {
                    let stolen = dep_root.steal_into(&root).map_err(|e| e.to_string());
                    if stolen.is_ok() {
                        let mut slot = self.slot(dep);
                        slot.refs = slot.refs.saturating_sub(1);
                    }
                    stolen
                }
                _ if !dep_ok => {
                    self.release_ref(dep);
                    continue;
                }
                _ => Err(format!(
                    "Outputs of '{}' are no longer available",
                    self.graph.node(dep).uid
                )),
            };
            if let Err(e) = stolen {
                for &rest in &node.deps[i + 1..] {
                    self.release_ref(rest);
                }
                self.discard_root(idx);
                self.fail(idx, exit::INTERNAL_ERROR, e, false);
                return Outcome::Failed;
            }
        }

        let attempts = match self.run_commands(node, &root) {
            Ok(attempts) => attempts,
            Err(failure) => {
                self.discard_root(idx);
                self.fail(idx, failure.code, failure.message, false);
                return Outcome::Failed;
            }
        };

        if let Err(e) = root.validate() {
            self.discard_root(idx);
            self.fail(idx, exit::INTERNAL_ERROR, e.to_string(), false);
            return Outcome::Failed;
        }

        let digest = match root.digest() {
            Ok(digest) => digest,
            Err(e) => {
                self.discard_root(idx);
                self.fail(idx, exit::INTERNAL_ERROR, e.to_string(), false);
                return Outcome::Failed;
            }
        };

        let mut slot = self.slot(idx);
        slot.digest = digest;
        slot.content_key = content_key;
        slot.exit_code = Some(exit::SUCCESS);
        slot.node_status = NodeStatus::Built;
        slot.attempts = attempts;
        Outcome::Ok
    }

    /// Runs every command of the node, retrying failed tests while their
    /// time budget lasts. Returns the number of attempts.
    fn run_commands(&self, node: &Node, root: &BuildRoot) -> Result<u32, Failure> {
        let is_test = node.is_test();
        let timeout = match (is_test, self.options.test_timeout()) {
            (true, Some(timeout)) => Some(timeout),
            _ => self.options.command_timeout(),
        };
        let allowed = if is_test { 1 + self.options.test_retries } else { 1 };
        let started = Instant::now();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let failure = match self.run_once(node, root, timeout) {
                Ok(()) => return Ok(attempt),
                Err(failure) => failure,
            };

            let in_budget = self
                .options
                .test_timeout()
                .is_none_or(|budget| started.elapsed() < budget);
            if !failure.retriable
                || attempt >= allowed
                || !in_budget
                || self.token().is_stopping()
            {
                return Err(failure);
            }
            warn!(uid = %node.uid, attempt, "test failed, retrying");
        }
    }

    fn run_once(
        &self,
        node: &Node,
        root: &BuildRoot,
        timeout: Option<std::time::Duration>,
    ) -> Result<(), Failure> {
        let patterns = lock(&self.patterns).clone();
        let build_root = root.path().as_str();
        let extra = [(BUILD_ROOT, build_root)];
        let fill = |text: &str| patterns.fill_with(text, &extra);
        let in_root = |text: &str| {
            let path = Utf8PathBuf::from(fill(text));
            if path.is_absolute() { path } else { root.path().join(path) }
        };
        let failed_code = if node.is_test() { exit::TESTS_FAILED } else { exit::FAILURE };

        for cmd in node.commands() {
            let mut env = self.env.base_env().clone();
            env.insert("TMPDIR".to_string(), root.tmp_dir().to_string());
            for (key, value) in &cmd.env {
                env.insert(key.clone(), fill(value));
            }

            let invocation = Invocation {
                args: cmd.cmd_args.iter().map(|arg| fill(arg)).collect(),
                cwd: Some(match &cmd.cwd {
                    Some(cwd) => in_root(cwd),
                    None => root.path().to_owned(),
                }),
                env,
                stdout: cmd.stdout.as_deref().map(in_root),
                stderr: cmd.stderr.as_deref().map(in_root),
                timeout,
            };

            match self.executor.execute(&invocation, self.token()) {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    let mut message = format!(
                        "Command {:?} exited with code {}",
                        invocation.args, output.exit_code
                    );
                    let stderr = output.stderr.trim();
                    if !stderr.is_empty() {
                        message.push('\n');
                        message.push_str(stderr);
                    }
                    return Err(Failure {
                        code: failed_code,
                        message,
                        retriable: true,
                    });
                }
                Err(ExecError::Aborted) => {
                    return Err(Failure {
                        code: exit::CANCELLED,
                        message: "Command was aborted".to_string(),
                        retriable: false,
                    });
                }
                Err(e @ ExecError::Timeout(_)) => {
                    return Err(Failure {
                        code: failed_code,
                        message: e.to_string(),
                        retriable: true,
                    });
                }
                Err(e) => {
                    return Err(Failure {
                        code: exit::FAILURE,
                        message: e.to_string(),
                        retriable: false,
                    });
                }
            }
        }
        Ok(())
    }

    /// Root of a successfully finished node with the keys to store it under.
    fn stored_root(&self, idx: NodeIndex) -> Option<(Arc<BuildRoot>, Vec<String>)> {
        let slot = self.slot(idx);
        if slot.exit_code != Some(exit::SUCCESS) {
            return None;
        }
        let root = slot.root.clone()?;
        let mut keys = vec![self.graph.node(idx).uid.to_string()];
        keys.extend(slot.content_key.clone());
        Some((root, keys))
    }

    fn put_local(&self, idx: NodeIndex) -> Outcome {
        if let (Some(local), Some((root, keys))) = (&self.local, self.stored_root(idx)) {
            let files = root.files();
            for key in &keys {
                match local.put(key, root.path(), &files) {
                    Ok(PutStatus::Stored) => trace!(key = %key, "stored in local cache"),
                    Ok(PutStatus::Skipped(why)) => trace!(key = %key, why, "not stored in local cache"),
                    Err(e) => warn!(key = %key, "couldn't store in local cache: {e}"),
                }
            }
        }
        self.release_ref(idx);
        Outcome::Ok
    }

    fn put_dist(&self, idx: NodeIndex) -> Outcome {
        let mut outcome = Outcome::Ok;
        if let (Some(dist), Some((root, keys))) = (&self.dist, self.stored_root(idx)) {
            let files = root.files();
            for key in &keys {
                match dist.put(key, root.path(), &files) {
                    Ok(PutStatus::Stored) => trace!(key = %key, "stored in distributed cache"),
                    Ok(PutStatus::Skipped(why)) => {
                        trace!(key = %key, why, "not stored in distributed cache")
                    }
                    Err(e) if dist.options().crit.fatal_on_put() => {
                        self.fail_put(idx, format!("Couldn't store in distributed cache: {e}"));
                        outcome = Outcome::Failed;
                        break;
                    }
                    Err(e) => warn!(key = %key, "couldn't store in distributed cache: {e}"),
                }
            }
        }
        self.release_ref(idx);
        outcome
    }

    fn publish(&self, idx: NodeIndex) -> Outcome {
        let uid = self.graph.node(idx).uid.to_string();
        let root = self.slot(idx).root.clone();
        let Some(root) = root else {
            return Outcome::Ok;
        };

        let outcome = match self.collector.publish(&uid, root.path(), &root.files()) {
            Ok(paths) => {
                if !paths.is_empty() {
                    lock(&self.results).insert(uid, paths);
                }
                Outcome::Ok
            }
            Err(PublishError::Conflict(e)) => {
                self.fail(idx, exit::CONFLICT, e.to_string(), false);
                Outcome::Failed
            }
            Err(e) => {
                self.fail(idx, exit::INTERNAL_ERROR, e.to_string(), false);
                Outcome::Failed
            }
        };
        self.release_ref(idx);
        outcome
    }
}

fn resource_key(canonical: &str) -> String {
    format!("resource-{canonical}")
}

/// Every string of a node that may carry patterns.
fn node_texts(node: &Node) -> impl Iterator<Item = &str> {
    node.cmds
        .iter()
        .flat_map(|cmd| {
            cmd.cmd_args
                .iter()
                .map(String::as_str)
                .chain(cmd.cwd.as_deref())
                .chain(cmd.env.values().map(String::as_str))
                .chain(cmd.stdout.as_deref())
                .chain(cmd.stderr.as_deref())
        })
        .chain(node.cwd.as_deref())
        .chain(node.env.values().map(String::as_str))
}

fn list_files(dir: &Utf8Path) -> Vec<Utf8PathBuf> {
    let pattern = format!("{}/**/*", glob::Pattern::escape(dir.as_str()));
    let Ok(paths) = glob::glob(&pattern) else {
        return Vec::new();
    };
    paths
        .flatten()
        .filter(|path| path.is_file())
        .filter_map(|path| Utf8PathBuf::from_path_buf(path).ok())
        .filter_map(|path| path.strip_prefix(dir).ok().map(Utf8Path::to_owned))
        .collect()
}
