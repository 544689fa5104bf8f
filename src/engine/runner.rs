use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::mpsc::{RecvTimeoutError, channel};
use std::thread;

use petgraph::graph::NodeIndex;
use tracing::{debug, trace};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use super::memo::{Identity, TaskCache};
use super::pipeline::{Done, Outcome, Pipeline, Status};
use super::pool::{Admission, PoolConfig, WorkerPool};
use super::queue::{RunQueue, TaskId};
use super::task::TaskKind;
use crate::cache::CacheStats;
use crate::error::exit;
use crate::stats::{LogEntry, NodeStatus, RunReport, TaskRecord, Timeline};

/// Turns node statuses into tasks and drives them through the worker pool.
///
/// Planning happens on the calling thread only: tasks are added when
/// `PrepareAll` reports the statuses and again whenever a restore falls
/// back to running. Workers never touch the queue.
pub(crate) struct Runner<'p, 'a> {
    pipeline: &'p Pipeline<'a>,
    queue: RunQueue,
    memo: TaskCache,
    /// Symlink store sieve that results wait for.
    symres: Option<TaskId>,
    /// Consumers of a node not planned yet that may still need it.
    undecided: HashMap<NodeIndex, usize>,
    timeline: Timeline,
}

impl<'p, 'a> Runner<'p, 'a> {
    pub(crate) fn new(pipeline: &'p Pipeline<'a>) -> Self {
        Self {
            pipeline,
            queue: RunQueue::new(),
            memo: TaskCache::new(),
            symres: None,
            undecided: HashMap::new(),
            timeline: Timeline::new(),
        }
    }

    fn seed(&mut self) {
        let options = self.pipeline.options;
        let prepare_all = self.queue.add(TaskKind::PrepareAll, &[], None, false);
        if self.pipeline.local.is_some() {
            self.queue.add(TaskKind::CompactCache, &[prepare_all], None, false);
        }
        if options.symlink_root.is_some() && options.results.symlinks_ttl_secs.is_some() {
            let clean = self.queue.add(TaskKind::CleanSymres, &[], None, false);
            if !options.eager_execution {
                self.symres = Some(clean);
            }
        }
    }

    /// Plans every node the results need. Restored nodes do not need their
    /// dependencies, so those are only planned behind nodes that run.
    ///
    /// Every consumer edge holds a reference on its dependency from the
    /// start, since a restore may fall back and read the dependency long
    /// after planning. The reference goes away once the consumer ran or can
    /// no longer run.
    fn plan_all(&mut self, statuses: Vec<(NodeIndex, Status)>) {
        let graph = self.pipeline.graph;
        for (idx, status) in &statuses {
            self.pipeline.set_status(*idx, status.clone());
        }
        for (idx, _) in &statuses {
            for &dep in &graph.node(*idx).deps {
                self.pipeline.add_ref(dep);
                *self.undecided.entry(dep).or_default() += 1;
            }
        }

        let mut needed: HashSet<NodeIndex> = graph.results().iter().copied().collect();
        for (idx, status) in statuses.iter().rev() {
            if needed.contains(idx) && status.needs_deps() {
                needed.extend(graph.node(*idx).deps.iter().copied());
            }
        }

        for (idx, _) in &statuses {
            if needed.contains(idx) {
                self.ensure_planned(*idx);
            }
        }
        debug!(nodes = needed.len(), tasks = self.queue.len(), "planned graph");
    }

    /// Task whose completion means the node is satisfied.
    fn ensure_planned(&mut self, idx: NodeIndex) -> TaskId {
        if let Some(done) = self.memo.get(&Identity::Node(idx)) {
            return done;
        }

        let prepare = self.plan_prepare(idx);
        let done = match self.pipeline.status(idx) {
            Status::RestoreLocal => {
                self.queue
                    .add(TaskKind::RestoreLocal(idx), &[prepare], None, false)
            }
            Status::RestoreDist => self
                .queue
                .add(TaskKind::RestoreDist(idx), &[prepare], None, false),
            Status::Run => self.plan_run(idx, Some(prepare), None),
            Status::Conflict | Status::CacheMiss | Status::CacheFailure(_) => prepare,
        };
        self.memo.get_or_insert_with(Identity::Node(idx), || done);

        if self.pipeline.graph.node(idx).is_result {
            self.plan_result(idx, done);
        }
        done
    }

    fn plan_prepare(&mut self, idx: NodeIndex) -> TaskId {
        let graph = self.pipeline.graph;
        let node = graph.node(idx);
        let mut deps = Vec::new();

        for name in self.pipeline.unresolved_patterns(node) {
            if !graph.pattern_resources().contains_key(&name) {
                continue;
            }
            let task = self.memo.get_or_insert_with(Identity::Pattern(name.clone()), || {
                self.queue.add(TaskKind::Pattern(name.clone()), &[], None, false)
            });
            deps.push(task);
        }

        for desc in &node.resources {
            let task = self
                .memo
                .get_or_insert_with(Identity::Resource(desc.canonical()), || {
                    self.queue.add(TaskKind::Resource(desc.clone()), &[], None, false)
                });
            deps.push(task);
        }

        // Prepare reports failed fetches itself.
        self.queue.add(TaskKind::Prepare(idx), &deps, None, true)
    }

    /// Run plus the cache puts behind it. With `joint` the run joins the
    /// group of a restore that missed.
    fn plan_run(&mut self, idx: NodeIndex, after: Option<TaskId>, joint: Option<TaskId>) -> TaskId {
        let pipeline = self.pipeline;
        let node = pipeline.graph.node(idx);

        let mut deps: Vec<TaskId> = after.into_iter().collect();
        for &dep in &node.deps {
            deps.push(self.ensure_planned(dep));
        }

        let tolerant =
            node.ignore_broken_dependencies || pipeline.options.ignore_broken_dependencies;
        let run = self.queue.add(TaskKind::Run(idx), &deps, joint, tolerant);

        if node.cacheable {
            if pipeline.local.is_some() {
                pipeline.add_ref(idx);
                self.queue.add(TaskKind::PutLocal(idx), &[run], None, false);
            }
            if let Some(dist) = &pipeline.dist
                && dist.is_writable()
                && (!dist.options().result_only || node.is_result)
            {
                pipeline.add_ref(idx);
                self.queue.add(TaskKind::PutDist(idx), &[run], None, false);
            }
        }
        run
    }

    fn plan_result(&mut self, idx: NodeIndex, done: TaskId) {
        self.pipeline.add_ref(idx);
        let mut deps = vec![done];
        deps.extend(self.symres);
        self.queue.add(TaskKind::Result(idx), &deps, None, false);
    }

    fn plan_fallback(&mut self, idx: NodeIndex, restore: TaskId) {
        debug!(uid = %self.pipeline.graph.node(idx).uid, "restore missed, building instead");
        self.plan_run(idx, None, Some(restore));
    }

    /// The node finished without running, so it reads none of its
    /// dependencies. Dependencies left without any possible consumer are
    /// never planned and pass the same on to theirs.
    fn settle_without_run(&mut self, idx: NodeIndex) {
        let graph = self.pipeline.graph;
        let mut stack = vec![idx];
        while let Some(idx) = stack.pop() {
            for &dep in &graph.node(idx).deps {
                self.pipeline.release_ref(dep);
                if self.memo.get(&Identity::Node(dep)).is_some() {
                    continue;
                }
                let undecided = self.undecided.entry(dep).or_default();
                *undecided = undecided.saturating_sub(1);
                if *undecided == 0 && !graph.node(dep).is_result {
                    trace!(uid = %graph.node(dep).uid, "no longer needed");
                    stack.push(dep);
                }
            }
        }
    }

    /// Hands ready tasks to the pool; broken ones are settled right here.
    fn dispatch(&mut self, pool: &WorkerPool<(TaskId, TaskKind)>) {
        let graph = self.pipeline.graph;
        loop {
            let ready = self.queue.take_ready();
            if ready.is_empty() {
                break;
            }
            for id in ready {
                let kind = self.queue.kind(id).clone();
                if self.queue.is_broken(id) {
                    trace!(task = kind.name(), "skipping broken task");
                    self.pipeline.on_broken(&kind);
                    if let TaskKind::RestoreLocal(idx) | TaskKind::RestoreDist(idx) = kind {
                        self.settle_without_run(idx);
                    }
                    self.queue.complete(id, true);
                    continue;
                }
                let admission = Admission {
                    req: kind.requirements(graph, &self.pipeline.capacity),
                    priority: kind.priority(graph),
                    preference: kind.preference(),
                };
                pool.submit(admission, (id, kind));
            }
        }
    }

    fn on_done(&mut self, done: Done) {
        let graph = self.pipeline.graph;
        let Done {
            id,
            kind,
            outcome,
            start,
            end,
        } = done;

        let failed = matches!(outcome, Outcome::Failed);
        match outcome {
            Outcome::Planned(statuses) => self.plan_all(statuses),
            Outcome::Fallback(idx) => self.plan_fallback(idx, id),
            Outcome::Ok | Outcome::Failed => match kind {
                TaskKind::RestoreLocal(idx) | TaskKind::RestoreDist(idx) => {
                    self.settle_without_run(idx)
                }
                TaskKind::Prepare(idx) if !self.pipeline.status(idx).may_run() => {
                    self.settle_without_run(idx)
                }
                _ => {}
            },
        }
        self.queue.complete(id, failed);

        self.timeline.push(TaskRecord {
            id,
            kind: kind.name(),
            label: kind.label(graph),
            uid: kind.node().map(|idx| graph.node(idx).uid.to_string()),
            start,
            end,
            resources: kind.requirements(graph, &self.pipeline.capacity),
            deps: self.queue.released_by(id),
        });

        let span = self.pipeline.span();
        span.pb_set_length(self.queue.len() as u64);
        span.pb_inc(1);
    }

    /// Drives the queue to completion or until a stop, then settles what
    /// never ran.
    pub(crate) fn run(mut self) -> RunReport {
        let pipeline = self.pipeline;
        let options = pipeline.options;
        let token = pipeline.token().clone();
        let poll = options.poll_interval();
        let config = PoolConfig {
            capacity: pipeline.capacity,
            base_workers: options.build_threads.max(1),
            service_workers: 1 + options.net_threads,
            poll,
        };

        self.seed();
        let handler = |(id, kind): (TaskId, TaskKind)| pipeline.execute(id, kind);

        thread::scope(|scope| {
            let (tx, rx) = channel::<Done>();
            let pool = WorkerPool::start(scope, config, token.clone(), &handler, tx);

            loop {
                self.dispatch(&pool);
                if self.queue.is_finished() {
                    break;
                }

                if token.is_stopping() {
                    token.begin_drain();
                    pool.wake();
                    if pool.in_flight() == 0 {
                        while let Ok(done) = rx.try_recv() {
                            self.on_done(done);
                        }
                        break;
                    }
                }

                match rx.recv_timeout(poll) {
                    Ok(done) => self.on_done(done),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            for (_, kind) in pool.drain() {
                pipeline.on_cancelled(&kind);
            }
            for id in self.queue.dispatch_all() {
                pipeline.on_cancelled(self.queue.kind(id));
            }
            pool.shutdown();
        });

        self.report()
    }

    fn report(self) -> RunReport {
        let pipeline = self.pipeline;
        let graph = pipeline.graph;
        let token = pipeline.token();
        let cancelled = token.reason().is_some();

        let mut report = RunReport::default();
        let mut codes = Vec::new();
        let mut incomplete = false;

        for idx in graph.reachable_from_results() {
            // Dependencies of restored nodes are never planned.
            if self.memo.get(&Identity::Node(idx)).is_none() {
                continue;
            }
            let slot = pipeline.snapshot(idx);
            let uid = graph.node(idx).uid.to_string();
            let status = match slot.node_status {
                NodeStatus::Pending if cancelled => NodeStatus::Cancelled,
                status => status,
            };

            match slot.exit_code {
                Some(code) => {
                    report.exit_code_map.insert(uid.clone(), code);
                    codes.push(code);
                }
                None => incomplete = true,
            }
            codes.extend(slot.put_error);

            report.execution_log.insert(
                uid,
                LogEntry {
                    kind: Some(graph.node(idx).kind().to_string()),
                    status,
                    cached: status.is_cached(),
                    exit_code: slot.exit_code,
                    timing: slot.timing,
                    resources: slot.resources,
                    dynamically_resolved_cache: status == NodeStatus::DynamicallyRestored,
                    attempts: slot.attempts,
                    ..LogEntry::default()
                },
            );
        }

        for (alias, idx) in graph.aliases() {
            let canonical = graph.node(*idx).uid.to_string();
            let Some(entry) = report.execution_log.get(&canonical).cloned() else {
                continue;
            };
            if let Some(code) = entry.exit_code {
                report.exit_code_map.insert(alias.to_string(), code);
            }
            report.execution_log.insert(
                alias.to_string(),
                LogEntry {
                    deduplicated_by: Some(canonical),
                    ..entry
                },
            );
        }

        if let Some(local) = &pipeline.local {
            cache_entries("local-cache", local.stats(), &mut report.execution_log);
        }
        if let Some(dist) = &pipeline.dist {
            cache_entries("dist-cache", dist.stats(), &mut report.execution_log);
        }

        let failed = codes.iter().any(|&code| code != exit::SUCCESS);
        if token.is_aborted() || (cancelled && incomplete && !failed) {
            codes.push(exit::CANCELLED);
        }

        report.exit_code = exit::merge_exit_codes(codes);
        report.results = pipeline.take_results();
        report.build_errors = pipeline.take_errors();
        let mut timeline = self.timeline;
        timeline.order_by(self.queue.replay());
        report.critical_path = timeline.critical_path();
        report.timeline = timeline;
        report.cancelled = cancelled;
        report
    }
}

fn cache_entries(prefix: &str, stats: &CacheStats, log: &mut BTreeMap<String, LogEntry>) {
    for (op, op_stats) in stats.ops() {
        log.insert(
            format!("$({prefix}-{op})"),
            LogEntry {
                op: Some(op_stats),
                ..LogEntry::default()
            },
        );
    }
    log.insert(
        format!("$({prefix}-hits)"),
        LogEntry {
            hits: Some(stats.hits()),
            ..LogEntry::default()
        },
    );
}
