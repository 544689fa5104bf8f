mod cancel;
mod memo;
mod pipeline;
mod pool;
mod queue;
mod runner;
mod task;


use std::sync::{Arc, Mutex};

use tracing::{Level, info, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::build_root::BuildRootSet;
use crate::cache::{DistCache, LocalCache, RemoteStore};
use crate::config::Options;
use crate::env::{CleanupStack, ExecEnv};
use crate::error::EngineError;
use crate::exec::Executor;
use crate::graph::Graph;
use crate::pattern::Fetchers;
use crate::result::ResultCollector;
use crate::stats::RunReport;
use crate::utils;

pub use cancel::{CancelToken, Controller, RunState};

use pipeline::{Pipeline, Services};
use runner::Runner;

/// Executes build graphs under one set of options.
///
/// Each call to [`Engine::run`] gets its own build roots, environment and
/// cancel token; the caches persist across runs.
pub struct Engine {
    options: Options,
    executor: Arc<dyn Executor>,
    fetchers: Fetchers,
    remote: Option<Arc<dyn RemoteStore>>,
    token: Mutex<CancelToken>,
}

impl Engine {
    pub fn new(options: Options, executor: Arc<dyn Executor>) -> Self {
        Self {
            options,
            executor,
            fetchers: Fetchers::with_defaults(),
            remote: None,
            token: Mutex::new(CancelToken::new()),
        }
    }

    pub fn with_fetchers(mut self, fetchers: Fetchers) -> Self {
        self.fetchers = fetchers;
        self
    }

    /// Backing store of the distributed cache; unused unless
    /// `dist_cache` is configured.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Token of the current run, or of the next one when idle.
    pub fn cancel_token(&self) -> CancelToken {
        self.token.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Stops the current run and kills running commands.
    pub fn abort(&self, reason: &str) {
        self.cancel_token().abort(reason);
    }

    pub fn run(&self, graph: &Graph) -> Result<RunReport, EngineError> {
        let options = &self.options;
        options.validate()?;

        let token = self.cancel_token();
        let mut cleanup = CleanupStack::new();

        let roots = BuildRootSet::create(
            &options.build_root,
            options.keep_temps,
            options.limit_output_size,
            options.limit_build_root_size,
            options.stale_build_root_ttl(),
        )?;
        let guard = roots.clone();
        cleanup.push("build roots", move || guard.cleanup());

        let env = ExecEnv::create(options, roots.path(), &mut cleanup)?;

        let local = match options.local_cache.enabled {
            true => Some(LocalCache::open(
                &options.local_cache.path,
                options.local_cache.codec,
            )?),
            false => None,
        };

        let dist = match (&options.dist_cache, &self.remote) {
            (Some(dist_options), Some(remote)) => {
                Some(DistCache::new(remote.clone(), dist_options.clone()))
            }
            (Some(_), None) => {
                warn!("distributed cache is configured without a remote store");
                None
            }
            (None, _) => None,
        };

        let collector = ResultCollector::new(
            options.results.clone(),
            options.output_root.clone(),
            options.symlink_root.clone(),
            &options.build_root.join("symres"),
        )?;

        let span = tracing::span!(Level::INFO, "execute_graph", nodes = graph.len());
        span.pb_set_style(&utils::progress_style());
        span.pb_set_message("Executing graph...");
        let _enter = span.enter();

        let services = Services {
            local,
            dist,
            roots,
            env,
            collector,
        };
        let pipeline = Pipeline::new(
            graph,
            options,
            self.executor.as_ref(),
            &self.fetchers,
            services,
            token.clone(),
            span.clone(),
        );
        let report = Runner::new(&pipeline).run();

        token.finish();
        drop(pipeline);
        cleanup.release();
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = CancelToken::new();

        if let Some(path) = &options.waterfall
            && let Err(e) = report.timeline.render_waterfall_to_file(path)
        {
            warn!(path = %path, "couldn't write waterfall chart: {e}");
        }

        info!(
            exit_code = report.exit_code,
            cancelled = report.cancelled,
            tasks = report.timeline.len(),
            "Execution finished"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("options", &self.options)
            .field("fetchers", &self.fetchers)
            .field("remote", &self.remote.is_some())
            .finish()
    }
}
