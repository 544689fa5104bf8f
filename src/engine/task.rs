use petgraph::graph::NodeIndex;

use crate::graph::{Graph, ResourceDescriptor};
use crate::resources::Resources;

/// Which worker group a task prefers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Preference {
    /// Build actions.
    Base,
    /// Network transfers and housekeeping.
    Service,
}

/// Every kind of work the scheduler knows how to run.
#[derive(Debug, Clone)]
pub(crate) enum TaskKind {
    /// Decide per node whether to restore or run, then plan the pipelines.
    PrepareAll,
    CompactCache,
    /// Sieve expired entries out of the symlink result store.
    CleanSymres,
    /// Resolve a pattern bound to a fetchable resource.
    Pattern(String),
    Resource(ResourceDescriptor),
    Prepare(NodeIndex),
    RestoreLocal(NodeIndex),
    RestoreDist(NodeIndex),
    Run(NodeIndex),
    PutLocal(NodeIndex),
    PutDist(NodeIndex),
    Result(NodeIndex),
}

impl TaskKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            TaskKind::PrepareAll => "prepare-all",
            TaskKind::CompactCache => "compact-cache",
            TaskKind::CleanSymres => "clean-symres",
            TaskKind::Pattern(_) => "pattern",
            TaskKind::Resource(_) => "resource",
            TaskKind::Prepare(_) => "prepare",
            TaskKind::RestoreLocal(_) => "restore-local",
            TaskKind::RestoreDist(_) => "restore-dist",
            TaskKind::Run(_) => "run",
            TaskKind::PutLocal(_) => "put-local",
            TaskKind::PutDist(_) => "put-dist",
            TaskKind::Result(_) => "result",
        }
    }

    pub(crate) fn node(&self) -> Option<NodeIndex> {
        match *self {
            TaskKind::Prepare(idx)
            | TaskKind::RestoreLocal(idx)
            | TaskKind::RestoreDist(idx)
            | TaskKind::Run(idx)
            | TaskKind::PutLocal(idx)
            | TaskKind::PutDist(idx)
            | TaskKind::Result(idx) => Some(idx),
            _ => None,
        }
    }

    pub(crate) fn label(&self, graph: &Graph) -> String {
        match self {
            TaskKind::Pattern(name) => format!("$({name})"),
            TaskKind::Resource(desc) => desc.uri.clone(),
            other => match other.node() {
                Some(idx) => {
                    let node = graph.node(idx);
                    format!("{} {}", node.kind(), node.uid)
                }
                None => other.name().to_string(),
            },
        }
    }

    pub(crate) fn preference(&self) -> Preference {
        match self {
            TaskKind::Run(_) | TaskKind::RestoreLocal(_) | TaskKind::Prepare(_) => Preference::Base,
            _ => Preference::Service,
        }
    }

    /// Capacity the task holds while it runs.
    pub(crate) fn requirements(&self, graph: &Graph, capacity: &Resources) -> Resources {
        let demand = match *self {
            TaskKind::Run(idx) => Resources::for_node(graph.node(idx), capacity),
            TaskKind::RestoreLocal(_) => Resources::cpu(1),
            TaskKind::RestoreDist(_) => Resources::download(1),
            TaskKind::PutLocal(_) | TaskKind::Result(_) => Resources::io(1),
            TaskKind::PutDist(_) => Resources::upload(1),
            TaskKind::PrepareAll
            | TaskKind::CompactCache
            | TaskKind::CleanSymres
            | TaskKind::Pattern(_)
            | TaskKind::Resource(_)
            | TaskKind::Prepare(_) => Resources::ZERO,
        };
        demand.clamp_to(capacity)
    }

    /// Higher runs first among admissible tasks.
    pub(crate) fn priority(&self, graph: &Graph) -> i64 {
        match self.node() {
            Some(idx) => graph.node(idx).effective_priority(),
            None => i64::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::graph::tests::spec;
    use crate::graph::{GraphConf, GraphDescriptor};

    #[test]
    fn requirements_follow_the_kind() {
        let mut link = spec("bin", &["lib"]);
        link.kv.insert("p".into(), "LD".into());
        let graph = Graph::from_descriptor(GraphDescriptor {
            graph: vec![spec("lib", &[]), link],
            result: vec!["bin".into()],
            conf: GraphConf::default(),
        })
        .unwrap();
        let cap = Resources::capacity(&Options {
            build_threads: 4,
            net_threads: 0,
            ..Options::default()
        });
        let lib = graph.find("lib").unwrap();
        let bin = graph.find("bin").unwrap();

        assert_eq!(TaskKind::Run(lib).requirements(&graph, &cap), Resources::cpu(1));
        assert_eq!(TaskKind::Run(bin).requirements(&graph, &cap), Resources::io(1));
        assert_eq!(TaskKind::PutDist(bin).requirements(&graph, &cap), Resources::upload(1));
        assert!(TaskKind::Prepare(bin).requirements(&graph, &cap).is_zero());
        assert!(TaskKind::Run(lib).priority(&graph) > TaskKind::Run(bin).priority(&graph));
        assert_eq!(TaskKind::Run(bin).label(&graph), "LD bin");
    }
}
