use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;

use camino::Utf8Path;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::ArcStr;
use crate::error::{ConflictError, GraphError};

/// Prefix of output paths that live inside a node's build root.
pub const BUILD_ROOT_PATTERN: &str = "$(BUILD_ROOT)";

/// Graph as produced by the graph-construction collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDescriptor {
    pub graph: Vec<NodeSpec>,
    #[serde(default)]
    pub result: Vec<String>,
    #[serde(default)]
    pub conf: GraphConf,
}

impl GraphDescriptor {
    pub fn from_json_file(path: impl AsRef<Utf8Path>) -> Result<Self, GraphError> {
        let data = fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&data)?)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphConf {
    /// Fetchable resources bound to pattern names.
    #[serde(default)]
    pub resources: Vec<PatternResource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternResource {
    pub pattern: String,
    pub uri: String,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSpec {
    pub uid: String,
    #[serde(default)]
    pub self_uid: Option<String>,
    #[serde(default)]
    pub cmds: Vec<CommandSpec>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub dir_outputs: Vec<String>,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "yes")]
    pub cache: bool,
    #[serde(default)]
    pub kv: BTreeMap<String, String>,
    /// Defaults for every command of the node.
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ignore_broken_dependencies: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub cmd_args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
}

/// External resource needed before a node can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ResourceDescriptor {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            extra: BTreeMap::new(),
        }
    }

    /// Stable textual form used as the dedupe identity.
    pub fn canonical(&self) -> String {
        let mut out = self.uri.clone();
        for (key, value) in &self.extra {
            out.push_str(&format!(";{key}={value}"));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub cpu: CpuRequirement,
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub test: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CpuRequirement {
    Count(u32),
    Named(CpuNamed),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuNamed {
    All,
}

impl Default for CpuRequirement {
    fn default() -> Self {
        CpuRequirement::Count(1)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    #[default]
    Restricted,
    Full,
}

/// A build-graph vertex after ingestion. Immutable once the graph is built.
#[derive(Debug, Clone)]
pub struct Node {
    pub uid: ArcStr,
    /// Present only for cacheable nodes.
    pub self_uid: Option<ArcStr>,
    pub cmds: Vec<CommandSpec>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub dir_outputs: Vec<String>,
    /// Dependencies with aliases redirected to their canonical node.
    pub deps: Vec<NodeIndex>,
    pub resources: Vec<ResourceDescriptor>,
    pub requirements: Requirements,
    pub tags: Vec<String>,
    pub priority: i64,
    pub cacheable: bool,
    pub kv: BTreeMap<String, String>,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub ignore_broken_dependencies: bool,
    pub is_result: bool,
    /// Consumer edges plus one if the node is a result.
    pub refcount: usize,
    /// Longest distance to a result node.
    pub max_dist: usize,
}

impl Node {
    /// Short status name such as `CC` or `LD`, `RUN` when not given.
    pub fn kind(&self) -> &str {
        self.kv.get("p").map(String::as_str).unwrap_or("RUN")
    }

    pub fn is_test(&self) -> bool {
        self.requirements.test || self.tags.iter().any(|t| t == "test")
    }

    /// Scheduling priority: declared priority plus depth below the results.
    pub fn effective_priority(&self) -> i64 {
        self.priority + self.max_dist as i64
    }

    /// Commands with node-level `cwd` and `env` applied as defaults.
    pub fn commands(&self) -> Vec<CommandSpec> {
        self.cmds
            .iter()
            .map(|cmd| {
                let mut env = self.env.clone();
                env.extend(cmd.env.clone());
                CommandSpec {
                    cmd_args: cmd.cmd_args.clone(),
                    cwd: cmd.cwd.clone().or_else(|| self.cwd.clone()),
                    env,
                    stdout: cmd.stdout.clone(),
                    stderr: cmd.stderr.clone(),
                }
            })
            .collect()
    }
}

/// The ingested, validated build graph.
///
/// Edges point from a dependency to its consumer, so a topological order
/// lists dependencies first.
#[derive(Debug, Default)]
pub struct Graph {
    pub(crate) graph: DiGraph<Node, ()>,
    index: HashMap<ArcStr, NodeIndex>,
    aliases: Vec<(ArcStr, NodeIndex)>,
    results: Vec<NodeIndex>,
    pattern_resources: BTreeMap<String, String>,
    conflicts: Vec<ConflictError>,
}

impl Graph {
    pub fn from_descriptor(desc: GraphDescriptor) -> Result<Self, GraphError> {
        let mut graph = DiGraph::<Node, ()>::new();
        let mut index: HashMap<ArcStr, NodeIndex> = HashMap::new();
        let mut by_self_uid: HashMap<ArcStr, NodeIndex> = HashMap::new();
        let mut aliases = Vec::new();
        let mut pending_deps = Vec::new();

        for spec in desc.graph {
            let uid: ArcStr = spec.uid.as_str().into();
            if index.contains_key(&uid) {
                return Err(GraphError::DuplicateUid(spec.uid));
            }

            let self_uid: Option<ArcStr> = spec
                .self_uid
                .as_deref()
                .filter(|_| spec.cache)
                .map(Into::into);

            if let Some(self_uid) = &self_uid
                && let Some(&canonical) = by_self_uid.get(self_uid)
            {
                debug!(uid = %uid, canonical = %graph[canonical].uid, "collapsing node by self uid");
                index.insert(uid.clone(), canonical);
                aliases.push((uid, canonical));
                continue;
            }

            let node = Node {
                uid: uid.clone(),
                self_uid: self_uid.clone(),
                cmds: spec.cmds,
                inputs: spec.inputs,
                outputs: spec.outputs,
                dir_outputs: spec.dir_outputs,
                deps: Vec::new(),
                resources: spec.resources,
                requirements: spec.requirements,
                tags: spec.tags,
                priority: spec.priority,
                cacheable: spec.cache,
                kv: spec.kv,
                cwd: spec.cwd,
                env: spec.env,
                ignore_broken_dependencies: spec.ignore_broken_dependencies,
                is_result: false,
                refcount: 0,
                max_dist: 0,
            };
            let idx = graph.add_node(node);
            index.insert(uid, idx);
            if let Some(self_uid) = self_uid {
                by_self_uid.insert(self_uid, idx);
            }
            pending_deps.push((idx, spec.deps));
        }

        for (idx, deps) in pending_deps {
            let mut seen = HashSet::new();
            let mut resolved = Vec::with_capacity(deps.len());
            for dep in deps {
                let Some(&dep_idx) = index.get(dep.as_str()) else {
                    return Err(GraphError::MissingDependency {
                        uid: graph[idx].uid.to_string(),
                        dep,
                    });
                };
                if dep_idx != idx && seen.insert(dep_idx) {
                    resolved.push(dep_idx);
                    graph.add_edge(dep_idx, idx, ());
                }
            }
            graph[idx].deps = resolved;
        }

        let order = petgraph::algo::toposort(&graph, None)
            .map_err(|cycle| GraphError::Cycle(graph[cycle.node_id()].uid.to_string()))?;

        let mut results = Vec::new();
        let mut seen = HashSet::new();
        for uid in desc.result {
            let Some(&idx) = index.get(uid.as_str()) else {
                return Err(GraphError::UnknownResult(uid));
            };
            if seen.insert(idx) {
                results.push(idx);
            }
        }

        for &idx in &results {
            graph[idx].is_result = true;
            graph[idx].refcount += 1;
        }

        let consumers: Vec<(NodeIndex, usize)> = graph
            .node_indices()
            .map(|idx| (idx, graph.neighbors_directed(idx, Direction::Outgoing).count()))
            .collect();
        for (idx, count) in consumers {
            graph[idx].refcount += count;
        }

        // Consumers come after their dependencies in `order`, so walking it
        // backwards settles every consumer's distance before its deps.
        for &idx in order.iter().rev() {
            let dist = graph[idx].max_dist;
            let deps = graph[idx].deps.clone();
            for dep in deps {
                if graph[dep].max_dist < dist + 1 {
                    graph[dep].max_dist = dist + 1;
                }
            }
        }

        let pattern_resources = desc
            .conf
            .resources
            .into_iter()
            .map(|r| (r.pattern, r.uri))
            .collect();

        let conflicts = find_conflicts(&graph, &results);

        Ok(Self {
            graph,
            index,
            aliases,
            results,
            pattern_resources,
            conflicts,
        })
    }

    pub fn from_json_file(path: impl AsRef<Utf8Path>) -> Result<Self, GraphError> {
        Self::from_descriptor(GraphDescriptor::from_json_file(path)?)
    }

    pub fn node(&self, idx: NodeIndex) -> &Node {
        &self.graph[idx]
    }

    /// Look up a node by uid, following aliases.
    pub fn find(&self, uid: &str) -> Option<NodeIndex> {
        self.index.get(uid).copied()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn results(&self) -> &[NodeIndex] {
        &self.results
    }

    pub fn aliases(&self) -> &[(ArcStr, NodeIndex)] {
        &self.aliases
    }

    pub fn pattern_resources(&self) -> &BTreeMap<String, String> {
        &self.pattern_resources
    }

    pub fn conflicts(&self) -> &[ConflictError] {
        &self.conflicts
    }

    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    /// Every node reachable from the result set, dependencies first.
    pub fn reachable_from_results(&self) -> Vec<NodeIndex> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for &root in &self.results {
            let mut stack = vec![(root, false)];
            while let Some((idx, expanded)) = stack.pop() {
                if expanded {
                    out.push(idx);
                    continue;
                }
                if !seen.insert(idx) {
                    continue;
                }
                stack.push((idx, true));
                for &dep in self.graph[idx].deps.iter().rev() {
                    if !seen.contains(&dep) {
                        stack.push((dep, false));
                    }
                }
            }
        }
        out
    }

    /// Every uid known to the graph, aliases included.
    pub fn uids(&self) -> impl Iterator<Item = &ArcStr> {
        self.index.keys()
    }
}

/// Strip the `$(BUILD_ROOT)/` prefix from an output path.
pub fn visible_path(output: &str) -> Option<&str> {
    output
        .strip_prefix(BUILD_ROOT_PATTERN)
        .map(|rest| rest.trim_start_matches('/'))
}

fn find_conflicts(graph: &DiGraph<Node, ()>, results: &[NodeIndex]) -> Vec<ConflictError> {
    let mut claims: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for &idx in results {
        let node = &graph[idx];
        let mut own = HashSet::new();
        for output in &node.outputs {
            if let Some(path) = visible_path(output)
                && own.insert(path)
            {
                claims.entry(path).or_default().push(node.uid.to_string());
            }
        }
    }

    claims
        .into_iter()
        .filter(|(_, uids)| uids.len() > 1)
        .map(|(path, uids)| ConflictError {
            path: path.to_string(),
            uids,
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn spec(uid: &str, deps: &[&str]) -> NodeSpec {
        NodeSpec {
            uid: uid.into(),
            cache: true,
            deps: deps.iter().map(|d| d.to_string()).collect(),
            outputs: vec![format!("$(BUILD_ROOT)/{uid}.out")],
            ..Default::default()
        }
    }

    fn desc(nodes: Vec<NodeSpec>, result: &[&str]) -> GraphDescriptor {
        GraphDescriptor {
            graph: nodes,
            result: result.iter().map(|r| r.to_string()).collect(),
            conf: GraphConf::default(),
        }
    }

    #[test]
    fn refcounts_count_consumers_and_results() {
        let graph = Graph::from_descriptor(desc(
            vec![spec("x", &[]), spec("a", &["x"]), spec("b", &["x"])],
            &["a", "b"],
        ))
        .unwrap();

        let x = graph.find("x").unwrap();
        let a = graph.find("a").unwrap();
        assert_eq!(graph.node(x).refcount, 2);
        assert_eq!(graph.node(a).refcount, 1);
        assert_eq!(graph.node(x).max_dist, 1);
        assert!(graph.node(a).is_result);
        assert!(!graph.node(x).is_result);
    }

    #[test]
    fn self_uid_collapses_nodes() {
        let mut x1 = spec("x1", &[]);
        x1.self_uid = Some("same".into());
        let mut x2 = spec("x2", &[]);
        x2.self_uid = Some("same".into());

        let graph = Graph::from_descriptor(desc(
            vec![x1, x2, spec("a", &["x1"]), spec("b", &["x2"])],
            &["a", "b"],
        ))
        .unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.find("x1"), graph.find("x2"));
        assert_eq!(graph.aliases().len(), 1);
        let x = graph.find("x1").unwrap();
        assert_eq!(graph.node(x).refcount, 2);
    }

    #[test]
    fn self_uid_ignored_for_uncacheable() {
        let mut x1 = spec("x1", &[]);
        x1.self_uid = Some("same".into());
        x1.cache = false;
        let mut x2 = spec("x2", &[]);
        x2.self_uid = Some("same".into());
        x2.cache = false;

        let graph = Graph::from_descriptor(desc(vec![x1, x2], &["x1", "x2"])).unwrap();
        assert_eq!(graph.len(), 2);
        assert!(graph.node(graph.find("x1").unwrap()).self_uid.is_none());
    }

    #[test]
    fn rejects_cycles_and_unknowns() {
        let err = Graph::from_descriptor(desc(vec![spec("a", &["b"]), spec("b", &["a"])], &["a"]))
            .unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));

        let err = Graph::from_descriptor(desc(vec![spec("a", &["zz"])], &["a"])).unwrap_err();
        assert!(matches!(err, GraphError::MissingDependency { .. }));

        let err = Graph::from_descriptor(desc(vec![spec("a", &[]), spec("a", &[])], &[]))
            .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateUid(_)));

        let err = Graph::from_descriptor(desc(vec![spec("a", &[])], &["q"])).unwrap_err();
        assert!(matches!(err, GraphError::UnknownResult(_)));
    }

    #[test]
    fn detects_output_conflicts_between_results() {
        let mut a = spec("a", &[]);
        a.outputs = vec!["$(BUILD_ROOT)/bin/tool".into()];
        let mut b = spec("b", &[]);
        b.outputs = vec!["$(BUILD_ROOT)/bin/tool".into()];

        let graph = Graph::from_descriptor(desc(vec![a, b], &["a", "b"])).unwrap();
        assert_eq!(graph.conflicts().len(), 1);
        assert_eq!(graph.conflicts()[0].path, "bin/tool");
        assert_eq!(graph.conflicts()[0].uids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn reachable_lists_dependencies_first() {
        let graph = Graph::from_descriptor(desc(
            vec![spec("c", &[]), spec("b", &["c"]), spec("a", &["b"]), spec("lone", &[])],
            &["a"],
        ))
        .unwrap();

        let order: Vec<_> = graph
            .reachable_from_results()
            .into_iter()
            .map(|i| graph.node(i).uid.to_string())
            .collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn parses_requirements() {
        let json = r#"{ "graph": [
            { "uid": "t", "requirements": { "cpu": "all", "network": "full", "test": true },
              "kv": { "p": "TS" }, "cmds": [{ "cmd_args": ["true"] }] }
        ], "result": ["t"] }"#;
        let desc: GraphDescriptor = serde_json::from_str(json).unwrap();
        let graph = Graph::from_descriptor(desc).unwrap();
        let node = graph.node(graph.find("t").unwrap());
        assert_eq!(node.requirements.cpu, CpuRequirement::Named(CpuNamed::All));
        assert_eq!(node.requirements.network, Network::Full);
        assert!(node.is_test());
        assert_eq!(node.kind(), "TS");
        assert!(node.cacheable);
    }
}
