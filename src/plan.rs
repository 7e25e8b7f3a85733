//! Graph compilation: from intervention graph to hook plan.
//!
//! Walks the graph's argument-node table and module-call targets to find
//! the minimal set of concrete-model paths that must be intercepted, and
//! validates every referenced path against the concrete model before any
//! real computation runs. A path the model lacks (say, after a botched
//! edit revert) fails here with an unresolved-dependency error.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::{GraftError, Result};
use crate::graph::{Graph, OpKind};
use crate::module::ModuleTree;
use crate::trace::TraceRecord;

/// The set of module paths to intercept, with invocation bounds for
/// paths the graph itself drives.
#[derive(Debug, Default)]
pub struct HookPlan {
    paths: BTreeSet<String>,
    /// Per-pass invocation limits for graph-invoked paths (spliced
    /// wrappers). Driver-traced paths carry no limit; their extra
    /// invocations pass through unbound.
    limits: BTreeMap<String, usize>,
}

impl HookPlan {
    /// Paths the session must intercept, in order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn is_hooked(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    /// Per-pass invocation limit, for paths only the graph may invoke.
    pub fn limit(&self, path: &str) -> Option<usize> {
        self.limits.get(path).copied()
    }
}

/// Compile `graph` against a concrete model.
///
/// Every path named by an argument node, module call, or attribute fetch
/// must exist in `tree`; the first missing one aborts compilation with
/// [`GraftError::UnresolvedDependency`]. `trace` supplies which paths the
/// real driver invokes on its own; paths absent from the trace are
/// graph-driven and get strict invocation limits.
pub fn compile(graph: &Graph, trace: &TraceRecord, tree: &ModuleTree) -> Result<HookPlan> {
    let mut plan = HookPlan::default();
    let mut graph_calls: BTreeMap<String, usize> = BTreeMap::new();

    for (key, _) in graph.argument_node_names() {
        if !tree.contains(&key.path) {
            return Err(GraftError::UnresolvedDependency { path: key.path });
        }
        plan.paths.insert(key.path);
    }

    for idx in 0..graph.len() {
        let node = graph
            .node(crate::graph::NodeId(idx))
            .ok_or_else(|| GraftError::Tracing("graph shrank during compile".to_string()))?;
        match &node.op {
            OpKind::CallModule { path } => {
                if !tree.contains(path) {
                    return Err(GraftError::UnresolvedDependency { path: path.clone() });
                }
                plan.paths.insert(path.clone());
                *graph_calls.entry(path.clone()).or_insert(0) += 1;
            }
            OpKind::GetAttr { path, .. } => {
                if !tree.contains(path) {
                    return Err(GraftError::UnresolvedDependency { path: path.clone() });
                }
            }
            _ => {}
        }
    }

    // A path the meta trace never saw is reachable only through graph
    // evaluation; firings beyond its call nodes are a hook mismatch.
    for (path, count) in graph_calls {
        if !trace.calls_per_pass.contains_key(&path) {
            plan.limits.insert(path, count);
        }
    }

    debug!(hooked = plan.len(), "compiled hook plan");
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ArgumentKey, HookSite};
    use crate::model::test_support::ToyAdapter;
    use crate::model::ModelAdapter;
    use crate::trace::trace;

    fn traced_toy(n_layers: usize) -> (ToyAdapter, crate::module::ModuleTree, TraceRecord) {
        let adapter = ToyAdapter::new(n_layers);
        let mut tree = adapter.load_meta().unwrap();
        let record = trace(&adapter, &mut tree).unwrap();
        (adapter, tree, record)
    }

    #[test]
    fn test_plan_names_exactly_the_referenced_layers() {
        let (_, tree, record) = traced_toy(2);
        let g = Graph::new();
        g.module_proxy("layers.0").output().unwrap();
        g.module_proxy("layers.1").output().unwrap();

        let plan = compile(&g, &record, &tree).unwrap();
        assert_eq!(plan.len(), 2);
        let paths: Vec<_> = plan.paths().collect();
        assert_eq!(paths, vec!["layers.0", "layers.1"]);
    }

    #[test]
    fn test_missing_path_is_unresolved_dependency() {
        let (_, tree, record) = traced_toy(2);
        let g = Graph::new();
        g.module_proxy("layers.7").output().unwrap();

        let err = compile(&g, &record, &tree).unwrap_err();
        match err {
            GraftError::UnresolvedDependency { path } => assert_eq!(path, "layers.7"),
            other => panic!("expected UnresolvedDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_graph_invoked_paths_get_limits() {
        let (_, mut tree, record) = traced_toy(2);
        tree.insert("layers.1.hook", Box::new(crate::module::WrapperModule))
            .unwrap();

        let g = Graph::new();
        let out = g
            .argument(ArgumentKey::new("layers.1", HookSite::Output, 0, 0))
            .unwrap();
        g.module_proxy("layers.1.hook").call(&[&out]).unwrap();

        let plan = compile(&g, &record, &tree).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.limit("layers.1.hook"), Some(1));
        assert_eq!(plan.limit("layers.1"), None);
    }
}
