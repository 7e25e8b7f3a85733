//! Structural edits: inserting modules and rerouting graph data.
//!
//! An edit describes a structural mutation applied identically to the
//! meta and local sides of a model. Two kinds exist:
//!
//! - [`WrapperModuleEdit`] plants an identity [`WrapperModule`] at a
//!   dotted path, making that point independently hookable.
//! - [`GraphEdit`] splices nodes into a graph so the host module's
//!   output is routed through the planted wrapper, preserving every
//!   prior node reference.
//!
//! Edits are ordered; around each run they are applied on entry and
//! reverted on exit, on success and failure alike. Re-applying without a
//! revert fails rather than silently double-inserting.

use tracing::debug;

use crate::error::{GraftError, Result};
use crate::graph::Graph;
use crate::module::{ModuleTree, WrapperModule};

/// Insert an identity wrapper submodule under an existing module.
#[derive(Debug, Clone)]
pub struct WrapperModuleEdit {
    parent: String,
    name: String,
}

impl WrapperModuleEdit {
    pub fn new(parent: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            name: name.into(),
        }
    }

    /// Dotted path of the planted wrapper.
    pub fn wrapper_path(&self) -> String {
        format!("{}.{}", self.parent, self.name)
    }

    fn apply(&self, tree: &mut ModuleTree) -> Result<()> {
        let path = self.wrapper_path();
        tree.insert(&path, Box::new(WrapperModule))?;
        // The wrapper passes its input through, so it inherits the
        // host's observed output shape.
        let host_meta = tree.meta(&self.parent).cloned();
        if let (Some(host), Some(meta)) = (host_meta, tree.meta_mut(&path)) {
            meta.output_shape = host.output_shape;
            meta.output_dtype = host.output_dtype;
        }
        debug!(path = %path, "inserted wrapper module");
        Ok(())
    }

    fn revert(&self, tree: &mut ModuleTree) -> Result<()> {
        let path = self.wrapper_path();
        tree.remove(&path).map_err(|_| {
            GraftError::AlreadyApplied(format!("wrapper edit at `{path}` is not applied"))
        })?;
        debug!(path = %path, "removed wrapper module");
        Ok(())
    }
}

/// Splice nodes routing a host module's output through a wrapper.
///
/// Application appends an argument node for the host's output (step 0,
/// occurrence 0 — the convention the planted wrapper services) and a
/// call node invoking the wrapper on it. Revert truncates the splice;
/// edits revert in reverse application order, so the spliced tail is
/// always this edit's own.
#[derive(Debug, Clone)]
pub struct GraphEdit {
    host: String,
    wrapper: String,
    /// Node-count watermark taken at application, for revert.
    applied_at: Option<usize>,
}

impl GraphEdit {
    pub fn new(host: impl Into<String>, wrapper: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            wrapper: wrapper.into(),
            applied_at: None,
        }
    }

    fn apply(&mut self, graph: &Graph) -> Result<()> {
        if self.applied_at.is_some() {
            return Err(GraftError::AlreadyApplied(format!(
                "graph edit routing `{}` through `{}` is already applied",
                self.host, self.wrapper
            )));
        }
        let watermark = graph.len();
        let host_out = graph.module_proxy(&self.host).output()?;
        graph.module_proxy(&self.wrapper).call(&[&host_out])?;
        self.applied_at = Some(watermark);
        debug!(host = %self.host, wrapper = %self.wrapper, "spliced graph routing");
        Ok(())
    }

    fn revert(&mut self, graph: &Graph) -> Result<()> {
        match self.applied_at.take() {
            Some(watermark) => {
                graph.truncate(watermark);
                debug!(host = %self.host, wrapper = %self.wrapper, "reverted graph routing");
                Ok(())
            }
            None => Err(GraftError::AlreadyApplied(format!(
                "graph edit routing `{}` through `{}` is not applied",
                self.host, self.wrapper
            ))),
        }
    }
}

/// A structural mutation applicable to a module tree and a graph.
#[derive(Debug, Clone)]
pub enum Edit {
    WrapperModule(WrapperModuleEdit),
    Graph(GraphEdit),
}

impl Edit {
    /// Carry out the edit. Not idempotent: re-applying without a revert
    /// fails with [`GraftError::AlreadyApplied`].
    pub fn apply(&mut self, tree: &mut ModuleTree, graph: &Graph) -> Result<()> {
        match self {
            Self::WrapperModule(edit) => edit.apply(tree),
            Self::Graph(edit) => edit.apply(graph),
        }
    }

    /// Undo the edit, restoring the pre-edit module topology and node
    /// set exactly.
    pub fn revert(&mut self, tree: &mut ModuleTree, graph: &Graph) -> Result<()> {
        match self {
            Self::WrapperModule(edit) => edit.revert(tree),
            Self::Graph(edit) => edit.revert(graph),
        }
    }
}

/// Apply `edits` in order; on any failure, revert those already applied
/// (in reverse) before returning the error.
pub(crate) fn apply_edits(edits: &mut [Edit], tree: &mut ModuleTree, graph: &Graph) -> Result<()> {
    for i in 0..edits.len() {
        if let Err(e) = edits[i].apply(tree, graph) {
            for edit in edits[..i].iter_mut().rev() {
                if let Err(revert_err) = edit.revert(tree, graph) {
                    tracing::error!(error = %revert_err, "failed to roll back edit");
                }
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Revert `edits` in reverse order. Keeps going past individual
/// failures so every edit gets its chance to unwind; the first failure
/// is reported.
pub(crate) fn revert_edits(edits: &mut [Edit], tree: &mut ModuleTree, graph: &Graph) -> Result<()> {
    let mut first_err = None;
    for edit in edits.iter_mut().rev() {
        if let Err(e) = edit.revert(tree, graph) {
            tracing::error!(error = %e, "failed to revert edit");
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ArgumentKey, HookSite};
    use crate::module::WrapperModule as Wrapper;

    fn tree_with_layer() -> ModuleTree {
        let mut tree = ModuleTree::new();
        tree.insert("layers", Box::new(Wrapper)).unwrap();
        tree.insert("layers.1", Box::new(Wrapper)).unwrap();
        tree
    }

    #[test]
    fn test_wrapper_edit_round_trip_restores_topology() {
        let mut tree = tree_with_layer();
        let graph = Graph::new();
        let before = tree.paths();

        let mut edit = Edit::WrapperModule(WrapperModuleEdit::new("layers.1", "hook"));
        edit.apply(&mut tree, &graph).unwrap();
        assert!(tree.contains("layers.1.hook"));

        edit.revert(&mut tree, &graph).unwrap();
        assert_eq!(tree.paths(), before);
    }

    #[test]
    fn test_wrapper_edit_reapply_fails() {
        let mut tree = tree_with_layer();
        let graph = Graph::new();
        let mut edit = Edit::WrapperModule(WrapperModuleEdit::new("layers.1", "hook"));
        edit.apply(&mut tree, &graph).unwrap();
        let err = edit.apply(&mut tree, &graph).unwrap_err();
        assert!(matches!(err, GraftError::AlreadyApplied(_)));
    }

    #[test]
    fn test_graph_edit_round_trip_restores_node_set() {
        let mut tree = tree_with_layer();
        let graph = Graph::new();
        // A user node that predates the edit and must survive revert.
        graph
            .argument(ArgumentKey::new("layers.1", HookSite::Output, 0, 0))
            .unwrap();
        let before = graph.node_names();

        let mut edit = Edit::Graph(GraphEdit::new("layers.1", "layers.1.hook"));
        edit.apply(&mut tree, &graph).unwrap();
        assert!(graph.node_names().contains(&"layers.1.hook_0".to_string()));

        edit.revert(&mut tree, &graph).unwrap();
        assert_eq!(graph.node_names(), before);
    }

    #[test]
    fn test_graph_edit_revert_without_apply_fails() {
        let mut tree = tree_with_layer();
        let graph = Graph::new();
        let mut edit = Edit::Graph(GraphEdit::new("layers.1", "layers.1.hook"));
        let err = edit.revert(&mut tree, &graph).unwrap_err();
        assert!(matches!(err, GraftError::AlreadyApplied(_)));
    }

    #[test]
    fn test_failed_apply_rolls_back_earlier_edits() {
        let mut tree = tree_with_layer();
        let graph = Graph::new();
        let before = tree.paths();

        let mut edits = vec![
            Edit::WrapperModule(WrapperModuleEdit::new("layers.1", "hook")),
            // No such parent: this one fails.
            Edit::WrapperModule(WrapperModuleEdit::new("layers.9", "hook")),
        ];
        let err = apply_edits(&mut edits, &mut tree, &graph).unwrap_err();
        assert!(matches!(err, GraftError::UnresolvedDependency { .. }));
        assert_eq!(tree.paths(), before);
    }

    #[test]
    fn test_ordered_apply_and_revert() {
        let mut tree = tree_with_layer();
        let graph = Graph::new();
        let before_paths = tree.paths();
        let before_nodes = graph.node_names();

        let mut edits = vec![
            Edit::WrapperModule(WrapperModuleEdit::new("layers.1", "hook")),
            Edit::Graph(GraphEdit::new("layers.1", "layers.1.hook")),
        ];
        apply_edits(&mut edits, &mut tree, &graph).unwrap();
        assert!(tree.contains("layers.1.hook"));
        assert!(!graph.is_empty());

        revert_edits(&mut edits, &mut tree, &graph).unwrap();
        assert_eq!(tree.paths(), before_paths);
        assert_eq!(graph.node_names(), before_nodes);
    }
}
