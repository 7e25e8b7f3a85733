//! Module wrappers and the dotted-path registry.
//!
//! Instead of subclassing a framework module type, graft wraps an opaque
//! real-module capability ([`GraftModule`]) and stores path and trace
//! metadata alongside it. A [`ModuleTree`] is the explicit registry
//! (dotted path to wrapped module) that replaces duck-typed traversal:
//! it supports named-child enumeration, dotted-path lookup, and the
//! insert/remove operations structural edits need.

use std::collections::BTreeMap;

use candle_core::{DType, Tensor};

use crate::error::{GraftError, Result};

/// Opaque real-module capability: anything that can run forward over a
/// slice of tensor arguments. Optional named-parameter access backs
/// attribute nodes in graphs.
pub trait GraftModule {
    fn forward(&self, xs: &[Tensor]) -> Result<Tensor>;

    /// Fetch a named parameter tensor, if the module exposes one.
    fn param(&self, _name: &str) -> Option<Tensor> {
        None
    }
}

/// Identity pass-through module.
///
/// Inserting one of these at a path gives that point in the computation
/// independently hookable input and output sites; it is the module the
/// wrapper-insertion edit plants.
#[derive(Debug, Default)]
pub struct WrapperModule;

impl GraftModule for WrapperModule {
    fn forward(&self, xs: &[Tensor]) -> Result<Tensor> {
        match xs {
            [x] => Ok(x.clone()),
            _ => Err(candle_core::Error::msg(format!(
                "wrapper module expects exactly one input, got {}",
                xs.len()
            ))
            .into()),
        }
    }
}

/// Shape/dtype/invocation metadata inferred from the meta run.
#[derive(Debug, Clone, Default)]
pub struct ModuleMeta {
    /// Output shape observed on the degenerate pass.
    pub output_shape: Option<Vec<usize>>,
    /// Output dtype observed on the degenerate pass.
    pub output_dtype: Option<DType>,
    /// Invocations per forward pass observed on the degenerate pass.
    pub calls_per_pass: usize,
}

/// A registered module plus its trace metadata. Attached 1:1 to each
/// path and owned by the tree that contains it.
pub struct ModuleEntry {
    module: Box<dyn GraftModule>,
    pub meta: ModuleMeta,
}

impl ModuleEntry {
    pub fn module(&self) -> &dyn GraftModule {
        self.module.as_ref()
    }
}

/// Registry of wrapped modules keyed by dotted path.
#[derive(Default)]
pub struct ModuleTree {
    entries: BTreeMap<String, ModuleEntry>,
}

impl ModuleTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module at `path`.
    ///
    /// Dotted paths must hang off an existing parent; registering over an
    /// occupied path is refused (overlapping edits fail fast rather than
    /// silently replacing what a compiled plan already hooks).
    pub fn insert(&mut self, path: &str, module: Box<dyn GraftModule>) -> Result<()> {
        if self.entries.contains_key(path) {
            return Err(GraftError::AlreadyApplied(format!(
                "module path `{path}` is already occupied"
            )));
        }
        if let Some((parent, _)) = path.rsplit_once('.') {
            if !self.entries.contains_key(parent) {
                return Err(GraftError::UnresolvedDependency {
                    path: parent.to_string(),
                });
            }
        }
        self.entries.insert(
            path.to_string(),
            ModuleEntry {
                module,
                meta: ModuleMeta::default(),
            },
        );
        Ok(())
    }

    /// Remove the module at `path`, returning it.
    pub fn remove(&mut self, path: &str) -> Result<Box<dyn GraftModule>> {
        match self.entries.remove(path) {
            Some(entry) => Ok(entry.module),
            None => Err(GraftError::UnresolvedDependency {
                path: path.to_string(),
            }),
        }
    }

    /// Swap the implementation behind `path`, returning the original.
    /// Metadata stays in place. Scoped patching is built on this.
    pub(crate) fn replace_module(
        &mut self,
        path: &str,
        module: Box<dyn GraftModule>,
    ) -> Result<Box<dyn GraftModule>> {
        match self.entries.get_mut(path) {
            Some(entry) => Ok(std::mem::replace(&mut entry.module, module)),
            None => Err(GraftError::UnresolvedDependency {
                path: path.to_string(),
            }),
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<&ModuleEntry> {
        self.entries.get(path)
    }

    pub fn meta(&self, path: &str) -> Option<&ModuleMeta> {
        self.entries.get(path).map(|e| &e.meta)
    }

    pub fn meta_mut(&mut self, path: &str) -> Option<&mut ModuleMeta> {
        self.entries.get_mut(path).map(|e| &mut e.meta)
    }

    /// All registered paths, in lexicographic order.
    pub fn paths(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Immediate children of `path` (one extra dotted component).
    pub fn children(&self, path: &str) -> Vec<String> {
        let prefix = format!("{path}.");
        self.entries
            .keys()
            .filter(|p| {
                p.starts_with(&prefix) && !p[prefix.len()..].contains('.')
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run the module at `path` on `xs`.
    pub fn forward(&self, path: &str, xs: &[Tensor]) -> Result<Tensor> {
        match self.entries.get(path) {
            Some(entry) => entry.module.forward(xs),
            None => Err(GraftError::UnresolvedDependency {
                path: path.to_string(),
            }),
        }
    }

    /// Fetch a named parameter of the module at `path`.
    pub fn param(&self, path: &str, name: &str) -> Result<Tensor> {
        let entry = self
            .entries
            .get(path)
            .ok_or_else(|| GraftError::UnresolvedDependency {
                path: path.to_string(),
            })?;
        entry
            .module
            .param(name)
            .ok_or_else(|| GraftError::UnresolvedDependency {
                path: format!("{path}.{name}"),
            })
    }
}

impl std::fmt::Debug for ModuleTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleTree")
            .field("paths", &self.paths())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_insert_and_lookup() {
        let mut tree = ModuleTree::new();
        tree.insert("layers", Box::new(WrapperModule)).unwrap();
        tree.insert("layers.0", Box::new(WrapperModule)).unwrap();
        tree.insert("layers.1", Box::new(WrapperModule)).unwrap();
        assert!(tree.contains("layers.0"));
        assert_eq!(tree.children("layers"), vec!["layers.0", "layers.1"]);
    }

    #[test]
    fn test_insert_occupied_path_fails() {
        let mut tree = ModuleTree::new();
        tree.insert("m", Box::new(WrapperModule)).unwrap();
        let err = tree.insert("m", Box::new(WrapperModule)).unwrap_err();
        assert!(matches!(err, GraftError::AlreadyApplied(_)));
    }

    #[test]
    fn test_insert_without_parent_fails() {
        let mut tree = ModuleTree::new();
        let err = tree.insert("layers.0", Box::new(WrapperModule)).unwrap_err();
        assert!(matches!(err, GraftError::UnresolvedDependency { .. }));
    }

    #[test]
    fn test_wrapper_module_is_identity() {
        let tree = {
            let mut t = ModuleTree::new();
            t.insert("w", Box::new(WrapperModule)).unwrap();
            t
        };
        let x = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        let y = tree.forward("w", &[x.clone()]).unwrap();
        assert_eq!(y.dims(), x.dims());
    }

    #[test]
    fn test_wrapper_module_rejects_multiple_inputs() {
        let tree = {
            let mut t = ModuleTree::new();
            t.insert("w", Box::new(WrapperModule)).unwrap();
            t
        };
        let x = Tensor::ones((2,), DType::F32, &Device::Cpu).unwrap();
        let err = tree.forward("w", &[x.clone(), x]).unwrap_err();
        assert!(matches!(err, GraftError::Tensor(_)));
    }

    #[test]
    fn test_forward_on_missing_path_fails() {
        let tree = ModuleTree::new();
        let x = Tensor::zeros((1,), DType::F32, &Device::Cpu).unwrap();
        let err = tree.forward("ghost", &[x]).unwrap_err();
        assert!(matches!(err, GraftError::UnresolvedDependency { .. }));
    }
}
