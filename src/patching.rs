//! Scoped module substitution for trace-time kernel stand-ins.
//!
//! Some kernels cannot run meaningfully on degenerate data (data-dependent
//! recurrences, device-only ops). During the meta trace those modules are
//! swapped for shape-correct stand-ins; the substitution is a reversible
//! table applied on entry and restored on every exit path, never ambient
//! global mutation.

use tracing::debug;

use crate::error::Result;
use crate::module::{GraftModule, ModuleTree};

/// One substitution: replace the module at `path` for the scope's
/// duration.
pub struct Patch {
    path: String,
    module: Box<dyn GraftModule>,
}

impl Patch {
    pub fn new(path: impl Into<String>, module: Box<dyn GraftModule>) -> Self {
        Self {
            path: path.into(),
            module,
        }
    }
}

/// Ordered set of patches with scoped lifetime.
#[derive(Default)]
pub struct Patcher {
    patches: Vec<Patch>,
}

impl Patcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, patch: Patch) {
        self.patches.push(patch);
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Apply every patch to `tree`, run `f`, then restore the original
    /// modules in reverse order. Originals are restored whether `f`
    /// succeeds or fails; a patch targeting a missing path fails before
    /// `f` runs and rolls back any patches already applied.
    pub fn scope<T>(
        self,
        tree: &mut ModuleTree,
        f: impl FnOnce(&ModuleTree) -> Result<T>,
    ) -> Result<T> {
        let mut originals: Vec<(String, Box<dyn GraftModule>)> = Vec::new();
        for patch in self.patches {
            debug!(path = %patch.path, "installing trace patch");
            match tree.replace_module(&patch.path, patch.module) {
                Ok(original) => originals.push((patch.path, original)),
                Err(e) => {
                    Self::restore(tree, originals);
                    return Err(e);
                }
            }
        }
        let result = f(&*tree);
        Self::restore(tree, originals);
        result
    }

    fn restore(tree: &mut ModuleTree, originals: Vec<(String, Box<dyn GraftModule>)>) {
        for (path, original) in originals.into_iter().rev() {
            debug!(path = %path, "restoring patched module");
            // The entry existed when the patch went in; replace cannot
            // fail unless the tree was structurally mutated mid-scope,
            // which the borrow rules rule out.
            let _ = tree.replace_module(&path, original);
        }
    }
}
