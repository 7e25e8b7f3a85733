//! Meta tracing: one degenerate pass that builds the symbolic graph.
//!
//! The trace runs the adapter's real forward driver once over a dummy
//! input, with module dispatch redirected through [`TraceContext`]: each
//! invocation is recorded as a `CallModule` node and executed on the
//! degenerate data so shape-dependent branching downstream still works.
//! Kernels that cannot run degenerately are swapped for stand-ins via the
//! adapter's trace patches, restored when the trace ends.
//!
//! Output: a populated [`Graph`] plus per-path shape/dtype metadata and
//! invocation counts, written back onto the module tree.

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Tensor, TensorId};
use tracing::{debug, info};

use crate::error::{GraftError, Result};
use crate::graph::{Arg, ArgumentKey, Graph, HookSite, NodeId, OpKind};
use crate::model::{ForwardContext, ModelAdapter, RunMode};
use crate::module::ModuleTree;

/// Everything one meta run learns about a model.
pub struct TraceRecord {
    /// Symbolic graph of the traced forward pass.
    pub graph: Graph,
    /// Invocations per forward pass, per module path.
    pub calls_per_pass: BTreeMap<String, usize>,
    /// Output shape and dtype per module path.
    pub shapes: BTreeMap<String, (Vec<usize>, DType)>,
}

/// Forward context that records instead of intercepting.
///
/// Dataflow between recorded calls is tracked by tensor identity: a
/// tensor produced by a traced call links the consuming node to the
/// producing one; a tensor the driver made itself (the model input,
/// initial recurrent state) appears as an argument node awaiting runtime
/// injection at the consumer's input site.
pub struct TraceContext<'a> {
    tree: &'a ModuleTree,
    graph: Graph,
    producers: HashMap<TensorId, NodeId>,
    counts: BTreeMap<String, usize>,
    shapes: BTreeMap<String, (Vec<usize>, DType)>,
}

impl<'a> TraceContext<'a> {
    pub fn new(tree: &'a ModuleTree) -> Self {
        Self {
            tree,
            graph: Graph::new(),
            producers: HashMap::new(),
            counts: BTreeMap::new(),
            shapes: BTreeMap::new(),
        }
    }

    pub fn finish(self) -> TraceRecord {
        TraceRecord {
            graph: self.graph,
            calls_per_pass: self.counts,
            shapes: self.shapes,
        }
    }
}

impl ForwardContext for TraceContext<'_> {
    fn call(&mut self, path: &str, xs: &[Tensor]) -> Result<Tensor> {
        let occurrence = self.counts.get(path).copied().unwrap_or(0);

        // Link arguments to their producing nodes where known; the
        // primary input otherwise becomes a runtime-injection point.
        let mut args = Vec::with_capacity(xs.len());
        for (idx, x) in xs.iter().enumerate() {
            if let Some(id) = self.producers.get(&x.id()) {
                args.push(Arg::Node(*id));
            } else if idx == 0 {
                let input = self.graph.argument(ArgumentKey::new(
                    path.to_string(),
                    HookSite::Input,
                    occurrence,
                    self.graph.step(),
                ))?;
                args.push(Arg::Node(input.node_id()));
            }
        }

        let out = self.tree.forward(path, xs)?;
        self.shapes
            .entry(path.to_string())
            .or_insert_with(|| (out.dims().to_vec(), out.dtype()));
        *self.counts.entry(path.to_string()).or_insert(0) += 1;

        let proxy = self.graph.create_node(
            OpKind::CallModule {
                path: path.to_string(),
            },
            path,
            args,
        )?;
        self.producers.insert(out.id(), proxy.node_id());
        debug!(node = %proxy.name(), "traced module call");
        Ok(out)
    }

    fn advance_step(&mut self) -> Result<()> {
        // The meta run is a single pass; a driver that advances here is
        // traced across its passes like any other.
        self.graph.increment();
        self.counts.clear();
        Ok(())
    }
}

/// Run the meta trace for `adapter` over `tree`, with the adapter's
/// kernel stand-ins patched in for the duration.
///
/// Writes observed shapes and call counts into the tree's metadata and
/// fails with [`GraftError::Tracing`] if the degenerate pass dies or
/// records no structure.
pub fn trace<A: ModelAdapter + ?Sized>(adapter: &A, tree: &mut ModuleTree) -> Result<TraceRecord> {
    let dummy = adapter.dummy_input()?;
    let patcher = adapter.trace_patches()?;

    let record = patcher.scope(tree, |tree| {
        let mut ctx = TraceContext::new(tree);
        adapter
            .forward(tree, &dummy, RunMode::Inference, &mut ctx)
            .map_err(|e| GraftError::Tracing(e.to_string()))?;
        Ok(ctx.finish())
    })?;

    if record.graph.is_empty() {
        return Err(GraftError::Tracing(
            "meta run recorded no module calls".to_string(),
        ));
    }

    for (path, count) in &record.calls_per_pass {
        if let Some(meta) = tree.meta_mut(path) {
            meta.calls_per_pass = *count;
        }
    }
    for (path, (shape, dtype)) in &record.shapes {
        if let Some(meta) = tree.meta_mut(path) {
            meta.output_shape = Some(shape.clone());
            meta.output_dtype = Some(*dtype);
        }
    }

    info!(
        nodes = record.graph.len(),
        modules = record.calls_per_pass.len(),
        "meta trace complete"
    );
    Ok(record)
}
