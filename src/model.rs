//! Model facade: lifecycle, run entry points, and the adapter contract.
//!
//! A [`GraftModel`] owns two copies of one architecture: a degenerate
//! meta copy traced once at construction, and the real local copy loaded
//! lazily on first run. Architecture specifics live behind
//! [`ModelAdapter`]; the facade contributes the lifecycle:
//!
//! ```text
//! UNLOADED -> META-TRACED -> (DISPATCHED <-> EDITED)
//! ```
//!
//! Construction runs the meta trace. The first real run dispatches the
//! local model. Around every run the queued edits are applied on entry
//! and reverted on exit — also on failure — so a failed run leaves the
//! model in its pre-run state and repeated attempts are safe.

use candle_core::Tensor;
use tracing::{debug, info};

use crate::edit::{self, Edit, GraphEdit, WrapperModuleEdit};
use crate::engine::Session;
use crate::error::{GraftError, Result};
use crate::graph::Graph;
use crate::module::ModuleTree;
use crate::patching::Patcher;
use crate::plan;
use crate::trace::{self, TraceRecord};

/// Whether a run executes in inference or training mode. The adapter
/// decides what training means for its architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Inference,
    Training,
}

/// Which driver a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    /// One forward pass.
    Forward,
    /// The adapter's generation loop; one step-counter advance per pass.
    Generate { max_new_tokens: usize },
}

/// Dispatch seam between an adapter's forward driver and the engine.
///
/// During tracing the context records module calls; during real runs it
/// intercepts them. Drivers route *every* module invocation through
/// [`call`] and advance the step counter exactly once per completed
/// forward pass via [`advance_step`] — the explicit replacement for a
/// framework-level increment hook.
///
/// [`call`]: ForwardContext::call
/// [`advance_step`]: ForwardContext::advance_step
pub trait ForwardContext {
    fn call(&mut self, path: &str, xs: &[Tensor]) -> Result<Tensor>;
    fn advance_step(&mut self) -> Result<()>;
}

/// What the core requires from each architecture-specific collaborator.
///
/// Implementations know how to build the module registry for their
/// architecture (twice: degenerate and real), how to turn raw token ids
/// into framework inputs, and how to drive a forward pass or generation
/// loop through a [`ForwardContext`].
pub trait ModelAdapter {
    /// Build the degenerate (shape-only) module tree.
    fn load_meta(&self) -> Result<ModuleTree>;

    /// Build the real module tree with weights.
    fn load_local(&self) -> Result<ModuleTree>;

    /// Convert raw token ids into a framework input tensor.
    fn prepare_inputs(&self, raw: &[u32]) -> Result<Tensor>;

    /// Minimal shape/dtype-correct input for the meta trace.
    fn dummy_input(&self) -> Result<Tensor> {
        self.prepare_inputs(&[0])
    }

    /// Kernel stand-ins to patch in for the duration of the trace.
    fn trace_patches(&self) -> Result<Patcher> {
        Ok(Patcher::new())
    }

    /// One full forward pass, dispatching every module through `ctx`.
    fn forward(
        &self,
        tree: &ModuleTree,
        input: &Tensor,
        mode: RunMode,
        ctx: &mut dyn ForwardContext,
    ) -> Result<Tensor>;

    /// Multi-pass generation; must call `ctx.advance_step()` once per
    /// completed pass. Non-generative architectures keep the default.
    fn generate(
        &self,
        tree: &ModuleTree,
        input: &Tensor,
        max_new_tokens: usize,
        mode: RunMode,
        ctx: &mut dyn ForwardContext,
    ) -> Result<Tensor> {
        let _ = max_new_tokens;
        self.forward(tree, input, mode, ctx)
    }
}

/// A model with graft's interception machinery attached.
pub struct GraftModel<A: ModelAdapter> {
    adapter: A,
    meta: ModuleTree,
    trace: TraceRecord,
    local: Option<ModuleTree>,
    edits: Vec<Edit>,
}

impl<A: ModelAdapter> GraftModel<A> {
    /// Build the meta copy and trace it. The local model is not loaded
    /// until the first real run.
    pub fn new(adapter: A) -> Result<Self> {
        let mut meta = adapter.load_meta()?;
        info!("tracing meta model");
        let trace = trace::trace(&adapter, &mut meta)?;
        Ok(Self {
            adapter,
            meta,
            trace,
            local: None,
            edits: Vec::new(),
        })
    }

    /// A fresh intervention graph to build a run against.
    pub fn graph(&self) -> Graph {
        Graph::new()
    }

    /// The meta-side module registry.
    pub fn meta(&self) -> &ModuleTree {
        &self.meta
    }

    /// What the meta run learned: symbolic graph, shapes, call counts.
    pub fn trace(&self) -> &TraceRecord {
        &self.trace
    }

    /// Whether the local model has been loaded yet.
    pub fn is_dispatched(&self) -> bool {
        self.local.is_some()
    }

    /// Edits queued to be applied around every run, in order.
    pub fn edits(&self) -> &[Edit] {
        &self.edits
    }

    /// Insert an identity wrapper under `host_path` so the data flowing
    /// out of it becomes independently hookable.
    ///
    /// The wrapper is planted on the meta side immediately; a matching
    /// wrapper insertion and graph splice are queued so every subsequent
    /// run mirrors the structure onto the local model and routes the
    /// host's output through the wrapper.
    pub fn modulize(&mut self, host_path: &str, name: &str) -> Result<()> {
        if !self.meta.contains(host_path) {
            return Err(GraftError::UnresolvedDependency {
                path: host_path.to_string(),
            });
        }
        let wrapper_edit = WrapperModuleEdit::new(host_path, name);
        let wrapper_path = wrapper_edit.wrapper_path();

        let mut meta_side = Edit::WrapperModule(wrapper_edit.clone());
        meta_side.apply(&mut self.meta, &self.trace.graph)?;

        self.edits.push(Edit::WrapperModule(wrapper_edit));
        self.edits
            .push(Edit::Graph(GraphEdit::new(host_path, wrapper_path.clone())));
        info!(host = host_path, wrapper = %wrapper_path, "queued modulize edits");
        Ok(())
    }

    /// Run one forward pass in inference mode.
    pub fn forward(&mut self, graph: &Graph, raw: &[u32]) -> Result<Tensor> {
        self.execute(graph, raw, RunMode::Inference, PassKind::Forward)
    }

    /// Run one forward pass in training mode.
    pub fn forward_train(&mut self, graph: &Graph, raw: &[u32]) -> Result<Tensor> {
        self.execute(graph, raw, RunMode::Training, PassKind::Forward)
    }

    /// Run the adapter's generation loop in inference mode.
    pub fn generate(
        &mut self,
        graph: &Graph,
        raw: &[u32],
        max_new_tokens: usize,
    ) -> Result<Tensor> {
        self.execute(
            graph,
            raw,
            RunMode::Inference,
            PassKind::Generate { max_new_tokens },
        )
    }

    /// Fully general run entry.
    pub fn run(
        &mut self,
        graph: &Graph,
        raw: &[u32],
        mode: RunMode,
        pass: PassKind,
    ) -> Result<Tensor> {
        self.execute(graph, raw, mode, pass)
    }

    fn execute(
        &mut self,
        graph: &Graph,
        raw: &[u32],
        mode: RunMode,
        pass: PassKind,
    ) -> Result<Tensor> {
        if self.local.is_none() {
            info!("dispatching local model");
            self.local = Some(self.adapter.load_local()?);
        }
        let Self {
            adapter,
            trace,
            local,
            edits,
            ..
        } = self;
        let local = local.as_mut().ok_or_else(|| {
            GraftError::Tracing("local model missing after dispatch".to_string())
        })?;

        edit::apply_edits(edits, local, graph)?;
        let result = Self::run_inner(adapter, trace, local, graph, raw, mode, pass);
        let reverted = edit::revert_edits(edits, local, graph);
        match (result, reverted) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
            (Ok(out), Ok(())) => Ok(out),
        }
    }

    fn run_inner(
        adapter: &A,
        trace: &TraceRecord,
        local: &ModuleTree,
        graph: &Graph,
        raw: &[u32],
        mode: RunMode,
        pass: PassKind,
    ) -> Result<Tensor> {
        // Compilation failures surface before any real computation runs.
        let hook_plan = plan::compile(graph, trace, local)?;
        let input = adapter.prepare_inputs(raw)?;
        graph.reset_step();

        let mut session = Session::new(graph.clone(), &hook_plan, local);
        session.start()?;
        debug!(?mode, ?pass, hooked = hook_plan.len(), "running local model");
        let out = match pass {
            PassKind::Forward => adapter.forward(local, &input, mode, &mut session)?,
            PassKind::Generate { max_new_tokens } => {
                adapter.generate(local, &input, max_new_tokens, mode, &mut session)?
            }
        };
        session.finish()?;
        debug!("run complete");
        Ok(out)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::ToyAdapter;
    use super::*;

    #[test]
    fn test_model_traces_at_construction_and_dispatches_lazily() {
        let model = GraftModel::new(ToyAdapter::new(2)).unwrap();
        assert!(!model.is_dispatched());
        assert_eq!(model.trace().calls_per_pass.len(), 2);
    }

    #[test]
    fn test_forward_resolves_saves() {
        let mut model = GraftModel::new(ToyAdapter::new(2)).unwrap();
        let g = model.graph();
        let saved = g.module_proxy("layers.1").output().unwrap().save();

        let out = model.forward(&g, &[1, 2]).unwrap();
        assert!(model.is_dispatched());
        // 1,2 -> x2 -> x3
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![6.0, 12.0]);
        assert_eq!(
            saved.get().unwrap().to_vec1::<f32>().unwrap(),
            vec![6.0, 12.0]
        );
    }

    #[test]
    fn test_generation_steps_bind_distinct_passes() {
        let mut model = GraftModel::new(ToyAdapter::new(1)).unwrap();
        let g = model.graph();
        let step0 = g.module_proxy("layers.0").output().unwrap().save();
        let step1 = g.module_proxy("layers.0").step(1).output().unwrap().save();

        model.generate(&g, &[1], 2).unwrap();
        // Pass 0 doubles 1 -> 2; pass 1 doubles 2 -> 4.
        assert_eq!(step0.get().unwrap().to_vec1::<f32>().unwrap(), vec![2.0]);
        assert_eq!(step1.get().unwrap().to_vec1::<f32>().unwrap(), vec![4.0]);
    }

    #[test]
    fn test_failed_run_leaves_model_reusable() {
        let mut model = GraftModel::new(ToyAdapter::new(2)).unwrap();
        model.modulize("layers.1", "hook").unwrap();

        let bad = model.graph();
        bad.module_proxy("layers.9").output().unwrap();
        let err = model.forward(&bad, &[1]).unwrap_err();
        assert!(matches!(err, GraftError::UnresolvedDependency { .. }));

        // Edits were reverted; a clean run still works and edits reapply.
        let g = model.graph();
        let saved = g.module_proxy("layers.1.hook").output().unwrap().save();
        let out = model.forward(&g, &[1]).unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![6.0]);
        assert_eq!(saved.get().unwrap().to_vec1::<f32>().unwrap(), vec![6.0]);
    }

    #[test]
    fn test_modulize_mirrors_meta_side() {
        let mut model = GraftModel::new(ToyAdapter::new(2)).unwrap();
        model.modulize("layers.1", "hook").unwrap();
        assert!(model.meta().contains("layers.1.hook"));
        assert_eq!(model.edits().len(), 2);
        // Wrapper inherited the host's traced output shape.
        let meta = model.meta().meta("layers.1.hook").unwrap();
        assert_eq!(meta.output_shape.as_deref(), Some(&[1usize][..]));
    }

    #[test]
    fn test_modulize_missing_host_fails() {
        let mut model = GraftModel::new(ToyAdapter::new(2)).unwrap();
        let err = model.modulize("layers.9", "hook").unwrap_err();
        assert!(matches!(err, GraftError::UnresolvedDependency { .. }));
    }
}
