//! Integration tests for graft-rs
//!
//! Exercises the full pipeline through the public API: meta trace at
//! construction, graph building against traced paths, compilation, and
//! real runs with saves, swaps, structural edits, and generation.

use candle_core::{Device, Tensor};
use graft_rs::{
    ForwardContext, GraftError, GraftModel, GraftModule, ModelAdapter, ModuleTree, RunMode,
    SsmAdapter, SsmConfig, WrapperModule,
};

/// Route library logs to the test harness; safe to call from every test.
fn init_logs() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Multiplies its single input by a constant; exposes it as `scale`.
struct Scale(f32);

impl GraftModule for Scale {
    fn forward(&self, xs: &[Tensor]) -> graft_rs::Result<Tensor> {
        let [x] = xs else {
            return Err(candle_core::Error::msg(format!(
                "scale expects exactly one input, got {}",
                xs.len()
            ))
            .into());
        };
        Ok(x.affine(f64::from(self.0), 0.0)?)
    }

    fn param(&self, name: &str) -> Option<Tensor> {
        if name == "scale" {
            Tensor::from_vec(vec![self.0], (1,), &Device::Cpu).ok()
        } else {
            None
        }
    }
}

/// Two sequential layers: layer 0 doubles, layer 1 triples.
struct TinyAdapter;

impl ModelAdapter for TinyAdapter {
    fn load_meta(&self) -> graft_rs::Result<ModuleTree> {
        self.load_local()
    }

    fn load_local(&self) -> graft_rs::Result<ModuleTree> {
        let mut tree = ModuleTree::new();
        tree.insert("layers", Box::new(WrapperModule))?;
        tree.insert("layers.0", Box::new(Scale(2.0)))?;
        tree.insert("layers.1", Box::new(Scale(3.0)))?;
        Ok(tree)
    }

    fn prepare_inputs(&self, raw: &[u32]) -> graft_rs::Result<Tensor> {
        let vals: Vec<f32> = raw.iter().map(|&t| t as f32).collect();
        Ok(Tensor::from_vec(vals, (raw.len(),), &Device::Cpu)?)
    }

    fn forward(
        &self,
        _tree: &ModuleTree,
        input: &Tensor,
        _mode: RunMode,
        ctx: &mut dyn ForwardContext,
    ) -> graft_rs::Result<Tensor> {
        let x = ctx.call("layers.0", &[input.clone()])?;
        ctx.call("layers.1", &[x])
    }
}

/// Construction traces the meta model without touching real weights
#[test]
fn test_construction_traces_without_dispatch() {
    let model = GraftModel::new(TinyAdapter).unwrap();
    assert!(!model.is_dispatched());
    assert_eq!(model.trace().calls_per_pass.get("layers.0"), Some(&1));
    assert_eq!(model.trace().calls_per_pass.get("layers.1"), Some(&1));
    assert!(!model.trace().graph.is_empty());
}

/// Deferred arithmetic over two activations resolves during the run
#[test]
fn test_deferred_arithmetic_resolves() -> anyhow::Result<()> {
    init_logs();
    let mut model = GraftModel::new(TinyAdapter)?;
    let g = model.graph();
    let out0 = g.module_proxy("layers.0").output()?;
    let out1 = g.module_proxy("layers.1").output()?;
    let sum = &out0 + &out1;
    let combined = (&sum * 0.5).save();

    let out = model.forward(&g, &[2])?;
    // 2 -> 4 -> 12; (4 + 12) / 2 = 8.
    assert_eq!(out.to_vec1::<f32>()?, vec![12.0]);
    assert_eq!(
        combined.get().unwrap().to_vec1::<f32>()?,
        vec![8.0]
    );
    Ok(())
}

/// An output swap feeds the replacement back into the live pass
#[test]
fn test_output_swap_feeds_back() {
    let mut model = GraftModel::new(TinyAdapter).unwrap();
    let g = model.graph();
    let layer0 = g.module_proxy("layers.0");
    let out = layer0.output().unwrap();
    let steered = &out * 10.0;
    layer0.set_output(&steered).unwrap();

    let result = model.forward(&g, &[1]).unwrap();
    // 1 -> 2, swapped to 20, then tripled.
    assert_eq!(result.to_vec1::<f32>().unwrap(), vec![60.0]);
}

/// Parameter fetches resolve before the forward pass starts
#[test]
fn test_attribute_fetch_resolves() {
    let mut model = GraftModel::new(TinyAdapter).unwrap();
    let g = model.graph();
    let scale = g.module_proxy("layers.1").attr("scale").unwrap().save();

    model.forward(&g, &[1]).unwrap();
    assert_eq!(scale.get().unwrap().to_vec1::<f32>().unwrap(), vec![3.0]);
}

/// Modulize plants a hookable wrapper and edits revert after each run
#[test]
fn test_modulize_applies_and_reverts_around_runs() {
    let mut model = GraftModel::new(TinyAdapter).unwrap();
    model.modulize("layers.0", "hook").unwrap();
    assert!(model.meta().contains("layers.0.hook"));

    let g = model.graph();
    let nodes_before = g.node_names();
    let saved = g.module_proxy("layers.0.hook").output().unwrap().save();

    let out = model.forward(&g, &[1]).unwrap();
    assert_eq!(out.to_vec1::<f32>().unwrap(), vec![6.0]);
    assert_eq!(saved.get().unwrap().to_vec1::<f32>().unwrap(), vec![2.0]);

    // The spliced routing nodes are gone again; only user nodes remain,
    // so the same graph drives a second run cleanly.
    assert_eq!(g.node_names().len(), nodes_before.len() + 1);
    let out = model.forward(&g, &[2]).unwrap();
    assert_eq!(out.to_vec1::<f32>().unwrap(), vec![12.0]);
    assert_eq!(saved.get().unwrap().to_vec1::<f32>().unwrap(), vec![4.0]);
}

/// A spliced wrapper becomes a compilable hook target alongside its host
#[test]
fn test_modulize_extends_hookable_paths() {
    let mut model = GraftModel::new(TinyAdapter).unwrap();
    model.modulize("layers.1", "hook").unwrap();

    let g = model.graph();
    g.module_proxy("layers.0").output().unwrap();
    g.module_proxy("layers.1").output().unwrap();
    g.module_proxy("layers.1.hook").output().unwrap();

    // The meta tree already carries the wrapper, so the plan can be
    // inspected without running: both layers plus the planted wrapper.
    let plan = graft_rs::compile(&g, model.trace(), model.meta()).unwrap();
    assert_eq!(plan.len(), 3);
    assert!(plan.is_hooked("layers.1.hook"));
}

/// An unknown path aborts compilation before any computation
#[test]
fn test_unknown_path_fails_before_compute() {
    let mut model = GraftModel::new(TinyAdapter).unwrap();
    let bad = model.graph();
    bad.module_proxy("layers.7").output().unwrap();

    let err = model.forward(&bad, &[1]).unwrap_err();
    match err {
        GraftError::UnresolvedDependency { path } => assert_eq!(path, "layers.7"),
        other => panic!("expected UnresolvedDependency, got {other:?}"),
    }

    // The failed run left the model reusable.
    let g = model.graph();
    let out = model.forward(&g, &[1]).unwrap();
    assert_eq!(out.to_vec1::<f32>().unwrap(), vec![6.0]);
}

/// Proxies from one graph are rejected by another
#[test]
fn test_cross_graph_reference_rejected() {
    let model = GraftModel::new(TinyAdapter).unwrap();
    let g1 = model.graph();
    let g2 = model.graph();
    let foreign = g1.module_proxy("layers.0").output().unwrap();

    let err = g2.module_proxy("layers.1").call(&[&foreign]).unwrap_err();
    assert!(matches!(err, GraftError::CrossGraphReference { .. }));
}

/// An intervention bound to an occurrence the run never reaches fails
#[test]
fn test_unreached_occurrence_is_hook_mismatch() {
    let mut model = GraftModel::new(TinyAdapter).unwrap();
    let g = model.graph();
    // layers.0 fires once per pass; occurrence 5 never happens.
    g.module_proxy("layers.0")
        .occurrence(5)
        .output()
        .unwrap()
        .save();

    let err = model.forward(&g, &[1]).unwrap_err();
    assert!(matches!(err, GraftError::RuntimeHookMismatch(_)));
}

/// Full recurrent-model pipeline: trace under kernel stand-ins, then a
/// steered multi-pass generation against real weights
#[test]
fn test_ssm_generation_end_to_end() -> anyhow::Result<()> {
    init_logs();
    let mut model = GraftModel::new(SsmAdapter::new(SsmConfig::default()))?;
    // The scan cell fired once for the one-token dummy input.
    assert_eq!(model.trace().calls_per_pass.get("layers.0.cell"), Some(&1));

    let g = model.graph();
    // Zero the second layer's state at the second token of pass 0 and
    // watch the head's logits on both passes.
    let cell = g.module_proxy("layers.1.cell").occurrence(1);
    let out = cell.output()?;
    let silenced = &out * 0.0;
    cell.set_output(&silenced)?;
    let head0 = g.module_proxy("lm_head").output()?.save();
    let head1 = g.module_proxy("lm_head").step(1).output()?.save();

    let tokens = model.generate(&g, &[1, 2, 3], 2)?;
    assert_eq!(tokens.dims(), &[1, 5]);
    assert_eq!(head0.get().unwrap().dims(), &[1, 3, 16]);
    assert_eq!(head1.get().unwrap().dims(), &[1, 4, 16]);
    Ok(())
}
