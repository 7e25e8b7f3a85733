//! The intervention engine: splicing live activations into the graph.
//!
//! A [`Session`] is the per-run materialization of a graph bound to a
//! concrete model. It owns no tensors beyond resolved node values; hook
//! callbacks execute inline within the forward pass call stack (no tasks,
//! no channels), and evaluation is strictly single-threaded.
//!
//! On each intercepted invocation the session: identifies which argument
//! node(s) the firing satisfies, using the per-pass occurrence count and
//! the step counter to disambiguate repeats; substitutes the node's
//! placeholder with the live tensor; eagerly evaluates every downstream
//! node whose whole argument list is resolved, in declaration order; and
//! feeds a swapped value back into the forward pass at that exact point.

use std::collections::{BTreeMap, HashMap, HashSet};

use candle_core::Tensor;
use tracing::debug;

use crate::error::{GraftError, Result};
use crate::graph::{Arg, ArgumentKey, BinaryOp, Graph, HookSite, Node, NodeId, OpKind};
use crate::model::ForwardContext;
use crate::module::ModuleTree;
use crate::plan::HookPlan;

/// Per-run intervention state. One in-flight session per model at a
/// time; the step counter and node values are shared mutable state with
/// no isolation between simultaneous runs.
pub struct Session<'a> {
    graph: Graph,
    plan: &'a HookPlan,
    tree: &'a ModuleTree,
    values: HashMap<NodeId, Tensor>,
    /// Nodes currently being evaluated; guards re-entrant evaluation
    /// when a module call resolves earlier-declared argument nodes.
    in_flight: HashSet<NodeId>,
    /// Invocations per path within the current pass.
    counts: BTreeMap<String, usize>,
    step: usize,
    events: Vec<(String, HookSite)>,
}

impl<'a> Session<'a> {
    pub fn new(graph: Graph, plan: &'a HookPlan, tree: &'a ModuleTree) -> Self {
        Self {
            graph,
            plan,
            tree,
            values: HashMap::new(),
            in_flight: HashSet::new(),
            counts: BTreeMap::new(),
            step: 0,
            events: Vec::new(),
        }
    }

    /// Evaluate whatever is ready before any hook fires (attribute
    /// fetches and anything downstream of only those).
    pub fn start(&mut self) -> Result<()> {
        self.propagate()
    }

    /// Interceptions fired so far, in firing order.
    pub fn events(&self) -> &[(String, HookSite)] {
        &self.events
    }

    /// End-of-run check: every node must have resolved.
    pub fn finish(&self) -> Result<()> {
        for idx in 0..self.graph.len() {
            let id = NodeId(idx);
            if !self.values.contains_key(&id) {
                let name = self
                    .graph
                    .node_name(id)
                    .unwrap_or_else(|| format!("#{idx}"));
                return Err(GraftError::RuntimeHookMismatch(format!(
                    "node `{name}` never resolved by end of run"
                )));
            }
        }
        Ok(())
    }

    /// One intercepted module invocation: input site, module forward,
    /// output site. Also the evaluation path for `CallModule` nodes, so
    /// graph-driven invocations are themselves hookable.
    fn invoke(&mut self, path: &str, xs: &[Tensor]) -> Result<Tensor> {
        let occurrence = self.counts.get(path).copied().unwrap_or(0);
        if let Some(limit) = self.plan.limit(path) {
            if occurrence >= limit {
                return Err(GraftError::RuntimeHookMismatch(format!(
                    "module `{path}` fired more than the {limit} time(s) the graph expects in one pass"
                )));
            }
        }
        *self.counts.entry(path.to_string()).or_insert(0) += 1;

        let mut xs = xs.to_vec();
        self.events.push((path.to_string(), HookSite::Input));
        let input_key = ArgumentKey::new(path, HookSite::Input, occurrence, self.step);
        if let Some(id) = self.graph.argument_id(&input_key) {
            if let Some(first) = xs.first().cloned() {
                self.resolve(id, first)?;
            }
            if let Some(replacement) = self.swap_value(id)? {
                if let Some(slot) = xs.first_mut() {
                    debug!(path, occurrence, step = self.step, "swapped input");
                    *slot = replacement;
                }
            }
        }

        let mut out = self.tree.forward(path, &xs)?;

        self.events.push((path.to_string(), HookSite::Output));
        let output_key = ArgumentKey::new(path, HookSite::Output, occurrence, self.step);
        if let Some(id) = self.graph.argument_id(&output_key) {
            self.resolve(id, out.clone())?;
            if let Some(replacement) = self.swap_value(id)? {
                debug!(path, occurrence, step = self.step, "swapped output");
                out = replacement;
            }
        }
        Ok(out)
    }

    /// The replacement value for an argument node with a registered
    /// swap, which must already be resolved when the site fires.
    fn swap_value(&mut self, id: NodeId) -> Result<Option<Tensor>> {
        let Some(source) = self.graph.swap_source(id) else {
            return Ok(None);
        };
        match self.values.get(&source) {
            Some(v) => Ok(Some(v.clone())),
            None => {
                let name = self
                    .graph
                    .node_name(source)
                    .unwrap_or_else(|| format!("#{}", source.index()));
                Err(GraftError::RuntimeHookMismatch(format!(
                    "swap source `{name}` is unresolved at its injection point"
                )))
            }
        }
    }

    fn resolve(&mut self, id: NodeId, value: Tensor) -> Result<()> {
        if self.values.contains_key(&id) {
            let name = self
                .graph
                .node_name(id)
                .unwrap_or_else(|| format!("#{}", id.index()));
            return Err(GraftError::RuntimeHookMismatch(format!(
                "node `{name}` resolved twice"
            )));
        }
        self.store(id, value);
        self.propagate()
    }

    fn store(&mut self, id: NodeId, value: Tensor) {
        if let Some(node) = self.graph.node(id) {
            if let Some(slot) = node.saved {
                *slot.borrow_mut() = Some(value.clone());
            }
        }
        self.values.insert(id, value);
    }

    /// Evaluate every ready node, in declaration order among those
    /// simultaneously ready, until a fixpoint. A node is never evaluated
    /// before all its argument nodes are resolved.
    fn propagate(&mut self) -> Result<()> {
        loop {
            let mut progressed = false;
            for idx in 0..self.graph.len() {
                let id = NodeId(idx);
                if self.values.contains_key(&id) || self.in_flight.contains(&id) {
                    continue;
                }
                let Some(node) = self.graph.node(id) else {
                    continue;
                };
                if matches!(node.op, OpKind::Argument(_)) {
                    continue;
                }
                let ready = node.args.iter().all(|arg| match arg {
                    Arg::Node(n) => self.values.contains_key(n),
                    Arg::Float(_) => true,
                });
                if !ready {
                    continue;
                }
                self.in_flight.insert(id);
                let result = self.eval(&node);
                self.in_flight.remove(&id);
                let value = result?;
                // A nested invocation may have resolved this node already
                // (argument keys it satisfies); keep the first value.
                if !self.values.contains_key(&id) {
                    self.store(id, value);
                }
                progressed = true;
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    fn eval(&mut self, node: &Node) -> Result<Tensor> {
        match &node.op {
            OpKind::Argument(key) => Err(GraftError::RuntimeHookMismatch(format!(
                "argument node for `{}` evaluated instead of injected",
                key.path
            ))),
            OpKind::CallModule { path } => {
                let path = path.clone();
                let xs = self.tensor_args(&node.args)?;
                self.invoke(&path, &xs)
            }
            OpKind::GetAttr { path, attr } => self.tree.param(path, attr),
            OpKind::CallFunction { f, .. } => {
                let xs = self.tensor_args(&node.args)?;
                f(&xs)
            }
            OpKind::Binary(op) => self.eval_binary(*op, &node.args, &node.name),
        }
    }

    fn tensor_args(&self, args: &[Arg]) -> Result<Vec<Tensor>> {
        args.iter()
            .map(|arg| match arg {
                Arg::Node(id) => self.values.get(id).cloned().ok_or_else(|| {
                    GraftError::RuntimeHookMismatch("evaluated node with unresolved argument".into())
                }),
                Arg::Float(_) => Err(GraftError::RuntimeHookMismatch(
                    "literal argument where a tensor is required".into(),
                )),
            })
            .collect()
    }

    fn eval_binary(&self, op: BinaryOp, args: &[Arg], name: &str) -> Result<Tensor> {
        let [lhs, rhs] = args else {
            return Err(GraftError::RuntimeHookMismatch(format!(
                "binary node `{name}` has {} arguments",
                args.len()
            )));
        };
        let value = match (lhs, rhs) {
            (Arg::Node(a), Arg::Node(b)) => {
                let (a, b) = (self.node_value(*a)?, self.node_value(*b)?);
                match op {
                    BinaryOp::Add => a.broadcast_add(&b)?,
                    BinaryOp::Sub => a.broadcast_sub(&b)?,
                    BinaryOp::Mul => a.broadcast_mul(&b)?,
                    BinaryOp::Div => a.broadcast_div(&b)?,
                }
            }
            (Arg::Node(a), Arg::Float(c)) => {
                let a = self.node_value(*a)?;
                match op {
                    BinaryOp::Add => a.affine(1.0, *c)?,
                    BinaryOp::Sub => a.affine(1.0, -c)?,
                    BinaryOp::Mul => a.affine(*c, 0.0)?,
                    BinaryOp::Div => a.affine(1.0 / c, 0.0)?,
                }
            }
            (Arg::Float(c), Arg::Node(b)) => {
                let b = self.node_value(*b)?;
                match op {
                    BinaryOp::Add => b.affine(1.0, *c)?,
                    BinaryOp::Sub => b.affine(-1.0, *c)?,
                    BinaryOp::Mul => b.affine(*c, 0.0)?,
                    BinaryOp::Div => b.recip()?.affine(*c, 0.0)?,
                }
            }
            (Arg::Float(_), Arg::Float(_)) => {
                return Err(GraftError::RuntimeHookMismatch(format!(
                    "binary node `{name}` has no tensor argument"
                )))
            }
        };
        Ok(value)
    }

    fn node_value(&self, id: NodeId) -> Result<Tensor> {
        self.values.get(&id).cloned().ok_or_else(|| {
            GraftError::RuntimeHookMismatch("evaluated node with unresolved argument".into())
        })
    }
}

impl ForwardContext for Session<'_> {
    fn call(&mut self, path: &str, xs: &[Tensor]) -> Result<Tensor> {
        if !self.plan.is_hooked(path) {
            return self.tree.forward(path, xs);
        }
        self.invoke(path, xs)
    }

    fn advance_step(&mut self) -> Result<()> {
        self.step += 1;
        self.graph.increment();
        self.counts.clear();
        Ok(())
    }
}
