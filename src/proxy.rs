//! Placeholder values standing in for tensors during graph building.
//!
//! A [`Proxy`] references the node that will produce its value; it never
//! holds real data. Arithmetic on proxies (`&a + &b`, `&a * 2.0`) builds
//! new nodes instead of computing anything. [`ModuleProxy`] is the
//! attribute-style accessor for a module path: its inputs, outputs,
//! parameters, and (for edit splicing) direct calls.

use std::ops::{Add, Div, Mul, Sub};
use std::rc::Rc;

use candle_core::Tensor;

use crate::error::Result;
use crate::graph::{Arg, ArgumentKey, BinaryOp, Graph, HookSite, NodeId, OpKind, SavedSlot};

/// Handle to a value retained past the end of a run.
///
/// Empty until the owning node resolves during a run; reading before or
/// during the run yields `None`.
#[derive(Clone)]
pub struct Saved(SavedSlot);

impl Saved {
    pub(crate) fn new(slot: SavedSlot) -> Self {
        Self(slot)
    }

    /// The resolved value, if the node has resolved.
    pub fn get(&self) -> Option<Tensor> {
        self.0.borrow().clone()
    }
}

impl std::fmt::Debug for Saved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Saved")
            .field(&self.0.borrow().is_some())
            .finish()
    }
}

/// Placeholder for a node's future value.
#[derive(Debug, Clone)]
pub struct Proxy {
    graph: Graph,
    node: NodeId,
}

impl Proxy {
    pub(crate) fn new(graph: Graph, node: NodeId) -> Self {
        Self { graph, node }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// The producing node's unique name.
    pub fn name(&self) -> String {
        self.graph
            .node_name(self.node)
            .unwrap_or_else(|| format!("#{}", self.node.index()))
    }

    /// Retain this node's runtime value past the end of the run.
    pub fn save(&self) -> Saved {
        Saved::new(self.graph.mark_saved(self.node))
    }

    /// Build a binary-op node over this proxy and `rhs`.
    ///
    /// Fails with a cross-graph error if `rhs` belongs to another graph.
    pub fn binary(&self, op: BinaryOp, rhs: &Proxy) -> Result<Proxy> {
        let args = vec![self.graph.arg(self)?, self.graph.arg(rhs)?];
        self.graph.create_node(OpKind::Binary(op), op.target(), args)
    }

    /// Build a binary-op node over this proxy and a scalar literal.
    pub fn binary_scalar(&self, op: BinaryOp, rhs: f64) -> Result<Proxy> {
        let args = vec![self.graph.arg(self)?, Arg::Float(rhs)];
        self.graph.create_node(OpKind::Binary(op), op.target(), args)
    }

    /// Build a function-call node applying `f` to this proxy's value.
    pub fn apply(
        &self,
        name: &str,
        f: impl Fn(&[Tensor]) -> Result<Tensor> + 'static,
    ) -> Result<Proxy> {
        let args = vec![self.graph.arg(self)?];
        self.graph.create_node(
            OpKind::CallFunction {
                name: name.to_string(),
                f: Rc::new(f),
            },
            name,
            args,
        )
    }

    fn expect(result: Result<Proxy>) -> Proxy {
        match result {
            Ok(p) => p,
            Err(e) => panic!("proxy operation failed: {e}"),
        }
    }
}

// Operator overloads for ergonomic graph building. These panic on
// cross-graph operands (a caller bug); use `binary` for the fallible form.

impl Add for &Proxy {
    type Output = Proxy;
    fn add(self, rhs: &Proxy) -> Proxy {
        Proxy::expect(self.binary(BinaryOp::Add, rhs))
    }
}

impl Sub for &Proxy {
    type Output = Proxy;
    fn sub(self, rhs: &Proxy) -> Proxy {
        Proxy::expect(self.binary(BinaryOp::Sub, rhs))
    }
}

impl Mul for &Proxy {
    type Output = Proxy;
    fn mul(self, rhs: &Proxy) -> Proxy {
        Proxy::expect(self.binary(BinaryOp::Mul, rhs))
    }
}

impl Div for &Proxy {
    type Output = Proxy;
    fn div(self, rhs: &Proxy) -> Proxy {
        Proxy::expect(self.binary(BinaryOp::Div, rhs))
    }
}

impl Add<f64> for &Proxy {
    type Output = Proxy;
    fn add(self, rhs: f64) -> Proxy {
        Proxy::expect(self.binary_scalar(BinaryOp::Add, rhs))
    }
}

impl Sub<f64> for &Proxy {
    type Output = Proxy;
    fn sub(self, rhs: f64) -> Proxy {
        Proxy::expect(self.binary_scalar(BinaryOp::Sub, rhs))
    }
}

impl Mul<f64> for &Proxy {
    type Output = Proxy;
    fn mul(self, rhs: f64) -> Proxy {
        Proxy::expect(self.binary_scalar(BinaryOp::Mul, rhs))
    }
}

impl Div<f64> for &Proxy {
    type Output = Proxy;
    fn div(self, rhs: f64) -> Proxy {
        Proxy::expect(self.binary_scalar(BinaryOp::Div, rhs))
    }
}

/// Attribute-style accessor for one module path within a graph.
///
/// Defaults to occurrence 0 (the first invocation within a pass) and
/// step 0 (the first forward pass of the run); use [`occurrence`] and
/// [`step`] to retarget.
///
/// [`occurrence`]: ModuleProxy::occurrence
/// [`step`]: ModuleProxy::step
#[derive(Debug, Clone)]
pub struct ModuleProxy {
    graph: Graph,
    path: String,
    occurrence: usize,
    step: usize,
}

impl ModuleProxy {
    pub(crate) fn new(graph: Graph, path: &str) -> Self {
        Self {
            graph,
            path: path.to_string(),
            occurrence: 0,
            step: 0,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Target the `k`-th invocation of this module within a forward pass.
    pub fn occurrence(mut self, k: usize) -> Self {
        self.occurrence = k;
        self
    }

    /// Target forward pass `s` of the run (generation steps).
    pub fn step(mut self, s: usize) -> Self {
        self.step = s;
        self
    }

    fn key(&self, site: HookSite) -> ArgumentKey {
        ArgumentKey::new(self.path.clone(), site, self.occurrence, self.step)
    }

    /// Proxy for the module's primary input at the targeted invocation.
    ///
    /// Modules taking several tensors expose only the first through the
    /// input site; the rest are internal to the adapter's forward driver.
    pub fn input(&self) -> Result<Proxy> {
        self.graph.argument(self.key(HookSite::Input))
    }

    /// Proxy for the module's output at the targeted invocation.
    pub fn output(&self) -> Result<Proxy> {
        self.graph.argument(self.key(HookSite::Output))
    }

    /// Replace the module's live output with `value`'s runtime result.
    pub fn set_output(&self, value: &Proxy) -> Result<()> {
        let out = self.output()?;
        self.graph.set_swap(&out, value)
    }

    /// Replace the module's live (primary) input with `value`'s result.
    pub fn set_input(&self, value: &Proxy) -> Result<()> {
        let input = self.input()?;
        self.graph.set_swap(&input, value)
    }

    /// Build a node invoking this module on `args` for real at runtime.
    ///
    /// The invocation routes through the intervention session, so the
    /// called module's own input/output sites are hookable like any
    /// traced module. This is how edits make spliced wrappers visible.
    pub fn call(&self, args: &[&Proxy]) -> Result<Proxy> {
        let args = args
            .iter()
            .map(|p| self.graph.arg(p))
            .collect::<Result<Vec<_>>>()?;
        self.graph.create_node(
            OpKind::CallModule {
                path: self.path.clone(),
            },
            &self.path,
            args,
        )
    }

    /// Proxy for a named parameter tensor of this module.
    pub fn attr(&self, name: &str) -> Result<Proxy> {
        self.graph.create_node(
            OpKind::GetAttr {
                path: self.path.clone(),
                attr: name.to_string(),
            },
            &format!("{}.{name}", self.path),
            Vec::new(),
        )
    }
}
