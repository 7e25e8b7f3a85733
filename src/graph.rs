//! Symbolic operation graph built during tracing and intervention building.
//!
//! A [`Graph`] is an ordered list of [`Node`]s. Nodes never hold real
//! activations; they record *what* happened (a module call, an attribute
//! fetch, an arithmetic op) and where their arguments come from. Real
//! values are spliced in at runtime by the intervention session.
//!
//! ## Node naming
//!
//! Names are generated deterministically as `{target}_{k}` with a
//! per-target counter, so a submodule invoked repeatedly in one forward
//! pass produces distinct, stable names (`layers.0.cell_0`,
//! `layers.0.cell_1`, ...). Names are unique within a graph.
//!
//! ## Argument nodes
//!
//! Nodes with [`OpKind::Argument`] await runtime injection: each carries a
//! key naming the module path, hook site (input or output), invocation
//! occurrence within a forward pass, and step (pass index during
//! generation) whose live activation resolves it. The graph keeps an
//! index of these keys — the argument-node table — which the planner
//! walks to decide which module paths must be intercepted.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use candle_core::Tensor;

use crate::error::{GraftError, Result};
use crate::proxy::{ModuleProxy, Proxy};

/// Global source of graph identities, used for cross-graph checks.
static GRAPH_IDS: AtomicU64 = AtomicU64::new(0);

/// Slot a saved node's runtime value is written into.
pub(crate) type SavedSlot = Rc<RefCell<Option<Tensor>>>;

/// Index of a node within its graph's declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Position in declaration order.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Which side of a module invocation an argument node binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookSite {
    /// The module's (primary) input, intercepted before the module runs.
    Input,
    /// The module's output, intercepted after the module runs.
    Output,
}

impl fmt::Display for HookSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// Key identifying the runtime activation an argument node waits for.
///
/// `occurrence` disambiguates repeated invocations of the same module
/// within one forward pass (recurrent cells); `step` disambiguates
/// forward passes within one run (generation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArgumentKey {
    pub path: String,
    pub site: HookSite,
    pub occurrence: usize,
    pub step: usize,
}

impl ArgumentKey {
    pub fn new(path: impl Into<String>, site: HookSite, occurrence: usize, step: usize) -> Self {
        Self {
            path: path.into(),
            site,
            occurrence,
            step,
        }
    }

    /// Node-name target for this key: `{path}.{site}.{step}`.
    fn target(&self) -> String {
        format!("{}.{}.{}", self.path, self.site, self.step)
    }
}

/// Elementwise arithmetic between node results (broadcasting).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub(crate) fn target(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
        }
    }
}

/// What a node does when its arguments are resolved.
#[derive(Clone)]
pub enum OpKind {
    /// Placeholder resolved by runtime injection at the keyed hook site.
    Argument(ArgumentKey),
    /// Invoke the module registered at `path` on the argument tensors.
    CallModule { path: String },
    /// Fetch the named parameter tensor of the module at `path`.
    GetAttr { path: String, attr: String },
    /// Apply a named tensor function to the argument tensors.
    CallFunction {
        name: String,
        f: Rc<dyn Fn(&[Tensor]) -> Result<Tensor>>,
    },
    /// Elementwise arithmetic on the (broadcast) argument tensors.
    Binary(BinaryOp),
}

impl fmt::Debug for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Argument(key) => f.debug_tuple("Argument").field(key).finish(),
            Self::CallModule { path } => f.debug_struct("CallModule").field("path", path).finish(),
            Self::GetAttr { path, attr } => f
                .debug_struct("GetAttr")
                .field("path", path)
                .field("attr", attr)
                .finish(),
            Self::CallFunction { name, .. } => {
                f.debug_struct("CallFunction").field("name", name).finish()
            }
            Self::Binary(op) => f.debug_tuple("Binary").field(op).finish(),
        }
    }
}

/// One argument of a node: an earlier node's result or a literal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg {
    Node(NodeId),
    Float(f64),
}

/// Symbolic record of one traced operation.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub op: OpKind,
    pub args: Vec<Arg>,
    pub(crate) saved: Option<SavedSlot>,
}

struct GraphInner {
    id: u64,
    nodes: Vec<Node>,
    /// Per-target disambiguation counters for name generation.
    name_counts: BTreeMap<String, usize>,
    names: BTreeMap<String, NodeId>,
    /// The argument-node table: runtime injection keys to node ids.
    arguments: BTreeMap<ArgumentKey, NodeId>,
    /// Argument node -> node whose value replaces the live activation.
    swaps: BTreeMap<NodeId, NodeId>,
    /// Monotonic per-run pass counter.
    step: usize,
}

/// Ordered collection of nodes plus the argument-node table and the
/// per-run step counter.
///
/// Cheap to clone (shared interior); the single-threaded execution model
/// makes `Rc<RefCell<..>>` the right ownership here. Structure is mutated
/// only while tracing or editing, never during an intervention session's
/// evaluation pass.
#[derive(Clone)]
pub struct Graph {
    inner: Rc<RefCell<GraphInner>>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(GraphInner {
                id: GRAPH_IDS.fetch_add(1, Ordering::Relaxed),
                nodes: Vec::new(),
                name_counts: BTreeMap::new(),
                names: BTreeMap::new(),
                arguments: BTreeMap::new(),
                swaps: BTreeMap::new(),
                step: 0,
            })),
        }
    }

    /// Identity used for cross-graph checks.
    pub fn id(&self) -> u64 {
        self.inner.borrow().id
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().nodes.is_empty()
    }

    /// Node names in declaration order.
    pub fn node_names(&self) -> Vec<String> {
        self.inner
            .borrow()
            .nodes
            .iter()
            .map(|n| n.name.clone())
            .collect()
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.inner.borrow().names.get(name).copied()
    }

    pub fn node_name(&self, id: NodeId) -> Option<String> {
        self.inner.borrow().nodes.get(id.0).map(|n| n.name.clone())
    }

    /// Clone of the node record (ops are shared, not copied).
    pub fn node(&self, id: NodeId) -> Option<Node> {
        self.inner.borrow().nodes.get(id.0).cloned()
    }

    /// Append a node and return a proxy for its future value.
    ///
    /// `target` seeds the generated name (`{target}_{k}`). Node arguments
    /// must reference nodes already in this graph; an unknown reference is
    /// a [`GraftError::CrossGraphReference`].
    pub fn create_node(&self, op: OpKind, target: &str, args: Vec<Arg>) -> Result<Proxy> {
        let mut inner = self.inner.borrow_mut();
        for arg in &args {
            if let Arg::Node(id) = arg {
                if id.0 >= inner.nodes.len() {
                    return Err(GraftError::CrossGraphReference {
                        node: format!("#{}", id.0),
                        graph_id: inner.id,
                    });
                }
            }
        }
        let count = inner.name_counts.entry(target.to_string()).or_insert(0);
        let name = format!("{target}_{count}");
        *count += 1;
        let id = NodeId(inner.nodes.len());
        if let OpKind::Argument(key) = &op {
            inner.arguments.insert(key.clone(), id);
        }
        inner.names.insert(name.clone(), id);
        inner.nodes.push(Node {
            name,
            op,
            args,
            saved: None,
        });
        drop(inner);
        Ok(Proxy::new(self.clone(), id))
    }

    /// Convert a proxy into a node argument, checking graph ownership.
    pub fn arg(&self, proxy: &Proxy) -> Result<Arg> {
        if proxy.graph().id() != self.id() {
            return Err(GraftError::CrossGraphReference {
                node: proxy.name(),
                graph_id: self.id(),
            });
        }
        Ok(Arg::Node(proxy.node_id()))
    }

    /// Get or create the argument node for `key`.
    ///
    /// Requesting the same key twice yields the same node, so independent
    /// interventions against one activation share a single injection point.
    pub fn argument(&self, key: ArgumentKey) -> Result<Proxy> {
        if let Some(id) = self.inner.borrow().arguments.get(&key).copied() {
            return Ok(Proxy::new(self.clone(), id));
        }
        let target = key.target();
        self.create_node(OpKind::Argument(key), &target, Vec::new())
    }

    pub(crate) fn argument_id(&self, key: &ArgumentKey) -> Option<NodeId> {
        self.inner.borrow().arguments.get(key).copied()
    }

    /// The argument-node table: every runtime injection key with the name
    /// of the node it feeds, in key order.
    pub fn argument_node_names(&self) -> Vec<(ArgumentKey, String)> {
        let inner = self.inner.borrow();
        inner
            .arguments
            .iter()
            .map(|(key, id)| (key.clone(), inner.nodes[id.0].name.clone()))
            .collect()
    }

    /// View for synthesizing node-producing calls against an arbitrary
    /// module path, as if it were being traced live. The edit mechanism
    /// uses this to splice calls to freshly inserted modules without
    /// re-tracing.
    pub fn module_proxy(&self, path: &str) -> ModuleProxy {
        ModuleProxy::new(self.clone(), path)
    }

    /// Route `value`'s runtime result back into the forward pass in place
    /// of the live activation that resolves `target`.
    ///
    /// `target` must be an argument node of this graph.
    pub fn set_swap(&self, target: &Proxy, value: &Proxy) -> Result<()> {
        let target_arg = self.arg(target)?;
        let value_arg = self.arg(value)?;
        let (Arg::Node(target_id), Arg::Node(value_id)) = (target_arg, value_arg) else {
            unreachable!("arg() only produces node references");
        };
        let mut inner = self.inner.borrow_mut();
        match inner.nodes[target_id.0].op {
            OpKind::Argument(_) => {}
            _ => {
                return Err(GraftError::CrossGraphReference {
                    node: inner.nodes[target_id.0].name.clone(),
                    graph_id: inner.id,
                })
            }
        }
        inner.swaps.insert(target_id, value_id);
        Ok(())
    }

    pub(crate) fn swap_source(&self, id: NodeId) -> Option<NodeId> {
        self.inner.borrow().swaps.get(&id).copied()
    }

    pub(crate) fn mark_saved(&self, id: NodeId) -> SavedSlot {
        let mut inner = self.inner.borrow_mut();
        let slot = inner.nodes[id.0]
            .saved
            .get_or_insert_with(|| Rc::new(RefCell::new(None)));
        Rc::clone(slot)
    }

    /// Current step (forward-pass index within the run).
    pub fn step(&self) -> usize {
        self.inner.borrow().step
    }

    /// Advance the step counter. Called exactly once per completed
    /// forward pass, never per node.
    pub fn increment(&self) {
        self.inner.borrow_mut().step += 1;
    }

    pub(crate) fn reset_step(&self) {
        self.inner.borrow_mut().step = 0;
    }

    /// Drop every node at index `len` and beyond, restoring name counters
    /// and the argument/swap tables to match. Used by graph-edit reverts;
    /// spliced nodes always sit at the tail.
    pub(crate) fn truncate(&self, len: usize) {
        let mut inner = self.inner.borrow_mut();
        inner.nodes.truncate(len);
        inner.names.retain(|_, id| id.0 < len);
        inner.arguments.retain(|_, id| id.0 < len);
        inner.swaps.retain(|target, value| target.0 < len && value.0 < len);
        let mut counts = BTreeMap::new();
        for node in &inner.nodes {
            // Name layout is `{target}_{k}`; strip the counter suffix.
            if let Some(pos) = node.name.rfind('_') {
                *counts.entry(node.name[..pos].to_string()).or_insert(0) += 1;
            }
        }
        inner.name_counts = counts;
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Graph")
            .field("id", &inner.id)
            .field("nodes", &inner.nodes)
            .field("step", &inner.step)
            .finish()
    }
}
