// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `node`/`nodes`
#![allow(clippy::module_name_repetitions)] // GraftModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility

//! graft-rs: deferred interventions on neural network internals
//!
//! Lets callers name activations inside a model's forward pass, build
//! computations over them, and rewrite them mid-run — all declared
//! against a degenerate stand-in before any real weights are touched,
//! then bound to the concrete model at execution time.
//!
//! ## Architecture
//!
//! - `graph`: Intervention graph of named nodes with deterministic naming
//! - `proxy`: Deferred tensor handles and the operator overloads on them
//! - `module`: Module trait, identity wrapper, and the dotted-path tree
//! - `patching`: Scoped module substitution (kernel stand-ins at trace time)
//! - `trace`: Meta pass recording shapes and per-pass invocation counts
//! - `plan`: Graph compilation into the minimal set of hooked paths
//! - `engine`: Run session resolving graph nodes against live activations
//! - `edit`: Structural edits (wrapper insertion, graph splicing) with revert
//! - `model`: Adapter contract and the user-facing wrapped model
//! - `forward_ssm`: Reference recurrent (scan-cell) adapter
//! - `error`: Error taxonomy shared across the crate

pub mod edit;
pub mod engine;
pub mod error;
pub mod forward_ssm;
pub mod graph;
pub mod model;
pub mod module;
pub mod patching;
pub mod plan;
pub mod proxy;
pub mod trace;

pub use edit::{Edit, GraphEdit, WrapperModuleEdit};
pub use engine::Session;
pub use error::{GraftError, Result};
pub use forward_ssm::{SsmAdapter, SsmConfig};
pub use graph::{Arg, ArgumentKey, BinaryOp, Graph, HookSite, NodeId, OpKind};
pub use model::{ForwardContext, GraftModel, ModelAdapter, PassKind, RunMode};
pub use module::{GraftModule, ModuleMeta, ModuleTree, WrapperModule};
pub use patching::{Patch, Patcher};
pub use plan::{compile, HookPlan};
pub use proxy::{ModuleProxy, Proxy, Saved};
pub use trace::{trace, TraceRecord};
