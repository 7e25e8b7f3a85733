//! Error taxonomy for graft-rs.
//!
//! Every variant here is unrecoverable for the run that produced it and
//! propagates to the caller of the run entry point. A failed run always
//! reverts applied edits and drops hook state before the error surfaces,
//! so repeated run attempts are safe.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, GraftError>;

/// All failure modes of tracing, compilation, editing, and intervention.
#[derive(Error, Debug)]
pub enum GraftError {
    /// The meta run failed to produce the expected structure. Fatal;
    /// aborts model construction.
    #[error("tracing failed: {0}")]
    Tracing(String),

    /// A proxy was used with a graph other than the one that owns it.
    /// Caller bug.
    #[error("node `{node}` does not belong to graph {graph_id}")]
    CrossGraphReference { node: String, graph_id: u64 },

    /// A compiled plan (or an edit) references a module path absent from
    /// the concrete model. Surfaced before any real computation runs.
    #[error("unresolved dependency on module path `{path}`")]
    UnresolvedDependency { path: String },

    /// An edit was re-applied without an intervening revert, or reverted
    /// without having been applied. Caller bug.
    #[error("edit conflict: {0}")]
    AlreadyApplied(String),

    /// A hooked module fired more times than the graph expects, or a
    /// node's dependencies never resolved by the end of the run.
    #[error("hook mismatch: {0}")]
    RuntimeHookMismatch(String),

    /// Underlying tensor-library failure.
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}
