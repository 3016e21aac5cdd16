//! Engine Error Taxonomy
//!
//! Failures in the engine travel through the same [`RunResult`] channel as
//! success: a condition that reports failure, a work callback that reports
//! failure, or a stop observed at a checkpoint all resolve locally into a
//! failed result. `NodeError` covers the cases that need a concrete error
//! value as well: validation failures, faults published through the error
//! hook, and admission intermediaries that could not run.
//!
//! [`RunResult`]: crate::node::RunResult

use thiserror::Error;

/// Errors produced by the orchestration engine itself.
///
/// Callers never have to catch these from `start`: they are converted into
/// failed results at the start boundary. They appear directly only on the
/// error hook and on the queue's admission API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeError {
    /// The node was started while not in the `Ready` state.
    #[error("No Ready state")]
    NotReady,

    /// A pipeline contained a stage with no nodes in it.
    #[error("Empty stage")]
    EmptyStage,

    /// An admission intermediary node reported failure.
    #[error("intermediary `{name}` failed")]
    Intermediary {
        /// Name of the intermediary node that failed.
        name: String,
    },

    /// A condition or work callback panicked; the panic was caught at the
    /// start boundary and converted into a failed result.
    #[error("work panicked: {detail}")]
    Panicked {
        /// Text recovered from the panic payload.
        detail: String,
    },
}
