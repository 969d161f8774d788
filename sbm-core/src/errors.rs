//! Error kinds surfaced by the state machinery.

use thiserror::Error;

/// Failures of the public state operations.
///
/// `virtual_move` never returns these: disallowed moves yield `+∞` there.
#[derive(Debug, Error)]
pub enum StateError {
    /// `allow_move` rejected the transition (constraint labels or a
    /// coupled-level barrier).
    #[error("cannot move vertex across constraint barriers ({r} -> {nr})")]
    ConstraintBarrier { r: usize, nr: usize },

    /// The requested computation is undefined for this model variant.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// Paired argument lists of different lengths.
    #[error("{what}: lengths {left} and {right} do not match")]
    ShapeMismatch {
        what: &'static str,
        left: usize,
        right: usize,
    },

    /// A consistency check found counters out of sync with the graph.
    #[error("invariant failure: {0}")]
    InvariantFailure(&'static str),
}

pub type Result<T> = std::result::Result<T, StateError>;
