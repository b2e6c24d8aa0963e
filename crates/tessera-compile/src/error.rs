//! Compile error types covering all compilation failure modes.

use tessera_core::{CoreError, TensorSymbol};
use thiserror::Error;

/// Errors that can occur while compiling a symbolic graph.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// The graph itself is invalid (foreign symbol, cycle, ...).
    #[error(transparent)]
    Graph(#[from] CoreError),

    /// A bound tensor cannot be mapped to arena bytes.
    #[error("unresolved binding for tensor {tensor}: {reason}")]
    UnresolvedBinding { tensor: TensorSymbol, reason: String },

    /// Two tensors would share arena bytes while both are live.
    #[error("tensors {first} and {second} share arena bytes while both are live")]
    AliasingViolation {
        first: TensorSymbol,
        second: TensorSymbol,
    },

    /// A tensor is pinned to a slot, or handed values, of the wrong size.
    #[error("size mismatch for tensor {tensor}: expected {expected}, found {found}")]
    SizeMismatch {
        tensor: TensorSymbol,
        expected: usize,
        found: usize,
    },

    #[error("invalid compile options: {reason}")]
    InvalidOptions { reason: String },
}
