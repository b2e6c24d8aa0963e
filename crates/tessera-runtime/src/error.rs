//! Runtime error types for backends, the engine and the interpreter.
//!
//! Every engine error names the unit (exec symbol) it happened at. Dispatch
//! failures are never retried; the engine records them and stops.

use tessera_compile::CompileError;
use tessera_core::{BackendId, CoreError, ExecSymbol, KernelError, TensorSymbol};
use thiserror::Error;

/// Failure reported by a backend for one dispatched command.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error(transparent)]
    Kernel(#[from] KernelError),

    /// An asynchronous backend dropped the command without answering.
    #[error("backend {backend} stopped before completing the command")]
    Disconnected { backend: BackendId },

    /// Device-specific failure from a custom backend.
    #[error("backend {backend}: {message}")]
    Device { backend: BackendId, message: String },
}

/// Errors produced while running a compiled or symbolic graph.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("unit {unit} ({name}) failed on backend {backend}: {source}")]
    BackendDispatchFailure {
        unit: ExecSymbol,
        name: String,
        backend: BackendId,
        source: BackendError,
    },

    #[error("no backend registered for {backend}, needed by unit {unit}")]
    UnknownBackend { unit: ExecSymbol, backend: BackendId },

    #[error("case-of {unit} selected branch {index}, which is not attached")]
    MissingBranch { unit: ExecSymbol, index: i32 },

    #[error("case-of {unit} selected pass-through but cannot fill its outputs from its inputs")]
    PassThroughUnavailable { unit: ExecSymbol },

    #[error("tensor {tensor} has no value")]
    MissingValue { tensor: TensorSymbol },

    #[error("tensor {tensor} holds {expected} elements, got {found}")]
    SizeMismatch {
        tensor: TensorSymbol,
        expected: usize,
        found: usize,
    },

    #[error("engine cannot run from state {state}")]
    InvalidState { state: &'static str },

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Graph(#[from] CoreError),
}
