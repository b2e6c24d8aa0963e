//! Core error types for tessera-core.
//!
//! Uses `thiserror` for structured, matchable error variants. Graph
//! construction errors are raised before any mutation, so a failed call
//! leaves the graph exactly as it was.

use std::fmt;

use thiserror::Error;

use crate::cmd::OpKind;
use crate::id::{ExecSymbol, ScopeId, TensorSymbol};

/// Why a scope rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeFault {
    /// The owning graph was finalized and accepts no new symbols.
    Finalized,
    /// The symbol belongs to another scope.
    Foreign { found: ScopeId },
}

impl fmt::Display for ScopeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeFault::Finalized => write!(f, "graph is finalized"),
            ScopeFault::Foreign { found } => write!(f, "symbol belongs to scope {found}"),
        }
    }
}

/// Errors produced while building, autogen-ing or differentiating graphs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// A symbol from another scope was used, or the graph was finalized.
    #[error("invalid scope {scope}: {fault}")]
    InvalidScope { scope: ScopeId, fault: ScopeFault },

    #[error("tensor symbol not found: {tensor}")]
    TensorNotFound { tensor: TensorSymbol },

    #[error("exec symbol not found: {exec}")]
    ExecNotFound { exec: ExecSymbol },

    /// The producer/consumer relation restricted to the request is cyclic.
    #[error("cycle detected through exec {exec}")]
    CycleDetected { exec: ExecSymbol },

    /// A tensor symbol would get a second producing exec.
    #[error("tensor {tensor} is already produced by exec {producer}")]
    ProducerConflict {
        tensor: TensorSymbol,
        producer: ExecSymbol,
    },

    #[error("case-of {exec} already has a branch at index {index}")]
    BranchIndexConflict { exec: ExecSymbol, index: usize },

    #[error("case-of {exec} has no branch at index {index}")]
    BranchNotFound { exec: ExecSymbol, index: usize },

    /// A declared case-of output is missing from a branch's output map.
    #[error("case-of {exec} branch {index} has no mapping for output {output}")]
    UnmappedOutput {
        exec: ExecSymbol,
        index: usize,
        output: TensorSymbol,
    },

    #[error("invalid branch mapping for case-of {exec}: {reason}")]
    InvalidBranchMapping { exec: ExecSymbol, reason: String },

    #[error("exec {exec} is not a case-of node")]
    NotCaseOf { exec: ExecSymbol },

    #[error("{kind} expects {expected} {what}, got {found}")]
    ArityMismatch {
        kind: OpKind,
        what: &'static str,
        expected: String,
        found: usize,
    },

    #[error("op kind {kind} is already registered")]
    DuplicateOp { kind: OpKind },

    /// A required gradient has no path to any loss tensor.
    #[error("no gradient path from the losses to tensor {tensor}")]
    NoGradientPath { tensor: TensorSymbol },

    /// An op on the differentiation path has no registered gradient rule.
    #[error("no gradient rule registered for {kind}")]
    UnsupportedOperation { kind: OpKind },

    /// A backward case-of lies on the differentiation path.
    #[error("exec {exec} is a case-of gradient and cannot be differentiated again")]
    NotDifferentiable { exec: ExecSymbol },
}

/// Errors produced by forward kernels.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KernelError {
    #[error("{kind}: expected {expected} {what}, got {found}")]
    Arity {
        kind: OpKind,
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{kind}: shape mismatch, {left:?} vs {right:?}")]
    ShapeMismatch {
        kind: OpKind,
        left: Vec<usize>,
        right: Vec<usize>,
    },

    #[error("no forward kernel for {kind}")]
    Unsupported { kind: OpKind },
}
