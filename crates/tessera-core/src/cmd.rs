//! Command descriptors for exec symbols.
//!
//! A [`Command`] is an opaque operation descriptor: a type tag plus
//! parameters. The graph layer never interprets it beyond its [`OpKind`],
//! which keys the op registry (arity, forward kernel, gradient rule).
//!
//! # Element-wise ops
//!
//! `EwSum`, `EwProd`, `EwDiv`, `EwExp`, `EwLog`, `Scale`, `Relu` and
//! `ReluBackward` operate element by element on tensors of equal element
//! count. There is no broadcasting.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Operation kind: the registry key of a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Noop,
    Set,
    DataTransfer,
    EwSum,
    EwProd,
    EwDiv,
    EwExp,
    EwLog,
    Scale,
    Relu,
    ReluBackward,
    Gemm,
    /// A caller-registered kind, identified by a stable numeric tag.
    Custom(u32),
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Custom(tag) => write!(f, "Custom({tag})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Operation descriptor carried by a non-case-of exec symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Does nothing. Useful as an explicit join point.
    Noop,
    /// Fills every output with `value`. Takes no inputs.
    Set { value: f64 },
    /// Copies input *i* into output *i*.
    DataTransfer,
    /// Sum of all inputs.
    EwSum,
    /// Product of all inputs.
    EwProd,
    /// `a / b`.
    EwDiv,
    EwExp,
    /// Natural logarithm.
    EwLog,
    /// `alpha * a`.
    Scale { alpha: f64 },
    Relu,
    /// `(g, y) -> g where y > 0, else 0`.
    ReluBackward,
    /// `C = op(A) * op(B)` on rank-2 tensors, `op` transposing when flagged.
    Gemm { transpose_a: bool, transpose_b: bool },
    /// A caller-registered op.
    Custom {
        kind: u32,
        params: SmallVec<[f64; 4]>,
    },
}

impl Command {
    pub fn kind(&self) -> OpKind {
        match self {
            Command::Noop => OpKind::Noop,
            Command::Set { .. } => OpKind::Set,
            Command::DataTransfer => OpKind::DataTransfer,
            Command::EwSum => OpKind::EwSum,
            Command::EwProd => OpKind::EwProd,
            Command::EwDiv => OpKind::EwDiv,
            Command::EwExp => OpKind::EwExp,
            Command::EwLog => OpKind::EwLog,
            Command::Scale { .. } => OpKind::Scale,
            Command::Relu => OpKind::Relu,
            Command::ReluBackward => OpKind::ReluBackward,
            Command::Gemm { .. } => OpKind::Gemm,
            Command::Custom { kind, .. } => OpKind::Custom(*kind),
        }
    }

    pub fn gemm() -> Self {
        Command::Gemm {
            transpose_a: false,
            transpose_b: false,
        }
    }
}

/// Physical backend a compiled unit is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendId {
    CpuRef,
    CpuOpt,
    GpuRef,
    Mps,
}

impl Default for BackendId {
    fn default() -> Self {
        BackendId::CpuRef
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
