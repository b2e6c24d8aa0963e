//! Identifier newtypes for symbols and scopes.
//!
//! Every [`SymbolicGraph`](crate::graph::SymbolicGraph) owns exactly one
//! [`ScopeId`], allocated from a process-wide counter. Tensor and exec
//! symbols are `(scope, local index)` pairs, so a symbol minted by one graph
//! never compares equal to a symbol minted by another, even when the local
//! indices coincide.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

/// Identity of one graph scope (a root graph or a case-of branch sub-graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScopeId(pub(crate) u32);

static NEXT_SCOPE: AtomicU32 = AtomicU32::new(0);

impl ScopeId {
    /// Allocates a fresh scope id. Ids are never reused within a process.
    pub(crate) fn fresh() -> Self {
        ScopeId(NEXT_SCOPE.fetch_add(1, Ordering::Relaxed))
    }
}

/// Handle to a tensor slot in one graph scope. Not bound to memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TensorSymbol {
    pub scope: ScopeId,
    pub index: u32,
}

/// Handle to one operation node in a graph scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExecSymbol {
    pub scope: ScopeId,
    pub index: u32,
}

impl TensorSymbol {
    pub fn new(scope: ScopeId, index: u32) -> Self {
        TensorSymbol { scope, index }
    }
}

impl ExecSymbol {
    pub fn new(scope: ScopeId, index: u32) -> Self {
        ExecSymbol { scope, index }
    }
}

// Display implementations -- `scope:index`, matching how the export prints them.

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TensorSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}:{}", self.scope.0, self.index)
    }
}

impl fmt::Display for ExecSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}:{}", self.scope.0, self.index)
    }
}
