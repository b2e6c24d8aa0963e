//! Compilation of symbolic graphs into executable graphs.
//!
//! This crate turns a [`SymbolicGraph`](tessera_core::SymbolicGraph) into a
//! [`CompiledGraph`]: one tensor arena whose offsets come from liveness
//! analysis, and one exec arena holding a unit per compiled exec bound to a
//! backend.
//!
//! # Modules
//!
//! - [`error`] -- Error types for all compilation failure modes
//! - [`liveness`] -- Liveness intervals over a compiled order
//! - [`planner`] -- Greedy interval colouring into arena offsets
//! - [`arena`] -- Tensor arena, per-scope layouts and the shared buffer
//! - [`exec_arena`] -- Compiled units (commands and case-of nodes)
//! - [`compiler`] -- The `compile` entry point

pub mod arena;
pub mod compiler;
pub mod error;
pub mod exec_arena;
pub mod liveness;
pub mod planner;

pub use arena::{ArenaBuffer, Slot, TensorArena, TensorLayout};
pub use compiler::{compile, CompiledGraph};
pub use error::CompileError;
pub use exec_arena::{CaseOfUnit, CommandUnit, Direction, ExecUnit, GraphExecArena, TensorBinding};
pub use liveness::Interval;

use serde::{Deserialize, Serialize};
use tessera_core::BackendId;

/// Options controlling compilation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Byte alignment of every arena offset. Must be a power of two.
    pub alignment: usize,

    /// Backend for execs without a backend hint.
    pub default_backend: BackendId,

    /// Let tensors with disjoint liveness share arena bytes. Turning this off
    /// gives every tensor its own bytes, which helps when debugging kernels.
    pub reuse_memory: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            alignment: 16,
            default_backend: BackendId::CpuRef,
            reuse_memory: true,
        }
    }
}

impl CompileOptions {
    /// Parses options from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_compile_options() {
        let opts = CompileOptions::default();
        assert_eq!(opts.alignment, 16);
        assert_eq!(opts.default_backend, BackendId::CpuRef);
        assert!(opts.reuse_memory);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let opts = CompileOptions::from_json(r#"{"reuse_memory": false}"#).unwrap();
        assert!(!opts.reuse_memory);
        assert_eq!(opts.alignment, 16);
    }

    #[test]
    fn compile_options_serde_roundtrip() {
        let opts = CompileOptions {
            alignment: 64,
            default_backend: BackendId::CpuOpt,
            reuse_memory: false,
        };
        let json = serde_json::to_string(&opts).unwrap();
        assert_eq!(CompileOptions::from_json(&json).unwrap(), opts);
    }
}
