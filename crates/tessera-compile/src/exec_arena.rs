//! Compiled units.
//!
//! A [`GraphExecArena`] is the executable form of one scope: a list of units
//! in run order. Command units carry everything a backend needs (command,
//! backend id, arena bindings). Case-of units carry the predicate and one
//! nested arena per branch, all addressing the same tensor arena.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;
use tessera_core::{
    BackendId, CaseOfPredicate, Command, ExecSymbol, ScopeId, TensorParams, TensorSymbol,
};

/// Where one tensor operand lives in the arena.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorBinding {
    pub symbol: TensorSymbol,
    pub offset: usize,
    pub params: TensorParams,
}

impl TensorBinding {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.params.byte_size()
    }

    /// Whether the two bindings touch a common byte.
    pub fn overlaps(&self, other: &TensorBinding) -> bool {
        let (a, b) = (self.range(), other.range());
        !a.is_empty() && !b.is_empty() && a.start < b.end && b.start < a.end
    }
}

/// A command bound to a backend.
#[derive(Debug, Clone)]
pub struct CommandUnit {
    pub exec: ExecSymbol,
    pub name: String,
    pub command: Command,
    pub backend: BackendId,
    pub inputs: SmallVec<[TensorBinding; 4]>,
    pub outputs: SmallVec<[TensorBinding; 4]>,
}

/// Whether a case-of unit runs forward branches or their gradients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// A compiled case-of node (forward or backward).
#[derive(Clone)]
pub struct CaseOfUnit {
    pub exec: ExecSymbol,
    pub name: String,
    pub direction: Direction,
    pub predicate: Arc<dyn CaseOfPredicate>,
    /// Values the predicate sees, in the forward case-of's input order.
    pub predicate_inputs: Vec<TensorBinding>,
    /// `(source, destination)` copies run on pass-through. `None` when
    /// pass-through cannot fill every output.
    pub pass_through: Option<Vec<(TensorBinding, TensorBinding)>>,
    /// Tensors zeroed on pass-through.
    pub zero_fill: Vec<TensorBinding>,
    /// Every tensor written by the unit, whichever branch runs.
    pub outputs: Vec<TensorBinding>,
    pub branches: BTreeMap<usize, GraphExecArena>,
}

impl fmt::Debug for CaseOfUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaseOfUnit")
            .field("exec", &self.exec)
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("predicate_inputs", &self.predicate_inputs)
            .field("pass_through", &self.pass_through)
            .field("zero_fill", &self.zero_fill)
            .field("branches", &self.branches)
            .finish_non_exhaustive()
    }
}

/// One compiled exec.
#[derive(Debug, Clone)]
pub enum ExecUnit {
    Command(CommandUnit),
    CaseOf(CaseOfUnit),
}

impl ExecUnit {
    pub fn exec(&self) -> ExecSymbol {
        match self {
            ExecUnit::Command(unit) => unit.exec,
            ExecUnit::CaseOf(unit) => unit.exec,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ExecUnit::Command(unit) => &unit.name,
            ExecUnit::CaseOf(unit) => &unit.name,
        }
    }
}

/// Units of one scope in run order.
#[derive(Debug, Clone)]
pub struct GraphExecArena {
    pub scope: ScopeId,
    pub units: Vec<ExecUnit>,
}

impl GraphExecArena {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Command units, descending into every branch.
    pub fn command_units(&self) -> Vec<&CommandUnit> {
        let mut out = Vec::new();
        for unit in &self.units {
            match unit {
                ExecUnit::Command(cmd) => out.push(cmd),
                ExecUnit::CaseOf(case_of) => {
                    for branch in case_of.branches.values() {
                        out.extend(branch.command_units());
                    }
                }
            }
        }
        out
    }
}
