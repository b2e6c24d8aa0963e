//! The symbol table owned by one graph scope.
//!
//! [`SymbolTable`] assigns monotonically increasing local indices to tensor
//! and exec symbols. Symbols are never removed individually; the whole table
//! dies with its owning [`SymbolicGraph`](crate::graph::SymbolicGraph).
//!
//! All validation happens before anything is pushed, so a rejected
//! `push_exec` leaves the table untouched.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::case_of::{CaseOf, CaseOfBackward};
use crate::cmd::{BackendId, Command};
use crate::error::{CoreError, ScopeFault};
use crate::id::{ExecSymbol, ScopeId, TensorSymbol};
use crate::tensor::TensorParams;

/// Attributes of a tensor symbol.
#[derive(Debug, Clone)]
pub struct TensorSymbolInfo {
    pub params: TensorParams,
    /// Diagnostic only; never part of identity.
    pub name: Option<String>,
    /// Local index of the producing exec, if any.
    pub(crate) producer: Option<u32>,
}

/// Whether an exec belongs to the forward computation or was added by the
/// differentiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pass {
    Forward,
    Backward,
}

/// What an exec symbol does.
#[derive(Debug, Clone)]
pub enum ExecKind {
    Command(Command),
    CaseOf(CaseOf),
    CaseOfBackward(CaseOfBackward),
}

impl ExecKind {
    pub fn command(&self) -> Option<&Command> {
        match self {
            ExecKind::Command(cmd) => Some(cmd),
            _ => None,
        }
    }

    /// Short label used in logs and exports.
    pub fn label(&self) -> String {
        match self {
            ExecKind::Command(cmd) => cmd.kind().to_string(),
            ExecKind::CaseOf(_) => "CaseOf".to_string(),
            ExecKind::CaseOfBackward(_) => "CaseOfBackward".to_string(),
        }
    }
}

/// Attributes of an exec symbol.
#[derive(Debug, Clone)]
pub struct ExecSymbolInfo {
    pub kind: ExecKind,
    pub inputs: SmallVec<[TensorSymbol; 4]>,
    pub outputs: SmallVec<[TensorSymbol; 4]>,
    pub name: String,
    /// Preferred backend; `None` defers to the compiler's default.
    pub backend: Option<BackendId>,
    pub pass: Pass,
}

/// Tensor and exec symbols of one scope.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    scope: ScopeId,
    tensors: Vec<TensorSymbolInfo>,
    execs: Vec<ExecSymbolInfo>,
    finalized: bool,
}

impl SymbolTable {
    pub(crate) fn new(scope: ScopeId) -> Self {
        SymbolTable {
            scope,
            tensors: Vec::new(),
            execs: Vec::new(),
            finalized: false,
        }
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub(crate) fn finalize(&mut self) {
        self.finalized = true;
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    pub fn exec_count(&self) -> usize {
        self.execs.len()
    }

    fn check_open(&self) -> Result<(), CoreError> {
        if self.finalized {
            return Err(CoreError::InvalidScope {
                scope: self.scope,
                fault: ScopeFault::Finalized,
            });
        }
        Ok(())
    }

    fn check_scope(&self, scope: ScopeId) -> Result<(), CoreError> {
        if scope != self.scope {
            return Err(CoreError::InvalidScope {
                scope: self.scope,
                fault: ScopeFault::Foreign { found: scope },
            });
        }
        Ok(())
    }

    /// Looks up a tensor symbol, rejecting symbols from other scopes.
    pub fn tensor(&self, symbol: TensorSymbol) -> Result<&TensorSymbolInfo, CoreError> {
        self.check_scope(symbol.scope)?;
        self.tensors
            .get(symbol.index as usize)
            .ok_or(CoreError::TensorNotFound { tensor: symbol })
    }

    /// Looks up an exec symbol, rejecting symbols from other scopes.
    pub fn exec(&self, symbol: ExecSymbol) -> Result<&ExecSymbolInfo, CoreError> {
        self.check_scope(symbol.scope)?;
        self.execs
            .get(symbol.index as usize)
            .ok_or(CoreError::ExecNotFound { exec: symbol })
    }

    pub(crate) fn exec_mut(&mut self, symbol: ExecSymbol) -> Result<&mut ExecSymbolInfo, CoreError> {
        self.check_scope(symbol.scope)?;
        self.execs
            .get_mut(symbol.index as usize)
            .ok_or(CoreError::ExecNotFound { exec: symbol })
    }

    /// The exec producing `symbol`, if any.
    pub fn producer(&self, symbol: TensorSymbol) -> Result<Option<ExecSymbol>, CoreError> {
        Ok(self
            .tensor(symbol)?
            .producer
            .map(|index| ExecSymbol::new(self.scope, index)))
    }

    /// All tensor symbols in index order.
    pub fn tensor_symbols(&self) -> impl Iterator<Item = TensorSymbol> + '_ {
        (0..self.tensors.len() as u32).map(move |i| TensorSymbol::new(self.scope, i))
    }

    /// All exec symbols in index order.
    pub fn exec_symbols(&self) -> impl Iterator<Item = ExecSymbol> + '_ {
        (0..self.execs.len() as u32).map(move |i| ExecSymbol::new(self.scope, i))
    }

    pub(crate) fn push_tensor(
        &mut self,
        params: TensorParams,
        name: Option<String>,
    ) -> Result<TensorSymbol, CoreError> {
        self.check_open()?;
        let symbol = TensorSymbol::new(self.scope, self.tensors.len() as u32);
        self.tensors.push(TensorSymbolInfo {
            params,
            name,
            producer: None,
        });
        Ok(symbol)
    }

    /// Validates every input and output, then appends the exec and records it
    /// as the producer of its outputs.
    pub(crate) fn push_exec(&mut self, info: ExecSymbolInfo) -> Result<ExecSymbol, CoreError> {
        self.check_open()?;
        let symbol = ExecSymbol::new(self.scope, self.execs.len() as u32);

        for input in &info.inputs {
            self.tensor(*input)?;
        }
        for (i, output) in info.outputs.iter().enumerate() {
            let existing = self.tensor(*output)?;
            if let Some(producer) = existing.producer {
                return Err(CoreError::ProducerConflict {
                    tensor: *output,
                    producer: ExecSymbol::new(self.scope, producer),
                });
            }
            if info.outputs[..i].contains(output) {
                return Err(CoreError::ProducerConflict {
                    tensor: *output,
                    producer: symbol,
                });
            }
        }

        for output in &info.outputs {
            self.tensors[output.index as usize].producer = Some(symbol.index);
        }
        self.execs.push(info);
        Ok(symbol)
    }
}
