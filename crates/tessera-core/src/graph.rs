//! SymbolicGraph: a dataflow of exec symbols over tensor symbols.
//!
//! [`SymbolicGraph`] is the single entry point for building graphs. It owns
//! one [`SymbolTable`] and caches the result of the last
//! [autogen](SymbolicGraph::autogen) call (sources, destinations and a
//! topological execution order).
//!
//! # Edges
//!
//! There are no explicit edges. An exec depends on another exec exactly when
//! it consumes a tensor symbol the other produces. Every tensor symbol has at
//! most one producer, which the table enforces when execs are added.
//!
//! # Case-of
//!
//! [`case_of_new`](SymbolicGraph::case_of_new) declares a conditional node;
//! [`set_case_of`](SymbolicGraph::set_case_of) attaches branch sub-graphs,
//! which move into the node and are owned by it from then on.

use std::sync::Arc;

use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::backward::{self, BackwardOptions, Gradients};
use crate::case_of::{CaseOf, CaseOfBranch, CaseOfPredicate};
use crate::cmd::{BackendId, Command};
use crate::error::CoreError;
use crate::id::{ExecSymbol, ScopeId, TensorSymbol};
use crate::registry;
use crate::symbol::{ExecKind, ExecSymbolInfo, Pass, SymbolTable, TensorSymbolInfo};
use crate::tensor::TensorParams;

/// A symbolic graph for one scope.
///
/// Not `Clone`: every graph owns a distinct scope, and a copy sharing it
/// would mint symbols equal to the original's.
#[derive(Debug)]
pub struct SymbolicGraph {
    table: SymbolTable,
    pub(crate) sources: Vec<ExecSymbol>,
    pub(crate) destinations: Vec<ExecSymbol>,
    pub(crate) exec_order: Vec<ExecSymbol>,
}

impl Default for SymbolicGraph {
    fn default() -> Self {
        Self::new()
    }
}

fn optional_name(name: &str) -> Option<String> {
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

impl SymbolicGraph {
    /// Creates an empty graph with a fresh scope.
    pub fn new() -> Self {
        SymbolicGraph {
            table: SymbolTable::new(ScopeId::fresh()),
            sources: Vec::new(),
            destinations: Vec::new(),
            exec_order: Vec::new(),
        }
    }

    /// Copy under the same scope, used to restore the graph after a failed
    /// mutation. The copy replaces the original and is never handed out.
    pub(crate) fn snapshot(&self) -> SymbolicGraph {
        SymbolicGraph {
            table: self.table.clone(),
            sources: self.sources.clone(),
            destinations: self.destinations.clone(),
            exec_order: self.exec_order.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Read-only accessors
    // -----------------------------------------------------------------------

    pub fn scope(&self) -> ScopeId {
        self.table.scope()
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.table
    }

    pub fn tensor(&self, symbol: TensorSymbol) -> Result<&TensorSymbolInfo, CoreError> {
        self.table.tensor(symbol)
    }

    pub fn tensor_params(&self, symbol: TensorSymbol) -> Result<&TensorParams, CoreError> {
        Ok(&self.table.tensor(symbol)?.params)
    }

    /// Diagnostic name of a tensor, falling back to its symbol.
    pub fn tensor_name(&self, symbol: TensorSymbol) -> String {
        match self.table.tensor(symbol) {
            Ok(TensorSymbolInfo {
                name: Some(name), ..
            }) => name.clone(),
            _ => symbol.to_string(),
        }
    }

    pub fn exec(&self, symbol: ExecSymbol) -> Result<&ExecSymbolInfo, CoreError> {
        self.table.exec(symbol)
    }

    pub fn producer(&self, symbol: TensorSymbol) -> Result<Option<ExecSymbol>, CoreError> {
        self.table.producer(symbol)
    }

    /// Execs reading `symbol`, in ascending index order.
    pub fn consumers(&self, symbol: TensorSymbol) -> Result<Vec<ExecSymbol>, CoreError> {
        self.table.tensor(symbol)?;
        Ok(self
            .table
            .exec_symbols()
            .filter(|e| {
                self.table
                    .exec(*e)
                    .map_or(false, |info| info.inputs.contains(&symbol))
            })
            .collect())
    }

    pub fn tensor_count(&self) -> usize {
        self.table.tensor_count()
    }

    pub fn exec_count(&self) -> usize {
        self.table.exec_count()
    }

    /// Sources computed by the last autogen with `SOURCES_AND_DESTINATIONS`.
    pub fn sources(&self) -> &[ExecSymbol] {
        &self.sources
    }

    /// Destinations computed by the last autogen with `SOURCES_AND_DESTINATIONS`.
    pub fn destinations(&self) -> &[ExecSymbol] {
        &self.destinations
    }

    /// Execution order cached by the last autogen.
    pub fn exec_order(&self) -> &[ExecSymbol] {
        &self.exec_order
    }

    pub fn is_finalized(&self) -> bool {
        self.table.is_finalized()
    }

    /// Stops the graph from accepting new symbols. Reads keep working.
    pub fn finalize(&mut self) {
        self.table.finalize();
    }

    // -----------------------------------------------------------------------
    // Symbol construction
    // -----------------------------------------------------------------------

    /// Adds a tensor symbol. An empty `name` leaves the symbol unnamed.
    pub fn new_tensor_symbol(
        &mut self,
        params: TensorParams,
        name: &str,
    ) -> Result<TensorSymbol, CoreError> {
        self.table.push_tensor(params, optional_name(name))
    }

    /// Adds an exec symbol running `command` over `inputs` into `outputs`.
    ///
    /// Registered ops have their arity checked. Fails without mutation if an
    /// output already has a producer.
    pub fn new_exec_symbol(
        &mut self,
        command: Command,
        inputs: &[TensorSymbol],
        outputs: &[TensorSymbol],
        name: &str,
    ) -> Result<ExecSymbol, CoreError> {
        if let Some(descriptor) = registry::global().get(command.kind()) {
            descriptor.check_arity(inputs.len(), outputs.len())?;
        }
        self.push_exec(ExecSymbolInfo {
            kind: ExecKind::Command(command),
            inputs: SmallVec::from_slice(inputs),
            outputs: SmallVec::from_slice(outputs),
            name: name.to_string(),
            backend: None,
            pass: Pass::Forward,
        })
    }

    pub(crate) fn push_exec(&mut self, info: ExecSymbolInfo) -> Result<ExecSymbol, CoreError> {
        self.table.push_exec(info)
    }

    /// Pins an exec to a backend; the compiler otherwise picks its default.
    pub fn set_exec_backend(
        &mut self,
        exec: ExecSymbol,
        backend: BackendId,
    ) -> Result<(), CoreError> {
        self.table.exec_mut(exec)?.backend = Some(backend);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Case-of
    // -----------------------------------------------------------------------

    /// Declares a case-of node selecting a branch with `predicate`.
    ///
    /// Branches are attached afterwards with [`set_case_of`](Self::set_case_of).
    pub fn case_of_new<P>(
        &mut self,
        inputs: &[TensorSymbol],
        outputs: &[TensorSymbol],
        predicate: P,
        name: &str,
    ) -> Result<ExecSymbol, CoreError>
    where
        P: CaseOfPredicate + 'static,
    {
        let predicate: Arc<dyn CaseOfPredicate> = Arc::new(predicate);
        self.push_exec(ExecSymbolInfo {
            kind: ExecKind::CaseOf(CaseOf::new(predicate)),
            inputs: SmallVec::from_slice(inputs),
            outputs: SmallVec::from_slice(outputs),
            name: name.to_string(),
            backend: None,
            pass: Pass::Forward,
        })
    }

    pub fn case_of(&self, exec: ExecSymbol) -> Result<&CaseOf, CoreError> {
        match &self.table.exec(exec)?.kind {
            ExecKind::CaseOf(case_of) => Ok(case_of),
            _ => Err(CoreError::NotCaseOf { exec }),
        }
    }

    pub(crate) fn case_of_mut(&mut self, exec: ExecSymbol) -> Result<&mut CaseOf, CoreError> {
        match &mut self.table.exec_mut(exec)?.kind {
            ExecKind::CaseOf(case_of) => Ok(case_of),
            _ => Err(CoreError::NotCaseOf { exec }),
        }
    }

    /// Attaches `sub` as branch `index` of `case_of`.
    ///
    /// `inputs` maps sub-graph symbols to the case-of inputs that feed them;
    /// `outputs` maps sub-graph symbols to the case-of outputs they fill.
    /// Every case-of output must be covered by `outputs`. All checks run
    /// before the branch is stored.
    pub fn set_case_of(
        &mut self,
        case_of: ExecSymbol,
        index: usize,
        sub: SymbolicGraph,
        inputs: &[(TensorSymbol, TensorSymbol)],
        outputs: &[(TensorSymbol, TensorSymbol)],
    ) -> Result<(), CoreError> {
        let info = self.table.exec(case_of)?;
        let node = match &info.kind {
            ExecKind::CaseOf(node) => node,
            _ => return Err(CoreError::NotCaseOf { exec: case_of }),
        };
        if node.branches.contains_key(&index) {
            return Err(CoreError::BranchIndexConflict {
                exec: case_of,
                index,
            });
        }
        let invalid = |reason: String| CoreError::InvalidBranchMapping {
            exec: case_of,
            reason,
        };

        let mut input_map = IndexMap::new();
        for (inner, outer) in inputs {
            let inner_info = sub.tensor(*inner)?;
            if !info.inputs.contains(outer) {
                return Err(invalid(format!("{outer} is not an input of the case-of")));
            }
            if inner_info.producer.is_some() {
                return Err(invalid(format!(
                    "{inner} is produced inside the branch and cannot be fed from {outer}"
                )));
            }
            if inner_info.params != self.tensor(*outer)?.params {
                return Err(invalid(format!("{inner} and {outer} differ in shape or type")));
            }
            if input_map.values().any(|o| o == outer) {
                return Err(invalid(format!("{outer} feeds more than one branch tensor")));
            }
            if input_map.insert(*inner, *outer).is_some() {
                return Err(invalid(format!("{inner} is mapped twice")));
            }
        }

        let mut output_map = IndexMap::new();
        for (inner, outer) in outputs {
            let inner_info = sub.tensor(*inner)?;
            if !info.outputs.contains(outer) {
                return Err(invalid(format!("{outer} is not an output of the case-of")));
            }
            if input_map.contains_key(inner) {
                return Err(invalid(format!("{inner} is both a branch input and output")));
            }
            if inner_info.params != self.tensor(*outer)?.params {
                return Err(invalid(format!("{inner} and {outer} differ in shape or type")));
            }
            if output_map.values().any(|o| o == outer) {
                return Err(invalid(format!("{outer} is filled twice")));
            }
            if output_map.insert(*inner, *outer).is_some() {
                return Err(invalid(format!("{inner} is mapped twice")));
            }
        }
        for output in &info.outputs {
            if !output_map.values().any(|o| o == output) {
                return Err(CoreError::UnmappedOutput {
                    exec: case_of,
                    index,
                    output: *output,
                });
            }
        }

        tracing::debug!(
            case_of = %case_of,
            index,
            sub_scope = %sub.scope(),
            "attached case-of branch"
        );
        self.case_of_mut(case_of)?.branches.insert(
            index,
            CaseOfBranch {
                graph: sub,
                inputs: input_map,
                outputs: output_map,
            },
        );
        Ok(())
    }

    pub(crate) fn branch_graph_mut(
        &mut self,
        case_of: ExecSymbol,
        index: usize,
    ) -> Result<&mut SymbolicGraph, CoreError> {
        self.case_of_mut(case_of)?
            .branches
            .get_mut(&index)
            .map(|b| &mut b.graph)
            .ok_or(CoreError::BranchNotFound {
                exec: case_of,
                index,
            })
    }

    // -----------------------------------------------------------------------
    // Differentiation
    // -----------------------------------------------------------------------

    /// Differentiates `losses` with respect to `wrt` over the sub-DAG bounded
    /// by `sources..destinations`. See [`backward::backward`].
    pub fn backward(
        &mut self,
        sources: &[ExecSymbol],
        destinations: &[ExecSymbol],
        losses: &[TensorSymbol],
        wrt: &[TensorSymbol],
    ) -> Result<Gradients, CoreError> {
        backward::backward(
            self,
            sources,
            destinations,
            losses,
            wrt,
            &BackwardOptions::default(),
        )
    }

    // -----------------------------------------------------------------------
    // Fingerprint
    // -----------------------------------------------------------------------

    /// Structural hash over tensors, execs, commands, backend hints and
    /// branch sub-graphs with their remaps.
    ///
    /// Scope ids are excluded, so two graphs built by the same code hash the
    /// same. Predicates are opaque and not hashed.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        self.hash_into(&mut hasher);
        hasher.finalize().to_hex().to_string()
    }

    fn hash_into(&self, hasher: &mut blake3::Hasher) {
        hasher.update(&(self.tensor_count() as u64).to_le_bytes());
        for symbol in self.table.tensor_symbols() {
            if let Ok(info) = self.table.tensor(symbol) {
                hasher.update(&[info.params.datatype.size() as u8]);
                for dim in &info.params.dims {
                    hasher.update(&(*dim as u64).to_le_bytes());
                }
                hasher.update(b";");
            }
        }
        for symbol in self.table.exec_symbols() {
            let Ok(info) = self.table.exec(symbol) else {
                continue;
            };
            match &info.kind {
                ExecKind::Command(cmd) => {
                    let encoded = serde_json::to_vec(cmd).unwrap_or_default();
                    hasher.update(&encoded);
                }
                ExecKind::CaseOf(node) => {
                    hasher.update(b"case_of");
                    for (index, branch) in node.branches() {
                        hasher.update(&(index as u64).to_le_bytes());
                        branch.graph.hash_into(hasher);
                        for (inner, outer) in branch.inputs.iter().chain(branch.outputs.iter()) {
                            hasher.update(&inner.index.to_le_bytes());
                            hasher.update(&outer.index.to_le_bytes());
                        }
                    }
                }
                ExecKind::CaseOfBackward(node) => {
                    hasher.update(b"case_of_backward");
                    hasher.update(&node.forward.index.to_le_bytes());
                    for (index, branch) in node.branches() {
                        hasher.update(&(index as u64).to_le_bytes());
                        for exec in &branch.execs {
                            hasher.update(&exec.index.to_le_bytes());
                        }
                        hasher.update(b"|");
                        for (inner, outer) in branch.inputs.iter().chain(branch.outputs.iter()) {
                            hasher.update(&inner.index.to_le_bytes());
                            hasher.update(&outer.index.to_le_bytes());
                        }
                    }
                    for (d, g) in &node.pass_through {
                        hasher.update(&d.index.to_le_bytes());
                        match g {
                            Some(g) => hasher.update(&g.index.to_le_bytes()),
                            None => hasher.update(b"0"),
                        };
                    }
                }
            }
            let backend = serde_json::to_vec(&info.backend).unwrap_or_default();
            hasher.update(&backend);
            for t in &info.inputs {
                hasher.update(&t.index.to_le_bytes());
            }
            hasher.update(b"->");
            for t in &info.outputs {
                hasher.update(&t.index.to_le_bytes());
            }
            hasher.update(b";");
        }
    }
}
