//! Case-of nodes: data-dependent selection between branch sub-graphs.
//!
//! A case-of exec owns its branch sub-graphs outright. A branch never names
//! parent symbols; instead it carries two by-value remap tables:
//!
//! - `inputs`: sub-graph symbol <- parent case-of input
//! - `outputs`: sub-graph symbol -> parent case-of output
//!
//! At run time the predicate is evaluated against the current values of the
//! case-of inputs. A non-negative result selects that branch; [`PASS_THROUGH`]
//! copies input *i* to output *i* without running any branch.
//!
//! The differentiator turns a case-of into a [`CaseOfBackward`] exec in the
//! same parent scope. It does not own sub-graphs: each backward branch lists
//! backward execs that were appended to the forward branch's sub-graph, so
//! the forward branch's intermediate tensors stay addressable by them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::graph::SymbolicGraph;
use crate::id::{ExecSymbol, TensorSymbol};
use crate::tensor::TensorView;

/// Predicate result meaning "copy inputs to outputs unmodified".
pub const PASS_THROUGH: i32 = -1;

/// Branch selector for a case-of node.
///
/// Receives typed views of the case-of inputs, in declaration order, and
/// returns a branch index or [`PASS_THROUGH`]. Any state the predicate needs
/// travels with the implementor.
pub trait CaseOfPredicate: Send + Sync {
    fn select(&self, inputs: &[TensorView<'_>]) -> i32;
}

impl<F> CaseOfPredicate for F
where
    F: Fn(&[TensorView<'_>]) -> i32 + Send + Sync,
{
    fn select(&self, inputs: &[TensorView<'_>]) -> i32 {
        self(inputs)
    }
}

/// One attached branch of a case-of node.
#[derive(Debug)]
pub struct CaseOfBranch {
    pub(crate) graph: SymbolicGraph,
    /// sub-graph symbol <- parent input symbol
    pub(crate) inputs: IndexMap<TensorSymbol, TensorSymbol>,
    /// sub-graph symbol -> parent output symbol
    pub(crate) outputs: IndexMap<TensorSymbol, TensorSymbol>,
}

impl Clone for CaseOfBranch {
    fn clone(&self) -> Self {
        CaseOfBranch {
            graph: self.graph.snapshot(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
        }
    }
}

impl CaseOfBranch {
    pub fn graph(&self) -> &SymbolicGraph {
        &self.graph
    }

    pub fn input_map(&self) -> &IndexMap<TensorSymbol, TensorSymbol> {
        &self.inputs
    }

    pub fn output_map(&self) -> &IndexMap<TensorSymbol, TensorSymbol> {
        &self.outputs
    }
}

/// A forward case-of node.
#[derive(Clone)]
pub struct CaseOf {
    pub(crate) predicate: Arc<dyn CaseOfPredicate>,
    pub(crate) branches: BTreeMap<usize, CaseOfBranch>,
}

impl CaseOf {
    pub(crate) fn new(predicate: Arc<dyn CaseOfPredicate>) -> Self {
        CaseOf {
            predicate,
            branches: BTreeMap::new(),
        }
    }

    pub fn predicate(&self) -> &Arc<dyn CaseOfPredicate> {
        &self.predicate
    }

    pub fn branch(&self, index: usize) -> Option<&CaseOfBranch> {
        self.branches.get(&index)
    }

    /// Branches in ascending index order.
    pub fn branches(&self) -> impl Iterator<Item = (usize, &CaseOfBranch)> {
        self.branches.iter().map(|(i, b)| (*i, b))
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }
}

impl fmt::Debug for CaseOf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaseOf")
            .field("branches", &self.branches)
            .finish_non_exhaustive()
    }
}

/// Backward view of one forward branch.
#[derive(Debug, Clone, Default)]
pub struct BackwardBranch {
    /// Backward execs appended to the forward branch's sub-graph.
    pub(crate) execs: Vec<ExecSymbol>,
    /// sub-graph gradient seed <- parent output gradient
    pub(crate) inputs: IndexMap<TensorSymbol, TensorSymbol>,
    /// sub-graph input gradient -> parent input gradient
    pub(crate) outputs: IndexMap<TensorSymbol, TensorSymbol>,
}

impl BackwardBranch {
    pub fn execs(&self) -> &[ExecSymbol] {
        &self.execs
    }

    pub fn input_map(&self) -> &IndexMap<TensorSymbol, TensorSymbol> {
        &self.inputs
    }

    pub fn output_map(&self) -> &IndexMap<TensorSymbol, TensorSymbol> {
        &self.outputs
    }
}

/// Gradient of a case-of node.
///
/// The exec's inputs start with the forward case-of's inputs in the same
/// order, so the forward predicate can be reused unchanged.
#[derive(Debug, Clone)]
pub struct CaseOfBackward {
    pub(crate) forward: ExecSymbol,
    pub(crate) branches: BTreeMap<usize, BackwardBranch>,
    /// Identity used on pass-through: `(input gradient, output gradient)`.
    /// `None` means no gradient flows back and the input gradient is zeroed.
    pub(crate) pass_through: Vec<(TensorSymbol, Option<TensorSymbol>)>,
}

impl CaseOfBackward {
    /// The forward case-of this node differentiates.
    pub fn forward(&self) -> ExecSymbol {
        self.forward
    }

    pub fn branch(&self, index: usize) -> Option<&BackwardBranch> {
        self.branches.get(&index)
    }

    pub fn branches(&self) -> impl Iterator<Item = (usize, &BackwardBranch)> {
        self.branches.iter().map(|(i, b)| (*i, b))
    }

    pub fn pass_through(&self) -> &[(TensorSymbol, Option<TensorSymbol>)] {
        &self.pass_through
    }
}
