//! Reference interpreter over symbolic graphs.
//!
//! Evaluates a [`SymbolicGraph`] directly, without compiling it: every
//! tensor gets its own buffer, branch sub-graphs receive copies of the
//! parent values named by their remap tables, and kernels come straight
//! from the op registry. Compiled execution must agree with it.

use std::collections::HashMap;

use tessera_core::tensor::encode;
use tessera_core::{
    CaseOf, CaseOfBackward, CoreError, ExecKind, ExecSymbol, ExecSymbolInfo, Pass, ScopeId,
    SymbolicGraph, TensorParams, TensorSymbol, TensorView, TensorViewMut, PASS_THROUGH,
};

use crate::backend::execute;
use crate::error::RuntimeError;

/// Tensor values keyed by symbol. Symbols are unique across scopes, so
/// branch tensors share the map with the root graph.
pub struct Interpreter<'g> {
    graph: &'g SymbolicGraph,
    values: HashMap<TensorSymbol, Vec<u8>>,
}

impl<'g> Interpreter<'g> {
    pub fn new(graph: &'g SymbolicGraph) -> Self {
        Interpreter {
            graph,
            values: HashMap::new(),
        }
    }

    /// Sets a root or branch tensor before a run.
    pub fn set(&mut self, tensor: TensorSymbol, values: &[f64]) -> Result<(), RuntimeError> {
        let params = self.params_of(tensor)?;
        if values.len() != params.element_count() {
            return Err(RuntimeError::SizeMismatch {
                tensor,
                expected: params.element_count(),
                found: values.len(),
            });
        }
        self.values.insert(tensor, encode(&params, values));
        Ok(())
    }

    pub fn get(&self, tensor: TensorSymbol) -> Result<Vec<f64>, RuntimeError> {
        let params = self.params_of(tensor)?;
        let bytes = self
            .values
            .get(&tensor)
            .ok_or(RuntimeError::MissingValue { tensor })?;
        Ok(TensorView::new(&params, bytes).to_vec())
    }

    /// Evaluates the execs between `sources` and `destinations` (empty means
    /// unbounded).
    pub fn run(
        &mut self,
        sources: &[ExecSymbol],
        destinations: &[ExecSymbol],
    ) -> Result<(), RuntimeError> {
        let graph = self.graph;
        let order = graph.exec_order_between(sources, destinations)?;
        self.eval(graph, &order)
    }

    fn params_of(&self, tensor: TensorSymbol) -> Result<TensorParams, RuntimeError> {
        let graph =
            find_scope(self.graph, tensor.scope).ok_or(CoreError::TensorNotFound { tensor })?;
        Ok(graph.tensor_params(tensor)?.clone())
    }

    fn eval(&mut self, graph: &'g SymbolicGraph, order: &[ExecSymbol]) -> Result<(), RuntimeError> {
        for exec in order {
            let info = graph.exec(*exec)?;
            match &info.kind {
                ExecKind::Command(command) => {
                    let inputs = info
                        .inputs
                        .iter()
                        .map(|t| {
                            self.values
                                .get(t)
                                .cloned()
                                .ok_or(RuntimeError::MissingValue { tensor: *t })
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    let input_params = info
                        .inputs
                        .iter()
                        .map(|t| graph.tensor_params(*t).cloned())
                        .collect::<Result<Vec<_>, _>>()?;
                    let output_params = info
                        .outputs
                        .iter()
                        .map(|t| graph.tensor_params(*t).cloned())
                        .collect::<Result<Vec<_>, _>>()?;
                    let mut outputs: Vec<Vec<u8>> = info
                        .outputs
                        .iter()
                        .zip(&output_params)
                        .map(|(t, p)| {
                            self.values
                                .get(t)
                                .cloned()
                                .unwrap_or_else(|| vec![0u8; p.byte_size()])
                        })
                        .collect();

                    let views: Vec<TensorView<'_>> = input_params
                        .iter()
                        .zip(&inputs)
                        .map(|(p, b)| TensorView::new(p, b))
                        .collect();
                    {
                        let mut views_mut: Vec<TensorViewMut<'_>> = output_params
                            .iter()
                            .zip(outputs.iter_mut())
                            .map(|(p, b)| TensorViewMut::new(p, b))
                            .collect();
                        execute(command, &views, &mut views_mut).map_err(|source| {
                            RuntimeError::BackendDispatchFailure {
                                unit: *exec,
                                name: info.name.clone(),
                                backend: info.backend.unwrap_or_default(),
                                source,
                            }
                        })?;
                    }
                    for (t, bytes) in info.outputs.iter().zip(outputs) {
                        self.values.insert(*t, bytes);
                    }
                }
                ExecKind::CaseOf(case_of) => self.eval_case_of(graph, *exec, info, case_of)?,
                ExecKind::CaseOfBackward(backward) => {
                    self.eval_case_of_backward(graph, *exec, backward)?
                }
            }
        }
        Ok(())
    }

    fn select(
        &self,
        graph: &SymbolicGraph,
        case_of: &CaseOf,
        inputs: &[TensorSymbol],
    ) -> Result<i32, RuntimeError> {
        let params = inputs
            .iter()
            .map(|t| graph.tensor_params(*t).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        let bytes = inputs
            .iter()
            .map(|t| {
                self.values
                    .get(t)
                    .ok_or(RuntimeError::MissingValue { tensor: *t })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let views: Vec<TensorView<'_>> = params
            .iter()
            .zip(bytes)
            .map(|(p, b)| TensorView::new(p, b))
            .collect();
        Ok(case_of.predicate().select(&views))
    }

    fn copy(&mut self, from: TensorSymbol, to: TensorSymbol) -> Result<(), RuntimeError> {
        let bytes = self
            .values
            .get(&from)
            .cloned()
            .ok_or(RuntimeError::MissingValue { tensor: from })?;
        self.values.insert(to, bytes);
        Ok(())
    }

    fn eval_case_of(
        &mut self,
        graph: &'g SymbolicGraph,
        exec: ExecSymbol,
        info: &ExecSymbolInfo,
        case_of: &'g CaseOf,
    ) -> Result<(), RuntimeError> {
        let selected = self.select(graph, case_of, &info.inputs)?;
        tracing::trace!(case_of = %exec, selected, "interpreter case-of");

        if selected == PASS_THROUGH {
            if info.outputs.len() > info.inputs.len() {
                return Err(RuntimeError::PassThroughUnavailable { unit: exec });
            }
            for (input, output) in info.inputs.iter().zip(&info.outputs) {
                self.copy(*input, *output)?;
            }
            return Ok(());
        }

        let branch = usize::try_from(selected)
            .ok()
            .and_then(|index| case_of.branch(index))
            .ok_or(RuntimeError::MissingBranch {
                unit: exec,
                index: selected,
            })?;
        for (inner, outer) in branch.input_map() {
            self.copy(*outer, *inner)?;
        }
        let sub = branch.graph();
        let forward: Vec<ExecSymbol> = sub
            .symbols()
            .exec_symbols()
            .filter(|e| sub.exec(*e).map_or(false, |i| i.pass == Pass::Forward))
            .collect();
        let order = sub.order_of(&forward)?;
        self.eval(sub, &order)?;
        for (inner, outer) in branch.output_map() {
            self.copy(*inner, *outer)?;
        }
        Ok(())
    }

    fn eval_case_of_backward(
        &mut self,
        graph: &'g SymbolicGraph,
        exec: ExecSymbol,
        backward: &CaseOfBackward,
    ) -> Result<(), RuntimeError> {
        let forward = graph.exec(backward.forward())?;
        let case_of = graph.case_of(backward.forward())?;
        let selected = self.select(graph, case_of, &forward.inputs)?;
        tracing::trace!(case_of = %exec, selected, "interpreter case-of backward");

        if selected == PASS_THROUGH {
            for (d, g) in backward.pass_through() {
                match g {
                    Some(g) => self.copy(*g, *d)?,
                    None => {
                        let params = graph.tensor_params(*d)?;
                        self.values.insert(*d, vec![0u8; params.byte_size()]);
                    }
                }
            }
            return Ok(());
        }

        let index = usize::try_from(selected).ok();
        let (Some(branch), Some(gradient)) = (
            index.and_then(|k| case_of.branch(k)),
            index.and_then(|k| backward.branch(k)),
        ) else {
            return Err(RuntimeError::MissingBranch {
                unit: exec,
                index: selected,
            });
        };
        // Branch inputs are refreshed; seeds take the parent output gradients.
        for (inner, outer) in branch.input_map().iter().chain(gradient.input_map()) {
            self.copy(*outer, *inner)?;
        }
        let sub = branch.graph();
        let order = sub.order_of(gradient.execs())?;
        self.eval(sub, &order)?;
        for (inner, outer) in gradient.output_map() {
            self.copy(*inner, *outer)?;
        }
        Ok(())
    }
}

/// The graph owning `scope`: the root or a branch sub-graph at any depth.
fn find_scope(graph: &SymbolicGraph, scope: ScopeId) -> Option<&SymbolicGraph> {
    if graph.scope() == scope {
        return Some(graph);
    }
    graph.symbols().exec_symbols().find_map(|exec| match &graph.exec(exec).ok()?.kind {
        ExecKind::CaseOf(case_of) => case_of
            .branches()
            .find_map(|(_, branch)| find_scope(branch.graph(), scope)),
        _ => None,
    })
}
