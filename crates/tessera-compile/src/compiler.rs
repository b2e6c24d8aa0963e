//! The `compile` entry point.
//!
//! Compilation makes two passes over the scope tree. Planning walks the
//! compiled order of a scope, computes liveness, assigns offsets and then
//! recurses into every case-of branch the order touches, pinning mapped
//! tensors at their parent's offsets. Lowering walks the same orders again
//! and turns each exec into a unit whose operands resolve against the
//! finished layouts.
//!
//! A branch sub-graph is planned once even when both a case-of and its
//! backward node are compiled. Its order is the forward execs followed by
//! the backward execs of every compiled backward node, so intermediates the
//! gradient reads stay live until the backward unit has run.

use std::collections::{BTreeMap, HashMap, HashSet};

use indexmap::{IndexMap, IndexSet};
use smallvec::SmallVec;
use tessera_core::{
    CaseOf, CaseOfBackward, CoreError, ExecKind, ExecSymbol, ExecSymbolInfo, Pass, ScopeId,
    SymbolicGraph, TensorSymbol,
};

use crate::arena::{resolve_binding, Slot, TensorArena, TensorLayout};
use crate::error::CompileError;
use crate::exec_arena::{
    CaseOfUnit, CommandUnit, Direction, ExecUnit, GraphExecArena, TensorBinding,
};
use crate::liveness::{self, Interval};
use crate::planner::{self, align_up, PlanRequest};
use crate::CompileOptions;

// ---------------------------------------------------------------------------
// CompiledGraph
// ---------------------------------------------------------------------------

/// An executable graph: a planned tensor arena plus the units that run on it.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    arena: TensorArena,
    exec_arena: GraphExecArena,
    fingerprint: String,
    inputs: Vec<TensorSymbol>,
    outputs: Vec<TensorSymbol>,
    order: Vec<ExecSymbol>,
}

impl CompiledGraph {
    pub fn arena(&self) -> &TensorArena {
        &self.arena
    }

    pub fn exec_arena(&self) -> &GraphExecArena {
        &self.exec_arena
    }

    /// Structural fingerprint of the graph this was compiled from.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Whether `graph` changed structurally since compilation.
    pub fn is_stale(&self, graph: &SymbolicGraph) -> bool {
        graph.fingerprint() != self.fingerprint
    }

    pub fn inputs(&self) -> &[TensorSymbol] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorSymbol] {
        &self.outputs
    }

    /// Root-scope exec order the units follow.
    pub fn order(&self) -> &[ExecSymbol] {
        &self.order
    }

    pub fn read(&self, tensor: TensorSymbol) -> Result<Vec<f64>, CompileError> {
        self.arena.read(tensor)
    }

    pub fn write(&self, tensor: TensorSymbol, values: &[f64]) -> Result<(), CompileError> {
        self.arena.write(tensor, values)
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Compiles the execs of `graph` between `sources` and `destinations`
/// (empty means unbounded).
///
/// `inputs` are tensors the caller sets before a run and `outputs` are
/// tensors the caller reads after it. Both are pinned to bytes no other
/// tensor reuses. The graph is never modified.
pub fn compile(
    graph: &SymbolicGraph,
    inputs: &[TensorSymbol],
    outputs: &[TensorSymbol],
    sources: &[ExecSymbol],
    destinations: &[ExecSymbol],
    options: &CompileOptions,
) -> Result<CompiledGraph, CompileError> {
    check_options(options)?;
    let order = graph.exec_order_between(sources, destinations)?;
    check_bindings(graph, &order, inputs, outputs)?;

    let bound: IndexSet<TensorSymbol> = inputs.iter().chain(outputs).copied().collect();
    let mut builder = Builder::new(options);
    builder.plan(graph, &order, &IndexMap::new(), &bound)?;
    let exec_arena = builder.lower(graph, &order)?;

    tracing::debug!(
        scope = %graph.scope(),
        execs = order.len(),
        scopes = builder.layouts.len(),
        bytes = builder.size,
        "compiled graph"
    );

    Ok(CompiledGraph {
        arena: TensorArena::new(builder.layouts, builder.size),
        exec_arena,
        fingerprint: graph.fingerprint(),
        inputs: inputs.to_vec(),
        outputs: outputs.to_vec(),
        order,
    })
}

fn check_options(options: &CompileOptions) -> Result<(), CompileError> {
    if !options.alignment.is_power_of_two() {
        return Err(CompileError::InvalidOptions {
            reason: format!("alignment {} is not a power of two", options.alignment),
        });
    }
    Ok(())
}

fn unresolved(tensor: TensorSymbol, reason: impl Into<String>) -> CompileError {
    CompileError::UnresolvedBinding {
        tensor,
        reason: reason.into(),
    }
}

fn check_bindings(
    graph: &SymbolicGraph,
    order: &[ExecSymbol],
    inputs: &[TensorSymbol],
    outputs: &[TensorSymbol],
) -> Result<(), CompileError> {
    for t in inputs.iter().chain(outputs) {
        if t.scope != graph.scope() || graph.tensor(*t).is_err() {
            return Err(unresolved(*t, "not a tensor of the compiled graph"));
        }
    }
    let compiled: HashSet<ExecSymbol> = order.iter().copied().collect();
    for t in inputs {
        if let Some(producer) = graph.producer(*t)? {
            if compiled.contains(&producer) {
                return Err(unresolved(*t, format!("bound input is written by {producer}")));
            }
        }
    }
    for t in outputs {
        if let Some(producer) = graph.producer(*t)? {
            if !compiled.contains(&producer) && !inputs.contains(t) {
                return Err(unresolved(
                    *t,
                    format!("producer {producer} is outside the compiled order"),
                ));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// A tensor placed at a fixed, parent-owned offset.
#[derive(Debug, Clone, Copy)]
struct Pin {
    offset: usize,
    size: usize,
}

struct Builder<'o> {
    options: &'o CompileOptions,
    layouts: IndexMap<ScopeId, TensorLayout>,
    /// End of the last planned region.
    size: usize,
    /// Sub-graph order run by a case-of unit (forward or backward) for one
    /// branch.
    branch_orders: HashMap<(ExecSymbol, usize), Vec<ExecSymbol>>,
}

impl<'o> Builder<'o> {
    fn new(options: &'o CompileOptions) -> Self {
        Builder {
            options,
            layouts: IndexMap::new(),
            size: 0,
            branch_orders: HashMap::new(),
        }
    }

    // -- planning -----------------------------------------------------------

    fn plan(
        &mut self,
        graph: &SymbolicGraph,
        order: &[ExecSymbol],
        pinned: &IndexMap<TensorSymbol, Pin>,
        bound: &IndexSet<TensorSymbol>,
    ) -> Result<(), CompileError> {
        let layout = self.plan_layout(graph, order, pinned, bound)?;
        tracing::debug!(
            scope = %layout.scope,
            base = layout.base,
            bytes = layout.size,
            tensors = layout.slots.len(),
            "planned scope"
        );
        self.layouts.insert(graph.scope(), layout);

        for (forward, backwards) in case_of_groups(graph, order)? {
            let case_of = graph.case_of(forward)?;
            let forward_compiled = order.contains(&forward);
            for (index, branch) in case_of.branches() {
                let sub = branch.graph();
                let mut sub_order = Vec::new();
                let mut sub_pinned = IndexMap::new();

                if forward_compiled {
                    let forward_execs: Vec<ExecSymbol> = sub
                        .symbols()
                        .exec_symbols()
                        .filter(|e| sub.exec(*e).map_or(false, |info| info.pass == Pass::Forward))
                        .collect();
                    let forward_order = sub.order_of(&forward_execs)?;
                    sub_order.extend(forward_order.iter().copied());
                    self.branch_orders.insert((forward, index), forward_order);
                }
                for (inner, outer) in branch.input_map().iter().chain(branch.output_map()) {
                    sub_pinned.insert(*inner, self.pin(*outer)?);
                }

                for c_prime in &backwards {
                    let Some(backward) = backward_node(graph, *c_prime)?.branch(index) else {
                        continue;
                    };
                    let backward_order = sub.order_of(backward.execs())?;
                    sub_order.extend(backward_order.iter().copied());
                    self.branch_orders.insert((*c_prime, index), backward_order);
                    for (inner, outer) in backward.input_map().iter().chain(backward.output_map()) {
                        sub_pinned.insert(*inner, self.pin(*outer)?);
                    }
                }

                self.plan(sub, &sub_order, &sub_pinned, &IndexSet::new())?;
                tracing::debug!(
                    case_of = %forward,
                    index,
                    execs = sub_order.len(),
                    pinned = sub_pinned.len(),
                    "planned case-of branch"
                );
            }
        }
        Ok(())
    }

    fn plan_layout(
        &mut self,
        graph: &SymbolicGraph,
        order: &[ExecSymbol],
        pinned: &IndexMap<TensorSymbol, Pin>,
        bound: &IndexSet<TensorSymbol>,
    ) -> Result<TensorLayout, CompileError> {
        let end = order.len();
        let mut live = liveness::intervals(graph, order)?;
        for t in pinned.keys().chain(bound) {
            live.entry(*t).or_insert(Interval::new(0, end));
        }

        let mut fixed = IndexMap::new();
        let mut placed = Vec::new();
        let mut requests = Vec::new();
        for (t, interval) in live {
            let params = graph.tensor_params(t)?.clone();
            let size = params.byte_size();
            match pinned.get(&t) {
                Some(pin) if pin.size != size => {
                    return Err(CompileError::SizeMismatch {
                        tensor: t,
                        expected: pin.size,
                        found: size,
                    });
                }
                Some(pin) => {
                    fixed.insert(
                        t,
                        Slot {
                            offset: pin.offset,
                            params,
                            interval,
                            pinned: true,
                        },
                    );
                }
                None => {
                    requests.push(PlanRequest {
                        size,
                        interval,
                        reserved: bound.contains(&t),
                    });
                    placed.push((t, params, interval));
                }
            }
        }

        let alignment = self.options.alignment;
        let base = align_up(self.size, alignment);
        let plan = planner::assign(&requests, alignment, self.options.reuse_memory);
        self.size = base + plan.size;

        let mut slots = fixed;
        for ((t, params, interval), offset) in placed.into_iter().zip(plan.offsets) {
            slots.insert(
                t,
                Slot {
                    offset: base + offset,
                    params,
                    interval,
                    pinned: false,
                },
            );
        }
        let layout = TensorLayout {
            scope: graph.scope(),
            base,
            size: plan.size,
            slots,
        };
        layout.verify()?;
        Ok(layout)
    }

    /// Pin for a branch tensor mapped to `outer` in an already planned scope.
    fn pin(&self, outer: TensorSymbol) -> Result<Pin, CompileError> {
        let binding = resolve_binding(&self.layouts, outer)?;
        Ok(Pin {
            offset: binding.offset,
            size: binding.params.byte_size(),
        })
    }

    // -- lowering -----------------------------------------------------------

    fn lower(
        &self,
        graph: &SymbolicGraph,
        order: &[ExecSymbol],
    ) -> Result<GraphExecArena, CompileError> {
        let mut units = Vec::with_capacity(order.len());
        for exec in order {
            let info = graph.exec(*exec)?;
            let unit = match &info.kind {
                ExecKind::Command(command) => ExecUnit::Command(CommandUnit {
                    exec: *exec,
                    name: info.name.clone(),
                    command: command.clone(),
                    backend: info.backend.unwrap_or(self.options.default_backend),
                    inputs: self.bindings(&info.inputs)?,
                    outputs: self.bindings(&info.outputs)?,
                }),
                ExecKind::CaseOf(case_of) => {
                    ExecUnit::CaseOf(self.lower_case_of(*exec, info, case_of)?)
                }
                ExecKind::CaseOfBackward(backward) => {
                    ExecUnit::CaseOf(self.lower_case_of_backward(graph, *exec, info, backward)?)
                }
            };
            units.push(unit);
        }
        Ok(GraphExecArena {
            scope: graph.scope(),
            units,
        })
    }

    fn lower_case_of(
        &self,
        exec: ExecSymbol,
        info: &ExecSymbolInfo,
        case_of: &CaseOf,
    ) -> Result<CaseOfUnit, CompileError> {
        let inputs = self.bindings(&info.inputs)?.into_vec();
        let outputs = self.bindings(&info.outputs)?.into_vec();

        let pairs: Vec<(TensorBinding, TensorBinding)> = inputs
            .iter()
            .cloned()
            .zip(outputs.iter().cloned())
            .collect();
        let pass_through = (outputs.len() <= inputs.len() && same_sizes(&pairs)).then_some(pairs);

        let mut branches = BTreeMap::new();
        for (index, branch) in case_of.branches() {
            let arena = self.lower(branch.graph(), self.branch_order(exec, index))?;
            branches.insert(index, arena);
        }
        tracing::debug!(
            case_of = %exec,
            branches = branches.len(),
            pass_through = pass_through.is_some(),
            "lowered case-of"
        );

        Ok(CaseOfUnit {
            exec,
            name: info.name.clone(),
            direction: Direction::Forward,
            predicate: case_of.predicate().clone(),
            predicate_inputs: inputs,
            pass_through,
            zero_fill: Vec::new(),
            outputs,
            branches,
        })
    }

    fn lower_case_of_backward(
        &self,
        graph: &SymbolicGraph,
        exec: ExecSymbol,
        info: &ExecSymbolInfo,
        backward: &CaseOfBackward,
    ) -> Result<CaseOfUnit, CompileError> {
        let forward = backward.forward();
        let case_of = graph.case_of(forward)?;
        let arity = graph.exec(forward)?.inputs.len();
        let predicate_inputs = info
            .inputs
            .iter()
            .take(arity)
            .map(|t| self.binding(*t))
            .collect::<Result<Vec<_>, _>>()?;

        let mut pairs = Vec::new();
        let mut zero_fill = Vec::new();
        for (d, g) in backward.pass_through() {
            let d = self.binding(*d)?;
            match g {
                Some(g) => pairs.push((self.binding(*g)?, d)),
                None => zero_fill.push(d),
            }
        }
        let pass_through = same_sizes(&pairs).then_some(pairs);

        let mut branches = BTreeMap::new();
        for (index, _) in backward.branches() {
            let Some(branch) = case_of.branch(index) else {
                continue;
            };
            let arena = self.lower(branch.graph(), self.branch_order(exec, index))?;
            branches.insert(index, arena);
        }
        tracing::debug!(
            case_of = %exec,
            forward = %forward,
            branches = branches.len(),
            "lowered case-of backward"
        );

        Ok(CaseOfUnit {
            exec,
            name: info.name.clone(),
            direction: Direction::Backward,
            predicate: case_of.predicate().clone(),
            predicate_inputs,
            pass_through,
            zero_fill,
            outputs: self.bindings(&info.outputs)?.into_vec(),
            branches,
        })
    }

    fn branch_order(&self, exec: ExecSymbol, index: usize) -> &[ExecSymbol] {
        self.branch_orders
            .get(&(exec, index))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn binding(&self, tensor: TensorSymbol) -> Result<TensorBinding, CompileError> {
        resolve_binding(&self.layouts, tensor)
    }

    fn bindings(
        &self,
        tensors: &[TensorSymbol],
    ) -> Result<SmallVec<[TensorBinding; 4]>, CompileError> {
        tensors.iter().map(|t| self.binding(*t)).collect()
    }
}

fn same_sizes(pairs: &[(TensorBinding, TensorBinding)]) -> bool {
    pairs
        .iter()
        .all(|(from, to)| from.params.byte_size() == to.params.byte_size())
}

/// Forward case-ofs touched by `order`, each with the backward nodes of it
/// that `order` contains, in first-reference order.
fn case_of_groups(
    graph: &SymbolicGraph,
    order: &[ExecSymbol],
) -> Result<IndexMap<ExecSymbol, Vec<ExecSymbol>>, CompileError> {
    let mut groups: IndexMap<ExecSymbol, Vec<ExecSymbol>> = IndexMap::new();
    for exec in order {
        match &graph.exec(*exec)?.kind {
            ExecKind::CaseOf(_) => {
                groups.entry(*exec).or_default();
            }
            ExecKind::CaseOfBackward(backward) => {
                groups.entry(backward.forward()).or_default().push(*exec);
            }
            ExecKind::Command(_) => {}
        }
    }
    Ok(groups)
}

fn backward_node(graph: &SymbolicGraph, exec: ExecSymbol) -> Result<&CaseOfBackward, CompileError> {
    match &graph.exec(exec)?.kind {
        ExecKind::CaseOfBackward(backward) => Ok(backward),
        _ => Err(CoreError::NotCaseOf { exec }.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{Command, TensorParams};

    fn chain() -> (SymbolicGraph, [TensorSymbol; 5]) {
        // x -> exp -> a -> relu -> b -> log -> c -> exp -> d
        let mut graph = SymbolicGraph::new();
        let p = TensorParams::f32(&[4]);
        let x = graph.new_tensor_symbol(p.clone(), "x").unwrap();
        let a = graph.new_tensor_symbol(p.clone(), "a").unwrap();
        let b = graph.new_tensor_symbol(p.clone(), "b").unwrap();
        let c = graph.new_tensor_symbol(p.clone(), "c").unwrap();
        let d = graph.new_tensor_symbol(p, "d").unwrap();
        graph.new_exec_symbol(Command::EwExp, &[x], &[a], "exp").unwrap();
        graph.new_exec_symbol(Command::Relu, &[a], &[b], "relu").unwrap();
        graph.new_exec_symbol(Command::EwLog, &[b], &[c], "log").unwrap();
        graph.new_exec_symbol(Command::EwExp, &[c], &[d], "exp2").unwrap();
        (graph, [x, a, b, c, d])
    }

    #[test]
    fn chain_reuses_dead_slots() {
        let (graph, [x, a, b, c, d]) = chain();
        let compiled = compile(&graph, &[x], &[d], &[], &[], &CompileOptions::default()).unwrap();
        let arena = compiled.arena();
        let offset = |t| arena.slot(t).unwrap().offset;

        // c is defined after a's last use, so it takes a's bytes; the bound
        // tensors keep their own.
        assert_eq!(offset(c), offset(a));
        assert_ne!(offset(a), offset(b));
        assert_ne!(offset(x), offset(a));
        assert_ne!(offset(d), offset(a));
        assert_eq!(compiled.exec_arena().len(), 4);
        assert_eq!(arena.size(), 64);
    }

    #[test]
    fn no_reuse_gives_every_tensor_its_bytes() {
        let (graph, [x, _, _, _, d]) = chain();
        let options = CompileOptions {
            reuse_memory: false,
            ..CompileOptions::default()
        };
        let compiled = compile(&graph, &[x], &[d], &[], &[], &options).unwrap();
        assert_eq!(compiled.arena().size(), 80);
    }

    #[test]
    fn rejects_bad_alignment() {
        let (graph, [x, _, _, _, d]) = chain();
        let options = CompileOptions {
            alignment: 12,
            ..CompileOptions::default()
        };
        let err = compile(&graph, &[x], &[d], &[], &[], &options).unwrap_err();
        assert!(matches!(err, CompileError::InvalidOptions { .. }));
    }
}
