//! Reverse-mode differentiation over a symbolic graph.
//!
//! [`backward`] appends gradient execs to the graph it is given and returns
//! the gradient symbol of every requested tensor. The forward part of the
//! graph is never modified.
//!
//! # Algorithm
//!
//! 1. Order the execs between `sources` and `destinations` topologically.
//! 2. Mark every tensor reachable forward from `wrt` and every tensor that
//!    reaches a loss backward. An exec is differentiated only when it has an
//!    input in the first set and an output in the second.
//! 3. Walk the relevant execs in reverse order. Each output's gradient is the
//!    sum of the contributions of its consumers, summed in ascending
//!    consumer exec index with one `EwSum` exec; the loss seed, if any,
//!    comes first.
//! 4. Call the op's gradient rule, which emits backward execs and returns
//!    one optional gradient per input.
//!
//! # Case-of
//!
//! A case-of is differentiated by running the same algorithm inside each
//! branch sub-graph, seeded from the parent's output gradients. The backward
//! execs are appended to the branch sub-graph itself, so they can read the
//! forward intermediates. The parent gets one `CaseOfBackward` exec that
//! selects the same branch at run time. Inputs whose branch gradient is
//! missing are zero-filled in that branch.
//!
//! # Failure
//!
//! On any error the graph is restored to its state before the call.

use std::collections::{BTreeMap, HashMap, HashSet};

use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::case_of::{BackwardBranch, CaseOfBackward};
use crate::cmd::Command;
use crate::error::CoreError;
use crate::graph::SymbolicGraph;
use crate::id::{ExecSymbol, TensorSymbol};
use crate::registry;
use crate::symbol::{ExecKind, ExecSymbolInfo, Pass};
use crate::tensor::TensorParams;

// ---------------------------------------------------------------------------
// Gradient rule API
// ---------------------------------------------------------------------------

/// What a gradient rule sees of the forward exec it differentiates.
#[derive(Debug, Clone, Copy)]
pub struct GradientInput<'a> {
    pub command: &'a Command,
    pub inputs: &'a [TensorSymbol],
    pub outputs: &'a [TensorSymbol],
    /// Gradient of each output; `None` when nothing flows back through it.
    pub output_grads: &'a [Option<TensorSymbol>],
    /// Whether each input needs a gradient.
    pub needs: &'a [bool],
}

/// Handle through which gradient rules add backward symbols.
///
/// Every exec added here is marked [`Pass::Backward`] and recorded.
pub struct GradientContext<'g> {
    graph: &'g mut SymbolicGraph,
    created: Vec<ExecSymbol>,
}

impl<'g> GradientContext<'g> {
    pub(crate) fn new(graph: &'g mut SymbolicGraph) -> Self {
        GradientContext {
            graph,
            created: Vec::new(),
        }
    }

    pub(crate) fn finish(self) -> Vec<ExecSymbol> {
        self.created
    }

    pub fn params(&self, symbol: TensorSymbol) -> Result<TensorParams, CoreError> {
        Ok(self.graph.tensor_params(symbol)?.clone())
    }

    pub fn new_tensor(&mut self, params: TensorParams, name: &str) -> Result<TensorSymbol, CoreError> {
        self.graph.new_tensor_symbol(params, name)
    }

    /// A fresh tensor shaped like `of`, named after it.
    pub fn gradient_tensor(&mut self, of: TensorSymbol) -> Result<TensorSymbol, CoreError> {
        let params = self.params(of)?;
        let name = format!("∂{}", self.graph.tensor_name(of));
        self.graph.new_tensor_symbol(params, &name)
    }

    /// Adds a backward exec.
    pub fn exec(
        &mut self,
        command: Command,
        inputs: &[TensorSymbol],
        outputs: &[TensorSymbol],
        name: &str,
    ) -> Result<ExecSymbol, CoreError> {
        if let Some(descriptor) = registry::global().get(command.kind()) {
            descriptor.check_arity(inputs.len(), outputs.len())?;
        }
        let exec = self.graph.push_exec(ExecSymbolInfo {
            kind: ExecKind::Command(command),
            inputs: SmallVec::from_slice(inputs),
            outputs: SmallVec::from_slice(outputs),
            name: name.to_string(),
            backend: None,
            pass: Pass::Backward,
        })?;
        self.created.push(exec);
        Ok(exec)
    }

    /// Runs `command` on `inputs` into a new gradient tensor for `wrt`.
    pub fn grad_of(
        &mut self,
        command: Command,
        inputs: &[TensorSymbol],
        wrt: TensorSymbol,
    ) -> Result<TensorSymbol, CoreError> {
        let out = self.gradient_tensor(wrt)?;
        let name = format!("grad_{}", command.kind()).to_lowercase();
        self.exec(command, inputs, &[out], &name)?;
        Ok(out)
    }

    /// Runs `command` on `inputs` into an unnamed tensor shaped like `like`.
    pub fn temp(
        &mut self,
        command: Command,
        inputs: &[TensorSymbol],
        like: TensorSymbol,
    ) -> Result<TensorSymbol, CoreError> {
        let out = self.new_tensor(self.params(like)?, "")?;
        let name = format!("grad_{}", command.kind()).to_lowercase();
        self.exec(command, inputs, &[out], &name)?;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Request / result
// ---------------------------------------------------------------------------

/// Options for [`backward`].
#[derive(Debug, Clone, Default)]
pub struct BackwardOptions {
    /// Add a `Set { value: 1.0 }` exec filling each loss seed. Otherwise the
    /// caller writes the seeds before running.
    pub seed_ones: bool,
    /// Tensors whose gradient must exist; a missing one is `NoGradientPath`.
    pub required: Vec<TensorSymbol>,
}

/// Result of [`backward`].
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    seeds: IndexMap<TensorSymbol, TensorSymbol>,
    gradients: IndexMap<TensorSymbol, TensorSymbol>,
    execs: Vec<ExecSymbol>,
}

impl Gradients {
    /// The seed tensor holding the incoming gradient of `loss`.
    pub fn seed(&self, loss: TensorSymbol) -> Option<TensorSymbol> {
        self.seeds.get(&loss).copied()
    }

    /// Gradient symbol of `wrt`, or `None` if no loss depends on it.
    pub fn gradient(&self, wrt: TensorSymbol) -> Option<TensorSymbol> {
        self.gradients.get(&wrt).copied()
    }

    /// `(loss, seed)` pairs in request order.
    pub fn seeds(&self) -> impl Iterator<Item = (TensorSymbol, TensorSymbol)> + '_ {
        self.seeds.iter().map(|(l, s)| (*l, *s))
    }

    /// `(wrt, gradient)` pairs in request order.
    pub fn gradients(&self) -> impl Iterator<Item = (TensorSymbol, TensorSymbol)> + '_ {
        self.gradients.iter().map(|(w, g)| (*w, *g))
    }

    /// Every exec the call appended to the graph, in creation order.
    pub fn execs(&self) -> &[ExecSymbol] {
        &self.execs
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Differentiates `losses` with respect to `wrt` over the execs between
/// `sources` and `destinations` (empty means unbounded).
///
/// One seed tensor is created per loss. Tensors with no path to any loss
/// get no gradient; that is an error only for tensors listed in
/// [`BackwardOptions::required`].
pub fn backward(
    graph: &mut SymbolicGraph,
    sources: &[ExecSymbol],
    destinations: &[ExecSymbol],
    losses: &[TensorSymbol],
    wrt: &[TensorSymbol],
    options: &BackwardOptions,
) -> Result<Gradients, CoreError> {
    let snapshot = graph.snapshot();
    match backward_inner(graph, sources, destinations, losses, wrt, options) {
        Ok(gradients) => Ok(gradients),
        Err(err) => {
            tracing::debug!(error = %err, "backward failed, graph restored");
            *graph = snapshot;
            Err(err)
        }
    }
}

fn backward_inner(
    graph: &mut SymbolicGraph,
    sources: &[ExecSymbol],
    destinations: &[ExecSymbol],
    losses: &[TensorSymbol],
    wrt: &[TensorSymbol],
    options: &BackwardOptions,
) -> Result<Gradients, CoreError> {
    for t in losses.iter().chain(wrt).chain(&options.required) {
        graph.tensor(*t)?;
    }
    let order = graph.exec_order_between(sources, destinations)?;

    let mut result = Gradients::default();
    let mut ctx = GradientContext::new(graph);
    for loss in losses {
        let seed = ctx.gradient_tensor(*loss)?;
        if options.seed_ones {
            ctx.exec(Command::Set { value: 1.0 }, &[], &[seed], "seed")?;
        }
        result.seeds.insert(*loss, seed);
    }
    result.execs = ctx.finish();

    let seeds: Vec<(TensorSymbol, TensorSymbol)> = result.seeds().collect();
    let pass = differentiate(graph, &order, &seeds, wrt)?;
    result.execs.extend(pass.execs);

    for t in &options.required {
        if !pass.gradients.contains_key(t) {
            return Err(CoreError::NoGradientPath { tensor: *t });
        }
    }
    result.gradients = pass.gradients;

    tracing::debug!(
        scope = %graph.scope(),
        losses = losses.len(),
        wrt = wrt.len(),
        gradients = result.gradients.len(),
        execs = result.execs.len(),
        "backward"
    );
    Ok(result)
}

// ---------------------------------------------------------------------------
// Core pass, shared by the root graph and branch sub-graphs
// ---------------------------------------------------------------------------

struct PassResult {
    /// wrt -> gradient, only for tensors that got one.
    gradients: IndexMap<TensorSymbol, TensorSymbol>,
    execs: Vec<ExecSymbol>,
}

type RemapTable = IndexMap<TensorSymbol, TensorSymbol>;

/// Pending gradient contributions per tensor. `None` orders the loss seed
/// before every consumer.
type Contributions = HashMap<TensorSymbol, Vec<(Option<u32>, TensorSymbol)>>;

fn differentiate(
    graph: &mut SymbolicGraph,
    order: &[ExecSymbol],
    seeds: &[(TensorSymbol, TensorSymbol)],
    wrt: &[TensorSymbol],
) -> Result<PassResult, CoreError> {
    // Tensors that depend on wrt.
    let mut wrt_reach: HashSet<TensorSymbol> = wrt.iter().copied().collect();
    for exec in order {
        let info = graph.exec(*exec)?;
        if info.inputs.iter().any(|t| wrt_reach.contains(t)) {
            wrt_reach.extend(info.outputs.iter().copied());
        }
    }
    // Tensors some loss depends on.
    let mut loss_reach: HashSet<TensorSymbol> = seeds.iter().map(|(l, _)| *l).collect();
    for exec in order.iter().rev() {
        let info = graph.exec(*exec)?;
        if info.outputs.iter().any(|t| loss_reach.contains(t)) {
            loss_reach.extend(info.inputs.iter().copied());
        }
    }

    let mut contributions: Contributions = HashMap::new();
    for (loss, seed) in seeds {
        contributions.entry(*loss).or_default().push((None, *seed));
    }
    let mut resolved: HashMap<TensorSymbol, Option<TensorSymbol>> = HashMap::new();
    let mut created = Vec::new();

    for exec in order.iter().rev() {
        let info = graph.exec(*exec)?;
        let relevant = info.inputs.iter().any(|t| wrt_reach.contains(t))
            && info.outputs.iter().any(|t| loss_reach.contains(t));
        if !relevant {
            continue;
        }
        let target = Target::of(&info.kind);
        let label = info.kind.label();
        let inputs = info.inputs.clone();
        let outputs = info.outputs.clone();

        let mut output_grads = Vec::with_capacity(outputs.len());
        for output in &outputs {
            output_grads.push(resolve(
                graph,
                *output,
                &mut contributions,
                &mut resolved,
                &mut created,
            )?);
        }
        if output_grads.iter().all(Option::is_none) {
            continue;
        }
        let needs: Vec<bool> = inputs.iter().map(|t| wrt_reach.contains(t)).collect();

        let input_grads = match &target {
            Target::Command(command) => {
                let kind = command.kind();
                let rule = registry::global()
                    .gradient(kind)
                    .ok_or(CoreError::UnsupportedOperation { kind })?;
                let mut ctx = GradientContext::new(graph);
                let grads = rule(
                    &mut ctx,
                    &GradientInput {
                        command,
                        inputs: &inputs,
                        outputs: &outputs,
                        output_grads: &output_grads,
                        needs: &needs,
                    },
                )?;
                created.extend(ctx.finish());
                grads
            }
            Target::CaseOf => {
                let (grads, c_prime) = case_of_backward(graph, *exec, &output_grads, &needs)?;
                created.push(c_prime);
                grads
            }
            Target::Opaque => {
                return Err(CoreError::NotDifferentiable { exec: *exec });
            }
        };

        tracing::trace!(
            exec = %exec,
            label = %label,
            gradients = input_grads.iter().flatten().count(),
            "differentiated exec"
        );
        for (i, grad) in input_grads.into_iter().enumerate() {
            if let (Some(grad), Some(input)) = (grad, inputs.get(i)) {
                if needs[i] {
                    contributions
                        .entry(*input)
                        .or_default()
                        .push((Some(exec.index), grad));
                }
            }
        }
    }

    let mut gradients = IndexMap::new();
    for t in wrt {
        if let Some(grad) = resolve(graph, *t, &mut contributions, &mut resolved, &mut created)? {
            gradients.insert(*t, grad);
        }
    }
    Ok(PassResult {
        gradients,
        execs: created,
    })
}

/// What the pass does with a relevant exec.
enum Target {
    Command(Command),
    CaseOf,
    Opaque,
}

impl Target {
    fn of(kind: &ExecKind) -> Self {
        match kind {
            ExecKind::Command(command) => Target::Command(command.clone()),
            ExecKind::CaseOf(_) => Target::CaseOf,
            ExecKind::CaseOfBackward(_) => Target::Opaque,
        }
    }
}

/// Collapses the contributions of `tensor` into one gradient symbol.
fn resolve(
    graph: &mut SymbolicGraph,
    tensor: TensorSymbol,
    contributions: &mut Contributions,
    resolved: &mut HashMap<TensorSymbol, Option<TensorSymbol>>,
    created: &mut Vec<ExecSymbol>,
) -> Result<Option<TensorSymbol>, CoreError> {
    if let Some(done) = resolved.get(&tensor) {
        return Ok(*done);
    }
    let mut parts = contributions.remove(&tensor).unwrap_or_default();
    parts.sort_by_key(|(consumer, _)| *consumer);
    let grad = match parts.as_slice() {
        [] => None,
        [(_, only)] => Some(*only),
        _ => {
            let terms: Vec<TensorSymbol> = parts.iter().map(|(_, g)| *g).collect();
            let mut ctx = GradientContext::new(graph);
            let sum = ctx.grad_of(Command::EwSum, &terms, tensor)?;
            created.extend(ctx.finish());
            Some(sum)
        }
    };
    resolved.insert(tensor, grad);
    Ok(grad)
}

// ---------------------------------------------------------------------------
// Case-of
// ---------------------------------------------------------------------------

/// Differentiates every branch of `case_of` in place and adds the parent's
/// `CaseOfBackward` exec.
///
/// The new exec reads the forward inputs, the forward outputs and the
/// present output gradients, in that order, and writes one gradient per
/// needed input.
fn case_of_backward(
    graph: &mut SymbolicGraph,
    case_of: ExecSymbol,
    output_grads: &[Option<TensorSymbol>],
    needs: &[bool],
) -> Result<(Vec<Option<TensorSymbol>>, ExecSymbol), CoreError> {
    let (inputs, outputs, name) = {
        let info = graph.exec(case_of)?;
        (info.inputs.clone(), info.outputs.clone(), info.name.clone())
    };
    let input_params = inputs
        .iter()
        .map(|t| graph.tensor_params(*t).cloned())
        .collect::<Result<Vec<_>, _>>()?;

    // Parent-side gradient tensors, shared by all branches.
    let mut ctx = GradientContext::new(graph);
    let mut input_grads: Vec<Option<TensorSymbol>> = Vec::with_capacity(inputs.len());
    for (i, input) in inputs.iter().enumerate() {
        input_grads.push(if needs[i] {
            Some(ctx.gradient_tensor(*input)?)
        } else {
            None
        });
    }
    ctx.finish();

    let branch_maps: Vec<(usize, RemapTable, RemapTable)> = graph
        .case_of(case_of)?
        .branches()
        .map(|(k, b)| (k, b.inputs.clone(), b.outputs.clone()))
        .collect();

    let mut branches = BTreeMap::new();
    for (index, input_map, output_map) in branch_maps {
        let sub = graph.branch_graph_mut(case_of, index)?;
        let branch = differentiate_branch(
            sub,
            BranchPorts {
                inputs: &inputs,
                input_params: &input_params,
                outputs: &outputs,
                input_map: &input_map,
                output_map: &output_map,
            },
            output_grads,
            &input_grads,
        )?;
        tracing::debug!(
            case_of = %case_of,
            index,
            execs = branch.execs.len(),
            "differentiated case-of branch"
        );
        branches.insert(index, branch);
    }

    let pass_through = input_grads
        .iter()
        .enumerate()
        .filter_map(|(i, d)| d.map(|d| (d, output_grads.get(i).copied().flatten())))
        .collect();

    let mut c_inputs: SmallVec<[TensorSymbol; 4]> = inputs;
    c_inputs.extend(outputs.iter().copied());
    c_inputs.extend(output_grads.iter().flatten().copied());
    let c_outputs: SmallVec<[TensorSymbol; 4]> = input_grads.iter().flatten().copied().collect();

    let c_prime = graph.push_exec(ExecSymbolInfo {
        kind: ExecKind::CaseOfBackward(CaseOfBackward {
            forward: case_of,
            branches,
            pass_through,
        }),
        inputs: c_inputs,
        outputs: c_outputs,
        name: format!("{name}_backward"),
        backend: None,
        pass: Pass::Backward,
    })?;
    Ok((input_grads, c_prime))
}

/// Forward wiring of one branch, seen from the parent.
struct BranchPorts<'a> {
    inputs: &'a [TensorSymbol],
    input_params: &'a [TensorParams],
    outputs: &'a [TensorSymbol],
    input_map: &'a RemapTable,
    output_map: &'a RemapTable,
}

fn differentiate_branch(
    sub: &mut SymbolicGraph,
    ports: BranchPorts<'_>,
    output_grads: &[Option<TensorSymbol>],
    input_grads: &[Option<TensorSymbol>],
) -> Result<BackwardBranch, CoreError> {
    let forward_order: Vec<ExecSymbol> = sub
        .exec_order_between(&[], &[])?
        .into_iter()
        .filter(|e| sub.exec(*e).map_or(false, |info| info.pass == Pass::Forward))
        .collect();

    // Seed each branch output that has a parent gradient.
    let mut seeds = Vec::new();
    let mut seed_map = IndexMap::new();
    for (inner, outer) in ports.output_map {
        let Some(j) = ports.outputs.iter().position(|o| o == outer) else {
            continue;
        };
        if let Some(g) = output_grads[j] {
            let mut ctx = GradientContext::new(sub);
            let seed = ctx.gradient_tensor(*inner)?;
            seeds.push((*inner, seed));
            seed_map.insert(seed, g);
        }
    }

    // Branch tensors standing for needed parent inputs.
    let mut wrt = Vec::new();
    let mut targets = Vec::new();
    for (i, parent) in ports.inputs.iter().enumerate() {
        let Some(d) = input_grads[i] else {
            continue;
        };
        let inner = ports
            .input_map
            .iter()
            .find(|(_, o)| *o == parent)
            .map(|(inner, _)| *inner);
        targets.push((inner, d, &ports.input_params[i]));
        wrt.extend(inner);
    }

    let pass = differentiate(sub, &forward_order, &seeds, &wrt)?;
    let mut execs = pass.execs;

    // Every parent gradient gets its own branch tensor with a producer.
    let mut grad_map = IndexMap::new();
    let mut ctx = GradientContext::new(sub);
    for (inner, d, params) in targets {
        let grad = inner.and_then(|t| pass.gradients.get(&t).copied());
        let out = match grad {
            None => {
                let zero = ctx.new_tensor(params.clone(), "")?;
                ctx.exec(Command::Set { value: 0.0 }, &[], &[zero], "zero_grad")?;
                zero
            }
            Some(g) if seed_map.contains_key(&g) || grad_map.contains_key(&g) => {
                let copy = ctx.new_tensor(params.clone(), "")?;
                ctx.exec(Command::DataTransfer, &[g], &[copy], "copy_grad")?;
                copy
            }
            Some(g) => g,
        };
        grad_map.insert(out, d);
    }
    execs.extend(ctx.finish());

    Ok(BackwardBranch {
        execs,
        inputs: seed_map,
        outputs: grad_map,
    })
}
