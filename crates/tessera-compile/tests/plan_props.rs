//! Property tests for memory-plan soundness.

use proptest::prelude::*;
use tessera_compile::{compile, liveness, CompileOptions, CompiledGraph};
use tessera_core::{
    backward, BackwardOptions, Command, ExecKind, SymbolicGraph, TensorParams, TensorSymbol,
    TensorView,
};

/// Exec `i` sums two tensors chosen among `0..=i` into tensor `i + 1`.
/// Every tensor has the same shape; sizes only vary across cases.
fn build(picks: &[(usize, usize)], len: usize) -> (SymbolicGraph, Vec<TensorSymbol>) {
    let mut graph = SymbolicGraph::new();
    let tensors: Vec<_> = (0..=picks.len())
        .map(|i| {
            graph
                .new_tensor_symbol(TensorParams::f32(&[len]), &format!("t{i}"))
                .unwrap()
        })
        .collect();
    for (i, (a, b)) in picks.iter().enumerate() {
        let inputs = [tensors[a % (i + 1)], tensors[b % (i + 1)]];
        graph
            .new_exec_symbol(Command::EwSum, &inputs, &[tensors[i + 1]], &format!("e{i}"))
            .unwrap();
    }
    (graph, tensors)
}

/// A summing chain feeding a two-branch case-of, differentiated `passes`
/// times. Branch 0 applies `ops` to its input; branch 1 sets a constant.
/// Every pass gets a user exec reading its gradient.
///
/// Returns the graph, the compiled inputs and the compiled outputs.
fn build_case_of(
    picks: &[(usize, usize)],
    ops: &[u8],
    passes: usize,
    len: usize,
) -> (SymbolicGraph, Vec<TensorSymbol>, Vec<TensorSymbol>) {
    let params = || TensorParams::f32(&[len]);
    let (mut graph, tensors) = build(picks, len);
    let x = tensors[0];
    let c = tensors[tensors.len() - 1];
    let y = graph.new_tensor_symbol(params(), "y").unwrap();
    let case_of = graph
        .case_of_new(&[c], &[y], |_: &[TensorView<'_>]| 0, "case")
        .unwrap();

    let mut sub = SymbolicGraph::new();
    let ci = sub.new_tensor_symbol(params(), "ci").unwrap();
    let mut prev = ci;
    for (k, op) in ops.iter().enumerate() {
        let next = sub.new_tensor_symbol(params(), &format!("b{k}")).unwrap();
        let (command, inputs) = match op % 3 {
            0 => (Command::Scale { alpha: 0.5 }, vec![prev]),
            1 => (Command::EwProd, vec![prev, ci]),
            _ => (Command::EwSum, vec![prev, ci]),
        };
        sub.new_exec_symbol(command, &inputs, &[next], &format!("op{k}"))
            .unwrap();
        prev = next;
    }
    graph
        .set_case_of(case_of, 0, sub, &[(ci, c)], &[(prev, y)])
        .unwrap();

    let mut sub = SymbolicGraph::new();
    let yi = sub.new_tensor_symbol(params(), "yi").unwrap();
    sub.new_exec_symbol(Command::Set { value: 0.0 }, &[], &[yi], "set")
        .unwrap();
    graph.set_case_of(case_of, 1, sub, &[], &[(yi, y)]).unwrap();

    let mut inputs = vec![x];
    let mut outputs = vec![y];
    for pass in 0..passes {
        // The first pass runs through the whole chain; later ones only
        // through the case-of.
        let (bounds, wrt) = if pass == 0 {
            (vec![], x)
        } else {
            (vec![case_of], c)
        };
        let options = BackwardOptions {
            seed_ones: pass % 2 == 1,
            ..BackwardOptions::default()
        };
        let gradients = backward(&mut graph, &bounds, &bounds, &[y], &[wrt], &options).unwrap();
        if !options.seed_ones {
            inputs.push(gradients.seed(y).unwrap());
        }
        let grad = gradients.gradient(wrt).unwrap();
        let e = graph.new_tensor_symbol(params(), &format!("e{pass}")).unwrap();
        graph
            .new_exec_symbol(Command::Scale { alpha: 2.0 }, &[grad], &[e], &format!("use{pass}"))
            .unwrap();
        outputs.push(e);
    }
    (graph, inputs, outputs)
}

/// Every branch tensor mapped to a parent tensor sits on the parent's bytes.
fn check_mapped_slots(graph: &SymbolicGraph, compiled: &CompiledGraph) -> Result<(), TestCaseError> {
    let arena = compiled.arena();
    let mut pairs = Vec::new();
    for exec in compiled.order() {
        match &graph.exec(*exec).unwrap().kind {
            ExecKind::CaseOf(case_of) => {
                for (_, branch) in case_of.branches() {
                    pairs.extend(branch.input_map().iter().chain(branch.output_map()));
                }
            }
            ExecKind::CaseOfBackward(node) => {
                for (_, branch) in node.branches() {
                    pairs.extend(branch.input_map().iter().chain(branch.output_map()));
                }
            }
            ExecKind::Command(_) => {}
        }
    }
    prop_assert!(!pairs.is_empty());
    for (inner, outer) in pairs {
        let inner_slot = arena.slot(*inner).unwrap();
        prop_assert!(inner_slot.pinned, "{} is not pinned", inner);
        prop_assert_eq!(inner_slot.range(), arena.slot(*outer).unwrap().range());
    }
    Ok(())
}

proptest! {
    #[test]
    fn live_tensors_never_share_bytes(
        picks in prop::collection::vec((0usize..64, 0usize..64), 1..24),
        len in 1usize..9,
        alignment in prop::sample::select(vec![4usize, 16, 64]),
    ) {
        let (graph, tensors) = build(&picks, len);
        let first = tensors[0];
        let last = tensors[tensors.len() - 1];
        let options = CompileOptions { alignment, ..CompileOptions::default() };
        let compiled = compile(&graph, &[first], &[last], &[], &[], &options).unwrap();
        let arena = compiled.arena();

        let live = liveness::intervals(&graph, compiled.order()).unwrap();
        let slots: Vec<_> = live
            .iter()
            .map(|(t, interval)| (*t, *interval, arena.slot(*t).unwrap().range()))
            .collect();
        for (t, _, range) in &slots {
            prop_assert_eq!(range.start % alignment, 0);
            prop_assert!(range.end <= arena.size(), "{} exceeds the arena", t);
        }
        for (i, (a, live_a, bytes_a)) in slots.iter().enumerate() {
            for (b, live_b, bytes_b) in &slots[i + 1..] {
                if live_a.overlaps(live_b) {
                    prop_assert!(
                        bytes_a.end <= bytes_b.start || bytes_b.end <= bytes_a.start,
                        "{} and {} overlap", a, b
                    );
                }
            }
        }
        for bound in [first, last] {
            let bytes = arena.slot(bound).unwrap().range();
            for (t, _, range) in &slots {
                if *t != bound {
                    prop_assert!(range.end <= bytes.start || bytes.end <= range.start);
                }
            }
        }
    }
    #[test]
    fn case_of_scopes_are_sound_across_backward_passes(
        picks in prop::collection::vec((0usize..64, 0usize..64), 1..8),
        ops in prop::collection::vec(any::<u8>(), 1..6),
        passes in 1usize..4,
        len in 1usize..9,
        reuse_memory in any::<bool>(),
    ) {
        let (graph, inputs, outputs) = build_case_of(&picks, &ops, passes, len);
        let options = CompileOptions { reuse_memory, ..CompileOptions::default() };
        let compiled = compile(&graph, &inputs, &outputs, &[], &[], &options).unwrap();
        let arena = compiled.arena();
        let layouts: Vec<_> = arena.layouts().collect();
        prop_assert_eq!(layouts.len(), 3);

        for layout in &layouts {
            let own: Vec<_> = layout.slots.iter().filter(|(_, slot)| !slot.pinned).collect();
            for (t, slot) in &own {
                let range = slot.range();
                prop_assert!(
                    range.start >= layout.base && range.end <= layout.base + layout.size,
                    "{} lies outside its scope's region", t
                );
            }
            for (i, (a, slot_a)) in own.iter().enumerate() {
                for (b, slot_b) in &own[i + 1..] {
                    if slot_a.interval.overlaps(&slot_b.interval) {
                        let (ra, rb) = (slot_a.range(), slot_b.range());
                        prop_assert!(
                            ra.is_empty() || rb.is_empty() || ra.end <= rb.start || rb.end <= ra.start,
                            "{} and {} overlap in scope {}", a, b, layout.scope
                        );
                    }
                }
            }
        }
        for (i, a) in layouts.iter().enumerate() {
            for b in &layouts[i + 1..] {
                if a.size > 0 && b.size > 0 {
                    prop_assert!(
                        a.base + a.size <= b.base || b.base + b.size <= a.base,
                        "scopes {} and {} share a region", a.scope, b.scope
                    );
                }
            }
        }
        check_mapped_slots(&graph, &compiled)?;
    }
}
