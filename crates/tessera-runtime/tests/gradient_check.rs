//! Finite-difference checks of compiled gradients.
//!
//! The loss is the sum of every element of `l`, so the analytic gradients come
//! from a `backward` pass seeded with ones and the numeric ones from central
//! differences over the forward values.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tessera_compile::{compile, CompileOptions};
use tessera_core::{backward, BackwardOptions, Command, SymbolicGraph, TensorParams, TensorSymbol};
use tessera_runtime::{BackendDispatcher, Engine, EngineConfig, Interpreter};

const STEP: f64 = 1e-6;
const RTOL: f64 = 1e-5;

struct Model {
    graph: SymbolicGraph,
    /// Differentiated inputs, each with the range its values are drawn from.
    inputs: Vec<(TensorSymbol, Range)>,
    loss: TensorSymbol,
}

#[derive(Clone, Copy)]
enum Range {
    Uniform(f64, f64),
    /// Uniform magnitude in `[low, high)` with a random sign.
    AwayFromZero(f64, f64),
}

fn square() -> TensorParams {
    TensorParams::f64(&[2, 2])
}

fn gemm(transpose_a: bool, transpose_b: bool) -> Command {
    Command::Gemm {
        transpose_a,
        transpose_b,
    }
}

/// `l = exp(0.1 * (A @ B)) / d + log(d)` with `A: 2x3`, `B: 3x2`, `d: 2x2`.
fn exp_log_model() -> Model {
    let mut graph = SymbolicGraph::new();
    let a = graph.new_tensor_symbol(TensorParams::f64(&[2, 3]), "a").unwrap();
    let b = graph.new_tensor_symbol(TensorParams::f64(&[3, 2]), "b").unwrap();
    let d = graph.new_tensor_symbol(square(), "d").unwrap();
    let h = graph.new_tensor_symbol(square(), "h").unwrap();
    let hs = graph.new_tensor_symbol(square(), "hs").unwrap();
    let e = graph.new_tensor_symbol(square(), "e").unwrap();
    let q = graph.new_tensor_symbol(square(), "q").unwrap();
    let ld = graph.new_tensor_symbol(square(), "ld").unwrap();
    let loss = graph.new_tensor_symbol(square(), "loss").unwrap();

    graph.new_exec_symbol(gemm(false, false), &[a, b], &[h], "gemm").unwrap();
    graph
        .new_exec_symbol(Command::Scale { alpha: 0.1 }, &[h], &[hs], "scale")
        .unwrap();
    graph.new_exec_symbol(Command::EwExp, &[hs], &[e], "exp").unwrap();
    graph.new_exec_symbol(Command::EwDiv, &[e, d], &[q], "div").unwrap();
    graph.new_exec_symbol(Command::EwLog, &[d], &[ld], "log").unwrap();
    graph
        .new_exec_symbol(Command::EwSum, &[q, ld], &[loss], "sum")
        .unwrap();
    Model {
        graph,
        inputs: vec![
            (a, Range::Uniform(-1.0, 1.0)),
            (b, Range::Uniform(-1.0, 1.0)),
            (d, Range::Uniform(0.5, 1.5)),
        ],
        loss,
    }
}

/// Square matrices `u`, `v` and `w`, each read by several execs:
///
/// ```text
/// p  = u * u                 t  = transfer(p)
/// g1 = t^T @ v               g2 = u @ v^T
/// g3 = g1^T @ w^T            r  = relu(w)
/// l  = (g3 + g2 * r) * v
/// ```
fn product_model() -> Model {
    let mut graph = SymbolicGraph::new();
    let mut tensor = |name: &str| graph.new_tensor_symbol(square(), name).unwrap();
    let [u, v, w, p, t, g1, g2, g3, r, q, s, loss] =
        ["u", "v", "w", "p", "t", "g1", "g2", "g3", "r", "q", "s", "loss"].map(&mut tensor);

    let execs = [
        (Command::EwProd, vec![u, u], p, "square"),
        (Command::DataTransfer, vec![p], t, "transfer"),
        (gemm(true, false), vec![t, v], g1, "gemm_tn"),
        (gemm(false, true), vec![u, v], g2, "gemm_nt"),
        (gemm(true, true), vec![g1, w], g3, "gemm_tt"),
        (Command::Relu, vec![w], r, "relu"),
        (Command::EwProd, vec![g2, r], q, "gate"),
        (Command::EwSum, vec![g3, q], s, "sum"),
        (Command::EwProd, vec![s, v], loss, "weight"),
    ];
    for (command, inputs, output, name) in execs {
        graph.new_exec_symbol(command, &inputs, &[output], name).unwrap();
    }
    Model {
        graph,
        inputs: vec![
            (u, Range::Uniform(-1.0, 1.0)),
            (v, Range::Uniform(-1.0, 1.0)),
            // Keeps relu away from its kink.
            (w, Range::AwayFromZero(0.2, 1.0)),
        ],
        loss,
    }
}

fn random_values(rng: &mut ChaCha8Rng, len: usize, range: Range) -> Vec<f64> {
    (0..len)
        .map(|_| match range {
            Range::Uniform(low, high) => rng.gen_range(low..high),
            Range::AwayFromZero(low, high) => {
                let magnitude = rng.gen_range(low..high);
                if rng.gen_bool(0.5) {
                    magnitude
                } else {
                    -magnitude
                }
            }
        })
        .collect()
}

/// Sum of the loss for the given inputs, evaluated by the interpreter.
fn total_loss(model: &Model, inputs: &[(TensorSymbol, Vec<f64>)]) -> f64 {
    let mut interpreter = Interpreter::new(&model.graph);
    for (tensor, values) in inputs {
        interpreter.set(*tensor, values).unwrap();
    }
    interpreter.run(&[], &[]).unwrap();
    interpreter.get(model.loss).unwrap().iter().sum()
}

fn numeric_gradient(model: &Model, inputs: &[(TensorSymbol, Vec<f64>)], which: usize) -> Vec<f64> {
    let len = inputs[which].1.len();
    (0..len)
        .map(|i| {
            let mut plus = inputs.to_vec();
            plus[which].1[i] += STEP;
            let mut minus = inputs.to_vec();
            minus[which].1[i] -= STEP;
            (total_loss(model, &plus) - total_loss(model, &minus)) / (2.0 * STEP)
        })
        .collect()
}

/// Compares compiled gradients of `build()` against central differences
/// over a forward-only copy, for a few random draws.
fn check_gradients(build: fn() -> Model, seed: u64) {
    let mut trained = build();
    let forward = build();
    let options = BackwardOptions {
        seed_ones: true,
        ..BackwardOptions::default()
    };
    let wrt: Vec<TensorSymbol> = trained.inputs.iter().map(|(t, _)| *t).collect();
    let gradients = backward(&mut trained.graph, &[], &[], &[trained.loss], &wrt, &options).unwrap();
    let grads: Vec<TensorSymbol> = wrt
        .iter()
        .map(|t| gradients.gradient(*t).unwrap())
        .collect();

    let mut outputs = vec![trained.loss];
    outputs.extend(&grads);
    let compiled = compile(
        &trained.graph,
        &wrt,
        &outputs,
        &[],
        &[],
        &CompileOptions::default(),
    )
    .unwrap();
    let mut engine = Engine::new(BackendDispatcher::with_reference(), EngineConfig::default());

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    for _ in 0..4 {
        let inputs: Vec<(TensorSymbol, Vec<f64>)> = forward
            .inputs
            .iter()
            .map(|(tensor, range)| {
                let len = forward.graph.tensor_params(*tensor).unwrap().element_count();
                (*tensor, random_values(&mut rng, len, *range))
            })
            .collect();
        for ((_, values), tensor) in inputs.iter().zip(&wrt) {
            compiled.write(*tensor, values).unwrap();
        }
        engine.run(&compiled).unwrap();

        for (which, grad) in grads.iter().enumerate() {
            let analytic = compiled.read(*grad).unwrap();
            let numeric = numeric_gradient(&forward, &inputs, which);
            for (got, want) in analytic.iter().zip(&numeric) {
                assert!(
                    (got - want).abs() <= RTOL * want.abs().max(1.0),
                    "gradient {which}: analytic {got}, numeric {want}"
                );
            }
        }
    }
}

#[test]
fn compiled_gradients_match_central_differences() {
    check_gradients(exp_log_model, 0x7e55_e7a0);
}

#[test]
fn products_transposes_and_shared_inputs_match_central_differences() {
    check_gradients(product_model, 0x9e37_79b9);
}
