//! Engine behaviour: failures, state transitions, backends and tracing.

use std::sync::Arc;

use tessera_compile::{compile, ArenaBuffer, CompileOptions, CompiledGraph, TensorBinding};
use tessera_core::{
    backward, BackendId, BackwardOptions, Command, OpKind, SymbolicGraph, TensorParams,
    TensorSymbol, TensorView,
};
use tessera_runtime::{
    Backend, BackendDispatcher, BackendError, CompletionToken, Engine, EngineConfig,
    Interpreter, QueuedBackend, ReferenceBackend, RunState, RuntimeError,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn vector() -> TensorParams {
    TensorParams::f64(&[3])
}

/// x -> exp -> a -> scale(2) -> b -> sum(a, b) -> c
fn chain() -> (SymbolicGraph, TensorSymbol, TensorSymbol, TensorSymbol) {
    let mut graph = SymbolicGraph::new();
    let x = graph.new_tensor_symbol(vector(), "x").unwrap();
    let a = graph.new_tensor_symbol(vector(), "a").unwrap();
    let b = graph.new_tensor_symbol(vector(), "b").unwrap();
    let c = graph.new_tensor_symbol(vector(), "c").unwrap();
    graph.new_exec_symbol(Command::EwExp, &[x], &[a], "exp").unwrap();
    graph
        .new_exec_symbol(Command::Scale { alpha: 2.0 }, &[a], &[b], "scale")
        .unwrap();
    graph.new_exec_symbol(Command::EwSum, &[a, b], &[c], "sum").unwrap();
    (graph, x, b, c)
}

fn compile_chain(graph: &SymbolicGraph, x: TensorSymbol, c: TensorSymbol) -> CompiledGraph {
    compile(graph, &[x], &[c], &[], &[], &CompileOptions::default()).unwrap()
}

/// Reference backend that fails every command of one kind.
struct Flaky {
    inner: ReferenceBackend,
    fails_on: OpKind,
}

impl Backend for Flaky {
    fn id(&self) -> BackendId {
        BackendId::CpuRef
    }

    fn dispatch(
        &self,
        command: &Command,
        arena: &ArenaBuffer,
        inputs: &[TensorBinding],
        outputs: &[TensorBinding],
    ) -> CompletionToken {
        if command.kind() == self.fails_on {
            return CompletionToken::Ready(Err(BackendError::Device {
                backend: self.id(),
                message: "device lost".into(),
            }));
        }
        self.inner.dispatch(command, arena, inputs, outputs)
    }
}

fn flaky_dispatcher(fails_on: OpKind) -> BackendDispatcher {
    let mut dispatcher = BackendDispatcher::new();
    dispatcher.register(Arc::new(Flaky {
        inner: ReferenceBackend::new(BackendId::CpuRef),
        fails_on,
    }));
    dispatcher
}

#[test]
fn chain_runs_to_completion() {
    init_tracing();
    let (graph, x, _, c) = chain();
    let compiled = compile_chain(&graph, x, c);
    let mut engine = Engine::new(BackendDispatcher::with_reference(), EngineConfig::default());
    assert_eq!(engine.state(), &RunState::Ready);

    compiled.write(x, &[0.0, 1.0, -1.0]).unwrap();
    engine.run(&compiled).unwrap();
    assert_eq!(engine.state(), &RunState::Completed);
    let expected: Vec<f64> = [0.0f64, 1.0, -1.0].iter().map(|v| 3.0 * v.exp()).collect();
    assert_eq!(compiled.read(c).unwrap(), expected);

    // A completed engine runs again without a reset.
    engine.run(&compiled).unwrap();
    assert_eq!(compiled.read(c).unwrap(), expected);
}

#[test]
fn dispatch_failure_names_the_unit() {
    init_tracing();
    let (graph, x, b, c) = chain();
    let scale = graph.producer(b).unwrap().unwrap();
    let compiled = compile_chain(&graph, x, c);
    let mut engine = Engine::new(flaky_dispatcher(OpKind::Scale), EngineConfig::default());

    let err = engine.run(&compiled).unwrap_err();
    match &err {
        RuntimeError::BackendDispatchFailure {
            unit,
            name,
            backend,
            source,
        } => {
            assert_eq!(*unit, scale);
            assert_eq!(name, "scale");
            assert_eq!(*backend, BackendId::CpuRef);
            assert!(matches!(source, BackendError::Device { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(engine.state(), &RunState::Failed { error: err.clone() });

    // Failed engines refuse to run until reset.
    assert!(matches!(
        engine.run(&compiled),
        Err(RuntimeError::InvalidState { state: "failed" })
    ));
    engine.reset();
    assert_eq!(engine.state(), &RunState::Ready);
    assert_eq!(engine.run(&compiled).unwrap_err(), err);
}

#[test]
fn unregistered_backend_is_reported() {
    let (mut graph, x, b, c) = chain();
    let scale = graph.producer(b).unwrap().unwrap();
    graph.set_exec_backend(scale, BackendId::Mps).unwrap();
    let compiled = compile_chain(&graph, x, c);
    let mut engine = Engine::new(BackendDispatcher::with_reference(), EngineConfig::default());

    assert_eq!(
        engine.run(&compiled),
        Err(RuntimeError::UnknownBackend {
            unit: scale,
            backend: BackendId::Mps,
        })
    );
}

#[test]
fn queued_backend_matches_interpreter() {
    init_tracing();
    let (graph, x, _, c) = chain();
    let compiled = compile_chain(&graph, x, c);
    let queued = QueuedBackend::spawn(Arc::new(ReferenceBackend::new(BackendId::CpuRef))).unwrap();
    let mut dispatcher = BackendDispatcher::new();
    dispatcher.register(Arc::new(queued));
    let config = EngineConfig {
        trace_enabled: true,
        max_in_flight: 2,
    };
    let mut engine = Engine::new(dispatcher, config);

    let values = [0.5, -2.0, 3.0];
    compiled.write(x, &values).unwrap();
    engine.run(&compiled).unwrap();

    let mut interpreter = Interpreter::new(&graph);
    interpreter.set(x, &values).unwrap();
    interpreter.run(&[], &[]).unwrap();
    assert_eq!(compiled.read(c).unwrap(), interpreter.get(c).unwrap());

    let names: Vec<&str> = engine
        .trace()
        .unwrap()
        .iter()
        .map(|entry| entry.name.as_str())
        .collect();
    assert_eq!(names, vec!["exp", "scale", "sum"]);
    assert!(engine
        .trace()
        .unwrap()
        .iter()
        .all(|entry| entry.backend == Some(BackendId::CpuRef) && entry.depth == 0));
}

#[test]
fn trace_is_off_by_default() {
    let (graph, x, _, c) = chain();
    let compiled = compile_chain(&graph, x, c);
    let mut engine = Engine::new(BackendDispatcher::with_reference(), EngineConfig::default());
    engine.run(&compiled).unwrap();
    assert!(engine.trace().is_none());
}

/// A case-of with one input and two outputs, steered by `select`.
fn two_output_case_of(select: i32) -> (SymbolicGraph, TensorSymbol, [TensorSymbol; 2]) {
    let mut graph = SymbolicGraph::new();
    let x = graph.new_tensor_symbol(vector(), "x").unwrap();
    let y0 = graph.new_tensor_symbol(vector(), "y0").unwrap();
    let y1 = graph.new_tensor_symbol(vector(), "y1").unwrap();
    let case_of = graph
        .case_of_new(&[x], &[y0, y1], move |_: &[TensorView<'_>]| select, "split")
        .unwrap();

    let mut sub = SymbolicGraph::new();
    let xi = sub.new_tensor_symbol(vector(), "xi").unwrap();
    let ai = sub.new_tensor_symbol(vector(), "ai").unwrap();
    let bi = sub.new_tensor_symbol(vector(), "bi").unwrap();
    sub.new_exec_symbol(Command::EwExp, &[xi], &[ai], "exp").unwrap();
    sub.new_exec_symbol(Command::Relu, &[xi], &[bi], "relu").unwrap();
    graph
        .set_case_of(case_of, 0, sub, &[(xi, x)], &[(ai, y0), (bi, y1)])
        .unwrap();
    (graph, x, [y0, y1])
}

#[test]
fn branch_writes_every_output() {
    let (graph, x, [y0, y1]) = two_output_case_of(0);
    let compiled = compile(&graph, &[x], &[y0, y1], &[], &[], &CompileOptions::default()).unwrap();
    let mut engine = Engine::new(BackendDispatcher::with_reference(), EngineConfig::default());

    compiled.write(x, &[-1.0, 0.0, 2.0]).unwrap();
    engine.run(&compiled).unwrap();
    assert_eq!(
        compiled.read(y0).unwrap(),
        vec![(-1.0f64).exp(), 1.0, 2.0f64.exp()]
    );
    assert_eq!(compiled.read(y1).unwrap(), vec![0.0, 0.0, 2.0]);
}

#[test]
fn pass_through_without_enough_inputs_fails() {
    let (graph, x, [y0, y1]) = two_output_case_of(tessera_core::PASS_THROUGH);
    let case_of = graph.producer(y0).unwrap().unwrap();
    let compiled = compile(&graph, &[x], &[y0, y1], &[], &[], &CompileOptions::default()).unwrap();
    let mut engine = Engine::new(BackendDispatcher::with_reference(), EngineConfig::default());

    let err = engine.run(&compiled).unwrap_err();
    assert_eq!(err, RuntimeError::PassThroughUnavailable { unit: case_of });
    assert!(matches!(engine.state(), RunState::Failed { .. }));

    let mut interpreter = Interpreter::new(&graph);
    interpreter.set(x, &[1.0, 2.0, 3.0]).unwrap();
    assert_eq!(interpreter.run(&[], &[]).unwrap_err(), err);
}

#[test]
fn missing_branch_is_reported() {
    let (graph, x, [y0, y1]) = two_output_case_of(3);
    let case_of = graph.producer(y0).unwrap().unwrap();
    let compiled = compile(&graph, &[x], &[y0, y1], &[], &[], &CompileOptions::default()).unwrap();
    let mut engine = Engine::new(BackendDispatcher::with_reference(), EngineConfig::default());

    assert_eq!(
        engine.run(&compiled),
        Err(RuntimeError::MissingBranch {
            unit: case_of,
            index: 3,
        })
    );
}

#[test]
fn case_of_differentiated_twice_runs() {
    let mut graph = SymbolicGraph::new();
    let x = graph.new_tensor_symbol(vector(), "x").unwrap();
    let y = graph.new_tensor_symbol(vector(), "y").unwrap();
    let case_of = graph
        .case_of_new(&[x], &[y], |_: &[TensorView<'_>]| 0, "select")
        .unwrap();
    let mut sub = SymbolicGraph::new();
    let xi = sub.new_tensor_symbol(vector(), "xi").unwrap();
    let yi = sub.new_tensor_symbol(vector(), "yi").unwrap();
    sub.new_exec_symbol(Command::EwExp, &[xi], &[yi], "exp").unwrap();
    graph
        .set_case_of(case_of, 0, sub, &[(xi, x)], &[(yi, y)])
        .unwrap();

    let first = graph.backward(&[case_of], &[case_of], &[y], &[x]).unwrap();
    let seed = first.seed(y).unwrap();
    let d1 = first.gradient(x).unwrap();
    let e = graph.new_tensor_symbol(vector(), "e").unwrap();
    graph.new_exec_symbol(Command::EwExp, &[d1], &[e], "exp_grad").unwrap();
    let options = BackwardOptions {
        seed_ones: true,
        ..BackwardOptions::default()
    };
    let second = backward(&mut graph, &[case_of], &[case_of], &[y], &[x], &options).unwrap();
    let d2 = second.gradient(x).unwrap();

    let compiled = compile(&graph, &[x, seed], &[y, e, d2], &[], &[], &CompileOptions::default())
        .unwrap();
    let mut engine = Engine::new(BackendDispatcher::with_reference(), EngineConfig::default());
    let xs = [-0.5, 0.0, 0.75];
    let seeds = [2.0, -1.0, 0.5];
    compiled.write(x, &xs).unwrap();
    compiled.write(seed, &seeds).unwrap();
    engine.run(&compiled).unwrap();

    let exp_x: Vec<f64> = xs.iter().map(|v| v.exp()).collect();
    let expected_e: Vec<f64> = exp_x.iter().zip(seeds).map(|(ex, s)| (s * ex).exp()).collect();
    assert_eq!(compiled.read(y).unwrap(), exp_x);
    assert_eq!(compiled.read(d2).unwrap(), exp_x);
    for (got, want) in compiled.read(e).unwrap().iter().zip(&expected_e) {
        assert!((got - want).abs() < 1e-12, "expected {want}, got {got}");
    }
}
