//! Registering a caller-defined op.
//!
//! The process-wide registry is write-once, so this lives in its own test
//! binary and installs the registry before anything else touches it.

use std::sync::Once;

use smallvec::smallvec;
use tessera_core::registry::{self, install};
use tessera_core::{
    Arity, Command, CoreError, KernelError, OpDescriptor, OpKind, OpRegistry, SymbolicGraph,
    TensorParams, TensorView, TensorViewMut,
};

const SQUARE: u32 = 1;
const OPAQUE: u32 = 2;

fn square_forward(
    _cmd: &Command,
    inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
) -> Result<(), KernelError> {
    for i in 0..inputs[0].len() {
        let v = inputs[0].get(i);
        outputs[0].set(i, v * v);
    }
    Ok(())
}

fn install_custom_ops() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let mut registry = OpRegistry::with_builtins();
        registry
            .register(OpDescriptor {
                kind: OpKind::Custom(SQUARE),
                name: "square",
                inputs: Arity::Exact(1),
                outputs: Arity::Exact(1),
                forward: Some(square_forward),
                gradient: None,
            })
            .unwrap();
        registry
            .register(OpDescriptor {
                kind: OpKind::Custom(OPAQUE),
                name: "opaque",
                inputs: Arity::Exact(2),
                outputs: Arity::Exact(1),
                forward: None,
                gradient: None,
            })
            .unwrap();
        assert!(install(registry).is_ok());
    });
}

fn custom(kind: u32) -> Command {
    Command::Custom {
        kind,
        params: smallvec![],
    }
}

#[test]
fn custom_op_is_visible_globally() {
    install_custom_ops();
    let global = registry::global();
    assert_eq!(global.len(), 14);
    assert!(global.forward(OpKind::Custom(SQUARE)).is_some());
    assert!(global.gradient(OpKind::Custom(SQUARE)).is_none());
    assert!(install(OpRegistry::empty()).is_err());
}

#[test]
fn custom_arity_is_enforced() {
    install_custom_ops();
    let mut graph = SymbolicGraph::new();
    let a = graph.new_tensor_symbol(TensorParams::f32(&[1]), "a").unwrap();
    let b = graph.new_tensor_symbol(TensorParams::f32(&[1]), "b").unwrap();
    let err = graph
        .new_exec_symbol(custom(OPAQUE), &[a], &[b], "opaque")
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::ArityMismatch {
            kind: OpKind::Custom(OPAQUE),
            ..
        }
    ));
}

#[test]
fn missing_gradient_rule_fails_and_restores_graph() {
    install_custom_ops();
    let mut graph = SymbolicGraph::new();
    let x = graph.new_tensor_symbol(TensorParams::f64(&[2]), "x").unwrap();
    let sq = graph.new_tensor_symbol(TensorParams::f64(&[2]), "sq").unwrap();
    let y = graph.new_tensor_symbol(TensorParams::f64(&[2]), "y").unwrap();
    graph
        .new_exec_symbol(custom(SQUARE), &[x], &[sq], "square")
        .unwrap();
    graph
        .new_exec_symbol(Command::EwExp, &[sq], &[y], "exp")
        .unwrap();
    let before = graph.fingerprint();

    let err = graph.backward(&[], &[], &[y], &[x]).unwrap_err();
    assert_eq!(
        err,
        CoreError::UnsupportedOperation {
            kind: OpKind::Custom(SQUARE)
        }
    );
    assert_eq!(graph.fingerprint(), before);
    assert_eq!(graph.exec_count(), 2);
    assert_eq!(graph.tensor_count(), 3);
}
