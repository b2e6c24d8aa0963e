//! Built-in op descriptors.
//!
//! Each submodule contributes the descriptors of one op family. A descriptor
//! carries the forward kernel and the gradient rule together, so the two are
//! always registered as a unit.
//!
//! Forward kernels compute in `f64` through [`TensorView`] accessors and
//! never allocate tensors; outputs are pre-sized views supplied by the
//! caller. Gradient rules emit backward execs through a [`GradientContext`].

mod activation;
mod blas;
mod data;
mod elementwise;

use crate::backward::{GradientContext, GradientInput};
use crate::cmd::OpKind;
use crate::error::{CoreError, KernelError};
use crate::id::TensorSymbol;
use crate::registry::OpDescriptor;
use crate::tensor::{TensorParams, TensorView, TensorViewMut};

/// Descriptors of every built-in op.
pub(crate) fn builtins() -> Vec<OpDescriptor> {
    let mut all = Vec::new();
    all.extend(data::descriptors());
    all.extend(elementwise::descriptors());
    all.extend(activation::descriptors());
    all.extend(blas::descriptors());
    all
}

// ---------------------------------------------------------------------------
// Kernel helpers
// ---------------------------------------------------------------------------

fn check_count(
    kind: OpKind,
    what: &'static str,
    expected: usize,
    found: usize,
) -> Result<(), KernelError> {
    if expected != found {
        return Err(KernelError::Arity {
            kind,
            what,
            expected,
            found,
        });
    }
    Ok(())
}

fn check_same_len(
    kind: OpKind,
    left: &TensorParams,
    right: &TensorParams,
) -> Result<(), KernelError> {
    if left.element_count() != right.element_count() {
        return Err(KernelError::ShapeMismatch {
            kind,
            left: left.dims.to_vec(),
            right: right.dims.to_vec(),
        });
    }
    Ok(())
}

/// Checks that every input and the single output share an element count.
fn check_elementwise(
    kind: OpKind,
    inputs: &[TensorView<'_>],
    outputs: &[TensorViewMut<'_>],
) -> Result<(), KernelError> {
    check_count(kind, "outputs", 1, outputs.len())?;
    for input in inputs {
        check_same_len(kind, input.params(), outputs[0].params())?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Gradient helpers
// ---------------------------------------------------------------------------

/// Gradient of the only output, if one flows back.
fn output_grad(input: &GradientInput<'_>) -> Option<TensorSymbol> {
    input.output_grads.first().copied().flatten()
}

/// Rule for ops that never pass a gradient to their inputs.
fn no_gradient(
    _ctx: &mut GradientContext<'_>,
    input: &GradientInput<'_>,
) -> Result<Vec<Option<TensorSymbol>>, CoreError> {
    Ok(vec![None; input.inputs.len()])
}
