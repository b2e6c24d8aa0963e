//! Rectified linear unit and its backward op.

use crate::backward::{GradientContext, GradientInput};
use crate::cmd::{Command, OpKind};
use crate::error::{CoreError, KernelError};
use crate::id::TensorSymbol;
use crate::registry::{Arity, OpDescriptor};
use crate::tensor::{TensorView, TensorViewMut};

use super::{check_count, check_elementwise, output_grad};

pub(super) fn descriptors() -> [OpDescriptor; 2] {
    [
        OpDescriptor {
            kind: OpKind::Relu,
            name: "relu",
            inputs: Arity::Exact(1),
            outputs: Arity::Exact(1),
            forward: Some(relu_forward),
            gradient: Some(relu_gradient),
        },
        OpDescriptor {
            kind: OpKind::ReluBackward,
            name: "relu_backward",
            inputs: Arity::Exact(2),
            outputs: Arity::Exact(1),
            forward: Some(relu_backward_forward),
            gradient: Some(relu_backward_gradient),
        },
    ]
}

fn relu_forward(
    _cmd: &Command,
    inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
) -> Result<(), KernelError> {
    check_count(OpKind::Relu, "inputs", 1, inputs.len())?;
    check_elementwise(OpKind::Relu, inputs, outputs)?;
    for i in 0..inputs[0].len() {
        outputs[0].set(i, inputs[0].get(i).max(0.0));
    }
    Ok(())
}

/// `(g, y) -> g where y > 0, else 0`.
fn relu_backward_forward(
    _cmd: &Command,
    inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
) -> Result<(), KernelError> {
    check_count(OpKind::ReluBackward, "inputs", 2, inputs.len())?;
    check_elementwise(OpKind::ReluBackward, inputs, outputs)?;
    let (g, y) = (&inputs[0], &inputs[1]);
    for i in 0..g.len() {
        let value = if y.get(i) > 0.0 { g.get(i) } else { 0.0 };
        outputs[0].set(i, value);
    }
    Ok(())
}

fn relu_gradient(
    ctx: &mut GradientContext<'_>,
    input: &GradientInput<'_>,
) -> Result<Vec<Option<TensorSymbol>>, CoreError> {
    match output_grad(input) {
        Some(g) if input.needs[0] => Ok(vec![Some(ctx.grad_of(
            Command::ReluBackward,
            &[g, input.outputs[0]],
            input.inputs[0],
        )?)]),
        _ => Ok(vec![None]),
    }
}

/// Linear in `g` with the same mask; the mask input gets no gradient.
fn relu_backward_gradient(
    ctx: &mut GradientContext<'_>,
    input: &GradientInput<'_>,
) -> Result<Vec<Option<TensorSymbol>>, CoreError> {
    match output_grad(input) {
        Some(gg) if input.needs[0] => Ok(vec![
            Some(ctx.grad_of(
                Command::ReluBackward,
                &[gg, input.inputs[1]],
                input.inputs[0],
            )?),
            None,
        ]),
        _ => Ok(vec![None, None]),
    }
}
