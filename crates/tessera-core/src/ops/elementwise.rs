//! Element-wise arithmetic: `EwSum`, `EwProd`, `EwDiv`, `EwExp`, `EwLog`,
//! `Scale`.
//!
//! All inputs and the output must hold the same number of elements.

use crate::backward::{GradientContext, GradientInput};
use crate::cmd::{Command, OpKind};
use crate::error::{CoreError, KernelError};
use crate::id::TensorSymbol;
use crate::registry::{Arity, OpDescriptor};
use crate::tensor::{TensorView, TensorViewMut};

use super::{check_elementwise, output_grad};

pub(super) fn descriptors() -> [OpDescriptor; 6] {
    [
        OpDescriptor {
            kind: OpKind::EwSum,
            name: "ew_sum",
            inputs: Arity::AtLeast(1),
            outputs: Arity::Exact(1),
            forward: Some(sum_forward),
            gradient: Some(sum_gradient),
        },
        OpDescriptor {
            kind: OpKind::EwProd,
            name: "ew_prod",
            inputs: Arity::AtLeast(1),
            outputs: Arity::Exact(1),
            forward: Some(prod_forward),
            gradient: Some(prod_gradient),
        },
        OpDescriptor {
            kind: OpKind::EwDiv,
            name: "ew_div",
            inputs: Arity::Exact(2),
            outputs: Arity::Exact(1),
            forward: Some(div_forward),
            gradient: Some(div_gradient),
        },
        OpDescriptor {
            kind: OpKind::EwExp,
            name: "ew_exp",
            inputs: Arity::Exact(1),
            outputs: Arity::Exact(1),
            forward: Some(exp_forward),
            gradient: Some(exp_gradient),
        },
        OpDescriptor {
            kind: OpKind::EwLog,
            name: "ew_log",
            inputs: Arity::Exact(1),
            outputs: Arity::Exact(1),
            forward: Some(log_forward),
            gradient: Some(log_gradient),
        },
        OpDescriptor {
            kind: OpKind::Scale,
            name: "scale",
            inputs: Arity::Exact(1),
            outputs: Arity::Exact(1),
            forward: Some(scale_forward),
            gradient: Some(scale_gradient),
        },
    ]
}

// ---------------------------------------------------------------------------
// Forward kernels
// ---------------------------------------------------------------------------

/// Applies `f` to the i-th element of every input, writing output element i.
fn map_inputs(
    kind: OpKind,
    inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
    f: impl Fn(&[f64]) -> f64,
) -> Result<(), KernelError> {
    check_elementwise(kind, inputs, outputs)?;
    let out = &mut outputs[0];
    let mut row = vec![0.0; inputs.len()];
    for i in 0..out.len() {
        for (slot, input) in row.iter_mut().zip(inputs) {
            *slot = input.get(i);
        }
        out.set(i, f(&row));
    }
    Ok(())
}

fn sum_forward(
    _cmd: &Command,
    inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
) -> Result<(), KernelError> {
    map_inputs(OpKind::EwSum, inputs, outputs, |values| values.iter().sum())
}

fn prod_forward(
    _cmd: &Command,
    inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
) -> Result<(), KernelError> {
    map_inputs(OpKind::EwProd, inputs, outputs, |values| values.iter().product())
}

fn div_forward(
    _cmd: &Command,
    inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
) -> Result<(), KernelError> {
    super::check_count(OpKind::EwDiv, "inputs", 2, inputs.len())?;
    map_inputs(OpKind::EwDiv, inputs, outputs, |values| values[0] / values[1])
}

fn exp_forward(
    _cmd: &Command,
    inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
) -> Result<(), KernelError> {
    map_inputs(OpKind::EwExp, inputs, outputs, |values| values[0].exp())
}

fn log_forward(
    _cmd: &Command,
    inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
) -> Result<(), KernelError> {
    map_inputs(OpKind::EwLog, inputs, outputs, |values| values[0].ln())
}

fn scale_forward(
    cmd: &Command,
    inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
) -> Result<(), KernelError> {
    let Command::Scale { alpha } = cmd else {
        return Err(KernelError::Unsupported { kind: cmd.kind() });
    };
    map_inputs(OpKind::Scale, inputs, outputs, |values| alpha * values[0])
}

// ---------------------------------------------------------------------------
// Gradient rules
// ---------------------------------------------------------------------------

fn sum_gradient(
    _ctx: &mut GradientContext<'_>,
    input: &GradientInput<'_>,
) -> Result<Vec<Option<TensorSymbol>>, CoreError> {
    let g = output_grad(input);
    Ok(input
        .needs
        .iter()
        .map(|need| if *need { g } else { None })
        .collect())
}

/// `d/da_i (a_0 * ... * a_n) = g * prod_{j != i} a_j`
fn prod_gradient(
    ctx: &mut GradientContext<'_>,
    input: &GradientInput<'_>,
) -> Result<Vec<Option<TensorSymbol>>, CoreError> {
    let mut grads = vec![None; input.inputs.len()];
    let Some(g) = output_grad(input) else {
        return Ok(grads);
    };
    for (i, wrt) in input.inputs.iter().enumerate() {
        if !input.needs[i] {
            continue;
        }
        let mut factors = vec![g];
        factors.extend(
            input
                .inputs
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, t)| *t),
        );
        grads[i] = Some(ctx.grad_of(Command::EwProd, &factors, *wrt)?);
    }
    Ok(grads)
}

/// `c = a / b`: `da = g / b`, `db = -(g * c) / b`.
fn div_gradient(
    ctx: &mut GradientContext<'_>,
    input: &GradientInput<'_>,
) -> Result<Vec<Option<TensorSymbol>>, CoreError> {
    let Some(g) = output_grad(input) else {
        return Ok(vec![None; 2]);
    };
    let (a, b, c) = (input.inputs[0], input.inputs[1], input.outputs[0]);
    let da = if input.needs[0] {
        Some(ctx.grad_of(Command::EwDiv, &[g, b], a)?)
    } else {
        None
    };
    let db = if input.needs[1] {
        let gc = ctx.temp(Command::EwProd, &[g, c], b)?;
        let gc_b = ctx.temp(Command::EwDiv, &[gc, b], b)?;
        Some(ctx.grad_of(Command::Scale { alpha: -1.0 }, &[gc_b], b)?)
    } else {
        None
    };
    Ok(vec![da, db])
}

/// `d exp(a) = g * exp(a)`, reusing the forward output.
fn exp_gradient(
    ctx: &mut GradientContext<'_>,
    input: &GradientInput<'_>,
) -> Result<Vec<Option<TensorSymbol>>, CoreError> {
    match output_grad(input) {
        Some(g) if input.needs[0] => Ok(vec![Some(ctx.grad_of(
            Command::EwProd,
            &[g, input.outputs[0]],
            input.inputs[0],
        )?)]),
        _ => Ok(vec![None]),
    }
}

fn log_gradient(
    ctx: &mut GradientContext<'_>,
    input: &GradientInput<'_>,
) -> Result<Vec<Option<TensorSymbol>>, CoreError> {
    match output_grad(input) {
        Some(g) if input.needs[0] => Ok(vec![Some(ctx.grad_of(
            Command::EwDiv,
            &[g, input.inputs[0]],
            input.inputs[0],
        )?)]),
        _ => Ok(vec![None]),
    }
}

fn scale_gradient(
    ctx: &mut GradientContext<'_>,
    input: &GradientInput<'_>,
) -> Result<Vec<Option<TensorSymbol>>, CoreError> {
    match output_grad(input) {
        Some(g) if input.needs[0] => Ok(vec![Some(ctx.grad_of(
            input.command.clone(),
            &[g],
            input.inputs[0],
        )?)]),
        _ => Ok(vec![None]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::testing::run;
    use crate::tensor::TensorParams;

    fn v(values: &[f64]) -> (TensorParams, Vec<f64>) {
        (TensorParams::f64(&[values.len()]), values.to_vec())
    }

    #[test]
    fn sum_and_prod_over_many_inputs() {
        let p = TensorParams::f64(&[2]);
        let inputs = [v(&[1.0, 2.0]), v(&[3.0, 4.0]), v(&[0.5, 0.5])];
        let sum = run(&Command::EwSum, &inputs, &[p.clone()]).unwrap();
        let prod = run(&Command::EwProd, &inputs, &[p]).unwrap();
        assert_eq!(sum[0], vec![4.5, 6.5]);
        assert_eq!(prod[0], vec![1.5, 4.0]);
    }

    #[test]
    fn div_exp_log_scale() {
        let p = TensorParams::f64(&[2]);
        let div = run(&Command::EwDiv, &[v(&[1.0, 3.0]), v(&[2.0, 4.0])], &[p.clone()]).unwrap();
        assert_eq!(div[0], vec![0.5, 0.75]);

        let exp = run(&Command::EwExp, &[v(&[0.0, 1.0])], &[p.clone()]).unwrap();
        assert_eq!(exp[0][0], 1.0);
        assert!((exp[0][1] - std::f64::consts::E).abs() < 1e-12);

        let log = run(&Command::EwLog, &[v(&[1.0, std::f64::consts::E])], &[p.clone()]).unwrap();
        assert!((log[0][1] - 1.0).abs() < 1e-12);

        let scale = run(&Command::Scale { alpha: -2.0 }, &[v(&[1.0, 0.25])], &[p]).unwrap();
        assert_eq!(scale[0], vec![-2.0, -0.5]);
    }

    #[test]
    fn element_count_mismatch_fails() {
        let err = run(
            &Command::EwSum,
            &[v(&[1.0, 2.0]), v(&[1.0])],
            &[TensorParams::f64(&[2])],
        )
        .unwrap_err();
        assert!(matches!(err, KernelError::ShapeMismatch { kind: OpKind::EwSum, .. }));
    }
}
