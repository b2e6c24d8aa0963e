//! General matrix multiply on rank-2 tensors.
//!
//! `C = op(A) * op(B)` where `op` transposes when the matching flag is set.
//! Tensors are row-major.

use crate::backward::{GradientContext, GradientInput};
use crate::cmd::{Command, OpKind};
use crate::error::{CoreError, KernelError};
use crate::id::TensorSymbol;
use crate::registry::{Arity, OpDescriptor};
use crate::tensor::{TensorParams, TensorView, TensorViewMut};

use super::{check_count, output_grad};

pub(super) fn descriptors() -> [OpDescriptor; 1] {
    [OpDescriptor {
        kind: OpKind::Gemm,
        name: "gemm",
        inputs: Arity::Exact(2),
        outputs: Arity::Exact(1),
        forward: Some(gemm_forward),
        gradient: Some(gemm_gradient),
    }]
}

fn matrix(params: &TensorParams) -> Result<(usize, usize), KernelError> {
    params.matrix_dims().ok_or_else(|| KernelError::ShapeMismatch {
        kind: OpKind::Gemm,
        left: params.dims.to_vec(),
        right: vec![0, 0],
    })
}

fn gemm_forward(
    cmd: &Command,
    inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
) -> Result<(), KernelError> {
    let Command::Gemm {
        transpose_a,
        transpose_b,
    } = *cmd
    else {
        return Err(KernelError::Unsupported { kind: cmd.kind() });
    };
    check_count(OpKind::Gemm, "inputs", 2, inputs.len())?;
    check_count(OpKind::Gemm, "outputs", 1, outputs.len())?;
    let (a, b) = (&inputs[0], &inputs[1]);
    let (a_rows, a_cols) = matrix(a.params())?;
    let (b_rows, b_cols) = matrix(b.params())?;

    let (m, k) = if transpose_a { (a_cols, a_rows) } else { (a_rows, a_cols) };
    let (kb, n) = if transpose_b { (b_cols, b_rows) } else { (b_rows, b_cols) };
    if k != kb {
        return Err(KernelError::ShapeMismatch {
            kind: OpKind::Gemm,
            left: a.params().dims.to_vec(),
            right: b.params().dims.to_vec(),
        });
    }
    let c = &mut outputs[0];
    if matrix(c.params())? != (m, n) {
        return Err(KernelError::ShapeMismatch {
            kind: OpKind::Gemm,
            left: c.params().dims.to_vec(),
            right: vec![m, n],
        });
    }

    let a_at = |i: usize, p: usize| {
        if transpose_a {
            a.get(p * a_cols + i)
        } else {
            a.get(i * a_cols + p)
        }
    };
    let b_at = |p: usize, j: usize| {
        if transpose_b {
            b.get(j * b_cols + p)
        } else {
            b.get(p * b_cols + j)
        }
    };
    for i in 0..m {
        for j in 0..n {
            let value = (0..k).map(|p| a_at(i, p) * b_at(p, j)).sum();
            c.set(i * n + j, value);
        }
    }
    Ok(())
}

fn gemm(transpose_a: bool, transpose_b: bool) -> Command {
    Command::Gemm {
        transpose_a,
        transpose_b,
    }
}

/// Adjoints of `C = op(A) op(B)` for each transpose combination.
fn gemm_gradient(
    ctx: &mut GradientContext<'_>,
    input: &GradientInput<'_>,
) -> Result<Vec<Option<TensorSymbol>>, CoreError> {
    let Some(dc) = output_grad(input) else {
        return Ok(vec![None, None]);
    };
    let Command::Gemm {
        transpose_a,
        transpose_b,
    } = *input.command
    else {
        return Err(CoreError::UnsupportedOperation {
            kind: input.command.kind(),
        });
    };
    let (a, b) = (input.inputs[0], input.inputs[1]);

    let ((da_cmd, da_args), (db_cmd, db_args)) = match (transpose_a, transpose_b) {
        (false, false) => ((gemm(false, true), [dc, b]), (gemm(true, false), [a, dc])),
        (false, true) => ((gemm(false, false), [dc, b]), (gemm(true, false), [dc, a])),
        (true, false) => ((gemm(false, true), [b, dc]), (gemm(false, false), [a, dc])),
        (true, true) => ((gemm(true, true), [b, dc]), (gemm(true, true), [dc, a])),
    };

    let da = if input.needs[0] {
        Some(ctx.grad_of(da_cmd, &da_args, a)?)
    } else {
        None
    };
    let db = if input.needs[1] {
        Some(ctx.grad_of(db_cmd, &db_args, b)?)
    } else {
        None
    };
    Ok(vec![da, db])
}
