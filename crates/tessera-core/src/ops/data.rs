//! Data movement ops: `Noop`, `Set`, `DataTransfer`.

use crate::backward::{GradientContext, GradientInput};
use crate::cmd::{Command, OpKind};
use crate::error::{CoreError, KernelError};
use crate::id::TensorSymbol;
use crate::registry::{Arity, OpDescriptor};
use crate::tensor::{TensorView, TensorViewMut};

use super::{check_count, check_same_len, no_gradient};

pub(super) fn descriptors() -> [OpDescriptor; 3] {
    [
        OpDescriptor {
            kind: OpKind::Noop,
            name: "noop",
            inputs: Arity::Any,
            outputs: Arity::Any,
            forward: Some(noop_forward),
            gradient: Some(no_gradient),
        },
        OpDescriptor {
            kind: OpKind::Set,
            name: "set",
            inputs: Arity::Exact(0),
            outputs: Arity::AtLeast(1),
            forward: Some(set_forward),
            gradient: Some(no_gradient),
        },
        OpDescriptor {
            kind: OpKind::DataTransfer,
            name: "data_transfer",
            inputs: Arity::AtLeast(1),
            outputs: Arity::AtLeast(1),
            forward: Some(transfer_forward),
            gradient: Some(transfer_gradient),
        },
    ]
}

fn noop_forward(
    _cmd: &Command,
    _inputs: &[TensorView<'_>],
    _outputs: &mut [TensorViewMut<'_>],
) -> Result<(), KernelError> {
    Ok(())
}

fn set_forward(
    cmd: &Command,
    _inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
) -> Result<(), KernelError> {
    let Command::Set { value } = cmd else {
        return Err(KernelError::Unsupported { kind: cmd.kind() });
    };
    for output in outputs.iter_mut() {
        output.fill(*value);
    }
    Ok(())
}

fn transfer_forward(
    _cmd: &Command,
    inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
) -> Result<(), KernelError> {
    check_count(OpKind::DataTransfer, "outputs", inputs.len(), outputs.len())?;
    for (input, output) in inputs.iter().zip(outputs.iter_mut()) {
        check_same_len(OpKind::DataTransfer, input.params(), output.params())?;
        for i in 0..input.len() {
            output.set(i, input.get(i));
        }
    }
    Ok(())
}

/// Identity: input *i* receives the gradient of output *i*.
fn transfer_gradient(
    _ctx: &mut GradientContext<'_>,
    input: &GradientInput<'_>,
) -> Result<Vec<Option<TensorSymbol>>, CoreError> {
    Ok((0..input.inputs.len())
        .map(|i| {
            if input.needs[i] {
                input.output_grads.get(i).copied().flatten()
            } else {
                None
            }
        })
        .collect())
}
