//! Reference CPU backend built on the registry's forward kernels.

use tessera_compile::{ArenaBuffer, TensorBinding};
use tessera_core::registry;
use tessera_core::{BackendId, Command, KernelError, TensorView, TensorViewMut};

use super::{Backend, CompletionToken};
use crate::error::BackendError;

/// Runs the registered forward kernel of `command`.
pub fn execute(
    command: &Command,
    inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
) -> Result<(), BackendError> {
    let kind = command.kind();
    let kernel = registry::global()
        .forward(kind)
        .ok_or(KernelError::Unsupported { kind })?;
    kernel(command, inputs, outputs)?;
    Ok(())
}

/// Synchronous backend: every dispatch runs to completion on the calling
/// thread and returns a resolved token.
///
/// Operands are copied out of the arena before the kernel runs, so a
/// command may read and write overlapping ranges.
#[derive(Debug, Clone)]
pub struct ReferenceBackend {
    id: BackendId,
}

impl ReferenceBackend {
    pub fn new(id: BackendId) -> Self {
        ReferenceBackend { id }
    }

    fn run(
        &self,
        command: &Command,
        arena: &ArenaBuffer,
        inputs: &[TensorBinding],
        outputs: &[TensorBinding],
    ) -> Result<(), BackendError> {
        let input_bytes: Vec<Vec<u8>> = inputs.iter().map(|b| arena.read_bytes(b)).collect();
        let mut output_bytes: Vec<Vec<u8>> = outputs.iter().map(|b| arena.read_bytes(b)).collect();

        let views: Vec<TensorView<'_>> = inputs
            .iter()
            .zip(&input_bytes)
            .map(|(b, bytes)| TensorView::new(&b.params, bytes))
            .collect();
        {
            let mut views_mut: Vec<TensorViewMut<'_>> = outputs
                .iter()
                .zip(output_bytes.iter_mut())
                .map(|(b, bytes)| TensorViewMut::new(&b.params, bytes))
                .collect();
            execute(command, &views, &mut views_mut)?;
        }

        for (binding, bytes) in outputs.iter().zip(&output_bytes) {
            arena.write_bytes(binding, bytes);
        }
        Ok(())
    }
}

impl Backend for ReferenceBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    fn dispatch(
        &self,
        command: &Command,
        arena: &ArenaBuffer,
        inputs: &[TensorBinding],
        outputs: &[TensorBinding],
    ) -> CompletionToken {
        CompletionToken::Ready(self.run(command, arena, inputs, outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{SymbolicGraph, TensorParams, TensorSymbol};

    fn binding(index: u32, offset: usize) -> TensorBinding {
        TensorBinding {
            symbol: TensorSymbol::new(SymbolicGraph::new().scope(), index),
            offset,
            params: TensorParams::f64(&[2]),
        }
    }

    #[test]
    fn dispatch_writes_into_the_arena() {
        let arena = ArenaBuffer::zeroed(48);
        let (a, b, c) = (binding(0, 0), binding(1, 16), binding(2, 32));
        arena.write_values(&a, &[1.0, 2.0]);
        arena.write_values(&b, &[10.0, 20.0]);

        let backend = ReferenceBackend::new(BackendId::CpuRef);
        let token = backend.dispatch(&Command::EwSum, &arena, &[a, b], &[c.clone()]);
        assert!(token.is_ready());
        backend.wait(token).unwrap();
        assert_eq!(arena.read_values(&c), vec![11.0, 22.0]);
    }

    #[test]
    fn in_place_update() {
        let arena = ArenaBuffer::zeroed(16);
        let a = binding(0, 0);
        arena.write_values(&a, &[1.0, 2.0]);
        let backend = ReferenceBackend::new(BackendId::CpuRef);
        let token = backend.dispatch(&Command::Scale { alpha: 3.0 }, &arena, &[a.clone()], &[a.clone()]);
        backend.wait(token).unwrap();
        assert_eq!(arena.read_values(&a), vec![3.0, 6.0]);
    }

    #[test]
    fn kernel_errors_surface_in_the_token() {
        let arena = ArenaBuffer::zeroed(48);
        let short = TensorBinding {
            params: TensorParams::f64(&[1]),
            ..binding(2, 32)
        };
        let backend = ReferenceBackend::new(BackendId::CpuRef);
        let token = backend.dispatch(
            &Command::EwSum,
            &arena,
            &[binding(0, 0), binding(1, 16)],
            &[short],
        );
        assert!(matches!(
            token.wait(),
            Err(BackendError::Kernel(KernelError::ShapeMismatch { .. }))
        ));
    }
}
