//! The tensor arena of a compiled graph.
//!
//! One contiguous byte buffer backs every tensor of every scope. The root
//! scope's region starts at offset 0; each case-of branch sub-graph gets a
//! dedicated region after it. Tensors a branch shares with its parent
//! (through the case-of remaps) are pinned at the parent's offsets rather
//! than copied.

use std::sync::{Arc, PoisonError, RwLock};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tessera_core::{ScopeId, TensorParams, TensorSymbol, TensorView, TensorViewMut};

use crate::error::CompileError;
use crate::exec_arena::TensorBinding;
use crate::liveness::Interval;

/// Placement of one tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub offset: usize,
    pub params: TensorParams,
    /// Liveness over the scope's compiled order.
    pub interval: Interval,
    /// The tensor lives at a parent scope's offset.
    pub pinned: bool,
}

impl Slot {
    pub fn byte_size(&self) -> usize {
        self.params.byte_size()
    }

    /// Byte range `[offset, offset + size)`.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.byte_size()
    }
}

/// Placement of every tensor of one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorLayout {
    pub scope: ScopeId,
    /// Start of the scope's own region.
    pub base: usize,
    /// Size of the scope's own region, excluding pinned tensors.
    pub size: usize,
    pub slots: IndexMap<TensorSymbol, Slot>,
}

impl TensorLayout {
    pub fn slot(&self, tensor: TensorSymbol) -> Option<&Slot> {
        self.slots.get(&tensor)
    }

    /// Checks that no two slots share bytes while both are live.
    ///
    /// Two pinned slots are never compared: their offsets come from the
    /// parent layout, which was verified against the parent's liveness.
    pub fn verify(&self) -> Result<(), CompileError> {
        let slots: Vec<(&TensorSymbol, &Slot)> = self.slots.iter().collect();
        for (i, (first, a)) in slots.iter().enumerate() {
            for (second, b) in &slots[i + 1..] {
                if a.pinned && b.pinned {
                    continue;
                }
                let (ra, rb) = (a.range(), b.range());
                if ra.is_empty() || rb.is_empty() || ra.end <= rb.start || rb.end <= ra.start {
                    continue;
                }
                if a.interval.overlaps(&b.interval) {
                    return Err(CompileError::AliasingViolation {
                        first: **first,
                        second: **second,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Resolves `tensor` against per-scope layouts.
pub(crate) fn resolve_binding(
    layouts: &IndexMap<ScopeId, TensorLayout>,
    tensor: TensorSymbol,
) -> Result<TensorBinding, CompileError> {
    let slot = layouts
        .get(&tensor.scope)
        .and_then(|layout| layout.slot(tensor))
        .ok_or_else(|| CompileError::UnresolvedBinding {
            tensor,
            reason: "tensor has no arena slot".to_string(),
        })?;
    Ok(TensorBinding {
        symbol: tensor,
        offset: slot.offset,
        params: slot.params.clone(),
    })
}

/// Shared backing storage of a tensor arena.
///
/// Cloning is cheap and yields a handle to the same bytes, so asynchronous
/// backends can hold one on their worker threads.
#[derive(Debug, Clone, Default)]
pub struct ArenaBuffer(Arc<RwLock<Vec<u8>>>);

impl ArenaBuffer {
    pub fn zeroed(size: usize) -> Self {
        ArenaBuffer(Arc::new(RwLock::new(vec![0u8; size])))
    }

    pub fn len(&self) -> usize {
        self.0.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies out the bytes of `binding`.
    pub fn read_bytes(&self, binding: &TensorBinding) -> Vec<u8> {
        let buffer = self.0.read().unwrap_or_else(PoisonError::into_inner);
        buffer[binding.range()].to_vec()
    }

    pub fn write_bytes(&self, binding: &TensorBinding, bytes: &[u8]) {
        let mut buffer = self.0.write().unwrap_or_else(PoisonError::into_inner);
        buffer[binding.range()].copy_from_slice(&bytes[..binding.params.byte_size()]);
    }

    /// Element values of `binding`, converted to `f64`.
    pub fn read_values(&self, binding: &TensorBinding) -> Vec<f64> {
        let bytes = self.read_bytes(binding);
        TensorView::new(&binding.params, &bytes).to_vec()
    }

    pub fn write_values(&self, binding: &TensorBinding, values: &[f64]) {
        let mut buffer = self.0.write().unwrap_or_else(PoisonError::into_inner);
        TensorViewMut::new(&binding.params, &mut buffer[binding.range()]).copy_from(values);
    }

    /// Copies `from` into `to`. Both must hold the same number of bytes.
    pub fn copy(&self, from: &TensorBinding, to: &TensorBinding) {
        let mut buffer = self.0.write().unwrap_or_else(PoisonError::into_inner);
        buffer.copy_within(from.range(), to.offset);
    }

    pub fn fill(&self, binding: &TensorBinding, value: f64) {
        let mut buffer = self.0.write().unwrap_or_else(PoisonError::into_inner);
        TensorViewMut::new(&binding.params, &mut buffer[binding.range()]).fill(value);
    }
}

/// All tensor layouts of a compiled graph plus their shared buffer.
#[derive(Debug, Clone)]
pub struct TensorArena {
    layouts: IndexMap<ScopeId, TensorLayout>,
    size: usize,
    buffer: ArenaBuffer,
}

impl TensorArena {
    pub(crate) fn new(layouts: IndexMap<ScopeId, TensorLayout>, size: usize) -> Self {
        TensorArena {
            layouts,
            size,
            buffer: ArenaBuffer::zeroed(size),
        }
    }

    /// Total bytes across every scope.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn buffer(&self) -> &ArenaBuffer {
        &self.buffer
    }

    pub fn layout(&self, scope: ScopeId) -> Option<&TensorLayout> {
        self.layouts.get(&scope)
    }

    /// Layouts in planning order: root first, then branch regions.
    pub fn layouts(&self) -> impl Iterator<Item = &TensorLayout> {
        self.layouts.values()
    }

    pub fn slot(&self, tensor: TensorSymbol) -> Option<&Slot> {
        self.layouts.get(&tensor.scope)?.slot(tensor)
    }

    /// Binding of `tensor`, which may live in any scope of the graph.
    pub fn binding(&self, tensor: TensorSymbol) -> Result<TensorBinding, CompileError> {
        resolve_binding(&self.layouts, tensor)
    }

    pub fn read(&self, tensor: TensorSymbol) -> Result<Vec<f64>, CompileError> {
        Ok(self.buffer.read_values(&self.binding(tensor)?))
    }

    pub fn write(&self, tensor: TensorSymbol, values: &[f64]) -> Result<(), CompileError> {
        let binding = self.binding(tensor)?;
        if values.len() != binding.params.element_count() {
            return Err(CompileError::SizeMismatch {
                tensor,
                expected: binding.params.element_count(),
                found: values.len(),
            });
        }
        self.buffer.write_values(&binding, values);
        Ok(())
    }
}
