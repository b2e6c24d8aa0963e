//! Tensor descriptors and typed byte views.
//!
//! A [`TensorParams`] is the declared shape and element type of a tensor
//! symbol. Views wrap raw bytes (usually a slice of a compiled tensor arena)
//! and expose element access as `f64`, converting to and from the declared
//! element type.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    F32,
    F64,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F64 => 8,
        }
    }
}

/// Declared shape and type of a tensor symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorParams {
    pub datatype: DataType,
    pub dims: SmallVec<[usize; 4]>,
}

impl TensorParams {
    pub fn new(datatype: DataType, dims: &[usize]) -> Self {
        TensorParams {
            datatype,
            dims: SmallVec::from_slice(dims),
        }
    }

    pub fn f32(dims: &[usize]) -> Self {
        Self::new(DataType::F32, dims)
    }

    pub fn f64(dims: &[usize]) -> Self {
        Self::new(DataType::F64, dims)
    }

    /// Number of elements. A rank-0 tensor holds one element.
    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn byte_size(&self) -> usize {
        self.element_count() * self.datatype.size()
    }

    /// Rows and columns of a rank-2 tensor.
    pub fn matrix_dims(&self) -> Option<(usize, usize)> {
        match self.dims.as_slice() {
            [rows, cols] => Some((*rows, *cols)),
            _ => None,
        }
    }
}

fn read_element(datatype: DataType, bytes: &[u8], index: usize) -> f64 {
    match datatype {
        DataType::F32 => {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[index * 4..index * 4 + 4]);
            f32::from_ne_bytes(raw) as f64
        }
        DataType::F64 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[index * 8..index * 8 + 8]);
            f64::from_ne_bytes(raw)
        }
    }
}

fn write_element(datatype: DataType, bytes: &mut [u8], index: usize, value: f64) {
    match datatype {
        DataType::F32 => {
            bytes[index * 4..index * 4 + 4].copy_from_slice(&(value as f32).to_ne_bytes())
        }
        DataType::F64 => bytes[index * 8..index * 8 + 8].copy_from_slice(&value.to_ne_bytes()),
    }
}

/// Read-only typed view over the bytes of one tensor.
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    params: &'a TensorParams,
    bytes: &'a [u8],
}

impl<'a> TensorView<'a> {
    /// Wraps `bytes`, which must hold at least `params.byte_size()` bytes.
    pub fn new(params: &'a TensorParams, bytes: &'a [u8]) -> Self {
        debug_assert!(bytes.len() >= params.byte_size());
        TensorView { params, bytes }
    }

    pub fn params(&self) -> &'a TensorParams {
        self.params
    }

    pub fn len(&self) -> usize {
        self.params.element_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> f64 {
        read_element(self.params.datatype, self.bytes, index)
    }

    /// First element, the usual accessor for case-of predicates.
    pub fn scalar(&self) -> f64 {
        self.get(0)
    }

    pub fn to_vec(&self) -> Vec<f64> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }
}

/// Mutable typed view over the bytes of one tensor.
#[derive(Debug)]
pub struct TensorViewMut<'a> {
    params: &'a TensorParams,
    bytes: &'a mut [u8],
}

impl<'a> TensorViewMut<'a> {
    pub fn new(params: &'a TensorParams, bytes: &'a mut [u8]) -> Self {
        debug_assert!(bytes.len() >= params.byte_size());
        TensorViewMut { params, bytes }
    }

    pub fn params(&self) -> &TensorParams {
        self.params
    }

    pub fn len(&self) -> usize {
        self.params.element_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> f64 {
        read_element(self.params.datatype, self.bytes, index)
    }

    pub fn set(&mut self, index: usize, value: f64) {
        write_element(self.params.datatype, self.bytes, index, value);
    }

    pub fn fill(&mut self, value: f64) {
        for i in 0..self.len() {
            self.set(i, value);
        }
    }

    /// Writes `values` element by element; extra values are ignored.
    pub fn copy_from(&mut self, values: &[f64]) {
        for (i, v) in values.iter().take(self.len()).enumerate() {
            self.set(i, *v);
        }
    }

    pub fn as_view(&self) -> TensorView<'_> {
        TensorView::new(self.params, self.bytes)
    }
}

/// Encodes `values` as the raw bytes of a tensor with `params`.
pub fn encode(params: &TensorParams, values: &[f64]) -> Vec<u8> {
    let mut bytes = vec![0u8; params.byte_size()];
    TensorViewMut::new(params, &mut bytes).copy_from(values);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        let p = TensorParams::f32(&[2, 3]);
        assert_eq!(p.element_count(), 6);
        assert_eq!(p.byte_size(), 24);
        assert_eq!(TensorParams::f64(&[4]).byte_size(), 32);
        assert_eq!(p.matrix_dims(), Some((2, 3)));
        assert_eq!(TensorParams::f32(&[1]).matrix_dims(), None);
    }

    #[test]
    fn f32_view_converts() {
        let p = TensorParams::f32(&[3]);
        let bytes = encode(&p, &[1.5, -2.0, 0.25]);
        let view = TensorView::new(&p, &bytes);
        assert_eq!(view.to_vec(), vec![1.5, -2.0, 0.25]);
        assert_eq!(view.scalar(), 1.5);
    }

    #[test]
    fn mut_view_fill_and_set() {
        let p = TensorParams::f64(&[2]);
        let mut bytes = vec![0u8; p.byte_size()];
        let mut view = TensorViewMut::new(&p, &mut bytes);
        view.fill(3.0);
        view.set(1, 0.5);
        assert_eq!(view.as_view().to_vec(), vec![3.0, 0.5]);
    }
}
