//! Host-memory tensor
//!
//! Row-major `f32` storage with an arbitrary-rank shape. Image tensors use
//! the NCHW convention throughout the crate.

use crate::errors::{ParityError, Result};
use serde::{Deserialize, Serialize};

/// Number of elements in `shape`, or `None` if the product overflows
pub fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

/// Dense row-major tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    /// Dimensions, outermost first
    pub shape: Vec<usize>,
    /// Row-major data storage
    pub data: Vec<f32>,
}

impl Tensor {
    /// Create a tensor, checking that `data` fills `shape` exactly
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected = element_count(&shape).ok_or_else(|| {
            ParityError::Shape(format!("Shape {:?} has too many elements", shape))
        })?;
        if data.len() != expected {
            return Err(ParityError::Shape(format!(
                "Data length {} doesn't match shape {:?} ({} elements)",
                data.len(),
                shape,
                expected
            )));
        }
        Ok(Self { shape, data })
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Get total number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Interpret as NCHW and return `(n, c, h, w)`
    pub fn dims4(&self) -> Result<(usize, usize, usize, usize)> {
        match self.shape.as_slice() {
            &[n, c, h, w] => Ok((n, c, h, w)),
            other => Err(ParityError::Shape(format!(
                "Expected a rank-4 NCHW tensor, got shape {:?}",
                other
            ))),
        }
    }

    /// Same data under a new shape with the same element count
    pub fn reshape(self, shape: Vec<usize>) -> Result<Self> {
        Self::new(shape, self.data)
    }

    /// Slice of the `index`-th entry along the first axis
    pub fn row(&self, index: usize) -> Result<&[f32]> {
        let rows = self.shape.first().copied().unwrap_or(0);
        if index >= rows {
            return Err(ParityError::Shape(format!(
                "Row {} out of range for shape {:?}",
                index, self.shape
            )));
        }
        let stride = self.data.len() / rows;
        Ok(&self.data[index * stride..(index + 1) * stride])
    }

    /// First `n` elements of row 0 (fewer if the row is shorter)
    pub fn head(&self, n: usize) -> &[f32] {
        match self.row(0) {
            Ok(row) => &row[..n.min(row.len())],
            Err(_) => &[],
        }
    }

    /// Raw little-endian bytes, the layout used by binary tensor payloads
    pub fn to_le_bytes(&self) -> Vec<u8> {
        if cfg!(target_endian = "little") {
            bytemuck::cast_slice::<f32, u8>(self.data.as_slice()).to_vec()
        } else {
            self.data.iter().flat_map(|v| v.to_le_bytes()).collect()
        }
    }

    /// Rebuild a tensor from little-endian `f32` bytes
    pub fn from_le_bytes(shape: Vec<usize>, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(ParityError::Shape(format!(
                "Byte length {} is not a multiple of 4",
                bytes.len()
            )));
        }
        let data = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::new(shape, data)
    }
}
