//! Dense tensor values exchanged with the execution engine

use crate::{Error, Result};
use ndarray::{Array2, ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

/// Element kinds the engine can store and marshal.
///
/// This is a closed set; tensor reconstruction matches on it exhaustively
/// rather than resolving kinds dynamically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit IEEE float.
    Float,
    /// 64-bit IEEE float.
    Double,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// Unsigned byte.
    UInt8,
    /// Boolean, stored one byte per element.
    Bool,
}

impl DType {
    /// Width of a single element in bytes.
    pub fn size_of(self) -> usize {
        match self {
            DType::Float | DType::Int32 => 4,
            DType::Double | DType::Int64 => 8,
            DType::UInt8 | DType::Bool => 1,
        }
    }

    /// Stable name used in error messages and the wire format.
    pub fn name(self) -> &'static str {
        match self {
            DType::Float => "float",
            DType::Double => "double",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::UInt8 => "uint8",
            DType::Bool => "bool",
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A dense, row-major tensor value.
///
/// The engine passes tensors around by value; dropping one releases its
/// storage, so every exit path releases on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<u64>,
    data: Vec<u8>,
}

impl Tensor {
    /// Creates a tensor from raw bytes, validating the length invariant.
    pub fn new(dtype: DType, shape: Vec<u64>, data: Vec<u8>) -> Result<Self> {
        let expected = element_count(&shape).saturating_mul(dtype.size_of() as u64);
        if expected != data.len() as u64 {
            return Err(Error::LengthMismatch {
                expected: expected as usize,
                got: data.len(),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    /// A zero-filled tensor.
    pub fn zeros(dtype: DType, shape: Vec<u64>) -> Self {
        let len = element_count(&shape) as usize * dtype.size_of();
        Self {
            dtype,
            shape,
            data: vec![0u8; len],
        }
    }

    /// A float tensor from a value slice.
    pub fn from_f32(shape: &[u64], values: &[f32]) -> Result<Self> {
        if element_count(shape) != values.len() as u64 {
            return Err(Error::LengthMismatch {
                expected: element_count(shape) as usize * 4,
                got: values.len() * 4,
            });
        }
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Ok(Self {
            dtype: DType::Float,
            shape: shape.to_vec(),
            data,
        })
    }

    /// A rank-0 float tensor.
    pub fn scalar_f32(value: f32) -> Self {
        Self {
            dtype: DType::Float,
            shape: Vec::new(),
            data: value.to_le_bytes().to_vec(),
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Raw little-endian bytes backing this tensor.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn num_elements(&self) -> u64 {
        element_count(&self.shape)
    }

    /// Total storage size in bytes.
    pub fn byte_len(&self) -> u64 {
        self.data.len() as u64
    }

    fn check_dtype(&self, expected: DType, op: &str) -> Result<()> {
        if self.dtype != expected {
            return Err(Error::DTypeMismatch {
                op: op.to_string(),
                expected: expected.name(),
                got: self.dtype.name(),
            });
        }
        Ok(())
    }

    /// Decodes the tensor into a float vector.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        self.check_dtype(DType::Float, "to_f32_vec")?;
        Ok(self
            .data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Reads a rank-0 float tensor.
    pub fn scalar_value(&self) -> Result<f32> {
        self.check_dtype(DType::Float, "scalar_value")?;
        if self.num_elements() != 1 {
            return Err(Error::ShapeMismatch {
                expected: vec![],
                got: self.shape.clone(),
            });
        }
        Ok(f32::from_le_bytes([
            self.data[0],
            self.data[1],
            self.data[2],
            self.data[3],
        ]))
    }

    /// Views the tensor as a dynamic-dimension float array.
    pub fn to_array(&self) -> Result<ArrayD<f32>> {
        let values = self.to_f32_vec()?;
        let dims: Vec<usize> = self.shape.iter().map(|d| *d as usize).collect();
        ArrayD::from_shape_vec(IxDyn(&dims), values).map_err(|e| {
            Error::Serialization(format!("tensor shape does not match storage: {e}"))
        })
    }

    /// Views the tensor as a 2-D float array.
    pub fn to_array2(&self) -> Result<Array2<f32>> {
        if self.shape.len() != 2 {
            return Err(Error::ShapeMismatch {
                expected: vec![0, 0],
                got: self.shape.clone(),
            });
        }
        let values = self.to_f32_vec()?;
        Array2::from_shape_vec(
            (self.shape[0] as usize, self.shape[1] as usize),
            values,
        )
        .map_err(|e| Error::Serialization(format!("tensor shape does not match storage: {e}")))
    }

    /// Builds a float tensor from a dynamic-dimension array.
    pub fn from_array(array: &ArrayD<f32>) -> Self {
        let shape: Vec<u64> = array.shape().iter().map(|d| *d as u64).collect();
        let mut data = Vec::with_capacity(array.len() * 4);
        for v in array.iter() {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            dtype: DType::Float,
            shape,
            data,
        }
    }

    /// Builds a float tensor from a 2-D array.
    pub fn from_array2(array: &Array2<f32>) -> Self {
        let shape = vec![array.nrows() as u64, array.ncols() as u64];
        let mut data = Vec::with_capacity(array.len() * 4);
        for v in array.iter() {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            dtype: DType::Float,
            shape,
            data,
        }
    }
}

/// Number of elements described by a shape; a scalar has one. Saturates so
/// hostile shapes surface as a length mismatch instead of an overflow.
pub(crate) fn element_count(shape: &[u64]) -> u64 {
    shape.iter().fold(1u64, |acc, d| acc.saturating_mul(*d))
}
