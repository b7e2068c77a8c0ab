//! Portable tensor tuples and their wire format
//!
//! A [`TensorTuple`] is the engine-independent form of a single tensor:
//! element kind tag, shape and a raw byte copy. The wire format is a
//! little-endian length-prefixed encoding that round-trips losslessly and
//! caps the payload at a 32-bit byte count; an oversized tensor is rejected
//! outright, never truncated.

use crate::graph::{DType, Tensor};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Hard cap on the marshalled byte length of a single tensor.
pub const MAX_TENSOR_BYTES: u64 = i32::MAX as u64;

/// A serializable tuple of element kind, shape and raw data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorTuple {
    /// The element kind tag.
    pub kind: DType,
    /// The dimensions of the tensor.
    pub shape: Vec<u64>,
    /// The raw little-endian data.
    pub data: Vec<u8>,
}

impl TensorTuple {
    /// Captures a tensor into its portable form.
    ///
    /// Fails with [`Error::TensorTooLarge`] when the byte length exceeds
    /// [`MAX_TENSOR_BYTES`].
    pub fn of(tensor: &Tensor) -> Result<Self> {
        ensure_within_cap(tensor.byte_len())?;
        Ok(Self {
            kind: tensor.dtype(),
            shape: tensor.shape().to_vec(),
            data: tensor.data().to_vec(),
        })
    }

    /// Recreates the tensor from the portable form.
    ///
    /// The element kind is resolved against the closed [`DType`] set; the
    /// shape/data length invariant is re-validated.
    pub fn rebuild(&self) -> Result<Tensor> {
        Tensor::new(self.kind, self.shape.clone(), self.data.clone())
    }

    /// Encodes the tuple in the wire format:
    /// `[kind u8][rank u32][shape i64 × rank][len u32][data]`,
    /// all little-endian.
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        ensure_within_cap(self.data.len() as u64)?;
        let mut out = Vec::with_capacity(1 + 4 + self.shape.len() * 8 + 4 + self.data.len());
        out.push(kind_tag(self.kind));
        out.extend_from_slice(&(self.shape.len() as u32).to_le_bytes());
        for dim in &self.shape {
            out.extend_from_slice(&(*dim as i64).to_le_bytes());
        }
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
        Ok(out)
    }

    /// Decodes a tuple from the wire format, validating the kind tag, the
    /// length prefix and the shape/data invariant.
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let tag = cursor.take(1)?[0];
        let kind = kind_from_tag(tag)?;
        let rank = u32::from_le_bytes(cursor.take(4)?.try_into().unwrap()) as usize;
        let mut shape = Vec::with_capacity(rank);
        for _ in 0..rank {
            let dim = i64::from_le_bytes(cursor.take(8)?.try_into().unwrap());
            if dim < 0 {
                return Err(Error::Serialization(format!(
                    "negative dimension {dim} in wire tensor"
                )));
            }
            shape.push(dim as u64);
        }
        let len = u32::from_le_bytes(cursor.take(4)?.try_into().unwrap()) as usize;
        let data = cursor.take(len)?.to_vec();
        if cursor.pos != bytes.len() {
            return Err(Error::Serialization(format!(
                "{} trailing bytes after wire tensor",
                bytes.len() - cursor.pos
            )));
        }
        let tuple = Self { kind, shape, data };
        // Re-validate the invariant before handing the tuple out.
        tuple.rebuild()?;
        Ok(tuple)
    }
}

/// Rejects byte lengths over the 32-bit cap; the tensor is refused whole,
/// never truncated.
fn ensure_within_cap(found: u64) -> Result<()> {
    if found > MAX_TENSOR_BYTES {
        return Err(Error::TensorTooLarge {
            found,
            max: MAX_TENSOR_BYTES,
        });
    }
    Ok(())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(Error::Serialization(format!(
                "wire tensor truncated: wanted {n} bytes at offset {}, have {}",
                self.pos,
                self.bytes.len() - self.pos
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

fn kind_tag(kind: DType) -> u8 {
    match kind {
        DType::Float => 0,
        DType::Double => 1,
        DType::Int32 => 2,
        DType::Int64 => 3,
        DType::UInt8 => 4,
        DType::Bool => 5,
    }
}

fn kind_from_tag(tag: u8) -> Result<DType> {
    match tag {
        0 => Ok(DType::Float),
        1 => Ok(DType::Double),
        2 => Ok(DType::Int32),
        3 => Ok(DType::Int64),
        4 => Ok(DType::UInt8),
        5 => Ok(DType::Bool),
        other => Err(Error::Serialization(format!(
            "unknown element kind tag {other} in wire tensor"
        ))),
    }
}
