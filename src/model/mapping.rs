//! Feature id mapping for externally trained models

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// A bijection between the toolkit's dense feature ids and an external
/// model's input ids.
///
/// `forward[internal] == external` and `backward[external] == internal`;
/// both compositions must be the identity. Violating pairs are rejected at
/// construction and again when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedMapping")]
pub struct FeatureIdMapping {
    forward: Vec<usize>,
    backward: Vec<usize>,
}

#[derive(Deserialize)]
struct UncheckedMapping {
    forward: Vec<usize>,
    backward: Vec<usize>,
}

impl TryFrom<UncheckedMapping> for FeatureIdMapping {
    type Error = Error;

    fn try_from(raw: UncheckedMapping) -> Result<Self> {
        FeatureIdMapping::new(raw.forward, raw.backward)
    }
}

impl FeatureIdMapping {
    /// Builds a mapping from both directions, validating the bijection.
    pub fn new(forward: Vec<usize>, backward: Vec<usize>) -> Result<Self> {
        if forward.len() != backward.len() {
            return Err(Error::MappingNotBijective(format!(
                "forward has {} entries, backward has {}",
                forward.len(),
                backward.len()
            )));
        }
        let n = forward.len();
        for (internal, external) in forward.iter().enumerate() {
            if *external >= n {
                return Err(Error::MappingNotBijective(format!(
                    "forward[{internal}] = {external} is out of range for {n} features"
                )));
            }
            if backward[*external] != internal {
                return Err(Error::MappingNotBijective(format!(
                    "backward[{external}] = {} but forward[{internal}] = {external}",
                    backward[*external]
                )));
            }
        }
        for (external, internal) in backward.iter().enumerate() {
            if *internal >= n {
                return Err(Error::MappingNotBijective(format!(
                    "backward[{external}] = {internal} is out of range for {n} features"
                )));
            }
            if forward[*internal] != external {
                return Err(Error::MappingNotBijective(format!(
                    "forward[{internal}] = {} but backward[{external}] = {internal}",
                    forward[*internal]
                )));
            }
        }
        Ok(Self { forward, backward })
    }

    /// Builds a mapping from the external id assigned to each internal id,
    /// deriving the backward direction.
    pub fn from_external_ids(external_ids: &[usize]) -> Result<Self> {
        let n = external_ids.len();
        let mut backward = vec![usize::MAX; n];
        for (internal, external) in external_ids.iter().enumerate() {
            if *external >= n {
                return Err(Error::MappingNotBijective(format!(
                    "external id {external} is out of range for {n} features"
                )));
            }
            if backward[*external] != usize::MAX {
                return Err(Error::MappingNotBijective(format!(
                    "external id {external} mapped twice"
                )));
            }
            backward[*external] = internal;
        }
        Self::new(external_ids.to_vec(), backward)
    }

    /// The identity mapping over `n` features.
    pub fn identity(n: usize) -> Self {
        let ids: Vec<usize> = (0..n).collect();
        Self {
            forward: ids.clone(),
            backward: ids,
        }
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn forward(&self) -> &[usize] {
        &self.forward
    }

    pub fn backward(&self) -> &[usize] {
        &self.backward
    }

    /// Reorders a dense feature vector into the external model's id space.
    pub fn map_features(&self, features: &[f32]) -> Result<Vec<f32>> {
        if features.len() != self.forward.len() {
            return Err(Error::ShapeMismatch {
                expected: vec![self.forward.len() as u64],
                got: vec![features.len() as u64],
            });
        }
        let mut mapped = vec![0.0f32; features.len()];
        for (internal, value) in features.iter().enumerate() {
            mapped[self.forward[internal]] = *value;
        }
        Ok(mapped)
    }
}
