//! Model persistence envelope and deserialization dispatch
//!
//! Every persisted model travels as a [`ModelEnvelope`]: a class name, a
//! version and a tagged payload. Dispatch is over the closed
//! [`ModelPayload`] variant set; a version newer than the implementation
//! supports is rejected with an error naming the offending version and the
//! supported maximum.

use crate::convert::{FeatureConverter, OutputConverter, Prediction, TargetKind};
use crate::graph::GraphDef;
use crate::marshal::VariableSnapshot;
use crate::metadata::ModelMetadata;
use crate::model::{
    CheckpointModel, FeatureIdMapping, FrozenExternalModel, NativeModel,
};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Serialized form of a [`NativeModel`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativePayload {
    pub name: String,
    pub metadata: ModelMetadata,
    pub graph_def: GraphDef,
    pub tensors: VariableSnapshot,
    pub batch_size: usize,
    pub output_name: String,
    pub output_domain: TargetKind,
    pub feature_converter: FeatureConverter,
    pub output_converter: OutputConverter,
}

/// Serialized form of a [`CheckpointModel`]; the parameters themselves stay
/// on disk at the recorded path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub name: String,
    pub metadata: ModelMetadata,
    pub graph_def: GraphDef,
    pub checkpoint_directory: PathBuf,
    pub checkpoint_name: String,
    pub batch_size: usize,
    pub output_name: String,
    pub output_domain: TargetKind,
    pub feature_converter: FeatureConverter,
    pub output_converter: OutputConverter,
}

/// Serialized form of a [`FrozenExternalModel`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrozenPayload {
    pub name: String,
    pub metadata: ModelMetadata,
    pub graph_def: GraphDef,
    pub mapping: FeatureIdMapping,
    pub batch_size: usize,
    pub output_name: String,
    pub output_domain: TargetKind,
    pub feature_converter: FeatureConverter,
    pub output_converter: OutputConverter,
}

/// The closed set of persistable model variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "model")]
pub enum ModelPayload {
    Native(NativePayload),
    Checkpoint(CheckpointPayload),
    Frozen(FrozenPayload),
}

/// The persistence envelope: class name, version and tagged payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEnvelope {
    pub class_name: String,
    pub version: u32,
    pub payload: ModelPayload,
}

impl ModelEnvelope {
    /// Serializes the envelope to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::Serialization(format!("envelope encoding failed: {e}")))
    }

    /// Parses an envelope from bytes; this does not yet build a model, use
    /// [`deserialize`] for that.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Serialization(format!("envelope decoding failed: {e}")))
    }
}

/// Any deserialized model, dispatched from an envelope.
pub enum AnyModel {
    Native(NativeModel),
    Checkpoint(CheckpointModel),
    Frozen(FrozenExternalModel),
}

impl AnyModel {
    pub fn name(&self) -> &str {
        match self {
            AnyModel::Native(m) => m.name(),
            AnyModel::Checkpoint(m) => m.name(),
            AnyModel::Frozen(m) => m.name(),
        }
    }

    pub fn predict(&self, features: &[f32]) -> Result<Prediction> {
        match self {
            AnyModel::Native(m) => m.predict(features),
            AnyModel::Checkpoint(m) => m.predict(features),
            AnyModel::Frozen(m) => m.predict(features),
        }
    }

    pub fn predict_batch(&self, examples: &[Vec<f32>]) -> Result<Vec<Prediction>> {
        match self {
            AnyModel::Native(m) => m.predict_batch(examples),
            AnyModel::Checkpoint(m) => m.predict_batch(examples),
            AnyModel::Frozen(m) => m.predict_batch(examples),
        }
    }

    pub fn serialize(&self) -> Result<ModelEnvelope> {
        match self {
            AnyModel::Native(m) => m.serialize(),
            AnyModel::Checkpoint(m) => m.serialize(),
            AnyModel::Frozen(m) => m.serialize(),
        }
    }

    pub fn close(&mut self) {
        match self {
            AnyModel::Native(m) => m.close(),
            AnyModel::Checkpoint(m) => m.close(),
            AnyModel::Frozen(m) => m.close(),
        }
    }

    /// The native variant, if that is what was deserialized.
    pub fn into_native(self) -> Option<NativeModel> {
        match self {
            AnyModel::Native(m) => Some(m),
            _ => None,
        }
    }

    /// The checkpoint variant, if that is what was deserialized.
    pub fn into_checkpoint(self) -> Option<CheckpointModel> {
        match self {
            AnyModel::Checkpoint(m) => Some(m),
            _ => None,
        }
    }

    /// The frozen variant, if that is what was deserialized.
    pub fn into_frozen(self) -> Option<FrozenExternalModel> {
        match self {
            AnyModel::Frozen(m) => Some(m),
            _ => None,
        }
    }
}

impl std::fmt::Debug for AnyModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            AnyModel::Native(_) => "Native",
            AnyModel::Checkpoint(_) => "Checkpoint",
            AnyModel::Frozen(_) => "Frozen",
        };
        f.debug_struct("AnyModel")
            .field("variant", &variant)
            .field("name", &self.name())
            .finish()
    }
}

/// Rebuilds a model from its persistence envelope.
///
/// Dispatch is by class name and version: an unknown class name, a version
/// above the variant's supported maximum, a payload that disagrees with the
/// class name, or an output domain that disagrees with the converter are
/// all fatal.
pub fn deserialize(envelope: ModelEnvelope) -> Result<AnyModel> {
    let max = match envelope.class_name.as_str() {
        NativeModel::CLASS_NAME => NativeModel::CURRENT_VERSION,
        CheckpointModel::CLASS_NAME => CheckpointModel::CURRENT_VERSION,
        FrozenExternalModel::CLASS_NAME => FrozenExternalModel::CURRENT_VERSION,
        _ => {
            return Err(Error::UnknownModelClass {
                class_name: envelope.class_name,
            })
        }
    };
    if envelope.version > max {
        return Err(Error::UnsupportedVersion {
            class_name: envelope.class_name,
            found: envelope.version,
            max,
        });
    }

    match (envelope.class_name.as_str(), envelope.payload) {
        (NativeModel::CLASS_NAME, ModelPayload::Native(payload)) => {
            check_domain(payload.output_domain, &payload.output_converter)?;
            Ok(AnyModel::Native(NativeModel::new(
                payload.name,
                payload.metadata,
                &payload.graph_def,
                &payload.tensors,
                payload.batch_size,
                payload.output_name,
                payload.feature_converter,
                payload.output_converter,
            )?))
        }
        (CheckpointModel::CLASS_NAME, ModelPayload::Checkpoint(payload)) => {
            check_domain(payload.output_domain, &payload.output_converter)?;
            Ok(AnyModel::Checkpoint(CheckpointModel::new(
                payload.name,
                payload.metadata,
                &payload.graph_def,
                payload.checkpoint_directory,
                payload.checkpoint_name,
                payload.batch_size,
                payload.output_name,
                payload.feature_converter,
                payload.output_converter,
            )?))
        }
        (FrozenExternalModel::CLASS_NAME, ModelPayload::Frozen(payload)) => {
            check_domain(payload.output_domain, &payload.output_converter)?;
            Ok(AnyModel::Frozen(FrozenExternalModel::new(
                payload.name,
                payload.metadata,
                &payload.graph_def,
                payload.mapping,
                payload.batch_size,
                payload.output_name,
                payload.feature_converter,
                payload.output_converter,
            )?))
        }
        (class_name, _) => Err(Error::Serialization(format!(
            "envelope payload does not match class '{class_name}'"
        ))),
    }
}

fn check_domain(domain: TargetKind, converter: &OutputConverter) -> Result<()> {
    if domain != converter.target_kind() {
        return Err(Error::ConverterMismatch {
            output: domain.name().to_string(),
            converter: converter.target_kind().name().to_string(),
        });
    }
    Ok(())
}
