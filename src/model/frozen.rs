//! Read-only wrapper around an externally trained frozen graph

use crate::convert::{FeatureConverter, OutputConverter, Prediction};
use crate::graph::GraphDef;
use crate::metadata::ModelMetadata;
use crate::model::envelope::{FrozenPayload, ModelEnvelope, ModelPayload};
use crate::model::{FeatureIdMapping, ModelResources};
use crate::Result;
use std::path::Path;

/// A model trained outside the toolkit, loaded from a frozen graph whose
/// variables were already folded into constants.
///
/// The toolkit's feature ids and the external model's input ids are bridged
/// by a [`FeatureIdMapping`] whose bijection is validated at construction;
/// an invalid mapping is fatal.
pub struct FrozenExternalModel {
    resources: ModelResources,
    mapping: FeatureIdMapping,
}

impl FrozenExternalModel {
    /// Envelope discriminator for this variant.
    pub const CLASS_NAME: &'static str = "acoplar.FrozenExternalModel";
    /// Highest envelope version this implementation can read.
    pub const CURRENT_VERSION: u32 = 0;

    /// Wraps a frozen graph def behind the supplied feature mapping.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        metadata: ModelMetadata,
        graph_def: &GraphDef,
        mapping: FeatureIdMapping,
        batch_size: usize,
        output_name: impl Into<String>,
        feature_converter: FeatureConverter,
        output_converter: OutputConverter,
    ) -> Result<Self> {
        let resources = ModelResources::open(
            name.into(),
            metadata,
            graph_def,
            batch_size,
            output_name.into(),
            feature_converter,
            output_converter,
        )?;
        Ok(Self { resources, mapping })
    }

    /// Loads a frozen graph def from disk and wraps it.
    #[allow(clippy::too_many_arguments)]
    pub fn from_path(
        path: impl AsRef<Path>,
        name: impl Into<String>,
        metadata: ModelMetadata,
        mapping: FeatureIdMapping,
        batch_size: usize,
        output_name: impl Into<String>,
        feature_converter: FeatureConverter,
        output_converter: OutputConverter,
    ) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let graph_def = GraphDef::from_bytes(&bytes)?;
        Self::new(
            name,
            metadata,
            &graph_def,
            mapping,
            batch_size,
            output_name,
            feature_converter,
            output_converter,
        )
    }

    pub fn name(&self) -> &str {
        &self.resources.name
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.resources.metadata
    }

    pub fn output_name(&self) -> &str {
        &self.resources.output_name
    }

    pub fn mapping(&self) -> &FeatureIdMapping {
        &self.mapping
    }

    pub fn batch_size(&self) -> usize {
        self.resources.batch_size()
    }

    pub fn set_batch_size(&mut self, batch_size: usize) -> Result<()> {
        self.resources.set_batch_size(batch_size)
    }

    pub fn is_closed(&self) -> bool {
        self.resources.is_closed()
    }

    /// Predicts a single example, routing the features through the forward
    /// id mapping first.
    pub fn predict(&self, features: &[f32]) -> Result<Prediction> {
        let mapped = self.mapping.map_features(features)?;
        self.resources.predict(&mapped)
    }

    /// Predicts a batch, chunked at the configured batch size.
    pub fn predict_batch(&self, examples: &[Vec<f32>]) -> Result<Vec<Prediction>> {
        let mapped = examples
            .iter()
            .map(|f| self.mapping.map_features(f))
            .collect::<Result<Vec<_>>>()?;
        self.resources.predict_batch(&mapped)
    }

    /// Produces an independent open model over a fresh import of the same
    /// frozen graph.
    pub fn copy(&self, new_name: impl Into<String>, new_metadata: ModelMetadata) -> Result<Self> {
        Self::new(
            new_name,
            new_metadata,
            &self.resources.graph()?.to_graph_def(),
            self.mapping.clone(),
            self.resources.batch_size(),
            self.resources.output_name.clone(),
            self.resources.feature_converter.clone(),
            self.resources.output_converter.clone(),
        )
    }

    /// Serializes into a persistence envelope; fails on a closed model.
    pub fn serialize(&self) -> Result<ModelEnvelope> {
        let graph = self.resources.graph()?;
        Ok(ModelEnvelope {
            class_name: Self::CLASS_NAME.to_string(),
            version: Self::CURRENT_VERSION,
            payload: ModelPayload::Frozen(FrozenPayload {
                name: self.resources.name.clone(),
                metadata: self.resources.metadata.clone(),
                graph_def: graph.to_graph_def(),
                mapping: self.mapping.clone(),
                batch_size: self.resources.batch_size(),
                output_name: self.resources.output_name.clone(),
                output_domain: self.resources.output_converter.target_kind(),
                feature_converter: self.resources.feature_converter.clone(),
                output_converter: self.resources.output_converter.clone(),
            }),
        })
    }

    /// Releases the session and graph; a second call is a no-op.
    pub fn close(&mut self) {
        self.resources.close();
    }
}
