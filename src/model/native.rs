//! Self-contained model with an embedded variable snapshot

use crate::convert::{FeatureConverter, OutputConverter, Prediction};
use crate::graph::GraphDef;
use crate::marshal::{extract_variables, restore_variables, VariableSnapshot};
use crate::metadata::ModelMetadata;
use crate::model::envelope::{ModelEnvelope, ModelPayload, NativePayload};
use crate::model::{CheckpointModel, ModelResources};
use crate::Result;
use std::path::Path;

/// A model whose serialized form embeds the variable values and is entirely
/// self contained.
///
/// Construction imports the graph def, opens a session and restores the
/// embedded snapshot through the graph's annotation ops. To move the
/// parameters into an on-disk checkpoint instead, call
/// [`NativeModel::convert_to_checkpoint`].
pub struct NativeModel {
    resources: ModelResources,
}

impl NativeModel {
    /// Envelope discriminator for this variant.
    pub const CLASS_NAME: &'static str = "acoplar.NativeModel";
    /// Highest envelope version this implementation can read.
    pub const CURRENT_VERSION: u32 = 0;

    /// Builds a model from a graph def (annotated, see
    /// [`crate::marshal::annotate_graph`]) and the matching snapshot.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        metadata: ModelMetadata,
        graph_def: &GraphDef,
        tensors: &VariableSnapshot,
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
        restore_variables(resources.session()?, tensors)?;
        Ok(Self { resources })
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

    pub fn batch_size(&self) -> usize {
        self.resources.batch_size()
    }

    pub fn set_batch_size(&mut self, batch_size: usize) -> Result<()> {
        self.resources.set_batch_size(batch_size)
    }

    pub fn is_closed(&self) -> bool {
        self.resources.is_closed()
    }

    /// Predicts a single dense example.
    pub fn predict(&self, features: &[f32]) -> Result<Prediction> {
        self.resources.predict(features)
    }

    /// Predicts a batch, chunked at the configured batch size.
    pub fn predict_batch(&self, examples: &[Vec<f32>]) -> Result<Vec<Prediction>> {
        self.resources.predict_batch(examples)
    }

    /// Produces an independent open model with its own graph and session by
    /// re-exporting the graph def and re-extracting a fresh snapshot.
    pub fn copy(&self, new_name: impl Into<String>, new_metadata: ModelMetadata) -> Result<Self> {
        let graph = self.resources.graph()?;
        let def = graph.to_graph_def();
        let tensors = extract_variables(graph, self.resources.session()?)?;
        Self::new(
            new_name,
            new_metadata,
            &def,
            &tensors,
            self.resources.batch_size(),
            self.resources.output_name.clone(),
            self.resources.feature_converter.clone(),
            self.resources.output_converter.clone(),
        )
    }

    /// Saves the live session state to `directory/name` and returns a new
    /// [`CheckpointModel`] bound to that path. This model is left open and
    /// unchanged.
    pub fn convert_to_checkpoint(
        &self,
        directory: impl Into<std::path::PathBuf>,
        checkpoint_name: impl Into<String>,
    ) -> Result<CheckpointModel> {
        let directory = directory.into();
        let checkpoint_name = checkpoint_name.into();
        let session = self.resources.session()?;
        session.save(&directory.join(&checkpoint_name))?;
        CheckpointModel::new(
            self.resources.name.clone(),
            self.resources.metadata.clone(),
            &self.resources.graph()?.to_graph_def(),
            directory,
            checkpoint_name,
            self.resources.batch_size(),
            self.resources.output_name.clone(),
            self.resources.feature_converter.clone(),
            self.resources.output_converter.clone(),
        )
    }

    /// Serializes into a persistence envelope with a freshly extracted
    /// snapshot; fails on a closed model.
    pub fn serialize(&self) -> Result<ModelEnvelope> {
        let graph = self.resources.graph()?;
        let tensors = extract_variables(graph, self.resources.session()?)?;
        Ok(ModelEnvelope {
            class_name: Self::CLASS_NAME.to_string(),
            version: Self::CURRENT_VERSION,
            payload: ModelPayload::Native(NativePayload {
                name: self.resources.name.clone(),
                metadata: self.resources.metadata.clone(),
                graph_def: graph.to_graph_def(),
                tensors,
                batch_size: self.resources.batch_size(),
                output_name: self.resources.output_name.clone(),
                output_domain: self.resources.output_converter.target_kind(),
                feature_converter: self.resources.feature_converter.clone(),
                output_converter: self.resources.output_converter.clone(),
            }),
        })
    }

    /// Writes a self-describing export directory (graph def + checkpoint).
    pub fn export_saved_model(&self, dir: &Path) -> Result<()> {
        self.resources.export_saved_model(dir)
    }

    /// Releases the session and graph; a second call is a no-op.
    pub fn close(&mut self) {
        self.resources.close();
    }
}
