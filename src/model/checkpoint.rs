//! Checkpoint-backed model

use crate::convert::{FeatureConverter, OutputConverter, Prediction};
use crate::graph::GraphDef;
use crate::marshal::extract_variables;
use crate::metadata::ModelMetadata;
use crate::model::envelope::{CheckpointPayload, ModelEnvelope, ModelPayload};
use crate::model::{ModelResources, NativeModel};
use crate::Result;
use std::path::{Path, PathBuf};

/// A model whose parameters live in an on-disk checkpoint at a directory +
/// name pair handed opaquely to the engine's checkpoint reader.
///
/// If the checkpoint is unavailable at construction the model comes up
/// uninitialized rather than failing; repair the path with
/// [`CheckpointModel::set_checkpoint_directory`] /
/// [`CheckpointModel::set_checkpoint_name`] and call
/// [`CheckpointModel::initialize`] again. To embed the parameters in the
/// model itself call [`CheckpointModel::convert_to_native`].
pub struct CheckpointModel {
    resources: ModelResources,
    checkpoint_directory: PathBuf,
    checkpoint_name: String,
    initialized: bool,
}

impl CheckpointModel {
    /// Envelope discriminator for this variant.
    pub const CLASS_NAME: &'static str = "acoplar.CheckpointModel";
    /// Highest envelope version this implementation can read.
    pub const CURRENT_VERSION: u32 = 0;

    /// Builds a model over the graph def and attempts to restore the
    /// checkpoint; a restore failure leaves the model uninitialized.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        metadata: ModelMetadata,
        graph_def: &GraphDef,
        checkpoint_directory: impl Into<PathBuf>,
        checkpoint_name: impl Into<String>,
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
        let mut model = Self {
            resources,
            checkpoint_directory: checkpoint_directory.into(),
            checkpoint_name: checkpoint_name.into(),
            initialized: false,
        };
        match model.resources.session()?.restore(&model.resolve_path()) {
            Ok(()) => model.initialized = true,
            Err(e) => {
                log::warn!(
                    "failed to initialise model from directory {}: {e}",
                    model.checkpoint_directory.display()
                );
            }
        }
        Ok(model)
    }

    /// Composes the path prefix handed to the engine.
    fn resolve_path(&self) -> PathBuf {
        self.checkpoint_directory.join(&self.checkpoint_name)
    }

    /// True when the model is ready to make predictions.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Re-initializes the model: drops the old session, opens a fresh one
    /// and restores from the current checkpoint path. Unlike construction,
    /// a restore failure here propagates.
    pub fn initialize(&mut self) -> Result<()> {
        self.resources.ensure_open()?;
        self.resources.reopen_session()?;
        self.initialized = false;
        self.resources.session()?.restore(&self.resolve_path())?;
        self.initialized = true;
        Ok(())
    }

    /// Sets the checkpoint directory; the model likely needs
    /// re-initializing afterwards.
    pub fn set_checkpoint_directory(&mut self, directory: impl Into<PathBuf>) {
        self.checkpoint_directory = directory.into();
    }

    pub fn checkpoint_directory(&self) -> &Path {
        &self.checkpoint_directory
    }

    /// Sets the checkpoint name; the model likely needs re-initializing
    /// afterwards.
    pub fn set_checkpoint_name(&mut self, name: impl Into<String>) {
        self.checkpoint_name = name.into();
    }

    pub fn checkpoint_name(&self) -> &str {
        &self.checkpoint_name
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

    /// Extracts a snapshot from the live session and returns a
    /// self-contained [`NativeModel`]. This model is left open and
    /// unchanged.
    pub fn convert_to_native(&self) -> Result<NativeModel> {
        let graph = self.resources.graph()?;
        let mut def = graph.to_graph_def();
        // The native restore path needs the annotation ops. Checkpoint-format
        // graphs never got them, so annotate a scratch re-import of the def;
        // the live session only supplies the variable values and this model
        // stays untouched.
        if !has_annotations(graph) {
            let scratch = crate::graph::Graph::new();
            scratch.import_graph_def(&def)?;
            crate::marshal::annotate_graph(&scratch, self.resources.session()?)?;
            def = scratch.to_graph_def();
        }
        let tensors = extract_variables(graph, self.resources.session()?)?;
        NativeModel::new(
            self.resources.name.clone(),
            self.resources.metadata.clone(),
            &def,
            &tensors,
            self.resources.batch_size(),
            self.resources.output_name.clone(),
            self.resources.feature_converter.clone(),
            self.resources.output_converter.clone(),
        )
    }

    /// Produces an independent open model bound to the same checkpoint.
    pub fn copy(&self, new_name: impl Into<String>, new_metadata: ModelMetadata) -> Result<Self> {
        Self::new(
            new_name.into(),
            new_metadata,
            &self.resources.graph()?.to_graph_def(),
            self.checkpoint_directory.clone(),
            self.checkpoint_name.clone(),
            self.resources.batch_size(),
            self.resources.output_name.clone(),
            self.resources.feature_converter.clone(),
            self.resources.output_converter.clone(),
        )
    }

    /// Serializes into a persistence envelope; the parameters stay in the
    /// checkpoint directory, only the path travels. Fails on a closed model.
    pub fn serialize(&self) -> Result<ModelEnvelope> {
        let graph = self.resources.graph()?;
        Ok(ModelEnvelope {
            class_name: Self::CLASS_NAME.to_string(),
            version: Self::CURRENT_VERSION,
            payload: ModelPayload::Checkpoint(CheckpointPayload {
                name: self.resources.name.clone(),
                metadata: self.resources.metadata.clone(),
                graph_def: graph.to_graph_def(),
                checkpoint_directory: self.checkpoint_directory.clone(),
                checkpoint_name: self.checkpoint_name.clone(),
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

fn has_annotations(graph: &crate::graph::Graph) -> bool {
    graph
        .variable_names()
        .iter()
        .all(|v| graph.contains_op(&crate::marshal::assign_op_name(v)))
}
