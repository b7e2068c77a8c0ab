//! Persisted model variants around one graph/session pair
//!
//! Three strategies for carrying trained parameters:
//!
//! - [`NativeModel`] embeds a [`crate::marshal::VariableSnapshot`] and is
//!   entirely self contained;
//! - [`CheckpointModel`] keeps its parameters in an on-disk checkpoint at a
//!   directory + name the model only composes, never parses;
//! - [`FrozenExternalModel`] wraps a read-only externally trained graph
//!   behind a feature id mapping.
//!
//! Every model owns exactly one graph and one session; `close()` releases
//! both together and a closed model fails all further operations.

mod checkpoint;
mod envelope;
mod frozen;
mod mapping;
mod native;

pub use checkpoint::CheckpointModel;
pub use envelope::{
    deserialize, AnyModel, CheckpointPayload, FrozenPayload, ModelEnvelope, ModelPayload,
    NativePayload,
};
pub use frozen::FrozenExternalModel;
pub use mapping::FeatureIdMapping;
pub use native::NativeModel;

use crate::convert::{FeatureConverter, OutputConverter, Prediction};
use crate::graph::{Graph, GraphDef, Session};
use crate::metadata::ModelMetadata;
use crate::{Error, Result};
use std::path::Path;

/// Default test-time batch size.
pub const DEFAULT_BATCH_SIZE: usize = 16;

/// The graph/session pair and converters shared by every model variant.
pub(crate) struct ModelResources {
    pub(crate) name: String,
    pub(crate) metadata: ModelMetadata,
    graph: Option<Graph>,
    session: Option<Session>,
    batch_size: usize,
    pub(crate) output_name: String,
    pub(crate) feature_converter: FeatureConverter,
    pub(crate) output_converter: OutputConverter,
    closed: bool,
}

impl ModelResources {
    /// Imports the graph def into a fresh graph and opens a session on it.
    pub(crate) fn open(
        name: String,
        metadata: ModelMetadata,
        graph_def: &GraphDef,
        batch_size: usize,
        output_name: String,
        feature_converter: FeatureConverter,
        output_converter: OutputConverter,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::Config(
                "batch size must be positive, found 0".to_string(),
            ));
        }
        let graph = Graph::new();
        graph.import_graph_def(graph_def)?;
        let session = Session::new(&graph);
        Ok(Self {
            name,
            metadata,
            graph: Some(graph),
            session: Some(session),
            batch_size,
            output_name,
            feature_converter,
            output_converter,
            closed: false,
        })
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::ModelClosed);
        }
        Ok(())
    }

    pub(crate) fn graph(&self) -> Result<&Graph> {
        self.ensure_open()?;
        self.graph.as_ref().ok_or(Error::ModelClosed)
    }

    pub(crate) fn session(&self) -> Result<&Session> {
        self.ensure_open()?;
        self.session.as_ref().ok_or(Error::ModelClosed)
    }

    /// Drops the current session and binds a fresh one to the same graph.
    pub(crate) fn reopen_session(&mut self) -> Result<()> {
        let graph = self.graph()?.clone();
        self.session = Some(Session::new(&graph));
        Ok(())
    }

    pub(crate) fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub(crate) fn set_batch_size(&mut self, batch_size: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(Error::Config(
                "batch size must be positive, found 0".to_string(),
            ));
        }
        self.batch_size = batch_size;
        Ok(())
    }

    /// Runs one batch of feature rows through the session.
    pub(crate) fn run_rows(&self, rows: &[&[f32]]) -> Result<Vec<Prediction>> {
        let session = self.session()?;
        let inputs = self.feature_converter.convert(rows)?;
        let outputs = inputs
            .feed_into(session.runner())
            .fetch(self.output_name.clone())
            .run()?;
        self.output_converter.convert_to_batch_predictions(&outputs[0])
    }

    /// Predicts a single example.
    pub(crate) fn predict(&self, features: &[f32]) -> Result<Prediction> {
        let mut predictions = self.run_rows(&[features])?;
        predictions.pop().ok_or_else(|| {
            Error::Serialization("prediction batch came back empty".to_string())
        })
    }

    /// Predicts a batch, chunking at the configured batch size; the final
    /// partial chunk is still sent.
    pub(crate) fn predict_batch(&self, examples: &[Vec<f32>]) -> Result<Vec<Prediction>> {
        let mut predictions = Vec::with_capacity(examples.len());
        for chunk in examples.chunks(self.batch_size) {
            let rows: Vec<&[f32]> = chunk.iter().map(|f| f.as_slice()).collect();
            predictions.extend(self.run_rows(&rows)?);
        }
        Ok(predictions)
    }

    /// Exports the current graph def alongside a checkpoint of the live
    /// variable state into a self-describing directory.
    pub(crate) fn export_saved_model(&self, dir: &Path) -> Result<()> {
        self.ensure_open()?;
        std::fs::create_dir_all(dir)?;
        let def = self.graph()?.to_graph_def();
        std::fs::write(dir.join("graph.json"), def.to_bytes()?)?;
        self.session()?.save(&dir.join("variables"))?;
        Ok(())
    }

    /// Releases the session, then the graph. Safe to call more than once;
    /// the second call is a no-op.
    pub(crate) fn close(&mut self) {
        self.session = None;
        self.graph = None;
        self.closed = true;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }
}
