//! # Acoplar: Graph-Model Interop Toolkit
//!
//! Acoplar wraps graph-based neural networks: it trains them with minibatch
//! SGD against an embedded dataflow engine, marshals their parameters into
//! portable byte tuples, and persists/reloads them under three strategies
//! (self-contained, checkpoint-backed and frozen-external).
//!
//! ## Architecture
//!
//! - **graph**: The embedded execution engine (graph, session, tensors)
//! - **marshal**: Parameter extraction, restoration and the tensor codec
//! - **convert**: Feature/output converters between examples and tensors
//! - **model**: The three persisted-model variants and their envelope
//! - **train**: The training loop that emits persisted models
//!
//! ## Example
//!
//! ```no_run
//! use acoplar::convert::{Example, FeatureConverter, OutputConverter, Target};
//! use acoplar::graph::builder::{dense_graph, INPUT_NAME, OUTPUT_NAME};
//! use acoplar::train::{GraphTrainer, TrainerOptions};
//!
//! let def = dense_graph(2, &[8], 1, 42);
//! let options = TrainerOptions::new(
//!     OUTPUT_NAME,
//!     FeatureConverter::dense(INPUT_NAME),
//!     OutputConverter::regression(1),
//! );
//! let trainer = GraphTrainer::new(def, options).unwrap();
//! let examples = vec![Example::new(vec![0.5, 1.0], Target::Regression(vec![2.0]))];
//!
//! let mut model = trainer.train(&examples).unwrap();
//! let envelope = model.serialize().unwrap();
//! model.close();
//!
//! let reloaded = acoplar::model::deserialize(envelope).unwrap();
//! let prediction = reloaded.predict(&[0.5, 1.0]).unwrap();
//! ```

pub mod convert;
pub mod graph;
pub mod marshal;
pub mod metadata;
pub mod model;
pub mod train;

pub mod error;

// Re-export commonly used types
pub use error::{Error, Result};
pub use graph::{DType, Graph, GraphDef, Session, Tensor};
pub use marshal::{
    annotate_graph, extract_variables, restore_variables, TensorTuple, VariableSnapshot,
};
pub use metadata::ModelMetadata;
pub use model::{
    AnyModel, CheckpointModel, FeatureIdMapping, FrozenExternalModel, ModelEnvelope, NativeModel,
};
pub use train::{GradientOptimizer, GraphTrainer, OutputFormat, TrainerOptions};
