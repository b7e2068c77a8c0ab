//! Training loop over a user-supplied graph
//!
//! A [`GraphTrainer`] wraps a graph definition that already contains the
//! forward pass: the configured input placeholder(s), a rank-2 output op
//! and an init op, all validated at construction. Each [`GraphTrainer::train`]
//! call imports the definition into a brand-new graph/session pair, attaches
//! a target placeholder plus the loss and optimizer ops, runs minibatch SGD
//! and hands the trained state to the configured persistence strategy.
//!
//! # Example
//!
//! ```no_run
//! use acoplar::convert::{Example, FeatureConverter, OutputConverter, Target};
//! use acoplar::graph::builder::{dense_graph, INPUT_NAME, OUTPUT_NAME};
//! use acoplar::train::{GraphTrainer, TrainerOptions};
//!
//! let def = dense_graph(2, &[], 1, 42);
//! let options = TrainerOptions::new(
//!     OUTPUT_NAME,
//!     FeatureConverter::dense(INPUT_NAME),
//!     OutputConverter::regression(1),
//! )
//! .with_epochs(10)
//! .with_minibatch_size(4);
//! let trainer = GraphTrainer::new(def, options).unwrap();
//!
//! let examples = vec![Example::new(vec![1.0, 2.0], Target::Regression(vec![3.0]))];
//! let model = trainer.train(&examples).unwrap();
//! ```

use crate::convert::{Example, FeatureConverter, LossKind, OutputConverter, Target};
use crate::graph::{
    shapes_compatible, Graph, GraphDef, OpDef, OpKind, OptimizerSpec, Session,
};
use crate::marshal::{annotate_graph, extract_variables};
use crate::metadata::ModelMetadata;
use crate::model::{AnyModel, CheckpointModel, NativeModel};
use crate::{DType, Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Name of the target placeholder the trainer attaches.
const TARGET_NAME: &str = "train/target";
/// Name of the loss op the trainer attaches.
const LOSS_NAME: &str = "train/loss";
/// Name of the optimizer step op the trainer attaches.
const STEP_NAME: &str = "train/step";
/// Name of the serving softmax appended for label outputs.
const SOFTMAX_NAME: &str = "train/softmax";

/// Which persisted-model variant a training run emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Keep the parameters inside the model, emitting a
    /// [`NativeModel`].
    Native,
    /// Keep the parameters in an engine checkpoint, emitting a
    /// [`CheckpointModel`].
    Checkpoint,
}

/// The gradient optimizers a trainer can attach, parameterized by a named
/// value map the way the engine expects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradientOptimizer {
    /// Plain SGD. Parameters: `learning_rate`.
    GradientDescent,
    /// SGD with momentum. Parameters: `learning_rate`, `momentum`.
    Momentum,
}

impl GradientOptimizer {
    /// The parameter names this optimizer requires.
    pub fn parameter_names(&self) -> &'static [&'static str] {
        match self {
            GradientOptimizer::GradientDescent => &["learning_rate"],
            GradientOptimizer::Momentum => &["learning_rate", "momentum"],
        }
    }

    fn build_spec(&self, params: &HashMap<String, f32>) -> Result<OptimizerSpec> {
        let get = |key: &str| {
            params.get(key).copied().ok_or_else(|| {
                Error::Config(format!("missing gradient parameter '{key}' for {self:?}"))
            })
        };
        match self {
            GradientOptimizer::GradientDescent => Ok(OptimizerSpec::Sgd {
                learning_rate: get("learning_rate")?,
            }),
            GradientOptimizer::Momentum => Ok(OptimizerSpec::Momentum {
                learning_rate: get("learning_rate")?,
                momentum: get("momentum")?,
            }),
        }
    }
}

/// Configuration for a [`GraphTrainer`].
#[derive(Debug, Clone)]
pub struct TrainerOptions {
    /// Name of the output op before the loss.
    pub output_name: String,
    /// Name of the init op.
    pub init_name: String,
    /// Gradient optimizer to attach.
    pub optimizer: GradientOptimizer,
    /// Optimizer parameters by name.
    pub gradient_params: HashMap<String, f32>,
    /// Feature converter; its input names must exist in the graph.
    pub feature_converter: FeatureConverter,
    /// Output converter; fixes the loss and the output domain.
    pub output_converter: OutputConverter,
    /// Minibatch size used in training.
    pub minibatch_size: usize,
    /// Number of SGD epochs to run.
    pub epochs: usize,
    /// Batch size the emitted model uses at test time.
    pub test_batch_size: usize,
    /// Log the loss every this many minibatches; `None` quiesces.
    pub logging_interval: Option<usize>,
    /// Persistence strategy for the emitted model.
    pub output_format: OutputFormat,
    /// Checkpoint output directory, required for checkpoint format.
    pub checkpoint_path: Option<PathBuf>,
}

impl TrainerOptions {
    /// Options with the default training schedule and a plain SGD
    /// optimizer; the emitted model keeps its parameters inline.
    pub fn new(
        output_name: impl Into<String>,
        feature_converter: FeatureConverter,
        output_converter: OutputConverter,
    ) -> Self {
        Self {
            output_name: output_name.into(),
            init_name: "init".to_string(),
            optimizer: GradientOptimizer::GradientDescent,
            gradient_params: HashMap::from([("learning_rate".to_string(), 0.01)]),
            feature_converter,
            output_converter,
            minibatch_size: 16,
            epochs: 5,
            test_batch_size: 16,
            logging_interval: Some(100),
            output_format: OutputFormat::Native,
            checkpoint_path: None,
        }
    }

    pub fn with_init_name(mut self, init_name: impl Into<String>) -> Self {
        self.init_name = init_name.into();
        self
    }

    pub fn with_optimizer(
        mut self,
        optimizer: GradientOptimizer,
        params: HashMap<String, f32>,
    ) -> Self {
        self.optimizer = optimizer;
        self.gradient_params = params;
        self
    }

    pub fn with_minibatch_size(mut self, minibatch_size: usize) -> Self {
        self.minibatch_size = minibatch_size;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_test_batch_size(mut self, test_batch_size: usize) -> Self {
        self.test_batch_size = test_batch_size;
        self
    }

    pub fn with_logging_interval(mut self, logging_interval: Option<usize>) -> Self {
        self.logging_interval = logging_interval;
        self
    }

    /// Emit a checkpoint-backed model, writing under the given directory.
    pub fn with_checkpoint_format(mut self, checkpoint_path: impl Into<PathBuf>) -> Self {
        self.output_format = OutputFormat::Checkpoint;
        self.checkpoint_path = Some(checkpoint_path.into());
        self
    }
}

/// Trainer for a graph definition with named input placeholder(s), a rank-2
/// output op and an init op.
///
/// The output op should sit before any softmax non-linearity; for label
/// outputs the trainer appends the serving softmax itself. Training-time op
/// names under `train/` are reserved; a graph already using them fails the
/// training run with a duplicate-op error.
pub struct GraphTrainer {
    graph_def: GraphDef,
    options: TrainerOptions,
    invocation_counter: AtomicU64,
}

impl GraphTrainer {
    /// Validates the graph definition against the options and builds the
    /// trainer. Violations are fatal here, not at train time.
    pub fn new(graph_def: GraphDef, options: TrainerOptions) -> Result<Self> {
        validate(&graph_def, &options)?;
        Ok(Self {
            graph_def,
            options,
            invocation_counter: AtomicU64::new(0),
        })
    }

    /// Loads a graph definition from disk and builds the trainer.
    pub fn from_path(path: impl AsRef<Path>, options: TrainerOptions) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::new(GraphDef::from_bytes(&bytes)?, options)
    }

    /// Number of completed or in-flight training invocations.
    pub fn invocation_count(&self) -> u64 {
        self.invocation_counter.load(Ordering::SeqCst)
    }

    /// Overrides the invocation counter, e.g. when resuming a training
    /// schedule. Non-negativity is enforced by the type.
    pub fn set_invocation_count(&self, count: u64) {
        self.invocation_counter.store(count, Ordering::SeqCst);
    }

    /// One-line description recorded in emitted model metadata.
    pub fn description(&self) -> String {
        format!(
            "GraphTrainer(output={},optimizer={:?},minibatch={},epochs={},format={:?})",
            self.options.output_name,
            self.options.optimizer,
            self.options.minibatch_size,
            self.options.epochs,
            self.options.output_format,
        )
    }

    /// Runs minibatch SGD over the examples and returns the persisted-model
    /// variant selected by the options.
    ///
    /// Every invocation imports the definition into a brand-new graph and
    /// session, so repeated training runs cannot collide on op names.
    pub fn train(&self, examples: &[Example]) -> Result<AnyModel> {
        if examples.is_empty() {
            return Err(Error::Config("no training examples supplied".to_string()));
        }
        let options = &self.options;
        let invocation = self.invocation_counter.fetch_add(1, Ordering::SeqCst);
        let checkpoint_name = format!("invocation-{invocation}");

        let graph = Graph::new();
        graph.import_graph_def(&self.graph_def)?;
        let session = Session::new(&graph);

        let num_outputs = options.output_converter.num_outputs();

        // Attach the target placeholder, loss, serving transform and
        // optimizer step.
        graph.add_op(OpDef::new(
            TARGET_NAME,
            OpKind::Placeholder {
                dtype: DType::Float,
                shape: vec![-1, num_outputs as i64],
            },
            vec![],
        ))?;
        let loss_kind = match options.output_converter.loss() {
            LossKind::MeanSquaredError => OpKind::MseLoss,
            LossKind::SoftmaxCrossEntropy => OpKind::SoftmaxCrossEntropy,
        };
        graph.add_op(OpDef::new(
            LOSS_NAME,
            loss_kind,
            vec![TARGET_NAME.to_string(), options.output_name.clone()],
        ))?;
        let serving_output = if options.output_converter.applies_softmax() {
            graph.add_op(OpDef::new(
                SOFTMAX_NAME,
                OpKind::Softmax,
                vec![options.output_name.clone()],
            ))?;
            SOFTMAX_NAME.to_string()
        } else {
            options.output_name.clone()
        };
        let spec = options.optimizer.build_spec(&options.gradient_params)?;
        graph.add_op(OpDef::new(
            STEP_NAME,
            OpKind::TrainStep { optimizer: spec },
            vec![LOSS_NAME.to_string()],
        ))?;

        // Initialises the parameters.
        session.runner().add_target(options.init_name.as_str()).run()?;
        log::info!("Initialised the model parameters");

        let mut interval = 0usize;
        for epoch in 0..options.epochs {
            log::info!("Starting epoch {epoch}");
            for chunk in examples.chunks(options.minibatch_size) {
                let rows: Vec<&[f32]> = chunk.iter().map(|e| e.features.as_slice()).collect();
                let targets: Vec<Target> = chunk.iter().map(|e| e.target.clone()).collect();
                let inputs = options.feature_converter.convert(&rows)?;
                let target = options.output_converter.convert_targets(&targets)?;

                let fetched = inputs
                    .feed_into(session.runner())
                    .feed(TARGET_NAME, target)
                    .add_target(STEP_NAME)
                    .fetch(LOSS_NAME)
                    .run()?;
                if let Some(log_every) = options.logging_interval {
                    if interval % log_every == 0 {
                        log::info!("Training loss = {}", fetched[0].scalar_value()?);
                    }
                }
                interval += 1;
            }
        }

        // Set up the persistence hooks. This must happen before the trained
        // graph def is captured.
        match options.output_format {
            OutputFormat::Native => annotate_graph(&graph, &session)?,
            OutputFormat::Checkpoint => {
                let base = options.checkpoint_path.as_ref().ok_or_else(|| {
                    Error::Config("checkpoint format requires a checkpoint path".to_string())
                })?;
                session.save(&base.join(&checkpoint_name))?;
            }
        }

        let trained_def = graph.to_graph_def();
        let metadata = ModelMetadata::new(trained_def.sha256_hex()?)
            .with_trainer(self.description())
            .with_custom("invocation", serde_json::json!(invocation));

        match options.output_format {
            OutputFormat::Native => {
                let tensors = extract_variables(&graph, &session)?;
                Ok(AnyModel::Native(NativeModel::new(
                    "graph-native-model",
                    metadata,
                    &trained_def,
                    &tensors,
                    options.test_batch_size,
                    serving_output,
                    options.feature_converter.clone(),
                    options.output_converter.clone(),
                )?))
            }
            OutputFormat::Checkpoint => {
                let base = options.checkpoint_path.as_ref().ok_or_else(|| {
                    Error::Config("checkpoint format requires a checkpoint path".to_string())
                })?;
                Ok(AnyModel::Checkpoint(CheckpointModel::new(
                    "graph-checkpoint-model",
                    metadata,
                    &trained_def,
                    base.clone(),
                    checkpoint_name,
                    options.test_batch_size,
                    serving_output,
                    options.feature_converter.clone(),
                    options.output_converter.clone(),
                )?))
            }
        }
    }
}

fn validate(graph_def: &GraphDef, options: &TrainerOptions) -> Result<()> {
    if options.minibatch_size == 0 {
        return Err(Error::Config(
            "minibatch size must be positive, found 0".to_string(),
        ));
    }
    if options.epochs == 0 {
        return Err(Error::Config("epochs must be positive, found 0".to_string()));
    }
    if options.test_batch_size == 0 {
        return Err(Error::Config(
            "test batch size must be positive, found 0".to_string(),
        ));
    }
    if options.output_format == OutputFormat::Checkpoint && options.checkpoint_path.is_none() {
        return Err(Error::Config(
            "must set a checkpoint path when using OutputFormat::Checkpoint".to_string(),
        ));
    }
    // The optimizer parameters are checked here so a misconfigured trainer
    // never reaches a training run.
    options.optimizer.build_spec(&options.gradient_params)?;

    let graph = Graph::new();
    graph.import_graph_def(graph_def)?;

    for input in options.feature_converter.input_names() {
        if !graph.contains_op(&input) {
            return Err(Error::MissingOperation { name: input });
        }
        let op = graph.op(&input)?;
        if !matches!(op.kind, OpKind::Placeholder { .. }) {
            return Err(Error::Config(format!(
                "input op '{input}' is {}, expected Placeholder",
                op.kind.type_name()
            )));
        }
    }
    if !graph.contains_op(&options.init_name) {
        return Err(Error::MissingOperation {
            name: options.init_name.clone(),
        });
    }
    if !graph.contains_op(&options.output_name) {
        return Err(Error::MissingOperation {
            name: options.output_name.clone(),
        });
    }
    let output_shape = graph.output_shape(&options.output_name)?;
    if output_shape.len() != 2 {
        return Err(Error::OutputRank {
            found: output_shape.len(),
        });
    }
    let expected = vec![
        options.minibatch_size as i64,
        options.output_converter.num_outputs() as i64,
    ];
    if !shapes_compatible(&output_shape, &expected) {
        return Err(Error::Config(format!(
            "incompatible output shape, expected {expected:?} found {output_shape:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::Prediction;
    use crate::graph::builder::{dense_graph, INPUT_NAME, OUTPUT_NAME};

    fn regression_options() -> TrainerOptions {
        TrainerOptions::new(
            OUTPUT_NAME,
            FeatureConverter::dense(INPUT_NAME),
            OutputConverter::regression(1),
        )
        .with_epochs(40)
        .with_minibatch_size(4)
        .with_logging_interval(None)
        .with_optimizer(
            GradientOptimizer::GradientDescent,
            HashMap::from([("learning_rate".to_string(), 0.05)]),
        )
    }

    fn linear_examples() -> Vec<Example> {
        // y = 2x
        (1..=8)
            .map(|i| {
                let x = i as f32 * 0.25;
                Example::new(vec![x], Target::Regression(vec![2.0 * x]))
            })
            .collect()
    }

    #[test]
    fn test_missing_output_op() {
        let def = dense_graph(1, &[], 1, 0);
        let options = TrainerOptions::new(
            "not-there",
            FeatureConverter::dense(INPUT_NAME),
            OutputConverter::regression(1),
        );
        let err = GraphTrainer::new(def, options);
        assert!(matches!(err, Err(Error::MissingOperation { name }) if name == "not-there"));
    }

    #[test]
    fn test_missing_init_op() {
        let def = dense_graph(1, &[], 1, 0);
        let options = TrainerOptions::new(
            OUTPUT_NAME,
            FeatureConverter::dense(INPUT_NAME),
            OutputConverter::regression(1),
        )
        .with_init_name("absent-init");
        let err = GraphTrainer::new(def, options);
        assert!(matches!(err, Err(Error::MissingOperation { name }) if name == "absent-init"));
    }

    #[test]
    fn test_missing_input_placeholder() {
        let def = dense_graph(1, &[], 1, 0);
        let options = TrainerOptions::new(
            OUTPUT_NAME,
            FeatureConverter::dense("wrong-input"),
            OutputConverter::regression(1),
        );
        assert!(matches!(
            GraphTrainer::new(def, options),
            Err(Error::MissingOperation { .. })
        ));
    }

    #[test]
    fn test_wrong_output_rank() {
        let def = dense_graph(1, &[], 1, 0);
        // A bias variable has rank 1.
        let options = TrainerOptions::new(
            "dense_0/bias",
            FeatureConverter::dense(INPUT_NAME),
            OutputConverter::regression(1),
        );
        assert!(matches!(
            GraphTrainer::new(def, options),
            Err(Error::OutputRank { found: 1 })
        ));
    }

    #[test]
    fn test_incompatible_output_width() {
        let def = dense_graph(1, &[], 1, 0);
        let options = TrainerOptions::new(
            OUTPUT_NAME,
            FeatureConverter::dense(INPUT_NAME),
            OutputConverter::regression(3),
        );
        assert!(matches!(
            GraphTrainer::new(def, options),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_missing_optimizer_parameter() {
        let def = dense_graph(1, &[], 1, 0);
        let options = regression_options()
            .with_optimizer(GradientOptimizer::Momentum, HashMap::new());
        assert!(matches!(
            GraphTrainer::new(def, options),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_checkpoint_format_requires_path() {
        let def = dense_graph(1, &[], 1, 0);
        let mut options = regression_options();
        options.output_format = OutputFormat::Checkpoint;
        assert!(matches!(
            GraphTrainer::new(def, options),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_invocation_counter() {
        let def = dense_graph(1, &[], 1, 0);
        let trainer = GraphTrainer::new(def, regression_options()).unwrap();
        assert_eq!(trainer.invocation_count(), 0);
        trainer.train(&linear_examples()).unwrap();
        assert_eq!(trainer.invocation_count(), 1);
        trainer.set_invocation_count(10);
        trainer.train(&linear_examples()).unwrap();
        assert_eq!(trainer.invocation_count(), 11);
    }

    #[test]
    fn test_train_empty_dataset_fails() {
        let def = dense_graph(1, &[], 1, 0);
        let trainer = GraphTrainer::new(def, regression_options()).unwrap();
        assert!(matches!(trainer.train(&[]), Err(Error::Config(_))));
    }

    #[test]
    fn test_train_regression_learns_slope() {
        let def = dense_graph(1, &[], 1, 0);
        let trainer = GraphTrainer::new(def, regression_options()).unwrap();
        let model = trainer.train(&linear_examples()).unwrap();

        match model.predict(&[2.0]).unwrap() {
            Prediction::Regression(v) => {
                assert!((v[0] - 4.0).abs() < 0.3, "expected ~4.0, got {}", v[0]);
            }
            other => panic!("expected regression prediction, got {other:?}"),
        }
    }

    #[test]
    fn test_train_label_model() {
        let def = dense_graph(2, &[], 2, 3);
        let options = TrainerOptions::new(
            OUTPUT_NAME,
            FeatureConverter::dense(INPUT_NAME),
            OutputConverter::label(2),
        )
        .with_epochs(60)
        .with_minibatch_size(4)
        .with_logging_interval(None)
        .with_optimizer(
            GradientOptimizer::GradientDescent,
            HashMap::from([("learning_rate".to_string(), 0.5)]),
        );
        let trainer = GraphTrainer::new(def, options).unwrap();

        // Linearly separable: class is whichever feature is larger.
        let examples = vec![
            Example::new(vec![1.0, 0.0], Target::Label(0)),
            Example::new(vec![0.9, 0.1], Target::Label(0)),
            Example::new(vec![0.8, 0.0], Target::Label(0)),
            Example::new(vec![0.0, 1.0], Target::Label(1)),
            Example::new(vec![0.1, 0.9], Target::Label(1)),
            Example::new(vec![0.0, 0.8], Target::Label(1)),
        ];
        let model = trainer.train(&examples).unwrap();

        match model.predict(&[1.0, 0.0]).unwrap() {
            Prediction::Label { index, scores } => {
                assert_eq!(index, 0);
                // Serving output passes through a softmax: a probability row.
                let total: f32 = scores.iter().sum();
                assert!((total - 1.0).abs() < 1e-5);
            }
            other => panic!("expected label prediction, got {other:?}"),
        }
    }

    #[test]
    fn test_train_checkpoint_format() {
        let dir = tempfile::tempdir().unwrap();
        let def = dense_graph(1, &[], 1, 0);
        let mut options = regression_options().with_checkpoint_format(dir.path());
        options.epochs = 20;
        let trainer = GraphTrainer::new(def, options).unwrap();

        let model = trainer.train(&linear_examples()).unwrap();
        let checkpoint = model.into_checkpoint().expect("expected checkpoint model");
        assert!(checkpoint.is_initialized());
        assert_eq!(checkpoint.checkpoint_name(), "invocation-0");
        assert!(checkpoint
            .checkpoint_directory()
            .join("invocation-0.safetensors")
            .exists());
        assert!(checkpoint.predict(&[1.0]).is_ok());
    }

    #[test]
    fn test_momentum_optimizer_trains() {
        let def = dense_graph(1, &[], 1, 0);
        let options = regression_options().with_optimizer(
            GradientOptimizer::Momentum,
            HashMap::from([
                ("learning_rate".to_string(), 0.02),
                ("momentum".to_string(), 0.9),
            ]),
        );
        let trainer = GraphTrainer::new(def, options).unwrap();
        let model = trainer.train(&linear_examples()).unwrap();
        match model.predict(&[1.0]).unwrap() {
            Prediction::Regression(v) => {
                assert!((v[0] - 2.0).abs() < 0.5, "expected ~2.0, got {}", v[0]);
            }
            other => panic!("unexpected prediction {other:?}"),
        }
    }
}
