//! Feature and output conversion between examples and tensors
//!
//! The narrow collaborator interfaces the models consume: a feature
//! converter turns a batch of dense feature vectors into the tensors fed to
//! the graph, an output converter turns targets into training tensors and
//! output tensors back into predictions. Both are closed, serializable
//! variant sets resolved by exhaustive match rather than by name lookup.

use crate::graph::{Runner, Tensor};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named collection of tensors fed into a session run together.
#[derive(Debug, Clone, Default)]
pub struct TensorMap {
    tensors: BTreeMap<String, Tensor>,
}

impl TensorMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Feeds every entry into the supplied runner.
    pub fn feed_into<'s>(self, mut runner: Runner<'s>) -> Runner<'s> {
        for (name, tensor) in self.tensors {
            runner = runner.feed(name, tensor);
        }
        runner
    }
}

/// The ground truth attached to a training example.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// Regression targets, one value per output dimension.
    Regression(Vec<f32>),
    /// A class index for classification.
    Label(usize),
}

impl Target {
    pub fn kind(&self) -> TargetKind {
        match self {
            Target::Regression(_) => TargetKind::Regression,
            Target::Label(_) => TargetKind::Label,
        }
    }
}

/// The output domain a model was trained against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetKind {
    Regression,
    Label,
}

impl TargetKind {
    pub fn name(self) -> &'static str {
        match self {
            TargetKind::Regression => "Regression",
            TargetKind::Label => "Label",
        }
    }
}

/// One dense training example.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub features: Vec<f32>,
    pub target: Target,
}

impl Example {
    pub fn new(features: Vec<f32>, target: Target) -> Self {
        Self { features, target }
    }
}

/// A model output converted back into the caller's domain.
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    /// Raw regression outputs.
    Regression(Vec<f32>),
    /// The argmax class with the full probability row.
    Label { index: usize, scores: Vec<f32> },
}

/// The loss an output converter pairs with its domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    MeanSquaredError,
    SoftmaxCrossEntropy,
}

/// Converts batches of dense feature vectors into input tensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FeatureConverter {
    /// One rank-2 float tensor fed at a single input placeholder.
    Dense { input_name: String },
}

impl FeatureConverter {
    /// A dense converter feeding the named placeholder.
    pub fn dense(input_name: impl Into<String>) -> Self {
        FeatureConverter::Dense {
            input_name: input_name.into(),
        }
    }

    /// The placeholder names this converter feeds.
    pub fn input_names(&self) -> Vec<String> {
        match self {
            FeatureConverter::Dense { input_name } => vec![input_name.clone()],
        }
    }

    /// Converts a batch of equally sized feature vectors into a tensor map.
    pub fn convert(&self, batch: &[&[f32]]) -> Result<TensorMap> {
        match self {
            FeatureConverter::Dense { input_name } => {
                let rows = batch.len();
                let cols = batch.first().map(|f| f.len()).unwrap_or(0);
                let mut values = Vec::with_capacity(rows * cols);
                for features in batch {
                    if features.len() != cols {
                        return Err(Error::ShapeMismatch {
                            expected: vec![cols as u64],
                            got: vec![features.len() as u64],
                        });
                    }
                    values.extend_from_slice(features);
                }
                let tensor = Tensor::from_f32(&[rows as u64, cols as u64], &values)?;
                let mut map = TensorMap::new();
                map.insert(input_name.clone(), tensor);
                Ok(map)
            }
        }
    }
}

/// Converts targets into training tensors and output tensors into
/// predictions; also fixes the loss paired with the output domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutputConverter {
    /// Raw rank-2 regression outputs.
    Regression { num_outputs: usize },
    /// Classification over a fixed label set; predictions pass through a
    /// softmax appended by the trainer.
    Label { num_classes: usize },
}

impl OutputConverter {
    pub fn regression(num_outputs: usize) -> Self {
        OutputConverter::Regression { num_outputs }
    }

    pub fn label(num_classes: usize) -> Self {
        OutputConverter::Label { num_classes }
    }

    /// Width of the output row this converter expects.
    pub fn num_outputs(&self) -> usize {
        match self {
            OutputConverter::Regression { num_outputs } => *num_outputs,
            OutputConverter::Label { num_classes } => *num_classes,
        }
    }

    /// The output domain this converter serves.
    pub fn target_kind(&self) -> TargetKind {
        match self {
            OutputConverter::Regression { .. } => TargetKind::Regression,
            OutputConverter::Label { .. } => TargetKind::Label,
        }
    }

    /// The loss the trainer attaches for this domain.
    pub fn loss(&self) -> LossKind {
        match self {
            OutputConverter::Regression { .. } => LossKind::MeanSquaredError,
            OutputConverter::Label { .. } => LossKind::SoftmaxCrossEntropy,
        }
    }

    /// Whether the serving output should pass through a softmax.
    pub fn applies_softmax(&self) -> bool {
        matches!(self, OutputConverter::Label { .. })
    }

    /// Converts a batch of targets into the rank-2 training target tensor.
    pub fn convert_targets(&self, batch: &[Target]) -> Result<Tensor> {
        let width = self.num_outputs();
        let mut values = vec![0.0f32; batch.len() * width];
        for (row, target) in batch.iter().enumerate() {
            match (self, target) {
                (OutputConverter::Regression { num_outputs }, Target::Regression(v)) => {
                    if v.len() != *num_outputs {
                        return Err(Error::ShapeMismatch {
                            expected: vec![*num_outputs as u64],
                            got: vec![v.len() as u64],
                        });
                    }
                    values[row * width..(row + 1) * width].copy_from_slice(v);
                }
                (OutputConverter::Label { num_classes }, Target::Label(index)) => {
                    if *index >= *num_classes {
                        return Err(Error::Config(format!(
                            "label index {index} out of range for {num_classes} classes"
                        )));
                    }
                    values[row * width + index] = 1.0;
                }
                (converter, target) => {
                    return Err(Error::ConverterMismatch {
                        output: target.kind().name().to_string(),
                        converter: converter.target_kind().name().to_string(),
                    })
                }
            }
        }
        Tensor::from_f32(&[batch.len() as u64, width as u64], &values)
    }

    /// Converts a single-row output tensor into a prediction.
    pub fn convert_to_prediction(&self, output: &Tensor) -> Result<Prediction> {
        let mut batch = self.convert_to_batch_predictions(output)?;
        batch.pop().ok_or_else(|| Error::ShapeMismatch {
            expected: vec![1, self.num_outputs() as u64],
            got: output.shape().to_vec(),
        })
    }

    /// Converts a rank-2 output tensor into one prediction per row.
    pub fn convert_to_batch_predictions(&self, output: &Tensor) -> Result<Vec<Prediction>> {
        let array = output.to_array2()?;
        if array.ncols() != self.num_outputs() {
            return Err(Error::ShapeMismatch {
                expected: vec![array.nrows() as u64, self.num_outputs() as u64],
                got: output.shape().to_vec(),
            });
        }
        let mut predictions = Vec::with_capacity(array.nrows());
        for row in array.rows() {
            match self {
                OutputConverter::Regression { .. } => {
                    predictions.push(Prediction::Regression(row.to_vec()));
                }
                OutputConverter::Label { .. } => {
                    let scores = row.to_vec();
                    let index = scores
                        .iter()
                        .enumerate()
                        .max_by(|a, b| a.1.total_cmp(b.1))
                        .map(|(i, _)| i)
                        .unwrap_or(0);
                    predictions.push(Prediction::Label { index, scores });
                }
            }
        }
        Ok(predictions)
    }
}
