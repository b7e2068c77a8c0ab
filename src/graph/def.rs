//! Serializable graph definitions
//!
//! A [`GraphDef`] is the portable form of a graph: the list of op
//! definitions in insertion order. Models and trainers exchange graphs
//! exclusively in this form; a live [`super::Graph`] is always rebuilt by
//! importing one.

use crate::graph::tensor::{DType, Tensor};
use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How a variable gets its value when the init op runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VarInit {
    /// All zeros.
    Zeros,
    /// Every element set to the given value.
    Fill(f32),
    /// Normally distributed values with mean zero.
    RandomNormal { stddev: f32, seed: u64 },
}

/// Update rule baked into a train-step op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptimizerSpec {
    /// Plain stochastic gradient descent.
    Sgd { learning_rate: f32 },
    /// SGD with a momentum accumulator per variable.
    Momentum { learning_rate: f32, momentum: f32 },
}

/// The closed set of operations the engine understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// Run-time input. Dimensions of -1 accept any extent.
    Placeholder { dtype: DType, shape: Vec<i64> },
    /// Mutable trainable state, materialized in the session.
    Variable {
        dtype: DType,
        shape: Vec<u64>,
        init: VarInit,
    },
    /// A constant baked into the graph.
    Const { value: Tensor },
    /// Writes input 1 into the variable named by input 0.
    Assign,
    /// Passes its input through unchanged.
    Identity,
    /// 2-D matrix product of inputs 0 and 1.
    MatMul,
    /// Elementwise add with trailing-axis broadcast (bias add).
    Add,
    /// Elementwise max(x, 0).
    Relu,
    /// Row-wise softmax over the last axis of a rank-2 input.
    Softmax,
    /// Mean squared error of inputs (target, predicted); scalar output.
    MseLoss,
    /// Softmax cross-entropy of inputs (one-hot target, logits); scalar output.
    SoftmaxCrossEntropy,
    /// Initializes every variable in the graph from its declared init.
    Init,
    /// Runs one optimizer step against the loss named by input 0.
    TrainStep { optimizer: OptimizerSpec },
}

impl OpKind {
    /// Short type name used in logs and errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            OpKind::Placeholder { .. } => "Placeholder",
            OpKind::Variable { .. } => "Variable",
            OpKind::Const { .. } => "Const",
            OpKind::Assign => "Assign",
            OpKind::Identity => "Identity",
            OpKind::MatMul => "MatMul",
            OpKind::Add => "Add",
            OpKind::Relu => "Relu",
            OpKind::Softmax => "Softmax",
            OpKind::MseLoss => "MseLoss",
            OpKind::SoftmaxCrossEntropy => "SoftmaxCrossEntropy",
            OpKind::Init => "Init",
            OpKind::TrainStep { .. } => "TrainStep",
        }
    }
}

/// One named operation and the names of the ops feeding it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpDef {
    pub name: String,
    pub kind: OpKind,
    pub inputs: Vec<String>,
}

impl OpDef {
    pub fn new(name: impl Into<String>, kind: OpKind, inputs: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs,
        }
    }
}

/// The portable serialized form of a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDef {
    pub ops: Vec<OpDef>,
}

impl GraphDef {
    /// Serializes the definition to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| crate::Error::Serialization(format!("graph def encoding failed: {e}")))
    }

    /// Parses a definition from bytes produced by [`GraphDef::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| crate::Error::Serialization(format!("graph def decoding failed: {e}")))
    }

    /// Hex-encoded SHA-256 of the serialized definition, recorded in model
    /// metadata so a persisted model can be traced back to its graph.
    pub fn sha256_hex(&self) -> Result<String> {
        let bytes = self.to_bytes()?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hasher.finalize();
        let mut out = String::with_capacity(digest.len() * 2);
        for b in digest {
            out.push_str(&format!("{b:02x}"));
        }
        Ok(out)
    }
}
