//! Session: the runtime execution context bound to a graph
//!
//! A session owns the materialized variable state for one graph. All calls
//! are synchronous and blocking; a [`Runner`] batches feeds, fetches and
//! targets into a single run so every fetched value reflects one consistent
//! instant. Writes performed by a run (assign, init, train step) are staged
//! during evaluation and committed only after the whole run has succeeded.

use crate::graph::def::{OpDef, OpKind, OptimizerSpec, VarInit};
use crate::graph::tensor::{element_count, DType, Tensor};
use crate::graph::{autodiff, Graph};
use crate::{Error, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::path::Path;

#[derive(Default)]
struct SessionState {
    vars: HashMap<String, Tensor>,
    slots: HashMap<String, Tensor>,
}

/// Runtime execution context for a [`Graph`].
///
/// Concurrent runs that only read (prediction) proceed in parallel; runs
/// that write variable state serialize on commit. Callers racing mutations
/// against reads get last-write-wins, not an error.
pub struct Session {
    graph: Graph,
    state: std::sync::RwLock<SessionState>,
}

impl Session {
    /// Opens a session over the supplied graph handle.
    pub fn new(graph: &Graph) -> Self {
        Self {
            graph: graph.clone(),
            state: std::sync::RwLock::new(SessionState::default()),
        }
    }

    /// Starts building a batched run.
    pub fn runner(&self) -> Runner<'_> {
        Runner {
            session: self,
            feeds: Vec::new(),
            fetches: Vec::new(),
            targets: Vec::new(),
        }
    }

    /// Current value of a variable, if initialized.
    pub fn variable_value(&self, name: &str) -> Result<Tensor> {
        self.read_state()
            .vars
            .get(name)
            .cloned()
            .ok_or_else(|| Error::VariableUninitialized {
                name: name.to_string(),
            })
    }

    /// Writes all variable values to `<prefix>.safetensors`, creating the
    /// parent directory if needed. The prefix is an opaque directory + base
    /// name composed by the caller.
    pub fn save(&self, prefix: &Path) -> Result<()> {
        let file = checkpoint_file(prefix);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let state = self.read_state();
        let entries: Vec<(String, &Tensor)> = {
            let mut names: Vec<&String> = state.vars.keys().collect();
            names.sort();
            names
                .into_iter()
                .map(|n| (n.clone(), &state.vars[n]))
                .collect()
        };
        let views: Vec<(String, TensorView<'_>)> = entries
            .iter()
            .map(|(name, tensor)| {
                let shape: Vec<usize> = tensor.shape().iter().map(|d| *d as usize).collect();
                let view = TensorView::new(to_safetensor_dtype(tensor.dtype()), shape, tensor.data())
                    .map_err(|e| {
                        Error::Serialization(format!("checkpoint view for '{name}' failed: {e}"))
                    })?;
                Ok((name.clone(), view))
            })
            .collect::<Result<_>>()?;
        let bytes = safetensors::serialize(views, &None)
            .map_err(|e| Error::Serialization(format!("checkpoint encoding failed: {e}")))?;
        std::fs::write(&file, bytes)?;
        log::debug!("saved {} variables to {}", entries.len(), file.display());
        Ok(())
    }

    /// Replaces the variable state with the contents of
    /// `<prefix>.safetensors`.
    pub fn restore(&self, prefix: &Path) -> Result<()> {
        let file = checkpoint_file(prefix);
        let bytes = std::fs::read(&file)?;
        let loaded = SafeTensors::deserialize(&bytes).map_err(|e| {
            Error::Serialization(format!(
                "checkpoint decoding failed for {}: {e}",
                file.display()
            ))
        })?;
        let mut vars = HashMap::new();
        for name in loaded.names() {
            let view = loaded.tensor(name).map_err(|e| {
                Error::Serialization(format!("checkpoint tensor '{name}' unreadable: {e}"))
            })?;
            let dtype = from_safetensor_dtype(view.dtype()).ok_or_else(|| {
                Error::Serialization(format!(
                    "checkpoint tensor '{name}' has unsupported dtype {:?}",
                    view.dtype()
                ))
            })?;
            let shape: Vec<u64> = view.shape().iter().map(|d| *d as u64).collect();
            vars.insert(name.to_string(), Tensor::new(dtype, shape, view.data().to_vec())?);
        }
        let mut state = self.write_state();
        state.vars = vars;
        log::debug!("restored {} variables from {}", state.vars.len(), file.display());
        Ok(())
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, SessionState> {
        self.state.read().expect("session lock poisoned")
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, SessionState> {
        self.state.write().expect("session lock poisoned")
    }
}

fn checkpoint_file(prefix: &Path) -> std::path::PathBuf {
    let mut s = prefix.as_os_str().to_os_string();
    s.push(".safetensors");
    std::path::PathBuf::from(s)
}

fn to_safetensor_dtype(dtype: DType) -> Dtype {
    match dtype {
        DType::Float => Dtype::F32,
        DType::Double => Dtype::F64,
        DType::Int32 => Dtype::I32,
        DType::Int64 => Dtype::I64,
        DType::UInt8 => Dtype::U8,
        DType::Bool => Dtype::BOOL,
    }
}

fn from_safetensor_dtype(dtype: Dtype) -> Option<DType> {
    match dtype {
        Dtype::F32 => Some(DType::Float),
        Dtype::F64 => Some(DType::Double),
        Dtype::I32 => Some(DType::Int32),
        Dtype::I64 => Some(DType::Int64),
        Dtype::U8 => Some(DType::UInt8),
        Dtype::BOOL => Some(DType::Bool),
        _ => None,
    }
}

/// Builder for one batched session run.
pub struct Runner<'s> {
    session: &'s Session,
    feeds: Vec<(String, Tensor)>,
    fetches: Vec<String>,
    targets: Vec<String>,
}

impl<'s> Runner<'s> {
    /// Supplies a value for a placeholder.
    pub fn feed(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.feeds.push((name.into(), tensor));
        self
    }

    /// Requests the value of an op.
    pub fn fetch(mut self, name: impl Into<String>) -> Self {
        self.fetches.push(name.into());
        self
    }

    /// Requests execution of an op for its side effects.
    pub fn add_target(mut self, name: impl Into<String>) -> Self {
        self.targets.push(name.into());
        self
    }

    /// Executes the run, returning one tensor per fetch in order.
    ///
    /// Staged variable writes are committed only if every fetch and target
    /// evaluated successfully, so a failed run leaves the session untouched.
    pub fn run(self) -> Result<Vec<Tensor>> {
        let session = self.session;
        let ops: HashMap<String, OpDef> = session
            .graph
            .operations()
            .into_iter()
            .map(|op| (op.name.clone(), op))
            .collect();

        for name in self.fetches.iter().chain(self.targets.iter()) {
            if !ops.contains_key(name) {
                return Err(Error::OpNotFound { name: name.clone() });
            }
        }
        let mut feeds = HashMap::new();
        for (name, tensor) in self.feeds {
            match ops.get(&name) {
                None => return Err(Error::OpNotFound { name }),
                Some(op) if !matches!(op.kind, OpKind::Placeholder { .. }) => {
                    return Err(Error::Config(format!(
                        "can only feed placeholder ops, '{}' is {}",
                        name,
                        op.kind.type_name()
                    )));
                }
                Some(_) => {
                    feeds.insert(name, tensor);
                }
            }
        }

        let (outputs, staged_vars, staged_slots) = {
            let state = session.read_state();
            let mut evaluator = Evaluator {
                ops: &ops,
                vars: &state.vars,
                slots: &state.slots,
                feeds,
                memo: HashMap::new(),
                staged_vars: Vec::new(),
                staged_slots: Vec::new(),
            };
            let mut outputs = Vec::with_capacity(self.fetches.len());
            for name in &self.fetches {
                outputs.push(evaluator.value(name)?);
            }
            for name in &self.targets {
                evaluator.value(name)?;
            }
            (outputs, evaluator.staged_vars, evaluator.staged_slots)
        };

        if !staged_vars.is_empty() || !staged_slots.is_empty() {
            let mut state = session.write_state();
            for (name, tensor) in staged_vars {
                state.vars.insert(name, tensor);
            }
            for (name, tensor) in staged_slots {
                state.slots.insert(name, tensor);
            }
        }
        Ok(outputs)
    }
}

/// Single-run interpreter over the op DAG.
pub(crate) struct Evaluator<'a> {
    ops: &'a HashMap<String, OpDef>,
    vars: &'a HashMap<String, Tensor>,
    slots: &'a HashMap<String, Tensor>,
    feeds: HashMap<String, Tensor>,
    memo: HashMap<String, Tensor>,
    staged_vars: Vec<(String, Tensor)>,
    staged_slots: Vec<(String, Tensor)>,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn op(&self, name: &str) -> Result<&OpDef> {
        self.ops.get(name).ok_or_else(|| Error::OpNotFound {
            name: name.to_string(),
        })
    }

    fn var_value(&self, name: &str) -> Result<Tensor> {
        // A write staged earlier in this run wins over committed state.
        if let Some((_, t)) = self.staged_vars.iter().rev().find(|(n, _)| n == name) {
            return Ok(t.clone());
        }
        self.vars
            .get(name)
            .cloned()
            .ok_or_else(|| Error::VariableUninitialized {
                name: name.to_string(),
            })
    }

    fn slot_value(&self, name: &str) -> Option<Tensor> {
        if let Some((_, t)) = self.staged_slots.iter().rev().find(|(n, _)| n == name) {
            return Some(t.clone());
        }
        self.slots.get(name).cloned()
    }

    /// Evaluates an op, memoizing results for the duration of the run.
    pub(crate) fn value(&mut self, name: &str) -> Result<Tensor> {
        if let Some(t) = self.memo.get(name) {
            return Ok(t.clone());
        }
        let op = self.op(name)?.clone();
        let result = self.eval(&op)?;
        self.memo.insert(name.to_string(), result.clone());
        Ok(result)
    }

    /// Evaluates an op as a float array, for math and gradients.
    pub(crate) fn array(&mut self, name: &str) -> Result<ndarray::ArrayD<f32>> {
        self.value(name)?.to_array()
    }

    fn eval(&mut self, op: &OpDef) -> Result<Tensor> {
        match &op.kind {
            OpKind::Placeholder { dtype, shape } => {
                let fed = self
                    .feeds
                    .get(&op.name)
                    .cloned()
                    .ok_or_else(|| Error::MissingFeed {
                        name: op.name.clone(),
                    })?;
                if fed.dtype() != *dtype {
                    return Err(Error::DTypeMismatch {
                        op: op.name.clone(),
                        expected: dtype.name(),
                        got: fed.dtype().name(),
                    });
                }
                let fed_shape: Vec<i64> = fed.shape().iter().map(|d| *d as i64).collect();
                if !crate::graph::shapes_compatible(shape, &fed_shape) {
                    return Err(Error::ShapeMismatch {
                        expected: shape.iter().map(|d| (*d).max(0) as u64).collect(),
                        got: fed.shape().to_vec(),
                    });
                }
                Ok(fed)
            }
            OpKind::Variable { .. } => self.var_value(&op.name),
            OpKind::Const { value } => Ok(value.clone()),
            OpKind::Identity => self.value(&op.inputs[0]),
            OpKind::Assign => {
                let target = self.op(&op.inputs[0])?.clone();
                let (dtype, shape) = match &target.kind {
                    OpKind::Variable { dtype, shape, .. } => (*dtype, shape.clone()),
                    other => {
                        return Err(Error::Config(format!(
                            "assign target '{}' is {}, expected Variable",
                            target.name,
                            other.type_name()
                        )))
                    }
                };
                let value = self.value(&op.inputs[1])?;
                if value.dtype() != dtype {
                    return Err(Error::DTypeMismatch {
                        op: op.name.clone(),
                        expected: dtype.name(),
                        got: value.dtype().name(),
                    });
                }
                if value.shape() != shape.as_slice() {
                    return Err(Error::ShapeMismatch {
                        expected: shape,
                        got: value.shape().to_vec(),
                    });
                }
                self.staged_vars.push((target.name.clone(), value.clone()));
                Ok(value)
            }
            OpKind::MatMul => {
                let a = self.array2(&op.inputs[0], &op.name)?;
                let b = self.array2(&op.inputs[1], &op.name)?;
                if a.ncols() != b.nrows() {
                    return Err(Error::ShapeMismatch {
                        expected: vec![a.ncols() as u64, b.ncols() as u64],
                        got: vec![b.nrows() as u64, b.ncols() as u64],
                    });
                }
                Ok(Tensor::from_array2(&a.dot(&b)))
            }
            OpKind::Add => {
                let a = self.array(&op.inputs[0])?;
                let b = self.array(&op.inputs[1])?;
                let (big, small) = if a.ndim() >= b.ndim() { (&a, &b) } else { (&b, &a) };
                let offset = big.ndim() - small.ndim();
                for (i, d) in small.shape().iter().enumerate() {
                    if *d != big.shape()[offset + i] && *d != 1 {
                        return Err(Error::ShapeMismatch {
                            expected: big.shape().iter().map(|d| *d as u64).collect(),
                            got: small.shape().iter().map(|d| *d as u64).collect(),
                        });
                    }
                }
                Ok(Tensor::from_array(&(big + small)))
            }
            OpKind::Relu => {
                let x = self.array(&op.inputs[0])?;
                Ok(Tensor::from_array(&x.mapv(|v| v.max(0.0))))
            }
            OpKind::Softmax => {
                let x = self.array2(&op.inputs[0], &op.name)?;
                Ok(Tensor::from_array2(&softmax_rows(&x)))
            }
            OpKind::MseLoss => {
                let target = self.array(&op.inputs[0])?;
                let predicted = self.array(&op.inputs[1])?;
                if target.shape() != predicted.shape() {
                    return Err(Error::ShapeMismatch {
                        expected: target.shape().iter().map(|d| *d as u64).collect(),
                        got: predicted.shape().iter().map(|d| *d as u64).collect(),
                    });
                }
                let diff = &predicted - &target;
                let loss = diff.mapv(|v| v * v).sum() / diff.len() as f32;
                Ok(Tensor::scalar_f32(loss))
            }
            OpKind::SoftmaxCrossEntropy => {
                let target = self.array2(&op.inputs[0], &op.name)?;
                let logits = self.array2(&op.inputs[1], &op.name)?;
                if target.shape() != logits.shape() {
                    return Err(Error::ShapeMismatch {
                        expected: target.shape().iter().map(|d| *d as u64).collect(),
                        got: logits.shape().iter().map(|d| *d as u64).collect(),
                    });
                }
                let probs = softmax_rows(&logits);
                let batch = logits.nrows() as f32;
                let loss = -(&target * &probs.mapv(|p| (p.max(1e-12)).ln())).sum() / batch;
                Ok(Tensor::scalar_f32(loss))
            }
            OpKind::Init => {
                let mut names: Vec<String> = Vec::new();
                for def in self.ops.values() {
                    if matches!(def.kind, OpKind::Variable { .. }) {
                        names.push(def.name.clone());
                    }
                }
                names.sort();
                for name in names {
                    let def = self.op(&name)?.clone();
                    if let OpKind::Variable { dtype, shape, init } = &def.kind {
                        let value = initial_value(&def.name, *dtype, shape, init)?;
                        self.staged_vars.push((def.name.clone(), value));
                    }
                }
                Ok(Tensor::scalar_f32(0.0))
            }
            OpKind::TrainStep { optimizer } => {
                let loss_name = op.inputs[0].clone();
                let loss = self.value(&loss_name)?;
                let grads = autodiff::gradients(self, &loss_name)?;
                for (var, grad) in grads {
                    let current = self.var_value(&var)?.to_array()?;
                    let updated = match optimizer {
                        OptimizerSpec::Sgd { learning_rate } => {
                            current - grad.mapv(|g| g * learning_rate)
                        }
                        OptimizerSpec::Momentum {
                            learning_rate,
                            momentum,
                        } => {
                            let slot_name = format!("{var}/momentum");
                            let velocity = match self.slot_value(&slot_name) {
                                Some(t) => t.to_array()?.mapv(|v| v * momentum) + &grad,
                                None => grad.clone(),
                            };
                            let next = current - velocity.mapv(|v| v * learning_rate);
                            self.staged_slots
                                .push((slot_name, Tensor::from_array(&velocity)));
                            next
                        }
                    };
                    self.staged_vars.push((var, Tensor::from_array(&updated)));
                }
                Ok(loss)
            }
        }
    }

    fn array2(&mut self, name: &str, op: &str) -> Result<ndarray::Array2<f32>> {
        let value = self.array(name)?;
        value.into_dimensionality::<ndarray::Ix2>().map_err(|_| {
            Error::Config(format!("'{op}' requires a rank 2 input, '{name}' is not"))
        })
    }
}

fn initial_value(name: &str, dtype: DType, shape: &[u64], init: &VarInit) -> Result<Tensor> {
    match init {
        VarInit::Zeros => Ok(Tensor::zeros(dtype, shape.to_vec())),
        VarInit::Fill(value) => {
            if dtype != DType::Float {
                return Err(Error::UnsupportedDType {
                    op: name.to_string(),
                    dtype: dtype.name(),
                });
            }
            let n = element_count(shape) as usize;
            Tensor::from_f32(shape, &vec![*value; n])
        }
        VarInit::RandomNormal { stddev, seed } => {
            if dtype != DType::Float {
                return Err(Error::UnsupportedDType {
                    op: name.to_string(),
                    dtype: dtype.name(),
                });
            }
            let normal = Normal::new(0.0f32, *stddev)
                .map_err(|e| Error::Config(format!("invalid stddev for '{name}': {e}")))?;
            let mut rng = StdRng::seed_from_u64(*seed);
            let n = element_count(shape) as usize;
            let values: Vec<f32> = (0..n).map(|_| normal.sample(&mut rng)).collect();
            Tensor::from_f32(shape, &values)
        }
    }
}

pub(crate) fn softmax_rows(x: &ndarray::Array2<f32>) -> ndarray::Array2<f32> {
    let mut out = x.clone();
    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, v| m.max(*v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::def::{GraphDef, OpDef};
    use approx::assert_relative_eq;
    use tempfile::tempdir;

    fn simple_graph() -> Graph {
        let graph = Graph::new();
        graph
            .import_graph_def(&GraphDef {
                ops: vec![
                    OpDef::new(
                        "input",
                        OpKind::Placeholder {
                            dtype: DType::Float,
                            shape: vec![-1, 2],
                        },
                        vec![],
                    ),
                    OpDef::new(
                        "w",
                        OpKind::Variable {
                            dtype: DType::Float,
                            shape: vec![2, 2],
                            init: VarInit::Fill(1.0),
                        },
                        vec![],
                    ),
                    OpDef::new("output", OpKind::MatMul, vec!["input".into(), "w".into()]),
                    OpDef::new("init", OpKind::Init, vec![]),
                ],
            })
            .unwrap();
        graph
    }

    #[test]
    fn test_uninitialized_variable_fails() {
        let graph = simple_graph();
        let session = Session::new(&graph);
        let err = session.runner().fetch("w").run();
        assert!(matches!(err, Err(Error::VariableUninitialized { .. })));
    }

    #[test]
    fn test_init_then_matmul() {
        let graph = simple_graph();
        let session = Session::new(&graph);
        session.runner().add_target("init").run().unwrap();

        let input = Tensor::from_f32(&[1, 2], &[3.0, 4.0]).unwrap();
        let out = session
            .runner()
            .feed("input", input)
            .fetch("output")
            .run()
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to_f32_vec().unwrap(), vec![7.0, 7.0]);
    }

    #[test]
    fn test_missing_feed() {
        let graph = simple_graph();
        let session = Session::new(&graph);
        session.runner().add_target("init").run().unwrap();
        let err = session.runner().fetch("output").run();
        assert!(matches!(err, Err(Error::MissingFeed { .. })));
    }

    #[test]
    fn test_fetch_unknown_op() {
        let graph = simple_graph();
        let session = Session::new(&graph);
        let err = session.runner().fetch("nope").run();
        assert!(matches!(err, Err(Error::OpNotFound { .. })));
    }

    #[test]
    fn test_feed_non_placeholder_rejected() {
        let graph = simple_graph();
        let session = Session::new(&graph);
        let err = session
            .runner()
            .feed("w", Tensor::zeros(DType::Float, vec![2, 2]))
            .fetch("w")
            .run();
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[test]
    fn test_failed_run_commits_nothing() {
        let graph = simple_graph();
        graph
            .add_op(OpDef::new(
                "value",
                OpKind::Placeholder {
                    dtype: DType::Float,
                    shape: vec![2, 2],
                },
                vec![],
            ))
            .unwrap();
        graph
            .add_op(OpDef::new(
                "assign",
                OpKind::Assign,
                vec!["w".into(), "value".into()],
            ))
            .unwrap();
        let session = Session::new(&graph);

        // Assign plus a failing fetch in the same run: nothing sticks.
        let err = session
            .runner()
            .feed("value", Tensor::from_f32(&[2, 2], &[9.0; 4]).unwrap())
            .add_target("assign")
            .fetch("missing-op")
            .run();
        assert!(err.is_err());
        assert!(session.variable_value("w").is_err());
    }

    #[test]
    fn test_feed_shape_validation() {
        let graph = simple_graph();
        let session = Session::new(&graph);
        session.runner().add_target("init").run().unwrap();
        let bad = Tensor::from_f32(&[1, 3], &[1.0, 2.0, 3.0]).unwrap();
        let err = session
            .runner()
            .feed("input", bad)
            .fetch("output")
            .run();
        assert!(matches!(err, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_save_restore_round_trip() {
        let graph = simple_graph();
        let session = Session::new(&graph);
        session.runner().add_target("init").run().unwrap();

        let dir = tempdir().unwrap();
        let prefix = dir.path().join("ckpt").join("model");
        session.save(&prefix).unwrap();

        let fresh = Session::new(&graph);
        fresh.restore(&prefix).unwrap();
        assert_eq!(
            fresh.variable_value("w").unwrap(),
            session.variable_value("w").unwrap()
        );
    }

    #[test]
    fn test_restore_missing_checkpoint() {
        let graph = simple_graph();
        let session = Session::new(&graph);
        let dir = tempdir().unwrap();
        assert!(session.restore(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn test_softmax_rows() {
        let x = ndarray::array![[0.0f32, 0.0], [1.0, 3.0]];
        let p = softmax_rows(&x);
        assert_relative_eq!(p[[0, 0]], 0.5, epsilon = 1e-6);
        assert_relative_eq!(p.row(1).sum(), 1.0, epsilon = 1e-6);
        assert!(p[[1, 1]] > p[[1, 0]]);
    }

    #[test]
    fn test_random_normal_deterministic() {
        let a = initial_value(
            "v",
            DType::Float,
            &[4],
            &VarInit::RandomNormal {
                stddev: 0.1,
                seed: 42,
            },
        )
        .unwrap();
        let b = initial_value(
            "v",
            DType::Float,
            &[4],
            &VarInit::RandomNormal {
                stddev: 0.1,
                seed: 42,
            },
        )
        .unwrap();
        assert_eq!(a, b);
    }
}
