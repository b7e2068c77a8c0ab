//! Graph handle and inner operation DAG

use crate::graph::def::{GraphDef, OpDef, OpKind};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// The operation DAG behind a [`Graph`] handle.
#[derive(Debug, Default)]
pub(crate) struct GraphInner {
    ops: Vec<OpDef>,
    index: HashMap<String, usize>,
}

impl GraphInner {
    fn add_op(&mut self, op: OpDef) -> Result<()> {
        if self.index.contains_key(&op.name) {
            return Err(Error::DuplicateOp {
                name: op.name.clone(),
            });
        }
        for input in &op.inputs {
            if !self.index.contains_key(input) {
                return Err(Error::OpNotFound {
                    name: input.clone(),
                });
            }
        }
        self.index.insert(op.name.clone(), self.ops.len());
        self.ops.push(op);
        Ok(())
    }

    fn op(&self, name: &str) -> Option<&OpDef> {
        self.index.get(name).map(|i| &self.ops[*i])
    }
}

/// A mutable operation DAG, shared between exactly one session and one model.
///
/// The handle is a cheap clone over the same underlying graph; annotation
/// mutates it in place while a bound session stays valid.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    inner: Arc<RwLock<GraphInner>>,
}

impl Graph {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the ops of a definition to this graph.
    ///
    /// Importing a definition whose op names collide with ops already
    /// present fails with [`Error::DuplicateOp`] before any op is added.
    pub fn import_graph_def(&self, def: &GraphDef) -> Result<()> {
        let mut inner = self.write();
        for op in &def.ops {
            if inner.index.contains_key(&op.name) {
                return Err(Error::DuplicateOp {
                    name: op.name.clone(),
                });
            }
        }
        for op in &def.ops {
            inner.add_op(op.clone())?;
        }
        Ok(())
    }

    /// Exports the current state of the graph as a definition.
    pub fn to_graph_def(&self) -> GraphDef {
        GraphDef {
            ops: self.read().ops.clone(),
        }
    }

    /// Adds a single op; fails fast on a duplicate name or a missing input.
    pub fn add_op(&self, op: OpDef) -> Result<()> {
        self.write().add_op(op)
    }

    /// All ops in insertion order.
    pub fn operations(&self) -> Vec<OpDef> {
        self.read().ops.clone()
    }

    /// Names of every variable op, in insertion order.
    pub fn variable_names(&self) -> Vec<String> {
        self.read()
            .ops
            .iter()
            .filter(|op| matches!(op.kind, OpKind::Variable { .. }))
            .map(|op| op.name.clone())
            .collect()
    }

    pub fn contains_op(&self, name: &str) -> bool {
        self.read().index.contains_key(name)
    }

    /// Looks up a single op definition by name.
    pub fn op(&self, name: &str) -> Result<OpDef> {
        self.read()
            .op(name)
            .cloned()
            .ok_or_else(|| Error::OpNotFound {
                name: name.to_string(),
            })
    }

    pub fn is_empty(&self) -> bool {
        self.read().ops.is_empty()
    }

    /// Statically inferred output shape of an op; -1 marks an extent that
    /// is only known at run time. Ops without a data output (assign, init,
    /// train step) report an empty scalar shape.
    pub fn output_shape(&self, name: &str) -> Result<Vec<i64>> {
        let inner = self.read();
        let mut visiting = Vec::new();
        shape_of(&inner, name, &mut visiting)
    }

    /// Rank of the statically inferred output shape.
    pub fn output_rank(&self, name: &str) -> Result<usize> {
        Ok(self.output_shape(name)?.len())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, GraphInner> {
        self.inner.read().expect("graph lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, GraphInner> {
        self.inner.write().expect("graph lock poisoned")
    }
}

fn shape_of(inner: &GraphInner, name: &str, visiting: &mut Vec<String>) -> Result<Vec<i64>> {
    if visiting.iter().any(|n| n == name) {
        return Err(Error::Config(format!(
            "graph contains a cycle through '{name}'"
        )));
    }
    let op = inner.op(name).ok_or_else(|| Error::OpNotFound {
        name: name.to_string(),
    })?;
    visiting.push(name.to_string());
    let shape = match &op.kind {
        OpKind::Placeholder { shape, .. } => shape.clone(),
        OpKind::Variable { shape, .. } => shape.iter().map(|d| *d as i64).collect(),
        OpKind::Const { value } => value.shape().iter().map(|d| *d as i64).collect(),
        OpKind::MatMul => {
            let a = shape_of(inner, &op.inputs[0], visiting)?;
            let b = shape_of(inner, &op.inputs[1], visiting)?;
            if a.len() != 2 || b.len() != 2 {
                return Err(Error::Config(format!(
                    "matmul '{}' requires rank 2 inputs, found ranks {} and {}",
                    op.name,
                    a.len(),
                    b.len()
                )));
            }
            vec![a[0], b[1]]
        }
        OpKind::Add => {
            let a = shape_of(inner, &op.inputs[0], visiting)?;
            let b = shape_of(inner, &op.inputs[1], visiting)?;
            if a.len() >= b.len() {
                a
            } else {
                b
            }
        }
        OpKind::Identity | OpKind::Relu | OpKind::Softmax | OpKind::Assign => {
            shape_of(inner, &op.inputs[0], visiting)?
        }
        OpKind::MseLoss | OpKind::SoftmaxCrossEntropy => Vec::new(),
        OpKind::Init | OpKind::TrainStep { .. } => Vec::new(),
    };
    visiting.pop();
    Ok(shape)
}

/// True when every dimension pair is equal or either side is dynamic.
pub fn shapes_compatible(a: &[i64], b: &[i64]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| *x == -1 || *y == -1 || x == y)
}
