//! Reverse-mode gradients over the closed op set
//!
//! Used by the train-step op: forward values come from the run's memoized
//! evaluator, gradients flow backwards from the loss to every variable that
//! feeds it. Only float tensors participate; the op set a loss may be built
//! from is fixed, so dispatch is an exhaustive match.

use crate::graph::def::OpKind;
use crate::graph::session::{softmax_rows, Evaluator};
use crate::{Error, Result};
use ndarray::{ArrayD, Axis, Ix2, IxDyn};
use std::collections::{HashMap, HashSet};

/// Gradients of the scalar loss with respect to every variable feeding it.
pub(crate) fn gradients(
    eval: &mut Evaluator<'_>,
    loss: &str,
) -> Result<HashMap<String, ArrayD<f32>>> {
    let order = topological_order(eval, loss)?;

    let mut grads: HashMap<String, ArrayD<f32>> = HashMap::new();
    grads.insert(loss.to_string(), ArrayD::ones(IxDyn(&[])));

    let mut var_grads = HashMap::new();
    for name in order.iter().rev() {
        let grad = match grads.get(name) {
            Some(g) => g.clone(),
            None => continue,
        };
        let op = eval.op(name)?.clone();
        match &op.kind {
            OpKind::Variable { .. } => {
                var_grads.insert(name.clone(), grad);
            }
            OpKind::Placeholder { .. } | OpKind::Const { .. } => {}
            OpKind::Identity => accumulate(&mut grads, &op.inputs[0], grad),
            OpKind::Relu => {
                let x = eval.array(&op.inputs[0])?;
                let masked = &grad * &x.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
                accumulate(&mut grads, &op.inputs[0], masked);
            }
            OpKind::Softmax => {
                let p = eval.array(&op.inputs[0])?.into_dimensionality::<Ix2>().map_err(
                    |_| Error::Config(format!("softmax '{name}' input is not rank 2")),
                )?;
                let p = softmax_rows(&p);
                let dy = grad
                    .into_dimensionality::<Ix2>()
                    .map_err(|_| Error::Config(format!("softmax '{name}' grad is not rank 2")))?;
                let mut dx = ndarray::Array2::<f32>::zeros(p.raw_dim());
                for i in 0..p.nrows() {
                    let dot: f32 = p.row(i).iter().zip(dy.row(i).iter()).map(|(a, b)| a * b).sum();
                    for j in 0..p.ncols() {
                        dx[[i, j]] = p[[i, j]] * (dy[[i, j]] - dot);
                    }
                }
                accumulate(&mut grads, &op.inputs[0], dx.into_dyn());
            }
            OpKind::MatMul => {
                let a = eval.array(&op.inputs[0])?.into_dimensionality::<Ix2>().map_err(
                    |_| Error::Config(format!("matmul '{name}' input is not rank 2")),
                )?;
                let b = eval.array(&op.inputs[1])?.into_dimensionality::<Ix2>().map_err(
                    |_| Error::Config(format!("matmul '{name}' input is not rank 2")),
                )?;
                let dy = grad
                    .into_dimensionality::<Ix2>()
                    .map_err(|_| Error::Config(format!("matmul '{name}' grad is not rank 2")))?;
                accumulate(&mut grads, &op.inputs[0], dy.dot(&b.t()).into_dyn());
                accumulate(&mut grads, &op.inputs[1], a.t().dot(&dy).into_dyn());
            }
            OpKind::Add => {
                let a = eval.array(&op.inputs[0])?;
                let b = eval.array(&op.inputs[1])?;
                accumulate(&mut grads, &op.inputs[0], reduce_to_shape(&grad, a.shape()));
                accumulate(&mut grads, &op.inputs[1], reduce_to_shape(&grad, b.shape()));
            }
            OpKind::MseLoss => {
                let target = eval.array(&op.inputs[0])?;
                let predicted = eval.array(&op.inputs[1])?;
                let scale = grad_scalar(&grad)? * 2.0 / predicted.len() as f32;
                let d = (&predicted - &target).mapv(|v| v * scale);
                accumulate(&mut grads, &op.inputs[1], d);
            }
            OpKind::SoftmaxCrossEntropy => {
                let target = eval.array(&op.inputs[0])?.into_dimensionality::<Ix2>().map_err(
                    |_| Error::Config(format!("loss '{name}' target is not rank 2")),
                )?;
                let logits = eval.array(&op.inputs[1])?.into_dimensionality::<Ix2>().map_err(
                    |_| Error::Config(format!("loss '{name}' logits are not rank 2")),
                )?;
                let scale = grad_scalar(&grad)? / logits.nrows() as f32;
                let d = (softmax_rows(&logits) - &target).mapv(|v| v * scale);
                accumulate(&mut grads, &op.inputs[1], d.into_dyn());
            }
            other => {
                return Err(Error::Config(format!(
                    "cannot differentiate through op '{}' of type {}",
                    name,
                    other.type_name()
                )))
            }
        }
    }
    Ok(var_grads)
}

fn accumulate(grads: &mut HashMap<String, ArrayD<f32>>, name: &str, grad: ArrayD<f32>) {
    match grads.get_mut(name) {
        Some(existing) => *existing = &*existing + &grad,
        None => {
            grads.insert(name.to_string(), grad);
        }
    }
}

/// Sums a gradient over leading broadcast axes until it matches the shape
/// of the operand it belongs to (bias add).
fn reduce_to_shape(grad: &ArrayD<f32>, shape: &[usize]) -> ArrayD<f32> {
    let mut out = grad.clone();
    while out.ndim() > shape.len() {
        out = out.sum_axis(Axis(0));
    }
    for (axis, dim) in shape.iter().enumerate() {
        if out.shape()[axis] != *dim && *dim == 1 {
            out = out.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    out
}

fn grad_scalar(grad: &ArrayD<f32>) -> Result<f32> {
    grad.iter()
        .next()
        .copied()
        .ok_or_else(|| Error::Config("empty gradient".to_string()))
}

/// Post-order over the sub-DAG feeding the loss, leaves first.
fn topological_order(eval: &Evaluator<'_>, root: &str) -> Result<Vec<String>> {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    visit(eval, root, &mut seen, &mut order)?;
    Ok(order)
}

fn visit(
    eval: &Evaluator<'_>,
    name: &str,
    seen: &mut HashSet<String>,
    order: &mut Vec<String>,
) -> Result<()> {
    if seen.contains(name) {
        return Ok(());
    }
    seen.insert(name.to_string());
    let op = eval.op(name)?;
    let inputs = op.inputs.clone();
    let leaf = matches!(
        op.kind,
        OpKind::Placeholder { .. } | OpKind::Variable { .. } | OpKind::Const { .. }
    );
    if !leaf {
        for input in &inputs {
            visit(eval, input, seen, order)?;
        }
    }
    order.push(name.to_string());
    Ok(())
}
