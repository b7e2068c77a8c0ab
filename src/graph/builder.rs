//! Construction helpers for the standard dense feed-forward graphs
//!
//! Training graphs are normally authored by whatever produced the model;
//! these helpers cover the common fully-connected case and the fixtures the
//! tests train against.

use crate::graph::def::{GraphDef, OpDef, OpKind, VarInit};
use crate::graph::DType;

/// Conventional name of the input placeholder.
pub const INPUT_NAME: &str = "input";
/// Conventional name of the output op.
pub const OUTPUT_NAME: &str = "output";
/// Conventional name of the init op.
pub const INIT_NAME: &str = "init";

/// Builds a fully-connected graph: matmul+bias layers with relu between
/// them and a linear rank-2 output. `hidden` may be empty for a plain
/// linear model.
pub fn dense_graph(
    num_features: usize,
    hidden: &[usize],
    num_outputs: usize,
    seed: u64,
) -> GraphDef {
    let mut ops = vec![OpDef::new(
        INPUT_NAME,
        OpKind::Placeholder {
            dtype: DType::Float,
            shape: vec![-1, num_features as i64],
        },
        vec![],
    )];

    let mut current = INPUT_NAME.to_string();
    let mut current_width = num_features;
    let widths: Vec<usize> = hidden.iter().copied().chain([num_outputs]).collect();
    let last = widths.len() - 1;
    for (layer, width) in widths.into_iter().enumerate() {
        let prefix = format!("dense_{layer}");
        let weights = format!("{prefix}/weights");
        let bias = format!("{prefix}/bias");
        ops.push(OpDef::new(
            weights.clone(),
            OpKind::Variable {
                dtype: DType::Float,
                shape: vec![current_width as u64, width as u64],
                init: VarInit::RandomNormal {
                    stddev: 0.1,
                    seed: seed.wrapping_add(layer as u64),
                },
            },
            vec![],
        ));
        ops.push(OpDef::new(
            bias.clone(),
            OpKind::Variable {
                dtype: DType::Float,
                shape: vec![width as u64],
                init: VarInit::Zeros,
            },
            vec![],
        ));
        ops.push(OpDef::new(
            format!("{prefix}/matmul"),
            OpKind::MatMul,
            vec![current.clone(), weights],
        ));
        let affine = format!("{prefix}/affine");
        ops.push(OpDef::new(
            affine.clone(),
            OpKind::Add,
            vec![format!("{prefix}/matmul"), bias],
        ));
        if layer == last {
            ops.push(OpDef::new(OUTPUT_NAME, OpKind::Identity, vec![affine.clone()]));
            current = OUTPUT_NAME.to_string();
        } else {
            let relu = format!("{prefix}/relu");
            ops.push(OpDef::new(relu.clone(), OpKind::Relu, vec![affine.clone()]));
            current = relu;
        }
        current_width = width;
    }

    ops.push(OpDef::new(INIT_NAME, OpKind::Init, vec![]));
    GraphDef { ops }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Graph, Session, Tensor};

    #[test]
    fn test_linear_graph_shapes() {
        let def = dense_graph(3, &[], 2, 0);
        let graph = Graph::new();
        graph.import_graph_def(&def).unwrap();
        assert_eq!(graph.output_shape(OUTPUT_NAME).unwrap(), vec![-1, 2]);
        assert_eq!(graph.variable_names(), vec!["dense_0/weights", "dense_0/bias"]);
    }

    #[test]
    fn test_hidden_layer_graph_runs() {
        let def = dense_graph(4, &[8], 3, 7);
        let graph = Graph::new();
        graph.import_graph_def(&def).unwrap();
        let session = Session::new(&graph);
        session.runner().add_target(INIT_NAME).run().unwrap();

        let input = Tensor::from_f32(&[2, 4], &[0.5; 8]).unwrap();
        let out = session
            .runner()
            .feed(INPUT_NAME, input)
            .fetch(OUTPUT_NAME)
            .run()
            .unwrap();
        assert_eq!(out[0].shape(), &[2, 3]);
    }
}
