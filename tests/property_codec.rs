//! Property tests for the tensor codec wire format.

use acoplar::graph::{DType, Tensor};
use acoplar::TensorTuple;
use proptest::prelude::*;

fn arb_dtype() -> impl Strategy<Value = DType> {
    prop_oneof![
        Just(DType::Float),
        Just(DType::Double),
        Just(DType::Int32),
        Just(DType::Int64),
        Just(DType::UInt8),
        Just(DType::Bool),
    ]
}

/// Shapes up to rank 3 with small extents, scalars included.
fn arb_shape() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1u64..5, 0..4)
}

prop_compose! {
    fn arb_tensor()(dtype in arb_dtype(), shape in arb_shape())
                   (data in prop::collection::vec(
                        any::<u8>(),
                        shape.iter().product::<u64>() as usize * dtype.size_of()),
                    dtype in Just(dtype),
                    shape in Just(shape))
                   -> Tensor {
        Tensor::new(dtype, shape, data).unwrap()
    }
}

proptest! {
    #[test]
    fn wire_round_trip_is_lossless(tensor in arb_tensor()) {
        let tuple = TensorTuple::of(&tensor).unwrap();
        let wire = tuple.to_wire().unwrap();
        let back = TensorTuple::from_wire(&wire).unwrap();
        prop_assert_eq!(&back, &tuple);

        let rebuilt = back.rebuild().unwrap();
        prop_assert_eq!(rebuilt.dtype(), tensor.dtype());
        prop_assert_eq!(rebuilt.shape(), tensor.shape());
        prop_assert_eq!(rebuilt.data(), tensor.data());
    }

    #[test]
    fn float_values_survive_capture_and_rebuild(values in prop::collection::vec(-1e6f32..1e6, 1..32)) {
        let tensor = Tensor::from_f32(&[values.len() as u64], &values).unwrap();
        let rebuilt = TensorTuple::of(&tensor).unwrap().rebuild().unwrap();
        prop_assert_eq!(rebuilt.to_f32_vec().unwrap(), values);
    }

    #[test]
    fn truncation_never_panics(tensor in arb_tensor(), cut in 0usize..8) {
        let wire = TensorTuple::of(&tensor).unwrap().to_wire().unwrap();
        let keep = wire.len().saturating_sub(cut);
        // Truncated input either still parses (cut == 0) or errors cleanly.
        let result = TensorTuple::from_wire(&wire[..keep]);
        if cut == 0 {
            prop_assert!(result.is_ok());
        } else {
            prop_assert!(result.is_err());
        }
    }

    #[test]
    fn corrupt_kind_tag_never_panics(tensor in arb_tensor(), tag in 6u8..) {
        let mut wire = TensorTuple::of(&tensor).unwrap().to_wire().unwrap();
        wire[0] = tag;
        prop_assert!(TensorTuple::from_wire(&wire).is_err());
    }
}
