//! Lifecycle of the persisted-model variants: serialization, conversion,
//! copying and closing.

use acoplar::convert::{
    Example, FeatureConverter, OutputConverter, Prediction, Target, TargetKind,
};
use acoplar::graph::builder::{dense_graph, INPUT_NAME, OUTPUT_NAME};
use acoplar::graph::{DType, GraphDef, OpDef, OpKind, Tensor};
use acoplar::model::{deserialize, ModelPayload};
use acoplar::train::{GraphTrainer, TrainerOptions};
use acoplar::{
    CheckpointModel, Error, FeatureIdMapping, FrozenExternalModel, ModelMetadata, NativeModel,
};
use std::collections::HashMap;

fn fixed_examples() -> Vec<Example> {
    // y = x0 + 2*x1
    vec![
        Example::new(vec![1.0, 0.0], Target::Regression(vec![1.0])),
        Example::new(vec![0.0, 1.0], Target::Regression(vec![2.0])),
        Example::new(vec![1.0, 1.0], Target::Regression(vec![3.0])),
        Example::new(vec![0.5, 0.5], Target::Regression(vec![1.5])),
        Example::new(vec![2.0, 1.0], Target::Regression(vec![4.0])),
        Example::new(vec![1.0, 2.0], Target::Regression(vec![5.0])),
    ]
}

fn probe_set() -> Vec<Vec<f32>> {
    vec![
        vec![1.0, 0.0],
        vec![0.0, 1.0],
        vec![0.75, 0.25],
        vec![1.5, 1.5],
    ]
}

fn train_native() -> NativeModel {
    let _ = env_logger::builder().is_test(true).try_init();
    let def = dense_graph(2, &[], 1, 11);
    let options = TrainerOptions::new(
        OUTPUT_NAME,
        FeatureConverter::dense(INPUT_NAME),
        OutputConverter::regression(1),
    )
    .with_epochs(80)
    .with_minibatch_size(3)
    .with_logging_interval(None)
    .with_optimizer(
        acoplar::GradientOptimizer::GradientDescent,
        HashMap::from([("learning_rate".to_string(), 0.1)]),
    );
    let trainer = GraphTrainer::new(def, options).unwrap();
    trainer
        .train(&fixed_examples())
        .unwrap()
        .into_native()
        .expect("native format is the default")
}

fn regression_values(model_outputs: Vec<Prediction>) -> Vec<f32> {
    model_outputs
        .into_iter()
        .map(|p| match p {
            Prediction::Regression(v) => v[0],
            other => panic!("expected regression, got {other:?}"),
        })
        .collect()
}

#[test]
fn native_serialize_deserialize_preserves_predictions() {
    let model = train_native();
    let before = regression_values(model.predict_batch(&probe_set()).unwrap());

    let envelope = model.serialize().unwrap();
    let bytes = envelope.to_bytes().unwrap();
    let parsed = acoplar::ModelEnvelope::from_bytes(&bytes).unwrap();
    let reloaded = deserialize(parsed).unwrap();

    let after = regression_values(reloaded.predict_batch(&probe_set()).unwrap());
    assert_eq!(before, after, "embedded snapshot restore must be exact");
}

#[test]
fn native_checkpoint_native_round_trip_fidelity() {
    let dir = tempfile::tempdir().unwrap();
    let model = train_native();
    let before = regression_values(model.predict_batch(&probe_set()).unwrap());

    let checkpoint = model.convert_to_checkpoint(dir.path(), "round-trip").unwrap();
    assert!(checkpoint.is_initialized());
    let back = checkpoint.convert_to_native().unwrap();
    let after = regression_values(back.predict_batch(&probe_set()).unwrap());

    for (b, a) in before.iter().zip(after.iter()) {
        assert!((b - a).abs() < 1e-6, "prediction drifted: {b} vs {a}");
    }

    // Neither conversion closed or mutated its source.
    assert!(!checkpoint.is_closed());
    assert!(model.predict(&[1.0, 1.0]).is_ok());
}

#[test]
fn copy_is_independent_of_the_source() {
    let mut model = train_native();
    let copied = model
        .copy("copied-model", ModelMetadata::new("copied"))
        .unwrap();
    let expected = regression_values(vec![model.predict(&[1.0, 1.0]).unwrap()]);

    model.close();
    // The copy has its own graph and session.
    let got = regression_values(vec![copied.predict(&[1.0, 1.0]).unwrap()]);
    assert_eq!(expected, got);
    assert_eq!(copied.name(), "copied-model");
}

#[test]
fn closed_model_fails_all_operations() {
    let mut model = train_native();
    model.close();
    assert!(model.is_closed());
    assert!(matches!(model.predict(&[1.0, 1.0]), Err(Error::ModelClosed)));
    assert!(matches!(model.serialize(), Err(Error::ModelClosed)));
    assert!(matches!(
        model.copy("again", ModelMetadata::new("x")),
        Err(Error::ModelClosed)
    ));
    // Second close is a no-op.
    model.close();
    assert!(model.is_closed());
}

#[test]
fn checkpoint_model_survives_missing_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let model = train_native();
    let checkpoint = model.convert_to_checkpoint(dir.path(), "present").unwrap();
    let envelope = checkpoint.serialize().unwrap();

    // Point the payload at a directory with no checkpoint in it.
    let broken_dir = tempfile::tempdir().unwrap();
    let mut parsed = envelope.clone();
    if let ModelPayload::Checkpoint(ref mut payload) = parsed.payload {
        payload.checkpoint_directory = broken_dir.path().to_path_buf();
    }
    let mut reloaded = deserialize(parsed)
        .unwrap()
        .into_checkpoint()
        .expect("checkpoint class");

    // Uninitialized, recorded as a flag rather than an error.
    assert!(!reloaded.is_initialized());
    assert!(reloaded.predict(&[1.0, 0.0]).is_err());

    // Repair the path and initialize again.
    reloaded.set_checkpoint_directory(dir.path());
    reloaded.initialize().unwrap();
    assert!(reloaded.is_initialized());
    assert!(reloaded.predict(&[1.0, 0.0]).is_ok());
}

#[test]
fn checkpoint_initialize_propagates_failure() {
    let dir = tempfile::tempdir().unwrap();
    let model = train_native();
    let mut checkpoint = model.convert_to_checkpoint(dir.path(), "ckpt").unwrap();
    checkpoint.set_checkpoint_name("no-such-checkpoint");
    assert!(checkpoint.initialize().is_err());
    assert!(!checkpoint.is_initialized());
}

#[test]
fn version_above_maximum_is_rejected_citing_version() {
    let model = train_native();
    let mut envelope = model.serialize().unwrap();
    envelope.version = 99;

    match deserialize(envelope) {
        Err(Error::UnsupportedVersion {
            class_name,
            found,
            max,
        }) => {
            assert_eq!(class_name, NativeModel::CLASS_NAME);
            assert_eq!(found, 99);
            assert_eq!(max, NativeModel::CURRENT_VERSION);
        }
        other => panic!("expected UnsupportedVersion, got {other:?}"),
    }

    // The rendered message names the offending version and the maximum.
    let mut envelope = train_native().serialize().unwrap();
    envelope.version = 99;
    let message = format!("{}", deserialize(envelope).unwrap_err());
    assert!(message.contains("99"));
    assert!(message.contains(&NativeModel::CURRENT_VERSION.to_string()));
}

#[test]
fn unknown_class_name_is_rejected() {
    let model = train_native();
    let mut envelope = model.serialize().unwrap();
    envelope.class_name = "acoplar.SomethingElse".to_string();
    assert!(matches!(
        deserialize(envelope),
        Err(Error::UnknownModelClass { .. })
    ));
}

#[test]
fn payload_class_disagreement_is_rejected() {
    let model = train_native();
    let mut envelope = model.serialize().unwrap();
    envelope.class_name = CheckpointModel::CLASS_NAME.to_string();
    assert!(matches!(
        deserialize(envelope),
        Err(Error::Serialization(_))
    ));
}

#[test]
fn mismatched_output_domain_is_rejected() {
    let model = train_native();
    let mut envelope = model.serialize().unwrap();
    if let ModelPayload::Native(ref mut payload) = envelope.payload {
        payload.output_domain = TargetKind::Label;
    }
    match deserialize(envelope) {
        Err(Error::ConverterMismatch { output, converter }) => {
            assert_eq!(output, "Label");
            assert_eq!(converter, "Regression");
        }
        other => panic!("expected ConverterMismatch, got {other:?}"),
    }
}

/// A frozen graph: input placeholder times a constant weight matrix.
fn frozen_def() -> GraphDef {
    GraphDef {
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
                "weights",
                OpKind::Const {
                    value: Tensor::from_f32(&[2, 1], &[10.0, 1.0]).unwrap(),
                },
                vec![],
            ),
            OpDef::new(
                "output",
                OpKind::MatMul,
                vec!["input".to_string(), "weights".to_string()],
            ),
        ],
    }
}

fn frozen_model(mapping: FeatureIdMapping) -> FrozenExternalModel {
    FrozenExternalModel::new(
        "frozen",
        ModelMetadata::new(frozen_def().sha256_hex().unwrap()),
        &frozen_def(),
        mapping,
        4,
        "output",
        FeatureConverter::dense("input"),
        OutputConverter::regression(1),
    )
    .unwrap()
}

#[test]
fn frozen_model_routes_features_through_mapping() {
    // Identity mapping: output = 10*x0 + 1*x1.
    let identity = frozen_model(FeatureIdMapping::identity(2));
    match identity.predict(&[1.0, 2.0]).unwrap() {
        Prediction::Regression(v) => assert!((v[0] - 12.0).abs() < 1e-6),
        other => panic!("unexpected {other:?}"),
    }

    // Swapped mapping: internal feature 0 lands at external slot 1.
    let swapped = frozen_model(FeatureIdMapping::new(vec![1, 0], vec![1, 0]).unwrap());
    match swapped.predict(&[1.0, 2.0]).unwrap() {
        Prediction::Regression(v) => assert!((v[0] - 21.0).abs() < 1e-6),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn frozen_model_envelope_round_trip() {
    let model = frozen_model(FeatureIdMapping::new(vec![1, 0], vec![1, 0]).unwrap());
    let envelope = model.serialize().unwrap();
    let bytes = envelope.to_bytes().unwrap();
    let reloaded = deserialize(acoplar::ModelEnvelope::from_bytes(&bytes).unwrap()).unwrap();
    let p = regression_values(vec![reloaded.predict(&[1.0, 2.0]).unwrap()]);
    assert!((p[0] - 21.0).abs() < 1e-6);
}

#[test]
fn invalid_mapping_in_envelope_is_rejected() {
    let model = frozen_model(FeatureIdMapping::identity(2));
    let envelope = model.serialize().unwrap();
    let mut bytes = String::from_utf8(envelope.to_bytes().unwrap()).unwrap();
    // Corrupt the backward direction so the pair is no longer inverse.
    bytes = bytes.replace("\"backward\":[0,1]", "\"backward\":[0,0]");
    assert!(acoplar::ModelEnvelope::from_bytes(bytes.as_bytes()).is_err());
}

#[test]
fn non_bijective_mapping_rejected_at_construction() {
    assert!(matches!(
        FeatureIdMapping::new(vec![0, 0], vec![0, 1]),
        Err(Error::MappingNotBijective(_))
    ));
}

#[test]
fn export_saved_model_writes_graph_and_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let model = train_native();
    let export = dir.path().join("export");
    model.export_saved_model(&export).unwrap();
    assert!(export.join("graph.json").exists());
    assert!(export.join("variables.safetensors").exists());

    let mut closed = train_native();
    closed.close();
    assert!(matches!(
        closed.export_saved_model(&export),
        Err(Error::ModelClosed)
    ));
}
