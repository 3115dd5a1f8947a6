use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use kiln_engine::builder::Builder;
use kiln_engine::error::{KilnError, PlanError};
use kiln_engine::plan::{CompiledPlan, TensorRole};
use kiln_engine::networks::{classifier_network, classifier_profile, gather_nd_inputs, gather_nd_network};
use kiln_engine::runtime::Runtime;
use kiln_engine::tester::{assert_tensors_match, eval_engine};
use kiln_graph::dtype::{DTensor, Tensor};
use kiln_graph::ndarray::IxDyn;

use crate::root::runner::validating_device;

fn gather_plan() -> Vec<u8> {
    let builder = Builder::new();
    let mut network = gather_nd_network().unwrap();
    builder.build_serialized_network(&mut network, &builder.create_config()).unwrap()
}

#[test]
fn reload_gather() {
    let data = gather_plan();
    let engine = Runtime::new().deserialize_engine(&data).unwrap();
    assert_eq!(data, engine.serialize());

    let outputs = eval_engine(&engine, &validating_device(), &gather_nd_inputs()).unwrap();
    assert_eq!(12.0, outputs[0].unwrap_f32().unwrap()[[0, 0]]);
}

#[test]
fn reload_classifier() {
    let mut rng = StdRng::seed_from_u64(5);
    let builder = Builder::new();
    let mut network = classifier_network(&mut rng).unwrap();
    let mut config = builder.create_config();
    config.add_optimization_profile(classifier_profile());
    let engine = builder.build_engine(&mut network, &config).unwrap();

    let loaded = Runtime::new().deserialize_engine(&engine.serialize()).unwrap();
    assert_eq!(engine.io_tensors(), loaded.io_tensors());
    assert_eq!(engine.layer_info(), loaded.layer_info());
    assert_eq!(engine.workspace_size(), loaded.workspace_size());

    let input = DTensor::F32(Tensor::from_shape_fn(IxDyn(&[2, 1, 28, 28]), |_| rng.gen::<f32>()));
    let device = validating_device();
    let expected = eval_engine(&engine, &device, &[input.clone()]).unwrap();
    let actual = eval_engine(&loaded, &device, &[input]).unwrap();
    assert_tensors_match(&expected, &actual, false);
}

#[test]
fn bad_magic() {
    let mut data = gather_plan();
    data[0] = b'X';
    assert_eq!(PlanError::BadMagic, Runtime::new().deserialize_engine(&data).unwrap_err());
    assert_eq!(PlanError::Truncated, Runtime::new().deserialize_engine(&[]).unwrap_err());
}

#[test]
fn future_version() {
    let mut data = gather_plan();
    data[4..8].copy_from_slice(&99u32.to_le_bytes());
    assert_eq!(
        PlanError::UnsupportedVersion(99),
        Runtime::new().deserialize_engine(&data).unwrap_err()
    );
}

#[test]
fn truncated() {
    let data = gather_plan();
    for len in [8, data.len() / 2, data.len() - 1] {
        let result = Runtime::new().deserialize_engine(&data[..len]);
        assert_eq!(PlanError::Truncated, result.unwrap_err(), "length {}", len);
    }
}

#[test]
fn trailing_bytes() {
    let mut data = gather_plan();
    data.push(0);
    let result = Runtime::new().deserialize_engine(&data);
    assert!(matches!(result, Err(PlanError::Corrupt(_))));
}

#[test]
fn intermediate_marked_as_output() {
    let mut rng = StdRng::seed_from_u64(5);
    let builder = Builder::new();
    let mut network = classifier_network(&mut rng).unwrap();
    let mut config = builder.create_config();
    config.add_optimization_profile(classifier_profile());
    let data = builder.build_serialized_network(&mut network, &config).unwrap();

    let mut plan = CompiledPlan::deserialize(&data).unwrap();
    let intermediate = plan
        .tensors
        .iter()
        .position(|t| t.role == TensorRole::Intermediate)
        .unwrap();
    plan.tensors[intermediate].role = TensorRole::Output;

    let result = Runtime::new().deserialize_engine(&plan.serialize());
    assert!(matches!(result, Err(PlanError::Corrupt(_))), "got {:?}", result);
}

#[test]
fn save_and_load_file() {
    let engine = Runtime::new().deserialize_engine(&gather_plan()).unwrap();
    let path = std::env::temp_dir().join(format!("kiln-gather-{}.plan", std::process::id()));

    let len = engine.save(&path).unwrap();
    let loaded = Runtime::new().load_engine(&path);
    std::fs::remove_file(&path).unwrap();

    let loaded = loaded.unwrap();
    assert_eq!(len, loaded.serialize().len());
    assert_eq!(engine.serialize(), loaded.serialize());
}

#[test]
fn file_errors_are_reported() {
    let engine = Runtime::new().deserialize_engine(&gather_plan()).unwrap();

    // a directory cannot be written as a file
    let result = engine.save(std::env::temp_dir());
    assert!(matches!(result, Err(KilnError::Io(_))), "got {:?}", result);

    let missing = std::env::temp_dir().join("kiln-missing-dir").join("missing.plan");
    let err = Runtime::new().load_engine(&missing).unwrap_err();
    assert!(matches!(err, KilnError::Io(_)), "got {:?}", err);
    assert_eq!("io", err.stage());

    // loading still checks the plan itself
    let path = std::env::temp_dir().join(format!("kiln-corrupt-{}.plan", std::process::id()));
    std::fs::write(&path, b"XXXX").unwrap();
    let result = Runtime::new().load_engine(&path);
    std::fs::remove_file(&path).unwrap();
    assert!(matches!(result, Err(KilnError::Load(PlanError::BadMagic))), "got {:?}", result);
}
