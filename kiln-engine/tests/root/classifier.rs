use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use kiln_engine::builder::{Builder, MemoryPoolType};
use kiln_engine::error::{BindingError, BuildError};
use kiln_engine::networks::{classifier_network, classifier_profile, CLASSIFIER_INPUT};
use kiln_engine::runtime::TensorIoMode;
use kiln_engine::tester::eval_engine;
use kiln_graph::dtype::{DTensor, DType, Tensor};
use kiln_graph::ndarray::IxDyn;
use kiln_graph::shape;
use kiln_graph::shape::{ConcreteShape, Dim};

use crate::root::runner::{test_network, validating_device};

fn images(rng: &mut impl Rng, batch: usize) -> DTensor {
    DTensor::F32(Tensor::from_shape_fn(IxDyn(&[batch, 1, 28, 28]), |_| rng.gen::<f32>()))
}

#[test]
fn build_and_query() {
    let mut rng = StdRng::seed_from_u64(0);
    let builder = Builder::new();
    let mut network = classifier_network(&mut rng).unwrap();

    let mut config = builder.create_config();
    config.set_memory_pool_limit(MemoryPoolType::Workspace, 3 << 30);
    config.add_optimization_profile(classifier_profile());

    let engine = builder.build_engine(&mut network, &config).unwrap();
    assert!(network.is_frozen());

    let io = engine.io_tensors();
    assert_eq!(2, io.len());
    assert_eq!(CLASSIFIER_INPUT, io[0].name);
    assert_eq!(shape![Dim::DYNAMIC, 1, 28, 28], io[0].shape);
    assert_eq!(TensorIoMode::Output, io[1].mode);
    assert_eq!(DType::I32, io[1].dtype);
    assert_eq!(shape![Dim::DYNAMIC, 1], io[1].shape);

    assert_eq!(1, engine.num_optimization_profiles());
    let [min, opt, max] = engine.profile_shape(CLASSIFIER_INPUT, 0).unwrap();
    assert_eq!(ConcreteShape::from([1, 1, 28, 28]), min);
    assert_eq!(ConcreteShape::from([4, 1, 28, 28]), opt);
    assert_eq!(ConcreteShape::from([16, 1, 28, 28]), max);
    assert!(engine.workspace_size() <= 3 << 30);
}

#[test]
fn batch_outside_profile() {
    let mut rng = StdRng::seed_from_u64(1);
    let builder = Builder::new();
    let mut network = classifier_network(&mut rng).unwrap();
    let mut config = builder.create_config();
    config.add_optimization_profile(classifier_profile());
    let engine = builder.build_engine(&mut network, &config).unwrap();

    let mut context = engine.create_execution_context();
    let result = context.set_input_shape(CLASSIFIER_INPUT, [20, 1, 28, 28]);
    assert!(matches!(result, Err(BindingError::ShapeOutOfProfile { .. })), "got {:?}", result);
    assert!(!context.all_input_shapes_specified());

    let result = context.set_input_shape(CLASSIFIER_INPUT, [2, 3, 28, 28]);
    assert!(matches!(result, Err(BindingError::ShapeMismatch { .. })), "got {:?}", result);

    context.set_input_shape(CLASSIFIER_INPUT, [16, 1, 28, 28]).unwrap();
    assert_eq!(ConcreteShape::from([16, 1]), context.tensor_shape(&engine.io_tensors()[1].name).unwrap());
}

#[test]
fn tiny_workspace() {
    let mut rng = StdRng::seed_from_u64(2);
    let builder = Builder::new();
    let mut network = classifier_network(&mut rng).unwrap();
    let mut config = builder.create_config();
    config.set_memory_pool_limit(MemoryPoolType::Workspace, 1024);
    config.add_optimization_profile(classifier_profile());

    let result = builder.build_engine(&mut network, &config);
    assert!(
        matches!(result, Err(BuildError::InsufficientWorkspace { available: 1024, .. })),
        "got {:?}",
        result.map(|_| ())
    );
}

#[test]
fn deterministic_build() {
    let build = || {
        let mut rng = StdRng::seed_from_u64(3);
        let builder = Builder::new();
        let mut network = classifier_network(&mut rng).unwrap();
        let mut config = builder.create_config();
        config.add_optimization_profile(classifier_profile());
        builder.build_serialized_network(&mut network, &config).unwrap()
    };

    assert_eq!(build(), build());
}

#[test]
fn matches_cpu() {
    let mut rng = StdRng::seed_from_u64(4);
    let builder = Builder::new();
    let mut network = classifier_network(&mut rng).unwrap();
    let mut config = builder.create_config();
    config.add_optimization_profile(classifier_profile());

    let inputs = vec![vec![images(&mut rng, 1)], vec![images(&mut rng, 3)]];
    let engine = test_network(&mut network, &config, &inputs);

    let outputs = eval_engine(&engine, &validating_device(), &inputs[1]).unwrap();
    let classes = outputs[0].unwrap_i32().unwrap();
    assert_eq!(&[3, 1], classes.shape());
    assert!(classes.iter().all(|&c| (0..10).contains(&c)));
}
