use kiln_engine::builder::{Builder, OptimizationProfile};
use kiln_engine::error::{BindingError, BuildError};
use kiln_engine::networks::{conv_network, ConvVariant, CONV_INPUT};
use kiln_engine::runtime::Engine;
use kiln_engine::tester::assert_tensors_match;
use kiln_device::stream::Stream;
use kiln_graph::cpu::cpu_eval_network;
use kiln_graph::dtype::{DTensor, Tensor};
use kiln_graph::ndarray::IxDyn;
use kiln_graph::shape::ConcreteShape;

use crate::root::runner::{prepare, run_prepared, validating_device};

fn batch_profile(min: usize, opt: usize, max: usize) -> OptimizationProfile {
    let mut profile = OptimizationProfile::default();
    profile.set_shape(CONV_INPUT, [min, 2, 3, 3], [opt, 2, 3, 3], [max, 2, 3, 3]);
    profile
}

fn two_profile_engine() -> (kiln_graph::network::Network, Engine) {
    let builder = Builder::new();
    let mut network = conv_network(ConvVariant::Dynamic, 2, 3, 3).unwrap();
    let mut config = builder.create_config();
    assert_eq!(0, config.add_optimization_profile(batch_profile(1, 2, 4)));
    assert_eq!(1, config.add_optimization_profile(batch_profile(8, 12, 16)));
    let engine = builder.build_engine(&mut network, &config).unwrap();
    (network, engine)
}

#[test]
fn profile_queries() {
    let (_, engine) = two_profile_engine();
    assert_eq!(2, engine.num_optimization_profiles());

    let [min, opt, max] = engine.profile_shape(CONV_INPUT, 1).unwrap();
    assert_eq!(ConcreteShape::from([8, 2, 3, 3]), min);
    assert_eq!(ConcreteShape::from([12, 2, 3, 3]), opt);
    assert_eq!(ConcreteShape::from([16, 2, 3, 3]), max);

    assert!(matches!(
        engine.profile_shape(CONV_INPUT, 2),
        Err(BindingError::InvalidProfileIndex { index: 2, count: 2 })
    ));
    assert!(matches!(
        engine.profile_shape("missing", 0),
        Err(BindingError::UnknownTensor(_))
    ));
}

#[test]
fn switch_profile() {
    let (network, engine) = two_profile_engine();
    let mut context = engine.create_execution_context();
    assert_eq!(0, context.optimization_profile());

    context.set_input_shape(CONV_INPUT, [4, 2, 3, 3]).unwrap();
    assert!(context.all_input_shapes_specified());

    assert_eq!(
        Err(BindingError::InvalidProfileIndex { index: 2, count: 2 }),
        context.set_optimization_profile(2)
    );

    // switching forgets the dynamic shapes
    context.set_optimization_profile(1).unwrap();
    assert!(!context.all_input_shapes_specified());
    assert!(matches!(
        context.set_input_shape(CONV_INPUT, [4, 2, 3, 3]),
        Err(BindingError::ShapeOutOfProfile { .. })
    ));

    let input = DTensor::F32(Tensor::from_shape_fn(IxDyn(&[10, 2, 3, 3]), |idx| idx[0] as f32 - idx[3] as f32));
    let device = validating_device();
    let stream = Stream::new(&device);
    let mut buffers = prepare(&mut context, &device, &[input.clone()]);
    let outputs = run_prepared(&mut context, &stream, &mut buffers);

    let expected = cpu_eval_network(&network, &[input]).unwrap().output_tensors();
    assert_tensors_match(&expected, &outputs, false);
    buffers.free().unwrap();
}

#[test]
fn invalid_profiles() {
    let builder = Builder::new();

    let mut config = builder.create_config();
    config.add_optimization_profile(batch_profile(4, 2, 8));
    let mut network = conv_network(ConvVariant::Dynamic, 2, 3, 3).unwrap();
    assert!(matches!(
        builder.build_engine(&mut network, &config),
        Err(BuildError::InvalidProfile { profile: 0, .. })
    ));

    let mut config = builder.create_config();
    config.add_optimization_profile(batch_profile(1, 1, 1));
    let mut profile = OptimizationProfile::default();
    profile.set_shape(CONV_INPUT, [1, 3, 3, 3], [1, 3, 3, 3], [1, 3, 3, 3]);
    config.add_optimization_profile(profile);
    let mut network = conv_network(ConvVariant::Dynamic, 2, 3, 3).unwrap();
    assert!(matches!(
        builder.build_engine(&mut network, &config),
        Err(BuildError::InvalidProfile { profile: 1, .. })
    ));

    let mut network = conv_network(ConvVariant::Dynamic, 2, 3, 3).unwrap();
    assert!(matches!(
        builder.build_engine(&mut network, &builder.create_config()),
        Err(BuildError::MissingProfile { profile: 0, .. })
    ));
}
