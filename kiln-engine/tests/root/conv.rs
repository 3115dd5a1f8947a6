use kiln_engine::builder::{Builder, MemoryPoolType};
use kiln_engine::error::BuildError;
use kiln_engine::networks::{conv_network, conv_profile, ConvVariant};
use kiln_engine::tester::{assert_tensors_match, eval_engine};
use kiln_graph::dtype::{DTensor, Tensor};
use kiln_graph::ndarray::IxDyn;

use crate::root::runner::{test_network, validating_device};

fn ones(batch: usize, channels: usize, height: usize, width: usize) -> DTensor {
    DTensor::F32(Tensor::from_elem(IxDyn(&[batch, channels, height, width]), 1.0))
}

/// The all-ones 3x3 convolution of an all-ones input counts the in-bounds neighbours of each pixel.
fn expected_ones(batch: usize, channels: usize, height: usize, width: usize) -> DTensor {
    let count = |i: usize, len: usize| 1 + (i > 0) as usize + (i + 1 < len) as usize;
    DTensor::F32(Tensor::from_shape_fn(IxDyn(&[batch, channels, height, width]), |idx| {
        (channels * count(idx[2], height) * count(idx[3], width)) as f32
    }))
}

#[test]
fn static_conv() {
    let mut network = conv_network(ConvVariant::Static, 4, 4, 8).unwrap();
    let engine = test_network(&mut network, &Builder::new().create_config(), &[vec![ones(1, 4, 4, 8)]]);

    let outputs = eval_engine(&engine, &validating_device(), &[ones(1, 4, 4, 8)]).unwrap();
    assert_tensors_match(&[expected_ones(1, 4, 4, 8)], &outputs, false);
}

#[test]
fn dynamic_conv() {
    let builder = Builder::new();
    let mut network = conv_network(ConvVariant::Dynamic, 4, 4, 8).unwrap();
    let mut config = builder.create_config();
    config.add_optimization_profile(conv_profile(4, 4, 8, 16));

    let engine = test_network(&mut network, &config, &[vec![ones(1, 4, 4, 8)], vec![ones(16, 4, 4, 8)]]);

    let outputs = eval_engine(&engine, &validating_device(), &[ones(7, 4, 4, 8)]).unwrap();
    assert_tensors_match(&[expected_ones(7, 4, 4, 8)], &outputs, false);
}

#[test]
fn qdq_conv() {
    let builder = Builder::new();
    let mut network = conv_network(ConvVariant::Qdq, 4, 4, 8).unwrap();
    let mut config = builder.create_config();
    config.add_optimization_profile(conv_profile(4, 4, 8, 4));

    let engine = test_network(&mut network, &config, &[vec![ones(2, 4, 4, 8)]]);

    // every intermediate value is exactly representable on the int8 grids
    let outputs = eval_engine(&engine, &validating_device(), &[ones(2, 4, 4, 8)]).unwrap();
    assert_tensors_match(&[expected_ones(2, 4, 4, 8)], &outputs, false);
}

#[test]
fn static_conv_without_workspace() {
    let builder = Builder::new();
    let mut network = conv_network(ConvVariant::Static, 4, 4, 8).unwrap();
    let mut config = builder.create_config();
    config.set_memory_pool_limit(MemoryPoolType::Workspace, 16);

    let result = builder.build_engine(&mut network, &config);
    assert!(
        matches!(result, Err(BuildError::InsufficientWorkspace { available: 16, .. })),
        "got {:?}",
        result.map(|_| ())
    );
}
