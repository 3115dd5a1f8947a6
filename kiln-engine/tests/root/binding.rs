use std::sync::mpsc::channel;

use kiln_device::device::Device;
use kiln_device::error::{DeviceError, TransferError};
use kiln_device::stream::Stream;
use kiln_engine::builder::Builder;
use kiln_engine::context::ContextState;
use kiln_engine::error::{BindingError, KilnError};
use kiln_engine::io::IoBuffers;
use kiln_engine::networks::{conv_network, conv_profile, gather_nd_inputs, gather_nd_network, ConvVariant, CONV_INPUT};
use kiln_engine::runtime::Engine;
use kiln_engine::tester::assert_tensors_match;
use kiln_graph::cpu::cpu_eval_network;
use kiln_graph::dtype::{DTensor, Tensor};
use kiln_graph::ndarray::IxDyn;

use crate::root::runner::{prepare, run_prepared, validating_device};

fn gather_engine() -> Engine {
    let builder = Builder::new();
    let mut network = gather_nd_network().unwrap();
    builder.build_engine(&mut network, &builder.create_config()).unwrap()
}

#[test]
fn state_progression() {
    let engine = gather_engine();
    let device = validating_device();
    let mut context = engine.create_execution_context();

    // all inputs are static, so the shapes are known from the start
    assert_eq!(ContextState::ShapesSet, context.state());

    let stream = Stream::new(&device);
    let result = context.enqueue(&stream);
    assert!(matches!(result, Err(BindingError::AddressUnset(_))), "got {:?}", result);

    let mut buffers = prepare(&mut context, &device, &gather_nd_inputs());
    assert_eq!(ContextState::AddressesBound, context.state());

    run_prepared(&mut context, &stream, &mut buffers);
    assert_eq!(ContextState::Idle, context.state());

    // a second run reuses the bindings
    let outputs = run_prepared(&mut context, &stream, &mut buffers);
    assert_eq!(12.0, outputs[0].unwrap_f32().unwrap()[[0, 0]]);

    buffers.free().unwrap();
}

#[test]
fn unset_dynamic_shape() {
    let builder = Builder::new();
    let mut network = conv_network(ConvVariant::Dynamic, 2, 3, 3).unwrap();
    let mut config = builder.create_config();
    config.add_optimization_profile(conv_profile(2, 3, 3, 8));
    let engine = builder.build_engine(&mut network, &config).unwrap();

    let mut context = engine.create_execution_context();
    assert_eq!(ContextState::ShapesUnset, context.state());
    assert!(!context.all_input_shapes_specified());
    assert!(matches!(context.tensor_shape(CONV_INPUT), Err(BindingError::ShapeUnset(_))));

    let device = validating_device();
    let result = IoBuffers::allocate(&device, &context);
    assert!(matches!(result, Err(KilnError::Bind(BindingError::ShapeUnset(_)))));

    let stream = Stream::new(&device);
    let result = context.enqueue(&stream);
    assert!(matches!(result, Err(BindingError::ShapeUnset(_))), "got {:?}", result);
}

#[test]
fn unknown_names() {
    let engine = gather_engine();
    let device = validating_device();
    let mut context = engine.create_execution_context();

    assert_eq!(
        Err(BindingError::UnknownTensor("missing".to_owned())),
        context.set_input_shape("missing", [1])
    );
    let output = engine.tensor_name(2).unwrap().to_owned();
    assert_eq!(
        Err(BindingError::NotAnInput(output.clone())),
        context.set_input_shape(&output, [1, 2])
    );

    let buffer = device.alloc(16).unwrap();
    assert_eq!(
        Err(BindingError::UnknownTensor("missing".to_owned())),
        context.set_tensor_address("missing", buffer.ptr())
    );
}

#[test]
fn host_input_checks() {
    let engine = gather_engine();
    let device = validating_device();
    let context = engine.create_execution_context();
    let mut buffers = IoBuffers::allocate(&device, &context).unwrap();

    let wrong_shape = DTensor::F32(Tensor::zeros(IxDyn(&[2, 2])));
    let result = buffers.set_host_input("inputT0", wrong_shape);
    assert!(matches!(result, Err(KilnError::Transfer(TransferError::SizeMismatch { .. }))));

    let wrong_dtype = DTensor::I32(Tensor::zeros(IxDyn(&[1, 3, 4, 5])));
    let result = buffers.set_host_input("inputT0", wrong_dtype);
    assert!(matches!(result, Err(KilnError::Transfer(TransferError::SizeMismatch { .. }))));

    let output = engine.tensor_name(2).unwrap();
    let result = buffers.set_host_input(output, DTensor::F32(Tensor::zeros(IxDyn(&[1, 2]))));
    assert!(matches!(result, Err(KilnError::Bind(BindingError::NotAnInput(_)))));

    buffers.free().unwrap();
}

#[test]
fn freed_before_enqueue() {
    let engine = gather_engine();
    let device = validating_device();
    let mut context = engine.create_execution_context();
    let buffers = prepare(&mut context, &device, &gather_nd_inputs());
    buffers.free().unwrap();

    let stream = Stream::new(&device);
    let result = context.enqueue(&stream);
    assert!(
        matches!(
            result,
            Err(BindingError::InvalidAddress {
                source: TransferError::UseAfterFree(_),
                ..
            })
        ),
        "got {:?}",
        result
    );
}

#[test]
fn freed_while_in_flight() {
    let engine = gather_engine();
    let device = validating_device();
    let mut context = engine.create_execution_context();
    let buffers = prepare(&mut context, &device, &gather_nd_inputs());

    // keep the stream busy until the buffers are gone
    let stream = Stream::new(&device);
    let (sender, receiver) = channel::<()>();
    stream.enqueue(move || {
        let _ = receiver.recv();
        Ok(())
    });

    context.enqueue(&stream).unwrap();
    assert_eq!(ContextState::Running, context.state());
    assert_eq!(Err(BindingError::InFlight), context.enqueue(&stream));

    buffers.free().unwrap();
    sender.send(()).unwrap();

    let result = stream.synchronize();
    assert!(
        matches!(result, Err(DeviceError::Transfer(TransferError::UseAfterFree(_)))),
        "got {:?}",
        result
    );
    assert_eq!(ContextState::Idle, context.state());
}

#[test]
fn larger_batch_with_old_bindings() {
    let (channels, height, width) = (2, 3, 3);
    let builder = Builder::new();
    let mut network = conv_network(ConvVariant::Dynamic, channels, height, width).unwrap();
    let mut config = builder.create_config();
    config.add_optimization_profile(conv_profile(channels, height, width, 8));
    let engine = builder.build_engine(&mut network, &config).unwrap();

    let device = validating_device();
    let mut context = engine.create_execution_context();
    let input = DTensor::F32(Tensor::from_elem(IxDyn(&[2, channels, height, width]), 1.0));
    let mut buffers = prepare(&mut context, &device, &[input]);

    let stream = Stream::new(&device);
    run_prepared(&mut context, &stream, &mut buffers);

    // the shape is within the profile, but the buffers bound for batch 2 are too small
    context.set_input_shape(CONV_INPUT, [8, channels, height, width]).unwrap();
    let result = context.enqueue(&stream);
    assert!(
        matches!(
            result,
            Err(BindingError::InvalidAddress {
                source: TransferError::OutOfBounds { .. },
                ..
            })
        ),
        "got {:?}",
        result
    );
    assert_eq!(ContextState::Idle, context.state());

    buffers.free().unwrap();
}

#[test]
fn workspace_reserved_while_context_lives() {
    let (channels, height, width) = (2, 3, 3);
    let builder = Builder::new();
    let mut network = conv_network(ConvVariant::Dynamic, channels, height, width).unwrap();
    let mut config = builder.create_config();
    config.add_optimization_profile(conv_profile(channels, height, width, 4));
    let engine = builder.build_engine(&mut network, &config).unwrap();
    assert!(engine.workspace_size() > 0);

    let device = validating_device();
    let mut context = engine.create_execution_context();
    let input = DTensor::F32(Tensor::from_elem(IxDyn(&[1, channels, height, width]), 1.0));
    let mut buffers = prepare(&mut context, &device, &[input]);
    let io_bytes = device.used_bytes();

    let stream = Stream::new(&device);
    run_prepared(&mut context, &stream, &mut buffers);
    assert_eq!(io_bytes + engine.workspace_size(), device.used_bytes());

    drop(context);
    assert_eq!(io_bytes, device.used_bytes());
    buffers.free().unwrap();
}

#[test]
fn wrong_device() {
    let engine = gather_engine();
    let device = validating_device();
    let other = Device::new(1);

    let mut context = engine.create_execution_context();
    let buffers = prepare(&mut context, &other, &gather_nd_inputs());

    let stream = Stream::new(&device);
    let result = context.enqueue(&stream);
    assert!(
        matches!(
            result,
            Err(BindingError::InvalidAddress {
                source: TransferError::WrongDevice { .. },
                ..
            })
        ),
        "got {:?}",
        result
    );

    buffers.free().unwrap();
}

#[test]
fn concurrent_contexts() {
    let (channels, height, width) = (3, 5, 6);
    let builder = Builder::new();
    let mut network = conv_network(ConvVariant::Dynamic, channels, height, width).unwrap();
    let mut config = builder.create_config();
    config.add_optimization_profile(conv_profile(channels, height, width, 8));
    let engine = builder.build_engine(&mut network, &config).unwrap();

    let device = validating_device();
    let input = |batch: usize| {
        DTensor::F32(Tensor::from_shape_fn(IxDyn(&[batch, channels, height, width]), |idx| {
            (idx[0] + idx[1] * 2 + idx[2] * 3 + idx[3]) as f32 / 10.0
        }))
    };
    let input_a = input(1);
    let input_b = input(5);

    let mut context_a = engine.create_execution_context();
    let mut context_b = engine.create_execution_context();
    let mut buffers_a = prepare(&mut context_a, &device, &[input_a.clone()]);
    let mut buffers_b = prepare(&mut context_b, &device, &[input_b.clone()]);

    let stream_a = Stream::new(&device);
    let stream_b = Stream::new(&device);
    context_a.enqueue(&stream_a).unwrap();
    context_b.enqueue(&stream_b).unwrap();
    stream_a.synchronize().unwrap();
    stream_b.synchronize().unwrap();
    buffers_a.download_outputs().unwrap();
    buffers_b.download_outputs().unwrap();

    let expected_a = cpu_eval_network(&network, &[input_a]).unwrap().output_tensors();
    let expected_b = cpu_eval_network(&network, &[input_b]).unwrap().output_tensors();
    assert_tensors_match(&expected_a, &buffers_a.outputs(), false);
    assert_tensors_match(&expected_b, &buffers_b.outputs(), false);

    buffers_a.free().unwrap();
    buffers_b.free().unwrap();
}
