use kiln_device::device::{Device, DeviceConfig};
use kiln_device::stream::Stream;
use kiln_engine::builder::{Builder, BuilderConfig};
use kiln_engine::context::ExecutionContext;
use kiln_engine::io::IoBuffers;
use kiln_engine::runtime::Engine;
use kiln_engine::tester::check_engine;
use kiln_graph::dtype::DTensor;
use kiln_graph::network::Network;

pub fn validating_device() -> Device {
    Device::with_config(
        0,
        DeviceConfig {
            capacity_bytes: 1 << 30,
            validation: true,
        },
    )
}

/// Compile `network` with `config`, then check it against the CPU for each set of inputs.
pub fn test_network(network: &mut Network, config: &BuilderConfig, inputs: &[Vec<DTensor>]) -> Engine {
    println!("Testing:\n{}", network);

    let builder = Builder::new();
    let engine = builder.build_engine(network, config).unwrap();
    println!("Layers:\n{}", engine.layer_info().join("\n"));

    let device = validating_device();
    for inputs in inputs {
        check_engine(network, &engine, &device, inputs);
    }
    assert_eq!(0, device.live_allocations());

    engine
}

/// Set input shapes from `inputs`, allocate, upload and bind buffers. Does not enqueue anything yet.
pub fn prepare(context: &mut ExecutionContext, device: &Device, inputs: &[DTensor]) -> IoBuffers {
    let io = context.engine().io_tensors();
    for (tensor, input) in io.iter().zip(inputs) {
        context.set_input_shape(&tensor.name, input.concrete_shape()).unwrap();
    }

    let mut buffers = IoBuffers::allocate(device, context).unwrap();
    for (tensor, input) in io.iter().zip(inputs) {
        buffers.set_host_input(&tensor.name, input.clone()).unwrap();
    }
    buffers.upload_inputs().unwrap();
    buffers.bind(context).unwrap();
    buffers
}

/// Enqueue a prepared context, wait for it and download the outputs.
pub fn run_prepared(context: &mut ExecutionContext, stream: &Stream, buffers: &mut IoBuffers) -> Vec<DTensor> {
    context.enqueue(stream).unwrap();
    stream.synchronize().unwrap();
    buffers.download_outputs().unwrap();
    buffers.outputs()
}
