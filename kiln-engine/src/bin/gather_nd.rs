use clap::Parser;

use kiln_device::device::Device;
use kiln_device::stream::Stream;
use kiln_engine::builder::Builder;
use kiln_engine::io::IoBuffers;
use kiln_engine::networks::{gather_nd_inputs, gather_nd_network};
use kiln_engine::runtime::Runtime;
use kiln_engine::util::{format_io_table, init_logging};
use kiln_engine::KilnError;

/// Gather index tuples from a small 4D tensor in ND mode and print every buffer.
#[derive(Debug, Parser)]
struct Args {
    /// Device ordinal.
    #[clap(long, default_value_t = 0)]
    device: u32,
    /// Log filter, overrides RUST_LOG.
    #[clap(long)]
    log: Option<String>,
}

fn main() {
    let args = Args::parse();
    init_logging(args.log.as_deref());

    if let Err(e) = run(&args) {
        eprintln!("Failed at stage {}: {}", e.stage(), e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), KilnError> {
    let builder = Builder::new();
    let mut network = gather_nd_network()?;
    let plan = builder.build_serialized_network(&mut network, &builder.create_config())?;
    let engine = Runtime::new().deserialize_engine(&plan)?;

    let mut context = engine.create_execution_context();
    let inputs = gather_nd_inputs();
    for (tensor, input) in engine.io_tensors().iter().zip(&inputs) {
        context.set_input_shape(&tensor.name, input.concrete_shape())?;
    }
    print!("{}", format_io_table(&context));

    let device = Device::new(args.device);
    let mut buffers = IoBuffers::allocate(&device, &context)?;
    for (tensor, input) in engine.io_tensors().iter().zip(inputs) {
        buffers.set_host_input(&tensor.name, input)?;
    }
    buffers.upload_inputs()?;
    buffers.bind(&mut context)?;

    let stream = Stream::new(&device);
    context.enqueue(&stream)?;
    stream.synchronize()?;
    buffers.download_outputs()?;

    for (name, entry) in buffers.entries() {
        println!("{}", name);
        println!("{}", entry.host);
    }

    buffers.free()
}
