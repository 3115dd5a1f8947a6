use clap::{Parser, ValueEnum};

use kiln_device::device::Device;
use kiln_engine::builder::{Builder, MemoryPoolType};
use kiln_engine::networks::{conv_network, conv_profile, ConvVariant, CONV_INPUT};
use kiln_engine::tester::eval_engine;
use kiln_engine::util::init_logging;
use kiln_engine::KilnError;
use kiln_graph::dtype::{DTensor, Tensor};
use kiln_graph::ndarray::IxDyn;

#[derive(Debug, Copy, Clone, ValueEnum)]
enum Variant {
    Static,
    Dynamic,
    Qdq,
}

/// Run a single 3x3 convolution on an all-ones input, as a static, dynamic or quantized network.
#[derive(Debug, Parser)]
struct Args {
    #[clap(value_enum, default_value_t = Variant::Static)]
    variant: Variant,
    /// Device ordinal.
    #[clap(long, default_value_t = 0)]
    device: u32,
    #[clap(long, default_value_t = 4)]
    channels: usize,
    #[clap(long, default_value_t = 4)]
    height: usize,
    #[clap(long, default_value_t = 8)]
    width: usize,
    /// Largest batch size accepted by the dynamic variants.
    #[clap(long, default_value_t = 2048)]
    max_batch: usize,
    /// Batch size of the run.
    #[clap(long, default_value_t = 1)]
    batch: usize,
    /// Workspace limit in bytes.
    #[clap(long, default_value_t = 1 << 30)]
    workspace: usize,
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
    let variant = match args.variant {
        Variant::Static => ConvVariant::Static,
        Variant::Dynamic => ConvVariant::Dynamic,
        Variant::Qdq => ConvVariant::Qdq,
    };
    let batch = match variant {
        ConvVariant::Static => 1,
        ConvVariant::Dynamic | ConvVariant::Qdq => args.batch,
    };

    let builder = Builder::new();
    let mut network = conv_network(variant, args.channels, args.height, args.width)?;

    let mut config = builder.create_config();
    config.set_memory_pool_limit(MemoryPoolType::Workspace, args.workspace);
    if variant != ConvVariant::Static {
        config.add_optimization_profile(conv_profile(args.channels, args.height, args.width, args.max_batch));
    }
    let engine = builder.build_engine(&mut network, &config)?;

    for tensor in engine.io_tensors() {
        println!("{} {} {} {}", tensor.mode, tensor.name, tensor.dtype, tensor.shape);
    }

    let device = Device::new(args.device);
    println!("Using {}", device.name());

    let shape = [batch, args.channels, args.height, args.width];
    let input = DTensor::F32(Tensor::from_elem(IxDyn(&shape), 1.0));
    let outputs = eval_engine(&engine, &device, &[input])?;

    println!("{} [{:?}]", CONV_INPUT, shape);
    for output in outputs {
        println!("{}", output);
    }
    Ok(())
}
