use std::path::{Path, PathBuf};

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use kiln_device::device::Device;
use kiln_device::stream::Stream;
use kiln_engine::builder::{Builder, MemoryPoolType};
use kiln_engine::io::IoBuffers;
use kiln_engine::networks::{classifier_network, classifier_profile, CLASSIFIER_INPUT};
use kiln_engine::runtime::{Engine, Runtime};
use kiln_engine::util::{debug_vec_multiline, format_io_table, init_logging};
use kiln_engine::KilnError;
use kiln_graph::dtype::{DTensor, Tensor};
use kiln_graph::ndarray::IxDyn;

/// Build the two-convolution digit classifier, run one batch of random images and print the predicted classes.
#[derive(Debug, Parser)]
struct Args {
    /// Device ordinal.
    #[clap(long, default_value_t = 0)]
    device: u32,
    /// Number of images, must be in 1..=16.
    #[clap(long, default_value_t = 4)]
    batch: usize,
    /// Workspace limit in bytes.
    #[clap(long, default_value_t = 3 << 30)]
    workspace: usize,
    /// Seed for the weights and the input images.
    #[clap(long, default_value_t = 0)]
    seed: u64,
    /// Print the network before compiling it.
    #[clap(long)]
    print: bool,
    /// Write the serialized plan to this path and run the engine loaded back from it.
    #[clap(long)]
    plan: Option<PathBuf>,
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
    let mut rng = StdRng::seed_from_u64(args.seed);

    let builder = Builder::new();
    let mut network = classifier_network(&mut rng)?;
    if args.print {
        println!("{}", network);
    }

    let mut config = builder.create_config();
    config.set_memory_pool_limit(MemoryPoolType::Workspace, args.workspace);
    config.add_optimization_profile(classifier_profile());

    let mut engine = builder.build_engine(&mut network, &config)?;
    println!(
        "Engine with {} layers, {} bytes of workspace",
        engine.num_layers(),
        engine.workspace_size()
    );
    println!("{:?}", debug_vec_multiline("  ", &engine.layer_info()));

    if let Some(path) = &args.plan {
        engine = save_and_reload(&engine, path)?;
    }

    let mut context = engine.create_execution_context();
    context.set_input_shape(CLASSIFIER_INPUT, [args.batch, 1, 28, 28])?;
    print!("{}", format_io_table(&context));

    let images = Tensor::from_shape_fn(IxDyn(&[args.batch, 1, 28, 28]), |_| rng.gen::<f32>());

    let device = Device::new(args.device);
    let mut buffers = IoBuffers::allocate(&device, &context)?;
    buffers.set_host_input(CLASSIFIER_INPUT, DTensor::F32(images.into_shared()))?;
    buffers.upload_inputs()?;
    buffers.bind(&mut context)?;

    let stream = Stream::new(&device);
    context.enqueue(&stream)?;
    stream.synchronize()?;
    buffers.download_outputs()?;

    for output in buffers.outputs() {
        println!("Predicted classes: {}", output);
    }

    buffers.free()
}

fn save_and_reload(engine: &Engine, path: &Path) -> Result<Engine, KilnError> {
    let len = engine.save(path)?;
    println!("Wrote {} byte plan to {:?}", len, path);
    Runtime::new().load_engine(path)
}
