#![warn(missing_debug_implementations)]
#![allow(clippy::new_without_default)]

//! Compiles [kiln_graph] networks into immutable engines and runs them on a [kiln_device] device.
//!
//! The flow is always the same: build a [Network](kiln_graph::network::Network), compile it with a
//! [Builder](builder::Builder) into an [Engine](runtime::Engine), create an
//! [ExecutionContext](context::ExecutionContext), set the input shapes, bind device addresses and enqueue on a
//! [Stream](kiln_device::stream::Stream).
//!
//! ```
//! # use kiln_device::device::Device;
//! # use kiln_engine::builder::Builder;
//! # use kiln_engine::tester::eval_engine;
//! # use kiln_graph::dtype::{DTensor, DType, Tensor};
//! # use kiln_graph::layer::ActivationType;
//! # use kiln_graph::ndarray::IxDyn;
//! # use kiln_graph::shape;
//! # fn main() -> Result<(), kiln_engine::error::KilnError> {
//! let builder = Builder::new();
//! let mut network = builder.create_network();
//! let x = network.declare_input("x", DType::F32, shape![2, 2])?;
//! let relu = network.add_activation(x, ActivationType::Relu)?;
//! network.mark_output(network[relu].output(0))?;
//!
//! let engine = builder.build_engine(&mut network, &builder.create_config())?;
//!
//! let device = Device::new(0);
//! let input = DTensor::F32(Tensor::from_shape_vec(IxDyn(&[2, 2]), vec![-1.0, 2.0, -3.0, 4.0]).unwrap());
//! let outputs = eval_engine(&engine, &device, &[input])?;
//! assert_eq!(&[0.0, 2.0, 0.0, 4.0], outputs[0].to_f32().as_slice().unwrap());
//! # Ok(())
//! # }
//! ```

/// Network compilation entry point and build configuration.
pub mod builder;
/// Per-run state: shapes, bindings and enqueueing.
pub mod context;
/// Error types for every stage.
pub mod error;
/// Host/device buffer pairs for the I/O tensors of an engine.
pub mod io;
/// Ready-made demo and test networks.
pub mod networks;
/// The compiled plan and its binary format.
pub mod plan;
/// Engine loading and queries.
pub mod runtime;
/// Kernel selection and execution of single layers.
pub mod step;
/// Testing and debugging infrastructure.
pub mod tester;
/// Miscellaneous utilities.
pub mod util;

mod planner;

pub use error::KilnError;
