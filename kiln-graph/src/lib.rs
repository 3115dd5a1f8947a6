#![warn(missing_debug_implementations)]
#![allow(clippy::new_without_default)]

//! The network-construction half of Kiln: element types, symbolic shapes, layer descriptors,
//! the append-only [Network](network::Network) builder and reference CPU kernels for every layer.
//!
//! A small example, a batch of 10-class scores reduced to the top-1 class:
//! ```
//! # use kiln_graph::cpu::cpu_eval_network;
//! # use kiln_graph::dtype::{DTensor, DType, Tensor};
//! # use kiln_graph::layer::TopKOp;
//! # use kiln_graph::network::Network;
//! # use kiln_graph::shape;
//! # use kiln_graph::shape::Dim;
//! # use ndarray::IxDyn;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut network = Network::new();
//! let scores = network.declare_input("scores", DType::F32, shape![Dim::DYNAMIC, 10])?;
//! let topk = network.add_topk(scores, TopKOp::Max, 1, 1)?;
//! network.mark_output(network[topk].output(1))?;
//!
//! let batch = DTensor::F32(Tensor::zeros(IxDyn(&[4, 10])));
//! let outputs = cpu_eval_network(&network, &[batch])?.output_tensors();
//! assert_eq!(&[4, 1], outputs[0].shape());
//! # Ok(())
//! # }
//! ```

/// The [ndarray] crate is used for host tensor storage and CPU execution, and re-exported for convenience.
pub use ndarray;

/// The [DType](dtype::DType) enum and host tensors.
pub mod dtype;
/// Construction errors.
pub mod error;
/// Layer kinds, their attributes and shape inference.
pub mod layer;
/// The network builder.
pub mod network;
/// The [Shape](shape::Shape) type and utilities.
pub mod shape;

/// CPU network execution.
pub mod cpu;
