//! Ready-made networks used by the demo binaries and the integration tests.

use itertools::Itertools;
use rand::Rng;

use kiln_graph::cpu::quantize_i8;
use kiln_graph::dtype::{DTensor, DType, Tensor};
use kiln_graph::error::ConstructionResult;
use kiln_graph::layer::*;
use kiln_graph::ndarray::IxDyn;
use kiln_graph::network::{Network, TensorId};
use kiln_graph::shape;
use kiln_graph::shape::Dim;

use crate::builder::OptimizationProfile;

pub const GATHER_DATA_SHAPE: [usize; 4] = [1, 3, 4, 5];

/// Gather coordinate tuples `(c, h, w)` from a `(1, 3, 4, 5)` tensor, the second tuple is out of range.
pub fn gather_nd_network() -> ConstructionResult<Network> {
    let mut network = Network::new();
    let data = network.declare_input("inputT0", DType::F32, shape![1, 3, 4, 5])?;
    let indices = network.declare_input("inputT1", DType::I32, shape![2, 3])?;
    let gather = network.add_gather(data, indices, 1, GatherMode::Nd)?;
    network.mark_output(network[gather].output(0))?;
    Ok(network)
}

/// The data tensor with `data[0, c, h, w] = c * 100 + h * 10 + w` and the index tensor `[[0, 1, 2], [0, 2, -1]]`.
pub fn gather_nd_inputs() -> [DTensor; 2] {
    let data = Tensor::from_shape_fn(IxDyn(&GATHER_DATA_SHAPE), |idx| {
        (idx[1] * 100 + idx[2] * 10 + idx[3]) as f32
    });
    let indices = Tensor::from_shape_vec(IxDyn(&[2, 3]), vec![0, 1, 2, 0, 2, -1])
        .expect("index data matches its shape");
    [DTensor::F32(data.into_shared()), DTensor::I32(indices.into_shared())]
}

pub const CLASSIFIER_INPUT: &str = "inputT0";

/// A two-convolution classifier for 28x28 single channel images, returning the top-1 class index per image.
///
/// All weights are drawn uniformly from `[0, 1)`.
pub fn classifier_network(rng: &mut impl Rng) -> ConstructionResult<Network> {
    let mut network = Network::new();
    let input = network.declare_input(CLASSIFIER_INPUT, DType::F32, shape![Dim::DYNAMIC, 1, 28, 28])?;

    let x = conv_relu_pool(&mut network, input, 1, 32, rng)?;
    let x = conv_relu_pool(&mut network, x, 32, 64, rng)?;

    let flatten = ShuffleAttrs::new()
        .with_first_transpose(vec![0, 2, 3, 1])
        .with_reshape(vec![-1, 64 * 7 * 7]);
    let flat = network.add_shuffle(x, flatten)?;
    let x = network[flat].output(0);

    let x = dense(&mut network, x, 64 * 7 * 7, 1024, rng)?;
    let relu = network.add_activation(x, ActivationType::Relu)?;
    let x = network[relu].output(0);
    let logits = dense(&mut network, x, 1024, 10, rng)?;

    let softmax = network.add_softmax(logits, 1)?;
    let topk = network.add_topk(network[softmax].output(0), TopKOp::Max, 1, 1)?;
    network.mark_output(network[topk].output(1))?;

    Ok(network)
}

/// Batch sizes 1 to 16, tuned for 4.
pub fn classifier_profile() -> OptimizationProfile {
    let mut profile = OptimizationProfile::default();
    profile.set_shape(CLASSIFIER_INPUT, [1, 1, 28, 28], [4, 1, 28, 28], [16, 1, 28, 28]);
    profile
}

fn random_weights(rng: &mut impl Rng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen::<f32>()).collect_vec()
}

fn conv_relu_pool(
    network: &mut Network,
    input: TensorId,
    input_channels: usize,
    output_channels: usize,
    rng: &mut impl Rng,
) -> ConstructionResult<TensorId> {
    let kernel = random_weights(rng, output_channels * input_channels * 5 * 5);
    let bias = random_weights(rng, output_channels);
    let attrs = ConvolutionAttrs::new(output_channels, [5, 5], kernel, Some(bias.into())).with_padding([2, 2]);

    let conv = network.add_convolution(input, attrs)?;
    let relu = network.add_activation(network[conv].output(0), ActivationType::Relu)?;
    let pool = network.add_pooling(
        network[relu].output(0),
        PoolingAttrs::new(PoolingType::Max, [2, 2]).with_stride([2, 2]),
    )?;
    Ok(network[pool].output(0))
}

fn dense(
    network: &mut Network,
    input: TensorId,
    inputs: usize,
    outputs: usize,
    rng: &mut impl Rng,
) -> ConstructionResult<TensorId> {
    let weight = network.add_constant([inputs, outputs], random_weights(rng, inputs * outputs))?;
    let bias = network.add_constant([1, outputs], random_weights(rng, outputs))?;

    let mat_mul = network.add_matrix_multiply(
        input,
        MatrixOp::None,
        network[weight].output(0),
        MatrixOp::None,
    )?;
    let sum = network.add_elementwise(network[mat_mul].output(0), network[bias].output(0), ElementWiseOp::Sum)?;
    Ok(network[sum].output(0))
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConvVariant {
    /// Fixed batch size of 1.
    Static,
    /// Dynamic batch size, see [conv_profile].
    Dynamic,
    /// Dynamic batch size with int8 quantize/dequantize pairs around the convolution.
    Qdq,
}

pub const CONV_INPUT: &str = "input0";

/// Step sizes of the int8 grid used by [ConvVariant::Qdq], for the input and kernel, and for the output.
pub const QDQ_INPUT_STEP: f32 = 1.0 / 35.0;
pub const QDQ_OUTPUT_STEP: f32 = 1.0 / 3.0;

/// A single 3x3 `SameLower` convolution with all-ones kernel and zero bias over `channels` channels.
pub fn conv_network(variant: ConvVariant, channels: usize, height: usize, width: usize) -> ConstructionResult<Network> {
    let mut network = Network::new();
    let batch = match variant {
        ConvVariant::Static => Dim::Fixed(1),
        ConvVariant::Dynamic | ConvVariant::Qdq => Dim::DYNAMIC,
    };
    let input = network.declare_input(CONV_INPUT, DType::F32, shape![batch, channels, height, width])?;

    let mut kernel = vec![1.0; channels * channels * 3 * 3];
    let bias = vec![0.0; channels];

    let x = match variant {
        ConvVariant::Qdq => {
            // the kernel is a build-time constant, so it is fake-quantized on the host
            for w in &mut kernel {
                *w = quantize_i8(*w / QDQ_INPUT_STEP) as f32 * QDQ_INPUT_STEP;
            }
            quantize_dequantize(&mut network, input, QDQ_INPUT_STEP)?
        }
        ConvVariant::Static | ConvVariant::Dynamic => input,
    };

    let attrs = ConvolutionAttrs::new(channels, [3, 3], kernel, Some(bias.into())).with_padding_mode(PaddingMode::SameLower);
    let conv = network.add_convolution(x, attrs)?;
    let mut output = network[conv].output(0);

    if variant == ConvVariant::Qdq {
        output = quantize_dequantize(&mut network, output, QDQ_OUTPUT_STEP)?;
    }

    network.mark_output(output)?;
    Ok(network)
}

/// Batch sizes 1 to `max_batch`.
pub fn conv_profile(channels: usize, height: usize, width: usize, max_batch: usize) -> OptimizationProfile {
    let mut profile = OptimizationProfile::default();
    profile.set_shape(
        CONV_INPUT,
        [1, channels, height, width],
        [max_batch, channels, height, width],
        [max_batch, channels, height, width],
    );
    profile
}

/// Round `input` to the int8 grid with the given step size and convert back to float.
pub fn quantize_dequantize(network: &mut Network, input: TensorId, step: f32) -> ConstructionResult<TensorId> {
    let quantize = ScaleAttrs::new(ScaleMode::Uniform)
        .with_scale(vec![1.0 / step])
        .with_output_dtype(DType::I8);
    let quantized = network.add_scale(input, quantize)?;

    let dequantize = ScaleAttrs::new(ScaleMode::Uniform).with_scale(vec![step]);
    let dequantized = network.add_scale(network[quantized].output(0), dequantize)?;
    Ok(network[dequantized].output(0))
}
