use std::fmt::{Debug, Formatter};

use indexmap::IndexMap;
use itertools::{zip_eq, Itertools};
use ndarray::{s, Array2, Array3, Array4, ArrayD, ArrayView2, ArrayView4, Axis, Dimension, Ix4, IxDyn, Zip};
use num_traits::Zero;

use crate::dispatch_dtensor;
use crate::dtype::{DTensor, DType, Tensor};
use crate::error::{ConstructionError, ConstructionResult};
use crate::layer::*;
use crate::network::{Network, TensorId};
use crate::shape::{ConcreteShape, Shape};

/// Evaluate a network on the host, layer by layer.
///
/// This is the reference the compiled engine is checked against. Inputs are given in declaration order and must
/// fit the declared shapes.
pub fn cpu_eval_network(network: &Network, inputs: &[DTensor]) -> ConstructionResult<ExecutionInfo> {
    if network.inputs().len() != inputs.len() {
        return Err(ConstructionError::InputCount {
            layer: "Network",
            expected: network.inputs().len(),
            actual: inputs.len(),
        });
    }

    let mut values: IndexMap<TensorId, DTensor> = IndexMap::default();

    for (index, (&id, tensor)) in zip_eq(network.inputs(), inputs).enumerate() {
        let info = &network[id];
        if info.desc.dtype != tensor.dtype() {
            return Err(ConstructionError::UnsupportedDType {
                layer: "Network",
                index,
                dtype: tensor.dtype(),
            });
        }
        if !info.desc.shape.contains(&tensor.concrete_shape()) {
            return Err(ConstructionError::InvalidInputShape {
                name: info.name.clone(),
                shape: tensor.concrete_shape().to_string(),
            });
        }
        values.insert(id, tensor.clone());
    }

    for layer in network.layers() {
        let info = &network[layer];
        let layer_inputs = info.inputs.iter().map(|i| values[i].clone()).collect_vec();
        let layer_outputs = run_layer(&info.kind, &layer_inputs)?;

        for (&id, tensor) in zip_eq(&info.outputs, layer_outputs) {
            let prev = values.insert(id, tensor);
            assert!(prev.is_none(), "Tensor {:?} computed twice", id);
        }
    }

    Ok(ExecutionInfo {
        values,
        outputs: network.outputs().to_vec(),
    })
}

pub struct ExecutionInfo {
    pub values: IndexMap<TensorId, DTensor>,
    pub outputs: Vec<TensorId>,
}

impl ExecutionInfo {
    pub fn output_tensors(self) -> Vec<DTensor> {
        self.outputs.iter().map(|v| self.values[v].clone()).collect_vec()
    }
}

impl Debug for ExecutionInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let shapes = self
            .values
            .iter()
            .map(|(k, v)| (*k, (v.dtype(), v.concrete_shape())))
            .collect_vec();
        f.debug_struct("ExecutionInfo")
            .field("values", &shapes)
            .field("outputs", &self.outputs)
            .finish()
    }
}

/// Run a single layer on host tensors.
///
/// The inputs are validated with the same shape inference used during network construction, so any error here is
/// a [ConstructionError] describing the mismatch.
pub fn run_layer(kind: &LayerKind, inputs: &[DTensor]) -> ConstructionResult<Vec<DTensor>> {
    let descs = inputs
        .iter()
        .map(|x| TensorDesc {
            dtype: x.dtype(),
            shape: Shape::fixed(x.shape()),
        })
        .collect_vec();
    let output_descs = kind.infer(&descs)?;
    let output_shapes = output_descs
        .iter()
        .map(|d| {
            d.shape.as_fixed().ok_or_else(|| {
                ConstructionError::shape(kind.type_name(), format!("output shape {} is not fixed", d.shape))
            })
        })
        .collect::<ConstructionResult<Vec<ConcreteShape>>>()?;
    let out_shape = &output_shapes[0];

    let outputs = match kind {
        LayerKind::Constant(attrs) => {
            let tensor = Tensor::from_shape_vec(IxDyn(&attrs.shape.dims), attrs.weights.0.clone())
                .expect("weight count checked by shape inference");
            vec![DTensor::F32(tensor)]
        }
        LayerKind::Gather(attrs) => {
            let indices = inputs[1].to_indices().expect("index dtype checked by shape inference");
            let result = dispatch_dtensor!(&inputs[0], |_T, f, data| f(gather(data, &indices, attrs, out_shape)));
            vec![result]
        }
        LayerKind::Convolution(attrs) => {
            vec![DTensor::F32(convolution(attrs, &inputs[0].to_f32(), out_shape))]
        }
        LayerKind::Pooling(attrs) => {
            vec![DTensor::F32(pooling(attrs, &inputs[0].to_f32(), out_shape))]
        }
        LayerKind::Activation(activation) => {
            let activation = *activation;
            vec![DTensor::F32(inputs[0].to_f32().mapv(|x| activation.apply(x)).into_shared())]
        }
        LayerKind::ElementWise(op) => {
            let op = *op;
            let result = match (&inputs[0], &inputs[1]) {
                (DTensor::F32(left), DTensor::F32(right)) => {
                    DTensor::F32(elementwise(left, right, out_shape, |a, b| op.apply_f32(a, b)))
                }
                (DTensor::I32(left), DTensor::I32(right)) => {
                    DTensor::I32(elementwise(left, right, out_shape, |a, b| op.apply_i32(a, b)))
                }
                _ => unreachable!("dtypes checked by shape inference"),
            };
            vec![result]
        }
        LayerKind::MatMul(attrs) => {
            vec![DTensor::F32(mat_mul(attrs, &inputs[0].to_f32(), &inputs[1].to_f32(), out_shape))]
        }
        LayerKind::Softmax(attrs) => {
            vec![DTensor::F32(softmax(&inputs[0].to_f32(), attrs.axis))]
        }
        LayerKind::TopK(attrs) => {
            let (values, indices) = top_k(attrs, &inputs[0].to_f32(), out_shape);
            vec![DTensor::F32(values), DTensor::I32(indices)]
        }
        LayerKind::Shuffle(attrs) => {
            let result = dispatch_dtensor!(&inputs[0], |_T, f, input| f(shuffle(input, attrs, out_shape)));
            vec![result]
        }
        LayerKind::Scale(attrs) => vec![scale(attrs, &inputs[0].to_f32())],
    };

    for ((output, desc), shape) in zip_eq(zip_eq(&outputs, &output_descs), &output_shapes) {
        assert_eq!(desc.dtype, output.dtype(), "Wrong output dtype for {}", kind.type_name());
        assert_eq!(&shape.dims, output.shape(), "Wrong output shape for {}", kind.type_name());
    }

    Ok(outputs)
}

impl ActivationType {
    pub fn apply(self, x: f32) -> f32 {
        match self {
            ActivationType::Relu => x.max(0.0),
            ActivationType::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            ActivationType::Tanh => x.tanh(),
            ActivationType::LeakyRelu { alpha } => {
                if x >= 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            ActivationType::Clip { min, max } => x.clamp(min, max),
        }
    }
}

impl ElementWiseOp {
    pub fn apply_f32(self, a: f32, b: f32) -> f32 {
        match self {
            ElementWiseOp::Sum => a + b,
            ElementWiseOp::Sub => a - b,
            ElementWiseOp::Prod => a * b,
            ElementWiseOp::Div => a / b,
            ElementWiseOp::Min => a.min(b),
            ElementWiseOp::Max => a.max(b),
            ElementWiseOp::Pow => a.powf(b),
        }
    }

    /// Integer variant, wrapping on overflow. Division by zero yields zero.
    pub fn apply_i32(self, a: i32, b: i32) -> i32 {
        match self {
            ElementWiseOp::Sum => a.wrapping_add(b),
            ElementWiseOp::Sub => a.wrapping_sub(b),
            ElementWiseOp::Prod => a.wrapping_mul(b),
            ElementWiseOp::Div => a.checked_div(b).unwrap_or(0),
            ElementWiseOp::Min => a.min(b),
            ElementWiseOp::Max => a.max(b),
            ElementWiseOp::Pow => unreachable!("pow is float only"),
        }
    }
}

fn gather<T: Copy + Zero>(data: &Tensor<T>, indices: &Tensor<i64>, attrs: &GatherAttrs, out_shape: &ConcreteShape) -> Tensor<T> {
    let mut out_of_range = 0;
    let result = Tensor::from_shape_fn(IxDyn(&out_shape.dims), |idx| {
        match gather_source(attrs, data.shape(), indices, idx.slice()) {
            Some(coord) => data[coord.as_slice()],
            None => {
                out_of_range += 1;
                T::zero()
            }
        }
    });

    if out_of_range > 0 {
        tracing::warn!(
            "Gather produced {} zero elements for out-of-range indices (mode {:?}, axis {})",
            out_of_range,
            attrs.mode,
            attrs.axis
        );
    }
    result
}

/// Map an output coordinate to the data coordinate it is read from, `None` if the index is out of range.
fn gather_source(attrs: &GatherAttrs, data_shape: &[usize], indices: &Tensor<i64>, out: &[usize]) -> Option<Vec<usize>> {
    let GatherAttrs {
        axis,
        mode,
        num_elementwise_dims: b,
    } = *attrs;
    let q = indices.ndim();
    let checked = |value: i64, size: usize| (value >= 0 && (value as usize) < size).then(|| value as usize);

    match mode {
        GatherMode::Default => {
            let m = q - b;
            let mut index_coord = out[..b].to_vec();
            index_coord.extend_from_slice(&out[axis..axis + m]);
            let i = checked(indices[index_coord.as_slice()], data_shape[axis])?;

            let mut coord = out[..axis].to_vec();
            coord.push(i);
            coord.extend_from_slice(&out[axis + m..]);
            Some(coord)
        }
        GatherMode::Element => {
            let i = checked(indices[out], data_shape[axis])?;
            let mut coord = out.to_vec();
            coord[axis] = i;
            Some(coord)
        }
        GatherMode::Nd => {
            let k = indices.shape()[q - 1];
            let m = q - 1 - b;
            let mut index_coord = out[..b].to_vec();
            index_coord.extend_from_slice(&out[axis..axis + m]);
            index_coord.push(0);

            let mut coord = out[..axis].to_vec();
            for j in 0..k {
                index_coord[b + m] = j;
                coord.push(checked(indices[index_coord.as_slice()], data_shape[axis + j])?);
            }
            coord.extend_from_slice(&out[axis + m..]);
            Some(coord)
        }
    }
}

fn view4(tensor: &Tensor<f32>) -> ArrayView4<f32> {
    tensor
        .view()
        .into_dimensionality::<Ix4>()
        .expect("rank checked by shape inference")
}

/// Number of `f32` scratch elements the im2col convolution needs for a single image.
pub fn convolution_scratch_len(attrs: &ConvolutionAttrs, input_channels: usize, output_hw: [usize; 2]) -> usize {
    input_channels * attrs.kernel[0] * attrs.kernel[1] * output_hw[0] * output_hw[1]
}

/// Convolution as im2col followed by a matrix multiplication, one image at a time.
fn convolution(attrs: &ConvolutionAttrs, input: &Tensor<f32>, out_shape: &ConcreteShape) -> Tensor<f32> {
    let input = view4(input);
    let (n, c, h, w) = input.dim();
    let [_, oc, oh, ow] = out_shape.unwrap_4();
    let [kh, kw] = attrs.kernel;
    let [sh, sw] = attrs.stride;
    let (pad_y, _) = attrs.resolve_padding(0, h);
    let (pad_x, _) = attrs.resolve_padding(1, w);

    let weights = ArrayView2::from_shape((oc, c * kh * kw), &attrs.kernel_weights.0)
        .expect("weight count checked by shape inference");

    let mut output = Array4::zeros((n, oc, oh, ow));
    let mut columns = Array2::<f32>::zeros((c * kh * kw, oh * ow));

    for b in 0..n {
        for ci in 0..c {
            for ky in 0..kh {
                for kx in 0..kw {
                    let row = (ci * kh + ky) * kw + kx;
                    for oy in 0..oh {
                        for ox in 0..ow {
                            let iy = (oy * sh + ky) as isize - pad_y as isize;
                            let ix = (ox * sw + kx) as isize - pad_x as isize;
                            let inside = iy >= 0 && ix >= 0 && (iy as usize) < h && (ix as usize) < w;
                            columns[(row, oy * ow + ox)] = if inside {
                                input[(b, ci, iy as usize, ix as usize)]
                            } else {
                                0.0
                            };
                        }
                    }
                }
            }
        }

        let result = weights.dot(&columns);
        let result = result.into_shape((oc, oh, ow)).expect("dot output is contiguous");
        output.slice_mut(s![b, .., .., ..]).assign(&result);
    }

    if let Some(bias) = &attrs.bias_weights {
        for (o, &bias) in bias.0.iter().enumerate() {
            output.slice_mut(s![.., o, .., ..]).mapv_inplace(|x| x + bias);
        }
    }

    output.into_dyn().into_shared()
}

/// Padded elements are excluded from both the maximum and the average.
fn pooling(attrs: &PoolingAttrs, input: &Tensor<f32>, out_shape: &ConcreteShape) -> Tensor<f32> {
    let input = view4(input);
    let (_, _, h, w) = input.dim();
    let [n, c, oh, ow] = out_shape.unwrap_4();
    let [wh, ww] = attrs.window;
    let [sh, sw] = attrs.stride;
    let [ph, pw] = attrs.padding;

    let output = Array4::from_shape_fn((n, c, oh, ow), |(b, ci, oy, ox)| {
        let y_start = (oy * sh).saturating_sub(ph);
        let y_end = (oy * sh + wh).saturating_sub(ph).min(h);
        let x_start = (ox * sw).saturating_sub(pw);
        let x_end = (ox * sw + ww).saturating_sub(pw).min(w);

        let window = input.slice(s![b, ci, y_start..y_end, x_start..x_end]);
        match attrs.pooling_type {
            PoolingType::Max => window.fold(f32::NEG_INFINITY, |a, &x| a.max(x)),
            PoolingType::Average => {
                if window.is_empty() {
                    0.0
                } else {
                    window.sum() / window.len() as f32
                }
            }
        }
    });

    output.into_dyn().into_shared()
}

fn elementwise<T: Copy>(left: &Tensor<T>, right: &Tensor<T>, out_shape: &ConcreteShape, f: impl Fn(T, T) -> T) -> Tensor<T> {
    let dim = IxDyn(&out_shape.dims);
    let left = left.broadcast(dim.clone()).expect("broadcast checked by shape inference");
    let right = right.broadcast(dim).expect("broadcast checked by shape inference");
    Zip::from(&left).and(&right).map_collect(|&a, &b| f(a, b)).into_shared()
}

fn mat_mul(attrs: &MatMulAttrs, left: &Tensor<f32>, right: &Tensor<f32>, out_shape: &ConcreteShape) -> Tensor<f32> {
    let rank = out_shape.rank();
    let batch = &out_shape.dims[..rank - 2];
    let batch_size: usize = batch.iter().product();

    // broadcast the batch dims and flatten them into a single leading axis
    let flatten = |x: &Tensor<f32>| -> Array3<f32> {
        let (r, c) = (x.shape()[rank - 2], x.shape()[rank - 1]);
        let mut full = batch.to_vec();
        full.extend([r, c]);
        let broadcast = x.broadcast(IxDyn(&full)).expect("broadcast checked by shape inference");
        broadcast
            .as_standard_layout()
            .into_owned()
            .into_shape((batch_size, r, c))
            .expect("standard layout")
    };
    let left = flatten(left);
    let right = flatten(right);

    let (m, n) = (out_shape.dims[rank - 2], out_shape.dims[rank - 1]);
    let mut output = Array3::zeros((batch_size, m, n));

    for i in 0..batch_size {
        let a = left.index_axis(Axis(0), i);
        let b = right.index_axis(Axis(0), i);
        let a = match attrs.op0 {
            MatrixOp::None => a,
            MatrixOp::Transpose => a.reversed_axes(),
        };
        let b = match attrs.op1 {
            MatrixOp::None => b,
            MatrixOp::Transpose => b.reversed_axes(),
        };
        output.index_axis_mut(Axis(0), i).assign(&a.dot(&b));
    }

    output
        .into_shape(IxDyn(&out_shape.dims))
        .expect("standard layout")
        .into_shared()
}

/// Softmax along the given axis, shifted by the maximum for numerical stability.
fn softmax(input: &Tensor<f32>, axis: usize) -> Tensor<f32> {
    let mut result: ArrayD<f32> = input.to_owned();
    for mut lane in result.lanes_mut(Axis(axis)) {
        let max = lane.fold(f32::NEG_INFINITY, |a, &x| a.max(x));
        lane.mapv_inplace(|x| (x - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|x| x / sum);
    }
    result.into_shared()
}

/// Ties are broken by the lower index.
fn top_k(attrs: &TopKAttrs, input: &Tensor<f32>, out_shape: &ConcreteShape) -> (Tensor<f32>, Tensor<i32>) {
    let axis = Axis(attrs.axis);
    let mut values = ArrayD::<f32>::zeros(IxDyn(&out_shape.dims));
    let mut indices = ArrayD::<i32>::zeros(IxDyn(&out_shape.dims));

    let lanes = input.lanes(axis).into_iter();
    for ((lane, mut value_lane), mut index_lane) in lanes.zip(values.lanes_mut(axis)).zip(indices.lanes_mut(axis)) {
        let mut order = (0..lane.len()).collect_vec();
        order.sort_by(|&a, &b| {
            let ord = lane[a].total_cmp(&lane[b]);
            match attrs.op {
                TopKOp::Max => ord.reverse(),
                TopKOp::Min => ord,
            }
        });

        for (j, &i) in order.iter().take(attrs.k).enumerate() {
            value_lane[j] = lane[i];
            index_lane[j] = i as i32;
        }
    }

    (values.into_shared(), indices.into_shared())
}

fn resolve_reshape(reshape: &[i64], shape: &[usize]) -> Vec<usize> {
    let total: usize = shape.iter().product();
    let dims = reshape
        .iter()
        .enumerate()
        .map(|(i, &d)| match d {
            0 => Some(shape[i]),
            -1 => None,
            d => Some(d as usize),
        })
        .collect_vec();
    let known: usize = dims.iter().flatten().product();

    dims.iter()
        .map(|d| d.unwrap_or_else(|| if known == 0 { 0 } else { total / known }))
        .collect_vec()
}

fn shuffle<T: Clone>(input: &Tensor<T>, attrs: &ShuffleAttrs, out_shape: &ConcreteShape) -> Tensor<T> {
    let mut result = input.clone();

    if let Some(permutation) = &attrs.first_transpose {
        result = result.permuted_axes(IxDyn(permutation));
    }
    if let Some(reshape) = &attrs.reshape {
        let dims = resolve_reshape(reshape, result.shape());
        result = result.as_standard_layout().to_shared().reshape(IxDyn(&dims));
    }
    if let Some(permutation) = &attrs.second_transpose {
        result = result.permuted_axes(IxDyn(permutation));
    }

    assert_eq!(&out_shape.dims, result.shape());
    result
}

/// Round half away from zero and saturate to the `i8` range.
pub fn quantize_i8(x: f32) -> i8 {
    x.round().clamp(i8::MIN as f32, i8::MAX as f32) as i8
}

fn scale(attrs: &ScaleAttrs, input: &Tensor<f32>) -> DTensor {
    let dims = input.shape().to_vec();
    let coefficient = |weights: &Weights, index: usize, default: f32| {
        if weights.is_empty() {
            default
        } else {
            weights.0[index]
        }
    };

    let result = Tensor::from_shape_fn(IxDyn(&dims), |idx| {
        let idx = idx.slice();
        let index = match attrs.mode {
            ScaleMode::Uniform => 0,
            ScaleMode::Channel => idx[1],
            ScaleMode::Elementwise => zip_eq(&idx[1..], &dims[1..]).fold(0, |acc, (&i, &d)| acc * d + i),
        };

        let x = input[idx];
        let value = x * coefficient(&attrs.scale, index, 1.0) + coefficient(&attrs.shift, index, 0.0);
        let power = coefficient(&attrs.power, index, 1.0);
        if power == 1.0 {
            value
        } else {
            value.powf(power)
        }
    });

    match attrs.output_dtype {
        DType::F32 => DTensor::F32(result),
        _ => DTensor::I8(result.mapv(quantize_i8).into_shared()),
    }
}
