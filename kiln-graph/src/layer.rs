use std::fmt::{Debug, Formatter};

use itertools::{zip_eq, Itertools};

use crate::dtype::DType;
use crate::error::{ConstructionError, ConstructionResult};
use crate::shape::{ConcreteShape, Dim, Shape};

/// The element type and (possibly symbolic) shape of a tensor.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct TensorDesc {
    pub dtype: DType,
    pub shape: Shape,
}

/// Wrapper type that prevents the Debug output from getting too large.
#[derive(Clone, PartialEq)]
pub struct Weights(pub Vec<f32>);

/// The operation performed by a layer, together with the attributes that are valid for that kind only.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerKind {
    Constant(ConstantAttrs),
    Gather(GatherAttrs),
    Convolution(ConvolutionAttrs),
    Pooling(PoolingAttrs),
    Activation(ActivationType),
    ElementWise(ElementWiseOp),
    MatMul(MatMulAttrs),
    Softmax(SoftmaxAttrs),
    TopK(TopKAttrs),
    Shuffle(ShuffleAttrs),
    Scale(ScaleAttrs),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstantAttrs {
    pub shape: ConcreteShape,
    pub weights: Weights,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum GatherMode {
    /// Each index selects a slice along `axis`.
    Default,
    /// Indices have the same rank as data, each index replaces the coordinate along `axis`.
    Element,
    /// The last index axis holds coordinate tuples into the data axes starting at `axis`.
    ///
    /// With data of rank `r`, indices of rank `q`, `k`-tuples and `b` elementwise dims the output shape is
    /// `data[..axis] ++ indices[b..q - 1] ++ data[axis + k..]`. For example `(1, 3, 4, 5)` data gathered at axis 1
    /// with `(2, 3)` indices gives `(1, 2)`: the leading data axis is kept and each of the two 3-tuples picks a
    /// single element from the trailing `(3, 4, 5)` axes.
    Nd,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct GatherAttrs {
    pub axis: usize,
    pub mode: GatherMode,
    /// Number of leading axes shared between data and indices.
    pub num_elementwise_dims: usize,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PaddingMode {
    /// Use the symmetric `padding` attribute as-is.
    Explicit,
    /// Pad to keep `ceil(input / stride)` outputs, extra padding at the end.
    SameUpper,
    /// Pad to keep `ceil(input / stride)` outputs, extra padding at the start.
    SameLower,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvolutionAttrs {
    pub output_channels: usize,
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub padding_mode: PaddingMode,
    /// Layout `[output_channels, input_channels, kernel_h, kernel_w]`.
    pub kernel_weights: Weights,
    pub bias_weights: Option<Weights>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PoolingType {
    Max,
    Average,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PoolingAttrs {
    pub pooling_type: PoolingType,
    pub window: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ActivationType {
    Relu,
    Sigmoid,
    Tanh,
    LeakyRelu { alpha: f32 },
    Clip { min: f32, max: f32 },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ElementWiseOp {
    Sum,
    Sub,
    Prod,
    Div,
    Min,
    Max,
    Pow,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MatrixOp {
    None,
    Transpose,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MatMulAttrs {
    pub op0: MatrixOp,
    pub op1: MatrixOp,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SoftmaxAttrs {
    pub axis: usize,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TopKOp {
    Max,
    Min,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TopKAttrs {
    pub op: TopKOp,
    pub k: usize,
    pub axis: usize,
}

/// Transpose, reshape, transpose. Every stage is optional.
///
/// In `reshape`, `0` copies the corresponding (transposed) input dimension and `-1` is inferred from the rest.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ShuffleAttrs {
    pub first_transpose: Option<Vec<usize>>,
    pub reshape: Option<Vec<i64>>,
    pub second_transpose: Option<Vec<usize>>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ScaleMode {
    /// One coefficient for the whole tensor.
    Uniform,
    /// One coefficient per channel (axis 1).
    Channel,
    /// One coefficient per element of a single batch item.
    Elementwise,
}

/// `output = (input * scale + shift) ^ power`, empty weights mean identity coefficients.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleAttrs {
    pub mode: ScaleMode,
    pub shift: Weights,
    pub scale: Weights,
    pub power: Weights,
    /// `F32`, or `I8` to quantize with round-half-away-from-zero and saturation.
    pub output_dtype: DType,
}

impl Debug for Weights {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.0.len() <= 16 {
            write!(f, "{:?}", self.0)
        } else {
            write!(f, "[..; {}]", self.0.len())
        }
    }
}

impl Weights {
    pub fn empty() -> Self {
        Weights(vec![])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<f32>> for Weights {
    fn from(values: Vec<f32>) -> Self {
        Weights(values)
    }
}

impl GatherAttrs {
    pub fn new(axis: usize, mode: GatherMode) -> Self {
        GatherAttrs {
            axis,
            mode,
            num_elementwise_dims: 0,
        }
    }

    pub fn with_elementwise_dims(self, num_elementwise_dims: usize) -> Self {
        GatherAttrs {
            num_elementwise_dims,
            ..self
        }
    }
}

impl ConvolutionAttrs {
    pub fn new(
        output_channels: usize,
        kernel: [usize; 2],
        kernel_weights: impl Into<Weights>,
        bias_weights: Option<Weights>,
    ) -> Self {
        ConvolutionAttrs {
            output_channels,
            kernel,
            stride: [1, 1],
            padding: [0, 0],
            padding_mode: PaddingMode::Explicit,
            kernel_weights: kernel_weights.into(),
            bias_weights,
        }
    }

    pub fn with_stride(self, stride: [usize; 2]) -> Self {
        ConvolutionAttrs { stride, ..self }
    }

    pub fn with_padding(self, padding: [usize; 2]) -> Self {
        ConvolutionAttrs { padding, ..self }
    }

    pub fn with_padding_mode(self, padding_mode: PaddingMode) -> Self {
        ConvolutionAttrs { padding_mode, ..self }
    }

    /// Resolve the (start, end) padding along spatial axis `i` for the given input size.
    pub fn resolve_padding(&self, i: usize, input: usize) -> (usize, usize) {
        resolve_padding(self.padding_mode, input, self.kernel[i], self.stride[i], self.padding[i])
    }
}

impl PoolingAttrs {
    /// The stride defaults to the window size, giving non-overlapping windows.
    pub fn new(pooling_type: PoolingType, window: [usize; 2]) -> Self {
        PoolingAttrs {
            pooling_type,
            window,
            stride: window,
            padding: [0, 0],
        }
    }

    pub fn with_stride(self, stride: [usize; 2]) -> Self {
        PoolingAttrs { stride, ..self }
    }

    pub fn with_padding(self, padding: [usize; 2]) -> Self {
        PoolingAttrs { padding, ..self }
    }
}

impl MatMulAttrs {
    pub const NONE: MatMulAttrs = MatMulAttrs {
        op0: MatrixOp::None,
        op1: MatrixOp::None,
    };
}

impl ShuffleAttrs {
    pub fn new() -> Self {
        ShuffleAttrs::default()
    }

    pub fn with_first_transpose(self, permutation: Vec<usize>) -> Self {
        ShuffleAttrs {
            first_transpose: Some(permutation),
            ..self
        }
    }

    pub fn with_reshape(self, dims: Vec<i64>) -> Self {
        ShuffleAttrs {
            reshape: Some(dims),
            ..self
        }
    }

    pub fn with_second_transpose(self, permutation: Vec<usize>) -> Self {
        ShuffleAttrs {
            second_transpose: Some(permutation),
            ..self
        }
    }
}

impl ScaleAttrs {
    pub fn new(mode: ScaleMode) -> Self {
        ScaleAttrs {
            mode,
            shift: Weights::empty(),
            scale: Weights::empty(),
            power: Weights::empty(),
            output_dtype: DType::F32,
        }
    }

    pub fn with_shift(self, shift: impl Into<Weights>) -> Self {
        ScaleAttrs {
            shift: shift.into(),
            ..self
        }
    }

    pub fn with_scale(self, scale: impl Into<Weights>) -> Self {
        ScaleAttrs {
            scale: scale.into(),
            ..self
        }
    }

    pub fn with_power(self, power: impl Into<Weights>) -> Self {
        ScaleAttrs {
            power: power.into(),
            ..self
        }
    }

    pub fn with_output_dtype(self, output_dtype: DType) -> Self {
        ScaleAttrs { output_dtype, ..self }
    }
}

pub fn resolve_padding(mode: PaddingMode, input: usize, kernel: usize, stride: usize, padding: usize) -> (usize, usize) {
    match mode {
        PaddingMode::Explicit => (padding, padding),
        PaddingMode::SameUpper | PaddingMode::SameLower => {
            let output = (input + stride - 1) / stride;
            let needed = (output.saturating_sub(1) * stride + kernel).saturating_sub(input);
            let small = needed / 2;
            let large = needed - small;
            match mode {
                PaddingMode::SameUpper => (small, large),
                _ => (large, small),
            }
        }
    }
}

/// Output size of a sliding window along a single axis, `None` if the window does not fit.
pub fn window_output_size(input: usize, kernel: usize, stride: usize, pad: (usize, usize)) -> Option<usize> {
    let padded = input + pad.0 + pad.1;
    if padded < kernel {
        return None;
    }
    Some((padded - kernel) / stride + 1)
}

impl LayerKind {
    /// The display name of this kind of layer.
    pub fn type_name(&self) -> &'static str {
        match self {
            LayerKind::Constant(_) => "Constant",
            LayerKind::Gather(_) => "Gather",
            LayerKind::Convolution(_) => "Convolution",
            LayerKind::Pooling(_) => "Pooling",
            LayerKind::Activation(_) => "Activation",
            LayerKind::ElementWise(_) => "ElementWise",
            LayerKind::MatMul(_) => "MatrixMultiply",
            LayerKind::Softmax(_) => "SoftMax",
            LayerKind::TopK(_) => "TopK",
            LayerKind::Shuffle(_) => "Shuffle",
            LayerKind::Scale(_) => "Scale",
        }
    }

    pub fn input_count(&self) -> usize {
        match self {
            LayerKind::Constant(_) => 0,
            LayerKind::Gather(_) | LayerKind::ElementWise(_) | LayerKind::MatMul(_) => 2,
            LayerKind::Convolution(_)
            | LayerKind::Pooling(_)
            | LayerKind::Activation(_)
            | LayerKind::Softmax(_)
            | LayerKind::TopK(_)
            | LayerKind::Shuffle(_)
            | LayerKind::Scale(_) => 1,
        }
    }

    pub fn output_count(&self) -> usize {
        match self {
            LayerKind::TopK(_) => 2,
            _ => 1,
        }
    }

    /// Infer the output descriptors of this layer for the given inputs.
    ///
    /// This works both on symbolic shapes during construction, where checks involving dynamic dims are deferred,
    /// and on fixed shapes during compilation and execution, where every check applies.
    pub fn infer(&self, inputs: &[TensorDesc]) -> ConstructionResult<Vec<TensorDesc>> {
        let layer = self.type_name();
        if inputs.len() != self.input_count() {
            return Err(ConstructionError::InputCount {
                layer,
                expected: self.input_count(),
                actual: inputs.len(),
            });
        }

        let single = |desc: TensorDesc| Ok(vec![desc]);

        match self {
            LayerKind::Constant(attrs) => {
                if attrs.shape.size() != attrs.weights.len() {
                    return Err(ConstructionError::attribute(
                        layer,
                        format!(
                            "shape {} has {} elements but got {} weights",
                            attrs.shape,
                            attrs.shape.size(),
                            attrs.weights.len()
                        ),
                    ));
                }
                single(TensorDesc {
                    dtype: DType::F32,
                    shape: Shape::from(&attrs.shape),
                })
            }
            LayerKind::Gather(attrs) => single(infer_gather(attrs, &inputs[0], &inputs[1])?),
            LayerKind::Convolution(attrs) => single(infer_convolution(attrs, &inputs[0])?),
            LayerKind::Pooling(attrs) => single(infer_pooling(attrs, &inputs[0])?),
            LayerKind::Activation(activation) => {
                require_dtype(layer, 0, &inputs[0], &[DType::F32])?;
                if let &ActivationType::Clip { min, max } = activation {
                    if !(min <= max) {
                        return Err(ConstructionError::attribute(
                            layer,
                            format!("clip min {} must be <= max {}", min, max),
                        ));
                    }
                }
                single(inputs[0].clone())
            }
            LayerKind::ElementWise(op) => {
                let (left, right) = (&inputs[0], &inputs[1]);
                let allowed: &[DType] = match op {
                    ElementWiseOp::Pow => &[DType::F32],
                    _ => &[DType::F32, DType::I32],
                };
                require_dtype(layer, 0, left, allowed)?;
                require_dtype(layer, 1, right, allowed)?;
                if left.dtype != right.dtype {
                    return Err(ConstructionError::UnsupportedDType {
                        layer,
                        index: 1,
                        dtype: right.dtype,
                    });
                }
                if left.shape.rank() != right.shape.rank() {
                    return Err(ConstructionError::shape(
                        layer,
                        format!("ranks differ for {} and {}", left.shape, right.shape),
                    ));
                }
                let shape = broadcast_shapes(layer, &left.shape, &right.shape)?;
                single(TensorDesc { dtype: left.dtype, shape })
            }
            LayerKind::MatMul(attrs) => single(infer_mat_mul(attrs, &inputs[0], &inputs[1])?),
            LayerKind::Softmax(attrs) => {
                require_dtype(layer, 0, &inputs[0], &[DType::F32])?;
                require_axis(layer, attrs.axis, &inputs[0].shape)?;
                single(inputs[0].clone())
            }
            LayerKind::TopK(attrs) => {
                let input = &inputs[0];
                require_dtype(layer, 0, input, &[DType::F32])?;
                require_axis(layer, attrs.axis, &input.shape)?;
                if attrs.k == 0 {
                    return Err(ConstructionError::attribute(layer, "k must be at least 1"));
                }
                if let Dim::Fixed(len) = input.shape[attrs.axis] {
                    if attrs.k > len {
                        return Err(ConstructionError::shape(
                            layer,
                            format!("k={} is larger than axis {} of {}", attrs.k, attrs.axis, input.shape),
                        ));
                    }
                }
                let mut shape = input.shape.clone();
                shape.dims[attrs.axis] = Dim::Fixed(attrs.k);
                Ok(vec![
                    TensorDesc {
                        dtype: DType::F32,
                        shape: shape.clone(),
                    },
                    TensorDesc {
                        dtype: DType::I32,
                        shape,
                    },
                ])
            }
            LayerKind::Shuffle(attrs) => single(infer_shuffle(attrs, &inputs[0])?),
            LayerKind::Scale(attrs) => single(infer_scale(attrs, &inputs[0])?),
        }
    }
}

fn require_dtype(layer: &'static str, index: usize, desc: &TensorDesc, allowed: &[DType]) -> ConstructionResult<()> {
    if allowed.contains(&desc.dtype) {
        Ok(())
    } else {
        Err(ConstructionError::UnsupportedDType {
            layer,
            index,
            dtype: desc.dtype,
        })
    }
}

fn require_axis(layer: &'static str, axis: usize, shape: &Shape) -> ConstructionResult<()> {
    if shape.has_axis(axis) {
        Ok(())
    } else {
        Err(ConstructionError::attribute(
            layer,
            format!("axis {} out of bounds for {}", axis, shape),
        ))
    }
}

fn require_rank(layer: &'static str, rank: usize, shape: &Shape) -> ConstructionResult<()> {
    if shape.rank() == rank {
        Ok(())
    } else {
        Err(ConstructionError::shape(
            layer,
            format!("expected rank {} input, got {}", rank, shape),
        ))
    }
}

fn require_permutation(layer: &'static str, permutation: &[usize], rank: usize) -> ConstructionResult<()> {
    let valid = permutation.len() == rank && permutation.iter().all_unique() && permutation.iter().all(|&i| i < rank);
    if valid {
        Ok(())
    } else {
        Err(ConstructionError::attribute(
            layer,
            format!("{:?} is not a permutation of {} axes", permutation, rank),
        ))
    }
}

/// Two dims describe the same size, or at least one of them is still unknown.
fn dims_compatible(left: Dim, right: Dim) -> bool {
    match (left, right) {
        (Dim::Fixed(l), Dim::Fixed(r)) => l == r,
        _ => true,
    }
}

fn broadcast_dim(left: Dim, right: Dim) -> Option<Dim> {
    match (left, right) {
        (Dim::Fixed(l), Dim::Fixed(r)) if l == r => Some(Dim::Fixed(l)),
        (Dim::Fixed(1), other) | (other, Dim::Fixed(1)) => Some(other),
        (Dim::Fixed(l), Dim::Dynamic) | (Dim::Dynamic, Dim::Fixed(l)) => Some(Dim::Fixed(l)),
        (Dim::Dynamic, Dim::Dynamic) => Some(Dim::Dynamic),
        _ => None,
    }
}

/// Broadcast two shapes of equal rank, unit dims are repeated.
pub fn broadcast_shapes(layer: &'static str, left: &Shape, right: &Shape) -> ConstructionResult<Shape> {
    let dims = zip_eq(&left.dims, &right.dims)
        .map(|(&l, &r)| {
            broadcast_dim(l, r)
                .ok_or_else(|| ConstructionError::shape(layer, format!("cannot broadcast {} and {}", left, right)))
        })
        .try_collect()?;
    Ok(Shape::new(dims))
}

fn infer_gather(attrs: &GatherAttrs, data: &TensorDesc, indices: &TensorDesc) -> ConstructionResult<TensorDesc> {
    let layer = "Gather";
    let &GatherAttrs {
        axis,
        mode,
        num_elementwise_dims: b,
    } = attrs;

    require_dtype(layer, 1, indices, &[DType::I32, DType::I64])?;
    require_axis(layer, axis, &data.shape)?;

    let data_shape = &data.shape;
    let index_shape = &indices.shape;
    let (r, q) = (data_shape.rank(), index_shape.rank());

    let check_batch_dims = |count: usize| -> ConstructionResult<()> {
        if count > q {
            return Err(ConstructionError::attribute(
                layer,
                format!("{} elementwise dims but indices only have rank {}", count, q),
            ));
        }
        for i in 0..count {
            if !dims_compatible(data_shape[i], index_shape[i]) {
                return Err(ConstructionError::shape(
                    layer,
                    format!("elementwise dim {} differs between {} and {}", i, data_shape, index_shape),
                ));
            }
        }
        Ok(())
    };

    let shape = match mode {
        GatherMode::Default => {
            if b > 1 || (b == 1 && axis == 0) {
                return Err(ConstructionError::attribute(
                    layer,
                    format!("default mode supports 0 or 1 elementwise dims before the axis, got {} with axis {}", b, axis),
                ));
            }
            check_batch_dims(b)?;
            data_shape
                .slice(0, axis)
                .concat(&index_shape.slice(b, q))
                .concat(&data_shape.slice(axis + 1, r))
        }
        GatherMode::Element => {
            if b != 0 {
                return Err(ConstructionError::attribute(layer, "element mode does not support elementwise dims"));
            }
            if q != r {
                return Err(ConstructionError::shape(
                    layer,
                    format!("element mode requires equal ranks, got {} and {}", data_shape, index_shape),
                ));
            }
            for i in (0..r).filter(|&i| i != axis) {
                if let (Dim::Fixed(d), Dim::Fixed(n)) = (data_shape[i], index_shape[i]) {
                    if n > d {
                        return Err(ConstructionError::shape(
                            layer,
                            format!("indices {} exceed data {} along axis {}", index_shape, data_shape, i),
                        ));
                    }
                }
            }
            index_shape.clone()
        }
        GatherMode::Nd => {
            if q == 0 {
                return Err(ConstructionError::shape(layer, "nd mode requires indices of rank >= 1"));
            }
            let k = index_shape[q - 1].fixed().ok_or_else(|| {
                ConstructionError::shape(layer, format!("last axis of indices {} must be fixed", index_shape))
            })?;
            if k == 0 {
                return Err(ConstructionError::shape(layer, "coordinate tuples must not be empty"));
            }
            if b > axis || b >= q {
                return Err(ConstructionError::attribute(
                    layer,
                    format!("{} elementwise dims incompatible with axis {} and indices {}", b, axis, index_shape),
                ));
            }
            if axis + k > r {
                return Err(ConstructionError::shape(
                    layer,
                    format!("{}-tuples starting at axis {} do not fit in {}", k, axis, data_shape),
                ));
            }
            check_batch_dims(b)?;
            data_shape
                .slice(0, axis)
                .concat(&index_shape.slice(b, q - 1))
                .concat(&data_shape.slice(axis + k, r))
        }
    };

    Ok(TensorDesc {
        dtype: data.dtype,
        shape,
    })
}

fn infer_convolution(attrs: &ConvolutionAttrs, input: &TensorDesc) -> ConstructionResult<TensorDesc> {
    let layer = "Convolution";
    require_dtype(layer, 0, input, &[DType::F32])?;
    require_rank(layer, 4, &input.shape)?;

    if attrs.output_channels == 0 || attrs.kernel.contains(&0) || attrs.stride.contains(&0) {
        return Err(ConstructionError::attribute(
            layer,
            "output channels, kernel and stride must be nonzero",
        ));
    }

    let input_channels = input.shape[1].fixed().ok_or_else(|| {
        ConstructionError::shape(layer, format!("input channels of {} must be fixed", input.shape))
    })?;

    let expected_weights = attrs.output_channels * input_channels * attrs.kernel[0] * attrs.kernel[1];
    if attrs.kernel_weights.len() != expected_weights {
        return Err(ConstructionError::attribute(
            layer,
            format!(
                "expected {} kernel weights for {} -> {} channels, got {}",
                expected_weights,
                input_channels,
                attrs.output_channels,
                attrs.kernel_weights.len()
            ),
        ));
    }
    if let Some(bias) = &attrs.bias_weights {
        if bias.len() != attrs.output_channels {
            return Err(ConstructionError::attribute(
                layer,
                format!("expected {} bias weights, got {}", attrs.output_channels, bias.len()),
            ));
        }
    }

    let mut dims = vec![input.shape[0], Dim::Fixed(attrs.output_channels)];
    for i in 0..2 {
        let dim = match input.shape[2 + i] {
            Dim::Fixed(size) => {
                let pad = attrs.resolve_padding(i, size);
                let output = window_output_size(size, attrs.kernel[i], attrs.stride[i], pad).ok_or_else(|| {
                    ConstructionError::shape(
                        layer,
                        format!("kernel {:?} does not fit in padded input {}", attrs.kernel, input.shape),
                    )
                })?;
                Dim::Fixed(output)
            }
            Dim::Dynamic => Dim::Dynamic,
        };
        dims.push(dim);
    }

    Ok(TensorDesc {
        dtype: DType::F32,
        shape: Shape::new(dims),
    })
}

fn infer_pooling(attrs: &PoolingAttrs, input: &TensorDesc) -> ConstructionResult<TensorDesc> {
    let layer = "Pooling";
    require_dtype(layer, 0, input, &[DType::F32])?;
    require_rank(layer, 4, &input.shape)?;

    if attrs.window.contains(&0) || attrs.stride.contains(&0) {
        return Err(ConstructionError::attribute(layer, "window and stride must be nonzero"));
    }
    if attrs.padding[0] >= attrs.window[0] || attrs.padding[1] >= attrs.window[1] {
        return Err(ConstructionError::attribute(layer, "padding must be smaller than the window"));
    }

    let mut dims = input.shape.dims[..2].to_vec();
    for i in 0..2 {
        let dim = match input.shape[2 + i] {
            Dim::Fixed(size) => {
                let pad = (attrs.padding[i], attrs.padding[i]);
                let output = window_output_size(size, attrs.window[i], attrs.stride[i], pad).ok_or_else(|| {
                    ConstructionError::shape(
                        layer,
                        format!("window {:?} does not fit in input {}", attrs.window, input.shape),
                    )
                })?;
                Dim::Fixed(output)
            }
            Dim::Dynamic => Dim::Dynamic,
        };
        dims.push(dim);
    }

    Ok(TensorDesc {
        dtype: DType::F32,
        shape: Shape::new(dims),
    })
}

fn infer_mat_mul(attrs: &MatMulAttrs, left: &TensorDesc, right: &TensorDesc) -> ConstructionResult<TensorDesc> {
    let layer = "MatrixMultiply";
    require_dtype(layer, 0, left, &[DType::F32])?;
    require_dtype(layer, 1, right, &[DType::F32])?;

    let rank = left.shape.rank();
    if rank < 2 || right.shape.rank() != rank {
        return Err(ConstructionError::shape(
            layer,
            format!("operands must have equal rank >= 2, got {} and {}", left.shape, right.shape),
        ));
    }

    let matrix = |shape: &Shape, op: MatrixOp| {
        let (rows, cols) = (shape[rank - 2], shape[rank - 1]);
        match op {
            MatrixOp::None => (rows, cols),
            MatrixOp::Transpose => (cols, rows),
        }
    };
    let (m, k0) = matrix(&left.shape, attrs.op0);
    let (k1, n) = matrix(&right.shape, attrs.op1);

    if !dims_compatible(k0, k1) {
        return Err(ConstructionError::shape(
            layer,
            format!("inner dimensions differ for {} and {}", left.shape, right.shape),
        ));
    }

    let batch = broadcast_shapes(
        layer,
        &left.shape.slice(0, rank - 2),
        &right.shape.slice(0, rank - 2),
    )?;

    Ok(TensorDesc {
        dtype: DType::F32,
        shape: batch.concat(&Shape::new(vec![m, n])),
    })
}

fn infer_shuffle(attrs: &ShuffleAttrs, input: &TensorDesc) -> ConstructionResult<TensorDesc> {
    let layer = "Shuffle";

    let mut shape = input.shape.clone();

    if let Some(permutation) = &attrs.first_transpose {
        require_permutation(layer, permutation, shape.rank())?;
        shape = Shape::new(permutation.iter().map(|&i| shape[i]).collect_vec());
    }

    if let Some(reshape) = &attrs.reshape {
        if reshape.iter().filter(|&&d| d == -1).count() > 1 {
            return Err(ConstructionError::attribute(layer, "reshape can infer at most one dimension"));
        }

        let mut dims = vec![];
        for (i, &d) in reshape.iter().enumerate() {
            let dim = match d {
                -1 => None,
                0 => {
                    if !shape.has_axis(i) {
                        return Err(ConstructionError::attribute(
                            layer,
                            format!("reshape placeholder at {} has no matching input axis in {}", i, shape),
                        ));
                    }
                    Some(shape[i])
                }
                d if d > 0 => Some(Dim::Fixed(d as usize)),
                _ => {
                    return Err(ConstructionError::attribute(
                        layer,
                        format!("invalid reshape dimension {}", d),
                    ))
                }
            };
            dims.push(dim);
        }

        let total = shape.size();
        let known: Dim = dims.iter().flatten().copied().product();

        let resolved = dims
            .iter()
            .map(|d| match d {
                Some(d) => Ok(*d),
                None => match (total, known) {
                    (Dim::Fixed(total), Dim::Fixed(known)) => {
                        if known == 0 || total % known != 0 {
                            Err(ConstructionError::shape(
                                layer,
                                format!("cannot reshape {} into {:?}", shape, reshape),
                            ))
                        } else {
                            Ok(Dim::Fixed(total / known))
                        }
                    }
                    _ => Ok(Dim::Dynamic),
                },
            })
            .collect::<ConstructionResult<Vec<_>>>()?;

        let has_infer = dims.iter().any(|d| d.is_none());
        if !has_infer {
            if let (Dim::Fixed(total), Dim::Fixed(known)) = (total, known) {
                if total != known {
                    return Err(ConstructionError::shape(
                        layer,
                        format!("cannot reshape {} into {:?}", shape, reshape),
                    ));
                }
            }
        }

        shape = Shape::new(resolved);
    }

    if let Some(permutation) = &attrs.second_transpose {
        require_permutation(layer, permutation, shape.rank())?;
        shape = Shape::new(permutation.iter().map(|&i| shape[i]).collect_vec());
    }

    Ok(TensorDesc {
        dtype: input.dtype,
        shape,
    })
}

/// The number of coefficients a non-empty scale weight must have for the given input shape.
pub fn scale_coefficient_count(mode: ScaleMode, shape: &Shape) -> Option<Dim> {
    match mode {
        ScaleMode::Uniform => Some(Dim::Fixed(1)),
        ScaleMode::Channel => shape.dims.get(1).copied(),
        ScaleMode::Elementwise => (shape.rank() >= 1).then(|| shape.slice(1, shape.rank()).size()),
    }
}

fn infer_scale(attrs: &ScaleAttrs, input: &TensorDesc) -> ConstructionResult<TensorDesc> {
    let layer = "Scale";
    require_dtype(layer, 0, input, &[DType::F32, DType::I8])?;

    if attrs.output_dtype != DType::F32 && attrs.output_dtype != DType::I8 {
        return Err(ConstructionError::attribute(
            layer,
            format!("unsupported output dtype {}", attrs.output_dtype),
        ));
    }

    let count = scale_coefficient_count(attrs.mode, &input.shape).ok_or_else(|| {
        ConstructionError::shape(layer, format!("{:?} mode does not fit input {}", attrs.mode, input.shape))
    })?;
    let count = count.fixed().ok_or_else(|| {
        ConstructionError::shape(
            layer,
            format!("{:?} mode needs fixed coefficient dims, got {}", attrs.mode, input.shape),
        )
    })?;

    for (name, weights) in [("shift", &attrs.shift), ("scale", &attrs.scale), ("power", &attrs.power)] {
        if !weights.is_empty() && weights.len() != count {
            return Err(ConstructionError::attribute(
                layer,
                format!("expected 0 or {} {} weights, got {}", count, name, weights.len()),
            ));
        }
    }

    Ok(TensorDesc {
        dtype: attrs.output_dtype,
        shape: input.shape.clone(),
    })
}
