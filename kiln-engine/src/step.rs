use itertools::zip_eq;

use kiln_device::device::{Device, DevicePtr};
use kiln_device::error::DeviceError;
use kiln_graph::cpu::{convolution_scratch_len, run_layer};
use kiln_graph::dtype::{DTensor, DType};
use kiln_graph::layer::*;
use kiln_graph::shape::ConcreteShape;

/// The implementation chosen for a single layer.
///
/// The choice is recorded in the plan and shown in the layer info, and it decides how much scratch memory the layer
/// reserves. All variants of a layer type compute the same result through the reference kernels, so steps never
/// touch the workspace.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Kernel {
    Constant,
    GatherDefault,
    GatherElement,
    GatherNd,
    ConvIm2col,
    ConvPointwise,
    Pool,
    Activation,
    ElementWise,
    ElementWiseBroadcast,
    Gemm,
    BatchedGemm,
    Softmax,
    TopK,
    Copy,
    Transpose,
    Reshape,
    Scale,
    Quantize,
}

const ALL_KERNELS: &[Kernel] = &[
    Kernel::Constant,
    Kernel::GatherDefault,
    Kernel::GatherElement,
    Kernel::GatherNd,
    Kernel::ConvIm2col,
    Kernel::ConvPointwise,
    Kernel::Pool,
    Kernel::Activation,
    Kernel::ElementWise,
    Kernel::ElementWiseBroadcast,
    Kernel::Gemm,
    Kernel::BatchedGemm,
    Kernel::Softmax,
    Kernel::TopK,
    Kernel::Copy,
    Kernel::Transpose,
    Kernel::Reshape,
    Kernel::Scale,
    Kernel::Quantize,
];

impl Kernel {
    /// Pick the implementation for a layer given its (profile maximum) input shapes.
    pub fn select(kind: &LayerKind, inputs: &[ConcreteShape]) -> Kernel {
        match kind {
            LayerKind::Constant(_) => Kernel::Constant,
            LayerKind::Gather(attrs) => match attrs.mode {
                GatherMode::Default => Kernel::GatherDefault,
                GatherMode::Element => Kernel::GatherElement,
                GatherMode::Nd => Kernel::GatherNd,
            },
            LayerKind::Convolution(attrs) => {
                let pointwise = attrs.kernel == [1, 1] && attrs.stride == [1, 1] && attrs.padding == [0, 0];
                if pointwise {
                    Kernel::ConvPointwise
                } else {
                    Kernel::ConvIm2col
                }
            }
            LayerKind::Pooling(_) => Kernel::Pool,
            LayerKind::Activation(_) => Kernel::Activation,
            LayerKind::ElementWise(_) => {
                if inputs[0] == inputs[1] {
                    Kernel::ElementWise
                } else {
                    Kernel::ElementWiseBroadcast
                }
            }
            LayerKind::MatMul(_) => {
                let batch: usize = inputs[0].dims[..inputs[0].rank() - 2].iter().product();
                let batch_right: usize = inputs[1].dims[..inputs[1].rank() - 2].iter().product();
                if batch == 1 && batch_right == 1 {
                    Kernel::Gemm
                } else {
                    Kernel::BatchedGemm
                }
            }
            LayerKind::Softmax(_) => Kernel::Softmax,
            LayerKind::TopK(_) => Kernel::TopK,
            LayerKind::Shuffle(attrs) => {
                if attrs.first_transpose.is_some() || attrs.second_transpose.is_some() {
                    Kernel::Transpose
                } else if attrs.reshape.is_some() {
                    Kernel::Reshape
                } else {
                    Kernel::Copy
                }
            }
            LayerKind::Scale(attrs) => {
                if attrs.output_dtype == DType::I8 {
                    Kernel::Quantize
                } else {
                    Kernel::Scale
                }
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Kernel::Constant => "constant",
            Kernel::GatherDefault => "gather_default",
            Kernel::GatherElement => "gather_element",
            Kernel::GatherNd => "gather_nd",
            Kernel::ConvIm2col => "conv2d_im2col",
            Kernel::ConvPointwise => "conv2d_pointwise",
            Kernel::Pool => "pool2d",
            Kernel::Activation => "activation",
            Kernel::ElementWise => "elementwise",
            Kernel::ElementWiseBroadcast => "elementwise_broadcast",
            Kernel::Gemm => "gemm",
            Kernel::BatchedGemm => "batched_gemm",
            Kernel::Softmax => "softmax",
            Kernel::TopK => "topk",
            Kernel::Copy => "copy",
            Kernel::Transpose => "transpose",
            Kernel::Reshape => "reshape",
            Kernel::Scale => "scale",
            Kernel::Quantize => "quantize_i8",
        }
    }

    pub fn code(self) -> u8 {
        ALL_KERNELS
            .iter()
            .position(|&k| k == self)
            .expect("every kernel is listed") as u8
    }

    pub fn from_code(code: u8) -> Option<Kernel> {
        ALL_KERNELS.get(code as usize).copied()
    }

    /// Bytes of scratch memory this kernel needs for the given concrete shapes.
    pub fn scratch_bytes(self, kind: &LayerKind, inputs: &[ConcreteShape], outputs: &[ConcreteShape]) -> usize {
        let f32_bytes = DType::F32.size().bytes();
        match (self, kind) {
            (Kernel::ConvIm2col, LayerKind::Convolution(attrs)) => {
                let [_, c, _, _] = inputs[0].unwrap_4();
                let [_, _, oh, ow] = outputs[0].unwrap_4();
                convolution_scratch_len(attrs, c, [oh, ow]) * f32_bytes
            }
            (Kernel::Gemm | Kernel::BatchedGemm, LayerKind::MatMul(_)) => {
                // packed copies of one left and one right matrix
                let matrix = |shape: &ConcreteShape| shape.dims[shape.rank() - 2..].iter().product::<usize>();
                (matrix(&inputs[0]) + matrix(&inputs[1])) * f32_bytes
            }
            (Kernel::TopK, LayerKind::TopK(attrs)) => {
                let axis_len = inputs[0].dims[attrs.axis];
                axis_len * std::mem::size_of::<u64>()
            }
            (Kernel::Transpose, _) => inputs[0].size() * f32_bytes,
            _ => 0,
        }
    }
}

/// A single scheduled layer in a compiled plan, referring to plan tensors by index.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: String,
    pub kind: LayerKind,
    pub kernel: Kernel,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
}

/// Where the tensors of a run live, indexed like the plan tensors.
#[derive(Debug, Clone)]
pub struct RunBindings {
    pub shapes: Vec<ConcreteShape>,
    pub dtypes: Vec<DType>,
    pub ptrs: Vec<DevicePtr>,
}

impl Step {
    /// Run this step on the device: operands are read from and results written to the bound addresses.
    pub fn run(&self, device: &Device, bindings: &RunBindings) -> Result<(), DeviceError> {
        let inputs = self
            .inputs
            .iter()
            .map(|&i| {
                let shape = &bindings.shapes[i];
                let dtype = bindings.dtypes[i];
                let bytes = device.read(bindings.ptrs[i], shape.size() * dtype.size().bytes())?;
                DTensor::from_bytes(dtype, shape, &bytes).map_err(|e| self.kernel_error(format!("{:?}", e)))
            })
            .collect::<Result<Vec<_>, DeviceError>>()?;

        let outputs = run_layer(&self.kind, &inputs).map_err(|e| self.kernel_error(e.to_string()))?;

        for (&o, output) in zip_eq(&self.outputs, &outputs) {
            if output.shape() != bindings.shapes[o].dims.as_slice() {
                return Err(self.kernel_error(format!(
                    "produced shape {:?}, expected {}",
                    output.shape(),
                    bindings.shapes[o]
                )));
            }
            device.copy_host_to_device(bindings.ptrs[o], &output.to_bytes())?;
        }

        Ok(())
    }

    fn kernel_error(&self, reason: String) -> DeviceError {
        DeviceError::Kernel {
            kernel: format!("{} ({})", self.kernel.name(), self.name),
            reason,
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "{} [{}] inputs={:?} outputs={:?}",
            self.name,
            self.kernel.name(),
            self.inputs,
            self.outputs
        )
    }
}

#[cfg(test)]
mod test {
    use kiln_graph::layer::*;
    use kiln_graph::shape::ConcreteShape;

    use crate::step::{Kernel, ALL_KERNELS};

    #[test]
    fn codes_roundtrip() {
        for &kernel in ALL_KERNELS {
            assert_eq!(Some(kernel), Kernel::from_code(kernel.code()));
        }
        assert_eq!(None, Kernel::from_code(ALL_KERNELS.len() as u8));
    }

    #[test]
    fn conv_scratch() {
        let attrs = ConvolutionAttrs::new(64, [5, 5], vec![0.0; 64 * 32 * 25], None).with_padding([2, 2]);
        let kind = LayerKind::Convolution(attrs);
        let input = ConcreteShape::from([16, 32, 14, 14]);
        let output = ConcreteShape::from([16, 64, 14, 14]);

        let kernel = Kernel::select(&kind, &[input.clone()]);
        assert_eq!(Kernel::ConvIm2col, kernel);
        assert_eq!(32 * 25 * 14 * 14 * 4, kernel.scratch_bytes(&kind, &[input], &[output]));
    }

    #[test]
    fn pointwise_conv_needs_no_scratch() {
        let attrs = ConvolutionAttrs::new(2, [1, 1], vec![1.0; 4], None);
        let kind = LayerKind::Convolution(attrs);
        let shape = ConcreteShape::from([1, 2, 3, 3]);
        let kernel = Kernel::select(&kind, &[shape.clone()]);
        assert_eq!(Kernel::ConvPointwise, kernel);
        assert_eq!(0, kernel.scratch_bytes(&kind, &[shape.clone()], &[shape]));
    }
}
