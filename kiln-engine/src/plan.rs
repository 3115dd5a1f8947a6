use std::io::{Cursor, ErrorKind, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use itertools::Itertools;

use kiln_graph::dtype::DType;
use kiln_graph::layer::*;
use kiln_graph::shape::{ConcreteShape, Dim, Shape};

use crate::error::PlanError;
use crate::step::{Kernel, Step};

const MAGIC: [u8; 4] = *b"KILN";
const VERSION: u32 = 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TensorRole {
    Input,
    Output,
    Intermediate,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PlanTensor {
    pub name: String,
    pub dtype: DType,
    /// The declared shape, possibly with dynamic dimensions.
    pub shape: Shape,
    pub role: TensorRole,
}

/// The immutable result of compiling a network.
///
/// Tensors are referred to by index into [CompiledPlan::tensors]. Steps are stored in execution order, each step
/// only reads tensors that are inputs or written by an earlier step.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPlan {
    pub tensors: Vec<PlanTensor>,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
    /// For each profile, the `[min, opt, max]` shapes of each input, in input order.
    pub profiles: Vec<Vec<[ConcreteShape; 3]>>,
    pub steps: Vec<Step>,
    /// Scratch bytes needed by the most demanding step at the profile maximum.
    pub workspace_size: usize,
    pub workspace_limit: usize,
}

impl CompiledPlan {
    /// Input tensors first, then output tensors, each in declaration order.
    pub fn io_tensors(&self) -> impl Iterator<Item = usize> + '_ {
        self.inputs.iter().chain(&self.outputs).copied()
    }

    pub fn find_io_tensor(&self, name: &str) -> Option<usize> {
        self.io_tensors().find(|&t| self.tensors[t].name == name)
    }

    /// Position of tensor `t` in the input list.
    pub fn input_position(&self, t: usize) -> Option<usize> {
        self.inputs.iter().position(|&i| i == t)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = PlanWriter { buf: vec![] };

        w.buf.extend_from_slice(&MAGIC);
        w.u32(VERSION);

        w.len(self.tensors.len());
        for tensor in &self.tensors {
            w.str(&tensor.name);
            w.u8(tensor.dtype.code());
            w.shape(&tensor.shape);
            w.u8(match tensor.role {
                TensorRole::Input => 0,
                TensorRole::Output => 1,
                TensorRole::Intermediate => 2,
            });
        }
        w.indices(&self.inputs);
        w.indices(&self.outputs);

        w.len(self.profiles.len());
        for profile in &self.profiles {
            for range in profile {
                for shape in range {
                    w.concrete(shape);
                }
            }
        }

        w.len(self.steps.len());
        for step in &self.steps {
            w.str(&step.name);
            w.u8(step.kernel.code());
            w.layer_kind(&step.kind);
            w.indices(&step.inputs);
            w.indices(&step.outputs);
        }

        w.u64(self.workspace_size as u64);
        w.u64(self.workspace_limit as u64);

        w.buf
    }

    pub fn deserialize(data: &[u8]) -> Result<CompiledPlan, PlanError> {
        let mut r = PlanReader {
            cursor: Cursor::new(data),
        };

        let mut magic = [0; 4];
        r.cursor.read_exact(&mut magic).map_err(|_| PlanError::Truncated)?;
        if magic != MAGIC {
            return Err(PlanError::BadMagic);
        }
        let version = r.u32()?;
        if version != VERSION {
            return Err(PlanError::UnsupportedVersion(version));
        }

        let tensor_count = r.len()?;
        let mut tensors = vec![];
        for _ in 0..tensor_count {
            let name = r.str()?;
            let dtype = r.dtype()?;
            let shape = r.shape()?;
            let role = match r.u8()? {
                0 => TensorRole::Input,
                1 => TensorRole::Output,
                2 => TensorRole::Intermediate,
                other => return Err(corrupt(format!("unknown tensor role {}", other))),
            };
            tensors.push(PlanTensor {
                name,
                dtype,
                shape,
                role,
            });
        }
        let inputs = r.indices(tensor_count)?;
        let outputs = r.indices(tensor_count)?;

        let profile_count = r.len()?;
        let mut profiles = vec![];
        for _ in 0..profile_count {
            let mut profile = vec![];
            for _ in &inputs {
                profile.push([r.concrete()?, r.concrete()?, r.concrete()?]);
            }
            profiles.push(profile);
        }

        let step_count = r.len()?;
        let mut steps = vec![];
        for _ in 0..step_count {
            let name = r.str()?;
            let code = r.u8()?;
            let kernel = Kernel::from_code(code).ok_or_else(|| corrupt(format!("unknown kernel code {}", code)))?;
            let kind = r.layer_kind()?;
            let step_inputs = r.indices(tensor_count)?;
            let step_outputs = r.indices(tensor_count)?;
            steps.push(Step {
                name,
                kind,
                kernel,
                inputs: step_inputs,
                outputs: step_outputs,
            });
        }

        let workspace_size = r.u64()? as usize;
        let workspace_limit = r.u64()? as usize;

        if r.cursor.position() as usize != data.len() {
            return Err(corrupt("trailing bytes after plan".to_owned()));
        }

        let plan = CompiledPlan {
            tensors,
            inputs,
            outputs,
            profiles,
            steps,
            workspace_size,
            workspace_limit,
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Check the structural invariants that a plan produced by the compiler always satisfies.
    fn validate(&self) -> Result<(), PlanError> {
        if self.profiles.is_empty() {
            return Err(corrupt("plan has no optimization profiles".to_owned()));
        }
        for (i, profile) in self.profiles.iter().enumerate() {
            for (&input, [min, opt, max]) in self.inputs.iter().zip_eq(profile) {
                let declared = &self.tensors[input].shape;
                if !declared.contains(min) || !declared.contains(max) || !min.all_le(opt) || !opt.all_le(max) {
                    return Err(corrupt(format!(
                        "profile {} range for input {:?} is inconsistent",
                        i, self.tensors[input].name
                    )));
                }
            }
        }

        self.validate_roles()?;

        let mut written = vec![false; self.tensors.len()];
        for &i in &self.inputs {
            written[i] = true;
        }

        for step in &self.steps {
            if let Some(&missing) = step.inputs.iter().find(|&&i| !written[i]) {
                return Err(corrupt(format!(
                    "step {:?} reads tensor {:?} before it is written",
                    step.name, self.tensors[missing].name
                )));
            }

            let input_descs = step
                .inputs
                .iter()
                .map(|&i| TensorDesc {
                    dtype: self.tensors[i].dtype,
                    shape: self.tensors[i].shape.clone(),
                })
                .collect_vec();
            let output_descs = step
                .kind
                .infer(&input_descs)
                .map_err(|e| corrupt(format!("step {:?}: {}", step.name, e)))?;

            if output_descs.len() != step.outputs.len() {
                return Err(corrupt(format!("step {:?} has the wrong number of outputs", step.name)));
            }
            for (desc, &o) in output_descs.iter().zip(&step.outputs) {
                let tensor = &self.tensors[o];
                if written[o] || desc.dtype != tensor.dtype || desc.shape != tensor.shape {
                    return Err(corrupt(format!(
                        "step {:?} output {:?} does not match its declaration",
                        step.name, tensor.name
                    )));
                }
                written[o] = true;
            }
        }

        if let Some(&o) = self.outputs.iter().find(|&&o| !written[o]) {
            return Err(corrupt(format!("output {:?} is never written", self.tensors[o].name)));
        }
        if let Some(t) = written.iter().position(|&w| !w) {
            return Err(corrupt(format!("tensor {:?} is never written", self.tensors[t].name)));
        }

        Ok(())
    }

    /// Each tensor role must agree with its membership of the input and output lists, and each list entry must be
    /// unique. Execution relies on this to decide which tensors get context-owned memory.
    fn validate_roles(&self) -> Result<(), PlanError> {
        if self.outputs.is_empty() {
            return Err(corrupt("plan has no outputs".to_owned()));
        }

        let mut listed = vec![None; self.tensors.len()];
        let lists = [(TensorRole::Input, &self.inputs), (TensorRole::Output, &self.outputs)];
        for (role, list) in lists {
            for &t in list {
                if let Some(previous) = listed[t].replace(role) {
                    return Err(corrupt(format!(
                        "tensor {:?} is listed as {:?} and as {:?}",
                        self.tensors[t].name, previous, role
                    )));
                }
            }
        }

        for (tensor, listed) in self.tensors.iter().zip(listed) {
            let expected = listed.unwrap_or(TensorRole::Intermediate);
            if tensor.role != expected {
                return Err(corrupt(format!(
                    "tensor {:?} has role {:?} but is listed as {:?}",
                    tensor.name, tensor.role, expected
                )));
            }
        }

        Ok(())
    }
}

fn corrupt(reason: String) -> PlanError {
    PlanError::Corrupt(reason)
}

struct PlanWriter {
    buf: Vec<u8>,
}

// writing into a Vec<u8> cannot fail
impl PlanWriter {
    fn u8(&mut self, x: u8) {
        self.buf.push(x);
    }

    fn u32(&mut self, x: u32) {
        self.buf.write_u32::<LittleEndian>(x).unwrap();
    }

    fn u64(&mut self, x: u64) {
        self.buf.write_u64::<LittleEndian>(x).unwrap();
    }

    fn i64(&mut self, x: i64) {
        self.buf.write_i64::<LittleEndian>(x).unwrap();
    }

    fn f32(&mut self, x: f32) {
        self.buf.write_f32::<LittleEndian>(x).unwrap();
    }

    fn len(&mut self, len: usize) {
        self.u32(len as u32);
    }

    fn str(&mut self, s: &str) {
        self.len(s.len());
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn indices(&mut self, indices: &[usize]) {
        self.len(indices.len());
        for &i in indices {
            self.u32(i as u32);
        }
    }

    fn pair(&mut self, pair: [usize; 2]) {
        self.u32(pair[0] as u32);
        self.u32(pair[1] as u32);
    }

    fn shape(&mut self, shape: &Shape) {
        self.len(shape.rank());
        for d in &shape.dims {
            self.i64(d.to_i64());
        }
    }

    fn concrete(&mut self, shape: &ConcreteShape) {
        self.len(shape.rank());
        for &d in &shape.dims {
            self.u64(d as u64);
        }
    }

    fn weights(&mut self, weights: &Weights) {
        self.len(weights.len());
        for &x in &weights.0 {
            self.f32(x);
        }
    }

    fn permutation(&mut self, perm: &Option<Vec<usize>>) {
        match perm {
            None => self.u8(0),
            Some(perm) => {
                self.u8(1);
                self.indices(perm);
            }
        }
    }

    fn layer_kind(&mut self, kind: &LayerKind) {
        match kind {
            LayerKind::Constant(attrs) => {
                self.u8(0);
                self.concrete(&attrs.shape);
                self.weights(&attrs.weights);
            }
            LayerKind::Gather(attrs) => {
                self.u8(1);
                self.u32(attrs.axis as u32);
                self.u8(match attrs.mode {
                    GatherMode::Default => 0,
                    GatherMode::Element => 1,
                    GatherMode::Nd => 2,
                });
                self.u32(attrs.num_elementwise_dims as u32);
            }
            LayerKind::Convolution(attrs) => {
                self.u8(2);
                self.u32(attrs.output_channels as u32);
                self.pair(attrs.kernel);
                self.pair(attrs.stride);
                self.pair(attrs.padding);
                self.u8(match attrs.padding_mode {
                    PaddingMode::Explicit => 0,
                    PaddingMode::SameUpper => 1,
                    PaddingMode::SameLower => 2,
                });
                self.weights(&attrs.kernel_weights);
                match &attrs.bias_weights {
                    None => self.u8(0),
                    Some(bias) => {
                        self.u8(1);
                        self.weights(bias);
                    }
                }
            }
            LayerKind::Pooling(attrs) => {
                self.u8(3);
                self.u8(match attrs.pooling_type {
                    PoolingType::Max => 0,
                    PoolingType::Average => 1,
                });
                self.pair(attrs.window);
                self.pair(attrs.stride);
                self.pair(attrs.padding);
            }
            LayerKind::Activation(activation) => {
                self.u8(4);
                match *activation {
                    ActivationType::Relu => self.u8(0),
                    ActivationType::Sigmoid => self.u8(1),
                    ActivationType::Tanh => self.u8(2),
                    ActivationType::LeakyRelu { alpha } => {
                        self.u8(3);
                        self.f32(alpha);
                    }
                    ActivationType::Clip { min, max } => {
                        self.u8(4);
                        self.f32(min);
                        self.f32(max);
                    }
                }
            }
            LayerKind::ElementWise(op) => {
                self.u8(5);
                self.u8(match op {
                    ElementWiseOp::Sum => 0,
                    ElementWiseOp::Sub => 1,
                    ElementWiseOp::Prod => 2,
                    ElementWiseOp::Div => 3,
                    ElementWiseOp::Min => 4,
                    ElementWiseOp::Max => 5,
                    ElementWiseOp::Pow => 6,
                });
            }
            LayerKind::MatMul(attrs) => {
                self.u8(6);
                for op in [attrs.op0, attrs.op1] {
                    self.u8(match op {
                        MatrixOp::None => 0,
                        MatrixOp::Transpose => 1,
                    });
                }
            }
            LayerKind::Softmax(attrs) => {
                self.u8(7);
                self.u32(attrs.axis as u32);
            }
            LayerKind::TopK(attrs) => {
                self.u8(8);
                self.u8(match attrs.op {
                    TopKOp::Max => 0,
                    TopKOp::Min => 1,
                });
                self.u32(attrs.k as u32);
                self.u32(attrs.axis as u32);
            }
            LayerKind::Shuffle(attrs) => {
                self.u8(9);
                self.permutation(&attrs.first_transpose);
                match &attrs.reshape {
                    None => self.u8(0),
                    Some(dims) => {
                        self.u8(1);
                        self.len(dims.len());
                        for &d in dims {
                            self.i64(d);
                        }
                    }
                }
                self.permutation(&attrs.second_transpose);
            }
            LayerKind::Scale(attrs) => {
                self.u8(10);
                self.u8(match attrs.mode {
                    ScaleMode::Uniform => 0,
                    ScaleMode::Channel => 1,
                    ScaleMode::Elementwise => 2,
                });
                self.weights(&attrs.shift);
                self.weights(&attrs.scale);
                self.weights(&attrs.power);
                self.u8(attrs.output_dtype.code());
            }
        }
    }
}

struct PlanReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

fn truncated(e: std::io::Error) -> PlanError {
    match e.kind() {
        ErrorKind::UnexpectedEof => PlanError::Truncated,
        _ => PlanError::Corrupt(e.to_string()),
    }
}

impl PlanReader<'_> {
    fn remaining(&self) -> usize {
        self.cursor.get_ref().len() - self.cursor.position() as usize
    }

    fn u8(&mut self) -> Result<u8, PlanError> {
        self.cursor.read_u8().map_err(truncated)
    }

    fn u32(&mut self) -> Result<u32, PlanError> {
        self.cursor.read_u32::<LittleEndian>().map_err(truncated)
    }

    fn u64(&mut self) -> Result<u64, PlanError> {
        self.cursor.read_u64::<LittleEndian>().map_err(truncated)
    }

    fn i64(&mut self) -> Result<i64, PlanError> {
        self.cursor.read_i64::<LittleEndian>().map_err(truncated)
    }

    fn f32(&mut self) -> Result<f32, PlanError> {
        self.cursor.read_f32::<LittleEndian>().map_err(truncated)
    }

    /// Read a length prefix, rejecting lengths that cannot fit in the remaining data.
    fn len(&mut self) -> Result<usize, PlanError> {
        let len = self.u32()? as usize;
        if len > self.remaining() {
            return Err(PlanError::Truncated);
        }
        Ok(len)
    }

    fn usize(&mut self) -> Result<usize, PlanError> {
        Ok(self.u32()? as usize)
    }

    fn str(&mut self) -> Result<String, PlanError> {
        let len = self.len()?;
        let mut bytes = vec![0; len];
        self.cursor.read_exact(&mut bytes).map_err(truncated)?;
        String::from_utf8(bytes).map_err(|e| corrupt(e.to_string()))
    }

    fn dtype(&mut self) -> Result<DType, PlanError> {
        let code = self.u8()?;
        DType::from_code(code).ok_or_else(|| corrupt(format!("unknown dtype code {}", code)))
    }

    fn indices(&mut self, bound: usize) -> Result<Vec<usize>, PlanError> {
        let len = self.len()?;
        (0..len)
            .map(|_| {
                let i = self.usize()?;
                if i < bound {
                    Ok(i)
                } else {
                    Err(corrupt(format!("tensor index {} out of range", i)))
                }
            })
            .collect()
    }

    fn pair(&mut self) -> Result<[usize; 2], PlanError> {
        Ok([self.usize()?, self.usize()?])
    }

    fn shape(&mut self) -> Result<Shape, PlanError> {
        let rank = self.len()?;
        let dims = (0..rank)
            .map(|_| {
                let d = self.i64()?;
                Dim::from_i64(d).ok_or_else(|| corrupt(format!("invalid dimension {}", d)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Shape::new(dims))
    }

    fn concrete(&mut self) -> Result<ConcreteShape, PlanError> {
        let rank = self.len()?;
        let dims = (0..rank)
            .map(|_| Ok(self.u64()? as usize))
            .collect::<Result<Vec<_>, PlanError>>()?;
        Ok(ConcreteShape::new(dims))
    }

    fn weights(&mut self) -> Result<Weights, PlanError> {
        let len = self.len()?;
        let values = (0..len).map(|_| self.f32()).collect::<Result<Vec<_>, _>>()?;
        Ok(Weights(values))
    }

    fn permutation(&mut self) -> Result<Option<Vec<usize>>, PlanError> {
        match self.u8()? {
            0 => Ok(None),
            _ => {
                let len = self.len()?;
                Ok(Some((0..len).map(|_| self.usize()).collect::<Result<_, _>>()?))
            }
        }
    }

    fn layer_kind(&mut self) -> Result<LayerKind, PlanError> {
        let tag = self.u8()?;
        let kind = match tag {
            0 => LayerKind::Constant(ConstantAttrs {
                shape: self.concrete()?,
                weights: self.weights()?,
            }),
            1 => {
                let axis = self.usize()?;
                let mode = match self.u8()? {
                    0 => GatherMode::Default,
                    1 => GatherMode::Element,
                    2 => GatherMode::Nd,
                    other => return Err(corrupt(format!("unknown gather mode {}", other))),
                };
                let num_elementwise_dims = self.usize()?;
                LayerKind::Gather(GatherAttrs {
                    axis,
                    mode,
                    num_elementwise_dims,
                })
            }
            2 => {
                let output_channels = self.usize()?;
                let kernel = self.pair()?;
                let stride = self.pair()?;
                let padding = self.pair()?;
                let padding_mode = match self.u8()? {
                    0 => PaddingMode::Explicit,
                    1 => PaddingMode::SameUpper,
                    2 => PaddingMode::SameLower,
                    other => return Err(corrupt(format!("unknown padding mode {}", other))),
                };
                let kernel_weights = self.weights()?;
                let bias_weights = match self.u8()? {
                    0 => None,
                    _ => Some(self.weights()?),
                };
                LayerKind::Convolution(ConvolutionAttrs {
                    output_channels,
                    kernel,
                    stride,
                    padding,
                    padding_mode,
                    kernel_weights,
                    bias_weights,
                })
            }
            3 => {
                let pooling_type = match self.u8()? {
                    0 => PoolingType::Max,
                    1 => PoolingType::Average,
                    other => return Err(corrupt(format!("unknown pooling type {}", other))),
                };
                LayerKind::Pooling(PoolingAttrs {
                    pooling_type,
                    window: self.pair()?,
                    stride: self.pair()?,
                    padding: self.pair()?,
                })
            }
            4 => LayerKind::Activation(match self.u8()? {
                0 => ActivationType::Relu,
                1 => ActivationType::Sigmoid,
                2 => ActivationType::Tanh,
                3 => ActivationType::LeakyRelu { alpha: self.f32()? },
                4 => ActivationType::Clip {
                    min: self.f32()?,
                    max: self.f32()?,
                },
                other => return Err(corrupt(format!("unknown activation {}", other))),
            }),
            5 => LayerKind::ElementWise(match self.u8()? {
                0 => ElementWiseOp::Sum,
                1 => ElementWiseOp::Sub,
                2 => ElementWiseOp::Prod,
                3 => ElementWiseOp::Div,
                4 => ElementWiseOp::Min,
                5 => ElementWiseOp::Max,
                6 => ElementWiseOp::Pow,
                other => return Err(corrupt(format!("unknown elementwise op {}", other))),
            }),
            6 => {
                let mut op = || -> Result<MatrixOp, PlanError> {
                    match self.u8()? {
                        0 => Ok(MatrixOp::None),
                        1 => Ok(MatrixOp::Transpose),
                        other => Err(corrupt(format!("unknown matrix op {}", other))),
                    }
                };
                let op0 = op()?;
                let op1 = op()?;
                LayerKind::MatMul(MatMulAttrs { op0, op1 })
            }
            7 => LayerKind::Softmax(SoftmaxAttrs { axis: self.usize()? }),
            8 => {
                let op = match self.u8()? {
                    0 => TopKOp::Max,
                    1 => TopKOp::Min,
                    other => return Err(corrupt(format!("unknown topk op {}", other))),
                };
                LayerKind::TopK(TopKAttrs {
                    op,
                    k: self.usize()?,
                    axis: self.usize()?,
                })
            }
            9 => {
                let first_transpose = self.permutation()?;
                let reshape = match self.u8()? {
                    0 => None,
                    _ => {
                        let len = self.len()?;
                        Some((0..len).map(|_| self.i64()).collect::<Result<Vec<_>, _>>()?)
                    }
                };
                let second_transpose = self.permutation()?;
                LayerKind::Shuffle(ShuffleAttrs {
                    first_transpose,
                    reshape,
                    second_transpose,
                })
            }
            10 => {
                let mode = match self.u8()? {
                    0 => ScaleMode::Uniform,
                    1 => ScaleMode::Channel,
                    2 => ScaleMode::Elementwise,
                    other => return Err(corrupt(format!("unknown scale mode {}", other))),
                };
                LayerKind::Scale(ScaleAttrs {
                    mode,
                    shift: self.weights()?,
                    scale: self.weights()?,
                    power: self.weights()?,
                    output_dtype: self.dtype()?,
                })
            }
            other => return Err(corrupt(format!("unknown layer tag {}", other))),
        };
        Ok(kind)
    }
}
