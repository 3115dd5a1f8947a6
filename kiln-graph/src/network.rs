use std::fmt::{Debug, Display, Formatter};
use std::ops::Index;

use itertools::Itertools;
use rand::random;

use crate::dtype::DType;
use crate::error::{ConstructionError, ConstructionResult};
use crate::layer::*;
use crate::shape::{ConcreteShape, Dim, Shape};

/// A network under construction.
///
/// This is a Directed Acyclic Graph (DAG) with layers as nodes and tensors as edges. The data structure is
/// append-only: a layer can only consume tensors that already exist, so cycles and forward references cannot be
/// expressed. Shapes are inferred and validated as soon as a layer is added.
///
/// Once the network is handed to the compiler it is frozen and further mutation fails with
/// [ConstructionError::Frozen].
///
/// ```
/// # use kiln_graph::dtype::DType;
/// # use kiln_graph::layer::*;
/// # use kiln_graph::network::Network;
/// # use kiln_graph::shape;
/// # use kiln_graph::shape::Dim;
/// # fn main() -> Result<(), kiln_graph::error::ConstructionError> {
/// let mut network = Network::new();
/// let x = network.declare_input("x", DType::F32, shape![Dim::DYNAMIC, 10])?;
/// let softmax = network.add_softmax(x, 1)?;
/// let topk = network.add_topk(network[softmax].output(0), TopKOp::Max, 1, 1)?;
/// network.mark_output(network[topk].output(1))?;
///
/// println!("{}", network);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Network {
    check: u32,
    tensors: Vec<TensorInfo>,
    layers: Vec<LayerInfo>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    frozen: bool,
}

/// A tensor in a [Network].
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct TensorId {
    index: usize,
    check: u32,
}

/// A layer in a [Network].
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct LayerId {
    index: usize,
    check: u32,
}

#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: String,
    pub desc: TensorDesc,
    /// The layer and output index producing this tensor, `None` for network inputs.
    pub producer: Option<(LayerId, usize)>,
}

#[derive(Debug, Clone)]
pub struct LayerInfo {
    pub name: String,
    pub kind: LayerKind,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

impl LayerInfo {
    pub fn output(&self, index: usize) -> TensorId {
        assert!(
            index < self.outputs.len(),
            "Layer {:?} has {} outputs, index {} is out of bounds",
            self.name,
            self.outputs.len(),
            index
        );
        self.outputs[index]
    }
}

impl Index<TensorId> for Network {
    type Output = TensorInfo;

    fn index(&self, tensor: TensorId) -> &Self::Output {
        self.assert_contains_tensor(tensor);
        &self.tensors[tensor.index]
    }
}

impl Index<LayerId> for Network {
    type Output = LayerInfo;

    fn index(&self, layer: LayerId) -> &Self::Output {
        self.assert_contains_layer(layer);
        &self.layers[layer.index]
    }
}

impl Network {
    pub fn new() -> Self {
        Network {
            check: random(),
            tensors: vec![],
            layers: vec![],
            inputs: vec![],
            outputs: vec![],
            frozen: false,
        }
    }

    fn assert_contains_tensor(&self, tensor: TensorId) {
        assert_eq!(
            tensor.check, self.check,
            "{:?} does not belong to this network, check mismatch",
            tensor
        );
        assert!(tensor.index < self.tensors.len(), "{:?} out of bounds", tensor);
    }

    fn assert_contains_layer(&self, layer: LayerId) {
        assert_eq!(
            layer.check, self.check,
            "{:?} does not belong to this network, check mismatch",
            layer
        );
        assert!(layer.index < self.layers.len(), "{:?} out of bounds", layer);
    }

    fn check_tensor(&self, tensor: TensorId) -> ConstructionResult<()> {
        if tensor.check == self.check && tensor.index < self.tensors.len() {
            Ok(())
        } else {
            Err(ConstructionError::ForeignTensor(tensor))
        }
    }

    fn check_layer(&self, layer: LayerId) -> ConstructionResult<()> {
        if layer.check == self.check && layer.index < self.layers.len() {
            Ok(())
        } else {
            Err(ConstructionError::ForeignLayer(layer))
        }
    }

    fn check_open(&self) -> ConstructionResult<()> {
        if self.frozen {
            Err(ConstructionError::Frozen)
        } else {
            Ok(())
        }
    }

    fn check_tensor_name_free(&self, name: &str) -> ConstructionResult<()> {
        if self.tensors.iter().any(|t| t.name == name) {
            Err(ConstructionError::DuplicateTensorName(name.to_owned()))
        } else {
            Ok(())
        }
    }

    fn check_layer_name_free(&self, name: &str) -> ConstructionResult<()> {
        if self.layers.iter().any(|l| l.name == name) {
            Err(ConstructionError::DuplicateLayerName(name.to_owned()))
        } else {
            Ok(())
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Prevent any further modification. Called by the compiler, freezing twice is allowed.
    pub fn freeze(&mut self) {
        if !self.frozen {
            tracing::debug!(
                "Freezing network with {} layers, {} inputs, {} outputs",
                self.layers.len(),
                self.inputs.len(),
                self.outputs.len()
            );
        }
        self.frozen = true;
    }

    pub fn tensors(&self) -> impl Iterator<Item = TensorId> {
        let check = self.check;
        (0..self.tensors.len()).map(move |index| TensorId { index, check })
    }

    /// All layers, in insertion order. This is also a valid topological order.
    pub fn layers(&self) -> impl Iterator<Item = LayerId> {
        let check = self.check;
        (0..self.layers.len()).map(move |index| LayerId { index, check })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn tensor(&self, tensor: TensorId) -> ConstructionResult<&TensorInfo> {
        self.check_tensor(tensor)?;
        Ok(&self.tensors[tensor.index])
    }

    pub fn layer(&self, layer: LayerId) -> ConstructionResult<&LayerInfo> {
        self.check_layer(layer)?;
        Ok(&self.layers[layer.index])
    }

    pub fn tensor_by_name(&self, name: &str) -> Option<TensorId> {
        let check = self.check;
        self.tensors
            .iter()
            .position(|t| t.name == name)
            .map(|index| TensorId { index, check })
    }

    pub fn is_input(&self, tensor: TensorId) -> bool {
        self.inputs.contains(&tensor)
    }

    pub fn is_output(&self, tensor: TensorId) -> bool {
        self.outputs.contains(&tensor)
    }

    /// Verify the DAG invariant: every layer only consumes tensors produced by earlier layers or network inputs.
    pub fn is_dag(&self) -> bool {
        self.layers.iter().enumerate().all(|(li, layer)| {
            layer.inputs.iter().all(|&input| match self.tensors[input.index].producer {
                None => self.inputs.contains(&input),
                Some((producer, _)) => producer.index < li,
            })
        })
    }

    /// Declare a new network input. Dimensions may be [Dim::Dynamic], those must be covered by an optimization
    /// profile at compile time.
    pub fn declare_input(&mut self, name: &str, dtype: DType, shape: Shape) -> ConstructionResult<TensorId> {
        self.check_open()?;
        self.check_tensor_name_free(name)?;

        if name.is_empty() || shape.dims.contains(&Dim::Fixed(0)) {
            return Err(ConstructionError::InvalidInputShape {
                name: name.to_owned(),
                shape: shape.to_string(),
            });
        }

        let tensor = self.push_tensor(name.to_owned(), TensorDesc { dtype, shape }, None);
        self.inputs.push(tensor);
        Ok(tensor)
    }

    fn push_tensor(&mut self, name: String, desc: TensorDesc, producer: Option<(LayerId, usize)>) -> TensorId {
        let index = self.tensors.len();
        self.tensors.push(TensorInfo { name, desc, producer });
        TensorId {
            index,
            check: self.check,
        }
    }

    pub fn add_layer(&mut self, kind: LayerKind, inputs: &[TensorId]) -> ConstructionResult<LayerId> {
        self.add_layer_impl(None, kind, inputs)
    }

    pub fn add_named_layer(&mut self, name: &str, kind: LayerKind, inputs: &[TensorId]) -> ConstructionResult<LayerId> {
        self.add_layer_impl(Some(name), kind, inputs)
    }

    fn add_layer_impl(&mut self, name: Option<&str>, kind: LayerKind, inputs: &[TensorId]) -> ConstructionResult<LayerId> {
        self.check_open()?;
        for &input in inputs {
            self.check_tensor(input)?;
        }

        let index = self.layers.len();
        let name = match name {
            Some(name) => name.to_owned(),
            None => format!("(Unnamed Layer* {}) [{}]", index, kind.type_name()),
        };
        self.check_layer_name_free(&name)?;

        let input_descs = inputs.iter().map(|i| self.tensors[i.index].desc.clone()).collect_vec();
        let output_descs = kind.infer(&input_descs)?;

        let output_names = if output_descs.len() == 1 {
            vec![format!("{}_output", name)]
        } else {
            (0..output_descs.len()).map(|i| format!("{}_output_{}", name, i)).collect_vec()
        };
        for output_name in &output_names {
            self.check_tensor_name_free(output_name)?;
        }

        let layer = LayerId {
            index,
            check: self.check,
        };
        let outputs = output_descs
            .into_iter()
            .zip(output_names)
            .enumerate()
            .map(|(i, (desc, output_name))| self.push_tensor(output_name, desc, Some((layer, i))))
            .collect_vec();

        tracing::trace!("Added layer {:?} of kind {}", name, kind.type_name());
        self.layers.push(LayerInfo {
            name,
            kind,
            inputs: inputs.to_vec(),
            outputs,
        });
        Ok(layer)
    }

    pub fn set_layer_name(&mut self, layer: LayerId, name: &str) -> ConstructionResult<()> {
        self.check_open()?;
        self.check_layer(layer)?;
        if self.layers[layer.index].name == name {
            return Ok(());
        }
        self.check_layer_name_free(name)?;
        self.layers[layer.index].name = name.to_owned();
        Ok(())
    }

    pub fn set_tensor_name(&mut self, tensor: TensorId, name: &str) -> ConstructionResult<()> {
        self.check_open()?;
        self.check_tensor(tensor)?;
        if self.tensors[tensor.index].name == name {
            return Ok(());
        }
        self.check_tensor_name_free(name)?;
        self.tensors[tensor.index].name = name.to_owned();
        Ok(())
    }

    /// Mark a tensor as a network output. Outputs keep the order in which they were marked.
    pub fn mark_output(&mut self, tensor: TensorId) -> ConstructionResult<()> {
        self.check_open()?;
        self.check_tensor(tensor)?;
        if self.outputs.contains(&tensor) {
            return Err(ConstructionError::DuplicateOutput(self.tensors[tensor.index].name.clone()));
        }
        self.outputs.push(tensor);
        Ok(())
    }

    pub fn add_constant(&mut self, shape: impl Into<ConcreteShape>, weights: impl Into<Weights>) -> ConstructionResult<LayerId> {
        let attrs = ConstantAttrs {
            shape: shape.into(),
            weights: weights.into(),
        };
        self.add_layer(LayerKind::Constant(attrs), &[])
    }

    pub fn add_gather(&mut self, data: TensorId, indices: TensorId, axis: usize, mode: GatherMode) -> ConstructionResult<LayerId> {
        self.add_layer(LayerKind::Gather(GatherAttrs::new(axis, mode)), &[data, indices])
    }

    pub fn add_convolution(&mut self, input: TensorId, attrs: ConvolutionAttrs) -> ConstructionResult<LayerId> {
        self.add_layer(LayerKind::Convolution(attrs), &[input])
    }

    pub fn add_pooling(&mut self, input: TensorId, attrs: PoolingAttrs) -> ConstructionResult<LayerId> {
        self.add_layer(LayerKind::Pooling(attrs), &[input])
    }

    pub fn add_activation(&mut self, input: TensorId, activation: ActivationType) -> ConstructionResult<LayerId> {
        self.add_layer(LayerKind::Activation(activation), &[input])
    }

    pub fn add_elementwise(&mut self, left: TensorId, right: TensorId, op: ElementWiseOp) -> ConstructionResult<LayerId> {
        self.add_layer(LayerKind::ElementWise(op), &[left, right])
    }

    pub fn add_matrix_multiply(
        &mut self,
        left: TensorId,
        op0: MatrixOp,
        right: TensorId,
        op1: MatrixOp,
    ) -> ConstructionResult<LayerId> {
        self.add_layer(LayerKind::MatMul(MatMulAttrs { op0, op1 }), &[left, right])
    }

    pub fn add_softmax(&mut self, input: TensorId, axis: usize) -> ConstructionResult<LayerId> {
        self.add_layer(LayerKind::Softmax(SoftmaxAttrs { axis }), &[input])
    }

    pub fn add_topk(&mut self, input: TensorId, op: TopKOp, k: usize, axis: usize) -> ConstructionResult<LayerId> {
        self.add_layer(LayerKind::TopK(TopKAttrs { op, k, axis }), &[input])
    }

    pub fn add_shuffle(&mut self, input: TensorId, attrs: ShuffleAttrs) -> ConstructionResult<LayerId> {
        self.add_layer(LayerKind::Shuffle(attrs), &[input])
    }

    pub fn add_scale(&mut self, input: TensorId, attrs: ScaleAttrs) -> ConstructionResult<LayerId> {
        self.add_layer(LayerKind::Scale(attrs), &[input])
    }

    fn fmt_tensor_line(&self, f: &mut Formatter<'_>, label: &str, i: usize, tensor: TensorId) -> std::fmt::Result {
        let info = &self.tensors[tensor.index];
        writeln!(f, "\t{} {:2}:{},{},{}", label, i, info.desc.shape, info.desc.dtype, info.name)
    }
}

impl Debug for TensorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let TensorId { index, check } = self;
        if f.alternate() {
            write!(f, "TensorId {{ index: {}, check: {} }}", index, check)
        } else {
            write!(f, "TensorId({})", index)
        }
    }
}

impl Debug for LayerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let LayerId { index, check } = self;
        if f.alternate() {
            write!(f, "LayerId {{ index: {}, check: {} }}", index, check)
        } else {
            write!(f, "LayerId({})", index)
        }
    }
}

impl TensorId {
    pub fn index(self) -> usize {
        self.index
    }
}

impl LayerId {
    pub fn index(self) -> usize {
        self.index
    }
}

impl Debug for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("check", &self.check)
            .field("frozen", &self.frozen)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("layers", &self.layers)
            .finish()
    }
}

/// One line per layer with its input and output tensors, followed by the network inputs and outputs.
///
/// ```text
///    0->Convolution,in=1,out=1,conv1
///     Input   0:(-1, 1, 28, 28),FLOAT,inputT0
///     Output  0:(-1, 32, 28, 28),FLOAT,conv1_output
/// ```
impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, layer) in self.layers.iter().enumerate() {
            writeln!(
                f,
                "{:4}->{},in={},out={},{}",
                i,
                layer.kind.type_name(),
                layer.inputs.len(),
                layer.outputs.len(),
                layer.name
            )?;
            for (j, &input) in layer.inputs.iter().enumerate() {
                self.fmt_tensor_line(f, "Input ", j, input)?;
            }
            for (j, &output) in layer.outputs.iter().enumerate() {
                self.fmt_tensor_line(f, "Output", j, output)?;
            }
        }

        writeln!(f, "Network inputs:")?;
        for (i, &input) in self.inputs.iter().enumerate() {
            self.fmt_tensor_line(f, "Input ", i, input)?;
        }
        writeln!(f, "Network outputs:")?;
        for (i, &output) in self.outputs.iter().enumerate() {
            self.fmt_tensor_line(f, "Output", i, output)?;
        }
        Ok(())
    }
}
