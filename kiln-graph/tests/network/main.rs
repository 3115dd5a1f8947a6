use kiln_graph::cpu::cpu_eval_network;
use kiln_graph::dtype::{DTensor, DType, Tensor};
use kiln_graph::error::ConstructionError;
use kiln_graph::layer::*;
use kiln_graph::ndarray::IxDyn;
use kiln_graph::network::Network;
use kiln_graph::shape;
use kiln_graph::shape::Dim;

#[test]
fn default_names() {
    let mut network = Network::new();
    let x = network.declare_input("x", DType::F32, shape![Dim::DYNAMIC, 4]).unwrap();
    let relu = network.add_activation(x, ActivationType::Relu).unwrap();
    let topk = network.add_topk(network[relu].output(0), TopKOp::Max, 2, 1).unwrap();

    assert_eq!("(Unnamed Layer* 0) [Activation]", network[relu].name);
    let relu_out = network[relu].output(0);
    assert_eq!("(Unnamed Layer* 0) [Activation]_output", network[relu_out].name);

    let indices = network[topk].output(1);
    assert_eq!("(Unnamed Layer* 1) [TopK]_output_1", network[indices].name);
    assert_eq!(DType::I32, network[indices].desc.dtype);
    assert_eq!(Some((topk, 1)), network[indices].producer);
}

#[test]
fn duplicate_names() {
    let mut network = Network::new();
    network.declare_input("x", DType::F32, shape![2]).unwrap();
    assert_eq!(
        Err(ConstructionError::DuplicateTensorName("x".to_owned())),
        network.declare_input("x", DType::F32, shape![3])
    );

    let c = network.add_named_layer("c", LayerKind::Constant(ConstantAttrs { shape: [1].into(), weights: vec![1.0].into() }), &[]);
    assert!(c.is_ok());
    let c2 = network.add_named_layer("c", LayerKind::Constant(ConstantAttrs { shape: [1].into(), weights: vec![1.0].into() }), &[]);
    assert_eq!(Err(ConstructionError::DuplicateLayerName("c".to_owned())), c2);
}

#[test]
fn foreign_handles() {
    let mut a = Network::new();
    let mut b = Network::new();
    let x = a.declare_input("x", DType::F32, shape![2]).unwrap();
    b.declare_input("y", DType::F32, shape![2]).unwrap();

    assert!(matches!(
        b.add_activation(x, ActivationType::Relu),
        Err(ConstructionError::ForeignTensor(_))
    ));
    assert!(matches!(b.mark_output(x), Err(ConstructionError::ForeignTensor(_))));
    assert!(b.tensor(x).is_err());
}

#[test]
fn frozen_rejects_mutation() {
    let mut network = Network::new();
    let x = network.declare_input("x", DType::F32, shape![2]).unwrap();
    network.mark_output(x).unwrap();
    network.freeze();
    assert!(network.is_frozen());

    assert_eq!(Err(ConstructionError::Frozen), network.add_activation(x, ActivationType::Relu).map(|_| ()));
    assert_eq!(Err(ConstructionError::Frozen), network.declare_input("y", DType::F32, shape![2]).map(|_| ()));
    assert_eq!(Err(ConstructionError::Frozen), network.mark_output(x));
}

#[test]
fn duplicate_output() {
    let mut network = Network::new();
    let x = network.declare_input("x", DType::F32, shape![2]).unwrap();
    network.mark_output(x).unwrap();
    assert_eq!(Err(ConstructionError::DuplicateOutput("x".to_owned())), network.mark_output(x));
}

#[test]
fn invalid_input_shape() {
    let mut network = Network::new();
    let result = network.declare_input("x", DType::F32, shape![0, 3]);
    assert!(matches!(result, Err(ConstructionError::InvalidInputShape { .. })));
}

#[test]
fn failed_layer_leaves_network_unchanged() {
    let mut network = Network::new();
    let x = network.declare_input("x", DType::F32, shape![2, 3]).unwrap();
    let y = network.declare_input("y", DType::F32, shape![3, 3]).unwrap();

    let result = network.add_elementwise(x, y, ElementWiseOp::Sum);
    assert!(matches!(result, Err(ConstructionError::ShapeMismatch { .. })));
    assert_eq!(0, network.num_layers());
    assert_eq!(2, network.tensors().count());
}

#[test]
fn is_dag_and_print() {
    let mut network = Network::new();
    let x = network.declare_input("inputT0", DType::F32, shape![Dim::DYNAMIC, 1, 4, 4]).unwrap();
    let conv = ConvolutionAttrs::new(2, [3, 3], vec![0.1; 2 * 9], Some(vec![0.0; 2].into())).with_padding([1, 1]);
    let conv = network.add_convolution(x, conv).unwrap();
    network.set_layer_name(conv, "conv1").unwrap();
    let out = network[conv].output(0);
    network.set_tensor_name(out, "features").unwrap();
    network.mark_output(out).unwrap();

    assert!(network.is_dag());

    let text = network.to_string();
    let first = text.lines().next().unwrap();
    assert_eq!("   0->Convolution,in=1,out=1,conv1", first);
    assert!(text.contains("\tInput   0:(-1, 1, 4, 4),FLOAT,inputT0"));
    assert!(text.contains("\tOutput  0:(-1, 2, 4, 4),FLOAT,features"));
}

#[test]
fn cpu_eval_matches_hand_computation() {
    let mut network = Network::new();
    let x = network.declare_input("x", DType::F32, shape![Dim::DYNAMIC, 2]).unwrap();
    let w = network.add_constant([2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    let mm = network
        .add_matrix_multiply(x, MatrixOp::None, network[w].output(0), MatrixOp::None)
        .unwrap();
    let b = network.add_constant([1, 2], vec![-10.0, 0.0]).unwrap();
    let sum = network
        .add_elementwise(network[mm].output(0), network[b].output(0), ElementWiseOp::Sum)
        .unwrap();
    let relu = network.add_activation(network[sum].output(0), ActivationType::Relu).unwrap();
    network.mark_output(network[relu].output(0)).unwrap();

    let input = DTensor::F32(Tensor::from_shape_vec(IxDyn(&[2, 2]), vec![1.0, 1.0, 2.0, 0.0]).unwrap());
    let outputs = cpu_eval_network(&network, &[input]).unwrap().output_tensors();

    // [1, 1] -> [4, 6] -> [-6, 6] -> [0, 6]
    // [2, 0] -> [2, 4] -> [-8, 4] -> [0, 4]
    let output = outputs[0].unwrap_f32().unwrap();
    assert_eq!(vec![0.0, 6.0, 0.0, 4.0], output.iter().copied().collect::<Vec<_>>());
}

#[test]
fn cpu_eval_rejects_wrong_input_shape() {
    let mut network = Network::new();
    let x = network.declare_input("x", DType::F32, shape![Dim::DYNAMIC, 2]).unwrap();
    network.mark_output(x).unwrap();

    let input = DTensor::F32(Tensor::zeros(IxDyn(&[2, 3])));
    let result = cpu_eval_network(&network, &[input]);
    assert!(matches!(result, Err(ConstructionError::InvalidInputShape { .. })));
}
