use kiln_engine::builder::Builder;
use kiln_engine::networks::{gather_nd_inputs, gather_nd_network};
use kiln_engine::runtime::TensorIoMode;
use kiln_engine::tester::eval_engine;
use kiln_graph::dtype::{DTensor, DType, Tensor};
use kiln_graph::layer::GatherMode;
use kiln_graph::ndarray::IxDyn;
use kiln_graph::network::Network;
use kiln_graph::shape;

use crate::root::runner::{test_network, validating_device};

#[test]
fn nd_gather_scenario() {
    let mut network = gather_nd_network().unwrap();
    let builder = Builder::new();
    let engine = builder.build_engine(&mut network, &builder.create_config()).unwrap();

    let io = engine.io_tensors();
    assert_eq!(3, io.len());
    assert_eq!(("inputT0", TensorIoMode::Input), (io[0].name.as_str(), io[0].mode));
    assert_eq!(("inputT1", TensorIoMode::Input), (io[1].name.as_str(), io[1].mode));
    assert_eq!(TensorIoMode::Output, io[2].mode);
    assert_eq!(DType::F32, io[2].dtype);

    let device = validating_device();
    let outputs = eval_engine(&engine, &device, &gather_nd_inputs()).unwrap();
    let output = outputs[0].unwrap_f32().unwrap();

    assert_eq!(&[1, 2], output.shape());
    assert_eq!(12.0, output[[0, 0]]);
    // the second tuple has an out of range coordinate
    assert_eq!(0.0, output[[0, 1]]);
}

#[test]
fn nd_gather_matches_cpu() {
    let mut network = gather_nd_network().unwrap();
    test_network(&mut network, &Builder::new().create_config(), &[gather_nd_inputs().to_vec()]);
}

#[test]
fn default_gather() {
    let mut network = Network::new();
    let data = network.declare_input("data", DType::F32, shape![3, 4]).unwrap();
    let indices = network.declare_input("indices", DType::I32, shape![2]).unwrap();
    let gather = network.add_gather(data, indices, 1, GatherMode::Default).unwrap();
    network.mark_output(network[gather].output(0)).unwrap();

    let data = Tensor::from_shape_fn(IxDyn(&[3, 4]), |idx| (idx[0] * 4 + idx[1]) as f32);
    let indices = Tensor::from_shape_vec(IxDyn(&[2]), vec![3, 0]).unwrap();
    let inputs = vec![DTensor::F32(data), DTensor::I32(indices)];

    let engine = test_network(&mut network, &Builder::new().create_config(), &[inputs.clone()]);

    let outputs = eval_engine(&engine, &validating_device(), &inputs).unwrap();
    let output = outputs[0].unwrap_f32().unwrap();
    assert_eq!(&[3, 2], output.shape());
    assert_eq!(&[3.0, 0.0, 7.0, 4.0, 11.0, 8.0], output.as_slice().unwrap());
}
