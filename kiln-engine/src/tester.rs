use itertools::{enumerate, zip_eq};

use kiln_device::device::Device;
use kiln_device::stream::Stream;
use kiln_graph::cpu::cpu_eval_network;
use kiln_graph::dtype::{DTensor, Tensor};
use kiln_graph::ndarray::Dimension;
use kiln_graph::network::Network;

use crate::error::KilnError;
use crate::io::IoBuffers;
use crate::runtime::Engine;

/// Check that `engine`, compiled from `network`, produces the same outputs as the CPU reference for `inputs`.
pub fn check_engine(network: &Network, engine: &Engine, device: &Device, inputs: &[DTensor]) {
    let expected = cpu_eval_network(network, inputs)
        .unwrap_or_else(|e| panic!("CPU evaluation failed: {}", e))
        .output_tensors();
    let actual = eval_engine(engine, device, inputs).unwrap_or_else(|e| panic!("Engine evaluation failed: {}", e));
    assert_tensors_match(&expected, &actual, true);
}

/// Run `engine` once on `device` with the given inputs, in engine input order, and return the outputs.
///
/// Input shapes are taken from the input tensors themselves. All buffers are freed again before returning.
pub fn eval_engine(engine: &Engine, device: &Device, inputs: &[DTensor]) -> Result<Vec<DTensor>, KilnError> {
    let io = engine.io_tensors();
    let mut context = engine.create_execution_context();

    for (tensor, input) in io.iter().zip(inputs) {
        context.set_input_shape(&tensor.name, input.concrete_shape())?;
    }

    let mut buffers = IoBuffers::allocate(device, &context)?;
    for (tensor, input) in io.iter().zip(inputs) {
        buffers.set_host_input(&tensor.name, input.clone())?;
    }
    buffers.upload_inputs()?;
    buffers.bind(&mut context)?;

    let stream = Stream::new(device);
    context.enqueue(&stream)?;
    stream.synchronize()?;

    buffers.download_outputs()?;
    let outputs = buffers.outputs();
    buffers.free()?;

    Ok(outputs)
}

const TOLERANCE_ABS_DIFF: f64 = 0.001;
const TOLERANCE_REL_DIFF: f64 = 0.001;
const MAX_LOGGED_ERRORS: usize = 8;

pub fn assert_tensors_match(expected: &[DTensor], actual: &[DTensor], print_match: bool) {
    match check_tensors_match(expected, actual) {
        Ok(Match { diff_per_tensor }) => {
            if print_match {
                for (i, diff) in enumerate(diff_per_tensor) {
                    match diff {
                        Difference::Float {
                            max_abs_diff,
                            max_rel_diff,
                        } => println!(
                            "Output {} with shape {:?} and {} matched, max diff: abs {}, rel {}",
                            i,
                            actual[i].shape(),
                            actual[i].dtype(),
                            max_abs_diff,
                            max_rel_diff
                        ),
                        Difference::IntMatch => println!(
                            "Output {} with shape {:?} and {} matched",
                            i,
                            actual[i].shape(),
                            actual[i].dtype()
                        ),
                    }
                }
            }
        }
        Err(Mismatch {
            error_count,
            total_count,
            first_errors,
        }) => {
            eprintln!("Mismatch in {}/{} values:", error_count, total_count);

            for error in &first_errors {
                eprintln!(
                    "  Wrong output value {:?}, expected {:?} at indices {:?} in tensor {} (shape {:?})",
                    error.actual_value,
                    error.expected_value,
                    error.indices,
                    error.tensor,
                    expected[error.tensor].shape()
                );
                if error.more_omitted {
                    eprintln!("  ...");
                }
            }

            panic!("Output mismatch");
        }
    }
}

#[derive(Debug, Clone)]
pub struct Match {
    pub diff_per_tensor: Vec<Difference>,
}

#[derive(Debug, Copy, Clone)]
pub enum Difference {
    Float { max_abs_diff: f64, max_rel_diff: f64 },
    IntMatch,
}

#[derive(Debug, Clone)]
pub struct Mismatch {
    pub error_count: u64,
    pub total_count: u64,
    pub first_errors: Vec<ValueError>,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Scalar {
    Float(f64),
    Int(i64),
}

#[derive(Debug, Clone)]
pub struct ValueError {
    pub tensor: usize,
    pub indices: Vec<usize>,
    pub expected_value: Scalar,
    pub actual_value: Scalar,
    pub more_omitted: bool,
}

#[derive(Default, Debug)]
struct Counts {
    total_element_count: u64,
    total_error_count: u64,
}

pub fn check_tensors_match(expected: &[DTensor], actual: &[DTensor]) -> Result<Match, Mismatch> {
    assert_eq!(expected.len(), actual.len(), "Wrong number of tensors");

    let mut counts = Counts::default();
    let mut diff_per_tensor = vec![];
    let mut first_errors = vec![];

    for (i, (expected_output, output)) in zip_eq(expected, actual).enumerate() {
        assert_eq!(expected_output.shape(), output.shape(), "Wrong output shape for tensor {}", i);
        assert_eq!(expected_output.dtype(), output.dtype(), "Wrong output dtype for tensor {}", i);

        let diff = match (expected_output.to_indices(), output.to_indices()) {
            (Some(expected_output), Some(output)) => {
                check_tensor_match_exact(i, &expected_output, &output, &mut counts, &mut first_errors)
            }
            _ => check_tensor_match_approx(
                i,
                &expected_output.to_f32(),
                &output.to_f32(),
                &mut counts,
                &mut first_errors,
            ),
        };
        diff_per_tensor.push(diff);
    }

    if counts.total_error_count == 0 {
        Ok(Match { diff_per_tensor })
    } else {
        Err(Mismatch {
            error_count: counts.total_error_count,
            total_count: counts.total_element_count,
            first_errors,
        })
    }
}

fn record_error(
    first_errors: &mut Vec<ValueError>,
    current_error_count: &mut usize,
    error: ValueError,
) {
    *current_error_count += 1;
    if *current_error_count < MAX_LOGGED_ERRORS {
        first_errors.push(error);
    } else if let Some(last) = first_errors.last_mut() {
        last.more_omitted = true;
    }
}

fn check_tensor_match_exact(
    i: usize,
    expected_output: &Tensor<i64>,
    output: &Tensor<i64>,
    counts: &mut Counts,
    first_errors: &mut Vec<ValueError>,
) -> Difference {
    let mut current_error_count = 0;

    for ((indices, &expected_value), &value) in zip_eq(expected_output.indexed_iter(), output.iter()) {
        counts.total_element_count += 1;

        if expected_value != value {
            counts.total_error_count += 1;
            let error = ValueError {
                tensor: i,
                indices: indices.slice().to_vec(),
                expected_value: Scalar::Int(expected_value),
                actual_value: Scalar::Int(value),
                more_omitted: false,
            };
            record_error(first_errors, &mut current_error_count, error);
        }
    }

    Difference::IntMatch
}

fn check_tensor_match_approx(
    i: usize,
    expected_output: &Tensor<f32>,
    output: &Tensor<f32>,
    counts: &mut Counts,
    first_errors: &mut Vec<ValueError>,
) -> Difference {
    let mut max_abs_diff = 0.0;
    let mut max_rel_diff = 0.0;
    let mut current_error_count = 0;

    for ((indices, &expected_value), &value) in zip_eq(expected_output.indexed_iter(), output.iter()) {
        let (expected_value, value) = (expected_value as f64, value as f64);

        let (abs_diff, rel_diff) = if expected_value == value || expected_value.is_nan() || value.is_nan() {
            (0.0, 0.0)
        } else {
            let abs_diff = (expected_value - value).abs();
            (abs_diff, abs_diff / expected_value.abs())
        };

        max_abs_diff = f64::max(max_abs_diff, abs_diff);
        max_rel_diff = f64::max(max_rel_diff, rel_diff);
        counts.total_element_count += 1;

        let exceeds_tolerance = abs_diff >= TOLERANCE_ABS_DIFF && rel_diff >= TOLERANCE_REL_DIFF;
        let nan_mismatch = expected_value.is_nan() != value.is_nan();

        if exceeds_tolerance || nan_mismatch {
            counts.total_error_count += 1;
            let error = ValueError {
                tensor: i,
                indices: indices.slice().to_vec(),
                expected_value: Scalar::Float(expected_value),
                actual_value: Scalar::Float(value),
                more_omitted: false,
            };
            record_error(first_errors, &mut current_error_count, error);
        }
    }

    Difference::Float {
        max_abs_diff,
        max_rel_diff,
    }
}

#[cfg(test)]
mod test {
    use kiln_graph::dtype::{DTensor, Tensor};
    use kiln_graph::ndarray::IxDyn;

    use crate::tester::{check_tensors_match, Scalar};

    #[test]
    fn small_float_difference_matches() {
        let expected = DTensor::F32(Tensor::from_shape_vec(IxDyn(&[3]), vec![1.0, 2.0, 3.0]).unwrap());
        let actual = DTensor::F32(Tensor::from_shape_vec(IxDyn(&[3]), vec![1.0, 2.0001, 3.0]).unwrap());
        assert!(check_tensors_match(&[expected], &[actual]).is_ok());
    }

    #[test]
    fn int_mismatch_is_reported() {
        let expected = DTensor::I32(Tensor::from_shape_vec(IxDyn(&[2, 2]), vec![1, 2, 3, 4]).unwrap());
        let actual = DTensor::I32(Tensor::from_shape_vec(IxDyn(&[2, 2]), vec![1, 2, 5, 4]).unwrap());

        let mismatch = check_tensors_match(&[expected], &[actual]).unwrap_err();
        assert_eq!(1, mismatch.error_count);
        assert_eq!(4, mismatch.total_count);
        assert_eq!(vec![1, 0], mismatch.first_errors[0].indices);
        assert_eq!(Scalar::Int(3), mismatch.first_errors[0].expected_value);
    }
}
