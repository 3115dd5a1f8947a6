use std::collections::{HashMap, HashSet};

use itertools::Itertools;

use kiln_graph::error::ConstructionError;
use kiln_graph::layer::TensorDesc;
use kiln_graph::network::{LayerId, Network, TensorId};
use kiln_graph::shape::{ConcreteShape, Shape};

use crate::builder::{BuilderConfig, MemoryPoolType, OptimizationProfile};
use crate::error::BuildError;
use crate::plan::{CompiledPlan, PlanTensor, TensorRole};
use crate::step::{Kernel, Step};

/// Compile a network into a plan.
///
/// The network is frozen first, so it stays immutable whether or not compilation succeeds. The result only depends
/// on the network and the config: compiling twice yields identical plans.
pub fn compile(network: &mut Network, config: &BuilderConfig) -> Result<CompiledPlan, BuildError> {
    network.freeze();
    let network = &*network;

    if network.outputs().is_empty() {
        return Err(BuildError::NoOutputs);
    }
    if let Some(&tensor) = network.outputs().iter().find(|&&o| network.is_input(o)) {
        return Err(BuildError::InputIsOutput(network[tensor].name.clone()));
    }

    let profiles = resolve_profiles(network, config.profiles())?;
    tracing::debug!("Resolved {} optimization profile(s)", profiles.len());

    let layers = live_layers(network);
    let pruned = network.num_layers() - layers.len();
    if pruned > 0 {
        tracing::debug!("Pruned {} layer(s) that do not contribute to any output", pruned);
    }

    // concrete shapes of every live tensor, for each profile and each of min, opt, max
    let shapes = profiles
        .iter()
        .enumerate()
        .map(|(pi, ranges)| {
            let mut per_bound = vec![];
            for bound in 0..3 {
                let input_shapes = ranges.iter().map(|r| r[bound].clone()).collect_vec();
                per_bound.push(propagate_shapes(network, &layers, &input_shapes, pi)?);
            }
            Ok(per_bound)
        })
        .collect::<Result<Vec<_>, BuildError>>()?;

    let workspace_limit = config.memory_pool_limit(MemoryPoolType::Workspace);
    let mut workspace_size = 0;

    // plan tensor table: inputs first, then layer outputs in execution order
    let mut tensor_index: HashMap<TensorId, usize> = HashMap::new();
    let mut tensors = vec![];
    let mut push_tensor = |tensor: TensorId, tensors: &mut Vec<PlanTensor>| {
        let info = &network[tensor];
        let role = if network.is_input(tensor) {
            TensorRole::Input
        } else if network.is_output(tensor) {
            TensorRole::Output
        } else {
            TensorRole::Intermediate
        };
        tensor_index.insert(tensor, tensors.len());
        tensors.push(PlanTensor {
            name: info.name.clone(),
            dtype: info.desc.dtype,
            shape: info.desc.shape.clone(),
            role,
        });
    };

    for &input in network.inputs() {
        push_tensor(input, &mut tensors);
    }

    let mut steps = vec![];
    for &layer in &layers {
        let info = &network[layer];
        for &output in &info.outputs {
            push_tensor(output, &mut tensors);
        }

        let max_shapes = |pi: usize, list: &[TensorId]| list.iter().map(|t| shapes[pi][2][t].clone()).collect_vec();
        let kernel = Kernel::select(&info.kind, &max_shapes(0, &info.inputs));

        let required = (0..profiles.len())
            .map(|pi| kernel.scratch_bytes(&info.kind, &max_shapes(pi, &info.inputs), &max_shapes(pi, &info.outputs)))
            .max()
            .unwrap_or(0);
        if required > workspace_limit {
            return Err(BuildError::InsufficientWorkspace {
                layer: info.name.clone(),
                required,
                available: workspace_limit,
            });
        }
        workspace_size = workspace_size.max(required);

        tracing::debug!(
            "Layer {:?} ({}) uses kernel {} with {} bytes of scratch",
            info.name,
            info.kind.type_name(),
            kernel.name(),
            required
        );

        steps.push((layer, kernel));
    }

    let steps = steps
        .into_iter()
        .map(|(layer, kernel)| {
            let info = &network[layer];
            Step {
                name: info.name.clone(),
                kind: info.kind.clone(),
                kernel,
                inputs: info.inputs.iter().map(|t| tensor_index[t]).collect(),
                outputs: info.outputs.iter().map(|t| tensor_index[t]).collect(),
            }
        })
        .collect_vec();

    let plan = CompiledPlan {
        inputs: network.inputs().iter().map(|t| tensor_index[t]).collect(),
        outputs: network.outputs().iter().map(|t| tensor_index[t]).collect(),
        tensors,
        profiles,
        steps,
        workspace_size,
        workspace_limit,
    };

    tracing::info!(
        "Compiled plan with {} steps, {} tensors, {} profile(s) and {} bytes of workspace",
        plan.steps.len(),
        plan.tensors.len(),
        plan.profiles.len(),
        plan.workspace_size
    );

    Ok(plan)
}

/// Turn the user profiles into per-input `[min, opt, max]` ranges, in network input order.
///
/// Fixed inputs that a profile does not mention get a degenerate range. If no profiles are given at all and every
/// input is fixed, a single implicit profile is created.
fn resolve_profiles(
    network: &Network,
    profiles: &[OptimizationProfile],
) -> Result<Vec<Vec<[ConcreteShape; 3]>>, BuildError> {
    if profiles.is_empty() {
        let implicit = OptimizationProfile::default();
        return Ok(vec![resolve_profile(network, &implicit, 0)?]);
    }

    profiles
        .iter()
        .enumerate()
        .map(|(pi, profile)| resolve_profile(network, profile, pi))
        .collect()
}

fn resolve_profile(
    network: &Network,
    profile: &OptimizationProfile,
    index: usize,
) -> Result<Vec<[ConcreteShape; 3]>, BuildError> {
    for (name, _) in profile.shapes() {
        let is_input = network
            .tensor_by_name(name)
            .map_or(false, |tensor| network.is_input(tensor));
        if !is_input {
            return Err(BuildError::UnknownProfileTensor {
                name: name.to_owned(),
                profile: index,
            });
        }
    }

    network
        .inputs()
        .iter()
        .map(|&input| {
            let info = &network[input];
            let declared = &info.desc.shape;

            let range = match profile.get_shape(&info.name) {
                Some(range) => range.clone(),
                None => match declared.as_fixed() {
                    Some(fixed) => [fixed.clone(), fixed.clone(), fixed],
                    None => {
                        return Err(BuildError::MissingProfile {
                            name: info.name.clone(),
                            profile: index,
                        })
                    }
                },
            };

            let invalid = |reason: String| BuildError::InvalidProfile {
                name: info.name.clone(),
                profile: index,
                reason,
            };

            for shape in &range {
                if !declared.contains(shape) {
                    return Err(invalid(format!("shape {} does not fit declared shape {}", shape, declared)));
                }
                if shape.dims.contains(&0) {
                    return Err(invalid(format!("shape {} has a zero dimension", shape)));
                }
            }
            let [min, opt, max] = &range;
            if !min.all_le(opt) || !opt.all_le(max) {
                return Err(invalid(format!("expected min {} <= opt {} <= max {}", min, opt, max)));
            }

            tracing::trace!("Profile {} input {:?}: {} .. {} .. {}", index, info.name, min, opt, max);
            Ok(range)
        })
        .collect()
}

/// The layers that (transitively) contribute to a network output, in network order.
fn live_layers(network: &Network) -> Vec<LayerId> {
    let mut needed: HashSet<TensorId> = network.outputs().iter().copied().collect();
    let mut live = vec![];

    for layer in network.layers().collect_vec().into_iter().rev() {
        let info = &network[layer];
        if info.outputs.iter().any(|o| needed.contains(o)) {
            needed.extend(info.inputs.iter().copied());
            live.push(layer);
        }
    }

    live.reverse();
    live
}

/// Infer the concrete shape of every tensor used by `layers`, given concrete input shapes.
fn propagate_shapes(
    network: &Network,
    layers: &[LayerId],
    input_shapes: &[ConcreteShape],
    profile: usize,
) -> Result<HashMap<TensorId, ConcreteShape>, BuildError> {
    let mut shapes: HashMap<TensorId, ConcreteShape> = HashMap::new();
    for (&input, shape) in network.inputs().iter().zip_eq(input_shapes) {
        shapes.insert(input, shape.clone());
    }

    for &layer in layers {
        let info = &network[layer];
        let input_descs = info
            .inputs
            .iter()
            .map(|t| TensorDesc {
                dtype: network[*t].desc.dtype,
                shape: Shape::from(&shapes[t]),
            })
            .collect_vec();

        let outputs = concrete_outputs(&info.kind, &input_descs).map_err(|source| BuildError::Shape {
            layer: info.name.clone(),
            profile,
            source,
        })?;

        for (&tensor, shape) in info.outputs.iter().zip_eq(outputs) {
            debug_assert!(network[tensor].desc.shape.contains(&shape));
            shapes.insert(tensor, shape);
        }
    }

    Ok(shapes)
}

/// Run shape inference on fully known input shapes.
pub(crate) fn concrete_outputs(
    kind: &kiln_graph::layer::LayerKind,
    inputs: &[TensorDesc],
) -> Result<Vec<ConcreteShape>, ConstructionError> {
    let outputs = kind.infer(inputs)?;
    Ok(outputs
        .into_iter()
        .map(|desc| {
            desc.shape
                .as_fixed()
                .unwrap_or_else(|| panic!("Inference on fixed shapes produced dynamic shape {}", desc.shape))
        })
        .collect())
}

#[cfg(test)]
mod test {
    use kiln_graph::dtype::DType;
    use kiln_graph::layer::*;
    use kiln_graph::network::Network;
    use kiln_graph::shape;
    use kiln_graph::shape::Dim;

    use crate::builder::{BuilderConfig, OptimizationProfile};
    use crate::error::BuildError;
    use crate::planner::compile;
    use crate::plan::TensorRole;

    #[test]
    fn dead_layers_are_pruned() {
        let mut network = Network::new();
        let x = network.declare_input("x", DType::F32, shape![2, 3]).unwrap();
        let relu = network.add_activation(x, ActivationType::Relu).unwrap();
        let _unused = network.add_activation(x, ActivationType::Sigmoid).unwrap();
        network.mark_output(network[relu].output(0)).unwrap();

        let plan = compile(&mut network, &BuilderConfig::default()).unwrap();
        assert!(network.is_frozen());
        assert_eq!(1, plan.steps.len());
        assert_eq!(2, plan.tensors.len());
        assert_eq!(vec![TensorRole::Input, TensorRole::Output], plan.tensors.iter().map(|t| t.role).collect::<Vec<_>>());
        assert_eq!(1, plan.profiles.len());
    }

    #[test]
    fn dynamic_input_needs_profile() {
        let mut network = Network::new();
        let x = network.declare_input("x", DType::F32, shape![Dim::DYNAMIC, 3]).unwrap();
        let relu = network.add_activation(x, ActivationType::Relu).unwrap();
        network.mark_output(network[relu].output(0)).unwrap();

        let result = compile(&mut network, &BuilderConfig::default());
        assert_eq!(
            Err(BuildError::MissingProfile {
                name: "x".to_owned(),
                profile: 0
            }),
            result.map(|_| ())
        );
    }

    #[test]
    fn profile_order_is_checked() {
        let mut network = Network::new();
        let x = network.declare_input("x", DType::F32, shape![Dim::DYNAMIC, 3]).unwrap();
        let relu = network.add_activation(x, ActivationType::Relu).unwrap();
        network.mark_output(network[relu].output(0)).unwrap();

        let mut profile = OptimizationProfile::default();
        profile.set_shape("x", [4, 3], [2, 3], [8, 3]);
        let mut config = BuilderConfig::default();
        config.add_optimization_profile(profile);

        match compile(&mut network, &config) {
            Err(BuildError::InvalidProfile { name, profile, .. }) => {
                assert_eq!("x", name);
                assert_eq!(0, profile);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn unknown_profile_tensor() {
        let mut network = Network::new();
        let x = network.declare_input("x", DType::F32, shape![1, 3]).unwrap();
        let relu = network.add_activation(x, ActivationType::Relu).unwrap();
        network.mark_output(network[relu].output(0)).unwrap();

        let mut profile = OptimizationProfile::default();
        profile.set_shape("y", [1, 3], [1, 3], [1, 3]);
        let mut config = BuilderConfig::default();
        config.add_optimization_profile(profile);

        assert!(matches!(
            compile(&mut network, &config),
            Err(BuildError::UnknownProfileTensor { .. })
        ));
    }

    #[test]
    fn no_outputs() {
        let mut network = Network::new();
        network.declare_input("x", DType::F32, shape![1, 3]).unwrap();
        assert_eq!(
            Err(BuildError::NoOutputs),
            compile(&mut network, &BuilderConfig::default()).map(|_| ())
        );
        assert!(network.is_frozen());
    }

    #[test]
    fn compile_is_deterministic() {
        let build = || {
            let mut network = Network::new();
            let x = network.declare_input("x", DType::F32, shape![Dim::DYNAMIC, 4]).unwrap();
            let softmax = network.add_softmax(x, 1).unwrap();
            let topk = network.add_topk(network[softmax].output(0), TopKOp::Max, 2, 1).unwrap();
            network.mark_output(network[topk].output(1)).unwrap();

            let mut profile = OptimizationProfile::default();
            profile.set_shape("x", [1, 4], [2, 4], [8, 4]);
            let mut config = BuilderConfig::default();
            config.add_optimization_profile(profile);
            compile(&mut network, &config).unwrap()
        };

        assert_eq!(build(), build());
    }
}
