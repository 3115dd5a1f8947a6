use std::sync::Arc;

use itertools::Itertools;

use kiln_device::device::{Device, DeviceBuffer, DevicePtr};
use kiln_device::stream::{Event, Stream};
use kiln_graph::layer::TensorDesc;
use kiln_graph::shape::{ConcreteShape, Shape};

use crate::error::BindingError;
use crate::plan::{CompiledPlan, TensorRole};
use crate::planner::concrete_outputs;
use crate::runtime::Engine;
use crate::step::RunBindings;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ContextState {
    /// At least one dynamic input shape has not been set yet.
    ShapesUnset,
    /// All input shapes are known, some I/O tensors have no address yet.
    ShapesSet,
    /// Ready to enqueue.
    AddressesBound,
    /// The last enqueued run has not finished yet.
    Running,
    /// The last enqueued run has finished and all input shapes are still set.
    Idle,
}

/// Per-run state for an [Engine]: the selected profile, concrete input shapes and bound tensor addresses.
///
/// Several contexts can be created for the same engine and used concurrently on different streams.
/// Intermediate tensors and the workspace are allocated lazily by the first [ExecutionContext::enqueue] and reused
/// as long as the shapes and the device stay the same.
#[derive(Debug)]
pub struct ExecutionContext {
    engine: Engine,
    profile: usize,

    /// Indexed like the plan inputs.
    input_shapes: Vec<Option<ConcreteShape>>,
    /// Indexed like the plan tensors, only I/O tensors are ever set.
    addresses: Vec<Option<DevicePtr>>,

    memory: Option<Arc<RunMemory>>,
    last_run: Option<Event>,
}

/// Device memory owned by a context, kept alive by in-flight runs.
#[derive(Debug)]
struct RunMemory {
    device: Device,
    shapes: Vec<ConcreteShape>,
    intermediates: Vec<Option<DeviceBuffer>>,
    /// Holds the scratch memory budget on the device for as long as the context may run. Steps do not read it.
    _workspace: Option<DeviceBuffer>,
}

impl ExecutionContext {
    pub(crate) fn new(engine: Engine) -> Self {
        let plan = engine.plan().clone();
        let input_shapes = plan.inputs.iter().map(|&i| plan.tensors[i].shape.as_fixed()).collect();

        ExecutionContext {
            engine,
            profile: 0,
            input_shapes,
            addresses: vec![None; plan.tensors.len()],
            memory: None,
            last_run: None,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    fn plan(&self) -> &CompiledPlan {
        self.engine.plan()
    }

    pub fn optimization_profile(&self) -> usize {
        self.profile
    }

    /// Select the profile subsequent input shapes are checked against. Dynamic input shapes have to be set again.
    pub fn set_optimization_profile(&mut self, index: usize) -> Result<(), BindingError> {
        self.check_idle()?;
        let count = self.plan().profiles.len();
        if index >= count {
            return Err(BindingError::InvalidProfileIndex { index, count });
        }

        self.profile = index;
        let plan = self.engine.plan().clone();
        for (slot, &input) in self.input_shapes.iter_mut().zip_eq(&plan.inputs) {
            *slot = plan.tensors[input].shape.as_fixed();
        }
        Ok(())
    }

    pub fn set_input_shape(&mut self, name: &str, shape: impl Into<ConcreteShape>) -> Result<(), BindingError> {
        self.check_idle()?;
        let shape = shape.into();

        let plan = self.plan();
        let (t, position) = self.find_input(name)?;
        let declared = &plan.tensors[t].shape;
        if !declared.contains(&shape) {
            return Err(BindingError::ShapeMismatch {
                name: name.to_owned(),
                shape,
                declared: declared.clone(),
            });
        }

        let [min, _, max] = &plan.profiles[self.profile][position];
        if !min.all_le(&shape) || !shape.all_le(max) {
            return Err(BindingError::ShapeOutOfProfile {
                name: name.to_owned(),
                shape,
                min: min.clone(),
                max: max.clone(),
            });
        }

        self.input_shapes[position] = Some(shape);
        Ok(())
    }

    pub fn all_input_shapes_specified(&self) -> bool {
        self.input_shapes.iter().all(|s| s.is_some())
    }

    /// The concrete shape of an I/O tensor for the current input shapes.
    pub fn tensor_shape(&self, name: &str) -> Result<ConcreteShape, BindingError> {
        let t = self.find(name)?;
        Ok(self.resolve_shapes()?.swap_remove(t))
    }

    pub fn tensor_size_bytes(&self, name: &str) -> Result<usize, BindingError> {
        let t = self.find(name)?;
        let dtype = self.plan().tensors[t].dtype;
        Ok(self.tensor_shape(name)?.size() * dtype.size().bytes())
    }

    /// Bind the device address an I/O tensor is read from or written to by the next run.
    ///
    /// The address is only validated when the run is enqueued.
    pub fn set_tensor_address(&mut self, name: &str, ptr: DevicePtr) -> Result<(), BindingError> {
        self.check_idle()?;
        let t = self.find(name)?;
        self.addresses[t] = Some(ptr);
        Ok(())
    }

    pub fn tensor_address(&self, name: &str) -> Result<Option<DevicePtr>, BindingError> {
        Ok(self.addresses[self.find(name)?])
    }

    pub fn state(&self) -> ContextState {
        let running = self.last_run.as_ref().map(|event| !event.is_complete());

        if running == Some(true) {
            ContextState::Running
        } else if !self.all_input_shapes_specified() {
            ContextState::ShapesUnset
        } else if running == Some(false) {
            ContextState::Idle
        } else if self.plan().io_tensors().all(|t| self.addresses[t].is_some()) {
            ContextState::AddressesBound
        } else {
            ContextState::ShapesSet
        }
    }

    /// Validate shapes and bindings, then enqueue a run of the whole plan on `stream` and return immediately.
    ///
    /// Failures inside the run itself, for example because a bound buffer was freed before the run got to it,
    /// are reported by [Stream::synchronize].
    pub fn enqueue(&mut self, stream: &Stream) -> Result<(), BindingError> {
        self.check_idle()?;

        let plan = self.engine.plan().clone();
        let device = stream.device();
        let shapes = self.resolve_shapes()?;

        for t in plan.io_tensors() {
            let tensor = &plan.tensors[t];
            let ptr = self.addresses[t].ok_or_else(|| BindingError::AddressUnset(tensor.name.clone()))?;
            let len = shapes[t].size() * tensor.dtype.size().bytes();
            device
                .check_range(ptr, len)
                .map_err(|source| BindingError::InvalidAddress {
                    name: tensor.name.clone(),
                    source,
                })?;
        }

        let memory = self.run_memory(device, &shapes)?;

        let ptrs = plan
            .tensors
            .iter()
            .enumerate()
            .map(|(t, tensor)| {
                let ptr = match tensor.role {
                    TensorRole::Intermediate => memory.intermediates[t].as_ref().map(|buffer| buffer.ptr()),
                    TensorRole::Input | TensorRole::Output => self.addresses[t],
                };
                ptr.ok_or_else(|| BindingError::AddressUnset(tensor.name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let bindings = RunBindings {
            dtypes: plan.tensors.iter().map(|t| t.dtype).collect(),
            shapes,
            ptrs,
        };

        tracing::debug!(
            "Enqueueing run of {} steps with profile {} on {}",
            plan.steps.len(),
            self.profile,
            device.name()
        );

        let device = device.clone();
        let job_memory = memory.clone();
        let event = stream.enqueue(move || {
            let _memory = job_memory;
            for step in &plan.steps {
                step.run(&device, &bindings)?;
            }
            Ok(())
        });

        self.last_run = Some(event);
        Ok(())
    }

    fn check_idle(&self) -> Result<(), BindingError> {
        match &self.last_run {
            Some(event) if !event.is_complete() => Err(BindingError::InFlight),
            _ => Ok(()),
        }
    }

    fn find(&self, name: &str) -> Result<usize, BindingError> {
        self.plan()
            .find_io_tensor(name)
            .ok_or_else(|| BindingError::UnknownTensor(name.to_owned()))
    }

    fn find_input(&self, name: &str) -> Result<(usize, usize), BindingError> {
        let t = self.find(name)?;
        let position = self
            .plan()
            .input_position(t)
            .ok_or_else(|| BindingError::NotAnInput(name.to_owned()))?;
        Ok((t, position))
    }

    /// Concrete shapes for all plan tensors, given the current input shapes.
    fn resolve_shapes(&self) -> Result<Vec<ConcreteShape>, BindingError> {
        let plan = self.plan();
        let mut shapes: Vec<Option<ConcreteShape>> = vec![None; plan.tensors.len()];

        for (&input, shape) in plan.inputs.iter().zip_eq(&self.input_shapes) {
            let shape = shape
                .clone()
                .ok_or_else(|| BindingError::ShapeUnset(plan.tensors[input].name.clone()))?;
            shapes[input] = Some(shape);
        }

        for step in &plan.steps {
            let inputs = step
                .inputs
                .iter()
                .map(|&i| TensorDesc {
                    dtype: plan.tensors[i].dtype,
                    shape: Shape::from(shapes[i].as_ref().expect("step inputs are resolved first")),
                })
                .collect_vec();
            let outputs = concrete_outputs(&step.kind, &inputs).map_err(|source| BindingError::ShapeInference {
                layer: step.name.clone(),
                source,
            })?;
            for (&o, shape) in step.outputs.iter().zip_eq(outputs) {
                shapes[o] = Some(shape);
            }
        }

        Ok(shapes
            .into_iter()
            .map(|s| s.expect("every plan tensor is an input or written by a step"))
            .collect())
    }

    /// Get memory for intermediates and the workspace, reusing the previous allocation if it still fits.
    fn run_memory(&mut self, device: &Device, shapes: &[ConcreteShape]) -> Result<Arc<RunMemory>, BindingError> {
        if let Some(memory) = &self.memory {
            if memory.device.same_device(device) && memory.shapes == shapes {
                return Ok(memory.clone());
            }
        }

        let plan = self.engine.plan().clone();
        let intermediates = plan
            .tensors
            .iter()
            .zip_eq(shapes)
            .map(|(tensor, shape)| match tensor.role {
                TensorRole::Intermediate => device
                    .alloc(shape.size() * tensor.dtype.size().bytes())
                    .map(Some),
                TensorRole::Input | TensorRole::Output => Ok(None),
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(BindingError::Allocation)?;

        let workspace = if plan.workspace_size > 0 {
            Some(device.alloc(plan.workspace_size).map_err(BindingError::Allocation)?)
        } else {
            None
        };

        tracing::debug!(
            "Allocated {} intermediate buffers and {} bytes of workspace on {}",
            intermediates.iter().filter(|b| b.is_some()).count(),
            plan.workspace_size,
            device.name()
        );

        let memory = Arc::new(RunMemory {
            device: device.clone(),
            shapes: shapes.to_vec(),
            intermediates,
            _workspace: workspace,
        });
        self.memory = Some(memory.clone());
        Ok(memory)
    }
}

#[cfg(test)]
mod test {
    use kiln_graph::dtype::DType;
    use kiln_graph::layer::ActivationType;
    use kiln_graph::shape;
    use kiln_graph::shape::Dim;

    use kiln_device::device::Device;
    use kiln_device::stream::Stream;

    use crate::builder::Builder;
    use crate::context::ContextState;
    use crate::error::BindingError;
    use crate::runtime::Engine;

    fn relu_engine() -> Engine {
        let builder = Builder::new();
        let mut network = builder.create_network();
        let x = network.declare_input("x", DType::F32, shape![Dim::DYNAMIC, 3]).unwrap();
        let relu = network.add_activation(x, ActivationType::Relu).unwrap();
        network.mark_output(network[relu].output(0)).unwrap();

        let mut profile = builder.create_optimization_profile();
        profile.set_shape("x", [1, 3], [2, 3], [4, 3]);
        let mut config = builder.create_config();
        config.add_optimization_profile(profile);
        builder.build_engine(&mut network, &config).unwrap()
    }

    #[test]
    fn output_shape_follows_input() {
        let engine = relu_engine();
        let output = engine.tensor_name(1).unwrap().to_owned();
        let mut context = engine.create_execution_context();

        assert_eq!(ContextState::ShapesUnset, context.state());
        assert_eq!(Err(BindingError::ShapeUnset("x".to_owned())), context.tensor_shape(&output));

        context.set_input_shape("x", [3, 3]).unwrap();
        assert_eq!(ContextState::ShapesSet, context.state());
        assert_eq!(&[3, 3], context.tensor_shape(&output).unwrap().dims.as_slice());
        assert_eq!(36, context.tensor_size_bytes(&output).unwrap());
    }

    #[test]
    fn shape_checks() {
        let engine = relu_engine();
        let output = engine.tensor_name(1).unwrap().to_owned();
        let mut context = engine.create_execution_context();

        assert!(matches!(
            context.set_input_shape("x", [2, 4]),
            Err(BindingError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            context.set_input_shape("x", [5, 3]),
            Err(BindingError::ShapeOutOfProfile { .. })
        ));
        assert_eq!(
            Err(BindingError::NotAnInput(output.clone())),
            context.set_input_shape(&output, [1, 3])
        );
        assert_eq!(
            Err(BindingError::UnknownTensor("y".to_owned())),
            context.set_input_shape("y", [1, 3])
        );
        assert_eq!(
            Err(BindingError::InvalidProfileIndex { index: 1, count: 1 }),
            context.set_optimization_profile(1)
        );
    }

    #[test]
    fn profile_switch_unsets_shapes() {
        let engine = relu_engine();
        let output = engine.tensor_name(1).unwrap().to_owned();
        let mut context = engine.create_execution_context();

        let device = Device::new(0);
        let input_buffer = device.alloc(4 * 3 * 4).unwrap();
        let output_buffer = device.alloc(4 * 3 * 4).unwrap();
        context.set_input_shape("x", [2, 3]).unwrap();
        context.set_tensor_address("x", input_buffer.ptr()).unwrap();
        context.set_tensor_address(&output, output_buffer.ptr()).unwrap();
        assert_eq!(ContextState::AddressesBound, context.state());

        let stream = Stream::new(&device);
        context.enqueue(&stream).unwrap();
        stream.synchronize().unwrap();
        assert_eq!(ContextState::Idle, context.state());

        context.set_optimization_profile(0).unwrap();
        assert_eq!(ContextState::ShapesUnset, context.state());
        let result = context.enqueue(&stream);
        assert!(matches!(result, Err(BindingError::ShapeUnset(_))), "got {:?}", result);

        context.set_input_shape("x", [4, 3]).unwrap();
        assert_eq!(ContextState::Idle, context.state());
        context.enqueue(&stream).unwrap();
        stream.synchronize().unwrap();
    }
}
