use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::Arc;

use kiln_graph::dtype::DType;
use kiln_graph::shape::{ConcreteShape, Shape};

use crate::context::ExecutionContext;
use crate::error::{BindingError, KilnError, PlanError};
use crate::plan::CompiledPlan;

/// Loads engines from serialized plans.
#[derive(Debug, Default)]
pub struct Runtime {
    _private: (),
}

impl Runtime {
    pub fn new() -> Self {
        Runtime { _private: () }
    }

    pub fn deserialize_engine(&self, data: &[u8]) -> Result<Engine, PlanError> {
        let plan = CompiledPlan::deserialize(data)?;
        tracing::debug!(
            "Loaded plan of {} bytes with {} steps and {} I/O tensors",
            data.len(),
            plan.steps.len(),
            plan.inputs.len() + plan.outputs.len()
        );
        Ok(Engine::new(plan))
    }

    /// Read a plan written by [Engine::save] and load it.
    pub fn load_engine(&self, path: impl AsRef<Path>) -> Result<Engine, KilnError> {
        let data = std::fs::read(path)?;
        Ok(self.deserialize_engine(&data)?)
    }
}

/// A compiled, immutable network. Cloning is cheap, all clones share the same plan.
#[derive(Debug, Clone)]
pub struct Engine {
    plan: Arc<CompiledPlan>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TensorIoMode {
    Input,
    Output,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IoTensor {
    pub name: String,
    pub dtype: DType,
    pub shape: Shape,
    pub mode: TensorIoMode,
}

impl Display for TensorIoMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TensorIoMode::Input => write!(f, "Input"),
            TensorIoMode::Output => write!(f, "Output"),
        }
    }
}

impl Engine {
    pub(crate) fn new(plan: CompiledPlan) -> Self {
        Engine { plan: Arc::new(plan) }
    }

    pub(crate) fn plan(&self) -> &Arc<CompiledPlan> {
        &self.plan
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.plan.serialize()
    }

    /// Write the serialized plan to `path`, returning the number of bytes written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<usize, KilnError> {
        let data = self.serialize();
        std::fs::write(path, &data)?;
        Ok(data.len())
    }

    pub fn num_io_tensors(&self) -> usize {
        self.plan.inputs.len() + self.plan.outputs.len()
    }

    /// All I/O tensors, inputs first, each group in declaration order.
    pub fn io_tensors(&self) -> Vec<IoTensor> {
        self.plan
            .io_tensors()
            .map(|t| {
                let tensor = &self.plan.tensors[t];
                IoTensor {
                    name: tensor.name.clone(),
                    dtype: tensor.dtype,
                    shape: tensor.shape.clone(),
                    mode: self.mode_of(t),
                }
            })
            .collect()
    }

    pub fn tensor_name(&self, index: usize) -> Option<&str> {
        self.plan.io_tensors().nth(index).map(|t| self.plan.tensors[t].name.as_str())
    }

    pub fn tensor_dtype(&self, name: &str) -> Result<DType, BindingError> {
        Ok(self.plan.tensors[self.find(name)?].dtype)
    }

    /// The declared shape, `-1` marks dynamic dimensions.
    pub fn tensor_shape(&self, name: &str) -> Result<Shape, BindingError> {
        Ok(self.plan.tensors[self.find(name)?].shape.clone())
    }

    pub fn tensor_mode(&self, name: &str) -> Result<TensorIoMode, BindingError> {
        Ok(self.mode_of(self.find(name)?))
    }

    pub fn num_optimization_profiles(&self) -> usize {
        self.plan.profiles.len()
    }

    /// The `[min, opt, max]` shapes of input `name` in the given profile.
    pub fn profile_shape(&self, name: &str, profile: usize) -> Result<[ConcreteShape; 3], BindingError> {
        let t = self.find(name)?;
        let position = self
            .plan
            .input_position(t)
            .ok_or_else(|| BindingError::NotAnInput(name.to_owned()))?;
        let ranges = self.plan.profiles.get(profile).ok_or(BindingError::InvalidProfileIndex {
            index: profile,
            count: self.plan.profiles.len(),
        })?;
        Ok(ranges[position].clone())
    }

    pub fn workspace_size(&self) -> usize {
        self.plan.workspace_size
    }

    pub fn num_layers(&self) -> usize {
        self.plan.steps.len()
    }

    /// Describe the selected kernel of every layer, one line each.
    pub fn layer_info(&self) -> Vec<String> {
        self.plan.steps.iter().map(|s| s.describe()).collect()
    }

    pub fn create_execution_context(&self) -> ExecutionContext {
        ExecutionContext::new(self.clone())
    }

    fn find(&self, name: &str) -> Result<usize, BindingError> {
        self.plan
            .find_io_tensor(name)
            .ok_or_else(|| BindingError::UnknownTensor(name.to_owned()))
    }

    fn mode_of(&self, t: usize) -> TensorIoMode {
        if self.plan.input_position(t).is_some() {
            TensorIoMode::Input
        } else {
            TensorIoMode::Output
        }
    }
}
