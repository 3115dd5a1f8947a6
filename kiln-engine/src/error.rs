use thiserror::Error;

use kiln_device::error::{DeviceError, TransferError};
use kiln_graph::error::ConstructionError;
use kiln_graph::shape::{ConcreteShape, Shape};

/// Compilation failed. The network stays frozen.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum BuildError {
    #[error("network has no outputs")]
    NoOutputs,
    #[error("tensor {0:?} is both a network input and a network output")]
    InputIsOutput(String),
    #[error("dynamic input {name:?} has no shape range in optimization profile {profile}")]
    MissingProfile { name: String, profile: usize },
    #[error("optimization profile {profile} names {name:?}, which is not a network input")]
    UnknownProfileTensor { name: String, profile: usize },
    #[error("invalid shape range for {name:?} in optimization profile {profile}: {reason}")]
    InvalidProfile {
        name: String,
        profile: usize,
        reason: String,
    },
    #[error("layer {layer:?} fails for the shapes of optimization profile {profile}: {source}")]
    Shape {
        layer: String,
        profile: usize,
        source: ConstructionError,
    },
    #[error("layer {layer:?} needs {required} bytes of workspace, the limit is {available}")]
    InsufficientWorkspace {
        layer: String,
        required: usize,
        available: usize,
    },
}

/// A context was used with missing, invalid or conflicting shapes and bindings.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum BindingError {
    #[error("engine has no I/O tensor named {0:?}")]
    UnknownTensor(String),
    #[error("tensor {0:?} is not an input")]
    NotAnInput(String),
    #[error("optimization profile {index} does not exist, the engine has {count}")]
    InvalidProfileIndex { index: usize, count: usize },
    #[error("shape {shape} for input {name:?} does not match the declared shape {declared}")]
    ShapeMismatch {
        name: String,
        shape: ConcreteShape,
        declared: Shape,
    },
    #[error("shape {shape} for input {name:?} is outside the profile range {min} ..= {max}")]
    ShapeOutOfProfile {
        name: String,
        shape: ConcreteShape,
        min: ConcreteShape,
        max: ConcreteShape,
    },
    #[error("shape of input {0:?} has not been set")]
    ShapeUnset(String),
    #[error("layer {layer:?} fails for the current input shapes: {source}")]
    ShapeInference { layer: String, source: ConstructionError },
    #[error("no address bound for tensor {0:?}")]
    AddressUnset(String),
    #[error("address bound to {name:?} is not usable: {source}")]
    InvalidAddress { name: String, source: TransferError },
    #[error("failed to allocate execution memory: {0}")]
    Allocation(DeviceError),
    #[error("the previous run of this context is still in flight")]
    InFlight,
}

/// A serialized plan could not be loaded.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum PlanError {
    #[error("not a kiln plan, wrong magic bytes")]
    BadMagic,
    #[error("unsupported plan format version {0}")]
    UnsupportedVersion(u32),
    #[error("plan data is truncated")]
    Truncated,
    #[error("plan data is corrupt: {0}")]
    Corrupt(String),
}

/// Any error raised while building or running a network, tagged by the stage that failed.
#[derive(Debug, Error)]
pub enum KilnError {
    #[error("construct: {0}")]
    Construct(#[from] ConstructionError),
    #[error("compile: {0}")]
    Compile(#[from] BuildError),
    #[error("load: {0}")]
    Load(#[from] PlanError),
    #[error("bind: {0}")]
    Bind(#[from] BindingError),
    #[error("run: {0}")]
    Run(#[from] DeviceError),
    #[error("transfer: {0}")]
    Transfer(#[from] TransferError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl KilnError {
    pub fn stage(&self) -> &'static str {
        match self {
            KilnError::Construct(_) => "construct",
            KilnError::Compile(_) => "compile",
            KilnError::Load(_) => "load",
            KilnError::Bind(_) => "bind",
            KilnError::Run(_) => "run",
            KilnError::Transfer(_) => "transfer",
            KilnError::Io(_) => "io",
        }
    }
}
