use thiserror::Error;

use crate::dtype::DType;
use crate::network::{LayerId, TensorId};

pub type ConstructionResult<T> = Result<T, ConstructionError>;

/// A malformed network: a dangling or foreign tensor reference, an invalid attribute,
/// or shapes that can never be made to match.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ConstructionError {
    #[error("tensor {0:?} does not belong to this network")]
    ForeignTensor(TensorId),
    #[error("layer {0:?} does not belong to this network")]
    ForeignLayer(LayerId),
    #[error("network is frozen, it can no longer be modified after compilation")]
    Frozen,

    #[error("duplicate tensor name {0:?}")]
    DuplicateTensorName(String),
    #[error("duplicate layer name {0:?}")]
    DuplicateLayerName(String),
    #[error("tensor {0:?} is already marked as an output")]
    DuplicateOutput(String),
    #[error("input {name:?} has invalid shape {shape}")]
    InvalidInputShape { name: String, shape: String },

    #[error("{layer} layer expects {expected} inputs, got {actual}")]
    InputCount {
        layer: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{layer} layer does not support dtype {dtype} for input {index}")]
    UnsupportedDType {
        layer: &'static str,
        index: usize,
        dtype: DType,
    },
    #[error("invalid {layer} layer attributes: {reason}")]
    InvalidAttribute { layer: &'static str, reason: String },
    #[error("{layer} layer shape mismatch: {reason}")]
    ShapeMismatch { layer: &'static str, reason: String },
}

impl ConstructionError {
    pub(crate) fn attribute(layer: &'static str, reason: impl Into<String>) -> Self {
        ConstructionError::InvalidAttribute {
            layer,
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(layer: &'static str, reason: impl Into<String>) -> Self {
        ConstructionError::ShapeMismatch {
            layer,
            reason: reason.into(),
        }
    }
}
