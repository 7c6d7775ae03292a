use std::collections::BTreeMap;

use core_types::{BufferId, DataType, DeviceKind, ViewDescriptor};
use derive_more::From;
use tensor::{Shape, Tensor};
use thiserror::Error;

/// String-keyed operator arguments, as they appear in a graph definition
pub type ParamMap = BTreeMap<String, String>;

/// Position of a tensor in the host graph; used by dependency and in-place declarations
pub type TensorId = usize;

/// Dynamically-typed tensor handle
#[derive(Debug, Clone, From)]
pub enum TensorAny {
    F32(Tensor<f32>),
    I32(Tensor<i32>),
    U32(Tensor<u32>),
}

impl TensorAny {
    pub fn dtype(&self) -> DataType {
        match self {
            TensorAny::F32(_) => DataType::F32,
            TensorAny::I32(_) => DataType::I32,
            TensorAny::U32(_) => DataType::U32,
        }
    }

    pub fn view(&self) -> &ViewDescriptor {
        match self {
            TensorAny::F32(t) => t.view(),
            TensorAny::I32(t) => t.view(),
            TensorAny::U32(t) => t.view(),
        }
    }

    pub fn buffer_id(&self) -> BufferId {
        match self {
            TensorAny::F32(t) => t.buffer_id(),
            TensorAny::I32(t) => t.buffer_id(),
            TensorAny::U32(t) => t.buffer_id(),
        }
    }

    pub fn device(&self) -> DeviceKind {
        match self {
            TensorAny::F32(t) => t.device(),
            TensorAny::I32(t) => t.device(),
            TensorAny::U32(t) => t.device(),
        }
    }

    pub fn shape(&self) -> Shape {
        self.view().dims()
    }

    pub fn as_f32(&self) -> Option<&Tensor<f32>> {
        match self {
            TensorAny::F32(t) => Some(t),
            _ => None,
        }
    }
}

/// How a kernel writes one output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteReq {
    /// Leave the output untouched
    Null,
    /// Overwrite a buffer distinct from every input
    #[default]
    WriteTo,
    /// Overwrite; the buffer may be shared with the declared in-place source
    WriteInplace,
    /// Accumulate into the existing contents
    AddTo,
}

/// Errors raised while configuring, inferring or running an operator
#[derive(Debug, Error)]
pub enum OpError {
    #[error("{op}: invalid parameter `{field}`: {reason}")]
    Parse { op: &'static str, field: String, reason: String },

    #[error("{op}: expected {expected} {what}, got {found}")]
    ArgumentCount { op: &'static str, what: &'static str, expected: usize, found: usize },

    #[error("{op}: shape mismatch on `{arg}`: expected {expected:?}, got {found:?}")]
    ShapeMismatch { op: &'static str, arg: &'static str, expected: Shape, found: Shape },

    #[error("{op}: shape of `{arg}` is not known yet")]
    IncompleteShape { op: &'static str, arg: &'static str },

    #[error("unknown operator `{0}`")]
    UnknownOp(String),

    #[error("{op}: no kernel registered for device {device}")]
    UnsupportedDevice { op: &'static str, device: DeviceKind },

    #[error("{op}: `{arg}` has dtype {found:?}, expected one of {expected:?}")]
    DtypeMismatch { op: &'static str, arg: &'static str, expected: Vec<DataType>, found: DataType },

    #[error("{op}: buffer {id} of `{arg}` is not resident on {device}")]
    MissingBuffer { op: &'static str, arg: &'static str, id: BufferId, device: DeviceKind },

    #[error(transparent)]
    Device(#[from] anyhow::Error),
}

impl OpError {
    /// Only an incomplete shape is worth retrying, once upstream shapes resolve
    pub fn is_retryable(&self) -> bool {
        matches!(self, OpError::IncompleteShape { .. })
    }
}

/// Fail unless a tensor list has exactly the declared length
pub fn check_count(op: &'static str, what: &'static str, expected: usize, found: usize) -> Result<(), OpError> {
    if expected != found {
        return Err(OpError::ArgumentCount { op, what, expected, found });
    }
    Ok(())
}
