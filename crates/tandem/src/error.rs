use std::time::Duration;

use thiserror::Error;

use crate::backend::spec::{BackendError, ModuleSerdeError};
use crate::backend::text_ir::TextIrError;
use crate::runtime::device::DeviceId;

/// Fieldless discriminant of [`RuntimeError`], convenient for matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DeviceNotFound,
    ModuleLoad,
    DeviceMismatch,
    SizeMismatch,
    EntryPointNotFound,
    Invocation,
    OutputsExhausted,
    Timeout,
    InvalidState,
    InvalidPipeline,
    Backend,
}

/// Why a module image was rejected.
#[derive(Debug, Error)]
pub enum ModuleLoadError {
    #[error("module image is not valid utf-8 text, json or a binary image")]
    UnrecognizedFormat,
    #[error(transparent)]
    Text(#[from] TextIrError),
    #[error(transparent)]
    Serde(#[from] ModuleSerdeError),
    #[error("i/o error reading module: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Invalid(String),
    #[error("module requires drivers [{}] but the session device is `{device_driver}`", required.join(", "))]
    UnsatisfiedRequirement {
        required: Vec<String>,
        device_driver: String,
    },
    #[error("function @{function} rejected by device: {source}")]
    Unsupported {
        function: String,
        #[source]
        source: BackendError,
    },
}

/// Every failure the runtime surfaces to callers.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("device `{query}` not found: {reason}")]
    DeviceNotFound { query: String, reason: String },

    #[error("failed to load module: {0}")]
    ModuleLoad(#[from] ModuleLoadError),

    #[error("buffer resides on device {actual} but device {expected} was required")]
    DeviceMismatch { expected: DeviceId, actual: DeviceId },

    #[error("byte length mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("shape {spec} overflows the address space ({actual} byte(s) supplied)")]
    ShapeOverflow { spec: String, actual: usize },

    #[error("entry point `{name}` not found")]
    EntryPointNotFound { name: String },

    #[error("invocation of `{entry}` failed: {source}")]
    Invocation {
        entry: String,
        #[source]
        source: BackendError,
    },

    #[error("all {popped} output(s) have already been popped")]
    OutputsExhausted { popped: usize },

    #[error("transfer timed out after {waited:?}")]
    Timeout { waited: Duration },

    #[error("`{operation}` is not legal while the call is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error(transparent)]
    Backend(BackendError),
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::DeviceNotFound { .. } => ErrorKind::DeviceNotFound,
            RuntimeError::ModuleLoad(_) => ErrorKind::ModuleLoad,
            RuntimeError::DeviceMismatch { .. } => ErrorKind::DeviceMismatch,
            RuntimeError::SizeMismatch { .. } | RuntimeError::ShapeOverflow { .. } => {
                ErrorKind::SizeMismatch
            }
            RuntimeError::EntryPointNotFound { .. } => ErrorKind::EntryPointNotFound,
            RuntimeError::Invocation { .. } => ErrorKind::Invocation,
            RuntimeError::OutputsExhausted { .. } => ErrorKind::OutputsExhausted,
            RuntimeError::Timeout { .. } => ErrorKind::Timeout,
            RuntimeError::InvalidState { .. } => ErrorKind::InvalidState,
            RuntimeError::InvalidPipeline(_) => ErrorKind::InvalidPipeline,
            RuntimeError::Backend(_) => ErrorKind::Backend,
        }
    }

    pub(crate) fn device_not_found(query: &str, reason: impl Into<String>) -> Self {
        RuntimeError::DeviceNotFound {
            query: query.to_string(),
            reason: reason.into(),
        }
    }
}

/// Device timeouts surface as [`RuntimeError::Timeout`]; everything else stays a backend error.
impl From<BackendError> for RuntimeError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Timeout { waited } => RuntimeError::Timeout { waited },
            other => RuntimeError::Backend(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
