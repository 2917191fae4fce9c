extern crate self as tandem;

pub mod backend;
pub mod env;
pub mod error;
pub mod logging;
pub mod runtime;

pub use backend::device::{BufferParams, BufferUsage, MemoryAccess, MemoryLocality, Timeout};
pub use backend::spec::{DType, ModuleSpec, Shape, TensorSpec};
pub use error::{ErrorKind, ModuleLoadError, Result, RuntimeError};
pub use runtime::{
    BufferView, Call, DeviceHandle, Encoding, HostAllocator, HostTensor, Instance, InstanceOptions,
    InvokeFlags, Session, SessionOptions,
};
