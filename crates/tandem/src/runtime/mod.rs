pub mod allocator;
pub mod buffer;
pub mod call;
pub mod device;
pub mod instance;
pub mod module;
pub mod pipeline;
pub mod query;
pub mod session;
pub mod transfer;

pub use allocator::{HostAllocator, HostBuffer};
pub use buffer::{format_buffer_view, BufferView, Encoding, HostTensor};
pub use call::{Call, CallState, InvokeFlags};
pub use device::{DeviceAllocator, DeviceHandle, DeviceId};
pub use instance::{Instance, InstanceOptions};
pub use module::{decode_module_image, LoadedModule};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineRun, StageId, StageInput, TransferEdge};
pub use query::{DeviceQuery, DeviceSelector};
pub use session::{FunctionRef, Session, SessionOptions};
pub use transfer::{device_to_host, host_to_device, transfer_buffer};
