use std::fmt;
use std::sync::Arc;

use crate::backend::device::{AllocationHandle, BufferParams, Timeout};
use crate::backend::elements::{bytes_to_f32, bytes_to_i32, f32_to_bytes, format_elements, i32_to_bytes};
use crate::backend::spec::{BackendError, DType, Shape, TensorSpec};
use crate::error::{Result, RuntimeError};
use crate::runtime::device::{DeviceHandle, DeviceId};

/// Element layout inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    /// Contiguous row-major elements, little-endian, no padding.
    #[default]
    DenseRowMajor,
}

/// Device memory plus the device that owns it; freed when the last view drops.
struct Allocation {
    handle: AllocationHandle,
    device: DeviceHandle,
}

/// Typed, immutable view of device-resident memory.
///
/// Clones retain the same allocation.
#[derive(Clone)]
pub struct BufferView {
    spec: TensorSpec,
    encoding: Encoding,
    params: BufferParams,
    allocation: Arc<Allocation>,
}

impl BufferView {
    /// Allocates on `device` and copies `bytes` in.
    ///
    /// `bytes` must be exactly `Π(shape) × dtype width` long.
    pub fn allocate_with_copy(
        device: &DeviceHandle,
        shape: &[usize],
        dtype: DType,
        encoding: Encoding,
        params: BufferParams,
        bytes: &[u8],
    ) -> Result<Self> {
        let spec = TensorSpec::from_dims(dtype, shape);
        let expected = spec.byte_len().ok_or_else(|| RuntimeError::ShapeOverflow {
            spec: spec.to_string(),
            actual: bytes.len(),
        })?;
        if expected != bytes.len() {
            return Err(RuntimeError::SizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        let handle = device.backend().allocate_with_copy(&spec, &params, bytes)?;
        Ok(Self {
            spec,
            encoding,
            params,
            allocation: Arc::new(Allocation {
                handle,
                device: device.clone(),
            }),
        })
    }

    /// Wraps an allocation a device produced as an execution result.
    pub(crate) fn from_device_output(
        device: &DeviceHandle,
        spec: TensorSpec,
        handle: AllocationHandle,
    ) -> Self {
        Self {
            spec,
            encoding: Encoding::DenseRowMajor,
            params: BufferParams::default(),
            allocation: Arc::new(Allocation {
                handle,
                device: device.clone(),
            }),
        }
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    pub fn shape(&self) -> &Shape {
        &self.spec.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.spec.shape.dims()
    }

    pub fn dtype(&self) -> DType {
        self.spec.dtype
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn params(&self) -> BufferParams {
        self.params
    }

    pub fn element_count(&self) -> usize {
        self.spec.element_count().unwrap_or(0)
    }

    pub fn byte_len(&self) -> usize {
        self.spec.byte_len().unwrap_or(0)
    }

    /// Identity of the device the memory resides on.
    pub fn device(&self) -> DeviceId {
        self.allocation.device.id()
    }

    pub fn device_handle(&self) -> &DeviceHandle {
        &self.allocation.device
    }

    /// `true` when both views share one allocation.
    pub fn same_allocation(&self, other: &BufferView) -> bool {
        Arc::ptr_eq(&self.allocation, &other.allocation)
    }

    pub(crate) fn allocation_handle(&self) -> &AllocationHandle {
        &self.allocation.handle
    }

    /// Copies the whole buffer into a fresh host vector.
    pub fn to_host(&self, timeout: Timeout) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; self.byte_len()];
        self.allocation.device.backend().read_to_host(
            &self.allocation.handle,
            0,
            &mut bytes,
            timeout.deadline(),
        )?;
        Ok(bytes)
    }

    pub fn to_host_f32(&self, timeout: Timeout) -> Result<Vec<f32>> {
        self.expect_dtype(DType::F32)?;
        Ok(bytes_to_f32(&self.to_host(timeout)?))
    }

    pub fn to_host_i32(&self, timeout: Timeout) -> Result<Vec<i32>> {
        self.expect_dtype(DType::Si32)?;
        Ok(bytes_to_i32(&self.to_host(timeout)?))
    }

    fn expect_dtype(&self, dtype: DType) -> Result<()> {
        if self.spec.dtype != dtype {
            return Err(RuntimeError::Backend(BackendError::spec(format!(
                "buffer holds {} elements, not {}",
                self.spec.dtype, dtype
            ))));
        }
        Ok(())
    }
}

impl fmt::Debug for BufferView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferView")
            .field("spec", &self.spec)
            .field("encoding", &self.encoding)
            .field("params", &self.params)
            .field("device", &self.device())
            .finish()
    }
}

/// Renders a buffer as `4xf32=1 1.1 1.2 1.3`, eliding elements past `max_elements` with `...`.
pub fn format_buffer_view(view: &BufferView, max_elements: usize, timeout: Timeout) -> Result<String> {
    let bytes = view.to_host(timeout)?;
    let (values, elided) = format_elements(view.dtype(), &bytes, max_elements, " ");
    let mut out = String::new();
    for dim in view.dims() {
        out.push_str(&dim.to_string());
        out.push('x');
    }
    out.push_str(view.dtype().name());
    out.push('=');
    out.push_str(&values);
    if elided {
        out.push_str("...");
    }
    Ok(out)
}

/// Dense row-major tensor held in host memory.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub spec: TensorSpec,
    pub bytes: Vec<u8>,
}

impl HostTensor {
    pub fn new(spec: TensorSpec, bytes: Vec<u8>) -> Result<Self> {
        let expected = spec.byte_len().ok_or_else(|| RuntimeError::ShapeOverflow {
            spec: spec.to_string(),
            actual: bytes.len(),
        })?;
        if expected != bytes.len() {
            return Err(RuntimeError::SizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self { spec, bytes })
    }

    pub fn from_f32(dims: &[usize], values: &[f32]) -> Result<Self> {
        Self::new(TensorSpec::from_dims(DType::F32, dims), f32_to_bytes(values))
    }

    pub fn from_i32(dims: &[usize], values: &[i32]) -> Result<Self> {
        Self::new(TensorSpec::from_dims(DType::Si32, dims), i32_to_bytes(values))
    }

    /// Uploads the tensor to `device`.
    pub fn upload(&self, device: &DeviceHandle, params: BufferParams) -> Result<BufferView> {
        BufferView::allocate_with_copy(
            device,
            self.spec.shape.dims(),
            self.spec.dtype,
            Encoding::DenseRowMajor,
            params,
            &self.bytes,
        )
    }
}
