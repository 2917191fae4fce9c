//! Host-mediated movement of buffers between devices.
//!
//! There is no device-to-device path: a transfer reads the source buffer into host scratch
//! memory sized exactly to its byte length, then allocates a new buffer on the destination.

use tracing::{debug, warn};

use crate::backend::device::{BufferParams, Timeout};
use crate::backend::spec::DType;
use crate::error::{Result, RuntimeError};
use crate::runtime::allocator::HostAllocator;
use crate::runtime::buffer::{BufferView, Encoding};
use crate::runtime::device::DeviceHandle;

/// Reads `dst.len()` bytes of `buffer` starting at `byte_offset` into host memory.
///
/// On [`RuntimeError::Timeout`] the unread part of `dst` is unspecified.
pub fn device_to_host(
    device: &DeviceHandle,
    buffer: &BufferView,
    byte_offset: usize,
    dst: &mut [u8],
    timeout: Timeout,
) -> Result<()> {
    if buffer.device() != device.id() {
        return Err(RuntimeError::DeviceMismatch {
            expected: device.id(),
            actual: buffer.device(),
        });
    }
    let end = byte_offset.checked_add(dst.len());
    if end.map_or(true, |end| end > buffer.byte_len()) {
        return Err(RuntimeError::SizeMismatch {
            expected: buffer.byte_len().saturating_sub(byte_offset),
            actual: dst.len(),
        });
    }
    let result = device.backend().read_to_host(
        buffer.allocation_handle(),
        byte_offset,
        dst,
        timeout.deadline(),
    );
    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            let err = RuntimeError::from(err);
            if matches!(err, RuntimeError::Timeout { .. }) {
                warn!(device = %device.id(), bytes = dst.len(), %timeout, "device_to_host timed out");
            }
            Err(err)
        }
    }
}

/// Allocates a buffer on `device` holding a copy of `bytes`.
pub fn host_to_device(
    device: &DeviceHandle,
    shape: &[usize],
    dtype: DType,
    encoding: Encoding,
    params: BufferParams,
    bytes: &[u8],
) -> Result<BufferView> {
    BufferView::allocate_with_copy(device, shape, dtype, encoding, params, bytes)
}

/// Moves `buffer` from `src` to `dst` through host scratch memory.
///
/// The result is always a new buffer with the same shape, dtype, encoding and params, even
/// when `src` and `dst` are the same device.
pub fn transfer_buffer(
    buffer: &BufferView,
    src: &DeviceHandle,
    dst: &DeviceHandle,
    host_allocator: &HostAllocator,
    timeout: Timeout,
) -> Result<BufferView> {
    let mut scratch = host_allocator.allocate(buffer.byte_len());
    device_to_host(src, buffer, 0, scratch.as_mut_slice(), timeout)?;
    let moved = host_to_device(
        dst,
        buffer.dims(),
        buffer.dtype(),
        buffer.encoding(),
        buffer.params(),
        scratch.as_slice(),
    )?;
    debug!(
        from = %src.id(),
        to = %dst.id(),
        bytes = scratch.len(),
        "transferred buffer"
    );
    Ok(moved)
}
