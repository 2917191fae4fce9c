use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::backend::device::{typed_device, BufferParams, DeviceBackend, DeviceInfo, ErasedDevice};
use crate::backend::spec::DType;
use crate::error::Result;
use crate::runtime::buffer::{BufferView, Encoding};
use crate::runtime::instance::InstanceShared;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one acquired device.
///
/// Two resolutions of the same query produce two distinct devices with distinct ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u64);

impl DeviceId {
    fn next() -> Self {
        DeviceId(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct DeviceInner {
    id: DeviceId,
    info: DeviceInfo,
    backend: Box<dyn ErasedDevice>,
    // Keeps the driver snapshot alive for as long as the device is.
    _instance: Arc<InstanceShared>,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        debug!(device = %self.id, driver = %self.info.driver, "releasing device");
    }
}

/// Reference-counted capability for one device's allocator and execution queue.
///
/// Cloning shares the device; the driver-level device is released when the last clone
/// (including the ones held by sessions and buffers) drops.
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<DeviceInner>,
}

impl DeviceHandle {
    pub(crate) fn new(
        info: DeviceInfo,
        backend: Box<dyn ErasedDevice>,
        instance: Arc<InstanceShared>,
    ) -> Self {
        let id = DeviceId::next();
        debug!(device = %id, %info, "acquired device");
        Self {
            inner: Arc::new(DeviceInner {
                id,
                info,
                backend,
                _instance: instance,
            }),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.inner.id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.inner.info
    }

    pub fn driver(&self) -> &str {
        &self.inner.info.driver
    }

    pub fn supports_dtype(&self, dtype: DType) -> bool {
        self.inner.backend.supports_dtype(dtype)
    }

    /// Number of live references (handles, sessions, buffers) to this device.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn allocator(&self) -> DeviceAllocator {
        DeviceAllocator {
            device: self.clone(),
        }
    }

    /// The concrete driver device, when it is a `D`.
    pub fn downcast<D: DeviceBackend + 'static>(&self) -> Option<Arc<D>> {
        typed_device::<D>(self.backend())
    }

    pub(crate) fn backend(&self) -> &dyn ErasedDevice {
        self.inner.backend.as_ref()
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.inner.id)
            .field("driver", &self.inner.info.driver)
            .field("ordinal", &self.inner.info.ordinal)
            .finish()
    }
}

impl PartialEq for DeviceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for DeviceHandle {}

/// Allocation entry point bound to one device.
#[derive(Clone, Debug)]
pub struct DeviceAllocator {
    device: DeviceHandle,
}

impl DeviceAllocator {
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// See [`BufferView::allocate_with_copy`].
    pub fn allocate_with_copy(
        &self,
        shape: &[usize],
        dtype: DType,
        encoding: Encoding,
        params: BufferParams,
        bytes: &[u8],
    ) -> Result<BufferView> {
        BufferView::allocate_with_copy(&self.device, shape, dtype, encoding, params, bytes)
    }
}
