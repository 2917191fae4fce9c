//! Device driver contract.
//!
//! A driver implements [`DeviceBackend`] over its own allocation type. The runtime only ever
//! talks to drivers through [`ErasedDevice`], which hides the allocation type behind
//! [`AllocationHandle`] and downcasts internally.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::spec::{BackendError, BackendResult, DType, Function, ModuleSpec, Operation, TensorSpec};

/// Type-erased device allocation.
pub type AllocationHandle = Box<dyn Any + Send + Sync>;

/// Where a buffer's backing memory should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MemoryLocality {
    #[default]
    DeviceLocal,
    HostVisible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MemoryAccess {
    Read,
    Write,
    #[default]
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BufferUsage {
    Transfer,
    Dispatch,
    #[default]
    Default,
}

/// Placement and usage flags recorded on every buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BufferParams {
    pub memory_locality: MemoryLocality,
    pub access: MemoryAccess,
    pub usage: BufferUsage,
}

impl BufferParams {
    pub fn host_visible() -> Self {
        Self {
            memory_locality: MemoryLocality::HostVisible,
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, usage: BufferUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_access(mut self, access: MemoryAccess) -> Self {
        self.access = access;
        self
    }
}

/// How long a blocking device operation may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Timeout {
    /// Block until the operation completes.
    #[default]
    Infinite,
    After(Duration),
}

impl Timeout {
    pub fn from_millis(millis: u64) -> Self {
        Timeout::After(Duration::from_millis(millis))
    }

    /// Converts the relative timeout into an absolute deadline starting now.
    pub fn deadline(self) -> Deadline {
        match self {
            Timeout::Infinite => Deadline::never(),
            Timeout::After(duration) => Deadline::at(Instant::now() + duration),
        }
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeout::Infinite => f.write_str("infinite"),
            Timeout::After(duration) => write!(f, "{duration:?}"),
        }
    }
}

/// Absolute point in time after which a wait gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
    started: Instant,
}

impl Deadline {
    pub fn never() -> Self {
        Self {
            at: None,
            started: Instant::now(),
        }
    }

    pub fn at(instant: Instant) -> Self {
        Self {
            at: Some(instant),
            started: Instant::now(),
        }
    }

    pub fn is_infinite(&self) -> bool {
        self.at.is_none()
    }

    /// Time left before expiry; `None` when the deadline never expires.
    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }

    /// Error to report once the deadline has passed.
    pub fn timeout_error(&self) -> BackendError {
        BackendError::timeout(self.started.elapsed())
    }
}

/// One physical or logical device a driver can open.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub driver: String,
    pub ordinal: usize,
    pub id: u64,
    pub path: String,
    pub name: String,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} id={:#x} path={} ({})",
            self.driver, self.ordinal, self.id, self.path, self.name
        )
    }
}

/// Output tensor produced by an entry point execution.
pub struct ExecutionOutput<A> {
    pub spec: TensorSpec,
    pub allocation: A,
}

/// Driver-side device: memory allocator plus execution queue.
pub trait DeviceBackend: Send + Sync {
    type Allocation: Send + Sync + 'static;

    /// Driver name this device was opened through (e.g. `"local-task"`).
    fn driver_name(&self) -> &str;

    fn supports_dtype(&self, dtype: DType) -> bool;

    /// Returns `true` when the device can execute the operation.
    fn supports_operation(&self, _op: &Operation) -> bool {
        true
    }

    /// Rejects functions the device cannot run. Called once per function at module load.
    fn validate_function(&self, function: &Function) -> BackendResult<()> {
        for spec in function.tensor_specs() {
            if !self.supports_dtype(spec.dtype) {
                return Err(BackendError::spec(format!(
                    "dtype {} is not supported by {}",
                    spec.dtype,
                    self.driver_name()
                )));
            }
        }
        for instruction in &function.body {
            if !self.supports_operation(&instruction.op) {
                return Err(BackendError::unimplemented(
                    instruction.op.mnemonic(),
                    format!("not supported by {}", self.driver_name()),
                ));
            }
        }
        Ok(())
    }

    /// Allocates device memory for `spec` and synchronously copies `bytes` into it.
    fn allocate_with_copy(
        &self,
        spec: &TensorSpec,
        params: &BufferParams,
        bytes: &[u8],
    ) -> BackendResult<Self::Allocation>;

    /// Copies `dst.len()` bytes starting at `offset` into host memory, waiting until `deadline`.
    fn read_to_host(
        &self,
        allocation: &Self::Allocation,
        offset: usize,
        dst: &mut [u8],
        deadline: Deadline,
    ) -> BackendResult<()>;

    /// Runs `function` of `module` against resident inputs and returns resident outputs.
    fn execute(
        &self,
        module: &Arc<ModuleSpec>,
        function: &Function,
        inputs: &[&Self::Allocation],
    ) -> BackendResult<Vec<ExecutionOutput<Self::Allocation>>>;
}

/// Object-safe view of a [`DeviceBackend`].
pub trait ErasedDevice: Send + Sync {
    fn driver_name(&self) -> &str;

    fn supports_dtype(&self, dtype: DType) -> bool;

    fn validate_function(&self, function: &Function) -> BackendResult<()>;

    fn allocate_with_copy(
        &self,
        spec: &TensorSpec,
        params: &BufferParams,
        bytes: &[u8],
    ) -> BackendResult<AllocationHandle>;

    fn read_to_host(
        &self,
        allocation: &AllocationHandle,
        offset: usize,
        dst: &mut [u8],
        deadline: Deadline,
    ) -> BackendResult<()>;

    fn execute(
        &self,
        module: &Arc<ModuleSpec>,
        function: &Function,
        inputs: &[&AllocationHandle],
    ) -> BackendResult<Vec<ExecutionOutput<AllocationHandle>>>;

    fn as_any(&self) -> &dyn Any;
}

/// Wrapper that implements [`ErasedDevice`] for any concrete [`DeviceBackend`].
pub struct DeviceWrapper<D: DeviceBackend> {
    inner: Arc<D>,
}

impl<D: DeviceBackend> DeviceWrapper<D> {
    pub fn new(device: D) -> Self {
        Self {
            inner: Arc::new(device),
        }
    }

    pub fn device(&self) -> &Arc<D> {
        &self.inner
    }

    fn downcast<'a>(&self, handle: &'a AllocationHandle) -> BackendResult<&'a D::Allocation> {
        handle.downcast_ref::<D::Allocation>().ok_or_else(|| {
            BackendError::execution(format!(
                "allocation type mismatch for driver {}",
                self.inner.driver_name()
            ))
        })
    }
}

impl<D: DeviceBackend + 'static> ErasedDevice for DeviceWrapper<D> {
    fn driver_name(&self) -> &str {
        self.inner.driver_name()
    }

    fn supports_dtype(&self, dtype: DType) -> bool {
        self.inner.supports_dtype(dtype)
    }

    fn validate_function(&self, function: &Function) -> BackendResult<()> {
        self.inner.validate_function(function)
    }

    fn allocate_with_copy(
        &self,
        spec: &TensorSpec,
        params: &BufferParams,
        bytes: &[u8],
    ) -> BackendResult<AllocationHandle> {
        let allocation = self.inner.allocate_with_copy(spec, params, bytes)?;
        Ok(Box::new(allocation) as AllocationHandle)
    }

    fn read_to_host(
        &self,
        allocation: &AllocationHandle,
        offset: usize,
        dst: &mut [u8],
        deadline: Deadline,
    ) -> BackendResult<()> {
        let typed = self.downcast(allocation)?;
        self.inner.read_to_host(typed, offset, dst, deadline)
    }

    fn execute(
        &self,
        module: &Arc<ModuleSpec>,
        function: &Function,
        inputs: &[&AllocationHandle],
    ) -> BackendResult<Vec<ExecutionOutput<AllocationHandle>>> {
        let typed_inputs = inputs
            .iter()
            .map(|handle| self.downcast(handle))
            .collect::<BackendResult<Vec<_>>>()?;
        let outputs = self.inner.execute(module, function, &typed_inputs)?;
        Ok(outputs
            .into_iter()
            .map(|output| ExecutionOutput {
                spec: output.spec,
                allocation: Box::new(output.allocation) as AllocationHandle,
            })
            .collect())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Recovers the concrete device behind an erased handle.
pub fn typed_device<D: DeviceBackend + 'static>(device: &dyn ErasedDevice) -> Option<Arc<D>> {
    device
        .as_any()
        .downcast_ref::<DeviceWrapper<D>>()
        .map(|wrapper| Arc::clone(wrapper.device()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infinite_deadline_never_expires() {
        let deadline = Timeout::Infinite.deadline();
        assert!(deadline.is_infinite());
        assert!(!deadline.is_expired());
        assert_eq!(deadline.remaining(), None);
    }

    #[test]
    fn zero_timeout_is_already_expired() {
        let deadline = Timeout::After(Duration::ZERO).deadline();
        assert!(deadline.is_expired());
        assert!(matches!(
            deadline.timeout_error(),
            BackendError::Timeout { .. }
        ));
    }

    #[test]
    fn default_params_are_device_local_read_write() {
        let params = BufferParams::default();
        assert_eq!(params.memory_locality, MemoryLocality::DeviceLocal);
        assert_eq!(params.access, MemoryAccess::ReadWrite);
        assert_eq!(params.usage, BufferUsage::Default);
        assert_eq!(
            BufferParams::host_visible().memory_locality,
            MemoryLocality::HostVisible
        );
    }
}
