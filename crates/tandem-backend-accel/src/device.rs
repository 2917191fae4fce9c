use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tandem::backend::device::{
    BufferParams, Deadline, DeviceBackend, DeviceInfo, ExecutionOutput, MemoryLocality,
};
use tandem::backend::spec::{BackendError, BackendResult, DType, Function, ModuleSpec, TensorSpec};
use tandem_backend_local::{kernels, CommandQueue, LocalTensor};
use tracing::{debug, trace};

use crate::arena::{Arena, BlockId};

pub const ACCEL_DRIVER: &str = "accel";

/// Element types the accelerator can execute on. Any fixed-width dtype can be stored.
pub const ACCEL_DTYPES: [DType; 3] = [DType::F32, DType::Si32, DType::I1];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccelOptions {
    /// Number of devices the driver enumerates.
    pub devices: usize,
    /// Simulated bus latency added to every upload and device-local download.
    pub transfer_latency: Duration,
}

impl AccelOptions {
    pub const DEVICES_ENV: &'static str = "TANDEM_ACCEL_DEVICES";
    pub const LATENCY_ENV: &'static str = "TANDEM_ACCEL_TRANSFER_LATENCY_MS";

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            devices: tandem::env::read_usize(Self::DEVICES_ENV).unwrap_or(defaults.devices),
            transfer_latency: tandem::env::read_u64(Self::LATENCY_ENV)
                .map(Duration::from_millis)
                .unwrap_or(defaults.transfer_latency),
        }
    }

    pub fn with_transfer_latency(mut self, latency: Duration) -> Self {
        self.transfer_latency = latency;
        self
    }

    pub fn with_devices(mut self, devices: usize) -> Self {
        self.devices = devices;
        self
    }

    /// Devices exposed under `driver`.
    pub fn enumerate(&self, driver: &str) -> Vec<DeviceInfo> {
        (0..self.devices)
            .map(|ordinal| DeviceInfo {
                driver: driver.to_string(),
                ordinal,
                id: 0xacc0 + ordinal as u64,
                path: format!("sim/{ordinal}"),
                name: format!("simulated accelerator {ordinal}"),
            })
            .collect()
    }
}

impl Default for AccelOptions {
    fn default() -> Self {
        Self {
            devices: 1,
            transfer_latency: Duration::ZERO,
        }
    }
}

/// Handle to one arena block; the block is freed when the handle drops.
pub struct AccelAllocation {
    id: BlockId,
    spec: TensorSpec,
    locality: MemoryLocality,
    arena: Arc<Arena>,
}

impl AccelAllocation {
    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    pub fn locality(&self) -> MemoryLocality {
        self.locality
    }
}

impl fmt::Debug for AccelAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccelAllocation")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .field("locality", &self.locality)
            .finish()
    }
}

impl Drop for AccelAllocation {
    fn drop(&mut self) {
        self.arena.free(self.id);
    }
}

/// Accelerator with private memory and a single in-order command queue.
pub struct AccelDevice {
    info: DeviceInfo,
    options: AccelOptions,
    arena: Arc<Arena>,
    queue: CommandQueue,
}

impl AccelDevice {
    pub fn new(info: DeviceInfo, options: AccelOptions) -> BackendResult<Self> {
        let queue = CommandQueue::new(&format!("{}-{}", info.driver, info.ordinal), 1)?;
        debug!(device = %info, latency = ?options.transfer_latency, "opened accel device");
        Ok(Self {
            info,
            options,
            arena: Arc::new(Arena::new()),
            queue,
        })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn options(&self) -> &AccelOptions {
        &self.options
    }

    pub fn live_allocations(&self) -> usize {
        self.arena.live_blocks()
    }

    pub fn bytes_in_use(&self) -> usize {
        self.arena.bytes_in_use()
    }

    fn wrap(&self, id: BlockId, spec: TensorSpec, locality: MemoryLocality) -> AccelAllocation {
        AccelAllocation {
            id,
            spec,
            locality,
            arena: Arc::clone(&self.arena),
        }
    }
}

impl DeviceBackend for AccelDevice {
    type Allocation = AccelAllocation;

    fn driver_name(&self) -> &str {
        &self.info.driver
    }

    fn supports_dtype(&self, dtype: DType) -> bool {
        ACCEL_DTYPES.contains(&dtype)
    }

    fn allocate_with_copy(
        &self,
        spec: &TensorSpec,
        params: &BufferParams,
        bytes: &[u8],
    ) -> BackendResult<Self::Allocation> {
        let tensor = LocalTensor::from_bytes(spec, bytes)?;
        let id = match params.memory_locality {
            // Host-mapped memory is written directly; only device-local memory crosses the bus.
            MemoryLocality::HostVisible => self.arena.insert(tensor),
            MemoryLocality::DeviceLocal => {
                let arena = Arc::clone(&self.arena);
                let latency = self.options.transfer_latency;
                self.queue.run(move || {
                    thread::sleep(latency);
                    arena.insert(tensor)
                })?
            }
        };
        trace!(device = %self.info, block = id, bytes = bytes.len(), "uploaded");
        Ok(self.wrap(id, spec.clone(), params.memory_locality))
    }

    fn read_to_host(
        &self,
        allocation: &Self::Allocation,
        offset: usize,
        dst: &mut [u8],
        deadline: Deadline,
    ) -> BackendResult<()> {
        let len = dst.len();
        let bytes = match allocation.locality {
            MemoryLocality::HostVisible => self.arena.read(allocation.id, offset, len)?,
            MemoryLocality::DeviceLocal => {
                let arena = Arc::clone(&self.arena);
                let latency = self.options.transfer_latency;
                let id = allocation.id;
                self.queue.run_until(
                    move || {
                        thread::sleep(latency);
                        arena.read(id, offset, len)
                    },
                    deadline,
                )??
            }
        };
        dst.copy_from_slice(&bytes);
        Ok(())
    }

    fn execute(
        &self,
        module: &Arc<ModuleSpec>,
        function: &Function,
        inputs: &[&Self::Allocation],
    ) -> BackendResult<Vec<ExecutionOutput<Self::Allocation>>> {
        let module = Arc::clone(module);
        let index = module
            .functions
            .iter()
            .position(|f| f.name == function.name)
            .ok_or_else(|| {
                BackendError::execution(format!(
                    "@{} is not part of module @{}",
                    function.name, module.name
                ))
            })?;
        let arena = Arc::clone(&self.arena);
        let input_ids: Vec<BlockId> = inputs.iter().map(|a| a.id).collect();
        let produced = self.queue.run(move || -> BackendResult<Vec<(TensorSpec, BlockId)>> {
            let tensors = input_ids
                .iter()
                .map(|id| arena.get(*id).map(|t| (*t).clone()))
                .collect::<BackendResult<Vec<LocalTensor>>>()?;
            let results = kernels::run_function(&module.functions[index], &tensors)?;
            Ok(results
                .into_iter()
                .map(|tensor| (tensor.spec.clone(), arena.insert(tensor)))
                .collect())
        })??;
        Ok(produced
            .into_iter()
            .map(|(spec, id)| ExecutionOutput {
                allocation: self.wrap(id, spec.clone(), MemoryLocality::DeviceLocal),
                spec,
            })
            .collect())
    }
}
