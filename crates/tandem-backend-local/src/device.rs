use std::sync::Arc;

use tandem::backend::device::{BufferParams, Deadline, DeviceBackend, DeviceInfo, ExecutionOutput};
use tandem::backend::spec::{BackendError, BackendResult, DType, Function, ModuleSpec, TensorSpec};
use tracing::debug;

use crate::kernels::{self, LocalTensor};
use crate::queue::CommandQueue;

pub const LOCAL_SYNC_DRIVER: &str = "local-sync";
pub const LOCAL_TASK_DRIVER: &str = "local-task";

/// Host memory allocation; clones share the decoded tensor.
#[derive(Clone, Debug)]
pub struct LocalAllocation {
    tensor: Arc<LocalTensor>,
    params: BufferParams,
}

impl LocalAllocation {
    pub fn new(tensor: LocalTensor, params: BufferParams) -> Self {
        Self {
            tensor: Arc::new(tensor),
            params,
        }
    }

    pub fn tensor(&self) -> &Arc<LocalTensor> {
        &self.tensor
    }

    pub fn params(&self) -> BufferParams {
        self.params
    }
}

fn allocate(spec: &TensorSpec, params: &BufferParams, bytes: &[u8]) -> BackendResult<LocalAllocation> {
    Ok(LocalAllocation::new(LocalTensor::from_bytes(spec, bytes)?, *params))
}

fn execute_inline(
    function: &Function,
    inputs: &[&LocalAllocation],
) -> BackendResult<Vec<ExecutionOutput<LocalAllocation>>> {
    let tensors: Vec<LocalTensor> = inputs.iter().map(|a| (*a.tensor).clone()).collect();
    let results = kernels::run_function(function, &tensors)?;
    Ok(results
        .into_iter()
        .map(|tensor| ExecutionOutput {
            spec: tensor.spec.clone(),
            allocation: LocalAllocation::new(tensor, BufferParams::default()),
        })
        .collect())
}

/// Host device that executes on the caller's thread.
#[derive(Debug)]
pub struct LocalSyncDevice {
    info: DeviceInfo,
}

impl LocalSyncDevice {
    pub fn new(info: DeviceInfo) -> Self {
        Self { info }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }
}

impl DeviceBackend for LocalSyncDevice {
    type Allocation = LocalAllocation;

    fn driver_name(&self) -> &str {
        LOCAL_SYNC_DRIVER
    }

    fn supports_dtype(&self, dtype: DType) -> bool {
        kernels::supports_dtype(dtype)
    }

    fn allocate_with_copy(
        &self,
        spec: &TensorSpec,
        params: &BufferParams,
        bytes: &[u8],
    ) -> BackendResult<Self::Allocation> {
        allocate(spec, params, bytes)
    }

    fn read_to_host(
        &self,
        allocation: &Self::Allocation,
        offset: usize,
        dst: &mut [u8],
        _deadline: Deadline,
    ) -> BackendResult<()> {
        allocation.tensor.read_into(offset, dst)
    }

    fn execute(
        &self,
        _module: &Arc<ModuleSpec>,
        function: &Function,
        inputs: &[&Self::Allocation],
    ) -> BackendResult<Vec<ExecutionOutput<Self::Allocation>>> {
        execute_inline(function, inputs)
    }
}

/// `local-task` tuning.
#[derive(Debug, Clone)]
pub struct LocalTaskOptions {
    /// Worker threads draining the device queue.
    pub workers: usize,
}

impl LocalTaskOptions {
    pub const WORKERS_ENV: &'static str = "TANDEM_LOCAL_TASK_WORKERS";

    /// Options from the environment, falling back to one worker.
    pub fn from_env() -> Self {
        Self {
            workers: tandem::env::read_usize(Self::WORKERS_ENV)
                .filter(|workers| *workers > 0)
                .unwrap_or(1),
        }
    }
}

impl Default for LocalTaskOptions {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

/// Host device that runs every command on its own worker threads.
pub struct LocalTaskDevice {
    info: DeviceInfo,
    queue: CommandQueue,
}

impl LocalTaskDevice {
    pub fn new(info: DeviceInfo, options: LocalTaskOptions) -> BackendResult<Self> {
        let queue = CommandQueue::new(&format!("{}-{}", LOCAL_TASK_DRIVER, info.ordinal), options.workers)?;
        debug!(device = %info, workers = queue.worker_count(), "opened local-task device");
        Ok(Self { info, queue })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn worker_count(&self) -> usize {
        self.queue.worker_count()
    }
}

impl DeviceBackend for LocalTaskDevice {
    type Allocation = LocalAllocation;

    fn driver_name(&self) -> &str {
        LOCAL_TASK_DRIVER
    }

    fn supports_dtype(&self, dtype: DType) -> bool {
        kernels::supports_dtype(dtype)
    }

    fn allocate_with_copy(
        &self,
        spec: &TensorSpec,
        params: &BufferParams,
        bytes: &[u8],
    ) -> BackendResult<Self::Allocation> {
        allocate(spec, params, bytes)
    }

    fn read_to_host(
        &self,
        allocation: &Self::Allocation,
        offset: usize,
        dst: &mut [u8],
        deadline: Deadline,
    ) -> BackendResult<()> {
        let tensor = Arc::clone(&allocation.tensor);
        let len = dst.len();
        let bytes = self.queue.run_until(
            move || -> BackendResult<Vec<u8>> {
                let mut staged = vec![0u8; len];
                tensor.read_into(offset, &mut staged)?;
                Ok(staged)
            },
            deadline,
        )??;
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
                BackendError::execution(format!("@{} is not part of module @{}", function.name, module.name))
            })?;
        let inputs: Vec<LocalAllocation> = inputs.iter().map(|a| (*a).clone()).collect();
        self.queue.run(move || {
            let refs: Vec<&LocalAllocation> = inputs.iter().collect();
            execute_inline(&module.functions[index], &refs)
        })?
    }
}
