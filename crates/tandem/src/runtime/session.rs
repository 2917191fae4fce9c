use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::backend::device::BufferParams;
use crate::backend::spec::{DType, Function, ModuleSpec};
use crate::error::{ModuleLoadError, Result, RuntimeError};
use crate::runtime::allocator::HostAllocator;
use crate::runtime::buffer::{BufferView, Encoding};
use crate::runtime::call::Call;
use crate::runtime::device::{DeviceAllocator, DeviceHandle};
use crate::runtime::instance::Instance;
use crate::runtime::module::{decode_module_image, validate_module, LoadedModule};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Host staging allocator; a fresh one is created when unset.
    pub host_allocator: Option<HostAllocator>,
}

/// Entry point resolved against a session's loaded modules.
#[derive(Clone)]
pub struct FunctionRef {
    pub(crate) module: Arc<LoadedModule>,
    pub(crate) index: usize,
}

impl FunctionRef {
    pub fn module_name(&self) -> &str {
        self.module.name()
    }

    pub fn function(&self) -> &Function {
        &self.module.functions()[self.index]
    }

    /// Fully qualified `module.function` name.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.module.name(), self.function().name)
    }
}

impl fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified_name())
    }
}

/// Binds loaded modules to one device.
///
/// Modules are appended in load order and never removed while the session lives.
pub struct Session {
    id: u64,
    instance: Instance,
    device: DeviceHandle,
    host_allocator: HostAllocator,
    modules: RwLock<Vec<Arc<LoadedModule>>>,
}

impl Session {
    pub fn new(instance: &Instance, device: &DeviceHandle, options: SessionOptions) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, device = %device.id(), driver = device.driver(), "created session");
        Self {
            id,
            instance: instance.clone(),
            device: device.clone(),
            host_allocator: options.host_allocator.unwrap_or_default(),
            modules: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    pub fn device_allocator(&self) -> DeviceAllocator {
        self.device.allocator()
    }

    pub fn host_allocator(&self) -> &HostAllocator {
        &self.host_allocator
    }

    /// Decodes, validates and appends a module image (binary, JSON or text).
    ///
    /// On failure the session's module list is unchanged.
    pub fn load_module(&self, bytes: &[u8]) -> Result<()> {
        let module = decode_module_image(bytes)?;
        self.load_module_spec(module)
    }

    pub fn load_module_from_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(ModuleLoadError::from)?;
        debug!(session = self.id, path = %path.display(), "loading module file");
        self.load_module(&bytes)
    }

    /// Validates and appends an already decoded module.
    pub fn load_module_spec(&self, module: ModuleSpec) -> Result<()> {
        let mut modules = self.modules.write();
        let loaded_names: Vec<&str> = modules.iter().map(|m| m.name()).collect();
        let loaded = validate_module(module, &self.device, &loaded_names)?;
        debug!(
            session = self.id,
            module = loaded.name(),
            functions = loaded.functions().len(),
            "loaded module"
        );
        modules.push(Arc::new(loaded));
        Ok(())
    }

    /// Loaded modules in load order.
    pub fn modules(&self) -> Vec<Arc<LoadedModule>> {
        self.modules.read().clone()
    }

    /// Resolves `module.function`, or a bare `function` name defined by exactly one module.
    pub fn lookup_function(&self, name: &str) -> Result<FunctionRef> {
        let not_found = || RuntimeError::EntryPointNotFound {
            name: name.to_string(),
        };
        let modules = self.modules.read();
        if let Some((module_name, function_name)) = name.split_once('.') {
            let module = modules
                .iter()
                .find(|m| m.name() == module_name)
                .ok_or_else(not_found)?;
            let index = module.function_index(function_name).ok_or_else(not_found)?;
            return Ok(FunctionRef {
                module: Arc::clone(module),
                index,
            });
        }
        let mut matches = modules
            .iter()
            .filter_map(|m| m.function_index(name).map(|index| (m, index)));
        match (matches.next(), matches.next()) {
            (Some((module, index)), None) => Ok(FunctionRef {
                module: Arc::clone(module),
                index,
            }),
            _ => Err(not_found()),
        }
    }

    /// Allocates a buffer on the session's device.
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

    /// Starts a call of `name`; see [`Call::initialize_by_name`].
    pub fn call(&self, name: &str) -> Result<Call<'_>> {
        Call::initialize_by_name(self, name)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("modules", &self.modules.read().len())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!(session = self.id, device = %self.device.id(), "released session");
    }
}
