pub mod device;
pub mod kernels;
pub mod queue;

pub use device::{
    LocalAllocation, LocalSyncDevice, LocalTaskDevice, LocalTaskOptions, LOCAL_SYNC_DRIVER,
    LOCAL_TASK_DRIVER,
};
pub use kernels::{LocalTensor, TensorData};
pub use queue::CommandQueue;

use tandem::backend::registry::{register_device_driver, single_device};

/// Register the `local-sync` and `local-task` drivers with the global driver registry.
///
/// Called automatically via a static initializer; call it explicitly when the crate might
/// otherwise not be linked in.
pub fn register_local_drivers() {
    register_device_driver(
        LOCAL_SYNC_DRIVER,
        || vec![single_device(LOCAL_SYNC_DRIVER, "host (inline)")],
        |info| Ok(LocalSyncDevice::new(info.clone())),
    );
    register_device_driver(
        LOCAL_TASK_DRIVER,
        || vec![single_device(LOCAL_TASK_DRIVER, "host (task queue)")],
        |info| LocalTaskDevice::new(info.clone(), LocalTaskOptions::from_env()),
    );
}

// Auto-register on library load
#[cfg(not(target_family = "wasm"))]
#[used]
#[link_section = ".init_array"]
static REGISTER_LOCAL_DRIVERS: extern "C" fn() = {
    extern "C" fn register() {
        register_local_drivers();
    }
    register
};
