//! Simulated discrete accelerator.
//!
//! Device memory lives in an arena the host cannot address directly. Uploads, device-local
//! downloads and executions are commands on a per-device queue thread, so a download that
//! exceeds its deadline fails with a timeout while the device keeps working.

pub mod arena;
pub mod device;

pub use device::{AccelAllocation, AccelDevice, AccelOptions, ACCEL_DRIVER, ACCEL_DTYPES};

use tandem::backend::registry::register_device_driver;

/// Register the `accel` driver using options from the environment.
///
/// Called automatically via a static initializer.
pub fn register_accel_driver() {
    register_accel_driver_with(ACCEL_DRIVER, AccelOptions::from_env());
}

/// Register an accelerator driver under `name` with explicit options.
pub fn register_accel_driver_with(name: &str, options: AccelOptions) {
    let driver = name.to_string();
    let enumerate_options = options.clone();
    register_device_driver(
        name,
        move || enumerate_options.enumerate(&driver),
        move |info| AccelDevice::new(info.clone(), options.clone()),
    );
}

// Auto-register on library load
#[cfg(not(target_family = "wasm"))]
#[used]
#[link_section = ".init_array"]
static REGISTER_ACCEL_DRIVER: extern "C" fn() = {
    extern "C" fn register() {
        register_accel_driver();
    }
    register
};
