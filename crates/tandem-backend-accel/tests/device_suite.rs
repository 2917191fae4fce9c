use tandem_backend_accel::register_accel_driver;
use tandem_backend_tests::define_device_tests;

define_device_tests!(accel, "accel", register_accel_driver);
define_device_tests!(accel_by_path, "accel://sim/0", register_accel_driver);
