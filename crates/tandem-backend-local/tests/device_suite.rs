use tandem_backend_local::register_local_drivers;
use tandem_backend_tests::define_device_tests;

define_device_tests!(local_sync, "local-sync", register_local_drivers);
define_device_tests!(local_task, "local-task", register_local_drivers);
define_device_tests!(local_task_by_ordinal, "local-task:0", register_local_drivers);
