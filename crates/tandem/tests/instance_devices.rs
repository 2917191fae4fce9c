use tandem::runtime::{DeviceQuery, DeviceSelector, Instance, InstanceOptions, Session, SessionOptions};
use tandem::ErrorKind;
use tandem_backend_accel::{register_accel_driver_with, AccelOptions};
use tandem_backend_local::register_local_drivers;

fn register() {
    register_local_drivers();
    register_accel_driver_with("accel-multi", AccelOptions::default().with_devices(3));
}

#[test]
fn instance_snapshots_registered_drivers() {
    register();
    let registered = tandem::backend::registry::list_drivers();
    assert!(registered.iter().any(|name| name == "accel-multi"));
    assert!(tandem::backend::registry::has_driver("local-task"));
    let instance = Instance::with_all_drivers().expect("instance");
    for driver in ["local-sync", "local-task", "accel-multi"] {
        assert!(instance.has_driver(driver), "{driver} missing");
    }
    let devices = instance.available_devices();
    assert_eq!(
        devices.iter().filter(|d| d.driver == "accel-multi").count(),
        3
    );
}

#[test]
fn filtered_instance_only_sees_requested_drivers() {
    register();
    let instance = Instance::new(InstanceOptions::with_drivers(["local-sync", "not-registered"]))
        .expect("missing drivers are skipped");
    assert_eq!(instance.drivers(), vec!["local-sync".to_string()]);
    let err = instance.resolve_device("local-task").expect_err("filtered out");
    assert_eq!(err.kind(), ErrorKind::DeviceNotFound);
    assert!(err.to_string().contains("local-sync"), "{err}");
}

#[test]
fn empty_instance_fails_every_resolve() {
    let instance = Instance::new(InstanceOptions::with_drivers(Vec::<String>::new()))
        .expect("instance");
    assert!(instance.drivers().is_empty());
    let err = instance.resolve_device("local-sync").expect_err("no drivers");
    assert_eq!(err.kind(), ErrorKind::DeviceNotFound);
}

#[test]
fn queries_select_by_ordinal_id_and_path() {
    register();
    let instance = Instance::with_all_drivers().expect("instance");

    let by_ordinal = instance.resolve_device("accel-multi:2").expect("ordinal");
    assert_eq!(by_ordinal.info().ordinal, 2);

    let by_id = instance.resolve_device("accel-multi@0xacc1").expect("id");
    assert_eq!(by_id.info().ordinal, 1);

    let by_path = instance.resolve_device("accel-multi://sim/0").expect("path");
    assert_eq!(by_path.info().ordinal, 0);

    let first = instance.resolve_device("accel-multi").expect("default");
    assert_eq!(first.info().ordinal, 0);
    assert_ne!(first.id(), by_path.id());

    for bad in ["accel-multi:7", "accel-multi@0x1", "accel-multi://sim/9", "accel multi", ""] {
        let err = instance.resolve_device(bad).expect_err(bad);
        assert_eq!(err.kind(), ErrorKind::DeviceNotFound, "{bad}");
    }
}

#[test]
fn query_parser_accepts_documented_forms() {
    let parsed = DeviceQuery::parse("accel@42").expect("decimal id");
    assert_eq!(parsed.driver, "accel");
    assert_eq!(parsed.selector, DeviceSelector::Id(42));
    assert_eq!(
        DeviceQuery::parse("local-task://").expect("empty path").selector,
        DeviceSelector::Default
    );
    assert!(DeviceQuery::parse("accel:x").is_err());
}

#[test]
fn devices_outlive_the_instance_value() {
    register();
    let instance = Instance::with_all_drivers().expect("instance");
    let device = instance.resolve_device("local-sync").expect("device");
    assert_eq!(instance.outstanding_references(), 2);
    drop(instance);
    assert!(device.supports_dtype(tandem::DType::F32));
    assert_eq!(device.ref_count(), 1);
}

#[test]
fn sessions_and_buffers_retain_the_device() {
    register();
    let instance = Instance::with_all_drivers().expect("instance");
    let device = instance.resolve_device("local-task").expect("device");
    let session = Session::new(&instance, &device, SessionOptions::default());
    assert_eq!(device.ref_count(), 2);

    let params = tandem::BufferParams::host_visible().with_access(tandem::MemoryAccess::Read);
    let buffer = session
        .device_allocator()
        .allocate_with_copy(
            &[2],
            tandem::DType::F32,
            tandem::Encoding::DenseRowMajor,
            params,
            &tandem::backend::elements::f32_to_bytes(&[1.0, 2.0]),
        )
        .expect("upload");
    assert_eq!(buffer.params().access, tandem::MemoryAccess::Read);
    assert_eq!(device.ref_count(), 3);

    drop(session);
    assert_eq!(device.ref_count(), 2);
    drop(buffer);
    assert_eq!(device.ref_count(), 1);
}
