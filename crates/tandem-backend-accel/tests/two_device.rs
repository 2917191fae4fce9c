use std::time::Duration;

use tandem::runtime::{
    host_to_device, transfer_buffer, Encoding, HostAllocator, HostTensor, Instance,
    InstanceOptions, InvokeFlags, PipelineBuilder, Session, SessionOptions, StageInput,
};
use tandem::{BufferParams, DType, ErrorKind, MemoryLocality, Timeout};
use tandem_backend_accel::{register_accel_driver, register_accel_driver_with, AccelDevice, AccelOptions};
use tandem_backend_local::register_local_drivers;

const FIRST: &str = r#"
module @first {
  func @simple_mul(%a: tensor<f32, 4>, %b: tensor<f32, 4>) -> tensor<f32, 4> {
    %r = mul %a, %b -> tensor<f32, 4>
    return %r
  }
}
"#;

const SECOND: &str = r#"
module @second requires["accel", "accel-slow"] {
  func @simple_add(%a: tensor<f32, 4>, %b: tensor<f32, 4>) -> tensor<f32, 4> {
    %r = add %a, %b -> tensor<f32, 4>
    return %r
  }
}
"#;

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (got, want) in actual.iter().zip(expected) {
        assert!((got - want).abs() <= 1e-5 * want.abs().max(1.0), "got {got}, expected {want}");
    }
}

fn instance() -> Instance {
    register_local_drivers();
    register_accel_driver();
    Instance::new(InstanceOptions::with_drivers(["local-task", "accel"])).expect("instance")
}

#[test]
fn result_moves_from_host_device_to_accelerator() {
    let instance = instance();
    let host = instance.resolve_device("local-task").expect("local-task");
    let accel = instance.resolve_device("accel").expect("accel");
    let first = Session::new(&instance, &host, SessionOptions::default());
    let second = Session::new(&instance, &accel, SessionOptions::default());
    first.load_module(FIRST.as_bytes()).expect("first module");
    second.load_module(FIRST.as_bytes()).expect("same module on accel");

    let a = HostTensor::from_f32(&[4], &[1.0, 1.1, 1.2, 1.3])
        .and_then(|t| t.upload(&host, BufferParams::default()))
        .expect("a");
    let b = HostTensor::from_f32(&[4], &[10.0, 100.0, 1000.0, 10000.0])
        .and_then(|t| t.upload(&host, BufferParams::default()))
        .expect("b");

    let mut call = first.call("simple_mul").expect("first call");
    call.push_input(&a).expect("a");
    call.push_input(&b).expect("b");
    call.invoke(InvokeFlags::default()).expect("invoke first");
    let product = call.pop_output().expect("product");
    call.deinitialize();

    let moved = transfer_buffer(
        &product,
        &host,
        &accel,
        second.host_allocator(),
        Timeout::Infinite,
    )
    .expect("transfer");
    assert_eq!(moved.device(), accel.id());
    assert!(!moved.same_allocation(&product));
    assert_eq!(moved.dims(), product.dims());

    let c = HostTensor::from_f32(&[4], &[2000.0, 200.0, 20.0, 2.0])
        .and_then(|t| t.upload(&accel, BufferParams::default()))
        .expect("c");
    let mut call = second.call("first.simple_mul").expect("second call");
    call.push_input(&moved).expect("moved");
    call.push_input(&c).expect("c");
    call.invoke(InvokeFlags::release_inputs()).expect("invoke second");
    let result = call.pop_output().expect("result");
    call.deinitialize();

    assert_close(
        &product.to_host_f32(Timeout::Infinite).expect("product"),
        &[10.0, 110.0, 1200.0, 13000.0],
    );
    assert_close(
        &result.to_host_f32(Timeout::Infinite).expect("result"),
        &[20000.0, 22000.0, 24000.0, 26000.0],
    );
}

#[test]
fn accelerator_module_is_rejected_on_host_device() {
    let instance = instance();
    let host = instance.resolve_device("local-task").expect("local-task");
    let session = Session::new(&instance, &host, SessionOptions::default());
    assert!(session.load_module(SECOND.as_bytes()).is_err());
    assert!(session.modules().is_empty());
}

#[test]
fn pipeline_inserts_transfer_between_devices() {
    let instance = instance();
    let host = instance.resolve_device("local-task").expect("local-task");
    let accel = instance.resolve_device("accel").expect("accel");
    let first = Session::new(&instance, &host, SessionOptions::default());
    let second = Session::new(&instance, &accel, SessionOptions::default());
    first.load_module(FIRST.as_bytes()).expect("first module");
    second.load_module(SECOND.as_bytes()).expect("second module");

    let mut builder = PipelineBuilder::new();
    let mul = builder.stage(&first, "simple_mul");
    let add = builder.stage(&second, "simple_add");
    builder
        .input(mul, StageInput::Host(HostTensor::from_f32(&[4], &[1.0, 2.0, 3.0, 4.0]).expect("x")))
        .input(mul, StageInput::Host(HostTensor::from_f32(&[4], &[2.0; 4]).expect("y")))
        .input(add, StageInput::Output { stage: mul, index: 0 })
        .input(add, StageInput::Host(HostTensor::from_f32(&[4], &[0.5; 4]).expect("z")));
    let pipeline = builder.build().expect("pipeline");
    assert_eq!(pipeline.stage_count(), 2);
    assert_eq!(pipeline.transfer_edges().len(), 1);

    let run = pipeline.run(Timeout::Infinite).expect("run");
    assert_eq!(run.transfers, 1);
    let out = &run.final_outputs()[0];
    assert_eq!(out.device(), accel.id());
    assert_eq!(
        out.to_host_f32(Timeout::Infinite).expect("read"),
        vec![2.5, 4.5, 6.5, 8.5]
    );
}

#[test]
fn slow_device_local_read_times_out() {
    register_accel_driver_with(
        "accel-slow",
        AccelOptions::default().with_transfer_latency(Duration::from_millis(300)),
    );
    let instance =
        Instance::new(InstanceOptions::with_drivers(["accel-slow"])).expect("instance");
    let accel = instance.resolve_device("accel-slow").expect("accel-slow");

    let buffer = HostTensor::from_f32(&[4], &[1.0, 2.0, 3.0, 4.0])
        .and_then(|t| t.upload(&accel, BufferParams::default()))
        .expect("upload");
    assert_eq!(buffer.params().memory_locality, MemoryLocality::DeviceLocal);

    let err = buffer
        .to_host(Timeout::After(Duration::from_millis(20)))
        .expect_err("read must time out");
    assert_eq!(err.kind(), tandem::ErrorKind::Timeout);

    // The device is still usable after a timed-out read.
    let values = buffer.to_host_f32(Timeout::Infinite).expect("infinite wait");
    assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn host_visible_read_skips_the_queue() {
    register_accel_driver_with(
        "accel-slow",
        AccelOptions::default().with_transfer_latency(Duration::from_millis(300)),
    );
    let instance =
        Instance::new(InstanceOptions::with_drivers(["accel-slow"])).expect("instance");
    let accel = instance.resolve_device("accel-slow").expect("accel-slow");

    let buffer = HostTensor::from_f32(&[2], &[5.0, 6.0])
        .and_then(|t| t.upload(&accel, BufferParams::host_visible()))
        .expect("upload");
    let values = buffer
        .to_host_f32(Timeout::After(Duration::from_millis(100)))
        .expect("host-visible read");
    assert_eq!(values, vec![5.0, 6.0]);
}

#[test]
fn arena_blocks_are_freed_with_their_last_view() {
    let instance = instance();
    let accel = instance.resolve_device("accel").expect("accel");
    let device = accel.downcast::<AccelDevice>().expect("accel device");
    assert_eq!(device.live_allocations(), 0);

    let session = Session::new(&instance, &accel, SessionOptions::default());
    session.load_module(FIRST.as_bytes()).expect("module");
    let a = HostTensor::from_f32(&[4], &[1.0, 2.0, 3.0, 4.0])
        .and_then(|t| t.upload(&accel, BufferParams::default()))
        .expect("a");
    let alias = a.clone();
    assert_eq!(device.live_allocations(), 1);
    assert_eq!(device.bytes_in_use(), 16);

    let mut call = session.call("simple_mul").expect("call");
    call.push_input(&a).expect("push");
    call.push_input(&alias).expect("push");
    call.invoke(InvokeFlags::default()).expect("invoke");
    assert_eq!(device.live_allocations(), 2);
    drop(call);
    assert_eq!(device.live_allocations(), 1);

    drop(a);
    assert_eq!(device.live_allocations(), 1);
    drop(alias);
    assert_eq!(device.live_allocations(), 0);
    assert_eq!(device.bytes_in_use(), 0);
}

#[test]
fn every_dtype_round_trips_between_devices() {
    let instance = instance();
    let host = instance.resolve_device("local-task").expect("local-task");
    let accel = instance.resolve_device("accel").expect("accel");
    let scratch = HostAllocator::new();

    let dtypes = [
        DType::I1,
        DType::Si8,
        DType::Ui8,
        DType::Si16,
        DType::Ui16,
        DType::Si32,
        DType::Ui32,
        DType::Si64,
        DType::Ui64,
        DType::F16,
        DType::F32,
        DType::F64,
    ];
    let shapes: [&[usize]; 4] = [&[4], &[2, 3], &[0], &[2, 0]];
    for dtype in dtypes {
        for dims in shapes {
            let len = dims.iter().product::<usize>() * dtype.size_in_bytes();
            // i1 payloads include non-canonical bytes; they must survive untouched.
            let bytes: Vec<u8> = (0..len).map(|i| (i * 37 + 2) as u8).collect();
            let case = format!("{dtype} {dims:?}");
            let original = host_to_device(
                &host,
                dims,
                dtype,
                Encoding::DenseRowMajor,
                BufferParams::default(),
                &bytes,
            )
                .unwrap_or_else(|err| panic!("{case}: upload: {err}"));

            let there = transfer_buffer(&original, &host, &accel, &scratch, Timeout::Infinite)
                .unwrap_or_else(|err| panic!("{case}: to accel: {err}"));
            let back = transfer_buffer(&there, &accel, &host, &scratch, Timeout::Infinite)
                .unwrap_or_else(|err| panic!("{case}: to host: {err}"));

            for moved in [&there, &back] {
                assert_eq!(moved.dims(), dims, "{case}");
                assert_eq!(moved.dtype(), dtype, "{case}");
                assert_eq!(moved.encoding(), Encoding::DenseRowMajor, "{case}");
                assert_eq!(moved.to_host(Timeout::Infinite).expect("read"), bytes, "{case}");
            }
            assert_eq!(there.device(), accel.id());
            assert_eq!(back.device(), host.id());
        }
    }
    assert_eq!(scratch.live_bytes(), 0);
}

#[test]
fn pipeline_surfaces_timed_out_transfer() {
    register_local_drivers();
    register_accel_driver_with(
        "accel-slow",
        AccelOptions::default().with_transfer_latency(Duration::from_millis(300)),
    );
    let instance = Instance::new(InstanceOptions::with_drivers(["local-task", "accel-slow"]))
        .expect("instance");
    let slow = instance.resolve_device("accel-slow").expect("accel-slow");
    let host = instance.resolve_device("local-task").expect("local-task");
    let producer = Session::new(&instance, &slow, SessionOptions::default());
    let consumer = Session::new(&instance, &host, SessionOptions::default());
    producer.load_module(FIRST.as_bytes()).expect("producer module");
    consumer.load_module(FIRST.as_bytes()).expect("consumer module");

    let mut builder = PipelineBuilder::new();
    let first = builder.stage(&producer, "simple_mul");
    let second = builder.stage(&consumer, "simple_mul");
    builder
        .input(first, StageInput::Host(HostTensor::from_f32(&[4], &[1.0, 2.0, 3.0, 4.0]).expect("x")))
        .input(first, StageInput::Host(HostTensor::from_f32(&[4], &[2.0; 4]).expect("y")))
        .input(second, StageInput::Output { stage: first, index: 0 })
        .input(second, StageInput::Host(HostTensor::from_f32(&[4], &[0.5; 4]).expect("z")));
    let pipeline = builder.build().expect("pipeline");

    let err = pipeline
        .run(Timeout::After(Duration::from_millis(20)))
        .expect_err("the device-local read exceeds the deadline");
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let run = pipeline.run(Timeout::Infinite).expect("unbounded run");
    assert_eq!(run.transfers, 1);
    assert_eq!(
        run.final_outputs()[0].to_host_f32(Timeout::Infinite).expect("read"),
        vec![1.0, 2.0, 3.0, 4.0]
    );
}
