use tandem::runtime::{
    device_to_host, format_buffer_view, transfer_buffer, HostAllocator, Instance, PipelineBuilder,
    Session, SessionOptions, StageInput,
};
use tandem::{BufferParams, BufferUsage, ErrorKind, HostTensor, Timeout};
use tandem_backend_accel::register_accel_driver;
use tandem_backend_local::register_local_drivers;

const CHAIN: &str = r#"
module @chain {
  func @scale(%x: tensor<f32, 2x2>, %k: tensor<f32, 2x2>) -> tensor<f32, 2x2> {
    %r = mul %x, %k -> tensor<f32, 2x2>
    return %r
  }
  func @stats(%x: tensor<f32, 2x2>) -> (tensor<f32, 2>, tensor<f32, 2>) {
    %s = reduce_sum %x axes[0] -> tensor<f32, 2>
    %m = reduce_max %x axes[1] -> tensor<f32, 2>
    return %s, %m
  }
  func @combine(%a: tensor<f32, 2>, %b: tensor<f32, 2>) -> tensor<f32, 2> {
    %r = sub %a, %b -> tensor<f32, 2>
    return %r
  }
}
"#;

fn instance() -> Instance {
    register_local_drivers();
    register_accel_driver();
    tandem::logging::init_for_tests();
    Instance::with_all_drivers().expect("instance")
}

fn session(instance: &Instance, query: &str) -> Session {
    let device = instance.resolve_device(query).expect(query);
    let session = Session::new(instance, &device, SessionOptions::default());
    session.load_module(CHAIN.as_bytes()).expect("chain");
    session
}

fn matrix(values: [f32; 4]) -> HostTensor {
    HostTensor::from_f32(&[2, 2], &values).expect("matrix")
}

#[test]
fn device_to_host_checks_device_and_range() {
    let instance = instance();
    let host = instance.resolve_device("local-sync").expect("local-sync");
    let accel = instance.resolve_device("accel").expect("accel");
    let buffer = matrix([1.0, 2.0, 3.0, 4.0])
        .upload(&host, BufferParams::default())
        .expect("upload");

    let mut dst = [0u8; 4];
    let err = device_to_host(&accel, &buffer, 0, &mut dst, Timeout::Infinite)
        .expect_err("wrong device");
    assert_eq!(err.kind(), ErrorKind::DeviceMismatch);

    device_to_host(&host, &buffer, 12, &mut dst, Timeout::Infinite).expect("last element");
    assert_eq!(f32::from_le_bytes(dst), 4.0);
    let err = device_to_host(&host, &buffer, 13, &mut dst, Timeout::Infinite)
        .expect_err("past the end");
    assert_eq!(err.kind(), ErrorKind::SizeMismatch);
    let err = device_to_host(&host, &buffer, usize::MAX, &mut dst, Timeout::Infinite)
        .expect_err("offset overflow");
    assert_eq!(err.kind(), ErrorKind::SizeMismatch);
}

#[test]
fn transfer_always_creates_a_new_buffer() {
    let instance = instance();
    let host = instance.resolve_device("local-task").expect("local-task");
    let accel = instance.resolve_device("accel").expect("accel");
    let params = BufferParams::default().with_usage(BufferUsage::Transfer);
    let source = matrix([1.0, -1.0, 0.5, 8.0])
        .upload(&host, params)
        .expect("upload");
    let staging = HostAllocator::with_max_cached(2);

    let same = transfer_buffer(&source, &host, &host, &staging, Timeout::Infinite)
        .expect("same device");
    assert!(!same.same_allocation(&source));
    assert_eq!(same.device(), host.id());

    let moved = transfer_buffer(&source, &host, &accel, &staging, Timeout::Infinite)
        .expect("to accel");
    assert_eq!(moved.device(), accel.id());
    assert_eq!(moved.params(), params);
    assert_eq!(moved.spec(), source.spec());
    assert_eq!(
        moved.to_host_f32(Timeout::Infinite).expect("read"),
        vec![1.0, -1.0, 0.5, 8.0]
    );

    assert_eq!(staging.allocation_count(), 2);
    assert_eq!(staging.reuse_count(), 1);
    assert_eq!(staging.live_bytes(), 0);
    assert_eq!(staging.cached_buffers(), 1);
    assert_eq!(staging.peak_bytes(), 16);

    let err = transfer_buffer(&source, &accel, &host, &staging, Timeout::Infinite)
        .expect_err("buffer is not on the source device");
    assert_eq!(err.kind(), ErrorKind::DeviceMismatch);
}

#[test]
fn buffers_format_with_shape_prefix() {
    let instance = instance();
    let host = instance.resolve_device("local-sync").expect("local-sync");
    let buffer = HostTensor::from_f32(&[4], &[10.0, 110.0, 1200.0, 13000.0])
        .and_then(|t| t.upload(&host, BufferParams::default()))
        .expect("upload");
    assert_eq!(
        format_buffer_view(&buffer, 16, Timeout::Infinite).expect("format"),
        "4xf32=10 110 1200 13000"
    );
    assert_eq!(
        format_buffer_view(&buffer, 2, Timeout::Infinite).expect("format"),
        "4xf32=10 110..."
    );
}

#[test]
fn three_stage_pipeline_spans_three_devices() {
    let instance = instance();
    let first = session(&instance, "local-sync");
    let second = session(&instance, "accel");
    let third = session(&instance, "local-task");

    let mut builder = PipelineBuilder::new();
    let scale = builder.stage(&first, "scale");
    let stats = builder.stage(&second, "stats");
    let combine = builder.stage(&third, "chain.combine");
    builder
        .input(scale, StageInput::Host(matrix([1.0, 2.0, 3.0, 4.0])))
        .input(scale, StageInput::Host(matrix([2.0, 2.0, 2.0, 2.0])))
        .input(stats, StageInput::Output { stage: scale, index: 0 })
        .input(combine, StageInput::Output { stage: stats, index: 0 })
        .input(combine, StageInput::Output { stage: stats, index: 1 });
    let pipeline = builder.build().expect("build");
    assert_eq!(pipeline.stage_count(), 3);
    let edges = pipeline.transfer_edges();
    assert_eq!(edges.len(), 3);
    assert_eq!(edges[0].from, scale);
    assert_eq!(edges[0].to, stats);
    assert_eq!(edges[2].output, 1);

    let run = pipeline.run(Timeout::Infinite).expect("run");
    assert_eq!(run.transfers, 3);
    assert_eq!(
        run.stage_outputs(stats)[0].to_host_f32(Timeout::Infinite).expect("sums"),
        vec![8.0, 12.0]
    );
    // sums [8, 12] minus row maxima [4, 8]
    assert_eq!(
        run.final_outputs()[0].to_host_f32(Timeout::Infinite).expect("combined"),
        vec![4.0, 4.0]
    );

    let again = pipeline.run(Timeout::Infinite).expect("second run");
    assert!(!again.final_outputs()[0].same_allocation(&run.final_outputs()[0]));
}

#[test]
fn same_device_stages_pass_buffers_through() {
    let instance = instance();
    let only = session(&instance, "local-task");
    let seed = matrix([1.0, 5.0, 2.0, 3.0])
        .upload(only.device(), BufferParams::default())
        .expect("seed");

    let mut builder = PipelineBuilder::new();
    let stats = builder.stage(&only, "stats");
    let combine = builder.stage(&only, "combine");
    builder
        .input(stats, StageInput::Buffer(seed))
        .input(combine, StageInput::Output { stage: stats, index: 1 })
        .input(combine, StageInput::Output { stage: stats, index: 0 });
    let pipeline = builder.build().expect("build");
    assert!(pipeline.transfer_edges().is_empty());
    let run = pipeline.run(Timeout::Infinite).expect("run");
    assert_eq!(run.transfers, 0);
    assert_eq!(
        run.final_outputs()[0].to_host_f32(Timeout::Infinite).expect("read"),
        vec![2.0, -5.0]
    );
}

#[test]
fn malformed_pipelines_are_rejected() {
    let instance = instance();
    let only = session(&instance, "local-sync");

    let err = PipelineBuilder::new().build().err().expect("empty");
    assert_eq!(err.kind(), ErrorKind::InvalidPipeline);

    let mut builder = PipelineBuilder::new();
    let a = builder.stage(&only, "stats");
    let b = builder.stage(&only, "combine");
    builder.input(a, StageInput::Output { stage: b, index: 0 });
    assert_eq!(builder.build().err().expect("forward").kind(), ErrorKind::InvalidPipeline);

    let mut other = PipelineBuilder::new();
    other.stage(&only, "stats");
    let foreign = other.stage(&only, "stats");
    let mut builder = PipelineBuilder::new();
    let a = builder.stage(&only, "stats");
    builder.input(foreign, StageInput::Output { stage: a, index: 0 });
    assert_eq!(builder.build().err().expect("dangling").kind(), ErrorKind::InvalidPipeline);

    let mut builder = PipelineBuilder::new();
    builder.stage(&only, "nope");
    assert_eq!(builder.build().err().expect("unknown").kind(), ErrorKind::EntryPointNotFound);

    let mut builder = PipelineBuilder::new();
    let a = builder.stage(&only, "scale");
    let b = builder.stage(&only, "stats");
    builder
        .input(a, StageInput::Host(matrix([1.0; 4])))
        .input(a, StageInput::Host(matrix([1.0; 4])))
        .input(b, StageInput::Output { stage: a, index: 3 });
    let pipeline = builder.build().expect("index checked at run time");
    assert_eq!(
        pipeline.run(Timeout::Infinite).err().expect("bad index").kind(),
        ErrorKind::InvalidPipeline
    );
}
