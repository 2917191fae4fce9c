//! Driver conformance checks. Every function opens its own instance on the driver named by
//! `query`, so the checks can run in parallel against the same process-wide registry.

use tandem::backend::elements::{f32_to_bytes, i32_to_bytes};
use tandem::runtime::{
    device_to_host, format_buffer_view, BufferView, CallState, DeviceHandle, Encoding, HostTensor, Instance,
    InstanceOptions, InvokeFlags, Session, SessionOptions,
};
use tandem::{BufferParams, DType, ErrorKind, ModuleLoadError, RuntimeError, Timeout};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Module every driver must load and run.
pub const SUITE_MODULE: &str = r#"
module @suite {
  func @simple_mul(%a: tensor<f32, 4>, %b: tensor<f32, 4>) -> tensor<f32, 4> {
    %r = mul %a, %b -> tensor<f32, 4>
    return %r
  }
  func @add(%a: tensor<f32, 4>, %b: tensor<f32, 4>) -> tensor<f32, 4> {
    %r = add %a, %b -> tensor<f32, 4>
    return %r
  }
  func @blend(%a: tensor<f32, 64>, %b: tensor<f32, 64>) -> (tensor<f32, 64>, tensor<f32, 64>) {
    %s = sub %a, %b -> tensor<f32, 64>
    %m = max %a, %b -> tensor<f32, 64>
    return %s, %m
  }
  func @matmul(%a: tensor<f32, 2x3>, %b: tensor<f32, 3x2>) -> tensor<f32, 2x2> {
    %r = dot_general %a, %b contract_lhs[1] contract_rhs[0] -> tensor<f32, 2x2>
    return %r
  }
  func @row_sums(%x: tensor<f32, 2x3>) -> tensor<f32, 2> {
    %r = reduce_sum %x axes[1] -> tensor<f32, 2>
    return %r
  }
  func @relu_i32(%x: tensor<si32, 6>) -> tensor<si32, 6> {
    %z = constant value[0] -> tensor<si32, 6>
    %p = compare %x, %z cmp[gt] -> tensor<i1, 6>
    %r = select %p, %x, %z -> tensor<si32, 6>
    return %r
  }
}
"#;

/// A device resolved from `query` with the suite module loaded.
pub struct Harness {
    pub instance: Instance,
    pub device: DeviceHandle,
    pub session: Session,
}

impl Harness {
    pub fn open(query: &str) -> Self {
        let instance = Instance::new(InstanceOptions::default()).expect("instance");
        let device = instance
            .resolve_device(query)
            .unwrap_or_else(|err| panic!("resolve {query}: {err}"));
        let session = Session::new(&instance, &device, SessionOptions::default());
        session
            .load_module(SUITE_MODULE.as_bytes())
            .expect("suite module loads");
        Self {
            instance,
            device,
            session,
        }
    }

    pub fn upload_f32(&self, dims: &[usize], values: &[f32]) -> BufferView {
        HostTensor::from_f32(dims, values)
            .and_then(|host| host.upload(&self.device, BufferParams::default()))
            .expect("upload f32")
    }

    /// Runs a single-output entry point and reads the result back.
    pub fn run_f32(&self, entry: &str, inputs: &[&BufferView]) -> Vec<f32> {
        let mut call = self.session.call(entry).expect("call");
        for input in inputs {
            call.push_input(input).expect("push input");
        }
        call.invoke(InvokeFlags::default()).expect("invoke");
        let output = call.pop_output().expect("output");
        call.deinitialize();
        output.to_host_f32(Timeout::Infinite).expect("read back")
    }
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (index, (a, e)) in actual.iter().zip(expected).enumerate() {
        let tolerance = 1e-5 * e.abs().max(1.0);
        assert!(
            (a - e).abs() <= tolerance,
            "element {index}: got {a}, expected {e}"
        );
    }
}

pub fn allocate_and_read_back(query: &str) {
    let harness = Harness::open(query);
    let values = [1.0f32, -2.5, 3.25, 0.0, 7.5, -0.125];
    let buffer = harness
        .session
        .allocate_with_copy(
            &[2, 3],
            DType::F32,
            Encoding::DenseRowMajor,
            BufferParams::default(),
            &f32_to_bytes(&values),
        )
        .expect("allocate");
    assert_eq!(buffer.dims(), &[2, 3]);
    assert_eq!(buffer.byte_len(), 24);
    assert_eq!(buffer.device(), harness.device.id());
    assert_eq!(buffer.to_host_f32(Timeout::Infinite).expect("read"), values);

    let mut tail = [0u8; 8];
    device_to_host(&harness.device, &buffer, 16, &mut tail, Timeout::Infinite).expect("partial");
    assert_eq!(&tail[..4], &7.5f32.to_le_bytes());
    assert_eq!(&tail[4..], &(-0.125f32).to_le_bytes());
}

pub fn host_visible_buffers_read_back(query: &str) {
    let harness = Harness::open(query);
    let buffer = harness
        .session
        .allocate_with_copy(
            &[3],
            DType::Si32,
            Encoding::DenseRowMajor,
            BufferParams::host_visible(),
            &i32_to_bytes(&[4, -5, 6]),
        )
        .expect("allocate");
    assert_eq!(buffer.params(), BufferParams::host_visible());
    assert_eq!(buffer.to_host_i32(Timeout::Infinite).expect("read"), vec![4, -5, 6]);
}

pub fn allocate_rejects_wrong_byte_length(query: &str) {
    let harness = Harness::open(query);
    let err = harness
        .session
        .allocate_with_copy(
            &[4],
            DType::F32,
            Encoding::DenseRowMajor,
            BufferParams::default(),
            &[0u8; 12],
        )
        .expect_err("short payload");
    assert!(matches!(
        err,
        RuntimeError::SizeMismatch {
            expected: 16,
            actual: 12
        }
    ));
}

pub fn read_past_end_is_size_mismatch(query: &str) {
    let harness = Harness::open(query);
    let buffer = harness.upload_f32(&[2], &[1.0, 2.0]);
    let mut dst = [0u8; 8];
    let err = device_to_host(&harness.device, &buffer, 4, &mut dst, Timeout::Infinite)
        .expect_err("out of range");
    assert_eq!(err.kind(), ErrorKind::SizeMismatch);
}

pub fn overflowing_shape_is_rejected(query: &str) {
    let harness = Harness::open(query);
    let err = harness
        .session
        .allocate_with_copy(
            &[usize::MAX, 2],
            DType::F32,
            Encoding::DenseRowMajor,
            BufferParams::default(),
            &[],
        )
        .expect_err("shape overflows");
    assert!(matches!(err, RuntimeError::ShapeOverflow { actual: 0, .. }), "{err}");
    assert_eq!(err.kind(), ErrorKind::SizeMismatch);
}

pub fn boolean_buffers_keep_their_bytes(query: &str) {
    let harness = Harness::open(query);
    for params in [BufferParams::default(), BufferParams::host_visible()] {
        let buffer = harness
            .session
            .allocate_with_copy(&[4], DType::I1, Encoding::DenseRowMajor, params, &[0, 2, 255, 1])
            .expect("allocate i1");
        assert_eq!(buffer.to_host(Timeout::Infinite).expect("read"), vec![0, 2, 255, 1]);
    }
}

/// Dtypes the device cannot compute on must still be storable and readable.
pub fn storage_only_dtypes_round_trip(query: &str) {
    let harness = Harness::open(query);
    let cases: [(DType, &[usize], Vec<u8>, &str); 3] = [
        (DType::Ui8, &[3], vec![7, 0, 200], "3xui8=7 0 200"),
        (DType::F16, &[3], vec![0x00, 0x3e, 0x00, 0xc0, 0x00, 0x34], "3xf16=1.5 -2 0.25"),
        (DType::Si16, &[2], [(-300i16).to_le_bytes(), 5i16.to_le_bytes()].concat(), "2xsi16=-300 5"),
    ];
    for (dtype, dims, bytes, printed) in cases {
        let buffer = harness
            .session
            .allocate_with_copy(dims, dtype, Encoding::DenseRowMajor, BufferParams::default(), &bytes)
            .unwrap_or_else(|err| panic!("allocate {dtype}: {err}"));
        assert_eq!(buffer.dtype(), dtype);
        assert_eq!(buffer.to_host(Timeout::Infinite).expect("read"), bytes);
        assert_eq!(
            format_buffer_view(&buffer, 16, Timeout::Infinite).expect("format"),
            printed
        );
    }
}

pub fn simple_mul_matches_expected(query: &str) {
    let harness = Harness::open(query);
    let a = harness.upload_f32(&[4], &[1.0, 1.1, 1.2, 1.3]);
    let b = harness.upload_f32(&[4], &[10.0, 100.0, 1000.0, 10000.0]);
    let result = harness.run_f32("simple_mul", &[&a, &b]);
    assert_close(&result, &[10.0, 110.0, 1200.0, 13000.0]);
}

pub fn matmul_and_reduce_match_expected(query: &str) {
    let harness = Harness::open(query);
    let a = harness.upload_f32(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let b = harness.upload_f32(&[3, 2], &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
    assert_close(
        &harness.run_f32("matmul", &[&a, &b]),
        &[58.0, 64.0, 139.0, 154.0],
    );
    assert_close(&harness.run_f32("suite.row_sums", &[&a]), &[6.0, 15.0]);
}

pub fn integer_relu_matches_expected(query: &str) {
    let harness = Harness::open(query);
    let x = HostTensor::from_i32(&[6], &[-3, 0, 5, -1, 9, 2])
        .and_then(|host| host.upload(&harness.device, BufferParams::default()))
        .expect("upload");
    let mut call = harness.session.call("relu_i32").expect("call");
    call.push_input(&x).expect("push");
    call.invoke(InvokeFlags::default()).expect("invoke");
    let out = call.pop_output().expect("pop");
    assert_eq!(out.dtype(), DType::Si32);
    assert_eq!(
        out.to_host_i32(Timeout::Infinite).expect("read"),
        vec![0, 0, 5, 0, 9, 2]
    );
}

pub fn random_elementwise_matches_host(query: &str) {
    let harness = Harness::open(query);
    let mut rng = StdRng::seed_from_u64(0x7a4d);
    let lhs: Vec<f32> = (0..64).map(|_| rng.gen_range(-4.0..4.0)).collect();
    let rhs: Vec<f32> = (0..64).map(|_| rng.gen_range(-4.0..4.0)).collect();
    let a = harness.upload_f32(&[64], &lhs);
    let b = harness.upload_f32(&[64], &rhs);

    let mut call = harness.session.call("blend").expect("call");
    call.push_input(&a).expect("push a");
    call.push_input(&b).expect("push b");
    call.invoke(InvokeFlags::release_inputs()).expect("invoke");
    assert_eq!(call.input_count(), 0);
    let diff = call.pop_output().expect("diff");
    let max = call.pop_output().expect("max");

    let expected_diff: Vec<f32> = lhs.iter().zip(&rhs).map(|(x, y)| x - y).collect();
    let expected_max: Vec<f32> = lhs.iter().zip(&rhs).map(|(x, y)| x.max(*y)).collect();
    assert_close(&diff.to_host_f32(Timeout::Infinite).expect("diff"), &expected_diff);
    assert_close(&max.to_host_f32(Timeout::Infinite).expect("max"), &expected_max);
}

pub fn outputs_pop_in_order_then_exhaust(query: &str) {
    let harness = Harness::open(query);
    let a = harness.upload_f32(&[64], &[2.0; 64]);
    let b = harness.upload_f32(&[64], &[3.0; 64]);
    let mut call = harness.session.call("blend").expect("call");
    call.push_input(&a).expect("push");
    call.push_input(&b).expect("push");
    call.invoke(InvokeFlags::default()).expect("invoke");
    assert_eq!(call.state(), CallState::AcceptingOutputs);
    assert_eq!(call.outputs_remaining(), 2);

    let first = call.pop_output().expect("first");
    let second = call.pop_output().expect("second");
    assert_eq!(first.to_host_f32(Timeout::Infinite).expect("first")[0], -1.0);
    assert_eq!(second.to_host_f32(Timeout::Infinite).expect("second")[0], 3.0);

    let err = call.pop_output().expect_err("exhausted");
    assert!(matches!(err, RuntimeError::OutputsExhausted { popped: 2 }));
    assert_eq!(call.state(), CallState::AcceptingOutputs);
}

pub fn outputs_outlive_their_call(query: &str) {
    let harness = Harness::open(query);
    let a = harness.upload_f32(&[4], &[1.0, 2.0, 3.0, 4.0]);
    let output = {
        let mut call = harness.session.call("add").expect("call");
        call.push_input(&a).expect("push");
        call.push_input(&a).expect("push");
        call.invoke(InvokeFlags::default()).expect("invoke");
        call.pop_output().expect("pop")
    };
    drop(a);
    assert_eq!(
        output.to_host_f32(Timeout::Infinite).expect("read"),
        vec![2.0, 4.0, 6.0, 8.0]
    );
}

pub fn foreign_buffer_is_device_mismatch(query: &str) {
    let harness = Harness::open(query);
    let other = harness.instance.resolve_device(query).expect("second handle");
    assert_ne!(other.id(), harness.device.id());
    let foreign = HostTensor::from_f32(&[4], &[1.0; 4])
        .and_then(|host| host.upload(&other, BufferParams::default()))
        .expect("upload");

    let mut call = harness.session.call("simple_mul").expect("call");
    let err = call.push_input(&foreign).expect_err("foreign buffer");
    assert_eq!(err.kind(), ErrorKind::DeviceMismatch);
    assert_eq!(call.input_count(), 0);
    assert_eq!(call.state(), CallState::AcceptingInputs);
}

pub fn wrong_arity_fails_the_call(query: &str) {
    let harness = Harness::open(query);
    let a = harness.upload_f32(&[4], &[1.0; 4]);
    let mut call = harness.session.call("simple_mul").expect("call");
    call.push_input(&a).expect("push");
    let err = call.invoke(InvokeFlags::default()).expect_err("missing input");
    assert_eq!(err.kind(), ErrorKind::Invocation);
    assert_eq!(call.state(), CallState::Failed);
    let err = call.pop_output().expect_err("failed call has no outputs");
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    call.deinitialize();
    assert_eq!(call.state(), CallState::Uninitialized);
}

pub fn unknown_entry_point_is_reported(query: &str) {
    let harness = Harness::open(query);
    for name in ["missing", "suite.missing", "other.simple_mul"] {
        let err = harness.session.call(name).err().expect("unknown entry");
        assert!(
            matches!(&err, RuntimeError::EntryPointNotFound { name: reported } if reported == name),
            "{name}: {err}"
        );
    }
}

pub fn module_for_other_driver_is_rejected(query: &str) {
    let harness = Harness::open(query);
    let src = r#"
module @pinned requires["no-such-driver"] {
  func @id(%x: tensor<f32, 1>) -> tensor<f32, 1> {
    %y = neg %x -> tensor<f32, 1>
    return %y
  }
}
"#;
    let err = harness
        .session
        .load_module(src.as_bytes())
        .expect_err("requirement not met");
    assert!(matches!(
        err,
        RuntimeError::ModuleLoad(ModuleLoadError::UnsatisfiedRequirement { .. })
    ));
    assert_eq!(harness.session.modules().len(), 1);
}

pub fn garbage_module_is_rejected(query: &str) {
    let harness = Harness::open(query);
    let err = harness
        .session
        .load_module(&[0xff, 0xfe, 0x00, 0x13])
        .expect_err("garbage");
    assert_eq!(err.kind(), ErrorKind::ModuleLoad);
    assert_eq!(harness.session.modules().len(), 1);
}

pub fn resolving_unknown_driver_fails(query: &str) {
    let harness = Harness::open(query);
    let err = harness
        .instance
        .resolve_device("no-such-driver")
        .expect_err("unknown driver");
    assert_eq!(err.kind(), ErrorKind::DeviceNotFound);
    let err = harness
        .instance
        .resolve_device(&format!("{}:99", harness.device.driver()))
        .expect_err("ordinal out of range");
    assert_eq!(err.kind(), ErrorKind::DeviceNotFound);
}
