use tandem::runtime::{CallState, HostTensor, Instance, InstanceOptions, InvokeFlags, Session, SessionOptions};
use tandem::{BufferParams, BufferView, ErrorKind, RuntimeError, Timeout};
use tandem_backend_local::register_local_drivers;

const MATH: &str = r#"
module @math {
  func @simple_mul(%a: tensor<f32, 4>, %b: tensor<f32, 4>) -> tensor<f32, 4> {
    %r = mul %a, %b -> tensor<f32, 4>
    return %r
  }
  func @split(%x: tensor<f32, 2x2>) -> (tensor<f32, 2x2>, tensor<f32, 2x1>) {
    %n = neg %x -> tensor<f32, 2x2>
    %s = reduce_sum %x axes[1] keepdims[true] -> tensor<f32, 2x1>
    return %n, %s
  }
}
"#;

const OTHER: &str = r#"
module @other {
  func @simple_mul(%a: tensor<f32, 4>, %b: tensor<f32, 4>) -> tensor<f32, 4> {
    %r = add %a, %b -> tensor<f32, 4>
    return %r
  }
}
"#;

fn session() -> Session {
    register_local_drivers();
    tandem::logging::init_for_tests();
    let instance = Instance::new(InstanceOptions::with_drivers(["local-sync"])).expect("instance");
    let device = instance.resolve_device("local-sync").expect("device");
    let session = Session::new(&instance, &device, SessionOptions::default());
    session.load_module(MATH.as_bytes()).expect("math");
    session
}

fn upload(session: &Session, dims: &[usize], values: &[f32]) -> BufferView {
    HostTensor::from_f32(dims, values)
        .and_then(|t| t.upload(session.device(), BufferParams::default()))
        .expect("upload")
}

#[test]
fn full_lifecycle_walks_every_state() {
    let session = session();
    let x = upload(&session, &[2, 2], &[1.0, 2.0, 3.0, 4.0]);
    let mut call = session.call("split").expect("call");
    assert_eq!(call.state(), CallState::AcceptingInputs);
    assert_eq!(call.entry_name(), "math.split");
    let (params, results) = call.signature();
    assert_eq!(params.len(), 1);
    assert_eq!(results[1].shape.dims(), &[2, 1]);

    call.push_input(&x).expect("push");
    call.invoke(InvokeFlags::default()).expect("invoke");
    assert_eq!(call.state(), CallState::AcceptingOutputs);
    assert_eq!(call.input_count(), 1);

    let negated = call.pop_output().expect("first");
    let sums = call.pop_output().expect("second");
    assert_eq!(
        negated.to_host_f32(Timeout::Infinite).expect("negated"),
        vec![-1.0, -2.0, -3.0, -4.0]
    );
    assert_eq!(sums.dims(), &[2, 1]);
    assert_eq!(sums.to_host_f32(Timeout::Infinite).expect("sums"), vec![3.0, 7.0]);

    call.deinitialize();
    assert_eq!(call.state(), CallState::Uninitialized);
    call.deinitialize();
    assert_eq!(call.state(), CallState::Uninitialized);
}

#[test]
fn operations_out_of_order_are_rejected() {
    let session = session();
    let a = upload(&session, &[4], &[1.0; 4]);
    let mut call = session.call("simple_mul").expect("call");

    let err = call.pop_output().expect_err("no invoke yet");
    assert!(matches!(
        err,
        RuntimeError::InvalidState {
            operation: "pop_output",
            state: "accepting inputs"
        }
    ));

    call.push_input(&a).expect("push");
    call.push_input(&a).expect("push");
    call.invoke(InvokeFlags::default()).expect("invoke");
    assert_eq!(call.push_input(&a).expect_err("late push").kind(), ErrorKind::InvalidState);
    assert_eq!(
        call.invoke(InvokeFlags::default()).expect_err("double invoke").kind(),
        ErrorKind::InvalidState
    );

    call.deinitialize();
    assert_eq!(call.pop_output().expect_err("after deinit").kind(), ErrorKind::InvalidState);
}

#[test]
fn type_mismatch_fails_the_invocation() {
    let session = session();
    let wrong = upload(&session, &[2, 2], &[1.0; 4]);
    let mut call = session.call("simple_mul").expect("call");
    call.push_input(&wrong).expect("push");
    call.push_input(&wrong).expect("push");
    let err = call.invoke(InvokeFlags::default()).expect_err("shape mismatch");
    match &err {
        RuntimeError::Invocation { entry, .. } => assert_eq!(entry, "math.simple_mul"),
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(call.state(), CallState::Failed);
    assert_eq!(call.outputs_remaining(), 0);
}

#[test]
fn bare_names_must_be_unique_across_modules() {
    let session = session();
    session.load_module(OTHER.as_bytes()).expect("other");
    let err = session.call("simple_mul").expect_err("ambiguous");
    assert_eq!(err.kind(), ErrorKind::EntryPointNotFound);

    let a = upload(&session, &[4], &[1.0, 2.0, 3.0, 4.0]);
    for (name, expected) in [
        ("math.simple_mul", vec![1.0, 4.0, 9.0, 16.0]),
        ("other.simple_mul", vec![2.0, 4.0, 6.0, 8.0]),
    ] {
        let mut call = session.call(name).expect(name);
        call.push_input(&a).expect("push");
        call.push_input(&a).expect("push");
        call.invoke(InvokeFlags::default()).expect("invoke");
        let out = call.pop_output().expect("pop");
        assert_eq!(out.to_host_f32(Timeout::Infinite).expect("read"), expected, "{name}");
    }

    // Still unique: only `math` defines it.
    assert!(session.call("split").is_ok());
}

#[test]
fn dropping_a_call_releases_unpopped_outputs() {
    let session = session();
    let device = session.device().clone();
    let a = upload(&session, &[4], &[1.0; 4]);
    let baseline = device.ref_count();
    {
        let mut call = session.call("simple_mul").expect("call");
        call.push_input(&a).expect("push");
        call.push_input(&a).expect("push");
        call.invoke(InvokeFlags::default()).expect("invoke");
        assert_eq!(device.ref_count(), baseline + 1);
    }
    assert_eq!(device.ref_count(), baseline);
}

#[test]
fn release_inputs_drops_input_references() {
    let session = session();
    let a = upload(&session, &[4], &[2.0; 4]);
    let b = upload(&session, &[4], &[3.0; 4]);
    let mut call = session.call("simple_mul").expect("call");
    call.push_input(&a).expect("push");
    call.push_input(&b).expect("push");
    call.invoke(InvokeFlags::release_inputs()).expect("invoke");
    assert_eq!(call.input_count(), 0);
    let out = call.pop_output().expect("pop");
    assert_eq!(out.to_host_f32(Timeout::Infinite).expect("read"), vec![6.0; 4]);
    assert!(!out.same_allocation(&a));
}
