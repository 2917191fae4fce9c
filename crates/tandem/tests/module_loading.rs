use std::path::PathBuf;

use tandem::backend::spec::{ElementwiseBinaryOp, FunctionBuilder, Operation};
use tandem::runtime::{decode_module_image, Instance, InstanceOptions, InvokeFlags, Session, SessionOptions};
use tandem::{BufferParams, DType, ErrorKind, HostTensor, ModuleLoadError, ModuleSpec, RuntimeError, TensorSpec, Timeout};
use tandem_backend_accel::register_accel_driver;
use tandem_backend_local::register_local_drivers;

const SQUARE: &str = r#"
module @square {
  func @square(%x: tensor<f32, 3>) -> tensor<f32, 3> {
    %r = mul %x, %x -> tensor<f32, 3>
    return %r
  }
}
"#;

fn session_on(driver: &str) -> Session {
    register_local_drivers();
    register_accel_driver();
    let instance = Instance::new(InstanceOptions::with_drivers([driver])).expect("instance");
    let device = instance.resolve_device(driver).expect("device");
    Session::new(&instance, &device, SessionOptions::default())
}

fn run_square(session: &Session) -> Vec<f32> {
    let x = HostTensor::from_f32(&[3], &[1.0, -2.0, 3.0])
        .and_then(|t| t.upload(session.device(), BufferParams::default()))
        .expect("upload");
    let mut call = session.call("square.square").expect("call");
    call.push_input(&x).expect("push");
    call.invoke(InvokeFlags::default()).expect("invoke");
    call.pop_output()
        .and_then(|out| out.to_host_f32(Timeout::Infinite))
        .expect("result")
}

fn scratch_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("tandem-{}-{name}", std::process::id()))
}

#[test]
fn text_json_and_binary_images_load_identically() {
    let module = tandem::tandem_module!(SQUARE);
    let images = [
        SQUARE.as_bytes().to_vec(),
        module.to_json_string().expect("json").into_bytes(),
        module.to_binary_image().expect("binary"),
        module.to_text().into_bytes(),
    ];
    for image in images {
        let decoded = decode_module_image(&image).expect("decode");
        assert_eq!(decoded, module);
        let session = session_on("local-sync");
        session.load_module(&image).expect("load");
        assert_eq!(run_square(&session), vec![1.0, 4.0, 9.0]);
    }
}

#[test]
fn modules_load_from_files() {
    let module = tandem::tandem_module!(SQUARE);
    let path = scratch_path("square.tndm");
    module.save_binary(&path).expect("save");
    let session = session_on("local-task");
    session.load_module_from_file(&path).expect("load file");
    assert_eq!(run_square(&session), vec![1.0, 4.0, 9.0]);
    let _ = std::fs::remove_file(&path);

    let json_path = scratch_path("square.json");
    module.save_json(&json_path).expect("save json");
    let fresh = session_on("local-task");
    fresh.load_module_from_file(&json_path).expect("load json file");
    assert_eq!(run_square(&fresh), vec![1.0, 4.0, 9.0]);
    let _ = std::fs::remove_file(&json_path);

    let err = session
        .load_module_from_file(scratch_path("missing.tndm"))
        .expect_err("missing file");
    assert!(matches!(err, RuntimeError::ModuleLoad(ModuleLoadError::Io(_))));
}

#[test]
fn built_modules_load_without_serialization() {
    let spec = TensorSpec::from_dims(DType::Si32, &[2]);
    let mut builder = FunctionBuilder::new();
    let a = builder.add_parameter(spec.clone());
    let b = builder.add_parameter(spec.clone());
    assert_eq!(builder.value_type(b), Some(&spec));
    let sum = builder.emit(Operation::ElementwiseBinary(ElementwiseBinaryOp::Add), vec![a, b], spec);
    let function = builder.finish("add", vec![sum]).expect("finish");
    let module = ModuleSpec::new("built").with_functions(vec![function]);

    let session = session_on("accel");
    session.load_module_spec(module).expect("load");
    let x = HostTensor::from_i32(&[2], &[40, -7])
        .and_then(|t| t.upload(session.device(), BufferParams::default()))
        .expect("upload");
    let mut call = session.call("built.add").expect("call");
    call.push_input(&x).expect("push");
    call.push_input(&x).expect("push");
    call.invoke(InvokeFlags::default()).expect("invoke");
    let out = call.pop_output().expect("pop");
    assert_eq!(out.to_host_i32(Timeout::Infinite).expect("read"), vec![80, -14]);
}

#[test]
fn rejected_loads_leave_the_session_unchanged() {
    let session = session_on("local-sync");
    session.load_module(SQUARE.as_bytes()).expect("first load");

    let duplicate = session.load_module(SQUARE.as_bytes()).expect_err("duplicate name");
    assert!(duplicate.to_string().contains("already loaded"), "{duplicate}");

    let bad_ssa = r#"
module @broken {
  func @f(%x: tensor<f32, 2>) -> tensor<f32, 2> {
    %y = neg %z -> tensor<f32, 2>
    return %y
  }
}
"#;
    let err = session.load_module(bad_ssa.as_bytes()).expect_err("undefined operand");
    assert!(matches!(err, RuntimeError::ModuleLoad(ModuleLoadError::Text(_))));

    let empty = ModuleSpec::new("empty");
    assert_eq!(session.load_module_spec(empty).expect_err("no functions").kind(), ErrorKind::ModuleLoad);

    let mut stale = tandem::tandem_module!(SQUARE);
    stale.name = "stale".to_string();
    stale.format_version = "0.0".to_string();
    assert_eq!(session.load_module_spec(stale).expect_err("old format").kind(), ErrorKind::ModuleLoad);

    let mut truncated = tandem::backend::text_ir::parse_module(SQUARE)
        .expect("parse")
        .to_binary_image()
        .expect("binary");
    truncated.truncate(truncated.len() / 2);
    assert!(matches!(
        session.load_module(&truncated).expect_err("truncated"),
        RuntimeError::ModuleLoad(ModuleLoadError::Serde(_))
    ));

    assert_eq!(session.load_module(b"").expect_err("empty").kind(), ErrorKind::ModuleLoad);

    let names: Vec<String> = session.modules().iter().map(|m| m.name().to_string()).collect();
    assert_eq!(names, vec!["square".to_string()]);
}

#[test]
fn accelerator_rejects_unsupported_dtypes_at_load() {
    let session = session_on("accel");
    let wide = r#"
module @wide {
  func @double(%x: tensor<f64, 2>) -> tensor<f64, 2> {
    %r = add %x, %x -> tensor<f64, 2>
    return %r
  }
}
"#;
    let err = session.load_module(wide.as_bytes()).expect_err("f64 on accel");
    match err {
        RuntimeError::ModuleLoad(ModuleLoadError::Unsupported { function, .. }) => {
            assert_eq!(function, "double")
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(session.modules().is_empty());

    let host = session_on("local-sync");
    host.load_module(wide.as_bytes()).expect("host devices run f64");
}
