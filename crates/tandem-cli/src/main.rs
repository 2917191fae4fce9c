use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tandem::backend::elements::encode_values;
use tandem::runtime::{
    decode_module_image, format_buffer_view, transfer_buffer, BufferView, DeviceHandle, Encoding,
    Instance, InvokeFlags, Session, SessionOptions,
};
use tandem::{BufferParams, DType, Timeout};
use tracing::info;

/// Module used by `demo` when no module file is given.
const DEMO_MODULE: &str = r#"
module @module {
  func @simple_mul(%a: tensor<f32, 4>, %b: tensor<f32, 4>) -> tensor<f32, 4> {
    %r = mul %a, %b -> tensor<f32, 4>
    return %r
  }
}
"#;

#[derive(Parser)]
#[command(
    name = "tandem",
    about = "Run compiled modules across host and accelerator devices",
    version
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Transfer timeout in milliseconds (defaults to TANDEM_TRANSFER_TIMEOUT_MS, else infinite)
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered drivers and the devices they expose
    Devices,
    /// Decode a module image and print its entry points
    Inspect {
        /// Module file (text, JSON or binary image)
        module: PathBuf,
        /// Print the module in the text format
        #[arg(long)]
        text: bool,
    },
    /// Invoke one entry point on one device
    Run {
        /// Module file (text, JSON or binary image)
        module: PathBuf,
        /// Device query, e.g. `local-task`, `accel:1`, `accel@0xacc0`
        #[arg(long, default_value = "local-task")]
        device: String,
        /// Entry point, `function` or `module.function`
        #[arg(long)]
        entry: String,
        /// Inputs as `DIMSxDTYPE=V,V,...`, e.g. `4xf32=1,2,3,4`
        #[arg(long = "input")]
        inputs: Vec<String>,
    },
    /// Multiply on one device, move the product to another and multiply again
    Demo {
        /// Device query for the first invocation
        #[arg(long, default_value = "local-task")]
        first: String,
        /// Device query for the second invocation
        #[arg(long, default_value = "accel")]
        second: String,
        /// Module providing `simple_mul`; a built-in module is used when omitted
        #[arg(long)]
        module: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tandem::logging::init(cli.verbose);
    tandem_backend_local::register_local_drivers();
    tandem_backend_accel::register_accel_driver();

    let timeout = cli
        .timeout_ms
        .map(Timeout::from_millis)
        .unwrap_or_else(tandem::env::default_transfer_timeout);

    match cli.command {
        Commands::Devices => cmd_devices(),
        Commands::Inspect { module, text } => cmd_inspect(&module, text),
        Commands::Run {
            module,
            device,
            entry,
            inputs,
        } => cmd_run(&module, &device, &entry, &inputs, timeout),
        Commands::Demo {
            first,
            second,
            module,
        } => cmd_demo(&first, &second, module.as_deref(), timeout),
    }
}

fn cmd_devices() -> Result<()> {
    let instance = Instance::with_all_drivers()?;
    for driver in instance.drivers() {
        println!("{driver}");
        for device in instance
            .available_devices()
            .into_iter()
            .filter(|device| device.driver == driver)
        {
            println!(
                "  :{:<3} id={:#06x} path={:<10} {}",
                device.ordinal, device.id, device.path, device.name
            );
        }
    }
    Ok(())
}

fn cmd_inspect(path: &Path, text: bool) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let module = decode_module_image(&bytes)
        .with_context(|| format!("failed to decode {}", path.display()))?;
    if text {
        print!("{}", module.to_text());
        return Ok(());
    }
    println!("module @{} (format {})", module.name, module.format_version);
    if !module.requires.is_empty() {
        println!("requires: {}", module.requires.join(", "));
    }
    for function in &module.functions {
        let params: Vec<String> = function.parameters.iter().map(ToString::to_string).collect();
        let results: Vec<String> = function.results.iter().map(ToString::to_string).collect();
        println!(
            "  @{}({}) -> ({})  [{} instruction(s)]",
            function.name,
            params.join(", "),
            results.join(", "),
            function.body.len()
        );
    }
    Ok(())
}

fn open_session(instance: &Instance, query: &str) -> Result<(DeviceHandle, Session)> {
    let device = instance
        .resolve_device(query)
        .with_context(|| format!("failed to resolve device `{query}`"))?;
    info!(device = %device.info(), "opened device");
    let session = Session::new(instance, &device, SessionOptions::default());
    Ok((device, session))
}

fn load(session: &Session, module: Option<&Path>) -> Result<()> {
    match module {
        Some(path) => session
            .load_module_from_file(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => session
            .load_module(DEMO_MODULE.as_bytes())
            .context("failed to load built-in module"),
    }
}

/// Parses `2x2xf32=1,2,3,4` into an uploaded buffer.
fn parse_input(device: &DeviceHandle, raw: &str) -> Result<BufferView> {
    let (layout, values) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("input `{raw}` is missing `=`"))?;
    let mut parts: Vec<&str> = layout.split('x').collect();
    let dtype_name = parts.pop().unwrap_or_default();
    let dtype =
        DType::parse(dtype_name).ok_or_else(|| anyhow!("unknown dtype `{dtype_name}` in `{raw}`"))?;
    let dims = parts
        .iter()
        .map(|dim| {
            dim.parse::<usize>()
                .with_context(|| format!("invalid dimension `{dim}` in `{raw}`"))
        })
        .collect::<Result<Vec<usize>>>()?;
    let tokens: Vec<&str> = values
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .collect();
    let bytes = encode_values(dtype, &tokens).map_err(|err| anyhow!(err))?;
    let buffer = BufferView::allocate_with_copy(
        device,
        &dims,
        dtype,
        Encoding::DenseRowMajor,
        BufferParams::default(),
        &bytes,
    )
    .with_context(|| format!("failed to upload `{raw}`"))?;
    Ok(buffer)
}

fn invoke(session: &Session, entry: &str, inputs: &[&BufferView]) -> Result<Vec<BufferView>> {
    let mut call = session
        .call(entry)
        .with_context(|| format!("failed to initialize `{entry}`"))?;
    for input in inputs {
        call.push_input(input)?;
    }
    call.invoke(InvokeFlags::release_inputs())
        .with_context(|| format!("failed to invoke `{entry}`"))?;
    let mut outputs = Vec::new();
    for _ in 0..call.signature().1.len() {
        outputs.push(call.pop_output()?);
    }
    call.deinitialize();
    Ok(outputs)
}

fn print_outputs(label: &str, outputs: &[BufferView], timeout: Timeout) -> Result<()> {
    let max = tandem::env::print_max_elements();
    for (index, output) in outputs.iter().enumerate() {
        println!("{label}[{index}]: {}", format_buffer_view(output, max, timeout)?);
    }
    Ok(())
}

fn cmd_run(
    module: &Path,
    query: &str,
    entry: &str,
    raw_inputs: &[String],
    timeout: Timeout,
) -> Result<()> {
    let instance = Instance::with_all_drivers()?;
    let (device, session) = open_session(&instance, query)?;
    load(&session, Some(module))?;
    let inputs = raw_inputs
        .iter()
        .map(|raw| parse_input(&device, raw))
        .collect::<Result<Vec<_>>>()?;
    let refs: Vec<&BufferView> = inputs.iter().collect();
    let outputs = invoke(&session, entry, &refs)?;
    print_outputs("result", &outputs, timeout)
}

fn cmd_demo(first: &str, second: &str, module: Option<&Path>, timeout: Timeout) -> Result<()> {
    let instance = Instance::with_all_drivers()?;
    let (first_device, first_session) = open_session(&instance, first)?;
    let (second_device, second_session) = open_session(&instance, second)?;
    load(&first_session, module)?;
    load(&second_session, module)?;

    let a = parse_input(&first_device, "4xf32=1.0,1.1,1.2,1.3")?;
    let b = parse_input(&first_device, "4xf32=10,100,1000,10000")?;
    let product = invoke(&first_session, "simple_mul", &[&a, &b])?;
    let product = product
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("simple_mul produced no output"))?;
    print_outputs(&format!("{first} result"), std::slice::from_ref(&product), timeout)?;

    let moved = transfer_buffer(
        &product,
        &first_device,
        &second_device,
        second_session.host_allocator(),
        timeout,
    )
    .with_context(|| format!("failed to transfer result from `{first}` to `{second}`"))?;
    let c = parse_input(&second_device, "4xf32=2000,200,20,2")?;
    let outputs = invoke(&second_session, "simple_mul", &[&moved, &c])?;
    print_outputs(&format!("{second} result"), &outputs, timeout)?;

    if outputs.len() != 1 {
        bail!("expected one output from the second invocation, got {}", outputs.len());
    }
    Ok(())
}
