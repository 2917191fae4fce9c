use std::{fmt, fs, io, path::Path, sync::Arc, time::Duration};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use thiserror::Error;

/// Module image format version accepted by this runtime.
pub const FORMAT_VERSION: &str = "tandem.module.v1";

/// Leading bytes of a binary module image.
pub const BINARY_MAGIC: &[u8; 4] = b"TNDM";

fn default_format_version() -> String {
    FORMAT_VERSION.to_string()
}

/// Fixed-width scalar element types a buffer or module value may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum DType {
    I1,
    Si8,
    Ui8,
    Si16,
    Ui16,
    Si32,
    Ui32,
    Si64,
    Ui64,
    F16,
    F32,
    F64,
}

impl DType {
    pub const ALL: [DType; 12] = [
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

    /// Returns `true` when the dtype is any signed or unsigned integer.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DType::Si8
                | DType::Ui8
                | DType::Si16
                | DType::Ui16
                | DType::Si32
                | DType::Ui32
                | DType::Si64
                | DType::Ui64
        )
    }

    /// Returns `true` when the dtype is a floating-point representation.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::F32 | DType::F64)
    }

    /// Storage width of one element. Booleans occupy a full byte.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::I1 | DType::Si8 | DType::Ui8 => 1,
            DType::Si16 | DType::Ui16 | DType::F16 => 2,
            DType::Si32 | DType::Ui32 | DType::F32 => 4,
            DType::Si64 | DType::Ui64 | DType::F64 => 8,
        }
    }

    /// Short lowercase name used by the text format and buffer printing.
    pub fn name(self) -> &'static str {
        match self {
            DType::I1 => "i1",
            DType::Si8 => "si8",
            DType::Ui8 => "ui8",
            DType::Si16 => "si16",
            DType::Ui16 => "ui16",
            DType::Si32 => "si32",
            DType::Ui32 => "ui32",
            DType::Si64 => "si64",
            DType::Ui64 => "ui64",
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }

    /// Parses the textual dtype names, accepting `i8`/`u8` style aliases.
    pub fn parse(src: &str) -> Option<DType> {
        let normalized = src.trim().to_ascii_lowercase();
        let dtype = match normalized.as_str() {
            "i1" | "bool" => DType::I1,
            "si8" | "i8" => DType::Si8,
            "ui8" | "u8" => DType::Ui8,
            "si16" | "i16" => DType::Si16,
            "ui16" | "u16" => DType::Ui16,
            "si32" | "i32" => DType::Si32,
            "ui32" | "u32" => DType::Ui32,
            "si64" | "i64" => DType::Si64,
            "ui64" | "u64" => DType::Ui64,
            "f16" => DType::F16,
            "f32" => DType::F32,
            "f64" => DType::F64,
            _ => return None,
        };
        Some(dtype)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Dense tensor shape as an ordered list of static extents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn scalar() -> Self {
        Self::default()
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn into_dims(self) -> Vec<usize> {
        self.dims
    }

    /// Product of all extents, or `None` on overflow.
    pub fn element_count(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .dims
            .iter()
            .map(|dim| dim.to_string())
            .collect::<Vec<_>>()
            .join("x");
        f.write_str(&rendered)
    }
}

/// Tensor metadata coupling dtype and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    pub fn from_dims(dtype: DType, dims: &[usize]) -> Self {
        Self::new(dtype, Shape::new(dims.to_vec()))
    }

    pub fn element_count(&self) -> Option<usize> {
        self.shape.element_count()
    }

    /// Dense row-major byte length: `Π(dims) × width(dtype)`.
    pub fn byte_len(&self) -> Option<usize> {
        self.element_count()?
            .checked_mul(self.dtype.size_in_bytes())
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.shape.rank() == 0 {
            write!(f, "tensor<{}>", self.dtype)
        } else {
            write!(f, "tensor<{}, {}>", self.dtype, self.shape)
        }
    }
}

/// Dense literal tensor payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLiteral {
    pub spec: TensorSpec,
    pub bytes: Arc<[u8]>,
}

impl TensorLiteral {
    pub fn new(spec: TensorSpec, bytes: Arc<[u8]>) -> Self {
        Self { spec, bytes }
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }
}

impl Serialize for TensorLiteral {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("TensorLiteral", 2)?;
        state.serialize_field("spec", &self.spec)?;
        state.serialize_field("bytes", &self.bytes.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for TensorLiteral {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct TensorLiteralHelper {
            spec: TensorSpec,
            bytes: Vec<u8>,
        }

        let helper = TensorLiteralHelper::deserialize(deserializer)?;
        Ok(TensorLiteral {
            spec: helper.spec,
            bytes: Arc::<[u8]>::from(helper.bytes),
        })
    }
}

/// Comparator used by the `compare` op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOp {
    Less,
    LessEqual,
    Equal,
    GreaterEqual,
    Greater,
    NotEqual,
}

impl ComparisonOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            ComparisonOp::Less => "lt",
            ComparisonOp::LessEqual => "le",
            ComparisonOp::Equal => "eq",
            ComparisonOp::GreaterEqual => "ge",
            ComparisonOp::Greater => "gt",
            ComparisonOp::NotEqual => "ne",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseUnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Tanh,
    Erf,
    Rsqrt,
    Reciprocal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceKind {
    Sum,
    Max,
    Min,
}

/// Fully describes a `dot_general` contraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DotGeneralSpec {
    pub batch_lhs: Vec<usize>,
    pub batch_rhs: Vec<usize>,
    pub contract_lhs: Vec<usize>,
    pub contract_rhs: Vec<usize>,
}

/// Configuration shared by `reduce_sum`, `reduce_max`, and `reduce_min`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceSpec {
    pub kind: ReduceKind,
    pub axes: Vec<usize>,
    pub keepdims: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareSpec {
    pub op: ComparisonOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastSpec {
    pub dtype: DType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransposeSpec {
    pub perm: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BroadcastToSpec {
    pub result_shape: Shape,
}

/// Unique identifier for SSA values within a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Operations an entry point body may contain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Constant(TensorLiteral),
    ElementwiseUnary(ElementwiseUnaryOp),
    ElementwiseBinary(ElementwiseBinaryOp),
    DotGeneral(DotGeneralSpec),
    Reduce(ReduceSpec),
    Compare(CompareSpec),
    Select,
    Cast(CastSpec),
    Reshape,
    Transpose(TransposeSpec),
    BroadcastTo(BroadcastToSpec),
}

impl Operation {
    /// Stable mnemonic used in diagnostics and the text format.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Operation::Constant(_) => "constant",
            Operation::ElementwiseUnary(op) => match op {
                ElementwiseUnaryOp::Neg => "neg",
                ElementwiseUnaryOp::Abs => "abs",
                ElementwiseUnaryOp::Exp => "exp",
                ElementwiseUnaryOp::Log => "log",
                ElementwiseUnaryOp::Tanh => "tanh",
                ElementwiseUnaryOp::Erf => "erf",
                ElementwiseUnaryOp::Rsqrt => "rsqrt",
                ElementwiseUnaryOp::Reciprocal => "reciprocal",
            },
            Operation::ElementwiseBinary(op) => match op {
                ElementwiseBinaryOp::Add => "add",
                ElementwiseBinaryOp::Sub => "sub",
                ElementwiseBinaryOp::Mul => "mul",
                ElementwiseBinaryOp::Div => "div",
                ElementwiseBinaryOp::Maximum => "max",
                ElementwiseBinaryOp::Minimum => "min",
            },
            Operation::DotGeneral(_) => "dot_general",
            Operation::Reduce(spec) => match spec.kind {
                ReduceKind::Sum => "reduce_sum",
                ReduceKind::Max => "reduce_max",
                ReduceKind::Min => "reduce_min",
            },
            Operation::Compare(_) => "compare",
            Operation::Select => "select",
            Operation::Cast(_) => "cast",
            Operation::Reshape => "reshape",
            Operation::Transpose(_) => "transpose",
            Operation::BroadcastTo(_) => "broadcast_to",
        }
    }
}

/// Single SSA instruction producing exactly one tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: ValueId,
    pub op: Operation,
    pub operands: Vec<ValueId>,
    pub output: TensorSpec,
}

/// Named, typed entry point: `parameters -> results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub parameters: Vec<TensorSpec>,
    pub parameter_ids: Vec<ValueId>,
    pub results: Vec<TensorSpec>,
    pub body: Vec<Instruction>,
    pub result_ids: Vec<ValueId>,
}

impl Function {
    /// Every tensor type mentioned by the signature or the body.
    pub fn tensor_specs(&self) -> impl Iterator<Item = &TensorSpec> {
        self.parameters
            .iter()
            .chain(self.results.iter())
            .chain(self.body.iter().map(|inst| &inst.output))
    }
}

/// A computation unit: one or more entry points plus the drivers it was built for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSpec {
    #[serde(default = "default_format_version")]
    pub format_version: String,
    pub name: String,
    #[serde(default)]
    pub requires: Vec<String>,
    pub functions: Vec<Function>,
}

#[derive(Debug, Error)]
pub enum ModuleSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("binary image is missing the `TNDM` magic")]
    MissingMagic,
    #[error("module format version '{found}' does not match expected '{expected}'")]
    FormatVersionMismatch {
        found: String,
        expected: &'static str,
    },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ModuleSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            name: name.into(),
            requires: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn with_functions(mut self, functions: Vec<Function>) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_requires(mut self, requires: Vec<String>) -> Self {
        self.requires = requires;
        self
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn to_json_string(&self) -> Result<String, ModuleSerdeError> {
        serde_json::to_string_pretty(self).map_err(ModuleSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, ModuleSerdeError> {
        let mut module: ModuleSpec = serde_json::from_str(src)?;
        module.format_version = normalize_format_version(module.format_version)?;
        Ok(module)
    }

    /// Encodes the module as `TNDM` followed by its bincode payload.
    pub fn to_binary_image(&self) -> Result<Vec<u8>, ModuleSerdeError> {
        let payload = bincode::serialize(self)?;
        let mut image = Vec::with_capacity(BINARY_MAGIC.len() + payload.len());
        image.extend_from_slice(BINARY_MAGIC);
        image.extend_from_slice(&payload);
        Ok(image)
    }

    pub fn from_binary_image(bytes: &[u8]) -> Result<Self, ModuleSerdeError> {
        let payload = bytes
            .strip_prefix(BINARY_MAGIC.as_slice())
            .ok_or(ModuleSerdeError::MissingMagic)?;
        let mut module: ModuleSpec = bincode::deserialize(payload)?;
        module.format_version = normalize_format_version(module.format_version)?;
        Ok(module)
    }

    pub fn save_binary<P: AsRef<Path>>(&self, path: P) -> Result<(), ModuleSerdeError> {
        fs::write(path, self.to_binary_image()?).map_err(ModuleSerdeError::from)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), ModuleSerdeError> {
        fs::write(path, self.to_json_string()?).map_err(ModuleSerdeError::from)
    }

    /// Renders the module in the text format accepted by `text_ir::parse_module`.
    pub fn to_text(&self) -> String {
        format!("{self}")
    }
}

fn normalize_format_version(version: String) -> Result<String, ModuleSerdeError> {
    if version.is_empty() || version == FORMAT_VERSION {
        Ok(FORMAT_VERSION.to_string())
    } else {
        Err(ModuleSerdeError::FormatVersionMismatch {
            found: version,
            expected: FORMAT_VERSION,
        })
    }
}

impl fmt::Display for ModuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module @{}", self.name)?;
        if !self.requires.is_empty() {
            let drivers = self
                .requires
                .iter()
                .map(|driver| format!("\"{driver}\""))
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, " requires[{drivers}]")?;
        }
        writeln!(f, " {{")?;
        for function in &self.functions {
            fmt_function(function, f)?;
        }
        writeln!(f, "}}")
    }
}

fn fmt_function(function: &Function, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let params = function
        .parameter_ids
        .iter()
        .zip(function.parameters.iter())
        .map(|(id, spec)| format!("%v{}: {spec}", id.0))
        .collect::<Vec<_>>()
        .join(", ");
    let results = if function.results.len() == 1 {
        function.results[0].to_string()
    } else {
        let inner = function
            .results
            .iter()
            .map(|spec| spec.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        format!("({inner})")
    };
    writeln!(f, "  func @{}({params}) -> {results} {{", function.name)?;
    for instruction in &function.body {
        writeln!(f, "    {}", format_instruction(instruction))?;
    }
    let returned = function
        .result_ids
        .iter()
        .map(|id| format!("%v{}", id.0))
        .collect::<Vec<_>>()
        .join(", ");
    writeln!(f, "    return {returned}")?;
    writeln!(f, "  }}")
}

fn format_instruction(instruction: &Instruction) -> String {
    let mut parts = vec![instruction.op.mnemonic().to_string()];
    let operands = instruction
        .operands
        .iter()
        .map(|id| format!("%v{}", id.0))
        .collect::<Vec<_>>();
    if !operands.is_empty() {
        parts.push(operands.join(", "));
    }
    if let Some(attrs) = format_attributes(&instruction.op) {
        parts.push(attrs);
    }
    format!(
        "%v{} = {} -> {}",
        instruction.id.0,
        parts.join(" "),
        instruction.output
    )
}

fn format_list(values: &[usize]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_attributes(op: &Operation) -> Option<String> {
    match op {
        Operation::Constant(literal) => Some(format!(
            "value[{}]",
            crate::backend::elements::format_literal_values(literal)
        )),
        Operation::DotGeneral(spec) => {
            let mut attrs = Vec::new();
            if !spec.batch_lhs.is_empty() || !spec.batch_rhs.is_empty() {
                attrs.push(format!("batch_lhs[{}]", format_list(&spec.batch_lhs)));
                attrs.push(format!("batch_rhs[{}]", format_list(&spec.batch_rhs)));
            }
            attrs.push(format!("contract_lhs[{}]", format_list(&spec.contract_lhs)));
            attrs.push(format!("contract_rhs[{}]", format_list(&spec.contract_rhs)));
            Some(attrs.join(" "))
        }
        Operation::Reduce(spec) => Some(format!(
            "axes[{}] keepdims[{}]",
            format_list(&spec.axes),
            spec.keepdims
        )),
        Operation::Compare(spec) => Some(format!("cmp[{}]", spec.op.mnemonic())),
        Operation::Transpose(spec) => Some(format!("perm[{}]", format_list(&spec.perm))),
        Operation::BroadcastTo(spec) => {
            Some(format!("shape[{}]", format_list(spec.result_shape.dims())))
        }
        Operation::ElementwiseUnary(_)
        | Operation::ElementwiseBinary(_)
        | Operation::Select
        | Operation::Cast(_)
        | Operation::Reshape => None,
    }
}

/// Lightweight builder for constructing functions programmatically.
#[derive(Default)]
pub struct FunctionBuilder {
    next_value_id: u32,
    parameters: Vec<(ValueId, TensorSpec)>,
    instructions: Vec<Instruction>,
    value_types: std::collections::HashMap<ValueId, TensorSpec>,
}

impl FunctionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_parameter(&mut self, spec: TensorSpec) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        self.value_types.insert(id, spec.clone());
        self.parameters.push((id, spec));
        id
    }

    pub fn emit(&mut self, op: Operation, operands: Vec<ValueId>, output: TensorSpec) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        self.value_types.insert(id, output.clone());
        self.instructions.push(Instruction {
            id,
            op,
            operands,
            output,
        });
        id
    }

    pub fn value_type(&self, id: ValueId) -> Option<&TensorSpec> {
        self.value_types.get(&id)
    }

    /// Finishes the function; fails when a result id was never defined.
    pub fn finish(
        self,
        name: impl Into<String>,
        result_ids: Vec<ValueId>,
    ) -> Result<Function, ValueId> {
        let mut results = Vec::with_capacity(result_ids.len());
        for id in &result_ids {
            let spec = self.value_types.get(id).ok_or(*id)?;
            results.push(spec.clone());
        }
        let (parameter_ids, parameters): (Vec<_>, Vec<_>) = self.parameters.into_iter().unzip();
        Ok(Function {
            name: name.into(),
            parameters,
            parameter_ids,
            results,
            body: self.instructions,
            result_ids,
        })
    }
}

/// Backend error surfaced to the runtime layer.
#[derive(Debug)]
pub enum BackendError {
    SpecViolation { detail: String },
    Unimplemented { op: &'static str, reason: String },
    Execution { message: String },
    Timeout { waited: Duration },
}

impl BackendError {
    pub fn spec(detail: impl Into<String>) -> Self {
        BackendError::SpecViolation {
            detail: detail.into(),
        }
    }

    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }

    pub fn timeout(waited: Duration) -> Self {
        BackendError::Timeout { waited }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::SpecViolation { detail } => write!(f, "spec violation: {detail}"),
            BackendError::Unimplemented { op, reason } => {
                write!(f, "{op} is not implemented: {reason}")
            }
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
            BackendError::Timeout { waited } => {
                write!(f, "device operation timed out after {waited:?}")
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;
