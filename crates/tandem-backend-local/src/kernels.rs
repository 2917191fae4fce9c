//! Reference interpreter shared by the host and accelerator drivers.
//!
//! Tensors are held decoded (`Arc<[T]>`), so layout-preserving ops like reshape are free and
//! results can be shared between the value table and the caller without copying. Dtypes the
//! interpreter cannot compute on are kept as raw bytes; they can be stored and read back but
//! never executed. Booleans keep their stored byte and are interpreted as `byte != 0`.

use std::collections::HashMap;
use std::sync::Arc;

use tandem::backend::spec::{
    BackendError, BackendResult, BroadcastToSpec, CastSpec, CompareSpec, ComparisonOp, DType,
    DotGeneralSpec, ElementwiseBinaryOp, ElementwiseUnaryOp, Function, Instruction, Operation,
    ReduceKind, ReduceSpec, TensorLiteral, TensorSpec, TransposeSpec, ValueId,
};
use tracing::trace;

/// Dtypes the interpreter can hold.
pub const INTERPRETER_DTYPES: [DType; 5] = [DType::F32, DType::F64, DType::Si32, DType::Si64, DType::I1];

#[derive(Clone, Debug)]
pub struct LocalTensor {
    pub spec: TensorSpec,
    pub data: TensorData,
}

#[derive(Clone, Debug)]
pub enum TensorData {
    F32(Arc<[f32]>),
    F64(Arc<[f64]>),
    Si32(Arc<[i32]>),
    Si64(Arc<[i64]>),
    Bool(Arc<[u8]>),
    Raw { dtype: DType, bytes: Arc<[u8]> },
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
            TensorData::Si32(v) => v.len(),
            TensorData::Si64(v) => v.len(),
            TensorData::Bool(v) => v.len(),
            TensorData::Raw { dtype, bytes } => bytes.len() / dtype.size_in_bytes(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::F64(_) => DType::F64,
            TensorData::Si32(_) => DType::Si32,
            TensorData::Si64(_) => DType::Si64,
            TensorData::Bool(_) => DType::I1,
            TensorData::Raw { dtype, .. } => *dtype,
        }
    }
}

pub fn supports_dtype(dtype: DType) -> bool {
    INTERPRETER_DTYPES.contains(&dtype)
}

impl LocalTensor {
    /// Decodes dense little-endian bytes; the length must match `spec` exactly.
    pub fn from_bytes(spec: &TensorSpec, bytes: &[u8]) -> BackendResult<Self> {
        let expected = spec
            .byte_len()
            .ok_or_else(|| BackendError::spec(format!("{spec} overflows the address space")))?;
        if bytes.len() != expected {
            return Err(BackendError::spec(format!(
                "{spec} needs {expected} bytes, got {}",
                bytes.len()
            )));
        }
        let data = match spec.dtype {
            DType::F32 => TensorData::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::F64 => TensorData::F64(
                bytes
                    .chunks_exact(8)
                    .map(|c| f64::from_le_bytes(le8(c)))
                    .collect(),
            ),
            DType::Si32 => TensorData::Si32(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::Si64 => TensorData::Si64(
                bytes
                    .chunks_exact(8)
                    .map(|c| i64::from_le_bytes(le8(c)))
                    .collect(),
            ),
            DType::I1 => TensorData::Bool(Arc::from(bytes)),
            other => TensorData::Raw {
                dtype: other,
                bytes: Arc::from(bytes),
            },
        };
        Ok(Self {
            spec: spec.clone(),
            data,
        })
    }

    pub fn from_literal(literal: &TensorLiteral) -> BackendResult<Self> {
        Self::from_bytes(&literal.spec, &literal.bytes)
    }

    /// Encodes the tensor back into the dense wire layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        match &self.data {
            TensorData::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::F64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::Si32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::Si64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::Bool(v) => v.to_vec(),
            TensorData::Raw { bytes, .. } => bytes.to_vec(),
        }
    }

    pub fn byte_len(&self) -> usize {
        self.data.len() * self.spec.dtype.size_in_bytes()
    }

    /// Copies `dst.len()` encoded bytes starting at `offset`.
    pub fn read_into(&self, offset: usize, dst: &mut [u8]) -> BackendResult<()> {
        let end = offset
            .checked_add(dst.len())
            .filter(|end| *end <= self.byte_len())
            .ok_or_else(|| {
                BackendError::spec(format!(
                    "read of {} bytes at offset {offset} exceeds {} byte buffer",
                    dst.len(),
                    self.byte_len()
                ))
            })?;
        let bytes = self.to_bytes();
        dst.copy_from_slice(&bytes[offset..end]);
        Ok(())
    }
}

fn le8(c: &[u8]) -> [u8; 8] {
    [c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]
}

/// Runs `function` over already resident inputs, returning its results in declared order.
pub fn run_function(function: &Function, inputs: &[LocalTensor]) -> BackendResult<Vec<LocalTensor>> {
    if function.parameter_ids.len() != inputs.len() {
        return Err(BackendError::execution(format!(
            "@{} expects {} input(s), got {}",
            function.name,
            function.parameter_ids.len(),
            inputs.len()
        )));
    }

    if let Some(raw) = inputs.iter().find(|tensor| !supports_dtype(tensor.data.dtype())) {
        return Err(BackendError::execution(format!(
            "@{} cannot execute on {} input; the dtype is storage-only",
            function.name, raw.data.dtype()
        )));
    }

    let trace_exec = tandem::env::trace_exec_enabled();
    let mut values: HashMap<ValueId, LocalTensor> = HashMap::new();
    for (param_id, tensor) in function.parameter_ids.iter().zip(inputs) {
        values.insert(*param_id, tensor.clone());
    }

    for (instr_index, instruction) in function.body.iter().enumerate() {
        let mut operands = Vec::with_capacity(instruction.operands.len());
        for id in &instruction.operands {
            let tensor = values.get(id).cloned().ok_or_else(|| {
                BackendError::execution(format!("operand %v{} missing", id.0))
            })?;
            operands.push(tensor);
        }
        let result = execute_instruction(instruction, &operands)
            .and_then(|tensor| check_output(instruction, tensor))
            .map_err(|err| {
                augment_backend_error(err, &function.name, instr_index, instruction, &operands)
            })?;
        if trace_exec {
            trace!(
                function = %function.name,
                index = instr_index,
                op = instruction.op.mnemonic(),
                output = %result.spec,
                "executed instruction"
            );
        }
        values.insert(instruction.id, result);
    }

    let mut results = Vec::with_capacity(function.result_ids.len());
    for id in &function.result_ids {
        let value = values.get(id).cloned().ok_or_else(|| {
            BackendError::execution(format!("result %v{} was never produced", id.0))
        })?;
        results.push(value);
    }
    Ok(results)
}

fn check_output(instruction: &Instruction, tensor: LocalTensor) -> BackendResult<LocalTensor> {
    let expected = instruction.output.element_count().unwrap_or(usize::MAX);
    if tensor.data.len() != expected || tensor.data.dtype() != instruction.output.dtype {
        return Err(BackendError::execution(format!(
            "produced {} {} element(s) for declared {}",
            tensor.data.len(),
            tensor.data.dtype(),
            instruction.output
        )));
    }
    Ok(tensor)
}

pub fn execute_instruction(instruction: &Instruction, inputs: &[LocalTensor]) -> BackendResult<LocalTensor> {
    let output = &instruction.output;
    match &instruction.op {
        Operation::Constant(literal) => {
            let tensor = LocalTensor::from_literal(literal)?;
            Ok(LocalTensor {
                spec: output.clone(),
                data: tensor.data,
            })
        }
        Operation::Reshape => op_reshape(inputs, output),
        Operation::Transpose(spec) => op_transpose(inputs, output, spec),
        Operation::BroadcastTo(spec) => op_broadcast_to(inputs, output, spec),
        Operation::DotGeneral(spec) => op_dot_general(inputs, output, spec),
        Operation::ElementwiseBinary(op) => op_elementwise_binary(inputs, output, *op),
        Operation::ElementwiseUnary(op) => op_elementwise_unary(inputs, output, *op),
        Operation::Reduce(spec) => op_reduce(inputs, output, spec),
        Operation::Compare(spec) => op_compare(inputs, output, spec),
        Operation::Select => op_select(inputs, output),
        Operation::Cast(spec) => op_cast(inputs, output, spec),
    }
}

fn augment_backend_error(
    error: BackendError,
    function_name: &str,
    instruction_index: usize,
    instruction: &Instruction,
    inputs: &[LocalTensor],
) -> BackendError {
    let context = format!(
        "at @{} instruction #{}, {} %v{} operands [{}]",
        function_name,
        instruction_index,
        instruction.op.mnemonic(),
        instruction.id.0,
        format_operands(&instruction.operands, inputs)
    );
    match error {
        BackendError::Execution { message } => BackendError::Execution {
            message: format!("{message} ({context})"),
        },
        BackendError::Unimplemented { op, reason } => BackendError::Unimplemented {
            op,
            reason: format!("{reason} ({context})"),
        },
        BackendError::SpecViolation { detail } => BackendError::SpecViolation {
            detail: format!("{detail} ({context})"),
        },
        other => other,
    }
}

fn format_operands(operands: &[ValueId], inputs: &[LocalTensor]) -> String {
    if operands.is_empty() {
        return String::from("<none>");
    }
    operands
        .iter()
        .zip(inputs)
        .map(|(id, tensor)| format!("%v{} {}", id.0, tensor.spec))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Arithmetic the numeric kernels need from an element type.
trait Element: Copy + PartialOrd + Send + Sync + 'static {
    const ZERO: Self;
    const LOWEST: Self;
    const HIGHEST: Self;

    fn plus(self, other: Self) -> Self;
    fn minus(self, other: Self) -> Self;
    fn times(self, other: Self) -> Self;
    fn divide(self, other: Self) -> BackendResult<Self>;
    fn negate(self) -> Self;
    fn magnitude(self) -> Self;
    fn maximum(self, other: Self) -> Self;
    fn minimum(self, other: Self) -> Self;
}

macro_rules! float_element {
    ($ty:ty) => {
        impl Element for $ty {
            const ZERO: Self = 0.0;
            const LOWEST: Self = <$ty>::NEG_INFINITY;
            const HIGHEST: Self = <$ty>::INFINITY;

            fn plus(self, other: Self) -> Self {
                self + other
            }
            fn minus(self, other: Self) -> Self {
                self - other
            }
            fn times(self, other: Self) -> Self {
                self * other
            }
            fn divide(self, other: Self) -> BackendResult<Self> {
                Ok(self / other)
            }
            fn negate(self) -> Self {
                -self
            }
            fn magnitude(self) -> Self {
                <$ty>::abs(self)
            }
            fn maximum(self, other: Self) -> Self {
                <$ty>::max(self, other)
            }
            fn minimum(self, other: Self) -> Self {
                <$ty>::min(self, other)
            }
        }
    };
}

macro_rules! int_element {
    ($ty:ty) => {
        impl Element for $ty {
            const ZERO: Self = 0;
            const LOWEST: Self = <$ty>::MIN;
            const HIGHEST: Self = <$ty>::MAX;

            fn plus(self, other: Self) -> Self {
                self.wrapping_add(other)
            }
            fn minus(self, other: Self) -> Self {
                self.wrapping_sub(other)
            }
            fn times(self, other: Self) -> Self {
                self.wrapping_mul(other)
            }
            fn divide(self, other: Self) -> BackendResult<Self> {
                self.checked_div(other)
                    .ok_or_else(|| BackendError::execution("integer division by zero or overflow"))
            }
            fn negate(self) -> Self {
                self.wrapping_neg()
            }
            fn magnitude(self) -> Self {
                self.wrapping_abs()
            }
            fn maximum(self, other: Self) -> Self {
                Ord::max(self, other)
            }
            fn minimum(self, other: Self) -> Self {
                Ord::min(self, other)
            }
        }
    };
}

float_element!(f32);
float_element!(f64);
int_element!(i32);
int_element!(i64);

/// Rebuilds every variant from a generic body run on its slice.
macro_rules! map_any {
    ($data:expr, |$values:ident| $body:expr) => {
        match $data {
            TensorData::F32($values) => TensorData::F32(Arc::from($body)),
            TensorData::F64($values) => TensorData::F64(Arc::from($body)),
            TensorData::Si32($values) => TensorData::Si32(Arc::from($body)),
            TensorData::Si64($values) => TensorData::Si64(Arc::from($body)),
            TensorData::Bool($values) => TensorData::Bool(Arc::from($body)),
            TensorData::Raw { dtype, .. } => return Err(raw_storage("layout", *dtype)),
        }
    };
}

/// Like [`map_any`] but rejects booleans; `$body` yields a `BackendResult<Vec<T>>`.
macro_rules! map_numeric {
    ($data:expr, $op:expr, |$values:ident| $body:expr) => {
        match $data {
            TensorData::F32($values) => TensorData::F32(Arc::from($body?)),
            TensorData::F64($values) => TensorData::F64(Arc::from($body?)),
            TensorData::Si32($values) => TensorData::Si32(Arc::from($body?)),
            TensorData::Si64($values) => TensorData::Si64(Arc::from($body?)),
            TensorData::Bool(_) => {
                return Err(BackendError::unimplemented(
                    $op,
                    "boolean tensors are not supported",
                ))
            }
            TensorData::Raw { dtype, .. } => return Err(raw_storage($op, *dtype)),
        }
    };
}

fn op_reshape(inputs: &[LocalTensor], output: &TensorSpec) -> BackendResult<LocalTensor> {
    let input = expect_single(inputs)?;
    if input.spec.element_count() != output.element_count() {
        return Err(BackendError::execution("reshape element count mismatch"));
    }
    Ok(LocalTensor {
        spec: output.clone(),
        data: input.data.clone(),
    })
}

fn op_transpose(
    inputs: &[LocalTensor],
    output: &TensorSpec,
    spec: &TransposeSpec,
) -> BackendResult<LocalTensor> {
    let input = expect_single(inputs)?;
    let input_dims = input.spec.shape.dims();
    let rank = input_dims.len();
    let mut seen = vec![false; rank];
    for &axis in &spec.perm {
        if axis >= rank || std::mem::replace(&mut seen[axis], true) {
            return Err(BackendError::execution(format!(
                "transpose perm {:?} is not a permutation of rank {rank}",
                spec.perm
            )));
        }
    }
    if spec.perm.len() != rank {
        return Err(BackendError::execution("transpose rank mismatch"));
    }
    let out_dims: Vec<usize> = spec.perm.iter().map(|&axis| input_dims[axis]).collect();
    if out_dims != output.shape.dims() {
        return Err(BackendError::execution("transpose output shape mismatch"));
    }
    let input_strides = compute_strides(input_dims);
    let out_len: usize = out_dims.iter().product();
    let sources: Vec<usize> = (0..out_len)
        .map(|idx| {
            unravel_index(idx, &out_dims)
                .iter()
                .enumerate()
                .map(|(out_axis, &coord)| coord * input_strides[spec.perm[out_axis]])
                .sum()
        })
        .collect();
    Ok(LocalTensor {
        spec: output.clone(),
        data: map_any!(&input.data, |values| gather(values, &sources)),
    })
}

fn op_broadcast_to(
    inputs: &[LocalTensor],
    output: &TensorSpec,
    spec: &BroadcastToSpec,
) -> BackendResult<LocalTensor> {
    let input = expect_single(inputs)?;
    let input_dims = input.spec.shape.dims();
    let out_dims = output.shape.dims();
    if out_dims != spec.result_shape.dims() {
        return Err(BackendError::execution("broadcast_to result shape mismatch"));
    }
    if out_dims.len() < input_dims.len() {
        return Err(BackendError::execution(
            "broadcast_to result rank must be >= operand rank",
        ));
    }
    let rank_diff = out_dims.len() - input_dims.len();
    for (axis, &dim) in input_dims.iter().enumerate() {
        let out_dim = out_dims[rank_diff + axis];
        if dim != 1 && dim != out_dim {
            return Err(BackendError::execution(format!(
                "broadcast_to cannot expand dim {dim} to {out_dim}"
            )));
        }
    }
    let mut aligned = vec![1usize; out_dims.len()];
    aligned[rank_diff..].copy_from_slice(input_dims);
    let in_strides = compute_strides(&aligned);
    let out_len: usize = out_dims.iter().product();
    let sources: Vec<usize> = (0..out_len)
        .map(|idx| {
            unravel_index(idx, out_dims)
                .iter()
                .enumerate()
                .map(|(axis, &coord)| if aligned[axis] == 1 { 0 } else { coord * in_strides[axis] })
                .sum()
        })
        .collect();
    Ok(LocalTensor {
        spec: output.clone(),
        data: map_any!(&input.data, |values| gather(values, &sources)),
    })
}

fn gather<T: Copy>(values: &[T], sources: &[usize]) -> Vec<T> {
    sources.iter().map(|&src| values[src]).collect()
}

fn op_elementwise_binary(
    inputs: &[LocalTensor],
    output: &TensorSpec,
    op: ElementwiseBinaryOp,
) -> BackendResult<LocalTensor> {
    let [lhs, rhs] = inputs else {
        return Err(BackendError::execution("elementwise binary expects 2 inputs"));
    };
    if lhs.spec.shape != rhs.spec.shape || lhs.spec.shape != output.shape {
        return Err(BackendError::execution(format!(
            "elementwise operands {} and {} must match the result {}",
            lhs.spec, rhs.spec, output
        )));
    }
    let data = match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(b)) => TensorData::F32(Arc::from(binary(op, a, b)?)),
        (TensorData::F64(a), TensorData::F64(b)) => TensorData::F64(Arc::from(binary(op, a, b)?)),
        (TensorData::Si32(a), TensorData::Si32(b)) => TensorData::Si32(Arc::from(binary(op, a, b)?)),
        (TensorData::Si64(a), TensorData::Si64(b)) => TensorData::Si64(Arc::from(binary(op, a, b)?)),
        _ => {
            return Err(BackendError::execution(format!(
                "elementwise operands must share a numeric dtype, got {} and {}",
                lhs.spec.dtype, rhs.spec.dtype
            )))
        }
    };
    Ok(LocalTensor {
        spec: output.clone(),
        data,
    })
}

fn binary<T: Element>(op: ElementwiseBinaryOp, a: &[T], b: &[T]) -> BackendResult<Vec<T>> {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| match op {
            ElementwiseBinaryOp::Add => Ok(x.plus(y)),
            ElementwiseBinaryOp::Sub => Ok(x.minus(y)),
            ElementwiseBinaryOp::Mul => Ok(x.times(y)),
            ElementwiseBinaryOp::Div => x.divide(y),
            ElementwiseBinaryOp::Maximum => Ok(x.maximum(y)),
            ElementwiseBinaryOp::Minimum => Ok(x.minimum(y)),
        })
        .collect()
}

macro_rules! float_unary {
    ($values:expr, $op:expr, $erf:path) => {
        $values
            .iter()
            .map(|&x| match $op {
                ElementwiseUnaryOp::Neg => -x,
                ElementwiseUnaryOp::Abs => x.abs(),
                ElementwiseUnaryOp::Exp => x.exp(),
                ElementwiseUnaryOp::Log => x.ln(),
                ElementwiseUnaryOp::Tanh => x.tanh(),
                ElementwiseUnaryOp::Erf => $erf(x),
                ElementwiseUnaryOp::Rsqrt => 1.0 / x.sqrt(),
                ElementwiseUnaryOp::Reciprocal => 1.0 / x,
            })
            .collect::<Vec<_>>()
    };
}

fn op_elementwise_unary(
    inputs: &[LocalTensor],
    output: &TensorSpec,
    op: ElementwiseUnaryOp,
) -> BackendResult<LocalTensor> {
    let input = expect_single(inputs)?;
    let data = match &input.data {
        TensorData::F32(values) => TensorData::F32(Arc::from(float_unary!(values, op, libm::erff))),
        TensorData::F64(values) => TensorData::F64(Arc::from(float_unary!(values, op, libm::erf))),
        TensorData::Si32(values) => TensorData::Si32(Arc::from(int_unary(values, op)?)),
        TensorData::Si64(values) => TensorData::Si64(Arc::from(int_unary(values, op)?)),
        TensorData::Bool(_) => {
            return Err(BackendError::unimplemented(
                "elementwise_unary",
                "boolean tensors are not supported",
            ))
        }
        TensorData::Raw { dtype, .. } => return Err(raw_storage("elementwise_unary", *dtype)),
    };
    Ok(LocalTensor {
        spec: output.clone(),
        data,
    })
}

fn int_unary<T: Element>(values: &[T], op: ElementwiseUnaryOp) -> BackendResult<Vec<T>> {
    match op {
        ElementwiseUnaryOp::Neg => Ok(values.iter().map(|x| x.negate()).collect()),
        ElementwiseUnaryOp::Abs => Ok(values.iter().map(|x| x.magnitude()).collect()),
        other => Err(BackendError::unimplemented(
            "elementwise_unary",
            format!("{other:?} requires a floating point operand"),
        )),
    }
}

fn op_reduce(
    inputs: &[LocalTensor],
    output: &TensorSpec,
    spec: &ReduceSpec,
) -> BackendResult<LocalTensor> {
    let input = expect_single(inputs)?;
    let dims = input.spec.shape.dims();
    let mut seen = vec![false; dims.len()];
    for &axis in &spec.axes {
        if axis >= dims.len() || std::mem::replace(&mut seen[axis], true) {
            return Err(BackendError::execution(format!(
                "reduce axes {:?} invalid for rank {}",
                spec.axes,
                dims.len()
            )));
        }
    }
    let kept: Vec<usize> = dims
        .iter()
        .enumerate()
        .map(|(axis, &dim)| if seen[axis] { 1 } else { dim })
        .collect();
    let expected_out: Vec<usize> = if spec.keepdims {
        kept.clone()
    } else {
        dims.iter()
            .enumerate()
            .filter(|(axis, _)| !seen[*axis])
            .map(|(_, &dim)| dim)
            .collect()
    };
    if expected_out != output.shape.dims() {
        return Err(BackendError::execution(format!(
            "reduce over {:?} of {} cannot produce {}",
            spec.axes, input.spec, output
        )));
    }
    let data = map_numeric!(&input.data, "reduce", |values| Ok::<_, BackendError>(
        reduce_values(values, dims, &kept, &seen, spec.kind)
    ));
    Ok(LocalTensor {
        spec: output.clone(),
        data,
    })
}

fn reduce_values<T: Element>(
    values: &[T],
    dims: &[usize],
    kept: &[usize],
    reduced: &[bool],
    kind: ReduceKind,
) -> Vec<T> {
    let init = match kind {
        ReduceKind::Sum => T::ZERO,
        ReduceKind::Max => T::LOWEST,
        ReduceKind::Min => T::HIGHEST,
    };
    let mut result = vec![init; kept.iter().product()];
    let out_strides = compute_strides(kept);
    for (idx, &value) in values.iter().enumerate() {
        let target: usize = unravel_index(idx, dims)
            .iter()
            .enumerate()
            .filter(|(axis, _)| !reduced[*axis])
            .map(|(axis, &coord)| coord * out_strides[axis])
            .sum();
        let slot = &mut result[target];
        *slot = match kind {
            ReduceKind::Sum => slot.plus(value),
            ReduceKind::Max => slot.maximum(value),
            ReduceKind::Min => slot.minimum(value),
        };
    }
    result
}

fn op_dot_general(
    inputs: &[LocalTensor],
    output: &TensorSpec,
    spec: &DotGeneralSpec,
) -> BackendResult<LocalTensor> {
    let [lhs, rhs] = inputs else {
        return Err(BackendError::execution("dot_general expects two inputs"));
    };
    let lhs_dims = lhs.spec.shape.dims();
    let rhs_dims = rhs.spec.shape.dims();
    if spec.batch_lhs.len() != spec.batch_rhs.len()
        || spec.contract_lhs.len() != spec.contract_rhs.len()
    {
        return Err(BackendError::execution(
            "dot_general batch/contract axis lists differ in length",
        ));
    }
    let axis_in_range = |axes: &[usize], rank: usize| axes.iter().all(|&axis| axis < rank);
    if !axis_in_range(&spec.batch_lhs, lhs_dims.len())
        || !axis_in_range(&spec.contract_lhs, lhs_dims.len())
        || !axis_in_range(&spec.batch_rhs, rhs_dims.len())
        || !axis_in_range(&spec.contract_rhs, rhs_dims.len())
    {
        return Err(BackendError::execution("dot_general axis out of range"));
    }
    for (l, r) in spec
        .batch_lhs
        .iter()
        .zip(&spec.batch_rhs)
        .chain(spec.contract_lhs.iter().zip(&spec.contract_rhs))
    {
        if lhs_dims[*l] != rhs_dims[*r] {
            return Err(BackendError::execution(format!(
                "dot_general extent mismatch: lhs axis {l} is {}, rhs axis {r} is {}",
                lhs_dims[*l], rhs_dims[*r]
            )));
        }
    }
    let layout = DotLayout::new(lhs_dims, rhs_dims, spec);
    if layout.output_len() != output.element_count().unwrap_or(usize::MAX) {
        return Err(BackendError::execution(format!(
            "dot_general of {} and {} cannot produce {}",
            lhs.spec, rhs.spec, output
        )));
    }
    let data = match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(b)) => TensorData::F32(Arc::from(layout.run(a, b))),
        (TensorData::F64(a), TensorData::F64(b)) => TensorData::F64(Arc::from(layout.run(a, b))),
        (TensorData::Si32(a), TensorData::Si32(b)) => TensorData::Si32(Arc::from(layout.run(a, b))),
        (TensorData::Si64(a), TensorData::Si64(b)) => TensorData::Si64(Arc::from(layout.run(a, b))),
        _ => {
            return Err(BackendError::execution(
                "dot_general operands must share a numeric dtype",
            ))
        }
    };
    Ok(LocalTensor {
        spec: output.clone(),
        data,
    })
}

/// Axis bookkeeping for `dot_general`; output order is batch, lhs free, rhs free.
struct DotLayout {
    lhs_strides: Vec<usize>,
    rhs_strides: Vec<usize>,
    lhs_batch: Vec<usize>,
    rhs_batch: Vec<usize>,
    lhs_contract: Vec<usize>,
    rhs_contract: Vec<usize>,
    lhs_free: Vec<usize>,
    rhs_free: Vec<usize>,
    batch_shape: Vec<usize>,
    lhs_free_shape: Vec<usize>,
    rhs_free_shape: Vec<usize>,
    contract_shape: Vec<usize>,
}

impl DotLayout {
    fn new(lhs_dims: &[usize], rhs_dims: &[usize], spec: &DotGeneralSpec) -> Self {
        let lhs_free: Vec<usize> = (0..lhs_dims.len())
            .filter(|ax| !spec.batch_lhs.contains(ax) && !spec.contract_lhs.contains(ax))
            .collect();
        let rhs_free: Vec<usize> = (0..rhs_dims.len())
            .filter(|ax| !spec.batch_rhs.contains(ax) && !spec.contract_rhs.contains(ax))
            .collect();
        Self {
            lhs_strides: compute_strides(lhs_dims),
            rhs_strides: compute_strides(rhs_dims),
            batch_shape: spec.batch_lhs.iter().map(|&ax| lhs_dims[ax]).collect(),
            lhs_free_shape: lhs_free.iter().map(|&ax| lhs_dims[ax]).collect(),
            rhs_free_shape: rhs_free.iter().map(|&ax| rhs_dims[ax]).collect(),
            contract_shape: spec.contract_lhs.iter().map(|&ax| lhs_dims[ax]).collect(),
            lhs_batch: spec.batch_lhs.clone(),
            rhs_batch: spec.batch_rhs.clone(),
            lhs_contract: spec.contract_lhs.clone(),
            rhs_contract: spec.contract_rhs.clone(),
            lhs_free,
            rhs_free,
        }
    }

    fn output_len(&self) -> usize {
        self.batch_shape
            .iter()
            .chain(&self.lhs_free_shape)
            .chain(&self.rhs_free_shape)
            .product()
    }

    fn run<T: Element>(&self, lhs: &[T], rhs: &[T]) -> Vec<T> {
        let mut output = Vec::with_capacity(self.output_len());
        for batch_index in MultiIndex::new(&self.batch_shape) {
            for lhs_free_index in MultiIndex::new(&self.lhs_free_shape) {
                for rhs_free_index in MultiIndex::new(&self.rhs_free_shape) {
                    let mut sum = T::ZERO;
                    for contract_index in MultiIndex::new(&self.contract_shape) {
                        let lhs_idx = build_index(
                            &self.lhs_strides,
                            &self.lhs_batch,
                            &self.lhs_free,
                            &self.lhs_contract,
                            &batch_index,
                            &lhs_free_index,
                            &contract_index,
                        );
                        let rhs_idx = build_index(
                            &self.rhs_strides,
                            &self.rhs_batch,
                            &self.rhs_free,
                            &self.rhs_contract,
                            &batch_index,
                            &rhs_free_index,
                            &contract_index,
                        );
                        sum = sum.plus(lhs[lhs_idx].times(rhs[rhs_idx]));
                    }
                    output.push(sum);
                }
            }
        }
        output
    }
}

fn op_compare(
    inputs: &[LocalTensor],
    output: &TensorSpec,
    spec: &CompareSpec,
) -> BackendResult<LocalTensor> {
    let [lhs, rhs] = inputs else {
        return Err(BackendError::execution("compare expects two inputs"));
    };
    if lhs.spec.shape != rhs.spec.shape {
        return Err(BackendError::execution("compare operand shape mismatch"));
    }
    let flags = match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(b)) => compare_values(spec.op, a, b),
        (TensorData::F64(a), TensorData::F64(b)) => compare_values(spec.op, a, b),
        (TensorData::Si32(a), TensorData::Si32(b)) => compare_values(spec.op, a, b),
        (TensorData::Si64(a), TensorData::Si64(b)) => compare_values(spec.op, a, b),
        (TensorData::Bool(a), TensorData::Bool(b)) => compare_values(spec.op, &truthy(a), &truthy(b)),
        _ => {
            return Err(BackendError::execution(format!(
                "compare operands must share a dtype, got {} and {}",
                lhs.spec.dtype, rhs.spec.dtype
            )))
        }
    };
    Ok(LocalTensor {
        spec: output.clone(),
        data: TensorData::Bool(Arc::from(flags)),
    })
}

fn truthy(bytes: &[u8]) -> Vec<bool> {
    bytes.iter().map(|&b| b != 0).collect()
}

fn compare_values<T: PartialOrd>(op: ComparisonOp, a: &[T], b: &[T]) -> Vec<u8> {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let flag = match op {
                ComparisonOp::Less => x < y,
                ComparisonOp::LessEqual => x <= y,
                ComparisonOp::Equal => x == y,
                ComparisonOp::GreaterEqual => x >= y,
                ComparisonOp::Greater => x > y,
                ComparisonOp::NotEqual => x != y,
            };
            flag as u8
        })
        .collect()
}

fn op_select(inputs: &[LocalTensor], output: &TensorSpec) -> BackendResult<LocalTensor> {
    let [pred, on_true, on_false] = inputs else {
        return Err(BackendError::execution("select expects three operands"));
    };
    let TensorData::Bool(pred) = &pred.data else {
        return Err(BackendError::execution("select predicate must be i1"));
    };
    if pred.len() != on_true.data.len() || on_true.spec != on_false.spec {
        return Err(BackendError::execution("select operand shape mismatch"));
    }
    let data = match (&on_true.data, &on_false.data) {
        (TensorData::F32(a), TensorData::F32(b)) => TensorData::F32(Arc::from(choose(pred, a, b))),
        (TensorData::F64(a), TensorData::F64(b)) => TensorData::F64(Arc::from(choose(pred, a, b))),
        (TensorData::Si32(a), TensorData::Si32(b)) => TensorData::Si32(Arc::from(choose(pred, a, b))),
        (TensorData::Si64(a), TensorData::Si64(b)) => TensorData::Si64(Arc::from(choose(pred, a, b))),
        (TensorData::Bool(a), TensorData::Bool(b)) => TensorData::Bool(Arc::from(choose(pred, a, b))),
        _ => return Err(BackendError::execution("select dtype combination unsupported")),
    };
    Ok(LocalTensor {
        spec: output.clone(),
        data,
    })
}

fn choose<T: Copy>(pred: &[u8], on_true: &[T], on_false: &[T]) -> Vec<T> {
    pred.iter()
        .zip(on_true.iter().zip(on_false))
        .map(|(&flag, (&t, &f))| if flag != 0 { t } else { f })
        .collect()
}

/// Intermediate form for casts: floats widen to f64, integers and booleans to i64.
enum Column {
    Float(Vec<f64>),
    Int(Vec<i64>),
}

fn op_cast(inputs: &[LocalTensor], output: &TensorSpec, spec: &CastSpec) -> BackendResult<LocalTensor> {
    let input = expect_single(inputs)?;
    if output.dtype != spec.dtype {
        return Err(BackendError::execution("cast output dtype mismatch"));
    }
    if input.spec.shape != output.shape {
        return Err(BackendError::execution("cast shape mismatch"));
    }
    let column = match &input.data {
        TensorData::F32(v) => Column::Float(v.iter().map(|&x| x as f64).collect()),
        TensorData::F64(v) => Column::Float(v.to_vec()),
        TensorData::Si32(v) => Column::Int(v.iter().map(|&x| x as i64).collect()),
        TensorData::Si64(v) => Column::Int(v.to_vec()),
        TensorData::Bool(v) => Column::Int(v.iter().map(|&x| (x != 0) as i64).collect()),
        TensorData::Raw { dtype, .. } => return Err(raw_storage("cast", *dtype)),
    };
    // `as` truncates toward zero and saturates, mapping NaN to zero.
    let data = match (column, spec.dtype) {
        (Column::Float(v), DType::F32) => TensorData::F32(v.iter().map(|&x| x as f32).collect()),
        (Column::Float(v), DType::F64) => TensorData::F64(Arc::from(v)),
        (Column::Float(v), DType::Si32) => TensorData::Si32(v.iter().map(|&x| x as i32).collect()),
        (Column::Float(v), DType::Si64) => TensorData::Si64(v.iter().map(|&x| x as i64).collect()),
        (Column::Float(v), DType::I1) => TensorData::Bool(v.iter().map(|&x| (x != 0.0) as u8).collect()),
        (Column::Int(v), DType::F32) => TensorData::F32(v.iter().map(|&x| x as f32).collect()),
        (Column::Int(v), DType::F64) => TensorData::F64(v.iter().map(|&x| x as f64).collect()),
        (Column::Int(v), DType::Si32) => TensorData::Si32(v.iter().map(|&x| x as i32).collect()),
        (Column::Int(v), DType::Si64) => TensorData::Si64(Arc::from(v)),
        (Column::Int(v), DType::I1) => TensorData::Bool(v.iter().map(|&x| (x != 0) as u8).collect()),
        (_, other) => {
            return Err(BackendError::unimplemented(
                "cast",
                format!("cast to {other} is not supported"),
            ))
        }
    };
    Ok(LocalTensor {
        spec: output.clone(),
        data,
    })
}

fn raw_storage(context: &'static str, dtype: DType) -> BackendError {
    BackendError::unimplemented(context, format!("dtype {dtype} is storage-only on this device"))
}

fn expect_single(inputs: &[LocalTensor]) -> BackendResult<&LocalTensor> {
    match inputs {
        [single] => Ok(single),
        _ => Err(BackendError::execution("operation expects single input")),
    }
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        if *dim == 0 {
            continue;
        }
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}

struct MultiIndex {
    shape: Vec<usize>,
    current: Vec<usize>,
    first: bool,
}

impl MultiIndex {
    fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            current: vec![0; shape.len()],
            first: !shape.contains(&0),
        }
    }
}

impl Iterator for MultiIndex {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.first {
            self.first = false;
            return Some(self.current.clone());
        }
        for i in (0..self.current.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.shape[i] {
                return Some(self.current.clone());
            }
            self.current[i] = 0;
        }
        None
    }
}

fn build_index(
    strides: &[usize],
    batch_axes: &[usize],
    free_axes: &[usize],
    contract_axes: &[usize],
    batch_index: &[usize],
    free_index: &[usize],
    contract_index: &[usize],
) -> usize {
    let mut index = 0usize;
    for (axis, &coord) in batch_axes.iter().zip(batch_index) {
        index += coord * strides[*axis];
    }
    for (axis, &coord) in free_axes.iter().zip(free_index) {
        index += coord * strides[*axis];
    }
    for (axis, &coord) in contract_axes.iter().zip(contract_index) {
        index += coord * strides[*axis];
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem::backend::elements::{bytes_to_f32, f32_to_bytes};
    use tandem::backend::text_ir::parse_function;

    fn f32_tensor(dims: &[usize], values: &[f32]) -> LocalTensor {
        LocalTensor::from_bytes(&TensorSpec::from_dims(DType::F32, dims), &f32_to_bytes(values))
            .expect("tensor")
    }

    fn run_f32(src: &str, inputs: &[LocalTensor]) -> Vec<Vec<f32>> {
        let function = parse_function(src).expect("parse");
        run_function(&function, inputs)
            .expect("run")
            .iter()
            .map(|t| bytes_to_f32(&t.to_bytes()))
            .collect()
    }

    #[test]
    fn matmul_contracts_inner_axis() {
        let src = r#"
func @mm(%a: tensor<f32, 2x3>, %b: tensor<f32, 3x2>) -> tensor<f32, 2x2> {
  %c = dot_general %a, %b contract_lhs[1] contract_rhs[0] -> tensor<f32, 2x2>
  return %c
}"#;
        let a = f32_tensor(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = f32_tensor(&[3, 2], &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        assert_eq!(run_f32(src, &[a, b]), vec![vec![58.0, 64.0, 139.0, 154.0]]);
    }

    #[test]
    fn reduce_over_multiple_axes_without_keepdims() {
        let src = r#"
func @r(%x: tensor<f32, 2x2x2>) -> tensor<f32, 2> {
  %s = reduce_sum %x axes[0, 2] keepdims[false] -> tensor<f32, 2>
  return %s
}"#;
        let x = f32_tensor(&[2, 2, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        assert_eq!(run_f32(src, &[x]), vec![vec![14.0, 22.0]]);
    }

    #[test]
    fn transpose_and_broadcast() {
        let src = r#"
func @t(%x: tensor<f32, 2x3>, %row: tensor<f32, 2>) -> (tensor<f32, 3x2>, tensor<f32, 3x2>) {
  %t = transpose %x perm[1, 0] -> tensor<f32, 3x2>
  %b = broadcast_to %row shape[3, 2] -> tensor<f32, 3x2>
  return %t, %b
}"#;
        let x = f32_tensor(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let row = f32_tensor(&[2], &[10.0, 20.0]);
        let out = run_f32(src, &[x, row]);
        assert_eq!(out[0], vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(out[1], vec![10.0, 20.0, 10.0, 20.0, 10.0, 20.0]);
    }

    #[test]
    fn relu_via_compare_and_select() {
        let src = r#"
func @relu(%x: tensor<f32, 4>) -> tensor<f32, 4> {
  %z = constant value[0.0] -> tensor<f32, 4>
  %p = compare %x, %z cmp[gt] -> tensor<i1, 4>
  %r = select %p, %x, %z -> tensor<f32, 4>
  return %r
}"#;
        let x = f32_tensor(&[4], &[-1.0, 2.0, -3.0, 4.0]);
        assert_eq!(run_f32(src, &[x]), vec![vec![0.0, 2.0, 0.0, 4.0]]);
    }

    #[test]
    fn integer_division_by_zero_is_an_execution_error() {
        let src = r#"
func @d(%a: tensor<si32, 2>, %b: tensor<si32, 2>) -> tensor<si32, 2> {
  %q = div %a, %b -> tensor<si32, 2>
  return %q
}"#;
        let function = parse_function(src).expect("parse");
        let spec = TensorSpec::from_dims(DType::Si32, &[2]);
        let a = LocalTensor::from_bytes(&spec, &tandem::backend::elements::i32_to_bytes(&[4, 6]))
            .expect("a");
        let b = LocalTensor::from_bytes(&spec, &tandem::backend::elements::i32_to_bytes(&[2, 0]))
            .expect("b");
        let err = run_function(&function, &[a, b]).expect_err("division by zero");
        let message = err.to_string();
        assert!(message.contains("division by zero"), "{message}");
        assert!(message.contains("@d instruction #0"), "{message}");
    }

    #[test]
    fn boolean_bytes_are_kept_and_read_as_nonzero() {
        let spec = TensorSpec::from_dims(DType::I1, &[4]);
        let stored = LocalTensor::from_bytes(&spec, &[0, 2, 255, 1]).expect("stored");
        let canonical = LocalTensor::from_bytes(&spec, &[0, 1, 1, 1]).expect("canonical");
        assert_eq!(stored.to_bytes(), vec![0, 2, 255, 1]);

        let src = r#"
func @b(%x: tensor<i1, 4>, %y: tensor<i1, 4>) -> (tensor<i1, 4>, tensor<si32, 4>) {
  %e = compare %x, %y cmp[eq] -> tensor<i1, 4>
  %c = cast %x -> tensor<si32, 4>
  return %e, %c
}"#;
        let function = parse_function(src).expect("parse");
        let out = run_function(&function, &[stored, canonical]).expect("run");
        assert_eq!(out[0].to_bytes(), vec![1, 1, 1, 1]);
        assert_eq!(
            tandem::backend::elements::bytes_to_i32(&out[1].to_bytes()),
            vec![0, 1, 1, 1]
        );
    }

    #[test]
    fn unsupported_dtypes_are_stored_but_not_executed() {
        let spec = TensorSpec::from_dims(DType::Ui8, &[3]);
        let tensor = LocalTensor::from_bytes(&spec, &[7, 0, 200]).expect("ui8 storage");
        assert_eq!(tensor.data.dtype(), DType::Ui8);
        assert_eq!(tensor.data.len(), 3);
        assert_eq!(tensor.to_bytes(), vec![7, 0, 200]);

        let src = r#"
func @id(%x: tensor<ui8, 3>) -> tensor<ui8, 3> {
  %r = reshape %x -> tensor<ui8, 3>
  return %r
}"#;
        let function = parse_function(src).expect("parse");
        let err = run_function(&function, &[tensor]).expect_err("ui8 is storage-only");
        assert!(err.to_string().contains("storage-only"), "{err}");
    }

    #[test]
    fn read_into_rejects_out_of_range_windows() {
        let tensor = f32_tensor(&[2], &[1.0, 2.0]);
        let mut dst = [0u8; 4];
        tensor.read_into(4, &mut dst).expect("in range");
        assert_eq!(f32::from_le_bytes(dst), 2.0);
        assert!(tensor.read_into(6, &mut dst).is_err());
    }
}
