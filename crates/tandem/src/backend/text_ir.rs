use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::backend::elements;
use crate::backend::spec::{
    BroadcastToSpec, CastSpec, CompareSpec, ComparisonOp, DType, DotGeneralSpec,
    ElementwiseBinaryOp, ElementwiseUnaryOp, Function, FunctionBuilder, ModuleSpec, Operation,
    ReduceKind, ReduceSpec, Shape, TensorLiteral, TensorSpec, TransposeSpec, ValueId,
};

/// Name given to modules written as bare `func` definitions.
pub const DEFAULT_MODULE_NAME: &str = "module";

/// Errors raised while parsing the text module format.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TextIrError {
    #[error("{0}")]
    Message(String),
    #[error("in func @{function}: {message}")]
    InFunction { function: String, message: String },
}

impl TextIrError {
    fn new(msg: impl Into<String>) -> Self {
        TextIrError::Message(msg.into())
    }

    fn in_function(self, function: &str) -> Self {
        match self {
            TextIrError::Message(message) => TextIrError::InFunction {
                function: function.to_string(),
                message,
            },
            other => other,
        }
    }
}

/// Parses a module written in the compact MLIR-inspired text syntax.
///
/// # Example
/// ```
/// use tandem::backend::text_ir::parse_module;
///
/// let module = parse_module(r#"
/// module @module {
///   func @simple_mul(%a: tensor<f32, 4>, %b: tensor<f32, 4>) -> tensor<f32, 4> {
///     %r = mul %a, %b -> tensor<f32, 4>
///     return %r
///   }
/// }
/// "#).expect("valid module");
/// assert_eq!(module.name, "module");
/// assert_eq!(module.functions[0].body.len(), 1);
/// ```
pub fn parse_module(src: &str) -> Result<ModuleSpec, TextIrError> {
    let trimmed = src.trim();
    if trimmed.is_empty() {
        return Err(TextIrError::new("input is empty"));
    }
    if let Some(rest) = trimmed.strip_prefix("module") {
        let open = rest
            .find('{')
            .ok_or_else(|| TextIrError::new("missing `{` to start module body"))?;
        let close = find_matching(rest, open, '{', '}')
            .ok_or_else(|| TextIrError::new("missing `}` to end module body"))?;
        if !rest[close + 1..].trim().is_empty() {
            return Err(TextIrError::new("unexpected text after module body"));
        }
        let (name, requires) = parse_module_header(&rest[..open])?;
        let functions = parse_functions(&rest[open + 1..close])?;
        Ok(ModuleSpec::new(name)
            .with_requires(requires)
            .with_functions(functions))
    } else {
        let functions = parse_functions(trimmed)?;
        Ok(ModuleSpec::new(DEFAULT_MODULE_NAME).with_functions(functions))
    }
}

/// Parses a single function definition.
pub fn parse_function(src: &str) -> Result<Function, TextIrError> {
    let trimmed = src.trim();
    let header_end = trimmed
        .find('{')
        .ok_or_else(|| TextIrError::new("missing `{` to start function body"))?;
    let body_end = trimmed
        .rfind('}')
        .ok_or_else(|| TextIrError::new("missing `}` to end function body"))?;
    let (name, params, result_ty) = parse_function_header(&trimmed[..header_end])?;
    FunctionParser::default()
        .parse(&name, params, &result_ty, trimmed[header_end + 1..body_end].trim())
        .map_err(|err| err.in_function(&name))
}

fn parse_module_header(header: &str) -> Result<(String, Vec<String>), TextIrError> {
    let header = header.trim();
    let (name_part, requires) = match header.find("requires") {
        Some(pos) => {
            let attr = header[pos + "requires".len()..].trim();
            let inner = attr
                .strip_prefix('[')
                .and_then(|s| s.strip_suffix(']'))
                .ok_or_else(|| TextIrError::new("`requires` expects a bracketed driver list"))?;
            let drivers = split_top_level(inner, ',')
                .into_iter()
                .map(|raw| raw.trim().trim_matches('"').to_string())
                .filter(|driver| !driver.is_empty())
                .collect::<Vec<_>>();
            (header[..pos].trim(), drivers)
        }
        None => (header, Vec::new()),
    };
    let name = name_part.strip_prefix('@').unwrap_or(name_part).trim();
    if name.is_empty() {
        return Err(TextIrError::new("module name cannot be empty"));
    }
    if name.contains('.') {
        return Err(TextIrError::new(format!(
            "module name `{name}` cannot contain `.`"
        )));
    }
    Ok((name.to_string(), requires))
}

fn parse_functions(body: &str) -> Result<Vec<Function>, TextIrError> {
    let mut functions = Vec::new();
    let mut rest = body.trim();
    while !rest.is_empty() {
        if !(rest.starts_with("func") || rest.starts_with("function")) {
            let snippet: String = rest.chars().take(24).collect();
            return Err(TextIrError::new(format!(
                "expected `func`, found `{snippet}`"
            )));
        }
        let open = rest
            .find('{')
            .ok_or_else(|| TextIrError::new("missing `{` to start function body"))?;
        let close = find_matching(rest, open, '{', '}')
            .ok_or_else(|| TextIrError::new("missing `}` to end function body"))?;
        functions.push(parse_function(&rest[..=close])?);
        rest = rest[close + 1..].trim_start();
    }
    if functions.is_empty() {
        return Err(TextIrError::new("module must define at least one function"));
    }
    Ok(functions)
}

fn parse_function_header(header: &str) -> Result<(String, Vec<Parameter>, String), TextIrError> {
    let header = header.trim();
    let header = header
        .strip_prefix("function")
        .or_else(|| header.strip_prefix("func"))
        .ok_or_else(|| TextIrError::new("function header must start with `func`"))?
        .trim_start();
    let open_paren = header
        .find('(')
        .ok_or_else(|| TextIrError::new("missing `(` in function header"))?;
    let close_paren = find_matching(header, open_paren, '(', ')')
        .ok_or_else(|| TextIrError::new("missing `)` to close parameter list"))?;

    let name_section = header[..open_paren].trim();
    let name = name_section
        .strip_prefix('@')
        .unwrap_or(name_section)
        .trim();
    if name.is_empty() {
        return Err(TextIrError::new("function name cannot be empty"));
    }
    let params = parse_parameters(&header[open_paren + 1..close_paren])?;

    let result_ty = header[close_paren + 1..]
        .trim()
        .strip_prefix("->")
        .ok_or_else(|| TextIrError::new("missing `->` and return type in header"))?
        .trim()
        .to_string();

    Ok((name.to_string(), params, result_ty))
}

fn parse_parameters(params: &str) -> Result<Vec<Parameter>, TextIrError> {
    let params = params.trim();
    if params.is_empty() {
        return Ok(Vec::new());
    }
    split_top_level(params, ',')
        .into_iter()
        .map(|raw| {
            let (name, ty) = raw
                .trim()
                .split_once(':')
                .ok_or_else(|| TextIrError::new("parameter must be `name: type`"))?;
            let name = normalize_value_name(name.trim());
            if name.is_empty() {
                return Err(TextIrError::new("parameter name cannot be empty"));
            }
            Ok(Parameter {
                name,
                spec: parse_tensor_type(ty)?,
            })
        })
        .collect()
}

struct Parameter {
    name: String,
    spec: TensorSpec,
}

#[derive(Default)]
struct FunctionParser {
    builder: FunctionBuilder,
    values: HashMap<String, ValueId>,
}

impl FunctionParser {
    fn parse(
        mut self,
        name: &str,
        params: Vec<Parameter>,
        result_ty: &str,
        body: &str,
    ) -> Result<Function, TextIrError> {
        for Parameter { name, spec } in params {
            let id = self.builder.add_parameter(spec);
            if self.values.insert(name.clone(), id).is_some() {
                return Err(TextIrError::new(format!("duplicate parameter `%{name}`")));
            }
        }
        if body.is_empty() {
            return Err(TextIrError::new("function body cannot be empty"));
        }

        let mut return_values: Option<Vec<String>> = None;
        for line in body.lines() {
            let statement = line.trim();
            if statement.is_empty() || statement.starts_with("//") {
                continue;
            }
            if return_values.is_some() {
                return Err(TextIrError::new("statements after `return` are not allowed"));
            }
            if let Some(values) = statement.strip_prefix("return") {
                let values = values.trim().trim_end_matches(';');
                if values.is_empty() {
                    return Err(TextIrError::new(
                        "`return` must reference at least one value",
                    ));
                }
                return_values = Some(
                    split_top_level(values, ',')
                        .into_iter()
                        .map(normalize_value_name)
                        .collect(),
                );
                continue;
            }
            self.parse_statement(statement)?;
        }

        let return_values = return_values.ok_or_else(|| {
            TextIrError::new("function body must end with a `return` statement")
        })?;
        let result_ids = return_values
            .iter()
            .map(|value| {
                self.values
                    .get(value)
                    .copied()
                    .ok_or_else(|| TextIrError::new(format!("unknown return value `%{value}`")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let expected = parse_result_types(result_ty)?;
        let function = self
            .builder
            .finish(name, result_ids)
            .map_err(|id| TextIrError::new(format!("result value {id:?} is undefined")))?;
        if function.results.len() != expected.len() {
            return Err(TextIrError::new(format!(
                "declared {} result(s) but `return` lists {}",
                expected.len(),
                function.results.len()
            )));
        }
        if function.results != expected {
            return Err(TextIrError::new(
                "declared result type does not match returned value type",
            ));
        }
        Ok(function)
    }

    fn parse_statement(&mut self, statement: &str) -> Result<(), TextIrError> {
        let (result_name_raw, rest) = statement
            .split_once('=')
            .ok_or_else(|| TextIrError::new("statements must be of the form `%result = ...`"))?;
        let result_name = normalize_value_name(result_name_raw);
        if result_name.is_empty() {
            return Err(TextIrError::new("result identifier cannot be empty"));
        }
        if self.values.contains_key(&result_name) {
            return Err(TextIrError::new(format!(
                "value `%{result_name}` is defined twice"
            )));
        }

        let (op_name, remainder) = parse_op_name(rest)?;
        let (operands_section, ty_section) = remainder
            .rsplit_once("->")
            .ok_or_else(|| TextIrError::new("operations must specify result type with `->`"))?;
        let (operand_tokens, attrs) = parse_operands_and_attributes(operands_section)?;
        let output = parse_tensor_type(ty_section)?;
        let operands = operand_tokens
            .iter()
            .map(|token| {
                let name = normalize_value_name(token);
                self.values
                    .get(&name)
                    .copied()
                    .ok_or_else(|| TextIrError::new(format!("unknown operand `%{name}`")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let operation = build_operation(&op_name, operands.len(), &output, &attrs)?;

        let id = self.builder.emit(operation, operands, output);
        self.values.insert(result_name, id);
        Ok(())
    }
}

fn normalize_value_name(name: &str) -> String {
    name.trim().trim_start_matches('%').to_string()
}

fn parse_result_types(src: &str) -> Result<Vec<TensorSpec>, TextIrError> {
    let trimmed = src.trim();
    if let Some(body) = trimmed.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        let inner = body.trim();
        if inner.is_empty() {
            return Err(TextIrError::new(
                "tuple types must contain at least one element",
            ));
        }
        return split_top_level(inner, ',')
            .into_iter()
            .map(parse_tensor_type)
            .collect();
    }
    Ok(vec![parse_tensor_type(trimmed)?])
}

fn parse_tensor_type(src: &str) -> Result<TensorSpec, TextIrError> {
    let trimmed = src.trim();
    let body = trimmed
        .strip_prefix("tensor<")
        .and_then(|s| s.strip_suffix('>'))
        .ok_or_else(|| {
            TextIrError::new(format!(
                "unsupported type `{trimmed}`; only `tensor<...>` is implemented"
            ))
        })?;
    let mut parts = body.split(',');
    let dtype_str = parts.next().unwrap_or("").trim();
    let dtype = DType::parse(dtype_str)
        .ok_or_else(|| TextIrError::new(format!("unsupported dtype `{dtype_str}`")))?;
    let dims_str = parts.next().unwrap_or("").trim();
    let dims = if dims_str.is_empty() {
        Vec::new()
    } else {
        parse_dimensions(dims_str)?
    };
    if parts.next().is_some() {
        return Err(TextIrError::new(
            "tensor type accepts only `tensor<dtype, dims>` form",
        ));
    }
    Ok(TensorSpec::new(dtype, Shape::new(dims)))
}

fn parse_dimensions(src: &str) -> Result<Vec<usize>, TextIrError> {
    src.split('x')
        .map(|dim| {
            let dim = dim.trim();
            if dim.is_empty() {
                return Err(TextIrError::new("dimension sizes cannot be empty"));
            }
            dim.parse::<usize>()
                .map_err(|_| TextIrError::new(format!("invalid dimension `{dim}`")))
        })
        .collect()
}

fn split_top_level(input: &str, delimiter: char) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, ch) in input.char_indices() {
        match ch {
            '<' | '(' | '[' => depth += 1,
            '>' | ')' | ']' => depth = depth.saturating_sub(1),
            c if c == delimiter && depth == 0 => {
                if start != idx {
                    pieces.push(input[start..idx].trim());
                }
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    if start < input.len() && !input[start..].trim().is_empty() {
        pieces.push(input[start..].trim());
    }
    pieces
}

fn find_matching(src: &str, start: usize, open: char, close: char) -> Option<usize> {
    let mut depth = 0isize;
    for (idx, ch) in src[start..].char_indices() {
        if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                return Some(start + idx);
            }
        }
    }
    None
}

fn parse_op_name(src: &str) -> Result<(String, &str), TextIrError> {
    let trimmed = src.trim_start();
    let end = trimmed
        .find(|ch: char| ch.is_whitespace() || ch == '%')
        .unwrap_or(trimmed.len());
    let name = trimmed[..end].trim();
    if name.is_empty() {
        return Err(TextIrError::new("operation name is missing"));
    }
    Ok((name.to_string(), trimmed[end..].trim_start()))
}

#[derive(Debug, Clone)]
struct AttributeExpr {
    name: String,
    value: String,
}

fn parse_operands_and_attributes(
    section: &str,
) -> Result<(Vec<String>, Vec<AttributeExpr>), TextIrError> {
    let mut operands = Vec::new();
    let mut attrs = Vec::new();
    let chars = section.trim();
    let bytes = chars.as_bytes();
    let len = bytes.len();
    let mut idx = 0usize;

    while idx < len {
        match bytes[idx] {
            b' ' | b'\t' | b',' => idx += 1,
            b'%' => {
                let start = idx;
                idx += 1;
                while idx < len && !bytes[idx].is_ascii_whitespace() && bytes[idx] != b',' {
                    idx += 1;
                }
                operands.push(chars[start..idx].to_string());
            }
            _ => {
                let attr_start = idx;
                while idx < len && (bytes[idx].is_ascii_alphanumeric() || bytes[idx] == b'_') {
                    idx += 1;
                }
                if idx >= len || bytes[idx] != b'[' {
                    return Err(TextIrError::new(format!(
                        "unexpected token starting at `{}`",
                        &chars[attr_start..]
                    )));
                }
                let end = find_matching(chars, idx, '[', ']')
                    .ok_or_else(|| TextIrError::new("unmatched `[` in attribute"))?;
                attrs.push(AttributeExpr {
                    name: chars[attr_start..idx].to_string(),
                    value: chars[idx + 1..end].trim().to_string(),
                });
                idx = end + 1;
            }
        }
    }

    Ok((operands, attrs))
}

fn expect_arity(name: &str, expected: usize, actual: usize) -> Result<(), TextIrError> {
    if expected == actual {
        Ok(())
    } else {
        Err(TextIrError::new(format!(
            "{name} expects {expected} operand(s), found {actual}"
        )))
    }
}

fn build_operation(
    name: &str,
    operand_count: usize,
    output: &TensorSpec,
    attrs: &[AttributeExpr],
) -> Result<Operation, TextIrError> {
    let attr_map: HashMap<&str, &str> = attrs
        .iter()
        .map(|attr| (attr.name.as_str(), attr.value.as_str()))
        .collect();
    let binary = |op: ElementwiseBinaryOp| -> Result<Operation, TextIrError> {
        expect_arity(name, 2, operand_count)?;
        Ok(Operation::ElementwiseBinary(op))
    };
    let unary = |op: ElementwiseUnaryOp| -> Result<Operation, TextIrError> {
        expect_arity(name, 1, operand_count)?;
        Ok(Operation::ElementwiseUnary(op))
    };
    match name {
        "add" => binary(ElementwiseBinaryOp::Add),
        "sub" => binary(ElementwiseBinaryOp::Sub),
        "mul" => binary(ElementwiseBinaryOp::Mul),
        "div" => binary(ElementwiseBinaryOp::Div),
        "max" | "maximum" => binary(ElementwiseBinaryOp::Maximum),
        "min" | "minimum" => binary(ElementwiseBinaryOp::Minimum),
        "neg" => unary(ElementwiseUnaryOp::Neg),
        "abs" => unary(ElementwiseUnaryOp::Abs),
        "exp" => unary(ElementwiseUnaryOp::Exp),
        "log" => unary(ElementwiseUnaryOp::Log),
        "tanh" => unary(ElementwiseUnaryOp::Tanh),
        "erf" => unary(ElementwiseUnaryOp::Erf),
        "rsqrt" => unary(ElementwiseUnaryOp::Rsqrt),
        "reciprocal" => unary(ElementwiseUnaryOp::Reciprocal),
        "constant" => {
            expect_arity(name, 0, operand_count)?;
            let raw = attr_map
                .get("value")
                .ok_or_else(|| TextIrError::new("constant requires `value[...]` attribute"))?;
            let tokens = split_top_level(raw, ',');
            let expected = output.element_count().unwrap_or(0);
            let tokens = if tokens.len() == 1 && expected > 1 {
                vec![tokens[0]; expected]
            } else {
                tokens
            };
            if tokens.len() != expected {
                return Err(TextIrError::new(format!(
                    "constant declares {expected} element(s) but lists {}",
                    tokens.len()
                )));
            }
            let bytes = elements::encode_values(output.dtype, &tokens).map_err(TextIrError::new)?;
            Ok(Operation::Constant(TensorLiteral::new(
                output.clone(),
                Arc::from(bytes),
            )))
        }
        "cast" => {
            expect_arity(name, 1, operand_count)?;
            Ok(Operation::Cast(CastSpec {
                dtype: output.dtype,
            }))
        }
        "reshape" => {
            expect_arity(name, 1, operand_count)?;
            Ok(Operation::Reshape)
        }
        "select" => {
            expect_arity(name, 3, operand_count)?;
            Ok(Operation::Select)
        }
        "compare" => {
            expect_arity(name, 2, operand_count)?;
            let raw = attr_map
                .get("cmp")
                .ok_or_else(|| TextIrError::new("compare requires `cmp[...]` attribute"))?;
            let op = match raw.trim() {
                "lt" => ComparisonOp::Less,
                "le" => ComparisonOp::LessEqual,
                "eq" => ComparisonOp::Equal,
                "ge" => ComparisonOp::GreaterEqual,
                "gt" => ComparisonOp::Greater,
                "ne" => ComparisonOp::NotEqual,
                other => {
                    return Err(TextIrError::new(format!(
                        "unknown comparison `{other}`"
                    )))
                }
            };
            Ok(Operation::Compare(CompareSpec { op }))
        }
        "transpose" => {
            expect_arity(name, 1, operand_count)?;
            let raw = attr_map
                .get("perm")
                .ok_or_else(|| TextIrError::new("transpose requires `perm[...]` attribute"))?;
            Ok(Operation::Transpose(TransposeSpec {
                perm: parse_usize_list(raw)?,
            }))
        }
        "broadcast_to" => {
            expect_arity(name, 1, operand_count)?;
            let raw = attr_map
                .get("shape")
                .ok_or_else(|| TextIrError::new("broadcast_to requires `shape[...]` attribute"))?;
            Ok(Operation::BroadcastTo(BroadcastToSpec {
                result_shape: Shape::new(parse_usize_list(raw)?),
            }))
        }
        "reduce_sum" | "reduce_max" | "reduce_min" => {
            expect_arity(name, 1, operand_count)?;
            let raw = attr_map
                .get("axes")
                .ok_or_else(|| TextIrError::new("reduce operations require `axes[...]` attribute"))?;
            let keepdims = attr_map
                .get("keepdims")
                .map(|v| parse_bool(v))
                .transpose()?
                .unwrap_or(false);
            let kind = match name {
                "reduce_max" => ReduceKind::Max,
                "reduce_min" => ReduceKind::Min,
                _ => ReduceKind::Sum,
            };
            Ok(Operation::Reduce(ReduceSpec {
                kind,
                axes: parse_usize_list(raw)?,
                keepdims,
            }))
        }
        "dot_general" => {
            expect_arity(name, 2, operand_count)?;
            let list = |key: &str| -> Result<Option<Vec<usize>>, TextIrError> {
                attr_map
                    .get(key)
                    .map(|value| parse_usize_list(value))
                    .transpose()
            };
            let contract_lhs = list("contract_lhs")?.ok_or_else(|| {
                TextIrError::new("dot_general requires `contract_lhs[...]` attribute")
            })?;
            let contract_rhs = list("contract_rhs")?.ok_or_else(|| {
                TextIrError::new("dot_general requires `contract_rhs[...]` attribute")
            })?;
            let batch = list("batch")?;
            Ok(Operation::DotGeneral(DotGeneralSpec {
                batch_lhs: list("batch_lhs")?.or(batch.clone()).unwrap_or_default(),
                batch_rhs: list("batch_rhs")?.or(batch).unwrap_or_default(),
                contract_lhs,
                contract_rhs,
            }))
        }
        other => Err(TextIrError::new(format!("unsupported operation `{other}`"))),
    }
}

fn parse_usize_list(value: &str) -> Result<Vec<usize>, TextIrError> {
    split_top_level(value, ',')
        .into_iter()
        .map(|tok| {
            tok.parse::<usize>()
                .map_err(|_| TextIrError::new(format!("invalid integer `{tok}`")))
        })
        .collect()
}

fn parse_bool(value: &str) -> Result<bool, TextIrError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(TextIrError::new(format!(
            "invalid boolean literal `{other}`"
        ))),
    }
}

/// Builds a `ModuleSpec` from the text syntax, panicking on malformed input.
#[macro_export]
macro_rules! tandem_module {
    ($src:expr) => {{
        $crate::backend::text_ir::parse_module($src).expect("failed to parse tandem text module")
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_FUNCS: &str = r#"
module @math requires["local-task", "accel"] {
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

    #[test]
    fn parses_module_header_and_functions() {
        let module = parse_module(TWO_FUNCS).expect("module parses");
        assert_eq!(module.name, "math");
        assert_eq!(module.requires, vec!["local-task", "accel"]);
        assert_eq!(module.functions.len(), 2);
        let split = module.function("split").expect("split defined");
        assert_eq!(split.results.len(), 2);
        assert_eq!(split.results[1].shape.dims(), &[2, 1]);
    }

    #[test]
    fn bare_function_lands_in_default_module() {
        let module = parse_module(
            "func @id(%x: tensor<si32, 3>) -> tensor<si32, 3> {\n  %y = reshape %x -> tensor<si32, 3>\n  return %y\n}",
        )
        .expect("bare function parses");
        assert_eq!(module.name, DEFAULT_MODULE_NAME);
        assert!(module.requires.is_empty());
    }

    #[test]
    fn rendered_text_parses_back_to_the_same_module() {
        let module = parse_module(TWO_FUNCS).expect("module parses");
        let reparsed = parse_module(&module.to_text()).expect("rendered text parses");
        assert_eq!(reparsed, module);
    }

    #[test]
    fn constant_splats_single_value() {
        let module = parse_module(
            "func @k() -> tensor<f32, 3> {\n  %c = constant value[2.5] -> tensor<f32, 3>\n  return %c\n}",
        )
        .expect("constant parses");
        let Operation::Constant(literal) = &module.functions[0].body[0].op else {
            panic!("expected constant");
        };
        assert_eq!(literal.byte_len(), 12);
    }

    #[test]
    fn unknown_operand_reports_function_context() {
        let err = parse_module(
            "func @bad(%x: tensor<f32, 1>) -> tensor<f32, 1> {\n  %y = add %x, %z -> tensor<f32, 1>\n  return %y\n}",
        )
        .expect_err("undefined operand must fail");
        assert_eq!(
            err,
            TextIrError::InFunction {
                function: "bad".into(),
                message: "unknown operand `%z`".into(),
            }
        );
    }

    #[test]
    fn mismatched_result_type_is_rejected() {
        let err = parse_module(
            "func @bad(%x: tensor<f32, 2>) -> tensor<f32, 4> {\n  %y = neg %x -> tensor<f32, 2>\n  return %y\n}",
        )
        .expect_err("result type mismatch must fail");
        assert!(err.to_string().contains("does not match"), "{err}");
    }
}
