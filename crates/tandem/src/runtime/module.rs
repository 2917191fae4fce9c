use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::backend::spec::{
    Function, ModuleSpec, TensorSpec, ValueId, BINARY_MAGIC, FORMAT_VERSION,
};
use crate::backend::text_ir::parse_module;
use crate::error::ModuleLoadError;
use crate::runtime::device::DeviceHandle;

/// A module accepted by a session.
pub struct LoadedModule {
    spec: Arc<ModuleSpec>,
}

impl LoadedModule {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &Arc<ModuleSpec> {
        &self.spec
    }

    pub fn functions(&self) -> &[Function] {
        &self.spec.functions
    }

    pub(crate) fn function_index(&self, name: &str) -> Option<usize> {
        self.spec.functions.iter().position(|f| f.name == name)
    }
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.spec.functions.iter().map(|f| f.name.as_str()).collect();
        f.debug_struct("LoadedModule")
            .field("name", &self.spec.name)
            .field("functions", &names)
            .finish()
    }
}

/// Decodes a module image: `TNDM` binary, JSON, or the text format.
pub fn decode_module_image(bytes: &[u8]) -> Result<ModuleSpec, ModuleLoadError> {
    if bytes.starts_with(BINARY_MAGIC) {
        return Ok(ModuleSpec::from_binary_image(bytes)?);
    }
    let text = std::str::from_utf8(bytes).map_err(|_| ModuleLoadError::UnrecognizedFormat)?;
    let trimmed = text.trim_start();
    if trimmed.is_empty() {
        return Err(ModuleLoadError::UnrecognizedFormat);
    }
    if trimmed.starts_with('{') {
        return Ok(ModuleSpec::from_json_str(trimmed)?);
    }
    Ok(parse_module(text)?)
}

/// Checks a decoded module against the device and the modules already loaded.
///
/// Nothing is mutated; the caller appends only when this succeeds.
pub(crate) fn validate_module(
    module: ModuleSpec,
    device: &DeviceHandle,
    loaded_names: &[&str],
) -> Result<LoadedModule, ModuleLoadError> {
    if module.format_version != FORMAT_VERSION {
        return Err(ModuleLoadError::Invalid(format!(
            "module format version '{}' does not match expected '{FORMAT_VERSION}'",
            module.format_version
        )));
    }
    if module.name.is_empty() || module.name.contains('.') {
        return Err(ModuleLoadError::Invalid(format!(
            "invalid module name '{}'",
            module.name
        )));
    }
    if loaded_names.contains(&module.name.as_str()) {
        return Err(ModuleLoadError::Invalid(format!(
            "a module named '{}' is already loaded",
            module.name
        )));
    }
    if module.functions.is_empty() {
        return Err(ModuleLoadError::Invalid(format!(
            "module '{}' has no functions",
            module.name
        )));
    }
    if !module.requires.is_empty() && !module.requires.iter().any(|d| d == device.driver()) {
        return Err(ModuleLoadError::UnsatisfiedRequirement {
            required: module.requires.clone(),
            device_driver: device.driver().to_string(),
        });
    }

    let mut names = HashSet::new();
    for function in &module.functions {
        if function.name.is_empty() {
            return Err(ModuleLoadError::Invalid(
                "function with an empty name".to_string(),
            ));
        }
        if !names.insert(function.name.as_str()) {
            return Err(ModuleLoadError::Invalid(format!(
                "duplicate function @{}",
                function.name
            )));
        }
        check_ssa(function).map_err(|detail| {
            ModuleLoadError::Invalid(format!("function @{}: {detail}", function.name))
        })?;
        device
            .backend()
            .validate_function(function)
            .map_err(|source| ModuleLoadError::Unsupported {
                function: function.name.clone(),
                source,
            })?;
    }

    Ok(LoadedModule {
        spec: Arc::new(module),
    })
}

/// Every operand is defined before use, ids are unique, and the signature matches the body.
fn check_ssa(function: &Function) -> Result<(), String> {
    if function.parameters.len() != function.parameter_ids.len() {
        return Err(format!(
            "{} parameter types for {} parameter ids",
            function.parameters.len(),
            function.parameter_ids.len()
        ));
    }
    if function.results.len() != function.result_ids.len() {
        return Err(format!(
            "{} result types for {} result ids",
            function.results.len(),
            function.result_ids.len()
        ));
    }

    let mut defined: HashMap<ValueId, &TensorSpec> = HashMap::new();
    for (id, spec) in function.parameter_ids.iter().zip(&function.parameters) {
        if defined.insert(*id, spec).is_some() {
            return Err(format!("value %v{} defined twice", id.0));
        }
    }
    for instruction in &function.body {
        for operand in &instruction.operands {
            if !defined.contains_key(operand) {
                return Err(format!(
                    "%v{} uses %v{} before it is defined",
                    instruction.id.0, operand.0
                ));
            }
        }
        if instruction.output.byte_len().is_none() {
            return Err(format!("%v{} has an overflowing shape", instruction.id.0));
        }
        if defined.insert(instruction.id, &instruction.output).is_some() {
            return Err(format!("value %v{} defined twice", instruction.id.0));
        }
    }
    for (id, declared) in function.result_ids.iter().zip(&function.results) {
        match defined.get(id) {
            None => return Err(format!("result %v{} is never defined", id.0)),
            Some(actual) if *actual != declared => {
                return Err(format!(
                    "result %v{} has type {actual} but the signature declares {declared}",
                    id.0
                ))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{
        DType, ElementwiseBinaryOp, FunctionBuilder, Instruction, Operation,
    };

    fn simple_mul() -> ModuleSpec {
        let spec = TensorSpec::from_dims(DType::F32, &[4]);
        let mut builder = FunctionBuilder::new();
        let a = builder.add_parameter(spec.clone());
        let b = builder.add_parameter(spec.clone());
        let r = builder.emit(
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Mul),
            vec![a, b],
            spec,
        );
        let function = builder.finish("simple_mul", vec![r]).expect("finish");
        ModuleSpec::new("module").with_functions(vec![function])
    }

    #[test]
    fn detects_each_image_format() {
        let module = simple_mul();
        let binary = module.to_binary_image().expect("binary");
        let json = module.to_json_string().expect("json");
        let text = module.to_text();
        for image in [binary, json.into_bytes(), text.into_bytes()] {
            let decoded = decode_module_image(&image).expect("decode");
            assert_eq!(decoded, module);
        }
    }

    #[test]
    fn rejects_garbage_images() {
        assert!(matches!(
            decode_module_image(&[0xff, 0xfe, 0x00]),
            Err(ModuleLoadError::UnrecognizedFormat)
        ));
        assert!(matches!(
            decode_module_image(b"   "),
            Err(ModuleLoadError::UnrecognizedFormat)
        ));
        assert!(matches!(
            decode_module_image(b"func @broken("),
            Err(ModuleLoadError::Text(_))
        ));
    }

    #[test]
    fn ssa_check_rejects_use_before_definition() {
        let mut module = simple_mul();
        let function = &mut module.functions[0];
        let spec = TensorSpec::from_dims(DType::F32, &[4]);
        function.body.insert(
            0,
            Instruction {
                id: ValueId(10),
                op: Operation::ElementwiseBinary(ElementwiseBinaryOp::Add),
                operands: vec![ValueId(2), ValueId(0)],
                output: spec,
            },
        );
        let err = check_ssa(&module.functions[0]).expect_err("use before def");
        assert!(err.contains("before it is defined"), "{err}");
    }

    #[test]
    fn ssa_check_rejects_mistyped_result() {
        let mut module = simple_mul();
        module.functions[0].results[0] = TensorSpec::from_dims(DType::F32, &[2, 2]);
        let err = check_ssa(&module.functions[0]).expect_err("mistyped result");
        assert!(err.contains("signature declares"), "{err}");
    }
}
