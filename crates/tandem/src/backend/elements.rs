//! Host-side encoding of individual elements in the dense little-endian wire layout.

use half::f16;

use crate::backend::spec::{DType, TensorLiteral};

/// Renders one element stored at the start of `bytes`.
///
/// `bytes` must hold at least `dtype.size_in_bytes()` bytes.
pub fn format_element(dtype: DType, bytes: &[u8]) -> String {
    match dtype {
        DType::I1 => (bytes[0] != 0).to_string(),
        DType::Si8 => (bytes[0] as i8).to_string(),
        DType::Ui8 => bytes[0].to_string(),
        DType::Si16 => i16::from_le_bytes([bytes[0], bytes[1]]).to_string(),
        DType::Ui16 => u16::from_le_bytes([bytes[0], bytes[1]]).to_string(),
        DType::Si32 => i32::from_le_bytes(le4(bytes)).to_string(),
        DType::Ui32 => u32::from_le_bytes(le4(bytes)).to_string(),
        DType::Si64 => i64::from_le_bytes(le8(bytes)).to_string(),
        DType::Ui64 => u64::from_le_bytes(le8(bytes)).to_string(),
        DType::F16 => f16::from_le_bytes([bytes[0], bytes[1]]).to_string(),
        DType::F32 => f32::from_le_bytes(le4(bytes)).to_string(),
        DType::F64 => f64::from_le_bytes(le8(bytes)).to_string(),
    }
}

/// Renders up to `max_elements` elements separated by `separator`.
///
/// Returns the rendered text and whether trailing elements were elided.
pub fn format_elements(
    dtype: DType,
    bytes: &[u8],
    max_elements: usize,
    separator: &str,
) -> (String, bool) {
    let width = dtype.size_in_bytes();
    let total = bytes.len() / width;
    let shown = total.min(max_elements);
    let rendered = bytes
        .chunks_exact(width)
        .take(shown)
        .map(|chunk| format_element(dtype, chunk))
        .collect::<Vec<_>>()
        .join(separator);
    (rendered, shown < total)
}

pub fn format_literal_values(literal: &TensorLiteral) -> String {
    format_elements(literal.spec.dtype, &literal.bytes, usize::MAX, ", ").0
}

/// Encodes textual values into the wire layout of `dtype`.
pub fn encode_values(dtype: DType, values: &[&str]) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(values.len() * dtype.size_in_bytes());
    for raw in values {
        let token = raw.trim();
        let invalid = || format!("invalid {dtype} literal `{token}`");
        macro_rules! push_parsed {
            ($ty:ty) => {
                out.extend_from_slice(&token.parse::<$ty>().map_err(|_| invalid())?.to_le_bytes())
            };
        }
        match dtype {
            DType::I1 => match token {
                "true" | "1" => out.push(1),
                "false" | "0" => out.push(0),
                _ => return Err(invalid()),
            },
            DType::Si8 => push_parsed!(i8),
            DType::Ui8 => push_parsed!(u8),
            DType::Si16 => push_parsed!(i16),
            DType::Ui16 => push_parsed!(u16),
            DType::Si32 => push_parsed!(i32),
            DType::Ui32 => push_parsed!(u32),
            DType::Si64 => push_parsed!(i64),
            DType::Ui64 => push_parsed!(u64),
            DType::F16 => {
                let value = token.parse::<f32>().map_err(|_| invalid())?;
                out.extend_from_slice(&f16::from_f32(value).to_le_bytes());
            }
            DType::F32 => push_parsed!(f32),
            DType::F64 => push_parsed!(f64),
        }
    }
    Ok(out)
}

pub fn f32_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decodes little-endian f32 values; trailing bytes that do not form a whole element are ignored.
pub fn bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(le4(chunk)))
        .collect()
}

pub fn i32_to_bytes(values: &[i32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub fn bytes_to_i32(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| i32::from_le_bytes(le4(chunk)))
        .collect()
}

fn le4(bytes: &[u8]) -> [u8; 4] {
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

fn le8(bytes: &[u8]) -> [u8; 8] {
    [
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_floats_without_trailing_zeros() {
        let bytes = f32_to_bytes(&[1.0, 1.1, 13000.0]);
        let (text, elided) = format_elements(DType::F32, &bytes, 8, " ");
        assert_eq!(text, "1 1.1 13000");
        assert!(!elided);
    }

    #[test]
    fn elides_past_max_elements() {
        let bytes = i32_to_bytes(&[1, 2, 3, 4, 5]);
        let (text, elided) = format_elements(DType::Si32, &bytes, 2, " ");
        assert_eq!(text, "1 2");
        assert!(elided);
    }

    #[test]
    fn encodes_half_and_bool_values() {
        let encoded = encode_values(DType::F16, &["1.5", "-2"]).expect("f16 values");
        assert_eq!(encoded.len(), 4);
        assert_eq!(format_element(DType::F16, &encoded[2..]), "-2");

        let flags = encode_values(DType::I1, &["true", "0"]).expect("bool values");
        assert_eq!(flags, vec![1, 0]);
        assert!(encode_values(DType::I1, &["maybe"]).is_err());
    }
}
