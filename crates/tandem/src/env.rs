use std::env;
use std::sync::OnceLock;

use crate::backend::device::Timeout;

pub const DEFAULT_PRINT_MAX_ELEMENTS: usize = 4096;

static TANDEM_PRINT_MAX_ELEMENTS: OnceLock<usize> = OnceLock::new();
static TANDEM_TRANSFER_TIMEOUT_MS: OnceLock<Option<u64>> = OnceLock::new();
static TANDEM_TRACE_EXEC: OnceLock<bool> = OnceLock::new();

pub fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value.trim().parse().ok(),
        _ => None,
    }
}

/// Element cap applied when printing buffer views (`TANDEM_PRINT_MAX_ELEMENTS`).
pub fn print_max_elements() -> usize {
    *TANDEM_PRINT_MAX_ELEMENTS.get_or_init(|| {
        parse_var("TANDEM_PRINT_MAX_ELEMENTS").unwrap_or(DEFAULT_PRINT_MAX_ELEMENTS)
    })
}

/// Default transfer timeout (`TANDEM_TRANSFER_TIMEOUT_MS`); unset means infinite.
pub fn default_transfer_timeout() -> Timeout {
    match *TANDEM_TRANSFER_TIMEOUT_MS.get_or_init(|| parse_var("TANDEM_TRANSFER_TIMEOUT_MS")) {
        Some(millis) => Timeout::from_millis(millis),
        None => Timeout::Infinite,
    }
}

/// Per-instruction trace logging in device interpreters (`TANDEM_TRACE_EXEC`).
pub fn trace_exec_enabled() -> bool {
    *TANDEM_TRACE_EXEC.get_or_init(|| match env::var("TANDEM_TRACE_EXEC") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

/// Reads a non-negative integer from the environment without caching.
///
/// Backend crates use this for their own knobs so tests can vary them per process.
pub fn read_usize(name: &str) -> Option<usize> {
    parse_var(name)
}

pub fn read_u64(name: &str) -> Option<u64> {
    parse_var(name)
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parse_bool_accepts_common_truthy_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value} should parse as true");
        }
        for value in ["0", "false", "off", "", "2"] {
            assert!(!parse_bool(value), "{value} should parse as false");
        }
    }
}
