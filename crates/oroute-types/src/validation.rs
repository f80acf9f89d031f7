//! Network-boundary sanitisation of addresses, method names and params.
//!
//! These checks run on every inbound or caller-supplied value before any
//! resolution or streaming happens. They are stricter than the [`Address`]
//! type's own invariant, which only enforces the scheme prefix.
//!
//! [`Address`]: crate::Address

use crate::address::SCHEME;
use crate::error::{OrouteError, OrouteResult};
use serde_json::{Map, Value};

/// Keys and method names that must never reach a handler.
const FORBIDDEN_NAMES: &[&str] = &["__proto__", "constructor", "prototype"];

/// Percent-encoded sequences rejected in addresses (compared lowercase).
const FORBIDDEN_ENCODINGS: &[&str] = &["%2e%2e", "%2e.", ".%2e", "%5c", "%7f"];

fn is_control(c: char) -> bool {
    matches!(c, '\u{00}'..='\u{1F}' | '\u{7F}')
}

/// `%00`..`%1f` in any case.
fn has_encoded_control(lower: &str) -> bool {
    let bytes = lower.as_bytes();
    bytes.windows(3).any(|w| {
        w[0] == b'%' && (w[1] == b'0' || w[1] == b'1') && w[2].is_ascii_hexdigit()
    })
}

/// Validate an address received from the network or a caller.
///
/// Rejects empty values, values without the `o://` prefix, `..` traversal
/// segments, backslashes, control characters and their percent-encoded
/// equivalents.
pub fn validate_address(value: &str) -> OrouteResult<()> {
    if value.is_empty() {
        return Err(OrouteError::invalid_address(value, "empty address"));
    }
    if !value.starts_with(SCHEME) {
        return Err(OrouteError::invalid_address(
            value,
            format!("must start with '{SCHEME}'"),
        ));
    }
    if value.chars().any(is_control) {
        return Err(OrouteError::invalid_address(
            value.escape_debug().to_string(),
            "contains control characters",
        ));
    }
    if value.contains('\\') {
        return Err(OrouteError::invalid_address(value, "contains backslash"));
    }
    if value.contains("..") {
        return Err(OrouteError::invalid_address(value, "contains path traversal"));
    }
    let lower = value.to_ascii_lowercase();
    if FORBIDDEN_ENCODINGS.iter().any(|enc| lower.contains(enc)) || has_encoded_control(&lower) {
        return Err(OrouteError::invalid_address(
            value,
            "contains encoded traversal or control sequence",
        ));
    }
    Ok(())
}

/// Validate a method name.
pub fn validate_method(method: &str) -> OrouteResult<()> {
    if method.is_empty() {
        return Err(OrouteError::invalid_method(method, "empty method"));
    }
    if method.chars().any(is_control) {
        return Err(OrouteError::invalid_method(
            method.escape_debug().to_string(),
            "contains control characters",
        ));
    }
    if method.starts_with('_') {
        return Err(OrouteError::invalid_method(method, "private methods are not callable"));
    }
    if is_forbidden_name(method) {
        return Err(OrouteError::invalid_method(method, "reserved name"));
    }
    Ok(())
}

fn is_forbidden_name(name: &str) -> bool {
    FORBIDDEN_NAMES.iter().any(|f| name.eq_ignore_ascii_case(f))
}

/// Recursively strip `__proto__` / `constructor` / `prototype` keys
/// (case-insensitive) from objects at every depth, including objects inside
/// arrays. Everything else is left untouched.
pub fn sanitize_params(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(sanitize_map(map)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_params).collect()),
        other => other,
    }
}

/// [`sanitize_params`] for a params map.
pub fn sanitize_map(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .filter(|(k, _)| !is_forbidden_name(k))
        .map(|(k, v)| (k, sanitize_params(v)))
        .collect()
}
