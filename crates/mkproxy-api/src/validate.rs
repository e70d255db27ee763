//! Request parameter validation.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::ProxyError;

/// Maximum length of a DNS-1123 subdomain.
pub const MAX_NAME_LENGTH: usize = 253;

static SUBDOMAIN_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").ok()
});

/// Check that `value` is a valid object name. `what` names the parameter
/// in the error message.
pub fn validate_name(what: &str, value: &str) -> Result<(), ProxyError> {
    if value.is_empty() {
        return Err(ProxyError::BadRequest(format!("{what} must not be empty")));
    }
    if value.len() > MAX_NAME_LENGTH {
        return Err(ProxyError::BadRequest(format!(
            "{what} exceeds {MAX_NAME_LENGTH} characters"
        )));
    }
    let valid = SUBDOMAIN_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(value));
    if !valid {
        return Err(ProxyError::BadRequest(format!(
            "invalid {what} {value:?}: must be a lowercase RFC 1123 subdomain"
        )));
    }
    Ok(())
}

/// A required query parameter, validated as a name.
pub fn required_name<'a>(what: &str, value: Option<&'a str>) -> Result<&'a str, ProxyError> {
    let value = value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ProxyError::BadRequest(format!("query parameter {what:?} is required")))?;
    validate_name(what, value)?;
    Ok(value)
}

/// An optional query parameter, validated as a name when present.
pub fn optional_name<'a>(
    what: &str,
    value: Option<&'a str>,
) -> Result<Option<&'a str>, ProxyError> {
    match value.filter(|v| !v.is_empty()) {
        Some(v) => validate_name(what, v).map(|()| Some(v)),
        None => Ok(None),
    }
}

/// Parse an optional non-negative integer query parameter.
pub fn non_negative(what: &str, value: Option<&str>) -> Result<Option<i64>, ProxyError> {
    let Some(raw) = value.filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    match raw.parse::<i64>() {
        Ok(n) if n >= 0 => Ok(Some(n)),
        _ => Err(ProxyError::BadRequest(format!(
            "{what} must be a non-negative integer, got {raw:?}"
        ))),
    }
}
