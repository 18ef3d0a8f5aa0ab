use crate::constants::limits::{MAX_PORT, MIN_PORT};
use crate::errors::ProxyError;
use serde_json::{Map, Value};

#[derive(Clone, Default)]
pub struct Validation;

impl Validation {
    pub fn new() -> Self {
        Self
    }

    pub fn ensure_object<'a>(&self, value: &'a Value) -> Result<&'a Map<String, Value>, ProxyError> {
        value
            .as_object()
            .ok_or_else(|| ProxyError::invalid_request("Request body must be a JSON object"))
    }

    pub fn ensure_string(
        &self,
        value: Option<&Value>,
        label: &str,
        trim: bool,
    ) -> Result<String, ProxyError> {
        let text = value.and_then(Value::as_str).ok_or_else(|| {
            ProxyError::invalid_request(format!("{} must be a non-empty string", label))
        })?;
        let normalized = text.trim();
        if normalized.is_empty() {
            return Err(ProxyError::invalid_request(format!(
                "{} must be a non-empty string",
                label
            )));
        }
        if text.contains('\0') {
            return Err(ProxyError::invalid_request(format!(
                "{} must not contain null bytes",
                label
            )));
        }
        Ok(if trim {
            normalized.to_string()
        } else {
            text.to_string()
        })
    }

    pub fn ensure_optional_string(
        &self,
        value: Option<&Value>,
        label: &str,
        trim: bool,
    ) -> Result<Option<String>, ProxyError> {
        match value {
            None => Ok(None),
            Some(val) if val.is_null() => Ok(None),
            Some(val) => self.ensure_string(Some(val), label, trim).map(Some),
        }
    }

    /// Secrets are taken verbatim; an empty string still counts as supplied.
    pub fn ensure_optional_secret(
        &self,
        value: Option<&Value>,
        label: &str,
    ) -> Result<Option<String>, ProxyError> {
        let Some(value) = value.filter(|v| !v.is_null()) else {
            return Ok(None);
        };
        let text = value
            .as_str()
            .ok_or_else(|| ProxyError::invalid_request(format!("{} must be a string", label)))?;
        if text.contains('\0') {
            return Err(ProxyError::invalid_request(format!(
                "{} must not contain null bytes",
                label
            )));
        }
        Ok(Some(text.to_string()))
    }

    /// Accepts a port given as a JSON number or a numeric string.
    pub fn ensure_port(&self, value: Option<&Value>, fallback: u16) -> Result<u16, ProxyError> {
        let Some(value) = value.filter(|v| !v.is_null()) else {
            return Ok(fallback);
        };
        let numeric = value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
            .filter(|n| *n >= MIN_PORT as i64 && *n <= MAX_PORT as i64)
            .ok_or_else(|| {
                ProxyError::invalid_request(format!(
                    "ssh_port must be an integer between {} and {}",
                    MIN_PORT, MAX_PORT
                ))
            })?;
        Ok(numeric as u16)
    }
}
