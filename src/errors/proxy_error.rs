use serde::Serialize;
use serde_json::Value;
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyErrorKind {
    InvalidRequest,
    Unreachable,
    AuthenticationFailed,
    Forbidden,
    NotFound,
    HijackUnsupported,
    Configuration,
    Internal,
}

impl ProxyErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            ProxyErrorKind::InvalidRequest | ProxyErrorKind::Unreachable => 400,
            ProxyErrorKind::AuthenticationFailed => 401,
            ProxyErrorKind::Forbidden => 403,
            ProxyErrorKind::NotFound => 404,
            ProxyErrorKind::HijackUnsupported => 501,
            ProxyErrorKind::Configuration | ProxyErrorKind::Internal => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyError {
    pub kind: ProxyErrorKind,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ProxyError {
    pub fn new(kind: ProxyErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            hint: None,
            details: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ProxyErrorKind::InvalidRequest, "INVALID_REQUEST", message)
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ProxyErrorKind::Unreachable, "UNREACHABLE", message)
    }

    pub fn authentication_failed(message: impl Into<String>) -> Self {
        Self::new(
            ProxyErrorKind::AuthenticationFailed,
            "AUTHENTICATION_FAILED",
            message,
        )
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ProxyErrorKind::Forbidden, "FORBIDDEN", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ProxyErrorKind::NotFound, "NOT_FOUND", message)
    }

    pub fn hijack_unsupported(message: impl Into<String>) -> Self {
        Self::new(
            ProxyErrorKind::HijackUnsupported,
            "HIJACK_UNSUPPORTED",
            message,
        )
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ProxyErrorKind::Configuration, "CONFIGURATION", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ProxyErrorKind::Internal, "INTERNAL", message)
    }

    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }

    /// Body sent to HTTP clients. Internal and configuration failures are reduced to a
    /// generic reason; the full message only goes to the server log.
    pub fn public_body(&self) -> Value {
        match self.kind {
            ProxyErrorKind::Internal | ProxyErrorKind::Configuration => {
                serde_json::json!({ "reason": "Internal error" })
            }
            _ => serde_json::json!({ "reason": self.message }),
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for ProxyError {}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::internal(err.to_string())
    }
}
