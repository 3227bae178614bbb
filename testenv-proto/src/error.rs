//! Error taxonomy for provider operations.
//!
//! The code set is closed and crosses the tool channel verbatim; both
//! sides derive retryability from the code unless the producer overrides
//! it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Machine-readable error codes returned by providers and the
/// orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotImplemented,
    NotFound,
    AlreadyExists,
    InvalidSpec,
    ProviderError,
    Timeout,
    PermissionDenied,
    ResourceBusy,
    DependencyFailed,
}

impl ErrorCode {
    /// Default retryability. Only timeouts and busy resources are worth
    /// retrying; a producer may still mark an individual
    /// `PROVIDER_ERROR` retryable.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::Timeout | ErrorCode::ResourceBusy)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotImplemented => "NOT_IMPLEMENTED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::InvalidSpec => "INVALID_SPEC",
            ErrorCode::ProviderError => "PROVIDER_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::ResourceBusy => "RESOURCE_BUSY",
            ErrorCode::DependencyFailed => "DEPENDENCY_FAILED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error carried in operation results and tool responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl ProviderError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.is_retryable(),
            details: BTreeMap::new(),
        }
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotImplemented, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AlreadyExists, message)
    }

    pub fn invalid_spec(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidSpec, message)
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProviderError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    pub fn resource_busy(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ResourceBusy, message)
    }

    pub fn dependency_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DependencyFailed, message)
    }

    /// Override the code-derived retryability.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::provider(format!("serialization failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_codes() {
        assert!(ErrorCode::Timeout.is_retryable());
        assert!(ErrorCode::ResourceBusy.is_retryable());
        for code in [
            ErrorCode::NotImplemented,
            ErrorCode::NotFound,
            ErrorCode::AlreadyExists,
            ErrorCode::InvalidSpec,
            ErrorCode::ProviderError,
            ErrorCode::PermissionDenied,
            ErrorCode::DependencyFailed,
        ] {
            assert!(!code.is_retryable(), "{code} must not be retryable");
        }
    }

    #[test]
    fn code_wire_form_is_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::InvalidSpec).unwrap();
        assert_eq!(json, "\"INVALID_SPEC\"");
        let back: ErrorCode = serde_json::from_str("\"RESOURCE_BUSY\"").unwrap();
        assert_eq!(back, ErrorCode::ResourceBusy);
    }

    #[test]
    fn error_round_trip() {
        let err = ProviderError::provider("qemu-img exploded")
            .with_retryable(true)
            .with_detail("vm", "pxe-0");
        let json = serde_json::to_string(&err).unwrap();
        let back: ProviderError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
        assert!(back.retryable);
        assert_eq!(back.details.get("vm").map(String::as_str), Some("pxe-0"));
    }

    #[test]
    fn constructor_derives_retryable_from_code() {
        assert!(ProviderError::timeout("dial").retryable);
        assert!(ProviderError::resource_busy("in use").retryable);
        assert!(!ProviderError::provider("boom").retryable);
    }
}
