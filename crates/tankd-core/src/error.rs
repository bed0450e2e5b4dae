// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A single `(attribute path, message)` validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationEntry {
    pub attribute: String,
    pub message: String,
}

/// Accumulated validation failures, reported together
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrors {
    entries: Vec<ValidationEntry>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure for `attribute`
    pub fn add(&mut self, attribute: impl Into<String>, message: impl Into<String>) {
        self.entries.push(ValidationEntry {
            attribute: attribute.into(),
            message: message.into(),
        });
    }

    /// Merge another batch into this one
    pub fn extend(&mut self, other: ValidationErrors) {
        self.entries.extend(other.entries);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[ValidationEntry] {
        &self.entries
    }

    /// Whether any failure was recorded against `attribute`
    pub fn contains(&self, attribute: &str) -> bool {
        self.entries.iter().any(|e| e.attribute == attribute)
    }

    /// Fail with `TankdError::Validation` if anything was recorded
    pub fn check(self) -> Result<()> {
        if self.entries.is_empty() {
            Ok(())
        } else {
            Err(TankdError::Validation { errors: self })
        }
    }

    /// `[[path, message], ...]` payload
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.entries
                .iter()
                .map(|e| serde_json::json!([e.attribute, e.message]))
                .collect(),
        )
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self
            .entries
            .iter()
            .map(|e| format!("[EINVAL] {}: {}", e.attribute, e.message))
            .collect();
        write!(f, "{}", lines.join("\n"))
    }
}

/// Machine-readable error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Busy,
    Exists,
    CryptoKeyInvalid,
    CryptoKeyMissing,
    InvariantViolation,
    External,
    Serialization,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Busy => "BUSY",
            ErrorKind::Exists => "EXISTS",
            ErrorKind::CryptoKeyInvalid => "CRYPTO_KEY_INVALID",
            ErrorKind::CryptoKeyMissing => "CRYPTO_KEY_MISSING",
            ErrorKind::InvariantViolation => "INVARIANT_VIOLATION",
            ErrorKind::External => "EXTERNAL",
            ErrorKind::Serialization => "SERIALIZATION",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Core error type for dataset operations
#[derive(Error, Debug, Diagnostic)]
pub enum TankdError {
    /// One or more input fields were rejected
    #[error("Validation failed:\n{errors}")]
    #[diagnostic(
        code(tankd::validation),
        help("Correct the listed attributes and retry")
    )]
    Validation {
        #[allow(unused)]
        errors: ValidationErrors,
    },

    /// Referenced dataset, pool or record does not exist
    #[error("{message}")]
    #[diagnostic(
        code(tankd::not_found),
        help("Verify the name with `tankd query`")
    )]
    NotFound {
        #[allow(unused)]
        message: String,
    },

    /// Resource is in use
    #[error("{message}")]
    #[diagnostic(
        code(tankd::busy),
        help("Stop the listed consumers first, or retry with force")
    )]
    Busy {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        dependents: Vec<String>,
    },

    /// Resource already exists
    #[error("{message}")]
    #[diagnostic(code(tankd::exists), help("Choose a different name"))]
    Exists {
        #[allow(unused)]
        message: String,
    },

    /// Supplied key or passphrase does not unlock the dataset
    #[error("{message}")]
    #[diagnostic(
        code(tankd::crypto_key_invalid),
        help("Double-check the key or passphrase for this encryption root")
    )]
    CryptoKeyInvalid {
        #[allow(unused)]
        message: String,
    },

    /// No key available for an encrypted dataset
    #[error("{message}")]
    #[diagnostic(
        code(tankd::crypto_key_missing),
        help("Provide a key or passphrase, or a key file exported earlier")
    )]
    CryptoKeyMissing {
        #[allow(unused)]
        message: String,
    },

    /// Operation would break a structural rule of the dataset tree
    #[error("{message}")]
    #[diagnostic(
        code(tankd::invariant_violation),
        help("Rearrange the affected datasets so the encryption hierarchy stays consistent")
    )]
    InvariantViolation {
        #[allow(unused)]
        message: String,
    },

    /// Failure reported by ZFS, the host or the datastore
    #[error("{message}")]
    #[diagnostic(
        code(tankd::external),
        help("Inspect the underlying error and system logs")
    )]
    External {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(tankd::serialization_error),
        help("Ensure the input is valid JSON or YAML")
    )]
    Serialization {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Job was cancelled before completion
    #[error("Operation cancelled: {message}")]
    #[diagnostic(code(tankd::cancelled), help("Re-run the job to finish it"))]
    Cancelled {
        #[allow(unused)]
        message: String,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(tankd::internal_error),
        help("This is likely a bug. Please report it with the full error details")
    )]
    Internal {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for tankd operations
pub type Result<T> = std::result::Result<T, TankdError>;

impl TankdError {
    /// Create a Validation error with a single entry
    pub fn validation(attribute: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = ValidationErrors::new();
        errors.add(attribute, message);
        Self::Validation { errors }
    }

    /// Create a NotFound error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a Busy error
    pub fn busy(message: impl Into<String>, dependents: Vec<String>) -> Self {
        Self::Busy {
            message: message.into(),
            dependents,
        }
    }

    /// Create an Exists error
    pub fn exists(message: impl Into<String>) -> Self {
        Self::Exists {
            message: message.into(),
        }
    }

    /// Create a CryptoKeyInvalid error
    pub fn crypto_key_invalid(message: impl Into<String>) -> Self {
        Self::CryptoKeyInvalid {
            message: message.into(),
        }
    }

    /// Create a CryptoKeyMissing error
    pub fn crypto_key_missing(message: impl Into<String>) -> Self {
        Self::CryptoKeyMissing {
            message: message.into(),
        }
    }

    /// Create an InvariantViolation error
    pub fn invariant_violation(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Create an External error
    pub fn external(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::External {
            message: message.into(),
            source,
        }
    }

    /// Create a Serialization error
    pub fn serialization_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source,
        }
    }

    /// Create a Cancelled error
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Create an Internal error
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TankdError::Validation { .. } => ErrorKind::Validation,
            TankdError::NotFound { .. } => ErrorKind::NotFound,
            TankdError::Busy { .. } => ErrorKind::Busy,
            TankdError::Exists { .. } => ErrorKind::Exists,
            TankdError::CryptoKeyInvalid { .. } => ErrorKind::CryptoKeyInvalid,
            TankdError::CryptoKeyMissing { .. } => ErrorKind::CryptoKeyMissing,
            TankdError::InvariantViolation { .. } => ErrorKind::InvariantViolation,
            TankdError::External { .. } => ErrorKind::External,
            TankdError::Serialization { .. } => ErrorKind::Serialization,
            TankdError::Cancelled { .. } => ErrorKind::Cancelled,
            TankdError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Structured payload attached to the error, if any
    pub fn payload(&self) -> serde_json::Value {
        match self {
            TankdError::Validation { errors } => errors.to_payload(),
            TankdError::Busy { dependents, .. } => serde_json::json!(dependents),
            _ => serde_json::Value::Null,
        }
    }

    /// Validation entries, empty for every other kind
    pub fn validation_entries(&self) -> &[ValidationEntry] {
        match self {
            TankdError::Validation { errors } => errors.entries(),
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = TankdError::not_found("tank/missing does not exist");
        assert!(matches!(err, TankdError::NotFound { .. }));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "tank/missing does not exist");

        let err = TankdError::busy("in use", vec!["smb".to_string()]);
        assert_eq!(err.kind().as_str(), "BUSY");
        assert_eq!(err.payload(), serde_json::json!(["smb"]));
    }

    #[test]
    fn test_validation_errors_accumulate() {
        let mut verrors = ValidationErrors::new();
        assert!(verrors.clone().check().is_ok());

        verrors.add("pool_dataset_create.name", "Invalid dataset name");
        verrors.add("pool_dataset_create.volsize", "This field is required");
        assert_eq!(verrors.len(), 2);
        assert!(verrors.contains("pool_dataset_create.name"));

        let err = verrors.check().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.validation_entries().len(), 2);
        assert_eq!(
            err.payload()[0],
            serde_json::json!(["pool_dataset_create.name", "Invalid dataset name"])
        );
        assert!(err.to_string().contains("[EINVAL] pool_dataset_create.volsize"));
    }
}
