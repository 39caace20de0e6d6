//! Error types surfaced to the reconciliation layer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes returned for rejected core operations.
///
/// These codes are stable and used for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed request: invalid names, empty runtime version, bad properties.
    InvalidRequest,
    /// The runtime catalog cannot produce a working build tool image.
    IncompatibleCatalog,
    /// A build or kit with the same identity is already tracked.
    Duplicate,
    /// The referenced kit or build does not exist.
    NotFound,
    /// Garbage collection refused because builds are still in flight.
    BuildInProgress,
    /// The image registry rejected a read, write or delete.
    RegistryFailure,
    /// The catalog source could not be queried.
    CatalogUnavailable,
    /// An internal invariant was violated.
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest => write!(f, "INVALID_REQUEST"),
            Self::IncompatibleCatalog => write!(f, "INCOMPATIBLE_CATALOG"),
            Self::Duplicate => write!(f, "DUPLICATE"),
            Self::NotFound => write!(f, "NOT_FOUND"),
            Self::BuildInProgress => write!(f, "BUILD_IN_PROGRESS"),
            Self::RegistryFailure => write!(f, "REGISTRY_FAILURE"),
            Self::CatalogUnavailable => write!(f, "CATALOG_UNAVAILABLE"),
            Self::Internal => write!(f, "INTERNAL"),
        }
    }
}

/// Error payload handed back to the caller of a core operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code from the registry above.
    pub code: ErrorCode,
    /// Human-readable, single-line error message.
    pub message: String,
    /// Optional machine-readable details (offending kit, runtime version, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Create a new API error with additional data.
    pub fn with_data(code: ErrorCode, message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::BuildInProgress | ErrorCode::RegistryFailure | ErrorCode::CatalogUnavailable
        )
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}
