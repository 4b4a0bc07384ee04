//! Error types for the automation daemon.

/// Top-level error type for the automation daemon.
///
/// Each variant corresponds to one of the error kinds the control plane
/// surfaces; [`AutomatorError::kind`] returns the stable wire name.
#[derive(Debug, thiserror::Error)]
pub enum AutomatorError {
    /// Entity lookup by id or name failed.
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness violation or referential guard (entity in use).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed input, unknown enum value, type mismatch, or invalid
    /// schedule expression.
    #[error("validation error: {0}")]
    Validation(String),

    /// User script threw or produced a non-serialisable return value.
    #[error("execution error: {0}")]
    Execution(String),

    /// Watchdog cancelled the script.
    #[error("{0}")]
    Timeout(String),

    /// Referenced credential missing or undecryptable.
    #[error("{0}")]
    CredentialUnavailable(String),

    /// Underlying database failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AutomatorError {
    /// Stable kind string used by the HTTP and MCP adapters.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "validation",
            Self::Execution(_) => "execution_error",
            Self::Timeout(_) => "timeout",
            Self::CredentialUnavailable(_) => "credential_unavailable",
            Self::Storage(_) => "storage_error",
            Self::Io(_) | Self::Internal(_) => "internal",
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AutomatorError>;
