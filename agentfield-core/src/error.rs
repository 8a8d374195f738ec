//! Error types for the AgentField control plane.

/// Result type alias for control plane operations.
pub type Result<T> = std::result::Result<T, ControlPlaneError>;

/// Main error type for the control plane.
#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    /// Malformed request, surfaced to the caller and never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown node, execution, run or dead-letter entry
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Lost a compare-and-swap race or hit a conflicting live registration
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Duplicate create
    #[error("Already exists: {resource} with id {id}")]
    AlreadyExists { resource: String, id: String },

    /// Workflow recursion guard tripped
    #[error("Workflow depth {depth} exceeds maximum of {max}")]
    DepthExceeded { depth: u32, max: u32 },

    /// Remote call or lease exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Webhook call failed
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Capacity exhausted or target not reachable right now
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Persistence layer errors other than conflicts
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapped anyhow errors for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ControlPlaneError {
    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new not found error
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create a new conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a new already-exists error
    pub fn already_exists(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new delivery error
    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::Delivery(msg.into())
    }

    /// Create a new unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Stable machine-readable kind, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::NotFound { .. } => "NotFoundError",
            Self::Conflict(_) => "ConflictError",
            Self::AlreadyExists { .. } => "AlreadyExistsError",
            Self::DepthExceeded { .. } => "DepthExceededError",
            Self::Timeout(_) => "TimeoutError",
            Self::Delivery(_) => "DeliveryError",
            Self::Unavailable(_) => "UnavailableError",
            Self::Storage(_) => "StorageError",
            Self::Config(_) => "ConfigError",
            Self::Serialization(_) => "SerializationError",
            Self::Io(_) => "IoError",
            Self::Other(_) => "InternalError",
        }
    }

    /// Only lost compare-and-swap races are retried internally.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(ControlPlaneError::validation("x").kind(), "ValidationError");
        assert_eq!(ControlPlaneError::not_found("node", "n1").kind(), "NotFoundError");
        assert_eq!(ControlPlaneError::conflict("x").kind(), "ConflictError");
        assert_eq!(
            ControlPlaneError::DepthExceeded { depth: 11, max: 10 }.kind(),
            "DepthExceededError"
        );
    }

    #[test]
    fn test_only_conflicts_are_retryable() {
        assert!(ControlPlaneError::conflict("version mismatch").is_retryable());
        assert!(!ControlPlaneError::already_exists("execution", "e1").is_retryable());
        assert!(!ControlPlaneError::storage("disk full").is_retryable());
        assert!(!ControlPlaneError::timeout("agent call").is_retryable());
    }

    #[test]
    fn test_display_includes_context() {
        let err = ControlPlaneError::not_found("execution", "exec-1");
        assert_eq!(err.to_string(), "Not found: execution with id exec-1");

        let err = ControlPlaneError::DepthExceeded { depth: 4, max: 3 };
        assert_eq!(err.to_string(), "Workflow depth 4 exceeds maximum of 3");
    }
}
