//! Error types for the Instance operator

use thiserror::Error;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur while reconciling instances
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error, kept whole so the status code stays inspectable
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML rendering error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Invalid operator configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An object the environment depends on is missing or incomplete
    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    /// The public exposure request is malformed
    #[error("Invalid public exposure request: {0}")]
    InvalidPublicExposure(String),

    /// No IP of the pool can host every requested port
    #[error("Public exposure allocation failed: {0}")]
    AllocationExhausted(String),

    /// The reconciliation pass ran past its deadline
    #[error("Reconciliation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Invalid resource state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl OperatorError {
    fn api_code(&self) -> Option<u16> {
        match self {
            OperatorError::Kube(kube::Error::Api(ae)) => Some(ae.code),
            _ => None,
        }
    }

    /// The object does not exist in the store.
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// An optimistic-concurrency check failed.
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// Whether the failure should be surfaced as `CreationLoopBackoff` on the instance.
    ///
    /// Conflicts are transient and an exhausted IP pool is reported in the
    /// public exposure status instead.
    pub fn forces_creation_loop_backoff(&self) -> bool {
        !(self.is_conflict() || matches!(self, OperatorError::AllocationExhausted(_)))
    }
}
