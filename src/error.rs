//! Error types for the kommit operator

use thiserror::Error;

use crate::git::GitError;
use crate::identity::IdentityError;

/// Main error type for kommit operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for CRD specs or admission payloads
    #[error("validation error: {0}")]
    Validation(String),

    /// The caller could not be mapped to a Git identity
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// A Git operation failed
    #[error("git error: {0}")]
    Git(#[from] GitError),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Unexpected internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True when the apiserver rejected a write because the resourceVersion was stale
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(resp)) if resp.code == 409)
    }

    /// Whether a controller should retry quickly after this error
    ///
    /// Validation and identity problems need a human to change configuration,
    /// so they are requeued slowly instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(_) | Self::Internal(_) => true,
            Self::Git(e) => e.is_transport(),
            Self::Validation(_) | Self::Identity(_) | Self::Serialization(_) => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
