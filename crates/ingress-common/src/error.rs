//! Error types for the ingress hub
//!
//! Errors carry the resource they concern (an identity key, a secret name or
//! a file path) so that a requeue log line is enough to find the culprit.

use std::path::PathBuf;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for ingress hub operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A TLS secret referenced by a receiver could not be materialized
    #[error("secret error for {namespace}/{secret}: {message}")]
    Secret {
        /// Namespace the secret was looked up in
        namespace: String,
        /// Name of the secret
        secret: String,
        /// Description of what is wrong with it
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// What was being decoded or encoded (if known)
        kind: Option<String>,
    },

    /// Filesystem error while writing secret material
    #[error("io error on {}: {source}", path.display())]
    Io {
        /// Path being created or written
        path: PathBuf,
        /// The underlying io error
        source: std::io::Error,
    },

    /// Invalid user input or resource content
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Resource the input belongs to
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "watcher", "worker")
        context: String,
    },
}

impl Error {
    /// Create a secret error for a secret in the given namespace
    pub fn secret(
        namespace: impl Into<String>,
        secret: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Secret {
            namespace: namespace.into(),
            secret: secret.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error naming what was being decoded
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an io error for the given path
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a validation error without resource context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error for a specific resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is expected to go away on its own
    ///
    /// Secret errors count as retryable: an operator fixing the secret heals
    /// the condition without any change to the Ingress.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 404
            ),
            Error::Secret { .. } => true,
            Error::Serialization { .. } => false,
            Error::Io { .. } => true,
            Error::Validation { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
