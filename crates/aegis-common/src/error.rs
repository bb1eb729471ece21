//! Error types for KubeAegis
//!
//! Errors carry the policy, backend or adapter they relate to so that a
//! failed reconcile can be traced back to the intent that caused it.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for KubeAegis operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// An intent failed existence or precondition checks
    #[error("validation error for {policy}: {message}")]
    Validation {
        /// Name of the intent policy
        policy: String,
        /// Description of what's invalid
        message: String,
        /// The offending field path (e.g., "spec.intentRequest[0].rule.to")
        field: Option<String>,
    },

    /// A backend could not translate an intent
    #[error("compile error [{backend}]: {message}")]
    Compile {
        /// Backend being compiled for (cilium, calico, ...)
        backend: String,
        /// Description of what failed
        message: String,
    },

    /// Delivering a policy to an adapter failed
    #[error("dispatch error [{adapter}]: {message}")]
    Dispatch {
        /// Registry name of the adapter
        adapter: String,
        /// Description of what failed
        message: String,
    },

    /// Optimistic concurrency conflict on a status write
    #[error("conflict on {resource}: {message}")]
    Conflict {
        /// Resource being written
        resource: String,
        /// Description of the conflict
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "registry", "reporter")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            policy: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a named policy
    pub fn validation_for(policy: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            policy: policy.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a named policy and field path
    pub fn validation_for_field(
        policy: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            policy: policy.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a compile error for a backend
    pub fn compile_for(backend: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Compile {
            backend: backend.into(),
            message: msg.into(),
        }
    }

    /// Create a dispatch error for an adapter
    pub fn dispatch_for(adapter: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Dispatch {
            adapter: adapter.into(),
            message: msg.into(),
        }
    }

    /// Create a conflict error for a resource
    pub fn conflict(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
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

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
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

    /// Check if this error is retryable
    ///
    /// Validation, compile and serialization errors need a spec change.
    /// Conflicts and dispatch failures clear up on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // 409 is an optimistic-concurrency miss, other 4xx are permanent
                match source {
                    kube::Error::Api(ae) if ae.code == 409 => true,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) => false,
                    _ => true,
                }
            }
            Error::Validation { .. } => false,
            Error::Compile { .. } => false,
            Error::Dispatch { .. } => true,
            Error::Conflict { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Whether this error is a write conflict (HTTP 409 or [`Error::Conflict`])
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Whether this error is an HTTP 404 from the API server
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 404
        )
    }

    /// Get the policy name if this error is associated with a specific intent
    pub fn policy(&self) -> Option<&str> {
        match self {
            Error::Validation { policy, .. } => Some(policy),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Compile { backend, .. } => Some(backend),
            Error::Dispatch { adapter, .. } => Some(adapter),
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
