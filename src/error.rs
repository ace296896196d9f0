//! Error types for the cyclops operator
//!
//! Errors are structured with fields so a failure persisted to an object's
//! `status.message` can be diagnosed without the process logs. Each variant
//! carries the object or node it concerns.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for cyclops operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Malformed caller input (e.g. a negative node count)
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of what's invalid
        message: String,
    },

    /// An object or provider resource vanished
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing thing (Node, Instance, CycleNodeStatus, ...)
        kind: String,
        /// Name or identifier of the missing thing
        name: String,
    },

    /// A node named explicitly in a request is not part of its node group
    #[error("could not find node by name: {name}")]
    NodeNotFound {
        /// The node name that could not be found
        name: String,
    },

    /// The cloud provider could not be reached or refused the call
    #[error("provider error [{provider}]: {message}")]
    ProviderUnavailable {
        /// Provider name (aws, fake, ...)
        provider: String,
        /// Description of what failed
        message: String,
    },

    /// Validation error for a request or its settings
    #[error("validation error for {request}: {message}")]
    Validation {
        /// Name of the request with invalid configuration
        request: String,
        /// Description of what's invalid
        message: String,
    },

    /// A drain step failed for a node
    #[error("drain error for node {node}: {message}")]
    Drain {
        /// Node being drained
        node: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "runner", "leader-election")
        context: String,
    },
}

impl Error {
    /// Create an invalid-argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: msg.into(),
        }
    }

    /// Create a not-found error for the given kind and name
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a node-not-found error for an explicitly named node
    pub fn node_not_found(name: impl Into<String>) -> Self {
        Self::NodeNotFound { name: name.into() }
    }

    /// Create a provider-unavailable error
    pub fn provider(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error without request context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            request: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error for a named request
    pub fn validation_for(request: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            request: request.into(),
            message: msg.into(),
        }
    }

    /// Create a drain error for a node
    pub fn drain(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Drain {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
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
    /// Caller input and validation errors need an object change to recover.
    /// Kubernetes 4xx responses other than 404/409/429 are treated the same way.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    !(400..500).contains(&ae.code) || matches!(ae.code, 404 | 409 | 429)
                }
                _ => true,
            },
            Error::InvalidArgument { .. } => false,
            Error::NotFound { .. } => true,
            Error::NodeNotFound { .. } => false,
            Error::ProviderUnavailable { .. } => true,
            Error::Validation { .. } => false,
            Error::Drain { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Check if this error means the target no longer exists
    ///
    /// Callers use this to treat "already gone" as "already done".
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }
}
