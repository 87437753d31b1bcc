//! Error types for the dualipc library

use thiserror::Error;

/// Main error type for dualipc operations
#[derive(Error, Debug)]
pub enum Error {
    /// Transport layer errors
    #[error("Transport layer error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A method reserved for the other role was called on this endpoint
    #[error("Operation '{operation}' is not available to the {role} role")]
    RoleViolation {
        operation: &'static str,
        role: &'static str,
    },

    /// Endpoint names are validated at the registry boundary
    #[error("Invalid endpoint name: {name:?}")]
    InvalidEndpointName { name: String },

    /// The peer answered an invocation with a failure reply
    #[error("Remote handler failed: {}", .description.as_deref().unwrap_or("no handler installed"))]
    RemoteFailure { description: Option<String> },

    /// Serialization and deserialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connection management errors
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Timeout errors
    #[error("Operation timed out after {duration_ms}ms: {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    /// Runtime errors
    #[error("Runtime error: {message}")]
    Runtime {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// IO errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Protocol errors
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        expected: Option<String>,
        received: Option<String>,
    },

    /// Subscription management errors
    #[error("Subscription error: {message}")]
    SubscriptionError { message: String },
}

impl Error {
    /// Create a transport error with source
    pub fn transport<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a transport error without source
    pub fn transport_msg(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a role violation error
    pub fn role_violation(operation: &'static str, role: &'static str) -> Self {
        Self::RoleViolation { operation, role }
    }

    /// Create an invalid endpoint name error
    pub fn invalid_endpoint_name(name: impl Into<String>) -> Self {
        Self::InvalidEndpointName { name: name.into() }
    }

    /// Create a remote failure error
    pub fn remote_failure(description: Option<String>) -> Self {
        Self::RemoteFailure { description }
    }

    /// Create a serialization error with source
    pub fn serialization<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a serialization error without source
    pub fn serialization_msg(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error without source
    pub fn connection_msg(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    /// Create a runtime error with source
    pub fn runtime<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Runtime {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a runtime error without source
    pub fn runtime_msg(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            field,
        }
    }

    /// Create a protocol error
    pub fn protocol(
        message: impl Into<String>,
        expected: Option<String>,
        received: Option<String>,
    ) -> Self {
        Self::Protocol {
            message: message.into(),
            expected,
            received,
        }
    }

    /// Create a subscription error
    pub fn subscription_error(message: impl Into<String>) -> Self {
        Self::SubscriptionError {
            message: message.into(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport { .. } => true,
            Error::Connection { .. } => true,
            Error::Timeout { .. } => true,
            Error::Runtime { .. } => true,
            Error::Io { .. } => true,
            Error::RemoteFailure { .. } => false,
            Error::RoleViolation { .. } => false,
            Error::InvalidEndpointName { .. } => false,
            Error::Serialization { .. } => false,
            Error::Configuration { .. } => false,
            Error::Protocol { .. } => false,
            Error::SubscriptionError { .. } => false,
        }
    }

    /// Get error category for debugging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Transport { .. } => "transport",
            Error::RoleViolation { .. } => "role",
            Error::InvalidEndpointName { .. } => "endpoint_name",
            Error::RemoteFailure { .. } => "remote",
            Error::Serialization { .. } => "serialization",
            Error::Connection { .. } => "connection",
            Error::Timeout { .. } => "timeout",
            Error::Runtime { .. } => "runtime",
            Error::Configuration { .. } => "configuration",
            Error::Io { .. } => "io",
            Error::Protocol { .. } => "protocol",
            Error::SubscriptionError { .. } => "subscription",
        }
    }
}

// Implement From traits for common error types
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::serialization("Bincode serialization failed", err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization("JSON serialization failed", err)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::runtime("Task join failed", err)
    }
}

/// Result type for dualipc operations
pub type Result<T> = std::result::Result<T, Error>;
