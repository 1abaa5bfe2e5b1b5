//! Transport Error Types
//!
//! Error handling for links, queues, command sockets and handler dispatch.
//! Link failures are transient and answered by reconnecting; capacity errors
//! are reported to the caller and the message is dropped.

use linkmq_codec::ProtocolError;
use std::net::SocketAddr;
use thiserror::Error;

/// Main transport error type
#[derive(Error, Debug)]
pub enum TransportError {
    /// Network connectivity errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connection management errors
    #[error("Connection error: {message} (remote: {remote_addr:?})")]
    Connection {
        message: String,
        remote_addr: Option<SocketAddr>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Protocol and serialization errors
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Handler registration errors
    #[error("Registry error: type {msg_type}: {message}")]
    Registry { msg_type: u16, message: String },

    /// Link authentication was rejected or never answered
    #[error("Authentication error: {message}")]
    Authentication { message: String },

    /// Transport timeout errors
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Resource exhaustion errors (queue full, payload larger than a slot)
    #[error("Resource exhausted: {resource}: {message}")]
    ResourceExhausted { resource: String, message: String },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },

    /// System-level errors
    #[error("System error: {message}")]
    System { message: String },
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with source
    pub fn network_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
            source: Some(Box::new(source)),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            source: None,
        }
    }

    /// Create a protocol error with source
    pub fn protocol_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Protocol {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    pub fn registry(msg_type: u16, message: impl Into<String>) -> Self {
        Self::Registry {
            msg_type,
            message: message.into(),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create a system error
    pub fn system(message: impl Into<String>) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    /// Get error category for statistics and log fields
    pub fn category(&self) -> &'static str {
        match self {
            TransportError::Network { .. } => "network",
            TransportError::Connection { .. } => "connection",
            TransportError::Protocol { .. } => "protocol",
            TransportError::Configuration { .. } => "configuration",
            TransportError::Registry { .. } => "registry",
            TransportError::Authentication { .. } => "authentication",
            TransportError::Timeout { .. } => "timeout",
            TransportError::ResourceExhausted { .. } => "resource_exhausted",
            TransportError::Io { .. } => "io",
            TransportError::System { .. } => "system",
        }
    }
}

// Custom Clone implementation since Box<dyn Error> doesn't implement Clone
impl Clone for TransportError {
    fn clone(&self) -> Self {
        match self {
            TransportError::Network { message, .. } => TransportError::Network {
                message: message.clone(),
                source: None,
            },
            TransportError::Connection {
                message,
                remote_addr,
                ..
            } => TransportError::Connection {
                message: message.clone(),
                remote_addr: *remote_addr,
                source: None,
            },
            TransportError::Protocol { message, .. } => TransportError::Protocol {
                message: message.clone(),
                source: None,
            },
            TransportError::Configuration { message, field } => TransportError::Configuration {
                message: message.clone(),
                field: field.clone(),
            },
            TransportError::Registry { msg_type, message } => TransportError::Registry {
                msg_type: *msg_type,
                message: message.clone(),
            },
            TransportError::Authentication { message } => TransportError::Authentication {
                message: message.clone(),
            },
            TransportError::Timeout {
                operation,
                timeout_ms,
            } => TransportError::Timeout {
                operation: operation.clone(),
                timeout_ms: *timeout_ms,
            },
            TransportError::ResourceExhausted { resource, message } => {
                TransportError::ResourceExhausted {
                    resource: resource.clone(),
                    message: message.clone(),
                }
            }
            TransportError::Io { message, source } => TransportError::Io {
                message: message.clone(),
                source: std::io::Error::new(source.kind(), message.as_str()),
            },
            TransportError::System { message } => TransportError::System {
                message: message.clone(),
            },
        }
    }
}

/// Convert standard I/O errors to transport errors
impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        TransportError::Io {
            message: error.to_string(),
            source: error,
        }
    }
}

impl From<ProtocolError> for TransportError {
    fn from(error: ProtocolError) -> Self {
        TransportError::protocol_with_source(error.to_string(), error)
    }
}

impl From<bincode::Error> for TransportError {
    fn from(error: bincode::Error) -> Self {
        TransportError::protocol_with_source("Command serialization failed", error)
    }
}

impl From<nix::errno::Errno> for TransportError {
    fn from(errno: nix::errno::Errno) -> Self {
        TransportError::from(std::io::Error::from(errno))
    }
}
