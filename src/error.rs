//! Unified error handling for the nephele crate
//!
//! This module provides a unified error type that consolidates all
//! domain-specific errors into a single `Error` enum, while maintaining
//! the ability to use domain-specific errors when needed. Services mostly
//! log and carry on; the unified type is for the binary entry points and
//! callers crossing module boundaries.

use std::io;
use thiserror::Error;

// Re-export domain-specific errors for convenience
pub use crate::agent::AgentError;
pub use crate::broker::BrokerError;
pub use crate::fetcher::FetchError;
pub use crate::protocol::ProtocolError;
pub use crate::scheduler::SchedulerError;
pub use crate::storage::StoreError;

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network and peer connectivity errors
    Network,
    /// Storage and I/O errors
    Storage,
    /// Configuration and validation errors
    Config,
    /// Service startup errors (binds, listeners)
    Startup,
    /// Other/unknown errors
    Other,
}

/// Unified error type for the nephele crate
#[derive(Error, Debug)]
pub enum Error {
    /// Wire protocol errors (connect, timeout, parse)
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Durable node store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Input staging errors
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Resource manager startup errors
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Scheduler startup errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Node agent errors
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Check if this error is recoverable (the operation can be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Protocol(e) => e.is_transient(),
            Self::Store(_) => false,
            Self::Fetch(e) => matches!(e, FetchError::Request(_) | FetchError::Status(_)),
            // startup failures (bad binds, bad config) need intervention
            Self::Broker(_) | Self::Scheduler(_) | Self::Agent(_) => false,
            Self::Io(_) => true, // I/O errors are often transient
            Self::Json(_) => false,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Protocol(_) | Self::Fetch(_) => ErrorCategory::Network,
            Self::Store(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Json(_) | Self::Config(_) => ErrorCategory::Config,
            Self::Broker(_) | Self::Scheduler(_) | Self::Agent(_) => ErrorCategory::Startup,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        let err = Error::Protocol(ProtocolError::Timeout);
        assert_eq!(err.category(), ErrorCategory::Network);

        let err = Error::Store(StoreError::Poisoned);
        assert_eq!(err.category(), ErrorCategory::Storage);
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::Protocol(ProtocolError::Timeout).is_recoverable());
        assert!(!Error::Protocol(ProtocolError::Parse("bad json".to_string())).is_recoverable());
        assert!(!Error::config("missing scheduler name").is_recoverable());
    }

    #[test]
    fn test_error_conversion() {
        let store_err = StoreError::Open("no such file".to_string());
        let unified: Error = store_err.into();
        assert!(matches!(unified, Error::Store(_)));
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("grid.k must be greater than 0");
        assert_eq!(err.category(), ErrorCategory::Config);
    }

    #[test]
    fn test_startup_category() {
        let err = Error::Broker(BrokerError::Bind("0.0.0.0:6424: in use".to_string()));
        assert_eq!(err.category(), ErrorCategory::Startup);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_bind_failures_never_recoverable() {
        // all three services classify a failed bind the same way
        assert!(!Error::Agent(AgentError::Bind("0.0.0.0:6426: in use".to_string())).is_recoverable());
        assert!(!Error::Scheduler(SchedulerError::Bind("0.0.0.0:6425: in use".to_string())).is_recoverable());
        assert!(!Error::Broker(BrokerError::Bind("0.0.0.0:6424: in use".to_string())).is_recoverable());
    }
}
