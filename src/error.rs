//! Unified error handling for the shoal crate
//!
//! Every component (store adapter, master, node, client) reports failures
//! through the single [`Error`] enum so that callers can decide on a handling
//! strategy without knowing which layer produced the error.
//!
//! # Architecture
//!
//! - [`ShoalErrorTrait`] - Common interface: recoverability and category
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum
//!
//! # Handling strategy
//!
//! | Error | Strategy |
//! |-------|----------|
//! | `ConnectionLost` | retried with backoff by the caller |
//! | `AlreadyExists` / `NotFound` | surfaced to the caller, never retried |
//! | `ShardUnavailable` / `NodeTimeout` / `NodeUnreachable` | node excluded from a fan-out, request continues |
//! | `StaleHit` | surfaced to the caller as a recoverable lookup failure |
//!
//! # Usage
//!
//! ```rust,ignore
//! use shoal::error::{Error, ShoalErrorTrait};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         println!("Retrying: {}", err);
//!     } else {
//!         eprintln!("Fatal error: {}", err);
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Common trait for shoal error types
pub trait ShoalErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Coordination store session and connectivity errors
    Coordination,
    /// Administrative misuse (duplicate or unknown names)
    Administrative,
    /// Query fan-out and detail lookup errors
    Query,
    /// Shard data, local index library and I/O errors
    Storage,
    /// Configuration and validation errors
    Config,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Short label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::Coordination => "coordination",
            Self::Administrative => "administrative",
            Self::Query => "query",
            Self::Storage => "storage",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the shoal crate
#[derive(Error, Debug)]
pub enum Error {
    /// The coordination store session is broken or the service is unreachable
    #[error("Connection to coordination store lost: {reason}")]
    ConnectionLost { reason: String },

    /// A record already exists at the given path
    #[error("Already exists: {path}")]
    AlreadyExists { path: String },

    /// No record exists at the given path
    #[error("Not found: {path}")]
    NotFound { path: String },

    /// The node has no open shard for a requested index or shard
    #[error("Shard unavailable on node {node}: {target}")]
    ShardUnavailable { node: String, target: String },

    /// A detail lookup referenced a shard or document that is no longer resident
    #[error("Stale hit: shard {shard} doc {doc_id} on node {node}")]
    StaleHit {
        node: String,
        shard: String,
        doc_id: u32,
    },

    /// A shard handle was used after the shard was unloaded
    #[error("Shard is closed")]
    ShardClosed,

    /// No transport to a node is available
    #[error("Node {node} unreachable: {reason}")]
    NodeUnreachable { node: String, reason: String },

    /// A fan-out peer did not answer in time
    #[error("Node {node} did not answer within {timeout_ms}ms")]
    NodeTimeout { node: String, timeout_ms: u64 },

    /// An index was not deployed within the administrative timeout
    #[error("Index {index} not deployed within {timeout_secs}s")]
    DeployTimeout { index: String, timeout_secs: u64 },

    /// Record encoding/decoding errors
    #[error("Codec error for {what}: {reason}")]
    Codec { what: String, reason: String },

    /// Local index library failures (open, search, stored fields)
    #[error("Index library error: {0}")]
    IndexLibrary(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

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

impl ShoalErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectionLost { .. } => true,
            Self::NodeTimeout { .. } => true,
            Self::NodeUnreachable { .. } => true,
            Self::ShardClosed => true,
            Self::ShardUnavailable { .. } => true,
            Self::StaleHit { .. } => true,
            Self::Io(_) => true,
            Self::Http(_) => true,
            Self::AlreadyExists { .. } | Self::NotFound { .. } => false,
            Self::DeployTimeout { .. } => false,
            Self::Codec { .. } | Self::Json(_) => false,
            Self::IndexLibrary(_) => false,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::ConnectionLost { .. } => ErrorCategory::Coordination,
            Self::AlreadyExists { .. } | Self::NotFound { .. } | Self::DeployTimeout { .. } => {
                ErrorCategory::Administrative
            }
            Self::ShardUnavailable { .. }
            | Self::StaleHit { .. }
            | Self::NodeTimeout { .. }
            | Self::NodeUnreachable { .. } => ErrorCategory::Query,
            Self::ShardClosed => ErrorCategory::Storage,
            Self::IndexLibrary(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Codec { .. } | Self::Json(_) => ErrorCategory::Storage,
            Self::Http(_) => ErrorCategory::Coordination,
            Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a connection-lost error
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost {
            reason: reason.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists { path: path.into() }
    }

    /// Create a not-found error
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Create a codec error
    pub fn codec(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Codec {
            what: what.into(),
            reason: reason.into(),
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

    /// Whether this is a `ConnectionLost` error
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. })
    }

    /// Whether this is a `NotFound` error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this is an `AlreadyExists` error
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
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
