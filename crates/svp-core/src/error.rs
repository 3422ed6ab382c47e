//! Error types for the Shared Variable Processor.
//!
//! Errors fall into the groups the broker treats differently: protocol errors
//! (bad frames, unknown kinds) stay local to one connection, lookup errors are
//! answered with a zero-valued reply, and transport errors at startup are
//! fatal. Errors that cross the wire are carried as a numeric code plus a
//! location string; see [`SvpError::error_code`].

use crate::identity::ProcessorIdentity;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the SVP library.
#[derive(Debug, Error)]
pub enum SvpError {
    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Connection to {peer} lost")]
    ConnectionLost { peer: String },

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    // Protocol errors
    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Signal truncated: {needed} more bytes needed for field '{field}'")]
    Truncated { field: &'static str, needed: usize },

    #[error("Unknown signal kind {0:#06x}")]
    UnknownKind(u16),

    #[error("Malformed {kind} signal: {message}")]
    Malformed { kind: String, message: String },

    #[error("Unexpected reply: expected {expected}, got {actual}")]
    UnexpectedReply {
        expected: &'static str,
        actual: String,
    },

    // Shared variable errors
    #[error("Invalid variable name '{name}': {message}")]
    InvalidName { name: String, message: String },

    #[error("Unknown shared variable key {0:#x}")]
    UnknownKey(u64),

    #[error("Processor {0} is not registered")]
    NotRegistered(ProcessorIdentity),

    #[error("Processor {0} is already registered")]
    AlreadyRegistered(ProcessorIdentity),

    #[error("Processor {identity} is not a partner of key {key:#x}")]
    NotPartner {
        key: u64,
        identity: ProcessorIdentity,
    },

    #[error("Shared variable table is full ({capacity} entries)")]
    TableFull { capacity: usize },

    #[error("No value has been assigned to key {0:#x}")]
    NoValue(u64),

    #[error("Access to key {key:#x} not permitted within {timeout:?}")]
    AccessTimeout { key: u64, timeout: Duration },

    // Errors reported by the remote side of a request
    #[error("Remote error {code} at {location}")]
    Remote { code: u32, location: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for SVP operations.
pub type Result<T> = std::result::Result<T, SvpError>;

impl From<std::io::Error> for SvpError {
    fn from(err: std::io::Error) -> Self {
        SvpError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for SvpError {
    fn from(err: serde_json::Error) -> Self {
        SvpError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl SvpError {
    /// Protocol error code for frames that could not be decoded.
    pub const CODE_PROTOCOL: u32 = 2;
    /// Lookup error code for unknown keys.
    pub const CODE_UNKNOWN_KEY: u32 = 3;
    /// Lookup error code for unregistered or foreign identities.
    pub const CODE_IDENTITY: u32 = 4;
    /// Resource exhaustion.
    pub const CODE_TABLE_FULL: u32 = 5;
    /// Bad variable name.
    pub const CODE_NAME: u32 = 6;
    /// Access not granted in time.
    pub const CODE_ACCESS: u32 = 7;
    /// Value requested before any assignment.
    pub const CODE_NO_VALUE: u32 = 8;
    /// Anything else.
    pub const CODE_INTERNAL: u32 = 1;

    /// Convert to the numeric code carried in `Error`, `ValueIs` and
    /// `AssignWas` replies. Zero is reserved for success.
    pub fn error_code(&self) -> u32 {
        match self {
            SvpError::FrameTooLarge { .. }
            | SvpError::Truncated { .. }
            | SvpError::UnknownKind(_)
            | SvpError::Malformed { .. }
            | SvpError::UnexpectedReply { .. } => Self::CODE_PROTOCOL,

            SvpError::UnknownKey(_) => Self::CODE_UNKNOWN_KEY,

            SvpError::NotRegistered(_)
            | SvpError::AlreadyRegistered(_)
            | SvpError::NotPartner { .. } => Self::CODE_IDENTITY,

            SvpError::TableFull { .. } => Self::CODE_TABLE_FULL,
            SvpError::InvalidName { .. } => Self::CODE_NAME,
            SvpError::AccessTimeout { .. } => Self::CODE_ACCESS,
            SvpError::NoValue(_) => Self::CODE_NO_VALUE,
            SvpError::Remote { code, .. } => *code,

            _ => Self::CODE_INTERNAL,
        }
    }

    /// Rebuild an error from a code and location received in a reply.
    pub fn from_remote(code: u32, location: impl Into<String>) -> Self {
        SvpError::Remote {
            code,
            location: location.into(),
        }
    }

    /// Check if the caller may retry the operation.
    ///
    /// Transport failures and reply timeouts are retryable; a decoded error
    /// field in a reply is a domain failure and is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SvpError::Io { .. }
                | SvpError::ConnectionLost { .. }
                | SvpError::Timeout(_)
                | SvpError::AccessTimeout { .. }
        )
    }
}
