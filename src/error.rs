//! Error types shared by the store, the registry and the execution engine.
//!
//! Every domain failure is reported to callers as `success=false` plus the
//! `Display` text of one of these values; none of them is a transport fault.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::model::{OracleId, RecordId};

/// Result type alias for oracledb operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("record {0} not found")]
    RecordNotFound(RecordId),

    #[error("oracle {0} not found")]
    OracleNotFound(OracleId),

    /// No record has ever carried this metadata name
    #[error("meta '{0}' not indexed")]
    MetaNotIndexed(String),

    /// Malformed vector, metadata, name or oracle code
    #[error("validation error: {0}")]
    Validation(String),

    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Store capacity or execution slots exhausted
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Malformed frame or unexpected response on the wire
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::RecordNotFound(_) | Error::OracleNotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Terminal failure of a single oracle invocation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("cancelled by caller")]
    Cancelled,

    #[error("exception: {0}")]
    Exception(String),

    #[error("serialize_error: {0}")]
    Serialize(String),
}
